use crate::prelude::*;

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum CompareOp {
    LessThanEqual,
    StrictlyLessThan,
    NotEqual,
    Equal,
    GreaterThanEqual,
    StrictlyGreaterThan,
    Compatible,
    ArbitraryEqual,
    // not PEP 440; the manifest dialect's semver-flavored shorthands
    Caret,
    Tilde,
}

impl Display for CompareOp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        use CompareOp::*;
        write!(
            f,
            "{}",
            match self {
                LessThanEqual => "<=",
                StrictlyLessThan => "<",
                NotEqual => "!=",
                Equal => "==",
                GreaterThanEqual => ">=",
                StrictlyGreaterThan => ">",
                Compatible => "~=",
                ArbitraryEqual => "===",
                Caret => "^",
                Tilde => "~",
            }
        )
    }
}

impl TryFrom<&str> for CompareOp {
    type Error = eyre::Report;

    fn try_from(value: &str) -> Result<Self> {
        use CompareOp::*;
        Ok(match value {
            "==" => Equal,
            "!=" => NotEqual,
            "<=" => LessThanEqual,
            "<" => StrictlyLessThan,
            ">=" => GreaterThanEqual,
            ">" => StrictlyGreaterThan,
            "~=" => Compatible,
            "===" => ArbitraryEqual,
            "^" => Caret,
            "~" => Tilde,
            _ => bail!("unrecognized operator: {:?}", value),
        })
    }
}

try_from_str_boilerplate!(CompareOp);

/// A single `op value` clause out of a PEP 440 specifier string.
///
/// The right-hand side stays a string rather than a parsed Version, because
/// `==` and `!=` accept wildcards like `1.2.*` which aren't versions, and
/// `===` compares against strings that might not parse at all.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Specifier {
    pub op: CompareOp,
    pub value: String,
}

fn parse_wildcard(input: &str) -> Result<(Version, bool)> {
    if let Some(vstr) = input.strip_suffix(".*") {
        Ok((vstr.try_into()?, true))
    } else {
        Ok((input.try_into()?, false))
    }
}

/// `== X.*` covers the half-open range [X.dev0, bump(X).dev0), where bump
/// increments the last numeric component present -- `.*` is legal after
/// .postN and pre-release suffixes too, not just plain releases.
fn wildcard_bounds(version: &Version) -> Result<(Version, Version)> {
    if version.0.dev.is_some() || version.has_local() {
        bail!("version wildcards can't have dev or local suffixes");
    }
    let mut lo = version.clone();
    lo.0.dev = Some(0);
    let mut hi = version.clone();
    if let Some(post) = hi.0.post {
        hi.0.post = Some(post + 1);
    } else if let Some(pre) = hi.0.pre {
        use pep440::PreRelease::*;
        hi.0.pre = Some(match pre {
            RC(n) => RC(n + 1),
            A(n) => A(n + 1),
            B(n) => B(n + 1),
        });
    } else {
        *hi.0.release.last_mut().unwrap() += 1;
    }
    hi.0.dev = Some(0);
    Ok((lo, hi))
}

impl Specifier {
    pub fn satisfied_by(&self, version: &Version) -> Result<bool> {
        Ok(self.to_spec()?.contains(version))
    }

    /// Lower this clause to a normalized interval set, applying PEP 440's
    /// pre/post edge rules.
    pub fn to_spec(&self) -> Result<VersionSpec> {
        use CompareOp::*;

        if self.op == ArbitraryEqual {
            // PEP 440 says === is a plain string comparison for versions the
            // scheme can't represent. Every version we can get this far with
            // *does* parse, so we treat it as an exact pin.
            let version: Version = self.value.as_str().try_into().wrap_err(
                "=== against a string that isn't a parseable version",
            )?;
            return Ok(VersionSpec::exact(&version));
        }

        let (version, wildcard) = parse_wildcard(&self.value)?;
        if wildcard {
            let (lo, hi) = wildcard_bounds(&version)?;
            return Ok(match self.op {
                Equal => VersionSpec::interval(lo, hi),
                NotEqual => VersionSpec::interval(lo, hi).complement(),
                _ => bail!("can't use a wildcard with operator {}", self.op),
            });
        }

        if !matches!(self.op, Equal | NotEqual) && version.has_local() {
            bail!(
                "operator {} cannot be used with a +local version suffix",
                self.op
            );
        }

        Ok(match self.op {
            ArbitraryEqual => unreachable!(),
            Caret => VersionSpec::caret(&version),
            Tilde => VersionSpec::tilde(&version),
            Equal => VersionSpec::exact(&version),
            NotEqual => VersionSpec::exact(&version).complement(),
            LessThanEqual => {
                VersionSpec::interval(VERSION_ZERO.clone(), version.next())
            }
            GreaterThanEqual => {
                VersionSpec::interval(version, VERSION_INFINITY.clone())
            }
            // "The exclusive ordered comparison >V MUST NOT allow a
            // post-release of the given version unless V itself is a post
            // release."
            StrictlyGreaterThan => {
                let mut lo = version.clone();
                if let Some(dev) = &version.0.dev {
                    lo.0.dev = Some(dev + 1);
                } else if let Some(post) = &version.0.post {
                    lo.0.post = Some(post + 1);
                } else {
                    // The spec wants "the next version that isn't a post of
                    // V". There is no smallest such version (X.Y.Z is
                    // shorthand for X.Y.Z.0.0...), so we jump past every
                    // possible post-release instead.
                    lo.0.post = Some(u32::MAX);
                }
                VersionSpec::interval(lo, VERSION_INFINITY.clone())
            }
            // "The exclusive ordered comparison <V MUST NOT allow a
            // pre-release of the specified version unless the specified
            // version is itself a pre-release."
            StrictlyLessThan => {
                if version.is_prerelease() {
                    VersionSpec::interval(VERSION_ZERO.clone(), version)
                } else {
                    let mut hi = version;
                    hi.0.dev = Some(0);
                    hi.0.post = None;
                    hi.0.local = vec![];
                    VersionSpec::interval(VERSION_ZERO.clone(), hi)
                }
            }
            // ~= X.Y.suffixes is >= X.Y.suffixes combined with == X.*
            Compatible => {
                if version.0.release.len() < 2 {
                    bail!("~= operator requires a version with two segments (X.Y)");
                }
                let hi = version.next_after_prefix(version.0.release.len() - 1);
                VersionSpec::interval(version, hi)
            }
        })
    }
}

impl Display for Specifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} {}", self.op, self.value)
    }
}

/// A comma-separated conjunction of specifier clauses, like
/// `>= 20, != 20.1.*`.
#[derive(
    Debug, Clone, PartialEq, Eq, Hash, SerializeDisplay, DeserializeFromStr, Default,
)]
pub struct Specifiers(pub Vec<Specifier>);

impl Specifiers {
    pub fn any() -> Specifiers {
        Specifiers(vec![])
    }

    pub fn satisfied_by(&self, version: &Version) -> Result<bool> {
        for specifier in &self.0 {
            if !specifier.satisfied_by(version)? {
                return Ok(false);
            }
        }
        Ok(true)
    }

    pub fn to_spec(&self) -> Result<VersionSpec> {
        let mut spec = VersionSpec::any();
        for specifier in &self.0 {
            spec = spec.intersect(&specifier.to_spec()?);
        }
        Ok(spec)
    }
}

impl Display for Specifiers {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut first = true;
        for spec in &self.0 {
            if !first {
                write!(f, ", ")?
            }
            first = false;
            write!(f, "{}", spec)?
        }
        Ok(())
    }
}

impl TryFrom<&str> for Specifiers {
    type Error = eyre::Report;

    fn try_from(input: &str) -> Result<Self> {
        super::reqparse::versionspec(input)
            .wrap_err_with(|| format!("failed to parse version specifiers {:?}", input))
    }
}

try_from_str_boilerplate!(Specifiers);

#[cfg(test)]
mod test {
    use super::*;

    fn v(s: &str) -> Version {
        s.parse().unwrap()
    }

    fn spec(op: CompareOp, value: &str) -> Specifier {
        Specifier {
            op,
            value: value.into(),
        }
    }

    #[test]
    fn test_equals_pads_release() {
        let s = spec(CompareOp::Equal, "1.0");
        assert!(s.satisfied_by(&v("1.0")).unwrap());
        assert!(s.satisfied_by(&v("1.0.0")).unwrap());
        assert!(!s.satisfied_by(&v("1.0.1")).unwrap());
        assert!(!s.satisfied_by(&v("1.0a1")).unwrap());
    }

    #[test]
    fn test_wildcards() {
        let s = spec(CompareOp::Equal, "1.2.*");
        assert!(s.satisfied_by(&v("1.2.0")).unwrap());
        assert!(s.satisfied_by(&v("1.2.3.post4")).unwrap());
        assert!(s.satisfied_by(&v("1.2.1a1")).unwrap());
        assert!(!s.satisfied_by(&v("1.3.0")).unwrap());

        let ne = spec(CompareOp::NotEqual, "1.2.*");
        assert!(!ne.satisfied_by(&v("1.2.5")).unwrap());
        assert!(ne.satisfied_by(&v("1.3.0")).unwrap());

        assert!(spec(CompareOp::GreaterThanEqual, "1.2.*").to_spec().is_err());
        assert!(spec(CompareOp::Equal, "1.2.dev1.*").to_spec().is_err());
    }

    #[test]
    fn test_exclusive_ordered_edge_rules() {
        // > 1.7 must not admit 1.7.post1
        let gt = spec(CompareOp::StrictlyGreaterThan, "1.7");
        assert!(!gt.satisfied_by(&v("1.7.post1")).unwrap());
        assert!(gt.satisfied_by(&v("1.7.1")).unwrap());
        // ...unless the base is itself a post release
        let gt_post = spec(CompareOp::StrictlyGreaterThan, "1.7.post1");
        assert!(gt_post.satisfied_by(&v("1.7.post2")).unwrap());

        // < 1.7 must not admit 1.7's own pre-releases
        let lt = spec(CompareOp::StrictlyLessThan, "1.7");
        assert!(!lt.satisfied_by(&v("1.7a1")).unwrap());
        assert!(lt.satisfied_by(&v("1.6.99")).unwrap());
        // ...unless the bound is itself a pre-release
        let lt_pre = spec(CompareOp::StrictlyLessThan, "1.7b1");
        assert!(lt_pre.satisfied_by(&v("1.7a1")).unwrap());
    }

    #[test]
    fn test_compatible_release() {
        let s = spec(CompareOp::Compatible, "2.2");
        assert!(s.satisfied_by(&v("2.2")).unwrap());
        assert!(s.satisfied_by(&v("2.9")).unwrap());
        assert!(!s.satisfied_by(&v("3.0")).unwrap());

        let s = spec(CompareOp::Compatible, "2.2.3");
        assert!(s.satisfied_by(&v("2.2.5")).unwrap());
        assert!(!s.satisfied_by(&v("2.3.0")).unwrap());

        assert!(spec(CompareOp::Compatible, "2").to_spec().is_err());
    }

    #[test]
    fn test_arbitrary_equality() {
        let s = spec(CompareOp::ArbitraryEqual, "1.0");
        assert!(s.satisfied_by(&v("1.0")).unwrap());
        assert!(!s.satisfied_by(&v("1.1")).unwrap());
    }

    #[test]
    fn test_caret_and_tilde_shorthands() {
        let specs: Specifiers = "^2.1".try_into().unwrap();
        assert!(specs.satisfied_by(&v("2.1.2")).unwrap());
        assert!(specs.satisfied_by(&v("2.9")).unwrap());
        assert!(!specs.satisfied_by(&v("3.0.0")).unwrap());
        assert!(!specs.satisfied_by(&v("2.0.5")).unwrap());

        let specs: Specifiers = "~1.2.3".try_into().unwrap();
        assert!(specs.satisfied_by(&v("1.2.9")).unwrap());
        assert!(!specs.satisfied_by(&v("1.3.0")).unwrap());
    }

    #[test]
    fn test_conjunction() {
        let specs: Specifiers = ">= 20, != 20.1.*".try_into().unwrap();
        assert!(specs.satisfied_by(&v("20.0")).unwrap());
        assert!(specs.satisfied_by(&v("20.2")).unwrap());
        assert!(!specs.satisfied_by(&v("20.1.3")).unwrap());
        assert!(!specs.satisfied_by(&v("19.9")).unwrap());
    }

    #[test]
    fn test_to_spec_matches_satisfied_by() {
        let specs: Specifiers = ">= 1.2, < 2.0".try_into().unwrap();
        let lowered = specs.to_spec().unwrap();
        for ver in ["1.0", "1.2", "1.5", "2.0", "2.1"] {
            assert_eq!(
                lowered.contains(&v(ver)),
                specs.satisfied_by(&v(ver)).unwrap(),
                "{}",
                ver
            );
        }
    }
}
