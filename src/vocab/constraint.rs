use crate::prelude::*;

// A set of admissible versions, kept as a normalized union of half-open
// intervals [lo, hi). "Normalized" means: intervals are non-empty, sorted
// ascending, and pairwise disjoint with a gap between them (touching
// intervals get merged). That makes equality of VersionSpecs meaningful, so
// tests (and the lock codec) can compare them directly.
//
// The unbounded side is represented with VERSION_INFINITY rather than an
// Option. There is no real largest PEP 440 version, but the sentinel is far
// beyond anything an index will ever serve, and it keeps every operation a
// plain interval sweep.

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct VersionSpec {
    intervals: Vec<(Version, Version)>,
}

impl VersionSpec {
    pub fn none() -> VersionSpec {
        VersionSpec { intervals: vec![] }
    }

    pub fn any() -> VersionSpec {
        VersionSpec::interval(VERSION_ZERO.clone(), VERSION_INFINITY.clone())
    }

    /// The half-open interval [lo, hi). Empty if hi <= lo.
    pub fn interval(lo: Version, hi: Version) -> VersionSpec {
        if hi <= lo {
            VersionSpec::none()
        } else {
            VersionSpec {
                intervals: vec![(lo, hi)],
            }
        }
    }

    /// Exactly this version: [v, v.next()).
    pub fn exact(v: &Version) -> VersionSpec {
        VersionSpec::interval(v.clone(), v.next())
    }

    /// Caret requirement: compatible up to the next breaking release.
    /// ^1.2.3 is [1.2.3, 2.0.0.dev0).
    pub fn caret(v: &Version) -> VersionSpec {
        VersionSpec::interval(v.clone(), v.next_breaking())
    }

    /// Tilde requirement: the last given segment may float.
    /// ~1.2.3 is [1.2.3, 1.3.dev0); ~1 is [1, 2.dev0).
    pub fn tilde(v: &Version) -> VersionSpec {
        let segments = v.0.release.len();
        let prefix = if segments >= 2 { segments - 1 } else { 1 };
        VersionSpec::interval(v.clone(), v.next_after_prefix(prefix))
    }

    /// Wildcard requirement: 1.2.* is [1.2.dev0, 1.3.dev0).
    pub fn wildcard(v: &Version) -> VersionSpec {
        let mut lo = v.clone();
        lo.0.pre = None;
        lo.0.post = None;
        lo.0.dev = Some(0);
        VersionSpec::interval(lo, v.next_after_prefix(v.0.release.len()))
    }

    pub fn from_intervals<I>(intervals: I) -> VersionSpec
    where
        I: IntoIterator<Item = (Version, Version)>,
    {
        let mut spec = VersionSpec::none();
        for (lo, hi) in intervals {
            spec = spec.union(&VersionSpec::interval(lo, hi));
        }
        spec
    }

    pub fn is_empty(&self) -> bool {
        self.intervals.is_empty()
    }

    pub fn is_any(&self) -> bool {
        self == &VersionSpec::any()
    }

    pub fn intervals(&self) -> &[(Version, Version)] {
        &self.intervals
    }

    pub fn contains(&self, v: &Version) -> bool {
        self.intervals
            .iter()
            .any(|(lo, hi)| lo <= v && v < hi)
    }

    /// Whether any interval's lower endpoint is itself a pre-release. Used by
    /// the candidate-selection policy: a requirement like ">= 2.0b1" opts its
    /// package into pre-releases without any explicit flag. (Upper endpoints
    /// don't count: those are synthetic `.dev0` bounds.)
    pub fn admits_prereleases(&self) -> bool {
        self.intervals
            .iter()
            .any(|(lo, _)| lo.is_prerelease() && lo > &*VERSION_ZERO)
    }

    pub fn intersect(&self, other: &VersionSpec) -> VersionSpec {
        // Both sides are sorted and disjoint, so a two-finger sweep works.
        let mut out = Vec::new();
        let (mut i, mut j) = (0, 0);
        while i < self.intervals.len() && j < other.intervals.len() {
            let (a_lo, a_hi) = &self.intervals[i];
            let (b_lo, b_hi) = &other.intervals[j];
            let lo = std::cmp::max(a_lo, b_lo);
            let hi = std::cmp::min(a_hi, b_hi);
            if lo < hi {
                out.push((lo.clone(), hi.clone()));
            }
            // advance whichever interval ends first
            if a_hi <= b_hi {
                i += 1;
            } else {
                j += 1;
            }
        }
        VersionSpec { intervals: out }
    }

    pub fn union(&self, other: &VersionSpec) -> VersionSpec {
        let mut merged: Vec<(Version, Version)> = Vec::new();
        let mut all: Vec<&(Version, Version)> =
            self.intervals.iter().chain(other.intervals.iter()).collect();
        all.sort();
        for (lo, hi) in all {
            match merged.last_mut() {
                // half-open intervals that touch exactly still merge
                Some((_, prev_hi)) if lo <= prev_hi => {
                    if hi > prev_hi {
                        *prev_hi = hi.clone();
                    }
                }
                _ => merged.push((lo.clone(), hi.clone())),
            }
        }
        VersionSpec { intervals: merged }
    }

    pub fn complement(&self) -> VersionSpec {
        let mut out = Vec::new();
        let mut cursor = VERSION_ZERO.clone();
        for (lo, hi) in &self.intervals {
            if &cursor < lo {
                out.push((cursor, lo.clone()));
            }
            cursor = hi.clone();
        }
        if cursor < *VERSION_INFINITY {
            out.push((cursor, VERSION_INFINITY.clone()));
        }
        VersionSpec { intervals: out }
    }

    pub fn to_pubgrub(&self) -> pubgrub::range::Range<Version> {
        use pubgrub::range::Range;
        self.intervals.iter().fold(Range::none(), |accum, (lo, hi)| {
            accum.union(&if hi < &*VERSION_INFINITY {
                Range::between(lo.clone(), hi.clone())
            } else {
                Range::higher_than(lo.clone())
            })
        })
    }
}

impl Display for VersionSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.is_empty() {
            return write!(f, "<empty>");
        }
        if self.is_any() {
            return write!(f, "*");
        }
        let mut first = true;
        for (lo, hi) in &self.intervals {
            if !first {
                write!(f, " || ")?;
            }
            first = false;
            if &lo.next() == hi {
                write!(f, "== {}", lo)?;
            } else if hi == &*VERSION_INFINITY {
                write!(f, ">= {}", lo)?;
            } else if lo == &*VERSION_ZERO {
                write!(f, "< {}", hi)?;
            } else {
                write!(f, ">= {}, < {}", lo, hi)?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn v(s: &str) -> Version {
        s.parse().unwrap()
    }

    #[test]
    fn test_caret_tilde_wildcard_bounds() {
        let caret = VersionSpec::caret(&v("1.2.3"));
        assert!(caret.contains(&v("1.2.3")));
        assert!(caret.contains(&v("1.9.0")));
        assert!(!caret.contains(&v("2.0.0")));
        assert!(!caret.contains(&v("2.0.0a1")));
        assert!(!caret.contains(&v("1.2.2")));

        let caret_zero = VersionSpec::caret(&v("0.2.3"));
        assert!(caret_zero.contains(&v("0.2.9")));
        assert!(!caret_zero.contains(&v("0.3.0")));

        let tilde = VersionSpec::tilde(&v("1.2.3"));
        assert!(tilde.contains(&v("1.2.9")));
        assert!(!tilde.contains(&v("1.3.0")));
        let tilde_major = VersionSpec::tilde(&v("1"));
        assert!(tilde_major.contains(&v("1.9")));
        assert!(!tilde_major.contains(&v("2.0")));

        let wild = VersionSpec::wildcard(&v("1.2"));
        assert!(wild.contains(&v("1.2.0")));
        assert!(wild.contains(&v("1.2.99")));
        assert!(!wild.contains(&v("1.3.0")));
    }

    #[test]
    fn test_membership_matches_intervals() {
        let spec = VersionSpec::from_intervals([
            (v("1.0"), v("2.0")),
            (v("3.0"), v("4.0")),
        ]);
        for (ver, expected) in [
            ("1.0", true),
            ("1.5", true),
            ("2.0", false),
            ("2.5", false),
            ("3.0", true),
            ("4.0", false),
        ] {
            assert_eq!(spec.contains(&v(ver)), expected, "{}", ver);
        }
    }

    #[test]
    fn test_union_normalizes() {
        // overlapping and touching intervals collapse to a canonical form
        let a = VersionSpec::interval(v("1.0"), v("2.0"));
        let b = VersionSpec::interval(v("1.5"), v("3.0"));
        let c = VersionSpec::interval(v("3.0"), v("4.0"));
        let merged = a.union(&b).union(&c);
        assert_eq!(merged.intervals().len(), 1);
        assert_eq!(merged, VersionSpec::interval(v("1.0"), v("4.0")));

        // union is order-independent (canonical forms compare equal)
        assert_eq!(c.union(&b).union(&a), merged);
    }

    #[test]
    fn test_intersect_agrees_with_contains() {
        let a = VersionSpec::from_intervals([
            (v("1.0"), v("2.0")),
            (v("3.0"), v("5.0")),
        ]);
        let b = VersionSpec::from_intervals([
            (v("1.5"), v("3.5")),
            (v("4.0"), v("6.0")),
        ]);
        let both = a.intersect(&b);
        for ver in ["0.5", "1.0", "1.5", "1.9", "2.5", "3.0", "3.2", "3.8", "4.5", "5.5"]
        {
            let ver = v(ver);
            assert_eq!(
                both.contains(&ver),
                a.contains(&ver) && b.contains(&ver),
                "{}",
                ver
            );
        }
    }

    #[test]
    fn test_empty_intersection() {
        let a = VersionSpec::interval(v("1.0"), v("2.0"));
        let b = VersionSpec::interval(v("2.0"), v("3.0"));
        assert!(a.intersect(&b).is_empty());
    }

    #[test]
    fn test_complement_round_trip() {
        let spec = VersionSpec::from_intervals([
            (v("1.0"), v("2.0")),
            (v("3.0"), v("4.0")),
        ]);
        let complement = spec.complement();
        assert!(!complement.contains(&v("1.5")));
        assert!(complement.contains(&v("2.5")));
        assert!(complement.contains(&v("0.5")));
        assert!(complement.contains(&v("99.0")));
        assert_eq!(spec.complement().complement(), spec);
        assert_eq!(VersionSpec::any().complement(), VersionSpec::none());
    }

    #[test]
    fn test_prerelease_endpoints_opt_in() {
        assert!(VersionSpec::interval(v("2.0b1"), VERSION_INFINITY.clone())
            .admits_prereleases());
        assert!(!VersionSpec::caret(&v("1.2.3")).admits_prereleases());
        assert!(!VersionSpec::any().admits_prereleases());
    }

    #[test]
    fn test_display_canonical() {
        assert_eq!(VersionSpec::any().to_string(), "*");
        assert_eq!(VersionSpec::none().to_string(), "<empty>");
        assert_eq!(
            VersionSpec::interval(v("1.0"), v("2.0")).to_string(),
            ">= 1.0, < 2.0"
        );
        assert_eq!(VersionSpec::exact(&v("1.4")).to_string(), "== 1.4");
    }
}
