use crate::prelude::*;

/// A package name as it appeared in some input, plus its PEP 503 canonical
/// form. Equality, ordering, and hashing all go through the canonical form,
/// so `Foo.Bar`, `foo_bar`, and `foo-bar` are the same name.
#[derive(Debug, Clone, DeserializeFromStr, SerializeDisplay, derivative::Derivative)]
#[derivative(Hash, PartialEq, Eq, PartialOrd, Ord)]
pub struct PackageName {
    #[derivative(
        Hash = "ignore",
        PartialEq = "ignore",
        PartialOrd = "ignore",
        Ord = "ignore"
    )]
    given: String,
    canonical: String,
}

impl PackageName {
    pub fn as_given(&self) -> &str {
        &self.given
    }

    pub fn canonical(&self) -> &str {
        &self.canonical
    }
}

impl TryFrom<&str> for PackageName {
    type Error = eyre::Report;

    fn try_from(given: &str) -> Result<Self> {
        // https://packaging.python.org/specifications/core-metadata/#name
        static NAME_VALIDATE: Lazy<Regex> = Lazy::new(|| {
            Regex::new(r"(?i-u)^([A-Z0-9]|[A-Z0-9][A-Z0-9._-]*[A-Z0-9])$").unwrap()
        });
        if !NAME_VALIDATE.is_match(given) {
            bail!("invalid package name {:?}", given);
        }

        // https://www.python.org/dev/peps/pep-0503/#normalized-names: runs of
        // '-', '_', '.' collapse to a single '-', everything lowercased.
        let mut canonical = String::with_capacity(given.len());
        let mut last_was_sep = false;
        for c in given.chars() {
            if matches!(c, '-' | '_' | '.') {
                if !last_was_sep {
                    canonical.push('-');
                }
                last_was_sep = true;
            } else {
                canonical.push(c.to_ascii_lowercase());
                last_was_sep = false;
            }
        }

        Ok(PackageName {
            given: given.into(),
            canonical,
        })
    }
}

try_from_str_boilerplate!(PackageName);

impl Display for PackageName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.given)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_canonicalization() {
        let a: PackageName = "Sphinx-RTD_theme".try_into().unwrap();
        assert_eq!(a.as_given(), "Sphinx-RTD_theme");
        assert_eq!(a.canonical(), "sphinx-rtd-theme");

        let b: PackageName = "sphinx.rtd.theme".try_into().unwrap();
        assert_eq!(a, b);

        let runs: PackageName = "a--__..b".try_into().unwrap();
        assert_eq!(runs.canonical(), "a-b");

        let c: PackageName = "sphinxrtdtheme".try_into().unwrap();
        assert_ne!(a, c);
    }

    #[test]
    fn test_rejects_garbage() {
        for bad in ["", "-leading", "trailing_", "has space", "uni\u{e9}code!"] {
            let got: Result<PackageName> = bad.try_into();
            assert!(got.is_err(), "{:?} should not parse", bad);
        }
    }

    #[test]
    fn test_ordering_is_canonical() {
        let mut names: Vec<PackageName> = ["Zope", "attrs", "Babel"]
            .iter()
            .map(|s| s.parse().unwrap())
            .collect();
        names.sort();
        let order: Vec<&str> = names.iter().map(|n| n.canonical()).collect();
        assert_eq!(order, vec!["attrs", "babel", "zope"]);
    }

    #[test]
    fn test_serde_goes_through_canonical_parse() {
        let direct: PackageName = "flask_sqlalchemy".try_into().unwrap();
        let via_serde: PackageName =
            serde_json::from_str(r#""Flask.SQLAlchemy""#).unwrap();
        assert_eq!(direct, via_serde);

        let bad: serde_json::Result<PackageName> =
            serde_json::from_str(r#""not a name""#);
        assert!(bad.is_err());
    }
}
