use crate::prelude::*;

pub use super::reqparse::ParseExtra;

/// A single PEP 508 dependency specification: name, optional extras, version
/// specifiers (or a direct URL reference), optional environment marker.
#[derive(Debug, Clone, PartialEq, Eq, SerializeDisplay, DeserializeFromStr)]
pub struct Requirement {
    pub name: PackageName,
    pub extras: Vec<Extra>,
    pub specifiers: Specifiers,
    pub marker: Option<Marker>,
    pub url: Option<Url>,
}

impl Requirement {
    pub fn parse(input: &str, parse_extra: ParseExtra) -> Result<Requirement> {
        super::reqparse::specification(input, parse_extra)
            .wrap_err_with(|| format!("failed to parse requirement {:?}", input))
    }

    /// The admissible version set, lowered to intervals.
    pub fn version_spec(&self) -> Result<VersionSpec> {
        self.specifiers.to_spec()
    }
}

impl Display for Requirement {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name.as_given())?;
        if !self.extras.is_empty() {
            let extras: Vec<&str> = self.extras.iter().map(|e| e.as_given()).collect();
            write!(f, "[{}]", extras.join(","))?;
        }
        if let Some(url) = &self.url {
            write!(f, " @ {}", url)?;
        } else if !self.specifiers.0.is_empty() {
            write!(f, " {}", self.specifiers)?;
        }
        if let Some(marker) = &self.marker {
            write!(f, "; {}", marker)?;
        }
        Ok(())
    }
}

impl TryFrom<&str> for Requirement {
    type Error = eyre::Report;

    fn try_from(input: &str) -> Result<Self> {
        // 'extra' is allowed by default, because most requirement strings we
        // parse come out of package metadata where it's meaningful. Top-level
        // manifest requirements go through Requirement::parse with
        // ParseExtra::NotAllowed instead.
        Requirement::parse(input, ParseExtra::Allowed)
    }
}

try_from_str_boilerplate!(Requirement);

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_full_form() {
        let r: Requirement =
            "twisted[tls,serial] >= 20, != 20.1.*; python_version >= '3'"
                .parse()
                .unwrap();
        assert_eq!(r.name.canonical(), "twisted");
        assert_eq!(r.extras.len(), 2);
        assert_eq!(r.specifiers.0.len(), 2);
        assert!(r.marker.is_some());
        assert!(r.url.is_none());
    }

    #[test]
    fn test_bare_name() {
        let r: Requirement = "sortedcontainers".parse().unwrap();
        assert_eq!(r.specifiers, Specifiers::any());
        assert!(r.marker.is_none());
    }

    #[test]
    fn test_parenthesized_specifiers() {
        let r: Requirement = "attrs (>=19.2.0)".parse().unwrap();
        assert_eq!(r.specifiers.0.len(), 1);
    }

    #[test]
    fn test_direct_reference() {
        let r: Requirement =
            "pip @ https://github.com/pypa/pip/archive/22.0.2.zip"
                .parse()
                .unwrap();
        assert!(r.url.is_some());
        assert_eq!(r.specifiers, Specifiers::any());
    }

    #[test]
    fn test_arbitrary_equality_parses() {
        let r: Requirement = "legacy === 1.0.4-dontparse".parse().unwrap();
        assert_eq!(r.specifiers.0[0].op, CompareOp::ArbitraryEqual);
    }

    #[test]
    fn test_extra_guard() {
        let bad = Requirement::parse(
            "foo; extra == 'tls'",
            ParseExtra::NotAllowed,
        );
        assert!(bad.is_err());
        let ok = Requirement::parse("foo; extra == 'tls'", ParseExtra::Allowed);
        assert!(ok.is_ok());
    }

    #[test]
    fn test_display_round_trip() {
        for text in [
            "attrs >= 19.2.0",
            "twisted[tls] >= 20, != 20.1.*; python_version >= \"3\"",
            "sortedcontainers",
        ] {
            let r: Requirement = text.parse().unwrap();
            let again: Requirement = r.to_string().parse().unwrap();
            assert_eq!(r, again, "{}", text);
        }
    }
}
