use crate::prelude::*;

use super::headers::HeaderBlock;

/// The subset of core metadata (METADATA / PKG-INFO) that resolution and
/// installation actually consume. There are plenty more fields; we don't
/// care about them.
#[derive(Debug, Clone)]
#[cfg_attr(test, derive(Serialize))]
pub struct CoreMetadata {
    pub metadata_version: Version,
    pub name: PackageName,
    pub version: Version,
    pub requires_dist: Vec<Requirement>,
    pub requires_python: Specifiers,
    pub extras: HashSet<Extra>,
}

impl TryFrom<&[u8]> for CoreMetadata {
    type Error = eyre::Report;

    fn try_from(value: &[u8]) -> Result<Self> {
        // Mangled utf-8 has definitely made it onto PyPI at some point in
        // history; be lenient about it.
        let text = String::from_utf8_lossy(value);
        let mut parsed = HeaderBlock::parse(&text)?;

        // Quoth https://packaging.python.org/specifications/core-metadata:
        // "Automated tools consuming metadata SHOULD warn if metadata_version
        // is greater than the highest version they support, and MUST fail if
        // metadata_version has a greater major version than the highest
        // version they support."
        //
        // We do the MUST. Warning about minor revisions would just be noise:
        // by definition old tools are supposed to handle them well enough.
        static NEXT_MAJOR_METADATA_VERSION: Lazy<Version> =
            Lazy::new(|| "3".try_into().unwrap());
        let metadata_version: Version =
            parsed.take_required("Metadata-Version")?.try_into()?;
        if metadata_version >= *NEXT_MAJOR_METADATA_VERSION {
            bail!("unsupported Metadata-Version {}", metadata_version);
        }

        let name: PackageName = parsed.take_required("Name")?.parse()?;
        let version: Version = parsed.take_required("Version")?.try_into()?;

        let mut requires_dist = Vec::new();
        for req in parsed.take_all("Requires-Dist") {
            requires_dist.push(
                Requirement::parse(&req, ParseExtra::Allowed)
                    .wrap_err_with(|| format!("in Requires-Dist of {}", name))?,
            );
        }

        let requires_python = match parsed.take_optional("Requires-Python")? {
            Some(value) => value.try_into()?,
            None => Specifiers::any(),
        };

        let mut extras = HashSet::new();
        for extra in parsed.take_all("Provides-Extra") {
            extras.insert(extra.parse()?);
        }

        Ok(CoreMetadata {
            metadata_version,
            name,
            version,
            requires_dist,
            requires_python,
            extras,
        })
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use indoc::indoc;

    #[test]
    fn test_metadata_parse() {
        let text = indoc! {r#"
            Metadata-Version: 2.1
            Name: trio
            Version: 0.16.0
            Summary: A friendly Python library for async concurrency and I/O
            Requires-Python: >=3.6
            Requires-Dist: attrs (>=19.2.0)
            Requires-Dist: sortedcontainers
            Requires-Dist: contextvars[foo] (>=2.1) ; python_version < "3.7"
            Provides-Extra: docs

            The Trio project's goal is...
        "#};

        let metadata: CoreMetadata = text.as_bytes().try_into().unwrap();
        assert_eq!(metadata.name.canonical(), "trio");
        assert_eq!(metadata.version.to_string(), "0.16.0");
        assert_eq!(metadata.requires_dist.len(), 3);
        assert_eq!(metadata.requires_dist[0].name.canonical(), "attrs");
        assert!(metadata.requires_dist[2].marker.is_some());
        assert!(metadata.extras.contains(&"docs".parse().unwrap()));
        assert!(metadata
            .requires_python
            .satisfied_by(&"3.8".parse().unwrap())
            .unwrap());
    }

    #[test]
    fn test_rejects_future_major_version() {
        let text = indoc! {r#"
            Metadata-Version: 3.0
            Name: futuristic
            Version: 1.0
        "#};
        let got: Result<CoreMetadata> = text.as_bytes().try_into();
        assert!(got.is_err());
    }

    #[test]
    fn test_minimal_metadata() {
        let text = "Metadata-Version: 2.1\nName: tiny\nVersion: 0.1\n";
        let metadata: CoreMetadata = text.as_bytes().try_into().unwrap();
        assert!(metadata.requires_dist.is_empty());
        assert_eq!(metadata.requires_python, Specifiers::any());
    }
}
