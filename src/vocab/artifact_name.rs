use crate::prelude::*;

#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Debug, Hash)]
pub enum SdistFormat {
    Zip,
    TarGz,
}

#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Debug, Hash)]
pub struct SdistName {
    pub distribution: PackageName,
    pub version: Version,
    pub format: SdistFormat,
}

impl TryFrom<&str> for SdistName {
    type Error = eyre::Report;

    fn try_from(value: &str) -> Result<Self> {
        static SDIST_NAME_RE: Lazy<Regex> =
            Lazy::new(|| Regex::new(r"^(.*)-([^-]*)\.(zip|tar\.gz)$").unwrap());

        match SDIST_NAME_RE.captures(value) {
            None => bail!("invalid sdist name {:?}", value),
            Some(captures) => Ok(SdistName {
                distribution: captures.get(1).unwrap().as_str().parse()?,
                version: captures.get(2).unwrap().as_str().parse()?,
                format: match captures.get(3).unwrap().as_str() {
                    "zip" => SdistFormat::Zip,
                    "tar.gz" => SdistFormat::TarGz,
                    _ => unreachable!(),
                },
            }),
        }
    }
}

try_from_str_boilerplate!(SdistName);

impl Display for SdistName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}-{}.{}",
            self.distribution.as_given(),
            self.version,
            match self.format {
                SdistFormat::Zip => "zip",
                SdistFormat::TarGz => "tar.gz",
            }
        )
    }
}

// https://packaging.python.org/specifications/binary-distribution-format/#file-name-convention
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Debug, Hash)]
pub struct WheelName {
    pub distribution: PackageName,
    pub version: Version,
    // The wheel format says the build tag "sorts as an empty tuple if unspecified,
    // else sort as a two-item tuple with the first item being the initial
    // digits as an 'int', and the second item being the remainder of the tag
    // as a 'str'". What if there are no initial digits? We split into
    // (Option<u32>, String) and let None sort first.
    pub build_number: Option<u32>,
    pub build_name: String,
    pub py_tags: Vec<String>,
    pub abi_tags: Vec<String>,
    pub arch_tags: Vec<String>,
}

impl WheelName {
    /// Expand the compressed tag sets into every concrete py-abi-arch triple
    /// this wheel claims to support.
    pub fn all_tags(&self) -> Vec<String> {
        let mut tags = Vec::new();
        for py in &self.py_tags {
            for abi in &self.abi_tags {
                for arch in &self.arch_tags {
                    tags.push(format!("{}-{}-{}", py, abi, arch));
                }
            }
        }
        tags
    }

    pub fn is_pure(&self) -> bool {
        self.arch_tags.iter().all(|t| t == "any")
    }

    /// Score this wheel against an environment's ranked tag list (best tag
    /// first). Lower is better; None means incompatible.
    pub fn compatibility(&self, ranked_tags: &[String]) -> Option<usize> {
        self.all_tags()
            .iter()
            .filter_map(|tag| ranked_tags.iter().position(|t| t == tag))
            .min()
    }
}

impl TryFrom<&str> for WheelName {
    type Error = eyre::Report;

    fn try_from(value: &str) -> Result<Self> {
        // Names/versions/tags get validated properly by their own
        // constructors; this just rules out ridiculous stuff like spaces and
        // control characters.
        static VALID_CHARS: Lazy<Regex> =
            Lazy::new(|| Regex::new(r"^[A-Za-z0-9_.+!-]*$").unwrap());
        if !VALID_CHARS.is_match(value) {
            bail!("invalid characters in wheel name {:?}", value);
        }

        let stem = value
            .strip_suffix(".whl")
            .ok_or_else(|| eyre!("expected {:?} to end in .whl", value))?;

        let mut pieces: Vec<&str> = stem.split('-').collect();

        let (build_number, build_name) = if pieces.len() == 6 {
            let build_tag = pieces.remove(2);
            if build_tag.is_empty() {
                bail!("found empty build tag in {:?}", value);
            }
            static BUILD_TAG_SPLIT: Lazy<Regex> =
                Lazy::new(|| Regex::new(r"^([0-9]*)(.*)$").unwrap());
            // unwrap safe: the regex can't fail to match
            let captures = BUILD_TAG_SPLIT.captures(build_tag).unwrap();
            (
                captures.get(1).unwrap().as_str().parse().ok(),
                captures.get(2).unwrap().as_str().to_owned(),
            )
        } else {
            (None, String::new())
        };

        if pieces.len() != 5 {
            bail!("can't parse wheel name {:?}", value);
        }

        let split_tags = |s: &str| s.split('.').map(String::from).collect::<Vec<_>>();

        Ok(WheelName {
            distribution: pieces[0].parse()?,
            version: pieces[1].parse()?,
            build_number,
            build_name,
            py_tags: split_tags(pieces[2]),
            abi_tags: split_tags(pieces[3]),
            arch_tags: split_tags(pieces[4]),
        })
    }
}

try_from_str_boilerplate!(WheelName);

impl Display for WheelName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}-{}",
            self.distribution.as_given(),
            self.version,
        )?;
        if self.build_number.is_some() || !self.build_name.is_empty() {
            write!(f, "-")?;
            if let Some(n) = self.build_number {
                write!(f, "{}", n)?;
            }
            write!(f, "{}", self.build_name)?;
        }
        write!(
            f,
            "-{}-{}-{}.whl",
            self.py_tags.join("."),
            self.abi_tags.join("."),
            self.arch_tags.join("."),
        )
    }
}

/// A filename as it appears in an index listing: either kind of distribution
/// we know how to consume.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Debug, Hash)]
pub enum ArtifactName {
    Wheel(WheelName),
    Sdist(SdistName),
}

impl ArtifactName {
    pub fn distribution(&self) -> &PackageName {
        match self {
            ArtifactName::Wheel(name) => &name.distribution,
            ArtifactName::Sdist(name) => &name.distribution,
        }
    }

    pub fn version(&self) -> &Version {
        match self {
            ArtifactName::Wheel(name) => &name.version,
            ArtifactName::Sdist(name) => &name.version,
        }
    }

    pub fn as_wheel(&self) -> Option<&WheelName> {
        match self {
            ArtifactName::Wheel(name) => Some(name),
            ArtifactName::Sdist(_) => None,
        }
    }

    pub fn as_sdist(&self) -> Option<&SdistName> {
        match self {
            ArtifactName::Wheel(_) => None,
            ArtifactName::Sdist(name) => Some(name),
        }
    }
}

impl TryFrom<&str> for ArtifactName {
    type Error = eyre::Report;

    fn try_from(value: &str) -> Result<Self> {
        if value.ends_with(".whl") {
            Ok(ArtifactName::Wheel(value.try_into()?))
        } else if value.ends_with(".zip") || value.ends_with(".tar.gz") {
            Ok(ArtifactName::Sdist(value.try_into()?))
        } else {
            bail!("unrecognized artifact filename {:?}", value)
        }
    }
}

try_from_str_boilerplate!(ArtifactName);

impl Display for ArtifactName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ArtifactName::Wheel(name) => write!(f, "{}", name),
            ArtifactName::Sdist(name) => write!(f, "{}", name),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_wheel_name_parse() {
        let name: WheelName =
            "numpy-1.24.1-cp311-cp311-manylinux_2_17_x86_64.whl".parse().unwrap();
        assert_eq!(name.distribution.canonical(), "numpy");
        assert_eq!(name.version.to_string(), "1.24.1");
        assert_eq!(name.py_tags, vec!["cp311"]);
        assert_eq!(name.abi_tags, vec!["cp311"]);
        assert_eq!(name.arch_tags, vec!["manylinux_2_17_x86_64"]);
        assert!(!name.is_pure());

        let pure: WheelName = "attrs-22.2.0-py3-none-any.whl".parse().unwrap();
        assert!(pure.is_pure());
    }

    #[test]
    fn test_wheel_name_build_tag() {
        let name: WheelName = "foo-1.0-2rev1-py3-none-any.whl".parse().unwrap();
        assert_eq!(name.build_number, Some(2));
        assert_eq!(name.build_name, "rev1");
        assert_eq!(name.to_string(), "foo-1.0-2rev1-py3-none-any.whl");
    }

    #[test]
    fn test_wheel_tag_expansion() {
        let name: WheelName = "foo-1.0-py2.py3-none-any.whl".parse().unwrap();
        assert_eq!(
            name.all_tags(),
            vec!["py2-none-any".to_string(), "py3-none-any".to_string()]
        );
    }

    #[test]
    fn test_sdist_name_parse() {
        let name: SdistName = "requests-2.28.2.tar.gz".parse().unwrap();
        assert_eq!(name.distribution.canonical(), "requests");
        assert_eq!(name.format, SdistFormat::TarGz);
        assert_eq!(name.to_string(), "requests-2.28.2.tar.gz");
    }

    #[test]
    fn test_artifact_name_dispatch() {
        let wheel: ArtifactName = "attrs-22.2.0-py3-none-any.whl".parse().unwrap();
        assert!(wheel.as_wheel().is_some());
        let sdist: ArtifactName = "attrs-22.2.0.tar.gz".parse().unwrap();
        assert!(sdist.as_sdist().is_some());
        assert_eq!(wheel.distribution(), sdist.distribution());

        let bad: Result<ArtifactName> = "attrs-22.2.0.rpm".parse();
        assert!(bad.is_err());
    }

    #[test]
    fn test_round_trip() {
        for text in [
            "numpy-1.24.1-cp311-cp311-manylinux_2_17_x86_64.whl",
            "attrs-22.2.0-py3-none-any.whl",
            "requests-2.28.2.tar.gz",
            "pyzip-0.1.zip",
        ] {
            let name: ArtifactName = text.parse().unwrap();
            assert_eq!(name.to_string(), text);
        }
    }
}
