use crate::prelude::*;

use std::fs;
use std::path::Path;

use crate::index::{PackageId, Source};
use crate::manifest::Manifest;
use crate::resolve::{ResolvedPackage, Solution, VersionHints};

/// The lock schema we write. Parsing accepts any 2.x lock; from 2.1 on, a
/// lock's markers are trusted enough that installing evaluates them against
/// the target environment instead of re-resolving.
pub const LOCK_VERSION: &str = "2.1";
const MARKER_EVAL_MINIMUM: (u64, u64) = (2, 1);

fn parse_schema_version(text: &str) -> Option<(u64, u64)> {
    let (major, minor) = text.split_once('.')?;
    Some((major.parse().ok()?, minor.parse().ok()?))
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct LockMetadata {
    pub lock_version: String,
    pub content_hash: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct LockFileEntry {
    pub file: String,
    pub hash: ArtifactHash,
}

/// One `[[package]]` entry. Requirement strings and markers are stored in
/// their canonical rendered forms; that keeps serialize/deserialize a clean
/// round-trip, and parsing back into the algebra happens on demand.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct LockPackage {
    pub name: PackageName,
    pub version: Version,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub groups: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub marker: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub requires_python: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub dependencies: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub extras: Vec<String>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub develop: bool,
    pub source: Source,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub files: Vec<LockFileEntry>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Lock {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub package: Vec<LockPackage>,
    pub metadata: LockMetadata,
}

impl Lock {
    pub fn from_solution(solution: &Solution, manifest: &Manifest) -> Result<Lock> {
        let mut package = Vec::with_capacity(solution.packages.len());
        for resolved in &solution.packages {
            package.push(LockPackage {
                name: resolved.id.name.clone(),
                version: resolved.id.version.clone(),
                groups: resolved.groups.clone(),
                marker: resolved.marker.as_ref().map(|m| m.to_string()),
                requires_python: if resolved.requires_python.0.is_empty() {
                    None
                } else {
                    Some(resolved.requires_python.to_string())
                },
                dependencies: resolved
                    .dependencies
                    .iter()
                    .map(|req| req.to_string())
                    .collect(),
                extras: resolved
                    .provided_extras
                    .iter()
                    .map(|e| e.canonical().to_owned())
                    .collect(),
                develop: resolved.develop,
                source: resolved.id.source.clone(),
                files: resolved
                    .files
                    .iter()
                    .map(|(file, hash)| LockFileEntry {
                        file: file.clone(),
                        hash: hash.clone(),
                    })
                    .collect(),
            });
        }
        // canonical order: name, then source, then version
        package.sort_by(|a, b| {
            (&a.name, &a.source, &a.version).cmp(&(&b.name, &b.source, &b.version))
        });
        Ok(Lock {
            package,
            metadata: LockMetadata {
                lock_version: LOCK_VERSION.into(),
                content_hash: manifest.content_hash()?.to_string(),
            },
        })
    }

    pub fn parse(text: &str) -> Result<Lock> {
        let lock: Lock = toml_edit::de::from_str(text)
            .wrap_err("failed to parse lock file")?;
        let (major, _) = lock.schema_version()?;
        let (supported_major, _) = parse_schema_version(LOCK_VERSION).unwrap();
        if major > supported_major {
            return Err(SprigError::LockVersionUnknown(
                lock.metadata.lock_version.clone(),
            )
            .into());
        }
        Ok(lock)
    }

    pub fn load(path: &Path) -> Result<Lock> {
        context!("Reading lock file {}", path.display());
        Lock::parse(&fs::read_to_string(path)?)
    }

    fn schema_version(&self) -> Result<(u64, u64)> {
        parse_schema_version(&self.metadata.lock_version).ok_or_else(|| {
            SprigError::LockVersionUnknown(self.metadata.lock_version.clone()).into()
        })
    }

    /// Canonical rendering: stable key order (struct order), UTF-8, Unix
    /// newlines, trailing newline.
    pub fn render(&self) -> Result<String> {
        let mut rendered = toml_edit::ser::to_string_pretty(self)?;
        if !rendered.ends_with('\n') {
            rendered.push('\n');
        }
        Ok(rendered)
    }

    /// Write via a temp file + rename, so a crash can't leave half a lock.
    pub fn write(&self, path: &Path) -> Result<()> {
        context!("Writing lock file {}", path.display());
        let rendered = self.render()?;
        let dir = path.parent().unwrap_or_else(|| Path::new("."));
        let mut staged = tempfile::NamedTempFile::new_in(dir)?;
        staged.write_all(rendered.as_bytes())?;
        staged.as_file().sync_data()?;
        staged.persist(path)?;
        Ok(())
    }

    /// Does this lock still describe that manifest? (The hash covers only
    /// resolution-defining fields, so e.g. editing the description keeps the
    /// lock fresh.)
    pub fn is_consistent_with(&self, manifest: &Manifest) -> Result<bool> {
        Ok(self.metadata.content_hash == manifest.content_hash()?.to_string())
    }

    /// From 2.1 on, installs evaluate the recorded markers against the
    /// target environment; older locks have to be re-resolved.
    pub fn supports_marker_evaluation(&self) -> bool {
        match self.schema_version() {
            Ok(version) => version >= MARKER_EVAL_MINIMUM,
            Err(_) => false,
        }
    }

    /// Reconstitute the in-memory solution the planner works from.
    pub fn to_solution(&self) -> Result<Solution> {
        let mut packages = Vec::with_capacity(self.package.len());
        for locked in &self.package {
            let marker = match &locked.marker {
                Some(text) => Some(crate::vocab::parse_marker(text)?),
                None => None,
            };
            let dependencies = locked
                .dependencies
                .iter()
                .map(|text| text.as_str().parse())
                .collect::<Result<Vec<Requirement>>>()?;
            let requires_python: Specifiers = match &locked.requires_python {
                Some(text) => text.as_str().try_into()?,
                None => Specifiers::any(),
            };
            packages.push(ResolvedPackage {
                id: PackageId {
                    name: locked.name.clone(),
                    version: locked.version.clone(),
                    source: locked.source.clone(),
                },
                dependencies,
                provided_extras: locked
                    .extras
                    .iter()
                    .map(|e| e.as_str().parse())
                    .collect::<Result<Vec<Extra>>>()?,
                active_extras: Vec::new(),
                requires_python,
                files: locked
                    .files
                    .iter()
                    .map(|entry| (entry.file.clone(), entry.hash.clone()))
                    .collect(),
                develop: locked.develop,
                marker,
                groups: locked.groups.clone(),
            });
        }
        Ok(Solution { packages })
    }

    /// Version preferences for a re-resolve: stick close to what's locked,
    /// and keep trusting locked hashes (so yanked-but-pinned files stay
    /// usable).
    pub fn hints(&self) -> VersionHints {
        let mut hints = VersionHints::default();
        for locked in &self.package {
            hints.pin(
                locked.name.clone(),
                locked.version.clone(),
                locked.files.iter().map(|entry| entry.hash.clone()).collect(),
            );
        }
        hints
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use indoc::indoc;

    fn manifest() -> Manifest {
        Manifest::parse(indoc! {r#"
            name = "myapp"
            version = "0.1.0"
            requires-python = ">= 3.9"
            dependencies = ["attrs >= 21"]
        "#})
        .unwrap()
    }

    fn sample_lock() -> Lock {
        let solution = Solution {
            packages: vec![ResolvedPackage {
                id: PackageId {
                    name: "attrs".parse().unwrap(),
                    version: "22.2.0".parse().unwrap(),
                    source: Source::Index {
                        name: "pypi".into(),
                        url: "https://pypi.org/simple/".parse().unwrap(),
                    },
                },
                dependencies: vec![
                    r#"importlib-metadata; python_version < "3.8""#.parse().unwrap(),
                ],
                provided_extras: vec!["dev".parse().unwrap()],
                active_extras: vec![],
                requires_python: ">=3.6".try_into().unwrap(),
                files: vec![(
                    "attrs-22.2.0-py3-none-any.whl".into(),
                    ArtifactHash::sha256_of(b"fake"),
                )],
                develop: false,
                marker: None,
                groups: vec!["main".into()],
            }],
        };
        Lock::from_solution(&solution, &manifest()).unwrap()
    }

    #[test]
    fn test_round_trip() {
        let lock = sample_lock();
        let rendered = lock.render().unwrap();
        assert!(rendered.ends_with('\n'));
        assert!(!rendered.contains('\r'));
        let parsed = Lock::parse(&rendered).unwrap();
        assert_eq!(lock, parsed);
        // rendering is a fixpoint
        assert_eq!(parsed.render().unwrap(), rendered);
    }

    #[test]
    fn test_consistency_tracks_defining_fields_only() {
        let lock = sample_lock();
        let mut m = manifest();
        assert!(lock.is_consistent_with(&m).unwrap());
        m.description = Some("new description".into());
        assert!(lock.is_consistent_with(&m).unwrap());
        m.dependencies.push(crate::manifest::ManifestRequirement {
            requirement: "rich".parse().unwrap(),
            source: None,
            local: None,
            develop: false,
        });
        assert!(!lock.is_consistent_with(&m).unwrap());
    }

    #[test]
    fn test_version_gating() {
        let lock = sample_lock();
        assert!(lock.supports_marker_evaluation());

        let mut old = lock.clone();
        old.metadata.lock_version = "2.0".into();
        assert!(!old.supports_marker_evaluation());

        let mut future = lock;
        future.metadata.lock_version = "3.0".into();
        let text = future.render().unwrap();
        let err = Lock::parse(&text).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<SprigError>(),
            Some(SprigError::LockVersionUnknown(_))
        ));
    }

    #[test]
    fn test_to_solution_round_trips_semantics() {
        let lock = sample_lock();
        let solution = lock.to_solution().unwrap();
        let package = &solution.packages[0];
        assert_eq!(package.id.name.canonical(), "attrs");
        assert_eq!(package.dependencies.len(), 1);
        assert!(package.dependencies[0].marker.is_some());
        assert_eq!(package.groups, vec!["main"]);
        // and back again: identical lock
        let again = Lock::from_solution(&solution, &manifest()).unwrap();
        assert_eq!(again, lock);
    }

    #[test]
    fn test_hints_trust_locked_hashes() {
        let lock = sample_lock();
        let hints = lock.hints();
        let attrs: PackageName = "attrs".parse().unwrap();

        // the hash sample_lock() recorded stays trusted...
        let locked_hash = ArtifactHash::sha256_of(b"fake");
        assert!(hints.trusts_hash(&attrs, Some(&locked_hash)));

        // ...but nothing else does
        let other_hash = ArtifactHash::sha256_of(b"tampered");
        assert!(!hints.trusts_hash(&attrs, Some(&other_hash)));
        assert!(!hints.trusts_hash(&attrs, None));
        let stranger: PackageName = "unlocked".parse().unwrap();
        assert!(!hints.trusts_hash(&stranger, Some(&locked_hash)));
    }
}
