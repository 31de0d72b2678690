use crate::prelude::*;

use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;

use super::artifacts::Wheel;
use super::package_db::{IndexedArtifact, PackageDB};
use crate::index::ArtifactInfo;
use crate::manifest::{BuildSystem, Manifest, ManifestRequirement};
use crate::tree::{CleanPath, WriteTreeFS};

// Building an sdist means: unpack it, resolve the declared build-system
// requirements with the same resolver everything else uses, materialize
// them in a throwaway site directory, and drive the declared backend
// through a small Python shim in a subprocess. The build environment is
// hermetic in the sense that the backend sees only that site directory (plus
// the interpreter's stdlib).

const BUILD_DRIVER_PY: &str = include_str!("build-driver.py");

/// exit code the driver uses to say "I need these dynamic requires first"
const NEEDS_REQUIRES: i32 = 42;

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
enum Pep517Goal {
    Metadata,
    Wheel,
}

impl Pep517Goal {
    fn as_str(&self) -> &'static str {
        match self {
            Pep517Goal::Metadata => "metadata",
            Pep517Goal::Wheel => "wheel",
        }
    }
}

enum Pep517Outcome {
    Metadata { dist_info: PathBuf },
    Wheel { path: PathBuf, name: WheelName },
}

#[derive(Clone)]
pub struct SdistBuilder {
    /// interpreter that drives build backends, from the target environment
    pub interpreter: PathBuf,
    pub python_full_version: Version,
    /// concrete marker valuation of the build host
    pub env_markers: HashMap<String, String>,
    /// ranked wheel tags of the build host, best first
    pub tags: Vec<String>,
    /// packages currently being built, for dependency-loop detection
    build_stack: Vec<PackageName>,
}

impl SdistBuilder {
    pub fn new(
        interpreter: PathBuf,
        python_full_version: Version,
        env_markers: HashMap<String, String>,
        tags: Vec<String>,
    ) -> SdistBuilder {
        SdistBuilder {
            interpreter,
            python_full_version,
            env_markers,
            tags,
            build_stack: Vec::new(),
        }
    }

    fn enter(&self, package: &PackageName) -> Result<SdistBuilder> {
        if let Some(idx) = self.build_stack.iter().position(|p| p == package) {
            let chain = self.build_stack[idx..]
                .iter()
                .map(|p| format!("{} -> ", p.as_given()))
                .collect::<String>();
            bail!("build dependency loop: {chain}{}", package.as_given());
        }
        let mut entered = self.clone();
        entered.build_stack.push(package.clone());
        Ok(entered)
    }

    pub fn built_metadata(
        &self,
        db: &PackageDB,
        sdist_ai: &ArtifactInfo,
    ) -> Result<(Vec<u8>, CoreMetadata)> {
        let name = sdist_ai.name.distribution();
        trace!("building metadata from source for {}", name.as_given());
        let nested = self.enter(name)?;
        match nested.pep517(db, sdist_ai, Pep517Goal::Metadata)? {
            Pep517Outcome::Metadata { dist_info } => {
                let blob = fs::read(dist_info.join("METADATA"))?;
                let metadata = blob.as_slice().try_into()?;
                Ok((blob, metadata))
            }
            Pep517Outcome::Wheel { path, name } => {
                let wheel = Wheel::new(name, Box::new(fs::File::open(path)?))?;
                wheel.metadata()
            }
        }
    }

    /// Build (or fetch from the built-wheel cache) a wheel for this sdist
    /// that's compatible with the given ranked tag list.
    pub fn built_wheel(
        &self,
        db: &PackageDB,
        sdist_ai: &ArtifactInfo,
        target_tags: &[String],
    ) -> Result<Wheel> {
        let name = sdist_ai.name.distribution();
        trace!("building wheel from source for {}", name.as_given());
        let nested = self.enter(name)?;

        let sdist_hash = sdist_ai
            .hash
            .as_ref()
            .ok_or_else(|| eyre!("can't build {}: no hash recorded", sdist_ai.name))?;

        // already built one that fits?
        let cache_dir = db.wheel_cache.entry(sdist_hash)?;
        if cache_dir.exists() {
            let mut best: Option<(usize, PathBuf, WheelName)> = None;
            for entry in fs::read_dir(&*cache_dir)? {
                let entry = entry?;
                let Some(filename) = entry.file_name().to_str().map(String::from) else {
                    continue;
                };
                if !filename.ends_with(".whl") {
                    continue;
                }
                let wheel_name: WheelName = filename.parse()?;
                if let Some(score) = wheel_name.compatibility(target_tags) {
                    if best.as_ref().map(|(s, _, _)| score < *s).unwrap_or(true) {
                        best = Some((score, entry.path(), wheel_name));
                    }
                }
            }
            if let Some((_, path, wheel_name)) = best {
                return Wheel::new(wheel_name, Box::new(fs::File::open(path)?));
            }
        }

        match nested.pep517(db, sdist_ai, Pep517Goal::Wheel)? {
            Pep517Outcome::Wheel { path, name: wheel_name } => {
                if wheel_name.compatibility(target_tags).is_none() {
                    return Err(SprigError::NoCompatibleArtifact {
                        kind: "wheel built from sdist".into(),
                        name: name.as_given().to_owned(),
                        version: sdist_ai.name.version().clone(),
                    }
                    .into());
                }
                // move it into the cache for next time
                fs::create_dir_all(&*cache_dir)?;
                let cached = cache_dir.join(wheel_name.to_string());
                if fs::rename(&path, &cached).is_err() {
                    fs::copy(&path, &cached)?;
                }
                Wheel::new(wheel_name, Box::new(fs::File::open(cached)?))
            }
            Pep517Outcome::Metadata { .. } => unreachable!(),
        }
    }

    /// Build a wheel straight out of a source tree (path and VCS
    /// dependencies). No caching: trees are mutable, so every install builds
    /// fresh.
    pub fn built_wheel_from_tree(
        &self,
        db: &PackageDB,
        name: &PackageName,
        tree: &Path,
        target_tags: &[String],
    ) -> Result<Wheel> {
        trace!("building wheel from tree {} for {}", tree.display(), name.as_given());
        let nested = self.enter(name)?;
        let state = tempfile::tempdir()?;
        fs::write(state.path().join("build-driver.py"), BUILD_DRIVER_PY)?;
        match nested.pep517_in(db, state.path(), tree, Pep517Goal::Wheel)? {
            Pep517Outcome::Wheel { path, name: wheel_name } => {
                if wheel_name.compatibility(target_tags).is_none() {
                    return Err(SprigError::NoCompatibleArtifact {
                        kind: "wheel built from tree".into(),
                        name: name.as_given().to_owned(),
                        version: wheel_name.version.clone(),
                    }
                    .into());
                }
                // move the wheel out before the state dir evaporates
                let kept = tempfile::NamedTempFile::new()?;
                fs::copy(&path, kept.path())?;
                Wheel::new(wheel_name, Box::new(kept.into_file()))
            }
            Pep517Outcome::Metadata { .. } => unreachable!(),
        }
    }

    fn pep517(
        &self,
        db: &PackageDB,
        sdist_ai: &ArtifactInfo,
        goal: Pep517Goal,
    ) -> Result<Pep517Outcome> {
        let sdist_hash = sdist_ai
            .hash
            .as_ref()
            .ok_or_else(|| eyre!("can't build {}: no hash recorded", sdist_ai.name))?;

        // unpack once, keyed by content hash
        let state_dir = db.build_store.read_or_fill(sdist_hash, |dest| {
            let sdist = db.get_sdist(sdist_ai)?;
            let unpack_path = dest.join("sdist");
            sdist.unpack(&mut WriteTreeFS::new(&unpack_path))?;
            fs::write(dest.join("build-driver.py"), BUILD_DRIVER_PY)?;
            Ok(())
        })?;

        let sdist_root = single_subdir(&state_dir.join("sdist"))?;
        self.pep517_in(db, &state_dir, &sdist_root, goal)
    }

    fn pep517_in(
        &self,
        db: &PackageDB,
        state_dir: &Path,
        sdist_root: &Path,
        goal: Pep517Goal,
    ) -> Result<Pep517Outcome> {
        let build_system = match fs::read_to_string(sdist_root.join("pyproject.toml")) {
            Ok(text) => {
                context!("parsing pyproject.toml");
                build_system_stanza(&text)?
            }
            Err(ref e) if e.kind() == std::io::ErrorKind::NotFound => {
                BuildSystem::default()
            }
            Err(e) => Err(e)?,
        };
        serde_json::to_writer(
            fs::File::create(state_dir.join("build-system.json"))?,
            &build_system,
        )?;

        let mut requires: Vec<Requirement> = build_system
            .requires
            .iter()
            .map(|s| Requirement::parse(s, ParseExtra::NotAllowed))
            .collect::<Result<_>>()?;

        // first pass may stop at exit 42 with the backend's dynamic
        // requires; extend the environment and go again
        for satisfied in [false, true] {
            let site = self.materialize_build_env(db, &requires)?;
            let status = self.run_driver(&state_dir, &sdist_root, site.path(), goal, satisfied)?;
            if status == NEEDS_REQUIRES {
                let dynamic: Vec<String> = serde_json::from_reader(fs::File::open(
                    state_dir.join("dynamic-requires.json"),
                )?)?;
                for req in dynamic {
                    requires.push(Requirement::parse(&req, ParseExtra::NotAllowed)?);
                }
                continue;
            }
            if status != 0 {
                // unwrap rationale: enter() pushed the current package
                // before any pep517 work started
                let name = self.build_stack.last().unwrap();
                return Err(SprigError::BuildFailure {
                    name: name.as_given().to_owned(),
                    status: status.to_string(),
                }
                .into());
            }
            break;
        }

        match goal {
            Pep517Goal::Metadata => {
                // the driver falls back to a full wheel build when the
                // backend has no prepare_metadata hook
                if state_dir.join("metadata-out.name").exists() {
                    let name =
                        fs::read_to_string(state_dir.join("metadata-out.name"))?;
                    Ok(Pep517Outcome::Metadata {
                        dist_info: state_dir.join("metadata-out").join(name.trim()),
                    })
                } else {
                    self.wheel_outcome(&state_dir)
                }
            }
            Pep517Goal::Wheel => self.wheel_outcome(&state_dir),
        }
    }

    fn wheel_outcome(&self, state_dir: &Path) -> Result<Pep517Outcome> {
        let name = fs::read_to_string(state_dir.join("wheel-out.name"))?;
        let name = name.trim();
        let wheel_name: WheelName = name.parse()?;
        Ok(Pep517Outcome::Wheel {
            path: state_dir.join("wheel-out").join(name),
            name: wheel_name,
        })
    }

    /// Resolve the build requirements and unpack the resulting wheels into
    /// a throwaway site directory.
    fn materialize_build_env(
        &self,
        db: &PackageDB,
        requires: &[Requirement],
    ) -> Result<tempfile::TempDir> {
        let site = tempfile::tempdir()?;
        if requires.is_empty() {
            return Ok(site);
        }
        context!("Setting up build environment");

        let manifest = Manifest {
            name: "build-env".parse().unwrap(),
            version: "0".parse().unwrap(),
            requires_python: Specifiers(vec![Specifier {
                op: CompareOp::Equal,
                value: self.python_full_version.to_string(),
            }]),
            description: None,
            readme: None,
            dependencies: requires
                .iter()
                .map(|r| ManifestRequirement {
                    requirement: r.clone(),
                    source: None,
                    local: None,
                    develop: false,
                })
                .collect(),
            optional_dependencies: Default::default(),
            groups: Default::default(),
            sources: db.declared_sources().to_vec(),
            build_system: Default::default(),
        };

        let options = crate::resolve::ResolveOptions::default();
        let solution = crate::resolve::resolve(db, &manifest, &options, Some(self))?;

        let layout: HashMap<String, CleanPath> = [
            ("purelib".to_string(), ".".try_into().unwrap()),
            ("platlib".to_string(), ".".try_into().unwrap()),
            ("scripts".to_string(), "bin".try_into().unwrap()),
            ("data".to_string(), "data".try_into().unwrap()),
            ("headers".to_string(), "include".try_into().unwrap()),
        ]
        .into_iter()
        .collect();

        for package in &solution.packages {
            if let Some(marker) = &package.marker {
                if !marker.eval(&self.env_markers)? {
                    continue;
                }
            }
            let artifacts =
                db.artifacts_for_version(&package.id.name, &package.id.version, None)?;
            let wheel = match pick_best_wheel(artifacts, &self.tags) {
                Some(ia) => db.get_wheel(&ia.info)?,
                None => {
                    let sdist = artifacts
                        .iter()
                        .find(|ia| ia.info.name.as_sdist().is_some())
                        .ok_or_else(|| {
                            SprigError::NoCompatibleArtifact {
                                kind: "build dependency".into(),
                                name: package.id.name.as_given().to_owned(),
                                version: package.id.version.clone(),
                            }
                        })?;
                    self.built_wheel(db, &sdist.info, &self.tags)?
                }
            };
            wheel.unpack(&layout, &mut WriteTreeFS::new(site.path()))?;
        }
        Ok(site)
    }

    fn run_driver(
        &self,
        state_dir: &Path,
        sdist_root: &Path,
        site: &Path,
        goal: Pep517Goal,
        requires_satisfied: bool,
    ) -> Result<i32> {
        context!("Running build backend ({})", goal.as_str());
        let mut cmd = Command::new(&self.interpreter);
        cmd.arg(state_dir.join("build-driver.py"))
            .arg(goal.as_str())
            .arg(state_dir)
            .current_dir(sdist_root)
            .env("PYTHONPATH", site)
            .env("PYTHONNOUSERSITE", "1")
            .stdin(std::process::Stdio::null());
        if requires_satisfied {
            cmd.env("SPRIG_BUILD_REQUIRES_SATISFIED", "1");
        }
        let status = cmd.status().wrap_err("spawning build backend")?;
        Ok(status.code().unwrap_or(-1))
    }
}

/// Pick the best index wheel for a ranked tag list.
pub fn pick_best_wheel<'a>(
    artifacts: &'a [IndexedArtifact],
    tags: &[String],
) -> Option<&'a IndexedArtifact> {
    artifacts
        .iter()
        .filter_map(|ia| {
            ia.info
                .name
                .as_wheel()
                .and_then(|w| w.compatibility(tags))
                .map(|score| (score, ia))
        })
        .min_by_key(|(score, _)| *score)
        .map(|(_, ia)| ia)
}

fn single_subdir(path: &Path) -> Result<PathBuf> {
    let mut entries = fs::read_dir(path)?
        .collect::<std::result::Result<Vec<_>, std::io::Error>>()?;
    if entries.len() != 1 {
        bail!("expected sdist to contain exactly one top-level directory");
    }
    Ok(entries.pop().unwrap().path())
}

/// The `[build-system]` table out of pyproject.toml, with PEP 518's
/// defaults when absent.
fn build_system_stanza(pyproject: &str) -> Result<BuildSystem> {
    let mut doc = pyproject.parse::<toml_edit::Document>()?;
    if let Some(table) = doc.remove("build-system") {
        Ok(toml_edit::de::from_item(table)?)
    } else {
        Ok(BuildSystem::default())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use indoc::indoc;

    #[test]
    fn test_build_system_stanza() {
        let parsed = build_system_stanza(indoc! {r#"
            [build-system]
            requires = ["hatchling >= 1.5"]
            build-backend = "hatchling.build"

            [project]
            name = "x"
        "#})
        .unwrap();
        assert_eq!(parsed.requires, vec!["hatchling >= 1.5"]);
        assert_eq!(parsed.build_backend, "hatchling.build");

        let defaulted = build_system_stanza("[project]\nname = \"x\"\n").unwrap();
        assert_eq!(defaulted.build_backend, "setuptools.build_meta:__legacy__");
        assert_eq!(defaulted.requires, vec!["setuptools", "wheel"]);
    }

    #[test]
    fn test_pick_best_wheel_prefers_more_specific_tag() {
        use crate::index::{ArtifactInfo, Source};
        fn ia(filename: &str) -> IndexedArtifact {
            IndexedArtifact {
                info: ArtifactInfo {
                    name: filename.parse().unwrap(),
                    url: format!("https://files.example.com/{filename}").parse().unwrap(),
                    hash: None,
                    requires_python: None,
                    core_metadata: Default::default(),
                    yanked: Default::default(),
                },
                source: Source::Index {
                    name: "pypi".into(),
                    url: "https://pypi.org/simple/".parse().unwrap(),
                },
            }
        }
        let artifacts = vec![
            ia("demo-1.0.tar.gz"),
            ia("demo-1.0-py3-none-any.whl"),
            ia("demo-1.0-cp311-cp311-manylinux_2_17_x86_64.whl"),
        ];
        let tags = vec![
            "cp311-cp311-manylinux_2_17_x86_64".to_string(),
            "py3-none-any".to_string(),
        ];
        let best = pick_best_wheel(&artifacts, &tags).unwrap();
        assert!(best.info.name.to_string().contains("manylinux"));

        // sdist-only listings have no best wheel
        let sdist_only = vec![ia("demo-1.0.tar.gz")];
        assert!(pick_best_wheel(&sdist_only, &tags).is_none());
    }
}
