use crate::prelude::*;

use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;

use crate::tree::CleanPath;

const PROBE_PY: &str = include_str!("probe.py");

/// An installed distribution as discovered in site-packages.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstalledDistribution {
    pub name: PackageName,
    pub version: Version,
    /// absolute path of the .dist-info directory
    pub dist_info: PathBuf,
}

/// The installed-packages view of an environment. Probed once before
/// planning; the executor owns the only mutable copy while it runs.
#[derive(Debug, Clone, Default)]
pub struct Snapshot {
    pub installed: BTreeMap<PackageName, InstalledDistribution>,
}

impl Snapshot {
    pub fn get(&self, name: &PackageName) -> Option<&InstalledDistribution> {
        self.installed.get(name)
    }

    pub fn record(&mut self, dist: InstalledDistribution) {
        self.installed.insert(dist.name.clone(), dist);
    }

    pub fn forget(&mut self, name: &PackageName) {
        self.installed.remove(name);
    }
}

/// Everything the planner and executor need to know about the target
/// environment. Probed from the interpreter itself, so it's right even for
/// venvs, frameworks builds, and other creative layouts.
#[derive(Debug, Clone)]
pub struct Environment {
    pub interpreter: PathBuf,
    /// environment marker valuation, per PEP 508
    pub markers: HashMap<String, String>,
    /// compatible wheel tags, best first
    pub tags: Vec<String>,
    /// environment root; scheme paths below are relative to it
    pub prefix: PathBuf,
    /// wheel category -> directory under prefix (purelib, platlib, scripts,
    /// data, headers)
    pub layout: HashMap<String, CleanPath>,
}

#[derive(Deserialize)]
struct ProbeReport {
    markers: HashMap<String, String>,
    tags: Vec<String>,
    prefix: String,
    paths: HashMap<String, String>,
}

impl Environment {
    /// Ask the interpreter about itself.
    pub fn probe(interpreter: &Path) -> Result<Environment> {
        context!("Probing environment {}", interpreter.display());
        let output = Command::new(interpreter)
            .arg("-I")
            .arg("-c")
            .arg(PROBE_PY)
            .output()
            .wrap_err_with(|| format!("running {}", interpreter.display()))?;
        if !output.status.success() {
            bail!(
                "environment probe failed: {}",
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }
        let report: ProbeReport = serde_json::from_slice(&output.stdout)
            .wrap_err("parsing environment probe output")?;
        Environment::from_probe(interpreter.into(), report)
    }

    fn from_probe(interpreter: PathBuf, report: ProbeReport) -> Result<Environment> {
        let prefix = PathBuf::from(&report.prefix);
        let mut layout = HashMap::new();
        for (category, path) in &report.paths {
            let relative = Path::new(path)
                .strip_prefix(&prefix)
                .wrap_err_with(|| format!("{} path {} is outside the prefix", category, path))?;
            let relative = relative.to_str().ok_or_else(|| {
                eyre!("non-utf8 scheme path {}", relative.display())
            })?;
            let clean: CleanPath = if relative.is_empty() {
                ".".try_into()?
            } else {
                relative.try_into()?
            };
            layout.insert(category.clone(), clean);
        }
        for required in ["purelib", "platlib", "scripts", "data"] {
            if !layout.contains_key(required) {
                bail!("environment probe reported no {} path", required);
            }
        }
        Ok(Environment {
            interpreter,
            markers: report.markers,
            tags: report.tags,
            prefix,
            layout,
        })
    }

    pub fn python_full_version(&self) -> Result<Version> {
        self.markers
            .get("python_full_version")
            .ok_or_else(|| eyre!("probe reported no python_full_version"))?
            .as_str()
            .try_into()
    }

    pub fn site_packages(&self) -> PathBuf {
        self.prefix.join(self.layout["purelib"].to_native())
    }

    pub fn scripts_dir(&self) -> PathBuf {
        self.prefix.join(self.layout["scripts"].to_native())
    }

    /// Scan site-packages for installed distributions.
    pub fn snapshot(&self) -> Result<Snapshot> {
        let mut snapshot = Snapshot::default();
        let site = self.site_packages();
        let entries = match fs::read_dir(&site) {
            Ok(entries) => entries,
            Err(ref e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Ok(snapshot)
            }
            Err(e) => return Err(e).wrap_err("scanning site-packages"),
        };
        for entry in entries {
            let entry = entry?;
            let Some(dirname) = entry.file_name().to_str().map(String::from) else {
                continue;
            };
            let Some(stem) = dirname.strip_suffix(".dist-info") else {
                continue;
            };
            // {name}-{version}.dist-info
            let Some((name, version)) = stem.split_once('-') else {
                warn!("ignoring malformed dist-info directory {}", dirname);
                continue;
            };
            let (Ok(name), Ok(version)) = (
                PackageName::try_from(name),
                Version::try_from(version),
            ) else {
                warn!("ignoring malformed dist-info directory {}", dirname);
                continue;
            };
            snapshot.record(InstalledDistribution {
                name,
                version,
                dist_info: entry.path(),
            });
        }
        Ok(snapshot)
    }

    /// Byte-compile freshly installed files, best effort.
    pub fn compile_pyc(&self, paths: &[PathBuf]) -> Result<()> {
        if paths.is_empty() {
            return Ok(());
        }
        context!("Byte-compiling {} files", paths.len());
        let mut cmd = Command::new(&self.interpreter);
        cmd.args(["-m", "compileall", "-q"]);
        for path in paths {
            cmd.arg(path);
        }
        let status = cmd.status()?;
        if !status.success() {
            // source files with syntax errors are common enough that this is
            // a warning, not a failure
            warn!("byte-compilation exited with {}", status);
        }
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn fake_report(prefix: &str) -> ProbeReport {
        ProbeReport {
            markers: [
                ("python_full_version", "3.11.2"),
                ("python_version", "3.11"),
                ("sys_platform", "linux"),
            ]
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect(),
            tags: vec!["cp311-cp311-manylinux_2_17_x86_64".into(), "py3-none-any".into()],
            prefix: prefix.into(),
            paths: [
                ("purelib", format!("{prefix}/lib/python3.11/site-packages")),
                ("platlib", format!("{prefix}/lib/python3.11/site-packages")),
                ("scripts", format!("{prefix}/bin")),
                ("data", prefix.to_string()),
            ]
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect(),
        }
    }

    #[test]
    fn test_layout_relativized_to_prefix() {
        let env =
            Environment::from_probe("/venv/bin/python".into(), fake_report("/venv"))
                .unwrap();
        assert_eq!(
            env.site_packages(),
            PathBuf::from("/venv/lib/python3.11/site-packages")
        );
        assert_eq!(env.scripts_dir(), PathBuf::from("/venv/bin"));
        assert_eq!(env.layout["data"].to_string(), ".");
        assert_eq!(env.python_full_version().unwrap().to_string(), "3.11.2");
    }

    #[test]
    fn test_snapshot_scans_dist_info() -> Result<()> {
        let tmp = tempfile::tempdir()?;
        let prefix = tmp.path().to_str().unwrap().to_string();
        let site = tmp.path().join("lib/python3.11/site-packages");
        fs::create_dir_all(site.join("attrs-22.2.0.dist-info"))?;
        fs::create_dir_all(site.join("charset_normalizer-3.0.1.dist-info"))?;
        fs::create_dir_all(site.join("not-a-dist"))?;
        fs::create_dir_all(tmp.path().join("bin"))?;

        let env =
            Environment::from_probe("/x/python".into(), fake_report(&prefix)).unwrap();
        let snapshot = env.snapshot()?;
        assert_eq!(snapshot.installed.len(), 2);
        let attrs = snapshot.get(&"attrs".parse().unwrap()).unwrap();
        assert_eq!(attrs.version.to_string(), "22.2.0");
        assert!(snapshot.get(&"charset-normalizer".parse().unwrap()).is_some());
        Ok(())
    }
}
