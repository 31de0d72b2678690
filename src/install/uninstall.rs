use crate::prelude::*;

use std::fs;
use std::path::{Path, PathBuf};

use super::environment::{Environment, InstalledDistribution};

// Uninstalling is RECORD-driven: the RECORD written at install time is the
// authoritative list of what belongs to a distribution. Anything not listed
// there stays put (e.g. .pyc caches get cleaned up only when their directory
// empties out).

/// The files a distribution owns, as absolute paths, resolved from RECORD.
fn recorded_files(dist: &InstalledDistribution, site: &Path) -> Result<Vec<PathBuf>> {
    let record_path = dist.dist_info.join("RECORD");
    let text = fs::read_to_string(&record_path).map_err(|_| {
        SprigError::EnvironmentConflict {
            operation: "uninstall".into(),
            name: dist.name.as_given().to_owned(),
            reason: format!("missing or unreadable {}", record_path.display()),
        }
    })?;
    let mut files = Vec::new();
    for line in text.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        // path,hash,size -- but the path itself may contain commas when
        // quoted; installed files we write never do, and for foreign RECORDs
        // the simple split is what pip itself did for a decade
        let path = match line.split_once(',') {
            Some((path, _)) => path,
            None => line,
        };
        let path = path.trim_matches('"');
        files.push(site.join(path));
    }
    Ok(files)
}

/// Copy a distribution's files to a staging directory so a failed update can
/// put them back. Returns the backup root.
pub struct Backup {
    root: tempfile::TempDir,
    entries: Vec<(PathBuf, PathBuf)>,
}

pub fn backup(dist: &InstalledDistribution, env: &Environment) -> Result<Backup> {
    context!("Backing up {} {}", dist.name.as_given(), dist.version);
    let site = env.site_packages();
    let root = tempfile::tempdir()?;
    let mut entries = Vec::new();
    for (i, file) in recorded_files(dist, &site)?.into_iter().enumerate() {
        if !file.exists() {
            continue;
        }
        let staged = root.path().join(i.to_string());
        fs::copy(&file, &staged)?;
        entries.push((file, staged));
    }
    Ok(Backup { root, entries })
}

impl Backup {
    /// Put everything back where it came from.
    pub fn restore(self) -> Result<()> {
        for (original, staged) in &self.entries {
            if let Some(parent) = original.parent() {
                fs::create_dir_all(parent)?;
            }
            fs::copy(staged, original)?;
        }
        drop(self.root);
        Ok(())
    }
}

/// Remove a distribution: delete every RECORD-listed file, prune emptied
/// directories, and drop the .dist-info directory itself.
pub fn uninstall(dist: &InstalledDistribution, env: &Environment) -> Result<()> {
    context!("Removing {} {}", dist.name.as_given(), dist.version);
    let site = env.site_packages();
    let files = recorded_files(dist, &site)?;

    let mut parents: Vec<PathBuf> = Vec::new();
    for file in &files {
        match fs::remove_file(file) {
            Ok(()) => (),
            Err(ref e) if e.kind() == std::io::ErrorKind::NotFound => (),
            Err(e) => {
                return Err(SprigError::EnvironmentConflict {
                    operation: "uninstall".into(),
                    name: dist.name.as_given().to_owned(),
                    reason: format!("can't remove {}: {}", file.display(), e),
                }
                .into())
            }
        }
        if let Some(parent) = file.parent() {
            if !parents.iter().any(|p| p == parent) {
                parents.push(parent.to_path_buf());
            }
        }
    }

    // prune now-empty directories, deepest first, never going above the
    // environment prefix
    parents.sort_by_key(|p| std::cmp::Reverse(p.components().count()));
    for parent in parents {
        let mut dir = parent.as_path();
        while dir.starts_with(&env.prefix) && dir != env.prefix {
            match fs::remove_dir(dir) {
                Ok(()) => (),
                // not empty, or already gone: either way, stop walking up
                Err(_) => break,
            }
            dir = match dir.parent() {
                Some(parent) => parent,
                None => break,
            };
        }
    }

    if dist.dist_info.exists() {
        fs::remove_dir_all(&dist.dist_info)?;
    }
    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::tree::CleanPath;

    fn fake_env(prefix: &Path) -> Environment {
        let layout: HashMap<String, CleanPath> = [
            ("purelib".to_string(), "site".try_into().unwrap()),
            ("platlib".to_string(), "site".try_into().unwrap()),
            ("scripts".to_string(), "bin".try_into().unwrap()),
            ("data".to_string(), ".".try_into().unwrap()),
        ]
        .into_iter()
        .collect();
        Environment {
            interpreter: prefix.join("bin/python"),
            markers: Default::default(),
            tags: vec![],
            prefix: prefix.into(),
            layout,
        }
    }

    fn install_fake_dist(prefix: &Path) -> InstalledDistribution {
        let site = prefix.join("site");
        fs::create_dir_all(site.join("demo")).unwrap();
        fs::create_dir_all(site.join("demo-1.0.dist-info")).unwrap();
        fs::create_dir_all(prefix.join("bin")).unwrap();
        fs::write(site.join("demo/__init__.py"), b"x = 1\n").unwrap();
        fs::write(prefix.join("bin/demo-tool"), b"#!python\n").unwrap();
        fs::write(
            site.join("demo-1.0.dist-info/RECORD"),
            "demo/__init__.py,sha256=xxx,6\n../bin/demo-tool,sha256=yyy,9\ndemo-1.0.dist-info/RECORD,,\n",
        )
        .unwrap();
        InstalledDistribution {
            name: "demo".parse().unwrap(),
            version: "1.0".parse().unwrap(),
            dist_info: site.join("demo-1.0.dist-info"),
        }
    }

    #[test]
    fn test_uninstall_removes_recorded_files_and_empty_dirs() {
        let tmp = tempfile::tempdir().unwrap();
        let env = fake_env(tmp.path());
        let dist = install_fake_dist(tmp.path());

        uninstall(&dist, &env).unwrap();

        assert!(!tmp.path().join("site/demo").exists());
        assert!(!tmp.path().join("site/demo-1.0.dist-info").exists());
        assert!(!tmp.path().join("bin/demo-tool").exists());
        // the environment prefix itself survives
        assert!(tmp.path().exists());
    }

    #[test]
    fn test_uninstall_without_record_is_a_conflict() {
        let tmp = tempfile::tempdir().unwrap();
        let env = fake_env(tmp.path());
        let site = tmp.path().join("site");
        fs::create_dir_all(site.join("ghost-1.0.dist-info")).unwrap();
        let dist = InstalledDistribution {
            name: "ghost".parse().unwrap(),
            version: "1.0".parse().unwrap(),
            dist_info: site.join("ghost-1.0.dist-info"),
        };
        let err = uninstall(&dist, &env).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<SprigError>(),
            Some(SprigError::EnvironmentConflict { .. })
        ));
    }

    #[test]
    fn test_backup_restores_after_failed_update() {
        let tmp = tempfile::tempdir().unwrap();
        let env = fake_env(tmp.path());
        let dist = install_fake_dist(tmp.path());

        let backup = backup(&dist, &env).unwrap();
        uninstall(&dist, &env).unwrap();
        assert!(!tmp.path().join("site/demo/__init__.py").exists());

        backup.restore().unwrap();
        assert_eq!(
            fs::read(tmp.path().join("site/demo/__init__.py")).unwrap(),
            b"x = 1\n"
        );
        assert_eq!(
            fs::read(tmp.path().join("bin/demo-tool")).unwrap(),
            b"#!python\n"
        );
    }
}
