use crate::prelude::*;

use std::fs;
use std::path::PathBuf;

use super::environment::{Environment, InstalledDistribution};
use crate::db::Wheel;
use crate::tree::{CleanPath, WriteTree, WriteTreeFS};

// Unpacking a wheel is the easy half; the other half is the bookkeeping
// that makes the install a first-class citizen of the environment: console
// scripts from entry_points.txt, an INSTALLER stamp, and a RECORD listing
// every file so a later uninstall knows exactly what to take back out.

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entrypoint {
    pub name: String,
    pub module: String,
    pub object: Option<String>,
}

/// Parse the INI-shaped entry_points.txt. We only care about the
/// console_scripts and gui_scripts sections.
pub fn parse_entry_points(text: &str) -> Result<HashMap<String, Vec<Entrypoint>>> {
    let mut sections: HashMap<String, Vec<Entrypoint>> = HashMap::new();
    let mut current: Option<String> = None;
    for raw_line in text.lines() {
        let line = match raw_line.split_once(|c| c == '#' || c == ';') {
            // comments start mid-line only after whitespace
            Some((before, _)) if before.ends_with(char::is_whitespace) || before.is_empty() => {
                before
            }
            _ => raw_line,
        }
        .trim();
        if line.is_empty() {
            continue;
        }
        if let Some(section) = line.strip_prefix('[').and_then(|l| l.strip_suffix(']')) {
            current = Some(section.trim().to_owned());
            continue;
        }
        let Some(section) = &current else {
            bail!("entry_points.txt has a value before any section");
        };
        let (name, target) = line
            .split_once('=')
            .ok_or_else(|| eyre!("malformed entry point line {:?}", line))?;
        // a trailing "[extras]" on the target is legal and irrelevant here
        let target = match target.split_once('[') {
            Some((before, _)) => before,
            None => target,
        };
        let (module, object) = match target.trim().split_once(':') {
            Some((module, object)) => (module.trim(), Some(object.trim().to_owned())),
            None => (target.trim(), None),
        };
        sections.entry(section.clone()).or_default().push(Entrypoint {
            name: name.trim().to_owned(),
            module: module.to_owned(),
            object,
        });
    }
    Ok(sections)
}

fn script_body(entry: &Entrypoint, interpreter: &str) -> String {
    let Entrypoint { module, object, .. } = entry;
    let suffix = match object {
        Some(object) => format!(".{object}"),
        None => String::new(),
    };
    indoc::formatdoc! {r###"
        #!{interpreter}
        # -*- coding: utf-8 -*-
        import sys
        import {module}
        if __name__ == "__main__":
            if sys.argv[0].endswith(".exe"):
                sys.argv[0] = sys.argv[0][:-4]
            sys.exit({module}{suffix}())
    "###}
}

/// RECORD-style hash: urlsafe base64 of the sha256, no padding.
fn record_hash(data: &[u8]) -> String {
    let digest = ring::digest::digest(&ring::digest::SHA256, data);
    format!(
        "sha256={}",
        data_encoding::BASE64URL_NOPAD.encode(digest.as_ref())
    )
}

/// Express `target` relative to `base` (both relative to the same root),
/// the way RECORD wants paths expressed relative to site-packages.
fn relative_to(base: &CleanPath, target: &CleanPath) -> String {
    let base_parts = base.parts();
    let target_parts = target.parts();
    let common = base_parts
        .iter()
        .zip(target_parts)
        .take_while(|(a, b)| a == b)
        .count();
    let mut pieces: Vec<String> = Vec::new();
    for _ in common..base_parts.len() {
        pieces.push("..".into());
    }
    pieces.extend(target_parts[common..].iter().cloned());
    pieces.join("/")
}

/// Unpack a wheel into the environment, generate its console scripts, and
/// stamp RECORD + INSTALLER. Returns the new installed-distribution entry
/// plus the absolute paths written (for optional byte-compilation).
pub fn install_wheel(
    env: &Environment,
    wheel: &Wheel,
) -> Result<(InstalledDistribution, Vec<PathBuf>)> {
    context!("Installing {}", wheel.name());
    let vitals = wheel.vitals()?;

    let mut tree = WriteTreeFS::new(&env.prefix);
    wheel.unpack(&env.layout, &mut tree)?;
    let mut written: Vec<CleanPath> = tree.written().to_vec();

    // console / gui scripts
    let interpreter = env.interpreter.to_string_lossy().into_owned();
    if let Some(blob) = wheel.read_dist_info_file("entry_points.txt")? {
        let entry_points = parse_entry_points(std::str::from_utf8(&blob)?)?;
        let mut tree = WriteTreeFS::new(&env.prefix);
        for section in ["console_scripts", "gui_scripts"] {
            let Some(entries) = entry_points.get(section) else {
                continue;
            };
            for entry in entries {
                let body = script_body(entry, &interpreter);
                let path = env.layout["scripts"].join(&entry.name.as_str().try_into()?);
                tree.write_file(&path, &mut body.as_bytes(), true)?;
            }
        }
        written.extend(tree.written().iter().cloned());
    }

    let site = &env.layout["purelib"];
    let dist_info = site.join(&vitals.dist_info.as_str().try_into()?);
    let installer_path = dist_info.join(&"INSTALLER".try_into()?);
    let record_path = dist_info.join(&"RECORD".try_into()?);

    {
        let mut tree = WriteTreeFS::new(&env.prefix);
        tree.write_file(&installer_path, &mut &b"sprig\n"[..], false)?;
    }
    written.push(installer_path);

    // RECORD lists every installed file with hash and size; itself with
    // neither (its own hash would be self-referential)
    let mut record = String::new();
    for path in &written {
        let data = fs::read(env.prefix.join(path.to_native()))?;
        record.push_str(&format!(
            "{},{},{}\n",
            relative_to(site, path),
            record_hash(&data),
            data.len()
        ));
    }
    record.push_str(&format!("{},,\n", relative_to(site, &record_path)));

    let mut tree = WriteTreeFS::new(&env.prefix);
    tree.write_file(&record_path, &mut record.as_bytes(), false)?;
    written.push(record_path);

    let absolute: Vec<PathBuf> = written
        .iter()
        .map(|p| env.prefix.join(p.to_native()))
        .collect();

    Ok((
        InstalledDistribution {
            name: wheel.name().distribution.clone(),
            version: wheel.name().version.clone(),
            dist_info: env.prefix.join(dist_info.to_native()),
        },
        absolute,
    ))
}

/// Develop (editable) install of a source tree: a .pth file pointing at the
/// tree, plus a minimal .dist-info so the environment snapshot sees it.
pub fn install_develop(
    env: &Environment,
    name: &PackageName,
    version: &Version,
    tree: &std::path::Path,
) -> Result<(InstalledDistribution, Vec<PathBuf>)> {
    context!("Installing {} {} in develop mode", name.as_given(), version);
    let site = &env.layout["purelib"];
    let pth = site.join(
        &format!("__editable__.{}.pth", name.canonical())
            .as_str()
            .try_into()?,
    );
    let dist_info = site.join(
        &format!("{}-{}.dist-info", name.canonical(), version)
            .as_str()
            .try_into()?,
    );
    let metadata_path = dist_info.join(&"METADATA".try_into()?);
    let installer_path = dist_info.join(&"INSTALLER".try_into()?);
    let record_path = dist_info.join(&"RECORD".try_into()?);

    let tree_line = format!("{}\n", tree.display());
    let metadata = format!(
        "Metadata-Version: 2.1\nName: {}\nVersion: {}\n",
        name.as_given(),
        version
    );

    let mut writer = WriteTreeFS::new(&env.prefix);
    writer.write_file(&pth, &mut tree_line.as_bytes(), false)?;
    writer.write_file(&metadata_path, &mut metadata.as_bytes(), false)?;
    writer.write_file(&installer_path, &mut &b"sprig\n"[..], false)?;

    let mut record = String::new();
    for path in [&pth, &metadata_path, &installer_path] {
        let data = fs::read(env.prefix.join(path.to_native()))?;
        record.push_str(&format!(
            "{},{},{}\n",
            relative_to(site, path),
            record_hash(&data),
            data.len()
        ));
    }
    record.push_str(&format!("{},,\n", relative_to(site, &record_path)));
    writer.write_file(&record_path, &mut record.as_bytes(), false)?;

    let written = [&pth, &metadata_path, &installer_path, &record_path]
        .iter()
        .map(|p| env.prefix.join(p.to_native()))
        .collect();
    Ok((
        InstalledDistribution {
            name: name.clone(),
            version: version.clone(),
            dist_info: env.prefix.join(dist_info.to_native()),
        },
        written,
    ))
}

#[cfg(test)]
mod test {
    use super::*;
    use indoc::indoc;

    #[test]
    fn test_parse_entry_points() {
        let parsed = parse_entry_points(indoc! {r#"
            [console_scripts]
            demo-tool = demo.cli:main
            plain = demo.other

            [gui_scripts]
            demo-gui = demo.gui:run [qt]
        "#})
        .unwrap();
        let console = &parsed["console_scripts"];
        assert_eq!(console.len(), 2);
        assert_eq!(console[0].name, "demo-tool");
        assert_eq!(console[0].module, "demo.cli");
        assert_eq!(console[0].object.as_deref(), Some("main"));
        assert_eq!(console[1].object, None);
        assert_eq!(parsed["gui_scripts"][0].module, "demo.gui");
    }

    #[test]
    fn test_parse_entry_points_rejects_orphan_values() {
        assert!(parse_entry_points("orphan = x\n").is_err());
    }

    #[test]
    fn test_script_body_shebang_and_target() {
        let body = script_body(
            &Entrypoint {
                name: "demo-tool".into(),
                module: "demo.cli".into(),
                object: Some("main".into()),
            },
            "/venv/bin/python",
        );
        assert!(body.starts_with("#!/venv/bin/python\n"));
        assert!(body.contains("sys.exit(demo.cli.main())"));
    }

    #[test]
    fn test_relative_to() {
        let site: CleanPath = "lib/python3.11/site-packages".try_into().unwrap();
        let in_site: CleanPath = "lib/python3.11/site-packages/demo/__init__.py"
            .try_into()
            .unwrap();
        let in_bin: CleanPath = "bin/demo-tool".try_into().unwrap();
        assert_eq!(relative_to(&site, &in_site), "demo/__init__.py");
        assert_eq!(relative_to(&site, &in_bin), "../../../bin/demo-tool");
    }

    #[test]
    fn test_record_hash_is_urlsafe_base64() {
        let hash = record_hash(b"");
        assert_eq!(hash, "sha256=47DEQpj8HBSa-_TImW-5JCeuQeRkm5NMpJWZG3hSuFU");
    }
}
