use crate::prelude::*;

use std::fs;
use std::path::Path;

// Path, URL, and VCS requirements each resolve to exactly one candidate
// whose version comes from the project's own metadata, rather than to a
// listing of versions. These helpers dig that metadata out of the various
// shapes a local dependency can take.

/// Static PEP 621 metadata out of a source tree's pyproject.toml. Trees that
/// declare their version or dependencies as dynamic would need a build
/// backend invocation, which we refuse here -- the build path handles them.
pub fn tree_metadata(tree: &Path) -> Result<CoreMetadata> {
    context!("Reading project metadata from {}", tree.display());
    let text = fs::read_to_string(tree.join("pyproject.toml"))
        .wrap_err_with(|| format!("no pyproject.toml in {}", tree.display()))?;
    let doc = text.parse::<toml_edit::Document>()?;
    let project = doc
        .get("project")
        .ok_or_else(|| eyre!("pyproject.toml has no [project] table"))?;

    if let Some(dynamic) = project.get("dynamic").and_then(|i| i.as_array()) {
        let fields: Vec<&str> = dynamic.iter().filter_map(|v| v.as_str()).collect();
        if !fields.is_empty() {
            bail!(
                "project declares dynamic metadata ({}); a build is needed to resolve it",
                fields.join(", ")
            );
        }
    }

    let get_str = |key: &str| -> Result<&str> {
        project
            .get(key)
            .and_then(|i| i.as_str())
            .ok_or_else(|| eyre!("[project] is missing {:?}", key))
    };

    let name: PackageName = get_str("name")?.parse()?;
    let version: Version = get_str("version")?.parse()?;
    let requires_python: Specifiers = match project.get("requires-python") {
        Some(item) => item
            .as_str()
            .ok_or_else(|| eyre!("requires-python must be a string"))?
            .try_into()?,
        None => Specifiers::any(),
    };

    let mut requires_dist = Vec::new();
    if let Some(deps) = project.get("dependencies").and_then(|i| i.as_array()) {
        for dep in deps {
            let dep = dep
                .as_str()
                .ok_or_else(|| eyre!("dependencies entries must be strings"))?;
            requires_dist.push(Requirement::parse(dep, ParseExtra::NotAllowed)?);
        }
    }

    let mut extras = HashSet::new();
    if let Some(optional) = project
        .get("optional-dependencies")
        .and_then(|i| i.as_table_like())
    {
        for (extra_name, deps) in optional.iter() {
            let extra: Extra = extra_name.parse()?;
            let deps = deps
                .as_array()
                .ok_or_else(|| eyre!("optional-dependencies entries must be arrays"))?;
            for dep in deps {
                let dep = dep
                    .as_str()
                    .ok_or_else(|| eyre!("dependency entries must be strings"))?;
                let mut req = Requirement::parse(dep, ParseExtra::NotAllowed)?;
                // model the extra the same way wheel metadata does, by
                // guarding the edge with an extra marker
                let guard = Marker::Atom {
                    op: marker::Op::Compare(CompareOp::Equal),
                    lhs: marker::Value::Variable("extra".into()),
                    rhs: marker::Value::Literal(extra.canonical().into()),
                };
                req.marker = Marker::and(req.marker.as_ref(), Some(&guard));
                requires_dist.push(req);
            }
            extras.insert(extra);
        }
    }

    Ok(CoreMetadata {
        metadata_version: "2.1".try_into().unwrap(),
        name,
        version,
        requires_dist,
        requires_python,
        extras,
    })
}

/// Metadata out of a wheel or sdist sitting on disk.
pub fn file_metadata(file: &Path) -> Result<(ArtifactName, CoreMetadata)> {
    let filename = file
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| eyre!("artifact path has no usable filename"))?;
    let name: ArtifactName = filename.try_into()?;
    let body: Box<dyn ReadPlusSeek> = Box::new(fs::File::open(file)?);
    match &name {
        ArtifactName::Wheel(wheel_name) => {
            let wheel = crate::db::Wheel::new(wheel_name.clone(), body)?;
            let (_, metadata) = wheel.metadata()?;
            Ok((name, metadata))
        }
        ArtifactName::Sdist(sdist_name) => {
            let metadata = sdist_pkg_info(sdist_name, body)?;
            Ok((name, metadata))
        }
    }
}

/// Pull PKG-INFO out of an sdist without unpacking the whole thing to disk.
fn sdist_pkg_info(
    name: &SdistName,
    mut body: Box<dyn ReadPlusSeek>,
) -> Result<CoreMetadata> {
    context!("Reading PKG-INFO from {name}");
    let is_pkg_info = |path: &str| -> bool {
        // exactly one directory deep: "{name}-{version}/PKG-INFO"
        matches!(path.split('/').collect::<Vec<_>>().as_slice(), [_, "PKG-INFO"])
    };
    match name.format {
        SdistFormat::Zip => {
            let mut z = zip::ZipArchive::new(body)?;
            let member = z
                .file_names()
                .find(|n| is_pkg_info(n))
                .map(String::from)
                .ok_or_else(|| eyre!("sdist has no PKG-INFO"))?;
            let blob = slurp(&mut z.by_name(&member)?)?;
            blob.as_slice().try_into()
        }
        SdistFormat::TarGz => {
            body.rewind()?;
            let ungz = flate2::read::MultiGzDecoder::new(body);
            let mut archive = tar::Archive::new(ungz);
            for entry in archive.entries()? {
                let mut entry = entry?;
                let path = entry.path()?;
                let Some(path_str) = path.to_str().map(String::from) else {
                    continue;
                };
                if is_pkg_info(&path_str) {
                    let blob = slurp(&mut entry)?;
                    return blob.as_slice().try_into();
                }
            }
            bail!("sdist has no PKG-INFO")
        }
    }
}
