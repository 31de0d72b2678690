use crate::prelude::*;

use crate::tree::{unpack_tar_gz_carefully, unpack_zip_carefully, CleanPath, WriteTree};
use std::cell::RefCell;
use zip::ZipArchive;

// The two artifact kinds we consume. Both wrap a seekable body -- possibly a
// cache file, possibly a LazyRemoteFile doing range requests under us.

pub struct Wheel {
    name: WheelName,
    z: RefCell<ZipArchive<Box<dyn ReadPlusSeek>>>,
}

pub struct Sdist {
    name: SdistName,
    body: RefCell<Box<dyn ReadPlusSeek>>,
}

fn read_zip_member<T: Read + Seek>(
    z: &mut ZipArchive<T>,
    member: &str,
) -> Result<Vec<u8>> {
    context!("extracting {member}");
    slurp(&mut z.by_name(member)?)
}

fn check_format_version(input: &[u8], version_field: &str) -> Result<HeaderBlock> {
    let input = std::str::from_utf8(input)?;
    let mut parsed = HeaderBlock::parse(input)?;
    let version = parsed.take_required(version_field)?;
    if !version.starts_with("1.") {
        bail!("unsupported {}: {:?}", version_field, version);
    }
    Ok(parsed)
}

/// The wheel internals everything else keys off of: where the .dist-info and
/// .data directories are, and whether unsuffixed files belong in purelib or
/// platlib.
pub struct WheelVitals {
    pub dist_info: String,
    pub data: String,
    pub root_is_purelib: bool,
    pub metadata_blob: Vec<u8>,
    pub metadata: CoreMetadata,
}

/// Pick out the single `{name}-{version}{suffix}` top-level directory from a
/// wheel listing, validating that the name and version match.
fn find_special_dir<'a, I, S>(
    names: I,
    name: &PackageName,
    version: &Version,
    suffix: &str,
) -> Result<Option<S>>
where
    I: IntoIterator<Item = S>,
    S: 'a + AsRef<str>,
{
    static SPECIAL_DIR_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^(.*)-(.*)\..*").unwrap());

    assert!(suffix.starts_with('.'));

    let mut candidates = names
        .into_iter()
        .filter(|n| n.as_ref().ends_with(suffix))
        .collect::<Vec<_>>();

    let candidate = match candidates.pop() {
        Some(c) => c,
        None => return Ok(None),
    };
    if !candidates.is_empty() {
        bail!("found multiple {suffix}/ directories in wheel");
    }
    let candidate_str = candidate.as_ref();
    context!("parsing wheel directory {candidate_str}");
    match SPECIAL_DIR_RE.captures(candidate_str) {
        None => bail!("invalid {suffix} name: couldn't find name/version"),
        Some(captures) => {
            let found_name: PackageName = captures.get(1).unwrap().as_str().try_into()?;
            if name != &found_name {
                bail!(
                    "wrong name in {candidate_str}: expected {}",
                    name.as_given()
                );
            }
            let found_version: Version = captures.get(2).unwrap().as_str().try_into()?;
            if version != &found_version {
                bail!("wrong version in {candidate_str}: expected {version}");
            }
            Ok(Some(candidate))
        }
    }
}

impl Wheel {
    pub fn new(name: WheelName, body: Box<dyn ReadPlusSeek>) -> Result<Wheel> {
        Ok(Wheel {
            name,
            z: RefCell::new(ZipArchive::new(body)?),
        })
    }

    pub fn name(&self) -> &WheelName {
        &self.name
    }

    /// Parse a bare METADATA blob (from the PEP 658 shortcut, or our
    /// metadata cache).
    pub fn parse_metadata(blob: &[u8]) -> Result<CoreMetadata> {
        blob.try_into()
    }

    pub fn vitals(&self) -> Result<WheelVitals> {
        let mut z = self.z.borrow_mut();

        let top_levels = z
            .file_names()
            .map(|n| match n.split_once(['/', '\\']) {
                Some((base, _)) => base,
                None => n,
            })
            .collect::<HashSet<_>>()
            .into_iter()
            .collect::<Vec<_>>();

        let dist_info = find_special_dir(
            &top_levels,
            &self.name.distribution,
            &self.name.version,
            ".dist-info",
        )?
        .ok_or(eyre!(".dist-info/ missing"))?
        .to_string();

        let data = match find_special_dir(
            &top_levels,
            &self.name.distribution,
            &self.name.version,
            ".data",
        )? {
            Some(d) => d.to_string(),
            // synthesize the name, so later stages have one less special case
            None => format!("{}.data", dist_info.strip_suffix(".dist-info").unwrap()),
        };
        drop(top_levels);

        let wheel_blob = read_zip_member(&mut z, &format!("{dist_info}/WHEEL"))?;
        let mut wheel_fields = check_format_version(&wheel_blob, "Wheel-Version")?;
        let root_is_purelib = match &wheel_fields.take_required("Root-Is-Purelib")?[..] {
            "true" => true,
            "false" => false,
            other => bail!("expected 'true' or 'false' for Root-Is-Purelib, not {other}"),
        };

        let metadata_blob = read_zip_member(&mut z, &format!("{dist_info}/METADATA"))?;
        let metadata: CoreMetadata = metadata_blob.as_slice().try_into()?;

        if metadata.name != self.name.distribution {
            bail!(
                "name mismatch between {dist_info}/METADATA and filename ({} != {})",
                metadata.name.as_given(),
                self.name.distribution.as_given()
            );
        }
        if metadata.version != self.name.version {
            bail!(
                "version mismatch between {dist_info}/METADATA and filename ({} != {})",
                metadata.version,
                self.name.version
            );
        }

        Ok(WheelVitals {
            // normalize through CleanPath so nothing dodgy survives
            dist_info: TryInto::<CleanPath>::try_into(dist_info.as_str())?.to_string(),
            data: TryInto::<CleanPath>::try_into(data.as_str())?.to_string(),
            root_is_purelib,
            metadata_blob,
            metadata,
        })
    }

    pub fn metadata(&self) -> Result<(Vec<u8>, CoreMetadata)> {
        context!("Reading metadata from {}", self.name);
        let WheelVitals {
            metadata_blob,
            metadata,
            ..
        } = self.vitals()?;
        Ok((metadata_blob, metadata))
    }

    pub fn read_dist_info_file(&self, filename: &str) -> Result<Option<Vec<u8>>> {
        let vitals = self.vitals()?;
        let mut z = self.z.borrow_mut();
        match read_zip_member(&mut z, &format!("{}/{}", vitals.dist_info, filename)) {
            Ok(blob) => Ok(Some(blob)),
            Err(_) => Ok(None),
        }
    }

    /// Spread the wheel's contents into their scheme locations. `layout`
    /// maps wheel file categories (purelib, platlib, scripts, data, ...) to
    /// directories relative to the destination root.
    pub fn unpack<W: WriteTree>(
        &self,
        layout: &HashMap<String, CleanPath>,
        dest: &mut W,
    ) -> Result<()> {
        context!("Unpacking {}", self.name);
        let vitals = self.vitals()?;
        let mut spreader = WheelSpreader {
            layout,
            dest,
            vitals: &vitals,
        };
        let mut z = self.z.borrow_mut();
        unpack_zip_carefully(&mut z, &mut spreader)
    }
}

/// Routes each wheel member to its scheme directory: `{data}/{category}/...`
/// members go to layout[category], everything else to purelib or platlib per
/// Root-Is-Purelib.
struct WheelSpreader<'a, W: WriteTree> {
    layout: &'a HashMap<String, CleanPath>,
    dest: &'a mut W,
    vitals: &'a WheelVitals,
}

impl<'a, W: WriteTree> WheelSpreader<'a, W> {
    fn route(&self, path: &CleanPath) -> Result<Option<CleanPath>> {
        // the wheel's own RECORD (and any stray INSTALLER) gets replaced by
        // the one the installer writes; unpacking it would just collide
        if path.parts().first() == Some(&self.vitals.dist_info) {
            if let Some(member) = path.parts().get(1) {
                if member == "RECORD" || member == "INSTALLER" {
                    return Ok(None);
                }
            }
        }
        let (category, rest) = if path.parts().first() == Some(&self.vitals.data) {
            match path.parts().get(1) {
                Some(category) => (category.as_str(), 2..),
                // the bare .data directory entry itself; drop it
                None => return Ok(None),
            }
        } else {
            (
                if self.vitals.root_is_purelib {
                    "purelib"
                } else {
                    "platlib"
                },
                0..,
            )
        };
        let base = self
            .layout
            .get(category)
            .ok_or_else(|| eyre!("unrecognized wheel file category {category}"))?;
        Ok(Some(base.join(&path.slice(rest))))
    }
}

impl<'a, W: WriteTree> WriteTree for WheelSpreader<'a, W> {
    fn mkdir(&mut self, path: &CleanPath) -> Result<()> {
        match self.route(path)? {
            Some(routed) => self.dest.mkdir(&routed),
            None => Ok(()),
        }
    }

    fn write_file(
        &mut self,
        path: &CleanPath,
        data: &mut dyn Read,
        executable: bool,
    ) -> Result<()> {
        match self.route(path)? {
            Some(routed) => self.dest.write_file(&routed, data, executable),
            None => Ok(()),
        }
    }

    fn write_symlink(&mut self, _symlink: &crate::tree::CleanSymlink) -> Result<()> {
        bail!("symlinks not supported in wheels");
    }
}

impl Sdist {
    pub fn new(name: SdistName, body: Box<dyn ReadPlusSeek>) -> Result<Sdist> {
        Ok(Sdist {
            name,
            body: RefCell::new(body),
        })
    }

    pub fn name(&self) -> &SdistName {
        &self.name
    }

    pub fn unpack<T: WriteTree>(&self, dest: &mut T) -> Result<()> {
        context!("Unpacking {}", self.name);
        let mut boxed = self.body.borrow_mut();
        let body = boxed.as_mut();
        body.rewind()?;
        match self.name.format {
            SdistFormat::Zip => unpack_zip_carefully(&mut ZipArchive::new(body)?, dest),
            SdistFormat::TarGz => unpack_tar_gz_carefully(body, dest),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::tree::WriteTreeFS;
    use std::io::Cursor;

    fn fake_wheel() -> Wheel {
        let mut buf = Vec::new();
        {
            let mut z = zip::ZipWriter::new(Cursor::new(&mut buf));
            let opts = zip::write::FileOptions::default();
            z.start_file("demo/__init__.py", opts).unwrap();
            z.write_all(b"# demo\n").unwrap();
            z.start_file("demo-1.0.dist-info/WHEEL", opts).unwrap();
            z.write_all(b"Wheel-Version: 1.0\nGenerator: test\nRoot-Is-Purelib: true\nTag: py3-none-any\n")
                .unwrap();
            z.start_file("demo-1.0.dist-info/METADATA", opts).unwrap();
            z.write_all(b"Metadata-Version: 2.1\nName: demo\nVersion: 1.0\nRequires-Dist: attrs\n")
                .unwrap();
            z.start_file("demo-1.0.data/scripts/demo-tool", opts).unwrap();
            z.write_all(b"#!python\nprint('hi')\n").unwrap();
            z.finish().unwrap();
        }
        let body: Box<dyn ReadPlusSeek> = Box::new(Cursor::new(buf));
        Wheel::new("demo-1.0-py3-none-any.whl".parse().unwrap(), body).unwrap()
    }

    #[test]
    fn test_wheel_vitals_and_metadata() {
        let wheel = fake_wheel();
        let vitals = wheel.vitals().unwrap();
        assert_eq!(vitals.dist_info, "demo-1.0.dist-info");
        assert_eq!(vitals.data, "demo-1.0.data");
        assert!(vitals.root_is_purelib);
        assert_eq!(vitals.metadata.name.canonical(), "demo");
        assert_eq!(vitals.metadata.requires_dist.len(), 1);
    }

    #[test]
    fn test_wheel_unpack_spreads_categories() {
        let wheel = fake_wheel();
        let tmp = tempfile::tempdir().unwrap();
        let mut tree = WriteTreeFS::new(tmp.path());
        let layout: HashMap<String, CleanPath> = [
            ("purelib".to_string(), "lib".try_into().unwrap()),
            ("platlib".to_string(), "lib".try_into().unwrap()),
            ("scripts".to_string(), "bin".try_into().unwrap()),
            ("data".to_string(), ".".try_into().unwrap()),
        ]
        .into_iter()
        .collect();
        wheel.unpack(&layout, &mut tree).unwrap();

        assert!(tmp.path().join("lib/demo/__init__.py").exists());
        assert!(tmp.path().join("lib/demo-1.0.dist-info/METADATA").exists());
        assert!(tmp.path().join("bin/demo-tool").exists());
    }

    #[test]
    fn test_wheel_name_mismatch_rejected() {
        let mut buf = Vec::new();
        {
            let mut z = zip::ZipWriter::new(Cursor::new(&mut buf));
            let opts = zip::write::FileOptions::default();
            z.start_file("other-1.0.dist-info/WHEEL", opts).unwrap();
            z.write_all(b"Wheel-Version: 1.0\nRoot-Is-Purelib: true\n").unwrap();
            z.start_file("other-1.0.dist-info/METADATA", opts).unwrap();
            z.write_all(b"Metadata-Version: 2.1\nName: other\nVersion: 1.0\n")
                .unwrap();
            z.finish().unwrap();
        }
        let body: Box<dyn ReadPlusSeek> = Box::new(Cursor::new(buf));
        let wheel = Wheel::new("demo-1.0-py3-none-any.whl".parse().unwrap(), body).unwrap();
        assert!(wheel.vitals().is_err());
    }

    #[test]
    fn test_sdist_unpack() {
        let mut tarball = Vec::new();
        {
            let enc = flate2::write::GzEncoder::new(
                &mut tarball,
                flate2::Compression::default(),
            );
            let mut builder = tar::Builder::new(enc);
            let data = b"[build-system]\n";
            let mut header = tar::Header::new_gnu();
            header.set_size(data.len() as u64);
            header.set_mode(0o644);
            header.set_cksum();
            builder
                .append_data(&mut header, "demo-1.0/pyproject.toml", &data[..])
                .unwrap();
            builder.into_inner().unwrap().finish().unwrap();
        }
        let body: Box<dyn ReadPlusSeek> = Box::new(Cursor::new(tarball));
        let sdist = Sdist::new("demo-1.0.tar.gz".parse().unwrap(), body).unwrap();
        let tmp = tempfile::tempdir().unwrap();
        let mut tree = WriteTreeFS::new(tmp.path());
        sdist.unpack(&mut tree).unwrap();
        assert!(tmp.path().join("demo-1.0/pyproject.toml").exists());
    }
}
