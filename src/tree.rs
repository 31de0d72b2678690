use crate::prelude::*;
use auto_impl::auto_impl;
use std::fs;
use std::io;
#[cfg(unix)]
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};
use std::slice::SliceIndex;
use typed_path::unix::UnixComponent;
use typed_path::UnixPath;
use zip::ZipArchive;

// Paths that came out of an archive someone else built. CleanPath guarantees:
// relative, confined to the unpack root, normalized, made of components that
// are legal filenames on Windows/macOS/Linux, valid utf-8. (Windows device
// names like CON and LPT1 still slip through; so far nobody has shipped one
// in a wheel.)
#[derive(Debug, PartialEq, Eq, Clone, DeserializeFromStr, SerializeDisplay)]
pub struct CleanPath {
    parts: Vec<String>,
}

// https://learn.microsoft.com/en-us/windows/win32/fileio/naming-a-file
const NAUGHTY_CHARS: &[char] = &['<', '>', ':', '"', '/', '\\', '|', '?', '*'];

fn check_component(component: &[u8]) -> Result<&str> {
    let component = std::str::from_utf8(component)?;
    if component.is_empty() {
        bail!("path components must be non-empty");
    }
    if component.contains(NAUGHTY_CHARS)
        || component.contains(|c: char| c.is_ascii_control())
    {
        bail!("invalid or non-portable characters in path component {component:?}");
    }
    if component.ends_with('.') || component.ends_with(' ') {
        bail!("invalid or non-portable path component {component:?}");
    }
    Ok(component)
}

impl CleanPath {
    pub fn depth(&self) -> usize {
        self.parts.len()
    }

    pub fn to_native(&self) -> PathBuf {
        self.into()
    }

    pub fn starts_with(&self, prefix: &CleanPath) -> bool {
        self.parts.starts_with(&prefix.parts)
    }

    pub fn join(&self, other: &CleanPath) -> CleanPath {
        let mut parts = self.parts.clone();
        parts.extend(other.parts.iter().cloned());
        CleanPath { parts }
    }

    pub fn parts(&self) -> &[String] {
        &self.parts
    }

    pub fn slice<I>(&self, index: I) -> CleanPath
    where
        I: SliceIndex<[String], Output = [String]>,
    {
        CleanPath {
            parts: self.parts[index].into(),
        }
    }
}

impl Display for CleanPath {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.parts.is_empty() {
            write!(f, ".")
        } else {
            write!(f, "{}", self.parts.join("/"))
        }
    }
}

impl TryFrom<&UnixPath> for CleanPath {
    type Error = eyre::Report;

    fn try_from(value: &UnixPath) -> Result<Self> {
        context!("validating path {}", value.display());
        let mut new = CleanPath { parts: vec![] };
        for c in value.components() {
            match c {
                UnixComponent::RootDir => bail!("expected relative path"),
                UnixComponent::CurDir => (),
                UnixComponent::ParentDir => {
                    if new.parts.pop().is_none() {
                        bail!("path escapes parent directory");
                    }
                }
                UnixComponent::Normal(component) => {
                    new.parts.push(check_component(component)?.into());
                }
            }
        }
        Ok(new)
    }
}

impl TryFrom<&[u8]> for CleanPath {
    type Error = eyre::Report;

    fn try_from(value: &[u8]) -> Result<Self> {
        UnixPath::new(value).try_into()
    }
}

impl TryFrom<&str> for CleanPath {
    type Error = eyre::Report;

    fn try_from(value: &str) -> Result<Self> {
        value.as_bytes().try_into()
    }
}

try_from_str_boilerplate!(CleanPath);

impl From<&CleanPath> for PathBuf {
    fn from(value: &CleanPath) -> Self {
        value.to_string().into()
    }
}

/// A validated symlink: source path plus a target that provably stays inside
/// the unpack root once resolved.
#[derive(Debug)]
pub struct CleanSymlink {
    pub source: CleanPath,
    pub target: String,
}

impl CleanSymlink {
    pub fn new(source: &CleanPath, target_bytes: &[u8]) -> Result<CleanSymlink> {
        context!(
            "validating symlink {} -> {}",
            source,
            String::from_utf8_lossy(target_bytes)
        );
        if source.parts.is_empty() {
            bail!("symlink source can't be '.'");
        }
        let mut sanitized = Vec::<String>::new();
        // Count the '..'s in the target: symlinks resolve against the
        // source's parent directory, so the target gets one level "for free".
        let mut dotdots = 1usize;
        for c in UnixPath::new(target_bytes).components() {
            match c {
                UnixComponent::RootDir => bail!("symlink target must be a relative path"),
                UnixComponent::CurDir => (),
                UnixComponent::ParentDir => match sanitized.last().map(|s| s.as_str()) {
                    None | Some("..") => {
                        sanitized.push("..".into());
                        dotdots =
                            dotdots.checked_add(1).ok_or(eyre!("too many '..'s"))?;
                    }
                    Some(_) => {
                        sanitized.pop();
                    }
                },
                UnixComponent::Normal(component) => {
                    sanitized.push(check_component(component)?.into());
                }
            }
        }
        if source.depth() < dotdots {
            bail!("symlink escapes confinement");
        }
        let target = if sanitized.is_empty() {
            ".".into()
        } else {
            sanitized.join("/")
        };
        Ok(CleanSymlink {
            source: source.clone(),
            target,
        })
    }
}

#[auto_impl(&mut)]
pub trait WriteTree {
    fn mkdir(&mut self, path: &CleanPath) -> Result<()>;
    fn write_file(
        &mut self,
        path: &CleanPath,
        data: &mut dyn Read,
        executable: bool,
    ) -> Result<()>;
    fn write_symlink(&mut self, symlink: &CleanSymlink) -> Result<()>;
}

pub struct WriteTreeFS {
    root: PathBuf,
    /// paths written, in order, for RECORD generation
    written: Vec<CleanPath>,
}

impl WriteTreeFS {
    pub fn new<T: AsRef<Path>>(root: T) -> WriteTreeFS {
        WriteTreeFS {
            root: root.as_ref().into(),
            written: Vec::new(),
        }
    }

    pub fn written(&self) -> &[CleanPath] {
        &self.written
    }

    fn full_path(&self, path: &CleanPath) -> Result<PathBuf> {
        let full_path = self.root.join(path.to_native());
        if let Some(parent) = full_path.parent() {
            fs::create_dir_all(parent)?;
        }
        Ok(full_path)
    }
}

impl WriteTree for WriteTreeFS {
    fn mkdir(&mut self, path: &CleanPath) -> Result<()> {
        context!("Creating {path}/");
        match fs::create_dir(self.full_path(path)?) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == io::ErrorKind::AlreadyExists => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    fn write_file(
        &mut self,
        path: &CleanPath,
        data: &mut dyn Read,
        executable: bool,
    ) -> Result<()> {
        context!("Writing out {path}");
        let mut options = fs::OpenOptions::new();
        options.write(true).create_new(true);
        #[cfg(unix)]
        if executable {
            options.mode(0o777);
        } else {
            options.mode(0o666);
        }
        let mut file = options.open(self.full_path(path)?)?;
        io::copy(data, &mut file)?;
        self.written.push(path.clone());
        Ok(())
    }

    fn write_symlink(&mut self, symlink: &CleanSymlink) -> Result<()> {
        context!("Symlinking {} -> {}", symlink.source, symlink.target);
        #[cfg(unix)]
        {
            std::os::unix::fs::symlink(
                &symlink.target,
                self.full_path(&symlink.source)?,
            )?;
            self.written.push(symlink.source.clone());
            Ok(())
        }
        #[cfg(not(unix))]
        {
            bail!("symlinks not supported on this platform");
        }
    }
}

pub fn unpack_zip_carefully<T: Read + Seek, W: WriteTree>(
    z: &mut ZipArchive<T>,
    dest: &mut W,
) -> Result<()> {
    // symlinks get deferred to a batch at the end
    let mut symlinks = Vec::<CleanSymlink>::new();
    for i in 0..z.len() {
        let mut zip_file = z.by_index(i)?;
        context!("Unpacking zip member {}", zip_file.name());
        if let Some(mode) = zip_file.unix_mode() {
            if mode & 0xf000 == 0xa000 {
                // it's a symlink
                symlinks.push(CleanSymlink::new(
                    &zip_file.name().try_into()?,
                    slurp(&mut zip_file)?.as_slice(),
                )?);
                continue;
            }
        }
        let path: CleanPath = zip_file.name().try_into()?;
        if zip_file.is_dir() {
            dest.mkdir(&path)?;
        } else {
            let executable = zip_file
                .unix_mode()
                .map(|mode| mode & 0o111 != 0)
                .unwrap_or(false);
            dest.write_file(&path, &mut zip_file, executable)?;
        }
    }

    // Longest-first, so nothing can make foo/ -> elsewhere a symlink and
    // then sneak foo/bar through it.
    symlinks.sort_unstable_by_key(|symlink| symlink.source.depth());
    for symlink in symlinks.into_iter().rev() {
        dest.write_symlink(&symlink)?;
    }

    Ok(())
}

pub fn unpack_tar_gz_carefully<T: Read, W: WriteTree>(
    body: T,
    dest: &mut W,
) -> Result<()> {
    let ungz = flate2::read::MultiGzDecoder::new(body);
    let mut archive = tar::Archive::new(ungz);
    for entry in archive.entries()? {
        let mut entry = entry?;
        let path_bytes = entry.path_bytes();
        let path: CleanPath = (path_bytes.as_ref() as &[u8]).try_into()?;
        let kind = entry.header().entry_type();
        let is_executable = entry.header().mode()? & 0o100 != 0;
        use tar::EntryType::*;
        match kind {
            // We could support symlinks here like we do for zips, but sdists
            // in the wild don't use them; wait for someone to need it.
            Symlink | Link | Char | Block | Fifo => {
                bail!("archive entry {} has unsupported type {:?}", path, kind)
            }
            Directory => dest.mkdir(&path)?,
            GNULongName | GNULongLink | GNUSparse | XGlobalHeader | XHeader => (),
            _ => {
                dest.write_file(&path, &mut entry, is_executable)?;
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_clean_path_rejects_escapes() {
        for bad in [
            "foo/../../bar",
            "../foo",
            "/nope",
            "c:\\bad",
            "not\\good",
            "what\x00",
            "trailing. ",
        ] {
            assert!(
                TryInto::<CleanPath>::try_into(bad).is_err(),
                "{:?} should be rejected",
                bad
            );
        }
    }

    #[test]
    fn test_clean_path_normalizes() {
        for (input, normed) in [
            ("foo/bar/baz/", "foo/bar/baz"),
            ("foo/.././//baz", "baz"),
            (".///.", "."),
        ] {
            assert_eq!(
                TryInto::<CleanPath>::try_into(input).unwrap().to_string(),
                normed
            );
        }
    }

    #[test]
    fn test_symlink_confinement() {
        for (source, target) in [
            ("foo", ".."),
            ("foo/bar", "../../more/segments/here"),
            ("foo/bar/", "../../nope"),
            ("foo", "/etc/shadow"),
        ] {
            assert!(
                CleanSymlink::new(&source.try_into().unwrap(), target.as_bytes())
                    .is_err(),
                "{} -> {} should be rejected",
                source,
                target
            );
        }
        for (source, target, normalized) in [
            ("foo/bar", "..", ".."),
            ("foo", "./baz/bar", "baz/bar"),
            (
                "foo/bar/baz",
                "something/../../..//./stuff/../thing",
                "../../thing",
            ),
        ] {
            let symlink =
                CleanSymlink::new(&source.try_into().unwrap(), target.as_bytes())
                    .unwrap();
            assert_eq!(symlink.target, normalized);
        }
    }

    #[test]
    fn test_write_tree_fs_records_written_files() -> Result<()> {
        let tmp = tempfile::tempdir()?;
        let mut tree = WriteTreeFS::new(tmp.path());
        tree.write_file(&"pkg/__init__.py".try_into()?, &mut &b"code"[..], false)?;
        tree.mkdir(&"pkg/sub".try_into()?)?;
        tree.write_file(&"pkg/sub/mod.py".try_into()?, &mut &b"more"[..], false)?;
        assert_eq!(
            tree.written()
                .iter()
                .map(|p| p.to_string())
                .collect::<Vec<_>>(),
            vec!["pkg/__init__.py", "pkg/sub/mod.py"]
        );
        assert_eq!(fs::read(tmp.path().join("pkg/sub/mod.py"))?, b"more");
        Ok(())
    }
}
