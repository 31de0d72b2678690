use crate::prelude::*;
use crate::util::retry_interrupted;
use auto_impl::auto_impl;
use fs2::FileExt;
use ring::digest;
use std::fs::{self, File};
use std::io::SeekFrom;
use std::marker::PhantomData;
use std::ops::Deref;
use std::path::{Path, PathBuf};

// On-disk key-value stores for blobs and directory trees. Used for the HTTP
// cache, the by-hash artifact store, the parsed-metadata cache, and the
// built-wheel cache.
//
// Every key gets a sibling .lock file. We take the lock for the duration of
// a lookup or mutation and then drop it; readers keep using their file
// descriptor afterwards, which is safe because writers replace the file via
// atomic rename rather than overwriting in place. (tempfile's persist() is a
// rename under the hood; on Unix that's atomic outright, on modern Windows
// MoveFileExW within one directory behaves the same way.)
//
// The lock also coalesces concurrent fills of the same key: whoever gets the
// lock first does the work, everyone else finds the entry populated when
// their turn comes.
//
// Directory entries can't be atomically replaced, so TreeStore only promises
// write-once semantics per key.

// Some filesystems don't cope well with one directory holding a zillion
// entries, so keys get dispersed over a shallow tree of subdirectories:
// ${BASE}/${CHAR}/${CHAR}/${REST}, giving a fanout of 64**2.
const DIR_FANOUT_DEPTH: usize = 2;

fn dispersed_path(bytes: &[u8]) -> PathBuf {
    let encoded = data_encoding::BASE64URL_NOPAD.encode(bytes);
    let mut path = PathBuf::new();
    for i in 0..DIR_FANOUT_DEPTH {
        path.push(&encoded[i..i + 1]);
    }
    path.push(&encoded[DIR_FANOUT_DEPTH..]);
    path
}

#[auto_impl(&)]
pub trait StoreKey {
    fn store_path(&self) -> PathBuf;
}

impl StoreKey for [u8] {
    fn store_path(&self) -> PathBuf {
        // arbitrary keys get scrambled into a fixed-length path
        let scrambled = digest::digest(&digest::SHA256, self);
        dispersed_path(scrambled.as_ref())
    }
}

impl StoreKey for ArtifactHash {
    fn store_path(&self) -> PathBuf {
        let mut path = PathBuf::from(&self.algorithm);
        path.push(dispersed_path(&self.digest));
        path
    }
}

enum LockMode {
    Create,
    IfExists,
}

fn take_lock(path: &Path, mode: LockMode) -> Result<File> {
    let mut lock_path = path.to_path_buf();
    // unwrap rationale: store paths always have a final component
    let mut basename = lock_path.file_name().unwrap().to_os_string();
    basename.push(".lock");
    lock_path.set_file_name(basename);
    let mut options = fs::OpenOptions::new();
    // Windows requires write mode to flock a file
    options.write(true);
    match mode {
        LockMode::Create => {
            let dir = lock_path.parent().unwrap();
            fs::create_dir_all(dir)
                .wrap_err_with(|| format!("creating {}", dir.display()))?;
            options.create(true);
        }
        LockMode::IfExists => {
            // leave create() off; open errors out if the entry was never made
        }
    }
    let lock = options.open(&lock_path)?;
    // fs2's lock_exclusive on Unix is a thin wrapper around flock(2), which
    // can fail with EINTR
    retry_interrupted(|| lock.lock_exclusive())?;
    Ok(lock)
}

/// Key -> blob store.
#[derive(Debug)]
pub struct BlobStore {
    base: PathBuf,
    staging: PathBuf,
}

impl BlobStore {
    pub fn new(base: &Path) -> Result<BlobStore> {
        let base = std::env::current_dir()?.join(base);
        let staging = base.join("tmp");
        fs::create_dir_all(&base)?;
        fs::create_dir_all(&staging)?;
        Ok(BlobStore { base, staging })
    }

    pub fn entry<K: StoreKey + ?Sized>(&self, key: &K) -> Result<BlobEntry> {
        let path = self.base.join(key.store_path());
        let lock = take_lock(&path, LockMode::Create)?;
        Ok(BlobEntry {
            staging: self.staging.clone(),
            _lock: lock,
            path,
        })
    }

    /// Like entry(), but doesn't create lock files for keys nobody ever
    /// wrote. Lets read-only probes stay cheap.
    pub fn entry_if_exists<K: StoreKey + ?Sized>(&self, key: &K) -> Option<BlobEntry> {
        let path = self.base.join(key.store_path());
        let lock = take_lock(&path, LockMode::IfExists).ok()?;
        Some(BlobEntry {
            staging: self.staging.clone(),
            _lock: lock,
            path,
        })
    }

    pub fn read<K: StoreKey + ?Sized>(&self, key: &K) -> Option<File> {
        self.entry_if_exists(key)?.reader().map(|r| r.detach())
    }

    pub fn read_or_fill<K, F>(&self, key: &K, fill: F) -> Result<File>
    where
        K: StoreKey + ?Sized,
        F: FnOnce(&mut dyn Write) -> Result<()>,
    {
        let entry = self.entry(key)?;
        if let Some(reader) = entry.reader() {
            Ok(reader.detach())
        } else {
            let mut writer = entry.begin()?;
            fill(&mut writer)?;
            Ok(writer.commit()?.detach())
        }
    }
}

pub struct BlobEntry {
    staging: PathBuf,
    _lock: File,
    path: PathBuf,
}

impl BlobEntry {
    pub fn reader(&self) -> Option<EntryReader<'_>> {
        Some(EntryReader {
            f: File::open(&self.path).ok()?,
            _lifetime: PhantomData,
        })
    }

    pub fn begin(&self) -> Result<EntryWriter<'_>> {
        Ok(EntryWriter {
            path: &self.path,
            f: tempfile::NamedTempFile::new_in(&self.staging)?,
            _lifetime: PhantomData,
        })
    }

    pub fn remove(self) -> Result<()> {
        fs::remove_file(self.path)?;
        Ok(())
    }
}

pub struct EntryReader<'a> {
    f: File,
    _lifetime: PhantomData<&'a ()>,
}

impl<'a> Read for EntryReader<'a> {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        self.f.read(buf)
    }
}

impl<'a> Seek for EntryReader<'a> {
    fn seek(&mut self, pos: SeekFrom) -> std::io::Result<u64> {
        self.f.seek(pos)
    }
}

impl<'a> EntryReader<'a> {
    /// Keep the file handle past the lifetime of the lock. Safe because
    /// writers replace rather than mutate.
    pub fn detach(self) -> File {
        self.f
    }
}

pub struct EntryWriter<'a> {
    path: &'a Path,
    f: tempfile::NamedTempFile,
    _lifetime: PhantomData<&'a ()>,
}

impl<'a> Write for EntryWriter<'a> {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.f.write(buf)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.f.flush()
    }
}

impl<'a> Seek for EntryWriter<'a> {
    fn seek(&mut self, pos: SeekFrom) -> std::io::Result<u64> {
        self.f.seek(pos)
    }
}

impl<'a> EntryWriter<'a> {
    pub fn commit(self) -> Result<EntryReader<'a>> {
        self.f.as_file().sync_data()?;
        let mut f = self.f.persist(self.path)?;
        f.rewind()?;
        Ok(EntryReader {
            f,
            _lifetime: PhantomData,
        })
    }
}

////////////////////////////////////////////////////////////////

/// Key -> directory-tree store (write-once per key).
pub struct TreeStore {
    base: PathBuf,
    staging: PathBuf,
}

impl TreeStore {
    pub fn new(base: &Path) -> Result<TreeStore> {
        let base = std::env::current_dir()?.join(base);
        let staging = base.join("tmp");
        fs::create_dir_all(&base)?;
        fs::create_dir_all(&staging)?;
        Ok(TreeStore { base, staging })
    }

    pub fn entry<K: StoreKey + ?Sized>(&self, key: &K) -> Result<TreeEntry> {
        let path = self.base.join(key.store_path());
        let lock = take_lock(&path, LockMode::Create)?;
        Ok(TreeEntry {
            staging: self.staging.clone(),
            _lock: lock,
            path,
        })
    }

    pub fn read_or_fill<K, F>(&self, key: &K, fill: F) -> Result<PathBuf>
    where
        K: StoreKey + ?Sized,
        F: FnOnce(&Path) -> Result<()>,
    {
        let entry = self.entry(key)?;
        if !entry.exists() {
            let staged = entry.stage()?;
            fill(staged.path())?;
            fs::rename(staged.into_path(), &*entry)?;
        }
        Ok(entry.path)
    }
}

pub struct TreeEntry {
    staging: PathBuf,
    _lock: File,
    path: PathBuf,
}

impl TreeEntry {
    pub fn exists(&self) -> bool {
        self.path.exists()
    }

    pub fn stage(&self) -> Result<tempfile::TempDir> {
        Ok(tempfile::tempdir_in(&self.staging)?)
    }
}

impl Deref for TreeEntry {
    type Target = Path;

    fn deref(&self) -> &Path {
        self.path.deref()
    }
}

impl AsRef<Path> for TreeEntry {
    fn as_ref(&self) -> &Path {
        &self.path
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_blob_store_fill_and_probe() -> Result<()> {
        let tmp = tempfile::tempdir()?;
        let store = BlobStore::new(tmp.path())?;

        let key = b"greeting".as_slice();
        let other = b"unwritten".as_slice();

        let mut got = store.read_or_fill(&key, |w| {
            w.write_all(b"hello")?;
            Ok(())
        })?;
        assert_eq!(slurp(&mut got)?, b"hello");

        // the fill closure doesn't run again for a populated key
        let mut got = store.read_or_fill(&key, |_| {
            panic!("should not refill");
        })?;
        assert_eq!(slurp(&mut got)?, b"hello");

        assert!(store.read(&other).is_none());
        assert!(store.entry_if_exists(&other).is_none());
        assert!(store.entry_if_exists(&key).is_some());
        Ok(())
    }

    #[test]
    fn test_blob_store_commit_readback() -> Result<()> {
        let tmp = tempfile::tempdir()?;
        let store = BlobStore::new(tmp.path())?;

        let entry = store.entry(&b"k".as_slice())?;
        assert!(entry.reader().is_none());
        let mut w = entry.begin()?;
        w.write_all(b"first ")?;
        w.write_all(b"second")?;
        let mut r = w.commit()?;
        assert_eq!(slurp(&mut r)?, b"first second");
        Ok(())
    }

    #[test]
    #[cfg(not(windows))]
    fn test_blob_store_replace_keeps_old_readers_alive() -> Result<()> {
        let tmp = tempfile::tempdir()?;
        let store = BlobStore::new(tmp.path())?;
        let key = b"versioned".as_slice();

        {
            let entry = store.entry(&key)?;
            let mut w = entry.begin()?;
            w.write_all(b"gen 1")?;
            w.commit()?;
        }

        let mut old = store.read(&key).unwrap();

        {
            let entry = store.entry(&key)?;
            let mut w = entry.begin()?;
            w.write_all(b"gen 2")?;
            w.commit()?;
        }

        assert_eq!(slurp(&mut store.read(&key).unwrap())?, b"gen 2");
        // the replaced file stays readable through the old handle
        assert_eq!(slurp(&mut old)?, b"gen 1");
        Ok(())
    }

    #[test]
    fn test_tree_store() -> Result<()> {
        let tmp = tempfile::tempdir()?;
        let store = TreeStore::new(tmp.path())?;

        let path = store.read_or_fill(&b"tree".as_slice(), |dir| {
            fs::write(dir.join("file"), b"contents")?;
            Ok(())
        })?;
        assert_eq!(fs::read(path.join("file"))?, b"contents");

        // write-once: second fill is skipped
        let path = store.read_or_fill(&b"tree".as_slice(), |_| {
            panic!("should not refill");
        })?;
        assert_eq!(fs::read(path.join("file"))?, b"contents");
        Ok(())
    }

    #[test]
    fn test_hash_keys_disperse_by_algorithm() {
        let hash = ArtifactHash::sha256_of(b"x");
        let path = hash.store_path();
        assert!(path.starts_with("sha256"));
    }
}
