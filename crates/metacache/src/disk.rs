use std::fmt::Write as _;
use std::fs;
use std::io::{self, Write as _};
use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};

/// Extensions longer than this are not carried over to the cache file name.
const MAX_EXTENSION_LEN: usize = 32;

/// Content-keyed file storage for one cache namespace.
///
/// A logical string key maps to `<root>/<namespace-hash>/<key-hash>.<ext?>`, where both
/// hashes are hex-formatted SHA-256 digests. The hash is used purely for filesystem
/// safety of arbitrary keys, not for content deduplication. The key's apparent extension
/// is preserved so the cached artifact keeps a recognizable suffix.
///
/// Writes go to a temporary file in a sibling `tmp` directory first and are then moved
/// into place, so a reader never observes a partially written file.
///
/// All operations are synchronous from the caller's perspective; dispatching them onto a
/// background context is the caller's responsibility.
#[derive(Debug, Clone)]
pub struct DiskCache {
    dir: PathBuf,
    tmp_dir: PathBuf,
}

impl DiskCache {
    /// Opens the namespace directory below `root`, creating it if necessary.
    ///
    /// Failing to create the directory makes the whole disk tier unusable and is
    /// reported as an error.
    pub fn new(root: &Path, namespace: &str) -> io::Result<Self> {
        let dir = root.join(hash_hex(namespace));
        let tmp_dir = dir.join("tmp");
        fs::create_dir_all(&tmp_dir)?;

        Ok(DiskCache { dir, tmp_dir })
    }

    /// The file this key is stored at, whether or not it currently exists.
    pub fn path_for(&self, key: &str) -> PathBuf {
        let mut name = hash_hex(key);
        if let Some(ext) = apparent_extension(key) {
            name.push('.');
            name.push_str(ext);
        }
        self.dir.join(name)
    }

    /// Atomically writes `data` under `key`, replacing any previous value.
    pub fn save(&self, data: &[u8], key: &str) -> io::Result<()> {
        // `clear` removes the whole namespace directory, so re-create it on every write.
        fs::create_dir_all(&self.tmp_dir)?;

        let mut temp_file = tempfile::Builder::new()
            .prefix("tmp")
            .tempfile_in(&self.tmp_dir)?;
        temp_file.write_all(data)?;

        let path = self.path_for(key);
        tracing::trace!("Persisting cache file at path {}", path.display());
        temp_file.persist(&path).map_err(|e| e.error)?;
        Ok(())
    }

    /// Reads the value stored under `key`, or `None` if there is none.
    pub fn load(&self, key: &str) -> io::Result<Option<Vec<u8>>> {
        catch_not_found(|| fs::read(self.path_for(key)))
    }

    /// Whether a value is stored under `key`, without reading it.
    pub fn contains(&self, key: &str) -> bool {
        self.path_for(key).is_file()
    }

    /// Removes the value stored under `key`. Removing an absent key is not an error.
    pub fn remove(&self, key: &str) -> io::Result<()> {
        catch_not_found(|| fs::remove_file(self.path_for(key)))?;
        Ok(())
    }

    /// Removes the entire namespace directory. A missing directory is not an error.
    pub fn clear(&self) -> io::Result<()> {
        catch_not_found(|| fs::remove_dir_all(&self.dir))?;
        Ok(())
    }

    /// The number of entries in this namespace.
    pub fn entry_count(&self) -> io::Result<usize> {
        let mut count = 0;
        for entry in self.entries()? {
            entry?;
            count += 1;
        }
        Ok(count)
    }

    /// The total size in bytes of all entries in this namespace.
    pub fn size_in_bytes(&self) -> io::Result<u64> {
        let mut total = 0;
        for entry in self.entries()? {
            total += entry?.metadata()?.len();
        }
        Ok(total)
    }

    fn entries(&self) -> io::Result<impl Iterator<Item = io::Result<fs::DirEntry>>> {
        let read_dir = catch_not_found(|| fs::read_dir(&self.dir))?;
        Ok(read_dir.into_iter().flatten().filter(|entry| {
            // `tmp` holds in-flight writes, it is not part of the namespace contents
            match entry {
                Ok(entry) => entry.path().is_file(),
                Err(_) => true,
            }
        }))
    }
}

fn hash_hex(input: &str) -> String {
    let hash = Sha256::digest(input.as_bytes());
    let mut out = String::with_capacity(64);
    for b in hash {
        out.write_fmt(format_args!("{b:02x}")).unwrap();
    }
    out
}

/// The key's apparent extension: the substring after the last `.`, if it looks like one.
fn apparent_extension(key: &str) -> Option<&str> {
    let (_, ext) = key.rsplit_once('.')?;
    if ext.is_empty() || ext.len() > MAX_EXTENSION_LEN {
        return None;
    }
    if ext.bytes().any(|b| matches!(b, b'/' | b'\\' | b':' | b'?')) {
        return None;
    }
    Some(ext)
}

pub(crate) fn catch_not_found<F, R>(f: F) -> io::Result<Option<R>>
where
    F: FnOnce() -> io::Result<R>,
{
    match f() {
        Ok(x) => Ok(Some(x)),
        Err(e) => match e.kind() {
            io::ErrorKind::NotFound => Ok(None),
            _ => Err(e),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn disk_cache() -> (metacache_test::TempDir, DiskCache) {
        let dir = metacache_test::tempdir();
        let cache = DiskCache::new(dir.path(), "test").unwrap();
        (dir, cache)
    }

    #[test]
    fn test_round_trip() {
        let (_dir, cache) = disk_cache();

        cache.save(b"hello", "some/key").unwrap();
        assert_eq!(cache.load("some/key").unwrap().unwrap(), b"hello");
        assert!(cache.contains("some/key"));
        assert!(!cache.contains("other/key"));
    }

    #[test]
    fn test_empty_payload() {
        let (_dir, cache) = disk_cache();

        cache.save(b"", "empty").unwrap();
        assert_eq!(cache.load("empty").unwrap().unwrap(), b"");
    }

    #[test]
    fn test_extension_preserved() {
        let (_dir, cache) = disk_cache();

        cache.save(b"x", "http://example.com/image.png").unwrap();
        let path = cache.path_for("http://example.com/image.png");
        assert_eq!(path.extension().unwrap(), "png");
        assert!(path.is_file());

        // a "." in the middle of a URL path is not an extension
        let path = cache.path_for("http://example.com/file.name/resource");
        assert_eq!(path.extension(), None);
    }

    #[test]
    fn test_overwrite() {
        let (_dir, cache) = disk_cache();

        cache.save(b"first", "key").unwrap();
        cache.save(b"second", "key").unwrap();
        assert_eq!(cache.load("key").unwrap().unwrap(), b"second");
    }

    #[test]
    fn test_remove_and_clear() {
        let (_dir, cache) = disk_cache();

        cache.save(b"x", "a").unwrap();
        cache.remove("a").unwrap();
        assert_eq!(cache.load("a").unwrap(), None);
        // removing again is a no-op
        cache.remove("a").unwrap();

        cache.save(b"x", "a").unwrap();
        cache.save(b"y", "b").unwrap();
        cache.clear().unwrap();
        assert!(!cache.contains("a"));
        assert!(!cache.contains("b"));
        // clearing a missing directory is not an error
        cache.clear().unwrap();

        // the cache stays usable after a clear
        cache.save(b"z", "c").unwrap();
        assert_eq!(cache.load("c").unwrap().unwrap(), b"z");
    }

    #[test]
    fn test_counts_and_sizes() {
        let (_dir, cache) = disk_cache();

        assert_eq!(cache.entry_count().unwrap(), 0);
        cache.save(b"12345", "a").unwrap();
        cache.save(b"123", "b.bin").unwrap();
        assert_eq!(cache.entry_count().unwrap(), 2);
        assert_eq!(cache.size_in_bytes().unwrap(), 8);

        cache.clear().unwrap();
        assert_eq!(cache.entry_count().unwrap(), 0);
        assert_eq!(cache.size_in_bytes().unwrap(), 0);
    }

    #[test]
    fn test_distinct_namespaces() {
        let dir = metacache_test::tempdir();
        let first = DiskCache::new(dir.path(), "first").unwrap();
        let second = DiskCache::new(dir.path(), "second").unwrap();

        first.save(b"x", "key").unwrap();
        assert!(!second.contains("key"));
    }
}
