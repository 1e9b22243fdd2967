//! Resource sources
//!
//! A [`Cache`](crate::cache::Cache) never reads resources itself. It asks a
//! [`ResourceSource`] for the size of a key and then for its bytes.

use crate::cache::CacheKey;
use crate::error::SourceError;
use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};

/// Supplies resources to a cache
pub trait ResourceSource {
    /// Size in bytes of the resource behind `key`
    fn size_of(&mut self, key: CacheKey) -> Result<usize, SourceError>;

    /// Read the resource into `buf`, which holds at least `size_of(key)` bytes
    ///
    /// Returns the number of bytes written; the cache records that as the
    /// entry size.
    fn read_into(&mut self, key: CacheKey, buf: &mut [u8]) -> Result<usize, SourceError>;

    /// Called with an entry's bytes right before the cache evicts it
    fn free_item(&mut self, _key: CacheKey, _data: &[u8]) {}
}

impl<S: ResourceSource + ?Sized> ResourceSource for Box<S> {
    fn size_of(&mut self, key: CacheKey) -> Result<usize, SourceError> {
        (**self).size_of(key)
    }

    fn read_into(&mut self, key: CacheKey, buf: &mut [u8]) -> Result<usize, SourceError> {
        (**self).read_into(key, buf)
    }

    fn free_item(&mut self, key: CacheKey, data: &[u8]) {
        (**self).free_item(key, data)
    }
}

/// Source built from a pair of closures
pub struct FnSource<SizeFn, ReadFn> {
    size_of: SizeFn,
    read_into: ReadFn,
}

impl<SizeFn, ReadFn> FnSource<SizeFn, ReadFn>
where
    SizeFn: FnMut(CacheKey) -> Result<usize, SourceError>,
    ReadFn: FnMut(CacheKey, &mut [u8]) -> Result<usize, SourceError>,
{
    pub fn new(size_of: SizeFn, read_into: ReadFn) -> Self {
        FnSource { size_of, read_into }
    }
}

impl<SizeFn, ReadFn> ResourceSource for FnSource<SizeFn, ReadFn>
where
    SizeFn: FnMut(CacheKey) -> Result<usize, SourceError>,
    ReadFn: FnMut(CacheKey, &mut [u8]) -> Result<usize, SourceError>,
{
    fn size_of(&mut self, key: CacheKey) -> Result<usize, SourceError> {
        (self.size_of)(key)
    }

    fn read_into(&mut self, key: CacheKey, buf: &mut [u8]) -> Result<usize, SourceError> {
        (self.read_into)(key, buf)
    }
}

/// Serves each key from the file `<root>/<key>.<ext>`
#[derive(Debug, Clone)]
pub struct DirSource {
    root: PathBuf,
    extension: String,
}

impl DirSource {
    pub fn new<P: AsRef<Path>>(root: P, extension: &str) -> Self {
        DirSource {
            root: root.as_ref().to_path_buf(),
            extension: extension.trim_start_matches('.').to_string(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Path of the file backing `key`
    pub fn path_for(&self, key: CacheKey) -> PathBuf {
        self.root.join(format!("{}.{}", key, self.extension))
    }
}

impl ResourceSource for DirSource {
    fn size_of(&mut self, key: CacheKey) -> Result<usize, SourceError> {
        let metadata = std::fs::metadata(self.path_for(key))?;
        Ok(usize::try_from(metadata.len())?)
    }

    fn read_into(&mut self, key: CacheKey, buf: &mut [u8]) -> Result<usize, SourceError> {
        let mut file = File::open(self.path_for(key))?;

        let mut filled = 0;
        while filled < buf.len() {
            match file.read(&mut buf[filled..])? {
                0 => break,
                n => filled += n,
            }
        }

        Ok(filled)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fn_source_forwards_calls() {
        let mut source = FnSource::new(
            |key| Ok(key as usize * 2),
            |key, buf: &mut [u8]| {
                buf.fill(key as u8);
                Ok(buf.len())
            },
        );

        assert_eq!(source.size_of(8).unwrap(), 16);

        let mut buf = [0u8; 4];
        assert_eq!(source.read_into(3, &mut buf).unwrap(), 4);
        assert_eq!(buf, [3, 3, 3, 3]);
    }

    #[test]
    fn test_dir_source_reads_files() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("7.frm"), b"sprite-bytes").unwrap();

        let mut source = DirSource::new(dir.path(), ".frm");
        assert_eq!(source.path_for(7), dir.path().join("7.frm"));
        assert_eq!(source.size_of(7).unwrap(), 12);

        let mut buf = vec![0u8; 12];
        assert_eq!(source.read_into(7, &mut buf).unwrap(), 12);
        assert_eq!(&buf, b"sprite-bytes");
    }

    #[test]
    fn test_dir_source_missing_key() {
        let dir = tempfile::tempdir().unwrap();
        let mut source = DirSource::new(dir.path(), "acm");

        assert!(source.size_of(1).is_err());
        assert!(source.read_into(1, &mut [0u8; 4]).is_err());
    }
}
