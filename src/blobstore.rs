use crate::prelude::*;
use crate::util::{flock, with_suffix, LockMode};
use auto_impl::auto_impl;
use sha1::{Digest, Sha1};
use std::fs::{self, File};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

// A simple on-disk store for blob payloads, keyed by the opaque blob id.
//
// Blob ids are scrambled (sha1 + urlsafe-base64) into a fixed-length path and
// dispersed over nested directories, because some filesystems don't cope well
// with a single directory containing lots of files. This is the nesting
// depth, so "3" means paths look like ${BASE}/${CHAR}/${CHAR}/${CHAR}/${ENTRY}
// with a fanout of 64 per level.
const DIR_NEST_DEPTH: usize = 3;

// For each key there is a lock file plus the data file. Writes go into a
// temporary file in a shared tmp directory and are renamed into place, so a
// reader sees either the old or the new payload. The per-key lock prevents
// two uploads racing on the same id; read-only file descriptors escape
// without the lock because payloads are only ever replaced, never patched.

/// Blob payload access as the core needs it. The core never touches payload
/// bytes outside this seam; an S3 or similar backend can be substituted.
#[auto_impl(&, Arc)]
pub trait Blobstore: Send + Sync {
    fn upload(&self, blob_id: &str, data: &mut dyn Read) -> Result<BlobInfo>;
    fn download(&self, blob_id: &str) -> Result<Box<dyn ReadPlusSeek>>;
    /// Idempotent; deleting an absent blob is fine.
    fn delete(&self, blob_id: &str) -> Result<()>;
}

#[derive(Debug, Clone)]
pub struct BlobInfo {
    pub size: u64,
    pub checksums: Vec<Checksum>,
}

#[derive(Debug)]
pub struct FsBlobstore {
    base: PathBuf,
    tmp: PathBuf,
}

impl FsBlobstore {
    pub fn new(base: &Path) -> Result<FsBlobstore> {
        let base = base.to_path_buf();
        let tmp = base.join("tmp");
        fs::create_dir_all(&base)?;
        fs::create_dir_all(&tmp)?;
        Ok(FsBlobstore { base, tmp })
    }

    fn path_for(&self, blob_id: &str) -> PathBuf {
        let scrambled = Sha1::digest(blob_id.as_bytes());
        let enc = data_encoding::BASE64URL_NOPAD.encode(&scrambled);
        let mut path = self.base.clone();
        for i in 0..DIR_NEST_DEPTH {
            path.push(&enc[i..i + 1]);
        }
        path.push(&enc[DIR_NEST_DEPTH..]);
        path
    }

    fn lock_path(path: &Path) -> PathBuf {
        with_suffix(path, ".lock")
    }
}

impl Blobstore for FsBlobstore {
    fn upload(&self, blob_id: &str, data: &mut dyn Read) -> Result<BlobInfo> {
        let path = self.path_for(blob_id);
        let _lock = flock(&Self::lock_path(&path), LockMode::Exclusive)?;

        let mut tmp = tempfile::NamedTempFile::new_in(&self.tmp)?;
        let mut sha1 = Sha1::new();
        let mut md5 = md5::Context::new();
        let mut size = 0u64;
        let mut buf = [0u8; 64 * 1024];
        loop {
            let n = data.read(&mut buf)?;
            if n == 0 {
                break;
            }
            tmp.write_all(&buf[..n])?;
            sha1.update(&buf[..n]);
            md5.consume(&buf[..n]);
            size += n as u64;
        }
        tmp.as_file().sync_data()?;
        tmp.persist(&path).map_err(|e| FsError::Internal(e.error))?;
        debug!(blob = blob_id, size, "blob stored");

        Ok(BlobInfo {
            size,
            checksums: vec![
                Checksum {
                    algo: ChecksumAlgo::Sha1,
                    raw: sha1.finalize().to_vec(),
                },
                Checksum {
                    algo: ChecksumAlgo::Md5,
                    raw: md5.compute().0.to_vec(),
                },
            ],
        })
    }

    fn download(&self, blob_id: &str) -> Result<Box<dyn ReadPlusSeek>> {
        let file = File::open(self.path_for(blob_id))
            .map_err(|e| FsError::from_io(e, &format!("blob {blob_id}")))?;
        Ok(Box::new(file))
    }

    fn delete(&self, blob_id: &str) -> Result<()> {
        let path = self.path_for(blob_id);
        let _lock = flock(&Self::lock_path(&path), LockMode::Exclusive)?;
        match fs::remove_file(&path) {
            Ok(()) => {
                debug!(blob = blob_id, "blob deleted");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(FsError::Internal(e)),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn slurp(r: &mut dyn Read) -> Vec<u8> {
        let mut buf = Vec::new();
        r.read_to_end(&mut buf).unwrap();
        buf
    }

    #[test]
    fn test_upload_download_delete() {
        let tmp = tempfile::tempdir().unwrap();
        let store = FsBlobstore::new(tmp.path()).unwrap();

        let info = store.upload("b1", &mut b"hello".as_slice()).unwrap();
        assert_eq!(info.size, 5);
        assert_eq!(slurp(&mut store.download("b1").unwrap()), b"hello");

        store.delete("b1").unwrap();
        assert!(matches!(store.download("b1"), Err(FsError::NotFound(_))));
        // idempotent
        store.delete("b1").unwrap();
    }

    #[test]
    fn test_upload_checksums() {
        let tmp = tempfile::tempdir().unwrap();
        let store = FsBlobstore::new(tmp.path()).unwrap();
        let info = store.upload("b1", &mut b"hello".as_slice()).unwrap();

        let sha1 = info
            .checksums
            .iter()
            .find(|c| c.algo == ChecksumAlgo::Sha1)
            .unwrap();
        assert_eq!(sha1.hex(), "aaf4c61ddcc5e8a2dabede0f3b482cd9aea9434d");
        let md5 = info
            .checksums
            .iter()
            .find(|c| c.algo == ChecksumAlgo::Md5)
            .unwrap();
        assert_eq!(md5.hex(), "5d41402abc4b2a76b9719d911017c592");
    }

    #[test]
    fn test_overwrite_replaces_payload() {
        let tmp = tempfile::tempdir().unwrap();
        let store = FsBlobstore::new(tmp.path()).unwrap();
        store.upload("b1", &mut b"gen 1".as_slice()).unwrap();
        store.upload("b1", &mut b"gen 2".as_slice()).unwrap();
        assert_eq!(slurp(&mut store.download("b1").unwrap()), b"gen 2");
    }
}
