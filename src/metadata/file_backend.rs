use crate::prelude::*;
use crate::metadata::MetadataBackend;
use crate::util::{flock, with_suffix, LockMode};
use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::BufReader;
use std::path::{Path, PathBuf};

// Attribute store backed by one sidecar file per node: `<node-dir>.meta`
// holds a CBOR map of key -> bytes. Updates write the whole new map into a
// temporary file and rename it into place, so readers always see either the
// old or the new map, never a torn one. On Unix this rename is trivially
// atomic.
//
// Mutations additionally hold an exclusive advisory flock on
// `<node-dir>.meta.lock` across the read-modify-write, which is what makes
// `set_many` atomic and gives same-node operations their linearizability.
// Readers take the same lock shared. The lock file is separate from the data
// file because the data file is replaced on every write and flocks don't
// survive replacement.

type Map = BTreeMap<String, serde_bytes::ByteBuf>;

#[derive(Debug, Default, Clone, Copy)]
pub struct FileBackend;

impl FileBackend {
    pub fn new() -> FileBackend {
        FileBackend
    }

    fn meta_path(path: &Path) -> PathBuf {
        with_suffix(path, ".meta")
    }

    fn guard_path(path: &Path) -> PathBuf {
        with_suffix(path, ".meta.lock")
    }

    /// Decode the sidecar file, without any locking.
    fn read_file(meta: &Path) -> Result<Option<Map>> {
        let file = match File::open(meta) {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(FsError::Internal(e)),
        };
        let map = ciborium::de::from_reader(BufReader::new(file)).map_err(|e| {
            FsError::internal(format!("corrupt metadata file {}: {e}", meta.display()))
        })?;
        Ok(Some(map))
    }

    fn write_file(meta: &Path, map: &Map) -> Result<()> {
        // unwrap rationale: meta paths always live below the storage root
        let dir = meta.parent().unwrap();
        let tmp = tempfile::NamedTempFile::new_in(dir)?;
        ciborium::ser::into_writer(map, &tmp)
            .map_err(|e| FsError::internal(format!("encoding metadata: {e}")))?;
        tmp.as_file().sync_data()?;
        tmp.persist(meta)
            .map_err(|e| FsError::Internal(e.error))?;
        Ok(())
    }

    /// Load for reading: shared lock, then decode. Distinguishes a node
    /// without attributes from a missing node.
    fn load(&self, path: &Path) -> Result<Map> {
        let meta = Self::meta_path(path);
        if !meta.exists() {
            return if path.exists() {
                Ok(Map::new())
            } else {
                Err(FsError::NotFound(path.display().to_string()))
            };
        }
        let _guard = flock(&Self::guard_path(path), LockMode::Shared)?;
        match Self::read_file(&meta)? {
            Some(map) => Ok(map),
            // vanished between the existence check and the open
            None if path.exists() => Ok(Map::new()),
            None => Err(FsError::NotFound(path.display().to_string())),
        }
    }
}

impl MetadataBackend for FileBackend {
    fn get(&self, path: &Path, key: &str) -> Result<Vec<u8>> {
        let map = self.load(path)?;
        map.get(key)
            .map(|v| v.to_vec())
            .ok_or_else(|| FsError::AttrUnset(key.to_owned()))
    }

    fn set(&self, path: &Path, key: &str, value: &[u8]) -> Result<()> {
        let key = key.to_owned();
        let value = value.to_vec();
        self.update(path, &mut |map| {
            map.insert(key.clone(), value.clone());
            Ok(())
        })
    }

    fn set_many(&self, path: &Path, entries: &[(String, Vec<u8>)]) -> Result<()> {
        self.update(path, &mut |map| {
            for (key, value) in entries {
                map.insert(key.clone(), value.clone());
            }
            Ok(())
        })
    }

    fn remove(&self, path: &Path, key: &str) -> Result<()> {
        let mut removed = false;
        self.update(path, &mut |map| {
            removed = map.remove(key).is_some();
            Ok(())
        })?;
        if removed {
            Ok(())
        } else {
            Err(FsError::AttrUnset(key.to_owned()))
        }
    }

    fn list(&self, path: &Path) -> Result<Vec<String>> {
        Ok(self.load(path)?.keys().cloned().collect())
    }

    fn all(&self, path: &Path) -> Result<HashMap<String, Vec<u8>>> {
        Ok(self
            .load(path)?
            .into_iter()
            .map(|(k, v)| (k, v.into_vec()))
            .collect())
    }

    fn update(
        &self,
        path: &Path,
        mutate: &mut dyn FnMut(&mut HashMap<String, Vec<u8>>) -> Result<()>,
    ) -> Result<()> {
        let meta = Self::meta_path(path);
        if !path.exists() && !meta.exists() {
            return Err(FsError::NotFound(path.display().to_string()));
        }
        let _guard = flock(&Self::guard_path(path), LockMode::Exclusive)?;
        let mut map: HashMap<String, Vec<u8>> = Self::read_file(&meta)?
            .unwrap_or_default()
            .into_iter()
            .map(|(k, v)| (k, v.into_vec()))
            .collect();
        mutate(&mut map)?;
        let map: Map = map
            .into_iter()
            .map(|(k, v)| (k, serde_bytes::ByteBuf::from(v)))
            .collect();
        Self::write_file(&meta, &map)
    }

    fn rename(&self, from: &Path, to: &Path) -> Result<()> {
        match fs::rename(Self::meta_path(from), Self::meta_path(to)) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(FsError::Internal(e)),
        }
        // the old guard file is just an empty lock anchor; drop it
        match fs::remove_file(Self::guard_path(from)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(FsError::Internal(e)),
        }
    }

    fn purge(&self, path: &Path) -> Result<()> {
        for p in [Self::meta_path(path), Self::guard_path(path)] {
            match fs::remove_file(&p) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(FsError::Internal(e)),
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn node(tmp: &tempfile::TempDir, name: &str) -> PathBuf {
        let path = tmp.path().join(name);
        fs::create_dir_all(&path).unwrap();
        path
    }

    #[test]
    fn test_set_get_remove() {
        let tmp = tempfile::tempdir().unwrap();
        let backend = FileBackend::new();
        let path = node(&tmp, "n1");

        backend.set(&path, "user.ocis.name", b"file1").unwrap();
        assert_eq!(backend.get(&path, "user.ocis.name").unwrap(), b"file1");

        backend.set(&path, "user.ocis.name", b"file2").unwrap();
        assert_eq!(backend.get(&path, "user.ocis.name").unwrap(), b"file2");

        backend.remove(&path, "user.ocis.name").unwrap();
        assert!(matches!(
            backend.get(&path, "user.ocis.name"),
            Err(FsError::AttrUnset(_))
        ));
        assert!(matches!(
            backend.remove(&path, "user.ocis.name"),
            Err(FsError::AttrUnset(_))
        ));
    }

    #[test]
    fn test_unset_vs_not_found() {
        let tmp = tempfile::tempdir().unwrap();
        let backend = FileBackend::new();
        let path = node(&tmp, "n1");

        // node present, key absent
        assert!(matches!(
            backend.get(&path, "user.ocis.name"),
            Err(FsError::AttrUnset(_))
        ));
        // node absent entirely
        assert!(matches!(
            backend.get(&tmp.path().join("nope"), "user.ocis.name"),
            Err(FsError::NotFound(_))
        ));
    }

    #[test]
    fn test_set_many_and_list() {
        let tmp = tempfile::tempdir().unwrap();
        let backend = FileBackend::new();
        let path = node(&tmp, "n1");

        backend
            .set_many(
                &path,
                &[
                    ("user.ocis.name".to_owned(), b"dir1".to_vec()),
                    ("user.ocis.parentid".to_owned(), b"p1".to_vec()),
                ],
            )
            .unwrap();
        let mut keys = backend.list(&path).unwrap();
        keys.sort();
        assert_eq!(keys, vec!["user.ocis.name", "user.ocis.parentid"]);

        let all = backend.all(&path).unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all["user.ocis.name"], b"dir1");
    }

    #[test]
    fn test_rename_keeps_attributes() {
        let tmp = tempfile::tempdir().unwrap();
        let backend = FileBackend::new();
        let path = node(&tmp, "n1");
        backend.set(&path, "user.ocis.name", b"x").unwrap();

        let moved = tmp.path().join("n1.T.2024-01-01T00:00:00.000000000Z");
        fs::rename(&path, &moved).unwrap();
        backend.rename(&path, &moved).unwrap();

        assert_eq!(backend.get(&moved, "user.ocis.name").unwrap(), b"x");
        assert!(matches!(
            backend.get(&path, "user.ocis.name"),
            Err(FsError::NotFound(_))
        ));
    }

    #[test]
    fn test_purge() {
        let tmp = tempfile::tempdir().unwrap();
        let backend = FileBackend::new();
        let path = node(&tmp, "n1");
        backend.set(&path, "user.ocis.name", b"x").unwrap();
        backend.purge(&path).unwrap();
        assert!(!FileBackend::meta_path(&path).exists());
        // idempotent
        backend.purge(&path).unwrap();
    }

    #[test]
    fn test_update_read_modify_write() {
        let tmp = tempfile::tempdir().unwrap();
        let backend = FileBackend::new();
        let path = node(&tmp, "n1");
        backend.set(&path, "user.ocis.treesize", b"100").unwrap();

        backend
            .update(&path, &mut |map| {
                let size: u64 = std::str::from_utf8(&map["user.ocis.treesize"])
                    .unwrap()
                    .parse()
                    .unwrap();
                map.insert(
                    "user.ocis.treesize".to_owned(),
                    (size + 34).to_string().into_bytes(),
                );
                Ok(())
            })
            .unwrap();
        assert_eq!(backend.get(&path, "user.ocis.treesize").unwrap(), b"134");
    }
}
