use crate::*;
use chrono::{DateTime, Utc};
use rand::rngs::OsRng;
use rand::RngCore;
use std::collections::BTreeMap;
use std::convert::TryFrom;
use std::fmt;
use std::fs;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::{PoisonError, RwLock};
use uuid::Uuid;

const BLOB_PREFIX: &str = "BLOB-";
const BLOB_EXTENSION: &str = "enc";
const TEMP_EXTENSION: &str = "tmp";

/// Identifier of a stored envelope: the election scope plus a random UUIDv4.
///
/// Rendered as `BLOB-<election>-<uuid>`.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(try_from = "String", into = "String")]
pub struct BlobId {
    pub election: ElectionId,
    pub unique: Uuid,
}

impl BlobId {
    pub fn new(election: ElectionId) -> Self {
        BlobId {
            election,
            unique: Uuid::new_v4(),
        }
    }
}

impl fmt::Display for BlobId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}{}-{}", BLOB_PREFIX, self.election, self.unique.simple())
    }
}

impl FromStr for BlobId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || Error::InvalidIdentifier(format!("malformed blob id {}", s));

        let rest = s.strip_prefix(BLOB_PREFIX).ok_or_else(invalid)?;
        let (election, unique) = rest.rsplit_once('-').ok_or_else(invalid)?;

        Ok(BlobId {
            election: ElectionId::new(election)?,
            unique: Uuid::parse_str(unique).map_err(|_| invalid())?,
        })
    }
}

impl TryFrom<String> for BlobId {
    type Error = Error;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        BlobId::from_str(&s)
    }
}

impl From<BlobId> for String {
    fn from(id: BlobId) -> String {
        id.to_string()
    }
}

/// Storage for sealed vote envelopes.
///
/// The store only ever sees ciphertext.
pub trait BlobStore: Send + Sync {
    /// Store a sealed envelope under a fresh id in the given election scope
    fn put(&self, scope: &ElectionId, payload: &[u8]) -> Result<BlobId, Error>;

    fn get(&self, id: &BlobId) -> Result<Vec<u8>, Error>;

    /// Snapshot of every blob in the scope at the time of the call
    fn list(&self, scope: &ElectionId) -> Result<Vec<BlobId>, Error>;

    /// Overwrite with random bytes, then remove.
    ///
    /// Returns `false` if the blob was already gone.
    fn delete(&self, id: &BlobId) -> Result<bool, Error>;

    /// Securely delete every blob, in every scope, created before `cutoff`
    fn purge_older_than(&self, cutoff: DateTime<Utc>) -> Result<usize, Error>;
}

struct StoredBlob {
    bytes: Vec<u8>,
    created_at: DateTime<Utc>,
}

/// A simple blob store that uses an in-memory BTreeMap
#[derive(Default)]
pub struct MemBlobStore {
    inner: RwLock<BTreeMap<BlobId, StoredBlob>>,
}

impl MemBlobStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the stored bytes of a blob
    pub fn overwrite(&self, id: &BlobId, bytes: Vec<u8>) -> Result<(), Error> {
        let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        let stored = inner
            .get_mut(id)
            .ok_or_else(|| Error::BlobNotFound(id.clone()))?;
        stored.bytes = bytes;
        Ok(())
    }

    /// Change the recorded creation time of a blob
    pub fn backdate(&self, id: &BlobId, created_at: DateTime<Utc>) -> Result<(), Error> {
        let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        let stored = inner
            .get_mut(id)
            .ok_or_else(|| Error::BlobNotFound(id.clone()))?;
        stored.created_at = created_at;
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl BlobStore for MemBlobStore {
    fn put(&self, scope: &ElectionId, payload: &[u8]) -> Result<BlobId, Error> {
        let id = BlobId::new(scope.clone());
        let stored = StoredBlob {
            bytes: payload.to_vec(),
            created_at: Utc::now(),
        };

        self.inner
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id.clone(), stored);

        Ok(id)
    }

    fn get(&self, id: &BlobId) -> Result<Vec<u8>, Error> {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(id)
            .map(|stored| stored.bytes.clone())
            .ok_or_else(|| Error::BlobNotFound(id.clone()))
    }

    fn list(&self, scope: &ElectionId) -> Result<Vec<BlobId>, Error> {
        let inner = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        Ok(inner
            .keys()
            .filter(|id| &id.election == scope)
            .cloned()
            .collect())
    }

    fn delete(&self, id: &BlobId) -> Result<bool, Error> {
        let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        match inner.remove(id) {
            Some(mut stored) => {
                OsRng.fill_bytes(&mut stored.bytes);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    fn purge_older_than(&self, cutoff: DateTime<Utc>) -> Result<usize, Error> {
        let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        let expired: Vec<BlobId> = inner
            .iter()
            .filter(|(_, stored)| stored.created_at < cutoff)
            .map(|(id, _)| id.clone())
            .collect();

        for id in expired.iter() {
            if let Some(mut stored) = inner.remove(id) {
                OsRng.fill_bytes(&mut stored.bytes);
            }
        }

        Ok(expired.len())
    }
}

/// Blob store on the local filesystem, laid out as `<base>/<election>/<blob>.enc`.
///
/// Blobs are written to a temporary file and renamed into place, so `list` never
/// returns a partially written blob.
pub struct FsBlobStore {
    base: PathBuf,
}

impl FsBlobStore {
    pub fn new<P: Into<PathBuf>>(base: P) -> Result<Self, Error> {
        let base = base.into();
        fs::create_dir_all(&base)?;
        Ok(FsBlobStore { base })
    }

    pub fn base(&self) -> &Path {
        &self.base
    }

    fn scope_dir(&self, scope: &ElectionId) -> PathBuf {
        self.base.join(scope.as_str())
    }

    fn blob_path(&self, id: &BlobId) -> PathBuf {
        self.scope_dir(&id.election)
            .join(format!("{}.{}", id, BLOB_EXTENSION))
    }

    fn blobs_in(&self, dir: &Path) -> Result<Vec<(BlobId, PathBuf)>, Error> {
        let entries = match fs::read_dir(dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(vec![]),
            Err(e) => return Err(e.into()),
        };

        let mut blobs = vec![];
        for entry in entries {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some(BLOB_EXTENSION) {
                continue;
            }
            let id = path
                .file_stem()
                .and_then(|s| s.to_str())
                .and_then(|s| BlobId::from_str(s).ok());
            match id {
                Some(id) => blobs.push((id, path)),
                None => warn!("ignoring unrecognised file {}", path.display()),
            }
        }

        blobs.sort();
        Ok(blobs)
    }

    fn shred(path: &Path) -> Result<bool, Error> {
        let len = match fs::metadata(path) {
            Ok(meta) => meta.len() as usize,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(false),
            Err(e) => return Err(e.into()),
        };

        let mut noise = vec![0u8; len];
        OsRng.fill_bytes(&mut noise);

        let mut file = fs::OpenOptions::new().write(true).open(path)?;
        file.write_all(&noise)?;
        file.sync_all()?;
        drop(file);

        match fs::remove_file(path) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }
}

impl BlobStore for FsBlobStore {
    fn put(&self, scope: &ElectionId, payload: &[u8]) -> Result<BlobId, Error> {
        let id = BlobId::new(scope.clone());
        let path = self.blob_path(&id);
        let temp = path.with_extension(TEMP_EXTENSION);

        fs::create_dir_all(self.scope_dir(scope))?;

        let mut file = fs::File::create(&temp)?;
        file.write_all(payload)?;
        file.sync_all()?;
        drop(file);

        fs::rename(&temp, &path)?;
        debug!("stored blob {} ({} bytes)", id, payload.len());

        Ok(id)
    }

    fn get(&self, id: &BlobId) -> Result<Vec<u8>, Error> {
        match fs::read(self.blob_path(id)) {
            Ok(bytes) => Ok(bytes),
            Err(e) if e.kind() == ErrorKind::NotFound => Err(Error::BlobNotFound(id.clone())),
            Err(e) => Err(e.into()),
        }
    }

    fn list(&self, scope: &ElectionId) -> Result<Vec<BlobId>, Error> {
        Ok(self
            .blobs_in(&self.scope_dir(scope))?
            .into_iter()
            .filter(|(id, _)| &id.election == scope)
            .map(|(id, _)| id)
            .collect())
    }

    fn delete(&self, id: &BlobId) -> Result<bool, Error> {
        let deleted = Self::shred(&self.blob_path(id))?;
        if deleted {
            debug!("securely deleted blob {}", id);
        }
        Ok(deleted)
    }

    fn purge_older_than(&self, cutoff: DateTime<Utc>) -> Result<usize, Error> {
        let mut purged = 0;

        for entry in fs::read_dir(&self.base)? {
            let dir = entry?.path();
            if !dir.is_dir() {
                continue;
            }

            for (id, path) in self.blobs_in(&dir)? {
                let modified: DateTime<Utc> = fs::metadata(&path)?.modified()?.into();
                if modified < cutoff && Self::shred(&path)? {
                    debug!("purged expired blob {}", id);
                    purged += 1;
                }
            }
        }

        Ok(purged)
    }
}
