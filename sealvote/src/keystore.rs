use crate::*;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use chrono::{DateTime, Utc};
use std::fs;
use std::path::Path;
use zeroize::{Zeroize, Zeroizing};

pub const KEYSTORE_ALGORITHM: &str = "AES/GCM/NoPadding";
pub const KEYSTORE_KEY_LENGTH: u32 = 256;

/// On-disk key-store artifact holding the master key.
///
/// ```json
/// { "masterKey": "<base64>", "algorithm": "AES/GCM/NoPadding", "keyLength": 256 }
/// ```
#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Keystore {
    pub master_key: String,
    pub algorithm: String,
    pub key_length: u32,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

impl Keystore {
    /// Create an artifact around a freshly generated master key
    pub fn generate() -> Self {
        let key = MasterKey::generate();
        Keystore {
            master_key: BASE64.encode(key.as_bytes()),
            algorithm: KEYSTORE_ALGORITHM.to_string(),
            key_length: KEYSTORE_KEY_LENGTH,
            created_at: Some(Utc::now()),
            description: Some("sealvote vote envelope master key".to_string()),
        }
    }

    /// Validate the artifact and extract the master key
    pub fn master_key(&self) -> Result<MasterKey, Error> {
        if self.algorithm != KEYSTORE_ALGORITHM {
            return Err(Error::Keystore(format!(
                "unsupported algorithm {}, expected {}",
                self.algorithm, KEYSTORE_ALGORITHM
            )));
        }

        let bytes = Zeroizing::new(
            BASE64
                .decode(self.master_key.as_bytes())
                .map_err(|e| Error::Keystore(format!("master key is not valid base64: {}", e)))?,
        );

        if bytes.len() * 8 != self.key_length as usize {
            return Err(Error::Keystore(format!(
                "declared key length {} does not match actual length {}",
                self.key_length,
                bytes.len() * 8
            )));
        }

        MasterKey::from_bytes(&bytes)
    }

    /// Read and validate a key-store file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<MasterKey, Error> {
        let path = path.as_ref();
        let contents = Zeroizing::new(fs::read_to_string(path).map_err(|e| {
            Error::Keystore(format!("cannot read key store {}: {}", path.display(), e))
        })?);

        let keystore: Keystore = serde_json::from_str(&contents)
            .map_err(|e| Error::Keystore(format!("malformed key store {}: {}", path.display(), e)))?;

        let key = keystore.master_key()?;
        info!("loaded master key from {}", path.display());
        Ok(key)
    }

    /// Write the artifact. Refuses to replace an existing file unless `overwrite` is set.
    pub fn write<P: AsRef<Path>>(&self, path: P, overwrite: bool) -> Result<(), Error> {
        let path = path.as_ref();
        if path.exists() && !overwrite {
            return Err(Error::Keystore(format!(
                "{} already exists",
                path.display()
            )));
        }

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }

        let json = Zeroizing::new(serde_json::to_string_pretty(self)?);
        fs::write(path, json.as_bytes())?;
        Ok(())
    }
}

impl Drop for Keystore {
    fn drop(&mut self) {
        self.master_key.zeroize();
    }
}
