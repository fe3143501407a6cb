//! Master keys and authenticated encryption.
//!
//! Credentials are sealed with XChaCha20-Poly1305 under a 256-bit master
//! key. Each sealed secret records the key version that produced it, and a
//! [`Keyring`] can hold several versions at once so that older records
//! remain readable while a new key is being rolled out.

use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::path::Path;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use chacha20poly1305::aead::{AeadInPlace, KeyInit};
use chacha20poly1305::{Key, Tag, XChaCha20Poly1305, XNonce};
use rand::rngs::OsRng;
use rand::RngCore;
use subtle::ConstantTimeEq;
use zeroize::Zeroizing;

use crate::error::{VaultError, VaultResult};
use crate::types::SealedSecret;

/// Length of a master key in bytes.
pub const KEY_LEN: usize = 32;
/// Length of an XChaCha20 nonce in bytes.
pub const NONCE_LEN: usize = 24;
/// Length of a Poly1305 tag in bytes.
pub const TAG_LEN: usize = 16;

/// A 256-bit symmetric master key, zeroed on drop.
#[derive(Clone)]
pub struct MasterKey(Zeroizing<[u8; KEY_LEN]>);

impl MasterKey {
    /// Generates a fresh random key.
    #[must_use]
    pub fn generate() -> Self {
        let mut key = Zeroizing::new([0u8; KEY_LEN]);
        OsRng.fill_bytes(&mut key[..]);
        Self(key)
    }

    /// Builds a key from raw bytes.
    ///
    /// # Errors
    ///
    /// Returns [`VaultError::InvalidKey`] unless exactly 32 bytes are given.
    pub fn from_bytes(bytes: &[u8]) -> VaultResult<Self> {
        if bytes.len() != KEY_LEN {
            return Err(VaultError::InvalidKey(format!(
                "expected {KEY_LEN} bytes, got {}",
                bytes.len()
            )));
        }
        let mut key = Zeroizing::new([0u8; KEY_LEN]);
        key.copy_from_slice(bytes);
        Ok(Self(key))
    }

    /// Decodes a base64-encoded key.
    pub fn from_base64(encoded: &str) -> VaultResult<Self> {
        let bytes = Zeroizing::new(
            BASE64
                .decode(encoded.trim())
                .map_err(|e| VaultError::InvalidKey(format!("invalid base64: {e}")))?,
        );
        Self::from_bytes(&bytes)
    }

    /// Encodes the key as base64.
    #[must_use]
    pub fn to_base64(&self) -> Zeroizing<String> {
        Zeroizing::new(BASE64.encode(&self.0[..]))
    }

    /// Loads a base64 key from a file, refusing files readable by group or
    /// other.
    pub fn load(path: &Path) -> VaultResult<Self> {
        #[cfg(unix)]
        check_key_permissions(path)?;

        let contents = Zeroizing::new(fs::read_to_string(path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                VaultError::MasterKeyNotFound
            } else {
                VaultError::Configuration(format!("failed to read key file: {e}"))
            }
        })?);

        let line = contents
            .lines()
            .map(str::trim)
            .find(|line| !line.starts_with('#') && !line.is_empty())
            .ok_or_else(|| VaultError::InvalidKey("key file is empty".to_owned()))?;

        Self::from_base64(line)
    }

    /// Writes the key to a new file with mode 0600.
    pub fn write_new(&self, path: &Path) -> VaultResult<()> {
        use std::io::Write as _;

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| {
                VaultError::Configuration(format!("failed to create key directory: {e}"))
            })?;
        }

        #[cfg(unix)]
        let mut file = {
            use std::os::unix::fs::OpenOptionsExt;
            fs::OpenOptions::new()
                .write(true)
                .create_new(true)
                .mode(0o600)
                .open(path)
                .map_err(|e| {
                    VaultError::Configuration(format!("failed to create key file: {e}"))
                })?
        };

        #[cfg(not(unix))]
        let mut file = fs::File::create(path)
            .map_err(|e| VaultError::Configuration(format!("failed to create key file: {e}")))?;

        writeln!(file, "{}", self.to_base64().as_str())
            .map_err(|e| VaultError::Configuration(format!("failed to write key file: {e}")))
    }

    /// Constant-time comparison against another key.
    #[must_use]
    pub fn ct_eq(&self, other: &Self) -> bool {
        self.0[..].ct_eq(&other.0[..]).into()
    }

    fn cipher(&self) -> XChaCha20Poly1305 {
        let key = Key::from(*self.0);
        XChaCha20Poly1305::new(&key)
    }
}

impl fmt::Debug for MasterKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("MasterKey([REDACTED])")
    }
}

#[cfg(unix)]
fn check_key_permissions(path: &Path) -> VaultResult<()> {
    use std::os::unix::fs::MetadataExt;

    let metadata = fs::metadata(path).map_err(|e| {
        if e.kind() == std::io::ErrorKind::NotFound {
            VaultError::MasterKeyNotFound
        } else {
            VaultError::Configuration(format!("failed to read key file metadata: {e}"))
        }
    })?;

    let mode = metadata.mode() & 0o777;

    if mode & 0o077 != 0 {
        return Err(VaultError::InsecureKeyFile {
            path: path.display().to_string(),
            mode,
        });
    }

    Ok(())
}

/// Why a sealed secret could not be opened.
///
/// Kept internal to the crate; callers only ever see
/// [`VaultError::Decryption`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum OpenFailure {
    UnknownKeyVersion(u32),
    Malformed,
    Authentication,
}

impl fmt::Display for OpenFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnknownKeyVersion(v) => write!(f, "no key with version {v}"),
            Self::Malformed => f.write_str("malformed sealed secret"),
            Self::Authentication => f.write_str("authentication tag mismatch"),
        }
    }
}

/// The set of master keys known to the process.
///
/// New secrets are always sealed under the active version; any version
/// still present in the ring can be used to open.
#[derive(Clone)]
pub struct Keyring {
    active_version: u32,
    keys: BTreeMap<u32, MasterKey>,
}

impl Keyring {
    /// Creates a keyring holding a single active key.
    #[must_use]
    pub fn new(version: u32, key: MasterKey) -> Self {
        let mut keys = BTreeMap::new();
        keys.insert(version, key);
        Self {
            active_version: version,
            keys,
        }
    }

    /// Adds a retired key that can still open older records.
    ///
    /// Installing over the active version is rejected.
    pub fn with_retired(mut self, version: u32, key: MasterKey) -> VaultResult<Self> {
        if version == self.active_version {
            return Err(VaultError::InvalidKey(format!(
                "version {version} is already the active key"
            )));
        }
        self.keys.insert(version, key);
        Ok(self)
    }

    /// Returns the active key version.
    #[must_use]
    pub const fn active_version(&self) -> u32 {
        self.active_version
    }

    /// Returns the version a newly rotated-in key would get.
    #[must_use]
    pub fn next_version(&self) -> u32 {
        self.keys
            .keys()
            .next_back()
            .map_or(1, |latest| latest.saturating_add(1))
    }

    /// Returns all versions in the ring.
    #[must_use]
    pub fn versions(&self) -> Vec<u32> {
        self.keys.keys().copied().collect()
    }

    /// Returns true if `candidate` matches the active key.
    #[must_use]
    pub fn is_active_key(&self, candidate: &MasterKey) -> bool {
        self.keys
            .get(&self.active_version)
            .is_some_and(|active| active.ct_eq(candidate))
    }

    /// Returns a copy of this ring with `key` installed and active under
    /// `version`. Previous keys stay available for opening.
    #[must_use]
    pub fn rotated(&self, version: u32, key: MasterKey) -> Self {
        let mut next = self.clone();
        next.keys.insert(version, key);
        next.active_version = version;
        next
    }

    /// Seals `plaintext` under the active key, binding `aad` into the tag.
    pub fn seal(&self, plaintext: &[u8], aad: &[u8]) -> VaultResult<SealedSecret> {
        let key = self
            .keys
            .get(&self.active_version)
            .ok_or(VaultError::MasterKeyNotFound)?;

        let mut nonce = [0u8; NONCE_LEN];
        OsRng.fill_bytes(&mut nonce);

        let mut buffer = plaintext.to_vec();
        let tag = key
            .cipher()
            .encrypt_in_place_detached(&XNonce::from(nonce), aad, &mut buffer)
            .map_err(|_| VaultError::Encryption)?;

        Ok(SealedSecret {
            nonce: nonce.to_vec(),
            ciphertext: buffer,
            auth_tag: tag.to_vec(),
            key_version: self.active_version,
        })
    }

    /// Opens a sealed secret, verifying its tag against `aad`.
    pub(crate) fn open(
        &self,
        sealed: &SealedSecret,
        aad: &[u8],
    ) -> Result<Zeroizing<Vec<u8>>, OpenFailure> {
        let key = self
            .keys
            .get(&sealed.key_version)
            .ok_or(OpenFailure::UnknownKeyVersion(sealed.key_version))?;

        if sealed.nonce.len() != NONCE_LEN || sealed.auth_tag.len() != TAG_LEN {
            return Err(OpenFailure::Malformed);
        }

        let nonce = XNonce::from_slice(&sealed.nonce);
        let tag = Tag::from_slice(&sealed.auth_tag);

        let mut buffer = Zeroizing::new(sealed.ciphertext.clone());
        key.cipher()
            .decrypt_in_place_detached(nonce, aad, buffer.as_mut_slice(), tag)
            .map_err(|_| OpenFailure::Authentication)?;

        Ok(buffer)
    }
}

impl fmt::Debug for Keyring {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Keyring")
            .field("active_version", &self.active_version)
            .field("versions", &self.versions())
            .finish()
    }
}
