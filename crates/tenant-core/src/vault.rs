//! Credential vault (C1).
//!
//! The vault is a pure, storage-free wrap/unwrap contract over a keyring of
//! versioned AES-256-GCM keys. Callers own persistence; the vault only ever
//! sees plaintext credentials and opaque cipher blobs, never a database
//! connection.
//!
//! # Key rotation
//!
//! Every blob is tagged with the key version that produced it. Rotating in
//! a new key only changes which version [`Vault::wrap`] stamps on new
//! blobs — older blobs keep unwrapping against their original version until
//! they are explicitly rewrapped (see [`Vault::rewrap`]). There is no
//! background re-encryption; rewrap is driven by the caller (typically the
//! job engine, as a scheduled maintenance job).

use std::collections::BTreeMap;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;

use crate::crypto::{self, EncryptionKey};
use crate::error::VaultError;

/// Length of the serialized header before the base64 ciphertext: one
/// version byte.
const HEADER_LEN: usize = 1;

/// An opaque, versioned, authenticated ciphertext.
///
/// Serializes to `base64(version_byte || nonce || ciphertext || tag)` so it
/// round-trips cleanly through a single `TEXT` column.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CipherBlob {
    version: u8,
    payload: Vec<u8>,
}

impl CipherBlob {
    /// The key version that produced this blob.
    #[must_use]
    pub fn version(&self) -> u8 {
        self.version
    }

    /// Serialize to the wire/storage representation.
    #[must_use]
    pub fn to_encoded(&self) -> String {
        let mut raw = Vec::with_capacity(HEADER_LEN + self.payload.len());
        raw.push(self.version);
        raw.extend_from_slice(&self.payload);
        BASE64.encode(raw)
    }

    /// Parse the wire/storage representation produced by [`to_encoded`](Self::to_encoded).
    ///
    /// # Errors
    ///
    /// Returns [`VaultError::MalformedBlob`] if the string is not valid
    /// base64 or is shorter than the header.
    pub fn from_encoded(encoded: &str) -> Result<Self, VaultError> {
        let raw = BASE64
            .decode(encoded)
            .map_err(|e| VaultError::MalformedBlob {
                reason: e.to_string(),
            })?;
        if raw.len() <= HEADER_LEN {
            return Err(VaultError::MalformedBlob {
                reason: format!("blob too short: {} bytes", raw.len()),
            });
        }
        let (header, payload) = raw.split_at(HEADER_LEN);
        Ok(Self {
            version: header[0],
            payload: payload.to_vec(),
        })
    }
}

/// A wrap/unwrap contract over a ring of versioned encryption keys.
///
/// `wrap` always stamps the current (highest) key version. `unwrap` looks
/// up whichever version the blob was stamped with, so old blobs keep
/// working across a rotation without a flag day.
pub struct Vault {
    current_version: u8,
    keys: BTreeMap<u8, EncryptionKey>,
}

impl Vault {
    /// Start a vault with a single key at version 1.
    #[must_use]
    pub fn new(key: EncryptionKey) -> Self {
        let mut keys = BTreeMap::new();
        keys.insert(1, key);
        Self {
            current_version: 1,
            keys,
        }
    }

    /// Rebuild a vault from an explicit version -> key map, e.g. when
    /// restoring key material from a secrets manager at startup.
    ///
    /// # Errors
    ///
    /// Returns [`VaultError::InvalidKeyMaterial`] if `keys` is empty.
    pub fn from_keyring(keys: BTreeMap<u8, EncryptionKey>) -> Result<Self, VaultError> {
        let current_version = *keys.keys().next_back().ok_or(VaultError::InvalidKeyMaterial {
            reason: "keyring must contain at least one key".to_owned(),
        })?;
        Ok(Self {
            current_version,
            keys,
        })
    }

    /// Register a new key as the current version, making it the target of
    /// all future [`wrap`](Self::wrap) calls while keeping every prior
    /// version available for [`unwrap`](Self::unwrap).
    pub fn rotate_in(&mut self, new_version: u8, key: EncryptionKey) {
        self.keys.insert(new_version, key);
        if new_version > self.current_version {
            self.current_version = new_version;
        }
    }

    /// The key version that [`wrap`](Self::wrap) currently stamps blobs with.
    #[must_use]
    pub fn current_version(&self) -> u8 {
        self.current_version
    }

    /// Encrypt plaintext under the current key version.
    ///
    /// # Errors
    ///
    /// Returns [`VaultError::InvalidKeyMaterial`] if the keyring has no key
    /// for `current_version` (unreachable in practice — every constructor
    /// guarantees the invariant — but not a panic-worthy one), or
    /// [`VaultError::Crypto`] if the AEAD operation fails.
    pub fn wrap(&self, plaintext: &[u8]) -> Result<CipherBlob, VaultError> {
        let key = self
            .keys
            .get(&self.current_version)
            .ok_or(VaultError::InvalidKeyMaterial {
                reason: format!("no key registered for current version {}", self.current_version),
            })?;
        let payload = crypto::encrypt(key, plaintext)?;
        Ok(CipherBlob {
            version: self.current_version,
            payload,
        })
    }

    /// Decrypt a blob, using whichever key version it was wrapped with.
    ///
    /// # Errors
    ///
    /// - [`VaultError::UnknownKeyVersion`] if the blob's version is not in
    ///   the keyring (the key was retired before the blob was rewrapped).
    /// - [`VaultError::Crypto`] if decryption/authentication fails.
    pub fn unwrap(&self, blob: &CipherBlob) -> Result<Vec<u8>, VaultError> {
        let key = self
            .keys
            .get(&blob.version)
            .ok_or(VaultError::UnknownKeyVersion {
                version: blob.version,
            })?;
        Ok(crypto::decrypt(key, &blob.payload)?)
    }

    /// Unwrap a blob and immediately re-wrap it under the current key
    /// version. Used to migrate a credential off a retiring key version
    /// without ever exposing the plaintext to the caller.
    ///
    /// # Errors
    ///
    /// Propagates [`unwrap`](Self::unwrap) and [`wrap`](Self::wrap) errors.
    pub fn rewrap(&self, blob: &CipherBlob) -> Result<CipherBlob, VaultError> {
        if blob.version == self.current_version {
            return Ok(blob.clone());
        }
        let plaintext = self.unwrap(blob)?;
        self.wrap(&plaintext)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn wrap_unwrap_roundtrip() {
        let vault = Vault::new(EncryptionKey::generate());
        let plaintext = b"shpat_abc123";
        let blob = vault.wrap(plaintext).unwrap();
        assert_eq!(vault.unwrap(&blob).unwrap(), plaintext);
    }

    #[test]
    fn cipher_blob_roundtrips_through_encoded_string() {
        let vault = Vault::new(EncryptionKey::generate());
        let blob = vault.wrap(b"secret").unwrap();
        let encoded = blob.to_encoded();
        let parsed = CipherBlob::from_encoded(&encoded).unwrap();
        assert_eq!(vault.unwrap(&parsed).unwrap(), b"secret");
    }

    #[test]
    fn from_encoded_rejects_garbage() {
        assert!(CipherBlob::from_encoded("not valid base64!!!").is_err());
        assert!(CipherBlob::from_encoded(&BASE64.encode("x")).is_err());
    }

    #[test]
    fn old_blob_unwraps_after_rotation() {
        let mut vault = Vault::new(EncryptionKey::generate());
        let old_blob = vault.wrap(b"pre-rotation secret").unwrap();

        vault.rotate_in(2, EncryptionKey::generate());
        assert_eq!(vault.current_version(), 2);

        // Old blob, stamped with version 1, must still unwrap.
        assert_eq!(vault.unwrap(&old_blob).unwrap(), b"pre-rotation secret");

        // New wraps use the new version.
        let new_blob = vault.wrap(b"post-rotation secret").unwrap();
        assert_eq!(new_blob.version(), 2);
    }

    #[test]
    fn unwrap_unknown_version_fails() {
        let vault = Vault::new(EncryptionKey::generate());
        let foreign_blob = CipherBlob {
            version: 99,
            payload: vec![0u8; 32],
        };
        assert!(matches!(
            vault.unwrap(&foreign_blob),
            Err(VaultError::UnknownKeyVersion { version: 99 })
        ));
    }

    #[test]
    fn rewrap_migrates_to_current_version() {
        let mut vault = Vault::new(EncryptionKey::generate());
        let old_blob = vault.wrap(b"needs migrating").unwrap();
        vault.rotate_in(2, EncryptionKey::generate());

        let rewrapped = vault.rewrap(&old_blob).unwrap();
        assert_eq!(rewrapped.version(), 2);
        assert_eq!(vault.unwrap(&rewrapped).unwrap(), b"needs migrating");
    }

    #[test]
    fn rewrap_on_current_version_is_a_no_op() {
        let vault = Vault::new(EncryptionKey::generate());
        let blob = vault.wrap(b"already current").unwrap();
        let rewrapped = vault.rewrap(&blob).unwrap();
        assert_eq!(blob, rewrapped);
    }

    #[test]
    fn from_keyring_rejects_empty_map() {
        let result = Vault::from_keyring(BTreeMap::new());
        assert!(matches!(result, Err(VaultError::InvalidKeyMaterial { .. })));
    }
}
