//! The format blob: root-of-trust descriptor of a repository.
//!
//! A single well-known, unencrypted JSON blob holding the unique
//! repository id, the key derivation parameters, the password-wrapped
//! master and HMAC keys and the algorithm names. Everything else in
//! the store is encrypted under the master key, so changing the
//! password only re-wraps the keys and never touches stored data.

use anyhow::{bail, format_err, Context, Error};
use serde::{Deserialize, Serialize};

use hbk_api_types::{Fingerprint, Kdf, FORMAT_BLOB_NAME};
use hbk_tools::crypt_config::CryptConfig;
use hbk_tools::serde_helpers::bytes_as_base64;

use crate::blob_store::{BlobStore, PutOptions};
use crate::crypto;
use crate::error::{RepoError, StoreError};

/// Current format blob version.
pub const FORMAT_VERSION: u32 = 1;

/// Key derivation function configuration
#[derive(Deserialize, Serialize, Clone, Debug)]
pub enum KeyDerivationConfig {
    Scrypt {
        n: u64,
        r: u64,
        p: u64,
        #[serde(with = "bytes_as_base64")]
        salt: Vec<u8>,
    },
    PBKDF2 {
        iter: usize,
        #[serde(with = "bytes_as_base64")]
        salt: Vec<u8>,
    },
}

impl KeyDerivationConfig {
    /// Fresh parameters with a random salt.
    pub fn generate(kdf: Kdf) -> Result<Self, Error> {
        let mut salt = vec![0u8; 32];
        openssl::rand::rand_bytes(&mut salt)?;
        Ok(match kdf {
            Kdf::Scrypt => KeyDerivationConfig::Scrypt {
                n: 65536,
                r: 8,
                p: 1,
                salt,
            },
            Kdf::PBKDF2 => KeyDerivationConfig::PBKDF2 { iter: 65535, salt },
        })
    }

    /// Derive a key from provided passphrase
    pub fn derive_key(&self, passphrase: &[u8]) -> Result<[u8; 32], Error> {
        let mut key = [0u8; 32];

        match self {
            KeyDerivationConfig::Scrypt { n, r, p, salt } => {
                // estimated scrypt memory usage is 128*r*n*p
                openssl::pkcs5::scrypt(passphrase, salt, *n, *r, *p, 1025 * 1024 * 1024, &mut key)?;

                Ok(key)
            }
            KeyDerivationConfig::PBKDF2 { iter, salt } => {
                openssl::pkcs5::pbkdf2_hmac(
                    passphrase,
                    salt,
                    *iter,
                    openssl::hash::MessageDigest::sha256(),
                    &mut key,
                )?;

                Ok(key)
            }
        }
    }
}

/// The repository keys unlocked from the format blob.
pub struct RepositoryKeys {
    pub master_key: [u8; 32],
    pub hmac_secret: [u8; 32],
}

impl RepositoryKeys {
    /// Instantiate the crypter configured in `format`.
    pub fn crypt_config(&self, format: &FormatBlob) -> Result<CryptConfig, Error> {
        crypto::crypt_config_for(
            &format.hash,
            &format.encryption,
            self.master_key,
            self.hmac_secret,
        )
    }
}

// Wrapped key layout: IV (16) || TAG (16) || ciphertext.
const WRAP_IV_SIZE: usize = 16;
const WRAP_TAG_SIZE: usize = 16;

fn wrap_key(kek: &[u8; 32], key: &[u8; 32]) -> Result<Vec<u8>, Error> {
    let cipher = openssl::symm::Cipher::aes_256_gcm();

    let mut iv = vec![0u8; WRAP_IV_SIZE];
    openssl::rand::rand_bytes(&mut iv)?;
    let mut tag = [0u8; WRAP_TAG_SIZE];

    let encrypted = openssl::symm::encrypt_aead(cipher, kek, Some(&iv), b"", key, &mut tag)?;

    let mut data = Vec::with_capacity(WRAP_IV_SIZE + WRAP_TAG_SIZE + encrypted.len());
    data.extend_from_slice(&iv);
    data.extend_from_slice(&tag);
    data.extend_from_slice(&encrypted);
    Ok(data)
}

fn unwrap_key(kek: &[u8; 32], data: &[u8]) -> Result<[u8; 32], Error> {
    if data.len() < WRAP_IV_SIZE + WRAP_TAG_SIZE {
        bail!("wrapped key too short ({} bytes)", data.len());
    }
    let iv = &data[0..WRAP_IV_SIZE];
    let tag = &data[WRAP_IV_SIZE..WRAP_IV_SIZE + WRAP_TAG_SIZE];
    let encrypted = &data[WRAP_IV_SIZE + WRAP_TAG_SIZE..];

    let cipher = openssl::symm::Cipher::aes_256_gcm();
    let key = openssl::symm::decrypt_aead(cipher, kek, Some(iv), b"", encrypted, tag)
        .map_err(|_| RepoError::InvalidPassword)?;

    if key.len() != 32 {
        bail!("unwrapped key has wrong length ({} bytes)", key.len());
    }
    let mut result = [0u8; 32];
    result.copy_from_slice(&key);
    Ok(result)
}

fn default_splitter_name() -> String {
    crate::splitter::DEFAULT_SPLITTER.to_string()
}

/// Serialized form of the format blob.
#[derive(Deserialize, Serialize, Clone, Debug)]
#[serde(rename_all = "camelCase")]
pub struct FormatBlob {
    /// Opaque repository identity; two distinct repositories always
    /// have distinct ids.
    #[serde(rename = "uniqueID", with = "bytes_as_base64")]
    unique_id: Vec<u8>,
    version: u32,
    kdf: KeyDerivationConfig,
    #[serde(with = "bytes_as_base64")]
    wrapped_master_key: Vec<u8>,
    #[serde(with = "bytes_as_base64")]
    wrapped_hmac_secret: Vec<u8>,
    hash: String,
    encryption: String,
    #[serde(default = "default_splitter_name")]
    splitter: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    #[serde(default)]
    fingerprint: Option<Fingerprint>,
    /// Pointer to the blob holding object-lock policy, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    #[serde(default)]
    blob_cfg: Option<String>,
}

impl FormatBlob {
    /// Create a fresh format blob with random keys, wrapped under
    /// `password`.
    pub fn create(
        password: &str,
        kdf: Kdf,
        hash: &str,
        encryption: &str,
    ) -> Result<(Self, RepositoryKeys), Error> {
        // fail early on unknown or deprecated algorithm names
        crypto::hash_kind_by_name(hash, true)?;
        crypto::cipher_suite_by_name(encryption, true)?;

        let mut unique_id = vec![0u8; 32];
        openssl::rand::rand_bytes(&mut unique_id)?;

        let mut master_key = [0u8; 32];
        openssl::rand::rand_bytes(&mut master_key)?;
        let mut hmac_secret = [0u8; 32];
        openssl::rand::rand_bytes(&mut hmac_secret)?;

        let kdf = KeyDerivationConfig::generate(kdf)?;
        let kek = kdf.derive_key(password.as_bytes())?;

        let keys = RepositoryKeys {
            master_key,
            hmac_secret,
        };

        let mut format = Self {
            unique_id,
            version: FORMAT_VERSION,
            kdf,
            wrapped_master_key: wrap_key(&kek, &master_key)?,
            wrapped_hmac_secret: wrap_key(&kek, &hmac_secret)?,
            hash: hash.to_string(),
            encryption: encryption.to_string(),
            splitter: default_splitter_name(),
            fingerprint: None,
            blob_cfg: None,
        };
        format.fingerprint = Some(Fingerprint::new(
            keys.crypt_config(&format)?.fingerprint(),
        ));

        Ok((format, keys))
    }

    /// Unwrap the repository keys with `password`.
    pub fn unlock(&self, password: &str) -> Result<RepositoryKeys, Error> {
        if self.version != FORMAT_VERSION {
            bail!(RepoError::UnsupportedFormat(self.version));
        }
        let kek = self.kdf.derive_key(password.as_bytes())?;
        let keys = RepositoryKeys {
            master_key: unwrap_key(&kek, &self.wrapped_master_key)?,
            hmac_secret: unwrap_key(&kek, &self.wrapped_hmac_secret)?,
        };

        if let Some(ref stored) = self.fingerprint {
            let fingerprint = Fingerprint::new(keys.crypt_config(self)?.fingerprint());
            if &fingerprint != stored {
                // a password that survives the AEAD unwrap but fails
                // the fingerprint check is still a wrong password
                return Err(RepoError::InvalidPassword.into());
            }
        }

        Ok(keys)
    }

    /// Re-wrap the keys under a new password. The master key itself is
    /// unchanged, so every previously written content stays readable.
    pub fn change_password(&mut self, old_password: &str, new_password: &str) -> Result<(), Error> {
        let keys = self.unlock(old_password)?;

        let kdf = match self.kdf {
            KeyDerivationConfig::Scrypt { .. } => KeyDerivationConfig::generate(Kdf::Scrypt)?,
            KeyDerivationConfig::PBKDF2 { .. } => KeyDerivationConfig::generate(Kdf::PBKDF2)?,
        };
        let kek = kdf.derive_key(new_password.as_bytes())?;

        self.kdf = kdf;
        self.wrapped_master_key = wrap_key(&kek, &keys.master_key)?;
        self.wrapped_hmac_secret = wrap_key(&kek, &keys.hmac_secret)?;
        Ok(())
    }

    pub fn unique_id(&self) -> &[u8] {
        &self.unique_id
    }

    pub fn hash(&self) -> &str {
        &self.hash
    }

    pub fn encryption(&self) -> &str {
        &self.encryption
    }

    /// Name of the splitter every client of this repository must use.
    pub fn splitter(&self) -> &str {
        &self.splitter
    }

    /// Load the format blob, or fail with [StoreError::NotFound] if the
    /// store holds no repository.
    pub fn load(store: &dyn BlobStore) -> Result<Self, Error> {
        let id = FORMAT_BLOB_NAME.into();
        let data = store.get_blob(&id, 0, None)?;
        serde_json::from_slice(&data).context("unable to parse repository format blob")
    }

    /// Whether the store already holds a format blob.
    pub fn exists(store: &dyn BlobStore) -> Result<bool, Error> {
        match store.get_metadata(&FORMAT_BLOB_NAME.into()) {
            Ok(_) => Ok(true),
            Err(err) => match err.downcast_ref::<StoreError>() {
                Some(StoreError::NotFound(_)) => Ok(false),
                _ => Err(err),
            },
        }
    }

    /// Atomically (re)write the format blob.
    pub fn store(&self, store: &dyn BlobStore) -> Result<(), Error> {
        let data = serde_json::to_vec_pretty(self)?;
        store
            .put_blob(&FORMAT_BLOB_NAME.into(), &data, &PutOptions::default())
            .map_err(|err| format_err!("unable to write format blob - {}", err))
    }
}
