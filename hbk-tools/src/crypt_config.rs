//! Wrappers for OpenSSL crypto functions
//!
//! Used to hash and encrypt contents. Hashing is HMAC-SHA256 keyed by a
//! per-repository secret, so content ids do not clash with (or leak to)
//! ids computed for other repositories. Encryption is an AEAD cipher
//! with the content id bound into the associated data, so a ciphertext
//! cannot be transplanted to a different id without failing
//! authentication.

use anyhow::{bail, format_err, Error};
use openssl::hash::MessageDigest;
use openssl::pkcs5::pbkdf2_hmac;
use openssl::symm::Cipher;

/// AEAD tag size for both supported ciphers.
pub const TAG_SIZE: usize = 16;

/// AEAD nonce size for both supported ciphers.
pub const NONCE_SIZE: usize = 12;

/// Supported AEAD ciphers.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CipherSuite {
    Aes256Gcm,
    Chacha20Poly1305,
}

impl CipherSuite {
    fn cipher(&self) -> Cipher {
        match self {
            CipherSuite::Aes256Gcm => Cipher::aes_256_gcm(),
            CipherSuite::Chacha20Poly1305 => Cipher::chacha20_poly1305(),
        }
    }
}

/// Supported content hash functions.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HashKind {
    /// HMAC-SHA256 keyed by the repository HMAC secret.
    HmacSha256,
    /// Unkeyed SHA256. Ids computed this way are equal across
    /// repositories, so this exists only to read old data.
    Sha256,
}

/// Encryption configuration with secret keys
///
/// Stores the master encryption key and the HMAC secret and provides
/// helpers for content hashing and authenticated encryption.
pub struct CryptConfig {
    cipher: Cipher,
    hash: HashKind,
    // The private key used by the cipher.
    enc_key: [u8; 32],
    // Keyed namespace for content digests.
    id_pkey: openssl::pkey::PKey<openssl::pkey::Private>,
    // Derived key used to compute per-content nonces.
    nonce_key: [u8; 32],
}

impl CryptConfig {
    /// Create a new instance.
    ///
    /// A derived 32 byte nonce key is computed from the encryption key
    /// using pbkdf2_hmac, so nonces live in their own key domain.
    pub fn new(
        hash: HashKind,
        suite: CipherSuite,
        enc_key: [u8; 32],
        hmac_secret: [u8; 32],
    ) -> Result<Self, Error> {
        let mut nonce_key = [0u8; 32];

        pbkdf2_hmac(
            &enc_key,
            b"_nonce_key",
            10,
            MessageDigest::sha256(),
            &mut nonce_key,
        )?;

        let id_pkey = openssl::pkey::PKey::hmac(&hmac_secret)?;

        Ok(Self {
            cipher: suite.cipher(),
            hash,
            enc_key,
            id_pkey,
            nonce_key,
        })
    }

    /// Compute a content digest with the configured hash function.
    pub fn compute_digest(&self, data: &[u8]) -> [u8; 32] {
        match self.hash {
            HashKind::HmacSha256 => self.hmac_sha256(data),
            HashKind::Sha256 => openssl::sha::sha256(data),
        }
    }

    /// Compute an authentication tag (HMAC-SHA256) for footer and
    /// manifest signing.
    pub fn compute_auth_tag(&self, data: &[u8]) -> [u8; 32] {
        self.hmac_sha256(data)
    }

    fn hmac_sha256(&self, data: &[u8]) -> [u8; 32] {
        let mut signer =
            openssl::sign::Signer::new(MessageDigest::sha256(), &self.id_pkey).unwrap();
        signer.update(data).unwrap();
        let mut tag = [0u8; 32];
        signer.sign(&mut tag).unwrap();
        tag
    }

    /// Derive the nonce for the given associated data (the content id
    /// bytes for pack payloads, the blob name for standalone blobs).
    fn derive_nonce(&self, ad: &[u8]) -> Result<[u8; NONCE_SIZE], Error> {
        let pkey = openssl::pkey::PKey::hmac(&self.nonce_key)?;
        let mut signer = openssl::sign::Signer::new(MessageDigest::sha256(), &pkey)?;
        signer.update(ad)?;
        let mut mac = [0u8; 32];
        signer.sign(&mut mac)?;
        let mut nonce = [0u8; NONCE_SIZE];
        nonce.copy_from_slice(&mac[..NONCE_SIZE]);
        Ok(nonce)
    }

    /// Encrypt `data`, binding `ad` into the associated data. Returns
    /// ciphertext with the 16 byte authentication tag appended.
    pub fn encrypt(&self, ad: &[u8], data: &[u8]) -> Result<Vec<u8>, Error> {
        let nonce = self.derive_nonce(ad)?;
        let mut tag = [0u8; TAG_SIZE];
        let mut out =
            openssl::symm::encrypt_aead(self.cipher, &self.enc_key, Some(&nonce), ad, data, &mut tag)?;
        out.extend_from_slice(&tag);
        Ok(out)
    }

    /// Decrypt data produced by [encrypt](Self::encrypt) under the same
    /// associated data. Fails on any authentication mismatch.
    pub fn decrypt(&self, ad: &[u8], data: &[u8]) -> Result<Vec<u8>, Error> {
        if data.len() < TAG_SIZE {
            bail!("encrypted payload too short ({} bytes)", data.len());
        }
        let (ciphertext, tag) = data.split_at(data.len() - TAG_SIZE);
        let nonce = self.derive_nonce(ad)?;
        openssl::symm::decrypt_aead(self.cipher, &self.enc_key, Some(&nonce), ad, ciphertext, tag)
            .map_err(|_| format_err!("unable to decrypt payload - authentication failed"))
    }

    /// Computes a fingerprint for the encryption key.
    pub fn fingerprint(&self) -> [u8; 32] {
        let mut input = [0u8; 32];
        let fixed = openssl::sha::sha256(b"hoard backup encryption key fingerprint");
        input.copy_from_slice(&fixed);
        self.compute_digest(&input)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn test_config(suite: CipherSuite) -> CryptConfig {
        CryptConfig::new(HashKind::HmacSha256, suite, [1u8; 32], [2u8; 32]).unwrap()
    }

    #[test]
    fn digest_is_keyed() {
        let a = test_config(CipherSuite::Aes256Gcm);
        let b =
            CryptConfig::new(HashKind::HmacSha256, CipherSuite::Aes256Gcm, [1u8; 32], [3u8; 32])
                .unwrap();
        assert_ne!(a.compute_digest(b"hello"), b.compute_digest(b"hello"));
        assert_eq!(a.compute_digest(b"hello"), a.compute_digest(b"hello"));
    }

    #[test]
    fn plain_sha256_is_unkeyed() {
        let config =
            CryptConfig::new(HashKind::Sha256, CipherSuite::Aes256Gcm, [1u8; 32], [2u8; 32])
                .unwrap();
        assert_eq!(
            config.compute_digest(b"hello"),
            openssl::sha::sha256(b"hello")
        );
    }

    #[test]
    fn encrypt_roundtrip() {
        for suite in [CipherSuite::Aes256Gcm, CipherSuite::Chacha20Poly1305] {
            let config = test_config(suite);
            let ciphertext = config.encrypt(b"id-1", b"payload").unwrap();
            assert_ne!(&ciphertext[..7], b"payload");
            let plain = config.decrypt(b"id-1", &ciphertext).unwrap();
            assert_eq!(plain, b"payload");
        }
    }

    #[test]
    fn ciphertext_not_transplantable() {
        let config = test_config(CipherSuite::Aes256Gcm);
        let ciphertext = config.encrypt(b"id-1", b"payload").unwrap();
        assert!(config.decrypt(b"id-2", &ciphertext).is_err());
    }

    #[test]
    fn tampered_ciphertext_rejected() {
        let config = test_config(CipherSuite::Chacha20Poly1305);
        let mut ciphertext = config.encrypt(b"id-1", b"payload").unwrap();
        ciphertext[0] ^= 1;
        assert!(config.decrypt(b"id-1", &ciphertext).is_err());
    }
}
