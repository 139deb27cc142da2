//! Algorithm registries.
//!
//! Hash, encryption and compression algorithms are selected by name at
//! repository creation; the chosen names are recorded in the format
//! blob and drive instantiation on every open. Deprecated entries stay
//! readable but are refused for new repositories.

use anyhow::{bail, Error};

use hbk_tools::crypt_config::{CipherSuite, CryptConfig, HashKind};

/// Default hash for new repositories.
pub const DEFAULT_HASH: &str = "hmac-sha256";

/// Default cipher for new repositories.
pub const DEFAULT_ENCRYPTION: &str = "aes-256-gcm";

/// One registry entry.
#[derive(Clone, Copy, Debug)]
pub struct AlgorithmInfo {
    pub name: &'static str,
    pub deprecated: bool,
}

const HASH_ALGORITHMS: &[(AlgorithmInfo, HashKind)] = &[
    (
        AlgorithmInfo {
            name: "hmac-sha256",
            deprecated: false,
        },
        HashKind::HmacSha256,
    ),
    (
        // unkeyed ids are comparable across repositories, which leaks
        // content equality - kept for reading old repositories only
        AlgorithmInfo {
            name: "sha256",
            deprecated: true,
        },
        HashKind::Sha256,
    ),
];

const ENCRYPTION_ALGORITHMS: &[(AlgorithmInfo, CipherSuite)] = &[
    (
        AlgorithmInfo {
            name: "aes-256-gcm",
            deprecated: false,
        },
        CipherSuite::Aes256Gcm,
    ),
    (
        AlgorithmInfo {
            name: "chacha20-poly1305",
            deprecated: false,
        },
        CipherSuite::Chacha20Poly1305,
    ),
];

/// All registered hash algorithms.
pub fn supported_hash_algorithms() -> impl Iterator<Item = AlgorithmInfo> {
    HASH_ALGORITHMS.iter().map(|(info, _)| *info)
}

/// All registered encryption algorithms.
pub fn supported_encryption_algorithms() -> impl Iterator<Item = AlgorithmInfo> {
    ENCRYPTION_ALGORITHMS.iter().map(|(info, _)| *info)
}

fn lookup<T: Copy>(
    registry: &'static [(AlgorithmInfo, T)],
    what: &str,
    name: &str,
    for_new_repository: bool,
) -> Result<T, Error> {
    for (info, value) in registry {
        if info.name == name {
            if for_new_repository && info.deprecated {
                bail!(
                    "{} algorithm '{}' is deprecated and refused for new repositories",
                    what,
                    name
                );
            }
            return Ok(*value);
        }
    }
    bail!("unknown {} algorithm '{}'", what, name);
}

/// Resolve a hash algorithm name.
pub fn hash_kind_by_name(name: &str, for_new_repository: bool) -> Result<HashKind, Error> {
    lookup(HASH_ALGORITHMS, "hash", name, for_new_repository)
}

/// Resolve an encryption algorithm name.
pub fn cipher_suite_by_name(name: &str, for_new_repository: bool) -> Result<CipherSuite, Error> {
    lookup(ENCRYPTION_ALGORITHMS, "encryption", name, for_new_repository)
}

/// Instantiate the crypter for the given algorithm names and keys.
pub fn crypt_config_for(
    hash_name: &str,
    encryption_name: &str,
    master_key: [u8; 32],
    hmac_secret: [u8; 32],
) -> Result<CryptConfig, Error> {
    let hash = hash_kind_by_name(hash_name, false)?;
    let suite = cipher_suite_by_name(encryption_name, false)?;
    CryptConfig::new(hash, suite, master_key, hmac_secret)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn registry_lookups() {
        assert!(hash_kind_by_name("hmac-sha256", true).is_ok());
        // deprecated: readable, not creatable
        assert!(hash_kind_by_name("sha256", false).is_ok());
        assert!(hash_kind_by_name("sha256", true).is_err());
        assert!(hash_kind_by_name("md5", false).is_err());

        assert!(cipher_suite_by_name("aes-256-gcm", true).is_ok());
        assert!(cipher_suite_by_name("chacha20-poly1305", true).is_ok());
        assert!(cipher_suite_by_name("des", false).is_err());
    }

    #[test]
    fn defaults_are_registered() {
        assert!(hash_kind_by_name(DEFAULT_HASH, true).is_ok());
        assert!(cipher_suite_by_name(DEFAULT_ENCRYPTION, true).is_ok());
    }
}
