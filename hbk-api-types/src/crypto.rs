use std::fmt::{self, Display};
use std::str::FromStr;

use anyhow::{bail, Error};
use serde::{Deserialize, Serialize};

/// Key derivation function used to wrap the repository master key.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum Kdf {
    Scrypt,
    #[serde(rename = "pbkdf2")]
    PBKDF2,
}

impl Display for Kdf {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Kdf::Scrypt => f.write_str("scrypt"),
            Kdf::PBKDF2 => f.write_str("pbkdf2"),
        }
    }
}

impl FromStr for Kdf {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Error> {
        match s {
            "scrypt" => Ok(Kdf::Scrypt),
            "pbkdf2" => Ok(Kdf::PBKDF2),
            other => bail!("unknown key derivation function '{}'", other),
        }
    }
}

/// 32-byte key fingerprint, calculated over a derived key.
#[derive(Debug, Eq, PartialEq, Hash, Clone, Deserialize, Serialize)]
#[serde(transparent)]
pub struct Fingerprint {
    #[serde(with = "hex::serde")]
    bytes: [u8; 32],
}

impl Fingerprint {
    pub fn new(bytes: [u8; 32]) -> Self {
        Self { bytes }
    }

    pub fn bytes(&self) -> &[u8; 32] {
        &self.bytes
    }
}

/// Display as short key id.
impl Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(&self.bytes[0..8]))
    }
}
