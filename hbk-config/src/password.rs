use std::path::PathBuf;

use anyhow::{bail, Context, Error};
use serde::{Deserialize, Serialize};

/// Where the repository password comes from.
///
/// Evaluation happens on the client before the core is involved; the
/// core only ever sees the resulting string.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum PasswordSource {
    /// Directly configured value (e.g. from a command line flag).
    Plain { password: String },
    /// Read from an environment variable.
    Env { name: String },
    /// First line of a file.
    File { path: PathBuf },
    /// No persisted password; the caller has to prompt.
    None,
}

impl PasswordSource {
    /// Evaluate the source to the actual password string.
    pub fn evaluate(&self) -> Result<String, Error> {
        match self {
            PasswordSource::Plain { password } => Ok(password.clone()),
            PasswordSource::Env { name } => std::env::var(name)
                .with_context(|| format!("password environment variable '{}' not set", name)),
            PasswordSource::File { path } => {
                let data = hbk_tools::fs::file_get_contents(path)?;
                let text = String::from_utf8(data)
                    .with_context(|| format!("password file {:?} is not valid utf-8", path))?;
                match text.lines().next() {
                    Some(line) if !line.is_empty() => Ok(line.to_string()),
                    _ => bail!("password file {:?} is empty", path),
                }
            }
            PasswordSource::None => bail!("no password source configured"),
        }
    }
}
