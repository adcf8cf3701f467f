//! Tokens handed to CI jobs so they can call back into the platform.

use std::path::Path;

#[derive(Debug, thiserror::Error)]
pub enum TokenError {
    #[error("cannot read token file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("token file {0} is empty")]
    Empty(String),

    #[error("token issuer unavailable: {0}")]
    Unavailable(String),
}

/// Mints the credential a CI job of `project` runs with.
pub trait TokenIssuer: Send + Sync {
    fn issue(&self, project: &str, job: &str) -> Result<String, TokenError>;
}

/// Hands out one pre-provisioned token to every job.
#[derive(Clone)]
pub struct StaticTokenIssuer {
    token: String,
}

impl std::fmt::Debug for StaticTokenIssuer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StaticTokenIssuer")
            .field("token", &"<redacted>")
            .finish()
    }
}

impl StaticTokenIssuer {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
        }
    }

    /// Reads and trims the token file. Failure here is fatal at startup.
    pub async fn from_file(path: impl AsRef<Path>) -> Result<Self, TokenError> {
        let path = path.as_ref();
        let display = path.display().to_string();
        let raw = tokio::fs::read_to_string(path)
            .await
            .map_err(|source| TokenError::Read {
                path: display.clone(),
                source,
            })?;
        let token = raw.trim();
        if token.is_empty() {
            return Err(TokenError::Empty(display));
        }
        Ok(Self::new(token))
    }
}

impl TokenIssuer for StaticTokenIssuer {
    fn issue(&self, _project: &str, _job: &str) -> Result<String, TokenError> {
        Ok(self.token.clone())
    }
}
