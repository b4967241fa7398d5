//! Access token resolution for gated model repos and the hosted endpoint.
//!
//! Tokens come from a file when a path is given (the file variant supports
//! deployments that mount credentials read-only) and from the environment
//! otherwise.

use std::path::Path;

use anyhow::{bail, Context, Result};
use tracing::{debug, warn};

/// Environment variable holding the Hugging Face Hub access token.
pub const HUB_TOKEN_ENV: &str = "HF_TOKEN";

/// Environment variable holding the bearer token for the hosted endpoint.
pub const REMOTE_TOKEN_ENV: &str = "REMOTE_ACCESS_TOKEN";

/// Read a token from a file, trimming the trailing newline most token files
/// carry.
pub fn read_token_file(path: &Path) -> Result<String> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read token file {}", path.display()))?;
    let token = raw.trim();
    if token.is_empty() {
        bail!("Token file {} is empty", path.display());
    }
    Ok(token.to_string())
}

/// Resolve the Hub token used to download gated checkpoints.
///
/// Checks the token file argument first, then `HF_TOKEN`. A missing token is
/// not an error here: public repos download without one, and gated repos fail
/// later with a clear 403 from the hub.
pub fn resolve_hub_token(token_file: Option<&Path>) -> Result<Option<String>> {
    if let Some(path) = token_file {
        return read_token_file(path).map(Some);
    }
    match std::env::var(HUB_TOKEN_ENV) {
        Ok(token) if !token.trim().is_empty() => {
            debug!("Using Hub token from {HUB_TOKEN_ENV}");
            Ok(Some(token.trim().to_string()))
        }
        _ => {
            warn!("{HUB_TOKEN_ENV} not set: gated models (FLUX.1-dev) will fail to download");
            Ok(None)
        }
    }
}

/// Resolve the bearer token for the hosted prediction endpoint.
///
/// Unlike the hub token this one is mandatory: the endpoint rejects
/// unauthenticated calls outright.
pub fn resolve_remote_token(token_file: Option<&Path>) -> Result<String> {
    if let Some(path) = token_file {
        return read_token_file(path);
    }
    match std::env::var(REMOTE_TOKEN_ENV) {
        Ok(token) if !token.trim().is_empty() => Ok(token.trim().to_string()),
        _ => bail!(
            "No access token for the hosted endpoint: pass --token-file or set {REMOTE_TOKEN_ENV}"
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn token_file_is_trimmed() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("token");
        let mut f = std::fs::File::create(&path).unwrap();
        writeln!(f, "hf_abc123  ").unwrap();
        assert_eq!(read_token_file(&path).unwrap(), "hf_abc123");
    }

    #[test]
    fn empty_token_file_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("token");
        std::fs::write(&path, "\n").unwrap();
        assert!(read_token_file(&path).is_err());
    }

    #[test]
    fn missing_token_file_reports_path() {
        let err = read_token_file(Path::new("/nonexistent/token")).unwrap_err();
        assert!(err.to_string().contains("/nonexistent/token"));
    }

    #[test]
    fn explicit_file_takes_precedence() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("token");
        std::fs::write(&path, "from-file").unwrap();
        let token = resolve_hub_token(Some(&path)).unwrap();
        assert_eq!(token.as_deref(), Some("from-file"));
    }
}
