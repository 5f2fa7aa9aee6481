//! Platform API key resolution.
//!
//! The key comes from the flag or environment first, then from a local JSON
//! secret file of the form `{"api_key": "..."}`.

use std::path::Path;

use anyhow::{Context, Result};
use serde::Deserialize;

/// Default location of the local secret file.
pub const DEFAULT_SECRETS_FILE: &str = "config/secrets/instantly-config.json";

#[derive(Debug, Deserialize)]
struct SecretFile {
    #[serde(default)]
    api_key: Option<String>,
}

/// Returns the explicit key if set, otherwise the key stored in `secrets_file`.
///
/// # Errors
///
/// Returns an error if no explicit key is given and the file is missing,
/// unreadable, or has no non-empty `api_key`.
pub fn resolve_api_key(explicit: Option<&str>, secrets_file: &Path) -> Result<String> {
    if let Some(key) = explicit.map(str::trim).filter(|k| !k.is_empty()) {
        return Ok(key.to_string());
    }

    let raw = std::fs::read_to_string(secrets_file).with_context(|| {
        format!(
            "No API key configured. Set INSTANTLY_API_KEY or create {}",
            secrets_file.display()
        )
    })?;
    let parsed: SecretFile = serde_json::from_str(&raw)
        .with_context(|| format!("Invalid secret file {}", secrets_file.display()))?;
    parsed
        .api_key
        .map(|k| k.trim().to_string())
        .filter(|k| !k.is_empty())
        .with_context(|| format!("Secret file {} has no api_key", secrets_file.display()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn scratch_file(name: &str, contents: &str) -> PathBuf {
        let path = std::env::temp_dir().join(format!(
            "outreach-secrets-{}-{name}.json",
            std::process::id()
        ));
        std::fs::write(&path, contents).expect("write secret file");
        path
    }

    #[test]
    fn explicit_key_wins() {
        let key = resolve_api_key(Some(" abc "), Path::new("/nonexistent")).unwrap();
        assert_eq!(key, "abc");
    }

    #[test]
    fn falls_back_to_secret_file() {
        let path = scratch_file("ok", r#"{"api_key": "from-file"}"#);
        let key = resolve_api_key(Some(""), &path).unwrap();
        assert_eq!(key, "from-file");
        std::fs::remove_file(path).ok();
    }

    #[test]
    fn missing_key_is_an_error() {
        let path = scratch_file("empty", r#"{"api_key": ""}"#);
        assert!(resolve_api_key(None, &path).is_err());
        std::fs::remove_file(path).ok();
        assert!(resolve_api_key(None, Path::new("/nonexistent/secret.json")).is_err());
    }
}
