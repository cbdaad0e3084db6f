//! API key loading from a `.env` file or the process environment.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use anyhow::Context;
use tracing::{debug, warn};

/// Runtime credentials loaded from a `.env` file.
#[derive(Clone, Default)]
pub struct Credentials {
    vars: BTreeMap<String, String>,
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("keys", &self.vars.keys().collect::<Vec<_>>())
            .field("values", &"[REDACTED]")
            .finish()
    }
}

impl Credentials {
    /// Build credentials from a key-value map.
    pub fn from_map(vars: BTreeMap<String, String>) -> Self {
        Self { vars }
    }

    /// Returns a credential value for a key, if present.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.vars.get(key).map(String::as_str)
    }
}

/// Provider API key. Never printed.
#[derive(Clone, PartialEq, Eq)]
pub struct ApiKey(String);

impl ApiKey {
    /// Wrap a raw key.
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    /// The raw key, for the `Authorization` header only.
    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Debug for ApiKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("ApiKey").field(&"[REDACTED]").finish()
    }
}

/// Load credentials from a specific `.env` path.
///
/// # Errors
///
/// Returns an error if the file does not exist or parsing fails.
pub fn load_credentials(path: &Path) -> anyhow::Result<Credentials> {
    if !path.exists() {
        return Err(anyhow::anyhow!(
            "credentials file does not exist: {}",
            path.display()
        ));
    }

    warn_on_broad_permissions(path);

    let mut vars = BTreeMap::new();
    let iter = dotenvy::from_path_iter(path)
        .with_context(|| format!("failed to read credentials at {}", path.display()))?;

    for item in iter {
        let (key, value) = item.with_context(|| {
            format!(
                "failed to parse key-value entry in credentials file {}",
                path.display()
            )
        })?;
        vars.insert(key, value);
    }

    Ok(Credentials { vars })
}

/// Resolve the API key named `var`.
///
/// The `.env` file at `env_file` is consulted first when it exists, then
/// `env` (normally the process environment).
///
/// # Errors
///
/// Returns an error if the `.env` file is unreadable or no non-empty value
/// is found.
pub fn resolve_api_key(
    env_file: &Path,
    var: &str,
    env: impl Fn(&str) -> Option<String>,
) -> anyhow::Result<ApiKey> {
    if env_file.exists() {
        let credentials = load_credentials(env_file)?;
        if let Some(key) = credentials.get(var).filter(|v| !v.trim().is_empty()) {
            debug!(var, source = %env_file.display(), "api key loaded from env file");
            return Ok(ApiKey::new(key));
        }
    }

    env(var)
        .filter(|v| !v.trim().is_empty())
        .map(ApiKey::new)
        .ok_or_else(|| anyhow::anyhow!("missing required credential: {var}"))
}

#[cfg(unix)]
fn warn_on_broad_permissions(path: &Path) {
    use std::os::unix::fs::PermissionsExt;

    if let Ok(metadata) = fs::metadata(path) {
        let mode = metadata.permissions().mode() & 0o777;
        if mode & 0o077 != 0 {
            warn!(
                path = %path.display(),
                mode = format!("{mode:o}"),
                "credentials file is readable by other users, expected 0600"
            );
        }
    }
}

#[cfg(not(unix))]
fn warn_on_broad_permissions(_path: &Path) {}
