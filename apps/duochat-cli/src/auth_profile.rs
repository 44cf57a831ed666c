//! Remembered login metadata used by the startup session restore.

use std::{fs, path::Path};

use backend_platform::{remove_file_if_present, write_atomically};
use serde::{Deserialize, Serialize};

/// Non-secret login metadata remembered between runs.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AuthProfile {
    /// API base the session belongs to.
    pub api_base: String,
    /// Username or email used for the last successful login.
    pub login: String,
    /// Whether session restore should be attempted on startup.
    pub restore_on_start: bool,
}

impl AuthProfile {
    /// Restore applies only to the API base it was recorded for.
    pub fn restores_for(&self, api_base: &str) -> bool {
        self.restore_on_start
            && self.api_base.trim_end_matches('/') == api_base.trim_end_matches('/')
    }
}

/// Load profile JSON from disk when available.
pub fn load_auth_profile(path: &Path) -> Result<Option<AuthProfile>, String> {
    let raw = match fs::read_to_string(path) {
        Ok(raw) => raw,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(err) => {
            return Err(format!(
                "failed reading auth profile {}: {err}",
                path.display()
            ));
        }
    };

    let profile = serde_json::from_str::<AuthProfile>(&raw)
        .map_err(|err| format!("failed parsing auth profile {}: {err}", path.display()))?;
    Ok(Some(profile))
}

pub fn save_auth_profile(path: &Path, profile: &AuthProfile) -> Result<(), String> {
    let encoded = serde_json::to_vec_pretty(profile).map_err(|err| err.to_string())?;
    write_atomically(path, &encoded)
}

pub fn clear_auth_profile(path: &Path) -> Result<(), String> {
    remove_file_if_present(path)
}
