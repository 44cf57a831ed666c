//! Environment-backed runtime configuration for `duochat-cli`.

use std::{env, path::PathBuf};

use backend_core::BackendInitConfig;
use backend_rest::push_base_for_api;
use thiserror::Error;

const DEFAULT_API_BASE: &str = "http://localhost:8000/";
const DEFAULT_DATA_DIR: &str = "./.duochat-cli-store";
const LOGIN_PROFILE_FILENAME: &str = "login-profile.json";
const CREDENTIALS_FILENAME: &str = "credentials.json";

/// Where the access token is persisted between runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CredentialStoreKind {
    /// JSON file under the data dir.
    File,
    /// Process memory only; every run starts logged out.
    Memory,
    /// OS keyring (needs the `os-keyring` feature).
    Keyring,
}

/// Runtime configuration used by the CLI.
#[derive(Debug, Clone, PartialEq)]
pub struct CliConfig {
    pub api_base: String,
    pub push_base: String,
    /// Optional login prefill; with a password present the CLI logs in on start.
    pub login: Option<String>,
    pub password: Option<String>,
    pub data_dir: PathBuf,
    pub credential_store: CredentialStoreKind,
    /// Backend runtime tuning forwarded to `BackendCommand::Init`.
    pub init_config: Option<BackendInitConfig>,
}

impl CliConfig {
    /// Parse configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    fn from_lookup<F>(mut lookup: F) -> Result<Self, ConfigError>
    where
        F: FnMut(&str) -> Option<String>,
    {
        let api_base = optional_trimmed_env("DUOCHAT_API_BASE", &mut lookup)
            .unwrap_or_else(|| DEFAULT_API_BASE.to_owned());
        let push_base = optional_trimmed_env("DUOCHAT_PUSH_BASE", &mut lookup)
            .unwrap_or_else(|| push_base_for_api(&api_base));
        let login = optional_trimmed_env("DUOCHAT_LOGIN", &mut lookup);
        let password = lookup("DUOCHAT_PASSWORD").filter(|value| !value.is_empty());
        let data_dir = optional_trimmed_env("DUOCHAT_DATA_DIR", &mut lookup)
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_DATA_DIR));

        let credential_store = match optional_trimmed_env("DUOCHAT_CREDENTIAL_STORE", &mut lookup)
            .as_deref()
        {
            None | Some("file") => CredentialStoreKind::File,
            Some("memory") => CredentialStoreKind::Memory,
            Some("keyring") => CredentialStoreKind::Keyring,
            Some(other) => {
                return Err(ConfigError::InvalidValue {
                    key: "DUOCHAT_CREDENTIAL_STORE",
                    value: other.to_owned(),
                    reason: "expected one of file, memory, keyring".to_owned(),
                });
            }
        };

        let page_size = parse_positive_u16("DUOCHAT_PAGE_SIZE", &mut lookup)?;
        let refresh_page_size = parse_positive_u16("DUOCHAT_REFRESH_PAGE_SIZE", &mut lookup)?;
        let refresh_interval_ms = parse_optional_u64("DUOCHAT_REFRESH_INTERVAL_MS", &mut lookup)?;
        if refresh_interval_ms == Some(0) {
            return Err(ConfigError::InvalidValue {
                key: "DUOCHAT_REFRESH_INTERVAL_MS",
                value: "0".to_owned(),
                reason: "must be greater than 0".to_owned(),
            });
        }
        let read_min_interval_ms =
            parse_optional_u64("DUOCHAT_READ_MIN_INTERVAL_MS", &mut lookup)?;
        let max_pending_files = parse_optional_usize("DUOCHAT_MAX_PENDING_FILES", &mut lookup)?;
        let search_min_length = parse_optional_usize("DUOCHAT_SEARCH_MIN_LENGTH", &mut lookup)?;

        let init = BackendInitConfig {
            page_size,
            refresh_page_size,
            refresh_interval_ms,
            read_min_interval_ms,
            max_pending_files,
            search_min_length,
        };
        let init_config = (init != BackendInitConfig::default()).then_some(init);

        Ok(Self {
            api_base,
            push_base,
            login,
            password,
            data_dir,
            credential_store,
            init_config,
        })
    }

    /// Location of the remembered login profile.
    pub fn auth_profile_path(&self) -> PathBuf {
        self.data_dir.join(LOGIN_PROFILE_FILENAME)
    }

    /// Location of the file-backed credential store.
    pub fn credentials_path(&self) -> PathBuf {
        self.data_dir.join(CREDENTIALS_FILENAME)
    }
}

/// Errors produced while parsing runtime configuration.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    /// An environment variable could not be parsed.
    #[error("invalid {key}='{value}': {reason}")]
    InvalidValue {
        key: &'static str,
        value: String,
        reason: String,
    },
}

fn optional_trimmed_env<F>(key: &'static str, lookup: &mut F) -> Option<String>
where
    F: FnMut(&str) -> Option<String>,
{
    lookup(key)
        .map(|value| value.trim().to_owned())
        .filter(|value| !value.is_empty())
}

fn parse_optional<T, F>(key: &'static str, lookup: &mut F) -> Result<Option<T>, ConfigError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
    F: FnMut(&str) -> Option<String>,
{
    let Some(value) = optional_trimmed_env(key, lookup) else {
        return Ok(None);
    };
    value
        .parse::<T>()
        .map(Some)
        .map_err(|err| ConfigError::InvalidValue {
            key,
            value,
            reason: err.to_string(),
        })
}

fn parse_optional_u64<F>(key: &'static str, lookup: &mut F) -> Result<Option<u64>, ConfigError>
where
    F: FnMut(&str) -> Option<String>,
{
    parse_optional(key, lookup)
}

fn parse_optional_usize<F>(key: &'static str, lookup: &mut F) -> Result<Option<usize>, ConfigError>
where
    F: FnMut(&str) -> Option<String>,
{
    parse_optional(key, lookup)
}

fn parse_positive_u16<F>(key: &'static str, lookup: &mut F) -> Result<Option<u16>, ConfigError>
where
    F: FnMut(&str) -> Option<String>,
{
    match parse_optional::<u16, F>(key, lookup)? {
        Some(0) => Err(ConfigError::InvalidValue {
            key,
            value: "0".to_owned(),
            reason: "must be at least 1".to_owned(),
        }),
        other => Ok(other),
    }
}
