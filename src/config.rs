//! Configuration for the model provider and the sandbox connection
//!
//! Values come from the process environment (a `.env` file is loaded first by
//! the binary). Lookups go through a closure so tests never touch the real
//! environment.

use std::time::Duration;

use thiserror::Error;

use crate::sandbox::protocol::{DEFAULT_PASSWORD, DEFAULT_PORT, DEFAULT_USERNAME, DEFAULT_WORKDIR};
use crate::sandbox::SandboxConfig;

/// Error type for configuration loading
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("API key not found. Set {var} in the environment or the .env file")]
    MissingApiKey { var: &'static str },

    #[error("invalid value {value:?} for {var}")]
    InvalidValue { var: &'static str, value: String },
}

/// Supported OpenAI-compatible providers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum)]
pub enum ProviderKind {
    #[value(name = "openai")]
    OpenAi,
    #[default]
    #[value(name = "deepseek")]
    DeepSeek,
}

impl ProviderKind {
    pub fn base_url(self) -> &'static str {
        match self {
            ProviderKind::OpenAi => "https://api.openai.com/v1",
            ProviderKind::DeepSeek => "https://api.deepseek.com/beta",
        }
    }

    pub fn default_model(self) -> &'static str {
        match self {
            ProviderKind::OpenAi => "gpt-4o-mini",
            ProviderKind::DeepSeek => "deepseek-chat",
        }
    }

    /// Environment variable holding the API key
    pub fn key_var(self) -> &'static str {
        match self {
            ProviderKind::OpenAi => "OPENAI_KEY",
            ProviderKind::DeepSeek => "DEEPSEEK_KEY",
        }
    }
}

/// Connection settings for the completion endpoint
#[derive(Debug, Clone)]
pub struct ProviderConfig {
    pub kind: ProviderKind,
    pub base_url: String,
    pub api_key: String,
    pub model: String,
}

impl ProviderConfig {
    /// Load from the process environment
    pub fn from_env(kind: ProviderKind, model: Option<String>) -> Result<Self, ConfigError> {
        Self::from_lookup(kind, model, |k| std::env::var(k).ok())
    }

    /// Load using a custom variable lookup
    ///
    /// `<PROVIDER>_BASE_URL` (e.g. `OPENAI_BASE_URL`) overrides the endpoint.
    pub fn from_lookup<F>(kind: ProviderKind, model: Option<String>, lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = kind.key_var();
        let api_key = lookup(var)
            .filter(|k| !k.trim().is_empty())
            .ok_or(ConfigError::MissingApiKey { var })?;

        let base_override = match kind {
            ProviderKind::OpenAi => lookup("OPENAI_BASE_URL"),
            ProviderKind::DeepSeek => lookup("DEEPSEEK_BASE_URL"),
        };

        Ok(Self {
            kind,
            base_url: base_override.unwrap_or_else(|| kind.base_url().to_string()),
            api_key,
            model: model.unwrap_or_else(|| kind.default_model().to_string()),
        })
    }
}

impl SandboxConfig {
    /// Load from the process environment
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|k| std::env::var(k).ok())
    }

    /// Load using a custom variable lookup
    ///
    /// The bootstrap credentials (port 2222, `python`/`python`) apply only
    /// when none of `SANDBOX_HOST`, `SANDBOX_PORT`, `SANDBOX_USER` and
    /// `SANDBOX_PASSWORD` is set.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let host = lookup("SANDBOX_HOST");
        let port = lookup("SANDBOX_PORT");
        let username = lookup("SANDBOX_USER");
        let password = lookup("SANDBOX_PASSWORD");
        let workdir = lookup("SANDBOX_WORKDIR").unwrap_or_else(|| DEFAULT_WORKDIR.to_string());
        let connect_timeout = match lookup("SANDBOX_CONNECT_TIMEOUT_SECS") {
            Some(v) => Duration::from_secs(parse_var("SANDBOX_CONNECT_TIMEOUT_SECS", &v)?),
            None => SandboxConfig::default().connect_timeout,
        };

        if host.is_none() && port.is_none() && username.is_none() && password.is_none() {
            return Ok(SandboxConfig {
                workdir,
                connect_timeout,
                ..SandboxConfig::default()
            });
        }

        let port = match port {
            Some(v) => parse_var("SANDBOX_PORT", &v)?,
            None => DEFAULT_PORT,
        };

        Ok(SandboxConfig {
            host: host.unwrap_or_else(|| "127.0.0.1".to_string()),
            port,
            username: username.unwrap_or_else(|| DEFAULT_USERNAME.to_string()),
            password: password.unwrap_or_else(|| DEFAULT_PASSWORD.to_string()),
            workdir,
            connect_timeout,
        })
    }
}

fn parse_var<T: std::str::FromStr>(var: &'static str, value: &str) -> Result<T, ConfigError> {
    value.trim().parse().map_err(|_| ConfigError::InvalidValue {
        var,
        value: value.to_string(),
    })
}
