//! Environment-backed configuration.
//!
//! Precedence for every knob:
//! 1) explicit override (CLI flag)
//! 2) environment variable
//! 3) default

use std::time::Duration;

use crate::error::ConfigError;

pub const TABLETALK_MAX_TOOL_ROUNDS_ENV: &str = "TABLETALK_MAX_TOOL_ROUNDS";
pub const TABLETALK_BACKEND_TIMEOUT_SECS_ENV: &str = "TABLETALK_BACKEND_TIMEOUT_SECS";
pub const TABLETALK_MODEL_TIMEOUT_SECS_ENV: &str = "TABLETALK_MODEL_TIMEOUT_SECS";
pub const TABLETALK_ALLOWED_HOSTS_ENV: &str = "TABLETALK_ALLOWED_HOSTS";
pub const TABLETALK_REST_PREFIX_ENV: &str = "TABLETALK_REST_PREFIX";
pub const TABLETALK_SQL_RPC_ENV: &str = "TABLETALK_SQL_RPC";
pub const TABLETALK_MODEL_API_KEY_ENV: &str = "TABLETALK_MODEL_API_KEY";
pub const OPENAI_API_KEY_ENV: &str = "OPENAI_API_KEY";
pub const OPENAI_BASE_URL_ENV: &str = "OPENAI_BASE_URL";
pub const OPENAI_MODEL_ENV: &str = "OPENAI_MODEL";

pub const DEFAULT_MAX_TOOL_ROUNDS: usize = 15;
/// Upper bound for `TABLETALK_MAX_TOOL_ROUNDS`. Deployments normally run in the
/// 10-15 band around the default; values up to this bound are accepted for
/// schemas whose questions need long describe/select chains.
pub const MAX_TOOL_ROUNDS_CAP: usize = 64;
pub const DEFAULT_BACKEND_TIMEOUT_SECS: u64 = 30;
pub const DEFAULT_MODEL_TIMEOUT_SECS: u64 = 120;
pub const DEFAULT_REST_PREFIX: &str = "/rest/v1";
pub const DEFAULT_SQL_RPC: &str = "exec_sql";
pub const DEFAULT_OPENAI_BASE_URL: &str = "https://api.openai.com/v1";
pub const DEFAULT_OPENAI_MODEL: &str = "gpt-4o-mini";

/// Settings for one running instance of the service.
#[derive(Debug, Clone)]
pub struct CoreConfig {
    pub max_tool_rounds: usize,
    pub backend_timeout: Duration,
    pub model_timeout: Duration,
    /// Host suffixes a connection endpoint must end with. Empty accepts any host.
    pub allowed_hosts: Vec<String>,
    pub rest_prefix: String,
    pub sql_rpc: String,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            max_tool_rounds: DEFAULT_MAX_TOOL_ROUNDS,
            backend_timeout: Duration::from_secs(DEFAULT_BACKEND_TIMEOUT_SECS),
            model_timeout: Duration::from_secs(DEFAULT_MODEL_TIMEOUT_SECS),
            allowed_hosts: Vec::new(),
            rest_prefix: DEFAULT_REST_PREFIX.to_string(),
            sql_rpc: DEFAULT_SQL_RPC.to_string(),
        }
    }
}

impl CoreConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Ok(Self {
            max_tool_rounds: env_usize(
                TABLETALK_MAX_TOOL_ROUNDS_ENV,
                DEFAULT_MAX_TOOL_ROUNDS,
                1,
                MAX_TOOL_ROUNDS_CAP,
            )?,
            backend_timeout: env_secs(
                TABLETALK_BACKEND_TIMEOUT_SECS_ENV,
                DEFAULT_BACKEND_TIMEOUT_SECS,
            )?,
            model_timeout: env_secs(TABLETALK_MODEL_TIMEOUT_SECS_ENV, DEFAULT_MODEL_TIMEOUT_SECS)?,
            allowed_hosts: env_list(TABLETALK_ALLOWED_HOSTS_ENV)?,
            rest_prefix: normalize_rest_prefix(
                &env_string(TABLETALK_REST_PREFIX_ENV)?
                    .unwrap_or_else(|| DEFAULT_REST_PREFIX.to_string()),
            ),
            sql_rpc: env_string(TABLETALK_SQL_RPC_ENV)?
                .unwrap_or_else(|| DEFAULT_SQL_RPC.to_string()),
        })
    }

    /// Apply a CLI override of the round cap, clamped like the env value.
    pub fn with_max_tool_rounds(mut self, rounds: usize) -> Self {
        self.max_tool_rounds = rounds.clamp(1, MAX_TOOL_ROUNDS_CAP);
        self
    }
}

/// Model service settings (OpenAI-compatible chat completions).
#[derive(Debug, Clone)]
pub struct ModelConfig {
    pub api_key: String,
    pub base_url: String,
    pub model: String,
    pub timeout: Duration,
}

impl ModelConfig {
    /// Reads the key from `TABLETALK_MODEL_API_KEY`, falling back to `OPENAI_API_KEY`.
    /// A missing key is not an error here; the model reports it on first use.
    pub fn from_env(timeout: Duration) -> Result<Self, ConfigError> {
        let api_key = match env_string(TABLETALK_MODEL_API_KEY_ENV)? {
            Some(k) => k,
            None => env_string(OPENAI_API_KEY_ENV)?.unwrap_or_default(),
        };
        Ok(Self {
            api_key,
            base_url: env_string(OPENAI_BASE_URL_ENV)?
                .unwrap_or_else(|| DEFAULT_OPENAI_BASE_URL.to_string()),
            model: env_string(OPENAI_MODEL_ENV)?
                .unwrap_or_else(|| DEFAULT_OPENAI_MODEL.to_string()),
            timeout,
        })
    }
}

fn env_string(name: &'static str) -> Result<Option<String>, ConfigError> {
    match std::env::var(name) {
        Ok(v) => {
            let v = v.trim();
            Ok(if v.is_empty() {
                None
            } else {
                Some(v.to_string())
            })
        }
        Err(std::env::VarError::NotPresent) => Ok(None),
        Err(source) => Err(ConfigError::Unreadable { name, source }),
    }
}

fn env_usize(
    name: &'static str,
    default: usize,
    min: usize,
    max: usize,
) -> Result<usize, ConfigError> {
    let Some(v) = env_string(name)? else {
        return Ok(default);
    };
    parse_bounded_usize(name, &v, min, max)
}

fn parse_bounded_usize(
    name: &'static str,
    v: &str,
    min: usize,
    max: usize,
) -> Result<usize, ConfigError> {
    let n = v.parse::<usize>().map_err(|_| ConfigError::Invalid {
        name,
        value: v.to_string(),
        expected: "expected a non-negative integer",
    })?;
    Ok(n.clamp(min, max))
}

fn env_secs(name: &'static str, default: u64) -> Result<Duration, ConfigError> {
    let Some(v) = env_string(name)? else {
        return Ok(Duration::from_secs(default));
    };
    let secs = v.parse::<u64>().map_err(|_| ConfigError::Invalid {
        name,
        value: v.clone(),
        expected: "expected integer seconds",
    })?;
    if secs == 0 {
        return Err(ConfigError::Invalid {
            name,
            value: v,
            expected: "timeouts cannot be disabled; use at least 1",
        });
    }
    Ok(Duration::from_secs(secs))
}

fn env_list(name: &'static str) -> Result<Vec<String>, ConfigError> {
    Ok(env_string(name)?
        .map(|v| parse_host_list(&v))
        .unwrap_or_default())
}

pub fn parse_host_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(|s| s.trim().trim_start_matches('.').to_ascii_lowercase())
        .filter(|s| !s.is_empty())
        .collect()
}

pub fn normalize_rest_prefix(prefix: &str) -> String {
    let trimmed = prefix.trim().trim_end_matches('/');
    if trimmed.is_empty() {
        return String::new();
    }
    if trimmed.starts_with('/') {
        trimmed.to_string()
    } else {
        format!("/{trimmed}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bounded_usize_clamps_into_range() {
        assert_eq!(parse_bounded_usize("X", "0", 1, 64).unwrap(), 1);
        assert_eq!(parse_bounded_usize("X", "12", 1, 64).unwrap(), 12);
        assert_eq!(parse_bounded_usize("X", "500", 1, 64).unwrap(), 64);
        assert!(parse_bounded_usize("X", "many", 1, 64).is_err());
    }

    #[test]
    fn host_list_is_normalized() {
        assert_eq!(
            parse_host_list(" supabase.co, .Supabase.IN ,,"),
            vec!["supabase.co".to_string(), "supabase.in".to_string()]
        );
    }

    #[test]
    fn rest_prefix_gets_a_leading_slash_and_no_trailing_one() {
        assert_eq!(normalize_rest_prefix("rest/v1/"), "/rest/v1");
        assert_eq!(normalize_rest_prefix("/api"), "/api");
        assert_eq!(normalize_rest_prefix("/"), "");
    }

    #[test]
    fn round_override_is_clamped() {
        let config = CoreConfig::default().with_max_tool_rounds(1000);
        assert_eq!(config.max_tool_rounds, MAX_TOOL_ROUNDS_CAP);
        let config = CoreConfig::default().with_max_tool_rounds(0);
        assert_eq!(config.max_tool_rounds, 1);
    }
}
