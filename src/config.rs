//! Server settings: CLI flags over environment over TOML file over defaults.

use std::path::Path;
use std::time::Duration;

use clap::ValueEnum;
use serde::Deserialize;

use crate::cli::ServeArgs;
use crate::error::{RelayError, Result};
use crate::providers::{GenerationParams, Provider, STOP_SEQUENCE};
use crate::relay::RelayConfig;
use crate::web::ServerConfig;

pub const DEFAULT_HOST: &str = "127.0.0.1";
pub const DEFAULT_PORT: u16 = 8000;
pub const DEFAULT_MAX_TOKENS: u32 = 100;
pub const DEFAULT_THINK_DELAY_MS: u64 = 1_000;
pub const DEFAULT_IDLE_TIMEOUT_SECS: u64 = 30;
pub const DEFAULT_MOCK_WORD_DELAY_MS: u64 = 100;
pub const DEFAULT_ALLOWED_ORIGINS: &[&str] = &["http://localhost:5173"];

/// Deployment environment; decides cookie attributes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, ValueEnum, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AppEnv {
    #[default]
    Dev,
    Stage,
    Prod,
}

impl AppEnv {
    pub fn is_prod(&self) -> bool {
        matches!(self, AppEnv::Prod)
    }
}

impl std::fmt::Display for AppEnv {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AppEnv::Dev => write!(f, "dev"),
            AppEnv::Stage => write!(f, "stage"),
            AppEnv::Prod => write!(f, "prod"),
        }
    }
}

/// Optional settings read from a TOML file. Every key may be omitted.
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FileConfig {
    pub host: Option<String>,
    pub port: Option<u16>,
    pub provider: Option<Provider>,
    pub model: Option<String>,
    pub max_tokens: Option<u32>,
    pub env: Option<AppEnv>,
    pub allowed_origins: Option<Vec<String>>,
    pub think_delay_ms: Option<u64>,
    pub idle_timeout_secs: Option<u64>,
    pub max_context_tokens: Option<usize>,
    pub mock_word_delay_ms: Option<u64>,
}

impl FileConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        toml::from_str(&text)
            .map_err(|e| RelayError::Config(format!("{}: {}", path.display(), e)))
    }
}

/// Parse a `WHITELIST_DOMAINS` value: a JSON array of origins.
pub fn parse_whitelist(json: &str) -> Result<Vec<String>> {
    serde_json::from_str(json)
        .map_err(|e| RelayError::Config(format!("WHITELIST_DOMAINS must be a JSON array of strings: {e}")))
}

/// Fully resolved server settings.
#[derive(Debug, Clone)]
pub struct Settings {
    pub host: String,
    pub port: u16,
    pub provider: Provider,
    pub model: String,
    pub max_tokens: u32,
    pub env: AppEnv,
    pub allowed_origins: Vec<String>,
    pub think_delay: Duration,
    pub idle_timeout: Duration,
    pub max_context_tokens: Option<usize>,
    pub mock_word_delay: Duration,
}

impl Settings {
    /// Merge CLI flags, the `WHITELIST_DOMAINS` value and the optional config
    /// file named by `--config`.
    pub fn resolve(args: &ServeArgs, whitelist_env: Option<&str>) -> Result<Self> {
        let file = match &args.config {
            Some(path) => FileConfig::load(path)?,
            None => FileConfig::default(),
        };

        let provider = args.provider.or(file.provider).unwrap_or(Provider::Mock);
        let model = args
            .model
            .clone()
            .or(file.model)
            .unwrap_or_else(|| provider.default_model().to_string());

        let allowed_origins = if !args.allowed_origins.is_empty() {
            args.allowed_origins.clone()
        } else if let Some(json) = whitelist_env {
            parse_whitelist(json)?
        } else {
            file.allowed_origins.unwrap_or_else(|| {
                DEFAULT_ALLOWED_ORIGINS.iter().map(|s| s.to_string()).collect()
            })
        };

        let max_tokens = args.max_tokens.or(file.max_tokens).unwrap_or(DEFAULT_MAX_TOKENS);
        if max_tokens == 0 {
            return Err(RelayError::Config("max_tokens must be positive".into()));
        }

        let idle_timeout_secs = args
            .idle_timeout_secs
            .or(file.idle_timeout_secs)
            .unwrap_or(DEFAULT_IDLE_TIMEOUT_SECS);
        if idle_timeout_secs == 0 {
            return Err(RelayError::Config("idle_timeout_secs must be positive".into()));
        }

        Ok(Settings {
            host: args
                .host
                .clone()
                .or(file.host)
                .unwrap_or_else(|| DEFAULT_HOST.to_string()),
            port: args.port.or(file.port).unwrap_or(DEFAULT_PORT),
            provider,
            model,
            max_tokens,
            env: args.app_env.or(file.env).unwrap_or_default(),
            allowed_origins,
            think_delay: Duration::from_millis(
                args.think_delay_ms
                    .or(file.think_delay_ms)
                    .unwrap_or(DEFAULT_THINK_DELAY_MS),
            ),
            idle_timeout: Duration::from_secs(idle_timeout_secs),
            max_context_tokens: args.max_context_tokens.or(file.max_context_tokens),
            mock_word_delay: Duration::from_millis(
                args.mock_word_delay_ms
                    .or(file.mock_word_delay_ms)
                    .unwrap_or(DEFAULT_MOCK_WORD_DELAY_MS),
            ),
        })
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn relay_config(&self) -> RelayConfig {
        RelayConfig {
            think_delay: self.think_delay,
            idle_timeout: self.idle_timeout,
            max_context_tokens: self.max_context_tokens,
        }
    }

    pub fn generation_params(&self) -> GenerationParams {
        GenerationParams {
            model: self.model.clone(),
            max_tokens: self.max_tokens,
            stop: vec![STOP_SEQUENCE.to_string()],
        }
    }

    pub fn server_config(&self) -> ServerConfig {
        ServerConfig {
            env: self.env,
            allowed_origins: self.allowed_origins.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_config(contents: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().expect("tempfile");
        file.write_all(contents.as_bytes()).expect("write");
        file
    }

    #[test]
    fn test_defaults_without_flags_or_file() {
        let s = Settings::resolve(&ServeArgs::default(), None).expect("resolve");
        assert_eq!(s.addr(), "127.0.0.1:8000");
        assert_eq!(s.provider, Provider::Mock);
        assert_eq!(s.model, "mock");
        assert_eq!(s.max_tokens, 100);
        assert_eq!(s.env, AppEnv::Dev);
        assert_eq!(s.allowed_origins, vec!["http://localhost:5173".to_string()]);
        assert_eq!(s.think_delay, Duration::from_secs(1));
        assert_eq!(s.idle_timeout, Duration::from_secs(30));
        assert!(s.max_context_tokens.is_none());
    }

    #[test]
    fn test_provider_picks_its_default_model() {
        let args = ServeArgs {
            provider: Some(Provider::Openai),
            ..Default::default()
        };
        let s = Settings::resolve(&args, None).expect("resolve");
        assert_eq!(s.model, "gpt-4o-mini");
        assert_eq!(s.generation_params().stop, vec!["###".to_string()]);
    }

    #[test]
    fn test_file_values_apply_and_flags_override() {
        let file = write_config(
            r#"
port = 9100
provider = "gemini"
env = "prod"
allowed_origins = ["https://chat.example.com"]
think_delay_ms = 0
max_context_tokens = 2000
"#,
        );
        let args = ServeArgs {
            config: Some(file.path().to_path_buf()),
            port: Some(9200),
            ..Default::default()
        };
        let s = Settings::resolve(&args, None).expect("resolve");
        assert_eq!(s.port, 9200);
        assert_eq!(s.provider, Provider::Gemini);
        assert_eq!(s.model, "gemini-1.5-flash");
        assert!(s.env.is_prod());
        assert_eq!(s.allowed_origins, vec!["https://chat.example.com".to_string()]);
        assert!(s.think_delay.is_zero());
        assert_eq!(s.relay_config().max_context_tokens, Some(2000));
    }

    #[test]
    fn test_unknown_file_key_is_config_error() {
        let file = write_config("prot = 1\n");
        let args = ServeArgs {
            config: Some(file.path().to_path_buf()),
            ..Default::default()
        };
        assert!(matches!(
            Settings::resolve(&args, None),
            Err(RelayError::Config(_))
        ));
    }

    #[test]
    fn test_whitelist_env_beats_file_but_not_flags() {
        let env = r#"["http://a.test","http://b.test"]"#;
        let s = Settings::resolve(&ServeArgs::default(), Some(env)).expect("resolve");
        assert_eq!(s.allowed_origins.len(), 2);

        let args = ServeArgs {
            allowed_origins: vec!["http://c.test".into()],
            ..Default::default()
        };
        let s = Settings::resolve(&args, Some(env)).expect("resolve");
        assert_eq!(s.allowed_origins, vec!["http://c.test".to_string()]);
    }

    #[test]
    fn test_malformed_whitelist_env_is_config_error() {
        assert!(matches!(
            Settings::resolve(&ServeArgs::default(), Some("http://a.test")),
            Err(RelayError::Config(_))
        ));
    }

    #[test]
    fn test_zero_idle_timeout_rejected() {
        let args = ServeArgs {
            idle_timeout_secs: Some(0),
            ..Default::default()
        };
        assert!(Settings::resolve(&args, None).is_err());
    }

    #[test]
    fn test_app_env_display() {
        assert_eq!(AppEnv::Prod.to_string(), "prod");
        assert!(!AppEnv::Stage.is_prod());
    }
}
