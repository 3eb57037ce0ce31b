use clap::Parser;
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

/// Parley conversation and authorization server
#[derive(Parser, Serialize, Deserialize, Clone, Debug)]
#[command(name = "parley-server", version, about = "Parley conversation and authorization server")]
pub struct Config {
    /// Port to listen on
    #[arg(long, env = "PARLEY_PORT", default_value = "8088")]
    pub port: u16,

    /// Bind address
    #[arg(long, env = "PARLEY_BIND_ADDRESS", default_value = "0.0.0.0")]
    pub bind_address: String,

    /// Path to TOML config file
    #[arg(long, default_value = "./parley.toml")]
    pub config: String,

    /// Enable structured JSON logging (for Docker/production)
    #[arg(long, env = "PARLEY_JSON_LOGS")]
    pub json_logs: bool,

    /// Output a commented TOML config template and exit
    #[arg(long)]
    pub generate_config: bool,

    /// Data directory for persistent state (DB, keys)
    #[arg(long, env = "PARLEY_DATA_DIR", default_value = "./data")]
    pub data_dir: String,

    /// Shared token expected in X-Internal-Auth on /internal and
    /// update-last-message calls. Unset means trusted-network only.
    #[arg(long, env = "PARLEY_INTERNAL_TOKEN")]
    pub internal_token: Option<String>,

    /// Chat limits (loaded from [chat] section in TOML)
    #[arg(skip)]
    #[serde(default)]
    pub chat: ChatConfig,
}

/// Limits applied by the conversation endpoints.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatConfig {
    /// Upper bound accepted for a conversation's max_subroom_depth setting (default: 64)
    #[serde(default = "default_max_subroom_depth_limit")]
    pub max_subroom_depth_limit: u32,

    /// Characters kept from last_message_preview (default: 255)
    #[serde(default = "default_preview_max_chars")]
    pub preview_max_chars: usize,
}

impl Default for ChatConfig {
    fn default() -> Self {
        Self {
            max_subroom_depth_limit: 64,
            preview_max_chars: 255,
        }
    }
}

fn default_max_subroom_depth_limit() -> u32 {
    64
}

fn default_preview_max_chars() -> usize {
    255
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: 8088,
            bind_address: "0.0.0.0".to_string(),
            config: "./parley.toml".to_string(),
            json_logs: false,
            generate_config: false,
            data_dir: "./data".to_string(),
            internal_token: None,
            chat: ChatConfig::default(),
        }
    }
}

impl Config {
    /// Load config with layered precedence:
    /// built-in defaults < TOML file < env vars (PARLEY_*) < CLI args
    pub fn load() -> Result<Self, figment::Error> {
        let cli = Config::parse();
        let config_path = cli.config.clone();

        Self::figment(&config_path)
            .merge(Serialized::defaults(cli))
            .extract()
    }

    fn figment(config_path: &str) -> Figment {
        Figment::new()
            .merge(Serialized::defaults(Config::default()))
            .merge(Toml::file(config_path))
            .merge(Env::prefixed("PARLEY_"))
    }
}

/// Generate a commented TOML config template
pub fn generate_config_template() -> String {
    r#"# Parley Server Configuration
# Place this file at ./parley.toml or specify with --config <path>
# All settings can be overridden via environment variables (PARLEY_PORT, etc.)
# or CLI flags (--port, etc.)

# Server port (default: 8088)
# port = 8088

# Bind address (default: 0.0.0.0, all interfaces)
# bind_address = "0.0.0.0"

# Enable structured JSON logging for Docker/production
# json_logs = false

# Data directory for the SQLite database and JWT signing key
# data_dir = "./data"

# Shared secret for internal callers (accounts sync, message service).
# Sent as the X-Internal-Auth header. Leave unset to rely on network isolation.
# internal_token = ""

# ---- Chat ----
# [chat]

# Largest max_subroom_depth a conversation may configure (default: 64)
# max_subroom_depth_limit = 64

# Characters kept from last_message_preview (default: 255)
# preview_max_chars = 255
"#
    .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_template_parses_as_toml_defaults() {
        let config: Config = Figment::new()
            .merge(Serialized::defaults(Config::default()))
            .merge(Toml::string(&generate_config_template()))
            .extract()
            .unwrap();
        assert_eq!(config.port, 8088);
        assert_eq!(config.chat.preview_max_chars, 255);
        assert!(config.internal_token.is_none());
    }

    #[test]
    fn test_chat_section_overrides() {
        let config: Config = Figment::new()
            .merge(Serialized::defaults(Config::default()))
            .merge(Toml::string("port = 9000\n[chat]\nmax_subroom_depth_limit = 16\n"))
            .extract()
            .unwrap();
        assert_eq!(config.port, 9000);
        assert_eq!(config.chat.max_subroom_depth_limit, 16);
        assert_eq!(config.chat.preview_max_chars, 255);
    }
}
