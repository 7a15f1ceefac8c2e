//! Runtime configuration for the authorization server and credential storage.

use serde::Deserialize;
use std::fs;
use std::path::PathBuf;
use std::time::Duration;

/// Default OAuth authority (device code and token endpoints live under it)
const DEFAULT_AUTHORITY_URL: &str = "https://login.microsoftonline.com/common/oauth2/v2.0";

const DEFAULT_CLIENT_ID: &str = "14d82eec-204b-4c2f-b7e8-296a70dab67e";

const DEFAULT_SCOPE: &str = "offline_access User.Read Mail.Read Calendars.Read";

/// Refresh this long before the access token actually expires
pub const DEFAULT_EXPIRY_BUFFER_SECS: u64 = 5 * 60;

/// 5s x 180 = 15 minutes of polling
pub const DEFAULT_MAX_POLL_ATTEMPTS: u32 = 180;
pub const DEFAULT_POLL_INTERVAL_SECS: u64 = 5;

const DEFAULT_HTTP_TIMEOUT_SECS: u64 = 30;

/// Environment variable names
const ENV_CLIENT_ID: &str = "TOKENKEEPER_CLIENT_ID";
const ENV_SCOPE: &str = "TOKENKEEPER_SCOPE";
const ENV_AUTHORITY_URL: &str = "TOKENKEEPER_AUTHORITY_URL";
const ENV_STORAGE_DIR: &str = "TOKENKEEPER_STORAGE_DIR";

/// Configuration file structure
#[derive(Debug, Deserialize, Default)]
struct ConfigFile {
    oauth: Option<OAuthSection>,
    storage: Option<StorageSection>,
}

#[derive(Debug, Deserialize, Default)]
struct OAuthSection {
    client_id: Option<String>,
    scope: Option<String>,
    /// Base URL; `/devicecode` and `/token` are appended
    authority_url: Option<String>,
    /// Explicit endpoint overrides
    device_code_url: Option<String>,
    token_url: Option<String>,
    expiry_buffer_secs: Option<u64>,
    max_poll_attempts: Option<u32>,
    default_poll_interval_secs: Option<u64>,
    http_timeout_secs: Option<u64>,
}

#[derive(Debug, Deserialize, Default)]
struct StorageSection {
    dir: Option<PathBuf>,
}

/// Where the configuration came from
#[derive(Debug, Clone, PartialEq)]
pub enum ConfigSource {
    /// Using default hardcoded values
    Default,
    /// Loaded from environment variable
    Environment,
    /// Loaded from config file
    ConfigFile,
}

impl std::fmt::Display for ConfigSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigSource::Default => write!(f, "default"),
            ConfigSource::Environment => write!(f, "environment variable"),
            ConfigSource::ConfigFile => write!(f, "config file"),
        }
    }
}

/// Runtime configuration for the credential manager
#[derive(Debug, Clone)]
pub struct AuthConfig {
    pub client_id: String,
    pub scope: String,
    pub device_code_url: String,
    pub token_url: String,
    /// Directory holding the encrypted token and device-code files
    pub storage_dir: PathBuf,
    pub expiry_buffer: Duration,
    pub max_poll_attempts: u32,
    /// Used when the server omits `interval`
    pub default_poll_interval: Duration,
    pub http_timeout: Duration,
    /// Source of the endpoint configuration (for logging)
    pub source: ConfigSource,
}

impl AuthConfig {
    /// Configuration pointing both endpoints under one authority URL.
    pub fn with_authority(authority_url: &str, client_id: &str, storage_dir: PathBuf) -> Self {
        let authority = authority_url.trim().trim_end_matches('/');
        Self {
            client_id: client_id.to_string(),
            scope: DEFAULT_SCOPE.to_string(),
            device_code_url: format!("{}/devicecode", authority),
            token_url: format!("{}/token", authority),
            storage_dir,
            expiry_buffer: Duration::from_secs(DEFAULT_EXPIRY_BUFFER_SECS),
            max_poll_attempts: DEFAULT_MAX_POLL_ATTEMPTS,
            default_poll_interval: Duration::from_secs(DEFAULT_POLL_INTERVAL_SECS),
            http_timeout: Duration::from_secs(DEFAULT_HTTP_TIMEOUT_SECS),
            source: ConfigSource::Default,
        }
    }

    pub fn tokens_path(&self) -> PathBuf {
        self.storage_dir.join("tokens.json")
    }

    pub fn device_code_path(&self) -> PathBuf {
        self.storage_dir.join("device_code.json")
    }
}

/// Get the tokenkeeper config directory
pub fn get_config_dir() -> Option<PathBuf> {
    dirs::config_dir()
        .or_else(|| dirs::home_dir().map(|h| h.join(".config")))
        .map(|p| p.join("tokenkeeper"))
}

/// Get the path to the configuration file
fn get_config_file_path() -> Option<PathBuf> {
    get_config_dir().map(|p| p.join("config.toml"))
}

fn default_storage_dir() -> PathBuf {
    get_config_dir().unwrap_or_else(|| PathBuf::from(".tokenkeeper"))
}

/// Load configuration from the config file
fn load_config_file() -> Option<ConfigFile> {
    let path = get_config_file_path()?;

    if !path.exists() {
        return None;
    }

    match fs::read_to_string(&path) {
        Ok(content) => parse_config_file(&content)
            .inspect(|_| tracing::debug!("Loaded config from {:?}", path)),
        Err(e) => {
            tracing::warn!("Failed to read config file {:?}: {}", path, e);
            None
        }
    }
}

fn parse_config_file(content: &str) -> Option<ConfigFile> {
    match toml::from_str(content) {
        Ok(config) => Some(config),
        Err(e) => {
            tracing::warn!("Failed to parse config file: {}", e);
            None
        }
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

/// Load configuration with priority:
/// 1. Environment variables (TOKENKEEPER_*)
/// 2. Config file (~/.config/tokenkeeper/config.toml)
/// 3. Default values
pub fn load_auth_config() -> AuthConfig {
    resolve_config(|name| std::env::var(name).ok(), load_config_file())
}

fn resolve_config<E>(env: E, file: Option<ConfigFile>) -> AuthConfig
where
    E: Fn(&str) -> Option<String>,
{
    let file = file.unwrap_or_default();
    let oauth = file.oauth.unwrap_or_default();
    let storage = file.storage.unwrap_or_default();

    let mut source = ConfigSource::Default;

    // Endpoints: env authority > file endpoints/authority > default
    let authority = if let Some(url) = non_empty(env(ENV_AUTHORITY_URL)) {
        tracing::info!("Using authority URL from environment variable: {}", url);
        source = ConfigSource::Environment;
        url
    } else if let Some(url) = non_empty(oauth.authority_url) {
        tracing::info!("Using authority URL from config file: {}", url);
        source = ConfigSource::ConfigFile;
        url
    } else {
        DEFAULT_AUTHORITY_URL.to_string()
    };

    let client_id = non_empty(env(ENV_CLIENT_ID))
        .or_else(|| non_empty(oauth.client_id))
        .unwrap_or_else(|| DEFAULT_CLIENT_ID.to_string());

    let storage_dir = non_empty(env(ENV_STORAGE_DIR))
        .map(PathBuf::from)
        .or(storage.dir)
        .unwrap_or_else(default_storage_dir);

    let mut config = AuthConfig::with_authority(&authority, &client_id, storage_dir);

    if source != ConfigSource::Environment {
        if let Some(url) = non_empty(oauth.device_code_url) {
            config.device_code_url = url;
            source = ConfigSource::ConfigFile;
        }
        if let Some(url) = non_empty(oauth.token_url) {
            config.token_url = url;
            source = ConfigSource::ConfigFile;
        }
    }

    if let Some(scope) = non_empty(env(ENV_SCOPE)).or_else(|| non_empty(oauth.scope)) {
        config.scope = scope;
    }
    if let Some(secs) = oauth.expiry_buffer_secs {
        config.expiry_buffer = Duration::from_secs(secs);
    }
    if let Some(attempts) = oauth.max_poll_attempts.filter(|a| *a > 0) {
        config.max_poll_attempts = attempts;
    }
    if let Some(secs) = oauth.default_poll_interval_secs.filter(|s| *s > 0) {
        config.default_poll_interval = Duration::from_secs(secs);
    }
    if let Some(secs) = oauth.http_timeout_secs.filter(|s| *s > 0) {
        config.http_timeout = Duration::from_secs(secs);
    }

    config.source = source;
    tracing::debug!(
        "Auth config: token endpoint {} (from {})",
        config.token_url,
        config.source
    );
    config
}

/// Get the path to the config file for documentation purposes
pub fn get_config_file_path_string() -> String {
    get_config_file_path()
        .map(|p| p.display().to_string())
        .unwrap_or_else(|| "~/.config/tokenkeeper/config.toml".to_string())
}

/// Generate example config file content
pub fn generate_example_config() -> String {
    r#"# Tokenkeeper Configuration
# Place this file at: ~/.config/tokenkeeper/config.toml

[oauth]
# Application (client) ID registered with the authorization server
# client_id = "00000000-0000-0000-0000-000000000000"

# Space-separated scopes; include offline_access to receive a refresh token
# scope = "offline_access User.Read"

# Authority base URL; /devicecode and /token are appended
# authority_url = "https://login.example.com/tenant/oauth2/v2.0"

# Refresh this many seconds before the access token expires (default: 300)
# expiry_buffer_secs = 300

# Maximum device-code poll attempts (default: 180)
# max_poll_attempts = 180

# Poll interval when the server does not send one (default: 5)
# default_poll_interval_secs = 5

[storage]
# Directory for the encrypted token files
# dir = "/var/lib/tokenkeeper"
"#
    .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| map.get(name).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = resolve_config(env_from(&[]), None);
        assert_eq!(config.source, ConfigSource::Default);
        assert_eq!(config.client_id, DEFAULT_CLIENT_ID);
        assert_eq!(config.token_url, format!("{}/token", DEFAULT_AUTHORITY_URL));
        assert_eq!(config.expiry_buffer, Duration::from_secs(300));
        assert_eq!(config.max_poll_attempts, 180);
        assert!(config.scope.contains("offline_access"));
    }

    #[test]
    fn test_environment_overrides_file() {
        let file = parse_config_file(
            r#"
[oauth]
client_id = "from-file"
authority_url = "https://file.example.com/oauth2/"
"#,
        );
        let env = env_from(&[
            (ENV_AUTHORITY_URL, "https://env.example.com/oauth2/"),
            (ENV_STORAGE_DIR, "/tmp/tk-store"),
        ]);

        let config = resolve_config(env, file);
        assert_eq!(config.source, ConfigSource::Environment);
        assert_eq!(config.device_code_url, "https://env.example.com/oauth2/devicecode");
        assert_eq!(config.token_url, "https://env.example.com/oauth2/token");
        // Not overridden by env, so the file value stands
        assert_eq!(config.client_id, "from-file");
        assert_eq!(config.storage_dir, PathBuf::from("/tmp/tk-store"));
    }

    #[test]
    fn test_file_settings() {
        let file = parse_config_file(
            r#"
[oauth]
token_url = "https://idp.example.com/connect/token"
scope = "openid offline_access"
expiry_buffer_secs = 60
max_poll_attempts = 0
default_poll_interval_secs = 2

[storage]
dir = "/srv/tk"
"#,
        );

        let config = resolve_config(env_from(&[]), file);
        assert_eq!(config.source, ConfigSource::ConfigFile);
        assert_eq!(config.token_url, "https://idp.example.com/connect/token");
        assert_eq!(config.scope, "openid offline_access");
        assert_eq!(config.expiry_buffer, Duration::from_secs(60));
        // zero attempts is ignored
        assert_eq!(config.max_poll_attempts, DEFAULT_MAX_POLL_ATTEMPTS);
        assert_eq!(config.default_poll_interval, Duration::from_secs(2));
        assert_eq!(config.tokens_path(), PathBuf::from("/srv/tk/tokens.json"));
        assert_eq!(config.device_code_path(), PathBuf::from("/srv/tk/device_code.json"));
    }

    #[test]
    fn test_invalid_file_is_ignored() {
        assert!(parse_config_file("[oauth\nclient_id = ").is_none());
    }

    #[test]
    fn test_example_config_parses() {
        assert!(parse_config_file(&generate_example_config()).is_some());
    }
}
