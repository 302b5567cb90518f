use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use super::ConfigError;

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    pub bridge: BridgeConfig,
    #[serde(default)]
    pub registration: RegistrationConfig,
    #[serde(default)]
    pub bot: BotConfig,
    pub database: DatabaseConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub limits: LimitsConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct BridgeConfig {
    pub domain: String,
    #[serde(default)]
    pub homeserver_url: String,
    #[serde(default = "default_bind_address")]
    pub bind_address: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RegistrationConfig {
    #[serde(default, alias = "id")]
    pub bridge_id: String,
    #[serde(default, alias = "as_token")]
    pub appservice_token: String,
    #[serde(default, alias = "hs_token")]
    pub homeserver_token: String,
    #[serde(default = "default_sender_localpart")]
    pub sender_localpart: String,
}

impl Default for RegistrationConfig {
    fn default() -> Self {
        Self {
            bridge_id: String::new(),
            appservice_token: String::new(),
            homeserver_token: String::new(),
            sender_localpart: default_sender_localpart(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct BotConfig {
    #[serde(default = "default_displayname")]
    pub displayname: String,
    #[serde(default)]
    pub avatar: Option<String>,
    #[serde(default = "default_control_room_name")]
    pub control_room_name: String,
    #[serde(default = "default_presence_interval")]
    pub presence_interval: u64,
    #[serde(default)]
    pub disable_presence: bool,
}

impl Default for BotConfig {
    fn default() -> Self {
        Self {
            displayname: default_displayname(),
            avatar: None,
            control_room_name: default_control_room_name(),
            presence_interval: default_presence_interval(),
            disable_presence: false,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DatabaseConfig {
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub filename: Option<String>,
}

impl DatabaseConfig {
    pub fn connection_string(&self) -> String {
        if let Some(ref url) = self.url {
            url.clone()
        } else if let Some(ref file) = self.filename {
            format!("sqlite://{}", file)
        } else {
            String::new()
        }
    }

    pub fn sqlite_path(&self) -> Option<String> {
        let url = self.connection_string();
        url.strip_prefix("sqlite://").map(ToOwned::to_owned)
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LoggingConfig {
    #[serde(alias = "console", default = "default_log_level")]
    pub level: String,
    #[serde(default = "default_log_format")]
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LimitsConfig {
    #[serde(default = "default_request_retry_delay_ms")]
    pub request_retry_delay_ms: u64,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            request_retry_delay_ms: default_request_retry_delay_ms(),
            request_timeout_secs: default_request_timeout_secs(),
        }
    }
}

impl Config {
    pub fn load_from_file<P: AsRef<Path>>(
        path: P,
        registration_path: Option<&Path>,
    ) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(&path)?;
        let mut config = Self::from_yaml(&content)?;
        config.load_registration(path.as_ref(), registration_path)?;
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    pub fn from_yaml(content: &str) -> Result<Self, ConfigError> {
        let mut config: Config = serde_yaml::from_str(content)?;
        config.normalize();
        Ok(config)
    }

    pub fn bot_user_id(&self) -> String {
        format!(
            "@{}:{}",
            self.registration.sender_localpart, self.bridge.domain
        )
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.bridge.domain.is_empty() {
            return Err(ConfigError::InvalidConfig(
                "bridge.domain cannot be empty".to_string(),
            ));
        }

        if self.bridge.homeserver_url.is_empty() {
            return Err(ConfigError::InvalidConfig(
                "bridge.homeserver_url cannot be empty".to_string(),
            ));
        }

        if url::Url::parse(&self.bridge.homeserver_url).is_err() {
            return Err(ConfigError::InvalidConfig(format!(
                "bridge.homeserver_url is not a valid URL: {}",
                self.bridge.homeserver_url
            )));
        }

        if self.registration.appservice_token.is_empty() {
            return Err(ConfigError::InvalidConfig(
                "registration as_token cannot be empty (set registration.as_token or provide imposter-registration.yaml)"
                    .to_string(),
            ));
        }

        if self.registration.homeserver_token.is_empty() {
            return Err(ConfigError::InvalidConfig(
                "registration hs_token cannot be empty (set registration.hs_token or provide imposter-registration.yaml)"
                    .to_string(),
            ));
        }

        if self.registration.sender_localpart.is_empty() {
            return Err(ConfigError::InvalidConfig(
                "registration sender_localpart cannot be empty".to_string(),
            ));
        }

        if self.database.connection_string().is_empty() {
            return Err(ConfigError::InvalidConfig(
                "database connection string cannot be empty".to_string(),
            ));
        }

        if self.database.sqlite_path().is_none() {
            return Err(ConfigError::InvalidConfig(format!(
                "only sqlite:// databases are supported, got {}",
                self.database.connection_string()
            )));
        }

        if self.bridge.port == 0 {
            return Err(ConfigError::InvalidConfig(
                "bridge.port must be between 1 and 65535".to_string(),
            ));
        }

        if self.limits.request_retry_delay_ms == 0 {
            return Err(ConfigError::InvalidConfig(
                "limits.request_retry_delay_ms must be positive".to_string(),
            ));
        }

        Ok(())
    }

    fn normalize(&mut self) {
        self.bridge.homeserver_url = self.bridge.homeserver_url.trim_end_matches('/').to_string();
        if self.bot.avatar.as_deref().map(str::trim) == Some("") {
            self.bot.avatar = None;
        }
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(value) = std::env::var("APPSERVICE_IMPOSTER_REGISTRATION_ID") {
            self.registration.bridge_id = value;
        }
        if let Ok(value) = std::env::var("APPSERVICE_IMPOSTER_REGISTRATION_AS_TOKEN") {
            self.registration.appservice_token = value;
        }
        if let Ok(value) = std::env::var("APPSERVICE_IMPOSTER_REGISTRATION_HS_TOKEN") {
            self.registration.homeserver_token = value;
        }
        if let Ok(value) = std::env::var("APPSERVICE_IMPOSTER_REGISTRATION_SENDER_LOCALPART") {
            self.registration.sender_localpart = value;
        }
    }

    fn load_registration(
        &mut self,
        config_path: &Path,
        registration_path: Option<&Path>,
    ) -> Result<(), ConfigError> {
        let registration_path = match registration_path {
            Some(path) => path.to_path_buf(),
            None => resolve_registration_path(config_path, &default_registration_file()),
        };

        if !registration_path.exists() {
            return Ok(());
        }

        let content = std::fs::read_to_string(registration_path)?;
        let registration: RegistrationConfig = serde_yaml::from_str(&content)?;
        self.merge_registration(registration);
        Ok(())
    }

    fn merge_registration(&mut self, registration: RegistrationConfig) {
        if self.registration.bridge_id.is_empty() {
            self.registration.bridge_id = registration.bridge_id;
        }
        if self.registration.appservice_token.is_empty() {
            self.registration.appservice_token = registration.appservice_token;
        }
        if self.registration.homeserver_token.is_empty() {
            self.registration.homeserver_token = registration.homeserver_token;
        }
        if self.registration.sender_localpart == default_sender_localpart()
            && registration.sender_localpart != default_sender_localpart()
        {
            self.registration.sender_localpart = registration.sender_localpart;
        }
    }
}

fn default_port() -> u16 {
    9000
}

fn default_bind_address() -> String {
    "0.0.0.0".to_string()
}

fn default_registration_file() -> String {
    "imposter-registration.yaml".to_string()
}

fn resolve_registration_path(config_path: &Path, registration_path: &str) -> PathBuf {
    let registration_path = Path::new(registration_path);
    if registration_path.is_absolute() {
        registration_path.to_path_buf()
    } else if let Some(parent) = config_path.parent() {
        parent.join(registration_path)
    } else {
        registration_path.to_path_buf()
    }
}

fn default_sender_localpart() -> String {
    "imposter".to_string()
}

fn default_displayname() -> String {
    "ImposterBot".to_string()
}

fn default_control_room_name() -> String {
    "ImposterBot control room".to_string()
}

fn default_presence_interval() -> u64 {
    20
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "pretty".to_string()
}

fn default_request_retry_delay_ms() -> u64 {
    5000
}

fn default_request_timeout_secs() -> u64 {
    60
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    const MINIMAL: &str = r#"
bridge:
  domain: example.org
  homeserver_url: http://localhost:8008/
registration:
  id: imposter
  as_token: as-secret
  hs_token: hs-secret
database:
  filename: imposter.db
"#;

    #[test]
    fn minimal_config_gets_defaults() {
        let config = Config::from_yaml(MINIMAL).unwrap();
        assert_eq!(config.bridge.port, 9000);
        assert_eq!(config.bridge.homeserver_url, "http://localhost:8008");
        assert_eq!(config.bot.presence_interval, 20);
        assert_eq!(config.limits.request_retry_delay_ms, 5000);
        assert_eq!(config.bot_user_id(), "@imposter:example.org");
        assert_eq!(config.database.sqlite_path().as_deref(), Some("imposter.db"));
        config.validate().unwrap();
    }

    #[test]
    fn validate_rejects_non_sqlite_databases() {
        let mut config = Config::from_yaml(MINIMAL).unwrap();
        config.database.url = Some("postgres://localhost/imposter".to_string());
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidConfig(_))
        ));
    }

    #[test]
    fn validate_rejects_missing_tokens() {
        let mut config = Config::from_yaml(MINIMAL).unwrap();
        config.registration.homeserver_token.clear();
        assert!(config.validate().is_err());
    }

    #[test]
    fn registration_file_fills_missing_fields() {
        let dir = tempfile::tempdir().unwrap();
        let config_path = dir.path().join("config.yaml");
        std::fs::write(
            &config_path,
            "bridge:\n  domain: example.org\n  homeserver_url: http://hs:8008\ndatabase:\n  url: sqlite://:memory:\n",
        )
        .unwrap();
        let mut registration =
            std::fs::File::create(dir.path().join("imposter-registration.yaml")).unwrap();
        writeln!(
            registration,
            "id: imposter\nas_token: from-file-as\nhs_token: from-file-hs\nsender_localpart: mimic"
        )
        .unwrap();

        let config = Config::load_from_file(&config_path, None).unwrap();
        assert_eq!(config.registration.appservice_token, "from-file-as");
        assert_eq!(config.registration.homeserver_token, "from-file-hs");
        assert_eq!(config.bot_user_id(), "@mimic:example.org");
    }
}
