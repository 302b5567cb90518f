pub use self::parser::{
    BotConfig, BridgeConfig, Config, DatabaseConfig, LimitsConfig, LoggingConfig,
    RegistrationConfig,
};
pub use self::validator::ConfigError;

mod parser;
mod validator;
