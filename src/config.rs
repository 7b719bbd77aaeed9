pub use self::parser::{
    Config, DatabaseConfig, DbType, DeadLetterConfig, LimitsConfig, LoggingConfig,
    MaxConfig, MediaGroupConfig, MigrationConfig, TelegramConfig,
};
pub use self::validator::ConfigError;

mod parser;
mod validator;
