use secrecy::ExposeSecret;
use thiserror::Error;
use url::Url;

use super::parser::Config;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse config file: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

pub(super) fn validate(config: &Config) -> Result<(), ConfigError> {
    if config.max.bot_token.expose_secret().is_empty() {
        return Err(ConfigError::InvalidConfig(
            "max.bot_token cannot be empty".to_string(),
        ));
    }

    if Url::parse(&config.max.base_url).is_err() {
        return Err(ConfigError::InvalidConfig(format!(
            "max.base_url is not a valid url: {}",
            config.max.base_url
        )));
    }

    if config.database.connection_string().is_empty() {
        return Err(ConfigError::InvalidConfig(
            "database connection string cannot be empty".to_string(),
        ));
    }

    if config.limits.rate_max_calls == 0 {
        return Err(ConfigError::InvalidConfig(
            "limits.rate_max_calls must be at least 1".to_string(),
        ));
    }

    if config.limits.retry_max_attempts == 0 {
        return Err(ConfigError::InvalidConfig(
            "limits.retry_max_attempts must be at least 1".to_string(),
        ));
    }

    if config.migration.parallelism == 0 {
        return Err(ConfigError::InvalidConfig(
            "migration.parallelism must be at least 1".to_string(),
        ));
    }

    if config.migration.insert_batch_size == 0 {
        return Err(ConfigError::InvalidConfig(
            "migration.insert_batch_size must be at least 1".to_string(),
        ));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::super::parser::Config;
    use super::validate;

    fn parse(yaml: &str) -> Config {
        serde_yaml::from_str(yaml).expect("parse")
    }

    #[test]
    fn accepts_minimal_valid_config() {
        let config = parse(
            r#"
max:
  bot_token: "t"
database:
  filename: "x.db"
"#,
        );
        assert!(validate(&config).is_ok());
    }

    #[test]
    fn rejects_empty_token() {
        let config = parse(
            r#"
max:
  bot_token: ""
database:
  filename: "x.db"
"#,
        );
        assert!(validate(&config).is_err());
    }

    #[test]
    fn rejects_bad_base_url() {
        let config = parse(
            r#"
max:
  bot_token: "t"
  base_url: "not a url"
database:
  filename: "x.db"
"#,
        );
        assert!(validate(&config).is_err());
    }

    #[test]
    fn rejects_missing_database() {
        let config = parse(
            r#"
max:
  bot_token: "t"
database: {}
"#,
        );
        assert!(validate(&config).is_err());
    }

    #[test]
    fn rejects_zero_parallelism() {
        let config = parse(
            r#"
max:
  bot_token: "t"
database:
  filename: "x.db"
migration:
  parallelism: 0
"#,
        );
        assert!(validate(&config).is_err());
    }
}
