//! Process configuration, read from the environment at startup.
//!
//! A `.env` file in the working directory is honoured outside tests.

use tracing_subscriber::EnvFilter;

pub const DEFAULT_DB_URL: &str = "sqlite://dev.sqlite3";
pub const DEFAULT_LOG_FILTER: &str = "info";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid value for the environment variable {0}: {1}")]
    InvalidValue(&'static str, String),
}

#[derive(Clone, Debug)]
pub struct Config {
    pub database_url: String,
    pub log_filter: String,
}

impl Config {
    /// # Errors
    ///
    /// Returns `ConfigError::InvalidValue` for a blank database URL or an
    /// unparsable `RUST_LOG` directive.
    pub fn from_env() -> Result<Self, ConfigError> {
        if !cfg!(test) {
            dotenvy::dotenv().ok();
        }
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let database_url = match lookup("COURSE_DB_URL") {
            None => DEFAULT_DB_URL.to_owned(),
            Some(raw) if raw.trim().is_empty() => {
                return Err(ConfigError::InvalidValue(
                    "COURSE_DB_URL",
                    "must not be blank".to_owned(),
                ));
            }
            Some(raw) => raw.trim().to_owned(),
        };

        let log_filter = lookup("RUST_LOG").unwrap_or_else(|| DEFAULT_LOG_FILTER.to_owned());
        EnvFilter::try_new(&log_filter)
            .map_err(|e| ConfigError::InvalidValue("RUST_LOG", e.to_string()))?;

        Ok(Self {
            database_url,
            log_filter,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_apply_when_unset() {
        let config = Config::from_lookup(|_| None).unwrap();
        assert_eq!(config.database_url, DEFAULT_DB_URL);
        assert_eq!(config.log_filter, DEFAULT_LOG_FILTER);
    }

    #[test]
    fn explicit_values_win() {
        let config = Config::from_lookup(|name| match name {
            "COURSE_DB_URL" => Some(" sqlite://course.db ".to_owned()),
            "RUST_LOG" => Some("services=debug,info".to_owned()),
            _ => None,
        })
        .unwrap();
        assert_eq!(config.database_url, "sqlite://course.db");
        assert_eq!(config.log_filter, "services=debug,info");
    }

    #[test]
    fn blank_database_url_is_rejected() {
        let err = Config::from_lookup(|name| (name == "COURSE_DB_URL").then(|| "  ".to_owned()))
            .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue("COURSE_DB_URL", _)));
    }
}
