//! Process configuration loaded from the environment.

use anyhow::{Context, Result};

/// Runtime configuration.
///
/// Required variables fail startup with context; tunables fall back to
/// sensible defaults.
#[derive(Debug, Clone)]
pub struct Config {
    // Upstream instance
    pub servicenow_instance_url: String,
    pub servicenow_username: String,
    pub servicenow_password: String,

    // Storage
    pub database_url: String,

    // HTTP
    pub http_host: String,
    pub http_port: u16,
    pub cors_allowed_origins: Vec<String>,
    pub jwt_secret: String,

    // Tunables
    pub worker_count: usize,
    pub sync_batch_size: u32,
}

impl Config {
    /// Load configuration from the environment (and `.env` if present).
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok();

        Ok(Self {
            servicenow_instance_url: required("SERVICENOW_INSTANCE_URL")?,
            servicenow_username: required("SERVICENOW_USERNAME")?,
            servicenow_password: required("SERVICENOW_PASSWORD")?,
            database_url: required("DATABASE_URL")?,
            http_host: optional("HTTP_HOST", "0.0.0.0"),
            http_port: parsed("HTTP_PORT", 3008)?,
            cors_allowed_origins: list("CORS_ALLOWED_ORIGINS"),
            jwt_secret: required("JWT_SECRET")?,
            worker_count: parsed("WORKER_COUNT", 4)?,
            sync_batch_size: parsed("SYNC_BATCH_SIZE", 50)?,
        })
    }
}

fn required(name: &str) -> Result<String> {
    std::env::var(name).with_context(|| format!("missing required environment variable {name}"))
}

fn optional(name: &str, default: &str) -> String {
    std::env::var(name).unwrap_or_else(|_| default.to_string())
}

fn list(name: &str) -> Vec<String> {
    std::env::var(name)
        .map(|v| {
            v.split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect()
        })
        .unwrap_or_default()
}

fn parsed<T: std::str::FromStr>(name: &str, default: T) -> Result<T>
where
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match std::env::var(name) {
        Ok(raw) => raw
            .parse()
            .with_context(|| format!("invalid value for environment variable {name}")),
        Err(_) => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn list_splits_and_trims() {
        std::env::set_var("TEST_ORIGINS_LIST", "http://a.example, http://b.example ,");
        let parsed = list("TEST_ORIGINS_LIST");
        assert_eq!(parsed, vec!["http://a.example", "http://b.example"]);
        std::env::remove_var("TEST_ORIGINS_LIST");
    }

    #[test]
    fn missing_required_fails_with_name() {
        let err = required("DEFINITELY_NOT_SET_ANYWHERE").unwrap_err();
        assert!(err.to_string().contains("DEFINITELY_NOT_SET_ANYWHERE"));
    }
}
