use std::env;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

const DEFAULT_JWT_SECRET: &str = "default_jwt_secret_change_me";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("{name} must be {expected}, got {value:?}")]
    Invalid {
        name: &'static str,
        expected: &'static str,
        value: String,
    },
}

/// Runtime configuration, read from the environment (and `.env`).
#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    pub database_path: String,
    pub jwt_secret: String,
    pub token_ttl: chrono::Duration,
    pub content_path: PathBuf,
    pub purge_poll_interval: Duration,
    pub deletion_grace_period: chrono::Duration,
    pub notify_webhook_url: Option<String>,
    /// Users registering with one of these emails become admins.
    pub admin_emails: Vec<String>,
    /// When set, registration requires this code.
    pub invite_code: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: 8070,
            database_path: "stash.db".to_string(),
            jwt_secret: DEFAULT_JWT_SECRET.to_string(),
            token_ttl: chrono::Duration::days(7),
            content_path: PathBuf::from("content"),
            purge_poll_interval: Duration::from_secs(60),
            deletion_grace_period: chrono::Duration::minutes(10080),
            notify_webhook_url: None,
            admin_emails: Vec::new(),
            invite_code: None,
        }
    }
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();
        Self::from_lookup(|name| env::var(name).ok())
    }

    /// Build a config from any variable source; unset variables keep their default.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let mut config = Config::default();

        if let Some(value) = lookup("PORT") {
            config.port = parse("PORT", "a port number", value)?;
        }
        if let Some(value) = lookup("DATABASE_PATH") {
            config.database_path = value;
        }
        match lookup("JWT_SECRET") {
            Some(value) if !value.is_empty() => config.jwt_secret = value,
            _ => log::warn!("JWT_SECRET not set, using default (not secure for production!)"),
        }
        if let Some(value) = lookup("TOKEN_TTL_HOURS") {
            let hours: u32 = parse("TOKEN_TTL_HOURS", "a number of hours", value.clone())?;
            if hours == 0 {
                return Err(ConfigError::Invalid {
                    name: "TOKEN_TTL_HOURS",
                    expected: "a number of hours",
                    value,
                });
            }
            config.token_ttl = chrono::Duration::hours(hours.into());
        }
        if let Some(value) = lookup("CONTENT_PATH") {
            config.content_path = PathBuf::from(value);
        }
        if let Some(value) = lookup("PURGE_POLL_INTERVAL_SECS") {
            let secs: u64 = parse("PURGE_POLL_INTERVAL_SECS", "a positive number of seconds", value.clone())?;
            if secs == 0 {
                return Err(ConfigError::Invalid {
                    name: "PURGE_POLL_INTERVAL_SECS",
                    expected: "a positive number of seconds",
                    value,
                });
            }
            config.purge_poll_interval = Duration::from_secs(secs);
        }
        if let Some(value) = lookup("DELETION_GRACE_PERIOD_MINUTES") {
            let minutes: u32 = parse("DELETION_GRACE_PERIOD_MINUTES", "a number of minutes", value)?;
            config.deletion_grace_period = chrono::Duration::minutes(minutes.into());
        }
        config.notify_webhook_url = lookup("NOTIFY_WEBHOOK_URL").filter(|url| !url.is_empty());
        if let Some(value) = lookup("ADMIN_EMAILS") {
            config.admin_emails = value
                .split(',')
                .map(|email| email.trim().to_lowercase())
                .filter(|email| !email.is_empty())
                .collect();
        }
        config.invite_code = lookup("INVITE_CODE").filter(|code| !code.is_empty());

        Ok(config)
    }

    pub fn invite_required(&self) -> bool {
        self.invite_code.is_some()
    }

    /// Registration is open, or `code` is the configured invite code.
    pub fn accepts_invite(&self, code: Option<&str>) -> bool {
        match &self.invite_code {
            None => true,
            Some(expected) => code.map(str::trim) == Some(expected.as_str()),
        }
    }

    pub fn is_admin_email(&self, email: &str) -> bool {
        let email = email.trim().to_lowercase();
        self.admin_emails.iter().any(|admin| *admin == email)
    }
}

fn parse<T: std::str::FromStr>(
    name: &'static str,
    expected: &'static str,
    value: String,
) -> Result<T, ConfigError> {
    value
        .trim()
        .parse()
        .map_err(|_| ConfigError::Invalid { name, expected, value })
}
