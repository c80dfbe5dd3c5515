// Licensed under the MIT license found in the LICENSE file
// at the root of this repository, or at
// https://opensource.org/licenses/MIT.

use clap::Parser;

use crate::error::CalBridgeError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Environment {
    Development,
    Production,
}

impl std::str::FromStr for Environment {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "development" => Ok(Environment::Development),
            "production" => Ok(Environment::Production),
            other => Err(format!("invalid ENVIRONMENT value: {other}")),
        }
    }
}

/// The full set of environment variables this service recognizes, loaded
/// and validated once at startup. A `Config` error is the only error kind
/// allowed to reach the process boundary.
#[derive(Parser, Debug, Clone)]
#[command(author, version, about, long_about = None)]
pub struct Config {
    #[arg(long, env = "PORT", default_value_t = 8080)]
    pub port: u16,

    #[arg(long, env = "BASE_URL", default_value = "http://localhost:8080")]
    pub base_url: String,

    #[arg(long, env = "ENVIRONMENT", default_value = "production")]
    pub environment: String,

    #[arg(long, env = "OIDC_ISSUER", default_value = "")]
    pub oidc_issuer: String,
    #[arg(long, env = "OIDC_CLIENT_ID", default_value = "")]
    pub oidc_client_id: String,
    #[arg(long, env = "OIDC_CLIENT_SECRET", default_value = "")]
    pub oidc_client_secret: String,
    #[arg(long, env = "OIDC_REDIRECT_URL", default_value = "")]
    pub oidc_redirect_url: String,

    #[arg(long, env = "ENCRYPTION_KEY", default_value = "")]
    pub encryption_key: String,

    #[arg(long, env = "SESSION_SECRET", default_value = "")]
    pub session_secret: String,

    #[arg(long, env = "DATABASE_PATH", default_value = "./data/calbridge.db")]
    pub database_path: String,

    #[arg(long, env = "DEFAULT_DEST_URL", default_value = "")]
    pub default_dest_url: String,

    #[arg(long, env = "RATE_LIMIT_RPS", default_value_t = 10)]
    pub rate_limit_rps: u32,
    #[arg(long, env = "RATE_LIMIT_BURST", default_value_t = 20)]
    pub rate_limit_burst: u32,

    #[arg(long, env = "MIN_SYNC_INTERVAL", default_value_t = 30)]
    pub min_sync_interval_secs: i64,
    #[arg(long, env = "MAX_SYNC_INTERVAL", default_value_t = 3600)]
    pub max_sync_interval_secs: i64,

    #[arg(long, env = "ALLOW_PRIVATE_NETWORKS", default_value_t = false)]
    pub allow_private_networks: bool,

    #[arg(long, env = "SQLITE_MAX_CONNECTIONS", default_value_t = 25)]
    pub sqlite_max_connections: u32,

    #[arg(long, env = "ACTIVITY_HISTORY_LIMIT", default_value_t = 50)]
    pub activity_history_limit: usize,

    #[arg(long, env = "SYNC_LOG_RETENTION_DAYS", default_value_t = 90)]
    pub sync_log_retention_days: i64,

    #[arg(long, env = "RUST_LOG", default_value = "info")]
    pub rust_log: String,
}

impl Config {
    pub fn load() -> Result<Self, CalBridgeError> {
        let config = Self::parse();
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), CalBridgeError> {
        self.environment
            .parse::<Environment>()
            .map_err(CalBridgeError::Config)?;

        if !self.encryption_key.is_empty() {
            let bytes = hex::decode(&self.encryption_key)
                .map_err(|e| CalBridgeError::Config(format!("ENCRYPTION_KEY is not hex: {e}")))?;
            if bytes.len() != 32 {
                return Err(CalBridgeError::Config(
                    "ENCRYPTION_KEY must decode to exactly 32 bytes".to_string(),
                ));
            }
        }

        if !self.session_secret.is_empty() && self.session_secret.len() < 32 {
            return Err(CalBridgeError::Config(
                "SESSION_SECRET must be at least 32 characters".to_string(),
            ));
        }

        if self.min_sync_interval_secs > self.max_sync_interval_secs {
            return Err(CalBridgeError::Config(
                "MIN_SYNC_INTERVAL must not exceed MAX_SYNC_INTERVAL".to_string(),
            ));
        }

        Ok(())
    }

    pub fn is_production(&self) -> bool {
        self.environment == "production"
    }

    /// Clamp a source's requested interval into the configured bounds.
    pub fn clamp_interval(&self, requested_secs: i64) -> i64 {
        requested_secs.clamp(self.min_sync_interval_secs, self.max_sync_interval_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base() -> Config {
        Config {
            port: 8080,
            base_url: "http://localhost:8080".into(),
            environment: "production".into(),
            oidc_issuer: String::new(),
            oidc_client_id: String::new(),
            oidc_client_secret: String::new(),
            oidc_redirect_url: String::new(),
            encryption_key: String::new(),
            session_secret: String::new(),
            database_path: "./data/calbridge.db".into(),
            default_dest_url: String::new(),
            rate_limit_rps: 10,
            rate_limit_burst: 20,
            min_sync_interval_secs: 30,
            max_sync_interval_secs: 3600,
            allow_private_networks: false,
            sqlite_max_connections: 25,
            activity_history_limit: 50,
            sync_log_retention_days: 90,
            rust_log: "info".into(),
        }
    }

    #[test]
    fn validates_default_config() {
        assert!(base().validate().is_ok());
    }

    #[test]
    fn rejects_invalid_environment() {
        let mut c = base();
        c.environment = "staging".into();
        assert!(c.validate().is_err());
    }

    #[test]
    fn rejects_short_session_secret() {
        let mut c = base();
        c.session_secret = "short".into();
        assert!(c.validate().is_err());
    }

    #[test]
    fn rejects_non_hex_encryption_key() {
        let mut c = base();
        c.encryption_key = "not-hex".into();
        assert!(c.validate().is_err());
    }

    #[test]
    fn rejects_wrong_length_encryption_key() {
        let mut c = base();
        c.encryption_key = hex::encode([0u8; 16]);
        assert!(c.validate().is_err());
    }

    #[test]
    fn accepts_correct_encryption_key() {
        let mut c = base();
        c.encryption_key = hex::encode([0u8; 32]);
        assert!(c.validate().is_ok());
    }

    #[test]
    fn rejects_inverted_interval_bounds() {
        let mut c = base();
        c.min_sync_interval_secs = 3600;
        c.max_sync_interval_secs = 30;
        assert!(c.validate().is_err());
    }

    #[test]
    fn clamps_interval_into_bounds() {
        let c = base();
        assert_eq!(c.clamp_interval(5), 30);
        assert_eq!(c.clamp_interval(10_000), 3600);
        assert_eq!(c.clamp_interval(120), 120);
    }
}
