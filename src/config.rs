use anyhow::{Context, Result};
use rand::RngCore;
use std::time::Duration;

/// Server settings, read from the environment with development defaults.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub database_url: String,
    pub port: u16,
    pub jwt_secret: String,
    pub device_token_ttl_days: i64,
    pub heartbeat_interval_secs: u64,
    pub offline_threshold_multiplier: u32,
    pub status_sweep_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            database_url: "sqlite:./data/holohub.db".into(),
            port: 8080,
            jwt_secret: String::new(),
            device_token_ttl_days: 30,
            heartbeat_interval_secs: 60,
            offline_threshold_multiplier: 5,
            status_sweep_secs: 30,
        }
    }
}

impl ServerConfig {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds the config from an arbitrary key lookup so tests don't have to
    /// touch the process environment.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = ServerConfig::default();

        let jwt_secret = match lookup("JWT_SECRET").filter(|s| !s.is_empty()) {
            Some(secret) => secret,
            None => {
                tracing::warn!(
                    "JWT_SECRET not set; using a random per-process secret (tokens won't survive a restart)"
                );
                random_secret()
            }
        };

        Ok(ServerConfig {
            database_url: lookup("DATABASE_URL").unwrap_or(defaults.database_url),
            port: parse_or(&lookup, "PORT", defaults.port)?,
            jwt_secret,
            device_token_ttl_days: parse_or(
                &lookup,
                "DEVICE_TOKEN_TTL_DAYS",
                defaults.device_token_ttl_days,
            )?,
            heartbeat_interval_secs: parse_or(
                &lookup,
                "HEARTBEAT_INTERVAL_SECS",
                defaults.heartbeat_interval_secs,
            )?,
            offline_threshold_multiplier: parse_or(
                &lookup,
                "OFFLINE_THRESHOLD_MULTIPLIER",
                defaults.offline_threshold_multiplier,
            )?,
            status_sweep_secs: parse_or(&lookup, "STATUS_SWEEP_SECS", defaults.status_sweep_secs)?,
        })
    }

    /// A device is online while its last heartbeat is younger than this.
    pub fn offline_threshold(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs * u64::from(self.offline_threshold_multiplier))
    }
}

fn parse_or<F, T>(lookup: &F, key: &str, default: T) -> Result<T>
where
    F: Fn(&str) -> Option<String>,
    T: std::str::FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match lookup(key) {
        Some(raw) => raw
            .trim()
            .parse()
            .with_context(|| format!("invalid value for {key}: {raw:?}")),
        None => Ok(default),
    }
}

fn random_secret() -> String {
    let mut bytes = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn defaults_give_five_minute_threshold() {
        let cfg = ServerConfig::from_lookup(lookup(&[])).unwrap();
        assert_eq!(cfg.port, 8080);
        assert_eq!(cfg.device_token_ttl_days, 30);
        assert_eq!(cfg.offline_threshold(), Duration::from_secs(300));
        assert_eq!(cfg.jwt_secret.len(), 64);
    }

    #[test]
    fn env_overrides_are_parsed() {
        let cfg = ServerConfig::from_lookup(lookup(&[
            ("PORT", "9090"),
            ("JWT_SECRET", "s3cret"),
            ("HEARTBEAT_INTERVAL_SECS", "30"),
            ("OFFLINE_THRESHOLD_MULTIPLIER", "4"),
        ]))
        .unwrap();
        assert_eq!(cfg.port, 9090);
        assert_eq!(cfg.jwt_secret, "s3cret");
        assert_eq!(cfg.offline_threshold(), Duration::from_secs(120));
    }

    #[test]
    fn garbage_values_are_rejected() {
        let err = ServerConfig::from_lookup(lookup(&[("PORT", "eighty")])).unwrap_err();
        assert!(err.to_string().contains("PORT"));
    }
}
