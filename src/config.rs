use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use log::LevelFilter;

use crate::dispatcher::DEFAULT_CONCURRENCY;

pub const DEFAULT_TOKEN_API_URL: &str = "https://garenagwt.vercel.app/token";
pub const DEFAULT_MAX_FILE_SIZE: usize = 5 * 1024 * 1024;

/// Runtime settings, read from the environment once at startup.
#[derive(Debug, Clone)]
pub struct Settings {
    pub api_id: i32,
    pub api_hash: String,
    pub bot_token: String,
    pub token_api_url: String,
    pub token_api_key: String,
    pub admin_id: Option<i64>,
    /// Channel username (without `@`) users must stay joined to.
    pub required_channel: Option<String>,
    pub data_dir: PathBuf,
    pub max_concurrent_requests: usize,
    pub scheduler_tick: Duration,
    pub scheduler_startup_delay: Duration,
    pub max_file_size: usize,
    pub port: u16,
    pub log_level: LevelFilter,
}

impl Settings {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let required = |key: &str| -> Result<String> {
            lookup(key)
                .filter(|v| !v.trim().is_empty())
                .with_context(|| format!("{} env is not set", key))
        };
        let optional = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        let admin_id = match optional("ADMIN_ID") {
            Some(raw) => Some(parse_var::<i64>("ADMIN_ID", &raw)?).filter(|id| *id != 0),
            None => None,
        };
        let max_concurrent_requests = optional_parsed(&optional, "MAX_CONCURRENT_REQUESTS", DEFAULT_CONCURRENCY)?;
        if max_concurrent_requests == 0 {
            bail!("MAX_CONCURRENT_REQUESTS must be at least 1");
        }

        Ok(Self {
            api_id: parse_var("API_ID", &required("API_ID")?)?,
            api_hash: required("API_HASH")?,
            bot_token: required("BOT_TOKEN")?,
            token_api_url: optional("TOKEN_API_URL").unwrap_or_else(|| DEFAULT_TOKEN_API_URL.to_string()),
            token_api_key: required("TOKEN_API_KEY")?,
            admin_id,
            required_channel: optional("REQUIRED_CHANNEL").map(|c| c.trim_start_matches('@').to_string()),
            data_dir: optional("DATA_DIR").unwrap_or_else(|| "bot_data".to_string()).into(),
            max_concurrent_requests,
            scheduler_tick: Duration::from_secs(optional_parsed(&optional, "SCHEDULER_TICK_SECS", 60)?),
            scheduler_startup_delay: Duration::from_secs(optional_parsed(
                &optional,
                "SCHEDULER_STARTUP_DELAY_SECS",
                15,
            )?),
            max_file_size: optional_parsed(&optional, "MAX_FILE_SIZE", DEFAULT_MAX_FILE_SIZE)?,
            port: optional_parsed(&optional, "PORT", 8080)?,
            log_level: match optional("LOG_LEVEL") {
                Some(raw) => LevelFilter::from_str(&raw).map_err(|_| anyhow!("LOG_LEVEL has an invalid value: {}", raw))?,
                None => LevelFilter::Info,
            },
        })
    }

    pub fn is_admin(&self, user_id: i64) -> bool {
        self.admin_id == Some(user_id)
    }
}

fn parse_var<T>(key: &str, raw: &str) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    raw.trim()
        .parse()
        .with_context(|| format!("{} has an invalid value: {}", key, raw))
}

fn optional_parsed<T>(optional: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match optional(key) {
        Some(raw) => parse_var(key, &raw),
        None => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn settings(vars: &[(&str, &str)]) -> Result<Settings> {
        let vars: HashMap<String, String> = vars.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        Settings::from_lookup(|key| vars.get(key).cloned())
    }

    const REQUIRED: [(&str, &str); 4] = [
        ("API_ID", "12345"),
        ("API_HASH", "hash"),
        ("BOT_TOKEN", "1:abc"),
        ("TOKEN_API_KEY", "key"),
    ];

    #[test]
    fn defaults() {
        let s = settings(&REQUIRED).unwrap();
        assert_eq!(s.api_id, 12345);
        assert_eq!(s.token_api_url, DEFAULT_TOKEN_API_URL);
        assert_eq!(s.admin_id, None);
        assert_eq!(s.required_channel, None);
        assert_eq!(s.data_dir, PathBuf::from("bot_data"));
        assert_eq!(s.max_concurrent_requests, 10);
        assert_eq!(s.scheduler_tick, Duration::from_secs(60));
        assert_eq!(s.scheduler_startup_delay, Duration::from_secs(15));
        assert_eq!(s.max_file_size, 5 * 1024 * 1024);
        assert_eq!(s.port, 8080);
        assert_eq!(s.log_level, LevelFilter::Info);
    }

    #[test]
    fn overrides() {
        let mut vars = REQUIRED.to_vec();
        vars.extend([
            ("ADMIN_ID", "777"),
            ("REQUIRED_CHANNEL", "@news"),
            ("MAX_CONCURRENT_REQUESTS", "25"),
            ("LOG_LEVEL", "debug"),
        ]);
        let s = settings(&vars).unwrap();
        assert!(s.is_admin(777));
        assert!(!s.is_admin(778));
        assert_eq!(s.required_channel.as_deref(), Some("news"));
        assert_eq!(s.max_concurrent_requests, 25);
        assert_eq!(s.log_level, LevelFilter::Debug);
    }

    #[test]
    fn zero_admin_disables_admin_features() {
        let mut vars = REQUIRED.to_vec();
        vars.push(("ADMIN_ID", "0"));
        assert_eq!(settings(&vars).unwrap().admin_id, None);
    }

    #[test]
    fn missing_or_invalid_values_name_the_variable() {
        let err = settings(&REQUIRED[1..]).unwrap_err();
        assert!(err.to_string().contains("API_ID"));

        let mut vars = REQUIRED.to_vec();
        vars.push(("PORT", "eighty"));
        assert!(settings(&vars).unwrap_err().to_string().contains("PORT"));

        let mut vars = REQUIRED.to_vec();
        vars.push(("MAX_CONCURRENT_REQUESTS", "0"));
        assert!(settings(&vars).is_err());
    }
}
