//! Configuration management for microservices

use crate::error::{EhubError, Result};
use serde::Deserialize;
use std::env;
use std::str::FromStr;

#[derive(Debug, Clone, Deserialize)]
pub struct ServiceConfig {
    pub service_name: String,
    pub http_bind: String,
    pub redis_url: Option<String>,
    pub log_level: String,
    pub enable_telemetry: bool,
}

impl ServiceConfig {
    pub fn from_env() -> Result<Self> {
        Ok(Self {
            service_name: env::var("SERVICE_NAME").unwrap_or_else(|_| "unknown".to_string()),
            http_bind: env::var("HTTP_BIND").unwrap_or_else(|_| "0.0.0.0:8080".to_string()),
            redis_url: env::var("REDIS_URL").ok().filter(|url| !url.is_empty()),
            log_level: env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
            enable_telemetry: env_or("ENABLE_TELEMETRY", true)?,
        })
    }
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            service_name: "unknown".to_string(),
            http_bind: "0.0.0.0:8080".to_string(),
            redis_url: None,
            log_level: "info".to_string(),
            enable_telemetry: true,
        }
    }
}

/// Read `name` from the environment, falling back to `default` when unset.
///
/// A value that is set but does not parse is a configuration error rather
/// than a silent fallback.
pub fn env_or<T>(name: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match env::var(name) {
        Ok(raw) if !raw.trim().is_empty() => raw
            .trim()
            .parse()
            .map_err(|e| EhubError::Config(format!("Invalid {}: {}", name, e))),
        _ => Ok(default),
    }
}

/// Comma separated list from the environment.
pub fn env_list(name: &str, default: &[&str]) -> Vec<String> {
    match env::var(name) {
        Ok(raw) if !raw.trim().is_empty() => raw
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect(),
        _ => default.iter().map(|s| s.to_string()).collect(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_env_or_default_when_unset() {
        let value: u64 = env_or("EHUB_TEST_SURELY_UNSET_VAR", 42).unwrap();
        assert_eq!(value, 42);
    }

    #[test]
    fn test_env_or_rejects_garbage() {
        env::set_var("EHUB_TEST_GARBAGE_PORT", "not-a-number");
        let result: Result<u16> = env_or("EHUB_TEST_GARBAGE_PORT", 80);
        assert!(matches!(result, Err(EhubError::Config(_))));
        env::remove_var("EHUB_TEST_GARBAGE_PORT");
    }

    #[test]
    fn test_env_list_splits_and_trims() {
        env::set_var("EHUB_TEST_LIST", " a, b ,,c ");
        assert_eq!(env_list("EHUB_TEST_LIST", &["x"]), vec!["a", "b", "c"]);
        env::remove_var("EHUB_TEST_LIST");
        assert_eq!(env_list("EHUB_TEST_LIST", &["x"]), vec!["x"]);
    }
}
