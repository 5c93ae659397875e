//! Process configuration read from environment variables.

use std::time::Duration;

use lendq_core::QueueName;
use lendq_infra::jobs::{InstanceInfo, MaintenanceConfig, RetentionPolicy};
use lendq_observability::LogFormat;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{0} environment variable not set")]
    Missing(&'static str),
    #[error("invalid {var}='{value}': {reason}")]
    Invalid {
        var: &'static str,
        value: String,
        reason: String,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub struct WorkerProcessConfig {
    pub database_url: String,
    pub db_max_connections: u32,
    /// Queues covered by maintenance and health reporting.
    pub queues: Vec<QueueName>,
    pub maintenance: MaintenanceConfig,
    pub health_interval: Duration,
    pub log_format: LogFormat,
    pub instance: InstanceInfo,
}

impl WorkerProcessConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Parse from any key lookup. Blank values count as unset.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let database_url = get("DATABASE_URL").ok_or(ConfigError::Missing("DATABASE_URL"))?;
        let queues = parse_queues(&get("LENDQ_QUEUES").ok_or(ConfigError::Missing("LENDQ_QUEUES"))?)?;

        let db_max_connections = parse_number(get("LENDQ_DB_MAX_CONNECTIONS"), "LENDQ_DB_MAX_CONNECTIONS", 10)?;
        let maintenance_secs = parse_number(get("LENDQ_MAINTENANCE_INTERVAL_SECS"), "LENDQ_MAINTENANCE_INTERVAL_SECS", 60)?;
        let health_secs = parse_number(get("LENDQ_HEALTH_INTERVAL_SECS"), "LENDQ_HEALTH_INTERVAL_SECS", 60)?;
        let stalled_secs = parse_number(get("LENDQ_STALLED_TIMEOUT_SECS"), "LENDQ_STALLED_TIMEOUT_SECS", 15 * 60)?;
        let completed_hours = parse_number(get("LENDQ_RETAIN_COMPLETED_HOURS"), "LENDQ_RETAIN_COMPLETED_HOURS", 24)?;
        let failed_days = parse_number(get("LENDQ_RETAIN_FAILED_DAYS"), "LENDQ_RETAIN_FAILED_DAYS", 30)?;

        let log_format = match get("LENDQ_LOG_FORMAT") {
            Some(raw) => raw.parse::<LogFormat>().map_err(|e| ConfigError::Invalid {
                var: "LENDQ_LOG_FORMAT",
                value: raw.clone(),
                reason: e.to_string(),
            })?,
            None => LogFormat::default(),
        };

        let maintenance = MaintenanceConfig::default()
            .with_interval(Duration::from_secs(maintenance_secs))
            .with_stalled_timeout(Duration::from_secs(stalled_secs))
            .with_retention(RetentionPolicy {
                completed_max_age: Duration::from_secs(completed_hours.saturating_mul(3600)),
                failed_max_age: Duration::from_secs(failed_days.saturating_mul(24 * 3600)),
            });

        Ok(Self {
            database_url,
            db_max_connections: u32::try_from(db_max_connections).map_err(|_| ConfigError::Invalid {
                var: "LENDQ_DB_MAX_CONNECTIONS",
                value: db_max_connections.to_string(),
                reason: "too large".to_string(),
            })?,
            queues,
            maintenance,
            health_interval: Duration::from_secs(health_secs),
            log_format,
            instance: InstanceInfo::from_lookup(&lookup),
        })
    }

    /// Database URL with the password masked, for logging.
    pub fn database_url_masked(&self) -> String {
        if let Some(at_pos) = self.database_url.rfind('@') {
            if let Some(scheme_end) = self.database_url.find("://") {
                let credentials = &self.database_url[scheme_end + 3..at_pos];
                let user = credentials.split(':').next().unwrap_or_default();
                return format!(
                    "{}://{}:***@{}",
                    &self.database_url[..scheme_end],
                    user,
                    &self.database_url[at_pos + 1..]
                );
            }
        }
        self.database_url.clone()
    }
}

fn parse_queues(raw: &str) -> Result<Vec<QueueName>, ConfigError> {
    let mut queues = Vec::new();
    for name in raw.split(',').map(str::trim).filter(|s| !s.is_empty()) {
        let queue = QueueName::new(name).map_err(|e| ConfigError::Invalid {
            var: "LENDQ_QUEUES",
            value: raw.to_string(),
            reason: e.to_string(),
        })?;
        if !queues.contains(&queue) {
            queues.push(queue);
        }
    }
    if queues.is_empty() {
        return Err(ConfigError::Missing("LENDQ_QUEUES"));
    }
    Ok(queues)
}

/// Positive integer with a default when unset.
fn parse_number(raw: Option<String>, var: &'static str, default: u64) -> Result<u64, ConfigError> {
    let Some(raw) = raw else {
        return Ok(default);
    };
    match raw.trim().parse::<u64>() {
        Ok(0) => Err(ConfigError::Invalid {
            var,
            value: raw,
            reason: "must be greater than zero".to_string(),
        }),
        Ok(n) => Ok(n),
        Err(e) => Err(ConfigError::Invalid {
            var,
            value: raw,
            reason: e.to_string(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let env: HashMap<String, String> = pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        move |key: &str| env.get(key).cloned()
    }

    const REQUIRED: [(&str, &str); 2] = [
        ("DATABASE_URL", "postgres://lendq:secret@db:5432/lendq"),
        ("LENDQ_QUEUES", "payments, pdf-processing,payments"),
    ];

    #[test]
    fn defaults_apply_when_unset() {
        let config = WorkerProcessConfig::from_lookup(lookup(&REQUIRED)).unwrap();

        assert_eq!(
            config.queues.iter().map(QueueName::as_str).collect::<Vec<_>>(),
            vec!["payments", "pdf-processing"]
        );
        assert_eq!(config.db_max_connections, 10);
        assert_eq!(config.maintenance, MaintenanceConfig::default());
        assert_eq!(config.health_interval, Duration::from_secs(60));
        assert_eq!(config.log_format, LogFormat::Json);
        assert_eq!(config.instance, InstanceInfo::default());
    }

    #[test]
    fn overrides_are_parsed() {
        let mut pairs = REQUIRED.to_vec();
        pairs.extend([
            ("LENDQ_DB_MAX_CONNECTIONS", "25"),
            ("LENDQ_STALLED_TIMEOUT_SECS", "120"),
            ("LENDQ_RETAIN_COMPLETED_HOURS", "2"),
            ("LENDQ_RETAIN_FAILED_DAYS", "7"),
            ("LENDQ_LOG_FORMAT", "pretty"),
            ("APP_ENV", "production"),
            ("HOSTNAME", "worker-3"),
        ]);
        let config = WorkerProcessConfig::from_lookup(lookup(&pairs)).unwrap();

        assert_eq!(config.db_max_connections, 25);
        assert_eq!(config.maintenance.stalled_timeout, Duration::from_secs(120));
        assert_eq!(config.maintenance.retention.completed_max_age, Duration::from_secs(2 * 3600));
        assert_eq!(config.maintenance.retention.failed_max_age, Duration::from_secs(7 * 24 * 3600));
        assert_eq!(config.log_format, LogFormat::Pretty);
        assert_eq!(config.instance, InstanceInfo::new("production", "worker-3"));
    }

    #[test]
    fn missing_and_invalid_values_are_reported() {
        assert_eq!(
            WorkerProcessConfig::from_lookup(lookup(&[("LENDQ_QUEUES", "payments")])).unwrap_err(),
            ConfigError::Missing("DATABASE_URL")
        );

        let mut pairs = REQUIRED.to_vec();
        pairs.push(("LENDQ_HEALTH_INTERVAL_SECS", "0"));
        assert!(matches!(
            WorkerProcessConfig::from_lookup(lookup(&pairs)).unwrap_err(),
            ConfigError::Invalid { var: "LENDQ_HEALTH_INTERVAL_SECS", .. }
        ));

        let bad_queue = [("DATABASE_URL", "postgres://db/lendq"), ("LENDQ_QUEUES", "Payments Queue")];
        assert!(matches!(
            WorkerProcessConfig::from_lookup(lookup(&bad_queue)).unwrap_err(),
            ConfigError::Invalid { var: "LENDQ_QUEUES", .. }
        ));
    }

    #[test]
    fn masks_database_password() {
        let config = WorkerProcessConfig::from_lookup(lookup(&REQUIRED)).unwrap();
        assert_eq!(config.database_url_masked(), "postgres://lendq:***@db:5432/lendq");
    }
}
