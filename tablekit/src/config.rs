use anyhow::Result;
use config::{Config, File};
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::errors::TableError;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    pub project: String,
    pub instance: String,
    pub app_profile: String,
    pub retry: RetryConfig,
    /// Upper bound on mutation ops sent in one bulk request.
    pub max_mutations: usize,
    /// Messages drained from a cancelled read stream before giving up on it.
    pub drain_limit: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            project: "project".to_string(),
            instance: "instance".to_string(),
            app_profile: String::new(),
            retry: RetryConfig::default(),
            max_mutations: 100_000,
            drain_limit: 64,
        }
    }
}

impl ClientConfig {
    pub fn new(project: impl Into<String>, instance: impl Into<String>) -> Self {
        Self {
            project: project.into(),
            instance: instance.into(),
            ..Self::default()
        }
    }

    pub fn validate(&self) -> Result<(), TableError> {
        if self.project.is_empty() || self.instance.is_empty() {
            return Err(TableError::Config(
                "project and instance must not be empty".to_string(),
            ));
        }
        if self.max_mutations == 0 {
            return Err(TableError::Config("max_mutations must be positive".to_string()));
        }
        self.retry.validate()
    }

    pub fn full_instance_name(&self) -> String {
        format!("projects/{}/instances/{}", self.project, self.instance)
    }

    pub fn full_table_name(&self, table: &str) -> String {
        format!("{}/tables/{}", self.full_instance_name(), table)
    }

    pub fn full_authorized_view_name(&self, table: &str, view: &str) -> String {
        format!("{}/authorizedViews/{}", self.full_table_name(table), view)
    }

    pub fn full_materialized_view_name(&self, view: &str) -> String {
        format!("{}/materializedViews/{}", self.full_instance_name(), view)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
    pub multiplier: f64,
    /// Attempts per call, including the first. `None` retries until the
    /// policy declines.
    pub max_attempts: Option<u32>,
    /// Use retry delays sent by the server when present.
    pub honor_retry_info: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            initial_backoff_ms: 100,
            max_backoff_ms: 2_000,
            multiplier: 1.2,
            max_attempts: None,
            honor_retry_info: true,
        }
    }
}

impl RetryConfig {
    pub fn initial_backoff(&self) -> Duration {
        Duration::from_millis(self.initial_backoff_ms)
    }

    pub fn max_backoff(&self) -> Duration {
        Duration::from_millis(self.max_backoff_ms)
    }

    pub fn validate(&self) -> Result<(), TableError> {
        if self.multiplier < 1.0 {
            return Err(TableError::Config(format!(
                "retry multiplier must be at least 1, got {}",
                self.multiplier
            )));
        }
        if self.max_backoff_ms < self.initial_backoff_ms {
            return Err(TableError::Config(
                "max_backoff_ms must not be below initial_backoff_ms".to_string(),
            ));
        }
        if self.max_attempts == Some(0) {
            return Err(TableError::Config("max_attempts must be positive".to_string()));
        }
        Ok(())
    }
}

pub fn load_config(path: &str) -> Result<ClientConfig> {
    let config = Config::builder()
        .add_source(File::with_name(path))
        .add_source(config::Environment::with_prefix("TABLEKIT").separator("__"))
        .build()?;

    let client: ClientConfig = config.try_deserialize()?;
    client.validate()?;
    Ok(client)
}
