use crate::errors::{AppError, AppResult};
use crate::grid::is_allowed_break_position;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

pub const ENV_DATA_DIR: &str = "SSMS_DATA_DIR";
pub const ENV_LOG_FILTER: &str = "SSMS_LOG_FILTER";
pub const ENV_SEED_DEMO: &str = "SSMS_SEED_DEMO";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceConfig {
    pub data_dir: PathBuf,
    pub database_file: String,
    pub log_filter: String,
    pub log_to_file: bool,
    pub default_break_after_period: u8,
    pub seed_demo_data: bool,
    pub change_log_limit: u32,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("data"),
            database_file: "timetable.db".to_string(),
            log_filter: "info".to_string(),
            log_to_file: true,
            default_break_after_period: 3,
            seed_demo_data: false,
            change_log_limit: 100,
        }
    }
}

impl ServiceConfig {
    /// Defaults, overlaid by the JSON file when given, then by the environment.
    pub fn load(path: Option<&Path>) -> AppResult<Self> {
        let mut value = serde_json::to_value(Self::default())?;
        if let Some(path) = path {
            let raw = fs::read_to_string(path)
                .map_err(|error| AppError::Io(format!("failed to read config {}: {}", path.display(), error)))?;
            let overrides: serde_json::Value = serde_json::from_str(&raw)?;
            merge_json(&mut value, overrides);
        }

        let mut config: Self = serde_json::from_value(value)?;
        config.apply_env_overrides(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    pub fn apply_env_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) -> AppResult<()> {
        if let Some(data_dir) = lookup(ENV_DATA_DIR).filter(|value| !value.trim().is_empty()) {
            self.data_dir = PathBuf::from(data_dir.trim());
        }
        if let Some(filter) = lookup(ENV_LOG_FILTER).filter(|value| !value.trim().is_empty()) {
            self.log_filter = filter.trim().to_string();
        }
        if let Some(seed) = lookup(ENV_SEED_DEMO) {
            self.seed_demo_data = parse_flag(ENV_SEED_DEMO, &seed)?;
        }
        Ok(())
    }

    pub fn validate(&self) -> AppResult<()> {
        if !is_allowed_break_position(self.default_break_after_period) {
            return Err(AppError::validation(
                "defaultBreakAfterPeriod",
                "Break can only be after period 3 or 4",
            ));
        }
        if self.change_log_limit == 0 {
            return Err(AppError::validation("changeLogLimit", "must be greater than zero"));
        }
        if self.database_file.trim().is_empty() {
            return Err(AppError::validation("databaseFile", "must not be empty"));
        }
        Ok(())
    }

    pub fn database_path(&self) -> PathBuf {
        self.data_dir.join(&self.database_file)
    }

    pub fn log_dir(&self) -> PathBuf {
        self.data_dir.join("logs")
    }
}

fn parse_flag(field: &str, raw: &str) -> AppResult<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" | "" => Ok(false),
        other => Err(AppError::validation(field, format!("unrecognized flag value '{}'", other))),
    }
}

fn merge_json(target: &mut serde_json::Value, update: serde_json::Value) {
    match (target, update) {
        (serde_json::Value::Object(target_map), serde_json::Value::Object(update_map)) => {
            for (key, value) in update_map {
                merge_json(target_map.entry(key).or_insert(serde_json::Value::Null), value);
            }
        }
        (target, update) => {
            *target = update;
        }
    }
}
