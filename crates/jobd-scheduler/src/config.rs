//! Knobs shared by the legacy and priority schedulers.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use jobd_types::Settings;

use crate::SchedulerError;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// IANA zone cron expressions are evaluated in.
    #[serde(default = "default_timezone")]
    pub timezone: String,

    /// Fixed tick of the legacy scanner in milliseconds.
    #[serde(default = "default_legacy_tick_ms")]
    pub legacy_tick_ms: u64,

    /// Shortest delay between two priority-scheduler wakeups.
    #[serde(default = "default_min_check_interval_ms")]
    pub min_check_interval_ms: u64,

    /// Longest delay between two priority-scheduler wakeups.
    #[serde(default = "default_max_check_interval_ms")]
    pub max_check_interval_ms: u64,

    /// On wake, entries due within `now + due_buffer_ms` fire.
    #[serde(default = "default_due_buffer_ms")]
    pub due_buffer_ms: u64,
}

fn default_timezone() -> String {
    "UTC".to_string()
}

fn default_legacy_tick_ms() -> u64 {
    5_000
}

fn default_min_check_interval_ms() -> u64 {
    1_000
}

fn default_max_check_interval_ms() -> u64 {
    60_000
}

fn default_due_buffer_ms() -> u64 {
    500
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            timezone: default_timezone(),
            legacy_tick_ms: default_legacy_tick_ms(),
            min_check_interval_ms: default_min_check_interval_ms(),
            max_check_interval_ms: default_max_check_interval_ms(),
            due_buffer_ms: default_due_buffer_ms(),
        }
    }
}

impl SchedulerConfig {
    /// Take the scheduler-related fields from the daemon settings.
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            timezone: settings.timezone.clone(),
            legacy_tick_ms: settings.legacy_tick_ms,
            min_check_interval_ms: settings.min_check_interval_ms,
            max_check_interval_ms: settings.max_check_interval_ms,
            due_buffer_ms: settings.due_buffer_ms,
        }
    }

    /// Resolve `timezone`, rejecting names chrono-tz does not know.
    pub fn parse_timezone(&self) -> Result<chrono_tz::Tz, SchedulerError> {
        self.timezone
            .parse::<chrono_tz::Tz>()
            .map_err(|_| SchedulerError::InvalidTimezone(self.timezone.clone()))
    }

    pub fn legacy_tick(&self) -> Duration {
        Duration::from_millis(self.legacy_tick_ms)
    }

    pub fn min_check_interval(&self) -> Duration {
        Duration::from_millis(self.min_check_interval_ms)
    }

    pub fn max_check_interval(&self) -> Duration {
        Duration::from_millis(self.max_check_interval_ms.max(self.min_check_interval_ms))
    }

    pub fn due_buffer(&self) -> chrono::Duration {
        chrono::Duration::milliseconds(self.due_buffer_ms as i64)
    }
}
