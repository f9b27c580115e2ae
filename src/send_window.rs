//! Working-hours pre-filter for claiming.
//!
//! The window decides whether an account may claim anything at all this
//! tick; queue items themselves carry no window information.

use chrono::{DateTime, Datelike, NaiveDate, Timelike, Utc, Weekday};
use chrono_tz::Tz;

use crate::error::EngineError;
use crate::types::SendWindowConfig;

#[derive(Debug, Clone)]
pub struct SendWindow {
    tz: Tz,
    start_hour: u32,
    end_hour: u32,
    skip_weekends: bool,
    holidays: Vec<NaiveDate>,
}

impl SendWindow {
    pub fn from_config(config: &SendWindowConfig) -> Result<Self, EngineError> {
        let tz: Tz = config.timezone.parse().map_err(|_| {
            EngineError::Config(format!("Invalid send window timezone: {}", config.timezone))
        })?;
        if config.start_hour >= config.end_hour || config.end_hour > 24 {
            return Err(EngineError::Config(format!(
                "Invalid send window hours: {}..{}",
                config.start_hour, config.end_hour
            )));
        }
        Ok(Self {
            tz,
            start_hour: config.start_hour,
            end_hour: config.end_hour,
            skip_weekends: config.skip_weekends,
            holidays: config.holidays.clone(),
        })
    }

    /// Whether sends may go out at `now`. Hours are `[start, end)` local time.
    pub fn allows(&self, now: DateTime<Utc>) -> bool {
        let local = now.with_timezone(&self.tz);
        if self.skip_weekends && matches!(local.weekday(), Weekday::Sat | Weekday::Sun) {
            return false;
        }
        if self.holidays.contains(&local.date_naive()) {
            return false;
        }
        let hour = local.hour();
        hour >= self.start_hour && hour < self.end_hour
    }
}
