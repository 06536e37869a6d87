use std::num::NonZeroU32;
use std::str::FromStr;

use chrono::{Days, NaiveDate};
use derive_more::{Display, Error};

/// Age in days after which remote backups may be deleted.
///
/// Backups last modified strictly before [`cutoff`](Self::cutoff) are expired.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Display, serde::Deserialize)]
#[serde(try_from = "i64")]
#[display("{_0} day(s)")]
pub struct RetentionPeriod(NonZeroU32);

/// A retention period that isn't a positive number of days.
#[derive(Debug, Display, Error)]
#[display("The retention period has to be a positive number of days, got {_0}")]
pub struct InvalidRetention(#[error(ignore)] String);

impl RetentionPeriod {
    /// Retention of `days` days.
    pub fn days(days: i64) -> Result<Self, InvalidRetention> {
        u32::try_from(days)
            .ok()
            .and_then(NonZeroU32::new)
            .map(Self)
            .ok_or_else(|| InvalidRetention(days.to_string()))
    }

    /// Number of days to retain.
    pub fn get(&self) -> u32 {
        self.0.get()
    }

    /// First day that is still retained when evaluated on `today`.
    pub fn cutoff(&self, today: NaiveDate) -> NaiveDate {
        today
            .checked_sub_days(Days::new(u64::from(self.get())))
            .unwrap_or(NaiveDate::MIN)
    }
}

impl TryFrom<i64> for RetentionPeriod {
    type Error = InvalidRetention;

    fn try_from(days: i64) -> Result<Self, Self::Error> {
        Self::days(days)
    }
}

impl FromStr for RetentionPeriod {
    type Err = InvalidRetention;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let days = s
            .trim()
            .parse::<i64>()
            .map_err(|_| InvalidRetention(s.to_string()))?;
        Self::days(days)
    }
}
