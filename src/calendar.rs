//! Frequency calendar
//!
//! Maps a charge date and a pledge frequency to the next charge date.
//! Month-based frequencies keep the day of month and clamp to the last
//! day when the target month is shorter (Jan 31 → Feb 28/29).

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Duration, Months, Utc};
use serde::{Deserialize, Serialize};

use crate::error::BillingError;

/// How often a pledge is charged
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Frequency {
    Weekly,
    Biweekly,
    Monthly,
    Quarterly,
    Yearly,
}

impl Frequency {
    pub const ALL: [Frequency; 5] = [
        Frequency::Weekly,
        Frequency::Biweekly,
        Frequency::Monthly,
        Frequency::Quarterly,
        Frequency::Yearly,
    ];

    /// Value stored in the `frequency` column
    pub fn as_str(&self) -> &'static str {
        match self {
            Frequency::Weekly => "WEEKLY",
            Frequency::Biweekly => "BIWEEKLY",
            Frequency::Monthly => "MONTHLY",
            Frequency::Quarterly => "QUARTERLY",
            Frequency::Yearly => "YEARLY",
        }
    }
}

impl fmt::Display for Frequency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Frequency {
    type Err = BillingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Frequency::ALL
            .into_iter()
            .find(|f| f.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| BillingError::InvalidData(format!("Unknown pledge frequency: {}", s)))
    }
}

/// Compute the next charge date after `from`
pub fn next_charge_date(from: DateTime<Utc>, frequency: Frequency) -> DateTime<Utc> {
    let next = match frequency {
        Frequency::Weekly => from.checked_add_signed(Duration::days(7)),
        Frequency::Biweekly => from.checked_add_signed(Duration::days(14)),
        Frequency::Monthly => from.checked_add_months(Months::new(1)),
        Frequency::Quarterly => from.checked_add_months(Months::new(3)),
        Frequency::Yearly => from.checked_add_months(Months::new(12)),
    };

    // Only reachable at the edge of chrono's representable range
    next.unwrap_or(DateTime::<Utc>::MAX_UTC)
}
