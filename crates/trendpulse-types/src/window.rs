use std::fmt;

use chrono::{DateTime, FixedOffset, NaiveDate, Timelike, Utc};
use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Default local offset for window computation (UTC+8, where the source
/// platforms publish their hot lists).
pub const DEFAULT_UTC_OFFSET_HOURS: i32 = 8;

/// Third-of-day bucket. The boundary policy is fixed: hour < 14 is AM,
/// 14..20 is PM, 20.. is EVE.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum WindowSlot {
    Am,
    Pm,
    Eve,
}

impl WindowSlot {
    pub fn from_hour(hour: u32) -> Self {
        if hour < 14 {
            WindowSlot::Am
        } else if hour < 20 {
            WindowSlot::Pm
        } else {
            WindowSlot::Eve
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            WindowSlot::Am => "AM",
            WindowSlot::Pm => "PM",
            WindowSlot::Eve => "EVE",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "AM" => Ok(WindowSlot::Am),
            "PM" => Ok(WindowSlot::Pm),
            "EVE" => Ok(WindowSlot::Eve),
            other => Err(Error::Parse(format!("unknown window slot '{}'", other))),
        }
    }
}

impl fmt::Display for WindowSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Collection window identifier, e.g. `2025-11-07_AM`. The identifier is the
/// sole coupling between ingestion and the merge stages: every item is tagged
/// with the window it was fetched in, and every merge run is scoped to one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Window {
    pub date: NaiveDate,
    pub slot: WindowSlot,
}

impl Window {
    pub fn new(date: NaiveDate, slot: WindowSlot) -> Self {
        Self { date, slot }
    }

    /// Window for a timestamp, evaluated in the given local offset.
    pub fn from_datetime(ts: DateTime<Utc>, utc_offset_hours: i32) -> Self {
        let offset = FixedOffset::east_opt(utc_offset_hours * 3600)
            .unwrap_or_else(|| FixedOffset::east_opt(0).unwrap());
        let local = ts.with_timezone(&offset);
        Self {
            date: local.date_naive(),
            slot: WindowSlot::from_hour(local.hour()),
        }
    }

    pub fn current(utc_offset_hours: i32) -> Self {
        Self::from_datetime(Utc::now(), utc_offset_hours)
    }

    pub fn parse(s: &str) -> Result<Self> {
        let (date_part, slot_part) = s
            .split_once('_')
            .ok_or_else(|| Error::Parse(format!("window '{}' missing '_' separator", s)))?;
        let date = date_part
            .parse::<NaiveDate>()
            .map_err(|e| Error::Parse(format!("window '{}': {}", s, e)))?;
        Ok(Self {
            date,
            slot: WindowSlot::parse(slot_part)?,
        })
    }
}

impl fmt::Display for Window {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}_{}", self.date.format("%Y-%m-%d"), self.slot)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn utc(y: i32, mo: u32, d: u32, h: u32, mi: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, mo, d, h, mi, 0).unwrap()
    }

    #[test]
    fn test_slot_boundaries() {
        assert_eq!(WindowSlot::from_hour(0), WindowSlot::Am);
        assert_eq!(WindowSlot::from_hour(13), WindowSlot::Am);
        assert_eq!(WindowSlot::from_hour(14), WindowSlot::Pm);
        assert_eq!(WindowSlot::from_hour(19), WindowSlot::Pm);
        assert_eq!(WindowSlot::from_hour(20), WindowSlot::Eve);
        assert_eq!(WindowSlot::from_hour(23), WindowSlot::Eve);
    }

    #[test]
    fn test_window_uses_local_offset() {
        // 03:00 UTC is 11:00 at UTC+8 -> AM window of the same local day
        let w = Window::from_datetime(utc(2025, 11, 7, 3, 0), 8);
        assert_eq!(w.to_string(), "2025-11-07_AM");

        // 07:00 UTC is 15:00 at UTC+8 -> PM
        let w = Window::from_datetime(utc(2025, 11, 7, 7, 0), 8);
        assert_eq!(w.to_string(), "2025-11-07_PM");

        // 13:00 UTC is 21:00 at UTC+8 -> EVE
        let w = Window::from_datetime(utc(2025, 11, 7, 13, 0), 8);
        assert_eq!(w.to_string(), "2025-11-07_EVE");
    }

    #[test]
    fn test_window_crosses_date_line() {
        // 17:00 UTC on Nov 6 is 01:00 Nov 7 at UTC+8
        let w = Window::from_datetime(utc(2025, 11, 6, 17, 0), 8);
        assert_eq!(w.to_string(), "2025-11-07_AM");
    }

    #[test]
    fn test_parse_round_trip() {
        for s in ["2025-11-07_AM", "2025-01-02_PM", "2024-12-31_EVE"] {
            let w = Window::parse(s).unwrap();
            assert_eq!(w.to_string(), s);
        }
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(Window::parse("2025-11-07").is_err());
        assert!(Window::parse("2025-11-07_NOON").is_err());
        assert!(Window::parse("notadate_AM").is_err());
    }
}
