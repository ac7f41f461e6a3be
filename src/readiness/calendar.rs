//! Exchange session calendar: fixed UTC offset, open/close, weekends and
//! a holiday list.

use chrono::{DateTime, Datelike, Duration, NaiveTime, Utc, Weekday};

use crate::runtime_config::CalendarConfig;

/// Parse `HH:MM` (24h).
pub fn parse_hhmm(s: &str) -> Option<NaiveTime> {
    NaiveTime::parse_from_str(s.trim(), "%H:%M").ok()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionStatus {
    pub market_open: bool,
    pub holiday: bool,
}

#[derive(Debug, Clone)]
pub struct SessionCalendar {
    config: CalendarConfig,
}

impl SessionCalendar {
    pub fn new(config: CalendarConfig) -> Self {
        Self { config }
    }

    /// Session state at `now`. Unparseable open/close times read as closed.
    pub fn status(&self, now: DateTime<Utc>) -> SessionStatus {
        let local = now.naive_utc() + Duration::minutes(i64::from(self.config.utc_offset_minutes));
        let date = local.date();

        let holiday = self.config.holidays.contains(&date);
        let weekend = matches!(date.weekday(), Weekday::Sat | Weekday::Sun);
        if holiday || (weekend && !self.config.trade_weekends) {
            return SessionStatus {
                market_open: false,
                holiday,
            };
        }

        let (Some(open), Some(close)) = (
            parse_hhmm(&self.config.session_open),
            parse_hhmm(&self.config.session_close),
        ) else {
            return SessionStatus {
                market_open: false,
                holiday,
            };
        };

        let t = local.time();
        SessionStatus {
            market_open: t >= open && t < close,
            holiday,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{NaiveDate, TimeZone};

    fn cal() -> SessionCalendar {
        SessionCalendar::new(CalendarConfig {
            holidays: vec![NaiveDate::from_ymd_opt(2026, 11, 9).unwrap()],
            ..CalendarConfig::default()
        })
    }

    fn utc(y: i32, m: u32, d: u32, h: u32, min: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, m, d, h, min, 0).unwrap()
    }

    #[test]
    fn parses_hhmm() {
        assert_eq!(parse_hhmm("09:15"), NaiveTime::from_hms_opt(9, 15, 0));
        assert_eq!(parse_hhmm(" 15:30 "), NaiveTime::from_hms_opt(15, 30, 0));
        assert_eq!(parse_hhmm("9am"), None);
        assert_eq!(parse_hhmm("25:00"), None);
    }

    #[test]
    fn session_boundaries_in_local_time() {
        let c = cal();
        // Monday 2026-10-19; 09:15 IST = 03:45 UTC, 15:30 IST = 10:00 UTC.
        assert!(!c.status(utc(2026, 10, 19, 3, 44)).market_open);
        assert!(c.status(utc(2026, 10, 19, 3, 45)).market_open);
        assert!(c.status(utc(2026, 10, 19, 9, 59)).market_open);
        assert!(!c.status(utc(2026, 10, 19, 10, 0)).market_open);
    }

    #[test]
    fn weekends_and_holidays_are_closed() {
        let c = cal();
        // Saturday.
        let sat = c.status(utc(2026, 10, 24, 5, 0));
        assert!(!sat.market_open && !sat.holiday);
        // Listed holiday (Monday).
        let hol = c.status(utc(2026, 11, 9, 5, 0));
        assert!(!hol.market_open && hol.holiday);
    }
}
