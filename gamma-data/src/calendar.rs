use crate::{config::CalendarConfig, error::DataError};
use chrono::{DateTime, Datelike, NaiveDate, NaiveDateTime, NaiveTime, TimeZone, Utc, Weekday};
use chrono_tz::Tz;

const NSE_OPEN: NaiveTime = match NaiveTime::from_hms_opt(9, 15, 0) {
    Some(time) => time,
    None => panic!("invalid NSE open time"),
};

const NSE_CLOSE: NaiveTime = match NaiveTime::from_hms_opt(15, 30, 0) {
    Some(time) => time,
    None => panic!("invalid NSE close time"),
};

/// Market-hours predicate in the exchange's local time zone.
///
/// Open means a weekday with local time inside `[open, close]`, both ends inclusive.
/// Exchange holidays are not modelled.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct MarketCalendar {
    pub tz: Tz,
    pub open: NaiveTime,
    pub close: NaiveTime,
}

impl Default for MarketCalendar {
    fn default() -> Self {
        Self {
            tz: chrono_tz::Asia::Kolkata,
            open: NSE_OPEN,
            close: NSE_CLOSE,
        }
    }
}

impl MarketCalendar {
    pub fn from_config(config: &CalendarConfig) -> Result<Self, DataError> {
        let tz = config
            .timezone
            .parse::<Tz>()
            .map_err(|_| DataError::Config(format!("unknown time zone: {}", config.timezone)))?;
        let open = parse_clock(&config.open)?;
        let close = parse_clock(&config.close)?;

        if open >= close {
            return Err(DataError::Config(format!(
                "market open {open} must precede close {close}"
            )));
        }

        Ok(Self { tz, open, close })
    }

    pub fn local_date(&self, now: DateTime<Utc>) -> NaiveDate {
        now.with_timezone(&self.tz).date_naive()
    }

    pub fn is_open(&self, now: DateTime<Utc>) -> bool {
        let local = now.with_timezone(&self.tz);
        if matches!(local.weekday(), Weekday::Sat | Weekday::Sun) {
            return false;
        }

        let time = local.time();
        self.open <= time && time <= self.close
    }

    /// Instant after which a value resolved at `resolved_at` must no longer be used.
    ///
    /// This is local market close of the resolution day, or local midnight ending that day
    /// when resolved after close.
    pub fn valid_until(&self, resolved_at: DateTime<Utc>) -> DateTime<Utc> {
        let local = resolved_at.with_timezone(&self.tz);
        let date = local.date_naive();

        let boundary = if local.time() <= self.close {
            date.and_time(self.close)
        } else {
            date.succ_opt()
                .unwrap_or(date)
                .and_time(NaiveTime::MIN)
        };

        self.to_utc(boundary).unwrap_or(resolved_at)
    }

    fn to_utc(&self, local: NaiveDateTime) -> Option<DateTime<Utc>> {
        self.tz
            .from_local_datetime(&local)
            .earliest()
            .map(|time| time.with_timezone(&Utc))
    }
}

fn parse_clock(input: &str) -> Result<NaiveTime, DataError> {
    NaiveTime::parse_from_str(input, "%H:%M")
        .or_else(|_| NaiveTime::parse_from_str(input, "%H:%M:%S"))
        .map_err(|error| DataError::Config(format!("invalid clock time {input}: {error}")))
}
