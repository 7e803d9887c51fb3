// Exchange-local session time <-> absolute instant conversion
use chrono::offset::LocalResult;
use chrono::{DateTime, NaiveDate, NaiveTime, TimeZone, Utc};
use chrono_tz::Tz;
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum ClockError {
    #[error("unknown timezone '{0}'")]
    UnknownTimezone(String),

    #[error("local time {time} on {date} does not exist in {tz} (clock gap)")]
    Nonexistent {
        date: NaiveDate,
        time: NaiveTime,
        tz: String,
    },

    #[error("local time {time} on {date} is ambiguous in {tz} (clock reversal)")]
    Ambiguous {
        date: NaiveDate,
        time: NaiveTime,
        tz: String,
    },

    #[error("session times out of order on {date}: {detail}")]
    OutOfOrder { date: NaiveDate, detail: String },
}

/// A local session time and the absolute instant derived from it
///
/// The UTC value is always computed from `local`, never rebuilt separately.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SessionInstant {
    pub local: DateTime<Tz>,
    pub utc: DateTime<Utc>,
}

impl SessionInstant {
    fn from_local(local: DateTime<Tz>) -> Self {
        Self {
            utc: local.with_timezone(&Utc),
            local,
        }
    }
}

/// The three instants that drive one stream for one trading date
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SessionTimes {
    pub trading_date: NaiveDate,
    pub window_start: SessionInstant,
    pub lock: SessionInstant,
    pub cutoff: SessionInstant,
}

impl SessionTimes {
    /// Observation window length
    pub fn window_len(&self) -> chrono::Duration {
        self.lock.utc - self.window_start.utc
    }
}

/// Converts trading date + exchange-local time into absolute instants
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SessionClock {
    tz: Tz,
}

impl SessionClock {
    pub fn new(tz: Tz) -> Self {
        Self { tz }
    }

    /// Build a clock from an IANA name such as "America/Chicago"
    pub fn from_name(name: &str) -> Result<Self, ClockError> {
        let tz: Tz = name
            .parse()
            .map_err(|_| ClockError::UnknownTimezone(name.to_string()))?;
        Ok(Self { tz })
    }

    pub fn timezone(&self) -> Tz {
        self.tz
    }

    /// Resolve a local time on a given date using that date's offset
    pub fn resolve(&self, date: NaiveDate, time: NaiveTime) -> Result<SessionInstant, ClockError> {
        match self.tz.from_local_datetime(&date.and_time(time)) {
            LocalResult::Single(local) => Ok(SessionInstant::from_local(local)),
            LocalResult::None => Err(ClockError::Nonexistent {
                date,
                time,
                tz: self.tz.name().to_string(),
            }),
            LocalResult::Ambiguous(_, _) => Err(ClockError::Ambiguous {
                date,
                time,
                tz: self.tz.name().to_string(),
            }),
        }
    }

    /// Absolute instant for a trading date and local time of day
    pub fn to_instant(&self, date: NaiveDate, time: NaiveTime) -> Result<DateTime<Utc>, ClockError> {
        Ok(self.resolve(date, time)?.utc)
    }

    /// Exchange-local view of an absolute instant
    pub fn to_local(&self, instant: DateTime<Utc>) -> DateTime<Tz> {
        instant.with_timezone(&self.tz)
    }

    /// Exchange-local calendar date of an instant
    pub fn trading_date(&self, instant: DateTime<Utc>) -> NaiveDate {
        self.to_local(instant).date_naive()
    }

    /// Resolve window start, lock and cutoff for one date
    ///
    /// Requires `window_start < lock < cutoff` on the absolute timeline.
    pub fn session_times(
        &self,
        date: NaiveDate,
        window_start: NaiveTime,
        lock: NaiveTime,
        cutoff: NaiveTime,
    ) -> Result<SessionTimes, ClockError> {
        let window_start = self.resolve(date, window_start)?;
        let lock = self.resolve(date, lock)?;
        let cutoff = self.resolve(date, cutoff)?;

        if window_start.utc >= lock.utc {
            return Err(ClockError::OutOfOrder {
                date,
                detail: format!(
                    "window start {} is not before lock {}",
                    window_start.local, lock.local
                ),
            });
        }
        if lock.utc >= cutoff.utc {
            return Err(ClockError::OutOfOrder {
                date,
                detail: format!("lock {} is not before cutoff {}", lock.local, cutoff.local),
            });
        }

        Ok(SessionTimes {
            trading_date: date,
            window_start,
            lock,
            cutoff,
        })
    }
}
