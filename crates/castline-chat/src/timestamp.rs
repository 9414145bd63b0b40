use chrono::{DateTime, FixedOffset, NaiveDate, NaiveDateTime, Offset, Utc};

use castline_types::CreatedAt;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ClockStyle {
    /// `10:00 AM`
    #[default]
    TwelveHour,
    /// `10:00`
    TwentyFourHour,
}

/// Where and how message times are shown. Fixed at session start so that
/// normalizing stays a pure function of its inputs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DisplayClock {
    offset: FixedOffset,
    style: ClockStyle,
}

impl DisplayClock {
    pub fn new(offset: FixedOffset, style: ClockStyle) -> Self {
        Self { offset, style }
    }

    pub fn utc(style: ClockStyle) -> Self {
        Self::new(Utc.fix(), style)
    }

    /// Uses the host's current UTC offset.
    pub fn local(style: ClockStyle) -> Self {
        Self::new(chrono::Local::now().offset().fix(), style)
    }

    pub fn format(&self, at: DateTime<Utc>) -> String {
        let local = at.with_timezone(&self.offset);
        let pattern = match self.style {
            ClockStyle::TwelveHour => "%I:%M %p",
            ClockStyle::TwentyFourHour => "%H:%M",
        };
        local.format(pattern).to_string()
    }

    /// Clock time for a message that has no server timestamp yet.
    pub fn now(&self) -> String {
        self.format(Utc::now())
    }
}

/// Renders a server creation time as a short clock string.
///
/// Returns `""` for absent or unparseable input; never fails.
pub fn normalize(created_at: Option<&CreatedAt>, clock: &DisplayClock) -> String {
    match created_at.and_then(to_instant) {
        Some(at) => clock.format(at),
        None => String::new(),
    }
}

fn to_instant(created_at: &CreatedAt) -> Option<DateTime<Utc>> {
    match created_at {
        CreatedAt::Structured {
            seconds,
            nanoseconds,
        } => {
            let carry = i64::from(nanoseconds / 1_000_000_000);
            DateTime::from_timestamp(seconds.checked_add(carry)?, nanoseconds % 1_000_000_000)
        }
        CreatedAt::Iso(raw) => parse_iso(raw),
        CreatedAt::EpochMillis(ms) => DateTime::from_timestamp_millis(*ms),
        CreatedAt::Unrecognized(_) => None,
    }
}

fn parse_iso(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    if let Ok(at) = DateTime::parse_from_rfc3339(raw) {
        return Some(at.with_timezone(&Utc));
    }

    // Zone-less values are taken as UTC, the way the backend's SQL layer
    // writes them.
    for pattern in ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(raw, pattern) {
            return Some(naive.and_utc());
        }
    }

    NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|naive| naive.and_utc())
}
