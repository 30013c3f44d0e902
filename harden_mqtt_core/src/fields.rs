//! Typed field model for interoperable sensor data.
//!
//! A tagged union over the value variants keeps the canonicalizer and the
//! troll on a plain `match`; there is no trait object in this layer.

use time::format_description::well_known::Rfc3339;
use time::{Date, Month, OffsetDateTime, Time};

use crate::error::SecurityError;

/// Reserved field name carrying the payload signature. Never accepted as
/// input to signing; appended after.
pub const SIGNATURE_FIELD: &str = "Signature";

/// Readout quality tag. All fields published by this system are automatic
/// readouts, so the tag is a fixed constant on the wire.
pub const QOS_AUTOMATIC_READOUT: &str = "automaticReadout";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FieldType {
    Momentary,
    Peak,
    Status,
    Identity,
    Computed,
}

impl FieldType {
    pub fn as_str(self) -> &'static str {
        match self {
            FieldType::Momentary => "momentary",
            FieldType::Peak => "peak",
            FieldType::Status => "status",
            FieldType::Identity => "identity",
            FieldType::Computed => "computed",
        }
    }

    pub fn parse(text: &str) -> Result<Self, SecurityError> {
        match text {
            "momentary" => Ok(FieldType::Momentary),
            "peak" => Ok(FieldType::Peak),
            "status" => Ok(FieldType::Status),
            "identity" => Ok(FieldType::Identity),
            "computed" => Ok(FieldType::Computed),
            _ => Err(SecurityError::Value("field type")),
        }
    }
}

/// Signed duration in whole seconds, rendered in the ISO 8601
/// `PnDTnHnMnS` shape. Calendar components (years, months) are out of
/// scope for telemetry intervals and rejected on parse.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct IsoDuration {
    seconds: i64,
}

impl IsoDuration {
    pub fn from_seconds(seconds: i64) -> Self {
        Self { seconds }
    }

    pub fn as_seconds(self) -> i64 {
        self.seconds
    }

    pub fn render(self) -> String {
        let mut out = String::new();
        let mut rest = self.seconds;
        if rest < 0 {
            out.push('-');
            rest = -rest;
        }
        out.push('P');
        let days = rest / 86_400;
        rest %= 86_400;
        if days > 0 {
            out.push_str(&format!("{days}D"));
        }
        let hours = rest / 3_600;
        rest %= 3_600;
        let minutes = rest / 60;
        let seconds = rest % 60;
        if hours > 0 || minutes > 0 || seconds > 0 || days == 0 {
            out.push('T');
            if hours > 0 {
                out.push_str(&format!("{hours}H"));
            }
            if minutes > 0 {
                out.push_str(&format!("{minutes}M"));
            }
            if seconds > 0 || (hours == 0 && minutes == 0 && days == 0) {
                out.push_str(&format!("{seconds}S"));
            }
        }
        out
    }

    pub fn parse(text: &str) -> Result<Self, SecurityError> {
        let err = || SecurityError::Value("duration");
        let (negative, rest) = match text.strip_prefix('-') {
            Some(rest) => (true, rest),
            None => (false, text),
        };
        let rest = rest.strip_prefix('P').ok_or_else(err)?;
        if rest.is_empty() {
            return Err(err());
        }
        let (date_part, time_part) = match rest.split_once('T') {
            Some((d, t)) => (d, Some(t)),
            None => (rest, None),
        };
        let mut total: i64 = 0;
        let mut number = String::new();
        for ch in date_part.chars() {
            if ch.is_ascii_digit() {
                number.push(ch);
            } else if ch == 'D' {
                let days: i64 = number.parse().map_err(|_| err())?;
                total = total.checked_add(days.checked_mul(86_400).ok_or_else(err)?).ok_or_else(err)?;
                number.clear();
            } else {
                // Y and M designators are calendar-relative; reject.
                return Err(err());
            }
        }
        if !number.is_empty() {
            return Err(err());
        }
        if let Some(time_part) = time_part {
            if time_part.is_empty() {
                return Err(err());
            }
            for ch in time_part.chars() {
                if ch.is_ascii_digit() {
                    number.push(ch);
                } else {
                    let value: i64 = number.parse().map_err(|_| err())?;
                    number.clear();
                    let scale = match ch {
                        'H' => 3_600,
                        'M' => 60,
                        'S' => 1,
                        _ => return Err(err()),
                    };
                    total = total
                        .checked_add(value.checked_mul(scale).ok_or_else(err)?)
                        .ok_or_else(err)?;
                }
            }
            if !number.is_empty() {
                return Err(err());
            }
        }
        Ok(Self {
            seconds: if negative { -total } else { total },
        })
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum FieldValue {
    Boolean(bool),
    Int32(i32),
    Int64(i64),
    String(String),
    Date(Date),
    DateTime(OffsetDateTime),
    Duration(IsoDuration),
    Time(Time),
    Quantity {
        magnitude: f64,
        decimals: u8,
        unit: String,
    },
    Enum {
        value: String,
        enum_type: String,
    },
}

impl FieldValue {
    /// Canonical string form used as the XML `value` attribute. Quantities
    /// round to the supplied decimal count here and nowhere else.
    pub fn render(&self) -> String {
        match self {
            FieldValue::Boolean(v) => v.to_string(),
            FieldValue::Int32(v) => v.to_string(),
            FieldValue::Int64(v) => v.to_string(),
            FieldValue::String(v) => v.clone(),
            FieldValue::Date(v) => render_date(*v),
            FieldValue::DateTime(v) => render_datetime(*v),
            FieldValue::Duration(v) => v.render(),
            FieldValue::Time(v) => render_time(*v),
            FieldValue::Quantity {
                magnitude,
                decimals,
                ..
            } => format!("{:.*}", *decimals as usize, magnitude),
            FieldValue::Enum { value, .. } => value.clone(),
        }
    }
}

pub fn render_date(date: Date) -> String {
    format!(
        "{:04}-{:02}-{:02}",
        date.year(),
        date.month() as u8,
        date.day()
    )
}

pub fn parse_date(text: &str) -> Result<Date, SecurityError> {
    let err = || SecurityError::Value("date");
    let mut parts = text.splitn(3, '-');
    let year: i32 = parts.next().ok_or_else(err)?.parse().map_err(|_| err())?;
    let month: u8 = parts.next().ok_or_else(err)?.parse().map_err(|_| err())?;
    let day: u8 = parts.next().ok_or_else(err)?.parse().map_err(|_| err())?;
    let month = Month::try_from(month).map_err(|_| err())?;
    Date::from_calendar_date(year, month, day).map_err(|_| err())
}

pub fn render_time(time: Time) -> String {
    format!(
        "{:02}:{:02}:{:02}",
        time.hour(),
        time.minute(),
        time.second()
    )
}

pub fn parse_time(text: &str) -> Result<Time, SecurityError> {
    let err = || SecurityError::Value("time");
    let mut parts = text.splitn(3, ':');
    let hour: u8 = parts.next().ok_or_else(err)?.parse().map_err(|_| err())?;
    let minute: u8 = parts.next().ok_or_else(err)?.parse().map_err(|_| err())?;
    let second: u8 = parts.next().ok_or_else(err)?.parse().map_err(|_| err())?;
    Time::from_hms(hour, minute, second).map_err(|_| err())
}

pub fn render_datetime(value: OffsetDateTime) -> String {
    value
        .format(&Rfc3339)
        .unwrap_or_else(|_| String::from("1970-01-01T00:00:00Z"))
}

pub fn parse_datetime(text: &str) -> Result<OffsetDateTime, SecurityError> {
    OffsetDateTime::parse(text, &Rfc3339).map_err(|_| SecurityError::Value("dateTime"))
}

/// One interoperable field: thing reference, timestamp, name, typed value,
/// field type, and the fixed automatic-readout QoS tag.
#[derive(Clone, Debug, PartialEq)]
pub struct InteroperableField {
    pub thing: String,
    pub timestamp: OffsetDateTime,
    pub name: String,
    pub value: FieldValue,
    pub field_type: FieldType,
}

impl InteroperableField {
    pub fn new(
        thing: impl Into<String>,
        timestamp: OffsetDateTime,
        name: impl Into<String>,
        value: FieldValue,
        field_type: FieldType,
    ) -> Self {
        Self {
            thing: thing.into(),
            timestamp,
            name: name.into(),
            value,
            field_type,
        }
    }

    pub fn is_signature(&self) -> bool {
        self.name == SIGNATURE_FIELD
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn duration_rendering() {
        assert_eq!(IsoDuration::from_seconds(0).render(), "PT0S");
        assert_eq!(IsoDuration::from_seconds(90).render(), "PT1M30S");
        assert_eq!(IsoDuration::from_seconds(-3600).render(), "-PT1H");
        assert_eq!(IsoDuration::from_seconds(86_400).render(), "P1D");
        assert_eq!(IsoDuration::from_seconds(90_061).render(), "P1DT1H1M1S");
    }

    #[test]
    fn duration_parse_rejects_calendar_designators() {
        assert!(IsoDuration::parse("P1Y").is_err());
        assert!(IsoDuration::parse("P2M").is_err());
        assert!(IsoDuration::parse("P").is_err());
        assert!(IsoDuration::parse("PT").is_err());
        assert!(IsoDuration::parse("12S").is_err());
    }

    #[test]
    fn quantity_rounds_to_decimals() {
        let value = FieldValue::Quantity {
            magnitude: 21.4567,
            decimals: 1,
            unit: "°C".into(),
        };
        assert_eq!(value.render(), "21.5");
        let value = FieldValue::Quantity {
            magnitude: 1013.0,
            decimals: 0,
            unit: "hPa".into(),
        };
        assert_eq!(value.render(), "1013");
    }

    #[test]
    fn date_and_time_roundtrip() {
        let date = parse_date("2026-08-02").unwrap();
        assert_eq!(render_date(date), "2026-08-02");
        let time = parse_time("07:05:59").unwrap();
        assert_eq!(render_time(time), "07:05:59");
        assert!(parse_date("2026-13-02").is_err());
        assert!(parse_time("25:00:00").is_err());
    }

    proptest! {
        #[test]
        fn duration_roundtrip(seconds in -10_000_000i64..10_000_000) {
            let duration = IsoDuration::from_seconds(seconds);
            let parsed = IsoDuration::parse(&duration.render()).unwrap();
            prop_assert_eq!(parsed, duration);
        }
    }
}
