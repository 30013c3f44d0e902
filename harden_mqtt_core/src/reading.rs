//! The sensor's domain object.
//!
//! The security layer treats a reading opaquely: it is flattened into
//! per-field strings for the unstructured namespace, serialized whole for
//! the structured namespace, and converted into the typed field sequence
//! for everything interoperable and secured.

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::fields::{FieldType, FieldValue, InteroperableField};

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SensorReading {
    /// Instant the physical readout was taken.
    #[serde(with = "time::serde::rfc3339")]
    pub readout: OffsetDateTime,
    /// Instant the reading was published.
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
    pub name: String,
    pub id: String,
    pub country: String,
    pub time_zone: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature_celsius: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub humidity_percent: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pressure_hpa: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub wind_speed_mps: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

impl SensorReading {
    /// Per-field string forms (unit suffix where applicable) for the
    /// unstructured namespace. Field name, rendered value.
    pub fn unstructured_fields(&self) -> Vec<(&'static str, String)> {
        let mut out = Vec::new();
        out.push(("Readout", crate::fields::render_datetime(self.readout)));
        out.push(("Timestamp", crate::fields::render_datetime(self.timestamp)));
        out.push(("Name", self.name.clone()));
        out.push(("Id", self.id.clone()));
        out.push(("Country", self.country.clone()));
        out.push(("TimeZone", self.time_zone.clone()));
        if let Some(v) = self.temperature_celsius {
            out.push(("Temperature", format!("{v:.1} °C")));
        }
        if let Some(v) = self.humidity_percent {
            out.push(("Humidity", format!("{v:.1} %")));
        }
        if let Some(v) = self.pressure_hpa {
            out.push(("Pressure", format!("{v:.1} hPa")));
        }
        if let Some(v) = self.wind_speed_mps {
            out.push(("WindSpeed", format!("{v:.1} m/s")));
        }
        if let Some(v) = &self.description {
            out.push(("Description", v.clone()));
        }
        out
    }

    /// Typed field sequence for the interoperable and secured namespaces.
    /// Order is fixed; the canonicalizer preserves it verbatim.
    pub fn interoperable_fields(&self) -> Vec<InteroperableField> {
        let thing = self.id.as_str();
        let ts = self.timestamp;
        let mut out = vec![
            InteroperableField::new(
                thing,
                ts,
                "Readout",
                FieldValue::DateTime(self.readout),
                FieldType::Momentary,
            ),
            InteroperableField::new(
                thing,
                ts,
                "Name",
                FieldValue::String(self.name.clone()),
                FieldType::Identity,
            ),
            InteroperableField::new(
                thing,
                ts,
                "Country",
                FieldValue::String(self.country.clone()),
                FieldType::Identity,
            ),
            InteroperableField::new(
                thing,
                ts,
                "TimeZone",
                FieldValue::String(self.time_zone.clone()),
                FieldType::Identity,
            ),
        ];
        if let Some(v) = self.temperature_celsius {
            out.push(InteroperableField::new(
                thing,
                ts,
                "Temperature",
                FieldValue::Quantity {
                    magnitude: v,
                    decimals: 1,
                    unit: "°C".into(),
                },
                FieldType::Momentary,
            ));
        }
        if let Some(v) = self.humidity_percent {
            out.push(InteroperableField::new(
                thing,
                ts,
                "Humidity",
                FieldValue::Quantity {
                    magnitude: v,
                    decimals: 1,
                    unit: "%".into(),
                },
                FieldType::Momentary,
            ));
        }
        if let Some(v) = self.pressure_hpa {
            out.push(InteroperableField::new(
                thing,
                ts,
                "Pressure",
                FieldValue::Quantity {
                    magnitude: v,
                    decimals: 1,
                    unit: "hPa".into(),
                },
                FieldType::Momentary,
            ));
        }
        if let Some(v) = self.wind_speed_mps {
            out.push(InteroperableField::new(
                thing,
                ts,
                "WindSpeed",
                FieldValue::Quantity {
                    magnitude: v,
                    decimals: 1,
                    unit: "m/s".into(),
                },
                FieldType::Momentary,
            ));
        }
        if let Some(v) = &self.description {
            out.push(InteroperableField::new(
                thing,
                ts,
                "Description",
                FieldValue::String(v.clone()),
                FieldType::Status,
            ));
        }
        out
    }
}
