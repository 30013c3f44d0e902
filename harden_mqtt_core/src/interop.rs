//! Canonical sensor-data XML.
//!
//! Signatures are taken over these bytes, so rendering must be a pure
//! function of the field sequence: no whitespace, fixed attribute order,
//! fields emitted in input order, quantities rounded exactly once (in
//! [`FieldValue::render`]). The parser is the strict mirror: one root
//! element, one child element per field, known attributes only.
//!
//! Schema (fixed by this crate, see DESIGN.md):
//!
//! ```xml
//! <sensorData xmlns="urn:harden-mqtt:sensor-data:1.0" id="Sensor-01">
//!   <quantity name="Temperature" value="21.5" unit="°C" decimals="1"
//!             type="momentary" qos="automaticReadout"
//!             timestamp="2026-08-02T07:00:05Z"/>
//! </sensorData>
//! ```

use quick_xml::events::{BytesEnd, BytesStart, Event};
use quick_xml::{Reader, Writer};

use crate::error::{SecurityError, MAX_PAYLOAD_BYTES};
use crate::fields::{
    parse_date, parse_datetime, parse_time, FieldType, FieldValue, InteroperableField,
    IsoDuration, QOS_AUTOMATIC_READOUT,
};

pub const SENSOR_DATA_NS: &str = "urn:harden-mqtt:sensor-data:1.0";
const ROOT: &str = "sensorData";

fn variant_name(value: &FieldValue) -> &'static str {
    match value {
        FieldValue::Boolean(_) => "boolean",
        FieldValue::Int32(_) => "int",
        FieldValue::Int64(_) => "long",
        FieldValue::String(_) => "string",
        FieldValue::Date(_) => "date",
        FieldValue::DateTime(_) => "dateTime",
        FieldValue::Duration(_) => "duration",
        FieldValue::Time(_) => "time",
        FieldValue::Quantity { .. } => "quantity",
        FieldValue::Enum { .. } => "enum",
    }
}

/// Renders the canonical payload. The thing reference on the root element
/// is taken from the first field; an empty field list renders an empty
/// root with an empty id.
pub fn render_payload(fields: &[InteroperableField]) -> Vec<u8> {
    let mut writer = Writer::new(Vec::new());
    let mut root = BytesStart::new(ROOT);
    root.push_attribute(("xmlns", SENSOR_DATA_NS));
    let thing = fields.first().map(|f| f.thing.as_str()).unwrap_or("");
    root.push_attribute(("id", thing));
    writer
        .write_event(Event::Start(root))
        .expect("in-memory write");
    for field in fields {
        let mut element = BytesStart::new(variant_name(&field.value));
        element.push_attribute(("name", field.name.as_str()));
        element.push_attribute(("value", field.value.render().as_str()));
        match &field.value {
            FieldValue::Quantity { decimals, unit, .. } => {
                element.push_attribute(("unit", unit.as_str()));
                element.push_attribute(("decimals", decimals.to_string().as_str()));
            }
            FieldValue::Enum { enum_type, .. } => {
                element.push_attribute(("enumType", enum_type.as_str()));
            }
            _ => {}
        }
        element.push_attribute(("type", field.field_type.as_str()));
        element.push_attribute(("qos", QOS_AUTOMATIC_READOUT));
        element.push_attribute((
            "timestamp",
            crate::fields::render_datetime(field.timestamp).as_str(),
        ));
        writer
            .write_event(Event::Empty(element))
            .expect("in-memory write");
    }
    writer
        .write_event(Event::End(BytesEnd::new(ROOT)))
        .expect("in-memory write");
    writer.into_inner()
}

struct FieldAttrs {
    name: Option<String>,
    value: Option<String>,
    unit: Option<String>,
    decimals: Option<String>,
    enum_type: Option<String>,
    field_type: Option<String>,
    qos: Option<String>,
    timestamp: Option<String>,
}

fn collect_attrs(element: &BytesStart) -> Result<FieldAttrs, SecurityError> {
    let mut out = FieldAttrs {
        name: None,
        value: None,
        unit: None,
        decimals: None,
        enum_type: None,
        field_type: None,
        qos: None,
        timestamp: None,
    };
    for attr in element.attributes() {
        let attr = attr.map_err(quick_xml::Error::from)?;
        let value = attr
            .unescape_value()
            .map_err(quick_xml::Error::from)?
            .into_owned();
        let slot = match attr.key.as_ref() {
            b"name" => &mut out.name,
            b"value" => &mut out.value,
            b"unit" => &mut out.unit,
            b"decimals" => &mut out.decimals,
            b"enumType" => &mut out.enum_type,
            b"type" => &mut out.field_type,
            b"qos" => &mut out.qos,
            b"timestamp" => &mut out.timestamp,
            _ => return Err(SecurityError::Value("field attribute")),
        };
        if slot.replace(value).is_some() {
            return Err(SecurityError::Value("duplicate attribute"));
        }
    }
    Ok(out)
}

fn build_field(element_name: &[u8], attrs: FieldAttrs) -> Result<InteroperableField, SecurityError> {
    let err = || SecurityError::Value("field element");
    let name = attrs.name.ok_or_else(err)?;
    let raw = attrs.value.ok_or_else(err)?;
    let field_type = FieldType::parse(&attrs.field_type.ok_or_else(err)?)?;
    let qos = attrs.qos.ok_or_else(err)?;
    if qos != QOS_AUTOMATIC_READOUT {
        return Err(SecurityError::Value("qos"));
    }
    let timestamp = parse_datetime(&attrs.timestamp.ok_or_else(err)?)?;
    let value = match element_name {
        b"boolean" => FieldValue::Boolean(match raw.as_str() {
            "true" => true,
            "false" => false,
            _ => return Err(SecurityError::Value("boolean")),
        }),
        b"int" => FieldValue::Int32(raw.parse().map_err(|_| SecurityError::Value("int"))?),
        b"long" => FieldValue::Int64(raw.parse().map_err(|_| SecurityError::Value("long"))?),
        b"string" => FieldValue::String(raw),
        b"date" => FieldValue::Date(parse_date(&raw)?),
        b"dateTime" => FieldValue::DateTime(parse_datetime(&raw)?),
        b"duration" => FieldValue::Duration(IsoDuration::parse(&raw)?),
        b"time" => FieldValue::Time(parse_time(&raw)?),
        b"quantity" => {
            let unit = attrs.unit.clone().ok_or_else(err)?;
            let decimals: u8 = attrs
                .decimals
                .clone()
                .ok_or_else(err)?
                .parse()
                .map_err(|_| SecurityError::Value("decimals"))?;
            let magnitude: f64 = raw.parse().map_err(|_| SecurityError::Value("quantity"))?;
            if !magnitude.is_finite() {
                return Err(SecurityError::Value("quantity"));
            }
            FieldValue::Quantity {
                magnitude,
                decimals,
                unit,
            }
        }
        b"enum" => FieldValue::Enum {
            value: raw,
            enum_type: attrs.enum_type.clone().ok_or_else(err)?,
        },
        _ => return Err(err()),
    };
    // Variant-specific attributes on the wrong element are malformed.
    match element_name {
        b"quantity" => {
            if attrs.enum_type.is_some() {
                return Err(SecurityError::Value("enumType"));
            }
        }
        b"enum" => {
            if attrs.unit.is_some() || attrs.decimals.is_some() {
                return Err(SecurityError::Value("unit"));
            }
        }
        _ => {
            if attrs.unit.is_some() || attrs.decimals.is_some() || attrs.enum_type.is_some() {
                return Err(SecurityError::Value("field attribute"));
            }
        }
    }
    Ok(InteroperableField {
        thing: String::new(),
        timestamp,
        name,
        value,
        field_type,
    })
}

/// Strict parse of a canonical payload. Applies the 64 KiB size guard
/// before the parser sees a single byte.
pub fn parse_payload(bytes: &[u8]) -> Result<Vec<InteroperableField>, SecurityError> {
    SecurityError::check_size(bytes, MAX_PAYLOAD_BYTES)?;
    let text = std::str::from_utf8(bytes).map_err(|_| SecurityError::Utf8)?;
    let mut reader = Reader::from_str(text);
    reader.config_mut().trim_text(true);

    let mut thing: Option<String> = None;
    let mut fields: Vec<InteroperableField> = Vec::new();
    let mut root_closed = false;
    let mut open_field: Option<(Vec<u8>, FieldAttrs)> = None;
    loop {
        match reader.read_event()? {
            Event::Decl(_) => {}
            Event::Start(element) if thing.is_none() => {
                if element.name().as_ref() != ROOT.as_bytes() {
                    return Err(SecurityError::Value("root element"));
                }
                let mut id = None;
                for attr in element.attributes() {
                    let attr = attr.map_err(quick_xml::Error::from)?;
                    let value = attr
                        .unescape_value()
                        .map_err(quick_xml::Error::from)?
                        .into_owned();
                    match attr.key.as_ref() {
                        b"xmlns" => {
                            if value != SENSOR_DATA_NS {
                                return Err(SecurityError::Value("namespace"));
                            }
                        }
                        b"id" => id = Some(value),
                        _ => return Err(SecurityError::Value("root attribute")),
                    }
                }
                thing = Some(id.ok_or(SecurityError::Value("root attribute"))?);
            }
            Event::Empty(element) if thing.is_some() && open_field.is_none() => {
                let attrs = collect_attrs(&element)?;
                fields.push(build_field(element.name().as_ref(), attrs)?);
            }
            Event::Start(element) if thing.is_some() && open_field.is_none() => {
                let attrs = collect_attrs(&element)?;
                open_field = Some((element.name().as_ref().to_vec(), attrs));
            }
            Event::End(element) => match open_field.take() {
                Some((name, attrs)) => {
                    if element.name().as_ref() != name.as_slice() {
                        return Err(SecurityError::Value("element nesting"));
                    }
                    fields.push(build_field(&name, attrs)?);
                }
                None => {
                    if element.name().as_ref() != ROOT.as_bytes() {
                        return Err(SecurityError::Value("element nesting"));
                    }
                    root_closed = true;
                }
            },
            Event::Eof => break,
            _ => return Err(SecurityError::Value("document structure")),
        }
        if root_closed {
            // Trailing content after the root is malformed.
            if !matches!(reader.read_event()?, Event::Eof) {
                return Err(SecurityError::Value("document structure"));
            }
            break;
        }
    }
    let thing = thing.ok_or(SecurityError::Value("root element"))?;
    if !root_closed {
        return Err(SecurityError::Value("document structure"));
    }
    for field in &mut fields {
        field.thing = thing.clone();
    }
    Ok(fields)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fields::{render_datetime, FieldType};
    use proptest::prelude::*;
    use time::macros::datetime;
    use time::OffsetDateTime;

    fn ts() -> OffsetDateTime {
        datetime!(2026-08-02 07:00:05 UTC)
    }

    fn sample_fields() -> Vec<InteroperableField> {
        vec![
            InteroperableField::new(
                "Sensor-01",
                ts(),
                "Temperature",
                FieldValue::Quantity {
                    magnitude: 21.5,
                    decimals: 1,
                    unit: "°C".into(),
                },
                FieldType::Momentary,
            ),
            InteroperableField::new(
                "Sensor-01",
                ts(),
                "Name",
                FieldValue::String("Backyard <&> garden".into()),
                FieldType::Identity,
            ),
            InteroperableField::new(
                "Sensor-01",
                ts(),
                "Window",
                FieldValue::Boolean(false),
                FieldType::Status,
            ),
        ]
    }

    #[test]
    fn rendering_is_canonical() {
        let fields = vec![InteroperableField::new(
            "S",
            ts(),
            "Counter",
            FieldValue::Int64(42),
            FieldType::Momentary,
        )];
        let rendered = String::from_utf8(render_payload(&fields)).unwrap();
        assert_eq!(
            rendered,
            format!(
                "<sensorData xmlns=\"{SENSOR_DATA_NS}\" id=\"S\">\
                 <long name=\"Counter\" value=\"42\" type=\"momentary\" \
                 qos=\"automaticReadout\" timestamp=\"{}\"/></sensorData>",
                render_datetime(ts())
            )
        );
        // Rendering twice yields identical bytes.
        assert_eq!(render_payload(&fields), render_payload(&fields));
    }

    #[test]
    fn parse_render_roundtrip_preserves_order() {
        let fields = sample_fields();
        let rendered = render_payload(&fields);
        let parsed = parse_payload(&rendered).unwrap();
        assert_eq!(parsed, fields);
        assert_eq!(render_payload(&parsed), rendered);
    }

    #[test]
    fn oversize_rejected_before_parsing() {
        let mut oversized = render_payload(&sample_fields());
        oversized.resize(MAX_PAYLOAD_BYTES + 1, b' ');
        assert!(matches!(
            parse_payload(&oversized),
            Err(SecurityError::Oversize { .. })
        ));
    }

    #[test]
    fn unknown_attribute_rejected() {
        let xml = format!(
            "<sensorData xmlns=\"{SENSOR_DATA_NS}\" id=\"S\">\
             <long name=\"C\" value=\"1\" type=\"momentary\" qos=\"automaticReadout\" \
             timestamp=\"2026-08-02T07:00:05Z\" extra=\"x\"/></sensorData>"
        );
        assert!(parse_payload(xml.as_bytes()).is_err());
    }

    #[test]
    fn wrong_qos_rejected() {
        let xml = format!(
            "<sensorData xmlns=\"{SENSOR_DATA_NS}\" id=\"S\">\
             <long name=\"C\" value=\"1\" type=\"momentary\" qos=\"manual\" \
             timestamp=\"2026-08-02T07:00:05Z\"/></sensorData>"
        );
        assert!(matches!(
            parse_payload(xml.as_bytes()),
            Err(SecurityError::Value("qos"))
        ));
    }

    #[test]
    fn foreign_root_rejected() {
        assert!(parse_payload(b"<data/>").is_err());
        assert!(parse_payload(b"not xml at all").is_err());
        assert!(parse_payload("<sensorData xmlns=\"urn:other\" id=\"S\"></sensorData>".as_bytes())
            .is_err());
    }

    proptest! {
        #[test]
        fn arbitrary_strings_survive_roundtrip(
            name in "[A-Za-z][A-Za-z0-9]{0,16}",
            text in "[a-zA-Z0-9 <>&\"'°µ|=:/-]{0,64}",
        ) {
            let fields = vec![InteroperableField::new(
                "Sensor-01",
                ts(),
                name,
                FieldValue::String(text),
                FieldType::Status,
            )];
            let rendered = render_payload(&fields);
            let parsed = parse_payload(&rendered).unwrap();
            prop_assert_eq!(&parsed, &fields);
            prop_assert_eq!(render_payload(&parsed), rendered);
        }
    }
}
