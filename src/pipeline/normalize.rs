use crate::constants::{DATE_FORMATS, MISSING_VALUE, SYNTHETIC_FIELD, UNKNOWN_QUALIFIER};
use crate::error::NormalizationAnomaly;
use crate::pipeline::parser::{ParsedRecord, EVENT_DATA_SECTION, SYSTEM_SECTION};
use chrono::NaiveDateTime;
use regex::Regex;
use serde::{Serialize, Serializer};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::sync::OnceLock;

const EVENT_ID: &str = "EventID";
const DATA: &str = "Data";
const NAME_ATTR: &str = "@Name";
const TEXT_KEY: &str = "#text";
const QUALIFIERS_ATTR: &str = "@Qualifiers";
const TIME_CREATED: &str = "TimeCreated";
const SYSTEM_TIME_ATTR: &str = "@SystemTime";
const TIME_KEYWORD: &str = "time";

/// Value of one `EventData` field after normalization.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
    Timestamp(NaiveDateTime),
    Text(String),
}

impl Serialize for FieldValue {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            FieldValue::Timestamp(ts) => {
                serializer.collect_str(&ts.format("%Y-%m-%dT%H:%M:%S%.6f"))
            }
            FieldValue::Text(s) => serializer.serialize_str(s),
        }
    }
}

/// `System.EventID` in its uniform attributed shape.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EventId {
    #[serde(rename = "@Qualifiers")]
    pub qualifier: String,
    #[serde(rename = "#text")]
    pub text: Option<String>,
}

/// A record ready for indexing.
///
/// `System.EventID` and `EventData.Data` are held in typed form and merged back
/// into the tree when the document is serialized.
#[derive(Debug, Clone, PartialEq)]
pub struct NormalizedDocument {
    event: Map<String, Value>,
    pub event_id: Option<EventId>,
    pub data: Option<BTreeMap<String, FieldValue>>,
    pub created_at: Option<String>,
    pub file_name: String,
    pub anomalies: Vec<NormalizationAnomaly>,
}

impl NormalizedDocument {
    /// Untyped view of the `Event` tree, minus the typed parts.
    pub fn event(&self) -> &Map<String, Value> {
        &self.event
    }

    pub fn field(&self, name: &str) -> Option<&FieldValue> {
        self.data.as_ref().and_then(|data| data.get(name))
    }

    pub fn to_json(&self) -> Value {
        let mut event = self.event.clone();

        if let Some(event_id) = &self.event_id {
            if let Some(Value::Object(system)) = event.get_mut(SYSTEM_SECTION) {
                system.insert(EVENT_ID.to_string(), json_of(event_id));
            }
        }
        if let Some(data) = &self.data {
            if let Some(Value::Object(event_data)) = event.get_mut(EVENT_DATA_SECTION) {
                event_data.insert(DATA.to_string(), json_of(data));
            }
        }

        let mut body = Map::new();
        body.insert("Event".to_string(), Value::Object(event));
        body.insert("file_name".to_string(), Value::String(self.file_name.clone()));
        Value::Object(body)
    }
}

impl Serialize for NormalizedDocument {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.to_json().serialize(serializer)
    }
}

fn json_of<T: Serialize>(value: &T) -> Value {
    // Serializing plain strings, maps and timestamps into a Value cannot fail
    serde_json::to_value(value).unwrap_or(Value::Null)
}

/// Trait for turning parsed records into indexable documents
pub trait Normalizer: Send + Sync {
    fn normalize(&self, record: ParsedRecord, file_name: &str) -> NormalizedDocument;
}

/// Normalizer for exported Windows event records.
#[derive(Debug, Clone)]
pub struct EventLogNormalizer {
    date_formats: Vec<String>,
}

impl Default for EventLogNormalizer {
    fn default() -> Self {
        Self {
            date_formats: DATE_FORMATS.iter().map(|f| f.to_string()).collect(),
        }
    }
}

impl Normalizer for EventLogNormalizer {
    fn normalize(&self, record: ParsedRecord, file_name: &str) -> NormalizedDocument {
        let mut event = record.event;
        let mut anomalies = Vec::new();

        let data = self.take_event_data(&mut event, &mut anomalies);
        let event_id = take_event_id(&mut event);
        let created_at = self.created_at(&event);

        NormalizedDocument {
            event,
            event_id,
            data,
            created_at,
            file_name: file_name.to_string(),
            anomalies,
        }
    }
}

impl EventLogNormalizer {
    /// Parse a date-like string against the known formats, first match wins.
    pub fn coerce_date(&self, value: &str) -> Option<NaiveDateTime> {
        let cleaned = truncate_fraction(&value.replace('?', ""));
        self.date_formats
            .iter()
            .find_map(|fmt| NaiveDateTime::parse_from_str(&cleaned, fmt).ok())
    }

    /// Pull `EventData.Data` out of the tree as a field map. `None` when the
    /// record has no `EventData` section at all.
    fn take_event_data(
        &self,
        event: &mut Map<String, Value>,
        anomalies: &mut Vec<NormalizationAnomaly>,
    ) -> Option<BTreeMap<String, FieldValue>> {
        let section = event.get_mut(EVENT_DATA_SECTION)?;
        if !section.is_object() {
            if !section.is_null() {
                anomalies.push(NormalizationAnomaly::UnexpectedShape {
                    path: format!("Event.{EVENT_DATA_SECTION}"),
                });
            }
            *section = Value::Object(Map::new());
        }
        let Value::Object(section) = section else {
            return None;
        };

        let fields = match section.remove(DATA) {
            None | Some(Value::Null) => Vec::new(),
            Some(Value::Array(items)) if is_named(items.first()) => items,
            Some(field) if is_named(Some(&field)) => vec![field],
            Some(other) => vec![synthetic_field(other)],
        };

        let mut data = BTreeMap::new();
        for (position, field) in fields.iter().enumerate() {
            let (name, value) = self.extract_field(position, field, anomalies);
            data.insert(name, value);
        }
        Some(data)
    }

    fn extract_field(
        &self,
        position: usize,
        field: &Value,
        anomalies: &mut Vec<NormalizationAnomaly>,
    ) -> (String, FieldValue) {
        let name = match field.get(NAME_ATTR).and_then(Value::as_str) {
            Some(name) => name.to_string(),
            None => {
                anomalies.push(NormalizationAnomaly::MissingFieldName { position });
                format!("param{}", position + 1)
            }
        };

        let text = match field {
            Value::String(s) => Some(s.as_str()),
            other => other.get(TEXT_KEY).and_then(Value::as_str),
        };
        let Some(text) = text else {
            anomalies.push(NormalizationAnomaly::MissingFieldText { name: name.clone() });
            return (name, FieldValue::Text(MISSING_VALUE.to_string()));
        };

        if !name.to_lowercase().contains(TIME_KEYWORD) {
            return (name, FieldValue::Text(text.to_string()));
        }
        match self.coerce_date(text) {
            Some(ts) => (name, FieldValue::Timestamp(ts)),
            None => {
                anomalies.push(NormalizationAnomaly::UnparsedDate {
                    name: name.clone(),
                    value: text.to_string(),
                });
                (name, FieldValue::Text(text.to_string()))
            }
        }
    }

    /// Creation time used as the bulk timestamp; verbatim when no format matches.
    fn created_at(&self, event: &Map<String, Value>) -> Option<String> {
        let raw = event
            .get(SYSTEM_SECTION)?
            .get(TIME_CREATED)?
            .get(SYSTEM_TIME_ATTR)?
            .as_str()?;
        Some(match self.coerce_date(raw) {
            Some(ts) => ts.format("%Y-%m-%dT%H:%M:%S%.6fZ").to_string(),
            None => raw.to_string(),
        })
    }
}

fn is_named(field: Option<&Value>) -> bool {
    field.and_then(|f| f.get(NAME_ATTR)).is_some()
}

/// Unattributed content becomes a single field holding its text form.
fn synthetic_field(content: Value) -> Value {
    let text = match content {
        Value::String(s) => s,
        other => other.to_string(),
    };
    let mut field = Map::new();
    field.insert(NAME_ATTR.to_string(), Value::String(SYNTHETIC_FIELD.to_string()));
    field.insert(TEXT_KEY.to_string(), Value::String(text));
    Value::Object(field)
}

/// Rewrap `System.EventID` so it always carries a qualifier.
fn take_event_id(event: &mut Map<String, Value>) -> Option<EventId> {
    let system = event.get_mut(SYSTEM_SECTION)?.as_object_mut()?;
    let raw = system.remove(EVENT_ID)?;

    let qualifier = raw
        .get(QUALIFIERS_ATTR)
        .and_then(Value::as_str)
        .unwrap_or(UNKNOWN_QUALIFIER)
        .to_string();
    let text = match &raw {
        Value::Null => None,
        Value::String(s) => Some(s.clone()),
        Value::Object(map) => map.get(TEXT_KEY).and_then(Value::as_str).map(str::to_string),
        other => Some(other.to_string()),
    };
    Some(EventId { qualifier, text })
}

/// Cut fractional seconds beyond microseconds ahead of a trailing `Z`.
fn truncate_fraction(value: &str) -> String {
    static FRACTION: OnceLock<Regex> = OnceLock::new();
    let re = FRACTION.get_or_init(|| {
        Regex::new(r"^(.*\.\d{6})\d+Z$").expect("fraction pattern is valid")
    });
    re.replace(value, "${1}Z").into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::parser::parse_record;
    use chrono::{NaiveDate, Timelike};
    use serde_json::json;

    fn normalize(xml: &str) -> NormalizedDocument {
        EventLogNormalizer::default().normalize(parse_record(xml).unwrap(), "Security.xml")
    }

    fn wrap(event_data: &str) -> String {
        format!("<Event><System><EventID>1</EventID></System>{event_data}</Event>")
    }

    #[test]
    fn test_event_data_shapes_become_maps() {
        let absent = normalize(&wrap("<EventData></EventData>"));
        assert_eq!(absent.data, Some(BTreeMap::new()));

        let single = normalize(&wrap("<EventData><Data Name='User'>bob</Data></EventData>"));
        assert_eq!(single.field("User"), Some(&FieldValue::Text("bob".to_string())));

        let list = normalize(&wrap(
            "<EventData><Data Name='A'>1</Data><Data Name='B'>2</Data></EventData>",
        ));
        assert_eq!(list.data.as_ref().unwrap().len(), 2);
        assert_eq!(list.field("B"), Some(&FieldValue::Text("2".to_string())));

        let bare = normalize(&wrap("<EventData><Data>service started</Data></EventData>"));
        assert_eq!(
            bare.field("param1"),
            Some(&FieldValue::Text("service started".to_string()))
        );

        for doc in [absent, single, list, bare] {
            assert!(doc.to_json()["Event"]["EventData"]["Data"].is_object());
        }
    }

    #[test]
    fn test_unnamed_list_is_stringified_into_param1() {
        let doc = normalize(&wrap("<EventData><Data>a</Data><Data>b</Data></EventData>"));
        assert_eq!(
            doc.field("param1"),
            Some(&FieldValue::Text(r#"["a","b"]"#.to_string()))
        );
        assert_eq!(doc.data.as_ref().unwrap().len(), 1);
    }

    #[test]
    fn test_missing_text_falls_back_with_anomaly() {
        let doc = normalize(&wrap(
            "<EventData><Data Name='Empty'/><Data Name='Full'>x</Data></EventData>",
        ));
        assert_eq!(doc.field("Empty"), Some(&FieldValue::Text("-".to_string())));
        assert_eq!(doc.field("Full"), Some(&FieldValue::Text("x".to_string())));
        assert_eq!(
            doc.anomalies,
            vec![NormalizationAnomaly::MissingFieldText { name: "Empty".to_string() }]
        );
    }

    #[test]
    fn test_duplicate_names_keep_last_value() {
        let doc = normalize(&wrap(
            "<EventData><Data Name='K'>first</Data><Data Name='K'>second</Data></EventData>",
        ));
        assert_eq!(doc.field("K"), Some(&FieldValue::Text("second".to_string())));
    }

    #[test]
    fn test_time_fields_are_coerced() {
        let doc = normalize(&wrap(
            "<EventData><Data Name='StartTime'>2021-05-01T10:20:30.123456789Z</Data><Data Name='LogonTime'>never</Data><Data Name='Note'>05/01/2021 10:20 AM</Data></EventData>",
        ));
        let expected = NaiveDate::from_ymd_opt(2021, 5, 1)
            .unwrap()
            .and_hms_micro_opt(10, 20, 30, 123_456)
            .unwrap();
        assert_eq!(doc.field("StartTime"), Some(&FieldValue::Timestamp(expected)));
        assert_eq!(doc.field("LogonTime"), Some(&FieldValue::Text("never".to_string())));
        // Only names containing "time" are coerced
        assert_eq!(
            doc.field("Note"),
            Some(&FieldValue::Text("05/01/2021 10:20 AM".to_string()))
        );
        assert!(matches!(
            doc.anomalies.as_slice(),
            [NormalizationAnomaly::UnparsedDate { name, .. }] if name == "LogonTime"
        ));
        assert_eq!(
            doc.to_json()["Event"]["EventData"]["Data"]["StartTime"],
            json!("2021-05-01T10:20:30.123456")
        );
    }

    #[test]
    fn test_coerce_date_formats_round_trip() {
        let normalizer = EventLogNormalizer::default();
        let ts = NaiveDate::from_ymd_opt(2020, 12, 31)
            .unwrap()
            .and_hms_micro_opt(15, 4, 5, 250_000)
            .unwrap();

        let with_seconds = ts.format("%m/%d/%Y %I:%M:%S %p").to_string();
        assert_eq!(
            normalizer.coerce_date(&with_seconds),
            Some(ts.with_nanosecond(0).unwrap())
        );

        let without_seconds = ts.format("%m/%d/%Y %I:%M %p").to_string();
        assert_eq!(
            normalizer.coerce_date(&without_seconds),
            Some(ts.with_second(0).unwrap().with_nanosecond(0).unwrap())
        );

        let iso = ts.format("%Y-%m-%dT%H:%M:%S%.6fZ").to_string();
        assert_eq!(normalizer.coerce_date(&iso), Some(ts));

        assert_eq!(normalizer.coerce_date("not a date"), None);
        assert_eq!(normalizer.coerce_date("?2020-12-31T15:04:05.250000Z?"), Some(ts));
    }

    #[test]
    fn test_event_id_gets_unknown_qualifier() {
        let doc = normalize("<Event><System><EventID>41</EventID></System></Event>");
        assert_eq!(
            doc.event_id,
            Some(EventId { qualifier: "Unknown".to_string(), text: Some("41".to_string()) })
        );
        assert_eq!(
            doc.to_json()["Event"]["System"]["EventID"],
            json!({"@Qualifiers": "Unknown", "#text": "41"})
        );

        let qualified =
            normalize("<Event><System><EventID Qualifiers='16384'>7036</EventID></System></Event>");
        assert_eq!(qualified.event_id.unwrap().qualifier, "16384");
    }

    #[test]
    fn test_created_at_and_file_name() {
        let doc = normalize(
            "<Event><System><TimeCreated SystemTime='2021-05-01T00:00:00.1234567Z'/></System></Event>",
        );
        assert_eq!(doc.created_at.as_deref(), Some("2021-05-01T00:00:00.123456Z"));
        assert_eq!(doc.data, None);
        assert_eq!(doc.to_json()["file_name"], json!("Security.xml"));
    }

    #[test]
    fn test_non_object_event_data_is_replaced() {
        let doc = normalize(&wrap("<EventData>stray</EventData>"));
        assert_eq!(doc.data, Some(BTreeMap::new()));
        assert!(matches!(
            doc.anomalies.as_slice(),
            [NormalizationAnomaly::UnexpectedShape { .. }]
        ));
    }
}
