//! Markup-to-tree conversion for one reconstructed record.
//!
//! Attributes become `@name` keys, text next to attributes or children becomes
//! `#text`, an element holding only text collapses to that text, repeated
//! siblings become arrays in document order and empty elements become `null`.

use crate::constants::RECORD_ROOT;
use crate::error::{ExcavatorError, Result};
use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;
use serde_json::{Map, Value};

pub const SYSTEM_SECTION: &str = "System";
pub const EVENT_DATA_SECTION: &str = "EventData";

/// A record as a tree rooted at its `Event` element.
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedRecord {
    pub event: Map<String, Value>,
}

impl ParsedRecord {
    pub fn system(&self) -> Option<&Map<String, Value>> {
        self.event.get(SYSTEM_SECTION).and_then(Value::as_object)
    }

    pub fn event_data(&self) -> Option<&Value> {
        self.event.get(EVENT_DATA_SECTION)
    }
}

struct Frame {
    name: String,
    children: Map<String, Value>,
    text: String,
}

impl Frame {
    fn open(start: &BytesStart<'_>) -> Result<Self> {
        let name = String::from_utf8_lossy(start.name().as_ref()).into_owned();
        let mut children = Map::new();
        for attr in start.attributes() {
            let attr = attr.map_err(|e| malformed(format!("bad attribute in <{name}>: {e}")))?;
            let key = String::from_utf8_lossy(attr.key.as_ref()).into_owned();
            let value = attr
                .unescape_value()
                .map_err(|e| malformed(format!("bad attribute value in <{name}>: {e}")))?;
            children.insert(format!("@{key}"), Value::String(value.into_owned()));
        }
        Ok(Self { name, children, text: String::new() })
    }

    fn close(self) -> (String, Value) {
        let text = self.text.trim();
        let value = if self.children.is_empty() {
            if text.is_empty() {
                Value::Null
            } else {
                Value::String(text.to_string())
            }
        } else {
            let mut children = self.children;
            if !text.is_empty() {
                children.insert("#text".to_string(), Value::String(text.to_string()));
            }
            Value::Object(children)
        };
        (self.name, value)
    }
}

/// Repeated keys turn into arrays so sibling order survives.
fn insert_child(map: &mut Map<String, Value>, name: String, value: Value) {
    match map.get_mut(&name) {
        None => {
            map.insert(name, value);
        }
        Some(Value::Array(items)) => items.push(value),
        Some(existing) => {
            let first = existing.take();
            *existing = Value::Array(vec![first, value]);
        }
    }
}

fn malformed(message: String) -> ExcavatorError {
    ExcavatorError::MalformedRecord(message)
}

/// Parse one record span. Fails when the markup is not well-formed, when the
/// root is not a single `Event` element, or when the `System` section is missing.
pub fn parse_record(text: &str) -> Result<ParsedRecord> {
    let mut reader = Reader::from_str(text);
    reader.config_mut().trim_text(true);

    let mut stack: Vec<Frame> = Vec::new();
    let mut root: Option<(String, Value)> = None;

    loop {
        let event = reader
            .read_event()
            .map_err(|e| malformed(format!("at byte {}: {e}", reader.buffer_position())))?;
        match event {
            Event::Start(start) => {
                if stack.is_empty() && root.is_some() {
                    return Err(malformed("more than one root element".to_string()));
                }
                stack.push(Frame::open(&start)?);
            }
            Event::Empty(start) => {
                let (name, value) = Frame::open(&start)?.close();
                match stack.last_mut() {
                    Some(parent) => insert_child(&mut parent.children, name, value),
                    None if root.is_none() => root = Some((name, value)),
                    None => return Err(malformed("more than one root element".to_string())),
                }
            }
            Event::End(_) => {
                let frame = stack
                    .pop()
                    .ok_or_else(|| malformed("closing tag without opening tag".to_string()))?;
                let (name, value) = frame.close();
                match stack.last_mut() {
                    Some(parent) => insert_child(&mut parent.children, name, value),
                    None => root = Some((name, value)),
                }
            }
            Event::Text(text) => {
                let text = text
                    .unescape()
                    .map_err(|e| malformed(format!("bad text content: {e}")))?;
                match stack.last_mut() {
                    Some(frame) => frame.text.push_str(&text),
                    None if text.trim().is_empty() => {}
                    None => return Err(malformed("text outside the root element".to_string())),
                }
            }
            Event::CData(data) => {
                let data = String::from_utf8_lossy(&data.into_inner()).into_owned();
                match stack.last_mut() {
                    Some(frame) => frame.text.push_str(&data),
                    None => return Err(malformed("CDATA outside the root element".to_string())),
                }
            }
            Event::Eof => break,
            // Declarations, comments, processing instructions and doctypes carry no record data
            _ => {}
        }
    }

    if let Some(open) = stack.last() {
        return Err(malformed(format!("unclosed element <{}>", open.name)));
    }

    let (name, value) = root.ok_or_else(|| malformed("no root element".to_string()))?;
    if name != RECORD_ROOT {
        return Err(malformed(format!("root element is <{name}>, expected <{RECORD_ROOT}>")));
    }
    let event = match value {
        Value::Object(map) => map,
        _ => Map::new(),
    };
    if !event.contains_key(SYSTEM_SECTION) {
        return Err(malformed(format!("missing <{SYSTEM_SECTION}> section")));
    }
    Ok(ParsedRecord { event })
}
