//! Payload decoding and encoding by content format.
//!
//! Decoding is best effort: LWM2M-JSON and plain JSON are decoded fully,
//! TLV values are interpreted as text when printable and as big-endian
//! integers otherwise, and anything undecodable becomes a lossy string.

use crate::message::ContentFormat;
use crate::parse::{decode_link_format, plain_value};
use serde_json::{Map, Value};
use shepherd_core::{PathKind, ResourcePath};

/// Decodes a response payload; `None` for an empty payload.
pub fn decode_payload(path: &str, format: Option<ContentFormat>, bytes: &[u8]) -> Option<Value> {
    if bytes.is_empty() {
        return None;
    }
    let text = || String::from_utf8_lossy(bytes).into_owned();

    let value = match format {
        Some(ContentFormat::Lwm2mJson) | Some(ContentFormat::Json) => {
            match serde_json::from_slice::<Value>(bytes) {
                Ok(parsed) if parsed.get("e").is_some() => decode_lwm2m_json(&parsed),
                Ok(parsed) => parsed,
                Err(_) => Value::from(text()),
            }
        }
        Some(ContentFormat::LinkFormat) => {
            decode_link_format(&text()).unwrap_or_else(|_| Value::from(text()))
        }
        Some(ContentFormat::Lwm2mTlv) => {
            let depth = ResourcePath::parse(path)
                .map(|p| p.kind())
                .unwrap_or(PathKind::Object);
            decode_tlv(bytes, depth).unwrap_or_else(|| Value::from(text()))
        }
        Some(ContentFormat::OctetStream) => Value::from(text()),
        _ => plain_value(&text()),
    };
    Some(value)
}

// ============================================================================
// LWM2M JSON
// ============================================================================

/// Folds `{"bn":..,"e":[{"n":"0/1","v":3}]}` into nested values.
///
/// An entry without a name is the value of the base path itself.
fn decode_lwm2m_json(doc: &Value) -> Value {
    let mut root = Map::new();
    let Some(entries) = doc.get("e").and_then(Value::as_array) else {
        return Value::Object(root);
    };

    for entry in entries {
        let value = ["v", "sv", "bv", "ov"]
            .iter()
            .find_map(|key| entry.get(*key).cloned())
            .unwrap_or(Value::Null);
        let name = entry.get("n").and_then(Value::as_str).unwrap_or_default();
        let segments: Vec<&str> = name.split('/').filter(|s| !s.is_empty()).collect();

        if segments.is_empty() {
            return value;
        }
        insert_nested(&mut root, &segments, value);
    }
    Value::Object(root)
}

fn insert_nested(map: &mut Map<String, Value>, segments: &[&str], value: Value) {
    match segments {
        [] => {}
        [last] => {
            map.insert((*last).to_string(), value);
        }
        [head, rest @ ..] => {
            let child = map
                .entry((*head).to_string())
                .or_insert_with(|| Value::Object(Map::new()));
            if !child.is_object() {
                *child = Value::Object(Map::new());
            }
            if let Value::Object(inner) = child {
                insert_nested(inner, rest, value);
            }
        }
    }
}

/// Encodes a write value.
///
/// Composite values go out as LWM2M-JSON relative to `path`, scalars as
/// text/plain.
pub fn encode_write(path: &ResourcePath, value: &Value) -> (Vec<u8>, ContentFormat) {
    match value {
        Value::Object(_) | Value::Array(_) => {
            let mut entries = Vec::new();
            flatten_entries("", value, &mut entries);
            let mut doc = Map::new();
            doc.insert("bn".to_string(), Value::from(format!("{path}/")));
            doc.insert("e".to_string(), Value::Array(entries));
            (
                Value::Object(doc).to_string().into_bytes(),
                ContentFormat::Lwm2mJson,
            )
        }
        Value::Bool(flag) => (
            if *flag { b"1".to_vec() } else { b"0".to_vec() },
            ContentFormat::TextPlain,
        ),
        Value::String(s) => (s.clone().into_bytes(), ContentFormat::TextPlain),
        other => (other.to_string().into_bytes(), ContentFormat::TextPlain),
    }
}

fn flatten_entries(prefix: &str, value: &Value, out: &mut Vec<Value>) {
    let join = |key: &str| {
        if prefix.is_empty() {
            key.to_string()
        } else {
            format!("{prefix}/{key}")
        }
    };
    match value {
        Value::Object(fields) => {
            for (key, child) in fields {
                flatten_entries(&join(key), child, out);
            }
        }
        Value::Array(items) => {
            for (idx, child) in items.iter().enumerate() {
                flatten_entries(&join(&idx.to_string()), child, out);
            }
        }
        leaf => {
            let key = match leaf {
                Value::String(_) => "sv",
                Value::Bool(_) => "bv",
                _ => "v",
            };
            let mut entry = Map::new();
            entry.insert("n".to_string(), Value::from(prefix));
            entry.insert(key.to_string(), leaf.clone());
            out.push(Value::Object(entry));
        }
    }
}

// ============================================================================
// TLV
// ============================================================================

/// One decoded TLV element.
struct Tlv<'a> {
    kind: u8,
    id: u16,
    value: &'a [u8],
}

fn take(bytes: &[u8], n: usize) -> Option<(&[u8], &[u8])> {
    (bytes.len() >= n).then(|| bytes.split_at(n))
}

fn read_tlv(bytes: &[u8]) -> Option<(Tlv<'_>, &[u8])> {
    let (&header, mut rest) = bytes.split_first()?;
    let kind = header >> 6;

    let id = if header & 0x20 != 0 {
        let (id, tail) = take(rest, 2)?;
        rest = tail;
        u16::from_be_bytes([*id.first()?, *id.get(1)?])
    } else {
        let (&id, tail) = rest.split_first()?;
        rest = tail;
        u16::from(id)
    };

    let len = match (header >> 3) & 0x03 {
        0 => usize::from(header & 0x07),
        width => {
            let (raw, tail) = take(rest, usize::from(width))?;
            rest = tail;
            raw.iter().fold(0usize, |acc, b| (acc << 8) | usize::from(*b))
        }
    };

    let (value, rest) = take(rest, len)?;
    Some((Tlv { kind, id, value }, rest))
}

fn read_all(mut bytes: &[u8]) -> Option<Vec<Tlv<'_>>> {
    let mut out = Vec::new();
    while !bytes.is_empty() {
        let (tlv, rest) = read_tlv(bytes)?;
        out.push(tlv);
        bytes = rest;
    }
    Some(out)
}

fn tlv_scalar(bytes: &[u8]) -> Value {
    if let Ok(text) = std::str::from_utf8(bytes) {
        if !text.is_empty() && text.chars().all(|c| !c.is_control()) {
            return Value::from(text);
        }
    }
    match bytes.len() {
        1 | 2 | 4 | 8 => {
            let unsigned = bytes.iter().fold(0u64, |acc, b| (acc << 8) | u64::from(*b));
            let shift = 64 - 8 * bytes.len() as u32;
            Value::from(((unsigned << shift) as i64) >> shift)
        }
        _ => Value::from(String::from_utf8_lossy(bytes).into_owned()),
    }
}

fn tlv_value(tlv: &Tlv<'_>) -> Option<Value> {
    match tlv.kind {
        // object instance or multiple resource: nested elements
        0b00 | 0b10 => {
            let mut map = Map::new();
            for child in read_all(tlv.value)? {
                map.insert(child.id.to_string(), tlv_value(&child)?);
            }
            Some(Value::Object(map))
        }
        _ => Some(tlv_scalar(tlv.value)),
    }
}

fn decode_tlv(bytes: &[u8], depth: PathKind) -> Option<Value> {
    let elements = read_all(bytes)?;

    if depth == PathKind::Resource {
        if let [single] = elements.as_slice() {
            return tlv_value(single);
        }
    }

    let mut map = Map::new();
    for element in &elements {
        map.insert(element.id.to_string(), tlv_value(element)?);
    }
    Some(Value::Object(map))
}
