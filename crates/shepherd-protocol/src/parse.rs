//! Parsing of registration queries, link-format payloads and execute
//! arguments.

use serde_json::{Map, Value};
use shepherd_core::{ClientName, ObjectList};
use thiserror::Error;

/// Errors raised while parsing device input.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ParseError {
    #[error("unknown query parameter: {0}")]
    UnknownParameter(String),

    #[error("invalid value for {key}: {value}")]
    InvalidValue { key: String, value: String },

    #[error("malformed link-format entry: {0}")]
    MalformedLink(String),
}

fn split_pair(item: &str) -> (&str, &str) {
    item.split_once('=').unwrap_or((item, ""))
}

// ============================================================================
// Registration Query
// ============================================================================

/// Query parameters of a register/update/lookup request
/// (`ep`, `lt`, `lwm2m`, `mac`, `b`).
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RegistrationQuery {
    pub client_name: Option<ClientName>,
    pub lifetime: Option<u64>,
    pub version: Option<String>,
    pub mac: Option<String>,
    pub binding: Option<String>,
}

impl RegistrationQuery {
    /// Parses query items, rejecting any key outside the registration set.
    pub fn parse<S: AsRef<str>>(items: &[S]) -> Result<Self, ParseError> {
        let mut query = Self::default();
        for item in items {
            let (key, value) = split_pair(item.as_ref());
            match key {
                "ep" => query.client_name = Some(ClientName::new(value)),
                "lt" => {
                    let lifetime = value.parse().map_err(|_| ParseError::InvalidValue {
                        key: key.to_string(),
                        value: value.to_string(),
                    })?;
                    query.lifetime = Some(lifetime);
                }
                "lwm2m" => query.version = Some(value.to_string()),
                "mac" => query.mac = Some(value.to_string()),
                "b" => query.binding = Some(value.to_string()),
                other => return Err(ParseError::UnknownParameter(other.to_string())),
            }
        }
        Ok(query)
    }
}

// ============================================================================
// Check (sleep / wake) Query
// ============================================================================

/// Direction of a check request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckDirection {
    /// `chk=in`: the device woke up
    In,
    /// `chk=out`: the device goes to sleep
    Out,
}

/// Query parameters of a check request (`chk`, `t`).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CheckQuery {
    pub direction: CheckDirection,
    /// Sleep duration in seconds, if announced
    pub duration: Option<u64>,
}

impl CheckQuery {
    pub fn parse<S: AsRef<str>>(items: &[S]) -> Result<Self, ParseError> {
        let mut direction = None;
        let mut duration = None;
        for item in items {
            let (key, value) = split_pair(item.as_ref());
            match key {
                "chk" => {
                    direction = match value {
                        "in" => Some(CheckDirection::In),
                        "out" => Some(CheckDirection::Out),
                        _ => {
                            return Err(ParseError::InvalidValue {
                                key: key.to_string(),
                                value: value.to_string(),
                            })
                        }
                    };
                }
                "t" => {
                    duration = Some(value.parse().map_err(|_| ParseError::InvalidValue {
                        key: key.to_string(),
                        value: value.to_string(),
                    })?);
                }
                other => return Err(ParseError::UnknownParameter(other.to_string())),
            }
        }
        let direction = direction.ok_or_else(|| ParseError::InvalidValue {
            key: "chk".to_string(),
            value: String::new(),
        })?;
        Ok(Self {
            direction,
            duration,
        })
    }
}

// ============================================================================
// Link Format
// ============================================================================

/// The object list announced in a registration payload.
///
/// ```text
/// </>;ct=11543;hb,</1/0>,</3/0>,</3303>
/// ```
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ObjectListing {
    pub objects: ObjectList,
    /// `ct` attribute of the root link
    pub content_type: Option<String>,
    /// `hb` flag of the root link
    pub heartbeat: bool,
}

impl ObjectListing {
    pub fn parse(payload: &str) -> Result<Self, ParseError> {
        let mut listing = Self::default();

        for entry in payload.split(',').map(str::trim).filter(|e| !e.is_empty()) {
            let mut parts = entry.split(';');
            let target = parts.next().unwrap_or_default();
            let path = target
                .strip_prefix('<')
                .and_then(|t| t.strip_suffix('>'))
                .ok_or_else(|| ParseError::MalformedLink(entry.to_string()))?;

            if path == "/" {
                for attr in parts {
                    let (key, value) = split_pair(attr);
                    match key {
                        "ct" => listing.content_type = Some(value.to_string()),
                        "hb" => listing.heartbeat = true,
                        _ => {}
                    }
                }
                continue;
            }

            let mut ids = path.split('/').filter(|s| !s.is_empty());
            let Some(oid) = ids.next() else {
                continue;
            };
            let instances = listing.objects.entry(oid.to_string()).or_default();
            if let Some(iid) = ids.next() {
                instances.push(iid.to_string());
            }
        }

        Ok(listing)
    }
}

/// Decodes a discover answer into `{ path, attrs, resources }`.
///
/// ```text
/// </3/0>;pmin=10;pmax=60,</3/0/1>,</3/0/2>
/// ```
pub fn decode_link_format(payload: &str) -> Result<Value, ParseError> {
    let mut first_path = None;
    let mut attrs = Map::new();
    let mut resources = Vec::new();

    for entry in payload.split(',').map(str::trim).filter(|e| !e.is_empty()) {
        let mut parts = entry.split(';');
        let target = parts.next().unwrap_or_default();
        let path = target
            .strip_prefix('<')
            .and_then(|t| t.strip_suffix('>'))
            .ok_or_else(|| ParseError::MalformedLink(entry.to_string()))?;

        if first_path.is_none() {
            first_path = Some(path.to_string());
            for attr in parts {
                let (key, value) = split_pair(attr);
                attrs.insert(key.to_string(), plain_value(value));
            }
        } else {
            resources.push(Value::from(path));
        }
    }

    let mut out = Map::new();
    out.insert("path".to_string(), first_path.map(Value::from).unwrap_or(Value::Null));
    out.insert("attrs".to_string(), Value::Object(attrs));
    out.insert("resources".to_string(), Value::Array(resources));
    Ok(Value::Object(out))
}

/// Interprets a text/plain value: numbers become numbers, anything else a
/// string.
pub fn plain_value(text: &str) -> Value {
    let trimmed = text.trim();
    if let Ok(int) = trimmed.parse::<i64>() {
        return Value::from(int);
    }
    match trimmed.parse::<f64>() {
        Ok(float) if float.is_finite() => Value::from(float),
        _ => Value::from(trimmed),
    }
}

// ============================================================================
// Execute Arguments
// ============================================================================

/// One execute argument.
#[derive(Debug, Clone, PartialEq)]
pub enum ExecArg {
    Text(String),
    Number(f64),
}

impl ExecArg {
    /// Converts JSON arguments; only strings and numbers are accepted.
    pub fn from_values(values: &[Value]) -> Result<Vec<Self>, ParseError> {
        values
            .iter()
            .map(|value| match value {
                Value::String(s) => Ok(Self::Text(s.clone())),
                Value::Number(n) => n.as_f64().map(Self::Number).ok_or_else(|| {
                    ParseError::InvalidValue {
                        key: "args".to_string(),
                        value: n.to_string(),
                    }
                }),
                other => Err(ParseError::InvalidValue {
                    key: "args".to_string(),
                    value: other.to_string(),
                }),
            })
            .collect()
    }
}

/// Encodes execute arguments as plain text: `'str',12,3.5`.
pub fn encode_exec_args(args: &[ExecArg]) -> String {
    args.iter()
        .map(|arg| match arg {
            ExecArg::Text(s) => format!("'{s}'"),
            ExecArg::Number(n) => n.to_string(),
        })
        .collect::<Vec<_>>()
        .join(",")
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_registration_query() {
        let q = RegistrationQuery::parse(&["ep=dev1", "lt=86400", "lwm2m=1.0.0", "mac=aa:bb"]).unwrap();
        assert_eq!(q.client_name, Some(ClientName::new("dev1")));
        assert_eq!(q.lifetime, Some(86400));
        assert_eq!(q.version.as_deref(), Some("1.0.0"));
        assert_eq!(q.mac.as_deref(), Some("aa:bb"));
    }

    #[test]
    fn test_registration_query_rejects_unknown_key() {
        let err = RegistrationQuery::parse(&["ep=dev1", "foo=1"]).unwrap_err();
        assert_eq!(err, ParseError::UnknownParameter("foo".to_string()));
        assert!(RegistrationQuery::parse(&["lt=abc"]).is_err());
    }

    #[test]
    fn test_check_query() {
        let q = CheckQuery::parse(&["chk=out", "t=300"]).unwrap();
        assert_eq!(q.direction, CheckDirection::Out);
        assert_eq!(q.duration, Some(300));
        assert_eq!(CheckQuery::parse(&["chk=in"]).unwrap().direction, CheckDirection::In);
        assert!(CheckQuery::parse(&["t=3"]).is_err());
        assert!(CheckQuery::parse(&["chk=in", "x=1"]).is_err());
    }

    #[test]
    fn test_object_listing() {
        let listing = ObjectListing::parse("</>;ct=11543;hb,</1/2>,</1/3>,</2/0>,</3303>").unwrap();
        assert_eq!(listing.content_type.as_deref(), Some("11543"));
        assert!(listing.heartbeat);
        assert_eq!(listing.objects.get("1"), Some(&vec!["2".to_string(), "3".to_string()]));
        assert_eq!(listing.objects.get("3303"), Some(&Vec::new()));
    }

    #[test]
    fn test_object_listing_without_root() {
        let listing = ObjectListing::parse("</x/0>,</x/1>").unwrap();
        assert!(!listing.heartbeat);
        assert_eq!(listing.objects.get("x").map(Vec::len), Some(2));
        assert!(ObjectListing::parse("garbage").is_err());
    }

    #[test]
    fn test_decode_link_format() {
        let value = decode_link_format("</3/0>;pmin=10;pmax=60,</3/0/1>,</3/0/2>").unwrap();
        assert_eq!(value["path"], json!("/3/0"));
        assert_eq!(value["attrs"]["pmin"], json!(10));
        assert_eq!(value["resources"], json!(["/3/0/1", "/3/0/2"]));
    }

    #[test]
    fn test_exec_args() {
        let args = ExecArg::from_values(&[json!("go"), json!(12)]).unwrap();
        assert_eq!(encode_exec_args(&args), "'go',12");
        assert!(ExecArg::from_values(&[json!(true)]).is_err());
        assert_eq!(encode_exec_args(&[]), "");
    }

    #[test]
    fn test_plain_value() {
        assert_eq!(plain_value("42"), json!(42));
        assert_eq!(plain_value("2.5"), json!(2.5));
        assert_eq!(plain_value("on"), json!("on"));
    }
}
