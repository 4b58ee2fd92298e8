use apache_avro::schema::Schema;
use apache_avro::types::Value;
use std::sync::OnceLock;

use crate::Error;

/// Schema of one message in an archived log file. Mirrors the producer-side
/// writer: append time plus the original record's key and value, either of
/// which may be null.
const SCHEMA_JSON: &str = r#"
{
    "type": "record",
    "name": "LogFileRecord",
    "fields": [
        {"name": "timestamp", "type": "long"},
        {"name": "key", "type": ["null", "bytes"]},
        {"name": "value", "type": ["null", "bytes"]}
    ]
}
"#;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogFileRecord {
    pub timestamp: i64,
    pub key: Option<Vec<u8>>,
    pub value: Option<Vec<u8>>,
}

impl LogFileRecord {
    pub fn schema() -> &'static Schema {
        static SCHEMA: OnceLock<Schema> = OnceLock::new();
        SCHEMA.get_or_init(|| {
            Schema::parse_str(SCHEMA_JSON).expect("the log-file record schema is well-formed")
        })
    }

    /// Decode one datum read from an archive file.
    pub fn from_value(value: Value) -> Result<Self, Error> {
        let Value::Record(fields) = value else {
            return Err(Error::Invalid(format!(
                "archive datum is not a record: {value:?}"
            )));
        };

        let mut timestamp = None;
        let mut key = None;
        let mut payload = None;
        for (name, field) in fields {
            match (name.as_str(), field) {
                ("timestamp", Value::Long(ts)) => timestamp = Some(ts),
                ("key", field) => key = Some(decode_optional_bytes(field)?),
                ("value", field) => payload = Some(decode_optional_bytes(field)?),
                (name, field) => {
                    return Err(Error::Invalid(format!(
                        "unexpected archive record field {name}: {field:?}"
                    )))
                }
            }
        }
        match (timestamp, key, payload) {
            (Some(timestamp), Some(key), Some(value)) => Ok(LogFileRecord {
                timestamp,
                key,
                value,
            }),
            _ => Err(Error::Invalid(
                "archive record is missing required fields".to_string(),
            )),
        }
    }

    pub fn into_value(self) -> Value {
        Value::Record(vec![
            ("timestamp".to_string(), Value::Long(self.timestamp)),
            ("key".to_string(), encode_optional_bytes(self.key)),
            ("value".to_string(), encode_optional_bytes(self.value)),
        ])
    }
}

fn decode_optional_bytes(value: Value) -> Result<Option<Vec<u8>>, Error> {
    let inner = match value {
        Value::Union(_, inner) => *inner,
        other => other,
    };
    match inner {
        Value::Null => Ok(None),
        Value::Bytes(bytes) => Ok(Some(bytes)),
        other => Err(Error::Invalid(format!(
            "expected null-or-bytes field, found {other:?}"
        ))),
    }
}

fn encode_optional_bytes(bytes: Option<Vec<u8>>) -> Value {
    match bytes {
        None => Value::Union(0, Box::new(Value::Null)),
        Some(bytes) => Value::Union(1, Box::new(Value::Bytes(bytes))),
    }
}
