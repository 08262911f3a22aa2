//! Inbound performance messages
//!
//! Messages arrive as loosely typed JSON objects:
//!
//! ```json
//! {"type": "perf", "host": "server1.example.com", "datasource": "Load",
//!  "timestamp": "1165939739", "value": "12"}
//! ```
//!
//! [`PerformanceMessage::parse`] turns them into a typed value or says which
//! field is wrong.

use std::fmt;

use serde_json::Value;

use crate::error::ValidationError;

/// The only message type this connector stores
pub const PERF_MESSAGE_TYPE: &str = "perf";

/// Value of a sample; `U` means the producer had no value
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum MetricValue {
    Unknown,
    Number(f64),
}

impl fmt::Display for MetricValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MetricValue::Unknown => f.write_str("U"),
            MetricValue::Number(value) => write!(f, "{value}"),
        }
    }
}

/// A validated performance sample
#[derive(Debug, Clone, PartialEq)]
pub struct PerformanceMessage {
    pub host: String,
    pub datasource: String,
    /// Unix seconds
    pub timestamp: i64,
    pub value: MetricValue,
}

impl PerformanceMessage {
    pub fn parse(raw: &Value) -> Result<Self, ValidationError> {
        let message_type = field(raw, "type")?;
        match message_type.as_str() {
            Some(PERF_MESSAGE_TYPE) => {}
            Some(other) => return Err(ValidationError::WrongMessageType(other.to_string())),
            None => return Err(ValidationError::WrongMessageType(message_type.to_string())),
        }

        let timestamp = parse_timestamp(field(raw, "timestamp")?)?;
        let value = parse_value(field(raw, "value")?)?;
        let host = text_field(raw, "host")?;
        let datasource = text_field(raw, "datasource")?;

        Ok(Self {
            host,
            datasource,
            timestamp,
            value,
        })
    }

    /// Body of the `rrdtool update` command
    pub fn update_argument(&self) -> String {
        format!("{}:{}", self.timestamp, self.value)
    }
}

fn field<'a>(raw: &'a Value, name: &'static str) -> Result<&'a Value, ValidationError> {
    match raw.get(name) {
        None | Some(Value::Null) => Err(ValidationError::MissingField(name)),
        Some(value) => Ok(value),
    }
}

fn text_field(raw: &Value, name: &'static str) -> Result<String, ValidationError> {
    match field(raw, name)? {
        Value::String(text) if !text.is_empty() => Ok(text.clone()),
        Value::String(_) => Err(ValidationError::MissingField(name)),
        other => Ok(other.to_string()),
    }
}

/// Unix seconds; anything before the epoch is rejected
fn parse_timestamp(raw: &Value) -> Result<i64, ValidationError> {
    let invalid = || ValidationError::InvalidTimestamp(raw.to_string());

    let timestamp = match raw {
        Value::Number(number) => number
            .as_i64()
            .or_else(|| number.as_f64().filter(|t| t.is_finite()).map(|t| t as i64))
            .ok_or_else(invalid),
        Value::String(text) => {
            let text = text.trim();
            text.parse::<i64>()
                .ok()
                .or_else(|| {
                    text.parse::<f64>()
                        .ok()
                        .filter(|t| t.is_finite())
                        .map(|t| t as i64)
                })
                .ok_or_else(invalid)
        }
        _ => Err(invalid()),
    }?;

    if timestamp < 0 {
        return Err(invalid());
    }
    Ok(timestamp)
}

fn parse_value(raw: &Value) -> Result<MetricValue, ValidationError> {
    let number = match raw {
        Value::String(text) if text == "U" => return Ok(MetricValue::Unknown),
        Value::String(text) => text.trim().parse::<f64>().ok(),
        Value::Number(number) => number.as_f64(),
        _ => None,
    };

    number
        .filter(|value| value.is_finite())
        .map(MetricValue::Number)
        .ok_or_else(|| ValidationError::InvalidValue(raw.to_string()))
}
