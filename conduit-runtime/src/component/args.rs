// Component argument decoding
// Typed accessors over an evaluated block body

use crate::value::Value;

use std::any::Any;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;

/// A block body that could not be decoded into a component's arguments
#[derive(Debug, Clone, PartialEq, Error)]
pub enum DecodeError {
    #[error("missing required attribute '{0}'")]
    Missing(String),

    #[error("attribute '{attr}' must be {expected}, got {found}")]
    WrongType {
        attr: String,
        expected: &'static str,
        found: &'static str,
    },

    #[error("attribute '{attr}': {message}")]
    Invalid { attr: String, message: String },

    #[error("unsupported attribute '{0}'")]
    Unknown(String),
}

impl DecodeError {
    pub fn invalid(attr: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Invalid {
            attr: attr.into(),
            message: message.into(),
        }
    }
}

/// Input type of a component, decoded from its evaluated block body
pub trait Arguments: Sized + Send + Sync + 'static {
    fn decode(body: &Body<'_>) -> Result<Self, DecodeError>;
}

/// Read-only view of an evaluated body (or a nested object inside one).
///
/// Attributes set to `null` read as absent.
#[derive(Debug, Clone)]
pub struct Body<'a> {
    fields: Option<&'a BTreeMap<String, Value>>,
    path: String,
}

impl<'a> Body<'a> {
    pub fn new(value: &'a Value) -> Self {
        Self {
            fields: value.as_object(),
            path: String::new(),
        }
    }

    fn nested(value: &'a Value, path: String) -> Self {
        Self {
            fields: value.as_object(),
            path,
        }
    }

    fn attr(&self, key: &str) -> String {
        if self.path.is_empty() {
            key.to_string()
        } else {
            format!("{}.{}", self.path, key)
        }
    }

    fn wrong_type(&self, key: &str, expected: &'static str, found: &Value) -> DecodeError {
        DecodeError::WrongType {
            attr: self.attr(key),
            expected,
            found: found.kind(),
        }
    }

    pub fn get(&self, key: &str) -> Option<&'a Value> {
        self.fields?.get(key).filter(|v| !v.is_null())
    }

    /// Reject attributes outside `known`
    pub fn check_known(&self, known: &[&str]) -> Result<(), DecodeError> {
        let Some(fields) = self.fields else {
            return Ok(());
        };
        match fields.keys().find(|k| !known.contains(&k.as_str())) {
            Some(unknown) => Err(DecodeError::Unknown(self.attr(unknown))),
            None => Ok(()),
        }
    }

    pub fn string(&self, key: &str) -> Result<Option<String>, DecodeError> {
        match self.get(key) {
            None => Ok(None),
            Some(Value::String(s)) => Ok(Some(s.clone())),
            Some(v @ (Value::Number(_) | Value::Bool(_))) => Ok(Some(v.as_string())),
            Some(other) => Err(self.wrong_type(key, "a string", other)),
        }
    }

    pub fn required_string(&self, key: &str) -> Result<String, DecodeError> {
        self.string(key)?
            .ok_or_else(|| DecodeError::Missing(self.attr(key)))
    }

    pub fn string_or(&self, key: &str, default: &str) -> Result<String, DecodeError> {
        Ok(self.string(key)?.unwrap_or_else(|| default.to_string()))
    }

    pub fn bool_or(&self, key: &str, default: bool) -> Result<bool, DecodeError> {
        match self.get(key) {
            None => Ok(default),
            Some(Value::Bool(b)) => Ok(*b),
            Some(other) => Err(self.wrong_type(key, "a bool", other)),
        }
    }

    pub fn i64_or(&self, key: &str, default: i64) -> Result<i64, DecodeError> {
        match self.get(key) {
            None => Ok(default),
            Some(Value::Number(n)) if n.fract() == 0.0 => Ok(*n as i64),
            Some(other) => Err(self.wrong_type(key, "an integer", other)),
        }
    }

    /// Durations are strings like `"15s"`, `"250ms"`, `"1m30s"` or plain seconds
    pub fn duration_or(&self, key: &str, default: Duration) -> Result<Duration, DecodeError> {
        match self.get(key) {
            None => Ok(default),
            Some(Value::Number(n)) if *n >= 0.0 => seconds(*n)
                .map_err(|message| DecodeError::invalid(self.attr(key), message)),
            Some(Value::String(s)) => {
                parse_duration(s).map_err(|message| DecodeError::invalid(self.attr(key), message))
            }
            Some(other) => Err(self.wrong_type(key, "a duration", other)),
        }
    }

    /// List attribute; absent reads as empty
    pub fn list(&self, key: &str) -> Result<&'a [Value], DecodeError> {
        match self.get(key) {
            None => Ok(&[][..]),
            Some(Value::Array(items)) => Ok(items.as_slice()),
            Some(other) => Err(self.wrong_type(key, "a list", other)),
        }
    }

    /// Nested object attribute
    pub fn object(&self, key: &str) -> Result<Option<Body<'a>>, DecodeError> {
        match self.get(key) {
            None => Ok(None),
            Some(v @ Value::Object(_)) => Ok(Some(Body::nested(v, self.attr(key)))),
            Some(other) => Err(self.wrong_type(key, "an object", other)),
        }
    }

    /// List of nested objects, e.g. repeated rule blocks
    pub fn objects(&self, key: &str) -> Result<Vec<Body<'a>>, DecodeError> {
        self.list(key)?
            .iter()
            .enumerate()
            .map(|(i, item)| match item {
                Value::Object(_) => Ok(Body::nested(item, format!("{}[{}]", self.attr(key), i))),
                other => Err(self.wrong_type(key, "a list of objects", other)),
            })
            .collect()
    }

    /// Object of string values
    pub fn string_map(&self, key: &str) -> Result<BTreeMap<String, String>, DecodeError> {
        match self.get(key) {
            None => Ok(BTreeMap::new()),
            Some(Value::Object(map)) => map
                .iter()
                .map(|(k, v)| match v {
                    Value::String(s) => Ok((k.clone(), s.clone())),
                    other => Err(self.wrong_type(key, "a map of strings", other)),
                })
                .collect(),
            Some(other) => Err(self.wrong_type(key, "a map of strings", other)),
        }
    }

    /// List of capsules holding `T`
    pub fn capsules<T: Any + Send + Sync>(&self, key: &str) -> Result<Vec<Arc<T>>, DecodeError> {
        self.list(key)?
            .iter()
            .map(|item| {
                item.as_capsule()
                    .and_then(|c| c.downcast::<T>())
                    .ok_or_else(|| {
                        DecodeError::invalid(
                            self.attr(key),
                            format!(
                                "expected {} handles, got {}",
                                short_type_name::<T>(),
                                item.kind()
                            ),
                        )
                    })
            })
            .collect()
    }
}

fn short_type_name<T>() -> &'static str {
    let name = std::any::type_name::<T>();
    name.rsplit("::").next().unwrap_or(name)
}

/// Parse `1h2m3s4ms`-style durations
pub fn parse_duration(input: &str) -> Result<Duration, String> {
    let input = input.trim();
    if input.is_empty() {
        return Err("empty duration".to_string());
    }
    if let Ok(secs) = input.parse::<f64>() {
        return if secs < 0.0 { Ok(Duration::ZERO) } else { seconds(secs) };
    }

    let mut total = Duration::ZERO;
    let mut rest = input;
    while !rest.is_empty() {
        let digits = rest
            .find(|c: char| !(c.is_ascii_digit() || c == '.'))
            .ok_or_else(|| format!("missing unit in duration '{}'", input))?;
        let amount: f64 = rest[..digits]
            .parse()
            .map_err(|_| format!("invalid duration '{}'", input))?;
        rest = &rest[digits..];

        let unit_len = rest
            .find(|c: char| c.is_ascii_digit())
            .unwrap_or(rest.len());
        let scale = match &rest[..unit_len] {
            "ms" => 0.001,
            "s" => 1.0,
            "m" => 60.0,
            "h" => 3600.0,
            unit => return Err(format!("unknown duration unit '{}' in '{}'", unit, input)),
        };
        total = total
            .checked_add(seconds(amount * scale)?)
            .ok_or_else(|| format!("duration '{}' is out of range", input))?;
        rest = &rest[unit_len..];
    }

    Ok(total)
}

fn seconds(secs: f64) -> Result<Duration, String> {
    if !secs.is_finite() {
        return Err(format!("duration {} is not finite", secs));
    }
    Duration::try_from_secs_f64(secs).map_err(|_| format!("duration of {}s is out of range", secs))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::Capsule;

    fn value(yaml: &str) -> Value {
        Value::from_yaml(&serde_yaml::from_str(yaml).unwrap())
    }

    #[test]
    fn test_scalar_accessors() {
        let v = value("name: x\nport: 80\nflag: true\nempty: null\n");
        let body = Body::new(&v);
        assert_eq!(body.required_string("name").unwrap(), "x");
        assert_eq!(body.string("port").unwrap().as_deref(), Some("80"));
        assert_eq!(body.i64_or("port", 1).unwrap(), 80);
        assert!(body.bool_or("flag", false).unwrap());
        assert_eq!(body.string_or("empty", "d").unwrap(), "d");
        assert_eq!(
            body.required_string("missing").unwrap_err(),
            DecodeError::Missing("missing".to_string())
        );
        assert!(matches!(
            body.bool_or("name", false).unwrap_err(),
            DecodeError::WrongType { .. }
        ));
    }

    #[test]
    fn test_nested_paths_in_errors() {
        let v = value("rules:\n  - action: replace\n  - action: 3\n");
        let body = Body::new(&v);
        let rules = body.objects("rules").unwrap();
        assert_eq!(rules.len(), 2);
        let err = rules[1].bool_or("action", false).unwrap_err();
        assert_eq!(
            err.to_string(),
            "attribute 'rules[1].action' must be a bool, got number"
        );
    }

    #[test]
    fn test_check_known() {
        let v = value("a: 1\nb: 2\n");
        let body = Body::new(&v);
        assert!(body.check_known(&["a", "b"]).is_ok());
        assert_eq!(
            body.check_known(&["a"]).unwrap_err(),
            DecodeError::Unknown("b".to_string())
        );
    }

    #[test]
    fn test_capsules() {
        let handle = Capsule::new(5u32);
        let mut fields = BTreeMap::new();
        fields.insert(
            "forward_to".to_string(),
            Value::Array(vec![Value::Capsule(handle)]),
        );
        let v = Value::Object(fields);
        let body = Body::new(&v);
        let handles = body.capsules::<u32>("forward_to").unwrap();
        assert_eq!(*handles[0], 5);
        assert!(body.capsules::<String>("forward_to").is_err());
        assert!(body.capsules::<u32>("absent").unwrap().is_empty());
    }

    #[test]
    fn test_parse_duration() {
        assert_eq!(parse_duration("15s").unwrap(), Duration::from_secs(15));
        assert_eq!(parse_duration("250ms").unwrap(), Duration::from_millis(250));
        assert_eq!(parse_duration("1m30s").unwrap(), Duration::from_secs(90));
        assert_eq!(parse_duration("2").unwrap(), Duration::from_secs(2));
        assert!(parse_duration("5x").is_err());
        assert!(parse_duration("").is_err());
        assert!(parse_duration("10").is_ok());
    }

    #[test]
    fn test_unrepresentable_durations_are_rejected() {
        assert!(parse_duration("inf").is_err());
        assert!(parse_duration("NaN").is_err());
        assert!(parse_duration("1e400").is_err());
        assert!(parse_duration("99999999999999999999h").is_err());
        assert!(parse_duration("18446744073709551615s18446744073709551615s").is_err());

        let v = value("huge: 1.0e300\nbad: inf\n");
        let body = Body::new(&v);
        assert!(matches!(
            body.duration_or("huge", Duration::ZERO).unwrap_err(),
            DecodeError::Invalid { .. }
        ));
        assert!(matches!(
            body.duration_or("bad", Duration::ZERO).unwrap_err(),
            DecodeError::Invalid { .. }
        ));
    }
}
