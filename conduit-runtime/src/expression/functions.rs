// Builtin expression functions
// String, comparison, collection and environment helpers callable from `${{ }}`

use crate::expression::evaluator::EvalError;
use crate::value::Value;

/// Registry of builtin functions
#[derive(Debug, Default, Clone, Copy)]
pub struct BuiltinFunctions;

impl BuiltinFunctions {
    pub fn new() -> Self {
        Self
    }

    /// Call a builtin by name; names are case-insensitive
    pub fn call(&self, name: &str, args: Vec<Value>) -> Result<Value, EvalError> {
        match name.to_lowercase().as_str() {
            // Comparison
            "eq" => self.binary(name, args, |a, b| Ok(Value::Bool(values_equal(a, b)))),
            "ne" => self.binary(name, args, |a, b| Ok(Value::Bool(!values_equal(a, b)))),
            "lt" => self.compare(name, args, |a, b| a < b),
            "le" => self.compare(name, args, |a, b| a <= b),
            "gt" => self.compare(name, args, |a, b| a > b),
            "ge" => self.compare(name, args, |a, b| a >= b),
            "in" => {
                let (needle, haystack) = args
                    .split_first()
                    .ok_or_else(|| EvalError::new("in() requires at least 2 arguments"))?;
                Ok(Value::Bool(haystack.iter().any(|v| values_equal(needle, v))))
            }

            // Logical
            "and" => Ok(Value::Bool(args.iter().all(Value::is_truthy))),
            "or" => Ok(Value::Bool(args.iter().any(Value::is_truthy))),
            "not" => {
                self.require_args(&args, 1, name)?;
                Ok(Value::Bool(!args[0].is_truthy()))
            }

            // Strings
            "contains" => self.binary(name, args, |haystack, needle| {
                Ok(Value::Bool(match haystack {
                    Value::Array(items) => items.iter().any(|v| values_equal(v, needle)),
                    Value::Object(map) => map.contains_key(&needle.as_string()),
                    other => other.as_string().contains(&needle.as_string()),
                }))
            }),
            "startswith" => self.binary(name, args, |s, prefix| {
                Ok(Value::Bool(s.as_string().starts_with(&prefix.as_string())))
            }),
            "endswith" => self.binary(name, args, |s, suffix| {
                Ok(Value::Bool(s.as_string().ends_with(&suffix.as_string())))
            }),
            "format" => self.fn_format(args),
            "join" => self.binary(name, args, |separator, items| match items {
                Value::Array(items) => Ok(Value::String(
                    items
                        .iter()
                        .map(Value::as_string)
                        .collect::<Vec<_>>()
                        .join(&separator.as_string()),
                )),
                other => Ok(Value::String(other.as_string())),
            }),
            "replace" => {
                self.require_args(&args, 3, name)?;
                Ok(Value::String(
                    args[0]
                        .as_string()
                        .replace(&args[1].as_string(), &args[2].as_string()),
                ))
            }
            "split" => self.binary(name, args, |s, separator| {
                Ok(Value::Array(
                    s.as_string()
                        .split(&separator.as_string())
                        .map(Value::from)
                        .collect(),
                ))
            }),
            "lower" => self.unary(name, args, |s| Value::String(s.as_string().to_lowercase())),
            "upper" => self.unary(name, args, |s| Value::String(s.as_string().to_uppercase())),
            "trim" => self.unary(name, args, |s| Value::String(s.as_string().trim().to_string())),
            "concat" => Ok(concat(args)),

            // Utility
            "coalesce" => Ok(args
                .into_iter()
                .find(|v| !v.is_null() && v != &Value::String(String::new()))
                .unwrap_or(Value::Null)),
            "length" => {
                self.require_args(&args, 1, name)?;
                let len = match &args[0] {
                    Value::String(s) => s.chars().count(),
                    Value::Array(items) => items.len(),
                    Value::Object(map) => map.len(),
                    Value::Null => 0,
                    other => {
                        return Err(EvalError::new(format!(
                            "length() is not defined for {}",
                            other.kind()
                        )))
                    }
                };
                Ok(Value::Number(len as f64))
            }
            "to_json" => self.unary(name, args, |v| Value::String(v.to_json())),
            "from_json" => {
                self.require_args(&args, 1, name)?;
                serde_json::from_str::<serde_json::Value>(&args[0].as_string())
                    .map(|json| Value::from_json(&json))
                    .map_err(|e| EvalError::new(format!("from_json(): {}", e)))
            }
            "env" => {
                self.require_args(&args, 1, name)?;
                Ok(std::env::var(args[0].as_string())
                    .map(Value::String)
                    .unwrap_or(Value::String(String::new())))
            }

            _ => Err(EvalError::new(format!("unknown function: {}", name))),
        }
    }

    /// `format('{0} on {1}', a, b)`
    fn fn_format(&self, args: Vec<Value>) -> Result<Value, EvalError> {
        let (template, rest) = args
            .split_first()
            .ok_or_else(|| EvalError::new("format() requires at least 1 argument"))?;
        let mut result = template.as_string();
        for (i, arg) in rest.iter().enumerate() {
            result = result.replace(&format!("{{{}}}", i), &arg.as_string());
        }
        Ok(Value::String(result))
    }

    fn unary(
        &self,
        name: &str,
        args: Vec<Value>,
        f: impl FnOnce(&Value) -> Value,
    ) -> Result<Value, EvalError> {
        self.require_args(&args, 1, name)?;
        Ok(f(&args[0]))
    }

    fn binary(
        &self,
        name: &str,
        args: Vec<Value>,
        f: impl FnOnce(&Value, &Value) -> Result<Value, EvalError>,
    ) -> Result<Value, EvalError> {
        self.require_args(&args, 2, name)?;
        f(&args[0], &args[1])
    }

    fn compare(
        &self,
        name: &str,
        args: Vec<Value>,
        f: impl FnOnce(f64, f64) -> bool,
    ) -> Result<Value, EvalError> {
        self.binary(name, args, |a, b| match (a.as_number(), b.as_number()) {
            (Some(a), Some(b)) => Ok(Value::Bool(f(a, b))),
            _ => Err(EvalError::new(format!("{}() expects numbers", name))),
        })
    }

    fn require_args(&self, args: &[Value], count: usize, name: &str) -> Result<(), EvalError> {
        if args.len() != count {
            return Err(EvalError::new(format!(
                "{}() requires {} argument(s), got {}",
                name,
                count,
                args.len()
            )));
        }
        Ok(())
    }
}

/// Concatenate arrays into one array, anything else into a string
fn concat(args: Vec<Value>) -> Value {
    if !args.is_empty() && args.iter().all(|v| matches!(v, Value::Array(_))) {
        return Value::Array(
            args.into_iter()
                .flat_map(|v| match v {
                    Value::Array(items) => items,
                    _ => Vec::new(),
                })
                .collect(),
        );
    }
    Value::String(args.iter().map(Value::as_string).collect())
}

/// Loose equality: numbers compare with numeric strings, everything else structurally
pub(crate) fn values_equal(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(x), Value::String(s)) | (Value::String(s), Value::Number(x)) => s
            .trim()
            .parse::<f64>()
            .map(|n| (n - x).abs() < f64::EPSILON)
            .unwrap_or(false),
        (Value::Number(x), Value::Number(y)) => (x - y).abs() < f64::EPSILON,
        _ => a == b,
    }
}
