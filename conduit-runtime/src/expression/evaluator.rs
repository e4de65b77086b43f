// Expression evaluator
// Evaluates expression ASTs against a scope of node values

use crate::expression::functions::{values_equal, BuiltinFunctions};
use crate::expression::parser::{BinaryOp, Expr, Reference, ReferencePart, UnaryOp};
use crate::value::Value;

use std::collections::{BTreeMap, HashMap};

use thiserror::Error;

/// Evaluation error
#[derive(Debug, Clone, PartialEq, Error)]
#[error("{message}")]
pub struct EvalError {
    pub message: String,
}

impl EvalError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }

    /// Prefix the message with the attribute that failed
    pub fn in_attribute(self, path: &str) -> Self {
        Self::new(format!("attribute '{}': {}", path, self.message))
    }
}

/// Read access to the values visible while evaluating expressions.
///
/// `lookup` receives the dotted name path of a reference (`["loki", "echo",
/// "out", "receiver"]`) and returns the value of the longest prefix it knows,
/// along with how many segments that prefix consumed. The remaining segments
/// are applied as member accesses by the evaluator.
pub trait Scope {
    fn lookup(&self, path: &[&str]) -> Option<(usize, Value)>;
}

/// Longest-prefix lookup over a flat map keyed by dotted names
fn lookup_dotted<'m>(
    get: impl Fn(&str) -> Option<&'m Value>,
    path: &[&str],
) -> Option<(usize, Value)> {
    (1..=path.len())
        .rev()
        .find_map(|len| get(&path[..len].join(".")).map(|value| (len, value.clone())))
}

impl Scope for HashMap<String, Value> {
    fn lookup(&self, path: &[&str]) -> Option<(usize, Value)> {
        lookup_dotted(|key| self.get(key), path)
    }
}

impl Scope for BTreeMap<String, Value> {
    fn lookup(&self, path: &[&str]) -> Option<(usize, Value)> {
        lookup_dotted(|key| self.get(key), path)
    }
}

/// A scope with nothing in it
pub struct EmptyScope;

impl Scope for EmptyScope {
    fn lookup(&self, _path: &[&str]) -> Option<(usize, Value)> {
        None
    }
}

/// Expression evaluator bound to one scope
pub struct Evaluator<'a> {
    scope: &'a dyn Scope,
    functions: BuiltinFunctions,
}

impl<'a> Evaluator<'a> {
    pub fn new(scope: &'a dyn Scope) -> Self {
        Self {
            scope,
            functions: BuiltinFunctions::new(),
        }
    }

    pub fn eval(&self, expr: &Expr) -> Result<Value, EvalError> {
        match expr {
            Expr::Null => Ok(Value::Null),
            Expr::Bool(b) => Ok(Value::Bool(*b)),
            Expr::Number(n) => Ok(Value::Number(*n)),
            Expr::String(s) => Ok(Value::String(s.clone())),

            Expr::Reference(reference) => self.eval_reference(reference),

            Expr::FunctionCall { name, args } => {
                let args = args
                    .iter()
                    .map(|arg| self.eval(arg))
                    .collect::<Result<Vec<_>, _>>()?;
                self.functions.call(name, args)
            }

            Expr::Index { object, index } => {
                let object = self.eval(object)?;
                let index = self.eval(index)?;
                eval_index(&object, &index)
            }

            Expr::Member { object, property } => eval_member(&self.eval(object)?, property),

            Expr::Unary { op, expr } => {
                let value = self.eval(expr)?;
                match op {
                    UnaryOp::Not => Ok(Value::Bool(!value.is_truthy())),
                    UnaryOp::Neg => value
                        .as_number()
                        .map(|n| Value::Number(-n))
                        .ok_or_else(|| EvalError::new(format!("cannot negate {}", value.kind()))),
                }
            }

            // Short-circuit && and ||
            Expr::Binary {
                op: BinaryOp::And,
                left,
                right,
            } => Ok(Value::Bool(
                self.eval(left)?.is_truthy() && self.eval(right)?.is_truthy(),
            )),
            Expr::Binary {
                op: BinaryOp::Or,
                left,
                right,
            } => Ok(Value::Bool(
                self.eval(left)?.is_truthy() || self.eval(right)?.is_truthy(),
            )),
            Expr::Binary { op, left, right } => {
                let left = self.eval(left)?;
                let right = self.eval(right)?;
                eval_binary(*op, &left, &right)
            }

            Expr::Ternary {
                condition,
                then_expr,
                else_expr,
            } => {
                if self.eval(condition)?.is_truthy() {
                    self.eval(then_expr)
                } else {
                    self.eval(else_expr)
                }
            }

            Expr::Array(items) => items
                .iter()
                .map(|item| self.eval(item))
                .collect::<Result<Vec<_>, _>>()
                .map(Value::Array),

            Expr::Object(pairs) => pairs
                .iter()
                .map(|(key, value)| Ok((key.clone(), self.eval(value)?)))
                .collect::<Result<BTreeMap<_, _>, EvalError>>()
                .map(Value::Object),
        }
    }

    fn eval_reference(&self, reference: &Reference) -> Result<Value, EvalError> {
        let names = reference.name_path();
        let (consumed, mut current) = self
            .scope
            .lookup(&names)
            .ok_or_else(|| EvalError::new(format!("unknown reference '{}'", reference)))?;

        for part in &reference.parts[consumed..] {
            current = match part {
                ReferencePart::Property(name) => eval_member(&current, name)?,
                ReferencePart::Index(index) => eval_index(&current, &self.eval(index)?)?,
            };
        }

        Ok(current)
    }
}

fn eval_index(object: &Value, index: &Value) -> Result<Value, EvalError> {
    match (object, index) {
        (Value::Array(items), Value::Number(n)) if *n >= 0.0 => items
            .get(*n as usize)
            .cloned()
            .ok_or_else(|| EvalError::new(format!("array index {} out of bounds", n))),
        (Value::Object(map), Value::String(key)) => {
            Ok(map.get(key).cloned().unwrap_or(Value::Null))
        }
        (Value::Null, _) => Ok(Value::Null),
        _ => Err(EvalError::new(format!(
            "cannot index {} with {}",
            object.kind(),
            index.kind()
        ))),
    }
}

fn eval_member(object: &Value, property: &str) -> Result<Value, EvalError> {
    match object {
        Value::Object(map) => Ok(map.get(property).cloned().unwrap_or(Value::Null)),
        Value::Null => Ok(Value::Null),
        _ => Err(EvalError::new(format!(
            "cannot access field '{}' on {}",
            property,
            object.kind()
        ))),
    }
}

fn eval_binary(op: BinaryOp, left: &Value, right: &Value) -> Result<Value, EvalError> {
    let numbers = || -> Result<(f64, f64), EvalError> {
        match (left.as_number(), right.as_number()) {
            (Some(a), Some(b)) => Ok((a, b)),
            _ => Err(EvalError::new(format!(
                "operator '{}' expects numbers, got {} and {}",
                op,
                left.kind(),
                right.kind()
            ))),
        }
    };

    Ok(match op {
        BinaryOp::Add => match (left, right) {
            (Value::String(a), b) => Value::String(format!("{}{}", a, b.as_string())),
            (a, Value::String(b)) => Value::String(format!("{}{}", a.as_string(), b)),
            _ => numbers().map(|(a, b)| Value::Number(a + b))?,
        },
        BinaryOp::Sub => numbers().map(|(a, b)| Value::Number(a - b))?,
        BinaryOp::Mul => numbers().map(|(a, b)| Value::Number(a * b))?,
        BinaryOp::Div | BinaryOp::Mod => {
            let (a, b) = numbers()?;
            if b == 0.0 {
                return Err(EvalError::new("division by zero"));
            }
            Value::Number(if op == BinaryOp::Div { a / b } else { a % b })
        }
        BinaryOp::Eq => Value::Bool(values_equal(left, right)),
        BinaryOp::Ne => Value::Bool(!values_equal(left, right)),
        BinaryOp::Lt => numbers().map(|(a, b)| Value::Bool(a < b))?,
        BinaryOp::Le => numbers().map(|(a, b)| Value::Bool(a <= b))?,
        BinaryOp::Gt => numbers().map(|(a, b)| Value::Bool(a > b))?,
        BinaryOp::Ge => numbers().map(|(a, b)| Value::Bool(a >= b))?,
        BinaryOp::And => Value::Bool(left.is_truthy() && right.is_truthy()),
        BinaryOp::Or => Value::Bool(left.is_truthy() || right.is_truthy()),
    })
}

/// Parse and evaluate a standalone expression
pub fn evaluate_str(input: &str, scope: &dyn Scope) -> Result<Value, EvalError> {
    let expr = crate::expression::parser::ExprParser::parse_str(input)
        .map_err(|e| EvalError::new(e.to_string()))?;
    Evaluator::new(scope).eval(&expr)
}
