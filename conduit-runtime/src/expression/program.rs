// Compiled block bodies
// Turns a block's YAML attributes into templates that evaluate against a scope

use crate::expression::evaluator::{EvalError, Evaluator, Scope};
use crate::expression::lexer::{extract_expressions, Segment};
use crate::expression::parser::{collect_references, Expr, ExprParser, ParseExprError};
use crate::value::{yaml_key, Value};

use std::collections::{BTreeMap, BTreeSet};

use thiserror::Error;

/// An expression that failed to parse, with the attribute it came from
#[derive(Debug, Clone, PartialEq, Error)]
#[error("attribute '{attribute}': invalid expression '{source_text}': {error}")]
pub struct CompileError {
    pub attribute: String,
    pub source_text: String,
    pub error: ParseExprError,
}

/// One attribute value, compiled
#[derive(Debug, Clone, PartialEq)]
pub enum Template {
    /// No expressions anywhere below this point
    Literal(Value),
    /// A string that is exactly one `${{ }}`; evaluates to the expression's own type
    Expr(Expr),
    /// Text mixed with expressions; always evaluates to a string
    Interpolated(Vec<Part>),
    List(Vec<Template>),
    Map(Vec<(String, Template)>),
}

#[derive(Debug, Clone, PartialEq)]
pub enum Part {
    Text(String),
    Expr(Expr),
}

impl Template {
    fn compile(value: &serde_yaml::Value, path: &str) -> Result<Template, CompileError> {
        let template = match value {
            serde_yaml::Value::String(s) => compile_string(s, path)?,
            serde_yaml::Value::Sequence(items) => Template::List(
                items
                    .iter()
                    .enumerate()
                    .map(|(i, item)| Template::compile(item, &format!("{}[{}]", path, i)))
                    .collect::<Result<_, _>>()?,
            ),
            serde_yaml::Value::Mapping(map) => Template::Map(
                map.iter()
                    .map(|(k, v)| {
                        let key = yaml_key(k);
                        let child = Template::compile(v, &format!("{}.{}", path, key))?;
                        Ok((key, child))
                    })
                    .collect::<Result<_, _>>()?,
            ),
            serde_yaml::Value::Tagged(tagged) => Template::compile(&tagged.value, path)?,
            literal => return Ok(Template::Literal(Value::from_yaml(literal))),
        };
        Ok(template.fold_literals())
    }

    /// Collapse containers whose children are all literals
    fn fold_literals(self) -> Template {
        match self {
            Template::List(items) if items.iter().all(Template::is_literal) => {
                Template::Literal(Value::Array(
                    items.into_iter().map(Template::into_literal).collect(),
                ))
            }
            Template::Map(pairs) if pairs.iter().all(|(_, t)| t.is_literal()) => {
                Template::Literal(Value::Object(
                    pairs
                        .into_iter()
                        .map(|(k, t)| (k, t.into_literal()))
                        .collect(),
                ))
            }
            other => other,
        }
    }

    fn is_literal(&self) -> bool {
        matches!(self, Template::Literal(_))
    }

    fn into_literal(self) -> Value {
        match self {
            Template::Literal(value) => value,
            _ => Value::Null,
        }
    }

    fn evaluate(&self, evaluator: &Evaluator<'_>, path: &str) -> Result<Value, EvalError> {
        match self {
            Template::Literal(value) => Ok(value.clone()),
            Template::Expr(expr) => evaluator.eval(expr).map_err(|e| e.in_attribute(path)),
            Template::Interpolated(parts) => {
                let mut out = String::new();
                for part in parts {
                    match part {
                        Part::Text(text) => out.push_str(text),
                        Part::Expr(expr) => out.push_str(
                            &evaluator
                                .eval(expr)
                                .map_err(|e| e.in_attribute(path))?
                                .as_string(),
                        ),
                    }
                }
                Ok(Value::String(out))
            }
            Template::List(items) => items
                .iter()
                .enumerate()
                .map(|(i, item)| item.evaluate(evaluator, &format!("{}[{}]", path, i)))
                .collect::<Result<Vec<_>, _>>()
                .map(Value::Array),
            Template::Map(pairs) => pairs
                .iter()
                .map(|(k, t)| Ok((k.clone(), t.evaluate(evaluator, &format!("{}.{}", path, k))?)))
                .collect::<Result<BTreeMap<_, _>, EvalError>>()
                .map(Value::Object),
        }
    }

    fn expressions<'a>(&'a self, out: &mut Vec<&'a Expr>) {
        match self {
            Template::Literal(_) => {}
            Template::Expr(expr) => out.push(expr),
            Template::Interpolated(parts) => out.extend(parts.iter().filter_map(|p| match p {
                Part::Expr(expr) => Some(expr),
                Part::Text(_) => None,
            })),
            Template::List(items) => items.iter().for_each(|t| t.expressions(out)),
            Template::Map(pairs) => pairs.iter().for_each(|(_, t)| t.expressions(out)),
        }
    }
}

fn compile_string(input: &str, path: &str) -> Result<Template, CompileError> {
    let parse = |source: &str| {
        ExprParser::parse_str(source).map_err(|error| CompileError {
            attribute: path.to_string(),
            source_text: source.to_string(),
            error,
        })
    };

    let segments = extract_expressions(input);
    match segments.as_slice() {
        [] => Ok(Template::Literal(Value::String(String::new()))),
        [Segment::Text(text)] => Ok(Template::Literal(Value::String(text.clone()))),
        [Segment::Expression(source)] => Ok(Template::Expr(parse(source.as_str())?)),
        _ => segments
            .iter()
            .map(|segment| match segment {
                Segment::Text(text) => Ok(Part::Text(text.clone())),
                Segment::Expression(source) => Ok(Part::Expr(parse(source.as_str())?)),
            })
            .collect::<Result<Vec<_>, _>>()
            .map(Template::Interpolated),
    }
}

/// The compiled form of a block body
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Program {
    attributes: Vec<(String, Template)>,
}

impl Program {
    pub fn compile(body: &BTreeMap<String, serde_yaml::Value>) -> Result<Self, CompileError> {
        let attributes = body
            .iter()
            .map(|(name, value)| Ok((name.clone(), Template::compile(value, name)?)))
            .collect::<Result<Vec<_>, CompileError>>()?;
        Ok(Self { attributes })
    }

    /// Evaluate every attribute into an object value
    pub fn evaluate(&self, scope: &dyn Scope) -> Result<Value, EvalError> {
        let evaluator = Evaluator::new(scope);
        self.attributes
            .iter()
            .map(|(name, template)| Ok((name.clone(), template.evaluate(&evaluator, name)?)))
            .collect::<Result<BTreeMap<_, _>, EvalError>>()
            .map(Value::Object)
    }

    /// Evaluate a single attribute; `None` when the body does not set it
    pub fn evaluate_attribute(
        &self,
        name: &str,
        scope: &dyn Scope,
    ) -> Option<Result<Value, EvalError>> {
        let evaluator = Evaluator::new(scope);
        self.attributes
            .iter()
            .find(|(attr, _)| attr == name)
            .map(|(attr, template)| template.evaluate(&evaluator, attr))
    }

    pub fn has_attribute(&self, name: &str) -> bool {
        self.attributes.iter().any(|(attr, _)| attr == name)
    }

    /// Dotted name paths of every reference in the body, deduplicated
    pub fn references(&self) -> BTreeSet<Vec<String>> {
        let mut exprs = Vec::new();
        for (_, template) in &self.attributes {
            template.expressions(&mut exprs);
        }

        let mut references = Vec::new();
        for expr in exprs {
            collect_references(expr, &mut references);
        }

        references
            .into_iter()
            .map(|r| r.name_path().into_iter().map(str::to_string).collect())
            .collect()
    }
}
