// Relabeling
// Prometheus-style relabel rules applied to entry label sets

use crate::component::{Body, DecodeError};
use crate::components::loki::LabelSet;
use crate::value::Value;

use regex::Regex;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    Replace,
    Keep,
    Drop,
    LabelMap,
    LabelDrop,
    LabelKeep,
    Lowercase,
    Uppercase,
}

impl Action {
    fn parse(name: &str) -> Option<Self> {
        Some(match name {
            "replace" => Action::Replace,
            "keep" => Action::Keep,
            "drop" => Action::Drop,
            "labelmap" => Action::LabelMap,
            "labeldrop" => Action::LabelDrop,
            "labelkeep" => Action::LabelKeep,
            "lowercase" => Action::Lowercase,
            "uppercase" => Action::Uppercase,
            _ => return None,
        })
    }
}

/// One relabel rule
#[derive(Debug, Clone)]
pub struct RelabelRule {
    pub source_labels: Vec<String>,
    pub separator: String,
    /// Anchored on both ends
    pub regex: Regex,
    pub target_label: String,
    pub replacement: String,
    pub action: Action,
}

impl PartialEq for RelabelRule {
    fn eq(&self, other: &Self) -> bool {
        self.source_labels == other.source_labels
            && self.separator == other.separator
            && self.regex.as_str() == other.regex.as_str()
            && self.target_label == other.target_label
            && self.replacement == other.replacement
            && self.action == other.action
    }
}

impl RelabelRule {
    pub fn new(action: Action, pattern: &str) -> Result<Self, regex::Error> {
        Ok(Self {
            source_labels: Vec::new(),
            separator: ";".to_string(),
            regex: anchored(pattern)?,
            target_label: String::new(),
            replacement: "$1".to_string(),
            action,
        })
    }

    /// Copy `source` into `target` unchanged
    pub fn copy(source: &str, target: &str) -> Self {
        Self {
            source_labels: vec![source.to_string()],
            separator: ";".to_string(),
            regex: match_all(),
            target_label: target.to_string(),
            replacement: "$1".to_string(),
            action: Action::Replace,
        }
    }

    pub fn decode(body: &Body<'_>) -> Result<Self, DecodeError> {
        body.check_known(&[
            "source_labels",
            "separator",
            "regex",
            "target_label",
            "replacement",
            "action",
        ])?;

        let action_name = body.string_or("action", "replace")?;
        let action = Action::parse(&action_name.to_lowercase())
            .ok_or_else(|| DecodeError::invalid("action", format!("unknown action '{}'", action_name)))?;

        let pattern = body.string_or("regex", "(.*)")?;
        let regex = anchored(&pattern).map_err(|e| DecodeError::invalid("regex", e.to_string()))?;

        let source_labels = body
            .list("source_labels")?
            .iter()
            .map(|v| match v {
                Value::String(s) => Ok(s.clone()),
                other => Err(DecodeError::WrongType {
                    attr: "source_labels".to_string(),
                    expected: "a list of strings",
                    found: other.kind(),
                }),
            })
            .collect::<Result<Vec<_>, _>>()?;

        let target_label = body.string_or("target_label", "")?;
        if matches!(action, Action::Replace | Action::Lowercase | Action::Uppercase)
            && target_label.is_empty()
        {
            return Err(DecodeError::invalid(
                "target_label",
                format!("required for action '{}'", action_name),
            ));
        }

        Ok(Self {
            source_labels,
            separator: body.string_or("separator", ";")?,
            regex,
            target_label,
            replacement: body.string_or("replacement", "$1")?,
            action,
        })
    }

    fn source_value(&self, labels: &LabelSet) -> String {
        self.source_labels
            .iter()
            .map(|name| labels.get(name).map(String::as_str).unwrap_or(""))
            .collect::<Vec<_>>()
            .join(&self.separator)
    }

    /// Apply this rule; `false` means the entry is dropped
    fn apply(&self, labels: &mut LabelSet) -> bool {
        match self.action {
            Action::Replace => {
                let value = self.source_value(labels);
                if let Some(caps) = self.regex.captures(&value) {
                    let mut target = String::new();
                    caps.expand(&self.target_label, &mut target);
                    let mut replaced = String::new();
                    caps.expand(&self.replacement, &mut replaced);
                    if target.is_empty() {
                        return true;
                    }
                    if replaced.is_empty() {
                        labels.remove(&target);
                    } else {
                        labels.insert(target, replaced);
                    }
                }
                true
            }
            Action::Keep => self.regex.is_match(&self.source_value(labels)),
            Action::Drop => !self.regex.is_match(&self.source_value(labels)),
            Action::Lowercase => {
                let value = self.source_value(labels).to_lowercase();
                labels.insert(self.target_label.clone(), value);
                true
            }
            Action::Uppercase => {
                let value = self.source_value(labels).to_uppercase();
                labels.insert(self.target_label.clone(), value);
                true
            }
            Action::LabelMap => {
                let mapped: Vec<(String, String)> = labels
                    .iter()
                    .filter(|(name, _)| self.regex.is_match(name))
                    .map(|(name, value)| {
                        (
                            self.regex.replace(name, self.replacement.as_str()).into_owned(),
                            value.clone(),
                        )
                    })
                    .collect();
                labels.extend(mapped);
                true
            }
            Action::LabelDrop => {
                labels.retain(|name, _| !self.regex.is_match(name));
                true
            }
            Action::LabelKeep => {
                labels.retain(|name, _| self.regex.is_match(name));
                true
            }
        }
    }
}

fn anchored(pattern: &str) -> Result<Regex, regex::Error> {
    Regex::new(&format!("^(?:{})$", pattern))
}

fn match_all() -> Regex {
    // A constant pattern always compiles
    Regex::new("^(.*)$").unwrap_or_else(|_| unreachable!())
}

/// Run `rules` over `labels` in order; `None` if a rule dropped the entry
pub fn process(labels: &LabelSet, rules: &[RelabelRule]) -> Option<LabelSet> {
    let mut labels = labels.clone();
    for rule in rules {
        if !rule.apply(&mut labels) {
            return None;
        }
    }
    Some(labels)
}

/// Decode a list of rule objects
pub fn decode_rules(body: &Body<'_>, attr: &str) -> Result<Vec<RelabelRule>, DecodeError> {
    body.objects(attr)?
        .iter()
        .map(RelabelRule::decode)
        .collect()
}
