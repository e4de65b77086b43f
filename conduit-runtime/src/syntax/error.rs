// Configuration syntax errors
// Line/column aware errors with source excerpts and fix suggestions

use std::fmt;

/// Error raised while reading a configuration document
#[derive(Debug, Clone)]
pub struct SyntaxError {
    pub message: String,
    /// Line number (1-indexed, 0 when unknown)
    pub line: usize,
    /// Column number (1-indexed, 0 when unknown)
    pub column: usize,
    /// A few source lines around the error
    pub context: String,
    pub suggestion: Option<String>,
    pub kind: SyntaxErrorKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyntaxErrorKind {
    /// Malformed YAML
    Yaml,
    /// Well-formed YAML with the wrong shape (missing `block`, unknown top-level key)
    Schema,
    /// The file could not be read
    Io,
}

impl SyntaxError {
    pub fn new(message: impl Into<String>, kind: SyntaxErrorKind) -> Self {
        Self {
            message: message.into(),
            line: 0,
            column: 0,
            context: String::new(),
            suggestion: None,
            kind,
        }
    }

    pub fn at(mut self, line: usize, column: usize) -> Self {
        self.line = line;
        self.column = column;
        self
    }

    pub fn with_suggestion(mut self, suggestion: impl Into<String>) -> Self {
        self.suggestion = Some(suggestion.into());
        self
    }

    /// Attach the lines surrounding `self.line` from `source`
    pub fn with_source_context(mut self, source: &str, context_lines: usize) -> Self {
        if self.line == 0 {
            return self;
        }

        let lines: Vec<&str> = source.lines().collect();
        let start = self.line.saturating_sub(context_lines + 1);
        let end = (self.line + context_lines).min(lines.len());

        let mut context = String::new();
        for (i, line) in lines.iter().enumerate().take(end).skip(start) {
            let line_num = i + 1;
            let marker = if line_num == self.line { ">" } else { " " };
            context.push_str(&format!("{} {:4} | {}\n", marker, line_num, line));
            if line_num == self.line && self.column > 0 {
                context.push_str(&format!("       | {}^\n", " ".repeat(self.column - 1)));
            }
        }

        self.context = context;
        self
    }

    pub fn from_yaml_error(err: &serde_yaml::Error, source: &str) -> Self {
        let (line, column) = err
            .location()
            .map(|loc| (loc.line(), loc.column()))
            .unwrap_or((0, 0));

        let raw = err.to_string();
        let kind = if raw.contains("missing field")
            || raw.contains("unknown field")
            || raw.contains("invalid type")
        {
            SyntaxErrorKind::Schema
        } else {
            SyntaxErrorKind::Yaml
        };

        let mut error = SyntaxError::new(clean_yaml_message(&raw), kind)
            .at(line, column)
            .with_source_context(source, 2);
        error.suggestion = suggest_fix(&raw, source, line);
        error
    }
}

impl fmt::Display for SyntaxError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)?;
        if self.line > 0 {
            write!(f, " (line {}:{})", self.line, self.column)?;
        }
        if !self.context.is_empty() {
            write!(f, "\n\n{}", self.context.trim_end())?;
        }
        if let Some(suggestion) = &self.suggestion {
            write!(f, "\nhelp: {}", suggestion)?;
        }
        Ok(())
    }
}

impl std::error::Error for SyntaxError {}

/// Drop serde_yaml's trailing location text and backticks
fn clean_yaml_message(msg: &str) -> String {
    let msg = match msg.find(" at line ") {
        Some(idx) => &msg[..idx],
        None => msg,
    };
    msg.replace('`', "'")
}

fn suggest_fix(msg: &str, source: &str, line: usize) -> Option<String> {
    let error_line = source
        .lines()
        .nth(line.saturating_sub(1))
        .unwrap_or_default();

    if msg.contains("missing field `block`") {
        return Some("every entry under 'blocks' needs a 'block' name, e.g. 'block: loki.echo'".to_string());
    }
    if msg.contains("missing field `blocks`") || (msg.contains("unknown field") && line <= 1) {
        return Some("a configuration document has a single top-level 'blocks' list".to_string());
    }
    if error_line.starts_with('\t') {
        return Some("indent with spaces, YAML does not allow tabs".to_string());
    }
    if error_line.contains("${{") && !error_line.contains('\'') && !error_line.contains('"') {
        return Some("quote attribute values that contain '${{ }}' expressions".to_string());
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_syntax_error_display() {
        let err = SyntaxError::new("missing field 'block'", SyntaxErrorKind::Schema)
            .at(3, 5)
            .with_suggestion("add a block name");
        let output = err.to_string();
        assert!(output.contains("missing field 'block'"));
        assert!(output.contains("line 3:5"));
        assert!(output.contains("help: add a block name"));
    }

    #[test]
    fn test_source_context_marks_line() {
        let source = "blocks:\n  - block: export\n    label: a\n    value: 1\n";
        let err = SyntaxError::new("bad", SyntaxErrorKind::Schema)
            .at(3, 5)
            .with_source_context(source, 1);
        assert!(err.context.contains(">    3 |     label: a"));
        assert!(err.context.contains("block: export"));
        assert!(err.context.contains("value: 1"));
    }
}
