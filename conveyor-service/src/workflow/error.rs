// Workflow parse errors
// Location, offending field, source excerpt and a fix hint for malformed documents

use std::fmt;

/// Parse error for a workflow document
#[derive(Debug, Clone)]
pub struct ParseError {
    /// Error message
    pub message: String,
    /// Dotted path of the offending field (e.g. `jobs.build.requires`)
    pub field: Option<String>,
    /// Line number (1-indexed, 0 when unknown)
    pub line: usize,
    /// Column number (1-indexed, 0 when unknown)
    pub column: usize,
    /// Source excerpt around the error
    pub context: String,
    /// Optional suggestion for fixing the error
    pub suggestion: Option<String>,
}

impl ParseError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            field: None,
            line: 0,
            column: 0,
            context: String::new(),
            suggestion: None,
        }
    }

    pub fn at(mut self, line: usize, column: usize) -> Self {
        self.line = line;
        self.column = column;
        self
    }

    pub fn with_field(mut self, field: impl Into<String>) -> Self {
        self.field = Some(field.into());
        self
    }

    pub fn with_suggestion(mut self, suggestion: impl Into<String>) -> Self {
        self.suggestion = Some(suggestion.into());
        self
    }

    /// Attach the source lines surrounding `self.line`
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
            let prefix = if line_num == self.line { ">" } else { " " };
            context.push_str(&format!("{} {:4} | {}\n", prefix, line_num, line));

            if line_num == self.line && self.column > 0 {
                let indicator = " ".repeat(self.column - 1) + "^";
                context.push_str(&format!("       | {}\n", indicator));
            }
        }

        self.context = context;
        self
    }

    /// Build from a serde_yaml error, keeping the field path it reports
    pub fn from_yaml_error(err: &serde_yaml::Error, source: &str) -> Self {
        let (line, column) = err
            .location()
            .map(|loc| (loc.line(), loc.column()))
            .unwrap_or((0, 0));

        let raw = err.to_string();
        let (field, detail) = split_field_path(&raw);
        let message = format_yaml_error_message(detail);

        let mut parsed = ParseError::new(message).at(line, column);
        if let Some(field) = field {
            parsed = parsed.with_field(field);
        }
        if let Some(suggestion) = suggest_fix(detail, source, line) {
            parsed = parsed.with_suggestion(suggestion);
        }
        parsed.with_source_context(source, 2)
    }
}

impl fmt::Display for ParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.field {
            Some(field) => writeln!(f, "error: {}: {}", field, self.message)?,
            None => writeln!(f, "error: {}", self.message)?,
        }
        if self.line > 0 {
            writeln!(f, "  --> line {}:{}", self.line, self.column)?;
        }

        if !self.context.is_empty() {
            writeln!(f)?;
            write!(f, "{}", self.context)?;
        }

        if let Some(suggestion) = &self.suggestion {
            writeln!(f)?;
            writeln!(f, "help: {}", suggestion)?;
        }

        Ok(())
    }
}

impl std::error::Error for ParseError {}

/// serde_yaml prefixes nested errors with the path, e.g. `jobs.build: unknown field ...`
fn split_field_path(msg: &str) -> (Option<String>, &str) {
    if let Some((path, rest)) = msg.split_once(": ") {
        let looks_like_path = !path.is_empty()
            && !path.contains(' ')
            && path
                .chars()
                .all(|c| c.is_alphanumeric() || matches!(c, '.' | '_' | '-' | '[' | ']'));
        if looks_like_path {
            return (Some(path.to_string()), rest);
        }
    }
    (None, msg)
}

fn format_yaml_error_message(msg: &str) -> String {
    let msg = strip_location(msg);

    if let Some(field) = extract_between(msg, "missing field `", "`") {
        return format!("missing required field '{}'", field);
    }

    if let Some(field) = extract_between(msg, "unknown field `", "`") {
        if let Some(expected) = extract_expected_fields(msg) {
            return format!(
                "unknown field '{}', expected one of: {}",
                field,
                expected.join(", ")
            );
        }
        return format!("unknown field '{}'", field);
    }

    if msg.starts_with("invalid type") {
        if let (Some(found), Some(expected)) = (
            extract_between(msg, "invalid type: ", ", expected"),
            msg.split_once(", expected ").map(|(_, e)| e.to_string()),
        ) {
            return format!("expected {}, but found {}", expected, found);
        }
    }

    msg.to_string()
}

fn strip_location(msg: &str) -> &str {
    match msg.rfind(" at line ") {
        Some(idx) => &msg[..idx],
        None => msg,
    }
}

fn extract_between(msg: &str, prefix: &str, suffix: &str) -> Option<String> {
    let start = msg.find(prefix)? + prefix.len();
    let end = msg[start..].find(suffix)? + start;
    Some(msg[start..end].to_string())
}

fn extract_expected_fields(msg: &str) -> Option<Vec<String>> {
    let start = msg.find("expected one of ")? + "expected one of ".len();
    let fields = msg[start..]
        .split(", ")
        .map(|s| s.trim().trim_matches('`').to_string())
        .filter(|s| !s.is_empty())
        .collect();
    Some(fields)
}

/// Hints for the mistakes people make when writing a workflow by hand
fn suggest_fix(msg: &str, source: &str, line: usize) -> Option<String> {
    let error_line = source
        .lines()
        .nth(line.saturating_sub(1))
        .unwrap_or_default();

    if msg.contains("missing field `jobs`") {
        return Some("a workflow needs a top-level 'jobs:' mapping".to_string());
    }

    if msg.contains("missing field `commands`") {
        return Some("each job needs a 'commands:' list describing what it runs".to_string());
    }

    if error_line.starts_with('\t') {
        return Some("YAML does not allow tabs for indentation. Use spaces.".to_string());
    }

    let typos = [
        ("command", "commands"),
        ("require", "requires"),
        ("needs", "requires"),
        ("depends_on", "requires"),
        ("steps", "commands"),
        ("timeout", "timeout_seconds"),
        ("retries", "retry"),
        ("workdir", "working_directory"),
        ("secret", "secrets"),
    ];

    if let Some(field) = extract_between(msg, "unknown field `", "`") {
        for (typo, correct) in typos {
            if field == typo {
                return Some(format!("did you mean '{}'?", correct));
            }
        }
    }

    None
}
