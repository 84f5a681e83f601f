// Artifact references in command text
// Finds and substitutes `${{ artifacts.<job>.<key> }}` placeholders

use std::fmt;

const OPEN: &str = "${{";
const CLOSE: &str = "}}";
const NAMESPACE: &str = "artifacts.";

/// A reference to an artifact published by another job
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ArtifactRef {
    pub producer: String,
    pub key: String,
}

impl fmt::Display for ArtifactRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "artifacts.{}.{}", self.producer, self.key)
    }
}

/// Artifact keys and job ids share one alphabet so that both map cleanly onto
/// environment variable names
pub fn is_valid_key(key: &str) -> bool {
    !key.is_empty()
        && key
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}

/// Collect every artifact placeholder in `text`, in order of appearance.
///
/// Returns an error message for an unterminated placeholder or an expression
/// outside the `artifacts.` namespace.
pub fn references(text: &str) -> Result<Vec<ArtifactRef>, String> {
    let mut refs = Vec::new();
    for_each_placeholder(text, |reference| {
        refs.push(reference.clone());
        Ok::<_, String>(String::new())
    })?;
    Ok(refs)
}

/// Replace every placeholder in `text` with the value returned by `lookup`
pub fn interpolate<E, F>(text: &str, mut lookup: F) -> Result<String, E>
where
    E: From<String>,
    F: FnMut(&ArtifactRef) -> Result<String, E>,
{
    for_each_placeholder(text, |reference| lookup(reference))
}

fn for_each_placeholder<E, F>(text: &str, mut f: F) -> Result<String, E>
where
    E: From<String>,
    F: FnMut(&ArtifactRef) -> Result<String, E>,
{
    let mut output = String::with_capacity(text.len());
    let mut rest = text;

    while let Some(start) = rest.find(OPEN) {
        output.push_str(&rest[..start]);
        let after_open = &rest[start + OPEN.len()..];
        let end = after_open
            .find(CLOSE)
            .ok_or_else(|| E::from(format!("unterminated '{}' in '{}'", OPEN, text)))?;

        let reference = parse_reference(after_open[..end].trim()).map_err(E::from)?;
        output.push_str(&f(&reference)?);
        rest = &after_open[end + CLOSE.len()..];
    }

    output.push_str(rest);
    Ok(output)
}

fn parse_reference(expr: &str) -> Result<ArtifactRef, String> {
    let path = expr.strip_prefix(NAMESPACE).ok_or_else(|| {
        format!(
            "unsupported expression '{}' (only 'artifacts.<job>.<key>' is available)",
            expr
        )
    })?;

    match path.split_once('.') {
        Some((producer, key)) if is_valid_key(producer) && is_valid_key(key) => Ok(ArtifactRef {
            producer: producer.to_string(),
            key: key.to_string(),
        }),
        _ => Err(format!(
            "malformed artifact reference '{}' (expected 'artifacts.<job>.<key>')",
            expr
        )),
    }
}
