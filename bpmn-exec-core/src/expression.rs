//! Job type resolution.
//!
//! The engine treats expression evaluation as a collaborator behind
//! [`ExpressionResolver`]. [`SimpleExpressionResolver`] covers what job
//! types need: variable paths, quoted string literals, and `+`
//! concatenation of the two.

use crate::definition::JobTypeSpec;
use crate::types::VariableDocument;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Structured evaluation failure. Becomes an incident message.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct EvaluationError {
    pub message: String,
    pub warnings: Vec<String>,
}

impl std::fmt::Display for EvaluationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)?;
        if !self.warnings.is_empty() {
            write!(
                f,
                " The evaluation reported the following warnings:\n{}",
                self.warnings.join("\n")
            )?;
        }
        Ok(())
    }
}

impl std::error::Error for EvaluationError {}

pub trait ExpressionResolver: Send + Sync {
    /// Resolve a job type against the variables visible from the element.
    fn resolve(&self, spec: &JobTypeSpec, scope: &VariableDocument)
        -> Result<String, EvaluationError>;
}

#[derive(Clone, Copy, Debug, Default)]
pub struct SimpleExpressionResolver;

impl ExpressionResolver for SimpleExpressionResolver {
    fn resolve(
        &self,
        spec: &JobTypeSpec,
        scope: &VariableDocument,
    ) -> Result<String, EvaluationError> {
        let expr = match spec {
            JobTypeSpec::Literal(literal) => return Ok(literal.clone()),
            JobTypeSpec::Expression(expr) => expr,
        };

        let mut warnings = Vec::new();
        let mut out = String::new();
        for term in split_terms(expr)? {
            match evaluate_term(term, scope, &mut warnings)? {
                Value::String(s) => out.push_str(&s),
                other => {
                    return Err(EvaluationError {
                        message: format!(
                            "Expected result of the expression '{expr}' to be 'STRING', but was '{}'.",
                            value_kind(&other)
                        ),
                        warnings,
                    })
                }
            }
        }

        if out.is_empty() {
            return Err(EvaluationError {
                message: format!(
                    "Expected result of the expression '{expr}' to be a non-empty 'STRING'."
                ),
                warnings,
            });
        }
        Ok(out)
    }
}

fn syntax_error(expr: &str, detail: &str) -> EvaluationError {
    EvaluationError {
        message: format!("Failed to parse expression '{expr}': {detail}"),
        warnings: Vec::new(),
    }
}

/// Split on `+` outside of string literals.
fn split_terms(expr: &str) -> Result<Vec<&str>, EvaluationError> {
    let mut terms = Vec::new();
    let mut quote: Option<char> = None;
    let mut start = 0;
    for (i, c) in expr.char_indices() {
        match (quote, c) {
            (None, '"' | '\'') => quote = Some(c),
            (Some(q), c) if c == q => quote = None,
            (None, '+') => {
                terms.push(expr[start..i].trim());
                start = i + 1;
            }
            _ => {}
        }
    }
    if quote.is_some() {
        return Err(syntax_error(expr, "unterminated string literal"));
    }
    terms.push(expr[start..].trim());
    if terms.iter().any(|t| t.is_empty()) {
        return Err(syntax_error(expr, "empty operand"));
    }
    Ok(terms)
}

fn evaluate_term(
    term: &str,
    scope: &VariableDocument,
    warnings: &mut Vec<String>,
) -> Result<Value, EvaluationError> {
    let quoted = |q: char| term.len() >= 2 && term.starts_with(q) && term.ends_with(q);
    if quoted('"') || quoted('\'') {
        return Ok(Value::String(term[1..term.len() - 1].to_string()));
    }

    let segments: Vec<&str> = term.split('.').collect();
    if !segments.iter().all(|s| is_identifier(s)) {
        return Err(syntax_error(term, "expected a variable name or string literal"));
    }

    let Some(mut value) = scope.get(segments[0]) else {
        warnings.push(format!(
            "[NO_VARIABLE_FOUND] No variable found with name '{}'",
            segments[0]
        ));
        return Ok(Value::Null);
    };
    for segment in &segments[1..] {
        match value.get(segment) {
            Some(inner) => value = inner,
            None => {
                warnings.push(format!(
                    "[NO_CONTEXT_ENTRY_FOUND] No context entry found with key '{segment}'"
                ));
                return Ok(Value::Null);
            }
        }
    }
    Ok(value.clone())
}

fn is_identifier(s: &str) -> bool {
    let mut chars = s.chars();
    matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// Type name used in evaluation messages.
pub fn value_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "NULL",
        Value::Bool(_) => "BOOLEAN",
        Value::Number(_) => "NUMBER",
        Value::String(_) => "STRING",
        Value::Array(_) => "LIST",
        Value::Object(_) => "CONTEXT",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn scope() -> VariableDocument {
        json!({
            "listenerType": "audit",
            "count": 3,
            "order": {"region": "eu"}
        })
        .as_object()
        .cloned()
        .unwrap()
    }

    fn resolve(raw: &str) -> Result<String, EvaluationError> {
        SimpleExpressionResolver.resolve(&JobTypeSpec::parse(raw), &scope())
    }

    #[test]
    fn literal_passes_through() {
        assert_eq!(resolve("payment").unwrap(), "payment");
    }

    #[test]
    fn variable_and_path_lookup() {
        assert_eq!(resolve("=listenerType").unwrap(), "audit");
        assert_eq!(resolve("= order.region").unwrap(), "eu");
    }

    #[test]
    fn concatenation() {
        assert_eq!(
            resolve(r#"= "worker-" + order.region + '-v1'"#).unwrap(),
            "worker-eu-v1"
        );
        assert_eq!(resolve(r#"= "a+b""#).unwrap(), "a+b");
    }

    #[test]
    fn missing_variable_reports_warning() {
        let err = resolve("=absent").unwrap_err();
        assert_eq!(
            err.message,
            "Expected result of the expression 'absent' to be 'STRING', but was 'NULL'."
        );
        assert_eq!(
            err.warnings,
            vec!["[NO_VARIABLE_FOUND] No variable found with name 'absent'".to_string()]
        );
        assert!(err.to_string().contains("following warnings"));
    }

    #[test]
    fn type_mismatch() {
        let err = resolve("=count").unwrap_err();
        assert!(err.message.ends_with("but was 'NUMBER'."));
        assert!(err.warnings.is_empty());
    }

    #[test]
    fn syntax_errors() {
        assert!(resolve(r#"= "open"#).is_err());
        assert!(resolve("= a + ").is_err());
        assert!(resolve("= 9lives").is_err());
        assert!(resolve(r#"= """#).is_err());
    }
}
