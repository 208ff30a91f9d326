//! Condition evaluators used by the edge selector's step 1.
//!
//! Two evaluators are provided behind the same [`ConditionEvaluator`] trait:
//!
//! - [`StubConditionEvaluator`] — the default wired into the runner. Matches
//!   exactly the three literal forms the engine contract guarantees:
//!   `true`/`false`, `outcome = <status>`, and `$key = <value>` (with a
//!   bare-key fallback). Anything else evaluates to `false`, never raising.
//! - [`RichConditionEvaluator`] — an opt-in `&&`/`!=` expression grammar kept
//!   around for DOT authors who want it. A strict syntactic superset of the
//!   stub's `=` form.

use attractor_types::{EngineError, Outcome};
use serde_json::Value;
use std::collections::HashMap;

/// Strategy for step 1 of edge selection: does this edge's condition string
/// hold, given the context snapshot and the handler's outcome?
pub trait ConditionEvaluator: Send + Sync {
    fn evaluate(&self, condition: &str, context: &HashMap<String, Value>, outcome: &Outcome) -> bool;
}

fn json_to_compare_string(v: &Value) -> String {
    match v {
        Value::String(s) => s.to_ascii_lowercase(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => n.to_string(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

/// The engine's default evaluator: three recognized forms, everything else
/// is false.
#[derive(Debug, Default, Clone, Copy)]
pub struct StubConditionEvaluator;

impl ConditionEvaluator for StubConditionEvaluator {
    fn evaluate(&self, condition: &str, context: &HashMap<String, Value>, outcome: &Outcome) -> bool {
        let trimmed = condition.trim();
        if trimmed.is_empty() {
            return false;
        }

        let lowered = trimmed.to_ascii_lowercase();
        if lowered == "true" {
            return true;
        }
        if lowered == "false" {
            return false;
        }

        let Some(eq_pos) = trimmed.find('=') else {
            return false;
        };
        let lhs = trimmed[..eq_pos].trim();
        let rhs = trimmed[eq_pos + 1..].trim().trim_matches(['"', '\'']).to_ascii_lowercase();

        if lhs.eq_ignore_ascii_case("outcome") {
            return outcome.status.as_wire_str() == rhs;
        }

        if let Some(key) = lhs.strip_prefix('$') {
            let resolved = context
                .get(lhs)
                .or_else(|| context.get(key))
                .map(json_to_compare_string);
            return resolved.map(|v| v == rhs).unwrap_or(false);
        }

        false
    }
}

// ---------------------------------------------------------------------------
// Rich opt-in grammar
// ---------------------------------------------------------------------------

/// Grammar:
/// ```text
/// ConditionExpr  ::= Clause ( '&&' Clause )*
/// Clause         ::= Key Operator Literal
/// Key            ::= identifier ( '.' identifier )*
/// Operator       ::= '=' | '!='
/// Literal        ::= QuotedString | BareWord | Integer | Boolean
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct ConditionExpr {
    pub clauses: Vec<Clause>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Clause {
    pub key: String,
    pub operator: Operator,
    pub value: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operator {
    Eq,
    NotEq,
}

/// Parse a condition string into a [`ConditionExpr`]. An empty or
/// whitespace-only input produces zero clauses, which [`evaluate_condition`]
/// treats as always true.
pub fn parse_condition(input: &str) -> Result<ConditionExpr, EngineError> {
    let trimmed = input.trim();
    if trimmed.is_empty() {
        return Ok(ConditionExpr { clauses: Vec::new() });
    }

    let mut clauses = Vec::new();
    for part in trimmed.split("&&") {
        clauses.push(parse_clause(part.trim())?);
    }
    Ok(ConditionExpr { clauses })
}

fn parse_clause(input: &str) -> Result<Clause, EngineError> {
    let input = input.trim();
    if input.is_empty() {
        return Err(make_error("empty clause"));
    }

    let (key_end, operator, op_len) = find_operator(input)?;

    let key = input[..key_end].trim().to_string();
    if key.is_empty() {
        return Err(make_error("missing key before operator"));
    }
    for seg in key.split('.') {
        if seg.is_empty() || !seg.chars().all(|c| c.is_alphanumeric() || c == '_') {
            return Err(make_error(&format!("invalid key segment: '{seg}'")));
        }
    }

    let raw_value = input[key_end + op_len..].trim();
    if raw_value.is_empty() {
        return Err(make_error(&format!("missing value after operator in '{input}'")));
    }

    Ok(Clause {
        key,
        operator,
        value: strip_quotes(raw_value),
    })
}

fn find_operator(input: &str) -> Result<(usize, Operator, usize), EngineError> {
    let bytes = input.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'"' | b'\'' => {
                let quote = bytes[i];
                i += 1;
                while i < bytes.len() && bytes[i] != quote {
                    i += 1;
                }
                i += 1;
            }
            b'!' if i + 1 < bytes.len() && bytes[i + 1] == b'=' => {
                return Ok((i, Operator::NotEq, 2));
            }
            b'=' => {
                return Ok((i, Operator::Eq, 1));
            }
            _ => i += 1,
        }
    }
    Err(make_error(&format!("no operator found in '{input}'")))
}

fn strip_quotes(s: &str) -> String {
    if s.len() >= 2 {
        let bytes = s.as_bytes();
        if (bytes[0] == b'"' && bytes[bytes.len() - 1] == b'"')
            || (bytes[0] == b'\'' && bytes[bytes.len() - 1] == b'\'')
        {
            return s[1..s.len() - 1].to_string();
        }
    }
    s.to_string()
}

fn make_error(msg: &str) -> EngineError {
    EngineError::Validation(format!("condition parse error: {msg}"))
}

/// Evaluate a parsed expression against values from `resolve`. Missing keys
/// resolve to an empty string. Zero clauses (empty input) is always true.
pub fn evaluate_condition(expr: &ConditionExpr, resolve: &dyn Fn(&str) -> String) -> bool {
    if expr.clauses.is_empty() {
        return true;
    }
    expr.clauses.iter().all(|clause| {
        let actual = resolve(&clause.key);
        match clause.operator {
            Operator::Eq => actual == clause.value,
            Operator::NotEq => actual != clause.value,
        }
    })
}

/// Opt-in evaluator exposing the `&&`/`!=` grammar to the edge selector.
/// `outcome`, `preferred_label`, and `context.<key>` are the recognized
/// resolver keys; a bare key is looked up directly in the context snapshot.
#[derive(Debug, Default, Clone, Copy)]
pub struct RichConditionEvaluator;

impl ConditionEvaluator for RichConditionEvaluator {
    fn evaluate(&self, condition: &str, context: &HashMap<String, Value>, outcome: &Outcome) -> bool {
        let expr = match parse_condition(condition) {
            Ok(e) => e,
            Err(_) => return false,
        };
        evaluate_condition(&expr, &|key: &str| -> String {
            if key == "outcome" {
                return outcome.status.as_wire_str().to_string();
            }
            if key == "preferred_label" {
                return outcome.preferred_label.clone().unwrap_or_default();
            }
            let lookup_key = key.strip_prefix("context.").unwrap_or(key);
            context
                .get(lookup_key)
                .map(|v| match v {
                    Value::String(s) => s.clone(),
                    other => json_to_compare_string(other),
                })
                .unwrap_or_default()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use attractor_types::OutcomeStatus;

    fn outcome(status: OutcomeStatus) -> Outcome {
        match status {
            OutcomeStatus::Success => Outcome::success(),
            OutcomeStatus::Failure => Outcome::failure(),
            OutcomeStatus::PartialSuccess => Outcome::partial_success(),
            OutcomeStatus::Waiting => Outcome::waiting(),
            OutcomeStatus::Skipped => Outcome::skipped(),
        }
    }

    #[test]
    fn stub_recognizes_literal_booleans() {
        let eval = StubConditionEvaluator;
        let ctx = HashMap::new();
        assert!(eval.evaluate("true", &ctx, &outcome(OutcomeStatus::Success)));
        assert!(!eval.evaluate("false", &ctx, &outcome(OutcomeStatus::Success)));
        assert!(eval.evaluate(" TRUE ", &ctx, &outcome(OutcomeStatus::Success)));
    }

    #[test]
    fn stub_recognizes_outcome_equality() {
        let eval = StubConditionEvaluator;
        let ctx = HashMap::new();
        assert!(eval.evaluate("outcome = success", &ctx, &outcome(OutcomeStatus::Success)));
        assert!(!eval.evaluate("outcome = success", &ctx, &outcome(OutcomeStatus::Failure)));
        assert!(eval.evaluate("outcome = failure", &ctx, &outcome(OutcomeStatus::Failure)));
    }

    #[test]
    fn stub_recognizes_dollar_key_with_bare_fallback() {
        let eval = StubConditionEvaluator;
        let mut ctx = HashMap::new();
        ctx.insert("env".to_string(), Value::String("prod".to_string()));
        assert!(eval.evaluate("$env = prod", &ctx, &outcome(OutcomeStatus::Success)));

        let mut ctx2 = HashMap::new();
        ctx2.insert("$env".to_string(), Value::String("staging".to_string()));
        assert!(eval.evaluate("$env = staging", &ctx2, &outcome(OutcomeStatus::Success)));
    }

    #[test]
    fn stub_unrecognized_form_is_false_not_error() {
        let eval = StubConditionEvaluator;
        let ctx = HashMap::new();
        assert!(!eval.evaluate("bare_identifier = value", &ctx, &outcome(OutcomeStatus::Success)));
        assert!(!eval.evaluate("garbage", &ctx, &outcome(OutcomeStatus::Success)));
    }

    #[test]
    fn rich_simple_equality() {
        let expr = parse_condition("outcome=success").unwrap();
        assert_eq!(expr.clauses.len(), 1);
        assert_eq!(expr.clauses[0].key, "outcome");
        assert_eq!(expr.clauses[0].operator, Operator::Eq);

        let resolve = |k: &str| if k == "outcome" { "success".to_string() } else { String::new() };
        assert!(evaluate_condition(&expr, &resolve));
    }

    #[test]
    fn rich_compound_and_not_equal() {
        let expr = parse_condition("outcome=success && context.tests_passed!=false").unwrap();
        assert_eq!(expr.clauses.len(), 2);
        let resolve = |k: &str| match k {
            "outcome" => "success".to_string(),
            "context.tests_passed" => "true".to_string(),
            _ => String::new(),
        };
        assert!(evaluate_condition(&expr, &resolve));
    }

    #[test]
    fn rich_empty_condition_always_true() {
        let expr = parse_condition("").unwrap();
        assert!(expr.clauses.is_empty());
        assert!(evaluate_condition(&expr, &|_| String::new()));
    }

    #[test]
    fn rich_quoted_values() {
        let expr = parse_condition(r#"outcome="success""#).unwrap();
        assert_eq!(expr.clauses[0].value, "success");
    }

    #[test]
    fn rich_invalid_syntax_errors() {
        assert!(parse_condition("outcome").is_err());
        assert!(parse_condition("outcome=success && ").is_err());
        assert!(parse_condition("=value").is_err());
    }

    #[test]
    fn rich_evaluator_reads_context_and_outcome() {
        let eval = RichConditionEvaluator;
        let mut ctx = HashMap::new();
        ctx.insert("tests_passed".to_string(), Value::String("true".to_string()));
        let o = Outcome::success().with_preferred_label("ship");
        assert!(eval.evaluate("outcome=success && preferred_label=ship", &ctx, &o));
        assert!(eval.evaluate("context.tests_passed=true", &ctx, &o));
    }
}
