//! Best-effort parsing of planner completions into action proposals.
//!
//! Model output carries no well-formedness guarantee, so parsing never fails
//! loudly: it returns a tagged [`ParseOutcome`] that routing treats like any
//! other soft failure.

use serde_json::{Map, Value};

use crate::core::types::ActionProposal;

#[derive(Debug, Clone, PartialEq)]
pub enum ParseOutcome {
    Proposal(ActionProposal),
    Invalid { reason: String },
}

impl ParseOutcome {
    fn invalid(reason: impl Into<String>) -> Self {
        ParseOutcome::Invalid {
            reason: reason.into(),
        }
    }
}

/// Parse a completion as `{tool, arguments, target, rationale}`.
///
/// Accepts the object bare, inside a fenced code block, or embedded in prose
/// (the first balanced JSON object wins). `tool_name` is accepted as an alias
/// for `tool`.
pub fn parse_proposal(completion: &str) -> ParseOutcome {
    let Some(value) = extract_json_object(completion) else {
        return ParseOutcome::invalid("no JSON object found in planner output");
    };
    let Value::Object(object) = value else {
        return ParseOutcome::invalid("planner output is not a JSON object");
    };
    proposal_from_object(object)
}

fn proposal_from_object(mut object: Map<String, Value>) -> ParseOutcome {
    let tool = match object.remove("tool").or_else(|| object.remove("tool_name")) {
        Some(Value::String(tool)) if !tool.trim().is_empty() => tool.trim().to_string(),
        Some(Value::String(_)) => return ParseOutcome::invalid("'tool' must not be empty"),
        Some(_) => return ParseOutcome::invalid("'tool' must be a string"),
        None => return ParseOutcome::invalid("missing 'tool'"),
    };

    let arguments = match object.remove("arguments") {
        None | Some(Value::Null) => Map::new(),
        Some(Value::Object(arguments)) => arguments,
        Some(_) => return ParseOutcome::invalid("'arguments' must be an object"),
    };

    let target = match object.remove("target") {
        None | Some(Value::Null) => None,
        Some(Value::String(target)) => Some(target),
        Some(_) => return ParseOutcome::invalid("'target' must be a string"),
    };

    let rationale = match object.remove("rationale") {
        Some(Value::String(rationale)) => rationale,
        Some(Value::Null) | None => String::new(),
        Some(other) => other.to_string(),
    };

    ParseOutcome::Proposal(ActionProposal {
        tool,
        arguments,
        target,
        rationale,
    })
}

fn extract_json_object(text: &str) -> Option<Value> {
    let trimmed = text.trim();
    if let Ok(value) = serde_json::from_str::<Value>(trimmed) {
        return Some(value);
    }
    let mut search = trimmed;
    while let Some(start) = search.find('{') {
        let candidate = &search[start..];
        if let Some(end) = balanced_object_end(candidate)
            && let Ok(value) = serde_json::from_str::<Value>(&candidate[..end])
        {
            return Some(value);
        }
        search = &candidate[1..];
    }
    None
}

/// Byte length of the balanced `{...}` prefix of `text`, honoring JSON strings.
fn balanced_object_end(text: &str) -> Option<usize> {
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;
    for (i, c) in text.char_indices() {
        if in_string {
            match c {
                _ if escaped => escaped = false,
                '\\' => escaped = true,
                '"' => in_string = false,
                _ => {}
            }
            continue;
        }
        match c {
            '"' => in_string = true,
            '{' => depth += 1,
            '}' => {
                depth = depth.checked_sub(1)?;
                if depth == 0 {
                    return Some(i + 1);
                }
            }
            _ => {}
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn expect_proposal(outcome: ParseOutcome) -> ActionProposal {
        match outcome {
            ParseOutcome::Proposal(p) => p,
            ParseOutcome::Invalid { reason } => panic!("expected proposal, got: {reason}"),
        }
    }

    #[test]
    fn parses_bare_object() {
        let p = expect_proposal(parse_proposal(
            r#"{"tool":"list_dir","arguments":{"path":"/tmp"},"target":"web-1","rationale":"look"}"#,
        ));
        assert_eq!(p.tool, "list_dir");
        assert_eq!(p.arguments.get("path"), Some(&json!("/tmp")));
        assert_eq!(p.target.as_deref(), Some("web-1"));
        assert_eq!(p.rationale, "look");
    }

    #[test]
    fn parses_fenced_block_with_prose() {
        let text = "Sure! Here is the action:\n```json\n{\"tool_name\": \"finish\", \"arguments\": {\"status\": \"success\", \"reason\": \"a } in text\"}}\n```\nDone.";
        let p = expect_proposal(parse_proposal(text));
        assert_eq!(p.tool, "finish");
        assert_eq!(p.arguments.get("reason"), Some(&json!("a } in text")));
    }

    #[test]
    fn missing_arguments_default_to_empty() {
        let p = expect_proposal(parse_proposal(r#"{"tool":"uptime"}"#));
        assert!(p.arguments.is_empty());
        assert!(p.target.is_none());
    }

    #[test]
    fn rejects_unparseable_text() {
        assert!(matches!(
            parse_proposal("I think we should list the files."),
            ParseOutcome::Invalid { .. }
        ));
    }

    #[test]
    fn rejects_wrong_shapes() {
        assert!(matches!(
            parse_proposal(r#"{"arguments":{}}"#),
            ParseOutcome::Invalid { .. }
        ));
        assert!(matches!(
            parse_proposal(r#"{"tool":"x","arguments":[1,2]}"#),
            ParseOutcome::Invalid { .. }
        ));
        assert!(matches!(parse_proposal("[1, 2]"), ParseOutcome::Invalid { .. }));
        assert!(matches!(
            parse_proposal(r#"{"tool":"  "}"#),
            ParseOutcome::Invalid { .. }
        ));
    }

    #[test]
    fn skips_unbalanced_prefix() {
        let p = expect_proposal(parse_proposal(r#"oops { not json {"tool":"a"}"#));
        assert_eq!(p.tool, "a");
    }
}
