//! `${…}` template rendering.
//!
//! Input templates are plain JSON with embedded expressions. An expression
//! is a dotted path with optional `[n]` indexing, rooted at one of `params`,
//! `steps`, `now`, or `today`. A string that consists of exactly one
//! expression splices the referenced value in with its original type;
//! expressions embedded in longer strings are stringified.

use serde_json::{Map, Value};

/// The evaluation environment a pipeline's templates are rendered against.
///
/// `now` and `today` are resolved once when the pipeline starts, so every
/// step of a run sees the same values.
pub struct Environment {
    pub params: Value,
    pub steps: Map<String, Value>,
    pub now: String,
    pub today: String,
}

#[derive(Debug, thiserror::Error)]
pub enum RenderError {
    #[error("unresolved reference ${{{0}}}")]
    Unresolved(String),

    #[error("malformed expression {0:?}")]
    Malformed(String),
}

pub fn render(template: &Value, env: &Environment) -> Result<Value, RenderError> {
    match template {
        Value::String(s) => render_string(s, env),
        Value::Array(items) => items
            .iter()
            .map(|item| render(item, env))
            .collect::<Result<Vec<_>, _>>()
            .map(Value::Array),
        Value::Object(fields) => fields
            .iter()
            .map(|(key, value)| render(value, env).map(|v| (key.clone(), v)))
            .collect::<Result<Map<_, _>, _>>()
            .map(Value::Object),
        other => Ok(other.clone()),
    }
}

fn render_string(s: &str, env: &Environment) -> Result<Value, RenderError> {
    let spans = find_expressions(s)?;
    if spans.is_empty() {
        return Ok(Value::String(s.to_string()));
    }

    // A string that is exactly one expression splices the value itself.
    if spans.len() == 1 && spans[0].0 == 0 && spans[0].1 == s.len() {
        return lookup(spans[0].2.trim(), env);
    }

    let mut out = String::with_capacity(s.len());
    let mut cursor = 0;
    for (start, end, expr) in &spans {
        out.push_str(&s[cursor..*start]);
        out.push_str(&scalar_text(&lookup(expr.trim(), env)?));
        cursor = *end;
    }
    out.push_str(&s[cursor..]);

    Ok(Value::String(out))
}

/// Locate every `${…}` span as (start, end, inner expression).
fn find_expressions(s: &str) -> Result<Vec<(usize, usize, &str)>, RenderError> {
    let mut spans = Vec::new();
    let mut cursor = 0;

    while let Some(offset) = s[cursor..].find("${") {
        let start = cursor + offset;
        let Some(close) = s[start + 2..].find('}') else {
            return Err(RenderError::Malformed(s[start..].to_string()));
        };
        let end = start + 2 + close + 1;
        spans.push((start, end, &s[start + 2..end - 1]));
        cursor = end;
    }

    Ok(spans)
}

fn scalar_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        Value::Number(n) => n.to_string(),
        Value::Bool(b) => b.to_string(),
        composite => composite.to_string(),
    }
}

enum Segment {
    Key(String),
    Index(usize),
}

fn lookup(expr: &str, env: &Environment) -> Result<Value, RenderError> {
    let segments = parse_path(expr)?;
    let mut segments = segments.iter();

    let root = match segments.next() {
        Some(Segment::Key(name)) => name.as_str(),
        _ => return Err(RenderError::Malformed(expr.to_string())),
    };

    let mut current = match root {
        "params" => env.params.clone(),
        "now" => Value::String(env.now.clone()),
        "today" => Value::String(env.today.clone()),
        "steps" => match segments.next() {
            Some(Segment::Key(step)) => match env.steps.get(step) {
                Some(value) => value.clone(),
                None => return Err(RenderError::Unresolved(expr.to_string())),
            },
            _ => return Err(RenderError::Unresolved(expr.to_string())),
        },
        _ => return Err(RenderError::Unresolved(expr.to_string())),
    };

    for segment in segments {
        let next = match segment {
            Segment::Key(key) => current.get(key.as_str()).cloned(),
            Segment::Index(index) => current.get(index).cloned(),
        };
        current = next.ok_or_else(|| RenderError::Unresolved(expr.to_string()))?;
    }

    Ok(current)
}

fn parse_path(expr: &str) -> Result<Vec<Segment>, RenderError> {
    if expr.is_empty() {
        return Err(RenderError::Malformed(expr.to_string()));
    }

    let mut segments = Vec::new();
    for part in expr.split('.') {
        let mut rest = part;
        let key_end = rest.find('[').unwrap_or(rest.len());
        let key = &rest[..key_end];
        if key.is_empty() {
            return Err(RenderError::Malformed(expr.to_string()));
        }
        segments.push(Segment::Key(key.to_string()));
        rest = &rest[key_end..];

        while let Some(stripped) = rest.strip_prefix('[') {
            let Some(close) = stripped.find(']') else {
                return Err(RenderError::Malformed(expr.to_string()));
            };
            let index: usize = stripped[..close]
                .parse()
                .map_err(|_| RenderError::Malformed(expr.to_string()))?;
            segments.push(Segment::Index(index));
            rest = &stripped[close + 1..];
        }

        if !rest.is_empty() {
            return Err(RenderError::Malformed(expr.to_string()));
        }
    }

    Ok(segments)
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn env() -> Environment {
        let mut steps = Map::new();
        steps.insert(
            "fetch".to_string(),
            json!({"output": {"items": [{"id": "a-1"}, {"id": "a-2"}]}, "count": 2}),
        );

        Environment {
            params: json!({"city": "Chisinau", "limit": 3}),
            steps,
            now: "2024-06-01T12:00:00+00:00".to_string(),
            today: "2024-06-01".to_string(),
        }
    }

    #[test]
    fn whole_string_expressions_splice_the_value() {
        let rendered = render(&json!({"n": "${params.limit}"}), &env()).unwrap();
        assert_eq!(rendered, json!({"n": 3}));

        let rendered = render(&json!("${steps.fetch.output}"), &env()).unwrap();
        assert_eq!(rendered, json!({"items": [{"id": "a-1"}, {"id": "a-2"}]}));
    }

    #[test]
    fn embedded_expressions_are_stringified() {
        let rendered = render(
            &json!("weather for ${params.city} (${params.limit} days)"),
            &env(),
        )
        .unwrap();
        assert_eq!(rendered, json!("weather for Chisinau (3 days)"));
    }

    #[test]
    fn indexed_paths_navigate_arrays() {
        let rendered = render(&json!("${steps.fetch.output.items[1].id}"), &env()).unwrap();
        assert_eq!(rendered, json!("a-2"));
    }

    #[test]
    fn now_and_today_come_from_the_environment() {
        let rendered = render(&json!({"at": "${now}", "on": "${today}"}), &env()).unwrap();
        assert_eq!(rendered, json!({"at": "2024-06-01T12:00:00+00:00", "on": "2024-06-01"}));
    }

    #[test]
    fn nested_templates_render_recursively() {
        let rendered = render(
            &json!({"query": {"city": "${params.city}", "tags": ["${today}", "fixed"]}}),
            &env(),
        )
        .unwrap();
        assert_eq!(
            rendered,
            json!({"query": {"city": "Chisinau", "tags": ["2024-06-01", "fixed"]}})
        );
    }

    #[test]
    fn unresolved_references_fail() {
        for expr in [
            "${params.country}",
            "${steps.missing.output}",
            "${steps.fetch.output.items[9].id}",
            "${nope}",
        ] {
            let err = render(&json!(expr), &env()).unwrap_err();
            assert!(matches!(err, RenderError::Unresolved(_)), "{expr}");
        }
    }

    #[test]
    fn malformed_expressions_fail() {
        for expr in ["${params.", "${}", "${a..b}", "${a[x]}", "${a[1}"] {
            let err = render(&json!(expr), &env()).unwrap_err();
            assert!(matches!(err, RenderError::Malformed(_)), "{expr}");
        }
    }

    #[test]
    fn plain_strings_pass_through() {
        let template = json!({"msg": "no substitution here", "n": 7, "flag": true});
        assert_eq!(render(&template, &env()).unwrap(), template);
    }
}
