// Template interpolation: the `{{a.b.c}}` runtime expression language
//
// A placeholder names a dotted path into a JSON tree. Missing paths stay
// literal, which keeps the error domain narrow: a typo shows up verbatim in
// the rendered output instead of failing the node. Each substituted value
// is capped to keep a runaway upstream output from exploding a prompt.

use std::sync::OnceLock;

use regex::Regex;
use serde_json::Value;

/// Cap on one substituted value's rendered length
const MAX_EXPANSION_LEN: usize = 8_192;

fn placeholder_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\{\{\s*([A-Za-z0-9_$.\-]+)\s*\}\}").expect("valid regex"))
}

/// Interpolate every `{{path}}` placeholder against `data`
pub fn interpolate(template: &str, data: &Value) -> String {
    placeholder_re()
        .replace_all(template, |caps: &regex::Captures<'_>| {
            match lookup_path(data, &caps[1]) {
                Some(value) => render_value(value),
                // Missing paths stay literal
                None => caps[0].to_string(),
            }
        })
        .into_owned()
}

/// Walk a dotted path through objects. Returns None as soon as a segment
/// is missing so the caller can keep the placeholder literal.
pub fn lookup_path<'a>(data: &'a Value, path: &str) -> Option<&'a Value> {
    let mut current = data;
    for segment in path.split('.') {
        current = current.as_object()?.get(segment)?;
    }
    Some(current)
}

/// Render a JSON value for embedding in a string. Strings render bare;
/// everything else renders as compact JSON.
fn render_value(value: &Value) -> String {
    let rendered = match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    };
    if rendered.len() > MAX_EXPANSION_LEN {
        let mut end = MAX_EXPANSION_LEN;
        while !rendered.is_char_boundary(end) {
            end -= 1;
        }
        rendered[..end].to_string()
    } else {
        rendered
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn substitutes_dotted_paths() {
        let data = json!({"user": {"name": "Ada", "id": 7}});
        assert_eq!(
            interpolate("Hello {{user.name}} ({{user.id}})", &data),
            "Hello Ada (7)"
        );
    }

    #[test]
    fn missing_paths_stay_literal() {
        let data = json!({"a": 1});
        assert_eq!(interpolate("{{a}} and {{b.c}}", &data), "1 and {{b.c}}");
    }

    #[test]
    fn whitespace_inside_braces_is_tolerated() {
        let data = json!({"x": "y"});
        assert_eq!(interpolate("{{ x }}", &data), "y");
    }

    #[test]
    fn non_string_values_render_as_json() {
        let data = json!({"obj": {"k": [1, 2]}, "flag": true});
        assert_eq!(
            interpolate("{{obj}} {{flag}}", &data),
            r#"{"k":[1,2]} true"#
        );
    }

    #[test]
    fn traversal_through_non_object_stays_literal() {
        let data = json!({"a": "scalar"});
        assert_eq!(interpolate("{{a.b}}", &data), "{{a.b}}");
    }

    #[test]
    fn long_expansions_are_capped() {
        let data = json!({"blob": "z".repeat(MAX_EXPANSION_LEN * 2)});
        let out = interpolate("{{blob}}", &data);
        assert_eq!(out.len(), MAX_EXPANSION_LEN);
    }

    #[test]
    fn template_without_placeholders_is_unchanged() {
        assert_eq!(interpolate("plain text", &json!({})), "plain text");
    }
}
