use serde_json::Value;

use tripwire_common::JsonMap;

/// Resolve `{{ var }}` placeholders. Whitespace inside the braces is optional.
///
/// Known names: `rule_name`, `event_type`, any payload field (dotted paths
/// reach into nested objects and arrays). `object.<path>` also resolves
/// against the payload, which describes the object the event is about.
/// Unknown placeholders and non-scalar values are left as-is.
pub fn render(template: &str, rule_name: &str, event_type: &str, payload: &JsonMap) -> String {
    let mut result = String::with_capacity(template.len());
    let mut chars = template.chars().peekable();

    while let Some(c) = chars.next() {
        if c == '{' && chars.peek() == Some(&'{') {
            chars.next();

            let mut var_name = String::new();
            loop {
                match chars.next() {
                    Some('}') if chars.peek() == Some(&'}') => {
                        chars.next();
                        break;
                    }
                    Some(ch) => var_name.push(ch),
                    None => {
                        // Unclosed: emit what we have
                        result.push_str("{{");
                        result.push_str(&var_name);
                        return result;
                    }
                }
            }

            let name = var_name.trim();
            let value = match name {
                "rule_name" => Some(rule_name.to_string()),
                "event_type" => Some(event_type.to_string()),
                path => lookup(payload, path)
                    .or_else(|| path.strip_prefix("object.").and_then(|p| lookup(payload, p)))
                    .and_then(scalar),
            };

            match value {
                Some(v) => result.push_str(&v),
                None => {
                    result.push_str("{{");
                    result.push_str(&var_name);
                    result.push_str("}}");
                }
            }
        } else {
            result.push(c);
        }
    }

    result
}

fn lookup<'a>(payload: &'a JsonMap, path: &str) -> Option<&'a Value> {
    let mut segments = path.split('.');
    let first = payload.get(segments.next()?)?;
    segments.try_fold(first, |node, segment| match node {
        Value::Object(map) => map.get(segment),
        Value::Array(items) => segment.parse::<usize>().ok().and_then(|i| items.get(i)),
        _ => None,
    })
}

fn scalar(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn payload() -> JsonMap {
        match json!({
            "id": "obj-42",
            "status": "active",
            "amount": 1250,
            "owner": {"name": "Ana"},
            "tags": ["a", "b"]
        }) {
            Value::Object(map) => map,
            _ => unreachable!(),
        }
    }

    #[test]
    fn resolves_context_and_payload_fields() {
        let out = render(
            "{{ rule_name }} fired on {{event_type}}: {{ status }} ({{amount}})",
            "big-deal",
            "object.created",
            &payload(),
        );
        assert_eq!(out, "big-deal fired on object.created: active (1250)");
    }

    #[test]
    fn resolves_dotted_paths_and_object_alias() {
        let out = render(
            "{{ owner.name }} owns {{ object.id }}, first tag {{ tags.0 }}",
            "r",
            "e",
            &payload(),
        );
        assert_eq!(out, "Ana owns obj-42, first tag a");
    }

    #[test]
    fn unknown_and_non_scalar_placeholders_are_left_intact() {
        let out = render("{{ missing }} / {{ owner }}", "r", "e", &payload());
        assert_eq!(out, "{{ missing }} / {{ owner }}");
    }

    #[test]
    fn unclosed_placeholder_is_emitted_verbatim() {
        assert_eq!(render("hi {{ status", "r", "e", &payload()), "hi {{ status");
    }
}
