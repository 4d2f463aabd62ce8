use regex::Regex;
use serde_json::{Map, Value};

/// Resolve a dot-separated path against a nested context value.
///
/// A segment addresses a map key literally, or an index when the current
/// value is a list. Any miss (unknown key, out-of-range index, traversal
/// into a scalar, empty segment) yields `None`; resolution never fails
/// louder than that.
pub fn resolve<'a>(root: &'a Value, path: &str) -> Option<&'a Value> {
    let mut current = root;
    for segment in path.split('.') {
        if segment.is_empty() {
            return None;
        }
        current = match current {
            Value::Object(map) => map.get(segment)?,
            Value::Array(items) => items.get(segment.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }
    Some(current)
}

/// Short type name for diagnostics. Operators grep these out of flow logs
/// during incidents, so the names stay terse and fixed: "bool", "int",
/// "float", "string", "list", "map", "null". An absent value reports "null".
pub fn type_name(value: Option<&Value>) -> &'static str {
    match value {
        None | Some(Value::Null) => "null",
        Some(Value::Bool(_)) => "bool",
        Some(Value::Number(n)) => {
            if n.is_f64() {
                "float"
            } else {
                "int"
            }
        }
        Some(Value::String(_)) => "string",
        Some(Value::Array(_)) => "list",
        Some(Value::Object(_)) => "map",
    }
}

/// Render a resolved value into template output. Strings are bare, null is
/// empty, lists and maps render as compact JSON.
pub fn display_value(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(text) => text.clone(),
        Value::Bool(flag) => flag.to_string(),
        Value::Number(number) => number.to_string(),
        other => serde_json::to_string(other).unwrap_or_default(),
    }
}

/// Replace `{{ path }}` expressions in a template with values resolved
/// against the context. Unresolved expressions render as the empty string;
/// everything outside the markers passes through untouched.
pub fn render(template: &str, root: &Value) -> String {
    let Ok(re) = Regex::new(r"\{\{\s*([A-Za-z0-9_][A-Za-z0-9_.]*)\s*\}\}") else {
        return template.to_string();
    };
    re.replace_all(template, |caps: &regex::Captures| {
        let path = &caps[1];
        let resolved = resolve(root, path);
        if resolved.is_none() || matches!(resolved, Some(Value::Null)) {
            tracing::debug!(path, kind = type_name(resolved), "template expression resolved empty");
        }
        resolved.map(display_value).unwrap_or_default()
    })
    .to_string()
}

/// Write a value at a dotted path, creating intermediate objects as needed.
/// Existing values along the path are overwritten, never removed.
pub fn set_path(root: &mut Value, path: &str, value: Value) {
    let segments = path.split('.').filter(|s| !s.is_empty()).collect::<Vec<_>>();
    let Some((last, parents)) = segments.split_last() else {
        return;
    };
    if !root.is_object() {
        *root = Value::Object(Map::new());
    }
    let mut current = root;
    for segment in parents {
        let Some(map) = current.as_object_mut() else {
            return;
        };
        let entry = map
            .entry((*segment).to_string())
            .or_insert_with(|| Value::Object(Map::new()));
        if !entry.is_object() {
            *entry = Value::Object(Map::new());
        }
        current = entry;
    }
    if let Some(map) = current.as_object_mut() {
        map.insert((*last).to_string(), value);
    }
}
