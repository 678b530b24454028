//! Renders a JSON value as an indented tree, one line per node.

use serde_json::Value;

const BRANCH: &str = "├── ";
const LAST: &str = "└── ";
const PIPE: &str = "│   ";
const SPACE: &str = "    ";

pub fn render_tree(value: &Value) -> Vec<String> {
    let mut lines = Vec::new();
    match value {
        Value::Object(_) | Value::Array(_) => render_children(value, "", &mut lines),
        scalar => lines.push(scalar_text(scalar)),
    }
    lines
}

/// A titled dump: `title` on the first line, then the tree.
pub fn render_dump(title: &str, value: &Value) -> String {
    std::iter::once(title.to_string())
        .chain(render_tree(value))
        .collect::<Vec<_>>()
        .join("\n")
}

fn render_children(value: &Value, prefix: &str, lines: &mut Vec<String>) {
    let children: Vec<(String, &Value)> = match value {
        Value::Object(map) => map.iter().map(|(k, v)| (k.clone(), v)).collect(),
        Value::Array(items) => items
            .iter()
            .enumerate()
            .map(|(i, v)| (format!("[{i}]"), v))
            .collect(),
        _ => return,
    };

    let count = children.len();
    for (i, (label, child)) in children.into_iter().enumerate() {
        let last = i + 1 == count;
        let connector = if last { LAST } else { BRANCH };
        match child {
            Value::Object(_) | Value::Array(_) => {
                lines.push(format!("{prefix}{connector}{label}"));
                let next = format!("{prefix}{}", if last { SPACE } else { PIPE });
                render_children(child, &next, lines);
            }
            scalar => lines.push(format!("{prefix}{connector}{label}: {}", scalar_text(scalar))),
        }
    }
}

fn scalar_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_nested_tree() {
        let lines = render_tree(&json!({
            "count": 1,
            "user": { "name": "fish", "tags": ["a", "b"] }
        }));
        assert_eq!(
            lines,
            vec![
                "├── count: 1",
                "└── user",
                "    ├── name: fish",
                "    └── tags",
                "        ├── [0]: a",
                "        └── [1]: b",
            ]
        );
    }

    #[test]
    fn test_dump_is_titled() {
        let dump = render_dump("Echo", &json!({ "count": 2, "seen": { "fish": true } }));
        assert_eq!(dump, "Echo\n├── count: 2\n└── seen\n    └── fish: true");
        assert_eq!(render_dump("Empty", &json!({})), "Empty");
    }

    #[test]
    fn test_scalar_and_empty() {
        assert_eq!(render_tree(&json!(null)), vec!["null"]);
        assert!(render_tree(&json!({})).is_empty());
    }
}
