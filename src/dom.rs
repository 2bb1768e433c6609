use std::collections::BTreeSet;

use serde_json::Value;

use crate::types::{NodeState, SemanticNode};

/// Roles the agent is allowed to act on.
pub const INTERACTIVE_ROLES: [&str; 9] = [
    "button",
    "combobox",
    "listbox",
    "link",
    "menuitem",
    "textbox",
    "checkbox",
    "searchbox",
    "radio",
];

/// Normalize a raw `Accessibility.getFullAXTree` result.
///
/// Accepts either the CDP response object (`{"nodes": [...]}`) or the bare
/// node array. Nodes flagged `ignored`, nodes without a role and nodes whose
/// name, value and description are all blank are dropped. Surviving nodes keep
/// their index in the input as `id`, so ids have gaps.
pub fn normalize(tree: &Value) -> impl Iterator<Item = SemanticNode> + '_ {
    let nodes = match tree {
        Value::Array(nodes) => nodes.as_slice(),
        other => other
            .get("nodes")
            .and_then(Value::as_array)
            .map(Vec::as_slice)
            .unwrap_or_default(),
    };

    nodes
        .iter()
        .enumerate()
        .filter_map(|(index, node)| normalize_node(index, node))
}

fn normalize_node(index: usize, node: &Value) -> Option<SemanticNode> {
    if node.get("ignored").and_then(Value::as_bool).unwrap_or(false) {
        return None;
    }

    let role = ax_text(node.get("role"))?;
    let name = ax_text(node.get("name")).unwrap_or_default();
    let value = ax_text(node.get("value")).unwrap_or_default();
    let description = ax_text(node.get("description")).unwrap_or_default();
    if name.is_empty() && value.is_empty() && description.is_empty() {
        return None;
    }

    let properties = node
        .get("properties")
        .and_then(Value::as_array)
        .map(Vec::as_slice)
        .unwrap_or_default();

    let states: BTreeSet<NodeState> = properties
        .iter()
        .filter(|p| p.pointer("/value/value").and_then(Value::as_bool) == Some(true))
        .filter_map(|p| p.get("name").and_then(Value::as_str))
        .filter_map(NodeState::from_property)
        .collect();

    let url = if role == "link" {
        properties
            .iter()
            .filter(|p| matches!(p.get("name").and_then(Value::as_str), Some("url" | "href")))
            .filter_map(|p| p.pointer("/value/value").and_then(Value::as_str))
            .map(str::trim)
            .filter(|u| !u.is_empty())
            .last()
            .map(String::from)
    } else {
        None
    };

    let mut text = format!("[{role}]");
    if !states.is_empty() {
        let tags: Vec<&str> = states.iter().map(NodeState::as_str).collect();
        text.push_str(&format!(" [{}]", tags.join(" ")));
    }
    for part in [&name, &value, &description] {
        if !part.is_empty() {
            text.push(' ');
            text.push_str(part);
        }
    }

    Some(SemanticNode {
        id: index,
        role,
        text,
        states,
        url,
    })
}

/// Read an `AXValue` (`{"type": ..., "value": ...}`) as collapsed text.
fn ax_text(field: Option<&Value>) -> Option<String> {
    let raw = match field?.get("value")? {
        Value::String(s) => s.clone(),
        Value::Number(n) => n.to_string(),
        _ => return None,
    };
    let collapsed = collapse_whitespace(&raw);
    (!collapsed.is_empty()).then_some(collapsed)
}

pub fn collapse_whitespace(raw: &str) -> String {
    raw.split_whitespace().collect::<Vec<_>>().join(" ")
}

pub fn is_interactive(node: &SemanticNode) -> bool {
    INTERACTIVE_ROLES.contains(&node.role.as_str())
}

/// The actionable subset handed to the decision backend, capped at `max`.
pub fn interactive_subset(nodes: &[SemanticNode], max: usize) -> Vec<SemanticNode> {
    truncate_interactive(nodes.iter().filter(|n| is_interactive(n)).cloned().collect(), max)
}

pub fn truncate_interactive(mut nodes: Vec<SemanticNode>, max: usize) -> Vec<SemanticNode> {
    nodes.truncate(max);
    nodes
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn ax(value: &str) -> Value {
        json!({ "type": "string", "value": value })
    }

    #[test]
    fn drops_ignored_and_nameless_nodes() {
        let tree = json!({ "nodes": [
            { "ignored": true, "role": ax("button"), "name": ax("Hidden") },
            { "role": ax("button"), "name": ax("   ") },
            { "name": ax("No role") },
            { "role": ax("button"), "name": ax("Buscar") },
        ]});

        let nodes: Vec<_> = normalize(&tree).collect();
        assert_eq!(nodes.len(), 1);
        assert_eq!(nodes[0].id, 3);
        assert_eq!(nodes[0].text, "[button] Buscar");
    }

    #[test]
    fn link_with_url_property() {
        let tree = json!([
            { "ignored": true, "role": ax("link"), "name": ax("Skip") },
            {
                "role": ax("link"),
                "name": { "value": "Ver más" },
                "properties": [{ "name": "url", "value": { "value": "/ar/venta/55" } }]
            }
        ]);

        let nodes: Vec<_> = normalize(&tree).collect();
        assert_eq!(nodes.len(), 1);
        assert_eq!(nodes[0].role, "link");
        assert!(nodes[0].text.contains("Ver más"));
        assert_eq!(nodes[0].url.as_deref(), Some("/ar/venta/55"));
    }

    #[test]
    fn url_only_attached_to_links() {
        let tree = json!([{
            "role": ax("button"),
            "name": ax("Go"),
            "properties": [{ "name": "url", "value": { "value": "/x" } }]
        }]);
        let node = normalize(&tree).next().unwrap();
        assert_eq!(node.url, None);
    }

    #[test]
    fn states_are_tagged_in_text() {
        let tree = json!([{
            "role": ax("button"),
            "name": ax("Marca"),
            "properties": [
                { "name": "selected", "value": { "type": "booleanOrUndefined", "value": true } },
                { "name": "expanded", "value": { "type": "booleanOrUndefined", "value": false } },
                { "name": "focusable", "value": { "type": "boolean", "value": true } }
            ]
        }]);

        let node = normalize(&tree).next().unwrap();
        assert_eq!(node.text, "[button] [selected] Marca");
        assert_eq!(node.states.len(), 1);
        assert!(node.states.contains(&NodeState::Selected));
    }

    #[test]
    fn collapses_whitespace_and_joins_fields() {
        let tree = json!([{
            "role": ax("textbox"),
            "name": ax("  Buscar \n  modelo "),
            "value": ax("Corolla"),
            "description": { "type": "string", "value": "" }
        }]);
        let node = normalize(&tree).next().unwrap();
        assert_eq!(node.text, "[textbox] Buscar modelo Corolla");
    }

    #[test]
    fn description_alone_is_enough() {
        let tree = json!([{ "role": ax("img"), "description": ax("Logo") }]);
        assert_eq!(normalize(&tree).count(), 1);
    }

    #[test]
    fn malformed_input_yields_nothing() {
        assert_eq!(normalize(&json!("nope")).count(), 0);
        assert_eq!(normalize(&json!({ "nodes": 3 })).count(), 0);
    }

    #[test]
    fn interactive_subset_filters_roles_and_caps() {
        let tree = Value::Array(
            (0..10)
                .map(|i| {
                    let role = if i % 2 == 0 { "link" } else { "heading" };
                    json!({ "role": ax(role), "name": ax(&format!("item {i}")) })
                })
                .collect(),
        );
        let nodes: Vec<_> = normalize(&tree).collect();

        let subset = interactive_subset(&nodes, 3);
        assert_eq!(subset.len(), 3);
        assert!(subset.iter().all(|n| n.role == "link"));

        let again = truncate_interactive(subset.clone(), 3);
        assert_eq!(again, subset);
    }
}
