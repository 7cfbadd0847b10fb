//! Small accessors over `kdl::KdlNode`.
//!
//! Settings are written as child nodes with one argument
//! (`address ":8082"`); named properties (`id="chat-1"`) are read with
//! [`prop`].

use kdl::{KdlEntry, KdlNode, KdlValue};

/// First child node with the given name.
pub fn child<'a>(node: &'a KdlNode, name: &str) -> Option<&'a KdlNode> {
    node.children()?
        .nodes()
        .iter()
        .find(|n| n.name().value() == name)
}

/// All child nodes with the given name, in document order.
pub fn children_named<'a>(node: &'a KdlNode, name: &'a str) -> impl Iterator<Item = &'a KdlNode> {
    node.children()
        .map(|doc| doc.nodes())
        .unwrap_or_default()
        .iter()
        .filter(move |n| n.name().value() == name)
}

fn arguments(node: &KdlNode) -> impl Iterator<Item = &KdlEntry> {
    node.entries().iter().filter(|e| e.name().is_none())
}

/// First positional argument of a node.
pub fn first_arg(node: &KdlNode) -> Option<&KdlValue> {
    arguments(node).next().map(|e| e.value())
}

/// Named property of a node.
pub fn prop<'a>(node: &'a KdlNode, name: &str) -> Option<&'a KdlValue> {
    node.entries()
        .iter()
        .find(|e| e.name().map(|n| n.value()) == Some(name))
        .map(|e| e.value())
}

/// String property of a node.
pub fn prop_string(node: &KdlNode, name: &str) -> Option<String> {
    prop(node, name)?.as_string().map(str::to_string)
}

/// First argument of the node itself, as a string.
pub fn get_first_arg_string(node: &KdlNode) -> Option<String> {
    first_arg(node)?.as_string().map(str::to_string)
}

/// `name "value"` child, as a string.
pub fn get_string_entry(node: &KdlNode, name: &str) -> Option<String> {
    get_first_arg_string(child(node, name)?)
}

/// `name 42` child, as an integer.
pub fn get_int_entry(node: &KdlNode, name: &str) -> Option<i128> {
    first_arg(child(node, name)?)?.as_integer()
}

/// `name #true` child, as a boolean.
pub fn get_bool_entry(node: &KdlNode, name: &str) -> Option<bool> {
    first_arg(child(node, name)?)?.as_bool()
}

/// Every string argument of a `name "a" "b" ...` child.
pub fn get_string_args(node: &KdlNode, name: &str) -> Vec<String> {
    children_named(node, name)
        .flat_map(|c| arguments(c).filter_map(|e| e.value().as_string().map(str::to_string)))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use kdl::KdlDocument;

    fn parse(text: &str) -> KdlDocument {
        text.parse().unwrap()
    }

    #[test]
    fn test_entries() {
        let doc = parse(
            r#"
            server {
                address ":8082"
                shutdown-timeout-secs 10
                enable-stats #true
            }
            "#,
        );
        let node = &doc.nodes()[0];

        assert_eq!(get_string_entry(node, "address").as_deref(), Some(":8082"));
        assert_eq!(get_int_entry(node, "shutdown-timeout-secs"), Some(10));
        assert_eq!(get_bool_entry(node, "enable-stats"), Some(true));
        assert_eq!(get_string_entry(node, "missing"), None);
    }

    #[test]
    fn test_repeated_args() {
        let doc = parse(
            r#"
            acme {
                hosts "a.example.com" "b.example.com"
                hosts "c.example.com"
            }
            "#,
        );
        let hosts = get_string_args(&doc.nodes()[0], "hosts");
        assert_eq!(hosts, vec!["a.example.com", "b.example.com", "c.example.com"]);
    }

    #[test]
    fn test_props() {
        let doc = parse(r#"node "10.0.0.1:9000" id="chat-1""#);
        let node = &doc.nodes()[0];

        assert_eq!(get_first_arg_string(node).as_deref(), Some("10.0.0.1:9000"));
        assert_eq!(prop_string(node, "id").as_deref(), Some("chat-1"));
    }
}
