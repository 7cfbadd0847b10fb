//! Service naming rules.
//!
//! Registry names have the shape `<namespace>.<type>.<short>`, for example
//! `go.micro.web.chat`. The edge router routes on the short name and
//! looks services up by the full name.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Default registry namespace.
pub const DEFAULT_NAMESPACE: &str = "go.micro";

/// Default service type served by the edge.
pub const DEFAULT_SERVICE_TYPE: &str = "web";

/// The `<namespace>.<type>` prefix of every routable service.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Namespace {
    namespace: String,
    kind: String,
}

impl Namespace {
    /// Build a namespace, trimming a trailing `.<type>` from `namespace`.
    ///
    /// Older configurations passed the full prefix (`go.micro.web`) as the
    /// namespace, so both spellings are accepted.
    pub fn new(namespace: &str, kind: &str) -> Self {
        let suffix = format!(".{kind}");
        let namespace = namespace.strip_suffix(&suffix).unwrap_or(namespace);
        Self {
            namespace: namespace.to_string(),
            kind: kind.to_string(),
        }
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn kind(&self) -> &str {
        &self.kind
    }

    /// `<namespace>.<type>`
    pub fn prefix(&self) -> String {
        format!("{}.{}", self.namespace, self.kind)
    }

    /// Full registry name for a short name.
    pub fn full_name(&self, short: &str) -> String {
        format!("{}.{}.{}", self.namespace, self.kind, short)
    }

    /// Short name of a registry service if it belongs to this type.
    ///
    /// Matches on the `.<type>.` infix so that services registered under a
    /// different namespace but the same type still show up on the dashboard.
    pub fn short_name<'a>(&self, full: &'a str) -> Option<&'a str> {
        let infix = format!(".{}.", self.kind);
        full.split_once(infix.as_str())
            .map(|(_, short)| short)
            .filter(|short| !short.is_empty())
    }
}

impl Default for Namespace {
    fn default() -> Self {
        Self::new(DEFAULT_NAMESPACE, DEFAULT_SERVICE_TYPE)
    }
}

impl fmt::Display for Namespace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.namespace, self.kind)
    }
}

/// Display form of a short name.
///
/// Names of three characters or fewer that contain a digit are treated as
/// acronyms (`m3o` becomes `M3O`). This never affects routing.
pub fn display_name(short: &str) -> String {
    if short.chars().count() <= 3 && short.chars().any(|c| c.is_ascii_digit()) {
        short.to_uppercase()
    } else {
        short.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_namespace_trims_type_suffix() {
        let ns = Namespace::new("go.micro.web", "web");
        assert_eq!(ns.namespace(), "go.micro");
        assert_eq!(ns.prefix(), "go.micro.web");

        let ns = Namespace::new("com.example", "web");
        assert_eq!(ns.prefix(), "com.example.web");
    }

    #[test]
    fn test_full_name() {
        let ns = Namespace::default();
        assert_eq!(ns.full_name("chat"), "go.micro.web.chat");
    }

    #[test]
    fn test_short_name() {
        let ns = Namespace::default();
        assert_eq!(ns.short_name("go.micro.web.chat"), Some("chat"));
        assert_eq!(ns.short_name("com.other.web.blog"), Some("blog"));
        assert_eq!(ns.short_name("go.micro.srv.chat"), None);
        assert_eq!(ns.short_name("go.micro.web."), None);
    }

    #[test]
    fn test_display_name_acronyms() {
        assert_eq!(display_name("m3o"), "M3O");
        assert_eq!(display_name("k8"), "K8");
        assert_eq!(display_name("m6"), "M6");
        assert_eq!(display_name("abc"), "abc");
        assert_eq!(display_name("chat1"), "chat1");
    }

    proptest! {
        #[test]
        fn full_then_short_round_trips(short in "[a-z][a-z0-9]{0,12}") {
            let ns = Namespace::default();
            let full = ns.full_name(&short);
            prop_assert_eq!(ns.short_name(&full), Some(short.as_str()));
        }
    }
}
