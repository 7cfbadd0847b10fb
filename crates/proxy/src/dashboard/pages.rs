//! HTML rendering for the dashboard.
//!
//! Pages are plain strings built from escaped fragments and wrapped in one
//! shared layout.

use html_escape::{encode_double_quoted_attribute as attr, encode_text as text};
use std::collections::BTreeMap;
use std::fmt::Write;

use waypoint_common::{EndpointSpec, Service, Value};

/// Per-request values shown in the page header.
#[derive(Debug, Clone, Default)]
pub struct PageContext<'a> {
    /// Id of the signed-in account; empty when anonymous
    pub user: &'a str,
    pub login_url: Option<&'a str>,
    pub stats_url: Option<&'a str>,
}

impl PageContext<'_> {
    fn login_title(&self) -> &'static str {
        if self.user.is_empty() {
            "Login"
        } else {
            "Account"
        }
    }
}

/// A web service entry on the index page.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct WebService {
    pub name: String,
    pub link: String,
}

pub fn layout(ctx: &PageContext<'_>, title: &str, body: &str) -> String {
    let mut nav = String::from(r#"<a href="/">Home</a> <a href="/services">Services</a> <a href="/client">Client</a>"#);
    if let Some(stats) = ctx.stats_url {
        let _ = write!(nav, r#" <a href="{}">Stats</a>"#, attr(stats));
    }
    if let Some(login) = ctx.login_url {
        let _ = write!(nav, r#" <a href="{}">{}</a>"#, attr(login), ctx.login_title());
    }
    if !ctx.user.is_empty() {
        let _ = write!(nav, r#" <span class="user">{}</span>"#, text(ctx.user));
    }

    format!(
        "<!DOCTYPE html>\n<html>\n<head>\n<meta charset=\"utf-8\">\n<title>{}</title>\n</head>\n<body>\n<nav>{}</nav>\n<main>\n{}\n</main>\n</body>\n</html>\n",
        text(title),
        nav,
        body
    )
}

pub fn index(ctx: &PageContext<'_>, services: &[WebService]) -> String {
    let body = if services.is_empty() {
        "<p>No web services found</p>".to_string()
    } else {
        let mut list = String::from("<ul class=\"services\">\n");
        for service in services {
            let _ = writeln!(
                list,
                r#"<li><a href="{}">{}</a></li>"#,
                attr(&service.link),
                text(&service.name)
            );
        }
        list.push_str("</ul>");
        list
    };
    layout(ctx, "Web", &body)
}

pub fn registry(ctx: &PageContext<'_>, services: &[Service]) -> String {
    let mut body = String::from("<h2>Services</h2>\n<ul>\n");
    for service in services {
        let _ = writeln!(
            body,
            r#"<li><a href="/service/{}">{}</a></li>"#,
            attr(&service.name),
            text(&service.name)
        );
    }
    body.push_str("</ul>");
    layout(ctx, "Services", &body)
}

pub fn service(ctx: &PageContext<'_>, versions: &[Service]) -> String {
    let mut body = String::new();
    for version in versions {
        let _ = writeln!(
            body,
            "<h2>{}</h2>\n<h3>Version {}</h3>",
            text(&version.name),
            text(&version.version)
        );

        body.push_str("<h4>Nodes</h4>\n<table>\n<tr><th>Id</th><th>Address</th><th>Metadata</th></tr>\n");
        for node in &version.nodes {
            let metadata = node
                .metadata
                .iter()
                .map(|(k, v)| format!("{k}={v}"))
                .collect::<Vec<_>>()
                .join(", ");
            let _ = writeln!(
                body,
                "<tr><td>{}</td><td>{}</td><td>{}</td></tr>",
                text(&node.id),
                text(&node.address),
                text(&metadata)
            );
        }
        body.push_str("</table>\n");

        if !version.endpoints.is_empty() {
            body.push_str("<h4>Endpoints</h4>\n");
            body.push_str(&endpoints(&version.endpoints));
        }
    }
    layout(ctx, "Service", &body)
}

pub fn client(ctx: &PageContext<'_>, services: &BTreeMap<String, Vec<EndpointSpec>>) -> String {
    let mut body = String::from("<h2>Client</h2>\n");
    for (name, specs) in services {
        let _ = writeln!(body, "<h3>{}</h3>", text(name));
        body.push_str(&endpoints(specs));
    }
    layout(ctx, "Client", &body)
}

pub fn not_found(ctx: &PageContext<'_>) -> String {
    layout(ctx, "Not Found", "<h2>Not Found</h2>\n<p>The page you requested does not exist.</p>")
}

fn endpoints(specs: &[EndpointSpec]) -> String {
    let mut out = String::new();
    for spec in specs {
        let _ = writeln!(
            out,
            "<div class=\"endpoint\"><h5>{}</h5>\n<pre>Request {}</pre>\n<pre>Response {}</pre></div>",
            text(&spec.name),
            text(&format_value(spec.request.as_ref())),
            text(&format_value(spec.response.as_ref()))
        );
    }
    out
}

/// Render a request or response type as an indented field listing.
pub fn format_value(value: Option<&Value>) -> String {
    let Some(value) = value.filter(|v| !v.values.is_empty()) else {
        return "{}".to_string();
    };
    let mut out = String::from("{\n");
    for field in &value.values {
        format_field(&mut out, field, 0);
    }
    out.push('}');
    out
}

fn format_field(out: &mut String, field: &Value, depth: usize) {
    let indent = "\t".repeat(depth + 1);
    let name = camel_to_snake(&field.name);
    if field.values.is_empty() {
        let _ = writeln!(out, "{indent}{name} {}", field.kind);
        return;
    }

    let _ = writeln!(out, "{indent}{name} {} {{", field.kind);
    for nested in &field.values {
        format_field(out, nested, depth + 1);
    }
    let _ = writeln!(out, "{indent}}}");
}

/// `UserId` to `user_id`; runs of capitals stay together (`HTTPCode` to `http_code`).
pub fn camel_to_snake(name: &str) -> String {
    let chars: Vec<char> = name.chars().collect();
    let mut out = String::with_capacity(name.len() + 4);
    for (i, &c) in chars.iter().enumerate() {
        if c.is_ascii_uppercase() && i > 0 {
            let prev = chars[i - 1];
            let next_lower = chars.get(i + 1).is_some_and(|n| n.is_ascii_lowercase());
            if prev.is_ascii_lowercase()
                || prev.is_ascii_digit()
                || (prev.is_ascii_uppercase() && next_lower)
            {
                out.push('_');
            }
        }
        out.push(c.to_ascii_lowercase());
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_camel_to_snake() {
        assert_eq!(camel_to_snake("UserId"), "user_id");
        assert_eq!(camel_to_snake("HTTPCode"), "http_code");
        assert_eq!(camel_to_snake("name"), "name");
        assert_eq!(camel_to_snake("pageSize2Max"), "page_size2_max");
    }

    #[test]
    fn test_format_value() {
        assert_eq!(format_value(None), "{}");
        assert_eq!(format_value(Some(&Value::new("Empty", "Empty"))), "{}");

        let value = Value::new("Request", "Request")
            .with_field(Value::new("MessageId", "string"))
            .with_field(Value::new("Author", "User").with_field(Value::new("Id", "int64")));

        assert_eq!(
            format_value(Some(&value)),
            "{\n\tmessage_id string\n\tauthor User {\n\t\tid int64\n\t}\n}"
        );
    }

    #[test]
    fn test_layout_escapes_and_shows_account() {
        let ctx = PageContext {
            user: "<alice>",
            login_url: Some("/login"),
            stats_url: Some("/stats"),
        };
        let html = layout(&ctx, "Home", "<p>x</p>");
        assert!(html.contains("&lt;alice&gt;"));
        assert!(html.contains(r#"<a href="/login">Account</a>"#));
        assert!(html.contains(r#"<a href="/stats">Stats</a>"#));

        let html = layout(&PageContext { login_url: Some("/login"), ..Default::default() }, "Home", "");
        assert!(html.contains(">Login</a>"));
    }

    #[test]
    fn test_index_links() {
        let html = index(
            &PageContext::default(),
            &[WebService {
                name: "M3O".to_string(),
                link: "/m3o/".to_string(),
            }],
        );
        assert!(html.contains(r#"<a href="/m3o/">M3O</a>"#));

        let html = index(&PageContext::default(), &[]);
        assert!(html.contains("No web services found"));
    }
}
