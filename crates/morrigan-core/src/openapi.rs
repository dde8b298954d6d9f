use serde_json::{json, Map, Value};

/// A default stub for a leaf route a handler never attached `openapi[method]`
/// documentation to. Components fall back to this per method when assembling
/// their own OpenAPI fragment.
pub fn undocumented_stub() -> Value {
    json!({ "responses": { "default": { "description": "undocumented" } } })
}

/// Builds an OpenAPI `paths` fragment for a set of leaf routes mounted under
/// `prefix`, one entry per `(sub-path, methods)` pair. Every method gets
/// [`undocumented_stub`] unless `documented` supplies a specific operation
/// for that `(sub-path, method)` pair, letting a component layer in real
/// documentation for a handful of routes without hand-writing the rest.
pub fn route_fragment(
    prefix: &str,
    routes: &[(&str, &[&str])],
    documented: &[((&str, &str), Value)],
) -> Value {
    let mut paths = Map::new();
    for (sub_path, methods) in routes {
        let full_path = if sub_path.is_empty() {
            prefix.to_string()
        } else {
            format!("{prefix}{sub_path}")
        };
        let mut item = Map::new();
        for method in *methods {
            let operation = documented
                .iter()
                .find(|((doc_path, doc_method), _)| doc_path == sub_path && doc_method == method)
                .map(|(_, op)| op.clone())
                .unwrap_or_else(undocumented_stub);
            item.insert(method.to_string(), operation);
        }
        paths.insert(full_path, Value::Object(item));
    }
    json!({ "paths": Value::Object(paths) })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fills_undocumented_methods_and_keeps_documented_ones() {
        let custom = json!({ "summary": "list things", "responses": {} });
        let fragment = route_fragment(
            "/api/widget",
            &[("", &["get", "post"]), ("/:id", &["get", "delete"])],
            &[(("", "get"), custom.clone())],
        );
        let paths = fragment["paths"].as_object().unwrap();
        assert_eq!(paths["/api/widget"]["get"], custom);
        assert_eq!(paths["/api/widget"]["post"], undocumented_stub());
        assert_eq!(paths["/api/widget/:id"]["get"], undocumented_stub());
        assert_eq!(paths["/api/widget/:id"]["delete"], undocumented_stub());
    }
}
