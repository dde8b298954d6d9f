use serde_json::{json, Map, Value};

pub use morrigan_core::openapi::{route_fragment, undocumented_stub};

const MERGEABLE_COMPONENT_KEYS: &[&str] = &[
    "schemas",
    "responses",
    "parameters",
    "examples",
    "requestBodies",
    "headers",
    "securitySchemes",
    "links",
    "callbacks",
];

/// Merges every fragment contributed for the mounted route tree into one
/// document per §4.7's rules: `components` subkeys are shallow-merged (last
/// writer wins), `security`/`tags` arrays are concatenated in order, and
/// `paths` entries are unioned per method. Each component contributes a
/// fragment covering its own leaf routes (see
/// [`crate::host::ComponentHost::openapi_fragments`] and
/// [`route_fragment`]), falling back to [`undocumented_stub`] for any method
/// it attaches no explicit documentation to — so every route mounted under
/// `/api/<name>` shows up here even when nothing documents it. Fragments are
/// merged as JSON rather than through `utoipa`'s builder types, since the
/// document produced here is served as-is and never round-tripped back into
/// typed `utoipa` structures.
pub fn aggregate(fragments: Vec<Value>) -> Value {
    let mut merged = json!({
        "openapi": "3.0.3",
        "info": { "title": "Morrigan API", "version": env!("CARGO_PKG_VERSION") },
        "paths": {},
        "components": {},
        "security": [],
        "tags": [],
    });

    for fragment in fragments {
        merge_into(&mut merged, &fragment);
    }

    merged
}

fn merge_into(merged: &mut Value, fragment: &Value) {
    if let Some(paths) = fragment.get("paths").and_then(Value::as_object) {
        let target = merged["paths"].as_object_mut().expect("initialized above");
        for (path, item) in paths {
            merge_path_item(target, path, item);
        }
    }

    if let Some(components) = fragment.get("components").and_then(Value::as_object) {
        let target = merged["components"].as_object_mut().expect("initialized above");
        for key in MERGEABLE_COMPONENT_KEYS {
            let Some(subvalues) = components.get(*key).and_then(Value::as_object) else {
                continue;
            };
            let slot = target
                .entry(key.to_string())
                .or_insert_with(|| Value::Object(Map::new()));
            let slot_map = slot.as_object_mut().expect("only ever inserted as an object");
            for (name, schema) in subvalues {
                slot_map.insert(name.clone(), schema.clone());
            }
        }
    }

    if let Some(security) = fragment.get("security").and_then(Value::as_array) {
        merged["security"]
            .as_array_mut()
            .expect("initialized above")
            .extend(security.iter().cloned());
    }

    if let Some(tags) = fragment.get("tags").and_then(Value::as_array) {
        merged["tags"]
            .as_array_mut()
            .expect("initialized above")
            .extend(tags.iter().cloned());
    }
}

/// A leaf route contributes a `{method: operation}` entry; when two
/// fragments both declare the same path, their per-method entries are
/// unioned rather than one path object replacing the other.
fn merge_path_item(paths: &mut Map<String, Value>, path: &str, item: &Value) {
    match paths.get_mut(path) {
        Some(existing) => {
            if let (Some(existing_methods), Some(new_methods)) =
                (existing.as_object_mut(), item.as_object())
            {
                for (method, operation) in new_methods {
                    existing_methods.insert(method.clone(), operation.clone());
                }
            }
        }
        None => {
            paths.insert(path.to_string(), item.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fragment_a() -> Value {
        json!({ "tags": [{ "name": "a", "description": "fragment a" }] })
    }

    fn fragment_b() -> Value {
        json!({ "tags": [{ "name": "b", "description": "fragment b" }] })
    }

    #[test]
    fn tags_from_multiple_fragments_concatenate() {
        let merged = aggregate(vec![fragment_a(), fragment_b()]);
        let tags = merged["tags"].as_array().unwrap();
        assert_eq!(tags.len(), 2);
    }

    #[test]
    fn missing_components_block_does_not_panic() {
        let merged = aggregate(vec![fragment_a()]);
        assert!(merged["components"].is_object());
    }

    #[test]
    fn aggregate_includes_paths_from_a_route_fragment() {
        let fragment = route_fragment("/api/client", &[("/provision", &["post"])], &[]);
        let merged = aggregate(vec![fragment]);
        assert_eq!(
            merged["paths"]["/api/client/provision"]["post"],
            undocumented_stub()
        );
    }
}
