use serde_json::{Map, Value};

/// Freshly computed configuration snapshot: a tree of string keys to JSON values.
/// Equality is structural, key order carries no meaning.
pub type ObservedConfig = Map<String, Value>;

/// Sets a value at a nested path, creating intermediate objects as needed.
/// A non-object value sitting in the middle of the path is replaced.
pub fn set_nested_field(config: &mut ObservedConfig, value: impl Into<Value>, path: &[&str]) {
    let Some((leaf, parents)) = path.split_last() else {
        return;
    };

    let mut cursor = config;
    for part in parents {
        let entry = cursor
            .entry((*part).to_string())
            .or_insert_with(|| Value::Object(Map::new()));
        if !entry.is_object() {
            *entry = Value::Object(Map::new());
        }
        cursor = entry
            .as_object_mut()
            .expect("entry was just ensured to be an object");
    }

    cursor.insert((*leaf).to_string(), value.into());
}

/// Returns the dotted paths at which two snapshots differ, for diff logging.
/// Covers added, removed and changed leaves; descends into objects on both sides.
pub fn changed_paths(old: &ObservedConfig, new: &ObservedConfig) -> Vec<String> {
    let mut paths = Vec::new();
    collect_changes(old, new, "", &mut paths);
    paths
}

fn collect_changes(old: &ObservedConfig, new: &ObservedConfig, prefix: &str, out: &mut Vec<String>) {
    for key in old.keys() {
        if !new.contains_key(key) {
            out.push(join_path(prefix, key));
        }
    }

    for (key, new_value) in new {
        let path = join_path(prefix, key);
        match old.get(key) {
            None => out.push(path),
            Some(old_value) if old_value == new_value => {}
            Some(Value::Object(old_map)) => {
                if let Value::Object(new_map) = new_value {
                    collect_changes(old_map, new_map, &path, out);
                } else {
                    out.push(path);
                }
            }
            Some(_) => out.push(path),
        }
    }
}

fn join_path(prefix: &str, key: &str) -> String {
    if prefix.is_empty() {
        key.to_string()
    } else {
        format!("{prefix}.{key}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_set_nested_field_creates_intermediate_objects() {
        let mut config = ObservedConfig::new();
        set_nested_field(&mut config, "img:v1", &["build", "imageTemplateFormat", "format"]);

        assert_eq!(
            Value::Object(config),
            json!({"build": {"imageTemplateFormat": {"format": "img:v1"}}})
        );
    }

    #[test]
    fn test_set_nested_field_overwrites_existing_leaf() {
        let mut config = ObservedConfig::new();
        set_nested_field(&mut config, "img:v1", &["build", "imageTemplateFormat", "format"]);
        set_nested_field(&mut config, "img:v2", &["build", "imageTemplateFormat", "format"]);

        assert_eq!(
            Value::Object(config),
            json!({"build": {"imageTemplateFormat": {"format": "img:v2"}}})
        );
    }

    #[test]
    fn test_set_nested_field_replaces_scalar_in_path() {
        let mut config = ObservedConfig::new();
        set_nested_field(&mut config, "scalar", &["build"]);
        set_nested_field(&mut config, "img:v1", &["build", "imageTemplateFormat", "format"]);

        assert_eq!(
            Value::Object(config),
            json!({"build": {"imageTemplateFormat": {"format": "img:v1"}}})
        );
    }

    #[test]
    fn test_set_nested_field_empty_path_is_noop() {
        let mut config = ObservedConfig::new();
        set_nested_field(&mut config, "value", &[]);
        assert!(config.is_empty());
    }

    #[test]
    fn test_equality_is_key_order_independent() {
        let a: ObservedConfig = serde_json::from_value(json!({"x": 1, "y": {"a": true, "b": 2}}))
            .expect("valid object");
        let b: ObservedConfig = serde_json::from_value(json!({"y": {"b": 2, "a": true}, "x": 1}))
            .expect("valid object");
        assert_eq!(a, b);
    }

    fn as_map(value: Value) -> ObservedConfig {
        match value {
            Value::Object(map) => map,
            other => panic!("expected object, got {other}"),
        }
    }

    #[test]
    fn test_changed_paths_reports_added_removed_and_changed() {
        let old = as_map(json!({
            "build": {"imageTemplateFormat": {"format": "img:v1"}},
            "stale": true
        }));
        let new = as_map(json!({
            "build": {"imageTemplateFormat": {"format": "img:v2"}},
            "deployer": {"imageTemplateFormat": {"format": "img:v3"}}
        }));

        let mut paths = changed_paths(&old, &new);
        paths.sort();
        assert_eq!(
            paths,
            vec![
                "build.imageTemplateFormat.format".to_string(),
                "deployer".to_string(),
                "stale".to_string(),
            ]
        );
    }

    #[test]
    fn test_changed_paths_empty_for_equal_snapshots() {
        let old = as_map(json!({"a": {"b": 1}}));
        let new = as_map(json!({"a": {"b": 1}}));
        assert!(changed_paths(&old, &new).is_empty());
    }
}
