//! Structural manifest diff
//!
//! Produces JSON-path-rooted difference records. Array elements appear in
//! paths as `[i]`, e.g. `spec.template.spec.containers.[0].image`.

use regex::Regex;
use serde_json::Value;

use super::manifest::Manifest;

/// One difference: the path plus the rendered values on both sides.
/// A missing side renders as the empty string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiffRecord {
    pub path: String,
    pub before: String,
    pub after: String,
}

/// The differences between two manifests.
#[derive(Debug, Clone, Default)]
pub struct DiffResultList(pub Vec<DiffRecord>);

impl DiffResultList {
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// First record whose path matches the regular expression.
    pub fn find(&self, query: &str) -> Option<&DiffRecord> {
        let re = Regex::new(query).ok()?;
        self.0.iter().find(|d| re.is_match(&d.path))
    }

    /// Every record whose path matches the regular expression.
    pub fn find_all(&self, query: &str) -> Vec<&DiffRecord> {
        match Regex::new(query) {
            Ok(re) => self.0.iter().filter(|d| re.is_match(&d.path)).collect(),
            Err(_) => Vec::new(),
        }
    }

    /// Every record under the given path prefix.
    pub fn find_by_prefix(&self, prefix: &str) -> Vec<&DiffRecord> {
        self.0
            .iter()
            .filter(|d| d.path.starts_with(prefix))
            .collect()
    }
}

/// Diff two manifests, optionally scoped to a subtree such as `spec`.
/// Paths in the result are rooted at the prefix.
pub fn diff(old: &Manifest, new: &Manifest, path_prefix: Option<&str>) -> DiffResultList {
    let (old_value, new_value, root) = match path_prefix {
        Some(prefix) => (
            old.field(prefix).cloned().unwrap_or(Value::Null),
            new.field(prefix).cloned().unwrap_or(Value::Null),
            prefix.to_string(),
        ),
        None => (old.data.clone(), new.data.clone(), String::new()),
    };

    let mut records = Vec::new();
    walk(&old_value, &new_value, &root, &mut records);
    DiffResultList(records)
}

fn walk(old: &Value, new: &Value, path: &str, records: &mut Vec<DiffRecord>) {
    match (old, new) {
        (Value::Object(old_map), Value::Object(new_map)) => {
            let mut keys: Vec<&String> = old_map.keys().chain(new_map.keys()).collect();
            keys.sort();
            keys.dedup();
            for key in keys {
                let child = join(path, key);
                walk(
                    old_map.get(key).unwrap_or(&Value::Null),
                    new_map.get(key).unwrap_or(&Value::Null),
                    &child,
                    records,
                );
            }
        }
        (Value::Array(old_items), Value::Array(new_items)) => {
            let len = old_items.len().max(new_items.len());
            for i in 0..len {
                let child = join(path, &format!("[{}]", i));
                walk(
                    old_items.get(i).unwrap_or(&Value::Null),
                    new_items.get(i).unwrap_or(&Value::Null),
                    &child,
                    records,
                );
            }
        }
        (old, new) => {
            if old != new {
                records.push(DiffRecord {
                    path: path.to_string(),
                    before: render(old),
                    after: render(new),
                });
            }
        }
    }
}

fn join(path: &str, segment: &str) -> String {
    if path.is_empty() {
        segment.to_string()
    } else {
        format!("{}.{}", path, segment)
    }
}

fn render(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cloudprovider::manifest::ResourceKey;

    fn workload(replicas: u64, image: &str) -> Manifest {
        Manifest::new(
            ResourceKey::new("apps", "Deployment", "default", "app"),
            serde_json::json!({
                "apiVersion": "apps/v1",
                "kind": "Deployment",
                "metadata": {"name": "app", "namespace": "default"},
                "spec": {
                    "replicas": replicas,
                    "template": {
                        "spec": {
                            "containers": [
                                {"name": "app", "image": image}
                            ]
                        }
                    }
                }
            }),
        )
    }

    #[test]
    fn test_identical_manifests_have_empty_diff() {
        let a = workload(3, "app:1.2");
        let b = workload(3, "app:1.2");
        assert!(diff(&a, &b, Some("spec")).is_empty());
    }

    #[test]
    fn test_image_change_path_and_values() {
        let old = workload(3, "app:1.2");
        let new = workload(3, "app:1.3");
        let diffs = diff(&old, &new, Some("spec"));

        let image_diffs = diffs.find_all(r"^spec.template.spec.containers.\[\d+\].image$");
        assert_eq!(image_diffs.len(), 1);
        assert_eq!(image_diffs[0].before, "app:1.2");
        assert_eq!(image_diffs[0].after, "app:1.3");

        // The change sits under the template prefix.
        assert_eq!(diffs.find_by_prefix("spec.template").len(), 1);
    }

    #[test]
    fn test_replicas_change() {
        let old = workload(3, "app:1.2");
        let new = workload(5, "app:1.2");
        let diffs = diff(&old, &new, Some("spec"));

        let replicas = diffs.find(r"^spec.replicas$").unwrap();
        assert_eq!(replicas.before, "3");
        assert_eq!(replicas.after, "5");
        assert!(diffs.find_by_prefix("spec.template").is_empty());
    }

    #[test]
    fn test_added_field_has_empty_before() {
        let old = workload(3, "app:1.2");
        let mut new = workload(3, "app:1.2");
        new.data["spec"]["paused"] = serde_json::json!(true);

        let diffs = diff(&old, &new, Some("spec"));
        let record = diffs.find(r"^spec.paused$").unwrap();
        assert_eq!(record.before, "");
        assert_eq!(record.after, "true");
    }
}
