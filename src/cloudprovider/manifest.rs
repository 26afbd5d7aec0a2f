//! Normalized resource manifests

use serde::{Deserialize, Serialize};

use crate::errors::PipedError;

/// Stable identity of a cloud-provider artifact.
/// Equality uses the whole key; ordering is undefined.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct ResourceKey {
    pub api_group: String,
    pub kind: String,
    pub namespace: String,
    pub name: String,
}

impl ResourceKey {
    pub fn new(
        api_group: impl Into<String>,
        kind: impl Into<String>,
        namespace: impl Into<String>,
        name: impl Into<String>,
    ) -> Self {
        Self {
            api_group: api_group.into(),
            kind: kind.into(),
            namespace: namespace.into(),
            name: name.into(),
        }
    }

    /// Extract the group from an apiVersion such as `apps/v1`.
    /// Core-group versions like `v1` have an empty group.
    pub fn group_of(api_version: &str) -> &str {
        match api_version.split_once('/') {
            Some((group, _)) => group,
            None => "",
        }
    }

    pub fn is_deployment(&self) -> bool {
        self.kind == "Deployment"
    }

    /// Workloads are the resources whose pod template drives progressive
    /// deployment decisions.
    pub fn is_workload(&self) -> bool {
        matches!(self.kind.as_str(), "Deployment" | "StatefulSet" | "DaemonSet")
    }

    pub fn is_config_map(&self) -> bool {
        self.kind == "ConfigMap"
    }

    pub fn is_secret(&self) -> bool {
        self.kind == "Secret"
    }
}

impl std::fmt::Display for ResourceKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}:{}:{}:{}",
            self.api_group, self.kind, self.namespace, self.name
        )
    }
}

/// A normalized cloud-provider artifact: its key plus the full body.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Manifest {
    pub key: ResourceKey,
    pub data: serde_json::Value,
}

impl PartialEq for Manifest {
    fn eq(&self, other: &Self) -> bool {
        self.key == other.key
    }
}

impl Manifest {
    pub fn new(key: ResourceKey, data: serde_json::Value) -> Self {
        Self { key, data }
    }

    /// Build a manifest from one decoded Kubernetes-style object.
    pub fn from_json(data: serde_json::Value) -> Result<Manifest, PipedError> {
        let api_version = data
            .get("apiVersion")
            .and_then(|v| v.as_str())
            .unwrap_or_default();
        let kind = data
            .get("kind")
            .and_then(|v| v.as_str())
            .ok_or_else(|| PipedError::ProviderError("manifest is missing kind".to_string()))?
            .to_string();
        let metadata = data.get("metadata");
        let name = metadata
            .and_then(|m| m.get("name"))
            .and_then(|v| v.as_str())
            .ok_or_else(|| {
                PipedError::ProviderError("manifest is missing metadata.name".to_string())
            })?
            .to_string();
        let namespace = metadata
            .and_then(|m| m.get("namespace"))
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string();

        let key = ResourceKey {
            api_group: ResourceKey::group_of(api_version).to_string(),
            kind,
            namespace,
            name,
        };
        Ok(Manifest { key, data })
    }

    /// Parse every document in a multi-doc YAML stream. Deployment
    /// configuration envelopes living next to the manifests are skipped.
    pub fn from_yaml_multi(text: &str) -> Result<Vec<Manifest>, PipedError> {
        let mut manifests = Vec::new();
        for document in serde_yaml::Deserializer::from_str(text) {
            let value = serde_yaml::Value::deserialize(document)?;
            if value.is_null() {
                continue;
            }
            let json = serde_json::to_value(&value)?;
            let api_version = json
                .get("apiVersion")
                .and_then(|v| v.as_str())
                .unwrap_or_default();
            if api_version.starts_with("pipecd.dev/") {
                continue;
            }
            manifests.push(Manifest::from_json(json)?);
        }
        Ok(manifests)
    }

    pub fn to_yaml(&self) -> Result<String, PipedError> {
        Ok(serde_yaml::to_string(&self.data)?)
    }

    /// Navigate a dotted path such as `spec.template.spec`.
    pub fn field(&self, path: &str) -> Option<&serde_json::Value> {
        let mut current = &self.data;
        for part in path.split('.') {
            current = current.get(part)?;
        }
        Some(current)
    }

    /// Set a label on metadata.labels, creating the map if needed.
    pub fn add_label(&mut self, key: &str, value: &str) {
        let metadata = self
            .data
            .as_object_mut()
            .map(|o| o.entry("metadata").or_insert_with(|| serde_json::json!({})));
        if let Some(metadata) = metadata.and_then(|m| m.as_object_mut()) {
            let labels = metadata
                .entry("labels")
                .or_insert_with(|| serde_json::json!({}));
            if let Some(labels) = labels.as_object_mut() {
                labels.insert(key.to_string(), serde_json::Value::String(value.to_string()));
            }
        }
    }
}

/// Label attached to every applied resource so live reads can select the
/// resources managed for one application.
pub const MANAGED_BY_LABEL: &str = "pipecd.dev/application-id";

#[cfg(test)]
mod tests {
    use super::*;

    const DOCS: &str = r#"
apiVersion: apps/v1
kind: Deployment
metadata:
  name: app
  namespace: default
spec:
  replicas: 3
---
apiVersion: v1
kind: Service
metadata:
  name: app
"#;

    #[test]
    fn test_multi_doc_parse_and_keys() {
        let manifests = Manifest::from_yaml_multi(DOCS).unwrap();
        assert_eq!(manifests.len(), 2);

        assert_eq!(
            manifests[0].key,
            ResourceKey::new("apps", "Deployment", "default", "app")
        );
        assert!(manifests[0].key.is_deployment());
        assert!(manifests[0].key.is_workload());

        // Core group is empty.
        assert_eq!(manifests[1].key, ResourceKey::new("", "Service", "", "app"));
        assert!(!manifests[1].key.is_workload());
    }

    #[test]
    fn test_config_envelope_is_skipped() {
        let doc = "apiVersion: pipecd.dev/v1beta1\nkind: KubernetesApp\nspec: {}\n";
        assert!(Manifest::from_yaml_multi(doc).unwrap().is_empty());
    }

    #[test]
    fn test_equality_uses_key_only() {
        let a = Manifest::new(
            ResourceKey::new("apps", "Deployment", "default", "app"),
            serde_json::json!({"spec": {"replicas": 3}}),
        );
        let b = Manifest::new(
            ResourceKey::new("apps", "Deployment", "default", "app"),
            serde_json::json!({"spec": {"replicas": 5}}),
        );
        assert_eq!(a, b);
    }

    #[test]
    fn test_field_navigation() {
        let manifests = Manifest::from_yaml_multi(DOCS).unwrap();
        let replicas = manifests[0].field("spec.replicas").unwrap();
        assert_eq!(replicas.as_u64(), Some(3));
        assert!(manifests[0].field("spec.missing").is_none());
    }

    #[test]
    fn test_add_label() {
        let mut m = Manifest::from_yaml_multi(DOCS).unwrap().remove(0);
        m.add_label(MANAGED_BY_LABEL, "app-1");
        assert_eq!(
            m.field("metadata.labels")
                .and_then(|l| l.get(MANAGED_BY_LABEL))
                .and_then(|v| v.as_str()),
            Some("app-1")
        );
    }
}
