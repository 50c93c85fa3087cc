//! Parsing of YAML/JSON manifests into objects ready for server-side apply.

use kube::discovery::ApiResource;
use serde::Deserialize;

use crate::{Error, Result};

/// Kinds that are not namespaced and must be applied cluster-wide
const CLUSTER_SCOPED_KINDS: &[&str] = &[
    "Namespace",
    "PriorityClass",
    "ClusterRole",
    "ClusterRoleBinding",
    "CustomResourceDefinition",
    "StorageClass",
    "PersistentVolume",
    "ValidatingWebhookConfiguration",
    "MutatingWebhookConfiguration",
];

/// A single manifest document with the identity needed to apply it.
#[derive(Clone, Debug, PartialEq)]
pub struct ManifestObject {
    /// Full object as JSON
    pub value: serde_json::Value,
    /// apiVersion (e.g. "crdb.cockroachlabs.com/v1alpha1")
    pub api_version: String,
    /// kind (e.g. "CrdbNode")
    pub kind: String,
    /// metadata.name
    pub name: String,
    /// metadata.namespace, if the manifest sets one
    pub namespace: Option<String>,
}

impl ManifestObject {
    /// Extract identity fields from a parsed object
    pub fn from_value(value: serde_json::Value) -> Result<Self> {
        let field = |pointer: &str| {
            value
                .pointer(pointer)
                .and_then(|v| v.as_str())
                .map(str::to_string)
        };

        let api_version = field("/apiVersion")
            .ok_or_else(|| Error::serialization_for("manifest", "missing apiVersion"))?;
        let kind =
            field("/kind").ok_or_else(|| Error::serialization_for("manifest", "missing kind"))?;
        let name = field("/metadata/name").ok_or_else(|| {
            Error::serialization_for(kind.clone(), "manifest missing metadata.name")
        })?;
        let namespace = field("/metadata/namespace");

        Ok(Self {
            value,
            api_version,
            kind,
            name,
            namespace,
        })
    }

    /// Whether this kind lives outside any namespace
    pub fn is_cluster_scoped(&self) -> bool {
        CLUSTER_SCOPED_KINDS.contains(&self.kind.as_str())
    }

    /// Namespace to apply into: the manifest's own, else `default_namespace`.
    /// None for cluster-scoped kinds.
    pub fn target_namespace<'a>(&'a self, default_namespace: &'a str) -> Option<&'a str> {
        if self.is_cluster_scoped() {
            None
        } else {
            Some(self.namespace.as_deref().unwrap_or(default_namespace))
        }
    }

    /// The `ApiResource` used for dynamic API access
    pub fn api_resource(&self) -> ApiResource {
        build_api_resource(&self.api_version, &self.kind)
    }

    /// Short "Kind/name" label for logs
    pub fn reference(&self) -> String {
        format!("{}/{}", self.kind, self.name)
    }
}

/// Parse every non-empty document in a YAML (or JSON) stream.
pub fn parse_documents(content: &str) -> Result<Vec<ManifestObject>> {
    if content.trim_start().starts_with('{') {
        let value: serde_json::Value = serde_json::from_str(content)?;
        return Ok(vec![ManifestObject::from_value(value)?]);
    }

    let mut objects = Vec::new();
    for document in serde_yaml::Deserializer::from_str(content) {
        let value = serde_json::Value::deserialize(document)?;
        if value.is_null() {
            continue;
        }
        objects.push(ManifestObject::from_value(value)?);
    }
    Ok(objects)
}

/// Build an ApiResource from a known apiVersion and kind.
pub fn build_api_resource(api_version: &str, kind: &str) -> ApiResource {
    let (group, version) = parse_api_version(api_version);
    ApiResource {
        group,
        version,
        kind: kind.to_string(),
        api_version: api_version.to_string(),
        plural: pluralize_kind(kind),
    }
}

/// Parse apiVersion into (group, version)
pub fn parse_api_version(api_version: &str) -> (String, String) {
    match api_version.split_once('/') {
        Some((group, version)) => (group.to_string(), version.to_string()),
        None => (String::new(), api_version.to_string()),
    }
}

/// Pluralize a Kubernetes resource kind using the API server's simple rules
pub fn pluralize_kind(kind: &str) -> String {
    let lower = kind.to_lowercase();
    if lower.ends_with('s') || lower.ends_with("ch") || lower.ends_with("sh") {
        format!("{}es", lower)
    } else if lower.ends_with('y') && !lower.ends_with("ay") && !lower.ends_with("ey") {
        format!("{}ies", &lower[..lower.len() - 1])
    } else {
        format!("{}s", lower)
    }
}
