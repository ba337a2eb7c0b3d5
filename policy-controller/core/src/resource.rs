use crate::k8s::{labels, Labels, RequestInfo, ResourceSpec};
use serde_json::Value;

/// An object under evaluation.
///
/// The raw JSON is retained so that patterns, overlays and bindings can walk arbitrary fields;
/// the identifying fields are extracted up front for matching.
#[derive(Clone, Debug, PartialEq)]
pub struct Resource {
    pub kind: String,
    pub namespace: Option<String>,
    pub name: String,
    pub labels: Labels,
    pub object: Value,
}

/// The context in which a resource is evaluated.
#[derive(Copy, Clone, Debug, PartialEq)]
pub enum Mode<'a> {
    /// A live admission request from the given requester.
    Admission(&'a RequestInfo),

    /// A scan of existing resources, with no requester.
    Background,
}

// === impl Resource ===

impl Resource {
    pub fn new(kind: impl ToString, object: Value) -> Self {
        let meta = object.get("metadata");
        let field = |name: &str| {
            meta.and_then(|m| m.get(name))
                .and_then(Value::as_str)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
        };
        let namespace = field("namespace");
        let name = field("name").unwrap_or_default();
        let labels = meta
            .and_then(|m| m.get("labels"))
            .and_then(Value::as_object)
            .map(|labels| {
                labels
                    .iter()
                    .filter_map(|(k, v)| Some((k.clone(), v.as_str()?.to_string())))
                    .collect::<labels::Map>()
            })
            .unwrap_or_default();

        Self {
            kind: kind.to_string(),
            namespace,
            name,
            labels: labels.into(),
            object,
        }
    }

    /// Replaces the object, refreshing the extracted fields.
    pub fn with_object(&self, object: Value) -> Self {
        Self::new(&self.kind, object)
    }

    pub fn namespace(&self) -> Option<&str> {
        self.namespace.as_deref()
    }

    pub fn api_version(&self) -> Option<&str> {
        self.object.get("apiVersion").and_then(Value::as_str)
    }

    pub fn spec(&self) -> ResourceSpec {
        let spec = ResourceSpec::new(
            &self.kind,
            self.namespace.as_deref().unwrap_or_default(),
            &self.name,
        );
        match self.api_version() {
            Some(v) => spec.with_api_version(v),
            None => spec,
        }
    }
}

// === impl Mode ===

impl Mode<'_> {
    pub fn is_background(&self) -> bool {
        matches!(self, Self::Background)
    }

    pub fn request_info(&self) -> Option<&RequestInfo> {
        match self {
            Self::Admission(info) => Some(info),
            Self::Background => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use maplit::btreemap;
    use serde_json::json;

    #[test]
    fn extracts_identity() {
        let resource = Resource::new(
            "Pod",
            json!({
                "apiVersion": "v1",
                "kind": "Pod",
                "metadata": {
                    "name": "web-0",
                    "namespace": "default",
                    "labels": { "app": "web", "replicas": 3 },
                },
            }),
        );
        assert_eq!(resource.name, "web-0");
        assert_eq!(resource.namespace(), Some("default"));
        assert_eq!(
            resource.labels.as_ref(),
            &btreemap! { "app".to_string() => "web".to_string() }
        );
        assert_eq!(
            resource.spec(),
            ResourceSpec::new("Pod", "default", "web-0").with_api_version("v1")
        );
    }

    #[test]
    fn cluster_scoped_resources_have_no_namespace() {
        let resource = Resource::new("Namespace", json!({ "metadata": { "name": "team-a" } }));
        assert_eq!(resource.namespace(), None);
        assert!(resource.labels.as_ref().is_empty());
    }
}
