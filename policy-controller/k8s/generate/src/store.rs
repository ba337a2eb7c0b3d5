use crate::Error;
use ahash::AHashMap as HashMap;
use kube::discovery::{self, Discovery, Scope};
use parking_lot::Mutex;
use polis_policy_controller_k8s_api::{
    self as k8s, labels, ApiResource, DynamicObject, GenerateRequest, GenerateRequestState,
    GenerateRequestStatus, GroupVersionKind, ResourceExt, ResourceSpec,
};
use serde_json::Value as Json;
use std::sync::Arc;

/// Reads and writes arbitrary cluster objects.
#[async_trait::async_trait]
pub trait Resources: Send + Sync + 'static {
    async fn get(&self, spec: &ResourceSpec) -> Result<Option<Json>, Error>;

    async fn create(&self, spec: &ResourceSpec, object: Json) -> Result<(), Error>;

    async fn replace(&self, spec: &ResourceSpec, object: Json) -> Result<(), Error>;
}

/// Persists generate requests.
#[async_trait::async_trait]
pub trait Requests: Send + Sync + 'static {
    /// Stores a request under its name.
    ///
    /// Requests raised by an admission replace the spec of an existing request and revive it if
    /// it had failed. Requests raised by a background scan never replace an existing request.
    async fn apply(&self, request: GenerateRequest) -> Result<(), Error>;

    async fn update_status(
        &self,
        request: &GenerateRequest,
        status: GenerateRequestStatus,
    ) -> Result<(), Error>;
}

/// Accesses objects of any kind, resolving kinds through API discovery.
pub struct KubeResources {
    client: k8s::Client,
    kinds: Mutex<HashMap<(Option<String>, String), Kind>>,
}

#[derive(Clone, Debug)]
struct Kind {
    resource: ApiResource,
    namespaced: bool,
}

/// Stores generate requests in a single namespace.
#[derive(Clone)]
pub struct KubeRequests {
    api: k8s::Api<GenerateRequest>,
}

// === impl KubeResources ===

impl KubeResources {
    pub fn new(client: k8s::Client) -> Self {
        Self {
            client,
            kinds: Mutex::new(HashMap::new()),
        }
    }

    async fn api(&self, spec: &ResourceSpec) -> Result<k8s::Api<DynamicObject>, Error> {
        let Kind {
            resource,
            namespaced,
        } = self.resolve(spec).await?;
        let api = match spec.namespace() {
            Some(ns) if namespaced => {
                k8s::Api::namespaced_with(self.client.clone(), ns, &resource)
            }
            _ => k8s::Api::all_with(self.client.clone(), &resource),
        };
        Ok(api)
    }

    async fn resolve(&self, spec: &ResourceSpec) -> Result<Kind, Error> {
        let key = (spec.api_version.clone(), spec.kind.clone());
        if let Some(kind) = self.kinds.lock().get(&key) {
            return Ok(kind.clone());
        }

        let kind = match spec.api_version.as_deref() {
            Some(api_version) => {
                let (group, version) = api_version.split_once('/').unwrap_or(("", api_version));
                let gvk = GroupVersionKind::gvk(group, version, &spec.kind);
                let (resource, caps) = discovery::pinned_kind(&self.client, &gvk).await?;
                Kind {
                    resource,
                    namespaced: matches!(caps.scope, Scope::Namespaced),
                }
            }
            None => {
                let discovery = Discovery::new(self.client.clone()).run().await?;
                discovery
                    .groups_alphabetical()
                    .into_iter()
                    .flat_map(|group| group.recommended_resources())
                    .find(|(resource, _)| resource.kind == spec.kind)
                    .map(|(resource, caps)| Kind {
                        resource,
                        namespaced: matches!(caps.scope, Scope::Namespaced),
                    })
                    .ok_or_else(|| Error::UnknownKind(spec.kind.clone()))?
            }
        };

        tracing::debug!(kind = %spec.kind, api_version = %kind.resource.api_version, "Resolved kind");
        self.kinds.lock().insert(key, kind.clone());
        Ok(kind)
    }
}

#[async_trait::async_trait]
impl Resources for KubeResources {
    async fn get(&self, spec: &ResourceSpec) -> Result<Option<Json>, Error> {
        let api = self.api(spec).await?;
        match api.get_opt(&spec.name).await? {
            Some(obj) => Ok(Some(serde_json::to_value(obj)?)),
            None => Ok(None),
        }
    }

    async fn create(&self, spec: &ResourceSpec, object: Json) -> Result<(), Error> {
        let api = self.api(spec).await?;
        let obj = serde_json::from_value::<DynamicObject>(object)?;
        api.create(&k8s::PostParams::default(), &obj).await?;
        tracing::info!(resource = %spec, "Created generated resource");
        Ok(())
    }

    async fn replace(&self, spec: &ResourceSpec, object: Json) -> Result<(), Error> {
        let api = self.api(spec).await?;
        let obj = serde_json::from_value::<DynamicObject>(object)?;
        api.replace(&spec.name, &k8s::PostParams::default(), &obj)
            .await?;
        tracing::info!(resource = %spec, "Updated generated resource");
        Ok(())
    }
}

// === impl KubeRequests ===

impl KubeRequests {
    pub fn new(client: k8s::Client, namespace: &str) -> Self {
        Self {
            api: k8s::Api::namespaced(client, namespace),
        }
    }
}

#[async_trait::async_trait]
impl Requests for KubeRequests {
    async fn apply(&self, mut request: GenerateRequest) -> Result<(), Error> {
        let mut meta_labels = labels::for_policy(&request.spec.policy);
        meta_labels.insert(
            labels::RESOURCE_KIND_LABEL.to_string(),
            request.spec.resource.kind.clone(),
        );
        request
            .metadata
            .labels
            .get_or_insert_with(Default::default)
            .extend(meta_labels);
        request.status = None;
        let name = request.name_any();

        if request.is_background() {
            return match self.api.create(&k8s::PostParams::default(), &request).await {
                Ok(_) => {
                    tracing::debug!(
                        %name,
                        policy = %request.spec.policy,
                        resource = %request.spec.resource,
                        "Created generate request"
                    );
                    Ok(())
                }
                Err(k8s::Error::Api(e)) if e.code == 409 => {
                    tracing::trace!(%name, "Generate request already exists");
                    Ok(())
                }
                Err(error) => Err(error.into()),
            };
        }

        let params = k8s::PatchParams::apply(k8s::FIELD_MANAGER).force();
        let applied = self
            .api
            .patch(&name, &params, &k8s::Patch::Apply(&request))
            .await?;
        tracing::debug!(
            %name,
            policy = %applied.spec.policy,
            resource = %applied.spec.resource,
            "Applied generate request"
        );

        // A new admission of the trigger gives a failed request another run.
        if applied.state() == GenerateRequestState::Failed {
            let patch = k8s::Patch::Merge(serde_json::json!({
                "status": { "state": GenerateRequestState::Pending, "message": "" },
            }));
            self.api
                .patch_status(&name, &k8s::PatchParams::default(), &patch)
                .await?;
            tracing::info!(%name, "Reset failed generate request");
        }
        Ok(())
    }

    async fn update_status(
        &self,
        request: &GenerateRequest,
        status: GenerateRequestStatus,
    ) -> Result<(), Error> {
        let name = request.metadata.name.as_deref().unwrap_or_default();
        let patch = k8s::Patch::Merge(serde_json::json!({ "status": status }));
        self.api
            .patch_status(name, &k8s::PatchParams::default(), &patch)
            .await?;
        Ok(())
    }
}

// === impl Arc ===

#[async_trait::async_trait]
impl<T: Resources> Resources for Arc<T> {
    async fn get(&self, spec: &ResourceSpec) -> Result<Option<Json>, Error> {
        (**self).get(spec).await
    }

    async fn create(&self, spec: &ResourceSpec, object: Json) -> Result<(), Error> {
        (**self).create(spec, object).await
    }

    async fn replace(&self, spec: &ResourceSpec, object: Json) -> Result<(), Error> {
        (**self).replace(spec, object).await
    }
}

#[async_trait::async_trait]
impl<T: Requests> Requests for Arc<T> {
    async fn apply(&self, request: GenerateRequest) -> Result<(), Error> {
        (**self).apply(request).await
    }

    async fn update_status(
        &self,
        request: &GenerateRequest,
        status: GenerateRequestStatus,
    ) -> Result<(), Error> {
        (**self).update_status(request, status).await
    }
}
