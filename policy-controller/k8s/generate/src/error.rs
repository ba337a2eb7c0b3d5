use polis_policy_controller_core::condition::MatchError;
use polis_policy_controller_k8s_api::ResourceSpec;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("policy {0} not found")]
    PolicyNotFound(String),

    #[error("trigger resource {0} not found")]
    TriggerNotFound(ResourceSpec),

    #[error("clone source {0} not found")]
    SourceNotFound(ResourceSpec),

    #[error("generate rule {0} has neither data nor a clone source")]
    MissingPayload(String),

    #[error("generate rule {rule}: {source}")]
    Variable {
        rule: String,
        #[source]
        source: MatchError,
    },

    #[error("kind {0} is not served by the cluster")]
    UnknownKind(String),

    #[error("invalid object: {0}")]
    InvalidObject(#[from] serde_json::Error),

    #[error(transparent)]
    Kube(#[from] kube::Error),
}

impl Error {
    /// Recoverable errors leave a request pending so that it is retried.
    ///
    /// Missing triggers and clone sources may still be created; conflicts, throttling and
    /// server errors are transient. Everything else needs the policy or request to change.
    pub fn is_recoverable(&self) -> bool {
        match self {
            Self::TriggerNotFound(_) | Self::SourceNotFound(_) | Self::UnknownKind(_) => true,
            Self::Kube(kube::Error::Api(e)) => {
                e.code == 404 || e.code == 409 || e.code == 429 || e.code >= 500
            }
            Self::Kube(_) => true,
            Self::PolicyNotFound(_)
            | Self::MissingPayload(_)
            | Self::Variable { .. }
            | Self::InvalidObject(_) => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn api_error(code: u16) -> Error {
        Error::Kube(kube::Error::Api(kube::core::ErrorResponse {
            status: "Failure".to_string(),
            message: "test".to_string(),
            reason: "Test".to_string(),
            code,
        }))
    }

    #[test]
    fn classifies_api_errors() {
        for (code, recoverable) in [
            (400, false),
            (403, false),
            (404, true),
            (409, true),
            (422, false),
            (429, true),
            (500, true),
            (503, true),
        ] {
            assert_eq!(api_error(code).is_recoverable(), recoverable, "{code}");
        }
    }

    #[test]
    fn missing_inputs() {
        let spec = ResourceSpec::new("Secret", "default", "base-secret");
        assert!(Error::SourceNotFound(spec.clone()).is_recoverable());
        assert!(Error::TriggerNotFound(spec).is_recoverable());
        assert!(!Error::PolicyNotFound("require-labels".to_string()).is_recoverable());
        assert!(!Error::MissingPayload("gen".to_string()).is_recoverable());
    }
}
