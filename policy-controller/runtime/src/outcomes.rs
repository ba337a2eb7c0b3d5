use crate::{
    core::{Evaluation, Resource},
    generate,
    k8s::{GenerateRequest, RequestInfo},
    status::{self, Update},
    violations,
};

/// Forwards evaluation outcomes to the status aggregator, the violation writer and the generate
/// request store.
#[derive(Clone)]
pub(crate) struct Recorder {
    status: status::Sender,
    violations: violations::Writer,
    requests: generate::Submitter,
}

impl Recorder {
    pub(crate) fn new(
        status: status::Sender,
        violations: violations::Writer,
        requests: generate::Submitter,
    ) -> Self {
        Self {
            status,
            violations,
            requests,
        }
    }

    /// Records every outcome of an evaluation of `resource`.
    ///
    /// Generate requests are only submitted for resources that were admitted. The requester is
    /// captured so that the reconciler can re-evaluate the trigger as the same user; background
    /// scans pass no requester.
    pub(crate) fn record(
        &self,
        evaluation: &Evaluation,
        resource: &Resource,
        requester: Option<&RequestInfo>,
    ) {
        let admitted = evaluation.denied().is_none();
        for outcome in &evaluation.outcomes {
            self.status.post_all(Update::from_outcome(outcome));

            if let Some(violation) = outcome.violation() {
                self.violations.apply(violation);
            }

            if admitted && outcome.generate_requested() {
                self.requests.submit(GenerateRequest::for_trigger(
                    &outcome.policy,
                    resource.spec(),
                    requester.cloned(),
                ));
            }
        }
    }

    pub(crate) fn violations(&self) -> &violations::Writer {
        &self.violations
    }
}
