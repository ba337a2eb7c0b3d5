use crate::{
    admission::{Admission, AdmissionMetrics, FailurePolicy},
    background::Scanner,
    generate, index,
    index_list::IndexList,
    k8s::{self, Client, Resource},
    lease,
    outcomes::Recorder,
    status, violations,
};
use anyhow::{bail, Result};
use clap::Parser;
use kube::runtime::watcher;
use prometheus_client::registry::Registry;
use std::sync::Arc;
use tokio::time::Duration;
use tracing::{info_span, Instrument};

// Synchronized generate requests are re-propagated at this period.
const GENERATE_RESYNC_PERIOD: Duration = Duration::from_secs(60);

#[derive(Debug, Parser)]
#[clap(name = "polis", about = "A policy admission controller")]
pub struct Args {
    #[clap(
        long,
        default_value = "polis=info,warn",
        env = "POLIS_POLICY_CONTROLLER_LOG"
    )]
    log_level: kubert::LogFilter,

    #[clap(long, default_value = "plain")]
    log_format: kubert::LogFormat,

    #[clap(flatten)]
    client: kubert::ClientArgs,

    #[clap(flatten)]
    server: kubert::ServerArgs,

    #[clap(flatten)]
    admin: kubert::AdminArgs,

    /// Disables the admission controller server.
    #[clap(long)]
    admission_controller_disabled: bool,

    /// The namespace in which generate requests are stored.
    #[clap(long, default_value = "polis")]
    controller_namespace: String,

    #[clap(long, default_value = "polis-policy-controller")]
    controller_deployment_name: String,

    /// Whether requests that cannot be evaluated in time are denied (`fail`) or admitted
    /// (`ignore`).
    #[clap(long, default_value = "fail")]
    failure_policy: FailurePolicy,

    #[clap(long, default_value = "8000")]
    admission_timeout_ms: u64,

    #[clap(long, default_value = "10")]
    status_sync_interval_secs: u64,

    /// The maximum number of buffered status updates. Updates are dropped when the buffer is
    /// full.
    #[clap(long, default_value = "10000")]
    status_queue_size: usize,

    /// The period between scans of existing resources. Zero disables background scans.
    #[clap(long, default_value = "3600")]
    background_scan_interval_secs: u64,

    #[clap(long, default_value = "5")]
    generate_max_attempts: u32,

    #[clap(long, default_value = "5000")]
    patch_timeout_ms: u64,
}

impl Args {
    #[inline]
    pub async fn parse_and_run() -> Result<()> {
        Self::parse().run().await
    }

    pub async fn run(self) -> Result<()> {
        let Self {
            admin,
            client,
            log_level,
            log_format,
            server,
            admission_controller_disabled,
            controller_namespace,
            controller_deployment_name,
            failure_policy,
            admission_timeout_ms,
            status_sync_interval_secs,
            status_queue_size,
            background_scan_interval_secs,
            generate_max_attempts,
            patch_timeout_ms,
        } = self;

        let server = if admission_controller_disabled {
            None
        } else {
            Some(server)
        };

        // Build the index data structures which will maintain the cluster state needed to
        // evaluate admission requests.
        let policy_index = index::policy::Index::shared();
        let rbac_index = index::rbac::Index::shared();

        let mut prom = <Registry>::default();
        let policy_indexes = index::IndexMetrics::register(
            policy_index.clone(),
            prom.sub_registry_with_prefix("policy_index"),
        )
        .shared();
        let rbac_indexes = index::IndexMetrics::register(
            rbac_index.clone(),
            prom.sub_registry_with_prefix("rbac_index"),
        )
        .shared();
        let status_registry = prom.sub_registry_with_prefix("status");
        let status_metrics = status::ControllerMetrics::register(status_registry);
        let status_index_metrics = status::IndexMetrics::register(status_registry);
        let generate_registry = prom.sub_registry_with_prefix("generate");
        let reconcile_metrics = generate::ReconcileMetrics::register(generate_registry);
        let submit_metrics = generate::SubmitMetrics::register(generate_registry);
        let admission_metrics =
            AdmissionMetrics::register(prom.sub_registry_with_prefix("admission"));
        let rt_metrics = kubert::RuntimeMetrics::register(prom.sub_registry_with_prefix("kube"));

        let mut runtime = kubert::Runtime::builder()
            .with_log(log_level, log_format)
            .with_metrics(rt_metrics)
            .with_admin(admin.into_builder().with_prometheus(prom))
            .with_client(client)
            .with_optional_server(server)
            .build()
            .await?;

        let hostname = match std::env::var("HOSTNAME") {
            Ok(hostname) => hostname,
            Err(error) => bail!("failed to fetch `HOSTNAME` environment variable: {error}"),
        };

        let claims = lease::init(
            &runtime,
            &controller_namespace,
            &controller_deployment_name,
            &hostname,
        )
        .await?;

        // Build the status index which aggregates policy statistics and patches them into
        // policy statuses while this replica holds the lease.
        let (status_tx, status_rx) = status::updates(status_queue_size, &status_index_metrics);
        let (patches_tx, patches_rx) = tokio::sync::mpsc::channel(status_queue_size);
        let status_index = status::Index::shared(
            hostname.clone(),
            claims.clone(),
            patches_tx,
            status_index_metrics,
        );

        let (violations_tx, violations_rx) = violations::Writer::channel(status_queue_size);
        let (submitter, submissions) =
            generate::submissions(status_queue_size, generate_max_attempts, submit_metrics);
        let recorder = Recorder::new(status_tx.clone(), violations_tx, submitter);

        // Spawn resource watches.

        let policy_watch_indexes = IndexList::new(policy_indexes)
            .push(status_index.clone())
            .shared();

        let cluster_policies =
            runtime.watch_all::<k8s::policy::ClusterPolicy>(watcher::Config::default());
        tokio::spawn(
            kubert::index::cluster(policy_watch_indexes.clone(), cluster_policies)
                .instrument(info_span!("clusterpolicies")),
        );

        let policies = runtime.watch_all::<k8s::policy::Policy>(watcher::Config::default());
        tokio::spawn(
            kubert::index::namespaced(policy_watch_indexes, policies)
                .instrument(info_span!("policies")),
        );

        let role_bindings = runtime.watch_all::<k8s::RoleBinding>(watcher::Config::default());
        tokio::spawn(
            kubert::index::namespaced(rbac_indexes.clone(), role_bindings)
                .instrument(info_span!("rolebindings")),
        );

        let cluster_role_bindings =
            runtime.watch_all::<k8s::ClusterRoleBinding>(watcher::Config::default());
        tokio::spawn(
            kubert::index::cluster(rbac_indexes, cluster_role_bindings)
                .instrument(info_span!("clusterrolebindings")),
        );

        // Spawn the status aggregator and the status Controller reconciliation.
        tokio::spawn(
            status::Index::process_updates(status_index.clone(), status_rx)
                .instrument(info_span!("status_updates")),
        );
        tokio::spawn(
            status::Index::run(
                status_index,
                Duration::from_secs(status_sync_interval_secs),
            )
            .instrument(info_span!("status_index")),
        );

        let status_controller = status::Controller::new(
            claims.clone(),
            runtime.client(),
            hostname.clone(),
            patches_rx,
            Duration::from_millis(patch_timeout_ms),
            status_metrics,
        );
        tokio::spawn(
            status_controller
                .run()
                .instrument(info_span!("status_controller")),
        );

        tokio::spawn(
            violations::run(runtime.client(), violations_rx)
                .instrument(info_span!("violations")),
        );

        // Spawn the generate request store and controller, fed by a watch on the controller
        // namespace.
        if api_resource_exists::<k8s::GenerateRequest>(&runtime.client()).await {
            let requests = Arc::new(generate::KubeRequests::new(
                runtime.client(),
                &controller_namespace,
            ));
            tokio::spawn(
                submissions
                    .run(requests.clone())
                    .instrument(info_span!("generate_submissions")),
            );

            let reconciler = generate::Reconciler::new(
                generate::KubeResources::new(runtime.client()),
                requests,
                policy_index.clone(),
                status_tx,
                generate_max_attempts,
                reconcile_metrics,
            );
            let (generate_controller, generate_index) = generate::Controller::new(
                reconciler,
                claims.clone(),
                hostname.clone(),
                GENERATE_RESYNC_PERIOD,
            );
            let generate_requests = runtime.watch_namespaced::<k8s::GenerateRequest>(
                controller_namespace.clone(),
                watcher::Config::default(),
            );
            tokio::spawn(
                kubert::index::namespaced(generate_index, generate_requests)
                    .instrument(info_span!("generaterequests")),
            );
            tokio::spawn(
                generate_controller
                    .run()
                    .instrument(info_span!("generate_controller")),
            );
        } else {
            // Submissions are discarded without a queue consumer.
            drop(submissions);
            tracing::warn!("generaterequests.polis.io resource kind not found, skipping watches");
        }

        if background_scan_interval_secs > 0 {
            let scanner = Scanner::new(
                runtime.client(),
                policy_index.clone(),
                recorder.clone(),
                claims,
                hostname,
                Duration::from_secs(background_scan_interval_secs),
            );
            tokio::spawn(scanner.run().instrument(info_span!("background")));
        }

        let admission = Admission::new(
            policy_index,
            rbac_index,
            recorder,
            Duration::from_millis(admission_timeout_ms),
            failure_policy,
            admission_metrics,
        );
        let runtime = runtime.spawn_server(move || admission.clone());

        // Block the main thread on the shutdown signal. Once it fires, wait for the background tasks to
        // complete before exiting.
        if runtime.run().await.is_err() {
            bail!("Aborted");
        }

        Ok(())
    }
}

async fn api_resource_exists<T>(client: &Client) -> bool
where
    T: Resource,
    T::DynamicType: Default,
{
    let dt = Default::default();
    client
        .list_api_group_resources(&T::api_version(&dt))
        .await
        .ok()
        .iter()
        .flat_map(|r| r.resources.iter())
        .any(|r| r.kind == T::kind(&dt))
}
