//! Process wiring: capability clients, stores, the router service and the
//! background workers.

use std::sync::Arc;

use chrono::Utc;
use tracing::{info, warn};

use swarmrouter_infra::workers::{QueueDispatcher, RefundReconciler, StateSync, TimeoutSupervisor};
use swarmrouter_infra::{
    AlertSink, Alerter, AuditAnchor, ContentStore, GovernanceSink, HealthProbe, HttpContentStore, HttpGovernanceSink,
    HttpHealthProbe, HttpLedger, InMemoryJobStore, InMemoryLedgerEventLog, JobStore, JsonlRefundAuditLog, Ledger,
    LedgerEventLog, PostgresJobStore, PostgresLedgerEventLog, RefundAuditLog, RefundExecutor, RouterConfig,
    SlackWebhookSink, ValidatorRegistry, WorkerHandle, db, http, spawn_periodic,
};
use swarmrouter_selection::ValidatorSelector;

use crate::app::service::RouterService;

/// Fatal startup failures. The process exits instead of running half-wired.
#[derive(Debug, thiserror::Error)]
pub enum StartupError {
    #[error("http client: {0}")]
    HttpClient(#[from] http::HttpError),
    #[error("database: {0}")]
    Database(#[from] sqlx::Error),
}

/// The external capabilities and stores everything else is built on.
pub struct ServiceParts {
    pub store: Arc<dyn JobStore>,
    pub ledger: Arc<dyn Ledger>,
    /// `None` anchors with a local digest instead of a real pin.
    pub content: Option<Arc<dyn ContentStore>>,
    pub governance: Arc<dyn GovernanceSink>,
    pub alert_sink: Option<Arc<dyn AlertSink>>,
    pub probe: Arc<dyn HealthProbe>,
    pub refund_audit: Arc<dyn RefundAuditLog>,
    pub ledger_events: Arc<dyn LedgerEventLog>,
}

pub struct AppServices {
    pub router: Arc<RouterService>,
    pub registry: Arc<ValidatorRegistry>,
    pub dispatcher: Arc<QueueDispatcher>,
    pub state_sync: Arc<StateSync>,
    pub supervisor: Arc<TimeoutSupervisor>,
    pub reconciler: Arc<RefundReconciler>,
    pub config: RouterConfig,
}

impl AppServices {
    pub fn assemble(config: RouterConfig, parts: ServiceParts) -> Self {
        let alerter = Alerter::new(parts.alert_sink);

        let registry = Arc::new(ValidatorRegistry::seeded(
            config.initial_validators.clone(),
            Utc::now(),
        ));
        if !registry.is_empty() {
            info!(validators = registry.len(), "validator registry seeded");
        }

        let anchor = AuditAnchor::new(
            parts.content,
            parts.governance,
            parts.ledger.clone(),
            alerter.clone(),
            config.anchor_config(),
        );
        let refunds = RefundExecutor::new(
            parts.ledger.clone(),
            parts.store.clone(),
            parts.refund_audit,
            config.refund_exec_policy(),
        );

        let dispatcher = Arc::new(QueueDispatcher::new(
            parts.store.clone(),
            registry.clone(),
            ValidatorSelector::new(config.selection.clone()),
            config.dispatcher_config(),
        ));
        let state_sync = Arc::new(StateSync::new(
            parts.ledger.clone(),
            parts.probe,
            registry.clone(),
            config.state_sync_config(),
        ));
        let supervisor = Arc::new(TimeoutSupervisor::new(
            parts.store.clone(),
            refunds.clone(),
            config.timeout_supervisor_config(),
        ));
        let reconciler = Arc::new(RefundReconciler::new(
            parts.store.clone(),
            parts.ledger.clone(),
            refunds.clone(),
            anchor.clone(),
            alerter.clone(),
            config.refund_reconciler_config(),
        ));

        let router = Arc::new(RouterService {
            store: parts.store,
            ledger: parts.ledger,
            dispatcher: dispatcher.clone(),
            anchor,
            refunds,
            ledger_events: parts.ledger_events,
            alerter,
            max_retries: config.max_retries,
        });

        Self {
            router,
            registry,
            dispatcher,
            state_sync,
            supervisor,
            reconciler,
            config,
        }
    }

    /// Start every periodic task. Shut the handles down to stop them.
    pub fn start_workers(&self) -> Vec<WorkerHandle> {
        vec![
            spawn_periodic(self.state_sync.clone(), self.config.validator_sync_interval),
            spawn_periodic(self.dispatcher.clone(), self.config.dispatch_interval),
            spawn_periodic(self.supervisor.clone(), self.config.monitor_interval),
            spawn_periodic(self.reconciler.clone(), self.config.refund_reconcile_interval),
        ]
    }
}

/// Build production services from configuration.
///
/// Without `DATABASE_URL` the job store and ledger-event log are in-memory.
/// An unreachable database is fatal.
pub async fn build_services(config: RouterConfig) -> Result<AppServices, StartupError> {
    let client = http::build_client(config.http_timeout)?;
    let probe_client = http::build_client(config.validator_probe_timeout)?;

    let (store, ledger_events): (Arc<dyn JobStore>, Arc<dyn LedgerEventLog>) = match &config.database_url {
        Some(url) => {
            let pool = db::connect(url).await?;
            info!("using postgres job store");
            (
                Arc::new(PostgresJobStore::new(pool.clone(), config.job_store_config())),
                Arc::new(PostgresLedgerEventLog::new(pool)),
            )
        }
        None => {
            warn!("DATABASE_URL not set; job state is in-memory and lost on restart");
            (
                Arc::new(InMemoryJobStore::with_config(config.job_store_config())),
                Arc::new(InMemoryLedgerEventLog::new()),
            )
        }
    };

    let content = config.ipfs_api_url.as_ref().map(|url| {
        Arc::new(
            HttpContentStore::new(client.clone(), url.clone(), config.ipfs_api_token.clone())
                .with_timeout(config.http_timeout),
        ) as Arc<dyn ContentStore>
    });
    if content.is_none() {
        warn!("IPFS_API_URL not set; audit anchors use local digests");
    }

    let alert_sink = config
        .slack_alert_webhook
        .as_ref()
        .map(|url| Arc::new(SlackWebhookSink::new(client.clone(), url.clone())) as Arc<dyn AlertSink>);

    let parts = ServiceParts {
        store,
        ledger: Arc::new(HttpLedger::new(
            client.clone(),
            config.ledger_gateway_url.clone(),
            config.solana_rpc_url.clone(),
            config.ledger_rpc_timeout,
        )),
        content,
        governance: Arc::new(HttpGovernanceSink::new(
            client,
            config.governance_webhook_url.clone(),
            config.governance_logger_url.clone(),
            config.governance_service_token.clone(),
        )),
        alert_sink,
        probe: Arc::new(HttpHealthProbe::new(probe_client, config.validator_probe_timeout)),
        refund_audit: Arc::new(JsonlRefundAuditLog::new(config.refund_audit_log_path.clone())),
        ledger_events,
    };

    Ok(AppServices::assemble(config, parts))
}
