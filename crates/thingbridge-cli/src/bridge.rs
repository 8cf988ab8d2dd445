//! The running bridge: every service `serve` hosts, over one state store.
//!
//! Provisioning clears a retired token's shadow in the same state store the
//! reconciler writes, so control requests must be handled in this process.
//! The console reads one JSON request per line:
//!
//! ```text
//! {"op": "provision", "physical_id": "AA:BB", "tenant_code": "A", "model_code": "M", "owner_id": "alice"}
//! {"op": "dispatch", "device_id": "...", "owner_id": "alice", "feature": "relay_1", "value": "ON"}
//! {"op": "shadow", "token": "..."}
//! {"op": "usage"}
//! ```

use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use serde_json::{json, Value};
use thingbridge_commands::{CommandDispatcher, JobProcessor};
use thingbridge_core::{AppConfig, EventBus, MemoryWorkQueue, Result, RetryPolicy};
use thingbridge_devices::{DriverRegistry, MessageTransport, ShadowReconciler};
use thingbridge_provisioning::{
    load_refund_policy, BrokerSettings, ProvisionRequest, ProvisioningManager,
};
use thingbridge_storage::{LicenseStore, MemoryStateStore};
use tokio::task::JoinHandle;
use tracing::{info, warn};

/// One console request.
#[derive(Debug, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum ControlRequest {
    Provision(ProvisionRequest),
    Dispatch {
        device_id: String,
        owner_id: String,
        feature: String,
        value: Value,
    },
    Shadow {
        token: String,
    },
    Usage,
}

pub struct Bridge {
    store: Arc<LicenseStore>,
    state: Arc<MemoryStateStore>,
    queue: Arc<MemoryWorkQueue>,
    events: EventBus,
    manager: ProvisioningManager,
    dispatcher: CommandDispatcher,
    reconciler: Arc<ShadowReconciler>,
    processor: JobProcessor,
}

impl Bridge {
    pub async fn new(
        config: &AppConfig,
        store: Arc<LicenseStore>,
        transport: Arc<dyn MessageTransport>,
    ) -> Result<Self> {
        let state = Arc::new(MemoryStateStore::new());
        let queue = Arc::new(MemoryWorkQueue::with_dead_letter_limit(
            config.queue.capacity,
            config.queue.dead_letter_limit,
        ));
        let events = EventBus::new();
        let drivers = Arc::new(DriverRegistry::new(transport));

        let refund = load_refund_policy(&store, config.provisioning.refund_on_transfer).await?;
        let manager = ProvisioningManager::new(
            store.clone(),
            state.clone(),
            refund,
            BrokerSettings::from_config(&config.mqtt),
        );
        let dispatcher = CommandDispatcher::new(
            store.clone(),
            state.clone(),
            queue.clone(),
            drivers.clone(),
        )
        .with_retry(RetryPolicy::new(
            config.queue.attempts,
            config.queue.backoff_ms,
            config.queue.max_backoff_ms,
        ));
        let reconciler = Arc::new(
            ShadowReconciler::new(
                store.clone(),
                state.clone(),
                drivers.clone(),
                events.clone(),
                queue.clone(),
            )
            .with_status_ttl(config.state.status_ttl_secs.map(Duration::from_secs)),
        );
        let processor = JobProcessor::new(
            queue.clone(),
            store.clone(),
            drivers,
            events.clone(),
            config.worker.clone(),
        );

        Ok(Self {
            store,
            state,
            queue,
            events,
            manager,
            dispatcher,
            reconciler,
            processor,
        })
    }

    pub fn state(&self) -> &Arc<MemoryStateStore> {
        &self.state
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    /// Start the reconciler on `transport` and the job processor.
    pub async fn start(&self, transport: Arc<dyn MessageTransport>) -> JoinHandle<()> {
        let reconciler = self.reconciler.clone();
        let handle = tokio::spawn(async move {
            if let Err(e) = reconciler.run(transport).await {
                warn!(category = "reconciler", error = %e, "Reconciler exited");
            }
        });
        self.processor.start().await;
        handle
    }

    pub async fn stop(&self) {
        self.processor.stop().await;
        self.queue.close().await;
    }

    pub async fn handle(&self, request: ControlRequest) -> Result<Value> {
        match request {
            ControlRequest::Provision(request) => {
                let result = self.manager.provision(request).await?;
                Ok(serde_json::to_value(result)?)
            }
            ControlRequest::Dispatch {
                device_id,
                owner_id,
                feature,
                value,
            } => {
                let receipt = self
                    .dispatcher
                    .dispatch(&device_id, &owner_id, &feature, value)
                    .await?;
                Ok(serde_json::to_value(receipt)?)
            }
            ControlRequest::Shadow { token } => {
                Ok(serde_json::to_value(self.dispatcher.get_shadow(&token).await?)?)
            }
            ControlRequest::Usage => {
                let usage = self.store.blocking(|s| s.partners_usage()).await?;
                Ok(serde_json::to_value(usage)?)
            }
        }
    }

    /// Handle one console line; the reply is always a JSON object with `ok`.
    pub async fn handle_line(&self, line: &str) -> Value {
        let request: ControlRequest = match serde_json::from_str(line) {
            Ok(request) => request,
            Err(e) => return json!({"ok": false, "error": format!("invalid request: {e}")}),
        };
        match self.handle(request).await {
            Ok(result) => json!({"ok": true, "result": result}),
            Err(e) => {
                info!(category = "console", error = %e, "Request rejected");
                json!({"ok": false, "error": e.to_string()})
            }
        }
    }
}
