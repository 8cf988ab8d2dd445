//! Job processor for device delivery and last-seen bookkeeping.
//!
//! Polls the work queue and hands control jobs to the driver resolved for
//! the device's protocol. Delivery failures go back to the queue, which
//! owns retry and backoff; the processor only reports progress on the
//! device's real-time room.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use thingbridge_core::config::WorkerConfig;
use thingbridge_core::{
    DeviceEvent, Error, EventBus, FailureOutcome, Job, JobKind, Result, WorkQueue,
};
use thingbridge_devices::{DriverRegistry, LastSeenUpdate};
use thingbridge_storage::{DeviceInstance, DeviceModel, LicenseStore};
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::command::ControlCommand;

const EVENT_SOURCE: &str = "processor";

/// What happened to one job.
#[derive(Debug, Clone, PartialEq)]
pub enum JobOutcome {
    /// The driver accepted the value.
    Delivered { job_id: String },
    /// Delivery failed and the job was rescheduled.
    Retrying {
        job_id: String,
        attempt: u32,
        delay: Duration,
    },
    /// Delivery failed for the last time.
    Failed { job_id: String, attempts: u32 },
    /// The device or feature no longer exists; acknowledged without delivery.
    Dropped { job_id: String, reason: String },
    /// Payload could not be decoded; dead-lettered.
    Rejected { job_id: String, reason: String },
    LastSeenRecorded { token: String },
    /// The queue refused the ack or failure report.
    QueueError { job_id: String, error: String },
}

struct Worker {
    queue: Arc<dyn WorkQueue>,
    store: Arc<LicenseStore>,
    drivers: Arc<DriverRegistry>,
    events: EventBus,
}

impl Worker {
    async fn process(&self, job: Job) -> JobOutcome {
        match job.kind {
            JobKind::ControlDevice => self.control_device(job).await,
            JobKind::UpdateLastSeen => self.update_last_seen(job).await,
        }
    }

    async fn control_device(&self, job: Job) -> JobOutcome {
        let command: ControlCommand = match job.payload_as() {
            Ok(command) => command,
            Err(e) => return self.reject(job, e).await,
        };

        let target = match self.load_target(&command).await {
            Ok(Some(target)) => target,
            Ok(None) => {
                let reason = format!(
                    "device {} or feature {} no longer exists",
                    command.device_id, command.feature_code
                );
                info!(job_id = %job.id, reason = %reason, "Dropping control job");
                return self.finish(&job, JobOutcome::Dropped {
                    job_id: job.id.clone(),
                    reason,
                })
                .await;
            }
            Err(e) => {
                warn!(job_id = %job.id, error = %e, "Failed to load device for control job");
                return self.retry_or_dead_letter(job, e, None).await;
            }
        };
        let (device, model) = target;

        let Some(feature) = model.feature(&command.feature_code) else {
            return self.finish(&job, JobOutcome::Dropped {
                job_id: job.id.clone(),
                reason: format!("feature {} missing from model {}", command.feature_code, model.code),
            })
            .await;
        };

        let driver = self.drivers.resolve(device.protocol);
        match driver.set_value(&device, feature, &command.value).await {
            Ok(()) => {
                debug!(
                    device_id = %device.id,
                    feature = %command.feature_code,
                    driver = driver.name(),
                    attempt = job.attempts_made,
                    "Command delivered"
                );
                let outcome = self
                    .finish(&job, JobOutcome::Delivered {
                        job_id: job.id.clone(),
                    })
                    .await;
                self.events.publish(
                    DeviceEvent::command_sent(
                        &device.id,
                        &device.token,
                        &command.feature_code,
                        command.value,
                    ),
                    EVENT_SOURCE,
                );
                outcome
            }
            Err(e) => {
                let error: Error = e.into();
                warn!(
                    device_id = %device.id,
                    feature = %command.feature_code,
                    attempt = job.attempts_made,
                    error = %error,
                    "Command delivery failed"
                );
                self.events.publish(
                    DeviceEvent::CommandError {
                        device_id: device.id.clone(),
                        token: device.token.clone(),
                        feature_code: command.feature_code.clone(),
                        error: error.to_string(),
                        attempt: job.attempts_made,
                    },
                    EVENT_SOURCE,
                );
                self.retry_or_dead_letter(job, error, Some((&device, command.feature_code.as_str())))
                    .await
            }
        }
    }

    async fn update_last_seen(&self, job: Job) -> JobOutcome {
        let update: LastSeenUpdate = match job.payload_as() {
            Ok(update) => update,
            Err(e) => return self.reject(job, e).await,
        };

        let token = update.token.clone();
        let recorded = self
            .store
            .blocking(move |store| {
                store.touch_last_seen(&update.token, update.status.is_online(), update.seen_at)
            })
            .await;

        match recorded {
            Ok(true) => self.finish(&job, JobOutcome::LastSeenRecorded { token }).await,
            Ok(false) => {
                self.finish(&job, JobOutcome::Dropped {
                    job_id: job.id.clone(),
                    reason: format!("token {token} no longer belongs to a device"),
                })
                .await
            }
            Err(e) => self.retry_or_dead_letter(job, e, None).await,
        }
    }

    async fn load_target(&self, command: &ControlCommand) -> Result<Option<(DeviceInstance, DeviceModel)>> {
        let device_id = command.device_id.clone();
        let feature_code = command.feature_code.clone();
        self.store
            .blocking(move |store| -> thingbridge_storage::Result<_> {
                let Some(device) = store.device(&device_id)? else {
                    return Ok(None);
                };
                if device.feature(&feature_code).is_none() {
                    return Ok(None);
                }
                Ok(store.model(&device.model_code)?.map(|model| (device, model)))
            })
            .await
    }

    /// Ack and return `outcome`.
    async fn finish(&self, job: &Job, outcome: JobOutcome) -> JobOutcome {
        match self.queue.ack(job).await {
            Ok(()) => outcome,
            Err(e) => {
                error!(job_id = %job.id, error = %e, "Failed to acknowledge job");
                JobOutcome::QueueError {
                    job_id: job.id.clone(),
                    error: e.to_string(),
                }
            }
        }
    }

    async fn reject(&self, job: Job, error: Error) -> JobOutcome {
        warn!(job_id = %job.id, kind = job.kind.as_str(), error = %error, "Rejecting undecodable job");
        let job_id = job.id.clone();
        let reason = error.to_string();
        match self.queue.fail(job, &reason, false).await {
            Ok(_) => JobOutcome::Rejected { job_id, reason },
            Err(e) => JobOutcome::QueueError {
                job_id,
                error: e.to_string(),
            },
        }
    }

    /// Hand a failure to the queue; announce the terminal failure of a
    /// control job on its device room.
    async fn retry_or_dead_letter(
        &self,
        job: Job,
        error: Error,
        control: Option<(&DeviceInstance, &str)>,
    ) -> JobOutcome {
        let job_id = job.id.clone();
        match self.queue.fail(job, &error.to_string(), error.is_retryable()).await {
            Ok(FailureOutcome::Retrying { attempt, delay }) => JobOutcome::Retrying {
                job_id,
                attempt,
                delay,
            },
            Ok(FailureOutcome::DeadLettered { attempts }) => {
                error!(job_id = %job_id, attempts, error = %error, "Job failed permanently");
                if let Some((device, feature_code)) = control {
                    self.events.publish(
                        DeviceEvent::CommandFailed {
                            device_id: device.id.clone(),
                            token: device.token.clone(),
                            feature_code: feature_code.to_string(),
                            error: error.to_string(),
                            attempts,
                            timestamp: Utc::now(),
                        },
                        EVENT_SOURCE,
                    );
                }
                JobOutcome::Failed { job_id, attempts }
            }
            Err(e) => JobOutcome::QueueError {
                job_id,
                error: e.to_string(),
            },
        }
    }
}

/// Background consumer of the work queue.
pub struct JobProcessor {
    config: WorkerConfig,
    worker: Arc<Worker>,
    running: Arc<RwLock<bool>>,
    task_handle: Arc<RwLock<Option<JoinHandle<()>>>>,
}

impl JobProcessor {
    pub fn new(
        queue: Arc<dyn WorkQueue>,
        store: Arc<LicenseStore>,
        drivers: Arc<DriverRegistry>,
        events: EventBus,
        config: WorkerConfig,
    ) -> Self {
        Self {
            config,
            worker: Arc::new(Worker {
                queue,
                store,
                drivers,
                events,
            }),
            running: Arc::new(RwLock::new(false)),
            task_handle: Arc::new(RwLock::new(None)),
        }
    }

    /// Process the next ready job, if any.
    pub async fn process_next(&self) -> Option<JobOutcome> {
        let job = self.worker.queue.try_dequeue().await?;
        Some(self.worker.process(job).await)
    }

    /// Start the polling loop.
    pub async fn start(&self) {
        let mut running = self.running.write().await;
        if *running {
            return;
        }
        *running = true;
        drop(running);

        let worker = self.worker.clone();
        let running_flag = self.running.clone();
        let poll_interval = Duration::from_millis(self.config.poll_interval_ms.max(1));
        let batch = self.config.max_concurrent.max(1);

        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(poll_interval);

            loop {
                {
                    let r = running_flag.read().await;
                    if !*r {
                        break;
                    }
                }

                interval.tick().await;

                let mut jobs = Vec::with_capacity(batch);
                while jobs.len() < batch {
                    match worker.queue.try_dequeue().await {
                        Some(job) => jobs.push(job),
                        None => break,
                    }
                }
                if jobs.is_empty() {
                    continue;
                }

                futures::future::join_all(jobs.into_iter().map(|job| worker.process(job))).await;
            }
        });

        let mut task = self.task_handle.write().await;
        *task = Some(handle);
        info!(
            category = "commands",
            poll_interval_ms = self.config.poll_interval_ms,
            max_concurrent = batch,
            "Job processor started"
        );
    }

    /// Stop the processor and wait for the in-flight batch.
    pub async fn stop(&self) {
        let mut running = self.running.write().await;
        *running = false;
        drop(running);

        let mut task = self.task_handle.write().await;
        if let Some(handle) = task.take() {
            drop(task);
            handle.await.ok();
        }
        info!(category = "commands", "Job processor stopped");
    }

    pub async fn is_running(&self) -> bool {
        *self.running.read().await
    }
}
