//! Work queue for asynchronous device jobs.
//!
//! Jobs are delivered at least once: a dequeued job stays in flight until it
//! is acknowledged or failed. Failed jobs are retried with exponential
//! backoff until their attempt budget runs out, then dead-lettered.

use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::{Error, Result};

/// Unique job identifier.
pub type JobId = String;

/// Dead letters kept by default; the oldest is evicted beyond this.
pub const DEFAULT_DEAD_LETTER_LIMIT: usize = crate::config::defaults::DEAD_LETTER_LIMIT;

/// Job types understood by the processor.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum JobKind {
    /// Deliver a feature value to a device through its driver.
    ControlDevice,
    /// Persist a device's last-seen time and connectivity.
    UpdateLastSeen,
}

impl JobKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobKind::ControlDevice => "control_device",
            JobKind::UpdateLastSeen => "update_last_seen",
        }
    }
}

/// Job priority levels.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Default)]
pub enum JobPriority {
    /// Background bookkeeping
    Low = 1,
    #[default]
    Normal = 2,
    /// User-initiated control
    High = 3,
    Critical = 4,
}

impl JobPriority {
    pub fn value(&self) -> u8 {
        *self as u8
    }
}

/// Retry policy with exponential backoff.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RetryPolicy {
    /// Total number of attempts, including the first
    pub max_attempts: u32,
    /// Delay before the first retry in milliseconds
    pub initial_delay_ms: u64,
    /// Backoff multiplier for exponential backoff
    pub backoff_multiplier: f64,
    /// Maximum delay between retries
    pub max_delay_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay_ms: 5000,
            backoff_multiplier: 2.0,
            max_delay_ms: 60_000,
        }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, initial_delay_ms: u64, max_delay_ms: u64) -> Self {
        Self {
            max_attempts,
            initial_delay_ms,
            max_delay_ms,
            ..Default::default()
        }
    }

    /// Calculate retry delay after a given failed attempt (1-based).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let delay = (self.initial_delay_ms as f64
            * self
                .backoff_multiplier
                .powi(attempt.saturating_sub(1) as i32))
        .min(self.max_delay_ms as f64) as u64;
        Duration::from_millis(delay)
    }

    /// Single attempt, never retried.
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            ..Default::default()
        }
    }

    fn attempts(&self) -> u32 {
        self.max_attempts.max(1)
    }
}

/// Enqueue options.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct JobOptions {
    pub priority: JobPriority,
    pub retry: RetryPolicy,
}

impl JobOptions {
    pub fn with_priority(mut self, priority: JobPriority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }
}

/// A queued unit of work.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub kind: JobKind,
    pub payload: serde_json::Value,
    pub options: JobOptions,
    /// Attempts started so far
    pub attempts_made: u32,
    pub created_at: DateTime<Utc>,
    /// Not handed out before this time
    pub available_at: DateTime<Utc>,
    pub last_error: Option<String>,
}

impl Job {
    pub fn new(kind: JobKind, payload: serde_json::Value, options: JobOptions) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            kind,
            payload,
            options,
            attempts_made: 0,
            created_at: now,
            available_at: now,
            last_error: None,
        }
    }

    /// Build a job from a serializable payload.
    pub fn from_payload<T: Serialize>(kind: JobKind, payload: &T, options: JobOptions) -> Result<Self> {
        Ok(Self::new(kind, serde_json::to_value(payload)?, options))
    }

    /// Decode the payload.
    pub fn payload_as<T: DeserializeOwned>(&self) -> Result<T> {
        serde_json::from_value(self.payload.clone()).map_err(|e| {
            Error::Serialization(format!("job {} ({}): {}", self.id, self.kind.as_str(), e))
        })
    }

    /// Whether another attempt is allowed after the current one.
    pub fn has_attempts_left(&self) -> bool {
        self.attempts_made < self.options.retry.attempts()
    }
}

/// Result of failing a job.
#[derive(Debug, Clone, PartialEq)]
pub enum FailureOutcome {
    /// Rescheduled after `delay`.
    Retrying { attempt: u32, delay: Duration },
    /// No attempts left (or not retryable); the job is terminal.
    DeadLettered { attempts: u32 },
}

/// Queue statistics.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct QueueStats {
    /// Ready plus delayed jobs
    pub waiting: usize,
    pub delayed: usize,
    pub in_flight: usize,
    pub dead_lettered: usize,
    pub completed_count: u64,
    pub retried_count: u64,
}

/// At-least-once job queue with retry and backoff.
#[async_trait]
pub trait WorkQueue: Send + Sync {
    /// Add a job. Fails with `Error::Queue` when the queue is full or closed.
    async fn enqueue(&self, job: Job) -> Result<JobId>;

    /// Hand out the next ready job, highest priority first, FIFO within a
    /// priority. The job counts as in flight until `ack` or `fail`.
    async fn try_dequeue(&self) -> Option<Job>;

    /// Mark an in-flight job done.
    async fn ack(&self, job: &Job) -> Result<()>;

    /// Mark an in-flight attempt failed. Retryable failures with attempts
    /// left are rescheduled; everything else is dead-lettered.
    async fn fail(&self, job: Job, error: &str, retryable: bool) -> Result<FailureOutcome>;

    /// Number of jobs waiting (ready or delayed).
    async fn len(&self) -> usize;
}

/// Priority queue wrapper for job ordering.
#[derive(Debug)]
struct QueueItem {
    job: Job,
    priority: u8,
    /// Sequence number for FIFO ordering within same priority
    sequence: u64,
}

impl PartialEq for QueueItem {
    fn eq(&self, other: &Self) -> bool {
        self.priority == other.priority && self.sequence == other.sequence
    }
}

impl Eq for QueueItem {}

impl PartialOrd for QueueItem {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for QueueItem {
    fn cmp(&self, other: &Self) -> Ordering {
        // Max-heap: higher priority first, then lower sequence first.
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.sequence.cmp(&self.sequence))
    }
}

struct QueueInner {
    ready: BinaryHeap<QueueItem>,
    delayed: Vec<Job>,
    in_flight: HashMap<JobId, Job>,
    dead_letters: VecDeque<Job>,
    dead_letter_limit: usize,
    max_size: usize,
    sequence: u64,
    completed_count: u64,
    retried_count: u64,
    closed: bool,
}

impl QueueInner {
    fn push_ready(&mut self, job: Job) {
        let sequence = self.sequence;
        self.sequence += 1;
        let priority = job.options.priority.value();
        self.ready.push(QueueItem {
            job,
            priority,
            sequence,
        });
    }

    fn promote_due(&mut self, now: DateTime<Utc>) {
        if self.delayed.is_empty() {
            return;
        }
        let (due, pending): (Vec<Job>, Vec<Job>) = std::mem::take(&mut self.delayed)
            .into_iter()
            .partition(|job| job.available_at <= now);
        self.delayed = pending;
        for job in due {
            self.push_ready(job);
        }
    }

    fn waiting(&self) -> usize {
        self.ready.len() + self.delayed.len()
    }
}

/// In-process work queue.
#[derive(Clone)]
pub struct MemoryWorkQueue {
    inner: Arc<RwLock<QueueInner>>,
}

impl MemoryWorkQueue {
    /// Create a new queue holding at most `max_size` waiting jobs.
    pub fn new(max_size: usize) -> Self {
        Self::with_dead_letter_limit(max_size, DEFAULT_DEAD_LETTER_LIMIT)
    }

    /// Like [`MemoryWorkQueue::new`], keeping at most `dead_letter_limit`
    /// dead letters; the oldest is evicted first.
    pub fn with_dead_letter_limit(max_size: usize, dead_letter_limit: usize) -> Self {
        Self {
            inner: Arc::new(RwLock::new(QueueInner {
                ready: BinaryHeap::new(),
                delayed: Vec::new(),
                in_flight: HashMap::new(),
                dead_letters: VecDeque::new(),
                dead_letter_limit: dead_letter_limit.max(1),
                max_size,
                sequence: 0,
                completed_count: 0,
                retried_count: 0,
                closed: false,
            })),
        }
    }

    /// Get queue statistics.
    pub async fn stats(&self) -> QueueStats {
        let inner = self.inner.read().await;
        QueueStats {
            waiting: inner.waiting(),
            delayed: inner.delayed.len(),
            in_flight: inner.in_flight.len(),
            dead_lettered: inner.dead_letters.len(),
            completed_count: inner.completed_count,
            retried_count: inner.retried_count,
        }
    }

    /// Jobs that exhausted their attempts, oldest first.
    pub async fn dead_letters(&self) -> Vec<Job> {
        self.inner.read().await.dead_letters.iter().cloned().collect()
    }

    /// Remove and return every dead letter.
    pub async fn drain_dead_letters(&self) -> Vec<Job> {
        self.inner.write().await.dead_letters.drain(..).collect()
    }

    /// Snapshot of waiting jobs, in no particular order.
    pub async fn waiting_jobs(&self) -> Vec<Job> {
        let inner = self.inner.read().await;
        inner
            .ready
            .iter()
            .map(|item| item.job.clone())
            .chain(inner.delayed.iter().cloned())
            .collect()
    }

    pub async fn is_empty(&self) -> bool {
        self.inner.read().await.waiting() == 0
    }

    /// Stop accepting new jobs.
    pub async fn close(&self) {
        self.inner.write().await.closed = true;
    }
}

#[async_trait]
impl WorkQueue for MemoryWorkQueue {
    async fn enqueue(&self, job: Job) -> Result<JobId> {
        let mut inner = self.inner.write().await;
        if inner.closed {
            return Err(Error::Queue("queue is closed".to_string()));
        }
        if inner.waiting() >= inner.max_size {
            return Err(Error::Queue("queue is full".to_string()));
        }

        let id = job.id.clone();
        debug!(job_id = %id, kind = job.kind.as_str(), "Job enqueued");
        inner.push_ready(job);
        Ok(id)
    }

    async fn try_dequeue(&self) -> Option<Job> {
        let mut inner = self.inner.write().await;
        inner.promote_due(Utc::now());

        let mut job = inner.ready.pop()?.job;
        job.attempts_made += 1;
        inner.in_flight.insert(job.id.clone(), job.clone());
        Some(job)
    }

    async fn ack(&self, job: &Job) -> Result<()> {
        let mut inner = self.inner.write().await;
        if inner.in_flight.remove(&job.id).is_none() {
            return Err(Error::Queue(format!("job {} is not in flight", job.id)));
        }
        inner.completed_count += 1;
        Ok(())
    }

    async fn fail(&self, mut job: Job, error: &str, retryable: bool) -> Result<FailureOutcome> {
        let mut inner = self.inner.write().await;
        if inner.in_flight.remove(&job.id).is_none() {
            return Err(Error::Queue(format!("job {} is not in flight", job.id)));
        }
        job.last_error = Some(error.to_string());

        if retryable && job.has_attempts_left() {
            let attempt = job.attempts_made;
            let delay = job.options.retry.delay_for_attempt(attempt);
            job.available_at = Utc::now()
                + chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::zero());
            inner.delayed.push(job);
            inner.retried_count += 1;
            return Ok(FailureOutcome::Retrying { attempt, delay });
        }

        let attempts = job.attempts_made;
        warn!(job_id = %job.id, kind = job.kind.as_str(), attempts, error, "Job dead-lettered");
        if inner.dead_letters.len() >= inner.dead_letter_limit {
            inner.dead_letters.pop_front();
        }
        inner.dead_letters.push_back(job);
        Ok(FailureOutcome::DeadLettered { attempts })
    }

    async fn len(&self) -> usize {
        self.inner.read().await.waiting()
    }
}
