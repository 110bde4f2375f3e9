// Mitigation dispatcher - runs the action bound to a violation.
//
// Each (guild, subject) pair gets its own worker task fed by an unbounded
// channel. Submitting is synchronous, so mitigations for one subject run in
// the order their violations were produced, while other subjects proceed in
// parallel. A queue entry is only removed when it has no pending work, which
// means a replacement worker never overlaps with an old one.
//
// A `MitigationRecord` per (guild, subject, rule) suppresses repeat
// punishments until its cooldown runs out.

use super::observability::{self, ObservabilitySink, SecurityEvent};
use super::protection_models::{
    ActionSpec, EventMetadata, MitigationOutcome, MitigationRecord, NotifyTarget, Violation,
};
use super::ActionError;
use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};

// ============================================================================
// ACTION CAPABILITIES (PORT)
// ============================================================================

/// Who and what a mitigation acts on.
#[derive(Debug, Clone)]
pub struct MitigationTarget {
    pub guild_id: u64,
    pub subject_key: u64,
    pub rule_id: String,
    pub metadata: EventMetadata,
}

impl MitigationTarget {
    pub fn meta_u64(&self, key: &str) -> Option<u64> {
        self.metadata.get(key).and_then(|v| v.as_u64())
    }

    pub fn meta_str(&self, key: &str) -> Option<&str> {
        self.metadata.get(key).and_then(|v| v.as_str())
    }
}

impl From<&Violation> for MitigationTarget {
    fn from(violation: &Violation) -> Self {
        Self {
            guild_id: violation.guild_id,
            subject_key: violation.subject_key,
            rule_id: violation.rule.id.clone(),
            metadata: violation.metadata.clone(),
        }
    }
}

/// Platform capabilities the dispatcher can invoke.
///
/// Implemented by the Discord layer; tests use an in-memory mock.
#[async_trait]
pub trait ActionProvider: Send + Sync + 'static {
    async fn mute(&self, target: &MitigationTarget, duration: Duration)
        -> Result<(), ActionError>;

    async fn lockdown(
        &self,
        target: &MitigationTarget,
        slowmode_secs: Option<u16>,
    ) -> Result<(), ActionError>;

    async fn revoke_roles(&self, target: &MitigationTarget) -> Result<(), ActionError>;

    /// Alert the guild's staff.
    async fn notify(&self, target: &MitigationTarget, message: &str) -> Result<(), ActionError>;

    /// Tell the offending member what happened.
    async fn warn(&self, target: &MitigationTarget, message: &str) -> Result<(), ActionError>;

    async fn delete_message(&self, target: &MitigationTarget) -> Result<(), ActionError>;

    async fn reset_nickname(&self, target: &MitigationTarget) -> Result<(), ActionError>;
}

// ============================================================================
// DISPATCHER
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct RecordKey {
    guild_id: u64,
    subject_key: u64,
    rule_id: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct QueueKey {
    guild_id: u64,
    subject_key: u64,
}

struct DispatchJob {
    violation: Violation,
    reply: oneshot::Sender<MitigationOutcome>,
}

struct DispatchQueue {
    tx: mpsc::UnboundedSender<DispatchJob>,
    /// Jobs submitted but not yet finished
    pending: Arc<AtomicUsize>,
    cancelled: Arc<AtomicBool>,
}

struct DispatcherInner<P: ActionProvider> {
    provider: P,
    records: DashMap<RecordKey, MitigationRecord>,
    queues: DashMap<QueueKey, DispatchQueue>,
    sink: Arc<dyn ObservabilitySink>,
}

/// Handle to a submitted violation's eventual outcome.
pub struct PendingMitigation {
    rx: oneshot::Receiver<MitigationOutcome>,
}

impl PendingMitigation {
    pub async fn outcome(self) -> MitigationOutcome {
        // A dropped worker means the guild was purged mid-flight
        self.rx.await.unwrap_or(MitigationOutcome::Cancelled)
    }
}

pub struct MitigationDispatcher<P: ActionProvider> {
    inner: Arc<DispatcherInner<P>>,
}

impl<P: ActionProvider> MitigationDispatcher<P> {
    pub fn new(provider: P, sink: Arc<dyn ObservabilitySink>) -> Self {
        Self {
            inner: Arc::new(DispatcherInner {
                provider,
                records: DashMap::new(),
                queues: DashMap::new(),
                sink,
            }),
        }
    }

    /// Queue a violation behind earlier ones for the same subject.
    ///
    /// Must be called from within a tokio runtime.
    pub fn submit(&self, violation: Violation) -> PendingMitigation {
        let (reply, rx) = oneshot::channel();
        let key = QueueKey {
            guild_id: violation.guild_id,
            subject_key: violation.subject_key,
        };

        let queue = self
            .inner
            .queues
            .entry(key)
            .or_insert_with(|| spawn_worker(Arc::downgrade(&self.inner)));
        queue.pending.fetch_add(1, Ordering::SeqCst);
        if let Err(mpsc::error::SendError(job)) = queue.tx.send(DispatchJob { violation, reply }) {
            queue.pending.fetch_sub(1, Ordering::SeqCst);
            let _ = job.reply.send(MitigationOutcome::Cancelled);
        }

        PendingMitigation { rx }
    }

    /// Submit and wait for the outcome.
    #[allow(dead_code)]
    pub async fn dispatch(&self, violation: Violation) -> MitigationOutcome {
        self.submit(violation).outcome().await
    }

    /// Drop records and queued work for a guild. Queued jobs resolve as `Cancelled`.
    pub fn purge_guild(&self, guild_id: u64) -> usize {
        let before = self.inner.records.len();
        self.inner.records.retain(|key, _| key.guild_id != guild_id);
        self.inner.queues.retain(|key, queue| {
            if key.guild_id == guild_id {
                queue.cancelled.store(true, Ordering::SeqCst);
                false
            } else {
                true
            }
        });
        before.saturating_sub(self.inner.records.len())
    }

    /// Drop expired records and idle queues.
    pub fn sweep(&self, now: i64) -> usize {
        let before = self.inner.records.len();
        self.inner.records.retain(|_, record| record.expires_at > now);
        self.inner
            .queues
            .retain(|_, queue| queue.pending.load(Ordering::SeqCst) > 0);
        before.saturating_sub(self.inner.records.len())
    }

    /// Forget an active mitigation so the rule can fire again immediately.
    pub fn clear_record(&self, guild_id: u64, subject_key: u64, rule_id: &str) -> bool {
        let key = RecordKey {
            guild_id,
            subject_key,
            rule_id: rule_id.to_string(),
        };
        self.inner.records.remove(&key).is_some()
    }

    /// Clear every active mitigation for a subject in a guild.
    pub fn clear_subject(&self, guild_id: u64, subject_key: u64) -> usize {
        let before = self.inner.records.len();
        self.inner
            .records
            .retain(|key, _| !(key.guild_id == guild_id && key.subject_key == subject_key));
        before.saturating_sub(self.inner.records.len())
    }

    /// Mitigations in a guild that are still suppressing repeats at `now`.
    pub fn active_records(&self, guild_id: u64, now: i64) -> Vec<MitigationRecord> {
        let mut records: Vec<MitigationRecord> = self
            .inner
            .records
            .iter()
            .filter(|r| r.guild_id == guild_id && r.expires_at > now)
            .map(|r| r.value().clone())
            .collect();
        records.sort_by_key(|r| r.fired_at);
        records
    }

    pub fn record_count(&self) -> usize {
        self.inner.records.len()
    }

    pub fn queue_count(&self) -> usize {
        self.inner.queues.len()
    }

    pub fn provider(&self) -> &P {
        &self.inner.provider
    }
}

fn spawn_worker<P: ActionProvider>(inner: Weak<DispatcherInner<P>>) -> DispatchQueue {
    let (tx, mut rx) = mpsc::unbounded_channel::<DispatchJob>();
    let pending = Arc::new(AtomicUsize::new(0));
    let cancelled = Arc::new(AtomicBool::new(false));

    let worker_pending = Arc::clone(&pending);
    let worker_cancelled = Arc::clone(&cancelled);
    tokio::spawn(async move {
        while let Some(job) = rx.recv().await {
            let outcome = match inner.upgrade() {
                Some(inner) if !worker_cancelled.load(Ordering::SeqCst) => {
                    inner.run(&job.violation, &worker_cancelled).await
                }
                _ => MitigationOutcome::Cancelled,
            };

            if outcome == MitigationOutcome::Cancelled {
                if let Some(inner) = inner.upgrade() {
                    inner.sink.emit(
                        SecurityEvent::new(observability::MITIGATION_CANCELLED)
                            .field("guild_id", job.violation.guild_id)
                            .field("subject_key", job.violation.subject_key)
                            .field("rule_id", &job.violation.rule.id),
                    );
                }
            }

            worker_pending.fetch_sub(1, Ordering::SeqCst);
            let _ = job.reply.send(outcome);
        }
    });

    DispatchQueue {
        tx,
        pending,
        cancelled,
    }
}

impl<P: ActionProvider> DispatcherInner<P> {
    async fn run(&self, violation: &Violation, cancelled: &AtomicBool) -> MitigationOutcome {
        let now = violation.window_end;
        let key = RecordKey {
            guild_id: violation.guild_id,
            subject_key: violation.subject_key,
            rule_id: violation.rule.id.clone(),
        };

        let active = self
            .records
            .get(&key)
            .map(|record| record.expires_at > now)
            .unwrap_or(false);
        if active {
            tracing::debug!(
                guild_id = violation.guild_id,
                subject_key = violation.subject_key,
                rule_id = %violation.rule.id,
                "Mitigation still active, suppressing"
            );
            self.sink.emit(
                SecurityEvent::new(observability::MITIGATION_SUPPRESSED)
                    .field("guild_id", violation.guild_id)
                    .field("subject_key", violation.subject_key)
                    .field("rule_id", &violation.rule.id),
            );
            return MitigationOutcome::Suppressed;
        }

        let target = MitigationTarget::from(violation);
        match self.execute(&violation.rule.action, &target).await {
            Ok(()) => {
                let cooldown_ms =
                    i64::try_from(violation.rule.effective_cooldown().as_millis())
                        .unwrap_or(i64::MAX);
                // A purge that landed mid-action must not leave a record behind
                if cooldown_ms > 0 && !cancelled.load(Ordering::SeqCst) {
                    self.records.insert(
                        key,
                        MitigationRecord {
                            subject_key: violation.subject_key,
                            guild_id: violation.guild_id,
                            rule_id: violation.rule.id.clone(),
                            fired_at: now,
                            expires_at: now.saturating_add(cooldown_ms),
                        },
                    );
                }
                self.sink.emit(
                    SecurityEvent::new(observability::MITIGATION_APPLIED)
                        .field("guild_id", violation.guild_id)
                        .field("subject_key", violation.subject_key)
                        .field("rule_id", &violation.rule.id)
                        .field("action", violation.rule.action.label())
                        .field("cooldown_ms", cooldown_ms),
                );
                MitigationOutcome::Applied
            }
            Err(e) => {
                self.sink.emit(
                    SecurityEvent::new(observability::MITIGATION_FAILED)
                        .field("guild_id", violation.guild_id)
                        .field("subject_key", violation.subject_key)
                        .field("rule_id", &violation.rule.id)
                        .field("reason", &e),
                );
                MitigationOutcome::Failed {
                    reason: e.to_string(),
                }
            }
        }
    }

    /// Run an action's steps in order.
    ///
    /// Hard failures stop the sequence. Soft failures (best-effort steps or
    /// vanished targets) are logged and skipped; if every step failed the
    /// last error is returned.
    async fn execute(
        &self,
        action: &ActionSpec,
        target: &MitigationTarget,
    ) -> Result<(), ActionError> {
        let steps = flatten(action);
        let mut succeeded = 0usize;
        let mut last_error = None;

        for step in steps {
            match self.execute_step(step, target).await {
                Ok(()) => succeeded += 1,
                Err(e) if step.is_best_effort() || e.is_soft() => {
                    tracing::warn!(
                        guild_id = target.guild_id,
                        subject_key = target.subject_key,
                        step = %step.label(),
                        "Mitigation step failed, continuing: {}",
                        e
                    );
                    last_error = Some(e);
                }
                Err(e) => {
                    tracing::error!(
                        guild_id = target.guild_id,
                        subject_key = target.subject_key,
                        step = %step.label(),
                        "Mitigation step failed: {}",
                        e
                    );
                    return Err(e);
                }
            }
        }

        match last_error {
            Some(e) if succeeded == 0 => Err(e),
            _ => Ok(()),
        }
    }

    async fn execute_step(
        &self,
        step: &ActionSpec,
        target: &MitigationTarget,
    ) -> Result<(), ActionError> {
        match step {
            ActionSpec::Mute { duration_ms } => {
                self.provider
                    .mute(target, Duration::from_millis(*duration_ms))
                    .await
            }
            ActionSpec::ChannelLockdown { slowmode_secs } => {
                self.provider.lockdown(target, *slowmode_secs).await
            }
            ActionSpec::RoleRevoke => self.provider.revoke_roles(target).await,
            ActionSpec::Notify { message, to } => match to {
                NotifyTarget::Staff => self.provider.notify(target, message).await,
                NotifyTarget::Offender => self.provider.warn(target, message).await,
            },
            ActionSpec::DeleteMessage => self.provider.delete_message(target).await,
            ActionSpec::ResetNickname => self.provider.reset_nickname(target).await,
            // flatten() never yields composites
            ActionSpec::Composite(_) => Ok(()),
        }
    }
}

/// Depth-first list of leaf steps.
fn flatten(action: &ActionSpec) -> Vec<&ActionSpec> {
    match action {
        ActionSpec::Composite(steps) => steps.iter().flat_map(flatten).collect(),
        leaf => vec![leaf],
    }
}

// ============================================================================
// TESTS
// ============================================================================
