//! Campaign orchestrator: the single sequential send loop.
//!
//! Drives one campaign run: pick the next pending recipient, enforce the
//! daily quota, hand the rendered message to the relay, record the outcome
//! durably, wait a jittered delay, repeat. Control operations (`pause`,
//! `cancel`, state polling) are safe to call from other tasks at any time
//! and take effect at the next safe point; no attempt is ever aborted
//! mid-flight.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use chrono::{DateTime, Utc};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::campaign::delay::DelayScheduler;
use crate::config::CampaignLimits;
use crate::error::{CampaignError, Error, Result, SendErrorKind};
use crate::ledger::{ProgressLedger, ProgressRecord};
use crate::recipient::{
    Recipient, RecipientStatus, RecipientStore, dedup_recipients, is_valid_address,
};
use crate::relay::RelayClient;
use crate::render::MessageRenderer;

/// Lifecycle of one campaign run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CampaignState {
    Idle,
    Running,
    /// Resumable stop: user pause or daily quota exhausted.
    Paused,
    Completed,
    Cancelled,
    /// Unrecoverable stop: relay auth failure or a persistence failure.
    Failed,
}

impl CampaignState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            CampaignState::Paused
                | CampaignState::Completed
                | CampaignState::Cancelled
                | CampaignState::Failed
        )
    }
}

impl std::fmt::Display for CampaignState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            CampaignState::Idle => "idle",
            CampaignState::Running => "running",
            CampaignState::Paused => "paused",
            CampaignState::Completed => "completed",
            CampaignState::Cancelled => "cancelled",
            CampaignState::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// Result of one delivery attempt, emitted on the event feed.
#[derive(Debug, Clone, serde::Serialize)]
pub struct SendOutcome {
    pub address: String,
    pub succeeded: bool,
    pub error_kind: Option<SendErrorKind>,
    pub timestamp: DateTime<Utc>,
}

/// Ordered event feed: one `Outcome` per attempt, terminated by a single
/// `Finished` carrying the final state.
#[derive(Debug, Clone)]
pub enum CampaignEvent {
    Outcome(SendOutcome),
    Finished(CampaignState),
}

/// Collaborators the orchestrator drives.
pub struct CampaignDeps {
    pub store: Arc<dyn RecipientStore>,
    pub relay: Arc<dyn RelayClient>,
    pub renderer: Arc<dyn MessageRenderer>,
    pub ledger: Arc<dyn ProgressLedger>,
}

/// Cloneable control surface for a running campaign.
#[derive(Clone, Debug)]
pub struct CampaignController {
    pause: Arc<AtomicBool>,
    cancel: Arc<AtomicBool>,
    state: watch::Receiver<CampaignState>,
    last_error: Arc<std::sync::Mutex<Option<String>>>,
}

impl CampaignController {
    /// Request a cooperative pause after the current attempt completes.
    /// Idempotent.
    pub fn pause(&self) {
        self.pause.store(true, Ordering::Relaxed);
    }

    /// Request cancellation: remaining pending recipients are marked
    /// `Skipped` and the run finishes as `Cancelled`. Idempotent.
    pub fn cancel(&self) {
        self.cancel.store(true, Ordering::Relaxed);
    }

    /// Current state, readable at any time.
    pub fn state(&self) -> CampaignState {
        *self.state.borrow()
    }

    /// Wait until the run reaches a terminal state.
    pub async fn wait_terminal(&mut self) -> CampaignState {
        while !self.state().is_terminal() {
            if self.state.changed().await.is_err() {
                break;
            }
        }
        self.state()
    }

    /// Description of the fatal error, present only when state is `Failed`.
    pub fn last_error(&self) -> Option<String> {
        self.last_error.lock().ok().and_then(|g| g.clone())
    }
}

/// Handle for one campaign run: control operations plus the finite event
/// feed. A new `start` begins a new logical run; the feed itself is not
/// restartable.
#[derive(Debug)]
pub struct CampaignHandle {
    run_id: Uuid,
    controller: CampaignController,
    events: mpsc::UnboundedReceiver<CampaignEvent>,
    task: JoinHandle<()>,
}

impl CampaignHandle {
    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    pub fn controller(&self) -> CampaignController {
        self.controller.clone()
    }

    pub fn pause(&self) {
        self.controller.pause();
    }

    pub fn cancel(&self) {
        self.controller.cancel();
    }

    pub fn state(&self) -> CampaignState {
        self.controller.state()
    }

    pub fn last_error(&self) -> Option<String> {
        self.controller.last_error()
    }

    /// Next event, `None` once `Finished` has been consumed.
    pub async fn next_event(&mut self) -> Option<CampaignEvent> {
        self.events.recv().await
    }

    /// Consume the handle into a `Stream` of events. The send task keeps
    /// running detached.
    pub fn into_event_stream(self) -> impl futures::Stream<Item = CampaignEvent> {
        futures::stream::unfold(self.events, |mut rx| async move {
            rx.recv().await.map(|event| (event, rx))
        })
    }

    /// Wait for the send task to finish and return the final state.
    pub async fn join(self) -> CampaignState {
        let _ = self.task.await;
        self.controller.state()
    }
}

/// Campaign orchestrator entry point.
pub struct Campaign;

impl Campaign {
    /// Validate inputs, load persisted progress, and spawn the send loop.
    ///
    /// Fails fast with `InvalidInput` (never entering `Running`) on an
    /// empty recipient list, a malformed address, or inconsistent limits.
    /// Progress persisted under `campaign_id` is resumed: addresses
    /// already processed today are skipped, recipients marked `Sent` are
    /// never re-attempted.
    pub async fn start(
        campaign_id: &str,
        deps: CampaignDeps,
        limits: CampaignLimits,
    ) -> Result<CampaignHandle> {
        limits.validate().map_err(Error::Config)?;

        let recipients = dedup_recipients(deps.store.list().await?);
        if recipients.is_empty() {
            return Err(Error::Campaign(CampaignError::InvalidInput(
                "recipient list is empty".into(),
            )));
        }
        if let Some(bad) = recipients.iter().find(|r| !is_valid_address(&r.address)) {
            return Err(Error::Campaign(CampaignError::InvalidInput(format!(
                "malformed recipient address {:?}",
                bad.address
            ))));
        }

        let record = deps.ledger.load(campaign_id).await?;

        let run_id = Uuid::new_v4();
        let (state_tx, state_rx) = watch::channel(CampaignState::Running);
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let pause = Arc::new(AtomicBool::new(false));
        let cancel = Arc::new(AtomicBool::new(false));
        let last_error = Arc::new(std::sync::Mutex::new(None));

        tracing::info!(
            campaign_id,
            %run_id,
            recipients = recipients.len(),
            sent_today = record.sent_today,
            max_per_day = limits.max_per_day,
            "Campaign run starting"
        );

        let ctx = RunContext {
            campaign_id: campaign_id.to_string(),
            deps,
            limits,
            recipients,
            record,
            scheduler: DelayScheduler::new(),
            pause: Arc::clone(&pause),
            cancel: Arc::clone(&cancel),
            events: events_tx.clone(),
        };

        let task_error = Arc::clone(&last_error);
        let task = tokio::spawn(async move {
            let final_state = match run_loop(ctx).await {
                Ok(state) => state,
                Err(e) => {
                    tracing::error!("Campaign run failed: {e}");
                    if let Ok(mut guard) = task_error.lock() {
                        *guard = Some(e.to_string());
                    }
                    CampaignState::Failed
                }
            };
            let _ = state_tx.send(final_state);
            let _ = events_tx.send(CampaignEvent::Finished(final_state));
            tracing::info!(state = %final_state, "Campaign run finished");
        });

        Ok(CampaignHandle {
            run_id,
            controller: CampaignController {
                pause,
                cancel,
                state: state_rx,
                last_error,
            },
            events: events_rx,
            task,
        })
    }
}

struct RunContext {
    campaign_id: String,
    deps: CampaignDeps,
    limits: CampaignLimits,
    recipients: Vec<Recipient>,
    record: ProgressRecord,
    scheduler: DelayScheduler,
    pause: Arc<AtomicBool>,
    cancel: Arc<AtomicBool>,
    events: mpsc::UnboundedSender<CampaignEvent>,
}

/// The sequential send loop. Returns the terminal state; `Err` means the
/// run is `Failed` (fatal relay error or a persistence failure).
async fn run_loop(mut ctx: RunContext) -> Result<CampaignState> {
    let total = ctx.recipients.len();

    for idx in 0..total {
        // Safe point: control flags, checked before committing to the
        // next attempt.
        if ctx.cancel.load(Ordering::Relaxed) {
            skip_remaining(&ctx, idx).await?;
            return Ok(CampaignState::Cancelled);
        }
        if ctx.pause.load(Ordering::Relaxed) {
            tracing::info!(campaign_id = %ctx.campaign_id, "Pause requested, stopping loop");
            return Ok(CampaignState::Paused);
        }

        let recipient = ctx.recipients[idx].clone();
        let key = recipient.address.to_ascii_lowercase();

        // Sent recipients are never re-attempted; addresses already
        // processed today are skipped so a resumed run is lossless.
        // Failed/Skipped from a previous run stay eligible.
        if recipient.status == RecipientStatus::Sent {
            continue;
        }
        if ctx.record.processed.contains(&key) {
            tracing::debug!(address = %recipient.address, "Already processed today, skipping");
            continue;
        }

        // Day rollover check at the start of each attempt.
        if ctx.record.rollover(ctx.deps.ledger.today()) {
            tracing::info!(campaign_id = %ctx.campaign_id, "Day rolled over, quota reset");
            ctx.deps.ledger.save(&ctx.record).await?;
        }

        if ctx.record.quota_reached(ctx.limits.max_per_day) {
            tracing::info!(
                campaign_id = %ctx.campaign_id,
                sent_today = ctx.record.sent_today,
                "Daily quota reached, pausing until tomorrow"
            );
            return Ok(CampaignState::Paused);
        }

        let rendered = ctx.deps.renderer.render(&recipient);
        let timestamp = Utc::now();
        tracing::info!(
            address = %recipient.address,
            position = idx + 1,
            total,
            "Sending"
        );

        match ctx.deps.relay.send(&recipient.address, &rendered).await {
            Ok(()) => {
                ctx.deps
                    .store
                    .update_status(&recipient.address, RecipientStatus::Sent, timestamp)
                    .await?;
                ctx.recipients[idx].status = RecipientStatus::Sent;
                ctx.record.sent_today += 1;
                ctx.record.processed.insert(key);
                ctx.deps.ledger.save(&ctx.record).await?;
                emit(&ctx, &recipient.address, true, None, timestamp);
            }
            Err(e) if e.kind.is_fatal() => {
                // Cannot succeed for any recipient: halt the whole run.
                // The in-flight recipient stays Pending and no outcome is
                // emitted for the aborted attempt.
                return Err(Error::Send(e));
            }
            Err(e) => {
                tracing::warn!(address = %recipient.address, "Send failed: {e}");
                ctx.deps
                    .store
                    .update_status(&recipient.address, RecipientStatus::Failed, timestamp)
                    .await?;
                ctx.recipients[idx].status = RecipientStatus::Failed;
                ctx.record.processed.insert(key);
                ctx.deps.ledger.save(&ctx.record).await?;
                emit(&ctx, &recipient.address, false, Some(e.kind), timestamp);
            }
        }

        // Jittered pause before the next attempt; none after the last
        // recipient, and none when the quota or a control flag will stop
        // the loop anyway. The sleep is never preempted; flags take
        // effect once it completes.
        let more_remaining = idx + 1 < total;
        if more_remaining
            && !ctx.record.quota_reached(ctx.limits.max_per_day)
            && !ctx.cancel.load(Ordering::Relaxed)
            && !ctx.pause.load(Ordering::Relaxed)
        {
            let delay = ctx.scheduler.next_delay(&ctx.limits);
            tracing::debug!(secs = delay.as_secs(), "Waiting before next send");
            tokio::time::sleep(delay).await;
        }
    }

    Ok(CampaignState::Completed)
}

/// Cancellation sweep: mark every not-yet-processed pending recipient
/// `Skipped`.
async fn skip_remaining(ctx: &RunContext, from: usize) -> Result<()> {
    let timestamp = Utc::now();
    let mut skipped = 0usize;
    for recipient in &ctx.recipients[from..] {
        let key = recipient.address.to_ascii_lowercase();
        if recipient.status != RecipientStatus::Pending || ctx.record.processed.contains(&key) {
            continue;
        }
        ctx.deps
            .store
            .update_status(&recipient.address, RecipientStatus::Skipped, timestamp)
            .await?;
        skipped += 1;
    }
    tracing::info!(campaign_id = %ctx.campaign_id, skipped, "Campaign cancelled");
    Ok(())
}

fn emit(
    ctx: &RunContext,
    address: &str,
    succeeded: bool,
    error_kind: Option<SendErrorKind>,
    timestamp: DateTime<Utc>,
) {
    let _ = ctx.events.send(CampaignEvent::Outcome(SendOutcome {
        address: address.to_string(),
        succeeded,
        error_kind,
        timestamp,
    }));
}
