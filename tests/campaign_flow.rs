//! End-to-end campaign scenarios with a scripted relay, in-memory
//! recipients, and a real file ledger.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{NaiveDate, Utc};
use tokio::sync::{Mutex, mpsc};

use mailflow::campaign::{Campaign, CampaignDeps, CampaignEvent, CampaignState};
use mailflow::config::CampaignLimits;
use mailflow::error::{LedgerError, SendError, SendErrorKind};
use mailflow::ledger::{JsonFileLedger, ProgressLedger, ProgressRecord};
use mailflow::recipient::{MemoryRecipientStore, Recipient, RecipientStatus, RecipientStore};
use mailflow::relay::RelayClient;
use mailflow::render::{MessageRenderer, RenderedMessage};

// ── Test doubles ────────────────────────────────────────────────────

/// Relay that fails scripted addresses and records every call.
struct ScriptedRelay {
    failures: HashMap<String, SendErrorKind>,
    calls: Mutex<Vec<String>>,
}

impl ScriptedRelay {
    fn ok() -> Self {
        Self::with_failures([])
    }

    fn with_failures(failures: impl IntoIterator<Item = (&'static str, SendErrorKind)>) -> Self {
        Self {
            failures: failures
                .into_iter()
                .map(|(a, k)| (a.to_string(), k))
                .collect(),
            calls: Mutex::new(Vec::new()),
        }
    }

    async fn calls(&self) -> Vec<String> {
        self.calls.lock().await.clone()
    }
}

#[async_trait]
impl RelayClient for ScriptedRelay {
    async fn send(&self, address: &str, _message: &RenderedMessage) -> Result<(), SendError> {
        self.calls.lock().await.push(address.to_string());
        match self.failures.get(address) {
            Some(kind) => Err(SendError::new(address, *kind, "scripted failure")),
            None => Ok(()),
        }
    }
}

/// Relay that reports each call and waits for a permit before returning,
/// so tests can inject control operations between attempts.
struct GatedRelay {
    started: mpsc::UnboundedSender<String>,
    permits: Mutex<mpsc::UnboundedReceiver<()>>,
}

impl GatedRelay {
    fn new() -> (Self, mpsc::UnboundedReceiver<String>, mpsc::UnboundedSender<()>) {
        let (started_tx, started_rx) = mpsc::unbounded_channel();
        let (permit_tx, permit_rx) = mpsc::unbounded_channel();
        (
            Self {
                started: started_tx,
                permits: Mutex::new(permit_rx),
            },
            started_rx,
            permit_tx,
        )
    }
}

#[async_trait]
impl RelayClient for GatedRelay {
    async fn send(&self, address: &str, _message: &RenderedMessage) -> Result<(), SendError> {
        let _ = self.started.send(address.to_string());
        self.permits.lock().await.recv().await;
        Ok(())
    }
}

/// Ledger whose saves start failing after a scripted number of writes.
struct FlakyLedger {
    inner: JsonFileLedger,
    saves_before_failure: Mutex<u32>,
}

#[async_trait]
impl ProgressLedger for FlakyLedger {
    async fn load(&self, campaign_id: &str) -> Result<ProgressRecord, LedgerError> {
        self.inner.load(campaign_id).await
    }

    async fn save(&self, record: &ProgressRecord) -> Result<(), LedgerError> {
        let mut remaining = self.saves_before_failure.lock().await;
        if *remaining == 0 {
            return Err(LedgerError::Corrupt {
                campaign_id: record.campaign_id.clone(),
                reason: "disk full".into(),
            });
        }
        *remaining -= 1;
        self.inner.save(record).await
    }
}

fn renderer() -> Arc<dyn MessageRenderer> {
    Arc::new(|r: &Recipient| RenderedMessage {
        subject: format!("Hello {}", r.address),
        html_body: None,
        text_body: "hi".into(),
        attachment_paths: vec![],
    })
}

fn fast_limits(max_per_day: u32) -> CampaignLimits {
    CampaignLimits::new(0, 0, max_per_day)
}

fn recipients(addresses: &[&str]) -> Arc<MemoryRecipientStore> {
    Arc::new(MemoryRecipientStore::new(
        addresses.iter().map(|a| Recipient::new(*a)).collect(),
    ))
}

async fn collect_events(
    handle: &mut mailflow::campaign::CampaignHandle,
) -> (Vec<(String, bool)>, CampaignState) {
    let mut outcomes = Vec::new();
    let mut final_state = CampaignState::Idle;
    while let Some(event) = handle.next_event().await {
        match event {
            CampaignEvent::Outcome(o) => outcomes.push((o.address, o.succeeded)),
            CampaignEvent::Finished(state) => final_state = state,
        }
    }
    (outcomes, final_state)
}

async fn status_of(store: &MemoryRecipientStore, address: &str) -> RecipientStatus {
    store
        .list()
        .await
        .unwrap()
        .into_iter()
        .find(|r| r.address == address)
        .unwrap()
        .status
}

// ── Scenarios ───────────────────────────────────────────────────────

#[tokio::test]
async fn quota_of_two_pauses_after_two_sends() {
    let dir = tempfile::tempdir().unwrap();
    let store = recipients(&["a@x.com", "b@x.com", "c@x.com"]);
    let relay = Arc::new(ScriptedRelay::ok());
    let ledger = Arc::new(JsonFileLedger::open(dir.path(), "quota").unwrap());

    let deps = CampaignDeps {
        store: store.clone(),
        relay: relay.clone(),
        renderer: renderer(),
        ledger: ledger.clone(),
    };
    let mut handle = Campaign::start("quota", deps, fast_limits(2)).await.unwrap();
    let (outcomes, state) = collect_events(&mut handle).await;

    assert_eq!(
        outcomes,
        vec![("a@x.com".to_string(), true), ("b@x.com".to_string(), true)]
    );
    assert_eq!(state, CampaignState::Paused);
    assert_eq!(ledger.load("quota").await.unwrap().sent_today, 2);
    assert_eq!(status_of(&store, "c@x.com").await, RecipientStatus::Pending);
    assert_eq!(relay.calls().await.len(), 2);
}

#[tokio::test]
async fn resume_with_exhausted_quota_makes_zero_attempts() {
    let dir = tempfile::tempdir().unwrap();
    let store = recipients(&["a@x.com", "b@x.com"]);
    let relay = Arc::new(ScriptedRelay::ok());

    {
        let ledger = JsonFileLedger::open(dir.path(), "resume").unwrap();
        let mut record = ledger.load("resume").await.unwrap();
        record.sent_today = 2;
        ledger.save(&record).await.unwrap();
    }

    let deps = CampaignDeps {
        store,
        relay: relay.clone(),
        renderer: renderer(),
        ledger: Arc::new(JsonFileLedger::open(dir.path(), "resume").unwrap()),
    };
    let mut handle = Campaign::start("resume", deps, fast_limits(2)).await.unwrap();
    let (outcomes, state) = collect_events(&mut handle).await;

    assert!(outcomes.is_empty());
    assert_eq!(state, CampaignState::Paused);
    assert!(relay.calls().await.is_empty());
}

#[tokio::test]
async fn new_day_resets_quota_but_not_delivery_history() {
    let dir = tempfile::tempdir().unwrap();
    let mut sent_yesterday = Recipient::new("done@x.com");
    sent_yesterday.status = RecipientStatus::Sent;
    let store = Arc::new(MemoryRecipientStore::new(vec![
        sent_yesterday,
        Recipient::new("new@x.com"),
    ]));
    let relay = Arc::new(ScriptedRelay::ok());

    // Yesterday's record: quota fully used, both addresses processed.
    {
        let ledger = JsonFileLedger::open(dir.path(), "rollover").unwrap();
        let record = ProgressRecord {
            campaign_id: "rollover".into(),
            date: NaiveDate::from_ymd_opt(2020, 1, 1).unwrap(),
            sent_today: 2,
            processed: ["done@x.com".to_string(), "new@x.com".to_string()]
                .into_iter()
                .collect(),
        };
        ledger.save(&record).await.unwrap();
    }

    let ledger = Arc::new(JsonFileLedger::open(dir.path(), "rollover").unwrap());
    let deps = CampaignDeps {
        store: store.clone(),
        relay: relay.clone(),
        renderer: renderer(),
        ledger: ledger.clone(),
    };
    let mut handle = Campaign::start("rollover", deps, fast_limits(2)).await.unwrap();
    let (outcomes, state) = collect_events(&mut handle).await;

    // Only the not-yet-sent recipient is attempted; prior deliveries stick.
    assert_eq!(outcomes, vec![("new@x.com".to_string(), true)]);
    assert_eq!(state, CampaignState::Completed);
    assert_eq!(relay.calls().await, vec!["new@x.com".to_string()]);

    let record = ledger.load("rollover").await.unwrap();
    assert_eq!(record.sent_today, 1);
    assert_eq!(record.date, Utc::now().date_naive());
}

#[tokio::test]
async fn per_recipient_failure_does_not_abort_the_run() {
    let dir = tempfile::tempdir().unwrap();
    let store = recipients(&["bad@x.com", "good@x.com"]);
    let relay = Arc::new(ScriptedRelay::with_failures([(
        "bad@x.com",
        SendErrorKind::RecipientRejected,
    )]));

    let deps = CampaignDeps {
        store: store.clone(),
        relay,
        renderer: renderer(),
        ledger: Arc::new(JsonFileLedger::open(dir.path(), "mixed").unwrap()),
    };
    let mut handle = Campaign::start("mixed", deps, fast_limits(10)).await.unwrap();
    let (outcomes, state) = collect_events(&mut handle).await;

    assert_eq!(
        outcomes,
        vec![
            ("bad@x.com".to_string(), false),
            ("good@x.com".to_string(), true)
        ]
    );
    assert_eq!(state, CampaignState::Completed);
    assert_eq!(status_of(&store, "bad@x.com").await, RecipientStatus::Failed);
    assert_eq!(status_of(&store, "good@x.com").await, RecipientStatus::Sent);
}

#[tokio::test]
async fn auth_error_fails_the_run_and_leaves_recipients_pending() {
    let dir = tempfile::tempdir().unwrap();
    let store = recipients(&["a@x.com", "b@x.com", "c@x.com"]);
    let relay = Arc::new(ScriptedRelay::with_failures([(
        "a@x.com",
        SendErrorKind::Auth,
    )]));

    let deps = CampaignDeps {
        store: store.clone(),
        relay: relay.clone(),
        renderer: renderer(),
        ledger: Arc::new(JsonFileLedger::open(dir.path(), "auth").unwrap()),
    };
    let mut handle = Campaign::start("auth", deps, fast_limits(10)).await.unwrap();
    let controller = handle.controller();
    let (outcomes, state) = collect_events(&mut handle).await;

    // The aborted attempt emits no outcome; nothing past it is tried.
    assert!(outcomes.is_empty());
    assert_eq!(state, CampaignState::Failed);
    assert_eq!(relay.calls().await, vec!["a@x.com".to_string()]);
    for address in ["a@x.com", "b@x.com", "c@x.com"] {
        assert_eq!(status_of(&store, address).await, RecipientStatus::Pending);
    }
    let reason = controller.last_error().unwrap();
    assert!(reason.contains("auth"), "unexpected error: {reason}");
}

#[tokio::test]
async fn cancel_after_first_attempt_skips_the_rest() {
    let dir = tempfile::tempdir().unwrap();
    let store = recipients(&["a@x.com", "b@x.com", "c@x.com", "d@x.com", "e@x.com"]);
    let (relay, mut started, permits) = GatedRelay::new();

    let deps = CampaignDeps {
        store: store.clone(),
        relay: Arc::new(relay),
        renderer: renderer(),
        ledger: Arc::new(JsonFileLedger::open(dir.path(), "cancel").unwrap()),
    };
    let mut handle = Campaign::start("cancel", deps, fast_limits(10)).await.unwrap();

    // Cancel while the first attempt is in flight: it still runs to
    // completion, then the sweep takes over at the next safe point.
    assert_eq!(started.recv().await.unwrap(), "a@x.com");
    handle.cancel();
    handle.cancel(); // idempotent
    permits.send(()).unwrap();

    let (outcomes, state) = collect_events(&mut handle).await;
    assert_eq!(outcomes, vec![("a@x.com".to_string(), true)]);
    assert_eq!(state, CampaignState::Cancelled);

    assert_eq!(status_of(&store, "a@x.com").await, RecipientStatus::Sent);
    for address in ["b@x.com", "c@x.com", "d@x.com", "e@x.com"] {
        assert_eq!(status_of(&store, address).await, RecipientStatus::Skipped);
    }

    // The sweep changes status only; untried recipients record no attempt.
    for r in store.list().await.unwrap() {
        if r.address == "a@x.com" {
            assert_eq!(r.attempt_count, 1);
        } else {
            assert_eq!(r.attempt_count, 0, "{}", r.address);
            assert!(r.last_attempt_at.is_none());
        }
    }
}

#[tokio::test]
async fn pause_then_restart_resumes_where_it_left_off() {
    let dir = tempfile::tempdir().unwrap();
    let store = recipients(&["a@x.com", "b@x.com"]);
    let (relay, mut started, permits) = GatedRelay::new();

    let deps = CampaignDeps {
        store: store.clone(),
        relay: Arc::new(relay),
        renderer: renderer(),
        ledger: Arc::new(JsonFileLedger::open(dir.path(), "pause").unwrap()),
    };
    let mut handle = Campaign::start("pause", deps, fast_limits(10)).await.unwrap();

    assert_eq!(started.recv().await.unwrap(), "a@x.com");
    handle.pause();
    permits.send(()).unwrap();

    let (outcomes, state) = collect_events(&mut handle).await;
    assert_eq!(outcomes, vec![("a@x.com".to_string(), true)]);
    assert_eq!(state, CampaignState::Paused);
    assert_eq!(status_of(&store, "b@x.com").await, RecipientStatus::Pending);

    // A fresh start with the same campaign id picks up the ledger and
    // only attempts the remaining recipient.
    let relay = Arc::new(ScriptedRelay::ok());
    let deps = CampaignDeps {
        store: store.clone(),
        relay: relay.clone(),
        renderer: renderer(),
        ledger: Arc::new(JsonFileLedger::open(dir.path(), "pause").unwrap()),
    };
    let mut handle = Campaign::start("pause", deps, fast_limits(10)).await.unwrap();
    let (outcomes, state) = collect_events(&mut handle).await;

    assert_eq!(outcomes, vec![("b@x.com".to_string(), true)]);
    assert_eq!(state, CampaignState::Completed);
    assert_eq!(relay.calls().await, vec!["b@x.com".to_string()]);
}

#[tokio::test]
async fn ledger_write_failure_is_campaign_fatal() {
    let dir = tempfile::tempdir().unwrap();
    let store = recipients(&["a@x.com", "b@x.com"]);
    let ledger = FlakyLedger {
        inner: JsonFileLedger::open(dir.path(), "flaky").unwrap(),
        saves_before_failure: Mutex::new(1),
    };

    let deps = CampaignDeps {
        store: store.clone(),
        relay: Arc::new(ScriptedRelay::ok()),
        renderer: renderer(),
        ledger: Arc::new(ledger),
    };
    let mut handle = Campaign::start("flaky", deps, fast_limits(10)).await.unwrap();
    let controller = handle.controller();
    let (outcomes, state) = collect_events(&mut handle).await;

    // First attempt persists and is reported; the second attempt's
    // outcome cannot be recorded, so the run halts rather than risking a
    // double send on resume.
    assert_eq!(outcomes, vec![("a@x.com".to_string(), true)]);
    assert_eq!(state, CampaignState::Failed);
    assert!(controller.last_error().unwrap().contains("Ledger"));
}

#[tokio::test]
async fn processed_addresses_are_skipped_within_the_same_day() {
    let dir = tempfile::tempdir().unwrap();
    let store = recipients(&["a@x.com", "b@x.com"]);
    let relay = Arc::new(ScriptedRelay::ok());

    {
        let ledger = JsonFileLedger::open(dir.path(), "skip").unwrap();
        let mut record = ledger.load("skip").await.unwrap();
        record.sent_today = 1;
        record.processed.insert("a@x.com".into());
        ledger.save(&record).await.unwrap();
    }

    let deps = CampaignDeps {
        store,
        relay: relay.clone(),
        renderer: renderer(),
        ledger: Arc::new(JsonFileLedger::open(dir.path(), "skip").unwrap()),
    };
    let mut handle = Campaign::start("skip", deps, fast_limits(10)).await.unwrap();
    let (outcomes, state) = collect_events(&mut handle).await;

    assert_eq!(outcomes, vec![("b@x.com".to_string(), true)]);
    assert_eq!(state, CampaignState::Completed);
    assert_eq!(relay.calls().await, vec!["b@x.com".to_string()]);
}
