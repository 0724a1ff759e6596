//! Progress ledger: durable per-campaign record of daily volume and
//! processed addresses, so an interrupted run resumes without re-sending.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{NaiveDate, Utc};

use crate::error::LedgerError;

/// Persisted progress for one campaign id.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct ProgressRecord {
    pub campaign_id: String,
    /// Calendar day (UTC) the counters belong to.
    pub date: NaiveDate,
    /// Successful sends recorded for `date`.
    pub sent_today: u32,
    /// Addresses attempted (sent or failed) on `date`.
    pub processed: BTreeSet<String>,
}

impl ProgressRecord {
    /// Fresh zero record for a campaign id.
    pub fn new(campaign_id: impl Into<String>, date: NaiveDate) -> Self {
        Self {
            campaign_id: campaign_id.into(),
            date,
            sent_today: 0,
            processed: BTreeSet::new(),
        }
    }

    /// Reset daily counters when the stored date differs from `today`.
    /// Returns true if a rollover happened. Quota and the processed set
    /// are daily; cumulative delivery history lives on the recipients.
    pub fn rollover(&mut self, today: NaiveDate) -> bool {
        if self.date == today {
            return false;
        }
        self.date = today;
        self.sent_today = 0;
        self.processed.clear();
        true
    }

    /// Whether the daily quota is exhausted.
    pub fn quota_reached(&self, max_per_day: u32) -> bool {
        self.sent_today >= max_per_day
    }
}

/// Durable record store for campaign progress.
///
/// `save` must complete before the orchestrator moves to the next attempt;
/// a crash right after a successful send must not re-send that recipient.
#[async_trait]
pub trait ProgressLedger: Send + Sync {
    /// Load the record for a campaign id, creating a fresh zero record
    /// if none exists. Day rollover is applied before returning.
    async fn load(&self, campaign_id: &str) -> Result<ProgressRecord, LedgerError>;

    /// Persist the record. Write failures are campaign-fatal.
    async fn save(&self, record: &ProgressRecord) -> Result<(), LedgerError>;

    /// Current calendar day for rollover checks. Fixed to UTC.
    fn today(&self) -> NaiveDate {
        Utc::now().date_naive()
    }
}

/// One JSON file per campaign id under a directory, replaced through a
/// fsynced temp file + rename so a saved record survives power loss.
/// An exclusive `.lock` file per campaign guards
/// against two orchestrators driving the same campaign id concurrently.
pub struct JsonFileLedger {
    dir: PathBuf,
    campaign_id: String,
    _lock: LedgerLock,
}

impl JsonFileLedger {
    /// Open the ledger directory for a campaign, taking the lock.
    /// Fails with `LedgerError::Locked` if another process holds it.
    pub fn open(dir: impl Into<PathBuf>, campaign_id: &str) -> Result<Self, LedgerError> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;
        let lock = LedgerLock::acquire(&dir, campaign_id)?;
        Ok(Self {
            dir,
            campaign_id: campaign_id.to_string(),
            _lock: lock,
        })
    }

    fn record_path(&self, campaign_id: &str) -> PathBuf {
        self.dir.join(format!("{}.json", sanitize_id(campaign_id)))
    }
}

#[async_trait]
impl ProgressLedger for JsonFileLedger {
    async fn load(&self, campaign_id: &str) -> Result<ProgressRecord, LedgerError> {
        let path = self.record_path(campaign_id);
        let mut record = match tokio::fs::read_to_string(&path).await {
            Ok(raw) => {
                serde_json::from_str::<ProgressRecord>(&raw).map_err(|e| LedgerError::Corrupt {
                    campaign_id: campaign_id.to_string(),
                    reason: e.to_string(),
                })?
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                ProgressRecord::new(campaign_id, self.today())
            }
            Err(e) => return Err(LedgerError::Io(e)),
        };

        if record.rollover(self.today()) {
            tracing::info!(campaign_id, "Ledger day rolled over, daily counters reset");
        }
        Ok(record)
    }

    async fn save(&self, record: &ProgressRecord) -> Result<(), LedgerError> {
        let path = self.record_path(&record.campaign_id);
        let raw = serde_json::to_string_pretty(record)?;
        crate::persist::write_atomic(&path, &raw).await?;
        Ok(())
    }
}

/// Exclusive lock file, removed on drop. `create_new` makes acquisition
/// atomic on every platform we care about.
struct LedgerLock {
    path: PathBuf,
}

impl LedgerLock {
    fn acquire(dir: &Path, campaign_id: &str) -> Result<Self, LedgerError> {
        let path = dir.join(format!("{}.lock", sanitize_id(campaign_id)));
        match std::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
        {
            Ok(_) => Ok(Self { path }),
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => Err(LedgerError::Locked {
                campaign_id: campaign_id.to_string(),
            }),
            Err(e) => Err(LedgerError::Io(e)),
        }
    }
}

impl Drop for LedgerLock {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_file(&self.path) {
            tracing::warn!(path = %self.path.display(), "Failed to remove ledger lock: {e}");
        }
    }
}

/// Keep campaign ids filesystem-safe.
fn sanitize_id(campaign_id: &str) -> String {
    campaign_id
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect()
}
