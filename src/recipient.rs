//! Recipient records and the store the orchestrator reads and updates.

use std::collections::BTreeMap;
use std::path::PathBuf;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;

use crate::error::{CampaignError, Error, Result};

/// Per-campaign contact status of a recipient.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecipientStatus {
    Pending,
    Sent,
    Failed,
    Skipped,
}

/// A single recipient. Identity is the address, unique within a campaign.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct Recipient {
    pub address: String,
    #[serde(default)]
    pub display_name: Option<String>,
    #[serde(default)]
    pub company: Option<String>,
    /// Free-form per-recipient fields, available to the renderer.
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
    #[serde(default = "default_status")]
    pub status: RecipientStatus,
    #[serde(default)]
    pub last_attempt_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub attempt_count: u32,
}

fn default_status() -> RecipientStatus {
    RecipientStatus::Pending
}

impl Recipient {
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            display_name: None,
            company: None,
            metadata: BTreeMap::new(),
            status: RecipientStatus::Pending,
            last_attempt_at: None,
            attempt_count: 0,
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.display_name = Some(name.into());
        self
    }

    pub fn with_company(mut self, company: impl Into<String>) -> Self {
        self.company = Some(company.into());
        self
    }

    /// Set the status; only `Sent` and `Failed` record an actual attempt.
    /// A cancellation sweep marking recipients `Skipped` must not make
    /// them look as if they were ever tried.
    fn apply_status(&mut self, status: RecipientStatus, timestamp: DateTime<Utc>) {
        self.status = status;
        if matches!(status, RecipientStatus::Sent | RecipientStatus::Failed) {
            self.last_attempt_at = Some(timestamp);
            self.attempt_count += 1;
        }
    }
}

/// Minimal RFC-shape check: one `@`, non-empty local part, and a domain
/// with at least one dot and no whitespace. Full validation is the
/// importer's job; this is the fail-fast gate before a run starts.
pub fn is_valid_address(address: &str) -> bool {
    let mut parts = address.splitn(2, '@');
    let (Some(local), Some(domain)) = (parts.next(), parts.next()) else {
        return false;
    };
    if local.is_empty() || domain.len() < 3 {
        return false;
    }
    if domain.contains('@') || !domain.contains('.') {
        return false;
    }
    if domain.starts_with('.') || domain.ends_with('.') {
        return false;
    }
    !address.chars().any(char::is_whitespace)
}

/// Collapse duplicate addresses (case-insensitive), preserving first-seen
/// order. Last occurrence wins for name, company, and metadata.
pub fn dedup_recipients(recipients: Vec<Recipient>) -> Vec<Recipient> {
    let mut order: Vec<String> = Vec::new();
    let mut by_key: BTreeMap<String, Recipient> = BTreeMap::new();

    for mut r in recipients {
        let key = r.address.to_ascii_lowercase();
        match by_key.get_mut(&key) {
            Some(existing) => {
                if r.display_name.is_some() {
                    existing.display_name = r.display_name.take();
                }
                if r.company.is_some() {
                    existing.company = r.company.take();
                }
                existing.metadata.append(&mut r.metadata);
            }
            None => {
                order.push(key.clone());
                by_key.insert(key, r);
            }
        }
    }

    order
        .into_iter()
        .filter_map(|key| by_key.remove(&key))
        .collect()
}

/// Read/update contract the orchestrator depends on. Backends own the
/// recipient records; the orchestrator only mutates status through
/// `update_status`.
#[async_trait]
pub trait RecipientStore: Send + Sync {
    /// All recipients, in campaign order.
    async fn list(&self) -> Result<Vec<Recipient>>;

    /// Record the outcome of an attempt for one address. `Sent` and
    /// `Failed` bump the attempt counters; `Skipped` changes status only.
    async fn update_status(
        &self,
        address: &str,
        status: RecipientStatus,
        timestamp: DateTime<Utc>,
    ) -> Result<()>;
}

/// In-memory store for tests and ad hoc one-shot lists.
pub struct MemoryRecipientStore {
    recipients: Mutex<Vec<Recipient>>,
}

impl MemoryRecipientStore {
    pub fn new(recipients: Vec<Recipient>) -> Self {
        Self {
            recipients: Mutex::new(dedup_recipients(recipients)),
        }
    }
}

#[async_trait]
impl RecipientStore for MemoryRecipientStore {
    async fn list(&self) -> Result<Vec<Recipient>> {
        Ok(self.recipients.lock().await.clone())
    }

    async fn update_status(
        &self,
        address: &str,
        status: RecipientStatus,
        timestamp: DateTime<Utc>,
    ) -> Result<()> {
        let mut recipients = self.recipients.lock().await;
        let found = recipients
            .iter_mut()
            .find(|r| r.address.eq_ignore_ascii_case(address));
        match found {
            Some(r) => {
                r.apply_status(status, timestamp);
                Ok(())
            }
            None => Err(Error::Campaign(CampaignError::InvalidInput(format!(
                "unknown recipient address {address}"
            )))),
        }
    }
}

/// JSON-file backed store. Keeps the whole list in memory and rewrites
/// the file (fsynced temp file + rename) on every status update, so a
/// recorded `Sent` status survives a crash.
pub struct JsonRecipientStore {
    path: PathBuf,
    recipients: Mutex<Vec<Recipient>>,
}

impl JsonRecipientStore {
    /// Load recipients from a JSON array file. A missing file is an
    /// empty list; the campaign start validation rejects that later.
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let recipients = match tokio::fs::read_to_string(&path).await {
            Ok(raw) => serde_json::from_str::<Vec<Recipient>>(&raw)
                .map_err(|e| crate::error::ConfigError::ParseError(e.to_string()))?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Vec::new(),
            Err(e) => return Err(Error::Config(crate::error::ConfigError::Io(e))),
        };
        Ok(Self {
            path,
            recipients: Mutex::new(dedup_recipients(recipients)),
        })
    }

    async fn persist(&self, recipients: &[Recipient]) -> Result<()> {
        let raw = serde_json::to_string_pretty(recipients)
            .map_err(|e| crate::error::ConfigError::ParseError(e.to_string()))?;
        crate::persist::write_atomic(&self.path, &raw)
            .await
            .map_err(crate::error::ConfigError::Io)?;
        Ok(())
    }
}

#[async_trait]
impl RecipientStore for JsonRecipientStore {
    async fn list(&self) -> Result<Vec<Recipient>> {
        Ok(self.recipients.lock().await.clone())
    }

    async fn update_status(
        &self,
        address: &str,
        status: RecipientStatus,
        timestamp: DateTime<Utc>,
    ) -> Result<()> {
        let mut recipients = self.recipients.lock().await;
        let found = recipients
            .iter_mut()
            .find(|r| r.address.eq_ignore_ascii_case(address));
        let Some(r) = found else {
            return Err(Error::Campaign(CampaignError::InvalidInput(format!(
                "unknown recipient address {address}"
            ))));
        };
        r.apply_status(status, timestamp);
        self.persist(&recipients).await
    }
}
