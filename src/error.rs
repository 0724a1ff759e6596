//! Error types for mailflow.

/// Top-level error type for the crate.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Ledger error: {0}")]
    Ledger(#[from] LedgerError),

    #[error("Send error: {0}")]
    Send(#[from] SendError),

    #[error("Campaign error: {0}")]
    Campaign(#[from] CampaignError),
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    #[error("Failed to parse configuration: {0}")]
    ParseError(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Progress ledger errors. Any write failure is campaign-fatal: the
/// orchestrator must never move past a recipient whose outcome could not
/// be durably recorded.
#[derive(Debug, thiserror::Error)]
pub enum LedgerError {
    #[error("Ledger for campaign {campaign_id} is locked by another process")]
    Locked { campaign_id: String },

    #[error("Corrupt ledger record for campaign {campaign_id}: {reason}")]
    Corrupt { campaign_id: String, reason: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Classified relay delivery failure kind.
///
/// `Auth` aborts the whole campaign; the other kinds mark the single
/// recipient `Failed` and the loop continues.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SendErrorKind {
    /// Authentication or credentials rejected by the relay.
    Auth,
    /// Connection failure, timeout, or transient relay-side condition.
    TransientNetwork,
    /// The relay refused this specific recipient address.
    RecipientRejected,
    /// The relay reports its own sending quota exceeded.
    RelayQuotaExceeded,
}

impl SendErrorKind {
    /// Whether this failure cannot succeed for any recipient. Fatal kinds
    /// halt the run instead of being recorded per-recipient.
    pub fn is_fatal(self) -> bool {
        matches!(self, SendErrorKind::Auth)
    }
}

impl std::fmt::Display for SendErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            SendErrorKind::Auth => "auth",
            SendErrorKind::TransientNetwork => "transient_network",
            SendErrorKind::RecipientRejected => "recipient_rejected",
            SendErrorKind::RelayQuotaExceeded => "relay_quota_exceeded",
        };
        f.write_str(s)
    }
}

/// A single failed delivery attempt.
#[derive(Debug, Clone, thiserror::Error)]
#[error("Send to {address} failed ({kind}): {reason}")]
pub struct SendError {
    pub address: String,
    pub kind: SendErrorKind,
    pub reason: String,
}

impl SendError {
    pub fn new(address: impl Into<String>, kind: SendErrorKind, reason: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            kind,
            reason: reason.into(),
        }
    }
}

/// Orchestrator-level errors.
#[derive(Debug, thiserror::Error)]
pub enum CampaignError {
    #[error("Invalid input: {0}")]
    InvalidInput(String),
}

/// Result type alias for the crate.
pub type Result<T> = std::result::Result<T, Error>;
