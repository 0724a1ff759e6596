//! mailflow: rate-limited, resumable outreach email campaigns.

pub mod campaign;
pub mod config;
pub mod error;
pub mod ledger;
mod persist;
pub mod recipient;
pub mod relay;
pub mod render;
