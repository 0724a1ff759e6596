//! Inter-send delay scheduling.
//!
//! A fixed cadence is a detectable signature; each pause is therefore an
//! independent uniform draw from the operator's `[min, max]` band, which
//! keeps expected throughput at the band midpoint without periodicity.

use std::time::Duration;

use rand::Rng;

use crate::config::CampaignLimits;

/// Computes the pause between consecutive send attempts.
#[derive(Debug, Default, Clone, Copy)]
pub struct DelayScheduler;

impl DelayScheduler {
    pub fn new() -> Self {
        Self
    }

    /// Next pause, sampled uniformly from `[min_delay_secs, max_delay_secs]`
    /// inclusive. Each call re-samples independently.
    pub fn next_delay(&self, limits: &CampaignLimits) -> Duration {
        let secs = if limits.min_delay_secs == limits.max_delay_secs {
            limits.min_delay_secs
        } else {
            rand::thread_rng().gen_range(limits.min_delay_secs..=limits.max_delay_secs)
        };
        Duration::from_secs(secs)
    }
}
