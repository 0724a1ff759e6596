//! Campaign orchestration: the send loop, its control surface, and delay
//! scheduling.

pub mod delay;
pub mod orchestrator;

pub use delay::DelayScheduler;
pub use orchestrator::{
    Campaign, CampaignController, CampaignDeps, CampaignEvent, CampaignHandle, CampaignState,
    SendOutcome,
};
