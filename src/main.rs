use std::sync::Arc;

use mailflow::campaign::{Campaign, CampaignDeps, CampaignEvent};
use mailflow::config::{CampaignLimits, SmtpConfig};
use mailflow::ledger::JsonFileLedger;
use mailflow::recipient::JsonRecipientStore;
use mailflow::relay::SmtpRelay;
use mailflow::render::{MessageTemplate, TemplateRenderer};

use anyhow::Context;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let campaign_id =
        std::env::var("MAILFLOW_CAMPAIGN_ID").unwrap_or_else(|_| "default".to_string());
    let recipients_path =
        std::env::var("MAILFLOW_RECIPIENTS").unwrap_or_else(|_| "./recipients.json".to_string());
    let template_path =
        std::env::var("MAILFLOW_TEMPLATE").unwrap_or_else(|_| "./template.json".to_string());
    let ledger_dir =
        std::env::var("MAILFLOW_LEDGER_DIR").unwrap_or_else(|_| "./data/ledger".to_string());

    let Some(smtp_config) = SmtpConfig::from_env() else {
        eprintln!("Error: MAILFLOW_SMTP_HOST not set");
        eprintln!("  export MAILFLOW_SMTP_HOST=smtp.gmail.com");
        eprintln!("  export MAILFLOW_SMTP_USERNAME=you@example.com");
        eprintln!("  export MAILFLOW_SMTP_PASSWORD=app-password");
        std::process::exit(1);
    };
    let limits = CampaignLimits::from_env()?;

    eprintln!("📨 mailflow v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("   Campaign: {}", campaign_id);
    eprintln!("   Relay: {}:{}", smtp_config.host, smtp_config.port);
    eprintln!("   Recipients: {}", recipients_path);
    eprintln!("   Ledger: {}", ledger_dir);
    eprintln!(
        "   Limits: {}-{}s delay, {}/day",
        limits.min_delay_secs, limits.max_delay_secs, limits.max_per_day
    );
    eprintln!("   Ctrl-C pauses after the in-flight send; re-run to resume.\n");

    let template = MessageTemplate::from_file(&template_path)
        .with_context(|| format!("loading template {template_path}"))?;
    let from_address = smtp_config.from_address.clone();

    let deps = CampaignDeps {
        store: Arc::new(
            JsonRecipientStore::open(&recipients_path)
                .await
                .with_context(|| format!("loading recipients {recipients_path}"))?,
        ),
        relay: Arc::new(SmtpRelay::new(smtp_config)),
        renderer: Arc::new(TemplateRenderer::new(template, from_address)),
        ledger: Arc::new(JsonFileLedger::open(&ledger_dir, &campaign_id)?),
    };

    let mut handle = Campaign::start(&campaign_id, deps, limits).await?;

    // Ctrl-C requests a cooperative pause; progress is already persisted
    // per attempt, so the run resumes losslessly.
    let controller = handle.controller();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("Ctrl-C received, pausing after current send");
            controller.pause();
        }
    });

    let mut sent = 0u32;
    let mut failed = 0u32;
    while let Some(event) = handle.next_event().await {
        match event {
            CampaignEvent::Outcome(outcome) => {
                if outcome.succeeded {
                    sent += 1;
                    tracing::info!(address = %outcome.address, "Sent");
                } else {
                    failed += 1;
                    tracing::warn!(
                        address = %outcome.address,
                        kind = ?outcome.error_kind,
                        "Failed"
                    );
                }
            }
            CampaignEvent::Finished(state) => {
                eprintln!("\n   Run finished: {state}");
                eprintln!("   Sent: {sent}, Failed: {failed}");
                if let Some(reason) = handle.last_error() {
                    eprintln!("   Error: {reason}");
                }
            }
        }
    }

    Ok(())
}
