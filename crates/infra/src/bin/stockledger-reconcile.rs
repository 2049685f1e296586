//! Verify that every stock record of an organization matches its ledger.
//!
//! Usage: `stockledger-reconcile <organization-id>`

use anyhow::{Context, bail};
use uuid::Uuid;

use stockledger_core::OrganizationId;
use stockledger_infra::bootstrap;
use stockledger_infra::config::Settings;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let settings = Settings::load().context("loading configuration")?;
    stockledger_observability::init_with(&settings.logging.filter, settings.logging.json);

    let Some(raw) = std::env::args().nth(1) else {
        bail!("usage: stockledger-reconcile <organization-id>");
    };
    let organization_id = OrganizationId::from_uuid(
        Uuid::parse_str(&raw).with_context(|| format!("invalid organization id {raw:?}"))?,
    );

    let services = bootstrap::services(&settings)
        .await
        .context("opening inventory store")?;
    let report = services.queries.reconcile(organization_id).await?;

    for line in &report.lines {
        match &line.problem {
            None => println!(
                "ok    {}  quantity={} entries={}",
                line.stock, line.recorded_quantity, line.entries
            ),
            Some(problem) => println!("FAIL  {}  {}", line.stock, problem),
        }
    }

    let failures = report.discrepancies().count();
    if failures > 0 {
        bail!(
            "{failures} of {} stock records do not reconcile",
            report.lines.len()
        );
    }
    println!("{} stock records reconcile", report.lines.len());
    Ok(())
}
