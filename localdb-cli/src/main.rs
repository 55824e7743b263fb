//! ef-ephemeral-localdb - provision a throwaway LocalDB instance, write one
//! record, read it back from a fresh session, and tear everything down.
//!
//! Takes no arguments. On success the record name is the only line on stdout.

use std::sync::Arc;

use anyhow::{Context, Result};
use localdb_core::{
    select_name, BackingFiles, Orchestrator, ProcessIdentity, ProcessInvoker, SqlLocalDb,
    TdsConnector,
};
use tracing::{info, warn};

mod config;
mod tracing_setup;

use config::{LoadReport, Settings};

#[tokio::main]
async fn main() -> Result<()> {
    let mut report = LoadReport::default();
    config::load_dotenv(&mut report);
    let settings = Settings::load(&mut report)?;

    tracing_setup::init(&tracing_setup::TracingConfig {
        debug: settings.log.debug,
    })?;
    for source in &report.loaded {
        info!("Loaded configuration from {}", source);
    }
    for warning in &report.warnings {
        warn!("{}", warning);
    }

    let identity = ProcessIdentity::current()?;
    let scope = settings.scope()?;
    let id = select_name(scope, &identity)
        .with_context(|| format!("Failed to derive identifier for scope '{}'", scope))?;

    let files = BackingFiles::in_profile(&id)?;
    let utility = Arc::new(
        SqlLocalDb::new(Arc::new(ProcessInvoker::new(&settings.utility.program)))
            .with_timeout(settings.timeout()),
    );
    let connector = TdsConnector::new(utility.clone());

    let record = Orchestrator::new(id, files, &utility, &connector)
        .run()
        .await?;

    println!("{}", record.name);
    Ok(())
}
