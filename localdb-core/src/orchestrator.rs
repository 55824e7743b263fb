//! Run lifecycle
//!
//! `Start → NameSelected → PreCleaned → InstanceCreated → Seeded → Verified →
//! TornDown → PostCleaned → Done`, strictly in order. The first failing step
//! ends the run; [`RunError`] records the last stage that was reached.

use std::fmt;

use thiserror::Error;
use tracing::info;

use crate::error::{LocalDbError, Result};
use crate::files::BackingFiles;
use crate::naming::{Identifier, ProcessIdentity, Scope};
use crate::session::{Connector, Record, Session, Target};
use crate::utility::SqlLocalDb;

/// Name written by the seeding session
pub const DEFAULT_RECORD_NAME: &str = "test";

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Stage {
    Start,
    NameSelected,
    PreCleaned,
    InstanceCreated,
    Seeded,
    Verified,
    TornDown,
    PostCleaned,
    Done,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Start => "start",
            Stage::NameSelected => "name-selected",
            Stage::PreCleaned => "pre-cleaned",
            Stage::InstanceCreated => "instance-created",
            Stage::Seeded => "seeded",
            Stage::Verified => "verified",
            Stage::TornDown => "torn-down",
            Stage::PostCleaned => "post-cleaned",
            Stage::Done => "done",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A failed run and how far it got
#[derive(Error, Debug)]
#[error("run failed after stage '{stage}': {source}")]
pub struct RunError {
    pub stage: Stage,
    #[source]
    pub source: LocalDbError,
}

struct Progress {
    stage: Stage,
}

impl Progress {
    fn advance<T>(&mut self, next: Stage, result: Result<T>) -> std::result::Result<T, RunError> {
        match result {
            Ok(value) => {
                self.stage = next;
                info!(stage = %next, "Stage complete");
                Ok(value)
            }
            Err(source) => Err(RunError {
                stage: self.stage,
                source,
            }),
        }
    }
}

/// First step of a run: derive the identifier for `scope` (`Start → NameSelected`)
pub fn select_name(
    scope: Scope,
    identity: &ProcessIdentity,
) -> std::result::Result<Identifier, RunError> {
    let mut progress = Progress { stage: Stage::Start };
    let id = progress.advance(Stage::NameSelected, Identifier::from_scope(scope, identity))?;
    info!(scope = %scope, identifier = %id, "Selected instance name");
    Ok(id)
}

pub struct Orchestrator<'a> {
    target: Target,
    utility: &'a SqlLocalDb,
    connector: &'a dyn Connector,
    seed: Vec<String>,
}

impl<'a> Orchestrator<'a> {
    /// `id` comes from [`select_name`]; the run continues from `NameSelected`
    pub fn new(
        id: Identifier,
        files: BackingFiles,
        utility: &'a SqlLocalDb,
        connector: &'a dyn Connector,
    ) -> Self {
        Self {
            target: Target::new(id, files),
            utility,
            connector,
            seed: vec![DEFAULT_RECORD_NAME.to_string()],
        }
    }

    /// Replace the names written by the seeding session
    pub fn with_seed<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.seed = names.into_iter().map(Into::into).collect();
        self
    }

    pub fn target(&self) -> &Target {
        &self.target
    }

    /// Execute the whole lifecycle and return the record read back
    pub async fn run(&self) -> std::result::Result<Record, RunError> {
        let id = &self.target.database;
        let mut progress = Progress {
            stage: Stage::NameSelected,
        };
        info!(identifier = %id, "Starting ephemeral LocalDB run");

        let removed = progress.advance(Stage::PreCleaned, self.target.files.remove())?;
        info!(removed, "Removed stale backing files");

        progress.advance(Stage::InstanceCreated, self.utility.create(id).await)?;

        let seeded = progress.advance(
            Stage::Seeded,
            seed(self.connector, &self.target, &self.seed).await,
        )?;
        info!(seeded, "Seeded database");

        let record = progress.advance(Stage::Verified, verify(self.connector, &self.target).await)?;

        progress.advance(Stage::TornDown, self.teardown().await)?;
        progress.advance(Stage::PostCleaned, self.target.files.remove())?;
        progress.advance(Stage::Done, Ok(()))?;

        Ok(record)
    }

    async fn teardown(&self) -> Result<()> {
        let id = &self.target.database;
        self.utility.stop(id).await?;
        self.utility.delete(id).await?;
        Ok(())
    }
}

/// Recreate the database from scratch and write one record per name
pub async fn seed(connector: &dyn Connector, target: &Target, names: &[String]) -> Result<usize> {
    let mut session = connector.connect(target).await?;
    let outcome = populate(session.as_mut(), names).await;
    finish(session, outcome).await
}

/// Read back the single record from a fresh session
pub async fn verify(connector: &dyn Connector, target: &Target) -> Result<Record> {
    let mut session = connector.connect(target).await?;
    let outcome = session.single().await;
    finish(session, outcome).await
}

async fn populate(session: &mut dyn Session, names: &[String]) -> Result<usize> {
    session.ensure_deleted().await?;
    session.ensure_created().await?;
    for name in names {
        session.add(Record::new(name.as_str()));
    }
    session.save_changes().await
}

/// Close the session whatever happened; the body's error takes precedence
async fn finish<T>(session: Box<dyn Session>, outcome: Result<T>) -> Result<T> {
    let closed = session.close().await;
    let value = outcome?;
    closed?;
    Ok(value)
}
