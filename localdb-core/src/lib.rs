pub mod error;
pub mod files;
pub mod naming;
pub mod orchestrator;
pub mod session;
pub mod tds;
pub mod utility;

pub use error::{LocalDbError, Result};
pub use files::BackingFiles;
pub use naming::{sanitize, Identifier, ProcessIdentity, Scope};
pub use orchestrator::{seed, select_name, verify, Orchestrator, RunError, Stage, DEFAULT_RECORD_NAME};
pub use session::{exactly_one, Connector, MemoryConnector, Record, Session, Target};
pub use tds::{TdsConnector, TdsSession};
pub use utility::{
    InstanceInfo, Invoker, MockInvoker, Output, ProcessInvoker, SqlLocalDb, UtilityCommand,
    DEFAULT_PROGRAM,
};
