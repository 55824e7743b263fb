//! TDS sessions against a LocalDB instance
//!
//! LocalDB only listens on a per-instance named pipe, so connecting is a three
//! step affair: start the instance, ask the utility for its pipe, then speak
//! TDS over that pipe with `tiberius`. Sessions log in to `master`; data
//! statements address the target database with three-part names.

use std::borrow::Cow;
use std::sync::Arc;

use async_trait::async_trait;
use futures::io::{AsyncRead, AsyncWrite};
use tiberius::{Client, Config, EncryptionLevel};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::{LocalDbError, Result};
use crate::naming::Identifier;
use crate::session::{exactly_one, Connector, Record, Session, Target};
use crate::utility::SqlLocalDb;

pub const APPLICATION_NAME: &str = "ef-ephemeral-localdb";

/// Any byte stream tiberius can run over
pub trait Duplex: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> Duplex for T {}

type Transport = Box<dyn Duplex>;

/// Opens [`TdsSession`]s, starting the instance on demand
pub struct TdsConnector {
    utility: Arc<SqlLocalDb>,
}

impl TdsConnector {
    pub fn new(utility: Arc<SqlLocalDb>) -> Self {
        Self { utility }
    }

    /// Start the instance (a no-op when running) and return its pipe path
    pub async fn resolve_pipe(&self, id: &Identifier) -> Result<String> {
        self.utility.start(id).await?;
        let info = self.utility.info(id).await?;
        let not_running = |state: &str| LocalDbError::InstanceNotRunning {
            name: id.to_string(),
            state: state.to_string(),
        };

        if !info.is_running() {
            return Err(not_running(info.state.as_deref().unwrap_or("unknown")));
        }
        info.pipe_name.ok_or_else(|| not_running("running without a pipe"))
    }

    fn config() -> Config {
        let mut config = Config::new();
        config.application_name(APPLICATION_NAME);
        // The pipe is local to the machine; LocalDB does not negotiate TLS on it.
        config.encryption(EncryptionLevel::NotSupported);
        #[cfg(windows)]
        config.authentication(tiberius::AuthMethod::Integrated);
        config
    }
}

#[async_trait]
impl Connector for TdsConnector {
    async fn connect(&self, target: &Target) -> Result<Box<dyn Session>> {
        let pipe = self.resolve_pipe(&target.database).await?;
        debug!(pipe = %pipe, "Connecting to LocalDB");

        let stream = open_pipe(&pipe).await?;
        let client = Client::connect(Self::config(), stream).await?;

        Ok(Box::new(TdsSession {
            client,
            target: target.clone(),
            pending: Vec::new(),
        }))
    }
}

#[cfg(windows)]
async fn open_pipe(path: &str) -> Result<Transport> {
    use tokio::net::windows::named_pipe::ClientOptions;
    use tokio_util::compat::TokioAsyncReadCompatExt;

    let pipe = ClientOptions::new()
        .open(path)
        .map_err(|source| LocalDbError::Pipe {
            path: path.to_string(),
            source,
        })?;
    Ok(Box::new(pipe.compat()))
}

#[cfg(not(windows))]
async fn open_pipe(path: &str) -> Result<Transport> {
    Err(LocalDbError::unsupported(format!(
        "LocalDB pipe {} requires Windows named pipes",
        path
    )))
}

pub struct TdsSession {
    client: Client<Transport>,
    target: Target,
    pending: Vec<Record>,
}

impl TdsSession {
    async fn database_exists(&mut self) -> Result<bool> {
        let row = self
            .client
            .query("SELECT DB_ID(@P1)", &[&self.target.database.as_str()])
            .await?
            .into_row()
            .await?;

        Ok(match row {
            Some(row) => row.try_get::<i32, _>(0)?.is_some(),
            None => false,
        })
    }

    async fn batch(&mut self, sql: &str) -> Result<()> {
        debug!(sql = %sql, "Executing batch");
        self.client.simple_query(sql).await?.into_results().await?;
        Ok(())
    }

    async fn insert_pending(&mut self) -> Result<usize> {
        let sql = insert_sql(&self.target.database);
        for record in &self.pending {
            self.client
                .execute(sql.as_str(), &[&record.id, &record.name.as_str()])
                .await?;
        }
        Ok(self.pending.len())
    }
}

#[async_trait]
impl Session for TdsSession {
    async fn ensure_deleted(&mut self) -> Result<bool> {
        if !self.database_exists().await? {
            return Ok(false);
        }
        self.batch(&drop_database_sql(&self.target.database)).await?;
        Ok(true)
    }

    async fn ensure_created(&mut self) -> Result<bool> {
        if self.database_exists().await? {
            return Ok(false);
        }
        self.batch(&create_database_sql(&self.target)).await?;
        self.batch(&create_table_sql(&self.target.database)).await?;
        Ok(true)
    }

    fn add(&mut self, record: Record) {
        self.pending.push(record);
    }

    async fn save_changes(&mut self) -> Result<usize> {
        self.batch("BEGIN TRANSACTION").await?;

        match self.insert_pending().await {
            Ok(saved) => {
                self.batch("COMMIT TRANSACTION").await?;
                self.pending.clear();
                Ok(saved)
            }
            Err(e) => {
                let rollback = self.batch("IF @@TRANCOUNT > 0 ROLLBACK TRANSACTION").await;
                Err(keep_insert_error(e, rollback))
            }
        }
    }

    async fn single(&mut self) -> Result<Record> {
        let rows = self
            .client
            .query(select_sql(&self.target.database), &[])
            .await?
            .into_first_result()
            .await?;

        let mut records = Vec::with_capacity(rows.len());
        for row in rows {
            let id = row.try_get::<Uuid, _>("Id")?;
            let name = row.try_get::<&str, _>("Name")?;
            match (id, name) {
                (Some(id), Some(name)) => records.push(Record {
                    id,
                    name: name.to_string(),
                }),
                _ => {
                    return Err(tiberius::error::Error::Conversion(Cow::Borrowed(
                        "NULL in non-nullable Records column",
                    ))
                    .into())
                }
            }
        }

        exactly_one(records)
    }

    async fn close(self: Box<Self>) -> Result<()> {
        self.client.close().await?;
        Ok(())
    }
}

/// `N'...'` literal with embedded quotes doubled
/// The insert error wins; a failed rollback is only logged
fn keep_insert_error(insert: LocalDbError, rollback: Result<()>) -> LocalDbError {
    if let Err(e) = rollback {
        warn!(error = %e, "Rollback failed after insert error");
    }
    insert
}

fn n_literal(value: &str) -> String {
    format!("N'{}'", value.replace('\'', "''"))
}

fn table_name(db: &Identifier) -> String {
    format!("[{}].[dbo].[Records]", db)
}

fn drop_database_sql(db: &Identifier) -> String {
    format!(
        "IF DB_ID({literal}) IS NOT NULL\n\
         BEGIN\n\
         \x20   ALTER DATABASE [{db}] SET SINGLE_USER WITH ROLLBACK IMMEDIATE;\n\
         \x20   DROP DATABASE [{db}];\n\
         END",
        literal = n_literal(db.as_str()),
        db = db,
    )
}

fn create_database_sql(target: &Target) -> String {
    let db = &target.database;
    format!(
        "CREATE DATABASE [{db}]\n\
         ON PRIMARY (NAME = {data_name}, FILENAME = {data_file})\n\
         LOG ON (NAME = {log_name}, FILENAME = {log_file})",
        db = db,
        data_name = n_literal(db.as_str()),
        data_file = n_literal(&target.files.data.display().to_string()),
        log_name = n_literal(&format!("{}_log", db)),
        log_file = n_literal(&target.files.log.display().to_string()),
    )
}

fn create_table_sql(db: &Identifier) -> String {
    format!(
        "CREATE TABLE {} (\n\
         \x20   [Id] UNIQUEIDENTIFIER NOT NULL PRIMARY KEY,\n\
         \x20   [Name] NVARCHAR(MAX) NOT NULL\n\
         )",
        table_name(db)
    )
}

fn insert_sql(db: &Identifier) -> String {
    format!("INSERT INTO {} ([Id], [Name]) VALUES (@P1, @P2)", table_name(db))
}

fn select_sql(db: &Identifier) -> String {
    format!("SELECT [Id], [Name] FROM {}", table_name(db))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::files::BackingFiles;
    use crate::naming::sanitize;
    use crate::utility::{MockInvoker, Output};

    fn target() -> Target {
        let id = sanitize("demo").unwrap();
        let files = BackingFiles::in_dir("/home/o'neil", &id);
        Target::new(id, files)
    }

    fn connector() -> (Arc<MockInvoker>, TdsConnector) {
        let mock = Arc::new(MockInvoker::new());
        let utility = Arc::new(SqlLocalDb::new(mock.clone()));
        (mock, TdsConnector::new(utility))
    }

    #[test]
    fn test_literals_escape_quotes() {
        assert_eq!(n_literal("o'neil"), "N'o''neil'");
    }

    #[test]
    fn test_create_database_places_backing_files() {
        let target = target();
        let sql = create_database_sql(&target);
        let data = target.files.data.display().to_string().replace('\'', "''");
        let log = target.files.log.display().to_string().replace('\'', "''");

        assert!(sql.starts_with("CREATE DATABASE [demo]"));
        assert!(sql.contains("o''neil"));
        assert!(sql.contains(&format!("NAME = N'demo', FILENAME = N'{}'", data)));
        assert!(sql.contains(&format!("NAME = N'demo_log', FILENAME = N'{}'", log)));
    }

    #[test]
    fn test_drop_is_guarded() {
        let sql = drop_database_sql(&sanitize("demo").unwrap());
        assert!(sql.starts_with("IF DB_ID(N'demo') IS NOT NULL"));
        assert!(sql.contains("SET SINGLE_USER WITH ROLLBACK IMMEDIATE"));
        assert!(sql.contains("DROP DATABASE [demo];"));
    }

    #[test]
    fn test_data_statements_use_three_part_names() {
        let db = sanitize("demo").unwrap();
        assert_eq!(
            insert_sql(&db),
            "INSERT INTO [demo].[dbo].[Records] ([Id], [Name]) VALUES (@P1, @P2)"
        );
        assert_eq!(select_sql(&db), "SELECT [Id], [Name] FROM [demo].[dbo].[Records]");
        assert!(create_table_sql(&db).contains("[Id] UNIQUEIDENTIFIER NOT NULL PRIMARY KEY"));
    }

    #[tokio::test]
    async fn test_resolve_pipe_starts_then_queries_info() {
        let (mock, connector) = connector();
        mock.add_response(Output::success());
        mock.add_response(Output {
            status: 0,
            stdout: "Name: demo\nState: Running\nInstance pipe name: np:\\\\.\\pipe\\LOCALDB#1\\tsql\\query\n"
                .into(),
            stderr: String::new(),
        });

        let pipe = connector.resolve_pipe(&target().database).await.unwrap();
        assert_eq!(pipe, r"\\.\pipe\LOCALDB#1\tsql\query");
        assert_eq!(mock.command_lines(), vec!["start demo", "info demo"]);
    }

    #[tokio::test]
    async fn test_resolve_pipe_without_pipe_fails() {
        let (mock, connector) = connector();
        mock.add_response(Output::success());
        mock.add_response(Output {
            status: 0,
            stdout: "Name: demo\nState: Stopped\n".into(),
            stderr: String::new(),
        });

        let err = connector.resolve_pipe(&target().database).await.unwrap_err();
        assert!(matches!(
            err,
            LocalDbError::InstanceNotRunning { ref state, .. } if state == "Stopped"
        ));
        assert!(err.to_string().contains("state: Stopped"));
    }

    #[tokio::test]
    async fn test_resolve_pipe_running_without_pipe_fails() {
        let (mock, connector) = connector();
        mock.add_response(Output::success());
        mock.add_response(Output {
            status: 0,
            stdout: "Name: demo\nState: Running\nInstance pipe name: \n".into(),
            stderr: String::new(),
        });

        let err = connector.resolve_pipe(&target().database).await.unwrap_err();
        assert!(err.to_string().contains("running without a pipe"));
    }

    #[test]
    fn test_insert_error_kept_when_rollback_fails() {
        let insert = LocalDbError::config("insert failed");
        let rollback = Err(LocalDbError::config("rollback failed"));

        let err = keep_insert_error(insert, rollback);
        assert_eq!(err.to_string(), "Configuration error: insert failed");
    }

    #[test]
    fn test_insert_error_kept_when_rollback_succeeds() {
        let err = keep_insert_error(LocalDbError::config("insert failed"), Ok(()));
        assert!(err.to_string().contains("insert failed"));
    }

    #[tokio::test]
    async fn test_start_failure_aborts_connect() {
        let (mock, connector) = connector();
        mock.add_response(Output::failure(1, "cannot start"));

        let err = connector.connect(&target()).await.err().unwrap();
        assert!(matches!(err, LocalDbError::ExitCode { code: 1, .. }));
        assert_eq!(mock.command_lines(), vec!["start demo"]);
    }

    #[cfg(not(windows))]
    #[tokio::test]
    async fn test_connect_requires_named_pipes() {
        let (mock, connector) = connector();
        mock.add_response(Output::success());
        mock.add_response(Output {
            status: 0,
            stdout: "Name: demo\nInstance pipe name: np:\\\\.\\pipe\\LOCALDB#1\\tsql\\query\n"
                .into(),
            stderr: String::new(),
        });

        let err = connector.connect(&target()).await.err().unwrap();
        assert!(matches!(err, LocalDbError::Unsupported { .. }));
    }
}
