use std::{fs, path::PathBuf, sync::Arc};

use clap::Parser;
use extrica_adapter::{
    connection_manager::{Connection, ConnectionManager},
    driver::TrinoDriver,
    token_cache::{self, TokenCache},
};
use main_error::MainError;
use serde_json::json;
use snafu::{ResultExt, Snafu};

use crate::args::{Args, Command, RunArgs};

mod args;
mod tracing;

const CONNECTION_NAME: &str = "extrica-cli";

#[derive(Snafu, Debug)]
pub enum Error {
    #[snafu(display("Failed to set up tracing"))]
    SetUpTracing { source: tracing::Error },

    #[snafu(display("Failed to load the selected target"))]
    LoadTarget { source: extrica_adapter::Error },

    #[snafu(display("Failed to create token cache"))]
    CreateTokenCache { source: token_cache::Error },

    #[snafu(display("Failed to read SQL from {sql_file:?}"))]
    ReadSqlFile {
        source: std::io::Error,
        sql_file: PathBuf,
    },

    #[snafu(display("No SQL to run was given"))]
    MissingSql,

    #[snafu(display("Failed to open connection"))]
    OpenConnection { source: extrica_adapter::Error },

    #[snafu(display("Failed to execute SQL"))]
    ExecuteSql { source: extrica_adapter::Error },

    #[snafu(display("Failed to close connection"))]
    CloseConnection { source: extrica_adapter::Error },

    #[snafu(display("Failed to serialize result"))]
    SerializeResult { source: serde_json::Error },
}

fn main() -> Result<(), MainError> {
    let args = Args::parse();
    tracing::init().context(SetUpTracingSnafu)?;

    let mut connection = Connection::from_profiles_file(
        CONNECTION_NAME,
        &args.profiles_file,
        args.profile.as_deref(),
        args.target.as_deref(),
    )
    .context(LoadTargetSnafu)?;

    let token_cache = Arc::new(TokenCache::http().context(CreateTokenCacheSnafu)?);
    let manager = ConnectionManager::new(Arc::new(TrinoDriver), token_cache);

    match args.command {
        Command::Debug => {
            println!("Connection:");
            for (key, value) in connection.credentials().connection_info() {
                println!("  {key}: {value}");
            }

            manager
                .open(&mut connection)
                .context(OpenConnectionSnafu)?;
            manager
                .execute(&mut connection, "select 1", false, None)
                .context(ExecuteSqlSnafu)?;
            println!("  Connection test: OK connection ok");
        }
        Command::Run(RunArgs {
            sql,
            sql_file,
            limit,
        }) => {
            let sql = match (sql, sql_file) {
                (Some(sql), _) => sql,
                (None, Some(sql_file)) => {
                    fs::read_to_string(&sql_file).context(ReadSqlFileSnafu { sql_file })?
                }
                (None, None) => MissingSqlSnafu.fail()?,
            };

            manager
                .open(&mut connection)
                .context(OpenConnectionSnafu)?;
            let (response, table) = manager
                .execute(&mut connection, &sql, true, limit)
                .context(ExecuteSqlSnafu)?;

            let output = json!({
                "response": response,
                "table": table,
            });
            println!(
                "{}",
                serde_json::to_string_pretty(&output).context(SerializeResultSnafu)?
            );
        }
    }

    manager
        .close(&mut connection)
        .context(CloseConnectionSnafu)?;
    Ok(())
}
