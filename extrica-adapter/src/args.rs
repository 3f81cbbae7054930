use std::path::PathBuf;

use clap::{Args as ClapArgs, Parser, Subcommand};

/// Runs SQL against Extrica using the connection settings of a dbt profile
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Profiles file containing the connection settings, usually `~/.dbt/profiles.yml`.
    #[arg(short, long)]
    pub profiles_file: PathBuf,

    /// Profile to use. Can be omitted if the file only contains a single profile.
    #[arg(long)]
    pub profile: Option<String>,

    /// Output of the profile to use instead of its default target.
    #[arg(short, long)]
    pub target: Option<String>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Shows the connection settings and checks that the engine can be queried.
    Debug,

    /// Executes SQL and prints the response and the rows of the last statement as JSON.
    Run(RunArgs),
}

#[derive(ClapArgs, Debug)]
pub struct RunArgs {
    /// SQL to execute, may contain multiple statements.
    #[arg(long, required_unless_present = "sql_file", conflicts_with = "sql_file")]
    pub sql: Option<String>,

    /// File to read the SQL from.
    #[arg(long)]
    pub sql_file: Option<PathBuf>,

    /// Maximum number of rows to print.
    #[arg(long)]
    pub limit: Option<usize>,
}
