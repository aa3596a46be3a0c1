use super::query::QueryArgs;
use clap::{Parser, Subcommand, ValueHint};
use std::path::PathBuf;

#[derive(Debug, Parser)]
#[command(name = "quarry")]
#[command(about = "Run permission-aware relational queries against a SQLite database")]
pub struct Cli {
    /// Path to the SQLite file (required when multiple database files exist).
    #[arg(long, global = true, value_hint = ValueHint::FilePath)]
    pub path: Option<PathBuf>,

    /// Engine config JSON.
    #[arg(long, global = true, value_hint = ValueHint::FilePath)]
    pub config: Option<PathBuf>,

    /// Schema JSON; the database is introspected when omitted.
    #[arg(long, global = true, value_hint = ValueHint::FilePath)]
    pub schema: Option<PathBuf>,

    /// Policy JSON; requests run as admin when omitted.
    #[arg(long, global = true, value_hint = ValueHint::FilePath)]
    pub policies: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Read rows of a collection as nested objects.
    Query(QueryArgs),
    /// Print the root statement a query compiles to.
    Explain(QueryArgs),
    /// Print the schema the engine resolves queries against.
    Schema,
}
