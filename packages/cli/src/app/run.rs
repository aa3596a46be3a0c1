use super::context::AppContext;
use super::logging;
use crate::cli::root::{Cli, Command};
use crate::commands;
use crate::error::CliError;
use clap::Parser;

pub fn run() -> Result<(), CliError> {
    logging::init();
    let cli = Cli::parse();
    let context = AppContext {
        db_path: cli.path,
        config_path: cli.config,
        schema_path: cli.schema,
        policies_path: cli.policies,
    };

    match cli.command {
        Command::Query(args) => commands::query::run(&context, args),
        Command::Explain(args) => commands::explain::run(&context, args),
        Command::Schema => commands::schema::run(&context),
    }
}
