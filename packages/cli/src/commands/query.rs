use super::{accountability_from_args, request_from_args};
use crate::app::AppContext;
use crate::cli::query::{OutputFormat, QueryArgs};
use crate::db;
use crate::error::CliError;
use crate::output;

pub fn run(context: &AppContext, args: QueryArgs) -> Result<(), CliError> {
    let request = request_from_args(&args)?;
    let accountability = accountability_from_args(context, &args)?;
    let quarry = db::open_quarry(context)?;
    let rows = pollster::block_on(quarry.query(&request, accountability))
        .map_err(CliError::query)?;

    match args.format {
        OutputFormat::Json => output::print_rows_json(&rows),
        OutputFormat::Table => output::print_rows_table(&rows),
    }

    Ok(())
}
