use crate::app::AppContext;
use crate::db;
use crate::error::CliError;

pub fn run(context: &AppContext) -> Result<(), CliError> {
    let quarry = db::open_quarry(context)?;
    let rendered = serde_json::to_string_pretty(quarry.schema())
        .map_err(|err| CliError::msg(format!("failed to serialize schema: {err}")))?;
    println!("{rendered}");
    Ok(())
}
