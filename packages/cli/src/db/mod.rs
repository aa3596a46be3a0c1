use crate::app::AppContext;
use crate::error::CliError;
use quarry_rs_sdk::permissions::MemoryPolicySource;
use quarry_rs_sdk::{open_engine, EngineConfig, OpenEngineConfig, Quarry, SchemaOverview, SqliteBackend};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

const DB_EXTENSIONS: [&str; 3] = ["db", "sqlite", "sqlite3"];

pub fn resolve_db_path(context: &AppContext) -> Result<PathBuf, CliError> {
    if let Some(path) = &context.db_path {
        if !path.exists() {
            return Err(CliError::msg(format!(
                "database file does not exist: {}",
                path.display()
            )));
        }
        return Ok(path.clone());
    }

    let cwd =
        std::env::current_dir().map_err(|source| CliError::io("failed to read cwd", source))?;
    let mut candidates = find_db_files(&cwd)?;

    if candidates.is_empty() {
        return Err(CliError::msg(
            "no database files found in current directory; pass --path <path-to-file.db>",
        ));
    }
    if candidates.len() > 1 {
        let paths = candidates
            .iter()
            .map(|path| path.display().to_string())
            .collect::<Vec<_>>()
            .join(", ");
        return Err(CliError::msg(format!(
            "multiple database files found ({paths}); pass --path <path-to-file.db>"
        )));
    }

    Ok(candidates.remove(0))
}

/// Opens the engine for `context`: the database file, then the optional config, schema and
/// policy documents.
pub fn open_quarry(context: &AppContext) -> Result<Quarry, CliError> {
    let path = resolve_db_path(context)?;
    let backend = SqliteBackend::from_path(&path).map_err(|err| {
        CliError::msg(format!(
            "failed to open sqlite database at {}: {}",
            path.display(),
            err
        ))
    })?;

    let mut config = OpenEngineConfig::new(Arc::new(backend));
    if let Some(config_path) = &context.config_path {
        let text = read_document(config_path, "failed to read engine config")?;
        config.engine = EngineConfig::from_json_str(&text).map_err(CliError::query)?;
    }
    if let Some(schema_path) = &context.schema_path {
        let text = read_document(schema_path, "failed to read schema")?;
        config.schema = Some(SchemaOverview::from_json_str(&text).map_err(CliError::query)?);
    }
    if let Some(policies_path) = &context.policies_path {
        let text = read_document(policies_path, "failed to read policies")?;
        let policies = MemoryPolicySource::from_json_str(&text).map_err(CliError::query)?;
        config.policies = Some(Arc::new(policies));
    }

    pollster::block_on(open_engine(config)).map_err(|err| {
        CliError::msg(format!(
            "failed to open query engine for {}: {}",
            path.display(),
            err
        ))
    })
}

fn read_document(path: &Path, context: &'static str) -> Result<String, CliError> {
    fs::read_to_string(path).map_err(|source| CliError::io(context, source))
}

fn find_db_files(cwd: &Path) -> Result<Vec<PathBuf>, CliError> {
    let mut files = Vec::new();
    let entries =
        fs::read_dir(cwd).map_err(|source| CliError::io("failed to read cwd entries", source))?;
    for entry in entries {
        let entry =
            entry.map_err(|source| CliError::io("failed to read directory entry", source))?;
        let path = entry.path();
        if !path.is_file() {
            continue;
        }
        let extension = path.extension().and_then(|ext| ext.to_str());
        if extension.is_some_and(|ext| DB_EXTENSIONS.contains(&ext)) {
            files.push(path);
        }
    }
    files.sort();
    Ok(files)
}
