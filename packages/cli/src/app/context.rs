use std::path::PathBuf;

#[derive(Debug, Clone, Default)]
pub struct AppContext {
    pub db_path: Option<PathBuf>,
    pub config_path: Option<PathBuf>,
    pub schema_path: Option<PathBuf>,
    pub policies_path: Option<PathBuf>,
}
