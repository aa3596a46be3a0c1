use clap::{Args, ValueEnum};
use std::net::IpAddr;

#[derive(Clone, Copy, Debug, Eq, PartialEq, ValueEnum)]
pub enum OutputFormat {
    Table,
    Json,
}

#[derive(Debug, Args)]
pub struct QueryArgs {
    /// Collection to read from.
    pub collection: String,

    /// Comma separated field paths, e.g. `id,title,author.name`. Defaults to `*`.
    #[arg(long, value_delimiter = ',')]
    pub fields: Vec<String>,

    /// Filter in the JSON filter language, e.g. `{"title": {"_icontains": "ab"}}`.
    #[arg(long)]
    pub filter: Option<String>,

    /// Comma separated sort keys; prefix with `-` for descending.
    #[arg(long, value_delimiter = ',', allow_hyphen_values = true)]
    pub sort: Vec<String>,

    #[arg(long)]
    pub limit: Option<u64>,

    #[arg(long)]
    pub offset: Option<u64>,

    /// Output format for query results.
    #[arg(long, value_enum, default_value_t = OutputFormat::Table)]
    pub format: OutputFormat,

    /// User the request is evaluated as.
    #[arg(long)]
    pub user: Option<String>,

    /// Role of the requesting user; repeat for several.
    #[arg(long = "role")]
    pub roles: Vec<String>,

    /// Client ip checked against policy ip ranges.
    #[arg(long)]
    pub ip: Option<IpAddr>,
}
