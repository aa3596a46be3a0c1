use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    SchemaResolution,
    UnsupportedQueryConstruct,
    PermissionDenied,
    StoreExecution,
    InvalidQuery,
    Configuration,
}

impl ErrorCode {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::SchemaResolution => "QUARRY_ERROR_SCHEMA_RESOLUTION",
            Self::UnsupportedQueryConstruct => "QUARRY_ERROR_UNSUPPORTED_QUERY_CONSTRUCT",
            Self::PermissionDenied => "QUARRY_ERROR_PERMISSION_DENIED",
            Self::StoreExecution => "QUARRY_ERROR_STORE_EXECUTION",
            Self::InvalidQuery => "QUARRY_ERROR_INVALID_QUERY",
            Self::Configuration => "QUARRY_ERROR_CONFIGURATION",
        }
    }

    pub const fn all() -> &'static [Self] {
        &[
            Self::SchemaResolution,
            Self::UnsupportedQueryConstruct,
            Self::PermissionDenied,
            Self::StoreExecution,
            Self::InvalidQuery,
            Self::Configuration,
        ]
    }
}

/// Which side of a request/response boundary an error belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorStatus {
    /// 4xx-equivalent
    Client,
    /// 5xx-equivalent
    Server,
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum QueryError {
    #[error("{0}")]
    SchemaResolution(String),

    #[error("{0}")]
    UnsupportedQueryConstruct(String),

    #[error("{0}")]
    PermissionDenied(String),

    /// Never carries parameter values, only how many were bound.
    #[error("store execution failed ({parameter_count} parameters): {message}")]
    StoreExecution {
        parameter_count: usize,
        message: String,
    },

    #[error("{0}")]
    InvalidQuery(String),

    #[error("{0}")]
    Configuration(String),
}

impl QueryError {
    pub const fn code(&self) -> ErrorCode {
        match self {
            Self::SchemaResolution(_) => ErrorCode::SchemaResolution,
            Self::UnsupportedQueryConstruct(_) => ErrorCode::UnsupportedQueryConstruct,
            Self::PermissionDenied(_) => ErrorCode::PermissionDenied,
            Self::StoreExecution { .. } => ErrorCode::StoreExecution,
            Self::InvalidQuery(_) => ErrorCode::InvalidQuery,
            Self::Configuration(_) => ErrorCode::Configuration,
        }
    }

    pub const fn status(&self) -> ErrorStatus {
        match self {
            Self::StoreExecution { .. } | Self::Configuration(_) => ErrorStatus::Server,
            _ => ErrorStatus::Client,
        }
    }

    pub fn store(parameter_count: usize, source: impl std::fmt::Display) -> Self {
        Self::StoreExecution {
            parameter_count,
            message: source.to_string(),
        }
    }
}

pub(crate) fn unknown_collection_error(collection: &str) -> QueryError {
    QueryError::SchemaResolution(format!("collection '{collection}' does not exist"))
}

pub(crate) fn unknown_field_error(collection: &str, field: &str) -> QueryError {
    QueryError::SchemaResolution(format!(
        "field '{field}' does not exist in collection '{collection}'"
    ))
}

pub(crate) fn unsupported_error(construct: impl std::fmt::Display) -> QueryError {
    QueryError::UnsupportedQueryConstruct(format!("{construct} is not supported"))
}

pub(crate) fn forbidden_field_error(collection: &str, field: &str) -> QueryError {
    QueryError::PermissionDenied(format!(
        "you don't have permission to access field '{field}' in collection '{collection}'"
    ))
}

pub(crate) fn forbidden_collection_error(collection: &str, action: &str) -> QueryError {
    QueryError::PermissionDenied(format!(
        "you don't have permission to {action} collection '{collection}'"
    ))
}
