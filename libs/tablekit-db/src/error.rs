use sea_orm::DbErr;
use thiserror::Error;

/// Errors produced by the service layer.
///
/// `UnknownColumn`, `UnknownAssociation`, `UnknownModel` and `UnknownPreset` are
/// programmer errors (misconfigured specs) and are never recovered from.
/// `DuplicateRecord` is an application-level error raised before any write is
/// attempted. Database errors pass through unchanged in `Db`.
#[derive(Error, Debug)]
pub enum ServiceError {
    #[error("unknown model: {0}")]
    UnknownModel(String),

    #[error("unknown column '{column}' on model '{model}'")]
    UnknownColumn { model: String, column: String },

    #[error("unknown association '{path}' on model '{model}'")]
    UnknownAssociation { model: String, path: String },

    #[error("unknown include preset: {0}")]
    UnknownPreset(String),

    #[error("duplicate record: {summary}")]
    DuplicateRecord { summary: String },

    #[error("invalid value for '{column}': {message}")]
    InvalidValue { column: String, message: String },

    #[error("invalid options: {0}")]
    InvalidOptions(String),

    #[error("model '{0}' has no primary key")]
    MissingPrimaryKey(String),

    #[error("query build failed: {0}")]
    Query(String),

    #[error("database error: {0}")]
    Db(#[from] DbErr),
}

impl ServiceError {
    #[must_use]
    pub fn unknown_column(model: impl Into<String>, column: impl Into<String>) -> Self {
        Self::UnknownColumn {
            model: model.into(),
            column: column.into(),
        }
    }

    #[must_use]
    pub fn unknown_association(model: impl Into<String>, path: impl Into<String>) -> Self {
        Self::UnknownAssociation {
            model: model.into(),
            path: path.into(),
        }
    }

    #[must_use]
    pub fn invalid_value(column: impl Into<String>, message: impl Into<String>) -> Self {
        Self::InvalidValue {
            column: column.into(),
            message: message.into(),
        }
    }

    #[must_use]
    pub fn invalid_options(message: impl Into<String>) -> Self {
        Self::InvalidOptions(message.into())
    }

    #[must_use]
    pub fn duplicate(summary: impl Into<String>) -> Self {
        Self::DuplicateRecord {
            summary: summary.into(),
        }
    }

    /// Whether this error is a caller-facing duplicate-record rejection.
    #[must_use]
    pub fn is_duplicate(&self) -> bool {
        matches!(self, Self::DuplicateRecord { .. })
    }
}

impl From<sea_orm::sea_query::error::Error> for ServiceError {
    fn from(e: sea_orm::sea_query::error::Error) -> Self {
        Self::Query(e.to_string())
    }
}

pub type ServiceResult<T> = Result<T, ServiceError>;
