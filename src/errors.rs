use thiserror::Error;

use crate::config::validate::FieldError;
use crate::status::OperationStatus;

#[derive(Error, Debug)]
pub enum AppError {
    #[error("Validation failed: {}", format_field_errors(.0))]
    Validation(Vec<FieldError>),

    #[error("Operation already in progress (status: {0})")]
    Busy(OperationStatus),

    #[error("Remote storage is not configured")]
    NotConfigured,

    #[error("Step '{phase}' failed: {source:#}")]
    Transfer {
        phase: OperationStatus,
        #[source]
        source: anyhow::Error,
    },

    #[error("Resuming workloads failed, host may be left paused: {0:#}")]
    Resume(#[source] anyhow::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Anyhow(#[from] anyhow::Error),
}

fn format_field_errors(errors: &[FieldError]) -> String {
    errors
        .iter()
        .map(|e| format!("{}: {}", e.field, e.message))
        .collect::<Vec<_>>()
        .join("; ")
}

pub type Result<T> = std::result::Result<T, AppError>;
