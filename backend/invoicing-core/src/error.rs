// src/error.rs

use reqwest::StatusCode;
use thiserror::Error;

use crate::pipeline::Stage;

#[derive(Error, Debug)]
pub enum InvoicingError {
    #[error("Missing environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("File I/O error: {context}")]
    Io {
        #[source]
        source: std::io::Error,
        context: String,
    },

    #[error("CSV error: {context}")]
    Csv {
        #[source]
        source: csv::Error,
        context: String,
    },

    #[error("HTTP request failed")]
    Request(#[from] reqwest::Error),

    #[error("JSON processing error")]
    Json(#[from] serde_json::Error),

    #[error("URL parsing error")]
    UrlParse(#[from] url::ParseError),

    #[error("AgileDay API error: Status={status}, Message='{message}'")]
    ApiError { status: StatusCode, message: String },

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Arithmetic overflow while {0}")]
    Arithmetic(String),

    #[error("Invoicing pipeline failed during {stage}")]
    Stage {
        stage: Stage,
        #[source]
        source: Box<InvoicingError>,
    },
}

// Helper to create context-aware IO errors
pub fn io_context<E: Into<std::io::Error>, S: Into<String>>(source: E, context: S) -> InvoicingError {
    InvoicingError::Io {
        source: source.into(),
        context: context.into(),
    }
}

pub fn csv_context<S: Into<String>>(source: csv::Error, context: S) -> InvoicingError {
    InvoicingError::Csv {
        source,
        context: context.into(),
    }
}

impl InvoicingError {
    /// The stage a pipeline failure happened in, if this error came out of a pipeline run.
    pub fn stage(&self) -> Option<Stage> {
        match self {
            InvoicingError::Stage { stage, .. } => Some(*stage),
            _ => None,
        }
    }
}
