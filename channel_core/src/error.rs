//! Error taxonomy for the backtest/scan engine.
//!
//! Kinds, not exception hierarchies: each variant maps to one of the
//! outcomes a caller actually branches on (retry, skip, surface to the
//! user). Anomalies and cooperative cancellation are *not* represented
//! here — they are success-path data (`crate::types::Anomaly`,
//! `crate::types::RunStatus::Cancelled`), never an `Err`.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("insufficient data: need {need}, have {have}")]
    InsufficientData { need: usize, have: usize },

    #[error("infeasible: {0}")]
    Infeasible(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("already completed: {0}")]
    AlreadyCompleted(String),

    #[error("parse failed: {0}")]
    ParseFailed(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Csv(#[from] csv::Error),
}

pub type Result<T> = std::result::Result<T, EngineError>;
