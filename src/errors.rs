//! Typed error hierarchy for the thinktank pipeline.
//!
//! Four enums cover the library boundaries:
//! - `PipelineError`: a run was rejected before it was constructed
//! - `GatewayError`: a single provider request failed
//! - `StoreError`: the persistence collaborator could not store a snapshot
//! - `DraftError`: a workflow draft could not be saved

use thiserror::Error;

/// Validation failures that stop a run before any record is created.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum PipelineError {
    #[error("Problem statement is empty")]
    EmptyProblem,

    #[error("Workflow has no enabled stages")]
    NoEnabledStages,

    #[error("Provider API key is missing")]
    MissingApiKey,

    #[error("Stage id '{stage}' is used by more than one stage")]
    DuplicateStageId { stage: String },

    #[error("Agent pool is empty but stage '{stage}' fans out to agents")]
    EmptyAgentPool { stage: String },

    #[error("Stage '{stage}' needs a synthesis model")]
    MissingSynthesisModel { stage: String },

    #[error("Stage '{stage}' needs a review model")]
    MissingReviewModel { stage: String },

    #[error("A run is already in progress")]
    AlreadyRunning,
}

/// The single failure mode of the request gateway.
///
/// Only the rendered message survives into the run record.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum GatewayError {
    #[error("{message}")]
    Request { message: String },

    /// Non-success HTTP status from a provider-backed gateway. The preview
    /// gateway never produces it.
    #[error("Provider returned {status}: {message}")]
    Provider { status: u16, message: String },
}

impl GatewayError {
    pub fn request(message: impl Into<String>) -> Self {
        Self::Request {
            message: message.into(),
        }
    }

    pub fn provider(status: u16, message: impl Into<String>) -> Self {
        Self::Provider {
            status,
            message: message.into(),
        }
    }
}

/// Errors from the persistence collaborator.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Snapshot of {bytes} bytes exceeds storage capacity of {capacity} bytes")]
    CapacityExceeded { bytes: usize, capacity: usize },

    #[error("Failed to access snapshot at {path}: {source}")]
    Io {
        path: std::path::PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to encode snapshot: {0}")]
    Serialize(#[from] serde_json::Error),
}

impl StoreError {
    pub fn is_capacity(&self) -> bool {
        matches!(self, Self::CapacityExceeded { .. })
    }
}

/// Reasons a workflow draft cannot be saved.
#[derive(Debug, Clone, Copy, Error, PartialEq, Eq)]
pub enum DraftError {
    #[error("Workflow name is required")]
    MissingName,

    #[error("Workflow needs at least one stage")]
    MissingStages,

    #[error("Stage {index} needs both a name and a prompt")]
    MissingStageDetails { index: usize },
}
