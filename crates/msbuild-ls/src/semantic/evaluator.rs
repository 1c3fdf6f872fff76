//
// semantic/evaluator.rs
//
// Boundary to the build evaluator
//

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

use crate::package_sources::PackageSource;
use crate::position::Position;

use super::graph::EvaluatedGraph;

/// Everything outside the document text that evaluation may depend on.
#[derive(Debug, Clone, Default)]
pub struct WorkspaceContext {
    pub workspace_root: Option<PathBuf>,
    /// Global property overrides (`/p:Name=Value`).
    pub global_properties: BTreeMap<String, String>,
    pub package_sources: Vec<PackageSource>,
}

#[derive(Debug, Error)]
pub enum EvaluationError {
    /// The build description itself is wrong (bad XML, missing import,
    /// property cycle, ...). `location` is one-based when present.
    #[error("invalid project: {message}")]
    InvalidProject {
        message: String,
        location: Option<Position>,
    },
    #[error("evaluation did not finish within {0:?}")]
    Timeout(Duration),
    #[error("evaluation was cancelled")]
    Cancelled,
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl EvaluationError {
    pub fn invalid(message: impl Into<String>, location: Option<Position>) -> Self {
        EvaluationError::InvalidProject {
            message: message.into(),
            location,
        }
    }

    pub fn location(&self) -> Option<Position> {
        match self {
            EvaluationError::InvalidProject { location, .. } => *location,
            _ => None,
        }
    }
}

/// Turns project text into an evaluated object graph.
///
/// Implementations must report, for every object, its kind, name, declaring
/// file and at least one (line, column) span in that file. They are called
/// without any document lock held and may be abandoned mid-flight when a
/// newer edit supersedes the text.
#[async_trait]
pub trait Evaluator: Send + Sync {
    async fn evaluate(
        &self,
        text: &str,
        file: &Path,
        context: &WorkspaceContext,
    ) -> Result<EvaluatedGraph, EvaluationError>;
}
