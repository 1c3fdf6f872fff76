// lib.rs - Positional semantic model for MSBuild project, props and targets files.
//
// The binary entry point lives in main.rs. Integration tests and benchmarks
// use the library directly.

pub mod config;
pub mod diagnostics;
pub mod document;
pub mod lsp;
pub mod metadata_cache;
pub mod offset_index;
pub mod package_sources;
pub mod position;
pub mod semantic;
pub mod syntax;
pub mod task_assembly;
pub mod workspace;
// test_utils is available in test builds and when the `test-support` feature is enabled.
#[cfg(any(test, feature = "test-support"))]
pub mod test_utils;

pub use config::Config;
pub use document::{DocumentError, DocumentKind, DocumentStatus, ProjectDocument, UpdateOutcome};
pub use offset_index::{OffsetIndex, PositionError, TextPosition, TextRange};
pub use position::{Base, Position, Range};
pub use workspace::{Workspace, WorkspaceError};
