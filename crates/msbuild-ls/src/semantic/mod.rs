//
// semantic/mod.rs
//
// Semantic layer: evaluated objects and their source locations
//

pub mod evaluator;
pub mod graph;
pub mod locator;
pub mod static_eval;

pub use evaluator::{EvaluationError, Evaluator, WorkspaceContext};
pub use graph::{EvaluatedGraph, EvaluatedObject, ObjectKind, SourceSpan};
pub use locator::{EvaluatedObjectLocator, LocatorError, ObjectId};
pub use static_eval::StaticEvaluator;
