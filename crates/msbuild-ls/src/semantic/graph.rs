//
// semantic/graph.rs
//
// Evaluated object graph as reported by an evaluator
//

use std::fmt;
use std::path::{Path, PathBuf};

use serde::Serialize;

use crate::position::Position;

/// Kind of build object produced by evaluation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum ObjectKind {
    Property,
    Item,
    ItemMetadata,
    Import,
    Target,
    Task,
    /// A `UsingTask` registration.
    UsingTask,
}

impl ObjectKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ObjectKind::Property => "property",
            ObjectKind::Item => "item",
            ObjectKind::ItemMetadata => "item metadata",
            ObjectKind::Import => "import",
            ObjectKind::Target => "target",
            ObjectKind::Task => "task",
            ObjectKind::UsingTask => "task registration",
        }
    }
}

impl fmt::Display for ObjectKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A declaration site reported by the evaluator, in the declaring file.
///
/// Evaluators usually report only where the declaring element starts; the
/// locator widens such a span to the element's full range. When `end` is
/// present it is taken literally.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SourceSpan {
    pub start: Position,
    pub end: Option<Position>,
}

impl SourceSpan {
    pub fn at(start: Position) -> Self {
        Self { start, end: None }
    }

    pub fn between(start: Position, end: Position) -> Self {
        Self {
            start,
            end: Some(end),
        }
    }
}

/// One semantic entity of an evaluated project.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EvaluatedObject {
    pub kind: ObjectKind,
    pub name: String,
    /// Declaring file.
    pub file: PathBuf,
    /// Declaration sites in `file`. A property set in several places has
    /// several spans.
    pub spans: Vec<SourceSpan>,
    /// Evaluated value where the kind has one (property value, item include,
    /// import target, task assembly).
    pub value: Option<String>,
}

impl EvaluatedObject {
    pub fn new(kind: ObjectKind, name: impl Into<String>, file: impl Into<PathBuf>) -> Self {
        Self {
            kind,
            name: name.into(),
            file: file.into(),
            spans: Vec::new(),
            value: None,
        }
    }

    pub fn with_span(mut self, span: SourceSpan) -> Self {
        self.spans.push(span);
        self
    }

    pub fn with_value(mut self, value: impl Into<String>) -> Self {
        self.value = Some(value.into());
        self
    }
}

/// Result of evaluating one project. Objects are in evaluation order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EvaluatedGraph {
    pub project_file: PathBuf,
    pub objects: Vec<EvaluatedObject>,
}

impl EvaluatedGraph {
    pub fn new(project_file: impl Into<PathBuf>) -> Self {
        Self {
            project_file: project_file.into(),
            objects: Vec::new(),
        }
    }

    pub fn push(&mut self, object: EvaluatedObject) {
        self.objects.push(object);
    }

    pub fn declared_in<'a>(&'a self, file: &'a Path) -> impl Iterator<Item = &'a EvaluatedObject> + 'a {
        self.objects.iter().filter(move |object| object.file == file)
    }
}
