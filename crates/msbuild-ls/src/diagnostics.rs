//
// diagnostics.rs
//
// Diagnostics produced while loading a document
//

use std::collections::HashSet;
use std::fmt;

use crate::config::DiagnosticsConfig;
use crate::offset_index::TextRange;
use crate::semantic::EvaluationError;
use crate::syntax::SyntaxTree;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Severity {
    Error,
    Warning,
    Information,
    Hint,
}

/// Stable classification code attached to every diagnostic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DiagnosticCode {
    SyntaxError,
    EvaluationFailed,
    RootElementNotProject,
    DuplicateAttribute,
    EmptyCondition,
}

impl DiagnosticCode {
    pub fn as_str(self) -> &'static str {
        match self {
            DiagnosticCode::SyntaxError => "MSBLS0001",
            DiagnosticCode::EvaluationFailed => "MSBLS0002",
            DiagnosticCode::RootElementNotProject => "MSBLS0003",
            DiagnosticCode::DuplicateAttribute => "MSBLS0004",
            DiagnosticCode::EmptyCondition => "MSBLS0005",
        }
    }
}

impl fmt::Display for DiagnosticCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Diagnostic {
    pub severity: Severity,
    pub message: String,
    pub range: TextRange,
    pub code: DiagnosticCode,
}

impl Diagnostic {
    pub fn new(
        severity: Severity,
        code: DiagnosticCode,
        range: TextRange,
        message: impl Into<String>,
    ) -> Self {
        Self {
            severity,
            message: message.into(),
            range,
            code,
        }
    }
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let start = self.range.start().position().to_one_based();
        write!(
            f,
            "{} {:?} {}: {}",
            start, self.severity, self.code, self.message
        )
    }
}

/// One error diagnostic per recovered parse problem.
pub fn syntax_diagnostics(tree: &SyntaxTree) -> Vec<Diagnostic> {
    tree.errors()
        .iter()
        .map(|error| {
            Diagnostic::new(
                Severity::Error,
                DiagnosticCode::SyntaxError,
                error.range.clone(),
                error.message.clone(),
            )
        })
        .collect()
}

/// Diagnostic for a failed evaluation, placed at the reported location when
/// it still maps onto the current text.
pub fn evaluation_diagnostic(tree: &SyntaxTree, error: &EvaluationError) -> Diagnostic {
    let index = tree.index();
    let at_location = error
        .location()
        .and_then(|position| index.text_position_at(position).ok())
        .map(|position| {
            match tree.element_starting_at(position.offset()) {
                Some(element) => tree
                    .node(element)
                    .as_element()
                    .map(|parts| parts.name_range.clone())
                    .unwrap_or_else(|| TextRange::empty_at(position.clone())),
                None => TextRange::empty_at(position),
            }
        });
    let range = at_location
        .or_else(|| {
            tree.root_element()
                .and_then(|root| tree.node(root).as_element())
                .map(|parts| parts.name_range.clone())
        })
        .unwrap_or_else(|| tree.node(tree.root()).range.clone());
    Diagnostic::new(
        Severity::Error,
        DiagnosticCode::EvaluationFailed,
        range,
        format!("Project could not be evaluated: {error}"),
    )
}

/// Structural policy checks over a parsed document.
pub fn policy_diagnostics(tree: &SyntaxTree, config: &DiagnosticsConfig) -> Vec<Diagnostic> {
    let mut diagnostics = Vec::new();

    if config.root_element {
        if let Some(root) = tree.root_element() {
            if let Some(parts) = tree.node(root).as_element() {
                if parts.name != "Project" {
                    diagnostics.push(Diagnostic::new(
                        Severity::Error,
                        DiagnosticCode::RootElementNotProject,
                        parts.name_range.clone(),
                        format!("Root element must be <Project>, found <{}>", parts.name),
                    ));
                }
            }
        }
    }

    if config.duplicate_attributes || config.empty_conditions {
        for element in tree.elements() {
            let mut seen = HashSet::new();
            for attribute in tree.attributes(element) {
                let node = tree.node(attribute);
                let Some(parts) = node.as_attribute() else {
                    continue;
                };
                if config.duplicate_attributes && !seen.insert(parts.name.as_str()) {
                    diagnostics.push(Diagnostic::new(
                        Severity::Error,
                        DiagnosticCode::DuplicateAttribute,
                        parts.name_range.clone(),
                        format!("Attribute '{}' is specified more than once", parts.name),
                    ));
                }
                let empty_condition = parts.name == "Condition"
                    && parts.value_range.is_some()
                    && parts.value.trim().is_empty();
                if config.empty_conditions && empty_condition {
                    diagnostics.push(Diagnostic::new(
                        Severity::Warning,
                        DiagnosticCode::EmptyCondition,
                        node.range.clone(),
                        "Empty Condition is always true",
                    ));
                }
            }
        }
    }

    diagnostics
}
