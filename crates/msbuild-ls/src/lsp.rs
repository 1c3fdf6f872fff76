//
// lsp.rs
//
// Conversion between the positional model and tower_lsp::lsp_types
//
// Columns are counted in Unicode scalar values, so servers built on these
// conversions must negotiate the utf-32 position encoding.
//

use std::path::Path;

use tower_lsp::lsp_types::{
    self, DiagnosticSeverity, DocumentSymbol, Location, NumberOrString, PositionEncodingKind,
    SymbolKind, TextDocumentContentChangeEvent, Url,
};

use crate::diagnostics::{Diagnostic, Severity};
use crate::document::TextChange;
use crate::offset_index::{TextPosition, TextRange};
use crate::position::{Position, Range};
use crate::semantic::{EvaluatedObject, EvaluatedObjectLocator, ObjectId, ObjectKind};

pub const POSITION_ENCODING: PositionEncodingKind = PositionEncodingKind::UTF32;

const SOURCE: &str = "msbuild-ls";

pub fn to_lsp_position(position: &TextPosition) -> lsp_types::Position {
    let zero = position.position();
    lsp_types::Position::new(zero.line(), zero.column())
}

pub fn to_lsp_range(range: &TextRange) -> lsp_types::Range {
    lsp_types::Range::new(to_lsp_position(range.start()), to_lsp_position(range.end()))
}

pub fn from_lsp_position(position: lsp_types::Position) -> Position {
    Position::zero_based(position.line, position.character)
}

/// `None` when the client sent an inverted range.
pub fn from_lsp_range(range: lsp_types::Range) -> Option<Range> {
    Range::new(from_lsp_position(range.start), from_lsp_position(range.end))
}

pub fn to_text_change(event: TextDocumentContentChangeEvent) -> Option<TextChange> {
    match event.range {
        Some(range) => Some(TextChange::replace(from_lsp_range(range)?, event.text)),
        None => Some(TextChange::full(event.text)),
    }
}

pub fn to_lsp_severity(severity: Severity) -> DiagnosticSeverity {
    match severity {
        Severity::Error => DiagnosticSeverity::ERROR,
        Severity::Warning => DiagnosticSeverity::WARNING,
        Severity::Information => DiagnosticSeverity::INFORMATION,
        Severity::Hint => DiagnosticSeverity::HINT,
    }
}

pub fn to_lsp_diagnostic(diagnostic: &Diagnostic) -> lsp_types::Diagnostic {
    lsp_types::Diagnostic {
        range: to_lsp_range(&diagnostic.range),
        severity: Some(to_lsp_severity(diagnostic.severity)),
        code: Some(NumberOrString::String(diagnostic.code.as_str().to_string())),
        source: Some(SOURCE.to_string()),
        message: diagnostic.message.clone(),
        ..Default::default()
    }
}

pub fn symbol_kind(kind: ObjectKind) -> SymbolKind {
    match kind {
        ObjectKind::Property => SymbolKind::PROPERTY,
        ObjectKind::Item => SymbolKind::OBJECT,
        ObjectKind::ItemMetadata => SymbolKind::FIELD,
        ObjectKind::Import => SymbolKind::FILE,
        ObjectKind::Target => SymbolKind::FUNCTION,
        ObjectKind::Task => SymbolKind::METHOD,
        ObjectKind::UsingTask => SymbolKind::CLASS,
    }
}

/// Locations declaring `object`, one per resolved range.
pub fn declaration_locations(
    locator: &EvaluatedObjectLocator,
    id: ObjectId,
) -> Vec<Location> {
    let object = locator.object(id);
    let Ok(uri) = Url::from_file_path(&object.file) else {
        log::trace!("No file URI for {}", object.file.display());
        return Vec::new();
    };
    locator
        .ranges_of(id)
        .iter()
        .map(|range| Location::new(uri.clone(), to_lsp_range(range)))
        .collect()
}

/// Outline of the objects declared in `file`, nested by range.
pub fn document_symbols(locator: &EvaluatedObjectLocator, file: &Path) -> Vec<DocumentSymbol> {
    let mut flat: Vec<(&EvaluatedObject, &TextRange)> = locator
        .all_objects()
        .filter(|(_, object)| object.file == file)
        .filter_map(|(id, object)| locator.ranges_of(id).first().map(|range| (object, range)))
        .collect();
    flat.sort_by_key(|(_, range)| (range.absolute_start(), std::cmp::Reverse(range.absolute_end())));

    let mut roots = Vec::new();
    let mut stack: Vec<(usize, DocumentSymbol)> = Vec::new();
    for (object, range) in flat {
        while let Some((end, _)) = stack.last() {
            if range.absolute_start() < *end {
                break;
            }
            pop_into(&mut stack, &mut roots);
        }
        stack.push((range.absolute_end(), symbol(object, range)));
    }
    while !stack.is_empty() {
        pop_into(&mut stack, &mut roots);
    }
    roots
}

fn pop_into(stack: &mut Vec<(usize, DocumentSymbol)>, roots: &mut Vec<DocumentSymbol>) {
    let Some((_, done)) = stack.pop() else {
        return;
    };
    match stack.last_mut() {
        Some((_, parent)) => parent.children.get_or_insert_with(Vec::new).push(done),
        None => roots.push(done),
    }
}

#[allow(deprecated)]
fn symbol(object: &EvaluatedObject, range: &TextRange) -> DocumentSymbol {
    let lsp_range = to_lsp_range(range);
    DocumentSymbol {
        name: object.name.clone(),
        detail: object.value.clone(),
        kind: symbol_kind(object.kind),
        tags: None,
        deprecated: None,
        range: lsp_range,
        selection_range: lsp_range,
        children: None,
    }
}
