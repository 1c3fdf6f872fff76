//
// semantic/locator.rs
//
// Reverse index from source ranges to evaluated objects
//

use std::cmp::Reverse;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use thiserror::Error;

use crate::offset_index::{OffsetIndex, PositionError, TextPosition, TextRange};
use crate::syntax::SyntaxTree;

use super::graph::{EvaluatedGraph, EvaluatedObject, ObjectKind, SourceSpan};

#[derive(Debug, Error)]
pub enum LocatorError {
    /// The evaluator handed back something structurally impossible.
    #[error("malformed evaluation result: {0}")]
    MalformedGraph(String),
    #[error(transparent)]
    Position(#[from] PositionError),
}

/// Index of an object in the graph the locator was built from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectId(u32);

impl ObjectId {
    pub fn as_usize(self) -> usize {
        self.0 as usize
    }
}

/// One distinct declaring range and every object declared exactly there.
#[derive(Debug)]
struct RangeEntry {
    range: TextRange,
    /// Declaration order; the first one wins a point query.
    objects: Vec<ObjectId>,
    /// Nearest earlier entry whose range encloses this one.
    parent: Option<usize>,
}

impl RangeEntry {
    /// Zero-width declarations still claim their own offset.
    fn contains(&self, offset: usize) -> bool {
        if self.range.is_empty() {
            self.range.absolute_start() == offset
        } else {
            self.range.contains_offset(offset)
        }
    }

    /// First offset past everything this entry contains.
    fn reach(&self) -> usize {
        self.range.absolute_end().max(self.range.absolute_start() + 1)
    }

    fn first_declared(&self) -> ObjectId {
        self.objects[0]
    }
}

#[derive(Debug)]
struct FileRanges {
    index: Arc<OffsetIndex>,
    /// Sorted by start ascending, then end descending, so enclosing ranges
    /// precede what they enclose.
    entries: Vec<RangeEntry>,
    /// Running maximum of [`RangeEntry::reach`] over `entries[..=i]`. Only
    /// present when some ranges overlap without nesting, which the parent
    /// links cannot represent.
    reach: Option<Vec<usize>>,
}

impl FileRanges {
    /// Entries containing `offset`, narrowest first. Equally wide entries
    /// keep declaration order.
    fn containing(&self, offset: usize) -> Vec<&RangeEntry> {
        let entries = &self.entries;
        let after = entries.partition_point(|entry| entry.range.absolute_start() <= offset);

        let Some(reach) = &self.reach else {
            // Nested ranges only: every container of `offset` is an ancestor
            // of the last entry starting at or before it.
            let mut found = Vec::new();
            let mut current = after.checked_sub(1);
            while let Some(i) = current {
                let entry = &entries[i];
                if entry.contains(offset) {
                    found.push(entry);
                }
                current = entry.parent;
            }
            return found;
        };

        let mut found: Vec<&RangeEntry> = (0..after)
            .rev()
            .take_while(|&i| reach[i] > offset)
            .map(|i| &entries[i])
            .filter(|entry| entry.contains(offset))
            .collect();
        found.sort_by_key(|entry| (entry.range.len(), entry.first_declared()));
        found
    }
}

/// Point queries from a file position to the evaluated object declared there.
#[derive(Debug)]
pub struct EvaluatedObjectLocator {
    graph: Arc<EvaluatedGraph>,
    /// Declaring ranges per object; empty when the file has no syntax tree.
    ranges: Vec<Vec<TextRange>>,
    files: HashMap<PathBuf, FileRanges>,
}

impl EvaluatedObjectLocator {
    /// Index `graph` against the syntax trees of the files it was evaluated from.
    ///
    /// Objects declared in files without a tree are kept (for name and kind
    /// queries) but have no range.
    pub fn new(
        graph: Arc<EvaluatedGraph>,
        trees: &[(PathBuf, Arc<SyntaxTree>)],
    ) -> Result<Self, LocatorError> {
        let started = std::time::Instant::now();
        let mut ranges = Vec::with_capacity(graph.objects.len());
        let mut pending: HashMap<&Path, Vec<(TextRange, ObjectId)>> = HashMap::new();

        for (i, object) in graph.objects.iter().enumerate() {
            validate(object)?;
            let id = ObjectId(i as u32);
            let tree = trees
                .iter()
                .find(|(path, _)| *path == object.file)
                .map(|(_, tree)| tree);
            let Some(tree) = tree else {
                ranges.push(Vec::new());
                continue;
            };
            let mut object_ranges = Vec::with_capacity(object.spans.len());
            for span in &object.spans {
                let range = resolve_span(tree, span).map_err(|err| {
                    LocatorError::MalformedGraph(format!(
                        "{} '{}' reports a span outside {}: {err}",
                        object.kind,
                        object.name,
                        object.file.display()
                    ))
                })?;
                pending
                    .entry(object.file.as_path())
                    .or_default()
                    .push((range.clone(), id));
                object_ranges.push(range);
            }
            ranges.push(object_ranges);
        }

        let mut files = HashMap::with_capacity(pending.len());
        for (path, declared) in pending {
            let Some((_, tree)) = trees.iter().find(|(p, _)| p == path) else {
                continue;
            };
            files.insert(path.to_path_buf(), build_file_ranges(tree.index(), declared));
        }

        log::trace!(
            "Indexed {} evaluated objects over {} files in {:?}",
            graph.objects.len(),
            files.len(),
            started.elapsed()
        );
        Ok(Self {
            graph,
            ranges,
            files,
        })
    }

    pub fn graph(&self) -> &Arc<EvaluatedGraph> {
        &self.graph
    }

    pub fn object(&self, id: ObjectId) -> &EvaluatedObject {
        &self.graph.objects[id.as_usize()]
    }

    /// Declaring ranges of `id`; empty for objects outside the indexed files.
    pub fn ranges_of(&self, id: ObjectId) -> &[TextRange] {
        &self.ranges[id.as_usize()]
    }

    /// Every object, in evaluation order.
    pub fn all_objects(&self) -> impl Iterator<Item = (ObjectId, &EvaluatedObject)> + '_ {
        self.graph
            .objects
            .iter()
            .enumerate()
            .map(|(i, object)| (ObjectId(i as u32), object))
    }

    pub fn objects_of_kind(
        &self,
        kind: ObjectKind,
    ) -> impl Iterator<Item = (ObjectId, &EvaluatedObject)> + '_ {
        self.all_objects().filter(move |(_, object)| object.kind == kind)
    }

    /// Objects of `kind` named `name` (case-insensitive, like MSBuild names).
    pub fn by_name<'a>(
        &'a self,
        kind: ObjectKind,
        name: &'a str,
    ) -> impl Iterator<Item = (ObjectId, &'a EvaluatedObject)> + 'a {
        self.objects_of_kind(kind)
            .filter(move |(_, object)| object.name.eq_ignore_ascii_case(name))
    }

    /// Innermost object declared at `position` in `file`.
    pub fn find(
        &self,
        file: &Path,
        position: &TextPosition,
    ) -> Result<Option<(ObjectId, &EvaluatedObject)>, LocatorError> {
        Ok(self
            .find_all(file, position)?
            .into_iter()
            .next())
    }

    /// Every object whose range contains `position`, innermost first. Objects
    /// sharing one range appear in declaration order.
    pub fn find_all(
        &self,
        file: &Path,
        position: &TextPosition,
    ) -> Result<Vec<(ObjectId, &EvaluatedObject)>, LocatorError> {
        let Some(ranges) = self.files.get(file) else {
            return Ok(Vec::new());
        };
        if !Arc::ptr_eq(&ranges.index, position.index()) {
            return Err(PositionError::IncompatibleIndex {
                left: ranges.index.id(),
                right: position.index().id(),
            }
            .into());
        }
        Ok(self.chain(ranges, position.offset()))
    }

    /// [`find`](Self::find) by raw offset into `file`'s snapshot.
    pub fn find_offset(
        &self,
        file: &Path,
        offset: usize,
    ) -> Result<Option<(ObjectId, &EvaluatedObject)>, LocatorError> {
        let Some(ranges) = self.files.get(file) else {
            return Ok(None);
        };
        ranges.index.position_of(offset)?;
        Ok(self.chain(ranges, offset).into_iter().next())
    }

    fn chain(&self, ranges: &FileRanges, offset: usize) -> Vec<(ObjectId, &EvaluatedObject)> {
        ranges
            .containing(offset)
            .into_iter()
            .flat_map(|entry| entry.objects.iter().map(|id| (*id, self.object(*id))))
            .collect()
    }
}

fn validate(object: &EvaluatedObject) -> Result<(), LocatorError> {
    if object.name.is_empty() {
        return Err(LocatorError::MalformedGraph(format!(
            "{} declared in {} has no name",
            object.kind,
            object.file.display()
        )));
    }
    if object.spans.is_empty() {
        return Err(LocatorError::MalformedGraph(format!(
            "{} '{}' has no source span",
            object.kind, object.name
        )));
    }
    for span in &object.spans {
        if let Some(end) = span.end {
            let ordered = span.start.base() == end.base()
                && (end.line(), end.column()) >= (span.start.line(), span.start.column());
            if !ordered {
                return Err(LocatorError::MalformedGraph(format!(
                    "{} '{}' has a span ending at {end} before it starts at {}",
                    object.kind, object.name, span.start
                )));
            }
        }
    }
    Ok(())
}

/// Widen a reported span to the syntax it points at.
///
/// A start at an element's `<` resolves to the whole element; otherwise the
/// deepest node there; otherwise an empty range at the start.
fn resolve_span(tree: &SyntaxTree, span: &SourceSpan) -> Result<TextRange, PositionError> {
    let index = tree.index();
    let start = index.offset_of(span.start)?;
    if let Some(end) = span.end {
        let end = index.offset_of(end)?;
        return index.text_range(start, end);
    }
    if let Some(element) = tree.element_starting_at(start) {
        return Ok(tree.node(element).range.clone());
    }
    if let Some(node) = tree.node_at(start) {
        return Ok(tree.node(node).range.clone());
    }
    Ok(TextRange::empty_at(index.text_position_of(start)?))
}

fn build_file_ranges(index: &Arc<OffsetIndex>, mut declared: Vec<(TextRange, ObjectId)>) -> FileRanges {
    declared.sort_by_key(|(range, id)| (range.absolute_start(), Reverse(range.absolute_end()), *id));

    let mut entries: Vec<RangeEntry> = Vec::with_capacity(declared.len());
    // Indices of entries enclosing the one being placed, outermost first.
    let mut stack: Vec<usize> = Vec::new();
    let mut overlapping = false;
    for (range, id) in declared {
        if let Some(last) = entries.last_mut() {
            if last.range == range {
                last.objects.push(id);
                continue;
            }
        }
        while let Some(&top) = stack.last() {
            let enclosing = &entries[top].range;
            if range.absolute_end() <= enclosing.absolute_end() {
                break;
            }
            // Starts inside `top` but ends past it; only explicit end
            // positions produce this.
            overlapping |= range.absolute_start() < enclosing.absolute_end();
            stack.pop();
        }
        entries.push(RangeEntry {
            range,
            objects: vec![id],
            parent: stack.last().copied(),
        });
        stack.push(entries.len() - 1);
    }

    let reach = overlapping.then(|| {
        entries
            .iter()
            .scan(0, |max, entry| {
                *max = entry.reach().max(*max);
                Some(*max)
            })
            .collect()
    });
    if overlapping {
        log::debug!("Evaluated spans overlap without nesting; point queries scan by reach");
    }

    FileRanges {
        index: Arc::clone(index),
        entries,
        reach,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::position::Position;
    use crate::syntax::parse;

    const PROJECT: &str = "<Project><PropertyGroup><Foo>Bar</Foo></PropertyGroup></Project>";

    fn path() -> PathBuf {
        PathBuf::from("/src/app.csproj")
    }

    fn at(line: u32, column: u32) -> SourceSpan {
        SourceSpan::at(Position::one_based(line, column).unwrap())
    }

    fn locator(text: &str, objects: Vec<EvaluatedObject>) -> (EvaluatedObjectLocator, Arc<SyntaxTree>) {
        let tree = Arc::new(parse(text));
        let mut graph = EvaluatedGraph::new(path());
        for object in objects {
            graph.push(object);
        }
        let locator =
            EvaluatedObjectLocator::new(Arc::new(graph), &[(path(), Arc::clone(&tree))]).unwrap();
        (locator, tree)
    }

    #[test]
    fn test_find_property_inside_its_element() {
        let column = PROJECT.find("<Foo>").unwrap() as u32 + 1;
        let foo = EvaluatedObject::new(ObjectKind::Property, "Foo", path())
            .with_span(at(1, column))
            .with_value("Bar");
        let (locator, tree) = locator(PROJECT, vec![foo]);

        let offset = PROJECT.find("Bar").unwrap() + 1;
        let position = tree.index().text_position_of(offset).unwrap();
        let (_, object) = locator.find(&path(), &position).unwrap().unwrap();
        assert_eq!(object.name, "Foo");
        assert_eq!(object.kind, ObjectKind::Property);

        let outside = tree.index().text_position_of(3).unwrap();
        assert!(locator.find(&path(), &outside).unwrap().is_none());
    }

    #[test]
    fn test_narrowest_range_wins() {
        let text = "<Project>\n<ItemGroup>\n<Compile Include=\"a.cs\">\n<Link>x</Link>\n</Compile>\n</ItemGroup>\n</Project>";
        let item = EvaluatedObject::new(ObjectKind::Item, "Compile", path()).with_span(at(3, 1));
        let link = EvaluatedObject::new(ObjectKind::ItemMetadata, "Link", path()).with_span(at(4, 1));
        let (locator, tree) = locator(text, vec![item, link]);

        let in_link = text.find("x</Link>").unwrap();
        let (_, object) = locator.find_offset(&path(), in_link).unwrap().unwrap();
        assert_eq!(object.name, "Link");

        let in_item = text.find("Include").unwrap();
        let (_, object) = locator.find_offset(&path(), in_item).unwrap().unwrap();
        assert_eq!(object.name, "Compile");

        let position = tree.index().text_position_of(in_link).unwrap();
        let chain: Vec<_> = locator
            .find_all(&path(), &position)
            .unwrap()
            .into_iter()
            .map(|(_, o)| o.name.as_str())
            .collect();
        assert_eq!(chain, ["Link", "Compile"]);
    }

    #[test]
    fn test_partially_overlapping_spans_stay_findable() {
        let text = format!("<Project>{}</Project>", " ".repeat(20));
        let span = |from: u32, to: u32| {
            SourceSpan::between(
                Position::one_based(1, from).unwrap(),
                Position::one_based(1, to).unwrap(),
            )
        };
        // Declared widest first so declaration order cannot pick the answer.
        let wide = EvaluatedObject::new(ObjectKind::Property, "Wide", path()).with_span(span(6, 21));
        let narrow = EvaluatedObject::new(ObjectKind::Property, "Narrow", path()).with_span(span(1, 11));
        let (locator, tree) = locator(&text, vec![wide, narrow]);

        let names_at = |offset: usize| -> Vec<String> {
            let position = tree.index().text_position_of(offset).unwrap();
            locator
                .find_all(&path(), &position)
                .unwrap()
                .into_iter()
                .map(|(_, object)| object.name.clone())
                .collect()
        };
        assert_eq!(names_at(7), ["Narrow", "Wide"]);
        assert_eq!(names_at(3), ["Narrow"]);
        assert_eq!(names_at(12), ["Wide"]);
        assert!(names_at(25).is_empty());
        assert_eq!(locator.find_offset(&path(), 7).unwrap().unwrap().1.name, "Narrow");
    }

    #[test]
    fn test_equally_wide_overlaps_prefer_first_declared() {
        let text = format!("<Project>{}</Project>", " ".repeat(20));
        let span = |from: u32, to: u32| {
            SourceSpan::between(
                Position::one_based(1, from).unwrap(),
                Position::one_based(1, to).unwrap(),
            )
        };
        let later = EvaluatedObject::new(ObjectKind::Property, "Later", path()).with_span(span(6, 16));
        let earlier = EvaluatedObject::new(ObjectKind::Property, "Earlier", path()).with_span(span(1, 11));
        let (locator, _) = locator(&text, vec![later, earlier]);
        let (id, object) = locator.find_offset(&path(), 7).unwrap().unwrap();
        assert_eq!((id.as_usize(), object.name.as_str()), (0, "Later"));
    }

    #[test]
    fn test_identical_ranges_break_ties_by_declaration_order() {
        let text = "<Project>\n<Import Project=\"a.props\" />\n</Project>";
        let first = EvaluatedObject::new(ObjectKind::Import, "a.props", path()).with_span(at(2, 1));
        let second = EvaluatedObject::new(ObjectKind::Property, "Imported", path()).with_span(at(2, 1));
        let (locator, _) = locator(text, vec![first, second]);
        let offset = text.find("Import").unwrap();
        let (id, object) = locator.find_offset(&path(), offset).unwrap().unwrap();
        assert_eq!(id.as_usize(), 0);
        assert_eq!(object.kind, ObjectKind::Import);
    }

    #[test]
    fn test_zero_width_spans_claim_their_own_offset() {
        let text = "<Project>\n\n</Project>";
        let first = EvaluatedObject::new(ObjectKind::Property, "A", path()).with_span(SourceSpan::between(
            Position::one_based(2, 1).unwrap(),
            Position::one_based(2, 1).unwrap(),
        ));
        let second = EvaluatedObject::new(ObjectKind::Property, "B", path()).with_span(SourceSpan::between(
            Position::one_based(2, 1).unwrap(),
            Position::one_based(2, 1).unwrap(),
        ));
        let (locator, _) = locator(text, vec![first, second]);
        let (_, object) = locator.find_offset(&path(), 10).unwrap().unwrap();
        assert_eq!(object.name, "A");
        assert!(locator.find_offset(&path(), 11).unwrap().is_none());
    }

    #[test]
    fn test_objects_in_unindexed_files_have_no_range() {
        let external = EvaluatedObject::new(ObjectKind::Import, "Sdk.props", "/sdk/Sdk.props")
            .with_span(at(1, 1));
        let (locator, _) = locator(PROJECT, vec![external]);
        assert_eq!(locator.all_objects().count(), 1);
        assert!(locator.ranges_of(ObjectId(0)).is_empty());
        assert_eq!(locator.by_name(ObjectKind::Import, "sdk.PROPS").count(), 1);
        assert!(locator
            .find_offset(Path::new("/sdk/Sdk.props"), 0)
            .unwrap()
            .is_none());
    }

    #[test]
    fn test_foreign_positions_are_rejected() {
        let foo = EvaluatedObject::new(ObjectKind::Property, "Foo", path()).with_span(at(1, 25));
        let (locator, _) = locator(PROJECT, vec![foo]);
        let other = OffsetIndex::shared(PROJECT);
        let position = other.text_position_of(30).unwrap();
        assert!(matches!(
            locator.find(&path(), &position),
            Err(LocatorError::Position(PositionError::IncompatibleIndex { .. }))
        ));
    }

    #[test]
    fn test_malformed_graphs_fail_construction() {
        let tree = Arc::new(parse(PROJECT));
        let trees = [(path(), tree)];

        let mut graph = EvaluatedGraph::new(path());
        graph.push(EvaluatedObject::new(ObjectKind::Target, "Build", path()));
        assert!(matches!(
            EvaluatedObjectLocator::new(Arc::new(graph), &trees),
            Err(LocatorError::MalformedGraph(_))
        ));

        let mut graph = EvaluatedGraph::new(path());
        graph.push(EvaluatedObject::new(ObjectKind::Target, "Build", path()).with_span(at(9, 1)));
        assert!(matches!(
            EvaluatedObjectLocator::new(Arc::new(graph), &trees),
            Err(LocatorError::MalformedGraph(_))
        ));

        let mut graph = EvaluatedGraph::new(path());
        graph.push(
            EvaluatedObject::new(ObjectKind::Target, "Build", path()).with_span(SourceSpan::between(
                Position::one_based(1, 5).unwrap(),
                Position::one_based(1, 2).unwrap(),
            )),
        );
        assert!(matches!(
            EvaluatedObjectLocator::new(Arc::new(graph), &trees),
            Err(LocatorError::MalformedGraph(_))
        ));
    }
}
