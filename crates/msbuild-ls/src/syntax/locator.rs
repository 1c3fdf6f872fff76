//
// syntax/locator.rs
//
// Point queries over a syntax tree: which construct, and which part of it
//

use std::sync::Arc;

use bitflags::bitflags;

use crate::offset_index::{PositionError, TextPosition};
use crate::position::Position;

use super::tree::{NodeId, SyntaxKind, SyntaxNode, SyntaxTree};

bitflags! {
    /// Independent facts about a location. Several can hold at once, e.g.
    /// `ATTRIBUTE | VALUE | EMPTY`.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct LocationFlags: u32 {
        const ELEMENT = 1 << 0;
        const ATTRIBUTE = 1 << 1;
        const NAME = 1 << 2;
        const VALUE = 1 << 3;
        const OPENING_TAG = 1 << 4;
        const CLOSING_TAG = 1 << 5;
        const ELEMENT_CONTENT = 1 << 6;
        const EMPTY = 1 << 7;
        const WHITESPACE = 1 << 8;
        /// The parser recovered here; every other flag is best-effort.
        const INVALID = 1 << 9;
    }
}

/// Result of a point query.
#[derive(Debug, Clone)]
pub struct SyntaxLocation {
    pub position: TextPosition,
    /// Deepest node containing the position.
    pub node: NodeId,
    pub kind: SyntaxKind,
    /// Element the location belongs to (the attribute's owner when on an attribute).
    pub element: Option<NodeId>,
    pub attribute: Option<NodeId>,
    pub flags: LocationFlags,
}

impl SyntaxLocation {
    pub fn is_element(&self) -> bool {
        self.flags.contains(LocationFlags::ELEMENT)
    }

    pub fn is_attribute(&self) -> bool {
        self.flags.contains(LocationFlags::ATTRIBUTE)
    }

    pub fn is_invalid(&self) -> bool {
        self.flags.contains(LocationFlags::INVALID)
    }

    pub fn element_name<'t>(&self, tree: &'t SyntaxTree) -> Option<&'t str> {
        self.element.and_then(|id| tree.node(id).name())
    }

    pub fn attribute_name<'t>(&self, tree: &'t SyntaxTree) -> Option<&'t str> {
        self.attribute.and_then(|id| tree.node(id).name())
    }
}

/// Answers "what syntactic construct contains offset O?" for one tree.
#[derive(Debug, Clone)]
pub struct SyntaxLocator {
    tree: Arc<SyntaxTree>,
}

impl SyntaxLocator {
    pub fn new(tree: Arc<SyntaxTree>) -> Self {
        Self { tree }
    }

    pub fn tree(&self) -> &Arc<SyntaxTree> {
        &self.tree
    }

    /// Locate a position bound to this tree's snapshot.
    ///
    /// Fails if `position` came from a different [`OffsetIndex`](crate::offset_index::OffsetIndex).
    /// Returns `Ok(None)` for an empty document or the end-of-text offset.
    pub fn locate(&self, position: &TextPosition) -> Result<Option<SyntaxLocation>, PositionError> {
        let own = self.tree.index();
        if !Arc::ptr_eq(own, position.index()) {
            return Err(PositionError::IncompatibleIndex {
                left: own.id(),
                right: position.index().id(),
            });
        }
        Ok(self.classify(position.clone()))
    }

    pub fn locate_offset(&self, offset: usize) -> Result<Option<SyntaxLocation>, PositionError> {
        let position = self.tree.index().text_position_of(offset)?;
        Ok(self.classify(position))
    }

    /// Locate a line/column position in either base.
    pub fn locate_position(&self, position: Position) -> Result<Option<SyntaxLocation>, PositionError> {
        let position = self.tree.index().text_position_at(position)?;
        Ok(self.classify(position))
    }

    fn classify(&self, position: TextPosition) -> Option<SyntaxLocation> {
        let tree = &self.tree;
        if tree.is_empty() {
            return None;
        }
        let offset = position.offset();
        let node_id = tree.node_at(offset)?;
        let node = tree.node(node_id);

        let mut location = SyntaxLocation {
            position,
            node: node_id,
            kind: node.kind,
            element: None,
            attribute: None,
            flags: LocationFlags::empty(),
        };

        match node.kind {
            SyntaxKind::Attribute => {
                location.attribute = Some(node_id);
                location.element = node.parent;
                location.flags = classify_attribute(node, offset);
            }
            SyntaxKind::Element => {
                location.element = Some(node_id);
                location.flags = classify_element(node, offset);
            }
            _ => {
                let parent = node.parent.and_then(|p| tree.enclosing_element(p));
                location.element = parent;
                location.flags = match parent {
                    Some(element) => {
                        let in_tag = tree
                            .node(element)
                            .as_element()
                            .is_some_and(|parts| parts.opening_tag.contains_offset(offset));
                        if in_tag {
                            LocationFlags::ELEMENT | LocationFlags::OPENING_TAG
                        } else {
                            LocationFlags::ELEMENT | LocationFlags::ELEMENT_CONTENT
                        }
                    }
                    None if node.kind == SyntaxKind::Whitespace => LocationFlags::WHITESPACE,
                    None => LocationFlags::empty(),
                };
            }
        }

        if tree.is_recovered(node_id) {
            location.flags |= LocationFlags::INVALID;
        }
        log::trace!("Located offset {} at {:?} {:?}", offset, location.kind, location.flags);
        Some(location)
    }
}

fn classify_attribute(node: &SyntaxNode, offset: usize) -> LocationFlags {
    let Some(parts) = node.as_attribute() else {
        return LocationFlags::ATTRIBUTE;
    };
    if parts.name_range.contains_offset(offset) {
        return LocationFlags::ATTRIBUTE | LocationFlags::NAME;
    }
    if let Some(value) = &parts.value_range {
        // The offset of the closing quote still addresses the value, which is
        // the only way to address an empty one.
        if value.absolute_start() <= offset && offset <= value.absolute_end() {
            let mut flags = LocationFlags::ATTRIBUTE | LocationFlags::VALUE;
            if value.is_empty() {
                flags |= LocationFlags::EMPTY;
            }
            return flags;
        }
    }
    LocationFlags::ATTRIBUTE
}

fn classify_element(node: &SyntaxNode, offset: usize) -> LocationFlags {
    let Some(parts) = node.as_element() else {
        return LocationFlags::ELEMENT;
    };
    if parts.name_range.contains_offset(offset) {
        return LocationFlags::ELEMENT | LocationFlags::NAME | LocationFlags::OPENING_TAG;
    }
    if parts
        .closing_name_range
        .as_ref()
        .is_some_and(|range| range.contains_offset(offset))
    {
        return LocationFlags::ELEMENT | LocationFlags::NAME | LocationFlags::CLOSING_TAG;
    }
    if let Some(content) = &parts.content {
        // `<A></A>`: the shared boundary addresses the empty content, not the closing tag.
        if content.is_empty() && content.absolute_start() == offset {
            return LocationFlags::ELEMENT | LocationFlags::ELEMENT_CONTENT | LocationFlags::EMPTY;
        }
    }
    if parts.opening_tag.contains_offset(offset) {
        return LocationFlags::ELEMENT | LocationFlags::OPENING_TAG;
    }
    if parts
        .closing_tag
        .as_ref()
        .is_some_and(|range| range.contains_offset(offset))
    {
        return LocationFlags::ELEMENT | LocationFlags::CLOSING_TAG;
    }
    if parts
        .content
        .as_ref()
        .is_some_and(|range| range.contains_offset(offset))
    {
        return LocationFlags::ELEMENT | LocationFlags::ELEMENT_CONTENT;
    }
    LocationFlags::ELEMENT
}
