//
// syntax/tree.rs
//
// Arena syntax tree over one text snapshot
//

use std::fmt;
use std::sync::Arc;

use crate::offset_index::{OffsetIndex, TextRange};

/// Index of a node in its [`SyntaxTree`] arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(pub(crate) u32);

impl NodeId {
    pub fn as_usize(self) -> usize {
        self.0 as usize
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SyntaxKind {
    Document,
    Element,
    Attribute,
    Text,
    Whitespace,
    Comment,
    CData,
    /// `<?...?>` and `<!...>` declarations.
    ProcessingInstruction,
    /// Region the parser could not make sense of.
    Invalid,
}

/// Sub-regions of an element.
#[derive(Debug, Clone)]
pub struct ElementParts {
    pub name: String,
    pub name_range: TextRange,
    /// `<Name ...>` (or `<Name .../>`), possibly unterminated.
    pub opening_tag: TextRange,
    pub closing_tag: Option<TextRange>,
    pub closing_name_range: Option<TextRange>,
    /// Text between the opening and closing tags. `None` for self-closing
    /// elements and for unterminated start tags.
    pub content: Option<TextRange>,
    pub self_closing: bool,
}

/// Sub-regions of an attribute.
#[derive(Debug, Clone)]
pub struct AttributeParts {
    pub name: String,
    pub name_range: TextRange,
    /// Value with entity references decoded.
    pub value: String,
    /// Range between the quotes; `None` when the attribute has no value at all.
    pub value_range: Option<TextRange>,
}

#[derive(Debug, Clone)]
pub enum NodeDetail {
    Element(ElementParts),
    Attribute(AttributeParts),
    Text(String),
    None,
}

#[derive(Debug, Clone)]
pub struct SyntaxNode {
    pub kind: SyntaxKind,
    pub range: TextRange,
    pub parent: Option<NodeId>,
    pub children: Vec<NodeId>,
    /// False when the parser had to recover inside this node.
    pub valid: bool,
    pub detail: NodeDetail,
}

impl SyntaxNode {
    pub fn as_element(&self) -> Option<&ElementParts> {
        match &self.detail {
            NodeDetail::Element(parts) => Some(parts),
            _ => None,
        }
    }

    pub fn as_attribute(&self) -> Option<&AttributeParts> {
        match &self.detail {
            NodeDetail::Attribute(parts) => Some(parts),
            _ => None,
        }
    }

    pub fn text(&self) -> Option<&str> {
        match &self.detail {
            NodeDetail::Text(text) => Some(text),
            _ => None,
        }
    }

    /// Element or attribute name.
    pub fn name(&self) -> Option<&str> {
        match &self.detail {
            NodeDetail::Element(parts) => Some(&parts.name),
            NodeDetail::Attribute(parts) => Some(&parts.name),
            _ => None,
        }
    }
}

/// A recovered parse problem.
#[derive(Debug, Clone)]
pub struct SyntaxError {
    pub message: String,
    pub range: TextRange,
}

/// Read-only tree over one text snapshot. Node 0 is the document root.
pub struct SyntaxTree {
    pub(crate) index: Arc<OffsetIndex>,
    pub(crate) nodes: Vec<SyntaxNode>,
    pub(crate) errors: Vec<SyntaxError>,
}

impl fmt::Debug for SyntaxTree {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SyntaxTree")
            .field("index", &self.index)
            .field("nodes", &self.nodes.len())
            .field("errors", &self.errors.len())
            .finish()
    }
}

impl SyntaxTree {
    pub fn index(&self) -> &Arc<OffsetIndex> {
        &self.index
    }

    pub fn root(&self) -> NodeId {
        NodeId(0)
    }

    pub fn node(&self, id: NodeId) -> &SyntaxNode {
        &self.nodes[id.as_usize()]
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// True when the text produced nothing but the document root.
    pub fn is_empty(&self) -> bool {
        self.nodes[0].children.is_empty()
    }

    pub fn errors(&self) -> &[SyntaxError] {
        &self.errors
    }

    pub fn has_errors(&self) -> bool {
        !self.errors.is_empty()
    }

    pub fn parent(&self, id: NodeId) -> Option<NodeId> {
        self.node(id).parent
    }

    pub fn children(&self, id: NodeId) -> impl Iterator<Item = NodeId> + '_ {
        self.node(id).children.iter().copied()
    }

    /// Child elements of `id`, in document order.
    pub fn child_elements(&self, id: NodeId) -> impl Iterator<Item = NodeId> + '_ {
        self.children(id)
            .filter(move |child| self.node(*child).kind == SyntaxKind::Element)
    }

    /// Attributes of element `id`, in document order.
    pub fn attributes(&self, id: NodeId) -> impl Iterator<Item = NodeId> + '_ {
        self.children(id)
            .filter(move |child| self.node(*child).kind == SyntaxKind::Attribute)
    }

    /// Attribute `name` of element `id`.
    pub fn attribute(&self, id: NodeId, name: &str) -> Option<&AttributeParts> {
        self.attributes(id)
            .filter_map(|attr| self.node(attr).as_attribute())
            .find(|parts| parts.name == name)
    }

    /// First element directly under the document root.
    pub fn root_element(&self) -> Option<NodeId> {
        self.child_elements(self.root()).next()
    }

    /// Every node in document (pre-)order, root included.
    pub fn descendants(&self) -> impl Iterator<Item = NodeId> + '_ {
        // Nodes are allocated in pre-order while parsing.
        (0..self.nodes.len() as u32).map(NodeId)
    }

    pub fn elements(&self) -> impl Iterator<Item = NodeId> + '_ {
        self.descendants()
            .filter(move |id| self.node(*id).kind == SyntaxKind::Element)
    }

    /// Nearest element enclosing `id`, `id` itself included.
    pub fn enclosing_element(&self, id: NodeId) -> Option<NodeId> {
        let mut current = Some(id);
        while let Some(node) = current {
            if self.node(node).kind == SyntaxKind::Element {
                return Some(node);
            }
            current = self.parent(node);
        }
        None
    }

    /// Deepest node whose range contains `offset` (start inclusive, end
    /// exclusive). Returns `None` when no node below the root contains it.
    pub fn node_at(&self, offset: usize) -> Option<NodeId> {
        let mut current = self.root();
        let mut found = None;
        loop {
            let children = &self.node(current).children;
            let after = children.partition_point(|child| self.node(*child).range.absolute_start() <= offset);
            if after == 0 {
                return found;
            }
            let candidate = children[after - 1];
            if !self.node(candidate).range.contains_offset(offset) {
                return found;
            }
            found = Some(candidate);
            current = candidate;
        }
    }

    /// True when `id`, or a node between it and its nearest enclosing
    /// element (that element included), came out of error recovery.
    pub fn is_recovered(&self, id: NodeId) -> bool {
        let mut current = Some(id);
        while let Some(node_id) = current {
            let node = self.node(node_id);
            if !node.valid {
                return true;
            }
            if node.kind == SyntaxKind::Element {
                return false;
            }
            current = node.parent;
        }
        false
    }

    /// Element whose opening `<` sits exactly at `offset`.
    pub fn element_starting_at(&self, offset: usize) -> Option<NodeId> {
        let mut id = self.node_at(offset)?;
        loop {
            let node = self.node(id);
            if node.kind == SyntaxKind::Element && node.range.absolute_start() == offset {
                return Some(id);
            }
            id = node.parent?;
        }
    }

    /// Element names from the root element down to `id`.
    pub fn element_path(&self, id: NodeId) -> Vec<&str> {
        let mut path = Vec::new();
        let mut current = self.enclosing_element(id);
        while let Some(element) = current {
            if let Some(name) = self.node(element).name() {
                path.push(name);
            }
            current = self.parent(element).and_then(|p| self.enclosing_element(p));
        }
        path.reverse();
        path
    }
}
