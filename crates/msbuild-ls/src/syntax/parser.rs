//
// syntax/parser.rs
//
// Builds the arena syntax tree from a tree-sitter XML parse
//

use std::sync::Arc;

use tree_sitter::Node;

use crate::offset_index::{ByteOffsets, OffsetIndex, TextRange};

use super::parser_pool::with_parser;
use super::tree::{
    AttributeParts, ElementParts, NodeDetail, NodeId, SyntaxError, SyntaxKind, SyntaxNode,
    SyntaxTree,
};

/// Where a run of sibling nodes sits, which decides what loose text means.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Region {
    /// Document level: only whitespace may sit between constructs.
    Top,
    /// Element content: loose text is character data.
    Content,
    /// Inside an ERROR node: only recognised constructs become nodes.
    Recovered,
}

/// Parse `text` into a syntax tree. Never fails: malformed regions become
/// invalid nodes and are reported through [`SyntaxTree::errors`].
pub fn parse(text: &str) -> SyntaxTree {
    parse_with_index(text, OffsetIndex::shared(text))
}

/// Parse `text` reusing an index already built for it.
pub fn parse_with_index(text: &str, index: Arc<OffsetIndex>) -> SyntaxTree {
    let started = std::time::Instant::now();
    let mut builder = TreeBuilder {
        text,
        offsets: ByteOffsets::new(text),
        index,
        nodes: Vec::new(),
        errors: Vec::new(),
    };
    let root = builder.push_node(SyntaxKind::Document, None, 0, text.len());

    if text.trim().is_empty() {
        builder.items(root, &[], 0, text.len(), Region::Top);
    } else {
        match with_parser(|parser| parser.parse(text, None)).flatten() {
            Some(parsed) => {
                let document = parsed.root_node();
                let mut items = Vec::new();
                if document.is_error() {
                    items.push(document);
                } else {
                    flatten_into(document, &mut items);
                }
                builder.items(root, &items, 0, text.len(), Region::Top);
            }
            None => builder.invalid_leaf(root, 0, text.len(), Some("XML parser is unavailable".into())),
        }
    }

    let tree = SyntaxTree {
        index: builder.index,
        nodes: builder.nodes,
        errors: builder.errors,
    };
    log::trace!(
        "Parsed {} chars into {} nodes ({} errors) in {:?}",
        tree.index.len(),
        tree.nodes.len(),
        tree.errors.len(),
        started.elapsed()
    );
    tree
}

/// Decode the predefined XML entities and numeric character references.
/// Unknown references are kept verbatim.
pub fn decode_entities(raw: &str) -> String {
    if !raw.contains('&') {
        return raw.to_string();
    }
    let mut out = String::with_capacity(raw.len());
    let mut rest = raw;
    while let Some(amp) = rest.find('&') {
        out.push_str(&rest[..amp]);
        rest = &rest[amp..];
        let Some(semi) = rest.find(';') else {
            break;
        };
        let entity = &rest[1..semi];
        let decoded = match entity {
            "lt" => Some('<'),
            "gt" => Some('>'),
            "amp" => Some('&'),
            "quot" => Some('"'),
            "apos" => Some('\''),
            _ => entity
                .strip_prefix("#x")
                .and_then(|hex| u32::from_str_radix(hex, 16).ok())
                .or_else(|| entity.strip_prefix('#').and_then(|dec| dec.parse().ok()))
                .and_then(char::from_u32),
        };
        match decoded {
            Some(ch) => {
                out.push(ch);
                rest = &rest[semi + 1..];
            }
            None => {
                out.push('&');
                rest = &rest[1..];
            }
        }
    }
    out.push_str(rest);
    out
}

fn children<'t>(node: Node<'t>) -> Vec<Node<'t>> {
    let mut cursor = node.walk();
    node.children(&mut cursor).collect()
}

/// Children of `node` with the grammar's grouping nodes (`prolog`,
/// `content`) dissolved into their parent.
fn flatten_into<'t>(node: Node<'t>, out: &mut Vec<Node<'t>>) {
    for child in children(node) {
        if matches!(child.kind(), "prolog" | "content") {
            flatten_into(child, out);
        } else {
            out.push(child);
        }
    }
}

fn child_of_kind<'t>(node: Node<'t>, kind: &str) -> Option<Node<'t>> {
    children(node)
        .into_iter()
        .find(|child| child.kind() == kind && !child.is_missing())
}

fn describe_missing(kind: &str) -> String {
    match kind {
        "element" => "missing root element".to_string(),
        "STag" | "EmptyElemTag" => "missing start tag".to_string(),
        "ETag" => "missing end tag".to_string(),
        "AttValue" => "missing attribute value".to_string(),
        "Name" => "missing name".to_string(),
        token => format!("missing '{token}'"),
    }
}

struct TreeBuilder<'a> {
    text: &'a str,
    offsets: ByteOffsets,
    index: Arc<OffsetIndex>,
    nodes: Vec<SyntaxNode>,
    errors: Vec<SyntaxError>,
}

impl<'a> TreeBuilder<'a> {
    fn slice(&self, start: usize, end: usize) -> &'a str {
        self.text.get(start..end.max(start)).unwrap_or_default()
    }

    fn node_text(&self, node: Node<'_>) -> &'a str {
        self.slice(node.start_byte(), node.end_byte())
    }

    /// Range over the byte span `start..end`.
    fn span(&self, start: usize, end: usize) -> TextRange {
        self.index
            .span(self.offsets.char_offset(start), self.offsets.char_offset(end))
    }

    fn node_span(&self, node: Node<'_>) -> TextRange {
        self.span(node.start_byte(), node.end_byte())
    }

    fn error(&mut self, message: impl Into<String>, range: TextRange) {
        self.errors.push(SyntaxError {
            message: message.into(),
            range,
        });
    }

    fn push_node(&mut self, kind: SyntaxKind, parent: Option<NodeId>, start: usize, end: usize) -> NodeId {
        let id = NodeId(self.nodes.len() as u32);
        let range = self.span(start, end);
        self.nodes.push(SyntaxNode {
            kind,
            range,
            parent,
            children: Vec::new(),
            valid: true,
            detail: NodeDetail::None,
        });
        if let Some(parent) = parent {
            self.nodes[parent.as_usize()].children.push(id);
        }
        id
    }

    fn invalidate(&mut self, id: NodeId) {
        self.nodes[id.as_usize()].valid = false;
    }

    fn invalid_leaf(&mut self, parent: NodeId, start: usize, end: usize, message: Option<String>) {
        let id = self.push_node(SyntaxKind::Invalid, Some(parent), start, end);
        self.invalidate(id);
        if let Some(message) = message {
            let range = self.span(start, end);
            self.error(message, range);
        }
    }

    fn missing(&mut self, parent: NodeId, node: Node<'_>) {
        let range = self.node_span(node);
        self.error(describe_missing(node.kind()), range);
        if self.nodes[parent.as_usize()].kind != SyntaxKind::Document {
            self.invalidate(parent);
        }
    }

    // ------------------------------------------------------------------------
    // Sibling runs
    // ------------------------------------------------------------------------

    /// Turn `items` (tree-sitter siblings within the byte span `start..end`)
    /// into children of `parent`. Adjacent character data and references
    /// become one text node; gaps between constructs are text too, except
    /// inside recovered regions.
    fn items(&mut self, parent: NodeId, items: &[Node<'_>], start: usize, end: usize, region: Region) {
        let mut cursor = start;
        let mut run: Option<(usize, usize)> = None;

        for (i, &node) in items.iter().enumerate() {
            if node.is_missing() {
                self.missing(parent, node);
                continue;
            }
            let (node_start, node_end) = (node.start_byte(), node.end_byte());
            if region != Region::Recovered && node_start > cursor {
                run = Some((run.map_or(cursor, |(s, _)| s), node_start));
            }
            cursor = cursor.max(node_end);

            if matches!(node.kind(), "CharData" | "EntityRef" | "CharRef") {
                run = Some((run.map_or(node_start, |(s, _)| s), node_end));
                continue;
            }
            self.flush_text(parent, run.take(), region);

            match node.kind() {
                "element" => self.element(parent, node),
                "STag" => {
                    let rest = &items[i + 1..];
                    let end = match region {
                        Region::Recovered => rest.last().map_or(node_end, |n| n.end_byte()),
                        _ => end,
                    };
                    self.unclosed_element(parent, node, rest, end.max(node_end));
                    return;
                }
                "EmptyElemTag" => self.tagged_element(parent, node, node, None, &[]),
                "ETag" => {
                    let message = (region != Region::Recovered).then(|| self.stray_closing_message(node));
                    self.invalid_leaf(parent, node_start, node_end, message);
                }
                "Comment" => {
                    let id = self.push_node(SyntaxKind::Comment, Some(parent), node_start, node_end);
                    if node.has_error() {
                        self.invalidate(id);
                    }
                }
                "CDSect" => self.cdata(parent, node),
                "PI" | "XMLDecl" | "doctypedecl" => {
                    let id = self.push_node(SyntaxKind::ProcessingInstruction, Some(parent), node_start, node_end);
                    if node.has_error() {
                        self.invalidate(id);
                    }
                }
                _ if node.is_error() => self.recovered(parent, node),
                _ if !node.is_named() => {}
                kind => {
                    let message = (region != Region::Recovered).then(|| format!("unexpected {kind}"));
                    self.invalid_leaf(parent, node_start, node_end, message);
                }
            }
        }

        if region != Region::Recovered && end > cursor {
            run = Some((run.map_or(cursor, |(s, _)| s), end));
        }
        self.flush_text(parent, run, region);
    }

    fn flush_text(&mut self, parent: NodeId, run: Option<(usize, usize)>, region: Region) {
        let Some((start, end)) = run else {
            return;
        };
        let raw = self.slice(start, end);
        if raw.is_empty() {
            return;
        }
        if raw.chars().all(char::is_whitespace) {
            let detail = NodeDetail::Text(raw.to_string());
            let id = self.push_node(SyntaxKind::Whitespace, Some(parent), start, end);
            self.nodes[id.as_usize()].detail = detail;
        } else if region == Region::Top {
            self.invalid_leaf(
                parent,
                start,
                end,
                Some("text is not allowed outside the root element".into()),
            );
        } else {
            let detail = NodeDetail::Text(decode_entities(raw));
            let id = self.push_node(SyntaxKind::Text, Some(parent), start, end);
            self.nodes[id.as_usize()].detail = detail;
        }
    }

    /// An ERROR node: an invalid container holding whatever constructs the
    /// grammar still recognised inside it.
    fn recovered(&mut self, parent: NodeId, node: Node<'_>) {
        let id = self.push_node(SyntaxKind::Invalid, Some(parent), node.start_byte(), node.end_byte());
        self.invalidate(id);
        let message = match child_of_kind(node, "ETag") {
            Some(closing) if child_of_kind(node, "STag").is_none() => self.stray_closing_message(closing),
            _ => {
                let snippet: String = self
                    .node_text(node)
                    .lines()
                    .next()
                    .unwrap_or_default()
                    .chars()
                    .take(24)
                    .collect();
                format!("unexpected '{}'", snippet.trim())
            }
        };
        let range = self.node_span(node);
        self.error(message, range);

        let mut items = Vec::new();
        flatten_into(node, &mut items);
        self.items(id, &items, node.start_byte(), node.end_byte(), Region::Recovered);
    }

    fn stray_closing_message(&self, closing: Node<'_>) -> String {
        let (start, end) = self.tag_name_bytes(closing);
        format!("closing tag </{}> has no matching start tag", self.slice(start, end))
    }

    fn cdata(&mut self, parent: NodeId, node: Node<'_>) {
        let raw = self.node_text(node);
        let closed = raw.ends_with("]]>");
        let body = raw.strip_prefix("<![CDATA[").unwrap_or(raw);
        let body = body.strip_suffix("]]>").unwrap_or(body).to_string();
        let id = self.push_node(SyntaxKind::CData, Some(parent), node.start_byte(), node.end_byte());
        self.nodes[id.as_usize()].detail = NodeDetail::Text(body);
        if !closed || node.has_error() {
            self.invalidate(id);
            let range = self.node_span(node);
            self.error("CDATA section is not closed", range);
        }
    }

    // ------------------------------------------------------------------------
    // Elements and attributes
    // ------------------------------------------------------------------------

    fn element(&mut self, parent: NodeId, node: Node<'_>) {
        let parts = children(node);
        let tag = parts
            .iter()
            .copied()
            .find(|child| matches!(child.kind(), "STag" | "EmptyElemTag") && !child.is_missing());
        let Some(tag) = tag else {
            self.recovered(parent, node);
            return;
        };
        let closing = parts.iter().copied().find(|child| child.kind() == "ETag");

        let mut body = Vec::new();
        for child in parts {
            if child == tag || Some(child) == closing {
                continue;
            }
            if child.kind() == "content" {
                flatten_into(child, &mut body);
            } else {
                body.push(child);
            }
        }
        self.tagged_element(parent, node, tag, closing, &body);
    }

    /// Element spanning `node`, opened by `tag` and closed by `closing`.
    fn tagged_element(
        &mut self,
        parent: NodeId,
        node: Node<'_>,
        tag: Node<'_>,
        closing: Option<Node<'_>>,
        body: &[Node<'_>],
    ) {
        let id = self.push_node(SyntaxKind::Element, Some(parent), node.start_byte(), node.end_byte());
        let mut parts = self.opening_tag(id, tag);

        if !parts.self_closing {
            let content_start = tag.end_byte();
            let present = closing.filter(|closing| !closing.is_missing());
            let content_end = present
                .map_or(node.end_byte(), |closing| closing.start_byte())
                .max(body.last().map_or(content_start, |last| last.end_byte()))
                .max(content_start);
            parts.content = Some(self.span(content_start, content_end));

            match present {
                Some(closing) => {
                    let (name_start, name_end) = self.tag_name_bytes(closing);
                    parts.closing_tag = Some(self.node_span(closing));
                    parts.closing_name_range = Some(self.span(name_start, name_end));
                    if closing.has_error() {
                        self.invalidate(id);
                        let range = self.node_span(closing);
                        self.error(format!("end tag </{}> is not closed", parts.name), range);
                    }
                }
                None => {
                    self.invalidate(id);
                    self.error(
                        format!("element <{}> is not closed", parts.name),
                        parts.opening_tag.clone(),
                    );
                }
            }
            self.items(id, body, content_start, content_end, Region::Content);
        }

        self.nodes[id.as_usize()].detail = NodeDetail::Element(parts);
    }

    /// A start tag the grammar could not pair with an end tag. It takes the
    /// rest of its siblings as content.
    fn unclosed_element(&mut self, parent: NodeId, tag: Node<'_>, rest: &[Node<'_>], end: usize) {
        let id = self.push_node(SyntaxKind::Element, Some(parent), tag.start_byte(), end);
        let mut parts = self.opening_tag(id, tag);
        self.invalidate(id);
        self.error(
            format!("element <{}> is not closed", parts.name),
            parts.opening_tag.clone(),
        );
        parts.content = Some(self.span(tag.end_byte(), end));
        self.items(id, rest, tag.end_byte(), end, Region::Content);
        self.nodes[id.as_usize()].detail = NodeDetail::Element(parts);
    }

    /// Name, attributes and validity of a start or empty-element tag.
    fn opening_tag(&mut self, element: NodeId, tag: Node<'_>) -> ElementParts {
        let (name_start, name_end) = self.tag_name_bytes(tag);
        let name = self.slice(name_start, name_end).to_string();
        if tag.has_error() {
            self.invalidate(element);
        }

        for child in children(tag) {
            if child.is_missing() {
                self.missing(element, child);
            } else if child.kind() == "Attribute" {
                self.attribute(element, child);
            } else if child.is_error() {
                self.invalid_leaf(
                    element,
                    child.start_byte(),
                    child.end_byte(),
                    Some(format!("unexpected input in tag <{name}>")),
                );
            }
        }

        ElementParts {
            name_range: self.span(name_start, name_end),
            opening_tag: self.node_span(tag),
            closing_tag: None,
            closing_name_range: None,
            content: None,
            self_closing: tag.kind() == "EmptyElemTag",
            name,
        }
    }

    /// Byte span of a tag's name, read from its `Name` child or, failing
    /// that, from the characters after `<` or `</`.
    fn tag_name_bytes(&self, tag: Node<'_>) -> (usize, usize) {
        if let Some(name) = child_of_kind(tag, "Name") {
            return (name.start_byte(), name.end_byte());
        }
        let raw = self.node_text(tag);
        let skip = if raw.starts_with("</") { 2 } else { raw.starts_with('<') as usize };
        let start = (tag.start_byte() + skip).min(tag.end_byte());
        let rest = self.slice(start, tag.end_byte());
        let len = rest
            .find(|c: char| c.is_whitespace() || matches!(c, '>' | '/' | '='))
            .unwrap_or(rest.len());
        (start, start + len)
    }

    fn attribute(&mut self, element: NodeId, node: Node<'_>) {
        let id = self.push_node(SyntaxKind::Attribute, Some(element), node.start_byte(), node.end_byte());
        let (name_start, name_end) = match child_of_kind(node, "Name") {
            Some(name) => (name.start_byte(), name.end_byte()),
            None => {
                let raw = self.node_text(node);
                let len = raw
                    .find(|c: char| c.is_whitespace() || c == '=')
                    .unwrap_or(raw.len());
                (node.start_byte(), node.start_byte() + len)
            }
        };
        let name = self.slice(name_start, name_end).to_string();
        let mut valid = !node.has_error();

        let (value, value_range) = match child_of_kind(node, "AttValue") {
            Some(value) => {
                let raw = self.node_text(value);
                let quote = raw.chars().next().filter(|c| matches!(c, '"' | '\''));
                let start = value.start_byte() + quote.map_or(0, char::len_utf8);
                let closed = quote.is_some_and(|q| raw.len() >= 2 && raw.ends_with(q));
                let end = if closed { value.end_byte() - 1 } else { value.end_byte() };
                if !closed {
                    valid = false;
                    let range = self.node_span(value);
                    self.error(format!("value of attribute '{name}' is not closed"), range);
                }
                (decode_entities(self.slice(start, end)), Some(self.span(start, end)))
            }
            None => {
                valid = false;
                let range = self.span(name_start, name_end);
                self.error(format!("attribute '{name}' has no value"), range);
                (String::new(), None)
            }
        };

        let name_range = self.span(name_start, name_end);
        let entry = &mut self.nodes[id.as_usize()];
        entry.valid = valid;
        entry.detail = NodeDetail::Attribute(AttributeParts {
            name,
            name_range,
            value,
            value_range,
        });
        if !valid {
            self.invalidate(element);
        }
    }
}
