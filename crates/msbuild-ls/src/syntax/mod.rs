//
// syntax/mod.rs
//
// Syntax layer: error-tolerant parse tree and point locator
//

pub mod locator;
pub mod parser;
mod parser_pool;
pub mod tree;

pub use locator::{LocationFlags, SyntaxLocation, SyntaxLocator};
pub use parser::{decode_entities, parse, parse_with_index};
pub use tree::{
    AttributeParts, ElementParts, NodeDetail, NodeId, SyntaxError, SyntaxKind, SyntaxNode,
    SyntaxTree,
};
