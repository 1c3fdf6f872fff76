//
// syntax/parser_pool.rs
//
// Thread-local tree-sitter XML parser, reused across parses
//

use std::cell::RefCell;

use tree_sitter::Parser;

thread_local! {
    static PARSER: RefCell<Option<Parser>> = RefCell::new(xml_parser());
}

fn xml_parser() -> Option<Parser> {
    let mut parser = Parser::new();
    match parser.set_language(&tree_sitter_xml::LANGUAGE_XML.into()) {
        Ok(()) => Some(parser),
        Err(err) => {
            log::error!("XML grammar does not load into this tree-sitter runtime: {err}");
            None
        }
    }
}

/// Run `f` with this thread's parser. `None` when the grammar failed to load.
pub fn with_parser<F, R>(f: F) -> Option<R>
where
    F: FnOnce(&mut Parser) -> R,
{
    PARSER.with(|parser| parser.borrow_mut().as_mut().map(f))
}
