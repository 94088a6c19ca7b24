pub mod definitions;
pub mod lexer;
pub mod parser;

pub use definitions::{load_definitions, parse_definitions_text, Definitions, DefinitionsError};
pub use parser::{Expr, ExprParser};
