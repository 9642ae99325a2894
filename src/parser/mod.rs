//! DSL text handling: tokenizer, expression parser, model reader.

pub mod tokenizer;

mod parser;

pub use parser::{parse_expression, parse_model};
