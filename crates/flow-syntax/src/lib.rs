//! # flow-syntax
//!
//! The configuration language surface consumed by the Flow component
//! controller.
//!
//! This crate provides the pieces the controller needs from the language
//! layer and nothing more:
//!
//! - **Lexing and parsing** of a source file into a block tree. Every block
//!   records the byte offsets of its curly braces so callers can slice the
//!   verbatim body text out of the original source (used to republish
//!   `declare` fragments).
//! - **Scopes** binding identifiers to values, with parent chaining.
//! - **Expression evaluation** of block bodies against a scope, producing
//!   plain [`serde_json::Value`] objects that decode into typed argument
//!   structs with serde.
//! - **Reference extraction** for dependency-graph construction.
//!
//! ## Example
//!
//! ```rust
//! use flow_syntax::{eval_body, parse_file, Scope};
//!
//! let file = parse_file(r#"
//!     counter "c" {
//!         period = "10ms"
//!         max = 10
//!     }
//! "#)
//! .unwrap();
//!
//! let scope = Scope::root();
//! let block = file.body[0].as_block().unwrap();
//! let args = eval_body(&block.body, &scope).unwrap();
//! assert_eq!(args["max"], 10);
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

mod ast;
mod eval;
mod parser;
mod scope;
mod token;

pub use ast::{Attribute, Block, File, Stmt};
pub use eval::{eval_body, eval_expr, references, EvalError};
pub use parser::{parse_file, Expr, ParseError};
pub use scope::Scope;
pub use serde_json::Value;
