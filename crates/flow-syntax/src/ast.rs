//! Abstract syntax tree for parsed configuration files.

use crate::parser::Expr;

/// A parsed source file.
#[derive(Debug, Clone, PartialEq)]
pub struct File {
    /// Top-level statements, in source order.
    pub body: Vec<Stmt>,
}

/// A single statement within a file or block body.
#[derive(Debug, Clone, PartialEq)]
pub enum Stmt {
    /// `name = expr`
    Attribute(Attribute),
    /// `name.path "label" { ... }`
    Block(Block),
}

impl Stmt {
    /// Returns the statement as a block, if it is one.
    #[must_use]
    pub fn as_block(&self) -> Option<&Block> {
        match self {
            Self::Block(block) => Some(block),
            Self::Attribute(_) => None,
        }
    }

    /// Byte offset of the first token of the statement.
    #[must_use]
    pub fn offset(&self) -> usize {
        match self {
            Self::Attribute(attr) => attr.offset,
            Self::Block(block) => block.offset,
        }
    }
}

/// A key/value attribute.
#[derive(Debug, Clone, PartialEq)]
pub struct Attribute {
    /// Attribute name.
    pub name: String,
    /// Unevaluated value expression.
    pub value: Expr,
    /// Byte offset of the attribute name.
    pub offset: usize,
}

/// A named, optionally labeled block with a body of statements.
#[derive(Debug, Clone, PartialEq)]
pub struct Block {
    /// Dotted name path, e.g. `["import", "file"]`.
    pub name: Vec<String>,
    /// Optional string label.
    pub label: Option<String>,
    /// Body statements.
    pub body: Vec<Stmt>,
    /// Byte offset of the opening `{`.
    pub lcurly: usize,
    /// Byte offset of the closing `}`.
    pub rcurly: usize,
    /// Byte offset of the first name segment.
    pub offset: usize,
}

impl Block {
    /// The dotted block name, e.g. `"import.file"`.
    #[must_use]
    pub fn full_name(&self) -> String {
        self.name.join(".")
    }

    /// Slice the verbatim body text out of the source the block was parsed
    /// from, excluding the braces themselves.
    ///
    /// The caller must pass the exact source string the block came from;
    /// offsets are byte positions into it.
    #[must_use]
    pub fn body_text<'a>(&self, src: &'a str) -> &'a str {
        &src[self.lcurly + 1..self.rcurly]
    }
}
