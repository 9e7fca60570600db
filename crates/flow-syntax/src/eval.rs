//! Expression and block-body evaluation.

use std::collections::BTreeSet;

use serde_json::{Map, Value};

use crate::ast::Stmt;
use crate::parser::Expr;
use crate::scope::Scope;

/// Evaluation errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EvalError {
    /// A reference's first segment is not defined in the scope.
    #[error("undefined reference `{0}`")]
    UndefinedReference(String),

    /// A reference indexed a field that does not exist.
    #[error("`{path}` has no field `{field}`")]
    UnknownField {
        /// The reference up to and including the failing segment's parent.
        path: String,
        /// The missing field.
        field: String,
    },

    /// A reference indexed into a non-object value.
    #[error("`{0}` is not an object and cannot be indexed")]
    NotAnObject(String),
}

/// Evaluate a single expression against a scope.
///
/// # Errors
///
/// Returns an [`EvalError`] when a reference cannot be resolved.
pub fn eval_expr(expr: &Expr, scope: &Scope<'_>) -> Result<Value, EvalError> {
    match expr {
        Expr::Literal(value) => Ok(value.clone()),
        Expr::Array(items) => {
            let mut out = Vec::with_capacity(items.len());
            for item in items {
                out.push(eval_expr(item, scope)?);
            }
            Ok(Value::Array(out))
        }
        Expr::Reference(path) => {
            let mut current = scope
                .lookup(&path[0])
                .ok_or_else(|| EvalError::UndefinedReference(path.join(".")))?;
            for (i, segment) in path.iter().enumerate().skip(1) {
                let Value::Object(map) = current else {
                    return Err(EvalError::NotAnObject(path[..i].join(".")));
                };
                current = map.get(segment).ok_or_else(|| EvalError::UnknownField {
                    path: path[..i].join("."),
                    field: segment.clone(),
                })?;
            }
            Ok(current.clone())
        }
    }
}

/// Evaluate a block body into an argument object.
///
/// Attributes become object fields. Nested unlabeled blocks become objects
/// under the block name; repeated blocks of the same name collect into an
/// array, which is how `rule { ... } rule { ... }` decodes into a `Vec`.
/// Labeled nested blocks nest one level deeper under their label.
///
/// # Errors
///
/// Returns the first [`EvalError`] hit while resolving references.
pub fn eval_body(body: &[Stmt], scope: &Scope<'_>) -> Result<Value, EvalError> {
    let mut out = Map::new();
    for stmt in body {
        match stmt {
            Stmt::Attribute(attr) => {
                out.insert(attr.name.clone(), eval_expr(&attr.value, scope)?);
            }
            Stmt::Block(block) => {
                let mut value = eval_body(&block.body, scope)?;
                if let Some(label) = &block.label {
                    let mut map = Map::new();
                    map.insert(label.clone(), value);
                    value = Value::Object(map);
                }
                append_block(&mut out, block.full_name(), value);
            }
        }
    }
    Ok(Value::Object(out))
}

fn append_block(out: &mut Map<String, Value>, name: String, value: Value) {
    match out.get_mut(&name) {
        None => {
            out.insert(name, value);
        }
        Some(Value::Array(items)) => items.push(value),
        Some(existing) => {
            let first = existing.take();
            *existing = Value::Array(vec![first, value]);
        }
    }
}

/// Collect every reference path used anywhere in a body, including inside
/// nested blocks and array elements.
#[must_use]
pub fn references(body: &[Stmt]) -> BTreeSet<Vec<String>> {
    let mut out = BTreeSet::new();
    collect_body(body, &mut out);
    out
}

fn collect_body(body: &[Stmt], out: &mut BTreeSet<Vec<String>>) {
    for stmt in body {
        match stmt {
            Stmt::Attribute(attr) => collect_expr(&attr.value, out),
            Stmt::Block(block) => collect_body(&block.body, out),
        }
    }
}

fn collect_expr(expr: &Expr, out: &mut BTreeSet<Vec<String>>) {
    match expr {
        Expr::Literal(_) => {}
        Expr::Reference(path) => {
            out.insert(path.clone());
        }
        Expr::Array(items) => {
            for item in items {
                collect_expr(item, out);
            }
        }
    }
}
