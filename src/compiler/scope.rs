//! Name resolution over the parent chain.
use crate::{
    ast::{Ast, Binding, Name, NodeId, NodeKind},
    lexer::Span,
};

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum ScopeError {
    #[error("undefined variable `{name}`")]
    UndefinedVariable { name: Box<str>, span: Span },
    /// The name is in scope, but nothing has been stored for it yet.
    #[error("`{name}` is used before its definition is complete")]
    UsedBeforeDefinition { name: Box<str>, span: Span },
}

impl ScopeError {
    pub fn span(&self) -> Span {
        match self {
            Self::UndefinedVariable { span, .. } | Self::UsedBeforeDefinition { span, .. } => {
                span.clone()
            }
        }
    }

    pub(crate) fn undefined(ast: &Ast, name: Name, at: NodeId) -> Self {
        Self::UndefinedVariable {
            name: ast.resolve(name).into(),
            span: ast.span(at),
        }
    }

    pub(crate) fn before_definition(ast: &Ast, name: Name, at: NodeId) -> Self {
        Self::UsedBeforeDefinition {
            name: ast.resolve(name).into(),
            span: ast.span(at),
        }
    }
}

/// What a lookup found at the nearest table mentioning the name
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lookup {
    Bound(Binding),
    /// In scope, no value attached yet
    Unassigned,
    NotFound,
}

/// Attach names to the symbol tables of the nodes that introduce them.
///
/// * `let`: the name goes into the body's table. A recursive `let` also marks the
///   name as [`Binding::SelfRecursive`] in the definition's table.
/// * `lambda`: every parameter goes into the body's table.
pub fn resolve(ast: &mut Ast) {
    let mut pending = vec![ast.root()];
    while let Some(id) = pending.pop() {
        match ast.kind(id).clone() {
            NodeKind::Let(l) => {
                ast.symbols_mut(l.body).insert_key(l.name);
                if l.is_recursive {
                    ast.symbols_mut(l.definition)
                        .insert_value(l.name, Binding::SelfRecursive);
                }
            }
            NodeKind::Lambda(lambda) => {
                let table = ast.symbols_mut(lambda.body);
                for param in lambda.params {
                    table.insert_key(param);
                }
            }
            _ => {}
        }
        pending.extend(ast.children(id));
    }
}

/// The node whose table binds `name` as seen from `from`.
///
/// Falls back to the root when `name` is a builtin.
pub fn find_scope(ast: &Ast, from: NodeId, name: Name) -> Result<NodeId, ScopeError> {
    let mut current = from;
    loop {
        if ast.symbols(current).contains(name) {
            return Ok(current);
        }
        match ast.parent(current) {
            Some(parent) => current = parent,
            None if ast.is_builtin(name) => return Ok(current),
            None => return Err(ScopeError::undefined(ast, name, from)),
        }
    }
}

/// The binding of `name` at the nearest table that mentions it.
pub fn get_in_scope(ast: &Ast, from: NodeId, name: Name) -> Lookup {
    let mut current = Some(from);
    while let Some(id) = current {
        match ast.symbols(id).get(name) {
            Some(Some(binding)) => return Lookup::Bound(binding),
            Some(None) => return Lookup::Unassigned,
            None => current = ast.parent(id),
        }
    }
    Lookup::NotFound
}
