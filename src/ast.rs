//! The tree the compiler core works on.
//!
//! Nodes live in an arena and refer to each other by [`NodeId`]. Every node except the
//! program root knows its parent, and every node owns a [`SymbolTable`]; scope lookups
//! walk the parent chain reading those tables. Passes mutate the tree in place: the
//! resolver fills tables, closure conversion swaps lambdas for closure constructions and
//! appends lifted functions, and code generation attaches stack slots. The whole tree is
//! released at once when the [`Ast`] is dropped.
use core::fmt;

use lasso::Rodeo;

use crate::{lexer::Span, runtime::Builtin};

/// Interned identifier
pub type Name = lasso::Spur;

/// Byte offset below the frame base (`rbp`)
pub type Offset = usize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct NodeId(u32);

impl NodeId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// What a name is attached to in a symbol table.
///
/// A binding holds at most one of these at a time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Binding {
    /// The value lives in the stack slot at `[rbp - offset]`
    Slot(Offset),
    /// The name is the recursive binding currently being defined
    SelfRecursive,
}

/// Insertion-ordered map from names to an optional [`Binding`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SymbolTable(Vec<(Name, Option<Binding>)>);

impl SymbolTable {
    fn position(&self, name: Name) -> Option<usize> {
        self.0.iter().position(|(key, _)| *key == name)
    }

    /// Adds `name` without a value. Existing entries are left alone.
    pub fn insert_key(&mut self, name: Name) {
        if self.position(name).is_none() {
            self.0.push((name, None));
        }
    }

    /// Attaches `binding` to `name`, replacing whatever was attached before.
    pub fn insert_value(&mut self, name: Name, binding: Binding) {
        match self.position(name) {
            Some(idx) => self.0[idx].1 = Some(binding),
            None => self.0.push((name, Some(binding))),
        }
    }

    pub fn contains(&self, name: Name) -> bool {
        self.position(name).is_some()
    }

    /// `None` if the name is absent, `Some(None)` if present without a value.
    pub fn get(&self, name: Name) -> Option<Option<Binding>> {
        self.position(name).map(|idx| self.0[idx].1)
    }

    /// Drops every self-recursive marker, they only matter during closure conversion
    pub fn remove_self_recursive(&mut self) {
        self.0
            .retain(|(_, binding)| *binding != Some(Binding::SelfRecursive));
    }

    pub fn iter(&self) -> impl Iterator<Item = (Name, Option<Binding>)> + '_ {
        self.0.iter().copied()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Var {
    pub name: Name,
    /// Set by closure conversion once `name` has been rewritten to the lifted
    /// function that contains this reference
    pub is_recursive: bool,
    /// Set on the operands closure conversion appends to self-recursive calls: `name`
    /// is one of the enclosing function's captured parameters, whatever shadows it
    /// at the call site
    pub is_captured: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct If {
    pub pred: NodeId,
    pub then: NodeId,
    pub otherwise: NodeId,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Lambda {
    /// Only set for lifted (top-level) functions
    pub name: Option<Name>,
    /// Bound parameters, followed by the captured free variables once lifted
    pub params: Vec<Name>,
    /// How many of the trailing `params` are captured free variables
    pub captured: usize,
    pub body: NodeId,
}

impl Lambda {
    /// Parameters supplied by callers, as opposed to captured ones
    pub fn n_bound(&self) -> usize {
        self.params.len() - self.captured
    }

    pub fn free_params(&self) -> &[Name] {
        &self.params[self.n_bound()..]
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Let {
    pub name: Name,
    pub definition: NodeId,
    pub body: NodeId,
    pub is_recursive: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Apply {
    pub operator: NodeId,
    pub operands: Vec<NodeId>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MakeClosure {
    /// The lifted function
    pub function: Name,
    pub n_bound: usize,
    pub n_free: usize,
    /// Evaluated in the enclosing scope when the closure is created
    pub free_vars: Vec<NodeId>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Program {
    pub main: NodeId,
    pub functions: Vec<NodeId>,
    pub builtins: Vec<Name>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodeKind {
    Integer(i64),
    Var(Var),
    If(If),
    Lambda(Lambda),
    Let(Let),
    Apply(Apply),
    MakeClosure(MakeClosure),
    Program(Program),
}

impl NodeKind {
    pub fn describe(&self) -> &'static str {
        match self {
            NodeKind::Integer(_) => "integer",
            NodeKind::Var(_) => "variable",
            NodeKind::If(_) => "if",
            NodeKind::Lambda(_) => "lambda",
            NodeKind::Let(_) => "let",
            NodeKind::Apply(_) => "application",
            NodeKind::MakeClosure(_) => "closure construction",
            NodeKind::Program(_) => "program",
        }
    }

    /// Children in evaluation-independent structural order
    pub fn children(&self) -> Vec<NodeId> {
        match self {
            NodeKind::Integer(_) | NodeKind::Var(_) => vec![],
            NodeKind::If(If {
                pred,
                then,
                otherwise,
            }) => vec![*pred, *then, *otherwise],
            NodeKind::Lambda(lambda) => vec![lambda.body],
            NodeKind::Let(l) => vec![l.definition, l.body],
            NodeKind::Apply(apply) => std::iter::once(apply.operator)
                .chain(apply.operands.iter().copied())
                .collect(),
            NodeKind::MakeClosure(closure) => closure.free_vars.clone(),
            NodeKind::Program(program) => std::iter::once(program.main)
                .chain(program.functions.iter().copied())
                .collect(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Node {
    parent: Option<NodeId>,
    symbols: SymbolTable,
    span: Span,
    kind: NodeKind,
}

impl Node {
    pub fn parent(&self) -> Option<NodeId> {
        self.parent
    }

    pub fn symbols(&self) -> &SymbolTable {
        &self.symbols
    }

    pub fn span(&self) -> Span {
        self.span.clone()
    }

    pub fn kind(&self) -> &NodeKind {
        &self.kind
    }
}

#[derive(Debug, PartialEq)]
pub struct Ast {
    nodes: Vec<Node>,
    root: NodeId,
    names: Rodeo,
}

impl Ast {
    pub fn root(&self) -> NodeId {
        self.root
    }

    pub fn node(&self, id: NodeId) -> &Node {
        &self.nodes[id.index()]
    }

    pub fn kind(&self, id: NodeId) -> &NodeKind {
        &self.nodes[id.index()].kind
    }

    pub fn parent(&self, id: NodeId) -> Option<NodeId> {
        self.nodes[id.index()].parent
    }

    pub fn span(&self, id: NodeId) -> Span {
        self.nodes[id.index()].span.clone()
    }

    pub fn symbols(&self, id: NodeId) -> &SymbolTable {
        &self.nodes[id.index()].symbols
    }

    pub fn symbols_mut(&mut self, id: NodeId) -> &mut SymbolTable {
        &mut self.nodes[id.index()].symbols
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn intern(&mut self, name: impl AsRef<str>) -> Name {
        self.names.get_or_intern(name.as_ref())
    }

    /// The interned handle of `name`, if anything was ever called that
    pub fn lookup_name(&self, name: impl AsRef<str>) -> Option<Name> {
        self.names.get(name.as_ref())
    }

    pub fn resolve(&self, name: Name) -> &str {
        self.names.resolve(&name)
    }

    pub fn program(&self) -> &Program {
        match self.kind(self.root) {
            NodeKind::Program(program) => program,
            _ => unreachable!("the root is always a program node"),
        }
    }

    fn program_mut(&mut self) -> &mut Program {
        let root = self.root;
        match &mut self.nodes[root.index()].kind {
            NodeKind::Program(program) => program,
            _ => unreachable!("the root is always a program node"),
        }
    }

    pub fn is_builtin(&self, name: Name) -> bool {
        self.program().builtins.contains(&name)
    }

    /// The lifted function called `name`
    pub fn function(&self, name: Name) -> Option<(NodeId, &Lambda)> {
        self.program()
            .functions
            .iter()
            .find_map(|&id| match self.kind(id) {
                NodeKind::Lambda(lambda) if lambda.name == Some(name) => Some((id, lambda)),
                _ => None,
            })
    }

    pub fn children(&self, id: NodeId) -> Vec<NodeId> {
        self.kind(id).children()
    }

    /// Every node below (and including) `id`, children before their parent
    pub fn post_order(&self, id: NodeId) -> Vec<NodeId> {
        let mut order = Vec::with_capacity(self.nodes.len());
        // (node, children already pushed?)
        let mut stack = vec![(id, false)];
        while let Some((current, expanded)) = stack.pop() {
            if expanded {
                order.push(current);
            } else {
                stack.push((current, true));
                stack.extend(self.children(current).into_iter().rev().map(|c| (c, false)));
            }
        }
        order
    }

    /// Is `candidate` on the parent chain of `descendant` (excluding `descendant` itself)?
    pub fn is_ancestor(&self, candidate: NodeId, descendant: NodeId) -> bool {
        let mut current = self.parent(descendant);
        while let Some(node) = current {
            if node == candidate {
                return true;
            }
            current = self.parent(node);
        }
        false
    }

    /// Allocates a node below `parent`. The caller is responsible for linking it
    /// into the parent's [`NodeKind`].
    pub(crate) fn alloc(&mut self, parent: NodeId, span: Span, kind: NodeKind) -> NodeId {
        let id = NodeId(self.nodes.len() as u32);
        let children = kind.children();
        self.nodes.push(Node {
            parent: Some(parent),
            symbols: SymbolTable::default(),
            span,
            kind,
        });
        for child in children {
            self.nodes[child.index()].parent = Some(id);
        }
        id
    }

    /// Swaps the variant stored at `id`, re-pointing the new children at `id`.
    pub(crate) fn replace_kind(&mut self, id: NodeId, kind: NodeKind) -> NodeKind {
        for child in kind.children() {
            self.nodes[child.index()].parent = Some(id);
        }
        std::mem::replace(&mut self.nodes[id.index()].kind, kind)
    }

    pub(crate) fn kind_mut(&mut self, id: NodeId) -> &mut NodeKind {
        &mut self.nodes[id.index()].kind
    }

    pub(crate) fn push_function(&mut self, function: NodeId) {
        self.program_mut().functions.push(function);
    }
}

/// Builds an [`Ast`] bottom-up: children first, then the node that owns them.
#[derive(Debug)]
pub struct AstBuilder {
    nodes: Vec<Node>,
    names: Rodeo,
}

impl Default for AstBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl AstBuilder {
    pub fn new() -> Self {
        Self {
            nodes: vec![],
            names: Rodeo::default(),
        }
    }

    pub fn intern(&mut self, name: impl AsRef<str>) -> Name {
        self.names.get_or_intern(name.as_ref())
    }

    fn push(&mut self, span: Span, kind: NodeKind) -> NodeId {
        let id = NodeId(self.nodes.len() as u32);
        for child in kind.children() {
            self.nodes[child.index()].parent = Some(id);
        }
        self.nodes.push(Node {
            parent: None,
            symbols: SymbolTable::default(),
            span,
            kind,
        });
        id
    }

    pub fn integer(&mut self, value: i64, span: Span) -> NodeId {
        self.push(span, NodeKind::Integer(value))
    }

    pub fn var(&mut self, name: impl AsRef<str>, span: Span) -> NodeId {
        let name = self.intern(name);
        self.push(
            span,
            NodeKind::Var(Var {
                name,
                is_recursive: false,
                is_captured: false,
            }),
        )
    }

    pub fn if_then_else(
        &mut self,
        pred: NodeId,
        then: NodeId,
        otherwise: NodeId,
        span: Span,
    ) -> NodeId {
        self.push(
            span,
            NodeKind::If(If {
                pred,
                then,
                otherwise,
            }),
        )
    }

    pub fn lambda(&mut self, params: Vec<Name>, body: NodeId, span: Span) -> NodeId {
        self.push(
            span,
            NodeKind::Lambda(Lambda {
                name: None,
                params,
                captured: 0,
                body,
            }),
        )
    }

    pub fn let_in(
        &mut self,
        name: Name,
        definition: NodeId,
        body: NodeId,
        is_recursive: bool,
        span: Span,
    ) -> NodeId {
        self.push(
            span,
            NodeKind::Let(Let {
                name,
                definition,
                body,
                is_recursive,
            }),
        )
    }

    pub fn apply(&mut self, operator: NodeId, operands: Vec<NodeId>, span: Span) -> NodeId {
        self.push(span, NodeKind::Apply(Apply { operator, operands }))
    }

    /// Wraps `main` in the program root
    pub fn finish(mut self, main: NodeId, span: Span) -> Ast {
        let builtins = Builtin::ALL
            .iter()
            .map(|builtin| self.intern(builtin.name()))
            .collect();
        let root = self.push(
            span,
            NodeKind::Program(Program {
                main,
                functions: vec![],
                builtins,
            }),
        );
        Ast {
            nodes: self.nodes,
            root,
            names: self.names,
        }
    }
}
