//! Stack frame layout.
//!
//! A frame holds one 8-byte slot per parameter, per `let` binding, per spilled
//! application operand (plus one for the callee or the argument block), and per
//! captured value of a closure construction. [`frame_size`] and the code generator
//! both count slots through [`own_slots`], and the generator walks nodes in exactly
//! the order [`frame_children`] lists them, so the reserved space always matches the
//! offsets handed out.
use crate::ast::{Apply, Ast, NodeId, NodeKind, Offset, Var};

pub const WORD: usize = 8;

/// Whether `apply` is a direct call of a lifted function on itself
pub fn is_recursive_call(ast: &Ast, apply: &Apply) -> bool {
    matches!(
        ast.kind(apply.operator),
        NodeKind::Var(Var {
            is_recursive: true,
            ..
        })
    )
}

/// Slots reserved when code for `id` itself is emitted, ignoring its children
pub fn own_slots(ast: &Ast, id: NodeId) -> usize {
    match ast.kind(id) {
        NodeKind::Integer(_) | NodeKind::If(_) | NodeKind::Program(_) => 0,
        NodeKind::Var(Var {
            name,
            is_recursive: true,
            ..
        }) => ast
            .function(*name)
            .map_or(0, |(_, lambda)| lambda.captured),
        NodeKind::Var(_) => 0,
        NodeKind::Let(_) => 1,
        // operands, then the closure or the argument block
        NodeKind::Apply(apply) => apply.operands.len() + 1,
        NodeKind::MakeClosure(closure) => closure.free_vars.len(),
        NodeKind::Lambda(lambda) => lambda.params.len(),
    }
}

/// The children whose code lands in the same frame as `id`, in emission order
pub fn frame_children(ast: &Ast, id: NodeId) -> Vec<NodeId> {
    match ast.kind(id) {
        NodeKind::Integer(_) | NodeKind::Var(_) => vec![],
        NodeKind::Apply(apply) if is_recursive_call(ast, apply) => {
            apply.operands.iter().rev().copied().collect()
        }
        NodeKind::Apply(apply) => apply
            .operands
            .iter()
            .rev()
            .copied()
            .chain(std::iter::once(apply.operator))
            .collect(),
        NodeKind::Program(program) => vec![program.main],
        kind => kind.children(),
    }
}

/// Bytes of stack needed by the code for `id` and everything emitted with it
pub fn frame_size(ast: &Ast, id: NodeId) -> usize {
    let mut slots = 0;
    let mut pending = vec![id];
    while let Some(current) = pending.pop() {
        slots += own_slots(ast, current);
        pending.extend(frame_children(ast, current));
    }
    slots * WORD
}

/// Rounds a frame up so `rsp` stays 16-byte aligned across calls
pub fn aligned(size: usize) -> usize {
    size.next_multiple_of(2 * WORD)
}

/// Hands out slot offsets below `rbp`
#[derive(Debug, Default)]
pub struct Frame {
    cursor: usize,
}

impl Frame {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reserves the slots `id` owns, in order
    pub fn claim(&mut self, ast: &Ast, id: NodeId) -> Vec<Offset> {
        (0..own_slots(ast, id))
            .map(|_| {
                self.cursor += WORD;
                self.cursor
            })
            .collect()
    }

    /// Bytes handed out so far
    pub fn used(&self) -> usize {
        self.cursor
    }
}

#[cfg(test)]
mod tests {
    use super::{aligned, frame_children, frame_size, own_slots, Frame, WORD};
    use crate::{
        ast::NodeKind,
        compiler::{closure::convert, parse_program, scope::resolve, Context},
    };
    use assert2::{check, let_assert};

    #[test]
    fn slots_per_node() {
        let_assert!(Ok(ast) = parse_program("(let (x 5) (plus x (minus x 1)))"));
        let main = ast.program().main;
        check!(own_slots(&ast, main) == 1);
        let_assert!(NodeKind::Let(l) = ast.kind(main));
        check!(own_slots(&ast, l.definition) == 0);
        check!(own_slots(&ast, l.body) == 3);
        // let + outer call (2 operands + closure) + inner call (2 operands + closure)
        check!(frame_size(&ast, main) == 7 * WORD);
    }

    #[test]
    fn operands_come_before_operator() {
        let_assert!(Ok(ast) = parse_program("(f 1 2)"));
        let main = ast.program().main;
        let_assert!(NodeKind::Apply(apply) = ast.kind(main));
        check!(frame_children(&ast, main) == [apply.operands[1], apply.operands[0], apply.operator]);
    }

    #[test]
    fn function_frame_counts_parameters() {
        let_assert!(Ok(mut ast) = parse_program("(let (k 2) (lambda (a b) (plus a k)))"));
        resolve(&mut ast);
        let_assert!(Ok(()) = convert(&mut ast, &mut Context::default()));
        let function = ast.program().functions[0];
        // a, b, k + one call with two operands
        check!(frame_size(&ast, function) == 6 * WORD);
    }

    #[test]
    fn claims_are_distinct_and_sum_to_size() {
        let_assert!(Ok(ast) = parse_program("(let (x 1) (if x (plus x 2) (let (y 3) y)))"));
        let main = ast.program().main;
        let mut frame = Frame::new();
        let mut offsets = vec![];
        let mut pending = vec![main];
        while let Some(id) = pending.pop() {
            offsets.extend(frame.claim(&ast, id));
            pending.extend(frame_children(&ast, id));
        }
        check!(frame.used() == frame_size(&ast, main));
        let count = offsets.len();
        offsets.sort_unstable();
        offsets.dedup();
        check!(offsets.len() == count);
    }

    #[test]
    fn alignment() {
        check!(aligned(0) == 0);
        check!(aligned(8) == 16);
        check!(aligned(16) == 16);
        check!(aligned(40) == 48);
    }
}
