//! Emits x86-64 for a closure-converted program.
//!
//! Every intermediate result passes through `rax` and is spilled to its own stack
//! slot before the next one is computed. Calls through closures go via the runtime's
//! `call_closure`; direct self-recursive calls pass a heap-allocated argument vector
//! straight to the lifted function.
use tracing::{debug, trace};

use crate::{
    ast::{Apply, Ast, Binding, Name, NodeId, NodeKind, Offset},
    lexer::Span,
    runtime::{ConventionLimitError, MAX_BOUND_ARGS},
};

use super::{
    asm::{Assembly, Function, Instr, Line, Operand, Reg, MESSAGE},
    frame::{aligned, frame_size, is_recursive_call, Frame, WORD},
    scope::{find_scope, get_in_scope, Lookup, ScopeError},
    CompileError, CompilerOptions, Context,
};

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum CodegenError {
    #[error("{error}")]
    ConventionLimit {
        error: ConventionLimitError,
        span: Span,
    },
    #[error("a {kind} cannot appear here")]
    UnexpectedNodeKind { kind: &'static str, span: Span },
}

impl CodegenError {
    pub fn span(&self) -> Span {
        match self {
            Self::ConventionLimit { span, .. } | Self::UnexpectedNodeKind { span, .. } => {
                span.clone()
            }
        }
    }
}

/// Generate a whole program: every lifted function, then the entry point.
pub fn generate(
    ast: &mut Ast,
    context: &mut Context,
    options: &CompilerOptions,
) -> Result<Assembly, CompileError> {
    let lifted = ast.program().functions.clone();
    let functions = lifted
        .into_iter()
        .map(|id| Codegen::new(&mut *ast, &mut *context, options).function(id))
        .collect::<Result<Vec<_>, _>>()?;
    let entry = Codegen::new(ast, context, options).entry(&options.entry)?;
    Ok(Assembly { functions, entry })
}

struct Codegen<'a> {
    ast: &'a mut Ast,
    context: &'a mut Context,
    comments: bool,
    lines: Vec<Line>,
    frame: Frame,
    /// Body of the lifted function being generated, `None` for the entry point
    body: Option<NodeId>,
}

impl<'a> Codegen<'a> {
    fn new(ast: &'a mut Ast, context: &'a mut Context, options: &CompilerOptions) -> Self {
        Self {
            ast,
            context,
            comments: options.comments,
            lines: vec![],
            frame: Frame::new(),
            body: None,
        }
    }

    fn emit(&mut self, instr: Instr) {
        self.lines.push(Line::Instr {
            instr,
            comment: None,
        });
    }

    fn emit_noted(&mut self, instr: Instr, comment: impl FnOnce() -> String) {
        let comment = self.comments.then(|| comment().into_boxed_str());
        self.lines.push(Line::Instr { instr, comment });
    }

    fn label(&mut self, label: &str) {
        self.lines.push(Line::Label(label.into()));
    }

    fn mov(&mut self, dst: impl Into<Operand>, src: impl Into<Operand>) {
        self.emit(Instr::Mov(dst.into(), src.into()));
    }

    fn spill(&mut self, offset: Offset) {
        self.mov(Operand::slot(offset), Reg::Rax);
    }

    fn unexpected(&self, id: NodeId) -> CompileError {
        CodegenError::UnexpectedNodeKind {
            kind: self.ast.kind(id).describe(),
            span: self.ast.span(id),
        }
        .into()
    }

    fn limit(&self, id: NodeId, n_bound: usize, n_free: usize) -> Result<(), CompileError> {
        ConventionLimitError::check(n_bound, n_free).map_err(|error| {
            CodegenError::ConventionLimit {
                error,
                span: self.ast.span(id),
            }
            .into()
        })
    }

    fn prologue(&mut self, size: usize) {
        self.emit(Instr::Push(Reg::Rbp));
        self.mov(Reg::Rbp, Reg::Rsp);
        if aligned(size) > 0 {
            self.emit_noted(Instr::Sub(Reg::Rsp, aligned(size) as i64), || {
                format!("{} byte frame", size)
            });
        }
    }

    fn epilogue(&mut self) {
        self.emit(Instr::Leave);
        self.emit(Instr::Ret);
    }

    fn finish(self, name: Box<str>, frame_size: usize) -> Function {
        debug_assert_eq!(
            self.frame.used(),
            frame_size,
            "slots handed out in {name} disagree with its frame size"
        );
        Function {
            name,
            frame_size,
            lines: self.lines,
        }
    }

    fn function(mut self, id: NodeId) -> Result<Function, CompileError> {
        let NodeKind::Lambda(lambda) = self.ast.kind(id).clone() else {
            return Err(self.unexpected(id));
        };
        let Some(name) = lambda.name else {
            return Err(self.unexpected(id));
        };
        let name: Box<str> = self.ast.resolve(name).into();
        let size = frame_size(self.ast, id);
        self.body = Some(lambda.body);
        debug!(function = &*name, frame_size = size, "generating function");

        self.prologue(size);
        self.emit_noted(Instr::Mov(Reg::Rax.into(), Reg::Rdi.into()), || {
            "argument vector".to_owned()
        });
        let slots = self.frame.claim(self.ast, id);
        for (idx, (&param, &offset)) in lambda.params.iter().zip(&slots).enumerate() {
            self.mov(
                Reg::SCRATCH,
                Operand::Mem {
                    base: Reg::Rax,
                    disp: (idx * WORD) as i64,
                },
            );
            let param_name = self.ast.resolve(param).to_owned();
            self.emit_noted(
                Instr::Mov(Operand::slot(offset), Reg::SCRATCH.into()),
                || param_name,
            );
            self.ast
                .symbols_mut(lambda.body)
                .insert_value(param, Binding::Slot(offset));
        }

        self.node(lambda.body)?;
        self.epilogue();
        Ok(self.finish(name, size))
    }

    fn entry(mut self, name: &str) -> Result<Function, CompileError> {
        let root = self.ast.root();
        let main = self.ast.program().main;
        let size = frame_size(self.ast, root);
        debug!(function = name, frame_size = size, "generating entry point");

        self.prologue(size);
        self.frame.claim(self.ast, root);
        self.node(main)?;

        self.mov(Reg::Rsi, Reg::Rax);
        self.mov(Reg::Rdi, Operand::symbol(MESSAGE));
        self.emit_noted(Instr::Mov(Reg::Rax.into(), Operand::Imm(0)), || {
            "no vector registers for printf".to_owned()
        });
        self.emit(Instr::Call("printf".into()));
        self.emit_noted(Instr::Mov(Reg::Rax.into(), Operand::Imm(0)), || {
            "exit status".to_owned()
        });
        self.epilogue();
        Ok(self.finish(name.into(), size))
    }

    fn node(&mut self, id: NodeId) -> Result<(), CompileError> {
        trace!(node = %id, kind = self.ast.kind(id).describe(), "emit");
        let slots = self.frame.claim(self.ast, id);

        match self.ast.kind(id).clone() {
            NodeKind::Integer(value) => {
                self.mov(Reg::Rax, Operand::Imm(value));
                Ok(())
            }
            NodeKind::Var(var) if var.is_recursive => self.recursive_value(id, var.name, &slots),
            NodeKind::Var(var) if var.is_captured => self.captured(id, var.name),
            NodeKind::Var(var) => self.load(id, var.name),
            NodeKind::If(branch) => {
                let n = self.context.next_label();
                let (otherwise, done) = (format!(".L{n}False"), format!(".L{n}Done"));
                self.node(branch.pred)?;
                self.emit(Instr::Cmp(Reg::Rax, 0));
                self.emit(Instr::Je(otherwise.as_str().into()));
                self.node(branch.then)?;
                self.emit(Instr::Jmp(done.as_str().into()));
                self.label(&otherwise);
                self.node(branch.otherwise)?;
                self.label(&done);
                Ok(())
            }
            NodeKind::Let(l) => {
                self.node(l.definition)?;
                let name = self.ast.resolve(l.name).to_owned();
                self.emit_noted(Instr::Mov(Operand::slot(slots[0]), Reg::Rax.into()), || {
                    format!("bind {name}")
                });
                self.ast
                    .symbols_mut(l.body)
                    .insert_value(l.name, Binding::Slot(slots[0]));
                self.node(l.body)
            }
            NodeKind::Apply(apply) if is_recursive_call(self.ast, &apply) => {
                self.recursive_call(id, &apply, &slots)
            }
            NodeKind::Apply(apply) => self.closure_call(id, &apply, &slots),
            NodeKind::MakeClosure(closure) => {
                self.limit(id, closure.n_bound, closure.n_free)?;
                for (&free, &offset) in closure.free_vars.iter().zip(&slots) {
                    self.node(free)?;
                    self.spill(offset);
                }
                self.make_closure(closure.function, closure.n_bound, &slots);
                Ok(())
            }
            NodeKind::Lambda(_) | NodeKind::Program(_) => Err(self.unexpected(id)),
        }
    }

    fn load(&mut self, id: NodeId, name: Name) -> Result<(), CompileError> {
        let scope = find_scope(self.ast, id, name)?;
        match get_in_scope(self.ast, id, name) {
            Lookup::Bound(Binding::Slot(offset)) => {
                let text = self.ast.resolve(name).to_owned();
                self.emit_noted(Instr::Mov(Reg::Rax.into(), Operand::slot(offset)), || text);
                Ok(())
            }
            Lookup::NotFound if scope == self.ast.root() => {
                let symbol = Operand::symbol(self.ast.resolve(name));
                self.mov(Reg::Rax, symbol);
                Ok(())
            }
            Lookup::Bound(Binding::SelfRecursive) | Lookup::Unassigned => {
                Err(ScopeError::before_definition(self.ast, name, id).into())
            }
            Lookup::NotFound => Err(ScopeError::undefined(self.ast, name, id).into()),
        }
    }

    /// The slot a lifted function with `body` copied its parameter `name` into
    fn parameter_slot(&self, body: NodeId, name: Name, at: NodeId) -> Result<Offset, CompileError> {
        match self.ast.symbols(body).get(name) {
            Some(Some(Binding::Slot(offset))) => Ok(offset),
            _ => Err(ScopeError::before_definition(self.ast, name, at).into()),
        }
    }

    /// A captured value handed on to a self-recursive call
    fn captured(&mut self, id: NodeId, name: Name) -> Result<(), CompileError> {
        let Some(body) = self.body else {
            return Err(self.unexpected(id));
        };
        let offset = self.parameter_slot(body, name, id)?;
        let text = self.ast.resolve(name).to_owned();
        self.emit_noted(Instr::Mov(Reg::Rax.into(), Operand::slot(offset)), || {
            format!("captured {text}")
        });
        Ok(())
    }

    /// `rax = make_closure(function, n_bound, n_free, free...)`, captured values
    /// already spilled to `free_slots`
    fn make_closure(&mut self, function: Name, n_bound: usize, free_slots: &[Offset]) {
        let function = self.ast.resolve(function).to_owned();
        self.mov(Reg::Rdi, Operand::symbol(function.as_str()));
        self.mov(Reg::Rsi, Operand::Imm(n_bound as i64));
        self.mov(Reg::Rdx, Operand::Imm(free_slots.len() as i64));
        for (&offset, &reg) in free_slots.iter().zip(&Reg::ARGUMENTS[3..]) {
            self.mov(reg, Operand::slot(offset));
        }
        self.emit_noted(Instr::Call("make_closure".into()), || {
            format!("closure over {function}")
        });
    }

    /// A lifted function referring to itself as a value rather than calling itself
    fn recursive_value(
        &mut self,
        id: NodeId,
        function: Name,
        slots: &[Offset],
    ) -> Result<(), CompileError> {
        let Some((_, lambda)) = self.ast.function(function) else {
            return Err(ScopeError::undefined(self.ast, function, id).into());
        };
        let (n_bound, body, free) = (lambda.n_bound(), lambda.body, lambda.free_params().to_vec());
        self.limit(id, n_bound, free.len())?;
        for (&name, &offset) in free.iter().zip(slots) {
            let captured = self.parameter_slot(body, name, id)?;
            self.mov(Reg::Rax, Operand::slot(captured));
            self.spill(offset);
        }
        self.make_closure(function, n_bound, slots);
        Ok(())
    }

    fn closure_call(
        &mut self,
        id: NodeId,
        apply: &Apply,
        slots: &[Offset],
    ) -> Result<(), CompileError> {
        let n = apply.operands.len();
        if n > MAX_BOUND_ARGS {
            return Err(CodegenError::ConventionLimit {
                error: ConventionLimitError::TooManyBoundArguments { count: n },
                span: self.ast.span(id),
            }
            .into());
        }

        for (&operand, &offset) in apply.operands.iter().zip(slots).rev() {
            self.node(operand)?;
            self.spill(offset);
        }
        self.node(apply.operator)?;
        self.spill(slots[n]);

        self.mov(Reg::Rdi, Operand::slot(slots[n]));
        for (&offset, &reg) in slots[..n].iter().zip(&Reg::ARGUMENTS[1..]) {
            self.mov(reg, Operand::slot(offset));
        }
        self.emit(Instr::Call("call_closure".into()));
        Ok(())
    }

    fn recursive_call(
        &mut self,
        id: NodeId,
        apply: &Apply,
        slots: &[Offset],
    ) -> Result<(), CompileError> {
        let NodeKind::Var(callee) = *self.ast.kind(apply.operator) else {
            return Err(self.unexpected(apply.operator));
        };
        let n = apply.operands.len();
        for (&operand, &offset) in apply.operands.iter().zip(slots).rev() {
            self.node(operand)?;
            self.spill(offset);
        }

        self.mov(Reg::Rdi, Operand::Imm((n * WORD) as i64));
        self.emit_noted(Instr::Call("malloc".into()), || {
            format!("argument vector of {n}")
        });
        self.spill(slots[n]);
        for (idx, &offset) in slots[..n].iter().enumerate() {
            self.mov(Reg::SCRATCH, Operand::slot(offset));
            self.mov(
                Operand::Mem {
                    base: Reg::Rax,
                    disp: (idx * WORD) as i64,
                },
                Reg::SCRATCH,
            );
        }
        self.mov(Reg::Rdi, Reg::Rax);
        let target = self.ast.resolve(callee.name).to_owned();
        trace!(node = %id, target = %target, "direct recursive call");
        self.emit(Instr::Call(target.into()));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::{generate, CodegenError};
    use crate::{
        compiler::{
            asm::Instr,
            parse_program,
            scope::{resolve, ScopeError},
            CompileError, Compiler, CompilerOptions, Context,
        },
        runtime::ConventionLimitError,
    };
    use assert2::{check, let_assert};

    fn compile(source: &str) -> Result<crate::compiler::asm::Assembly, CompileError> {
        Compiler::new(CompilerOptions::default()).compile(source)
    }

    #[test]
    fn entry_prints_result() {
        let_assert!(Ok(assembly) = compile("(plus 2 3)"));
        let text = assembly.to_string();
        check!(text.contains("main:\n\tpush rbp\n\tmov rbp, rsp\n"));
        check!(text.contains("mov rax, plus"));
        check!(text.contains("call call_closure"));
        check!(text.contains("call printf"));
        // two operands + closure, rounded up to 32
        check!(assembly.entry.frame_size == 24);
        check!(text.contains("sub rsp, 32"));
    }

    #[test]
    fn function_copies_parameters() {
        let_assert!(Ok(assembly) = compile("((lambda (y) (plus y y)) 3)"));
        let_assert!(Some(function) = assembly.function("_f0"));
        let instrs = function.instructions().cloned().collect::<Vec<_>>();
        check!(instrs[3].to_string() == "mov rax, rdi");
        check!(instrs[4].to_string() == "mov r11, QWORD [rax]");
        check!(instrs[5].to_string() == "mov QWORD [rbp-8], r11");
        check!(instrs.last() == Some(&Instr::Ret));
    }

    #[test]
    fn labels_are_unique_across_functions() {
        let source = "(let (f (lambda (x) (if x 1 2))) (if (f 0) 3 4))";
        let_assert!(Ok(assembly) = compile(source));
        let text = assembly.to_string();
        check!(text.contains(".L0False:"));
        check!(text.contains(".L1False:"));
        check!(text.matches(".L0Done:").count() == 1);
    }

    #[test]
    fn recursive_call_is_direct() {
        let source = "(letrec (f (lambda (n) (if n (f (minus n 1)) 0))) (f 3))";
        let_assert!(Ok(assembly) = compile(source));
        let_assert!(Some(function) = assembly.function("_f0"));
        let text = function.to_string();
        check!(text.contains("mov rdi, 8"));
        check!(text.contains("call malloc"));
        check!(text.contains("call _f0"));
    }

    #[test]
    fn too_many_free_variables() {
        let source = "(let (a 1) (let (b 2) (let (c 3) (let (d 4) \
                      (lambda (x) (plus a (plus b (plus c (plus d x)))))))))";
        let_assert!(Err(CompileError::Codegen(error)) = compile(source));
        let_assert!(CodegenError::ConventionLimit { error, .. } = error);
        check!(error == ConventionLimitError::TooManyFreeVariables { count: 4 });
    }

    #[test]
    fn too_many_arguments() {
        let_assert!(Err(CompileError::Codegen(error)) = compile("(plus 1 2 3 4 5)"));
        check!(error.span() == (0..16));
    }

    #[test]
    fn too_many_parameters() {
        let_assert!(Err(CompileError::Codegen(error)) = compile("(lambda (a b c d e) a)"));
        check!(
            error
                == CodegenError::ConventionLimit {
                    error: ConventionLimitError::TooManyBoundArguments { count: 5 },
                    span: 0..22,
                }
        );
    }

    #[test]
    fn recursive_binding_read_in_its_own_definition() {
        let_assert!(Err(CompileError::Scope(error)) = compile("(letrec (x (plus x 1)) x)"));
        check!(
            error
                == ScopeError::UsedBeforeDefinition {
                    name: "x".into(),
                    span: 17..18,
                }
        );
    }

    #[test]
    fn unconverted_lambda_is_rejected() {
        let_assert!(Ok(mut ast) = parse_program("((lambda (x) x) 1)"));
        resolve(&mut ast);
        let result = generate(&mut ast, &mut Context::default(), &CompilerOptions::default());
        let_assert!(Err(CompileError::Codegen(error)) = result);
        check!(
            error
                == CodegenError::UnexpectedNodeKind {
                    kind: "lambda",
                    span: 1..15,
                }
        );
    }

    #[test]
    fn comments_can_be_disabled() {
        let options = CompilerOptions {
            comments: false,
            ..CompilerOptions::default()
        };
        let_assert!(Ok(assembly) = Compiler::new(options).compile("(let (x 1) x)"));
        check!(!assembly.to_string().contains(';'));
    }
}
