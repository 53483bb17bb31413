//! Compile a program into x86-64 assembly.
//!
//! The pipeline runs in fixed order, each phase mutating the [`Ast`] in place:
//!
//! 1. parse and lower the source ([`parse_program`])
//! 2. attach names to symbol tables ([`scope::resolve`])
//! 3. convert closures and lift every lambda to the top level ([`closure::convert`])
//! 4. lay out frames and emit code ([`codegen::generate`])
//!
//! For example
//!
//! ```text
//! (let (x 1) ((lambda (y) (plus x y)) 2))
//! ```
//!
//! lifts the lambda to `_f0` with parameters `(y x)` and replaces it by a closure
//! capturing `x`, so the main expression becomes a `call_closure` on that closure.
use tracing::{debug, info_span};

use crate::{
    ast::Ast,
    general_parse,
    general_parser::{
        special_forms::{lower, SyntaxError},
        ParseError,
    },
    lexer::Span,
};

pub mod asm;
pub mod closure;
pub mod codegen;
pub mod frame;
pub mod scope;

use asm::Assembly;
use codegen::CodegenError;
use scope::ScopeError;

/// Counters that must restart for every compiled program
#[derive(Debug, Default)]
pub struct Context {
    functions: usize,
    labels: usize,
}

impl Context {
    /// `_f0`, `_f1`, ...
    pub fn next_function_name(&mut self) -> String {
        let n = self.functions;
        self.functions += 1;
        format!("_f{n}")
    }

    pub fn next_label(&mut self) -> usize {
        let n = self.labels;
        self.labels += 1;
        n
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompilerOptions {
    /// Name of the exported entry function
    pub entry: Box<str>,
    /// Annotate instructions with comments
    pub comments: bool,
}

impl Default for CompilerOptions {
    fn default() -> Self {
        Self {
            entry: "main".into(),
            comments: true,
        }
    }
}

fn describe_parse_errors(errors: &[ParseError]) -> String {
    match errors {
        [] => "parse failed".to_owned(),
        [error] => error.to_string(),
        [error, rest @ ..] => format!("{error} (and {} more)", rest.len()),
    }
}

#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum CompileError {
    #[error("{}", describe_parse_errors(.0))]
    Parse(Vec<ParseError>),
    #[error(transparent)]
    Syntax(#[from] SyntaxError),
    #[error(transparent)]
    Scope(#[from] ScopeError),
    #[error(transparent)]
    Codegen(#[from] CodegenError),
}

impl CompileError {
    /// Where in the source the (first) problem is
    pub fn span(&self) -> Option<Span> {
        match self {
            Self::Parse(errors) => errors.first().map(ParseError::span),
            Self::Syntax(error) => Some(error.span()),
            Self::Scope(error) => Some(error.span()),
            Self::Codegen(error) => Some(error.span()),
        }
    }
}

/// Parse and lower `source`, without running any compiler pass
pub fn parse_program(source: &str) -> Result<Ast, CompileError> {
    let gast = general_parse(source);
    if !gast.errors().is_empty() {
        return Err(CompileError::Parse(gast.errors().to_vec()));
    }
    Ok(lower(&gast.module())?)
}

#[derive(Debug, Default)]
pub struct Compiler {
    options: CompilerOptions,
    context: Context,
}

impl Compiler {
    pub fn new(options: CompilerOptions) -> Self {
        Self {
            options,
            context: Context::default(),
        }
    }

    pub fn options(&self) -> &CompilerOptions {
        &self.options
    }

    /// Run every phase on an already lowered tree
    pub fn compile_ast(&mut self, ast: &mut Ast) -> Result<Assembly, CompileError> {
        self.context = Context::default();

        {
            let _span = info_span!("resolve").entered();
            scope::resolve(ast);
        }
        {
            let _span = info_span!("closure_convert").entered();
            closure::convert(ast, &mut self.context)?;
            debug!(lifted = ast.program().functions.len(), "closure conversion done");
        }
        let _span = info_span!("codegen").entered();
        codegen::generate(ast, &mut self.context, &self.options)
    }

    pub fn compile(&mut self, source: &str) -> Result<Assembly, CompileError> {
        let _span = info_span!("compile", bytes = source.len()).entered();
        let mut ast = parse_program(source)?;
        debug!(nodes = ast.len(), "lowered");
        self.compile_ast(&mut ast)
    }
}

/// Compile `source` with default options
pub fn compile(source: &str) -> Result<Assembly, CompileError> {
    Compiler::default().compile(source)
}

#[cfg(test)]
mod tests {
    use super::{compile, parse_program, CompileError, Compiler, CompilerOptions, Context};
    use crate::{general_parser::ParseError, SyntaxError};
    use assert2::{check, let_assert};

    #[test]
    fn counters_restart_per_compilation() {
        let mut compiler = Compiler::new(CompilerOptions::default());
        let source = "((lambda (x) (if x 1 2)) 1)";
        let_assert!(Ok(first) = compiler.compile(source));
        let_assert!(Ok(second) = compiler.compile(source));
        check!(first == second);
        check!(second.function("_f0").is_some());
        check!(second.to_string().contains(".L0False"));
    }

    #[test]
    fn context_hands_out_fresh_names() {
        let mut context = Context::default();
        check!(context.next_function_name() == "_f0");
        check!(context.next_function_name() == "_f1");
        check!(context.next_label() == 0);
        check!(context.next_label() == 1);
    }

    #[test]
    fn entry_name_is_configurable() {
        let options = CompilerOptions {
            entry: "start".into(),
            ..CompilerOptions::default()
        };
        let_assert!(Ok(assembly) = Compiler::new(options).compile("1"));
        check!(assembly.to_string().starts_with("\tglobal start\n"));
        check!(&*assembly.entry.name == "start");
    }

    #[test]
    fn errors_carry_spans() {
        let_assert!(Err(error) = parse_program("(plus 1"));
        check!(error == CompileError::Parse(vec![ParseError::UnclosedList { span: 0..1 }]));
        check!(error.span() == Some(0..1));

        let_assert!(Err(error) = compile("(if 1 2)"));
        check!(error == CompileError::Syntax(SyntaxError::MalformedIf { span: 0..8 }));

        let_assert!(Err(error) = compile("(plus y 1)"));
        check!(error.to_string() == "undefined variable `y`");
        check!(error.span() == Some(6..7));
    }
}
