pub mod ast;
pub mod compiler;
pub mod general_parser;
pub mod lexer;
pub mod runtime;

pub use compiler::{
    asm::Assembly, compile, parse_program, CompileError, Compiler, CompilerOptions,
};
pub use general_parser::{
    gast::*,
    general_parse,
    special_forms::{SpecialForm, SyntaxError},
    ParseError,
};
pub use runtime::{machine::Finished, Value, Word};
