//! A small structured model of the NASM x86-64 text the code generator emits.
//!
//! Keeping instructions as values lets the runtime's reference machine execute the
//! very program that gets printed.
use core::fmt;

use crate::runtime::Builtin;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Reg {
    Rax,
    Rcx,
    Rdx,
    Rsi,
    Rdi,
    R8,
    R9,
    R11,
    Rbp,
    Rsp,
}

impl Reg {
    /// Argument registers of the System V calling convention, in order
    pub const ARGUMENTS: [Reg; 6] = [Reg::Rdi, Reg::Rsi, Reg::Rdx, Reg::Rcx, Reg::R8, Reg::R9];
    /// Caller-saved register used for memory-to-memory moves
    pub const SCRATCH: Reg = Reg::R11;

    pub fn name(self) -> &'static str {
        match self {
            Reg::Rax => "rax",
            Reg::Rcx => "rcx",
            Reg::Rdx => "rdx",
            Reg::Rsi => "rsi",
            Reg::Rdi => "rdi",
            Reg::R8 => "r8",
            Reg::R9 => "r9",
            Reg::R11 => "r11",
            Reg::Rbp => "rbp",
            Reg::Rsp => "rsp",
        }
    }
}

impl fmt::Display for Reg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Operand {
    Reg(Reg),
    Imm(i64),
    /// Address of a label: a function, a builtin closure or a data item
    Symbol(Box<str>),
    /// `QWORD [base + disp]`
    Mem { base: Reg, disp: i64 },
}

impl Operand {
    /// The stack slot `offset` bytes below the frame base
    pub fn slot(offset: usize) -> Self {
        Operand::Mem {
            base: Reg::Rbp,
            disp: -(offset as i64),
        }
    }

    pub fn symbol(name: impl Into<Box<str>>) -> Self {
        Operand::Symbol(name.into())
    }
}

impl From<Reg> for Operand {
    fn from(reg: Reg) -> Self {
        Operand::Reg(reg)
    }
}

impl fmt::Display for Operand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Operand::Reg(reg) => write!(f, "{reg}"),
            Operand::Imm(imm) => write!(f, "{imm}"),
            Operand::Symbol(symbol) => f.write_str(symbol),
            Operand::Mem { base, disp: 0 } => write!(f, "QWORD [{base}]"),
            Operand::Mem { base, disp } if *disp < 0 => write!(f, "QWORD [{base}-{}]", -disp),
            Operand::Mem { base, disp } => write!(f, "QWORD [{base}+{disp}]"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Instr {
    Mov(Operand, Operand),
    Push(Reg),
    Sub(Reg, i64),
    Cmp(Reg, i64),
    Je(Box<str>),
    Jmp(Box<str>),
    Call(Box<str>),
    Leave,
    Ret,
}

impl fmt::Display for Instr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Instr::Mov(dst, src) => write!(f, "mov {dst}, {src}"),
            Instr::Push(reg) => write!(f, "push {reg}"),
            Instr::Sub(reg, imm) => write!(f, "sub {reg}, {imm}"),
            Instr::Cmp(reg, imm) => write!(f, "cmp {reg}, {imm}"),
            Instr::Je(label) => write!(f, "je {label}"),
            Instr::Jmp(label) => write!(f, "jmp {label}"),
            Instr::Call(target) => write!(f, "call {target}"),
            Instr::Leave => f.write_str("leave"),
            Instr::Ret => f.write_str("ret"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Line {
    Label(Box<str>),
    Instr {
        instr: Instr,
        comment: Option<Box<str>>,
    },
}

impl fmt::Display for Line {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Line::Label(label) => write!(f, "{label}:"),
            Line::Instr {
                instr,
                comment: None,
            } => write!(f, "\t{instr}"),
            Line::Instr {
                instr,
                comment: Some(comment),
            } => write!(f, "\t{:<31} ; {comment}", instr.to_string()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Function {
    pub name: Box<str>,
    /// Bytes of stack slots, before alignment
    pub frame_size: usize,
    pub lines: Vec<Line>,
}

impl Function {
    pub fn instructions(&self) -> impl Iterator<Item = &Instr> {
        self.lines.iter().filter_map(|line| match line {
            Line::Instr { instr, .. } => Some(instr),
            Line::Label(_) => None,
        })
    }
}

impl fmt::Display for Function {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{}:", self.name)?;
        for line in &self.lines {
            writeln!(f, "{line}")?;
        }
        Ok(())
    }
}

/// Label of the `printf` format string in the data section
pub const MESSAGE: &str = "message";
pub const EXTERN_C: [&str; 2] = ["printf", "malloc"];
pub const EXTERN_RUNTIME: [&str; 2] = ["make_closure", "call_closure"];

/// A complete translation unit
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Assembly {
    /// Lifted functions, in lifting order
    pub functions: Vec<Function>,
    pub entry: Function,
}

impl Assembly {
    /// Every function, entry last
    pub fn all_functions(&self) -> impl Iterator<Item = &Function> {
        self.functions.iter().chain(std::iter::once(&self.entry))
    }

    pub fn function(&self, name: &str) -> Option<&Function> {
        self.all_functions().find(|function| &*function.name == name)
    }

    /// `(name, frame size)` per function
    pub fn frame_sizes(&self) -> impl Iterator<Item = (&str, usize)> {
        self.all_functions()
            .map(|function| (&*function.name, function.frame_size))
    }
}

impl fmt::Display for Assembly {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "\tglobal {}", self.entry.name)?;
        writeln!(f, "\textern {}", EXTERN_C.join(", "))?;
        writeln!(f, "\textern {}", EXTERN_RUNTIME.join(", "))?;
        let builtins = Builtin::ALL
            .iter()
            .map(|builtin| builtin.name())
            .collect::<Vec<_>>();
        writeln!(f, "\textern {}", builtins.join(", "))?;
        writeln!(f)?;
        writeln!(f, "\tsection .text")?;
        for function in self.all_functions() {
            write!(f, "{function}")?;
        }
        writeln!(f)?;
        writeln!(f, "\tsection .data")?;
        writeln!(f, "{MESSAGE}: db \"%ld\", 10, 0")
    }
}
