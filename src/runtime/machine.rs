//! A reference machine that executes generated [`Assembly`] directly.
//!
//! It understands exactly the instructions the code generator emits, and provides
//! `malloc`, `printf`, `make_closure`, `call_closure` and the builtins natively on top
//! of [`Heap`]. Memory is word addressed; code addresses are derived from instruction
//! indices so they can live in registers, stack slots and closure records like any
//! other word.
use std::collections::HashMap;

use tracing::{debug, trace};

use crate::compiler::asm::{Assembly, Instr, Line, Operand, Reg, MESSAGE};

use super::{
    make_closure, Builtin, Closure, ConventionLimitError, Heap, Value, Word, MAX_FREE_VARS,
    WORD_BYTES,
};

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum MachineError {
    #[error("gave up after {0} steps")]
    StepLimit(usize),
    #[error("unknown label `{0}`")]
    UnknownLabel(Box<str>),
    #[error("call to unknown function `{0}`")]
    UnknownExtern(Box<str>),
    #[error("{0:#x} is not a closure")]
    NotAClosure(Word),
    #[error("access to unmapped address {0:#x}")]
    BadAddress(Word),
    #[error("`{0}` cannot be written to")]
    ReadOnlyOperand(Box<str>),
    #[error(transparent)]
    Convention(#[from] ConventionLimitError),
    #[error("the program finished without printing a result")]
    NoResult,
}

const NATIVE_BASE: Word = 0x0030_0000;
const CODE_BASE: Word = 0x0040_0000;
const DATA_BASE: Word = 0x0060_0000;
const STACK_TOP: Word = 0x7fff_0000;
const STACK_BYTES: Word = 8 << 20;
/// Return address that stops the machine
const HALT: Word = 0;

pub const DEFAULT_STEP_LIMIT: usize = 10_000_000;

/// What a finished run left behind
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Finished {
    /// Every word passed to `printf`
    pub printed: Vec<Word>,
    /// The last printed word, decoded
    pub value: Value,
    pub steps: usize,
}

impl Finished {
    pub fn result(&self) -> Option<Word> {
        self.printed.last().copied()
    }
}

#[derive(Debug, Clone)]
pub struct Machine {
    code: Vec<Instr>,
    labels: HashMap<Box<str>, usize>,
    builtins: HashMap<&'static str, Word>,
    entry: Box<str>,
    heap: Heap,
    stack: HashMap<Word, Word>,
    regs: [Word; 10],
    zero: bool,
    pc: usize,
    printed: Vec<Word>,
    step_limit: usize,
}

fn code_address(index: usize) -> Word {
    CODE_BASE + index as Word * WORD_BYTES
}

impl Machine {
    pub fn new(assembly: &Assembly) -> Self {
        let mut code = vec![];
        let mut labels = HashMap::new();
        for function in assembly.all_functions() {
            labels.insert(function.name.clone(), code.len());
            for line in &function.lines {
                match line {
                    Line::Label(label) => {
                        labels.insert(label.clone(), code.len());
                    }
                    Line::Instr { instr, .. } => code.push(instr.clone()),
                }
            }
        }

        let mut heap = Heap::new();
        let builtins = Builtin::ALL
            .iter()
            .enumerate()
            .map(|(idx, builtin)| {
                let closure = Closure {
                    code: NATIVE_BASE + idx as Word * WORD_BYTES,
                    n_bound: builtin.arity(),
                    free: vec![],
                };
                (builtin.name(), heap.alloc_closure(closure))
            })
            .collect();

        Self {
            code,
            labels,
            builtins,
            entry: assembly.entry.name.clone(),
            heap,
            stack: HashMap::new(),
            regs: [0; 10],
            zero: false,
            pc: 0,
            printed: vec![],
            step_limit: DEFAULT_STEP_LIMIT,
        }
    }

    pub fn with_step_limit(mut self, step_limit: usize) -> Self {
        self.step_limit = step_limit;
        self
    }

    pub fn heap(&self) -> &Heap {
        &self.heap
    }

    fn reg(&self, reg: Reg) -> Word {
        self.regs[reg as usize]
    }

    fn set_reg(&mut self, reg: Reg, value: Word) {
        self.regs[reg as usize] = value;
    }

    fn is_stack(address: Word) -> bool {
        (STACK_TOP - STACK_BYTES..STACK_TOP).contains(&address) && address % WORD_BYTES == 0
    }

    fn load(&self, address: Word) -> Result<Word, MachineError> {
        if Self::is_stack(address) {
            Ok(self.stack.get(&address).copied().unwrap_or(0))
        } else {
            self.heap
                .load(address)
                .ok_or(MachineError::BadAddress(address))
        }
    }

    fn store(&mut self, address: Word, value: Word) -> Result<(), MachineError> {
        if Self::is_stack(address) {
            self.stack.insert(address, value);
            Ok(())
        } else if self.heap.store(address, value) {
            Ok(())
        } else {
            Err(MachineError::BadAddress(address))
        }
    }

    fn push(&mut self, value: Word) -> Result<(), MachineError> {
        let rsp = self.reg(Reg::Rsp) - WORD_BYTES;
        self.set_reg(Reg::Rsp, rsp);
        self.store(rsp, value)
    }

    fn pop(&mut self) -> Result<Word, MachineError> {
        let rsp = self.reg(Reg::Rsp);
        let value = self.load(rsp)?;
        self.set_reg(Reg::Rsp, rsp + WORD_BYTES);
        Ok(value)
    }

    fn label(&self, label: &str) -> Result<usize, MachineError> {
        self.labels
            .get(label)
            .copied()
            .ok_or_else(|| MachineError::UnknownLabel(label.into()))
    }

    fn symbol(&self, symbol: &str) -> Result<Word, MachineError> {
        if let Some(&index) = self.labels.get(symbol) {
            Ok(code_address(index))
        } else if let Some(&closure) = self.builtins.get(symbol) {
            Ok(closure)
        } else if symbol == MESSAGE {
            Ok(DATA_BASE)
        } else {
            Err(MachineError::UnknownLabel(symbol.into()))
        }
    }

    fn read(&self, operand: &Operand) -> Result<Word, MachineError> {
        match operand {
            Operand::Reg(reg) => Ok(self.reg(*reg)),
            Operand::Imm(imm) => Ok(*imm),
            Operand::Symbol(symbol) => self.symbol(symbol),
            Operand::Mem { base, disp } => self.load(self.reg(*base) + disp),
        }
    }

    fn write(&mut self, operand: &Operand, value: Word) -> Result<(), MachineError> {
        match operand {
            Operand::Reg(reg) => {
                self.set_reg(*reg, value);
                Ok(())
            }
            Operand::Mem { base, disp } => self.store(self.reg(*base) + disp, value),
            other => Err(MachineError::ReadOnlyOperand(other.to_string().into())),
        }
    }

    /// Jump to the code at `address`, returning to the current `pc` afterwards
    fn enter(&mut self, address: Word) -> Result<(), MachineError> {
        let offset = address - CODE_BASE;
        if offset < 0 || offset % WORD_BYTES != 0 || offset / WORD_BYTES >= self.code.len() as Word
        {
            return Err(MachineError::BadAddress(address));
        }
        self.push(code_address(self.pc))?;
        self.pc = (offset / WORD_BYTES) as usize;
        Ok(())
    }

    fn call(&mut self, target: &str) -> Result<(), MachineError> {
        match target {
            "malloc" => {
                let block = self.heap.malloc(self.reg(Reg::Rdi));
                self.set_reg(Reg::Rax, block);
            }
            "printf" => {
                let value = self.reg(Reg::Rsi);
                debug!(value, "printf");
                self.printed.push(value);
                self.set_reg(Reg::Rax, 0);
            }
            "make_closure" => {
                let n_free = self.reg(Reg::Rdx).max(0) as usize;
                if n_free > MAX_FREE_VARS {
                    return Err(ConventionLimitError::TooManyFreeVariables { count: n_free }.into());
                }
                let free = [self.reg(Reg::Rcx), self.reg(Reg::R8), self.reg(Reg::R9)];
                let closure = make_closure(
                    self.reg(Reg::Rdi),
                    self.reg(Reg::Rsi).max(0) as usize,
                    &free[..n_free],
                )?;
                let address = self.heap.alloc_closure(closure);
                self.set_reg(Reg::Rax, address);
            }
            "call_closure" => {
                let address = self.reg(Reg::Rdi);
                let closure = self
                    .heap
                    .closure(address)
                    .cloned()
                    .ok_or(MachineError::NotAClosure(address))?;
                let bound = [
                    self.reg(Reg::Rsi),
                    self.reg(Reg::Rdx),
                    self.reg(Reg::Rcx),
                    self.reg(Reg::R8),
                ];
                let args = closure.call_arguments(&bound)?;

                let builtin = (NATIVE_BASE..CODE_BASE)
                    .contains(&closure.code)
                    .then(|| ((closure.code - NATIVE_BASE) / WORD_BYTES) as usize)
                    .and_then(|idx| Builtin::ALL.get(idx).copied());
                if let Some(builtin) = builtin {
                    self.set_reg(Reg::Rax, builtin.apply(&args));
                } else {
                    let vector = self.heap.alloc_words(&args);
                    self.set_reg(Reg::Rdi, vector);
                    self.enter(closure.code)?;
                }
            }
            label => {
                let index = self
                    .labels
                    .get(label)
                    .copied()
                    .ok_or_else(|| MachineError::UnknownExtern(label.into()))?;
                self.enter(code_address(index))?;
            }
        }
        Ok(())
    }

    /// Returns `false` once the entry function has returned
    fn step(&mut self) -> Result<bool, MachineError> {
        let instr = self
            .code
            .get(self.pc)
            .cloned()
            .ok_or(MachineError::BadAddress(code_address(self.pc)))?;
        trace!(pc = self.pc, %instr, "step");
        self.pc += 1;

        match &instr {
            Instr::Mov(dst, src) => {
                let value = self.read(src)?;
                self.write(dst, value)?;
            }
            Instr::Push(reg) => self.push(self.reg(*reg))?,
            Instr::Sub(reg, imm) => self.set_reg(*reg, self.reg(*reg).wrapping_sub(*imm)),
            Instr::Cmp(reg, imm) => self.zero = self.reg(*reg) == *imm,
            Instr::Je(label) => {
                if self.zero {
                    self.pc = self.label(label)?;
                }
            }
            Instr::Jmp(label) => self.pc = self.label(label)?,
            Instr::Call(target) => self.call(target)?,
            Instr::Leave => {
                self.set_reg(Reg::Rsp, self.reg(Reg::Rbp));
                let rbp = self.pop()?;
                self.set_reg(Reg::Rbp, rbp);
            }
            Instr::Ret => {
                let address = self.pop()?;
                if address == HALT {
                    return Ok(false);
                }
                self.pc = ((address - CODE_BASE) / WORD_BYTES) as usize;
            }
        }
        Ok(true)
    }

    pub fn run(mut self) -> Result<Finished, MachineError> {
        self.set_reg(Reg::Rsp, STACK_TOP);
        self.push(HALT)?;
        let entry = self.entry.clone();
        self.pc = self.label(&entry)?;

        let mut steps = 0;
        while self.step()? {
            steps += 1;
            if steps >= self.step_limit {
                return Err(MachineError::StepLimit(steps));
            }
        }

        let result = self.printed.last().copied().ok_or(MachineError::NoResult)?;
        Ok(Finished {
            value: self.heap.value(result),
            printed: self.printed,
            steps,
        })
    }
}

/// Execute `assembly` with the default step limit
pub fn run(assembly: &Assembly) -> Result<Finished, MachineError> {
    Machine::new(assembly).run()
}

#[cfg(test)]
mod tests {
    use super::{run, Machine, MachineError};
    use crate::{
        compiler::{
            asm::{Assembly, Function, Instr, Line, Operand, Reg},
            compile,
        },
        runtime::Value,
    };
    use assert2::{check, let_assert};

    fn line(instr: Instr) -> Line {
        Line::Instr {
            instr,
            comment: None,
        }
    }

    #[test]
    fn runs_handwritten_entry() {
        let entry = Function {
            name: "main".into(),
            frame_size: 0,
            lines: vec![
                line(Instr::Push(Reg::Rbp)),
                line(Instr::Mov(Reg::Rbp.into(), Reg::Rsp.into())),
                line(Instr::Mov(Reg::Rax.into(), Operand::Imm(41))),
                line(Instr::Cmp(Reg::Rax, 41)),
                line(Instr::Je(".skip".into())),
                line(Instr::Mov(Reg::Rax.into(), Operand::Imm(0))),
                Line::Label(".skip".into()),
                line(Instr::Mov(Reg::Rsi.into(), Reg::Rax.into())),
                line(Instr::Call("printf".into())),
                line(Instr::Leave),
                line(Instr::Ret),
            ],
        };
        let assembly = Assembly {
            functions: vec![],
            entry,
        };
        let_assert!(Ok(finished) = run(&assembly));
        check!(finished.printed == [41]);
        check!(finished.value == Value::Data(41));
    }

    #[test]
    fn builtin_call() {
        let_assert!(Ok(assembly) = compile("(minus 10 (plus 2 3))"));
        let_assert!(Ok(finished) = run(&assembly));
        check!(finished.result() == Some(5));
    }

    #[test]
    fn closure_results_decode() {
        let_assert!(Ok(assembly) = compile("(let (k 7) (lambda (x) (plus x k)))"));
        let_assert!(Ok(finished) = run(&assembly));
        let_assert!(Value::Closure(closure) = finished.value);
        check!(closure.n_bound == 1);
        check!(closure.free == [7]);
    }

    #[test]
    fn calling_data_fails() {
        let_assert!(Ok(assembly) = compile("(1 2)"));
        check!(run(&assembly) == Err(MachineError::NotAClosure(1)));
    }

    #[test]
    fn runaway_recursion_is_stopped() {
        let_assert!(Ok(assembly) = compile("(letrec (f (lambda (n) (f n))) (f 1))"));
        let machine = Machine::new(&assembly).with_step_limit(10_000);
        let_assert!(Err(error) = machine.run());
        check!(matches!(error, MachineError::StepLimit(_) | MachineError::BadAddress(_)));
    }
}
