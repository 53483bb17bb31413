//! The runtime compiled programs link against.
//!
//! Every value the generated code handles is a single machine [`Word`]. A word either
//! carries data directly, or is the address of a heap-allocated [`Closure`]. Closures are
//! created by `make_closure` and invoked by `call_closure`, which lays the bound
//! arguments and the captured values out in one argument vector and passes its address
//! to the lifted function.
//!
//! [`Heap`] models that memory, and [`machine`] executes generated [`Assembly`] on top
//! of it.
//!
//! [`Assembly`]: crate::compiler::asm::Assembly
use std::collections::HashMap;

pub mod machine;

pub type Word = i64;

pub const WORD_BYTES: Word = 8;
/// Captured values `make_closure` accepts
pub const MAX_FREE_VARS: usize = 3;
/// Arguments `call_closure` forwards
pub const MAX_BOUND_ARGS: usize = 4;

#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConventionLimitError {
    #[error("a closure can capture at most {MAX_FREE_VARS} variables, not {count}")]
    TooManyFreeVariables { count: usize },
    #[error("a closure can take at most {MAX_BOUND_ARGS} arguments, not {count}")]
    TooManyBoundArguments { count: usize },
}

impl ConventionLimitError {
    pub fn check(n_bound: usize, n_free: usize) -> Result<(), Self> {
        if n_free > MAX_FREE_VARS {
            Err(Self::TooManyFreeVariables { count: n_free })
        } else if n_bound > MAX_BOUND_ARGS {
            Err(Self::TooManyBoundArguments { count: n_bound })
        } else {
            Ok(())
        }
    }
}

/// Functions every program can refer to by name
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Builtin {
    Plus,
    Minus,
    Equals,
}

impl Builtin {
    pub const ALL: [Builtin; 3] = [Builtin::Plus, Builtin::Minus, Builtin::Equals];

    pub fn name(self) -> &'static str {
        match self {
            Builtin::Plus => "plus",
            Builtin::Minus => "minus",
            Builtin::Equals => "equals",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|builtin| builtin.name() == name)
    }

    pub fn arity(self) -> usize {
        2
    }

    /// Runs the builtin on an argument vector
    pub fn apply(self, args: &[Word]) -> Word {
        let (a, b) = (args[0], args[1]);
        match self {
            Builtin::Plus => a.wrapping_add(b),
            Builtin::Minus => a.wrapping_sub(b),
            Builtin::Equals => Word::from(a == b),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Closure {
    /// Address of the code to run
    pub code: Word,
    pub n_bound: usize,
    pub free: Vec<Word>,
}

impl Closure {
    pub fn n_free(&self) -> usize {
        self.free.len()
    }

    /// The argument vector for a call: bound arguments first, then the captured values.
    ///
    /// Only the first `n_bound` entries of `bound` are used.
    pub fn call_arguments(&self, bound: &[Word]) -> Result<Vec<Word>, ConventionLimitError> {
        if bound.len() > MAX_BOUND_ARGS {
            return Err(ConventionLimitError::TooManyBoundArguments { count: bound.len() });
        }
        let mut args = bound
            .iter()
            .copied()
            .chain(std::iter::repeat(0))
            .take(self.n_bound)
            .collect::<Vec<_>>();
        args.extend_from_slice(&self.free);
        Ok(args)
    }
}

/// Build a closure record, enforcing the calling convention's capacities
pub fn make_closure(code: Word, n_bound: usize, free: &[Word]) -> Result<Closure, ConventionLimitError> {
    ConventionLimitError::check(n_bound, free.len())?;
    Ok(Closure {
        code,
        n_bound,
        free: free.to_vec(),
    })
}

/// What a word turns out to be
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Value {
    Data(Word),
    Closure(Closure),
}

/// Bump-allocated memory that is never freed
#[derive(Debug, Clone)]
pub struct Heap {
    next: Word,
    words: HashMap<Word, Word>,
    closures: HashMap<Word, Closure>,
}

impl Default for Heap {
    fn default() -> Self {
        Self::new()
    }
}

impl Heap {
    pub const BASE: Word = 0x1000_0000;

    pub fn new() -> Self {
        Self {
            next: Self::BASE,
            words: HashMap::new(),
            closures: HashMap::new(),
        }
    }

    /// Reserve `bytes` (rounded up to whole words, at least one) and return the address
    pub fn malloc(&mut self, bytes: Word) -> Word {
        let words = ((bytes.max(0) + WORD_BYTES - 1) / WORD_BYTES).max(1);
        let address = self.next;
        self.next += words * WORD_BYTES;
        address
    }

    pub fn contains(&self, address: Word) -> bool {
        (Self::BASE..self.next).contains(&address) && address % WORD_BYTES == 0
    }

    /// `None` outside of allocated memory. Fresh memory reads as zero.
    pub fn load(&self, address: Word) -> Option<Word> {
        self.contains(address)
            .then(|| self.words.get(&address).copied().unwrap_or(0))
    }

    /// Returns `false` if `address` was never allocated
    #[must_use]
    pub fn store(&mut self, address: Word, value: Word) -> bool {
        if self.contains(address) {
            self.words.insert(address, value);
            true
        } else {
            false
        }
    }

    /// Allocate an argument vector holding `args`
    pub fn alloc_words(&mut self, args: &[Word]) -> Word {
        let address = self.malloc(args.len() as Word * WORD_BYTES);
        for (idx, &arg) in args.iter().enumerate() {
            self.words.insert(address + idx as Word * WORD_BYTES, arg);
        }
        address
    }

    /// Place a closure record on the heap: code, bound count, free count, captured values
    pub fn alloc_closure(&mut self, closure: Closure) -> Word {
        let mut layout = vec![
            closure.code,
            closure.n_bound as Word,
            closure.n_free() as Word,
        ];
        layout.extend_from_slice(&closure.free);
        let address = self.alloc_words(&layout);
        self.closures.insert(address, closure);
        address
    }

    pub fn closure(&self, address: Word) -> Option<&Closure> {
        self.closures.get(&address)
    }

    pub fn value(&self, word: Word) -> Value {
        match self.closure(word) {
            Some(closure) => Value::Closure(closure.clone()),
            None => Value::Data(word),
        }
    }
}
