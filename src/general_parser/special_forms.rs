//! Recognizes the handful of special forms and lowers the GAst into an [`Ast`].
//!
//! Top-level `(def name expr)` and `(defrec name expr)` forms are folded into
//! `let`/`letrec` around the final form, which becomes the program's main expression.
use crate::{
    ast::{Ast, AstBuilder, Name, NodeId},
    lexer::Span,
};

use super::gast::{ContainsDatum as _, Datum, DatumKind, GAstNode as _, List, Module};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SpecialForm {
    Let,
    Letrec,
    Lambda,
    If,
    // only allowed at the top level
    Def,
    Defrec,
}

impl SpecialForm {
    pub fn from_identifier(identifier: &str) -> Option<Self> {
        Some(match identifier {
            "let" => Self::Let,
            "letrec" => Self::Letrec,
            "lambda" | "λ" => Self::Lambda,
            "if" => Self::If,
            "def" => Self::Def,
            "defrec" => Self::Defrec,
            _ => return None,
        })
    }

    /// The special form `list` starts with, if any
    pub fn of(list: &List) -> Option<Self> {
        list.head()
            .and_then(|head| head.as_symbol())
            .and_then(|symbol| symbol.identifier())
            .and_then(|identifier| Self::from_identifier(&identifier))
    }

    pub fn is_definition(self) -> bool {
        matches!(self, Self::Def | Self::Defrec)
    }
}

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum SyntaxError {
    #[error("a program needs at least one expression")]
    EmptyProgram { span: Span },
    #[error("`()` is not a valid expression")]
    EmptyApplication { span: Span },
    #[error("expected `(let (name definition) body)`")]
    MalformedLet { span: Span },
    #[error("expected `(lambda (params ...) body)`")]
    MalformedLambda { span: Span },
    #[error("parameter `{name}` appears more than once")]
    DuplicateParameter { name: Box<str>, span: Span },
    #[error("expected `(if predicate then else)`")]
    MalformedIf { span: Span },
    #[error("definitions are only allowed at the top level, before the main expression")]
    MisplacedDefinition { span: Span },
    #[error("expected `(def name expression)`")]
    MalformedDefinition { span: Span },
    #[error("not a valid expression")]
    InvalidDatum { span: Span },
}

impl SyntaxError {
    pub fn span(&self) -> Span {
        match self {
            Self::EmptyProgram { span }
            | Self::EmptyApplication { span }
            | Self::MalformedLet { span }
            | Self::MalformedLambda { span }
            | Self::DuplicateParameter { span, .. }
            | Self::MalformedIf { span }
            | Self::MisplacedDefinition { span }
            | Self::MalformedDefinition { span }
            | Self::InvalidDatum { span } => span.clone(),
        }
    }
}

fn symbol_of(datum: &Datum) -> Option<Box<str>> {
    datum.as_symbol().and_then(|symbol| symbol.identifier())
}

struct Lowering {
    builder: AstBuilder,
}

impl Lowering {
    fn datum(&mut self, datum: &Datum) -> Result<NodeId, SyntaxError> {
        let span = datum.span();
        match datum.kind() {
            Some(DatumKind::Number) => {
                let value = datum
                    .as_number()
                    .and_then(|number| number.value())
                    .ok_or(SyntaxError::InvalidDatum { span: span.clone() })?;
                Ok(self.builder.integer(value, span))
            }
            Some(DatumKind::Symbol) => {
                let name = symbol_of(datum).ok_or(SyntaxError::InvalidDatum { span: span.clone() })?;
                Ok(self.builder.var(name, span))
            }
            Some(DatumKind::List) => match datum.as_list() {
                Some(list) => self.list(&list),
                None => Err(SyntaxError::InvalidDatum { span }),
            },
            None => Err(SyntaxError::InvalidDatum { span }),
        }
    }

    fn list(&mut self, list: &List) -> Result<NodeId, SyntaxError> {
        let span = list.span();
        let items = list.datum().collect::<Vec<_>>();
        if items.is_empty() {
            return Err(SyntaxError::EmptyApplication { span });
        }

        match SpecialForm::of(list) {
            Some(form @ (SpecialForm::Let | SpecialForm::Letrec)) => {
                let [_, binding, body] = items.as_slice() else {
                    return Err(SyntaxError::MalformedLet { span });
                };
                let (name, definition) = self
                    .binding(binding)
                    .ok_or(SyntaxError::MalformedLet { span: span.clone() })?;
                let definition = self.datum(&definition)?;
                let body = self.datum(body)?;
                Ok(self.builder.let_in(
                    name,
                    definition,
                    body,
                    form == SpecialForm::Letrec,
                    span,
                ))
            }
            Some(SpecialForm::Lambda) => {
                let [_, params, body] = items.as_slice() else {
                    return Err(SyntaxError::MalformedLambda { span });
                };
                let params = self.params(params, &span)?;
                let body = self.datum(body)?;
                Ok(self.builder.lambda(params, body, span))
            }
            Some(SpecialForm::If) => {
                let [_, pred, then, otherwise] = items.as_slice() else {
                    return Err(SyntaxError::MalformedIf { span });
                };
                let pred = self.datum(pred)?;
                let then = self.datum(then)?;
                let otherwise = self.datum(otherwise)?;
                Ok(self.builder.if_then_else(pred, then, otherwise, span))
            }
            Some(SpecialForm::Def | SpecialForm::Defrec) => {
                Err(SyntaxError::MisplacedDefinition { span })
            }
            None => {
                let operator = self.datum(&items[0])?;
                let operands = items[1..]
                    .iter()
                    .map(|item| self.datum(item))
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(self.builder.apply(operator, operands, span))
            }
        }
    }

    // `(name definition)`
    fn binding(&mut self, binding: &Datum) -> Option<(Name, Datum)> {
        let list = binding.as_list()?;
        let mut items = list.datum();
        let name = symbol_of(&items.next()?)?;
        let definition = items.next()?;
        if items.next().is_some() {
            return None;
        }
        Some((self.builder.intern(name), definition))
    }

    fn params(&mut self, params: &Datum, span: &Span) -> Result<Vec<Name>, SyntaxError> {
        let list = params
            .as_list()
            .ok_or(SyntaxError::MalformedLambda { span: span.clone() })?;
        let mut names = vec![];
        for param in list.datum() {
            let identifier =
                symbol_of(&param).ok_or(SyntaxError::MalformedLambda { span: span.clone() })?;
            let name = self.builder.intern(&identifier);
            if names.contains(&name) {
                return Err(SyntaxError::DuplicateParameter {
                    name: identifier,
                    span: param.span(),
                });
            }
            names.push(name);
        }
        Ok(names)
    }

    // `(def name expression)`
    fn definition(&mut self, list: &List) -> Result<(Name, Datum), SyntaxError> {
        let span = list.span();
        let items = list.datum().collect::<Vec<_>>();
        let [_, name, definition] = items.as_slice() else {
            return Err(SyntaxError::MalformedDefinition { span });
        };
        let name = symbol_of(name).ok_or(SyntaxError::MalformedDefinition { span })?;
        Ok((self.builder.intern(name), definition.clone()))
    }
}

/// Lower a parsed module into an [`Ast`] rooted at a program node.
///
/// The module must be free of [`ParseError`](super::ParseError)s.
pub fn lower(module: &Module) -> Result<Ast, SyntaxError> {
    let span = module.span();
    let forms = module.datum().collect::<Vec<_>>();
    let Some((main, definitions)) = forms.split_last() else {
        return Err(SyntaxError::EmptyProgram { span });
    };

    let mut lowering = Lowering {
        builder: AstBuilder::new(),
    };

    // (name, definition, recursive?, span)
    let mut folded = Vec::with_capacity(definitions.len());
    for datum in definitions {
        let form = datum
            .as_list()
            .and_then(|list| SpecialForm::of(&list).map(|form| (list, form)));
        match form {
            Some((list, form)) if form.is_definition() => {
                let (name, definition) = lowering.definition(&list)?;
                folded.push((name, definition, form == SpecialForm::Defrec, list.span()));
            }
            _ => return Err(SyntaxError::MisplacedDefinition { span: datum.span() }),
        }
    }

    if let Some(list) = main.as_list() {
        if SpecialForm::of(&list).is_some_and(SpecialForm::is_definition) {
            return Err(SyntaxError::MisplacedDefinition { span: list.span() });
        }
    }

    let mut body = lowering.datum(main)?;
    for (name, definition, is_recursive, span) in folded.into_iter().rev() {
        let definition = lowering.datum(&definition)?;
        body = lowering
            .builder
            .let_in(name, definition, body, is_recursive, span);
    }

    Ok(lowering.builder.finish(body, span))
}
