//! The types of this module make the results of the general parser more
//! accessible by providing a strongly-typed layer on top of the CST produced
//! by the parser.
use crate::lexer::{Span, Token};

/// GAst Syntax Types
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[allow(non_camel_case_types, clippy::upper_case_acronyms)]
#[repr(u16)]
pub enum SyntaxKind {
    // Literals
    // (which correspond to tokens)
    /// (
    LPAREN = 0,
    /// )
    RPAREN,
    /// any kind of inline whitespace
    WHITESPACE,
    /// \r | \n | \r\n
    LINEEND,
    /// ; comment
    COMMENT,
    /// an identifier
    SYMBOL,
    /// an integer literal
    NUMBER,
    /// syntax errors
    ERROR,

    // composite nodes
    /// `(plus 2 3)` or `()`
    LIST,
    /// wraps any valid datum
    DATUM,
    /// top-level node: a list of s-expressions
    ROOT,
}
use SyntaxKind::*;

/// Some boilerplate is needed, as rowan settled on using its own
/// `struct SyntaxKind(u16)` internally, instead of accepting the
/// user's `enum SyntaxKind` as a type parameter.
///
/// First, to easily pass the enum variants into rowan via `.into()`:
impl From<SyntaxKind> for rowan::SyntaxKind {
    fn from(kind: SyntaxKind) -> Self {
        Self(kind as u16)
    }
}

/// Second, implementing the `Language` trait teaches rowan to convert between
/// these two SyntaxKind types, allowing for a nicer SyntaxNode API where
/// "kinds" are values from our `enum SyntaxKind`, instead of plain u16 values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum LamLang {}
impl rowan::Language for LamLang {
    type Kind = SyntaxKind;
    fn kind_from_raw(raw: rowan::SyntaxKind) -> Self::Kind {
        assert!(raw.0 <= ROOT as u16);
        unsafe { std::mem::transmute::<u16, SyntaxKind>(raw.0) }
    }
    fn kind_to_raw(kind: Self::Kind) -> rowan::SyntaxKind {
        kind.into()
    }
}

pub type LamSyntaxNode = rowan::SyntaxNode<LamLang>;
pub type LamSyntaxToken = rowan::SyntaxToken<LamLang>;
pub type LamSyntaxElement = rowan::NodeOrToken<LamSyntaxNode, LamSyntaxToken>;

fn range_to_span(range: rowan::TextRange) -> Span {
    usize::from(range.start())..usize::from(range.end())
}

/// Anything that is a non-terminal
pub trait GAstNode {
    fn cast(syntax: LamSyntaxNode) -> Option<Self>
    where
        Self: Sized;

    fn syntax(&self) -> &LamSyntaxNode;

    /// Byte range of this node in the source
    fn span(&self) -> Span {
        range_to_span(self.syntax().text_range())
    }
}

/// Anything that is a terminal
pub trait GAstToken {
    fn cast(syntax: LamSyntaxToken) -> Option<Self>
    where
        Self: Sized;

    fn syntax(&self) -> &LamSyntaxToken;

    fn span(&self) -> Span {
        range_to_span(self.syntax().text_range())
    }
}

macro_rules! simple_gast {
    (node $name:ident from $kind:ident) => {
        impl GAstNode for $name {
            fn cast(syntax: LamSyntaxNode) -> Option<Self>
            where
                Self: Sized,
            {
                (syntax.kind() == $kind).then_some(Self(syntax))
            }

            fn syntax(&self) -> &LamSyntaxNode {
                &self.0
            }
        }
    };

    (node $name:ident from $kind:ident $with:expr) => {
        impl GAstNode for $name {
            fn cast(syntax: LamSyntaxNode) -> Option<Self>
            where
                Self: Sized,
            {
                (syntax.kind() == $kind && $with(&syntax)).then_some(Self(syntax))
            }

            fn syntax(&self) -> &LamSyntaxNode {
                &self.0
            }
        }
    };
    (token $name:ident from $kind:ident) => {
        impl GAstToken for $name {
            fn cast(syntax: LamSyntaxToken) -> Option<Self>
            where
                Self: Sized,
            {
                (syntax.kind() == $kind).then_some(Self(syntax))
            }

            fn syntax(&self) -> &LamSyntaxToken {
                &self.0
            }
        }
    };
}

/// Any node that can contain datum
pub trait ContainsDatum {
    fn datum(&self) -> impl Iterator<Item = Datum>;
}

macro_rules! contains {
    (datum $tyn:ident) => {
        impl ContainsDatum for $tyn {
            fn datum(&self) -> impl Iterator<Item = Datum> {
                self.0.children().filter_map(Datum::cast)
            }
        }
    };
}

/// Root GAst type for a file
#[derive(Debug, Clone)]
pub struct Module(LamSyntaxNode);
simple_gast!(node Module from ROOT);
contains!(datum Module);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DatumKind {
    List,
    Symbol,
    Number,
}

#[derive(Debug, Clone)]
pub struct Datum(LamSyntaxNode);
impl Datum {
    // If this says `Some`, calling the correct as_* and unwrapping must never panic
    pub fn kind(&self) -> Option<DatumKind> {
        match self.0.children_with_tokens().next() {
            None => None,
            Some(LamSyntaxElement::Node(node)) => match node.kind() {
                LIST => Some(DatumKind::List),
                _ => None,
            },
            Some(LamSyntaxElement::Token(tok)) => match tok.kind() {
                SYMBOL => Some(DatumKind::Symbol),
                NUMBER => Some(DatumKind::Number),
                _ => None,
            },
        }
    }
}
// *all* validly parsed datum only contain 1 child
simple_gast!(node Datum from DATUM |syntax: &LamSyntaxNode| {
    syntax.children_with_tokens().count() == 1
});

macro_rules! datum_as_type {
    (node $name:ident for $type:ident from $stype:ident) => {
        impl Datum {
            pub fn $name(&self) -> Option<$type> {
                match self.0.children().next() {
                    Some(node) if node.kind() == $stype => $type::cast(node),
                    _ => None,
                }
            }
        }
    };

    (token $name:ident for $type:ident from $stype:ident) => {
        impl Datum {
            pub fn $name(&self) -> Option<$type> {
                match self.0.children_with_tokens().next() {
                    Some(LamSyntaxElement::Token(token)) if token.kind() == $stype => {
                        $type::cast(token)
                    }
                    _ => None,
                }
            }
        }
    };
}
datum_as_type!(node as_list for List from LIST);
datum_as_type!(token as_symbol for Symbol from SYMBOL);
datum_as_type!(token as_number for Number from NUMBER);

#[derive(Debug, Clone)]
pub struct List(LamSyntaxNode);
impl List {
    /// Get the head element
    pub fn head(&self) -> Option<Datum> {
        self.datum().next()
    }
}
simple_gast!(node List from LIST);
contains!(datum List);

macro_rules! simple_extract {
    ($ty:ident::$name:ident from $stt:ident as $type:ty ) => {
        impl $ty {
            pub fn $name(&self) -> Option<$type> {
                if let Some(Ok(Token::$stt(val))) = Token::lexer(self.0.text()).next() {
                    Some(val)
                } else {
                    None
                }
            }
        }
    };
}

#[derive(Debug, Clone)]
pub struct Symbol(LamSyntaxToken);
simple_gast!(token Symbol from SYMBOL);
simple_extract!(Symbol::identifier from Identifier as Box<str>);

#[derive(Debug, Clone)]
pub struct Number(LamSyntaxToken);
simple_gast!(token Number from NUMBER);
simple_extract!(Number::value from Integer as i64);

#[cfg(test)]
mod tests {
    use super::{ContainsDatum as _, DatumKind, GAstNode as _, GAstToken as _};
    use crate::general_parse;
    use assert2::{check, let_assert};

    #[test]
    fn extract_atoms() {
        let gast = general_parse("λ -17");
        let data = gast.module().datum().collect::<Vec<_>>();
        check!(data.len() == 2);
        let_assert!(Some(symbol) = data[0].as_symbol());
        check!(symbol.identifier().as_deref() == Some("λ"));
        check!(symbol.span() == (0..2));
        let_assert!(Some(number) = data[1].as_number());
        check!(number.value() == Some(-17));
        check!(data[1].as_list().is_none());
    }

    #[test]
    fn list_heads_skip_trivia() {
        let gast = general_parse("(if ; choose\n 1 2 3)");
        let_assert!(Some(datum) = gast.module().datum().next());
        check!(datum.kind() == Some(DatumKind::List));
        let_assert!(Some(list) = datum.as_list());
        let_assert!(Some(head) = list.head());
        check!(head.as_symbol().and_then(|s| s.identifier()).as_deref() == Some("if"));
        check!(list.datum().count() == 4);
        check!(datum.span() == (0..20));
    }
}
