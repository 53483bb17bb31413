//! General parsing starts where the lexer dropped of, and handles nested syntax, while
//! also forming a GAST which is a relatively simple layer on top of a [`rowan`] CST.
//!
//! Nothing here knows about `let` or `lambda`; that is the job of [`special_forms`].
use rowan::{GreenNode, GreenNodeBuilder};

use crate::lexer::{LexerError, Span, Token};

pub mod gast;
pub mod special_forms;

use gast::{LamSyntaxNode, SyntaxKind, SyntaxKind::*};

#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum ParseError {
    #[error("unmatched `)`")]
    UnmatchedClose { span: Span },
    #[error("list is never closed")]
    UnclosedList { span: Span },
    #[error("{error}")]
    Lexer { error: LexerError, span: Span },
}

impl ParseError {
    pub fn span(&self) -> Span {
        match self {
            Self::UnmatchedClose { span } | Self::UnclosedList { span } | Self::Lexer { span, .. } => {
                span.clone()
            }
        }
    }
}

/// GAst top level
///
/// Always produced, even for broken input; check [`GAst::errors`] before lowering.
#[derive(Debug, Clone)]
pub struct GAst {
    green: GreenNode,
    errors: Vec<ParseError>,
}

impl GAst {
    pub fn syntax(&self) -> LamSyntaxNode {
        LamSyntaxNode::new_root(self.green.clone())
    }

    pub fn module(&self) -> gast::Module {
        use gast::GAstNode as _;
        // the root is always a ROOT node, we built it that way
        gast::Module::cast(self.syntax()).unwrap()
    }

    pub fn errors(&self) -> &[ParseError] {
        &self.errors
    }
}

struct GeneralParser<'src> {
    builder: GreenNodeBuilder<'static>,
    errors: Vec<ParseError>,
    // spans of the `(` of every list still open
    open: Vec<Span>,
    source: &'src str,
}

impl<'src> GeneralParser<'src> {
    fn token(&mut self, kind: SyntaxKind, span: &Span) {
        self.builder.token(kind.into(), &self.source[span.clone()]);
    }

    fn atom(&mut self, kind: SyntaxKind, span: &Span) {
        self.builder.start_node(DATUM.into());
        self.token(kind, span);
        self.builder.finish_node();
    }

    fn parse(mut self) -> GAst {
        self.builder.start_node(ROOT.into());

        for (token, span) in Token::lexer(self.source).spanned() {
            match token {
                Ok(Token::IntralineWhitespace) => self.token(WHITESPACE, &span),
                Ok(Token::LineEnding) => self.token(LINEEND, &span),
                Ok(Token::Comment) => self.token(COMMENT, &span),
                Ok(Token::LParen) => {
                    self.builder.start_node(DATUM.into());
                    self.builder.start_node(LIST.into());
                    self.token(LPAREN, &span);
                    self.open.push(span);
                }
                Ok(Token::RParen) => {
                    if self.open.pop().is_some() {
                        self.token(RPAREN, &span);
                        // LIST, then DATUM
                        self.builder.finish_node();
                        self.builder.finish_node();
                    } else {
                        self.errors
                            .push(ParseError::UnmatchedClose { span: span.clone() });
                        self.token(ERROR, &span);
                    }
                }
                Ok(Token::Identifier(_)) => self.atom(SYMBOL, &span),
                Ok(Token::Integer(_)) => self.atom(NUMBER, &span),
                Err(error) => {
                    self.errors.push(ParseError::Lexer {
                        error,
                        span: span.clone(),
                    });
                    self.token(ERROR, &span);
                }
            }
        }

        // Close whatever is left so the tree stays balanced
        while let Some(span) = self.open.pop() {
            self.errors.push(ParseError::UnclosedList { span });
            self.builder.finish_node();
            self.builder.finish_node();
        }

        self.builder.finish_node();
        GAst {
            green: self.builder.finish(),
            errors: self.errors,
        }
    }
}

/// Build the lossless syntax tree for `source`.
pub fn general_parse(source: &str) -> GAst {
    GeneralParser {
        builder: GreenNodeBuilder::new(),
        errors: vec![],
        open: vec![],
        source,
    }
    .parse()
}
