pub use logos::Span;
use logos::{Lexer, Logos};

fn read_integer(lexer: &mut Lexer<Token>) -> Result<i64, LexerError> {
    lexer
        .slice()
        .parse::<i64>()
        .map_err(|_| LexerError::IntegerTooBig)
}

#[derive(thiserror::Error, Debug, PartialEq, Clone, Default)]
pub enum LexerError {
    #[default]
    #[error("invalid token encountered")]
    Invalid,
    #[error("integer literal does not fit in a machine word")]
    IntegerTooBig,
}

/// Tokens are lexed from some source, and can arbitrarily borrow from it.
#[derive(Debug, Clone, PartialEq, Logos)]
#[logos(error = LexerError)]
pub enum Token {
    #[regex("[ \t]+")]
    IntralineWhitespace,
    #[token("\n")]
    #[token("\r\n")]
    #[token("\r")]
    LineEnding,
    #[regex(r";[^\r\n]*")]
    Comment,

    #[token("(")]
    LParen,
    #[token(")")]
    RParen,

    // Anything that isn't whitespace, a paren or the start of a comment.
    // This is deliberately loose: `λ`, `plus`, `-` and `_f0` are all identifiers.
    #[regex(r"[^ \t\r\n();]+", |l| Box::from(l.slice()))]
    Identifier(Box<str>),
    #[regex(r"-?[0-9]+", read_integer, priority = 5)]
    Integer(i64),
}

impl Token {
    pub fn lexer(source: &str) -> Lexer<Self> {
        <Self as Logos>::lexer(source)
    }

    /// Whitespace, line endings and comments
    pub fn is_trivia(&self) -> bool {
        matches!(
            self,
            Token::IntralineWhitespace | Token::LineEnding | Token::Comment
        )
    }
}

#[cfg(test)]
mod tests {
    use super::{LexerError, Token};
    use arbtest::arbtest;
    use assert2::{check, let_assert};

    fn tokens(source: &str) -> Vec<Result<Token, LexerError>> {
        Token::lexer(source).collect()
    }

    #[test]
    fn identifier_checklist() {
        macro_rules! test_valid {
            ($source:literal) => {{
                let mut lexer = Token::lexer($source);
                let token = lexer.next();
                let_assert!(Some(Ok(Token::Identifier(_))) = token);
                check!(lexer.slice() == $source);
            }};
        }

        test_valid!("x");
        test_valid!("plus");
        test_valid!("letrec");
        test_valid!("λ");
        test_valid!("-");
        test_valid!("_f0");
        test_valid!("a-b?");
        test_valid!("12abc");
    }

    #[test]
    fn test_parens_and_trivia() {
        check!(
            tokens("(f 1)\n")
                == vec![
                    Ok(Token::LParen),
                    Ok(Token::Identifier(Box::from("f"))),
                    Ok(Token::IntralineWhitespace),
                    Ok(Token::Integer(1)),
                    Ok(Token::RParen),
                    Ok(Token::LineEnding),
                ]
        );
        check!(tokens("; comment (not a list)") == vec![Ok(Token::Comment)]);
        check!(
            tokens("x;y\r\n")
                == vec![
                    Ok(Token::Identifier(Box::from("x"))),
                    Ok(Token::Comment),
                    Ok(Token::LineEnding),
                ]
        );
    }

    #[test]
    fn test_integer() {
        check!(Token::lexer("0").next() == Some(Ok(Token::Integer(0))));
        check!(Token::lexer("-42").next() == Some(Ok(Token::Integer(-42))));
        check!(
            Token::lexer("99999999999999999999").next() == Some(Err(LexerError::IntegerTooBig))
        );
    }

    #[test]
    fn test_trivia_classification() {
        check!(Token::Comment.is_trivia());
        check!(Token::LineEnding.is_trivia());
        check!(!Token::LParen.is_trivia());
    }

    #[test]
    fn test_integer_arbtest_roundtrip() {
        arbtest(|u| {
            let value: i64 = u.arbitrary()?;
            let source = value.to_string();
            check!(
                Token::lexer(&source).next() == Some(Ok(Token::Integer(value))),
                "`{source}` does not roundtrip"
            );
            Ok(())
        });
    }
}
