//! # Script Tokenizer
//!
//! Turns script source into a flat token list. Whitespace and `//` comments
//! are dropped; every token remembers the line and column it started on for
//! error messages.

use nom::{
    IResult,
    branch::alt,
    bytes::complete::{tag, take_while, take_while1},
    character::complete::{char, digit1, none_of},
    combinator::{map, map_res, recognize, value},
    error::{VerboseError, context},
    multi::fold_many0,
    sequence::{delimited, pair, preceded, tuple},
};
use strum_macros::{AsRefStr, Display, EnumString};
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, EnumString, Display, AsRefStr)]
#[strum(serialize_all = "lowercase")]
pub enum Keyword {
    Let,
    If,
    Else,
    While,
    True,
    False,
    Null,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, AsRefStr)]
pub enum Operator {
    #[strum(serialize = "==")]
    EqualEqual,
    #[strum(serialize = "!=")]
    NotEqual,
    #[strum(serialize = "<=")]
    LessEqual,
    #[strum(serialize = ">=")]
    GreaterEqual,
    #[strum(serialize = "&&")]
    And,
    #[strum(serialize = "||")]
    Or,
    #[strum(serialize = "<")]
    Less,
    #[strum(serialize = ">")]
    Greater,
    #[strum(serialize = "+")]
    Plus,
    #[strum(serialize = "-")]
    Minus,
    #[strum(serialize = "*")]
    Multiply,
    #[strum(serialize = "/")]
    Divide,
    #[strum(serialize = "%")]
    Percent,
    #[strum(serialize = "!")]
    Not,
    #[strum(serialize = "=")]
    Assign,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, AsRefStr)]
pub enum Delimiter {
    #[strum(serialize = "(")]
    OpenParen,
    #[strum(serialize = ")")]
    CloseParen,
    #[strum(serialize = "{")]
    OpenBrace,
    #[strum(serialize = "}")]
    CloseBrace,
    #[strum(serialize = "[")]
    OpenBracket,
    #[strum(serialize = "]")]
    CloseBracket,
    #[strum(serialize = "#{")]
    MapOpen,
    #[strum(serialize = ",")]
    Comma,
    #[strum(serialize = ";")]
    Semicolon,
    #[strum(serialize = ":")]
    Colon,
}

impl std::fmt::Display for Delimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_ref())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Token {
    Int(i64),
    Float(f64),
    Str(String),
    Char(char),
    Identifier(String),
    Keyword(Keyword),
    Operator(Operator),
    Delimiter(Delimiter),
}

impl std::fmt::Display for Token {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Token::Int(i) => write!(f, "`{i}`"),
            Token::Float(x) => write!(f, "`{x}`"),
            Token::Str(s) => write!(f, "string {s:?}"),
            Token::Char(c) => write!(f, "char {c:?}"),
            Token::Identifier(id) => write!(f, "`{id}`"),
            Token::Keyword(kw) => write!(f, "`{kw}`"),
            Token::Operator(op) => write!(f, "`{op}`"),
            Token::Delimiter(d) => write!(f, "`{d}`"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct TokenSpan {
    pub token: Token,
    pub line: usize,
    pub column: usize,
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum LexError {
    #[error("unterminated string literal at line {line}, column {column}")]
    UnterminatedString { line: usize, column: usize },
    #[error("integer literal out of range at line {line}, column {column}")]
    IntegerOutOfRange { line: usize, column: usize },
    #[error("unexpected character {found:?} at line {line}, column {column}")]
    Unexpected {
        found: char,
        line: usize,
        column: usize,
    },
}

type ParserResult<'a, T> = IResult<&'a str, T, VerboseError<&'a str>>;

pub fn tokenize(input: &str) -> Result<Vec<TokenSpan>, LexError> {
    let mut tokens = Vec::new();
    let mut remaining = input;
    let mut line = 1;
    let mut column = 1;

    loop {
        let (rest, skipped) = skip_trivia(remaining);
        advance(&mut line, &mut column, skipped);
        remaining = rest;
        if remaining.is_empty() {
            return Ok(tokens);
        }

        match parse_token(remaining) {
            Ok((rest, token)) => {
                tokens.push(TokenSpan {
                    token,
                    line,
                    column,
                });
                let consumed = &remaining[..remaining.len() - rest.len()];
                advance(&mut line, &mut column, consumed);
                remaining = rest;
            }
            Err(_) => {
                let found = remaining.chars().next().unwrap_or_default();
                tracing::debug!(line, column, ?found, "tokenizer rejected input");
                return Err(match found {
                    '"' => LexError::UnterminatedString { line, column },
                    '0'..='9' => LexError::IntegerOutOfRange { line, column },
                    _ => LexError::Unexpected {
                        found,
                        line,
                        column,
                    },
                });
            }
        }
    }
}

fn advance(line: &mut usize, column: &mut usize, text: &str) {
    for c in text.chars() {
        if c == '\n' {
            *line += 1;
            *column = 1;
        } else {
            *column += 1;
        }
    }
}

/// Skips whitespace and line comments, returning the rest and what was skipped.
fn skip_trivia(input: &str) -> (&str, &str) {
    let mut rest = input;
    loop {
        let trimmed = rest.trim_start();
        if let Some(comment) = trimmed.strip_prefix("//") {
            rest = comment.find('\n').map_or("", |end| &comment[end..]);
        } else {
            rest = trimmed;
            break;
        }
    }
    (rest, &input[..input.len() - rest.len()])
}

fn parse_token(input: &str) -> ParserResult<Token> {
    alt((
        parse_float,
        parse_integer,
        parse_string,
        parse_char,
        parse_word,
        parse_operator,
        parse_delimiter,
    ))(input)
}

fn parse_escape(input: &str) -> ParserResult<char> {
    context(
        "escape sequence",
        alt((
            value('\n', char('n')),
            value('\t', char('t')),
            value('\r', char('r')),
            value('\0', char('0')),
            value('\\', char('\\')),
            value('"', char('"')),
            value('\'', char('\'')),
        )),
    )(input)
}

fn parse_string(input: &str) -> ParserResult<Token> {
    context(
        "string literal",
        map(
            delimited(
                char('"'),
                fold_many0(
                    alt((none_of("\\\"\n"), preceded(char('\\'), parse_escape))),
                    String::new,
                    |mut s, c| {
                        s.push(c);
                        s
                    },
                ),
                char('"'),
            ),
            Token::Str,
        ),
    )(input)
}

fn parse_char(input: &str) -> ParserResult<Token> {
    context(
        "char literal",
        map(
            delimited(
                char('\''),
                alt((preceded(char('\\'), parse_escape), none_of("\\'\n"))),
                char('\''),
            ),
            Token::Char,
        ),
    )(input)
}

fn parse_float(input: &str) -> ParserResult<Token> {
    context(
        "float literal",
        map_res(recognize(tuple((digit1, char('.'), digit1))), |s: &str| {
            s.parse::<f64>().map(Token::Float)
        }),
    )(input)
}

fn parse_integer(input: &str) -> ParserResult<Token> {
    context(
        "integer literal",
        map_res(digit1, |s: &str| s.parse::<i64>().map(Token::Int)),
    )(input)
}

fn parse_word(input: &str) -> ParserResult<Token> {
    let (input, word) = context(
        "identifier",
        recognize(pair(
            take_while1(|c: char| c.is_alphabetic() || c == '_'),
            take_while(|c: char| c.is_alphanumeric() || c == '_'),
        )),
    )(input)?;

    match word.parse::<Keyword>() {
        Ok(keyword) => Ok((input, Token::Keyword(keyword))),
        Err(_) => Ok((input, Token::Identifier(word.to_string()))),
    }
}

fn parse_operator(input: &str) -> ParserResult<Token> {
    context(
        "operator",
        map(
            alt((
                value(Operator::EqualEqual, tag("==")),
                value(Operator::NotEqual, tag("!=")),
                value(Operator::LessEqual, tag("<=")),
                value(Operator::GreaterEqual, tag(">=")),
                value(Operator::And, tag("&&")),
                value(Operator::Or, tag("||")),
                value(Operator::Less, tag("<")),
                value(Operator::Greater, tag(">")),
                value(Operator::Plus, tag("+")),
                value(Operator::Minus, tag("-")),
                value(Operator::Multiply, tag("*")),
                value(Operator::Divide, tag("/")),
                value(Operator::Percent, tag("%")),
                value(Operator::Not, tag("!")),
                value(Operator::Assign, tag("=")),
            )),
            Token::Operator,
        ),
    )(input)
}

fn parse_delimiter(input: &str) -> ParserResult<Token> {
    context(
        "delimiter",
        map(
            alt((
                value(Delimiter::MapOpen, tag("#{")),
                value(Delimiter::OpenParen, tag("(")),
                value(Delimiter::CloseParen, tag(")")),
                value(Delimiter::OpenBrace, tag("{")),
                value(Delimiter::CloseBrace, tag("}")),
                value(Delimiter::OpenBracket, tag("[")),
                value(Delimiter::CloseBracket, tag("]")),
                value(Delimiter::Comma, tag(",")),
                value(Delimiter::Semicolon, tag(";")),
                value(Delimiter::Colon, tag(":")),
            )),
            Token::Delimiter,
        ),
    )(input)
}
