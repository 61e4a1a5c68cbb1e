//! Recursive-descent parser over [`TokenSpan`]s.
//!
//! Running out of tokens is reported as [`ParseError::UnexpectedEof`], which
//! the session turns into an incomplete evaluation.

use thiserror::Error;

use super::lexer::{Delimiter, Keyword, Operator, Token, TokenSpan};
use crate::value::Value;

/// Deepest nesting of expressions, blocks and operator chains accepted.
/// Anything deeper would risk the evaluating thread's stack.
pub const MAX_DEPTH: usize = 128;

#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Literal(Value),
    Var(String),
    List(Vec<Expr>),
    Map(Vec<(Expr, Expr)>),
    Unary(Operator, Box<Expr>),
    Binary(Box<Expr>, Operator, Box<Expr>),
    Call(String, Vec<Expr>),
    Index(Box<Expr>, Box<Expr>),
}

#[derive(Debug, Clone, PartialEq)]
pub enum Target {
    Name(String),
    Index(String, Expr),
}

#[derive(Debug, Clone, PartialEq)]
pub enum Stmt {
    Let(String, Expr),
    Assign(Target, Expr),
    If(Expr, Vec<Stmt>, Option<Vec<Stmt>>),
    While(Expr, Vec<Stmt>),
    Expr(Expr),
    /// Final expression of a program with no terminating `;`.
    Tail(Expr),
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum ParseError {
    #[error("unexpected end of input")]
    UnexpectedEof,
    #[error("expected {expected}, found {found} at line {line}, column {column}")]
    Unexpected {
        expected: String,
        found: String,
        line: usize,
        column: usize,
    },
    #[error("invalid assignment target at line {line}, column {column}")]
    InvalidTarget { line: usize, column: usize },
    #[error("nesting deeper than {MAX_DEPTH} levels at line {line}, column {column}")]
    TooDeep { line: usize, column: usize },
}

pub type ParseResult<T> = Result<T, ParseError>;

pub fn parse_program(tokens: &[TokenSpan]) -> ParseResult<Vec<Stmt>> {
    Parser {
        tokens,
        pos: 0,
        depth: 0,
    }
    .program()
}

struct Parser<'a> {
    tokens: &'a [TokenSpan],
    pos: usize,
    depth: usize,
}

impl<'a> Parser<'a> {
    fn peek(&self) -> Option<&'a Token> {
        self.tokens.get(self.pos).map(|span| &span.token)
    }

    fn next(&mut self) -> ParseResult<&'a TokenSpan> {
        let span = self.tokens.get(self.pos).ok_or(ParseError::UnexpectedEof)?;
        self.pos += 1;
        Ok(span)
    }

    fn at_delimiter(&self, delimiter: Delimiter) -> bool {
        self.peek() == Some(&Token::Delimiter(delimiter))
    }

    fn at_operator(&self, operator: Operator) -> bool {
        self.peek() == Some(&Token::Operator(operator))
    }

    fn eat_delimiter(&mut self, delimiter: Delimiter) -> bool {
        let found = self.at_delimiter(delimiter);
        if found {
            self.pos += 1;
        }
        found
    }

    fn unexpected(span: &TokenSpan, expected: impl Into<String>) -> ParseError {
        ParseError::Unexpected {
            expected: expected.into(),
            found: span.token.to_string(),
            line: span.line,
            column: span.column,
        }
    }

    /// Enters one nesting level; callers undo it with [`Parser::ascend`].
    fn descend(&mut self) -> ParseResult<()> {
        self.depth += 1;
        if self.depth <= MAX_DEPTH {
            return Ok(());
        }
        let span = self
            .tokens
            .get(self.pos)
            .or_else(|| self.tokens.last());
        Err(ParseError::TooDeep {
            line: span.map_or(1, |span| span.line),
            column: span.map_or(1, |span| span.column),
        })
    }

    fn ascend(&mut self, levels: usize) {
        self.depth -= levels;
    }

    fn expect_delimiter(&mut self, delimiter: Delimiter) -> ParseResult<()> {
        let span = self.next()?;
        if span.token == Token::Delimiter(delimiter) {
            Ok(())
        } else {
            Err(Self::unexpected(span, format!("`{delimiter}`")))
        }
    }

    fn expect_identifier(&mut self) -> ParseResult<String> {
        let span = self.next()?;
        match &span.token {
            Token::Identifier(name) => Ok(name.clone()),
            _ => Err(Self::unexpected(span, "identifier")),
        }
    }

    fn program(mut self) -> ParseResult<Vec<Stmt>> {
        let mut statements = Vec::new();
        while self.peek().is_some() {
            statements.push(self.statement(true)?);
        }
        Ok(statements)
    }

    fn block(&mut self) -> ParseResult<Vec<Stmt>> {
        self.expect_delimiter(Delimiter::OpenBrace)?;
        self.descend()?;
        let mut statements = Vec::new();
        loop {
            match self.peek() {
                None => return Err(ParseError::UnexpectedEof),
                Some(Token::Delimiter(Delimiter::CloseBrace)) => {
                    self.pos += 1;
                    self.ascend(1);
                    return Ok(statements);
                }
                Some(_) => statements.push(self.statement(false)?),
            }
        }
    }

    /// Consumes a `;`, or accepts its absence before `}` and at end of input.
    /// Returns whether the statement ran to end of input unterminated.
    fn terminator(&mut self) -> ParseResult<bool> {
        match self.peek() {
            None => Ok(true),
            Some(Token::Delimiter(Delimiter::Semicolon)) => {
                self.pos += 1;
                Ok(false)
            }
            Some(Token::Delimiter(Delimiter::CloseBrace)) => Ok(false),
            Some(_) => Err(Self::unexpected(&self.tokens[self.pos], "`;`")),
        }
    }

    fn statement(&mut self, top_level: bool) -> ParseResult<Stmt> {
        match self.peek() {
            Some(Token::Keyword(Keyword::Let)) => {
                self.pos += 1;
                let name = self.expect_identifier()?;
                let span = self.next()?;
                if span.token != Token::Operator(Operator::Assign) {
                    return Err(Self::unexpected(span, "`=`"));
                }
                let value = self.expression()?;
                self.terminator()?;
                Ok(Stmt::Let(name, value))
            }
            Some(Token::Keyword(Keyword::If)) => {
                self.pos += 1;
                self.if_statement()
            }
            Some(Token::Keyword(Keyword::While)) => {
                self.pos += 1;
                let condition = self.expression()?;
                let body = self.block()?;
                Ok(Stmt::While(condition, body))
            }
            // Stray semicolons are empty statements.
            Some(Token::Delimiter(Delimiter::Semicolon)) => {
                self.pos += 1;
                Ok(Stmt::Expr(Expr::Literal(Value::Null)))
            }
            _ => {
                let start = self.pos;
                let expr = self.expression()?;
                if self.at_operator(Operator::Assign) {
                    self.pos += 1;
                    let target = self.assignment_target(expr, start)?;
                    let value = self.expression()?;
                    self.terminator()?;
                    return Ok(Stmt::Assign(target, value));
                }
                let unterminated = self.terminator()?;
                if top_level && unterminated {
                    Ok(Stmt::Tail(expr))
                } else {
                    Ok(Stmt::Expr(expr))
                }
            }
        }
    }

    fn if_statement(&mut self) -> ParseResult<Stmt> {
        let condition = self.expression()?;
        let then_branch = self.block()?;
        if !matches!(self.peek(), Some(Token::Keyword(Keyword::Else))) {
            return Ok(Stmt::If(condition, then_branch, None));
        }
        self.pos += 1;
        let else_branch = if matches!(self.peek(), Some(Token::Keyword(Keyword::If))) {
            self.pos += 1;
            self.descend()?;
            let chained = self.if_statement()?;
            self.ascend(1);
            vec![chained]
        } else {
            self.block()?
        };
        Ok(Stmt::If(condition, then_branch, Some(else_branch)))
    }

    fn assignment_target(&self, expr: Expr, start: usize) -> ParseResult<Target> {
        match expr {
            Expr::Var(name) => Ok(Target::Name(name)),
            Expr::Index(base, index) => match *base {
                Expr::Var(name) => Ok(Target::Index(name, *index)),
                _ => Err(self.invalid_target(start)),
            },
            _ => Err(self.invalid_target(start)),
        }
    }

    fn invalid_target(&self, start: usize) -> ParseError {
        let span = &self.tokens[start];
        ParseError::InvalidTarget {
            line: span.line,
            column: span.column,
        }
    }

    fn expression(&mut self) -> ParseResult<Expr> {
        self.descend()?;
        let expr = self.binary(0)?;
        self.ascend(1);
        Ok(expr)
    }

    fn binary(&mut self, level: usize) -> ParseResult<Expr> {
        const LEVELS: &[&[Operator]] = &[
            &[Operator::Or],
            &[Operator::And],
            &[Operator::EqualEqual, Operator::NotEqual],
            &[
                Operator::Less,
                Operator::LessEqual,
                Operator::Greater,
                Operator::GreaterEqual,
            ],
            &[Operator::Plus, Operator::Minus],
            &[Operator::Multiply, Operator::Divide, Operator::Percent],
        ];

        let Some(operators) = LEVELS.get(level) else {
            return self.unary();
        };

        // Every link of a chain nests the tree built so far one level deeper.
        let mut links = 0;
        let mut lhs = self.binary(level + 1)?;
        while let Some(Token::Operator(op)) = self.peek() {
            if !operators.contains(op) {
                break;
            }
            let op = *op;
            self.pos += 1;
            self.descend()?;
            links += 1;
            let rhs = self.binary(level + 1)?;
            lhs = Expr::Binary(Box::new(lhs), op, Box::new(rhs));
        }
        self.ascend(links);
        Ok(lhs)
    }

    fn unary(&mut self) -> ParseResult<Expr> {
        match self.peek() {
            Some(Token::Operator(op @ (Operator::Minus | Operator::Not))) => {
                let op = *op;
                self.pos += 1;
                self.descend()?;
                let operand = self.unary()?;
                self.ascend(1);
                Ok(Expr::Unary(op, Box::new(operand)))
            }
            _ => self.postfix(),
        }
    }

    fn postfix(&mut self) -> ParseResult<Expr> {
        let mut links = 0;
        let mut expr = self.primary()?;
        loop {
            if self.eat_delimiter(Delimiter::OpenBracket) {
                self.descend()?;
                links += 1;
                let index = self.expression()?;
                self.expect_delimiter(Delimiter::CloseBracket)?;
                expr = Expr::Index(Box::new(expr), Box::new(index));
            } else if self.at_delimiter(Delimiter::OpenParen) {
                let span = &self.tokens[self.pos];
                let Expr::Var(name) = expr else {
                    return Err(Self::unexpected(span, "`;`"));
                };
                self.pos += 1;
                let args = self.comma_separated(Delimiter::CloseParen, Self::expression)?;
                expr = Expr::Call(name, args);
            } else {
                self.ascend(links);
                return Ok(expr);
            }
        }
    }

    fn comma_separated<T>(
        &mut self,
        close: Delimiter,
        mut item: impl FnMut(&mut Self) -> ParseResult<T>,
    ) -> ParseResult<Vec<T>> {
        let mut items = Vec::new();
        if self.eat_delimiter(close) {
            return Ok(items);
        }
        loop {
            items.push(item(self)?);
            if self.eat_delimiter(close) {
                return Ok(items);
            }
            self.expect_delimiter(Delimiter::Comma)?;
            // Trailing comma.
            if self.eat_delimiter(close) {
                return Ok(items);
            }
        }
    }

    fn map_entry(&mut self) -> ParseResult<(Expr, Expr)> {
        let key = self.expression()?;
        self.expect_delimiter(Delimiter::Colon)?;
        let value = self.expression()?;
        Ok((key, value))
    }

    fn primary(&mut self) -> ParseResult<Expr> {
        let span = self.next()?;
        let expr = match &span.token {
            Token::Int(i) => Expr::Literal(Value::Int(*i)),
            Token::Float(x) => Expr::Literal(Value::Float(*x)),
            Token::Str(s) => Expr::Literal(Value::Str(s.clone())),
            Token::Char(c) => Expr::Literal(Value::Char(*c)),
            Token::Keyword(Keyword::True) => Expr::Literal(Value::Bool(true)),
            Token::Keyword(Keyword::False) => Expr::Literal(Value::Bool(false)),
            Token::Keyword(Keyword::Null) => Expr::Literal(Value::Null),
            Token::Identifier(name) => Expr::Var(name.clone()),
            Token::Delimiter(Delimiter::OpenParen) => {
                let inner = self.expression()?;
                self.expect_delimiter(Delimiter::CloseParen)?;
                inner
            }
            Token::Delimiter(Delimiter::OpenBracket) => {
                Expr::List(self.comma_separated(Delimiter::CloseBracket, Self::expression)?)
            }
            Token::Delimiter(Delimiter::MapOpen) => {
                Expr::Map(self.comma_separated(Delimiter::CloseBrace, Self::map_entry)?)
            }
            _ => return Err(Self::unexpected(span, "expression")),
        };
        Ok(expr)
    }
}
