// SPDX-License-Identifier: MIT

//! Condition parser
//!
//! Grammar, lowest precedence first:
//!
//! ```text
//! or      := and ("or" and)*
//! and     := unary ("and" unary)*
//! unary   := "not" unary | primary
//! primary := "(" or ")" | "true" | "false" | path (op literal)?
//! op      := "==" | "!=" | ">" | ">=" | "<" | "<=" | "contains"
//! literal := 'string' | "string" | number | true | false | null
//! ```

use thiserror::Error;

use super::ast::{CompareOp, Expression, Literal};

#[derive(Debug, Error, PartialEq)]
pub enum ConditionError {
    #[error("Unexpected character '{ch}' at offset {offset}")]
    UnexpectedChar { ch: char, offset: usize },

    #[error("Unterminated string starting at offset {0}")]
    UnterminatedString(usize),

    #[error("Expected {expected}, found {found}")]
    Unexpected { expected: String, found: String },

    #[error("Empty condition")]
    Empty,
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Ident(String),
    Str(String),
    Num(f64),
    Op(CompareOp),
    LParen,
    RParen,
}

impl Token {
    fn describe(&self) -> String {
        match self {
            Token::Ident(s) => format!("'{}'", s),
            Token::Str(s) => format!("string '{}'", s),
            Token::Num(n) => format!("number {}", n),
            Token::Op(op) => format!("'{}'", op),
            Token::LParen => "'('".to_string(),
            Token::RParen => "')'".to_string(),
        }
    }

    fn is_keyword(&self, word: &str) -> bool {
        matches!(self, Token::Ident(s) if s == word)
    }
}

fn tokenize(input: &str) -> Result<Vec<Token>, ConditionError> {
    let chars: Vec<(usize, char)> = input.char_indices().collect();
    let mut tokens = Vec::new();
    let mut i = 0;

    while i < chars.len() {
        let (offset, c) = chars[i];
        match c {
            c if c.is_whitespace() => i += 1,
            '(' => {
                tokens.push(Token::LParen);
                i += 1;
            }
            ')' => {
                tokens.push(Token::RParen);
                i += 1;
            }
            '\'' | '"' => {
                let quote = c;
                let mut j = i + 1;
                let mut text = String::new();
                while j < chars.len() && chars[j].1 != quote {
                    text.push(chars[j].1);
                    j += 1;
                }
                if j >= chars.len() {
                    return Err(ConditionError::UnterminatedString(offset));
                }
                tokens.push(Token::Str(text));
                i = j + 1;
            }
            '=' | '!' | '<' | '>' => {
                let next = chars.get(i + 1).map(|(_, c)| *c);
                let (op, width) = match (c, next) {
                    ('=', Some('=')) => (CompareOp::Eq, 2),
                    ('!', Some('=')) => (CompareOp::NotEq, 2),
                    ('>', Some('=')) => (CompareOp::Gte, 2),
                    ('<', Some('=')) => (CompareOp::Lte, 2),
                    ('>', _) => (CompareOp::Gt, 1),
                    ('<', _) => (CompareOp::Lt, 1),
                    _ => return Err(ConditionError::UnexpectedChar { ch: c, offset }),
                };
                tokens.push(Token::Op(op));
                i += width;
            }
            c if c.is_ascii_digit() || c == '-' => {
                let mut j = i + 1;
                while j < chars.len() && (chars[j].1.is_ascii_digit() || chars[j].1 == '.') {
                    j += 1;
                }
                let end = chars.get(j).map(|(o, _)| *o).unwrap_or(input.len());
                let text = &input[offset..end];
                let n = text
                    .parse::<f64>()
                    .map_err(|_| ConditionError::UnexpectedChar { ch: c, offset })?;
                tokens.push(Token::Num(n));
                i = j;
            }
            c if c.is_alphanumeric() || c == '_' => {
                let mut j = i + 1;
                while j < chars.len()
                    && (chars[j].1.is_alphanumeric() || matches!(chars[j].1, '_' | '.'))
                {
                    j += 1;
                }
                let end = chars.get(j).map(|(o, _)| *o).unwrap_or(input.len());
                let word = &input[offset..end];
                if word == "contains" {
                    tokens.push(Token::Op(CompareOp::Contains));
                } else {
                    tokens.push(Token::Ident(word.to_string()));
                }
                i = j;
            }
            _ => return Err(ConditionError::UnexpectedChar { ch: c, offset }),
        }
    }

    Ok(tokens)
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn next(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).cloned();
        self.pos += 1;
        token
    }

    fn eat_keyword(&mut self, word: &str) -> bool {
        if self.peek().is_some_and(|t| t.is_keyword(word)) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn unexpected(expected: &str, found: Option<&Token>) -> ConditionError {
        ConditionError::Unexpected {
            expected: expected.to_string(),
            found: found
                .map(Token::describe)
                .unwrap_or_else(|| "end of input".to_string()),
        }
    }

    fn or(&mut self) -> Result<Expression, ConditionError> {
        let mut left = self.and()?;
        while self.eat_keyword("or") {
            let right = self.and()?;
            left = Expression::Or(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn and(&mut self) -> Result<Expression, ConditionError> {
        let mut left = self.unary()?;
        while self.eat_keyword("and") {
            let right = self.unary()?;
            left = Expression::And(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn unary(&mut self) -> Result<Expression, ConditionError> {
        if self.eat_keyword("not") {
            return Ok(Expression::Not(Box::new(self.unary()?)));
        }
        self.primary()
    }

    fn primary(&mut self) -> Result<Expression, ConditionError> {
        match self.next() {
            Some(Token::LParen) => {
                let inner = self.or()?;
                match self.next() {
                    Some(Token::RParen) => Ok(inner),
                    other => Err(Self::unexpected("')'", other.as_ref())),
                }
            }
            Some(Token::Ident(word)) => match word.as_str() {
                "true" => Ok(Expression::True),
                "false" => Ok(Expression::False),
                "and" | "or" | "null" => Err(Self::unexpected(
                    "a field path",
                    Some(&Token::Ident(word.clone())),
                )),
                _ => self.comparison(word),
            },
            other => Err(Self::unexpected("a condition", other.as_ref())),
        }
    }

    fn comparison(&mut self, path: String) -> Result<Expression, ConditionError> {
        let op = match self.peek() {
            Some(Token::Op(op)) => *op,
            _ => return Ok(Expression::Truthy(path)),
        };
        self.pos += 1;
        let value = self.literal()?;
        Ok(Expression::Compare { path, op, value })
    }

    fn literal(&mut self) -> Result<Literal, ConditionError> {
        match self.next() {
            Some(Token::Str(s)) => Ok(Literal::String(s)),
            Some(Token::Num(n)) => Ok(Literal::Number(n)),
            Some(Token::Ident(word)) if word == "true" => Ok(Literal::Boolean(true)),
            Some(Token::Ident(word)) if word == "false" => Ok(Literal::Boolean(false)),
            Some(Token::Ident(word)) if word == "null" => Ok(Literal::Null),
            other => Err(Self::unexpected("a literal", other.as_ref())),
        }
    }
}

/// Parse a condition expression string into an AST
pub fn parse(input: &str) -> Result<Expression, ConditionError> {
    let tokens = tokenize(input)?;
    if tokens.is_empty() {
        return Err(ConditionError::Empty);
    }

    let mut parser = Parser { tokens, pos: 0 };
    let expr = parser.or()?;
    match parser.peek() {
        None => Ok(expr),
        Some(token) => Err(Parser::unexpected("end of input", Some(token))),
    }
}
