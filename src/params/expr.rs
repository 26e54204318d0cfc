//! Small recursive-descent parser and evaluator for parameter
//! expressions: identifiers, numeric literals, `+ - * / ^` and unary
//! minus. An `Expr` is parsed once at setup and then either
//! pre-evaluated to a dense tensor or walked a handful of times during
//! sampling, not re-parsed on the hot path.

use std::collections::HashMap;

use thiserror::Error;

#[derive(Error, Debug, PartialEq)]
pub enum ExprError {
    #[error("unexpected character '{0}' in expression")]
    UnexpectedChar(char),

    #[error("unexpected end of expression")]
    UnexpectedEnd,

    #[error("expected token '{0}'")]
    Expected(String),

    #[error("undefined symbol '{0}'")]
    UndefinedSymbol(String),

    #[error("cyclic dependency involving '{0}'")]
    Cycle(String),
}

#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Num(f64),
    Var(String),
    Neg(Box<Expr>),
    Add(Box<Expr>, Box<Expr>),
    Sub(Box<Expr>, Box<Expr>),
    Mul(Box<Expr>, Box<Expr>),
    Div(Box<Expr>, Box<Expr>),
    Pow(Box<Expr>, Box<Expr>),
}

impl Expr {
    pub fn parse(input: &str) -> Result<Expr, ExprError> {
        let tokens = tokenize(input)?;
        let mut parser = Parser { tokens, pos: 0 };
        let expr = parser.parse_expr()?;
        if parser.pos != parser.tokens.len() {
            return Err(ExprError::Expected("end of expression".to_string()));
        }
        Ok(expr)
    }

    /// Names of all identifiers referenced by this expression.
    pub fn symbols(&self, out: &mut Vec<String>) {
        match self {
            Expr::Num(_) => {}
            Expr::Var(name) => out.push(name.clone()),
            Expr::Neg(a) => a.symbols(out),
            Expr::Add(a, b) | Expr::Sub(a, b) | Expr::Mul(a, b) | Expr::Div(a, b) | Expr::Pow(a, b) => {
                a.symbols(out);
                b.symbols(out);
            }
        }
    }

    /// Evaluate against a fully resolved symbol table (IEEE double
    /// arithmetic throughout).
    pub fn eval(&self, env: &HashMap<String, f64>) -> Result<f64, ExprError> {
        match self {
            Expr::Num(n) => Ok(*n),
            Expr::Var(name) => env
                .get(name)
                .copied()
                .ok_or_else(|| ExprError::UndefinedSymbol(name.clone())),
            Expr::Neg(a) => Ok(-a.eval(env)?),
            Expr::Add(a, b) => Ok(a.eval(env)? + b.eval(env)?),
            Expr::Sub(a, b) => Ok(a.eval(env)? - b.eval(env)?),
            Expr::Mul(a, b) => Ok(a.eval(env)? * b.eval(env)?),
            Expr::Div(a, b) => Ok(a.eval(env)? / b.eval(env)?),
            Expr::Pow(a, b) => Ok(a.eval(env)?.powf(b.eval(env)?)),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Num(f64),
    Ident(String),
    Plus,
    Minus,
    Star,
    Slash,
    Caret,
    LParen,
    RParen,
}

fn tokenize(input: &str) -> Result<Vec<Token>, ExprError> {
    let mut tokens = Vec::new();
    let chars: Vec<char> = input.chars().collect();
    let mut i = 0;
    while i < chars.len() {
        let c = chars[i];
        match c {
            ' ' | '\t' | '\n' => i += 1,
            '+' => {
                tokens.push(Token::Plus);
                i += 1;
            }
            '-' => {
                tokens.push(Token::Minus);
                i += 1;
            }
            '*' => {
                tokens.push(Token::Star);
                i += 1;
            }
            '/' => {
                tokens.push(Token::Slash);
                i += 1;
            }
            '^' => {
                tokens.push(Token::Caret);
                i += 1;
            }
            '(' => {
                tokens.push(Token::LParen);
                i += 1;
            }
            ')' => {
                tokens.push(Token::RParen);
                i += 1;
            }
            c if c.is_ascii_digit() || c == '.' => {
                let start = i;
                while i < chars.len() && (chars[i].is_ascii_digit() || chars[i] == '.' || chars[i] == 'e' || chars[i] == 'E') {
                    i += 1;
                }
                let text: String = chars[start..i].iter().collect();
                let value = text.parse::<f64>().map_err(|_| ExprError::UnexpectedChar(c))?;
                tokens.push(Token::Num(value));
            }
            c if c.is_alphabetic() || c == '_' => {
                let start = i;
                while i < chars.len() && (chars[i].is_alphanumeric() || chars[i] == '_') {
                    i += 1;
                }
                let text: String = chars[start..i].iter().collect();
                tokens.push(Token::Ident(text));
            }
            other => return Err(ExprError::UnexpectedChar(other)),
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

    fn advance(&mut self) -> Option<Token> {
        let tok = self.tokens.get(self.pos).cloned();
        self.pos += 1;
        tok
    }

    // expr := term (('+' | '-') term)*
    fn parse_expr(&mut self) -> Result<Expr, ExprError> {
        let mut left = self.parse_term()?;
        loop {
            match self.peek() {
                Some(Token::Plus) => {
                    self.advance();
                    let right = self.parse_term()?;
                    left = Expr::Add(Box::new(left), Box::new(right));
                }
                Some(Token::Minus) => {
                    self.advance();
                    let right = self.parse_term()?;
                    left = Expr::Sub(Box::new(left), Box::new(right));
                }
                _ => break,
            }
        }
        Ok(left)
    }

    // term := power (('*' | '/') power)*
    fn parse_term(&mut self) -> Result<Expr, ExprError> {
        let mut left = self.parse_power()?;
        loop {
            match self.peek() {
                Some(Token::Star) => {
                    self.advance();
                    let right = self.parse_power()?;
                    left = Expr::Mul(Box::new(left), Box::new(right));
                }
                Some(Token::Slash) => {
                    self.advance();
                    let right = self.parse_power()?;
                    left = Expr::Div(Box::new(left), Box::new(right));
                }
                _ => break,
            }
        }
        Ok(left)
    }

    // power := unary ('^' power)?      -- right-associative
    fn parse_power(&mut self) -> Result<Expr, ExprError> {
        let base = self.parse_unary()?;
        if matches!(self.peek(), Some(Token::Caret)) {
            self.advance();
            let exp = self.parse_power()?;
            return Ok(Expr::Pow(Box::new(base), Box::new(exp)));
        }
        Ok(base)
    }

    // unary := '-' unary | atom
    fn parse_unary(&mut self) -> Result<Expr, ExprError> {
        if matches!(self.peek(), Some(Token::Minus)) {
            self.advance();
            let inner = self.parse_unary()?;
            return Ok(Expr::Neg(Box::new(inner)));
        }
        self.parse_atom()
    }

    // atom := NUM | IDENT | '(' expr ')'
    fn parse_atom(&mut self) -> Result<Expr, ExprError> {
        match self.advance() {
            Some(Token::Num(n)) => Ok(Expr::Num(n)),
            Some(Token::Ident(name)) => Ok(Expr::Var(name)),
            Some(Token::LParen) => {
                let inner = self.parse_expr()?;
                match self.advance() {
                    Some(Token::RParen) => Ok(inner),
                    _ => Err(ExprError::Expected(")".to_string())),
                }
            }
            Some(_) => Err(ExprError::Expected("value".to_string())),
            None => Err(ExprError::UnexpectedEnd),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn env(pairs: &[(&str, f64)]) -> HashMap<String, f64> {
        pairs.iter().map(|(k, v)| (k.to_string(), *v)).collect()
    }

    #[test]
    fn parses_and_evaluates_arithmetic() {
        let expr = Expr::parse("2 + 3 * 4").unwrap();
        assert_eq!(expr.eval(&env(&[])).unwrap(), 14.0);
    }

    #[test]
    fn respects_parens_and_power() {
        let expr = Expr::parse("(1 + 1) ^ 3").unwrap();
        assert_eq!(expr.eval(&env(&[])).unwrap(), 8.0);
    }

    #[test]
    fn resolves_identifiers() {
        let expr = Expr::parse("R0 / gamma").unwrap();
        assert_eq!(expr.eval(&env(&[("R0", 2.5), ("gamma", 0.5)])).unwrap(), 5.0);
    }

    #[test]
    fn unary_minus_binds_tightly() {
        let expr = Expr::parse("-R0 + 1").unwrap();
        assert_eq!(expr.eval(&env(&[("R0", 2.0)])).unwrap(), -1.0);
    }

    #[test]
    fn undefined_symbol_is_an_error() {
        let expr = Expr::parse("x + 1").unwrap();
        assert_eq!(expr.eval(&env(&[])).unwrap_err(), ExprError::UndefinedSymbol("x".to_string()));
    }

    #[test]
    fn symbols_collects_all_identifiers() {
        let expr = Expr::parse("a * b + c").unwrap();
        let mut syms = Vec::new();
        expr.symbols(&mut syms);
        syms.sort();
        assert_eq!(syms, vec!["a".to_string(), "b".to_string(), "c".to_string()]);
    }
}
