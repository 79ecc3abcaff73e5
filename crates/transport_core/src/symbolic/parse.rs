//! Text parser for model formulas.
//!
//! Grammar, loosest first:
//!
//! ```text
//! expr    := term (('+' | '-') term)*
//! term    := unary (('*' | '/') unary)*
//! unary   := '-' unary | power
//! power   := primary ('^' unary)?          (right associative)
//! primary := number | ident | ident '(' args ')' | '(' expr ')'
//! args    := expr (',' expr)*
//! ```

use super::expr::{Expr, Function};
use crate::error::ParseError;

/// Deepest nesting of parentheses, calls, unary minus and exponents accepted.
pub const MAX_DEPTH: usize = 256;

/// Parsed formula before identifiers are given meaning.
#[derive(Debug, Clone, PartialEq)]
pub enum Ast {
    Number(f64),
    Identifier(String),
    Binary(Box<Ast>, char, Box<Ast>), // + - * / ^
    Unary(char, Box<Ast>),            // -
    Call(String, Vec<Ast>),
}

/// Decides what identifiers and non-builtin calls mean during lowering.
pub trait Resolver {
    type Error: From<ParseError>;

    fn identifier(&mut self, name: &str) -> Result<Expr, Self::Error>;

    fn call(&mut self, name: &str, args: &[Ast]) -> Result<Expr, Self::Error>;
}

impl Ast {
    pub fn lower<R: Resolver>(&self, resolver: &mut R) -> Result<Expr, R::Error> {
        Ok(match self {
            Ast::Number(n) => Expr::num(*n),
            Ast::Identifier(name) => resolver.identifier(name)?,
            Ast::Binary(left, op, right) => {
                let l = left.lower(resolver)?;
                let r = right.lower(resolver)?;
                match op {
                    '+' => l + r,
                    '-' => l - r,
                    '*' => l * r,
                    '/' => l / r,
                    '^' => Expr::pow(l, r),
                    _ => return Err(ParseError::new(format!("Unknown binary operator: {}", op), 0).into()),
                }
            }
            Ast::Unary(op, operand) => match op {
                '-' => -operand.lower(resolver)?,
                _ => return Err(ParseError::new(format!("Unknown unary operator: {}", op), 0).into()),
            },
            Ast::Call(name, args) => match Function::from_name(name) {
                Some(function) if args.len() == 1 => Expr::func(function, args[0].lower(resolver)?),
                Some(_) => {
                    return Err(ParseError::new(
                        format!("Function '{}' takes one argument, got {}", name, args.len()),
                        0,
                    )
                    .into())
                }
                None => resolver.call(name, args)?,
            },
        })
    }

    /// Every call name appearing in the tree, in order of appearance.
    pub fn call_names(&self) -> Vec<String> {
        let mut out = Vec::new();
        self.collect_calls(&mut out);
        out
    }

    fn collect_calls(&self, out: &mut Vec<String>) {
        match self {
            Ast::Number(_) | Ast::Identifier(_) => {}
            Ast::Binary(l, _, r) => {
                l.collect_calls(out);
                r.collect_calls(out);
            }
            Ast::Unary(_, a) => a.collect_calls(out),
            Ast::Call(name, args) => {
                if Function::from_name(name).is_none() && !out.contains(name) {
                    out.push(name.clone());
                }
                for a in args {
                    a.collect_calls(out);
                }
            }
        }
    }
}

/// Parses a string expression into an AST.
pub fn parse(input: &str) -> Result<Ast, ParseError> {
    let tokens = tokenize(input)?;
    let mut parser = Parser {
        tokens,
        pos: 0,
        end: input.len(),
        depth: 0,
    };
    let ast = parser.parse_expression()?;
    match parser.peek() {
        None => Ok(ast),
        Some(_) => Err(ParseError::new("Unexpected trailing input", parser.offset())),
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Number(f64),
    Identifier(String),
    Plus,
    Minus,
    Star,
    Slash,
    Caret,
    LParen,
    RParen,
    Comma,
}

fn tokenize(input: &str) -> Result<Vec<(Token, usize)>, ParseError> {
    let mut tokens = Vec::new();
    let mut chars = input.char_indices().peekable();

    while let Some(&(start, c)) = chars.peek() {
        if c.is_whitespace() {
            chars.next();
        } else if c.is_ascii_digit() || c == '.' {
            let mut num_str = String::new();
            let mut seen_exponent = false;
            while let Some(&(_, d)) = chars.peek() {
                let exponent_sign =
                    seen_exponent && (d == '+' || d == '-') && num_str.ends_with(|ch: char| ch == 'e' || ch == 'E');
                if d.is_ascii_digit() || d == '.' || exponent_sign {
                    num_str.push(d);
                    chars.next();
                } else if (d == 'e' || d == 'E') && !seen_exponent {
                    seen_exponent = true;
                    num_str.push(d);
                    chars.next();
                } else {
                    break;
                }
            }
            let value = num_str
                .parse()
                .map_err(|_| ParseError::new(format!("Invalid number '{}'", num_str), start))?;
            tokens.push((Token::Number(value), start));
        } else if c.is_alphabetic() || c == '_' {
            let mut ident = String::new();
            while let Some(&(_, d)) = chars.peek() {
                if d.is_alphanumeric() || d == '_' {
                    ident.push(d);
                    chars.next();
                } else {
                    break;
                }
            }
            tokens.push((Token::Identifier(ident), start));
        } else {
            let token = match c {
                '+' => Token::Plus,
                '-' => Token::Minus,
                '*' => Token::Star,
                '/' => Token::Slash,
                '^' => Token::Caret,
                '(' => Token::LParen,
                ')' => Token::RParen,
                ',' => Token::Comma,
                other => {
                    return Err(ParseError::new(format!("Unexpected character '{}'", other), start))
                }
            };
            tokens.push((token, start));
            chars.next();
        }
    }
    Ok(tokens)
}

struct Parser {
    tokens: Vec<(Token, usize)>,
    pos: usize,
    end: usize,
    depth: usize,
}

impl Parser {
    fn peek(&self) -> Option<Token> {
        self.tokens.get(self.pos).map(|(t, _)| t.clone())
    }

    fn offset(&self) -> usize {
        self.tokens.get(self.pos).map(|(_, o)| *o).unwrap_or(self.end)
    }

    fn consume(&mut self) -> Option<Token> {
        let token = self.peek();
        if token.is_some() {
            self.pos += 1;
        }
        token
    }

    fn expect_rparen(&mut self) -> Result<(), ParseError> {
        let offset = self.offset();
        match self.consume() {
            Some(Token::RParen) => Ok(()),
            _ => Err(ParseError::new("Expected ')'", offset)),
        }
    }

    fn parse_expression(&mut self) -> Result<Ast, ParseError> {
        let mut left = self.parse_term()?;

        while let Some(token) = self.peek() {
            let op = match token {
                Token::Plus => '+',
                Token::Minus => '-',
                _ => break,
            };
            self.consume();
            let right = self.parse_term()?;
            left = Ast::Binary(Box::new(left), op, Box::new(right));
        }
        Ok(left)
    }

    fn parse_term(&mut self) -> Result<Ast, ParseError> {
        let mut left = self.parse_unary()?;

        while let Some(token) = self.peek() {
            let op = match token {
                Token::Star => '*',
                Token::Slash => '/',
                _ => break,
            };
            self.consume();
            let right = self.parse_unary()?;
            left = Ast::Binary(Box::new(left), op, Box::new(right));
        }
        Ok(left)
    }

    /// Every nested construct passes through here, so the depth bound is
    /// kept in one place.
    fn parse_unary(&mut self) -> Result<Ast, ParseError> {
        if self.depth == MAX_DEPTH {
            return Err(ParseError::new(
                format!("Formula nested deeper than {} levels", MAX_DEPTH),
                self.offset(),
            ));
        }
        self.depth += 1;
        let result = self.parse_signed();
        self.depth -= 1;
        result
    }

    fn parse_signed(&mut self) -> Result<Ast, ParseError> {
        if let Some(Token::Minus) = self.peek() {
            self.consume();
            let expr = self.parse_unary()?;
            return Ok(Ast::Unary('-', Box::new(expr)));
        }
        self.parse_power()
    }

    fn parse_power(&mut self) -> Result<Ast, ParseError> {
        let base = self.parse_primary()?;
        if let Some(Token::Caret) = self.peek() {
            self.consume();
            let exponent = self.parse_unary()?;
            return Ok(Ast::Binary(Box::new(base), '^', Box::new(exponent)));
        }
        Ok(base)
    }

    fn parse_primary(&mut self) -> Result<Ast, ParseError> {
        let offset = self.offset();
        match self.consume() {
            Some(Token::Number(n)) => Ok(Ast::Number(n)),
            Some(Token::Identifier(name)) => {
                if let Some(Token::LParen) = self.peek() {
                    self.consume(); // eat '('
                    let mut args = Vec::new();
                    if let Some(Token::RParen) = self.peek() {
                        self.consume();
                        return Ok(Ast::Call(name, args));
                    }
                    loop {
                        args.push(self.parse_expression()?);
                        match self.peek() {
                            Some(Token::Comma) => {
                                self.consume();
                            }
                            _ => break,
                        }
                    }
                    self.expect_rparen()?;
                    Ok(Ast::Call(name, args))
                } else {
                    Ok(Ast::Identifier(name))
                }
            }
            Some(Token::LParen) => {
                let expr = self.parse_expression()?;
                self.expect_rparen()?;
                Ok(expr)
            }
            Some(_) => Err(ParseError::new("Unexpected token", offset)),
            None => Err(ParseError::new("Unexpected end of input", offset)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use test_log::test;

    struct Symbols(HashSet<String>);

    impl Resolver for Symbols {
        type Error = ParseError;

        fn identifier(&mut self, name: &str) -> Result<Expr, ParseError> {
            if self.0.contains(name) {
                Ok(Expr::symbol(name))
            } else {
                Err(ParseError::new(format!("Unknown symbol {}", name), 0))
            }
        }

        fn call(&mut self, name: &str, _args: &[Ast]) -> Result<Expr, ParseError> {
            Err(ParseError::new(format!("Unknown function {}", name), 0))
        }
    }

    fn lower(input: &str) -> Expr {
        let mut symbols = Symbols(["x", "y", "m"].iter().map(|s| s.to_string()).collect());
        parse(input)
            .expect("input should parse")
            .lower(&mut symbols)
            .expect("input should lower")
    }

    #[test]
    fn precedence_and_associativity() {
        let x = Expr::symbol("x");
        assert_eq!(lower("-x^2"), -x.clone().square());
        assert_eq!(lower("2^3^2"), Expr::num(512.0));
        assert_eq!(lower("1 - 2 - 3"), Expr::num(-4.0));
        assert_eq!(lower("x*2/4"), Expr::num(0.5) * x);
    }

    #[test]
    fn scientific_numbers() {
        assert_eq!(lower("1.5e2"), Expr::num(150.0));
        assert_eq!(lower("2E-1*10"), Expr::num(2.0));
    }

    #[test]
    fn calls_with_many_arguments() {
        let ast = parse("ddV(a, b) + f(1)").expect("parses");
        assert_eq!(ast.call_names(), vec!["ddV".to_string(), "f".to_string()]);
        match ast {
            Ast::Binary(left, '+', _) => match *left {
                Ast::Call(ref name, ref args) => {
                    assert_eq!(name, "ddV");
                    assert_eq!(args.len(), 2);
                }
                other => panic!("unexpected node {other:?}"),
            },
            other => panic!("unexpected node {other:?}"),
        }
    }

    #[test]
    fn builtin_functions_lower() {
        let e = lower("exp(-x) * sin(y)");
        assert!(e.to_string().contains("exp"));
        assert!(e.to_string().contains("sin"));
    }

    #[test]
    fn errors_carry_offsets() {
        let err = parse("x + (y").expect_err("unbalanced");
        assert_eq!(err.offset, 6);
        let err = parse("x $ y").expect_err("bad character");
        assert_eq!(err.offset, 2);
        assert!(parse("x y").is_err());
    }

    #[test]
    fn nesting_is_bounded() {
        let deep = format!("{}x{}", "(".repeat(10_000), ")".repeat(10_000));
        let err = parse(&deep).expect_err("too deep");
        assert!(err.message.contains("nested"), "unexpected error {err}");
        assert!(parse(&format!("{}x", "-".repeat(10_000))).is_err());
        assert!(parse(&format!("{}x", "x^".repeat(10_000))).is_err());

        let shallow = format!("{}x{}", "(".repeat(100), ")".repeat(100));
        assert_eq!(lower(&shallow), Expr::symbol("x"));
    }

    #[test]
    fn unknown_symbol_fails_lowering() {
        let mut symbols = Symbols(HashSet::new());
        let ast = parse("q").expect("parses");
        assert!(ast.lower(&mut symbols).is_err());
    }
}
