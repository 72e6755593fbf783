//! Condition grammar for `if`/`branches` predicates.
//!
//! A tiny recursive-descent parser, deliberately not a general expression
//! engine — the grammar is small and needs to stay tightly coupled to scope
//! lookup and template expansion. Operands are substituted via the Variable
//! Manager before comparison, so `{{status}} == 200` works the same way path
//! templates do.

use crate::errors::StepwiseError;
use crate::vars::Scope;

#[derive(Debug, Clone)]
enum Expr {
    Or(Box<Expr>, Box<Expr>),
    And(Box<Expr>, Box<Expr>),
    Not(Box<Expr>),
    Compare(String, Op, String),
    Literal(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Op {
    Eq,
    Ne,
    Gt,
    Lt,
    Ge,
    Le,
}

struct Parser<'a> {
    tokens: Vec<&'a str>,
    pos: usize,
}

/// Evaluates `condition` (already containing raw `{{...}}` templates) against
/// `scope`, substituting templates first.
pub fn evaluate(condition: &str, scope: &Scope) -> Result<bool, StepwiseError> {
    let substituted = scope.substitute(condition)?;
    let tokens = tokenize(&substituted);
    let mut parser = Parser { tokens, pos: 0 };
    let expr = parser.or_expr()?;
    if parser.pos != parser.tokens.len() {
        return Err(StepwiseError::SubstitutionError(format!(
            "trailing tokens in condition: {condition}"
        )));
    }
    Ok(eval_expr(&expr))
}

fn tokenize(input: &str) -> Vec<&str> {
    let mut tokens = Vec::new();
    let bytes = input.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        let c = bytes[i] as char;
        if c.is_whitespace() {
            i += 1;
            continue;
        }
        if c == '(' || c == ')' {
            tokens.push(&input[i..i + 1]);
            i += 1;
            continue;
        }
        if c == '\'' || c == '"' {
            let end = input[i + 1..].find(c).map(|o| i + 1 + o).unwrap_or(input.len());
            tokens.push(&input[i..(end + 1).min(input.len())]);
            i = end + 1;
            continue;
        }
        // operators and words run until the next whitespace or paren.
        let start = i;
        while i < bytes.len() {
            let c = bytes[i] as char;
            if c.is_whitespace() || c == '(' || c == ')' {
                break;
            }
            i += 1;
        }
        tokens.push(&input[start..i]);
    }
    tokens
}

impl<'a> Parser<'a> {
    fn peek(&self) -> Option<&'a str> {
        self.tokens.get(self.pos).copied()
    }

    fn advance(&mut self) -> Option<&'a str> {
        let tok = self.peek();
        self.pos += 1;
        tok
    }

    fn or_expr(&mut self) -> Result<Expr, StepwiseError> {
        let mut left = self.and_expr()?;
        while matches!(self.peek(), Some("or") | Some("||")) {
            self.advance();
            let right = self.and_expr()?;
            left = Expr::Or(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn and_expr(&mut self) -> Result<Expr, StepwiseError> {
        let mut left = self.unary()?;
        while matches!(self.peek(), Some("and") | Some("&&")) {
            self.advance();
            let right = self.unary()?;
            left = Expr::And(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn unary(&mut self) -> Result<Expr, StepwiseError> {
        if matches!(self.peek(), Some("!") | Some("not")) {
            self.advance();
            let inner = self.unary()?;
            return Ok(Expr::Not(Box::new(inner)));
        }
        self.atom()
    }

    fn atom(&mut self) -> Result<Expr, StepwiseError> {
        if self.peek() == Some("(") {
            self.advance();
            let inner = self.or_expr()?;
            if self.advance() != Some(")") {
                return Err(StepwiseError::SubstitutionError("unmatched '(' in condition".into()));
            }
            return Ok(inner);
        }

        let lhs = self
            .advance()
            .ok_or_else(|| StepwiseError::SubstitutionError("unexpected end of condition".into()))?;

        if let Some(op) = self.peek().and_then(parse_op) {
            self.advance();
            let rhs = self
                .advance()
                .ok_or_else(|| StepwiseError::SubstitutionError("expected value after operator".into()))?;
            return Ok(Expr::Compare(unquote(lhs), op, unquote(rhs)));
        }

        Ok(Expr::Literal(unquote(lhs)))
    }
}

fn parse_op(tok: &str) -> Option<Op> {
    match tok {
        "==" => Some(Op::Eq),
        "!=" => Some(Op::Ne),
        ">" => Some(Op::Gt),
        "<" => Some(Op::Lt),
        ">=" => Some(Op::Ge),
        "<=" => Some(Op::Le),
        _ => None,
    }
}

fn unquote(s: &str) -> String {
    s.trim_matches('\'').trim_matches('"').to_string()
}

fn eval_expr(expr: &Expr) -> bool {
    match expr {
        Expr::Or(a, b) => eval_expr(a) || eval_expr(b),
        Expr::And(a, b) => eval_expr(a) && eval_expr(b),
        Expr::Not(a) => !eval_expr(a),
        Expr::Literal(s) => is_truthy(s),
        Expr::Compare(lhs, op, rhs) => compare(lhs, *op, rhs),
    }
}

fn is_truthy(s: &str) -> bool {
    !matches!(s, "" | "false" | "0" | "null")
}

fn compare(lhs: &str, op: Op, rhs: &str) -> bool {
    if let (Ok(a), Ok(b)) = (lhs.parse::<f64>(), rhs.parse::<f64>()) {
        return match op {
            Op::Eq => a == b,
            Op::Ne => a != b,
            Op::Gt => a > b,
            Op::Lt => a < b,
            Op::Ge => a >= b,
            Op::Le => a <= b,
        };
    }
    match op {
        Op::Eq => lhs == rhs,
        Op::Ne => lhs != rhs,
        Op::Gt => lhs > rhs,
        Op::Lt => lhs < rhs,
        Op::Ge => lhs >= rhs,
        Op::Le => lhs <= rhs,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Value;

    #[test]
    fn simple_equality() {
        let scope = Scope::new();
        assert!(evaluate("200 == 200", &scope).unwrap());
        assert!(!evaluate("200 == 404", &scope).unwrap());
    }

    #[test]
    fn templated_comparison() {
        let mut scope = Scope::new();
        scope.set("status", Value::from(200));
        assert!(evaluate("{{status}} == 200", &scope).unwrap());
    }

    #[test]
    fn and_or_not_precedence() {
        let scope = Scope::new();
        assert!(evaluate("true and not false", &scope).unwrap());
        assert!(evaluate("false or (true and true)", &scope).unwrap());
        assert!(!evaluate("false and true or false", &scope).unwrap());
    }

    #[test]
    fn numeric_ordering() {
        let scope = Scope::new();
        assert!(evaluate("5 > 3", &scope).unwrap());
        assert!(evaluate("3 <= 3", &scope).unwrap());
    }
}
