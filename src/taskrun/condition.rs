// src/taskrun/condition.rs

//! Tiny expression language for `if` guards and loop break conditions.
//!
//! ```text
//! expr    := and ( "||" and )*
//! and     := cmp ( "&&" cmp )*
//! cmp     := operand ( op operand )?
//! op      := "==" | "!=" | ">" | ">=" | "<" | "<="
//! operand := identifier | 'quoted' | "quoted" | number | true | false
//! ```
//!
//! Identifiers: `task_status`, `pipeline_status`, `looped_times` and
//! `outputs.<key>`. Unknown identifiers and unknown outputs evaluate to the
//! empty string. Numbers compare numerically, everything else as strings
//! (case-insensitive equality).

use std::collections::BTreeMap;
use std::sync::LazyLock;

use regex::Regex;

use crate::errors::{EngineError, Result};
use crate::model::Status;

static TOKEN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"\s*(\|\||&&|==|!=|>=|<=|>|<|'[^']*'|"[^"]*"|[A-Za-z0-9_.\-]+)"#)
        .expect("valid token regex")
});

/// Values an expression can see.
#[derive(Debug, Clone)]
pub struct EvalContext {
    pub task_status: Status,
    pub pipeline_status: Status,
    pub looped_times: u64,
    pub outputs: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Op {
    Eq,
    Ne,
    Gt,
    Ge,
    Lt,
    Le,
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Or,
    And,
    Cmp(Op),
    Literal(String),
    Ident(String),
}

/// Evaluate `expr` against `ctx`.
pub fn evaluate(expr: &str, ctx: &EvalContext) -> Result<bool> {
    let tokens = tokenize(expr)?;
    if tokens.is_empty() {
        return Err(invalid(expr, "empty expression"));
    }

    let mut any = false;
    for clause in tokens.split(|t| *t == Token::Or) {
        let mut all = true;
        for cmp in clause.split(|t| *t == Token::And) {
            all &= eval_cmp(expr, cmp, ctx)?;
        }
        any |= all;
    }
    Ok(any)
}

fn tokenize(expr: &str) -> Result<Vec<Token>> {
    let mut tokens = Vec::new();
    let mut pos = 0;
    while pos < expr.len() {
        let rest = &expr[pos..];
        if rest.trim().is_empty() {
            break;
        }
        let caps = TOKEN
            .captures(rest)
            .filter(|c| c.get(0).is_some_and(|m| m.start() == 0))
            .ok_or_else(|| invalid(expr, &format!("unexpected input at '{}'", rest.trim())))?;
        let whole = caps.get(0).map_or(0, |m| m.end());
        let raw = &caps[1];
        tokens.push(match raw {
            "||" => Token::Or,
            "&&" => Token::And,
            "==" => Token::Cmp(Op::Eq),
            "!=" => Token::Cmp(Op::Ne),
            ">=" => Token::Cmp(Op::Ge),
            "<=" => Token::Cmp(Op::Le),
            ">" => Token::Cmp(Op::Gt),
            "<" => Token::Cmp(Op::Lt),
            quoted if quoted.starts_with('\'') || quoted.starts_with('"') => {
                Token::Literal(quoted[1..quoted.len() - 1].to_string())
            }
            word if word.starts_with(|c: char| c.is_ascii_digit() || c == '-') => {
                Token::Literal(word.to_string())
            }
            word => Token::Ident(word.to_string()),
        });
        pos += whole;
    }
    Ok(tokens)
}

fn eval_cmp(expr: &str, tokens: &[Token], ctx: &EvalContext) -> Result<bool> {
    match tokens {
        [single] => {
            let value = resolve(single, ctx);
            Ok(!value.is_empty() && !value.eq_ignore_ascii_case("false"))
        }
        [lhs, Token::Cmp(op), rhs] => Ok(compare(&resolve(lhs, ctx), *op, &resolve(rhs, ctx))),
        _ => Err(invalid(expr, "expected `operand` or `operand op operand`")),
    }
}

fn resolve(token: &Token, ctx: &EvalContext) -> String {
    match token {
        Token::Literal(s) => s.clone(),
        Token::Ident(name) => match name.as_str() {
            "true" | "false" => name.clone(),
            "task_status" => ctx.task_status.to_string(),
            "pipeline_status" => ctx.pipeline_status.to_string(),
            "looped_times" => ctx.looped_times.to_string(),
            other => other
                .strip_prefix("outputs.")
                .and_then(|key| ctx.outputs.get(key))
                .cloned()
                .unwrap_or_default(),
        },
        _ => String::new(),
    }
}

fn compare(lhs: &str, op: Op, rhs: &str) -> bool {
    if let (Ok(a), Ok(b)) = (lhs.trim().parse::<f64>(), rhs.trim().parse::<f64>()) {
        return match op {
            Op::Eq => a == b,
            Op::Ne => a != b,
            Op::Gt => a > b,
            Op::Ge => a >= b,
            Op::Lt => a < b,
            Op::Le => a <= b,
        };
    }
    match op {
        Op::Eq => lhs.eq_ignore_ascii_case(rhs),
        Op::Ne => !lhs.eq_ignore_ascii_case(rhs),
        Op::Gt => lhs > rhs,
        Op::Ge => lhs >= rhs,
        Op::Lt => lhs < rhs,
        Op::Le => lhs <= rhs,
    }
}

fn invalid(expr: &str, reason: &str) -> EngineError {
    EngineError::User(format!("invalid expression '{expr}': {reason}"))
}
