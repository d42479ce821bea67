//! S-expression reader shared by the grammar tables and the mini-IR
//! templates. Atoms are split on whitespace at paren depth zero; the special
//! atoms `(lparen)` and `(rparen)` stand for the literal parentheses so that
//! grammars can still talk about them.

use std::{error::Error, fmt::Display};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Sexpr {
    Atom(String),
    List(Vec<Sexpr>),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SexprError(pub String);

pub type SexprResult<T> = Result<T, SexprError>;

impl Display for SexprError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.0.as_str())
    }
}

impl Error for SexprError {}

pub fn parse_sexpr(input: &str) -> SexprResult<Sexpr> {
    let input = input.trim();
    if input == "(lparen)" {
        return Ok(Sexpr::List(vec![
            Sexpr::Atom("str".into()),
            Sexpr::Atom("(".into()),
        ]));
    }
    if input == "(rparen)" {
        return Ok(Sexpr::List(vec![
            Sexpr::Atom("str".into()),
            Sexpr::Atom(")".into()),
        ]));
    }
    if !(input.starts_with('(') && input.ends_with(')')) {
        if input.is_empty() {
            return Err(SexprError("empty expression".into()));
        }
        return Ok(Sexpr::Atom(input.to_string()));
    }

    let mut rest = &input[1..input.len() - 1];
    let mut items = vec![];
    while !rest.is_empty() {
        let mut depth = 0i32;
        let mut arg_len = rest.len();
        for (i, c) in rest.char_indices() {
            match c {
                '(' => depth += 1,
                ')' => depth -= 1,
                ' ' | '\n' | '\t' if depth == 0 => {
                    arg_len = i;
                    break;
                }
                _ => {}
            }
        }
        if depth > 0 {
            return Err(SexprError(format!("unbalanced parens in {input:?}")));
        }
        items.push(parse_sexpr(&rest[..arg_len])?);
        rest = rest[arg_len..].trim_start();
    }

    Ok(Sexpr::List(items))
}

/// Parse a *sequence* of expressions, i.e. a rule body like
/// `"(str if) (balanced) (: Body)"`.
pub fn parse_sexpr_seq(input: &str) -> SexprResult<Vec<Sexpr>> {
    match parse_sexpr(&format!("({input})"))? {
        Sexpr::List(items) => Ok(items),
        Sexpr::Atom(_) => Err(SexprError("expected a sequence".into())),
    }
}
