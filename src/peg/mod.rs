//! # PEG Module
//!
//! A small parsing-expression-grammar engine over lexeme slices. Rules are
//! written as S-expressions and compiled into [`GrammarExpr`] values once.
//! Besides the usual combinators it has two unusual ones that make parsing
//! fragments with unparsed holes possible: `balanced` consumes a matched
//! parenthesis group as a unit, and `skipto` scans forward over balanced
//! groups until a sub-expression matches.
//!
//! Ordered choice and `skipto` are greedy left-first; there is no
//! backtracking across a committed rule.

mod sexpr;

pub use sexpr::*;

use std::collections::HashMap;
use std::{error::Error, fmt::Display};

use crate::lexer::{LexemeId, Stream};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GrammarError(pub String);

pub type GrammarResult<T> = Result<T, GrammarError>;

impl Display for GrammarError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.0.as_str())
    }
}

impl Error for GrammarError {}

/// A compiled grammar expression.
#[derive(Debug, Clone)]
pub enum GrammarExpr {
    /// `(str s)` — head lexeme's surface equals `s`.
    Str(String),
    /// `(:: kind)` — head lexeme's kind equals `kind`.
    Kind(String),
    /// `(.)` — any one lexeme.
    Any,
    /// `(? e …)` — optional sequence; consumes nothing on failure.
    Opt(Vec<GrammarExpr>),
    /// `(/ e …)` — ordered choice, first success wins.
    Choice(Vec<GrammarExpr>),
    /// `(seq e …)` — all must match in order.
    Seq(Vec<GrammarExpr>),
    /// `(: name)` — invoke the rule bound to `name`.
    Rule(String),
    /// `(& e)` — positive lookahead, consumes nothing.
    And(Box<GrammarExpr>),
    /// `(! e)` — negative lookahead, consumes nothing.
    Not(Box<GrammarExpr>),
    /// `(balanced [open close])` — a matched group, `()` by default.
    Balanced(String, String),
    /// `(skipto e)` — scan forward over balanced groups until `e` matches.
    Skipto(Box<GrammarExpr>),
}

/// A parse tree. `Tokens` holds raw runs of lexemes: the skipped part of a
/// `skipto` and the inner span of a `balanced` group.
#[derive(Debug, Clone, PartialEq)]
pub enum Tree {
    Leaf(LexemeId),
    Tokens(Vec<LexemeId>),
    Node(String, Vec<Tree>),
}

impl Tree {
    pub fn label(&self) -> &str {
        match self {
            Tree::Node(label, _) => label,
            _ => "",
        }
    }

    pub fn children(&self) -> &[Tree] {
        match self {
            Tree::Node(_, children) => children,
            _ => &[],
        }
    }

    pub fn child(&self, index: usize) -> Option<&Tree> {
        self.children().get(index)
    }

    /// All lexemes under this tree, left to right.
    pub fn lexemes(&self) -> Vec<LexemeId> {
        let mut out = vec![];
        collect_lexemes(self, &mut out);
        out
    }
}

fn collect_lexemes(tree: &Tree, out: &mut Vec<LexemeId>) {
    match tree {
        Tree::Leaf(id) => out.push(*id),
        Tree::Tokens(ids) => out.extend(ids.iter().copied()),
        Tree::Node(_, children) => {
            for child in children {
                collect_lexemes(child, out);
            }
        }
    }
}

/// Flatten a tree back into its lexemes.
pub fn relex(tree: &Tree) -> Vec<LexemeId> {
    tree.lexemes()
}

/// A successful match: either a tree or an empty result (lookaheads, failed
/// optionals). The engine filters empty results out of parent nodes, which is
/// what makes failure (`None`) distinguishable from an empty tree.
#[derive(Debug, Clone, PartialEq)]
pub enum Match {
    Tree(Tree),
    Empty,
}

/// Compile a single grammar expression from its S-expression source.
pub fn compile_expr(source: &str) -> GrammarResult<GrammarExpr> {
    let sexpr = parse_sexpr(source).map_err(|e| GrammarError(e.0))?;
    compile(&sexpr)
}

pub fn compile(sexpr: &Sexpr) -> GrammarResult<GrammarExpr> {
    let Sexpr::List(items) = sexpr else {
        return Err(GrammarError(format!("bare atom in grammar: {sexpr:?}")));
    };
    let Some(Sexpr::Atom(head)) = items.first() else {
        return Err(GrammarError(format!("headless grammar form: {items:?}")));
    };

    let atom_arg = |index: usize| -> GrammarResult<String> {
        match items.get(index) {
            Some(Sexpr::Atom(a)) => Ok(a.clone()),
            other => Err(GrammarError(format!("expected atom, found {other:?}"))),
        }
    };
    let compile_rest = || -> GrammarResult<Vec<GrammarExpr>> {
        items[1..].iter().map(compile).collect()
    };

    match head.as_str() {
        "str" => Ok(GrammarExpr::Str(atom_arg(1)?)),
        "::" => Ok(GrammarExpr::Kind(atom_arg(1)?)),
        "." => Ok(GrammarExpr::Any),
        "?" => Ok(GrammarExpr::Opt(compile_rest()?)),
        "/" => Ok(GrammarExpr::Choice(compile_rest()?)),
        "seq" => Ok(GrammarExpr::Seq(compile_rest()?)),
        ":" => Ok(GrammarExpr::Rule(atom_arg(1)?)),
        "&" => Ok(GrammarExpr::And(Box::new(compile(&items[1])?))),
        "!" => Ok(GrammarExpr::Not(Box::new(compile(&items[1])?))),
        "strany" => {
            let alts = items[1..]
                .iter()
                .map(|item| match item {
                    Sexpr::Atom(a) => Ok(GrammarExpr::Str(a.clone())),
                    other => Err(GrammarError(format!("strany wants atoms, got {other:?}"))),
                })
                .collect::<GrammarResult<Vec<_>>>()?;
            Ok(GrammarExpr::Choice(alts))
        }
        "balanced" => match items.len() {
            1 => Ok(GrammarExpr::Balanced("(".into(), ")".into())),
            2 if items[1] == Sexpr::Atom("rev".into()) => {
                Ok(GrammarExpr::Balanced(")".into(), "(".into()))
            }
            3 => Ok(GrammarExpr::Balanced(atom_arg(1)?, atom_arg(2)?)),
            _ => Err(GrammarError(format!("bad balanced form: {items:?}"))),
        },
        "skipto" => {
            let inner = if items.len() > 2 {
                GrammarExpr::Seq(compile_rest()?)
            } else {
                compile(&items[1])?
            };
            Ok(GrammarExpr::Skipto(Box::new(inner)))
        }
        other => Err(GrammarError(format!("unknown grammar operator {other:?}"))),
    }
}

/// Index of the lexeme closing the group opened by `input[0]`, if any.
pub fn find_balance(input: &[LexemeId], open: &str, close: &str, s: &Stream) -> Option<usize> {
    if input.first().map(|&l| s.surface(l)) != Some(open) {
        return None;
    }
    let mut depth = 1i32;
    for (i, &lexeme) in input.iter().enumerate().skip(1) {
        let surface = s.surface(lexeme);
        if surface == close {
            depth -= 1;
        }
        if surface == open {
            depth += 1;
        }
        if depth == 0 {
            return Some(i);
        }
    }
    None
}

/// A set of named rules plus the evaluator.
#[derive(Debug, Default)]
pub struct Peg {
    rules: HashMap<String, Vec<GrammarExpr>>,
}

impl Peg {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind `name` to a rule body written as a sequence of S-expressions.
    /// Rule sources are static program text, so a malformed rule is a bug.
    pub fn rule(&mut self, name: &str, body: &str) {
        let exprs = parse_sexpr_seq(body)
            .map_err(|e| GrammarError(e.0))
            .and_then(|items| items.iter().map(compile).collect::<GrammarResult<Vec<_>>>())
            .expect("static grammar rule must compile");
        self.rules.insert(name.to_string(), exprs);
    }

    /// Parse a named rule at the start of `input`.
    pub fn parse_rule<'a>(
        &self,
        name: &str,
        input: &'a [LexemeId],
        s: &Stream,
    ) -> Option<(Tree, &'a [LexemeId])> {
        let body = self.rules.get(name)?;
        let (children, remainder) = self.parse_all(body, input, s)?;
        Some((Tree::Node(name.to_string(), children), remainder))
    }

    /// Evaluate one grammar expression at the start of `input`.
    pub fn parse<'a>(
        &self,
        expr: &GrammarExpr,
        input: &'a [LexemeId],
        s: &Stream,
    ) -> Option<(Match, &'a [LexemeId])> {
        match expr {
            GrammarExpr::Str(want) => match input.first() {
                Some(&head) if s.surface(head) == want => {
                    Some((Match::Tree(Tree::Leaf(head)), &input[1..]))
                }
                _ => None,
            },
            GrammarExpr::Kind(want) => match input.first() {
                Some(&head) if s.label(head) == want => {
                    Some((Match::Tree(Tree::Leaf(head)), &input[1..]))
                }
                _ => None,
            },
            GrammarExpr::Any => input
                .first()
                .map(|&head| (Match::Tree(Tree::Leaf(head)), &input[1..])),
            GrammarExpr::Opt(subs) => match self.parse_all(subs, input, s) {
                Some((children, remainder)) => {
                    Some((Match::Tree(Tree::Node("?".into(), children)), remainder))
                }
                None => Some((Match::Empty, input)),
            },
            GrammarExpr::Choice(subs) => {
                subs.iter().find_map(|sub| self.parse(sub, input, s))
            }
            GrammarExpr::Seq(subs) => {
                let (children, remainder) = self.parse_all(subs, input, s)?;
                Some((Match::Tree(Tree::Node("seq".into(), children)), remainder))
            }
            GrammarExpr::Rule(name) => {
                let (tree, remainder) = self.parse_rule(name, input, s)?;
                Some((Match::Tree(tree), remainder))
            }
            GrammarExpr::And(sub) => match self.parse(sub, input, s) {
                Some(_) => Some((Match::Empty, input)),
                None => None,
            },
            GrammarExpr::Not(sub) => match self.parse(sub, input, s) {
                Some(_) => None,
                None => Some((Match::Empty, input)),
            },
            GrammarExpr::Balanced(open, close) => {
                let close_i = find_balance(input, open, close, s)?;
                let tree = Tree::Node(
                    "bal".into(),
                    vec![
                        Tree::Leaf(input[0]),
                        Tree::Tokens(input[1..close_i].to_vec()),
                        Tree::Leaf(input[close_i]),
                    ],
                );
                Some((Match::Tree(tree), &input[close_i + 1..]))
            }
            GrammarExpr::Skipto(sub) => {
                let mut i = 0;
                while i <= input.len() {
                    if let Some((matched, remainder)) = self.parse(sub, &input[i..], s) {
                        let terminator = match matched {
                            Match::Tree(tree) => tree,
                            Match::Empty => Tree::Tokens(vec![]),
                        };
                        let tree = Tree::Node(
                            "skipto".into(),
                            vec![Tree::Tokens(input[..i].to_vec()), terminator],
                        );
                        return Some((Match::Tree(tree), remainder));
                    }
                    let group = find_balance(&input[i..], "(", ")", s)
                        .or_else(|| find_balance(&input[i..], "{", "}", s))
                        .or_else(|| find_balance(&input[i..], "[", "]", s));
                    match group {
                        Some(close_i) => i += close_i + 1,
                        None => i += 1,
                    }
                }
                None
            }
        }
    }

    /// Evaluate a sequence of expressions, filtering empty matches out of the
    /// collected children.
    fn parse_all<'a>(
        &self,
        exprs: &[GrammarExpr],
        mut input: &'a [LexemeId],
        s: &Stream,
    ) -> Option<(Vec<Tree>, &'a [LexemeId])> {
        let mut children = vec![];
        for expr in exprs {
            let (matched, remainder) = self.parse(expr, input, s)?;
            input = remainder;
            if let Match::Tree(tree) = matched {
                children.push(tree);
            }
        }
        Some((children, input))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lexer::lex_c;

    fn parse_one<'a>(
        expr: &str,
        input: &'a [LexemeId],
        s: &Stream,
    ) -> Option<(Match, &'a [LexemeId])> {
        let compiled = compile_expr(expr).unwrap();
        Peg::new().parse(&compiled, input, s)
    }

    #[test]
    fn test_balanced_spans_matching_close() {
        let s = lex_c("( a ( b ) c ) tail\n").unwrap();
        let (matched, remainder) = parse_one("(balanced)", s.order(), &s).unwrap();

        let Match::Tree(Tree::Node(label, children)) = matched else {
            panic!("expected a bal node");
        };
        assert_eq!("bal", label);
        let Tree::Tokens(inner) = &children[1] else {
            panic!("expected inner tokens");
        };
        // The nested group stays inside the span; only the matching close
        // ends it.
        assert_eq!(5, inner.len());
        assert_eq!(1, remainder.len());
        assert_eq!("tail", s.surface(remainder[0]));
    }

    #[test]
    fn test_skipto_skips_balanced_groups() {
        let s = lex_c("f ( x ; y ) ;\n").unwrap();
        let (matched, remainder) = parse_one("(skipto (str ;))", s.order(), &s).unwrap();

        let Match::Tree(Tree::Node(_, children)) = matched else {
            panic!("expected a skipto node");
        };
        let Tree::Tokens(skipped) = &children[0] else {
            panic!("expected skipped tokens");
        };
        // The `;` inside the parens must not terminate the scan.
        assert_eq!(6, skipped.len());
        assert!(remainder.is_empty());
    }

    #[test]
    fn test_choice_is_ordered() {
        let s = lex_c("a b\n").unwrap();
        // The first alternative matches one token even though the second
        // would consume two.
        let (matched, remainder) =
            parse_one("(/ (str a) (seq (str a) (str b)))", s.order(), &s).unwrap();
        assert!(matches!(matched, Match::Tree(Tree::Leaf(_))));
        assert_eq!(1, remainder.len());
    }

    #[test]
    fn test_optional_failure_consumes_nothing() {
        let s = lex_c("b\n").unwrap();
        let (matched, remainder) = parse_one("(? (str a))", s.order(), &s).unwrap();
        assert_eq!(Match::Empty, matched);
        assert_eq!(1, remainder.len());
    }

    #[test]
    fn test_negative_lookahead() {
        let s = lex_c("while ( 1 )\n").unwrap();
        assert!(parse_one("(! (str while))", s.order(), &s).is_none());
        assert!(parse_one("(! (str if))", s.order(), &s).is_some());
    }

    #[test]
    fn test_rule_invocation() {
        let s = lex_c("x ;\n").unwrap();
        let mut peg = Peg::new();
        peg.rule("Stmt", "(:: ident) (str ;)");
        let (tree, remainder) = peg.parse_rule("Stmt", s.order(), &s).unwrap();
        assert_eq!("Stmt", tree.label());
        assert_eq!(2, tree.children().len());
        assert!(remainder.is_empty());
    }

    #[test]
    fn test_skipto_can_match_at_end() {
        let s = lex_c("a b c\n").unwrap();
        let (matched, remainder) = parse_one("(skipto (! (.)))", s.order(), &s).unwrap();
        let Match::Tree(Tree::Node(_, children)) = matched else {
            panic!("expected skipto node");
        };
        let Tree::Tokens(skipped) = &children[0] else {
            panic!("expected skipped tokens");
        };
        assert_eq!(3, skipped.len());
        assert!(remainder.is_empty());
    }

    #[test]
    fn test_reverse_balanced() {
        let s = lex_c(") x (\n").unwrap();
        let (matched, _) = parse_one("(balanced rev)", s.order(), &s).unwrap();
        assert!(matches!(matched, Match::Tree(Tree::Node(ref l, _)) if l == "bal"));
    }
}
