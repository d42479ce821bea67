//! # Lexer Rules
//!
//! Ordered, regex-based token rule tables. The first table describes the C
//! dialect the interpreter understands; the second one is only used to split
//! rewrite patterns into literal text and `{name}` substitution holes.

use once_cell::sync::Lazy;
use regex::Regex;

/// An ordered table of named token rules. Matching is longest-match over all
/// rules; ties are broken towards the earlier rule. Rule names starting with
/// an underscore are lexed but not kept (whitespace, comments).
pub struct LexRules {
    rules: Vec<(&'static str, Regex)>,
}

impl LexRules {
    fn new(table: &[(&'static str, &str)]) -> Self {
        let rules = table
            .iter()
            .map(|(name, pattern)| {
                let anchored = format!(r"\A(?:{pattern})");
                let re = Regex::new(&anchored).expect("static lex rule must compile");
                (*name, re)
            })
            .collect();

        Self { rules }
    }

    /// Find the rule with the longest match at the start of `input`.
    pub fn longest_match(&self, input: &str) -> Option<(&'static str, usize)> {
        let mut longest: Option<(&'static str, usize)> = None;

        for (name, prog) in &self.rules {
            if let Some(found) = prog.find(input) {
                if found.end() > longest.map_or(0, |(_, len)| len) {
                    longest = Some((name, found.end()));
                }
            }
        }

        longest
    }
}

/// Token rules for the C dialect. Multi-character operators come before the
/// single-character punctuation so that `->` does not lex as `-` `>`.
pub static C_RULES: Lazy<LexRules> = Lazy::new(|| {
    LexRules::new(&[
        ("preproc", r"#[a-zA-Z_]+([^\n]|\\\n)*?\n"),
        (
            "op",
            r"[\-][>]|\+\+|<<|>>|--|==|&&|[<>!+\-*/&|^%](=?)|[,(){};.=:&|~%?^]|\[|\]",
        ),
        ("ident", "[a-zA-Z_][a-zA-Z0-9_]*"),
        ("pasteify", r"##[a-zA-Z_]+"),
        ("strify", r"#[a-zA-Z_]+"),
        ("numlit", "(0x[0-9a-fA-F]*)|([0-9]+)"),
        ("strlit", r#"["]([\\]["]|[^"][^"])*[^"]?["]"#),
        ("chrlit", r"[']([\\][']|[^'][^'])*[^']?[']"),
        ("_slc", r"//[^\n]*"),
        ("_mlc", r"/\*[^*]*\*+([^/*][^*]*\*+)*/"),
        ("_space", r"\s"),
    ])
});

/// Rules for splitting a rewrite pattern: `{{`/`}}` escapes, `{name}`
/// substitution holes, and everything else as literal text.
pub static PATTERN_RULES: Lazy<LexRules> = Lazy::new(|| {
    LexRules::new(&[
        ("Literal", r"(\{\{)|(\}\})"),
        ("Sub", r"\{[^{}]*?\}"),
        ("String", r"[^{}]+"),
    ])
});
