//! # Lexer Module
//!
//! Turns raw C source into a [`Stream`] of lexemes. The stream is the program
//! representation for the whole interpreter: desugaring and macro expansion
//! happen by rewriting it in place, so lexemes live in an arena that never
//! shrinks while the *live order* of the stream changes underneath.

mod rules;

pub use rules::*;

use std::{error::Error, fmt::Display};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LexError(pub String);

pub type LexResult<T> = Result<T, LexError>;

impl Display for LexError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.0.as_str())
    }
}

impl Error for LexError {}

/// Handle to a lexeme inside a [`Stream`] arena. Handles stay valid for the
/// life of the stream, even after the lexeme is rewritten out of the live
/// order, so parse trees that are still in flight never dangle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LexemeId(u32);

/// A single token. Pseudo lexemes are synthesised by rewrites: they carry
/// their surface string explicitly and occupy a zero-width position anchored
/// just before the range they replaced.
#[derive(Debug, Clone)]
pub struct Lexeme {
    pub label: &'static str,
    pub start: usize,
    pub len: usize,
    pub pseudo: Option<String>,
}

impl Lexeme {
    pub fn is_pseudo(&self) -> bool {
        self.pseudo.is_some()
    }
}

/// A lexed source file: the underlying text, the lexeme arena, the mutable
/// live order, and the rule table needed to re-lex rewritten fragments.
pub struct Stream {
    pub(crate) rules: &'static LexRules,
    text: String,
    arena: Vec<Lexeme>,
    order: Vec<LexemeId>,
}

impl Stream {
    /// Lex `text` with the given rule table.
    pub fn lex(rules: &'static LexRules, text: &str) -> LexResult<Self> {
        let mut stream = Self {
            rules,
            text: text.to_string(),
            arena: vec![],
            order: vec![],
        };

        let mut position = 0;
        while position < text.len() {
            let rest = &text[position..];
            let Some((label, len)) = rules.longest_match(rest) else {
                return Err(LexError(format!(
                    "failed to lex at byte {position}: {:?}",
                    &rest[..rest.len().min(24)]
                )));
            };

            if !label.starts_with('_') {
                let id = stream.alloc(Lexeme {
                    label,
                    start: position,
                    len,
                    pseudo: None,
                });
                stream.order.push(id);
            }
            position += len;
        }

        Ok(stream)
    }

    pub(crate) fn alloc(&mut self, lexeme: Lexeme) -> LexemeId {
        let id = LexemeId(self.arena.len() as u32);
        self.arena.push(lexeme);
        id
    }

    pub fn get(&self, id: LexemeId) -> &Lexeme {
        &self.arena[id.0 as usize]
    }

    /// The surface string of a lexeme.
    pub fn surface(&self, id: LexemeId) -> &str {
        let lexeme = self.get(id);
        match &lexeme.pseudo {
            Some(s) => s.as_str(),
            None => &self.text[lexeme.start..lexeme.start + lexeme.len],
        }
    }

    pub fn label(&self, id: LexemeId) -> &'static str {
        self.get(id).label
    }

    /// 1-based line number, derived from the byte offset.
    pub fn line_number(&self, id: LexemeId) -> usize {
        let start = self.get(id).start.min(self.text.len());
        1 + self.text[..start].matches('\n').count()
    }

    /// The live token sequence.
    pub fn order(&self) -> &[LexemeId] {
        &self.order
    }

    /// Position of a lexeme in the live order, if it has not been rewritten
    /// away.
    pub fn index_of(&self, id: LexemeId) -> Option<usize> {
        self.order.iter().position(|&l| l == id)
    }

    pub fn next_lexeme(&self, id: LexemeId) -> Option<LexemeId> {
        let idx = self.index_of(id)?;
        self.order.get(idx + 1).copied()
    }

    pub fn prev_lexeme(&self, id: LexemeId) -> Option<LexemeId> {
        let idx = self.index_of(id)?;
        idx.checked_sub(1).map(|i| self.order[i])
    }

    /// All live lexemes from `id` to the end of the stream.
    pub fn suffix(&self, id: LexemeId, including_self: bool) -> Vec<LexemeId> {
        match self.index_of(id) {
            Some(idx) => {
                let idx = if including_self { idx } else { idx + 1 };
                self.order[idx.min(self.order.len())..].to_vec()
            }
            None => vec![],
        }
    }

    /// First live lexeme at or after the given 1-based line.
    pub fn after_line_number(&self, line: usize) -> Option<LexemeId> {
        self.order
            .iter()
            .copied()
            .find(|&l| self.line_number(l) >= line)
    }

    /// The underlying source text covered by a lexeme range, whitespace and
    /// comments included.
    pub fn span_text(&self, range: &[LexemeId]) -> &str {
        let (Some(&first), Some(&last)) = (range.first(), range.last()) else {
            return "";
        };
        let start = self.get(first).start;
        let end = self.get(last).start + self.get(last).len;
        &self.text[start.min(self.text.len())..end.min(self.text.len())]
    }

    /// Space-joined surfaces of a lexeme range, for diagnostics.
    pub fn render(&self, range: &[LexemeId]) -> String {
        range
            .iter()
            .map(|&l| self.surface(l))
            .collect::<Vec<_>>()
            .join(" ")
    }

    pub(crate) fn splice_order(&mut self, start: usize, end: usize, new: &[LexemeId]) {
        self.order.splice(start..end, new.iter().copied());
    }
}

/// Lex a C source file.
pub fn lex_c(text: &str) -> LexResult<Stream> {
    Stream::lex(&C_RULES, text)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn surfaces(stream: &Stream) -> Vec<String> {
        stream
            .order()
            .iter()
            .map(|&l| stream.surface(l).to_string())
            .collect()
    }

    #[test]
    fn test_lex_reconstructs_source() {
        let source = "int main() {\n    // add\n    return a + 0x2A;\n}\n";
        let stream = lex_c(source).unwrap();

        let mut rebuilt = String::new();
        let mut cursor = 0;
        for &id in stream.order() {
            let lexeme = stream.get(id);
            rebuilt.push_str(&source[cursor..lexeme.start]);
            rebuilt.push_str(stream.surface(id));
            cursor = lexeme.start + lexeme.len;
        }
        rebuilt.push_str(&source[cursor..]);

        assert_eq!(source, rebuilt);
    }

    #[test]
    fn test_lex_offsets_increase() {
        let stream = lex_c("a = b + c;\n").unwrap();
        let starts: Vec<_> = stream.order().iter().map(|&l| stream.get(l).start).collect();
        let mut sorted = starts.clone();
        sorted.sort_unstable();
        assert_eq!(starts, sorted);
    }

    #[test]
    fn test_lex_hex_literal() {
        let stream = lex_c("0x2A ").unwrap();
        assert_eq!(surfaces(&stream), vec!["0x2A"]);
        assert_eq!(stream.label(stream.order()[0]), "numlit");
    }

    #[test]
    fn test_lex_arrow() {
        let stream = lex_c("a->b ").unwrap();
        assert_eq!(surfaces(&stream), vec!["a", "->", "b"]);
        let labels: Vec<_> = stream.order().iter().map(|&l| stream.label(l)).collect();
        assert_eq!(labels, vec!["ident", "op", "ident"]);
    }

    #[test]
    fn test_lex_kinds_are_position_independent() {
        fn kinds(s: &Stream) -> Vec<&'static str> {
            s.order().iter().map(|&l| s.label(l)).collect()
        }
        let a = lex_c("x + 42 ;\n").unwrap();
        let b = lex_c("zzz ;\nx + 42 ;\n").unwrap();
        assert_eq!(kinds(&a), kinds(&b)[2..].to_vec());
    }

    #[test]
    fn test_lex_preproc_line() {
        let stream = lex_c("#define FOO 42\nint x;\n").unwrap();
        assert_eq!(stream.label(stream.order()[0]), "preproc");
        assert_eq!(stream.surface(stream.order()[1]), "int");
    }

    #[test]
    fn test_lex_line_numbers() {
        let stream = lex_c("a;\nb;\nc;\n").unwrap();
        let lines: Vec<_> = stream
            .order()
            .iter()
            .map(|&l| stream.line_number(l))
            .collect();
        assert_eq!(lines, vec![1, 1, 2, 2, 3, 3]);
    }

    #[test]
    fn test_lex_compound_ops() {
        let stream = lex_c("x <<= y ^= z;\n").unwrap();
        assert_eq!(surfaces(&stream), vec!["x", "<<", "=", "y", "^=", "z", ";"]);
    }

    #[test]
    fn test_lex_comments_skipped() {
        let stream = lex_c("a /* b */ c // d\n;\n").unwrap();
        assert_eq!(surfaces(&stream), vec!["a", "c", ";"]);
    }
}
