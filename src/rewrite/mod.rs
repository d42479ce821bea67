//! # Rewrite Module
//!
//! In-place rewriting of the lexeme stream. This is the one true compiler in
//! the system: loops, conditionals and switches are lowered by replacing
//! their token ranges with expanded patterns, and macro expansion is just
//! another rewrite. Patterns are literal text with `{name}` substitution
//! holes (`{{`/`}}` escape literal braces); a substitution is either a string
//! that gets re-lexed in place or a list of existing lexemes spliced in
//! verbatim.

use std::collections::HashMap;

use log::debug;
use once_cell::sync::Lazy;
use regex::Regex;

use crate::lexer::{LexError, LexResult, Lexeme, LexemeId, LexRules, Stream, PATTERN_RULES};
use crate::peg::{relex, Tree};
use crate::trace::Trace;

/// A named substitution for a rewrite pattern.
#[derive(Debug, Clone)]
pub enum Subst {
    /// Inline text, re-lexed with the stream's rules.
    Text(String),
    /// Existing lexemes, spliced verbatim.
    Toks(Vec<LexemeId>),
}

impl Subst {
    /// The text of a `Text` substitution; generated label names are always
    /// stored this way.
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Subst::Text(t) => Some(t),
            Subst::Toks(_) => None,
        }
    }
}

fn lex_fragments(rules: &LexRules, text: &str) -> LexResult<Vec<(&'static str, String)>> {
    let mut out = vec![];
    let mut position = 0;
    while position < text.len() {
        let rest = &text[position..];
        let Some((label, len)) = rules.longest_match(rest) else {
            return Err(LexError(format!("failed to lex fragment {rest:?}")));
        };
        if !label.starts_with('_') {
            out.push((label, rest[..len].to_string()));
        }
        position += len;
    }
    Ok(out)
}

/// Re-lex `text` into pseudo lexemes appended to `new`, each anchored at the
/// previous new lexeme's position (or at `anchor` for the first one).
fn insert_text(
    stream: &mut Stream,
    new: &mut Vec<LexemeId>,
    anchor: usize,
    text: &str,
) -> LexResult<()> {
    let fragments = lex_fragments(stream.rules, text)?;
    for (label, surface) in fragments {
        let at = new.last().map(|&id| stream.get(id).start).unwrap_or(anchor);
        let id = stream.alloc(Lexeme {
            label,
            start: at,
            len: 0,
            pseudo: Some(surface),
        });
        new.push(id);
    }
    Ok(())
}

impl Stream {
    /// Replace `old_range` (a closed range of live lexemes, or the half-open
    /// range before its first lexeme when `inclusive` is false) with the
    /// expansion of `pattern`. Returns the newly inserted lexemes.
    pub fn rewrite(
        &mut self,
        old_range: &[LexemeId],
        pattern: &str,
        substitutions: &HashMap<String, Subst>,
        inclusive: bool,
    ) -> LexResult<Vec<LexemeId>> {
        let (Some(&first), Some(&last)) = (old_range.first(), old_range.last()) else {
            return Err(LexError("rewrite of an empty range".into()));
        };

        let anchor = self.get(last).start;
        let mut new_lexemes: Vec<LexemeId> = vec![];

        for (label, part) in lex_fragments(&PATTERN_RULES, pattern)? {
            match label {
                "Literal" => {
                    let brace = part[..1].to_string();
                    insert_text(self, &mut new_lexemes, anchor, &brace)?;
                }
                "Sub" => {
                    let name = &part[1..part.len() - 1];
                    match substitutions.get(name) {
                        Some(Subst::Text(text)) => {
                            let text = text.clone();
                            insert_text(self, &mut new_lexemes, anchor, &text)?;
                        }
                        Some(Subst::Toks(ids)) => new_lexemes.extend(ids.iter().copied()),
                        None => {
                            return Err(LexError(format!(
                                "pattern references unknown substitution {name:?}"
                            )))
                        }
                    }
                }
                _ => insert_text(self, &mut new_lexemes, anchor, &part)?,
            }
        }

        let start_idx = self
            .index_of(first)
            .ok_or_else(|| LexError("rewrite range is not live".into()))?;
        let end_idx = if inclusive {
            match self.next_lexeme(last) {
                Some(next) => self
                    .index_of(next)
                    .ok_or_else(|| LexError("rewrite range end is not live".into()))?,
                None => self.order().len(),
            }
        } else {
            start_idx
        };

        debug!(
            "rewrite [{}..{}] -> {} lexeme(s)",
            start_idx,
            end_idx,
            new_lexemes.len()
        );
        self.splice_order(start_idx, end_idx, &new_lexemes);
        Ok(new_lexemes)
    }

    /// The list-pattern form: literal strings are appended with their braces
    /// escaped, lexeme lists become auto-numbered splices.
    pub fn rewrite_parts(
        &mut self,
        old_range: &[LexemeId],
        parts: &[Subst],
    ) -> LexResult<Vec<LexemeId>> {
        let mut pattern = String::new();
        let mut substitutions = HashMap::new();

        for part in parts {
            match part {
                Subst::Text(text) => {
                    pattern.push(' ');
                    pattern.push_str(&text.replace('{', "{{").replace('}', "}}"));
                }
                Subst::Toks(ids) => {
                    for &id in ids {
                        let key = substitutions.len().to_string();
                        pattern.push_str(&format!(" {{{key}}}"));
                        substitutions.insert(key, Subst::Toks(vec![id]));
                    }
                }
            }
        }

        self.rewrite(old_range, &pattern, &substitutions, true)
    }

    /// Insert the expansion of `pattern` just before `before`.
    pub fn prepend(
        &mut self,
        before: LexemeId,
        pattern: &str,
        substitutions: &HashMap<String, Subst>,
    ) -> LexResult<Vec<LexemeId>> {
        self.rewrite(&[before], pattern, substitutions, false)
    }
}

/// The nested-list view of a parse tree used while consuming a hole pattern:
/// labels are dropped, every lexeme is wrapped in its own singleton list.
#[derive(Debug, Clone)]
enum Nest {
    Leaf(LexemeId),
    List(Vec<Nest>),
}

fn filterlex(tree: &Tree) -> Option<Nest> {
    match tree {
        Tree::Leaf(id) => Some(Nest::List(vec![Nest::Leaf(*id)])),
        Tree::Tokens(ids) => {
            if ids.is_empty() {
                return None;
            }
            Some(Nest::List(
                ids.iter()
                    .map(|&id| Nest::List(vec![Nest::Leaf(id)]))
                    .collect(),
            ))
        }
        Tree::Node(_, children) => {
            let items: Vec<Nest> = children.iter().filter_map(filterlex).collect();
            if items.is_empty() {
                return None;
            }
            Some(Nest::List(items))
        }
    }
}

fn relex_nest(nest: &Nest, out: &mut Vec<LexemeId>) {
    match nest {
        Nest::Leaf(id) => out.push(*id),
        Nest::List(items) => {
            for item in items {
                relex_nest(item, out);
            }
        }
    }
}

fn nest_lexemes(nest: &Nest) -> Vec<LexemeId> {
    let mut out = vec![];
    relex_nest(nest, &mut out);
    out
}

fn is_empty_nest(nest: &Nest) -> bool {
    matches!(nest, Nest::List(items) if items.is_empty())
}

/// Consume the leftmost terminal of the tree, which must equal `term`.
fn consume_terminal(nest: &Nest, term: &str, s: &Stream) -> LexResult<Nest> {
    let lexemes = nest_lexemes(nest);
    if lexemes.len() == 1 && s.surface(lexemes[0]) == term {
        return Ok(Nest::List(vec![]));
    }
    let Nest::List(items) = nest else {
        return Err(LexError(format!("hole pattern mismatch at {term:?}")));
    };
    let Some(first) = items.first() else {
        return Err(LexError(format!("hole pattern ran out before {term:?}")));
    };
    let remainder = consume_terminal(first, term, s)?;
    let mut out = vec![];
    if !is_empty_nest(&remainder) {
        out.push(remainder);
    }
    out.extend(items[1..].iter().cloned());
    Ok(Nest::List(out))
}

/// Take the piece of the tree up to the next terminal (or everything when
/// there is none), returning the piece's lexemes and the rest of the tree.
fn take_piece(
    nest: &Nest,
    term: Option<&str>,
    s: &Stream,
) -> LexResult<(Vec<LexemeId>, Nest)> {
    let Some(term) = term else {
        return Ok((nest_lexemes(nest), Nest::List(vec![])));
    };
    let Nest::List(items) = nest else {
        return Err(LexError(format!("hole pattern mismatch before {term:?}")));
    };

    for (i, child) in items.iter().enumerate() {
        let first = nest_lexemes(child).into_iter().next();
        if first.map(|l| s.surface(l) == term).unwrap_or(false) {
            let mut piece = vec![];
            for consumed in &items[..i] {
                relex_nest(consumed, &mut piece);
            }
            return Ok((piece, Nest::List(items[i..].to_vec())));
        }
    }

    let Some(first) = items.first() else {
        return Err(LexError(format!("hole pattern ran out before {term:?}")));
    };
    let (piece, remainder) = take_piece(first, Some(term), s)?;
    let mut out = vec![];
    if !is_empty_nest(&remainder) {
        out.push(remainder);
    }
    out.extend(items[1..].iter().cloned());
    Ok((piece, Nest::List(out)))
}

static LABEL_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\[.*?\]").expect("static regex"));

/// Replace an already-parsed subtree with `pattern_after`. `pattern_before`
/// names the subtree's terminals with `...` holes between them; each hole
/// becomes a numbered substitution (`{0}`, `{1}`, …). Occurrences of
/// `[name]` in `pattern_after` are bound to freshly generated identifiers.
/// Returns the substitution map together with the new lexemes.
pub fn fancy_rewrite(
    stream: &mut Stream,
    trace: &mut Trace,
    tree: &Tree,
    pattern_before: &str,
    pattern_after: &str,
) -> LexResult<(HashMap<String, Subst>, Vec<LexemeId>)> {
    let old_range = relex(tree);
    let mut nest =
        filterlex(tree).ok_or_else(|| LexError("cannot rewrite an empty subtree".into()))?;

    let spaced = pattern_before.replace("...", " ... ");
    let parts: Vec<&str> = spaced.split_whitespace().collect();

    let mut pieces = vec![];
    for (i, part) in parts.iter().enumerate() {
        if *part == "..." {
            let next = parts.get(i + 1).copied();
            let (piece, rest) = take_piece(&nest, next, stream)?;
            pieces.push(piece);
            nest = rest;
        } else {
            nest = consume_terminal(&nest, part, stream)?;
        }
    }

    let mut names: Vec<String> = LABEL_RE
        .find_iter(pattern_after)
        .map(|m| m.as_str()[1..m.as_str().len() - 1].to_string())
        .collect();
    names.sort();
    names.dedup();

    let generated = trace.gen_labels(names.len());
    let mut new_pattern = pattern_after.to_string();
    let mut substitutions = HashMap::new();
    for (name, label) in names.iter().zip(generated) {
        new_pattern = new_pattern.replace(&format!("[{name}]"), &format!("{{{name}}}"));
        substitutions.insert(name.clone(), Subst::Text(label));
    }
    for (i, piece) in pieces.into_iter().enumerate() {
        substitutions.insert(i.to_string(), Subst::Toks(piece));
    }

    let new_lexemes = stream.rewrite(&old_range, &new_pattern, &substitutions, true)?;
    Ok((substitutions, new_lexemes))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::grammar::parse_statement;
    use crate::lexer::lex_c;

    fn surfaces(stream: &Stream) -> Vec<String> {
        stream
            .order()
            .iter()
            .map(|&l| stream.surface(l).to_string())
            .collect()
    }

    #[test]
    fn test_rewrite_with_own_lexemes_is_identity() {
        let mut s = lex_c("a = b + c ;\n").unwrap();
        let before = s.order().to_vec();

        let parts = vec![Subst::Toks(before.clone())];
        s.rewrite_parts(&before, &parts).unwrap();

        assert_eq!(before, s.order().to_vec());
    }

    #[test]
    fn test_rewrite_text_produces_pseudo_lexemes() {
        let mut s = lex_c("x ;\n").unwrap();
        let target = vec![s.order()[0]];
        let new = s
            .rewrite(&target, "y + z", &HashMap::new(), true)
            .unwrap();

        assert_eq!(vec!["y", "+", "z", ";"], surfaces(&s));
        assert!(new.iter().all(|&l| s.get(l).is_pseudo()));
        // Pseudo lexemes anchor at the replaced range's start byte.
        assert!(new.iter().all(|&l| s.get(l).start == 0));
    }

    #[test]
    fn test_rewrite_substitutions_and_escapes() {
        let mut s = lex_c("q ;\n").unwrap();
        let target = vec![s.order()[0]];
        let mut subs = HashMap::new();
        subs.insert("body".into(), Subst::Text("f ( )".into()));
        s.rewrite(&target, "{{ {body} }}", &subs, true).unwrap();

        assert_eq!(vec!["{", "f", "(", ")", "}", ";"], surfaces(&s));
    }

    #[test]
    fn test_rewritten_stream_stays_parseable() {
        let mut s = lex_c("x ;\ny ;\n").unwrap();
        let target = vec![s.order()[0], s.order()[1]];
        s.rewrite(&target, "if ( x ) { y = 1 ; }", &HashMap::new(), true)
            .unwrap();

        let (tree, _) = parse_statement(s.order(), &s).unwrap();
        assert_eq!("Statement", tree.label());
        assert_eq!("IfStmt", tree.children()[0].label());
    }

    #[test]
    fn test_prepend_inserts_before() {
        let mut s = lex_c("b ;\n").unwrap();
        let before = s.order()[0];
        s.prepend(before, "a ;", &HashMap::new()).unwrap();
        assert_eq!(vec!["a", ";", "b", ";"], surfaces(&s));
    }

    #[test]
    fn test_fancy_rewrite_while() {
        let mut s = lex_c("while (i < 3) { i = i + 1; }\n").unwrap();
        let mut trace = Trace::new();
        let input = s.order().to_vec();
        let (tree, _) = parse_statement(&input, &s).unwrap();
        let while_tree = tree.children()[0].clone();
        assert_eq!("While", while_tree.label());

        let (labels, new) = fancy_rewrite(
            &mut s,
            &mut trace,
            &while_tree,
            "while (...) ...",
            "[lchk]: if ({0}) {{ {1} goto [lchk]; }} [lend]: 0;",
        )
        .unwrap();

        let lchk = labels["lchk"].as_text().unwrap();
        assert!(lchk.starts_with("___l"));
        assert_eq!(s.surface(new[0]), lchk);
        let rendered = s.render(s.order());
        assert!(rendered.contains("goto"));
        // The condition hole was spliced back in.
        assert!(rendered.contains("i < 3"));
    }
}
