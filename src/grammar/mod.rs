//! # Grammar Module
//!
//! The concrete C grammars, composed over the PEG engine. The statement
//! grammar parses exactly one statement at the execution head; the
//! expression grammar is a strictly ordered cascade of single-rule attempts,
//! each of which must consume the entire input. The cascade order doubles as
//! the precedence order, tried lowest first.

use once_cell::sync::Lazy;

use crate::lexer::{lex_c, LexemeId, Stream};
use crate::peg::{relex, Peg, Tree};

static STATEMENT_GRAMMAR: Lazy<Peg> = Lazy::new(|| {
    let mut peg = Peg::new();

    peg.rule("Block", "(balanced { })");
    peg.rule("EndBlock", "(str })");
    peg.rule("Body", "(/ (: Block) (: Statement))");

    peg.rule("IfStmt", "(str if) (balanced) (: Body) (? (str else) (: Body))");
    peg.rule("DoWhile", "(str do) (: Body) (str while) (balanced) (str ;)");
    peg.rule("While", "(str while) (balanced) (: Body)");
    peg.rule("For", "(str for) (balanced) (: Body)");
    peg.rule("Switch", "(str switch) (balanced) (: Body)");

    peg.rule("Case", "(/ (str case) (str default)) (skipto (str :)) (: Statement)");
    peg.rule("Label", "(:: ident) (str :) (: Statement)");

    peg.rule("Goto", "(str goto) (:: ident) (str ;)");
    peg.rule("GotoITE", "(str goto_ite) (balanced) (:: ident) (:: ident) (str ;)");
    peg.rule("Break", "(str break) (str ;)");
    peg.rule("Continue", "(str continue) (str ;)");
    peg.rule("Return", "(str return) (skipto (str ;))");

    peg.rule("Preproc", "(:: preproc)");

    peg.rule("Quals", "(/ (:: ident) (str *)) (? (: Quals))");
    peg.rule(
        "Function",
        "(! (/ (str if) (str while) (str for))) (? (: Quals)) (balanced) (! (str ;)) (balanced { })",
    );

    peg.rule("Line", "(skipto (str ;))");

    peg.rule(
        "Statement",
        "(/ (: IfStmt) (: DoWhile) (: While) (: For) (: Switch) (: Case) (: Label) (: Goto) \
         (: GotoITE) (: Break) (: Continue) (: Return) (: Function) (: Block) (: EndBlock) \
         (: Preproc) (: Line))",
    );

    peg
});

/// Parse one statement at the start of `input`. The result is a
/// `["Statement", …]` node wrapping the matched alternative.
pub fn parse_statement<'a>(
    input: &'a [LexemeId],
    s: &Stream,
) -> Option<(Tree, &'a [LexemeId])> {
    STATEMENT_GRAMMAR.parse_rule("Statement", input, s)
}

fn single_rule(name: &str, body: &str) -> (String, Peg) {
    let mut peg = Peg::new();
    peg.rule("End", "(! (.))");
    peg.rule(name, body);
    (name.to_string(), peg)
}

/// The expression cascade, lowest precedence first. Adapted from the C PEG
/// operator ordering; associativity follows the textual try order.
static EXPR_GRAMMARS: Lazy<Vec<(String, Peg)>> = Lazy::new(|| {
    let mut grammars = vec![];

    grammars.push(single_rule("Parens", "(balanced) (: End)"));
    grammars.push(single_rule(
        "Lits",
        "(/ (:: ident) (:: strlit) (:: numlit)) (? (: Lits)) (: End)",
    ));

    grammars.push(single_rule("Comma", "(skipto (str ,)) (skipto (: End))"));

    let assignops = "= *= /= %= += -= <<= >>= &= ^= |="
        .split(' ')
        .map(|op| format!("(str {op})"))
        .collect::<Vec<_>>()
        .join(" ");
    grammars.push(single_rule(
        "Assign",
        &format!("(skipto (/ {assignops})) (skipto (: End))"),
    ));

    grammars.push(single_rule(
        "Cond",
        "(skipto (str ?)) (skipto (str :)) (skipto (: End))",
    ));

    grammars.push(single_rule(
        "Cast",
        "(balanced) (& (.)) (/ (& (balanced { })) (! (/ (:: op)))) (skipto (: End))",
    ));

    for op in "*,/,%,+,-,<<,>>,<,>,<=,>=,==,!=,|=,&=,&,^,|,&&,||".split(',').rev() {
        grammars.push(single_rule(
            &format!("bin_{op}"),
            &format!("(! (str {op})) (skipto (str {op})) (skipto (: End))"),
        ));
    }

    for op in "+,-,++,--,!,~,*,&".split(',') {
        grammars.push(single_rule(
            &format!("pre_{op}"),
            &format!("(str {op}) (skipto (: End))"),
        ));
    }
    grammars.push(single_rule(
        "pre_sizeof",
        "(str sizeof) (! (lparen)) (skipto (: End))",
    ));

    grammars.push(single_rule("Nth", "(skipto (balanced [ ]) (: End))"));
    grammars.push(single_rule("Member", "(skipto (str .) (:: ident) (: End))"));
    grammars.push(single_rule(
        "DerefMember",
        "(skipto (str ->) (:: ident) (: End))",
    ));
    grammars.push(single_rule("Inc", "(skipto (str ++) (: End))"));
    grammars.push(single_rule("Dec", "(skipto (str --) (: End))"));
    grammars.push(single_rule(
        "FnCall",
        "(! (balanced)) (skipto (balanced) (: End))",
    ));

    grammars.push(single_rule("Parens", "(balanced)"));

    grammars.push(single_rule(
        "StructDecl",
        "(str struct) (? (:: ident)) (balanced { })",
    ));
    grammars.push(single_rule(
        "UnionDecl",
        "(str union) (? (:: ident)) (balanced { })",
    ));
    grammars.push(single_rule(
        "EnumDecl",
        "(str enum) (? (:: ident)) (balanced { })",
    ));

    grammars.push(single_rule("InitList", "(balanced { })"));

    grammars
});

/// Parse a complete expression: the first cascade entry that consumes the
/// whole input wins.
pub fn parse_expr(input: &[LexemeId], s: &Stream) -> Option<Tree> {
    for (name, peg) in EXPR_GRAMMARS.iter() {
        if let Some((tree, remainder)) = peg.parse_rule(name, input, s) {
            if remainder.is_empty() {
                return Some(tree);
            }
        }
    }
    None
}

/// Split a lexeme list on a separator, treating balanced groups as atoms.
pub fn parse_csv(input: &[LexemeId], s: &Stream, separator: &str) -> Vec<Vec<LexemeId>> {
    let mut peg = Peg::new();
    peg.rule("Val", &format!("(skipto (str {separator})) (? (: Val))"));

    let Some((tree, remainder)) = peg.parse_rule("Val", input, s) else {
        return if input.is_empty() {
            vec![]
        } else {
            vec![input.to_vec()]
        };
    };

    fn visit(tree: &Tree, out: &mut Vec<Vec<LexemeId>>) {
        if let Tree::Node(label, children) = tree {
            if label == "skipto" {
                if let Some(Tree::Tokens(skipped)) = children.first() {
                    out.push(skipped.clone());
                }
                return;
            }
            for child in children {
                visit(child, out);
            }
        }
    }

    let mut values = vec![];
    visit(&tree, &mut values);
    values.push(remainder.to_vec());
    values
}

/// One element of a macro's replacement pattern.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MacroPart {
    /// A literal token surface.
    Text(String),
    /// Substitute the n-th call-site argument.
    Arg(usize),
    /// `#arg` — the n-th argument as a string literal.
    Strify(usize),
    /// `##arg` — the n-th argument pasted onto the preceding token.
    Pasteify(usize),
    /// `##name` where `name` is not an argument: pasted literally.
    PasteifyStr(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Macro {
    pub name: String,
    pub args: Option<Vec<String>>,
    pub pattern: Vec<MacroPart>,
}

/// Parse a `#define` directive. Returns `None` for any other preprocessor
/// line.
pub fn parse_macro(directive: &str) -> Option<Macro> {
    let joined = directive.replace("\\\n", " ");
    // No trailing newline here: the preproc rule only matches newline-
    // terminated text, which is what lets `#x` lex as strify in a body.
    let body = joined.strip_prefix("#define ")?.trim();

    let stream = lex_c(body).ok()?;
    let lexemes = stream.order();
    let first = lexemes.first()?;

    let mut mac = Macro {
        name: stream.surface(*first).to_string(),
        args: None,
        pattern: vec![],
    };

    let mut rest = &lexemes[1..];
    if rest.first().map(|&l| stream.surface(l)) == Some("(") {
        let mut args = vec![];
        let mut consumed = 1;
        for &l in &rest[1..] {
            consumed += 1;
            match stream.surface(l) {
                ")" => break,
                "," => continue,
                name => args.push(name.to_string()),
            }
        }
        mac.args = Some(args);
        rest = &rest[consumed..];
    }

    let args = mac.args.clone().unwrap_or_default();
    for &lexeme in rest {
        let surface = stream.surface(lexeme);
        if let Some(name) = surface.strip_prefix("##") {
            match args.iter().position(|a| a == name) {
                Some(i) => mac.pattern.push(MacroPart::Pasteify(i)),
                None => mac.pattern.push(MacroPart::PasteifyStr(name.to_string())),
            }
        } else if let Some(name) = surface.strip_prefix('#') {
            if let Some(i) = args.iter().position(|a| a == name) {
                mac.pattern.push(MacroPart::Strify(i));
                continue;
            }
            mac.pattern.push(MacroPart::Text(surface.to_string()));
        } else if let Some(i) = args.iter().position(|a| a == surface) {
            mac.pattern.push(MacroPart::Arg(i));
        } else {
            mac.pattern.push(MacroPart::Text(surface.to_string()));
        }
    }

    Some(mac)
}

/// Find the `case`/`default` clauses directly inside a switch body, skipping
/// over balanced groups. Returns `(value lexemes, clause tree)` pairs; the
/// value list is empty for `default`.
pub fn find_cases(input: &[LexemeId], s: &Stream) -> Vec<(Vec<LexemeId>, Tree)> {
    let mut peg = Peg::new();
    peg.rule("Case", "(/ (str case) (str default)) (skipto (str :))");
    peg.rule(
        "CaseOrSkip",
        "(/ (: Case) (balanced) (balanced { }) (.)) (? (: CaseOrSkip))",
    );

    let Some((tree, _)) = peg.parse_rule("CaseOrSkip", input, s) else {
        return vec![];
    };

    fn collect<'t>(tree: &'t Tree, out: &mut Vec<&'t Tree>) {
        if tree.label() == "Case" {
            out.push(tree);
            return;
        }
        for child in tree.children() {
            collect(child, out);
        }
    }

    let mut cases = vec![];
    collect(&tree, &mut cases);

    cases
        .into_iter()
        .filter_map(|case| {
            let value = match case.child(1)?.child(0)? {
                Tree::Tokens(skipped) => skipped.clone(),
                _ => vec![],
            };
            Some((value, case.clone()))
        })
        .collect()
}

/// Scan a lexeme list for statements of the given types, without descending
/// into statements of the `skip` types. Used to find the `break`s belonging
/// to a loop while leaving nested loops alone.
pub fn find_stmts(
    input: &[LexemeId],
    s: &Stream,
    wanted: &[&str],
    skip: &[&str],
) -> Vec<Tree> {
    let mut results = vec![];
    let mut lexemes = input.to_vec();

    while !lexemes.is_empty() {
        if let Some((tree, _)) = parse_statement(&lexemes, s) {
            let inner_label = tree.children().first().map(Tree::label).unwrap_or("");
            if wanted.contains(&inner_label) {
                results.push(tree.clone());
            }
            if skip.contains(&inner_label) {
                if let Some(&last) = relex(&tree).last() {
                    if let Some(pos) = lexemes.iter().position(|&l| l == last) {
                        lexemes = lexemes[pos..].to_vec();
                    }
                }
            }
        }
        lexemes.remove(0);
    }

    results
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stream(source: &str) -> Stream {
        lex_c(source).unwrap()
    }

    fn statement_label(s: &Stream) -> String {
        let (tree, _) = parse_statement(s.order(), s).unwrap();
        tree.children()[0].label().to_string()
    }

    fn expr_label(source: &str) -> String {
        let s = stream(source);
        parse_expr(s.order(), &s).unwrap().label().to_string()
    }

    #[test]
    fn test_statement_alternatives() {
        assert_eq!("IfStmt", statement_label(&stream("if (x) y = 1;\n")));
        assert_eq!("While", statement_label(&stream("while (x) y = 1;\n")));
        assert_eq!("DoWhile", statement_label(&stream("do { } while (x);\n")));
        assert_eq!("For", statement_label(&stream("for (;;) { }\n")));
        assert_eq!("Switch", statement_label(&stream("switch (x) { }\n")));
        assert_eq!("Goto", statement_label(&stream("goto out;\n")));
        assert_eq!(
            "GotoITE",
            statement_label(&stream("goto_ite (x) a b;\n"))
        );
        assert_eq!("Return", statement_label(&stream("return x;\n")));
        assert_eq!("Break", statement_label(&stream("break;\n")));
        assert_eq!("Line", statement_label(&stream("x = 1;\n")));
        assert_eq!("Preproc", statement_label(&stream("#include <x.h>\n")));
    }

    #[test]
    fn test_function_vs_while() {
        assert_eq!(
            "Function",
            statement_label(&stream("static int probe(int x) { return 0; }\n"))
        );
        // A while loop must not parse as a function definition.
        assert_eq!("While", statement_label(&stream("while (x) { f(); }\n")));
    }

    #[test]
    fn test_expr_cascade_order() {
        assert_eq!("Lits", expr_label("x\n"));
        assert_eq!("Lits", expr_label("42\n"));
        assert_eq!("Assign", expr_label("x = 1\n"));
        assert_eq!("bin_+", expr_label("a + b\n"));
        // Lower precedence binds looser: the + splits before the *.
        assert_eq!("bin_+", expr_label("a * b + c\n"));
        assert_eq!("FnCall", expr_label("f ( 1 , 2 )\n"));
        assert_eq!("Member", expr_label("s . f\n"));
        assert_eq!("DerefMember", expr_label("p -> f\n"));
        assert_eq!("Nth", expr_label("a [ 3 ]\n"));
        assert_eq!("Inc", expr_label("x ++\n"));
        assert_eq!("Dec", expr_label("x --\n"));
        assert_eq!("pre_*", expr_label("* p\n"));
        assert_eq!("pre_&", expr_label("& x\n"));
        assert_eq!("Cond", expr_label("a ? b : c\n"));
        assert_eq!("InitList", expr_label("{ 1 , 2 }\n"));
        assert_eq!("StructDecl", expr_label("struct s { int x ; }\n"));
        assert_eq!("EnumDecl", expr_label("enum e { A , B }\n"));
    }

    #[test]
    fn test_unary_minus_not_binary() {
        // The leading lookahead keeps `- x` away from bin_-.
        assert_eq!("pre_-", expr_label("- x\n"));
    }

    #[test]
    fn test_parse_csv_respects_parens() {
        let s = stream("f ( a , b ) , c\n");
        let values = parse_csv(s.order(), &s, ",");
        assert_eq!(2, values.len());
        assert_eq!("f ( a , b )", s.render(&values[0]));
        assert_eq!("c", s.render(&values[1]));
    }

    #[test]
    fn test_parse_csv_single_and_empty() {
        let s = stream("a\n");
        assert_eq!(1, parse_csv(s.order(), &s, ",").len());
        assert!(parse_csv(&[], &s, ",").is_empty());
    }

    #[test]
    fn test_parse_macro_object_like() {
        let mac = parse_macro("#define FOO 4 + 2\n").unwrap();
        assert_eq!("FOO", mac.name);
        assert_eq!(None, mac.args);
        assert_eq!(
            vec![
                MacroPart::Text("4".into()),
                MacroPart::Text("+".into()),
                MacroPart::Text("2".into())
            ],
            mac.pattern
        );
    }

    #[test]
    fn test_parse_macro_function_like() {
        let mac = parse_macro("#define SQR(x) ((x)*(x))\n").unwrap();
        assert_eq!("SQR", mac.name);
        assert_eq!(Some(vec!["x".to_string()]), mac.args);
        assert!(mac.pattern.contains(&MacroPart::Arg(0)));
    }

    #[test]
    fn test_parse_macro_strify_and_paste() {
        let mac = parse_macro("#define NAME(a) #a ##a\n").unwrap();
        assert_eq!(
            vec![MacroPart::Strify(0), MacroPart::Pasteify(0)],
            mac.pattern
        );
    }

    #[test]
    fn test_parse_macro_other_directive() {
        assert_eq!(None, parse_macro("#include <linux/io.h>\n"));
    }

    #[test]
    fn test_find_cases() {
        let s = stream("case 1 : a = 1 ; break ; default : a = 2 ;\n");
        let cases = find_cases(s.order(), &s);
        assert_eq!(2, cases.len());
        assert_eq!("1", s.render(&cases[0].0));
        assert!(cases[1].0.is_empty());
    }

    #[test]
    fn test_find_stmts_skips_nested() {
        let s = stream("a = 1 ; while ( x ) { break ; } break ;\n");
        let found = find_stmts(s.order(), &s, &["Break"], &["For", "While", "DoWhile", "Switch"]);
        // Only the outer break: the one inside the while is skipped.
        assert_eq!(1, found.len());
    }
}
