//! # Interpreter Module
//!
//! The statement interpreter. One execution head walks the lexeme stream;
//! each step parses the smallest statement at the head and either emits
//! mini-IR for it directly or lowers it by rewriting its token range and
//! re-parsing. All control flow funnels through the synthetic
//! `goto_ite (cond) L1 L2;` statement, the only primitive control transfer.

mod expr;

use std::collections::HashMap;
use std::path::Path;
use std::rc::Rc;
use std::{error::Error, fmt::Display, fs};

use log::debug;

use crate::grammar::{find_stmts, parse_csv, parse_macro, parse_statement, MacroPart};
use crate::lexer::{lex_c, LexError, LexemeId, Stream};
use crate::peg::{compile_expr, parse_sexpr, relex, Match, Peg, Sexpr, Tree};
use crate::rewrite::{fancy_rewrite, Subst};
use crate::trace::{format_scalar, ImmVal, Ir, Trace, TraceError, ValueId};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InterpError {
    /// A statement or expression form the interpreter has no handler for.
    Unimplemented(String),
    /// Execution ran off the end of the stream where a statement was needed.
    EndOfStream,
    /// A `goto_ite` target with no `label :` anywhere in the stream.
    MissingLabel(String),
    /// The execution head was rewritten out of the live order.
    HeadLost,
    /// A literal that does not parse as a number.
    BadLiteral(String),
    /// An expression that was expected to produce a value produced none.
    Value(String),
    Lex(LexError),
    Trace(TraceError),
    Io(String),
}

pub type InterpResult<T> = Result<T, InterpError>;

impl Display for InterpError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            InterpError::Unimplemented(what) => write!(f, "unimplemented construct: {what}"),
            InterpError::EndOfStream => write!(f, "unexpected end of stream"),
            InterpError::MissingLabel(label) => write!(f, "no such label: {label}"),
            InterpError::HeadLost => write!(f, "execution head was rewritten away"),
            InterpError::BadLiteral(lit) => write!(f, "bad literal: {lit}"),
            InterpError::Value(what) => write!(f, "expected a value: {what}"),
            InterpError::Lex(e) => write!(f, "lex error: {e}"),
            InterpError::Trace(e) => write!(f, "trace error: {e}"),
            InterpError::Io(e) => write!(f, "io error: {e}"),
        }
    }
}

impl Error for InterpError {}

impl From<LexError> for InterpError {
    fn from(value: LexError) -> Self {
        InterpError::Lex(value)
    }
}

impl From<TraceError> for InterpError {
    fn from(value: TraceError) -> Self {
        InterpError::Trace(value)
    }
}

/// The outcome of a single step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Step {
    /// A statement was executed; the head moved.
    Ran,
    /// A `return` bubbled up to the caller.
    Return(Option<ValueId>),
    /// The head is null or no statement parses there.
    Eof,
}

/// Statement-level outcome used internally by the dispatcher.
enum Flow {
    Normal,
    Return(Option<ValueId>),
}

/// An argument to [`Interpreter::emit`]. `Toks` arguments can be spliced as
/// expressions with `e{i}` placeholders; everything else is `{i}` material.
#[derive(Debug, Clone)]
pub enum EmitArg {
    Val(ValueId),
    Toks(Vec<LexemeId>),
    Int(i64),
    Str(String),
    Fn(LexemeId, Vec<String>),
    Options(Vec<(String, i64)>),
}

/// A native handler for a source-level function, registered by the host.
pub type FnHandler = Rc<dyn Fn(&mut Interpreter, &[ValueId]) -> InterpResult<Option<ValueId>>>;

/// The fallback handler for callees without a registered handler. It also
/// receives the call's parse tree and callee lexemes.
pub type DefaultFnHandler =
    Rc<dyn Fn(&mut Interpreter, &Tree, &[LexemeId], &[ValueId]) -> InterpResult<Option<ValueId>>>;

/// A callback fired before executing a source line.
pub type BreakHandler = Rc<dyn Fn(&mut Interpreter) -> InterpResult<()>>;

pub struct Interpreter {
    pub stream: Stream,
    pub trace: Trace,
    head: Option<LexemeId>,
    fn_handlers: HashMap<String, FnHandler>,
    default_handler: Option<DefaultFnHandler>,
    /// Format specifiers per function name; calls to these functions print
    /// their arguments.
    pub verbose_fns: HashMap<String, Vec<String>>,
    /// Handlers fired before executing the given 1-based source line.
    pub break_lines: HashMap<usize, BreakHandler>,
    is_globals_pass: bool,
    find_fn_memo: HashMap<String, Option<(LexemeId, Vec<String>)>>,
}

impl Interpreter {
    /// Load and lex a source file.
    pub fn new(path: &Path) -> InterpResult<Self> {
        let source = fs::read_to_string(path).map_err(|e| InterpError::Io(e.to_string()))?;
        Self::from_source(&source)
    }

    /// Build an interpreter over source text directly.
    pub fn from_source(source: &str) -> InterpResult<Self> {
        let stream = lex_c(source)?;
        let head = stream.order().first().copied();
        Ok(Self {
            stream,
            trace: Trace::new(),
            head,
            fn_handlers: HashMap::new(),
            default_handler: None,
            verbose_fns: HashMap::new(),
            break_lines: HashMap::new(),
            is_globals_pass: false,
            find_fn_memo: HashMap::new(),
        })
    }

    pub fn head(&self) -> Option<LexemeId> {
        self.head
    }

    pub fn set_head(&mut self, head: LexemeId) {
        self.head = Some(head);
    }

    /// Line number of the execution head.
    pub fn current_line(&self) -> Option<usize> {
        self.head.map(|h| self.stream.line_number(h))
    }

    /// Set the execution head to the first lexeme at or after `line`.
    pub fn set_to_line(&mut self, line: usize) {
        self.head = self.stream.after_line_number(line);
    }

    /// Register a native handler for calls to `name`.
    pub fn register_fn(&mut self, name: &str, handler: FnHandler) {
        self.fn_handlers.insert(name.to_string(), handler);
    }

    /// Replace the fallback handler for unknown callees.
    pub fn register_default_fn(&mut self, handler: DefaultFnHandler) {
        self.default_handler = Some(handler);
    }

    pub fn explain_value(&self, v: ValueId) -> String {
        self.trace.explain(v, &self.stream)
    }

    pub fn opaque_reason(&self, v: ValueId) -> Option<String> {
        self.trace.opaque_reason(v, &self.stream)
    }

    /// Run step-until-end in globals mode: top-level statements execute,
    /// function bodies are registered but skipped, and calls that look like
    /// declarations are ignored.
    pub fn globals_pass(&mut self) -> InterpResult<()> {
        self.head = self.stream.order().first().copied();
        self.is_globals_pass = true;
        let result = loop {
            match self.step() {
                Ok(Step::Eof) => break Ok(()),
                Ok(_) => {}
                Err(InterpError::EndOfStream) => break Ok(()),
                Err(e) => break Err(e),
            }
        };
        self.is_globals_pass = false;
        result
    }

    /// Advance one statement. Returns [`Step::Return`] when a `return`
    /// bubbles to the top, [`Step::Eof`] at the end of the stream.
    pub fn step(&mut self) -> InterpResult<Step> {
        let Some(head) = self.head else {
            return Ok(Step::Eof);
        };

        let line = self.stream.line_number(head);
        if let Some(handler) = self.break_lines.get(&line).cloned() {
            handler(self)?;
        }
        let Some(head) = self.head else {
            return Ok(Step::Eof);
        };

        let start = self.stream.index_of(head).ok_or(InterpError::HeadLost)?;
        let input = self.stream.order()[start..].to_vec();
        debug!("executing line {line}");

        let Some((tree, _)) = parse_statement(&input, &self.stream) else {
            return Ok(Step::Eof);
        };

        match self.interpret(&tree)? {
            Flow::Normal => Ok(Step::Ran),
            Flow::Return(v) => Ok(Step::Return(v)),
        }
    }

    fn last_lexeme(&self, tree: &Tree) -> InterpResult<LexemeId> {
        relex(tree)
            .last()
            .copied()
            .ok_or_else(|| InterpError::Unimplemented("statement with no lexemes".into()))
    }

    fn interpret(&mut self, tree: &Tree) -> InterpResult<Flow> {
        match tree.label() {
            "Statement" => {
                let inner = tree
                    .child(0)
                    .ok_or_else(|| InterpError::Unimplemented("empty statement".into()))?
                    .clone();
                self.interpret(&inner)
            }
            "Function" => self.interpret_function(tree),
            "Preproc" => self.interpret_preproc(tree),
            "Label" => {
                let body = tree
                    .child(2)
                    .ok_or_else(|| InterpError::Unimplemented("label without a statement".into()))?;
                self.head = relex(body).first().copied();
                Ok(Flow::Normal)
            }
            "Return" => {
                let inner = skipped_tokens(tree.child(1));
                if inner.is_empty() {
                    return Ok(Flow::Return(None));
                }
                let expr = crate::grammar::parse_expr(&inner, &self.stream).ok_or_else(|| {
                    InterpError::Unimplemented(format!(
                        "return expression `{}`",
                        self.stream.render(&inner)
                    ))
                })?;
                let value = self.interpret_expr(&expr)?;
                Ok(Flow::Return(value))
            }
            "GotoITE" => self.interpret_goto_ite(tree),
            "Goto" => {
                let (_, new) = fancy_rewrite(
                    &mut self.stream,
                    &mut self.trace,
                    tree,
                    "goto ...;",
                    "goto_ite (1) {0} {0};",
                )?;
                self.head = new.first().copied();
                Ok(Flow::Normal)
            }
            "For" => {
                let body = relex(tree)[1..].to_vec();
                let (labels, new) = fancy_rewrite(
                    &mut self.stream,
                    &mut self.trace,
                    tree,
                    "for (...; ...; ...) ...",
                    "{0}; goto [lchk]; [lupd]: {2};\n\
                     [lchk]: goto_ite ({1}) [lloop] [lend];\n\
                     [lloop]: {3} goto [lupd];\n\
                     [lend]: 0;",
                )?;
                let lend = label_text(&labels, "lend")?;
                let lupd = label_text(&labels, "lupd")?;
                self.replace_stmts(
                    &body,
                    "Break",
                    &["For", "While", "DoWhile", "Switch"],
                    &format!("goto {lend}"),
                )?;
                self.replace_stmts(
                    &body,
                    "Continue",
                    &["For", "While", "DoWhile"],
                    &format!("goto {lupd}"),
                )?;
                self.head = new.first().copied();
                Ok(Flow::Normal)
            }
            "While" => {
                let body = relex(tree)[1..].to_vec();
                let (labels, new) = fancy_rewrite(
                    &mut self.stream,
                    &mut self.trace,
                    tree,
                    "while (...) ...",
                    "[lchk]: if ({0}) {{ {1} goto [lchk]; }} [lend]: 0;",
                )?;
                let lend = label_text(&labels, "lend")?;
                let lchk = label_text(&labels, "lchk")?;
                self.replace_stmts(
                    &body,
                    "Break",
                    &["For", "While", "DoWhile", "Switch"],
                    &format!("goto {lend}"),
                )?;
                self.replace_stmts(
                    &body,
                    "Continue",
                    &["For", "While", "DoWhile"],
                    &format!("goto {lchk}"),
                )?;
                self.head = new.first().copied();
                Ok(Flow::Normal)
            }
            "DoWhile" => {
                let body = relex(tree)[1..].to_vec();
                let (labels, new) = fancy_rewrite(
                    &mut self.stream,
                    &mut self.trace,
                    tree,
                    "do ... while (...) ;",
                    "[lloop]: {{ {0} }} [lchk]: goto_ite ({1}) [lloop] [lend]; [lend]: 0;",
                )?;
                let lend = label_text(&labels, "lend")?;
                let lchk = label_text(&labels, "lchk")?;
                self.replace_stmts(
                    &body,
                    "Break",
                    &["For", "While", "DoWhile", "Switch"],
                    &format!("goto {lend}"),
                )?;
                self.replace_stmts(
                    &body,
                    "Continue",
                    &["For", "While", "DoWhile"],
                    &format!("goto {lchk}"),
                )?;
                self.head = new.first().copied();
                Ok(Flow::Normal)
            }
            "IfStmt" => {
                let has_else = tree
                    .children()
                    .last()
                    .map(|c| c.label() == "?")
                    .unwrap_or(false);
                let (_, new) = if has_else {
                    fancy_rewrite(
                        &mut self.stream,
                        &mut self.trace,
                        tree,
                        "if (...) ... else ...",
                        "goto_ite ({0}) [lif] [lelse];\n\
                         [lif]: {{ {1} goto [lend]; }}\n\
                         [lelse]: {2}\n\
                         [lend]: 0;",
                    )?
                } else {
                    fancy_rewrite(
                        &mut self.stream,
                        &mut self.trace,
                        tree,
                        "if (...) ...",
                        "goto_ite ({0}) [lif] [lelse]; [lif]: {{ {1} }} [lelse]: 0;",
                    )?
                };
                self.head = new.first().copied();
                Ok(Flow::Normal)
            }
            "Switch" => self.interpret_switch(tree),
            "Block" => {
                let bal = tree
                    .child(0)
                    .ok_or_else(|| InterpError::Unimplemented("block without braces".into()))?;
                let inner = tokens_of(bal.child(1));
                self.head = inner.first().copied().or_else(|| match bal.child(2) {
                    Some(Tree::Leaf(close)) => Some(*close),
                    _ => None,
                });
                Ok(Flow::Normal)
            }
            "EndBlock" => {
                let close = self.last_lexeme(tree)?;
                self.head = self.stream.next_lexeme(close);
                Ok(Flow::Normal)
            }
            "Line" => {
                let last = self.last_lexeme(tree)?;
                let next = self.stream.next_lexeme(last);
                let inner = skipped_tokens(tree.child(0));
                if !inner.is_empty() {
                    let expr =
                        crate::grammar::parse_expr(&inner, &self.stream).ok_or_else(|| {
                            InterpError::Unimplemented(format!(
                                "expression `{}`",
                                self.stream.render(&inner)
                            ))
                        })?;
                    self.interpret_expr(&expr)?;
                }
                self.head = next;
                Ok(Flow::Normal)
            }
            other => Err(InterpError::Unimplemented(format!("statement {other:?}"))),
        }
    }

    fn interpret_function(&mut self, tree: &Tree) -> InterpResult<Flow> {
        let children = tree.children();
        let bal_idx = children
            .iter()
            .position(|c| c.label() == "bal")
            .filter(|&i| i > 0)
            .ok_or_else(|| InterpError::Unimplemented("function without a name".into()))?;

        let name_lex = *relex(&children[bal_idx - 1])
            .last()
            .ok_or_else(|| InterpError::Unimplemented("function without a name".into()))?;
        let name = self.stream.surface(name_lex).to_string();

        let (body_head, params) = self
            .find_fn(&name)?
            .ok_or_else(|| InterpError::Unimplemented(format!("body of function {name}")))?;

        let memloc = self.trace.local(&name);
        self.emit(
            "(upd (imm {0}) {1})",
            &[EmitArg::Fn(body_head, params), EmitArg::Val(memloc)],
        )?;

        let last = self.last_lexeme(tree)?;
        self.head = self.stream.next_lexeme(last);
        Ok(Flow::Normal)
    }

    fn interpret_preproc(&mut self, tree: &Tree) -> InterpResult<Flow> {
        let directive_lex = *relex(tree)
            .first()
            .ok_or_else(|| InterpError::Unimplemented("empty preprocessor line".into()))?;
        let directive = self.stream.surface(directive_lex).to_string();

        let Some(mac) = parse_macro(&directive) else {
            // Not a #define: skip the directive in place.
            self.head = self.stream.next_lexeme(directive_lex);
            return Ok(Flow::Normal);
        };
        debug!("expanding macro {}", mac.name);

        match &mac.args {
            None => {
                let pattern = mac
                    .pattern
                    .iter()
                    .map(|part| match part {
                        MacroPart::Text(t) => t.replace('{', "{{").replace('}', "}}"),
                        MacroPart::PasteifyStr(s) => s.clone(),
                        _ => String::new(),
                    })
                    .collect::<Vec<_>>()
                    .join(" ");
                let targets: Vec<LexemeId> = self
                    .stream
                    .suffix(directive_lex, false)
                    .into_iter()
                    .filter(|&l| self.stream.surface(l) == mac.name)
                    .collect();
                for target in targets {
                    self.stream
                        .rewrite(&[target], &pattern, &HashMap::new(), true)?;
                }
            }
            Some(_) => {
                let starts: Vec<LexemeId> = self
                    .stream
                    .suffix(directive_lex, false)
                    .into_iter()
                    .filter(|&l| {
                        self.stream.surface(l) == mac.name
                            && self
                                .stream
                                .next_lexeme(l)
                                .map(|n| self.stream.surface(n) == "(")
                                .unwrap_or(false)
                    })
                    .collect();
                for start in starts {
                    self.expand_macro_call(&mac, start)?;
                }
            }
        }

        self.head = self.stream.next_lexeme(directive_lex);
        self.stream
            .rewrite(&[directive_lex], "", &HashMap::new(), true)?;
        Ok(Flow::Normal)
    }

    fn expand_macro_call(
        &mut self,
        mac: &crate::grammar::Macro,
        start: LexemeId,
    ) -> InterpResult<()> {
        let Some(open) = self.stream.next_lexeme(start) else {
            return Ok(());
        };
        let mut all = vec![start, open];
        let mut call_args: Vec<Vec<LexemeId>> = vec![vec![]];
        let mut cursor = open;
        let mut depth = 0i32;
        loop {
            let Some(next) = self.stream.next_lexeme(cursor) else {
                return Err(InterpError::EndOfStream);
            };
            cursor = next;
            all.push(cursor);
            let surface = self.stream.surface(cursor);
            if surface == "(" {
                depth += 1;
            }
            if surface == ")" {
                depth -= 1;
            }
            if depth < 0 {
                break;
            }
            if surface == "," && depth == 0 {
                call_args.push(vec![]);
            } else if let Some(arg) = call_args.last_mut() {
                arg.push(cursor);
            }
        }

        let mut pattern = String::new();
        for part in &mac.pattern {
            match part {
                MacroPart::Text(t) => {
                    pattern.push(' ');
                    pattern.push_str(&t.replace('{', "{{").replace('}', "}}"));
                }
                MacroPart::Arg(i) => pattern.push_str(&format!(" {{{i}}}")),
                MacroPart::Strify(i) => {
                    let arg = call_args.get(*i).cloned().unwrap_or_default();
                    pattern.push_str(" \"");
                    pattern.push_str(&self.stream.render(&arg));
                    pattern.push('"');
                }
                MacroPart::Pasteify(i) => {
                    let arg = call_args.get(*i).cloned().unwrap_or_default();
                    pattern.push_str(&self.stream.render(&arg));
                }
                MacroPart::PasteifyStr(s) => pattern.push_str(s),
            }
        }

        let substitutions: HashMap<String, Subst> = call_args
            .iter()
            .enumerate()
            .map(|(i, toks)| (i.to_string(), Subst::Toks(toks.clone())))
            .collect();
        self.stream.rewrite(&all, &pattern, &substitutions, true)?;
        Ok(())
    }

    fn interpret_goto_ite(&mut self, tree: &Tree) -> InterpResult<Flow> {
        let cond_toks = relex(
            tree.child(1)
                .ok_or_else(|| InterpError::Unimplemented("goto_ite without condition".into()))?,
        );
        let cond_expr = crate::grammar::parse_expr(&cond_toks, &self.stream).ok_or_else(|| {
            InterpError::Unimplemented(format!(
                "goto_ite condition `{}`",
                self.stream.render(&cond_toks)
            ))
        })?;
        let cond = self
            .interpret_expr(&cond_expr)?
            .ok_or_else(|| InterpError::Value("goto_ite condition".into()))?;

        let (if_label, else_label) = match (tree.child(2), tree.child(3)) {
            (Some(Tree::Leaf(a)), Some(Tree::Leaf(b))) => (*a, *b),
            _ => return Err(InterpError::Unimplemented("goto_ite labels".into())),
        };

        self.trace.push_explanation(relex(tree));
        let result = self.goto_ite_branch(cond, if_label, else_label);
        self.trace.pop_explanation();
        result
    }

    fn goto_ite_branch(
        &mut self,
        cond: ValueId,
        if_label: LexemeId,
        else_label: LexemeId,
    ) -> InterpResult<Flow> {
        let cond_value = self
            .emit("(* {0})", &[EmitArg::Val(cond)])?
            .ok_or_else(|| InterpError::Value("goto_ite condition".into()))?;
        let taken = self.trace.cval(cond_value).truthy();

        if taken {
            self.emit(
                "(assert (!= (* {0}) (imm {1})))",
                &[EmitArg::Val(cond), EmitArg::Int(0)],
            )?;
            self.jump_to_label(if_label)?;
        } else {
            self.emit(
                "(assert (== (* {0}) (imm {1})))",
                &[EmitArg::Val(cond), EmitArg::Int(0)],
            )?;
            self.jump_to_label(else_label)?;
        }
        Ok(Flow::Normal)
    }

    /// Linear search for `label :` over the whole stream. Labels are assumed
    /// globally unique.
    fn jump_to_label(&mut self, label_lex: LexemeId) -> InterpResult<()> {
        let wanted = self.stream.surface(label_lex).to_string();
        let target = self
            .stream
            .order()
            .iter()
            .copied()
            .find(|&l| {
                self.stream.surface(l) == wanted
                    && self
                        .stream
                        .next_lexeme(l)
                        .map(|n| self.stream.surface(n) == ":")
                        .unwrap_or(false)
            })
            .ok_or(InterpError::MissingLabel(wanted.clone()))?;
        self.head = Some(target);
        Ok(())
    }

    fn interpret_switch(&mut self, tree: &Tree) -> InterpResult<Flow> {
        let old_toks = relex(tree);
        let inner = switch_body_tokens(tree).ok_or_else(|| {
            InterpError::Unimplemented("switch without a braced body".into())
        })?;

        let (labels, new) = fancy_rewrite(
            &mut self.stream,
            &mut self.trace,
            tree,
            "switch (...) ...",
            "auto [val] = ({0}); goto [lend]; {{ {1} }} [lend]: 0;",
        )?;
        let lend = label_text(&labels, "lend")?;
        let val = label_text(&labels, "val")?;

        let insert_before = new
            .iter()
            .copied()
            .find(|&l| {
                self.stream.surface(l) == "goto"
                    && self
                        .stream
                        .next_lexeme(l)
                        .map(|n| self.stream.surface(n) == lend)
                        .unwrap_or(false)
            })
            .ok_or_else(|| InterpError::Unimplemented("switch dispatch anchor".into()))?;

        self.replace_stmts(
            &old_toks[1..],
            "Break",
            &["For", "While", "DoWhile", "Switch"],
            &format!("goto {lend}"),
        )?;

        let mut default_label = lend.clone();
        let mut fallthrough = self.trace.gen_label();
        for (value_toks, case_tree) in crate::grammar::find_cases(&inner, &self.stream) {
            let (case_labels, _) = fancy_rewrite(
                &mut self.stream,
                &mut self.trace,
                &case_tree,
                "...",
                "[label]:",
            )?;
            let label = label_text(&case_labels, "label")?;

            if value_toks.is_empty() {
                default_label = label;
            } else {
                let next = self.trace.gen_label();
                let mut subs = HashMap::new();
                subs.insert("value".to_string(), Subst::Toks(value_toks.clone()));
                self.stream.prepend(
                    insert_before,
                    &format!("{fallthrough}: goto_ite ({val} == ({{value}})) {label} {next};"),
                    &subs,
                )?;
                fallthrough = next;
            }
        }
        self.stream.prepend(
            insert_before,
            &format!("{fallthrough}: goto {default_label};"),
            &HashMap::new(),
        )?;

        self.head = new.first().copied();
        Ok(Flow::Normal)
    }

    /// Find statements of one type inside a token range and replace their
    /// leading token. Used to retarget `break`/`continue` at lowering time.
    fn replace_stmts(
        &mut self,
        lexemes: &[LexemeId],
        wanted: &str,
        skip: &[&str],
        replacement: &str,
    ) -> InterpResult<()> {
        let found = find_stmts(lexemes, &self.stream, &[wanted], skip);
        for tree in found {
            let Some(&first) = relex(&tree).first() else {
                continue;
            };
            self.stream
                .rewrite(&[first], replacement, &HashMap::new(), true)?;
        }
        Ok(())
    }

    /// Locate a function definition by name in the stream; memoised.
    pub fn find_fn(&mut self, name: &str) -> InterpResult<Option<(LexemeId, Vec<String>)>> {
        if let Some(hit) = self.find_fn_memo.get(name) {
            return Ok(hit.clone());
        }

        let order = self.stream.order().to_vec();
        let mut result = None;
        for (i, &lexeme) in order.iter().enumerate() {
            if self.stream.surface(lexeme) != name {
                continue;
            }
            let Some((tree, _)) = parse_statement(&order[i..], &self.stream) else {
                continue;
            };
            let Some(inner) = tree.children().first() else {
                continue;
            };
            if inner.label() != "Function" {
                continue;
            }
            let children = inner.children();
            let Some(bal_idx) = children.iter().position(|c| c.label() == "bal") else {
                continue;
            };
            let (Some(params_bal), Some(body_bal)) =
                (children.get(bal_idx), children.get(bal_idx + 1))
            else {
                continue;
            };

            let params_inner = tokens_of(params_bal.child(1));
            let params: Vec<String> = parse_csv(&params_inner, &self.stream, ",")
                .iter()
                .filter_map(|p| p.last().map(|&l| self.stream.surface(l).to_string()))
                .collect();
            let Some(Tree::Leaf(body_open)) = body_bal.child(0) else {
                continue;
            };
            result = Some((*body_open, params));
            break;
        }

        self.find_fn_memo.insert(name.to_string(), result.clone());
        Ok(result)
    }

    /// Ensure the balanced body starting at `body_head` ends with `return;`.
    pub fn returnify_fn(&mut self, body_head: LexemeId) -> InterpResult<()> {
        let suffix = self.stream.suffix(body_head, true);
        let braces = compile_expr("(balanced { })")
            .map_err(|e| InterpError::Unimplemented(e.0))?;
        let peg = Peg::new();
        let Some((Match::Tree(bal), _)) = peg.parse(&braces, &suffix, &self.stream) else {
            return Err(InterpError::Unimplemented("function body braces".into()));
        };
        let toks = relex(&bal);
        if toks.len() >= 3 && self.stream.surface(toks[toks.len() - 3]) == "return" {
            return Ok(());
        }
        let Some(&close) = toks.last() else {
            return Err(InterpError::Unimplemented("function body braces".into()));
        };
        self.stream.prepend(close, "return ;", &HashMap::new())?;
        Ok(())
    }

    /// Inject `void ___ssi_code(){ return <template>; }` at the front of the
    /// stream, bind `{i}` placeholders to the given values in a fresh scope,
    /// run it to its return, and restore the head.
    pub fn exec_c(&mut self, template: &str, args: &[ValueId]) -> InterpResult<Option<ValueId>> {
        let labels = self.trace.gen_labels(args.len());
        let mut body = template.to_string();
        for (i, label) in labels.iter().enumerate() {
            body = body.replace(&format!("{{{i}}}"), &format!(" {label} "));
        }
        let body = body.replace('{', "{{").replace('}', "}}");
        let pattern = format!("void ___ssi_code() {{{{ return {body}; }}}}");

        let Some(&first) = self.stream.order().first() else {
            return Err(InterpError::EndOfStream);
        };
        let new = self.stream.prepend(first, &pattern, &HashMap::new())?;

        let old_head = self.head;
        self.head = new
            .iter()
            .copied()
            .find(|&l| self.stream.surface(l) == "return");
        self.trace.push_scope(&labels, args);

        let mut value = None;
        let outcome = loop {
            match self.step() {
                Ok(Step::Return(v)) => {
                    value = v;
                    break Ok(());
                }
                Ok(Step::Ran) => {}
                Ok(Step::Eof) => break Err(InterpError::EndOfStream),
                Err(e) => break Err(e),
            }
        };

        self.trace.pop_scope();
        self.head = old_head;
        outcome?;
        Ok(value)
    }

    /// The built-in fallback for calls without a registered handler: print
    /// verbose snapshots, find the function's body, copy the arguments, and
    /// run it to its return. A callee with no body yields a fresh opaque.
    pub fn default_fn_handler(
        &mut self,
        tree: &Tree,
        fn_lexemes: &[LexemeId],
        args: &[ValueId],
    ) -> InterpResult<Option<ValueId>> {
        let call_toks = relex(tree);
        if let Some(&first) = call_toks.first() {
            let name = self.stream.surface(first).to_string();
            if let Some(formats) = self.verbose_fns.get(&name).cloned() {
                self.print_verbose_call(&call_toks, &formats, args)?;
            }
        }

        let Some(&callee) = fn_lexemes.first() else {
            return Ok(Some(self.trace.opaque()));
        };
        let name = self.stream.surface(callee).to_string();
        let Some((body_head, params)) = self.find_fn(&name)? else {
            debug!("no body for {name}; yielding an opaque result");
            return Ok(Some(self.trace.opaque()));
        };

        self.returnify_fn(body_head)?;

        // Arguments are copied by value; the copy is a pointer copy, the
        // pointed-to contents are shared.
        let mut copies = vec![];
        for &arg in args {
            let copy = self
                .emit("(str (* {0}))", &[EmitArg::Val(arg)])?
                .ok_or_else(|| InterpError::Value("argument copy".into()))?;
            copies.push(copy);
        }
        self.trace.push_scope(&params, &copies);
        self.head = Some(body_head);

        loop {
            match self.step()? {
                Step::Return(v) => {
                    self.trace.pop_scope();
                    return Ok(v);
                }
                Step::Ran => {}
                Step::Eof => {
                    self.trace.pop_scope();
                    return Err(InterpError::EndOfStream);
                }
            }
        }
    }

    fn print_verbose_call(
        &mut self,
        call_toks: &[LexemeId],
        formats: &[String],
        args: &[ValueId],
    ) -> InterpResult<()> {
        let line = call_toks
            .first()
            .map(|&l| self.stream.line_number(l))
            .unwrap_or(0);
        let mut rendered = vec![];
        for (arg, fmt) in args.iter().zip(formats.iter()) {
            let value = self.emit("(* {0})", &[EmitArg::Val(*arg)])?;
            match value {
                Some(v) if self.trace.is_concrete(v) => {
                    rendered.push(format_scalar(self.trace.cval(v), fmt));
                }
                _ => rendered.push("[opaque value]".to_string()),
            }
        }
        println!(
            "Line {line}: {} => {}",
            self.stream.span_text(call_toks),
            rendered.join(", ")
        );
        Ok(())
    }

    // ------------------------------------------------------------------
    // The mini-IR emitter
    // ------------------------------------------------------------------

    /// Parse an S-expression template, splice the arguments, and hand the
    /// result to the trace. `e{i}` interprets the i-th argument (a lexeme
    /// list) as an expression and inlines the resulting value; `{i}` splices
    /// the raw argument.
    pub fn emit(&mut self, pattern: &str, args: &[EmitArg]) -> InterpResult<Option<ValueId>> {
        let sexpr = parse_sexpr(pattern)
            .map_err(|e| InterpError::Unimplemented(format!("IR template: {}", e.0)))?;
        let ir = self.build_ir(&sexpr, args)?;
        Ok(self.trace.emit(&ir)?)
    }

    fn build_ir(&mut self, sexpr: &Sexpr, args: &[EmitArg]) -> InterpResult<Ir> {
        match sexpr {
            Sexpr::Atom(atom) => self.build_ir_atom(atom, args),
            Sexpr::List(items) => {
                let Some(Sexpr::Atom(head)) = items.first() else {
                    return Err(InterpError::Unimplemented(format!(
                        "IR form {items:?}"
                    )));
                };
                let head = match placeholder_index(head) {
                    Some(i) => match args.get(i) {
                        Some(EmitArg::Str(op)) => op.clone(),
                        other => {
                            return Err(InterpError::Value(format!(
                                "operator placeholder bound to {other:?}"
                            )))
                        }
                    },
                    None => head.clone(),
                };
                let mut ir_args = vec![];
                for item in &items[1..] {
                    ir_args.push(self.build_ir(item, args)?);
                }
                Ok(Ir::Op(head, ir_args))
            }
        }
    }

    fn build_ir_atom(&mut self, atom: &str, args: &[EmitArg]) -> InterpResult<Ir> {
        if let Some(i) = expr_placeholder_index(atom) {
            let toks = match args.get(i) {
                Some(EmitArg::Toks(toks)) => toks.clone(),
                Some(EmitArg::Val(v)) => return Ok(Ir::Val(*v)),
                other => {
                    return Err(InterpError::Value(format!(
                        "expression placeholder bound to {other:?}"
                    )))
                }
            };
            let expr = crate::grammar::parse_expr(&toks, &self.stream).ok_or_else(|| {
                InterpError::Unimplemented(format!(
                    "spliced expression `{}`",
                    self.stream.render(&toks)
                ))
            })?;
            let value = self
                .interpret_expr(&expr)?
                .ok_or_else(|| InterpError::Value("spliced expression".into()))?;
            return Ok(Ir::Val(value));
        }
        if let Some(i) = placeholder_index(atom) {
            return match args.get(i) {
                Some(EmitArg::Val(v)) => Ok(Ir::Val(*v)),
                Some(EmitArg::Int(n)) => Ok(Ir::Imm(ImmVal::Int(*n))),
                Some(EmitArg::Str(s)) => Ok(Ir::Imm(ImmVal::Str(s.clone()))),
                Some(EmitArg::Fn(head, params)) => {
                    Ok(Ir::Imm(ImmVal::Fn(*head, params.clone())))
                }
                Some(EmitArg::Options(options)) => {
                    Ok(Ir::Imm(ImmVal::Options(options.clone())))
                }
                other => Err(InterpError::Value(format!(
                    "placeholder {atom} bound to {other:?}"
                ))),
            };
        }
        if let Ok(n) = atom.parse::<i64>() {
            return Ok(Ir::Imm(ImmVal::Int(n)));
        }
        Err(InterpError::Unimplemented(format!("IR atom {atom:?}")))
    }
}

fn placeholder_index(atom: &str) -> Option<usize> {
    atom.strip_prefix('{')?.strip_suffix('}')?.parse().ok()
}

fn expr_placeholder_index(atom: &str) -> Option<usize> {
    atom.strip_prefix("e{")?.strip_suffix('}')?.parse().ok()
}

fn label_text(labels: &HashMap<String, Subst>, name: &str) -> InterpResult<String> {
    labels
        .get(name)
        .and_then(Subst::as_text)
        .map(str::to_string)
        .ok_or_else(|| InterpError::Unimplemented(format!("missing generated label {name}")))
}

/// The skipped tokens of a `skipto` node.
fn skipped_tokens(tree: Option<&Tree>) -> Vec<LexemeId> {
    match tree.and_then(|t| t.child(0)) {
        Some(Tree::Tokens(toks)) => toks.clone(),
        _ => vec![],
    }
}

fn tokens_of(tree: Option<&Tree>) -> Vec<LexemeId> {
    match tree {
        Some(Tree::Tokens(toks)) => toks.clone(),
        _ => vec![],
    }
}

/// The inner tokens of a switch's braced body.
fn switch_body_tokens(tree: &Tree) -> Option<Vec<LexemeId>> {
    let body = tree.child(2)?;
    let block = body.child(0)?;
    if block.label() != "Block" {
        return None;
    }
    let bal = block.child(0)?;
    match bal.child(1) {
        Some(Tree::Tokens(toks)) => Some(toks.clone()),
        _ => None,
    }
}
