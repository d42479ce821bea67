//! The expression interpreter: per expression form, emit the corresponding
//! mini-IR. Every sub-expression value is location-like — literals are stored
//! into fresh cells and dereferenced at their use sites — which is what lets
//! assignment, address-of and pointer arithmetic share one mechanism.

use crate::grammar::{parse_csv, parse_expr};
use crate::lexer::LexemeId;
use crate::peg::{relex, Peg, Tree};
use crate::rewrite::{fancy_rewrite, Subst};
use crate::trace::Payload;

use super::{skipped_tokens, EmitArg, Interpreter, InterpError, InterpResult, Step, ValueId};

impl Interpreter {
    /// Interpret an expression tree, recording its source span as the
    /// explanation for every value created underneath.
    pub fn interpret_expr(&mut self, tree: &Tree) -> InterpResult<Option<ValueId>> {
        self.trace.push_explanation(relex(tree));
        let result = self.interpret_expr_inner(tree);
        self.trace.pop_explanation();
        result
    }

    fn interpret_expr_inner(&mut self, tree: &Tree) -> InterpResult<Option<ValueId>> {
        let label = tree.label().to_string();
        match label.as_str() {
            "Member" => {
                let lhs = skipped_tokens(tree.child(0));
                let field = *relex(tree)
                    .last()
                    .ok_or_else(|| InterpError::Unimplemented("member access".into()))?;
                let field = self.stream.surface(field).to_string();
                self.emit(
                    "(field e{0} (imm {1}))",
                    &[EmitArg::Toks(lhs), EmitArg::Str(field)],
                )
            }
            "Comma" => {
                let lhs = skipped_tokens(tree.child(0));
                let rhs = tree
                    .child(1)
                    .map(relex)
                    .unwrap_or_default();
                self.reparse_and_eval(&lhs)?;
                self.reparse_and_eval(&rhs)
            }
            "Assign" => self.interpret_assign(tree),
            "Inc" => {
                let operand = skipped_tokens(tree.child(0));
                self.emit(
                    "(upd (+ (imm {0}) (* e{1})) e{1})",
                    &[EmitArg::Int(1), EmitArg::Toks(operand)],
                )
            }
            "Dec" => {
                let operand = skipped_tokens(tree.child(0));
                self.emit(
                    "(upd (- (* e{0}) (imm {1})) e{0})",
                    &[EmitArg::Toks(operand), EmitArg::Int(1)],
                )
            }
            "Lits" => self.interpret_lits(tree),
            "pre_sizeof" => self.rewrite_and_reparse(tree, "sizeof ...", "sizeof({0})"),
            "pre_!" => self.rewrite_and_reparse(tree, "! ...", "(({0}) == 0)"),
            "pre_*" => {
                let operand = relex_child(tree, 1)?;
                self.emit("(* e{0})", &[EmitArg::Toks(operand)])
            }
            "pre_&" => {
                let operand = relex_child(tree, 1)?;
                self.emit("(str e{0})", &[EmitArg::Toks(operand)])
            }
            "pre_++" => {
                let operand = relex_child(tree, 1)?;
                self.emit(
                    "(upd (+ (imm {0}) (* e{1})) e{1})",
                    &[EmitArg::Int(1), EmitArg::Toks(operand)],
                )
            }
            "pre_--" => {
                let operand = relex_child(tree, 1)?;
                self.emit(
                    "(upd (- (* e{0}) (imm {1})) e{0})",
                    &[EmitArg::Toks(operand), EmitArg::Int(1)],
                )
            }
            other if other.starts_with("pre_") => {
                let operand = relex_child(tree, 1)?;
                self.emit(
                    "(str ({0} (* e{1})))",
                    &[EmitArg::Str(other["pre_".len()..].to_string()), EmitArg::Toks(operand)],
                )
            }
            other if other.starts_with("bin_") => {
                let lhs = skipped_tokens(tree.child(0));
                let rhs = tree.child(1).map(relex).unwrap_or_default();
                self.emit(
                    "(str ({0} (* e{1}) (* e{2})))",
                    &[
                        EmitArg::Str(other.to_string()),
                        EmitArg::Toks(lhs),
                        EmitArg::Toks(rhs),
                    ],
                )
            }
            "Parens" => {
                let bal = tree
                    .child(0)
                    .ok_or_else(|| InterpError::Unimplemented("parens".into()))?;
                let inner = match bal.child(1) {
                    Some(Tree::Tokens(toks)) => toks.clone(),
                    _ => vec![],
                };
                self.reparse_and_eval(&inner)
            }
            "Cond" => self.rewrite_and_reparse(
                tree,
                "... ? ... : ...",
                "({{ goto_ite ({0}) [l1] [l2]; [l1]: [t] = ({1}); goto [l3]; \
                 [l2]: [t] = ({2}); [l3]: return [t]; }})",
            ),
            "Cast" => {
                // No cast semantics: evaluate the operand, ignore the type.
                let operand = tree.child(1).map(relex).unwrap_or_default();
                self.reparse_and_eval(&operand)
            }
            "DerefMember" => self.rewrite_and_reparse(tree, "...->...", "(*({0})).{1}"),
            "Nth" => self.rewrite_and_reparse(tree, "...[...]", "(*(({0}) + ({1})))"),
            "InitList" => self.interpret_init_list(tree),
            "StructDecl" => self.interpret_struct_decl(tree),
            "UnionDecl" => Ok(None),
            "EnumDecl" => self.interpret_enum_decl(tree),
            "FnCall" => self.interpret_fn_call(tree),
            other => Err(InterpError::Unimplemented(format!("expression {other:?}"))),
        }
    }

    fn reparse_and_eval(&mut self, toks: &[LexemeId]) -> InterpResult<Option<ValueId>> {
        let Some(expr) = parse_expr(toks, &self.stream) else {
            return Err(InterpError::Unimplemented(format!(
                "expression `{}`",
                self.stream.render(toks)
            )));
        };
        self.interpret_expr(&expr)
    }

    fn rewrite_and_reparse(
        &mut self,
        tree: &Tree,
        pattern_before: &str,
        pattern_after: &str,
    ) -> InterpResult<Option<ValueId>> {
        let (_, new) = fancy_rewrite(
            &mut self.stream,
            &mut self.trace,
            tree,
            pattern_before,
            pattern_after,
        )?;
        self.reparse_and_eval(&new)
    }

    fn interpret_assign(&mut self, tree: &Tree) -> InterpResult<Option<ValueId>> {
        let op_lex = match tree.child(0).and_then(|c| c.child(1)) {
            Some(Tree::Leaf(op)) => *op,
            _ => return Err(InterpError::Unimplemented("assignment operator".into())),
        };
        let op = self.stream.surface(op_lex).to_string();

        if op != "=" {
            if op.len() != 2 {
                return Err(InterpError::Unimplemented(format!("assignment {op}")));
            }
            let base = &op[..1];
            return self.rewrite_and_reparse(
                tree,
                &format!("...{op}..."),
                &format!("(({{0}}) = (({{0}}) {base} ({{1}})))"),
            );
        }

        let mut lhs = skipped_tokens(tree.child(0));
        let rhs = tree.child(1).map(relex).unwrap_or_default();

        let has_member = lhs
            .iter()
            .any(|&l| matches!(self.stream.surface(l), "." | "->"));
        let first_is_ident = lhs
            .first()
            .map(|&l| self.stream.label(l) == "ident")
            .unwrap_or(false);
        let ends_bracket = lhs
            .last()
            .map(|&l| self.stream.surface(l) == "]")
            .unwrap_or(false);
        let second_is_open = lhs
            .get(1)
            .map(|&l| self.stream.surface(l) == "[")
            .unwrap_or(false);

        if first_is_ident && ends_bracket && !has_member && !second_is_open {
            // `int a[10]`: a declaration; assign to the identifier alone.
            if let Some(open) = lhs.iter().position(|&l| self.stream.surface(l) == "[") {
                lhs = vec![lhs[open - 1]];
            }
        } else if first_is_ident && ends_bracket && !has_member && second_is_open {
            // `a[i] = …`: a real indexed store, keep the full lvalue.
        } else if first_is_ident && !has_member {
            // `int x` or `x`: take the identifier being declared.
            if let Some(&last) = lhs.last() {
                lhs = vec![last];
            }
        }

        self.emit(
            "(upd (* e{0}) e{1})",
            &[EmitArg::Toks(rhs), EmitArg::Toks(lhs)],
        )
    }

    fn interpret_lits(&mut self, tree: &Tree) -> InterpResult<Option<ValueId>> {
        let children = tree.children();
        let lits = &children[..children.len().saturating_sub(1)];
        let toks: Vec<LexemeId> = lits.iter().flat_map(relex).collect();

        if !toks.is_empty() && toks.iter().all(|&l| self.stream.label(l) == "strlit") {
            let mut decoded = String::new();
            for &l in &toks {
                let surface = self.stream.surface(l);
                let inner = if surface.len() >= 2 {
                    &surface[1..surface.len() - 1]
                } else {
                    surface
                };
                decoded.push_str(&unescape::unescape(inner).unwrap_or_else(|| inner.to_string()));
            }
            return self.emit("(str (imm {0}))", &[EmitArg::Str(decoded)]);
        }

        if lits.len() != 1 {
            // `unsigned long x`: a declaration-ish run of identifiers; the
            // last one is the name that matters.
            let last = *relex(tree)
                .last()
                .ok_or_else(|| InterpError::Unimplemented("empty literal run".into()))?;
            return self.reparse_and_eval(&[last]);
        }

        let lone = toks[0];
        match self.stream.label(lone) {
            "ident" => {
                let name = self.stream.surface(lone).to_string();
                Ok(Some(self.trace.local(&name)))
            }
            "numlit" => {
                let text = self.stream.surface(lone).to_string();
                let parsed = match text.strip_prefix("0x") {
                    Some(hex) => i64::from_str_radix(hex, 16),
                    None => text.parse(),
                };
                let n = parsed.map_err(|_| InterpError::BadLiteral(text))?;
                self.emit("(str (imm {0}))", &[EmitArg::Int(n)])
            }
            other => Err(InterpError::Unimplemented(format!("literal kind {other}"))),
        }
    }

    fn interpret_init_list(&mut self, tree: &Tree) -> InterpResult<Option<ValueId>> {
        let toks = relex(tree);

        if toks.iter().any(|&l| self.stream.surface(l) == "return") {
            // Statement-expression form: run the body in place until its
            // return is seen, then resume after the list.
            let resume = toks.last().and_then(|&l| self.stream.next_lexeme(l));
            self.trace.push_scope(&[], &[]);
            self.head = toks.get(1).copied();
            loop {
                match self.step() {
                    Ok(Step::Return(v)) => {
                        self.trace.pop_scope();
                        self.head = resume;
                        return Ok(v);
                    }
                    Ok(Step::Ran) => {}
                    Ok(Step::Eof) => {
                        self.trace.pop_scope();
                        return Err(InterpError::EndOfStream);
                    }
                    Err(e) => {
                        self.trace.pop_scope();
                        return Err(e);
                    }
                }
            }
        }

        let inner = &toks[1..toks.len().saturating_sub(1)];
        let fields: Vec<Vec<LexemeId>> = parse_csv(inner, &self.stream, ",")
            .into_iter()
            .filter(|f| !f.is_empty())
            .collect();
        let is_struct = fields
            .iter()
            .any(|f| f.first().map(|&l| self.stream.surface(l) == ".").unwrap_or(false));

        let new = if is_struct {
            self.lower_struct_init(&toks, &fields)?
        } else {
            self.lower_array_init(&toks, &fields)?
        };
        self.reparse_and_eval(&new)
    }

    /// `{ .a = 1, .b = 2 }` becomes a statement-expression filling the
    /// fields of a fresh local and returning it.
    fn lower_struct_init(
        &mut self,
        toks: &[LexemeId],
        fields: &[Vec<LexemeId>],
    ) -> InterpResult<Vec<LexemeId>> {
        let label = self.trace.gen_label();
        let mut parts = vec![Subst::Text("(".into()), Subst::Text("{".into())];
        for field in fields {
            let mut field = &field[..];
            while field.len() > 1 && self.stream.surface(field[0]).starts_with('#') {
                field = &field[1..];
            }
            parts.push(Subst::Text(label.clone()));
            parts.push(Subst::Toks(field.to_vec()));
            parts.push(Subst::Text(";".into()));
        }
        parts.push(Subst::Text(format!("return {label} ;")));
        parts.push(Subst::Text("}".into()));
        parts.push(Subst::Text(")".into()));
        Ok(self.stream.rewrite_parts(toks, &parts)?)
    }

    /// `{ 1, [4] = 2, 3 }` becomes a statement-expression storing through a
    /// running index counter, with designated indices routed through the
    /// `___ifconcr` sentinel so an opaque index leaves the counter alone.
    fn lower_array_init(
        &mut self,
        toks: &[LexemeId],
        fields: &[Vec<LexemeId>],
    ) -> InterpResult<Vec<LexemeId>> {
        let labels = self.trace.gen_labels(2);
        let (label, counter) = (&labels[0], &labels[1]);

        let mut field_peg = Peg::new();
        field_peg.rule("Field", "(? (seq (balanced [ ]) (str =))) (skipto (! (.)))");

        let mut parts = vec![
            Subst::Text("(".into()),
            Subst::Text("{".into()),
            Subst::Text(format!("{counter} = 0 ;")),
        ];
        for field in fields {
            let Some((ftree, _)) = field_peg.parse_rule("Field", field, &self.stream) else {
                return Err(InterpError::Unimplemented(format!(
                    "initializer field `{}`",
                    self.stream.render(field)
                )));
            };
            if ftree.children().len() == 2 {
                let designation = relex(&ftree.children()[0]);
                if designation.len() >= 3 {
                    let index = designation[1..designation.len() - 2].to_vec();
                    parts.push(Subst::Text(format!("{counter} = ___ifconcr (")));
                    parts.push(Subst::Toks(index));
                    parts.push(Subst::Text(format!(", {counter} ) ;")));
                }
            }
            let value = skipped_tokens(ftree.children().last());
            parts.push(Subst::Text(format!("{label} [ {counter} ] =")));
            parts.push(Subst::Toks(value));
            parts.push(Subst::Text(format!("; {counter} += 1 ;")));
        }
        parts.push(Subst::Text(format!("return {label} ;")));
        parts.push(Subst::Text("}".into()));
        parts.push(Subst::Text(")".into()));
        Ok(self.stream.rewrite_parts(toks, &parts)?)
    }

    fn interpret_struct_decl(&mut self, tree: &Tree) -> InterpResult<Option<ValueId>> {
        let inner = balanced_inner(tree)?;
        let mut fields = vec![];
        for field in parse_csv(&inner, &self.stream, ";") {
            let Some(&last) = field.last() else {
                continue;
            };
            let (mut type_toks, name) = if self.stream.surface(last) == "}" {
                (field.clone(), None)
            } else {
                (
                    field[..field.len() - 1].to_vec(),
                    Some(self.stream.surface(last).to_string()),
                )
            };
            if type_toks
                .first()
                .map(|&l| self.stream.surface(l) == "const")
                .unwrap_or(false)
            {
                type_toks.remove(0);
            }
            let ty = if type_toks.iter().any(|&l| self.stream.surface(l) == "{") {
                self.reparse_and_eval(&type_toks)?
            } else {
                None
            };
            fields.push((name, ty));
        }
        Ok(Some(self.trace.new_value(Payload::Fields(fields), true)))
    }

    fn interpret_enum_decl(&mut self, tree: &Tree) -> InterpResult<Option<ValueId>> {
        let inner = balanced_inner(tree)?;
        let mut options = vec![];
        let mut count: i64 = 0;
        for field in parse_csv(&inner, &self.stream, ",") {
            let (Some(&first), Some(&last)) = (field.first(), field.last()) else {
                continue;
            };
            let name = self.stream.surface(first).to_string();
            if field.iter().any(|&l| self.stream.surface(l) == "=") {
                let text = self.stream.surface(last).to_string();
                let parsed = match text.strip_prefix("0x") {
                    Some(hex) => i64::from_str_radix(hex, 16),
                    None => text.parse(),
                };
                count = parsed.map_err(|_| InterpError::BadLiteral(text))?;
            }
            options.push((name.clone(), count));
            count += 1;

            self.trace.push_explanation(relex(tree));
            let local = self.trace.local(&name);
            let bound = self.emit(
                "(upd (imm {0}) {1})",
                &[EmitArg::Int(count - 1), EmitArg::Val(local)],
            );
            self.trace.pop_explanation();
            bound?;
        }
        self.emit("(str (imm {0}))", &[EmitArg::Options(options)])
    }

    fn interpret_fn_call(&mut self, tree: &Tree) -> InterpResult<Option<ValueId>> {
        let skipto = tree
            .child(0)
            .ok_or_else(|| InterpError::Unimplemented("call".into()))?;
        let callee = skipped_tokens(Some(skipto));
        let args_inner = match skipto.child(1).and_then(|seq| seq.child(0)) {
            Some(bal) => match bal.child(1) {
                Some(Tree::Tokens(toks)) => toks.clone(),
                _ => vec![],
            },
            None => vec![],
        };

        if self.is_globals_pass && self.trace.scope_depth() == 1 && callee.len() > 1 {
            // Looks like a declaration, not a call.
            return Ok(None);
        }

        let mut values = vec![];
        for arg in parse_csv(&args_inner, &self.stream, ",") {
            if arg.is_empty() {
                continue;
            }
            let value = self
                .reparse_and_eval(&arg)?
                .ok_or_else(|| InterpError::Value("call argument".into()))?;
            values.push(value);
        }

        let name = callee
            .iter()
            .map(|&l| self.stream.surface(l))
            .collect::<Vec<_>>()
            .join(" ");

        if name == "___ifconcr" {
            let (Some(&first), Some(&second)) = (values.first(), values.get(1)) else {
                return Err(InterpError::Value("___ifconcr arguments".into()));
            };
            let possible = self
                .emit("(* {0})", &[EmitArg::Val(first)])?
                .ok_or_else(|| InterpError::Value("___ifconcr".into()))?;
            return Ok(Some(if self.trace.is_concrete(possible) {
                first
            } else {
                second
            }));
        }

        if let Some(handler) = self.fn_handler(&name) {
            return handler(self, &values);
        }
        if let Some(handler) = self.default_fn(&name) {
            return handler(self, tree, &callee, &values);
        }
        self.default_fn_handler(tree, &callee, &values)
    }
}

fn relex_child(tree: &Tree, index: usize) -> InterpResult<Vec<LexemeId>> {
    tree.child(index)
        .map(relex)
        .ok_or_else(|| InterpError::Unimplemented(format!("malformed {} node", tree.label())))
}

fn balanced_inner(tree: &Tree) -> InterpResult<Vec<LexemeId>> {
    let bal = tree
        .children()
        .iter()
        .rev()
        .find(|c| c.label() == "bal")
        .ok_or_else(|| InterpError::Unimplemented("declaration without braces".into()))?;
    match bal.child(1) {
        Some(Tree::Tokens(toks)) => Ok(toks.clone()),
        _ => Ok(vec![]),
    }
}

impl Interpreter {
    fn fn_handler(&self, name: &str) -> Option<super::FnHandler> {
        self.fn_handlers.get(name).cloned()
    }

    fn default_fn(&self, _name: &str) -> Option<super::DefaultFnHandler> {
        self.default_handler.clone()
    }
}
