//! # Trace Module
//!
//! The symbolic execution engine: a single execution trace over a tree of
//! memory cells whose contents are equivalence classes of values. Values are
//! concrete scalars, pointers to memory nodes, opaque symbols, or deferred
//! expressions; reading a value follows its canonical chain, and
//! concretisation rewrites the chain tail exactly once.
//!
//! Values, memory nodes and explanation frames all live in arenas indexed by
//! small copyable handles, which keeps the value/memory reference graph
//! cycle-free by construction.

mod memory;
mod value;

pub use memory::*;
pub use value::*;

use std::collections::HashMap;
use std::{error::Error, fmt::Display};

use colored::Colorize;

use crate::lexer::{LexemeId, Stream};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TraceError {
    NotAPointer(String),
    TypeMismatch(String),
    Arithmetic(String),
    BadAddress(String),
    Unimplemented(String),
}

pub type TraceResult<T> = Result<T, TraceError>;

impl Display for TraceError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TraceError::NotAPointer(msg) => write!(f, "not a pointer: {msg}"),
            TraceError::TypeMismatch(msg) => write!(f, "type mismatch: {msg}"),
            TraceError::Arithmetic(msg) => write!(f, "arithmetic error: {msg}"),
            TraceError::BadAddress(msg) => write!(f, "bad memory address: {msg}"),
            TraceError::Unimplemented(msg) => write!(f, "unimplemented operation: {msg}"),
        }
    }
}

impl Error for TraceError {}

/// Handle to a value in the trace arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ValueId(u32);

impl ValueId {
    pub(crate) fn idx(self) -> usize {
        self.0 as usize
    }
}

/// Handle to a memory node in the trace arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MemId(u32);

impl MemId {
    pub(crate) fn idx(self) -> usize {
        self.0 as usize
    }
}

/// An equivalence-class element. `canonical` forwards to the class
/// representative; it points back at the value itself until concretisation.
#[derive(Debug, Clone)]
pub struct ValueData {
    pub payload: Payload,
    pub concrete: bool,
    pub(crate) canonical: ValueId,
    pub(crate) explanation: usize,
    pub recursive_mem: bool,
}

/// The source span that produced a value, plus the values that fed into it.
#[derive(Debug, Clone)]
struct ExplFrame {
    span: Option<Vec<LexemeId>>,
    children: Vec<ValueId>,
}

/// An immediate operand of the mini-IR.
#[derive(Debug, Clone)]
pub enum ImmVal {
    Int(i64),
    Str(String),
    Fn(LexemeId, Vec<String>),
    Options(Vec<(String, i64)>),
}

/// The mini-IR: nested operations whose leaves are values or immediates.
#[derive(Debug, Clone)]
pub enum Ir {
    Val(ValueId),
    Imm(ImmVal),
    Op(String, Vec<Ir>),
}

/// A single execution trace.
pub struct Trace {
    pub(crate) values: Vec<ValueData>,
    pub(crate) nodes: Vec<MemNode>,
    root: MemId,
    scopes: Vec<HashMap<String, ValueId>>,
    pub(crate) offsets: HashMap<String, i64>,
    counter: u64,
    frames: Vec<ExplFrame>,
    frame_stack: Vec<usize>,
    stmt_expl: Vec<Option<Vec<LexemeId>>>,
    pause: u32,
    assertions: Vec<ValueId>,
}

impl Default for Trace {
    fn default() -> Self {
        Self::new()
    }
}

impl Trace {
    pub fn new() -> Self {
        let mut trace = Self {
            values: vec![],
            nodes: vec![],
            root: MemId(0),
            scopes: vec![HashMap::new()],
            offsets: HashMap::new(),
            counter: 0,
            frames: vec![],
            frame_stack: vec![],
            stmt_expl: vec![None],
            pause: 0,
            assertions: vec![],
        };
        let root_value = trace.opaque();
        trace.nodes.push(MemNode {
            parent: None,
            address: vec![],
            children: vec![],
            value: root_value,
        });
        trace
    }

    // ------------------------------------------------------------------
    // Values and canonicalisation
    // ------------------------------------------------------------------

    pub fn new_value(&mut self, payload: Payload, concrete: bool) -> ValueId {
        let explanation = match self.frame_stack.last() {
            Some(&frame) => frame,
            None => self.new_frame(),
        };
        let id = ValueId(self.values.len() as u32);
        self.values.push(ValueData {
            payload,
            concrete,
            canonical: id,
            explanation,
            recursive_mem: false,
        });
        id
    }

    /// Follow the canonical chain to the class representative.
    pub fn canon(&self, v: ValueId) -> ValueId {
        let mut current = v;
        loop {
            let next = self.values[current.idx()].canonical;
            if next == current {
                return current;
            }
            current = next;
        }
    }

    /// The canonical payload.
    pub fn cval(&self, v: ValueId) -> &Payload {
        &self.values[self.canon(v).idx()].payload
    }

    /// The value's own payload, canonical chain not followed.
    pub fn payload(&self, v: ValueId) -> &Payload {
        &self.values[v.idx()].payload
    }

    pub fn is_concrete(&self, v: ValueId) -> bool {
        self.values[self.canon(v).idx()].concrete
    }

    fn uid(&mut self) -> u64 {
        self.counter += 1;
        self.counter - 1
    }

    /// Fresh unique identifiers for synthesised labels.
    pub fn gen_labels(&mut self, count: usize) -> Vec<String> {
        (0..count).map(|_| format!("___l{}", self.uid())).collect()
    }

    pub fn gen_label(&mut self) -> String {
        format!("___l{}", self.uid())
    }

    pub fn opaque(&mut self) -> ValueId {
        let id = self.uid();
        self.new_value(Payload::Opaque(id), false)
    }

    pub fn imm_int(&mut self, n: i64) -> ValueId {
        self.new_value(Payload::Int(n), true)
    }

    pub fn imm_str(&mut self, s: &str) -> ValueId {
        self.new_value(Payload::Str(s.to_string()), true)
    }

    fn imm_value(&mut self, imm: &ImmVal) -> ValueId {
        let payload = match imm {
            ImmVal::Int(n) => Payload::Int(*n),
            ImmVal::Str(s) => Payload::Str(s.clone()),
            ImmVal::Fn(head, params) => Payload::Fn(*head, params.clone()),
            ImmVal::Options(options) => Payload::Options(options.clone()),
        };
        self.new_value(payload, true)
    }

    // ------------------------------------------------------------------
    // Scopes
    // ------------------------------------------------------------------

    pub fn push_scope(&mut self, names: &[String], values: &[ValueId]) {
        let scope = names
            .iter()
            .cloned()
            .zip(values.iter().copied())
            .collect::<HashMap<_, _>>();
        self.scopes.push(scope);
    }

    pub fn pop_scope(&mut self) {
        if self.scopes.len() > 1 {
            self.scopes.pop();
        }
    }

    pub fn scope_depth(&self) -> usize {
        self.scopes.len()
    }

    /// Resolve a name, outermost scope first; a miss creates an opaque local
    /// in the innermost frame.
    pub fn local(&mut self, name: &str) -> ValueId {
        for scope in &self.scopes {
            if let Some(&v) = scope.get(name) {
                return v;
            }
        }
        let v = self.opaque();
        if let Some(innermost) = self.scopes.last_mut() {
            innermost.insert(name.to_string(), v);
        }
        v
    }

    // ------------------------------------------------------------------
    // Explanations
    // ------------------------------------------------------------------

    fn new_frame(&mut self) -> usize {
        let span = self.stmt_expl.last().cloned().flatten();
        self.frames.push(ExplFrame {
            span,
            children: vec![],
        });
        self.frames.len() - 1
    }

    /// Enter a source span; values created inside snapshot it. Suppressed
    /// while frozen.
    pub fn push_explanation(&mut self, span: Vec<LexemeId>) {
        if self.pause == 0 {
            self.stmt_expl.push(Some(span));
        }
    }

    pub fn pop_explanation(&mut self) {
        if self.pause == 0 && self.stmt_expl.len() > 1 {
            self.stmt_expl.pop();
        }
    }

    /// Stop recording explanations, e.g. while running synthesised code.
    pub fn freeze_explanations(&mut self) {
        self.pause += 1;
    }

    pub fn thaw_explanations(&mut self) {
        self.pause = self.pause.saturating_sub(1);
    }

    /// Pretty tree of how a value came to be.
    pub fn explain(&self, v: ValueId, stream: &Stream) -> String {
        let mut out = String::new();
        self.explain_into(v, stream, 0, &mut out);
        out
    }

    fn explain_into(&self, v: ValueId, stream: &Stream, depth: usize, out: &mut String) {
        let indent = "|   ".repeat(depth);
        let payload = self.render_payload(self.cval(v));
        out.push_str(&format!("{indent}Value: {payload}\n"));

        let frame = &self.frames[self.values[v.idx()].explanation];
        let indent = "|   ".repeat(depth + 1);
        match &frame.span {
            Some(span) if !span.is_empty() => {
                let text = stream.render(span);
                let line = format!("on line {}", stream.line_number(span[0]));
                out.push_str(&format!("{indent}Explanation: {text} {}\n", line.dimmed()));
            }
            _ => out.push_str(&format!("{indent}Explanation: <top level>\n")),
        }
        for &child in frame.children.clone().iter() {
            self.explain_into(child, stream, depth + 1, out);
        }
    }

    /// The deepest source span responsible for this value being opaque.
    pub fn opaque_reason(&self, v: ValueId, stream: &Stream) -> Option<String> {
        if let Payload::Opaque(_) = self.cval(v) {
            let frame = &self.frames[self.values[v.idx()].explanation];
            return Some(match &frame.span {
                Some(span) if !span.is_empty() => format!(
                    "{} on line {}",
                    stream.render(span),
                    stream.line_number(span[0])
                ),
                _ => "<top level>".to_string(),
            });
        }
        let frame = &self.frames[self.values[v.idx()].explanation];
        frame
            .children
            .clone()
            .iter()
            .find_map(|&child| self.opaque_reason(child, stream))
    }

    pub(crate) fn render_payload(&self, payload: &Payload) -> String {
        match payload {
            Payload::Int(n) => n.to_string(),
            Payload::Str(s) => format!("{s:?}"),
            Payload::Mem(m) => format!("<mem {:?}>", self.node(*m).address),
            Payload::Opaque(id) => format!("opaque#{id}"),
            Payload::Deferred(op, args) => format!("({} /{} args/)", op.symbol(), args.len()),
            Payload::Fn(_, params) => format!("<fn({})>", params.join(", ")),
            Payload::Options(options) => format!("<enum {} options>", options.len()),
            Payload::Fields(fields) => format!("<struct {} fields>", fields.len()),
            Payload::Summary(_, parts) => format!("<memory summary, {} children>", parts.len()),
        }
    }

    // ------------------------------------------------------------------
    // Assertions
    // ------------------------------------------------------------------

    /// Conditions recorded along the single taken path. Inert for now; a
    /// constraint store can attach here later.
    pub fn assertions(&self) -> &[ValueId] {
        &self.assertions
    }

    // ------------------------------------------------------------------
    // Arithmetic
    // ------------------------------------------------------------------

    /// Lifted operator application: concrete inputs are computed through,
    /// anything else produces a deferred value.
    pub fn operate(&mut self, op: Op, values: Vec<ValueId>) -> TraceResult<ValueId> {
        if !values.iter().all(|&v| self.is_concrete(v)) {
            return Ok(self.new_value(Payload::Deferred(op, values), false));
        }
        let payloads: Vec<Payload> = values.iter().map(|&v| self.cval(v).clone()).collect();
        let result = self.apply(op, &payloads)?;
        Ok(self.new_value(result, true))
    }

    fn bool_payload(b: bool) -> Payload {
        Payload::Int(b as i64)
    }

    pub(crate) fn apply(&mut self, op: Op, payloads: &[Payload]) -> TraceResult<Payload> {
        use Payload::*;

        match (op, payloads) {
            (Op::Neg, [Int(a)]) => Ok(Int(a.wrapping_neg())),
            (Op::BitNot, [Int(a)]) => Ok(Int(!a)),
            (Op::Add, [Mem(m), Int(k)]) | (Op::Add, [Int(k), Mem(m)]) => {
                Ok(Mem(self.mem_add(*m, *k)?))
            }
            (Op::Sub, [Mem(m), Int(k)]) => Ok(Mem(self.mem_add(*m, -k)?)),
            (Op::Eq, [Mem(a), Mem(b)]) => Ok(Self::bool_payload(a == b)),
            (Op::Ne, [Mem(a), Mem(b)]) => Ok(Self::bool_payload(a != b)),
            (Op::Add, [Str(a), Str(b)]) => Ok(Str(format!("{a}{b}"))),
            (Op::Eq, [Str(a), Str(b)]) => Ok(Self::bool_payload(a == b)),
            (Op::Ne, [Str(a), Str(b)]) => Ok(Self::bool_payload(a != b)),
            (_, [Int(a), Int(b)]) => {
                let (a, b) = (*a, *b);
                let result = match op {
                    Op::Add => Int(a.wrapping_add(b)),
                    Op::Sub => Int(a.wrapping_sub(b)),
                    Op::Mul => Int(a.wrapping_mul(b)),
                    Op::Div => {
                        if b == 0 {
                            return Err(TraceError::Arithmetic("division by zero".into()));
                        }
                        // Floor division: rounds towards negative infinity
                        // for either sign of the divisor.
                        let mut q = a / b;
                        if a % b != 0 && (a < 0) != (b < 0) {
                            q -= 1;
                        }
                        Int(q)
                    }
                    Op::Mod => {
                        if b == 0 {
                            return Err(TraceError::Arithmetic("modulo by zero".into()));
                        }
                        // Floor modulo: the result carries the divisor's sign.
                        let mut r = a % b;
                        if r != 0 && (r < 0) != (b < 0) {
                            r += b;
                        }
                        Int(r)
                    }
                    Op::Shl => Int(a.wrapping_shl(b as u32)),
                    Op::Shr => Int(a.wrapping_shr(b as u32)),
                    Op::Lt => Self::bool_payload(a < b),
                    Op::Gt => Self::bool_payload(a > b),
                    Op::Le => Self::bool_payload(a <= b),
                    Op::Ge => Self::bool_payload(a >= b),
                    Op::Eq => Self::bool_payload(a == b),
                    Op::Ne => Self::bool_payload(a != b),
                    Op::BitAnd => Int(a & b),
                    Op::BitOr => Int(a | b),
                    Op::BitXor => Int(a ^ b),
                    Op::LogAnd => Self::bool_payload(a != 0 && b != 0),
                    Op::LogOr => Self::bool_payload(a != 0 || b != 0),
                    Op::Neg | Op::BitNot => {
                        return Err(TraceError::TypeMismatch(format!(
                            "unary {} applied to two operands",
                            op.symbol()
                        )))
                    }
                };
                Ok(result)
            }
            (Op::Eq, [_, _]) => Ok(Self::bool_payload(false)),
            (Op::Ne, [_, _]) => Ok(Self::bool_payload(true)),
            (op, payloads) => Err(TraceError::TypeMismatch(format!(
                "{} is not defined on {payloads:?}",
                op.symbol()
            ))),
        }
    }

    // ------------------------------------------------------------------
    // Concretisation
    // ------------------------------------------------------------------

    /// Force a value to a concrete payload. An opaque value becomes a pointer
    /// to a freshly allocated top-level region (lazy allocation); a deferred
    /// expression concretises its operands and applies its operator. Either
    /// way the canonical chain is rewritten to the result.
    pub fn concretize(&mut self, v: ValueId) -> TraceResult<Payload> {
        let class = self.canon(v);
        if self.values[class.idx()].concrete {
            return Ok(self.values[class.idx()].payload.clone());
        }

        match self.values[class.idx()].payload.clone() {
            Payload::Opaque(_) => {
                let fresh = self.append(self.root)?;
                let cell = self.child(fresh, 0)?;
                let concrete = self.new_value(Payload::Mem(cell), true);
                self.values[class.idx()].canonical = concrete;
                Ok(Payload::Mem(cell))
            }
            Payload::Deferred(op, args) => {
                let operands = args
                    .iter()
                    .map(|&arg| self.concretize(arg))
                    .collect::<TraceResult<Vec<_>>>()?;
                let applied = self.apply(op, &operands)?;
                let concrete = self.new_value(applied.clone(), true);
                self.values[class.idx()].canonical = concrete;
                Ok(applied)
            }
            other => Ok(other),
        }
    }

    /// Force a value to a memory node.
    pub fn as_memref(&mut self, v: ValueId) -> TraceResult<MemId> {
        match self.concretize(v)? {
            Payload::Mem(m) => Ok(m),
            other => Err(TraceError::NotAPointer(self.render_payload(&other))),
        }
    }

    // ------------------------------------------------------------------
    // The mini-IR
    // ------------------------------------------------------------------

    /// Execute one IR operation. Returns the produced value; stores and
    /// assertions produce none.
    pub fn emit(&mut self, ir: &Ir) -> TraceResult<Option<ValueId>> {
        let frame = self.new_frame();
        self.frame_stack.push(frame);
        let result = self.emit_inner(ir);
        self.frame_stack.pop();
        if let Ok(Some(v)) = &result {
            if let Some(&parent) = self.frame_stack.last() {
                self.frames[parent].children.push(*v);
            }
        }
        result
    }

    fn arg_value(&mut self, args: &[Ir], index: usize) -> TraceResult<ValueId> {
        let arg = args.get(index).ok_or_else(|| {
            TraceError::TypeMismatch(format!("operation is missing operand {index}"))
        })?;
        self.emit(arg)?.ok_or_else(|| {
            TraceError::TypeMismatch("operand produced no value".into())
        })
    }

    fn emit_inner(&mut self, ir: &Ir) -> TraceResult<Option<ValueId>> {
        let Ir::Op(op, args) = ir else {
            return match ir {
                Ir::Val(v) => Ok(Some(*v)),
                Ir::Imm(imm) => Ok(Some(self.imm_value(imm))),
                Ir::Op(..) => unreachable!(),
            };
        };

        let binary = |trace: &mut Self, op: Op, args: &[Ir]| -> TraceResult<Option<ValueId>> {
            let lhs = trace.arg_value(args, 0)?;
            let rhs = trace.arg_value(args, 1)?;
            Ok(Some(trace.operate(op, vec![lhs, rhs])?))
        };

        match op.as_str() {
            "imm" => match args.first() {
                Some(Ir::Imm(imm)) => Ok(Some(self.imm_value(imm))),
                Some(Ir::Val(v)) => Ok(Some(*v)),
                other => Err(TraceError::TypeMismatch(format!(
                    "imm wants an immediate, got {other:?}"
                ))),
            },
            "*" => {
                let v = self.arg_value(args, 0)?;
                let m = self.as_memref(v)?;
                Ok(Some(self.get_value(m)))
            }
            "str" => {
                let v = self.arg_value(args, 0)?;
                let region = self.append(self.root)?;
                let cell = self.child(region, 0)?;
                self.set_value(cell, v)?;
                Ok(Some(self.new_value(Payload::Mem(cell), true)))
            }
            "upd" => {
                let src = self.arg_value(args, 0)?;
                let dst = self.arg_value(args, 1)?;
                let m = self.as_memref(dst)?;
                self.set_value(m, src)?;
                Ok(None)
            }
            "opaque" => Ok(Some(self.opaque())),
            "field" => {
                let name_value = self.arg_value(args, 1)?;
                let Payload::Str(name) = self.values[name_value.idx()].payload.clone() else {
                    return Err(TraceError::TypeMismatch(
                        "field name must be an immediate string".into(),
                    ));
                };
                let head_value = self.arg_value(args, 0)?;
                let head = self.as_memref(head_value)?;
                let target = self.field(head, &name)?;
                Ok(Some(self.new_value(Payload::Mem(target), true)))
            }
            "assert" => {
                let claim = self.arg_value(args, 0)?;
                self.assertions.push(claim);
                Ok(None)
            }
            "-" if args.len() == 1 => {
                let v = self.arg_value(args, 0)?;
                Ok(Some(self.operate(Op::Neg, vec![v])?))
            }
            "~" => {
                let v = self.arg_value(args, 0)?;
                Ok(Some(self.operate(Op::BitNot, vec![v])?))
            }
            "+" | "-" | "==" | "!=" | "<" => {
                let op = Op::from_symbol(op).ok_or_else(|| {
                    TraceError::Unimplemented(format!("operator {op:?}"))
                })?;
                binary(self, op, args)
            }
            symbol if symbol.starts_with("bin_") => {
                let op = Op::from_symbol(&symbol["bin_".len()..]).ok_or_else(|| {
                    TraceError::Unimplemented(format!("operator {symbol:?}"))
                })?;
                binary(self, op, args)
            }
            other => Err(TraceError::Unimplemented(format!("IR operation {other:?}"))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn imm(n: i64) -> Ir {
        Ir::Op("imm".into(), vec![Ir::Imm(ImmVal::Int(n))])
    }

    #[test]
    fn test_operate_concrete() {
        let mut trace = Trace::new();
        let a = trace.imm_int(40);
        let b = trace.imm_int(2);
        let sum = trace.operate(Op::Add, vec![a, b]).unwrap();
        assert_eq!(Payload::Int(42), *trace.cval(sum));
        assert!(trace.is_concrete(sum));
    }

    #[test]
    fn test_division_floors_for_negative_operands() {
        let mut trace = Trace::new();
        let cases = [
            (7, 2, 3, 1),
            (-7, 2, -4, 1),
            (7, -2, -4, -1),
            (-7, -2, 3, -1),
        ];
        for (a, b, quotient, remainder) in cases {
            let lhs = trace.imm_int(a);
            let rhs = trace.imm_int(b);
            let div = trace.operate(Op::Div, vec![lhs, rhs]).unwrap();
            let rem = trace.operate(Op::Mod, vec![lhs, rhs]).unwrap();
            assert_eq!(Payload::Int(quotient), *trace.cval(div), "{a} / {b}");
            assert_eq!(Payload::Int(remainder), *trace.cval(rem), "{a} % {b}");
        }
    }

    #[test]
    fn test_operate_deferred() {
        let mut trace = Trace::new();
        let a = trace.opaque();
        let b = trace.imm_int(1);
        let sum = trace.operate(Op::Add, vec![a, b]).unwrap();
        assert!(!trace.is_concrete(sum));
        assert!(matches!(trace.cval(sum), Payload::Deferred(Op::Add, _)));
    }

    #[test]
    fn test_concretize_opaque_allocates() {
        let mut trace = Trace::new();
        let v = trace.opaque();
        let m = trace.as_memref(v).unwrap();
        // A fresh top-level region, entered at its 0-child.
        assert_eq!(0, *trace.node(m).address.last().unwrap());
        // Concretisation is stable.
        assert_eq!(m, trace.as_memref(v).unwrap());
    }

    #[test]
    fn test_concretize_deferred_pointer_arithmetic() {
        let mut trace = Trace::new();
        let p = trace.opaque();
        let one = trace.imm_int(1);
        let shifted = trace.operate(Op::Add, vec![p, one]).unwrap();

        let m = trace.as_memref(shifted).unwrap();
        let base = trace.as_memref(p).unwrap();
        let base_coord = *trace.node(base).address.last().unwrap();
        assert_eq!(base_coord + 1, *trace.node(m).address.last().unwrap());
    }

    #[test]
    fn test_concretize_does_not_mutate_payloads() {
        let mut trace = Trace::new();
        let a = trace.opaque();
        let zero = trace.imm_int(0);
        let eq = trace.operate(Op::Eq, vec![a, zero]).unwrap();
        let or = trace.operate(Op::LogOr, vec![eq, eq]).unwrap();

        assert!(matches!(trace.payload(or), Payload::Deferred(Op::LogOr, _)));
        trace.concretize(or).unwrap();
        // The original values keep their deferred payloads; only the
        // canonical forwarding changed.
        assert!(matches!(trace.payload(or), Payload::Deferred(Op::LogOr, _)));
        assert!(trace.is_concrete(or));
    }

    #[test]
    fn test_emit_store_and_load() {
        let mut trace = Trace::new();
        let stored = trace
            .emit(&Ir::Op("str".into(), vec![imm(5)]))
            .unwrap()
            .unwrap();
        let loaded = trace
            .emit(&Ir::Op("*".into(), vec![Ir::Val(stored)]))
            .unwrap()
            .unwrap();
        assert_eq!(Payload::Int(5), *trace.cval(loaded));
    }

    #[test]
    fn test_emit_field_composes_with_offsets() {
        let mut trace = Trace::new();
        let region = trace.emit(&Ir::Op("str".into(), vec![imm(0)])).unwrap().unwrap();

        let lookup = |trace: &mut Trace, name: &str| -> i64 {
            let name = Ir::Op("imm".into(), vec![Ir::Imm(ImmVal::Str(name.into()))]);
            let field = trace
                .emit(&Ir::Op("field".into(), vec![Ir::Val(region), name]))
                .unwrap()
                .unwrap();
            let Payload::Mem(cell) = *trace.cval(field) else {
                panic!("field must produce a pointer");
            };
            *trace.node(cell).address.last().unwrap()
        };

        assert_eq!(trace_offset(&mut trace, "probe"), lookup(&mut trace, "probe"));
        assert_eq!(trace_offset(&mut trace, "remove"), lookup(&mut trace, "remove"));
        assert_ne!(lookup(&mut trace, "probe"), lookup(&mut trace, "remove"));
    }

    fn trace_offset(trace: &mut Trace, name: &str) -> i64 {
        trace.field_offset(name)
    }

    #[test]
    fn test_emit_assert_records() {
        let mut trace = Trace::new();
        let a = trace.opaque();
        let claim = Ir::Op("==".into(), vec![Ir::Val(a), imm(0)]);
        trace
            .emit(&Ir::Op("assert".into(), vec![claim]))
            .unwrap();
        assert_eq!(1, trace.assertions().len());
    }

    #[test]
    fn test_scope_lookup_outermost_first() {
        let mut trace = Trace::new();
        let outer = trace.local("x");
        let shadow = trace.imm_int(2);
        trace.push_scope(&["x".to_string()], &[shadow]);
        // Lookup walks outermost-to-innermost, so the outer binding wins.
        assert_eq!(outer, trace.local("x"));
        trace.pop_scope();
    }

    #[test]
    fn test_scope_miss_creates_in_innermost() {
        let mut trace = Trace::new();
        trace.push_scope(&[], &[]);
        let v = trace.local("fresh");
        trace.pop_scope();
        // Popping the scope drops the binding; the next lookup makes a new one.
        assert_ne!(v, trace.local("fresh"));
    }

    #[test]
    fn test_freeze_suppresses_explanation_tracking() {
        let mut trace = Trace::new();
        trace.freeze_explanations();
        trace.push_explanation(vec![]);
        assert_eq!(1, trace.stmt_expl.len());
        trace.thaw_explanations();
        trace.push_explanation(vec![]);
        assert_eq!(2, trace.stmt_expl.len());
        trace.pop_explanation();
        assert_eq!(1, trace.stmt_expl.len());
    }

    #[test]
    fn test_gen_labels_are_unique() {
        let mut trace = Trace::new();
        let labels = trace.gen_labels(3);
        assert_eq!(3, labels.len());
        assert_ne!(labels[0], labels[1]);
        assert!(labels[0].starts_with("___l"));
    }
}
