use crate::emit::{BinOp, Emit, UnOp};
use crate::program::{QuadEmitter, QuadProgram};
use crate::{MAX_CALL_DEPTH, MAX_NESTING};
use quadjit_core::{CmpOp, Cond, Dst, Inst, LabelId, Src, Stage};
use std::collections::HashMap;
use std::{error, fmt};

#[derive(Debug, Clone, Copy)]
pub struct CompilerOptions {
    pub stage: Stage,
    /// Deepest statically nested control flow one routine body may open.
    pub max_nesting: usize,
    /// Longest call chain a routine may execute. Checked statically against
    /// the call graph; recursion always exceeds it.
    pub max_call_depth: usize,
}

impl CompilerOptions {
    pub fn pixel() -> Self {
        Self {
            stage: Stage::Pixel,
            max_nesting: MAX_NESTING,
            max_call_depth: MAX_CALL_DEPTH,
        }
    }

    pub fn vertex() -> Self {
        Self {
            stage: Stage::Vertex,
            ..Self::pixel()
        }
    }
}

impl Default for CompilerOptions {
    fn default() -> Self {
        Self::pixel()
    }
}

/// A structurally invalid instruction stream. These indicate a corrupt or
/// unsupported shader, not a runtime condition; compilation stops and
/// nothing of the routine is kept.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CompileError {
    UnmatchedElse,
    UnmatchedEnd(&'static str),
    MismatchedEnd { expected: &'static str, found: &'static str },
    UnclosedBlock(&'static str),
    NestingTooDeep { depth: usize, limit: usize },
    BreakOutsideLoop,
    ContinueOutsideLoop,
    CounterOutsideLoop,
    CaseOutsideSwitch,
    DefaultOutsideSwitch,
    CaseAfterDefault,
    DuplicateDefault,
    CodeBeforeCase,
    DuplicateLabel(LabelId),
    UndefinedLabel(LabelId),
    LabelInsideBlock(LabelId),
    MissingRet(LabelId),
    RecursiveCall(LabelId),
    CallDepthExceeded { depth: usize, limit: usize },
    DiscardInVertexStage,
    UnreachableCode,
}

impl fmt::Display for CompileError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        use CompileError::*;
        match self {
            UnmatchedElse => write!(f, "'else' without an open 'if'"),
            UnmatchedEnd(op) => write!(f, "'{op}' without a matching open block"),
            MismatchedEnd { expected, found } => {
                write!(f, "open '{expected}' closed by '{found}'")
            }
            UnclosedBlock(op) => write!(f, "'{op}' is never closed"),
            NestingTooDeep { depth, limit } => {
                write!(f, "control flow nested {depth} deep, limit is {limit}")
            }
            BreakOutsideLoop => write!(f, "'break' outside of a loop"),
            ContinueOutsideLoop => write!(f, "'continue' outside of a loop"),
            CounterOutsideLoop => write!(f, "loop counter read outside of 'loop'"),
            CaseOutsideSwitch => write!(f, "'case' outside of a switch"),
            DefaultOutsideSwitch => write!(f, "'default' outside of a switch"),
            CaseAfterDefault => write!(f, "'case' after 'default'"),
            DuplicateDefault => write!(f, "second 'default' in one switch"),
            CodeBeforeCase => write!(f, "instruction between 'switch' and the first 'case'"),
            DuplicateLabel(id) => write!(f, "label {id} defined twice"),
            UndefinedLabel(id) => write!(f, "label {id} is called but never defined"),
            LabelInsideBlock(id) => write!(f, "label {id} defined inside an open block"),
            MissingRet(id) => write!(f, "subroutine {id} does not end with 'ret'"),
            RecursiveCall(id) => write!(f, "label {id} is part of a call cycle"),
            CallDepthExceeded { depth, limit } => {
                write!(f, "call chain {depth} deep, limit is {limit}")
            }
            DiscardInVertexStage => write!(f, "'discard' in a vertex routine"),
            UnreachableCode => write!(f, "instruction after the routine already returned"),
        }
    }
}

impl error::Error for CompileError {}

/// Compiles a shader instruction stream into a runnable block program using
/// the reference emitter.
pub fn compile(code: &[Inst], opts: CompilerOptions) -> Result<QuadProgram, CompileError> {
    let mut em = QuadEmitter::new();
    let shape = compile_into(&mut em, code, opts)?;
    Ok(em.finish(shape.entry, shape.mask_depth, shape.call_depth))
}

/// Entry block and sizing facts of a compiled routine, for the emitter that
/// materializes it.
pub struct RoutineShape<E: Emit> {
    pub entry: E::Block,
    pub mask_depth: usize,
    pub call_depth: usize,
}

/// Drives an arbitrary emitter over the instruction stream. The whole pass
/// is synchronous single-threaded data transformation; nothing of the
/// routine exists until it succeeds.
pub fn compile_into<E: Emit>(
    em: &mut E,
    code: &[Inst],
    opts: CompilerOptions,
) -> Result<RoutineShape<E>, CompileError> {
    let scan = scan_code(code, &opts)?;
    let call_depth = scan.call_depth;
    let mask_depth = 1 + (opts.max_nesting + 1) * (call_depth + 1);

    let mut compiler = ControlFlowCompiler::new(em, opts);
    let entry = compiler.prologue(&scan);
    for inst in code {
        compiler.lower(inst)?;
    }
    compiler.finish()?;

    Ok(RoutineShape {
        entry,
        mask_depth,
        call_depth,
    })
}

struct ScanInfo {
    call_depth: usize,
    temps: Vec<u8>,
    outputs: Vec<u8>,
}

/// Pre-pass over the stream: registers touched, label table sanity, and the
/// static bound of the call stack.
fn scan_code(code: &[Inst], opts: &CompilerOptions) -> Result<ScanInfo, CompileError> {
    fn mark_src(temps: &mut [bool; 256], src: &Src) {
        if let Src::Temp(i) = src {
            temps[*i as usize] = true;
        }
    }

    fn mark_dst(temps: &mut [bool; 256], outputs: &mut [bool; 256], dst: &Dst) {
        match dst {
            Dst::Temp(i) => temps[*i as usize] = true,
            Dst::Output(i) => outputs[*i as usize] = true,
        }
    }

    let mut temps = [false; 256];
    let mut outputs = [false; 256];
    let mut defined: HashMap<LabelId, ()> = HashMap::new();
    let mut calls: HashMap<Option<LabelId>, Vec<LabelId>> = HashMap::new();
    let mut current = None;

    for inst in code {
        use Inst::*;
        match inst {
            Label { id } => {
                if defined.insert(*id, ()).is_some() {
                    return Err(CompileError::DuplicateLabel(*id));
                }
                current = Some(*id);
            }
            Call { label } => calls.entry(current).or_default().push(*label),
            CallNz { label, src } => {
                mark_src(&mut temps, src);
                calls.entry(current).or_default().push(*label);
            }
            _ => {}
        }

        match inst {
            Mov { dst, src }
            | Abs { dst, src }
            | Neg { dst, src }
            | Floor { dst, src }
            | Sqrt { dst, src }
            | Rcp { dst, src } => {
                mark_dst(&mut temps, &mut outputs, dst);
                mark_src(&mut temps, src);
            }
            Add { dst, a, b }
            | Sub { dst, a, b }
            | Mul { dst, a, b }
            | Min { dst, a, b }
            | Max { dst, a, b } => {
                mark_dst(&mut temps, &mut outputs, dst);
                mark_src(&mut temps, a);
                mark_src(&mut temps, b);
            }
            Mad { dst, a, b, c } => {
                mark_dst(&mut temps, &mut outputs, dst);
                mark_src(&mut temps, a);
                mark_src(&mut temps, b);
                mark_src(&mut temps, c);
            }
            If(cond) | While(cond) | BreakC(cond) | SetP(cond) | Discard(cond) => {
                mark_src(&mut temps, &cond.a);
                mark_src(&mut temps, &cond.b);
            }
            Switch { src } => mark_src(&mut temps, src),
            _ => {}
        }
    }

    for targets in calls.values() {
        for target in targets {
            if !defined.contains_key(target) {
                return Err(CompileError::UndefinedLabel(*target));
            }
        }
    }

    // longest call chain, rejecting cycles
    fn chain(
        node: Option<LabelId>,
        calls: &HashMap<Option<LabelId>, Vec<LabelId>>,
        memo: &mut HashMap<LabelId, usize>,
        visiting: &mut Vec<LabelId>,
    ) -> Result<usize, CompileError> {
        let mut max = 0;
        if let Some(targets) = calls.get(&node) {
            for &target in targets {
                if visiting.contains(&target) {
                    return Err(CompileError::RecursiveCall(target));
                }
                let depth = match memo.get(&target) {
                    Some(&depth) => depth,
                    None => {
                        visiting.push(target);
                        let depth = chain(Some(target), calls, memo, visiting)?;
                        visiting.pop();
                        memo.insert(target, depth);
                        depth
                    }
                };
                max = max.max(1 + depth);
            }
        }
        Ok(max)
    }

    let mut memo = HashMap::new();
    let mut visiting = Vec::new();
    let call_depth = chain(None, &calls, &mut memo, &mut visiting)?;

    // uncalled subroutines still have to be acyclic
    for &label in defined.keys() {
        if !memo.contains_key(&label) {
            visiting.push(label);
            let depth = chain(Some(label), &calls, &mut memo, &mut visiting)?;
            visiting.pop();
            memo.insert(label, depth);
        }
    }

    if call_depth > opts.max_call_depth {
        return Err(CompileError::CallDepthExceeded {
            depth: call_depth,
            limit: opts.max_call_depth,
        });
    }

    Ok(ScanInfo {
        call_depth,
        temps: (0..=255u8).filter(|&i| temps[i as usize]).collect(),
        outputs: (0..=255u8).filter(|&i| outputs[i as usize]).collect(),
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LoopKind {
    Loop,
    Rep,
    While,
}

impl LoopKind {
    fn name(self) -> &'static str {
        match self {
            LoopKind::Loop => "loop",
            LoopKind::Rep => "rep",
            LoopKind::While => "while",
        }
    }

    fn end_name(self) -> &'static str {
        match self {
            LoopKind::Loop => "endloop",
            LoopKind::Rep => "endrep",
            LoopKind::While => "endwhile",
        }
    }
}

enum Frame<E: Emit> {
    If {
        /// Where control resumes when the arm currently being emitted is
        /// skipped or finished: the else entry until `Else`, the merge
        /// block after it.
        next: E::Block,
        parent: E::Value,
        cond: E::Value,
        else_seen: bool,
    },
    Loop {
        kind: LoopKind,
        test: E::Block,
        end: E::Block,
        /// Iterations left (`Loop`/`Rep`); counted down at the bottom.
        remaining: Option<E::Value>,
        /// Counter step (`Loop`).
        step: Option<E::Value>,
        saved_break: E::Value,
        saved_continue: E::Value,
        prev_counter: Option<E::Value>,
        restore_counter: bool,
    },
    Switch {
        parent: E::Value,
        selector: E::Value,
        matched: E::Value,
        armed: bool,
        default_seen: bool,
    },
}

impl<E: Emit> Frame<E> {
    fn name(&self) -> &'static str {
        match self {
            Frame::If { .. } => "if",
            Frame::Loop { kind, .. } => kind.name(),
            Frame::Switch { .. } => "switch",
        }
    }
}

/// Lowers the structured stream onto an emitter, tracking the enable stack
/// and the cross-cutting break/continue/leave/return masks.
///
/// The central invariant: a lane masked out by an enclosing scope can never
/// become active inside a nested one. Masks only narrow as nesting deepens;
/// the four cross-cutting masks only widen, and everything a lane could
/// observe is gated on the conjunction.
struct ControlFlowCompiler<'a, E: Emit> {
    em: &'a mut E,
    opts: CompilerOptions,

    frames: Vec<Frame<E>>,
    labels: HashMap<LabelId, E::Block>,
    temps: HashMap<u8, E::Value>,
    outputs: HashMap<u8, E::Value>,

    coverage: E::Value,
    break_mask: E::Value,
    continue_mask: E::Value,
    leave_mask: E::Value,
    return_mask: E::Value,
    pred: E::Value,

    epilogue: E::Block,
    counter: Option<E::Value>,
    in_label: Option<LabelId>,
    terminated: bool,
}

impl<'a, E: Emit> ControlFlowCompiler<'a, E> {
    fn new(em: &'a mut E, opts: CompilerOptions) -> Self {
        let coverage = em.cell();
        let break_mask = em.cell();
        let continue_mask = em.cell();
        let leave_mask = em.cell();
        let return_mask = em.cell();
        let pred = em.cell();
        let epilogue = em.block();

        Self {
            em,
            opts,
            frames: Vec::new(),
            labels: HashMap::new(),
            temps: HashMap::new(),
            outputs: HashMap::new(),
            coverage,
            break_mask,
            continue_mask,
            leave_mask,
            return_mask,
            pred,
            epilogue,
            counter: None,
            in_label: None,
            terminated: false,
        }
    }

    fn prologue(&mut self, scan: &ScanInfo) -> E::Block {
        let entry = self.em.block();
        self.em.position(entry);

        self.em.read_coverage(self.coverage);
        self.em.mask_push(self.coverage);

        for mask in [
            self.break_mask,
            self.continue_mask,
            self.leave_mask,
            self.return_mask,
            self.pred,
        ] {
            self.em.const_i32(mask, 0);
        }

        // registers read before ever being written observe zero
        for &slot in &scan.temps {
            let cell = self.em.cell();
            self.em.const_f32(cell, 0.0);
            self.temps.insert(slot, cell);
        }
        for &slot in &scan.outputs {
            let cell = self.em.cell();
            self.em.const_f32(cell, 0.0);
            self.outputs.insert(slot, cell);
        }

        entry
    }

    fn finish(mut self) -> Result<(), CompileError> {
        if let Some(frame) = self.frames.last() {
            return Err(CompileError::UnclosedBlock(frame.name()));
        }

        if !self.terminated {
            match self.in_label {
                None => self.em.jump(self.epilogue),
                Some(label) => return Err(CompileError::MissingRet(label)),
            }
        }

        // epilogue: flush declared outputs for covered lanes that never left
        self.em.position(self.epilogue);
        let write_mask = self.em.cell();
        self.em
            .binary(BinOp::AndNot, write_mask, self.coverage, self.leave_mask);

        let mut slots: Vec<_> = self.outputs.iter().map(|(&s, &c)| (s, c)).collect();
        slots.sort_by_key(|&(slot, _)| slot);
        for (slot, cell) in slots {
            self.em.write_output(slot, cell, write_mask);
        }

        self.em.mask_pop();
        self.em.end();
        Ok(())
    }

    fn check_depth(&self) -> Result<(), CompileError> {
        let depth = self.frames.len() + 1;
        if depth > self.opts.max_nesting {
            return Err(CompileError::NestingTooDeep {
                depth,
                limit: self.opts.max_nesting,
            });
        }
        Ok(())
    }

    fn label_block(&mut self, id: LabelId) -> E::Block {
        if let Some(&block) = self.labels.get(&id) {
            block
        } else {
            let block = self.em.block();
            self.labels.insert(id, block);
            block
        }
    }

    fn src_value(&mut self, src: Src) -> Result<E::Value, CompileError> {
        match src {
            Src::Temp(i) => Ok(*self.temps.get(&i).expect("temp registered by scan")),
            Src::Input(i) => {
                let cell = self.em.cell();
                self.em.read_input(cell, i);
                Ok(cell)
            }
            Src::Const(i) => {
                let cell = self.em.cell();
                self.em.read_const(cell, i);
                Ok(cell)
            }
            Src::Imm(value) => {
                let cell = self.em.cell();
                self.em.const_f32(cell, value);
                Ok(cell)
            }
            Src::Counter => {
                let counter = self.counter.ok_or(CompileError::CounterOutsideLoop)?;
                let cell = self.em.cell();
                self.em.unary(UnOp::IntToFloat, cell, counter);
                Ok(cell)
            }
        }
    }

    fn dst_cell(&mut self, dst: Dst) -> E::Value {
        match dst {
            Dst::Temp(i) => *self.temps.get(&i).expect("temp registered by scan"),
            Dst::Output(i) => *self.outputs.get(&i).expect("output registered by scan"),
        }
    }

    /// Masks `base` by the cross-cutting exclusions.
    fn exclude(&mut self, base: E::Value) {
        for mask in [
            self.break_mask,
            self.continue_mask,
            self.leave_mask,
            self.return_mask,
        ] {
            self.em.binary(BinOp::AndNot, base, base, mask);
        }
    }

    /// Lanes that execute the next instruction: the enable top minus every
    /// lane that broke, continued, left or returned.
    fn active_mask(&mut self) -> E::Value {
        let active = self.em.cell();
        self.em.mask_top(active);
        self.exclude(active);
        active
    }

    fn live_of(&mut self, base: E::Value) -> E::Value {
        let live = self.em.cell();
        self.em.mov(live, base);
        self.exclude(live);
        live
    }

    fn cond_mask(&mut self, cond: &Cond) -> Result<E::Value, CompileError> {
        let a = self.src_value(cond.a)?;
        let b = self.src_value(cond.b)?;
        let op = match cond.op {
            CmpOp::Eq => BinOp::CmpEqF,
            CmpOp::Ne => BinOp::CmpNeF,
            CmpOp::Lt => BinOp::CmpLtF,
            CmpOp::Le => BinOp::CmpLeF,
            CmpOp::Gt => BinOp::CmpGtF,
            CmpOp::Ge => BinOp::CmpGeF,
        };
        let mask = self.em.cell();
        self.em.binary(op, mask, a, b);
        Ok(mask)
    }

    /// Predicated store: only active lanes observe the write.
    fn store(&mut self, dst: Dst, value: E::Value) {
        let active = self.active_mask();
        let cell = self.dst_cell(dst);
        self.em.select(cell, active, value, cell);
    }

    fn arith1(&mut self, op: UnOp, dst: Dst, src: Src) -> Result<(), CompileError> {
        let v = self.src_value(src)?;
        let result = self.em.cell();
        self.em.unary(op, result, v);
        self.store(dst, result);
        Ok(())
    }

    fn arith2(&mut self, op: BinOp, dst: Dst, a: Src, b: Src) -> Result<(), CompileError> {
        let va = self.src_value(a)?;
        let vb = self.src_value(b)?;
        let result = self.em.cell();
        self.em.binary(op, result, va, vb);
        self.store(dst, result);
        Ok(())
    }

    fn or_into(&mut self, mask: E::Value, lanes: E::Value) {
        self.em.binary(BinOp::Or, mask, mask, lanes);
    }

    fn require_loop(&self) -> bool {
        self.frames
            .iter()
            .any(|frame| matches!(frame, Frame::Loop { .. }))
    }

    fn begin_loop(
        &mut self,
        kind: LoopKind,
        counter_slot: Option<u8>,
        cond: Option<&Cond>,
    ) -> Result<(), CompileError> {
        self.check_depth()?;

        // the loop inherits its parent mask; while-style refinement narrows
        // the copy per iteration
        let top = self.em.cell();
        self.em.mask_top(top);
        self.em.mask_push(top);

        let (remaining, step, restore_counter, prev_counter) = match (kind, counter_slot) {
            (LoopKind::While, _) => (None, None, false, self.counter),
            (LoopKind::Rep, Some(slot)) => {
                let remaining = self.em.cell();
                self.em.read_counter_const(remaining, slot, 0);
                (Some(remaining), None, false, self.counter)
            }
            (LoopKind::Loop, Some(slot)) => {
                let remaining = self.em.cell();
                self.em.read_counter_const(remaining, slot, 0);
                let counter = self.em.cell();
                self.em.read_counter_const(counter, slot, 1);
                let step = self.em.cell();
                self.em.read_counter_const(step, slot, 2);
                let prev = self.counter;
                self.counter = Some(counter);
                (Some(remaining), Some(step), true, prev)
            }
            _ => unreachable!("counted loop without a counter slot"),
        };

        let saved_break = self.em.cell();
        self.em.mov(saved_break, self.break_mask);
        let saved_continue = self.em.cell();
        self.em.mov(saved_continue, self.continue_mask);

        let test = self.em.block();
        let body = self.em.block();
        let end = self.em.block();

        self.em.jump(test);
        self.em.position(test);

        if let Some(cond) = cond {
            // a lane whose condition went false once stays out: refine the
            // pushed mask, never rebuild it
            let mask = self.cond_mask(cond)?;
            let top = self.em.cell();
            self.em.mask_top(top);
            self.em.binary(BinOp::And, top, top, mask);
            self.em.mask_set_top(top);
        }

        let live = self.active_mask();
        if let Some(remaining) = remaining {
            let zero = self.em.cell();
            self.em.const_i32(zero, 0);
            let pending = self.em.cell();
            self.em.binary(BinOp::CmpGtI, pending, remaining, zero);
            self.em.binary(BinOp::And, live, live, pending);
        }
        self.em.branch_any(live, body, end);
        self.em.position(body);

        self.frames.push(Frame::Loop {
            kind,
            test,
            end,
            remaining,
            step,
            saved_break,
            saved_continue,
            prev_counter,
            restore_counter,
        });
        Ok(())
    }

    fn end_loop(&mut self, expected: LoopKind) -> Result<(), CompileError> {
        match self.frames.pop() {
            Some(Frame::Loop {
                kind,
                test,
                end,
                remaining,
                step,
                saved_break,
                saved_continue,
                prev_counter,
                restore_counter,
            }) => {
                if kind != expected {
                    return Err(CompileError::MismatchedEnd {
                        expected: kind.name(),
                        found: expected.end_name(),
                    });
                }

                // iteration bottom: advance the counter, give continued
                // lanes their next iteration back, loop to the shared test
                if let Some(step) = step {
                    let counter = self.counter.expect("loop counter present");
                    self.em.binary(BinOp::AddI, counter, counter, step);
                }
                if let Some(remaining) = remaining {
                    let one = self.em.cell();
                    self.em.const_i32(one, 1);
                    self.em.binary(BinOp::SubI, remaining, remaining, one);
                }
                self.em.mov(self.continue_mask, saved_continue);
                self.em.jump(test);

                // after the loop: lanes that broke rejoin outer control flow
                self.em.position(end);
                self.em.mov(self.break_mask, saved_break);
                self.em.mask_pop();

                if restore_counter {
                    self.counter = prev_counter;
                }
                Ok(())
            }
            Some(frame) => {
                self.frames.push(frame);
                Err(CompileError::UnmatchedEnd(expected.end_name()))
            }
            None => Err(CompileError::UnmatchedEnd(expected.end_name())),
        }
    }

    fn lower(&mut self, inst: &Inst) -> Result<(), CompileError> {
        if self.terminated {
            if let Inst::Label { id } = inst {
                return self.lower_label(*id);
            }
            return Err(CompileError::UnreachableCode);
        }

        if let Some(Frame::Switch { armed: false, .. }) = self.frames.last() {
            if !matches!(
                inst,
                Inst::Case { .. } | Inst::Default | Inst::EndSwitch | Inst::Label { .. }
            ) {
                return Err(CompileError::CodeBeforeCase);
            }
        }

        use Inst::*;
        match inst {
            Mov { dst, src } => {
                let v = self.src_value(*src)?;
                self.store(*dst, v);
            }
            Add { dst, a, b } => self.arith2(BinOp::AddF, *dst, *a, *b)?,
            Sub { dst, a, b } => self.arith2(BinOp::SubF, *dst, *a, *b)?,
            Mul { dst, a, b } => self.arith2(BinOp::MulF, *dst, *a, *b)?,
            Min { dst, a, b } => self.arith2(BinOp::MinF, *dst, *a, *b)?,
            Max { dst, a, b } => self.arith2(BinOp::MaxF, *dst, *a, *b)?,
            Mad { dst, a, b, c } => {
                let va = self.src_value(*a)?;
                let vb = self.src_value(*b)?;
                let vc = self.src_value(*c)?;
                let product = self.em.cell();
                self.em.binary(BinOp::MulF, product, va, vb);
                let result = self.em.cell();
                self.em.binary(BinOp::AddF, result, product, vc);
                self.store(*dst, result);
            }
            Abs { dst, src } => self.arith1(UnOp::AbsF, *dst, *src)?,
            Neg { dst, src } => self.arith1(UnOp::NegF, *dst, *src)?,
            Floor { dst, src } => self.arith1(UnOp::FloorF, *dst, *src)?,
            Sqrt { dst, src } => self.arith1(UnOp::SqrtF, *dst, *src)?,
            Rcp { dst, src } => self.arith1(UnOp::RcpF, *dst, *src)?,

            If(cond) => {
                self.check_depth()?;
                let cond_mask = self.cond_mask(cond)?;
                let parent = self.em.cell();
                self.em.mask_top(parent);
                let taken = self.em.cell();
                self.em.binary(BinOp::And, taken, parent, cond_mask);
                self.em.mask_push(taken);

                let then_block = self.em.block();
                let next = self.em.block();
                let live = self.live_of(taken);
                self.em.branch_any(live, then_block, next);
                self.em.position(then_block);

                self.frames.push(Frame::If {
                    next,
                    parent,
                    cond: cond_mask,
                    else_seen: false,
                });
            }
            Else => {
                let (next, parent, cond) = match self.frames.pop() {
                    Some(Frame::If {
                        next,
                        parent,
                        cond,
                        else_seen: false,
                    }) => (next, parent, cond),
                    Some(frame) => {
                        self.frames.push(frame);
                        return Err(CompileError::UnmatchedElse);
                    }
                    None => return Err(CompileError::UnmatchedElse),
                };

                let merge = self.em.block();

                // end of the then arm: skip the else arm if no lane takes it
                let else_mask = self.em.cell();
                self.em.binary(BinOp::AndNot, else_mask, parent, cond);
                let live = self.live_of(else_mask);
                self.em.branch_any(live, next, merge);

                // else entry recomputes its mask; either predecessor may
                // have skipped the computation above
                self.em.position(next);
                let else_mask = self.em.cell();
                self.em.binary(BinOp::AndNot, else_mask, parent, cond);
                self.em.mask_set_top(else_mask);

                self.frames.push(Frame::If {
                    next: merge,
                    parent,
                    cond,
                    else_seen: true,
                });
            }
            EndIf => {
                let next = match self.frames.pop() {
                    Some(Frame::If { next, .. }) => next,
                    Some(frame) => {
                        self.frames.push(frame);
                        return Err(CompileError::UnmatchedEnd("endif"));
                    }
                    None => return Err(CompileError::UnmatchedEnd("endif")),
                };
                self.em.jump(next);
                self.em.position(next);
                self.em.mask_pop();
            }

            Loop { counter } => self.begin_loop(LoopKind::Loop, Some(*counter), None)?,
            EndLoop => self.end_loop(LoopKind::Loop)?,
            Rep { counter } => self.begin_loop(LoopKind::Rep, Some(*counter), None)?,
            EndRep => self.end_loop(LoopKind::Rep)?,
            While(cond) => self.begin_loop(LoopKind::While, None, Some(cond))?,
            EndWhile => self.end_loop(LoopKind::While)?,

            Break => {
                if !self.require_loop() {
                    return Err(CompileError::BreakOutsideLoop);
                }
                let active = self.active_mask();
                self.or_into(self.break_mask, active);
            }
            BreakC(cond) => {
                if !self.require_loop() {
                    return Err(CompileError::BreakOutsideLoop);
                }
                let cond_mask = self.cond_mask(cond)?;
                let active = self.active_mask();
                let lanes = self.em.cell();
                self.em.binary(BinOp::And, lanes, active, cond_mask);
                self.or_into(self.break_mask, lanes);
            }
            BreakP { negate } => {
                if !self.require_loop() {
                    return Err(CompileError::BreakOutsideLoop);
                }
                let active = self.active_mask();
                let lanes = self.em.cell();
                let op = if *negate { BinOp::AndNot } else { BinOp::And };
                self.em.binary(op, lanes, active, self.pred);
                self.or_into(self.break_mask, lanes);
            }
            Continue => {
                if !self.require_loop() {
                    return Err(CompileError::ContinueOutsideLoop);
                }
                let active = self.active_mask();
                self.or_into(self.continue_mask, active);
            }

            SetP(cond) => {
                let cond_mask = self.cond_mask(cond)?;
                let active = self.active_mask();
                self.em.select(self.pred, active, cond_mask, self.pred);
            }

            Call { label } => {
                let target = self.label_block(*label);
                let ret = self.em.block();
                let saved_return = self.em.cell();
                self.em.mov(saved_return, self.return_mask);
                self.em.call_push(ret);
                self.em.jump(target);

                // lanes that returned inside the callee rejoin here; lanes
                // that had already returned in this routine stay out
                self.em.position(ret);
                self.em.mov(self.return_mask, saved_return);
            }
            CallNz { label, src } => {
                let target = self.label_block(*label);
                let v = self.src_value(*src)?;
                let zero = self.em.cell();
                self.em.const_f32(zero, 0.0);
                let cond_mask = self.em.cell();
                self.em.binary(BinOp::CmpNeF, cond_mask, v, zero);

                let parent = self.em.cell();
                self.em.mask_top(parent);
                let taken = self.em.cell();
                self.em.binary(BinOp::And, taken, parent, cond_mask);
                let live = self.live_of(taken);

                let do_call = self.em.block();
                let skip = self.em.block();
                let ret = self.em.block();
                self.em.branch_any(live, do_call, skip);

                self.em.position(do_call);
                self.em.mask_push(taken);
                let saved_return = self.em.cell();
                self.em.mov(saved_return, self.return_mask);
                self.em.call_push(ret);
                self.em.jump(target);

                self.em.position(ret);
                self.em.mov(self.return_mask, saved_return);
                self.em.mask_pop();
                self.em.jump(skip);

                self.em.position(skip);
            }
            Ret => match self.in_label {
                Some(_) if self.frames.is_empty() => {
                    self.em.ret_pop();
                    self.terminated = true;
                }
                Some(_) => {
                    // divergent return: the lanes sit out the rest of the
                    // subroutine and rejoin at the call site
                    let active = self.active_mask();
                    self.or_into(self.return_mask, active);
                }
                None if self.frames.is_empty() => {
                    self.em.jump(self.epilogue);
                    self.terminated = true;
                }
                None => {
                    // divergent return from the main body is a leave
                    let active = self.active_mask();
                    self.or_into(self.leave_mask, active);
                }
            },
            Label { id } => return self.lower_label(*id),

            Switch { src } => {
                self.check_depth()?;
                let selector = self.src_value(*src)?;
                let parent = self.em.cell();
                self.em.mask_top(parent);
                let none = self.em.cell();
                self.em.const_i32(none, 0);
                self.em.mask_push(none);
                let matched = self.em.cell();
                self.em.const_i32(matched, 0);

                self.frames.push(Frame::Switch {
                    parent,
                    selector,
                    matched,
                    armed: false,
                    default_seen: false,
                });
            }
            Case { value } => {
                let (parent, selector, matched) = match self.frames.last_mut() {
                    Some(Frame::Switch {
                        parent,
                        selector,
                        matched,
                        armed,
                        default_seen,
                    }) => {
                        if *default_seen {
                            return Err(CompileError::CaseAfterDefault);
                        }
                        *armed = true;
                        (*parent, *selector, *matched)
                    }
                    _ => return Err(CompileError::CaseOutsideSwitch),
                };

                let wanted = self.em.cell();
                self.em.const_f32(wanted, *value);
                let eq = self.em.cell();
                self.em.binary(BinOp::CmpEqF, eq, selector, wanted);
                let arm = self.em.cell();
                self.em.binary(BinOp::And, arm, parent, eq);
                self.em.binary(BinOp::AndNot, arm, arm, matched);
                self.em.mask_set_top(arm);
                self.or_into(matched, arm);
            }
            Default => {
                let (parent, matched) = match self.frames.last_mut() {
                    Some(Frame::Switch {
                        parent,
                        matched,
                        armed,
                        default_seen,
                        ..
                    }) => {
                        if *default_seen {
                            return Err(CompileError::DuplicateDefault);
                        }
                        *armed = true;
                        *default_seen = true;
                        (*parent, *matched)
                    }
                    _ => return Err(CompileError::DefaultOutsideSwitch),
                };

                let arm = self.em.cell();
                self.em.binary(BinOp::AndNot, arm, parent, matched);
                self.em.mask_set_top(arm);
                self.em.mov(matched, parent);
            }
            EndSwitch => {
                match self.frames.pop() {
                    Some(Frame::Switch { .. }) => {}
                    Some(frame) => {
                        self.frames.push(frame);
                        return Err(CompileError::UnmatchedEnd("endswitch"));
                    }
                    None => return Err(CompileError::UnmatchedEnd("endswitch")),
                }
                self.em.mask_pop();
            }

            Leave => {
                let active = self.active_mask();
                self.or_into(self.leave_mask, active);
            }
            Discard(cond) => {
                if !self.opts.stage.allows_discard() {
                    return Err(CompileError::DiscardInVertexStage);
                }
                let cond_mask = self.cond_mask(cond)?;
                let active = self.active_mask();
                let lanes = self.em.cell();
                self.em.binary(BinOp::And, lanes, active, cond_mask);
                self.or_into(self.leave_mask, lanes);
            }
        }
        Ok(())
    }

    fn lower_label(&mut self, id: LabelId) -> Result<(), CompileError> {
        if !self.frames.is_empty() {
            return Err(CompileError::LabelInsideBlock(id));
        }

        if !self.terminated {
            match self.in_label {
                // the main body falls through into the first subroutine;
                // close it out
                None => self.em.jump(self.epilogue),
                Some(previous) => return Err(CompileError::MissingRet(previous)),
            }
        }

        let block = self.label_block(id);
        self.em.position(block);
        self.in_label = Some(id);
        self.terminated = false;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mask::LaneMask;
    use crate::program::{QuadContext, QuadExecutor};
    use crate::QUAD_LANES;
    use bumpalo::Bump;
    use quadjit_core::{CmpOp, Cond, Dst, Src};

    fn lane_id() -> [f32; QUAD_LANES] {
        [0.0, 1.0, 2.0, 3.0]
    }

    fn run_quad(
        code: &[Inst],
        inputs: &[[f32; QUAD_LANES]],
        counters: &[[i32; 4]],
        output_count: usize,
    ) -> Vec<[f32; QUAD_LANES]> {
        let program = compile(code, CompilerOptions::default()).unwrap();
        let arena = Bump::new();
        let mut exec = QuadExecutor::new(&arena);
        let mut outputs = vec![[0.0; QUAD_LANES]; output_count];
        let mut ctx = QuadContext {
            inputs,
            consts: &[],
            counters,
            outputs: &mut outputs,
            coverage: LaneMask::ALL,
        };
        exec.run(&program, &mut ctx);
        outputs
    }

    #[test]
    fn test_if_else_divergent() {
        let code = [
            Inst::If(Cond::new(CmpOp::Eq, Src::Input(0), Src::Imm(0.0))),
            Inst::Mov {
                dst: Dst::Output(0),
                src: Src::Imm(1.0),
            },
            Inst::Else,
            Inst::Mov {
                dst: Dst::Output(0),
                src: Src::Imm(2.0),
            },
            Inst::EndIf,
        ];

        let outputs = run_quad(&code, &[lane_id()], &[], 1);
        assert_eq!(outputs[0], [1.0, 2.0, 2.0, 2.0]);
    }

    #[test]
    fn test_if_without_else() {
        let code = [
            Inst::Mov {
                dst: Dst::Output(0),
                src: Src::Imm(5.0),
            },
            Inst::If(Cond::new(CmpOp::Lt, Src::Input(0), Src::Imm(2.0))),
            Inst::Mov {
                dst: Dst::Output(0),
                src: Src::Imm(9.0),
            },
            Inst::EndIf,
        ];

        let outputs = run_quad(&code, &[lane_id()], &[], 1);
        assert_eq!(outputs[0], [9.0, 9.0, 5.0, 5.0]);
    }

    #[test]
    fn test_uniformly_false_if_is_skipped() {
        // both sides compile, only the else side is observable
        let code = [
            Inst::If(Cond::new(CmpOp::Gt, Src::Input(0), Src::Imm(100.0))),
            Inst::Mov {
                dst: Dst::Output(0),
                src: Src::Imm(1.0),
            },
            Inst::Else,
            Inst::Mov {
                dst: Dst::Output(0),
                src: Src::Imm(2.0),
            },
            Inst::EndIf,
        ];

        let outputs = run_quad(&code, &[lane_id()], &[], 1);
        assert_eq!(outputs[0], [2.0; QUAD_LANES]);
    }

    #[test]
    fn test_rep_accumulates() {
        let code = [
            Inst::Rep { counter: 0 },
            Inst::Add {
                dst: Dst::Temp(0),
                a: Src::Temp(0),
                b: Src::Imm(1.0),
            },
            Inst::EndRep,
            Inst::Mov {
                dst: Dst::Output(0),
                src: Src::Temp(0),
            },
        ];

        let outputs = run_quad(&code, &[], &[[5, 0, 0, 0]], 1);
        assert_eq!(outputs[0], [5.0; QUAD_LANES]);
    }

    #[test]
    fn test_loop_counter_steps() {
        // sum aL over 4 iterations starting at 10, step 2: 10+12+14+16
        let code = [
            Inst::Loop { counter: 0 },
            Inst::Add {
                dst: Dst::Temp(0),
                a: Src::Temp(0),
                b: Src::Counter,
            },
            Inst::EndLoop,
            Inst::Mov {
                dst: Dst::Output(0),
                src: Src::Temp(0),
            },
        ];

        let outputs = run_quad(&code, &[], &[[4, 10, 2, 0]], 1);
        assert_eq!(outputs[0], [52.0; QUAD_LANES]);
    }

    #[test]
    fn test_nesting_too_deep() {
        let cond = Cond::new(CmpOp::Ge, Src::Input(0), Src::Imm(0.0));
        let mut code = Vec::new();
        for _ in 0..MAX_NESTING + 1 {
            code.push(Inst::If(cond));
        }
        for _ in 0..MAX_NESTING + 1 {
            code.push(Inst::EndIf);
        }

        assert!(matches!(
            compile(&code, CompilerOptions::default()),
            Err(CompileError::NestingTooDeep { .. })
        ));
    }

    #[test]
    fn test_structural_errors() {
        let opts = CompilerOptions::default;
        let cond = Cond::new(CmpOp::Ge, Src::Input(0), Src::Imm(0.0));

        assert_eq!(
            compile(&[Inst::Else], opts()).unwrap_err(),
            CompileError::UnmatchedElse
        );
        assert_eq!(
            compile(&[Inst::EndIf], opts()).unwrap_err(),
            CompileError::UnmatchedEnd("endif")
        );
        assert_eq!(
            compile(&[Inst::If(cond)], opts()).unwrap_err(),
            CompileError::UnclosedBlock("if")
        );
        assert_eq!(
            compile(&[Inst::Break], opts()).unwrap_err(),
            CompileError::BreakOutsideLoop
        );
        assert_eq!(
            compile(&[Inst::Continue], opts()).unwrap_err(),
            CompileError::ContinueOutsideLoop
        );
        assert_eq!(
            compile(&[Inst::Loop { counter: 0 }, Inst::EndRep], opts()).unwrap_err(),
            CompileError::MismatchedEnd {
                expected: "loop",
                found: "endrep"
            }
        );
        assert_eq!(
            compile(&[Inst::Call { label: 3 }], opts()).unwrap_err(),
            CompileError::UndefinedLabel(3)
        );
        assert_eq!(
            compile(
                &[
                    Inst::Label { id: 0 },
                    Inst::Ret,
                    Inst::Label { id: 0 },
                    Inst::Ret
                ],
                opts()
            )
            .unwrap_err(),
            CompileError::DuplicateLabel(0)
        );
        assert_eq!(
            compile(
                &[Inst::Label { id: 0 }, Inst::Call { label: 0 }, Inst::Ret],
                opts()
            )
            .unwrap_err(),
            CompileError::RecursiveCall(0)
        );
        assert_eq!(
            compile(
                &[
                    Inst::Ret,
                    Inst::Mov {
                        dst: Dst::Output(0),
                        src: Src::Imm(1.0)
                    }
                ],
                opts()
            )
            .unwrap_err(),
            CompileError::UnreachableCode
        );
        assert_eq!(
            compile(
                &[
                    Inst::Switch { src: Src::Input(0) },
                    Inst::Mov {
                        dst: Dst::Temp(0),
                        src: Src::Imm(1.0)
                    },
                    Inst::EndSwitch
                ],
                opts()
            )
            .unwrap_err(),
            CompileError::CodeBeforeCase
        );

        let vertex = CompilerOptions::vertex();
        assert_eq!(
            compile(&[Inst::Discard(cond)], vertex).unwrap_err(),
            CompileError::DiscardInVertexStage
        );
    }

    #[test]
    fn test_call_depth_bound() {
        fn chain(len: u16) -> Vec<Inst> {
            let mut code = vec![Inst::Call { label: 0 }];
            for id in 0..len {
                code.push(Inst::Label { id });
                if id + 1 < len {
                    code.push(Inst::Call { label: id + 1 });
                }
                code.push(Inst::Ret);
            }
            code
        }

        let mut opts = CompilerOptions::default();
        opts.max_call_depth = 3;

        assert!(compile(&chain(3), opts).is_ok());
        assert_eq!(
            compile(&chain(4), opts).unwrap_err(),
            CompileError::CallDepthExceeded { depth: 4, limit: 3 }
        );
    }
}
