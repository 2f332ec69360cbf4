use crate::emit::{BinOp, Emit, UnOp};
use crate::mask::LaneMask;
use crate::QUAD_LANES;
use bumpalo::{Bump, collections::Vec as BumpVec};
use slotmap::{SlotMap, new_key_type};

new_key_type! {
    /// Handle of one emitted basic block.
    pub struct BlockId;
}

/// Handle of one mutable vector cell: one 32-bit scalar per lane. Floats
/// are stored by bit pattern.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Cell(u32);

#[derive(Debug, Clone, Copy)]
enum Op {
    ConstI(i32, Cell),
    ConstF(f32, Cell),
    Mov(Cell, Cell),
    Unary(UnOp, Cell, Cell),
    Binary(BinOp, Cell, Cell, Cell),
    Select(Cell, Cell, Cell, Cell),
    ReadInput(u8, Cell),
    ReadConst(u8, Cell),
    ReadCounter(u8, u8, Cell),
    ReadCoverage(Cell),
    WriteOutput(u8, Cell, Cell),
    MaskPush(Cell),
    MaskPop,
    MaskTop(Cell),
    MaskSetTop(Cell),
    CallPush(BlockId),
}

#[derive(Debug, Clone, Copy)]
enum Term {
    Open,
    Jump(BlockId),
    BranchAny(Cell, BlockId, BlockId),
    RetPop,
    End,
}

#[derive(Debug)]
struct Block {
    ops: Vec<Op>,
    term: Term,
}

/// A compiled routine in block-program form: the native block graph built by
/// the control-flow compiler, ready to run over quads. Immutable once built,
/// shareable across threads.
#[derive(Debug)]
pub struct QuadProgram {
    blocks: SlotMap<BlockId, Block>,
    entry: BlockId,
    cells: u32,
    mask_depth: usize,
    call_depth: usize,
}

impl QuadProgram {
    pub fn cell_count(&self) -> usize {
        self.cells as usize
    }

    pub fn block_count(&self) -> usize {
        self.blocks.len()
    }

    /// Upper bound on the enable-stack depth an invocation can reach.
    pub fn mask_depth(&self) -> usize {
        self.mask_depth
    }

    /// Upper bound on the call-stack depth an invocation can reach.
    pub fn call_depth(&self) -> usize {
        self.call_depth
    }
}

/// Reference implementation of [`Emit`]: records a [`QuadProgram`].
pub struct QuadEmitter {
    blocks: SlotMap<BlockId, Block>,
    current: Option<BlockId>,
    cells: u32,
}

impl QuadEmitter {
    pub fn new() -> Self {
        Self {
            blocks: SlotMap::with_key(),
            current: None,
            cells: 0,
        }
    }

    pub fn finish(self, entry: BlockId, mask_depth: usize, call_depth: usize) -> QuadProgram {
        for (_, block) in self.blocks.iter() {
            assert!(
                !matches!(block.term, Term::Open),
                "unterminated block in finished program"
            );
        }

        QuadProgram {
            blocks: self.blocks,
            entry,
            cells: self.cells,
            mask_depth,
            call_depth,
        }
    }

    fn push_op(&mut self, op: Op) {
        let id = self.current.expect("emission outside of a block");
        let block = &mut self.blocks[id];
        debug_assert!(matches!(block.term, Term::Open));
        block.ops.push(op);
    }

    fn terminate(&mut self, term: Term) {
        let id = self.current.take().expect("termination outside of a block");
        let block = &mut self.blocks[id];
        assert!(
            matches!(block.term, Term::Open),
            "block terminated twice"
        );
        block.term = term;
    }
}

impl Default for QuadEmitter {
    fn default() -> Self {
        Self::new()
    }
}

impl Emit for QuadEmitter {
    type Value = Cell;
    type Block = BlockId;

    fn cell(&mut self) -> Cell {
        let id = Cell(self.cells);
        self.cells += 1;
        id
    }

    fn block(&mut self) -> BlockId {
        self.blocks.insert(Block {
            ops: Vec::new(),
            term: Term::Open,
        })
    }

    fn position(&mut self, block: BlockId) {
        assert!(self.current.is_none(), "previous block is still open");
        self.current = Some(block);
    }

    fn const_i32(&mut self, dst: Cell, value: i32) {
        self.push_op(Op::ConstI(value, dst));
    }

    fn const_f32(&mut self, dst: Cell, value: f32) {
        self.push_op(Op::ConstF(value, dst));
    }

    fn mov(&mut self, dst: Cell, src: Cell) {
        self.push_op(Op::Mov(src, dst));
    }

    fn unary(&mut self, op: UnOp, dst: Cell, src: Cell) {
        self.push_op(Op::Unary(op, src, dst));
    }

    fn binary(&mut self, op: BinOp, dst: Cell, a: Cell, b: Cell) {
        self.push_op(Op::Binary(op, a, b, dst));
    }

    fn select(&mut self, dst: Cell, mask: Cell, a: Cell, b: Cell) {
        self.push_op(Op::Select(mask, a, b, dst));
    }

    fn read_input(&mut self, dst: Cell, slot: u8) {
        self.push_op(Op::ReadInput(slot, dst));
    }

    fn read_const(&mut self, dst: Cell, slot: u8) {
        self.push_op(Op::ReadConst(slot, dst));
    }

    fn read_counter_const(&mut self, dst: Cell, slot: u8, component: u8) {
        self.push_op(Op::ReadCounter(slot, component, dst));
    }

    fn read_coverage(&mut self, dst: Cell) {
        self.push_op(Op::ReadCoverage(dst));
    }

    fn write_output(&mut self, slot: u8, src: Cell, mask: Cell) {
        self.push_op(Op::WriteOutput(slot, src, mask));
    }

    fn mask_push(&mut self, src: Cell) {
        self.push_op(Op::MaskPush(src));
    }

    fn mask_pop(&mut self) {
        self.push_op(Op::MaskPop);
    }

    fn mask_top(&mut self, dst: Cell) {
        self.push_op(Op::MaskTop(dst));
    }

    fn mask_set_top(&mut self, src: Cell) {
        self.push_op(Op::MaskSetTop(src));
    }

    fn call_push(&mut self, ret: BlockId) {
        self.push_op(Op::CallPush(ret));
    }

    fn jump(&mut self, target: BlockId) {
        self.terminate(Term::Jump(target));
    }

    fn branch_any(&mut self, mask: Cell, if_any: BlockId, if_none: BlockId) {
        self.terminate(Term::BranchAny(mask, if_any, if_none));
    }

    fn ret_pop(&mut self) {
        self.terminate(Term::RetPop);
    }

    fn end(&mut self) {
        self.terminate(Term::End);
    }
}

/// Per-invocation data of one quad. Inputs and outputs are slot-major:
/// `inputs[slot][lane]`. Output slots a routine never wrote keep whatever
/// the caller put there; slots it declared are written for every covered
/// lane that did not leave.
pub struct QuadContext<'a> {
    pub inputs: &'a [[f32; QUAD_LANES]],
    pub consts: &'a [f32],
    pub counters: &'a [[i32; 4]],
    pub outputs: &'a mut [[f32; QUAD_LANES]],
    pub coverage: LaneMask,
}

/// Runs block programs over quads. Holds the mutable per-call state — cell
/// file, enable stack, call stack — so nothing about an invocation is
/// process-global; give each thread its own executor.
pub struct QuadExecutor<'a> {
    cells: BumpVec<'a, [i32; QUAD_LANES]>,
    masks: BumpVec<'a, [i32; QUAD_LANES]>,
    calls: BumpVec<'a, BlockId>,
}

#[inline(always)]
fn f(bits: i32) -> f32 {
    f32::from_bits(bits as u32)
}

#[inline(always)]
fn fi(value: f32) -> i32 {
    value.to_bits() as i32
}

#[inline(always)]
fn truth(value: bool) -> i32 {
    if value { -1 } else { 0 }
}

impl<'a> QuadExecutor<'a> {
    pub fn new(arena: &'a Bump) -> Self {
        Self {
            cells: BumpVec::new_in(arena),
            masks: BumpVec::new_in(arena),
            calls: BumpVec::new_in(arena),
        }
    }

    pub fn run(&mut self, program: &QuadProgram, ctx: &mut QuadContext) {
        self.cells.clear();
        self.cells.resize(program.cells as usize, [0; QUAD_LANES]);
        self.masks.clear();
        self.masks.reserve(program.mask_depth);
        self.calls.clear();
        self.calls.reserve(program.call_depth);

        let mut block = program.entry;
        loop {
            let b = &program.blocks[block];

            for op in b.ops.iter().copied() {
                match op {
                    Op::ConstI(value, dst) => {
                        self.cells[dst.0 as usize] = [value; QUAD_LANES];
                    }
                    Op::ConstF(value, dst) => {
                        self.cells[dst.0 as usize] = [fi(value); QUAD_LANES];
                    }
                    Op::Mov(src, dst) => {
                        self.cells[dst.0 as usize] = self.cells[src.0 as usize];
                    }
                    Op::Unary(op, src, dst) => {
                        let v = self.cells[src.0 as usize];
                        let out = &mut self.cells[dst.0 as usize];
                        for i in 0..QUAD_LANES {
                            out[i] = match op {
                                UnOp::Not => !v[i],
                                UnOp::NegF => fi(-f(v[i])),
                                UnOp::AbsF => fi(f(v[i]).abs()),
                                UnOp::FloorF => fi(f(v[i]).floor()),
                                UnOp::SqrtF => fi(f(v[i]).sqrt()),
                                UnOp::RcpF => fi(1.0 / f(v[i])),
                                UnOp::IntToFloat => fi(v[i] as f32),
                            };
                        }
                    }
                    Op::Binary(op, a, b, dst) => {
                        let va = self.cells[a.0 as usize];
                        let vb = self.cells[b.0 as usize];
                        let out = &mut self.cells[dst.0 as usize];
                        for i in 0..QUAD_LANES {
                            out[i] = match op {
                                BinOp::And => va[i] & vb[i],
                                BinOp::AndNot => va[i] & !vb[i],
                                BinOp::Or => va[i] | vb[i],
                                BinOp::AddI => va[i].wrapping_add(vb[i]),
                                BinOp::SubI => va[i].wrapping_sub(vb[i]),
                                BinOp::CmpGtI => truth(va[i] > vb[i]),
                                BinOp::AddF => fi(f(va[i]) + f(vb[i])),
                                BinOp::SubF => fi(f(va[i]) - f(vb[i])),
                                BinOp::MulF => fi(f(va[i]) * f(vb[i])),
                                BinOp::MinF => fi(f(va[i]).min(f(vb[i]))),
                                BinOp::MaxF => fi(f(va[i]).max(f(vb[i]))),
                                BinOp::CmpEqF => truth(f(va[i]) == f(vb[i])),
                                BinOp::CmpNeF => truth(f(va[i]) != f(vb[i])),
                                BinOp::CmpLtF => truth(f(va[i]) < f(vb[i])),
                                BinOp::CmpLeF => truth(f(va[i]) <= f(vb[i])),
                                BinOp::CmpGtF => truth(f(va[i]) > f(vb[i])),
                                BinOp::CmpGeF => truth(f(va[i]) >= f(vb[i])),
                            };
                        }
                    }
                    Op::Select(mask, a, b, dst) => {
                        let vm = self.cells[mask.0 as usize];
                        let va = self.cells[a.0 as usize];
                        let vb = self.cells[b.0 as usize];
                        let out = &mut self.cells[dst.0 as usize];
                        for i in 0..QUAD_LANES {
                            out[i] = vb[i] ^ ((vb[i] ^ va[i]) & vm[i]);
                        }
                    }
                    Op::ReadInput(slot, dst) => {
                        let v = ctx.inputs[slot as usize];
                        let out = &mut self.cells[dst.0 as usize];
                        for i in 0..QUAD_LANES {
                            out[i] = fi(v[i]);
                        }
                    }
                    Op::ReadConst(slot, dst) => {
                        self.cells[dst.0 as usize] = [fi(ctx.consts[slot as usize]); QUAD_LANES];
                    }
                    Op::ReadCounter(slot, component, dst) => {
                        let v = ctx.counters[slot as usize][component as usize];
                        self.cells[dst.0 as usize] = [v; QUAD_LANES];
                    }
                    Op::ReadCoverage(dst) => {
                        self.cells[dst.0 as usize] = ctx.coverage.to_vector();
                    }
                    Op::WriteOutput(slot, src, mask) => {
                        let v = self.cells[src.0 as usize];
                        let m = self.cells[mask.0 as usize];
                        let out = &mut ctx.outputs[slot as usize];
                        for i in 0..QUAD_LANES {
                            if m[i] != 0 {
                                out[i] = f(v[i]);
                            }
                        }
                    }
                    Op::MaskPush(src) => {
                        self.masks.push(self.cells[src.0 as usize]);
                    }
                    Op::MaskPop => {
                        self.masks.pop().expect("enable stack underflow");
                    }
                    Op::MaskTop(dst) => {
                        self.cells[dst.0 as usize] =
                            *self.masks.last().expect("enable stack empty");
                    }
                    Op::MaskSetTop(src) => {
                        *self.masks.last_mut().expect("enable stack empty") =
                            self.cells[src.0 as usize];
                    }
                    Op::CallPush(ret) => {
                        self.calls.push(ret);
                    }
                }
            }

            match b.term {
                Term::Jump(next) => block = next,
                Term::BranchAny(mask, if_any, if_none) => {
                    let m = self.cells[mask.0 as usize];
                    block = if m.iter().any(|&lane| lane != 0) {
                        if_any
                    } else {
                        if_none
                    };
                }
                Term::RetPop => {
                    block = self.calls.pop().expect("return without a call");
                }
                Term::End => break,
                Term::Open => unreachable!("unterminated block"),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_straight_line() {
        let mut em = QuadEmitter::new();
        let entry = em.block();
        em.position(entry);

        let cov = em.cell();
        em.read_coverage(cov);

        let x = em.cell();
        em.read_input(x, 0);
        let two = em.cell();
        em.const_f32(two, 2.0);
        let r = em.cell();
        em.binary(BinOp::MulF, r, x, two);
        em.write_output(0, r, cov);
        em.end();

        let program = em.finish(entry, 1, 0);
        let arena = Bump::new();
        let mut exec = QuadExecutor::new(&arena);

        let mut outputs = [[0.0; QUAD_LANES]];
        let mut ctx = QuadContext {
            inputs: &[[1.0, 2.0, 3.0, 4.0]],
            consts: &[],
            counters: &[],
            outputs: &mut outputs,
            coverage: LaneMask::ALL,
        };
        exec.run(&program, &mut ctx);
        assert_eq!(outputs[0], [2.0, 4.0, 6.0, 8.0]);
    }

    #[test]
    fn test_masked_write_respects_coverage() {
        let mut em = QuadEmitter::new();
        let entry = em.block();
        em.position(entry);

        let cov = em.cell();
        em.read_coverage(cov);
        let v = em.cell();
        em.const_f32(v, 7.0);
        em.write_output(0, v, cov);
        em.end();

        let program = em.finish(entry, 1, 0);
        let arena = Bump::new();
        let mut exec = QuadExecutor::new(&arena);

        let mut outputs = [[-1.0; QUAD_LANES]];
        let mut ctx = QuadContext {
            inputs: &[],
            consts: &[],
            counters: &[],
            outputs: &mut outputs,
            coverage: LaneMask::lane(1) | LaneMask::lane(3),
        };
        exec.run(&program, &mut ctx);
        assert_eq!(outputs[0], [-1.0, 7.0, -1.0, 7.0]);
    }

    #[test]
    fn test_branch_any_and_enable_stack() {
        let mut em = QuadEmitter::new();
        let entry = em.block();
        em.position(entry);

        let cov = em.cell();
        em.read_coverage(cov);
        em.mask_push(cov);

        let none = em.cell();
        em.const_i32(none, 0);

        let taken = em.block();
        let skipped = em.block();
        let done = em.block();

        em.branch_any(none, skipped, taken);

        em.position(taken);
        let top = em.cell();
        em.mask_top(top);
        let v = em.cell();
        em.const_f32(v, 1.0);
        em.write_output(0, v, top);
        em.jump(done);

        em.position(skipped);
        let v2 = em.cell();
        em.const_f32(v2, 9.0);
        em.write_output(0, v2, cov);
        em.jump(done);

        em.position(done);
        em.mask_pop();
        em.end();

        let program = em.finish(entry, 1, 0);
        let arena = Bump::new();
        let mut exec = QuadExecutor::new(&arena);

        let mut outputs = [[0.0; QUAD_LANES]];
        let mut ctx = QuadContext {
            inputs: &[],
            consts: &[],
            counters: &[],
            outputs: &mut outputs,
            coverage: LaneMask::ALL,
        };
        exec.run(&program, &mut ctx);

        // the all-zero mask must take the if_none edge
        assert_eq!(outputs[0], [1.0; QUAD_LANES]);
    }

    #[test]
    fn test_call_stack_round_trip() {
        let mut em = QuadEmitter::new();
        let entry = em.block();
        let sub = em.block();
        let ret = em.block();

        em.position(entry);
        let cov = em.cell();
        em.read_coverage(cov);
        em.call_push(ret);
        em.jump(sub);

        em.position(sub);
        let v = em.cell();
        em.const_f32(v, 5.0);
        em.write_output(0, v, cov);
        em.ret_pop();

        em.position(ret);
        em.end();

        let program = em.finish(entry, 0, 1);
        let arena = Bump::new();
        let mut exec = QuadExecutor::new(&arena);

        let mut outputs = [[0.0; QUAD_LANES]];
        let mut ctx = QuadContext {
            inputs: &[],
            consts: &[],
            counters: &[],
            outputs: &mut outputs,
            coverage: LaneMask::ALL,
        };
        exec.run(&program, &mut ctx);
        assert_eq!(outputs[0], [5.0; QUAD_LANES]);
    }
}
