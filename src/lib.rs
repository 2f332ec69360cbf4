pub use quadjit_core::{
    CmpOp, Cond, Dst, Fingerprint, Inst, LabelId, PipelineState, Src, Stage, code_hash,
};
pub use quadjit_jit::{
    BinOp, BlockId, BoundRoutine, Cell, CodeBlock, CompileError, CompilerOptions, Emit, LaneMask,
    MAX_CALL_DEPTH, MAX_NESTING, MemoryConfig, MemoryError, NativeRoutine, ProtectPolicy,
    QUAD_LANES, Quad, QuadContext, QuadEmitter, QuadExecutor, QuadProgram, RoutineCache,
    RoutineFn, RoutineShape, UnOp, allocate, compile, compile_into, deallocate, dispatch_simd,
    run_batch,
};

#[cfg(feature = "parallel")]
pub use quadjit_jit::run_batch_parallel;
