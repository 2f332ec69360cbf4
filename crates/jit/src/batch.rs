use crate::dispatch::dispatch_simd;
use crate::mask::LaneMask;
use crate::program::{QuadContext, QuadExecutor, QuadProgram};
use crate::QUAD_LANES;
use bumpalo::Bump;

/// One quad's worth of work in a batch: its varying inputs, where its
/// outputs go, and which lanes are covered.
pub struct Quad<'a> {
    pub inputs: &'a [[f32; QUAD_LANES]],
    pub outputs: &'a mut [[f32; QUAD_LANES]],
    pub coverage: LaneMask,
}

/// Runs one compiled routine over a batch of quads on the calling thread,
/// reusing a single executor.
pub fn run_batch(
    program: &QuadProgram,
    consts: &[f32],
    counters: &[[i32; 4]],
    quads: &mut [Quad<'_>],
) {
    let arena = Bump::new();
    let mut exec = QuadExecutor::new(&arena);

    dispatch_simd(|| {
        for quad in quads {
            let mut ctx = QuadContext {
                inputs: quad.inputs,
                consts,
                counters,
                outputs: &mut *quad.outputs,
                coverage: quad.coverage,
            };
            exec.run(program, &mut ctx);
        }
    });
}

/// Like [`run_batch`] but fans quads out across the rayon pool. Every worker
/// gets its own executor; the program itself is shared read-only.
#[cfg(feature = "parallel")]
pub fn run_batch_parallel(
    program: &QuadProgram,
    consts: &[f32],
    counters: &[[i32; 4]],
    quads: &mut [Quad<'_>],
) {
    use rayon::prelude::*;

    quads.par_iter_mut().for_each(|quad| {
        let arena = Bump::new();
        let mut exec = QuadExecutor::new(&arena);

        dispatch_simd(|| {
            let mut ctx = QuadContext {
                inputs: quad.inputs,
                consts,
                counters,
                outputs: &mut *quad.outputs,
                coverage: quad.coverage,
            };
            exec.run(program, &mut ctx);
        });
    });
}
