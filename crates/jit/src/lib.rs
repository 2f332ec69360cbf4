mod batch;
mod cache;
mod compile;
mod dispatch;
mod emit;
mod mask;
mod mem;
mod program;
mod routine;

pub use batch::*;
pub use cache::*;
pub use compile::*;
pub use dispatch::*;
pub use emit::*;
pub use mask::*;
pub use mem::*;
pub use program::*;
pub use routine::*;

/// Lanes per group. One compiled routine invocation processes one quad of
/// pixels (or vertices) in lock-step.
pub const QUAD_LANES: usize = 4;

/// Deepest statically nested control flow a single routine body may open.
pub const MAX_NESTING: usize = 24;

/// Default bound on the call stack. Call chains deeper than this are
/// rejected when the routine is compiled.
pub const MAX_CALL_DEPTH: usize = 16;
