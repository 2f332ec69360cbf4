mod inst;
mod stage;
mod state;

pub use inst::{CmpOp, Cond, Dst, Inst, LabelId, Src};
pub use stage::Stage;
pub use state::{Fingerprint, PipelineState, code_hash};
