use crate::mem::{CodeBlock, MemoryConfig, MemoryError};

/// Entry point of a natively compiled routine: one pointer to per-lane input
/// data, one pointer to per-lane output/uniform data.
pub type RoutineFn = unsafe extern "C" fn(*const u8, *mut u8);

/// A materialized routine: machine code resident in one executable region.
/// Dropping it releases the region exactly once; the routine cache keeps
/// these behind `Arc` so an in-flight execution can never outlive its code.
pub struct NativeRoutine {
    code: CodeBlock,
}

impl NativeRoutine {
    /// Places finished machine code into fresh executable memory.
    pub fn from_code(config: &MemoryConfig, code: &[u8]) -> Result<Self, MemoryError> {
        let mut block = CodeBlock::new(config, code.len())?;
        block.copy_code(code)?;
        if !block.make_executable() {
            return Err(MemoryError::NotExecutable);
        }
        Ok(Self { code: block })
    }

    pub fn code_size(&self) -> usize {
        self.code.len()
    }

    /// SAFETY: the caller must guarantee the code at the entry point matches
    /// [`RoutineFn`] and that both pointers satisfy the routine's layout
    /// expectations.
    pub fn entry(&self) -> RoutineFn {
        unsafe { std::mem::transmute(self.code.as_ptr()) }
    }

    /// SAFETY: same contract as [`NativeRoutine::entry`].
    pub unsafe fn invoke(&self, input: *const u8, output: *mut u8) {
        unsafe { (self.entry())(input, output) }
    }
}
