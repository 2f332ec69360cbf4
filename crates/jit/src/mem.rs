//! Memory for hosting generated code.
//!
//! Two allocators live here: a generic aligned heap allocator used for
//! compile-time scratch structures that need explicit alignment, and the
//! page-granular executable allocator backing compiled routines. Protection
//! changes are page-granular on every supported OS, which is why executable
//! regions cannot come from the ordinary heap.

use std::alloc::{self, Layout};
use std::ptr::{self, NonNull};
use std::{error, fmt, mem};
use tracing::{error, warn};

/// What to do when flipping a region to executable fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtectPolicy {
    /// Abort the process. Failing to protect JIT memory is a platform or
    /// security-configuration problem, not a data error.
    Fatal,
    /// Log and continue with a region that stays writable and may not be
    /// executable. Callers must check [`CodeBlock::is_executable`] before
    /// running code out of it.
    Permissive,
}

/// Process-scoped memory configuration, queried once and passed to whoever
/// needs it. The page size never changes for the lifetime of a process.
#[derive(Debug, Clone, Copy)]
pub struct MemoryConfig {
    page_size: usize,
    protect_policy: ProtectPolicy,
}

impl MemoryConfig {
    pub fn detect() -> Self {
        Self::with_policy(ProtectPolicy::Fatal)
    }

    pub fn with_policy(protect_policy: ProtectPolicy) -> Self {
        Self {
            page_size: os::page_size(),
            protect_policy,
        }
    }

    pub fn page_size(&self) -> usize {
        self.page_size
    }

    pub fn protect_policy(&self) -> ProtectPolicy {
        self.protect_policy
    }

    /// Rounds an allocation request up to a protectable unit.
    pub fn round_to_page(&self, bytes: usize) -> usize {
        let bytes = bytes.max(1);
        (bytes + self.page_size - 1) & !(self.page_size - 1)
    }
}

#[derive(Debug)]
pub enum MemoryError {
    /// The underlying allocation failed.
    Exhausted,
    /// A protection change was refused by the OS and the policy allows
    /// continuing; the region is not runnable.
    NotExecutable,
    /// The requested write does not fit the region.
    CodeTooLarge { len: usize, capacity: usize },
}

impl fmt::Display for MemoryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MemoryError::Exhausted => write!(f, "out of memory"),
            MemoryError::NotExecutable => write!(f, "code region could not be made executable"),
            MemoryError::CodeTooLarge { len, capacity } => {
                write!(f, "code of {len} bytes does not fit region of {capacity} bytes")
            }
        }
    }
}

impl error::Error for MemoryError {}

#[repr(C)]
#[derive(Clone, Copy)]
struct AllocHeader {
    base: *mut u8,
    layout: Layout,
}

/// Allocates `bytes` of zeroed memory aligned to `align`. Returns null only
/// if the underlying allocation fails. Release with [`deallocate`]; the
/// original allocation is recovered from a header stored ahead of the
/// returned pointer.
pub fn allocate(bytes: usize, align: usize) -> *mut u8 {
    let align = align.max(mem::align_of::<AllocHeader>()).next_power_of_two();
    let Some(total) = bytes.checked_add(align + mem::size_of::<AllocHeader>()) else {
        return ptr::null_mut();
    };
    let Ok(layout) = Layout::from_size_align(total, mem::align_of::<AllocHeader>()) else {
        return ptr::null_mut();
    };

    // SAFETY: layout has nonzero size (header + align padding).
    let base = unsafe { alloc::alloc_zeroed(layout) };
    if base.is_null() {
        return ptr::null_mut();
    }

    let addr = base as usize + mem::size_of::<AllocHeader>();
    let user = (addr + align - 1) & !(align - 1);

    // SAFETY: user - size_of::<AllocHeader>() >= base, and user is aligned
    // to at least align_of::<AllocHeader>().
    unsafe {
        let header = (user as *mut AllocHeader).sub(1);
        header.write(AllocHeader { base, layout });
    }

    user as *mut u8
}

/// Releases memory obtained from [`allocate`]. No-op on null. Double frees
/// and foreign pointers are the caller's contract and are not checked.
pub unsafe fn deallocate(ptr: *mut u8) {
    if ptr.is_null() {
        return;
    }

    // SAFETY: ptr came from allocate, so a valid header sits right before it.
    unsafe {
        let header = (ptr as *mut AllocHeader).sub(1).read();
        alloc::dealloc(header.base, header.layout);
    }
}

/// A page-granular region that hosts generated code. Starts writable, flips
/// to read+execute once the code is in place, and is restored to writable on
/// release. Owned by exactly one compiled routine; whoever drops it must
/// have serialized against in-flight executions first.
pub struct CodeBlock {
    ptr: NonNull<u8>,
    len: usize,
    executable: bool,
    policy: ProtectPolicy,
}

// The region is only mutated through &mut self while it is writable.
unsafe impl Send for CodeBlock {}
unsafe impl Sync for CodeBlock {}

impl CodeBlock {
    /// Maps a writable region of at least `bytes`, rounded up to whole
    /// pages.
    pub fn new(config: &MemoryConfig, bytes: usize) -> Result<Self, MemoryError> {
        let len = config.round_to_page(bytes);
        let ptr = os::map_writable(len).ok_or(MemoryError::Exhausted)?;
        Ok(Self {
            ptr,
            len,
            executable: false,
            policy: config.protect_policy(),
        })
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn as_ptr(&self) -> *const u8 {
        self.ptr.as_ptr()
    }

    pub fn is_executable(&self) -> bool {
        self.executable
    }

    /// Copies finished machine code to the start of the region. Must happen
    /// before [`CodeBlock::make_executable`].
    pub fn copy_code(&mut self, code: &[u8]) -> Result<(), MemoryError> {
        assert!(!self.executable, "region already marked executable");
        if code.len() > self.len {
            return Err(MemoryError::CodeTooLarge {
                len: code.len(),
                capacity: self.len,
            });
        }
        os::write_code(self.ptr.as_ptr(), code);
        Ok(())
    }

    /// Flips the region from writable to read+execute. Returns whether the
    /// region is executable afterwards; under [`ProtectPolicy::Permissive`]
    /// a failure is logged and execution out of the region must not be
    /// attempted.
    pub fn make_executable(&mut self) -> bool {
        if self.executable {
            return true;
        }

        match os::protect_exec(self.ptr.as_ptr(), self.len) {
            Ok(()) => {
                self.executable = true;
                true
            }
            Err(err) => match self.policy {
                ProtectPolicy::Fatal => {
                    error!(%err, "failed to mark code region executable");
                    std::process::abort();
                }
                ProtectPolicy::Permissive => {
                    warn!(%err, "code region left writable, execution disabled");
                    false
                }
            },
        }
    }
}

impl Drop for CodeBlock {
    fn drop(&mut self) {
        if self.executable {
            // restore writable protection before handing pages back
            if let Err(err) = os::protect_writable(self.ptr.as_ptr(), self.len) {
                warn!(%err, "failed to restore writable protection on release");
            }
        }
        os::unmap(self.ptr.as_ptr(), self.len);
    }
}

#[cfg(all(unix, not(target_os = "macos")))]
mod os {
    use std::io;
    use std::ptr::NonNull;

    pub fn page_size() -> usize {
        let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
        if size > 0 { size as usize } else { 4096 }
    }

    pub fn map_writable(len: usize) -> Option<NonNull<u8>> {
        let ptr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_ANON | libc::MAP_PRIVATE,
                -1,
                0,
            )
        };
        if ptr == libc::MAP_FAILED {
            return None;
        }
        NonNull::new(ptr as *mut u8)
    }

    pub fn write_code(ptr: *mut u8, code: &[u8]) {
        unsafe {
            std::ptr::copy_nonoverlapping(code.as_ptr(), ptr, code.len());
        }
    }

    pub fn protect_exec(ptr: *mut u8, len: usize) -> io::Result<()> {
        let rc = unsafe { libc::mprotect(ptr as *mut _, len, libc::PROT_READ | libc::PROT_EXEC) };
        if rc != 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    pub fn protect_writable(ptr: *mut u8, len: usize) -> io::Result<()> {
        let rc = unsafe { libc::mprotect(ptr as *mut _, len, libc::PROT_READ | libc::PROT_WRITE) };
        if rc != 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    pub fn unmap(ptr: *mut u8, len: usize) {
        unsafe {
            libc::munmap(ptr as *mut _, len);
        }
    }
}

#[cfg(target_os = "macos")]
mod os {
    use std::io;
    use std::ptr::NonNull;

    unsafe extern "C" {
        fn pthread_jit_write_protect_supported_np() -> libc::c_int;
        fn pthread_jit_write_protect_np(enabled: libc::c_int);
    }

    pub fn page_size() -> usize {
        let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
        if size > 0 { size as usize } else { 4096 }
    }

    // MAP_JIT regions are mapped RWX up front; the write/execute toggle is
    // per thread via pthread_jit_write_protect_np.
    pub fn map_writable(len: usize) -> Option<NonNull<u8>> {
        let ptr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE | libc::PROT_EXEC,
                libc::MAP_ANON | libc::MAP_PRIVATE | libc::MAP_JIT,
                -1,
                0,
            )
        };
        if ptr == libc::MAP_FAILED {
            return None;
        }
        NonNull::new(ptr as *mut u8)
    }

    pub fn write_code(ptr: *mut u8, code: &[u8]) {
        unsafe {
            let use_write_protect = pthread_jit_write_protect_supported_np() != 0;
            if use_write_protect {
                pthread_jit_write_protect_np(0);
            }
            std::ptr::copy_nonoverlapping(code.as_ptr(), ptr, code.len());
            if use_write_protect {
                pthread_jit_write_protect_np(1);
            }
        }
    }

    pub fn protect_exec(_ptr: *mut u8, _len: usize) -> io::Result<()> {
        Ok(())
    }

    pub fn protect_writable(_ptr: *mut u8, _len: usize) -> io::Result<()> {
        Ok(())
    }

    pub fn unmap(ptr: *mut u8, len: usize) {
        unsafe {
            libc::munmap(ptr as *mut _, len);
        }
    }
}

#[cfg(windows)]
mod os {
    use std::io;
    use std::ptr::NonNull;
    use windows_sys::Win32::System::Diagnostics::Debug::FlushInstructionCache;
    use windows_sys::Win32::System::Memory::{
        MEM_COMMIT, MEM_RELEASE, MEM_RESERVE, PAGE_EXECUTE_READ, PAGE_READWRITE, VirtualAlloc,
        VirtualFree, VirtualProtect,
    };
    use windows_sys::Win32::System::SystemInformation::{GetSystemInfo, SYSTEM_INFO};
    use windows_sys::Win32::System::Threading::GetCurrentProcess;

    pub fn page_size() -> usize {
        let mut info: SYSTEM_INFO = unsafe { std::mem::zeroed() };
        unsafe { GetSystemInfo(&mut info) };
        (info.dwPageSize as usize).max(4096)
    }

    pub fn map_writable(len: usize) -> Option<NonNull<u8>> {
        let ptr = unsafe {
            VirtualAlloc(
                std::ptr::null_mut(),
                len,
                MEM_COMMIT | MEM_RESERVE,
                PAGE_READWRITE,
            )
        };
        NonNull::new(ptr as *mut u8)
    }

    pub fn write_code(ptr: *mut u8, code: &[u8]) {
        unsafe {
            std::ptr::copy_nonoverlapping(code.as_ptr(), ptr, code.len());
        }
    }

    pub fn protect_exec(ptr: *mut u8, len: usize) -> io::Result<()> {
        let mut old_protect = 0u32;
        let ok = unsafe { VirtualProtect(ptr as *mut _, len, PAGE_EXECUTE_READ, &mut old_protect) };
        if ok == 0 {
            return Err(io::Error::last_os_error());
        }
        let ok = unsafe { FlushInstructionCache(GetCurrentProcess(), ptr as *const _, len) };
        if ok == 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    pub fn protect_writable(ptr: *mut u8, len: usize) -> io::Result<()> {
        let mut old_protect = 0u32;
        let ok = unsafe { VirtualProtect(ptr as *mut _, len, PAGE_READWRITE, &mut old_protect) };
        if ok == 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    pub fn unmap(ptr: *mut u8, _len: usize) {
        unsafe {
            VirtualFree(ptr as *mut _, 0, MEM_RELEASE);
        }
    }
}

#[cfg(not(any(unix, windows)))]
mod os {
    use std::io;
    use std::ptr::NonNull;

    pub fn page_size() -> usize {
        4096
    }

    pub fn map_writable(_len: usize) -> Option<NonNull<u8>> {
        None
    }

    pub fn write_code(_ptr: *mut u8, _code: &[u8]) {}

    pub fn protect_exec(_ptr: *mut u8, _len: usize) -> io::Result<()> {
        Err(io::Error::other("executable memory not supported on this platform"))
    }

    pub fn protect_writable(_ptr: *mut u8, _len: usize) -> io::Result<()> {
        Ok(())
    }

    pub fn unmap(_ptr: *mut u8, _len: usize) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_allocate_round_trip() {
        let ptr = allocate(1024, 64);
        assert!(!ptr.is_null());
        assert_eq!(ptr as usize % 64, 0);

        // zero initialized
        let slice = unsafe { std::slice::from_raw_parts(ptr, 1024) };
        assert!(slice.iter().all(|&b| b == 0));

        unsafe {
            std::ptr::write_bytes(ptr, 0xAB, 1024);
            deallocate(ptr);
        }

        // a second allocation of the same shape may reuse the address and
        // must still come back zeroed
        let ptr = allocate(1024, 64);
        assert!(!ptr.is_null());
        let slice = unsafe { std::slice::from_raw_parts(ptr, 1024) };
        assert!(slice.iter().all(|&b| b == 0));
        unsafe { deallocate(ptr) };

        // null release is a no-op
        unsafe { deallocate(std::ptr::null_mut()) };
    }

    #[test]
    fn test_large_alignment() {
        let ptr = allocate(16, 4096);
        assert!(!ptr.is_null());
        assert_eq!(ptr as usize % 4096, 0);
        unsafe { deallocate(ptr) };
    }

    #[test]
    fn test_page_rounding() {
        let config = MemoryConfig::detect();
        assert!(config.page_size().is_power_of_two());
        assert_eq!(config.round_to_page(1), config.page_size());
        assert_eq!(config.round_to_page(config.page_size()), config.page_size());
        assert_eq!(
            config.round_to_page(config.page_size() + 1),
            config.page_size() * 2
        );
    }

    #[cfg(any(target_arch = "x86_64", target_arch = "aarch64"))]
    #[test]
    fn test_exec_page_round_trip() {
        // return 42
        #[cfg(target_arch = "x86_64")]
        const STUB: &[u8] = &[0xB8, 0x2A, 0x00, 0x00, 0x00, 0xC3];
        #[cfg(target_arch = "aarch64")]
        const STUB: &[u8] = &[
            0x40, 0x05, 0x80, 0x52, // mov w0, #42
            0xC0, 0x03, 0x5F, 0xD6, // ret
        ];

        let config = MemoryConfig::detect();
        let mut block = CodeBlock::new(&config, STUB.len()).unwrap();
        assert_eq!(block.len(), config.page_size());
        assert!(!block.is_executable());

        block.copy_code(STUB).unwrap();
        assert!(block.make_executable());

        let f: extern "C" fn() -> i32 = unsafe { std::mem::transmute(block.as_ptr()) };
        assert_eq!(f(), 42);
        drop(block);
    }

    #[test]
    fn test_code_too_large() {
        let config = MemoryConfig::detect();
        let mut block = CodeBlock::new(&config, 8).unwrap();
        let oversized = vec![0u8; config.page_size() + 1];
        assert!(matches!(
            block.copy_code(&oversized),
            Err(MemoryError::CodeTooLarge { .. })
        ));
    }
}
