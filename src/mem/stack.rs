//! Thread stack memory.
//!
//! [`StackRegion`] is a bounds-checked view over the memory a thread will run
//! on. Creation uses it to place the initial register frame; the switch path
//! only ever sees the resulting addresses through [`StackInfo`].

use core::ptr::NonNull;

use alloc::boxed::Box;

use crate::config::{STACK_FILL_PATTERN, STACK_MONITOR_COARSE_BYTES};
use crate::errors::CreateError;

/// Statically allocatable stack storage.
///
/// ```ignore
/// static mut WORKER_STACK: ThreadStack<2048> = ThreadStack::new();
/// let region = unsafe { (*core::ptr::addr_of_mut!(WORKER_STACK)).region() };
/// ```
#[repr(C, align(16))]
pub struct ThreadStack<const N: usize>([u8; N]);

impl<const N: usize> ThreadStack<N> {
    pub const fn new() -> Self {
        Self([0; N])
    }

    pub fn region(&'static mut self) -> StackRegion {
        StackRegion::new(&mut self.0)
    }
}

impl<const N: usize> Default for ThreadStack<N> {
    fn default() -> Self {
        Self::new()
    }
}

/// Memory a thread stack lives in, lowest address first.
#[derive(Debug)]
pub struct StackRegion {
    base: NonNull<u8>,
    len: usize,
}

// SAFETY: the region exclusively owns its memory.
unsafe impl Send for StackRegion {}

impl StackRegion {
    pub fn new(mem: &'static mut [u8]) -> Self {
        let len = mem.len();
        Self {
            base: NonNull::from(mem).cast(),
            len,
        }
    }

    /// Leak a heap buffer and use it as a stack.
    pub fn from_boxed(mem: Box<[u8]>) -> Self {
        Self::new(Box::leak(mem))
    }

    /// Heap-allocate a zeroed stack of `len` bytes.
    pub fn allocate(len: usize) -> Self {
        Self::from_boxed(alloc::vec![0u8; len].into_boxed_slice())
    }

    /// # Safety
    ///
    /// `base..base + len` must be valid, writable, unaliased memory that
    /// outlives every thread created on it.
    pub unsafe fn from_raw_parts(base: NonNull<u8>, len: usize) -> Self {
        Self { base, len }
    }

    pub fn base(&self) -> usize {
        self.base.as_ptr() as usize
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Address of an initial frame of `frame_size` bytes at the top of the
    /// first `stack_size` bytes, rounded down to `align`.
    pub fn frame_address(
        &self,
        stack_size: usize,
        frame_size: usize,
        align: usize,
    ) -> Result<usize, CreateError> {
        debug_assert!(align.is_power_of_two());
        if stack_size > self.len {
            return Err(CreateError::StackExceedsRegion {
                size: stack_size,
                region: self.len,
            });
        }
        // An aligned frame fits iff it fits above the first aligned address.
        let padding = self.base().wrapping_neg() & (align - 1);
        let required = padding + frame_size;
        if stack_size < required {
            return Err(CreateError::StackTooSmall {
                size: stack_size,
                required,
            });
        }
        let addr = (self.base() + stack_size - frame_size) & !(align - 1);
        debug_assert!(addr >= self.base());
        Ok(addr)
    }

    /// Copy `frame` to `addr`, which must lie fully inside the region.
    pub fn write_frame<F: Copy>(&mut self, addr: usize, frame: &F) -> Result<(), CreateError> {
        let size = core::mem::size_of::<F>();
        if addr < self.base()
            || addr + size > self.base() + self.len
            || addr % core::mem::align_of::<F>() != 0
        {
            return Err(CreateError::FrameOutOfBounds { addr });
        }
        // SAFETY: in bounds and aligned, checked above.
        unsafe { core::ptr::write(addr as *mut F, *frame) };
        Ok(())
    }

    /// Fill `[base, end)` with the sentinel pattern, word by word.
    pub fn fill_below(&mut self, end: usize) {
        let end = end.min(self.base() + self.len);
        let mut addr = (self.base() + 3) & !3;
        while addr + 4 <= end {
            // SAFETY: word-aligned and inside the region.
            unsafe { core::ptr::write(addr as *mut u32, STACK_FILL_PATTERN) };
            addr += 4;
        }
    }
}

/// Stack bounds recorded in the TCB.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StackInfo {
    pub start: usize,
    pub size: usize,
}

impl StackInfo {
    pub const EMPTY: Self = Self { start: 0, size: 0 };

    pub fn end(&self) -> usize {
        self.start + self.size
    }

    /// Whether a `len`-byte object at `addr` lies inside the stack.
    pub fn contains(&self, addr: usize, len: usize) -> bool {
        addr >= self.start && addr.saturating_add(len) <= self.end()
    }

    /// Bytes between the stack start and the first word that no longer
    /// carries the sentinel pattern, scanning up to `limit`.
    ///
    /// # Safety
    ///
    /// `[start, limit)` must be readable.
    pub unsafe fn untouched_bytes(&self, limit: usize) -> usize {
        let mut addr = (self.start + 3) & !3;
        let limit = limit.min(self.end());
        while addr + 4 <= limit {
            // SAFETY: word-aligned, inside the stack, readable per contract.
            if unsafe { core::ptr::read_volatile(addr as *const u32) } != STACK_FILL_PATTERN {
                break;
            }
            addr += 4;
        }
        addr - self.start
    }

    /// Bytes never written since the stack was filled with the sentinel
    /// pattern. Only meaningful with the `stack-sentinel` feature.
    ///
    /// # Safety
    ///
    /// The stack memory must be readable.
    pub unsafe fn unused_bytes(&self) -> usize {
        // SAFETY: forwarded.
        unsafe { self.untouched_bytes(self.end()) }
    }

    /// Free space below a frame saved at `sp`, refined by the sentinel scan
    /// when the coarse estimate is small. `None` means overflow.
    ///
    /// # Safety
    ///
    /// The stack memory must be readable.
    pub unsafe fn free_below(&self, sp: usize) -> Option<usize> {
        let coarse = sp.checked_sub(self.start)?;
        if coarse >= STACK_MONITOR_COARSE_BYTES || !cfg!(feature = "stack-sentinel") {
            return Some(coarse);
        }
        // SAFETY: forwarded.
        let precise = unsafe { self.untouched_bytes(sp) };
        Some(coarse.min(precise))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn frame_sits_at_top() {
        let region = StackRegion::allocate(1024);
        let addr = region.frame_address(1024, 144, 8).unwrap();
        assert_eq!(addr % 8, 0);
        assert!(addr + 144 <= region.base() + 1024);
        assert!(region.base() + 1024 - (addr + 144) < 8);
    }

    fn aligned<const N: usize>() -> StackRegion {
        Box::leak(Box::new(ThreadStack::<N>::new())).region()
    }

    #[test]
    fn too_small_or_too_large() {
        let region = aligned::<256>();
        assert_eq!(
            region.frame_address(100, 144, 8),
            Err(CreateError::StackTooSmall { size: 100, required: 144 })
        );
        assert_eq!(
            region.frame_address(512, 144, 8),
            Err(CreateError::StackExceedsRegion { size: 512, region: 256 })
        );
    }

    #[test]
    fn exact_fit_on_an_aligned_base() {
        let region = aligned::<160>();
        for size in 144..=150 {
            assert_eq!(region.frame_address(size, 144, 8), Ok(region.base()));
        }
        assert_eq!(region.frame_address(144, 144, 16), Ok(region.base()));
        assert_eq!(
            region.frame_address(143, 144, 8),
            Err(CreateError::StackTooSmall { size: 143, required: 144 })
        );
    }

    #[test]
    fn misaligned_base_needs_padding() {
        let region = aligned::<176>();
        // SAFETY: a sub-slice of the leaked stack above.
        let shifted = unsafe {
            StackRegion::from_raw_parts(NonNull::new_unchecked((region.base() + 4) as *mut u8), 172)
        };
        assert_eq!(
            shifted.frame_address(144, 144, 8),
            Err(CreateError::StackTooSmall { size: 144, required: 148 })
        );
        assert_eq!(shifted.frame_address(148, 144, 8), Ok(region.base() + 8));
    }

    #[test]
    fn write_frame_is_bounds_checked() {
        let mut region = StackRegion::allocate(256);
        let below = region.base().wrapping_sub(8) & !7;
        assert!(region.write_frame(below, &[0u32; 4]).is_err());
        let top = (region.base() + 256) & !7;
        assert!(region.write_frame(top, &[0u32; 4]).is_err());
        let ok = (region.base() + 64) & !7;
        assert!(region.write_frame(ok, &[7u32; 4]).is_ok());
    }

    #[test]
    fn sentinel_scan() {
        let mut region = StackRegion::allocate(512);
        let base = (region.base() + 3) & !3;
        region.fill_below(base + 256);
        let info = StackInfo { start: base, size: 512 - (base - region.base()) };
        // SAFETY: region memory is live and readable.
        unsafe {
            assert_eq!(info.untouched_bytes(base + 512), 256);
            core::ptr::write((base + 40) as *mut u32, 0);
            assert_eq!(info.untouched_bytes(base + 512), 40);
            assert_eq!(info.free_below(base - 4), None);
            let expected = if cfg!(feature = "stack-sentinel") { 40 } else { 100 };
            assert_eq!(info.free_below(base + 100), Some(expected));
            assert_eq!(info.free_below(base + 300), Some(300));
        }
    }

    proptest! {
        #[test]
        fn frame_address_is_aligned(
            len in 256usize..4096,
            slack in 0usize..256,
            align_shift in 2u32..5,
        ) {
            let align = 1usize << align_shift;
            let region = StackRegion::allocate(len);
            let size = len - slack;
            let frame = 144;
            match region.frame_address(size, frame, align) {
                Ok(addr) => {
                    prop_assert_eq!(addr % align, 0);
                    prop_assert!(addr >= region.base());
                    prop_assert!(addr + frame <= region.base() + size);
                }
                Err(e) => {
                    let padding = region.base().wrapping_neg() & (align - 1);
                    prop_assert!(size < padding + frame, "{}", e);
                }
            }
        }
    }
}
