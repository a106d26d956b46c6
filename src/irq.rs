//! Interrupt lock keys.
//!
//! `irq_lock` masks interrupts and hands back an [`IrqKey`] recording
//! whether they were enabled before; `irq_unlock` restores exactly that
//! state. Nested pairs therefore compose: only the outermost unlock turns
//! interrupts back on. Keys cannot be copied or built outside this crate, so
//! each one is released at most once.

use crate::arch::Arch;

/// Snapshot of the interrupt-enable state taken by `irq_lock`.
#[must_use = "an interrupt lock key must be handed back to irq_unlock"]
#[derive(Debug, PartialEq, Eq)]
pub struct IrqKey(u32);

impl IrqKey {
    pub(crate) const fn from_raw(raw: u32) -> Self {
        Self(raw)
    }

    pub(crate) fn into_raw(self) -> u32 {
        self.0
    }

    /// Whether interrupts were enabled when the key was taken.
    pub fn was_enabled(&self) -> bool {
        self.0 != 0
    }
}

/// Scoped critical section: unlocks with its key on drop.
pub struct IrqGuard<'a, A: Arch> {
    arch: &'a A,
    key: Option<IrqKey>,
}

impl<'a, A: Arch> IrqGuard<'a, A> {
    pub fn new(arch: &'a A) -> Self {
        Self {
            arch,
            key: Some(arch.irq_lock()),
        }
    }
}

impl<A: Arch> Drop for IrqGuard<'_, A> {
    fn drop(&mut self) {
        if let Some(key) = self.key.take() {
            self.arch.irq_unlock(key);
        }
    }
}

/// Run `f` with interrupts masked.
pub fn with_irq_locked<A: Arch, R>(arch: &A, f: impl FnOnce() -> R) -> R {
    let _guard = IrqGuard::new(arch);
    f()
}

#[cfg(any(target_arch = "mips", target_arch = "riscv32"))]
mod hw {
    use super::IrqKey;
    use crate::arch::{Arch, DefaultArch};

    /// Mask interrupts on the current core.
    #[inline]
    pub fn irq_lock() -> IrqKey {
        DefaultArch.irq_lock()
    }

    /// Restore the interrupt state recorded in `key`.
    #[inline]
    pub fn irq_unlock(key: IrqKey) {
        DefaultArch.irq_unlock(key)
    }

    #[cfg(feature = "critical-section-impl")]
    struct KernelCriticalSection;

    #[cfg(feature = "critical-section-impl")]
    critical_section::set_impl!(KernelCriticalSection);

    #[cfg(feature = "critical-section-impl")]
    unsafe impl critical_section::Impl for KernelCriticalSection {
        unsafe fn acquire() -> critical_section::RawRestoreState {
            DefaultArch.irq_lock().into_raw()
        }

        unsafe fn release(state: critical_section::RawRestoreState) {
            DefaultArch.irq_unlock(IrqKey::from_raw(state))
        }
    }
}

#[cfg(any(target_arch = "mips", target_arch = "riscv32"))]
pub use hw::{irq_lock, irq_unlock};
