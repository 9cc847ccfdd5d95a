//! Interrupt masking as an RAII critical section.
//!
//! [`IrqGuard::new`] snapshots the interrupt-enable state and disables
//! interrupts; dropping the guard re-enables them **only** if they were
//! enabled before, so guards nest correctly.
//!
//! On a bare-metal x86-64 target this uses `pushfq`/`cli`/`sti`. On hosted
//! builds (unit tests) the same save/restore semantics run against a
//! process-local flag, keeping the discipline observable without privileged
//! instructions.

#[cfg(all(target_arch = "x86_64", target_os = "none"))]
mod arch {
    /// `IF` is bit 9 of RFLAGS.
    const IF: u64 = 1 << 9;

    #[inline]
    pub fn interrupts_enabled() -> bool {
        let rflags: u64;
        // SAFETY: reading RFLAGS has no side effects; requires CPL0, which
        // is where all kernel code runs.
        unsafe {
            core::arch::asm!("pushfq; pop {}", out(reg) rflags, options(nostack, preserves_flags));
        }
        rflags & IF != 0
    }

    #[inline]
    pub fn disable() {
        // SAFETY: `cli` is legal at CPL0.
        unsafe { core::arch::asm!("cli", options(nomem, nostack, preserves_flags)) }
    }

    #[inline]
    pub fn enable() {
        // SAFETY: `sti` is legal at CPL0.
        unsafe { core::arch::asm!("sti", options(nomem, nostack, preserves_flags)) }
    }
}

#[cfg(not(all(target_arch = "x86_64", target_os = "none")))]
mod arch {
    use core::sync::atomic::{AtomicBool, Ordering};

    static ENABLED: AtomicBool = AtomicBool::new(true);

    #[inline]
    pub fn interrupts_enabled() -> bool {
        ENABLED.load(Ordering::Acquire)
    }

    #[inline]
    pub fn disable() {
        ENABLED.store(false, Ordering::Release);
    }

    #[inline]
    pub fn enable() {
        ENABLED.store(true, Ordering::Release);
    }
}

/// `true` if interrupts are currently enabled.
#[inline]
#[must_use]
pub fn interrupts_enabled() -> bool {
    arch::interrupts_enabled()
}

/// RAII guard for a no-preemption critical section.
///
/// While any guard is alive, interrupt delivery is masked; the outermost
/// guard restores the previous state on drop.
pub struct IrqGuard {
    /// Interrupt-enable state at guard creation.
    were_enabled: bool,
}

impl IrqGuard {
    /// Save the current interrupt state and disable interrupts.
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        let were_enabled = arch::interrupts_enabled();
        if were_enabled {
            arch::disable();
        }
        Self { were_enabled }
    }
}

impl Default for IrqGuard {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for IrqGuard {
    #[inline]
    fn drop(&mut self) {
        if self.were_enabled {
            arch::enable();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // The simulated interrupt flag is process-global; these tests must not
    // interleave.
    use std::sync::Mutex;
    static SERIAL: Mutex<()> = Mutex::new(());

    #[test]
    fn guard_disables_and_restores() {
        let _s = SERIAL.lock().unwrap();
        arch::enable();
        {
            let _g = IrqGuard::new();
            assert!(!interrupts_enabled());
        }
        assert!(interrupts_enabled());
    }

    #[test]
    fn nested_guards_restore_outermost_state() {
        let _s = SERIAL.lock().unwrap();
        arch::enable();
        {
            let _outer = IrqGuard::new();
            {
                let _inner = IrqGuard::new();
                assert!(!interrupts_enabled());
            }
            // Inner guard must not re-enable under the outer one.
            assert!(!interrupts_enabled());
        }
        assert!(interrupts_enabled());
    }

    #[test]
    fn guard_over_disabled_state_is_a_no_op() {
        let _s = SERIAL.lock().unwrap();
        arch::disable();
        {
            let _g = IrqGuard::new();
        }
        assert!(!interrupts_enabled());
        arch::enable();
    }
}
