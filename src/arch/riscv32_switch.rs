//! RV32 machine-mode context switch.
//!
//! Same scheme as the MIPS port: a voluntary switch executes `ecall`,
//! interrupts and exceptions land in `__ukern_trap_entry`, which pushes a
//! full [`Riscv32Frame`], asks [`trap_dispatch`] which frame to resume and
//! leaves through `mret`. `mtvec` is pointed at the entry (direct mode) when
//! the kernel installs its hooks.

use core::arch::{asm, global_asm};

use super::riscv32::{Riscv32Frame, MCAUSE_ECALL_M, MCAUSE_INTERRUPT, MSTATUS_MIE};
use super::{trap, Arch, TrapHooks};
use crate::errors::{fatal, FatalError};
use crate::irq::IrqKey;
use crate::offsets::riscv32::*;
use crate::offsets::tcb::TCB_STACK_POINTER_OFFSET;
use crate::thread::{Tcb, ThreadEntry, ThreadRef};

global_asm!(
    ".section .text.__ukern_trap_entry, \"ax\"",
    ".global __ukern_trap_entry",
    ".p2align 2",
    "__ukern_trap_entry:",
    "    addi sp, sp, -{size}",
    "    sw   ra,  {ra}(sp)",
    "    sw   gp,  {gp}(sp)",
    "    sw   tp,  {tp}(sp)",
    "    sw   t0,  {t0}(sp)",
    "    sw   t1,  {t1}(sp)",
    "    sw   t2,  {t2}(sp)",
    "    sw   s0,  {s0}(sp)",
    "    sw   s1,  {s1}(sp)",
    "    sw   a0,  {a0}(sp)",
    "    sw   a1,  {a1}(sp)",
    "    sw   a2,  {a2}(sp)",
    "    sw   a3,  {a3}(sp)",
    "    sw   a4,  {a4}(sp)",
    "    sw   a5,  {a5}(sp)",
    "    sw   a6,  {a6}(sp)",
    "    sw   a7,  {a7}(sp)",
    "    sw   s2,  {s2}(sp)",
    "    sw   s3,  {s3}(sp)",
    "    sw   s4,  {s4}(sp)",
    "    sw   s5,  {s5}(sp)",
    "    sw   s6,  {s6}(sp)",
    "    sw   s7,  {s7}(sp)",
    "    sw   s8,  {s8}(sp)",
    "    sw   s9,  {s9}(sp)",
    "    sw   s10, {s10}(sp)",
    "    sw   s11, {s11}(sp)",
    "    sw   t3,  {t3}(sp)",
    "    sw   t4,  {t4}(sp)",
    "    sw   t5,  {t5}(sp)",
    "    sw   t6,  {t6}(sp)",
    "    addi t0, sp, {size}",
    "    sw   t0,  {sp}(sp)",
    "    csrr t0, mepc",
    "    sw   t0,  {mepc}(sp)",
    "    csrr t0, mstatus",
    "    sw   t0,  {mstatus}(sp)",
    "    csrr t0, mcause",
    "    sw   t0,  {mcause}(sp)",
    "    mv   a0, sp",
    "    call {dispatch}",
    "    beqz a0, 1f",
    "    lw   sp, {tcb_sp}(a0)",
    "1:",
    "    lw   t0, {mepc}(sp)",
    "    csrw mepc, t0",
    // MIE is clear in every saved mstatus; mret moves MPIE back into it.
    "    lw   t0, {mstatus}(sp)",
    "    csrw mstatus, t0",
    "    lw   ra,  {ra}(sp)",
    "    lw   gp,  {gp}(sp)",
    "    lw   tp,  {tp}(sp)",
    "    lw   t0,  {t0}(sp)",
    "    lw   t1,  {t1}(sp)",
    "    lw   t2,  {t2}(sp)",
    "    lw   s0,  {s0}(sp)",
    "    lw   s1,  {s1}(sp)",
    "    lw   a0,  {a0}(sp)",
    "    lw   a1,  {a1}(sp)",
    "    lw   a2,  {a2}(sp)",
    "    lw   a3,  {a3}(sp)",
    "    lw   a4,  {a4}(sp)",
    "    lw   a5,  {a5}(sp)",
    "    lw   a6,  {a6}(sp)",
    "    lw   a7,  {a7}(sp)",
    "    lw   s2,  {s2}(sp)",
    "    lw   s3,  {s3}(sp)",
    "    lw   s4,  {s4}(sp)",
    "    lw   s5,  {s5}(sp)",
    "    lw   s6,  {s6}(sp)",
    "    lw   s7,  {s7}(sp)",
    "    lw   s8,  {s8}(sp)",
    "    lw   s9,  {s9}(sp)",
    "    lw   s10, {s10}(sp)",
    "    lw   s11, {s11}(sp)",
    "    lw   t3,  {t3}(sp)",
    "    lw   t4,  {t4}(sp)",
    "    lw   t5,  {t5}(sp)",
    "    lw   t6,  {t6}(sp)",
    "    addi sp, sp, {size}",
    "    mret",
    size = const RV32_ESF_SIZEOF,
    ra = const RV32_ESF_RA_OFFSET,
    sp = const RV32_ESF_SP_OFFSET,
    gp = const RV32_ESF_GP_OFFSET,
    tp = const RV32_ESF_TP_OFFSET,
    t0 = const RV32_ESF_T0_OFFSET,
    t1 = const RV32_ESF_T1_OFFSET,
    t2 = const RV32_ESF_T2_OFFSET,
    s0 = const RV32_ESF_S0_OFFSET,
    s1 = const RV32_ESF_S1_OFFSET,
    a0 = const RV32_ESF_A0_OFFSET,
    a1 = const RV32_ESF_A1_OFFSET,
    a2 = const RV32_ESF_A2_OFFSET,
    a3 = const RV32_ESF_A3_OFFSET,
    a4 = const RV32_ESF_A4_OFFSET,
    a5 = const RV32_ESF_A5_OFFSET,
    a6 = const RV32_ESF_A6_OFFSET,
    a7 = const RV32_ESF_A7_OFFSET,
    s2 = const RV32_ESF_S2_OFFSET,
    s3 = const RV32_ESF_S3_OFFSET,
    s4 = const RV32_ESF_S4_OFFSET,
    s5 = const RV32_ESF_S5_OFFSET,
    s6 = const RV32_ESF_S6_OFFSET,
    s7 = const RV32_ESF_S7_OFFSET,
    s8 = const RV32_ESF_S8_OFFSET,
    s9 = const RV32_ESF_S9_OFFSET,
    s10 = const RV32_ESF_S10_OFFSET,
    s11 = const RV32_ESF_S11_OFFSET,
    t3 = const RV32_ESF_T3_OFFSET,
    t4 = const RV32_ESF_T4_OFFSET,
    t5 = const RV32_ESF_T5_OFFSET,
    t6 = const RV32_ESF_T6_OFFSET,
    mepc = const RV32_ESF_MEPC_OFFSET,
    mstatus = const RV32_ESF_MSTATUS_OFFSET,
    mcause = const RV32_ESF_MCAUSE_OFFSET,
    tcb_sp = const TCB_STACK_POINTER_OFFSET,
    dispatch = sym trap_dispatch,
);

extern "C" {
    fn __ukern_trap_entry();
}

unsafe extern "C" fn trap_dispatch(frame: *mut Riscv32Frame) -> *const Tcb {
    // SAFETY: the entry code hands over the frame it just pushed.
    let esf = unsafe { &mut *frame };
    if esf.is_interrupt() {
        return trap::interrupt(frame as usize);
    }
    match esf.mcause & !MCAUSE_INTERRUPT {
        MCAUSE_ECALL_M => {
            esf.mepc = esf.mepc.wrapping_add(4);
            trap::voluntary_switch(frame as usize)
        }
        code => {
            log::error!("unhandled exception {} at {:#010x}: {:?}", code, esf.mepc, esf);
            fatal(FatalError::UnhandledException { code, pc: esf.mepc })
        }
    }
}

/// Where a synthetic frame's `mret` lands.
extern "C" fn thread_entry(entry: u32, p1: u32, p2: u32, p3: u32) -> ! {
    // SAFETY: `entry` came from `Riscv32::entry_word`; pointers are 32 bits.
    let entry: ThreadEntry = unsafe { core::mem::transmute(entry as usize) };
    entry(p1 as usize, p2 as usize, p3 as usize);
    trap::thread_exit()
}

#[derive(Debug, Default, Clone, Copy)]
pub struct Riscv32;

impl Arch for Riscv32 {
    type Frame = Riscv32Frame;

    const NAME: &'static str = "riscv32";
    const STACK_ALIGN: usize = 16;

    #[inline]
    fn irq_lock(&self) -> IrqKey {
        let prev: u32;
        // SAFETY: clears mstatus.MIE, returns the old mstatus.
        unsafe { asm!("csrrci {0}, mstatus, 8", out(reg) prev, options(nostack)) };
        IrqKey::from_raw(prev & MSTATUS_MIE)
    }

    #[inline]
    fn irq_unlock(&self, key: IrqKey) {
        let bits = key.into_raw() & MSTATUS_MIE;
        // SAFETY: sets MIE only if it was set when the key was taken.
        unsafe { asm!("csrs mstatus, {0}", in(reg) bits, options(nostack)) };
    }

    fn irq_is_locked(&self) -> bool {
        self.current_status() & MSTATUS_MIE == 0
    }

    fn current_status(&self) -> u32 {
        let status: u32;
        // SAFETY: reads mstatus.
        unsafe { asm!("csrr {0}, mstatus", out(reg) status, options(nomem, nostack)) };
        status
    }

    fn cycle_count(&self) -> u32 {
        let cycles: u32;
        // SAFETY: reads the low half of mcycle.
        unsafe { asm!("csrr {0}, mcycle", out(reg) cycles, options(nomem, nostack)) };
        cycles
    }

    fn entry_trampoline(&self) -> u32 {
        thread_entry as usize as u32
    }

    fn entry_word(&self, entry: ThreadEntry) -> u32 {
        entry as usize as u32
    }

    fn prepare_frame(&self, frame: &mut Riscv32Frame) {
        let (gp, tp): (u32, u32);
        // SAFETY: plain register reads.
        unsafe {
            asm!("mv {0}, gp", "mv {1}, tp", out(reg) gp, out(reg) tp, options(nomem, nostack))
        };
        frame.gp = gp;
        frame.tp = tp;
    }

    fn install_hooks(&self, hooks: &'static dyn TrapHooks) {
        trap::install_hooks(hooks);
        let vector = __ukern_trap_entry as usize;
        // SAFETY: direct mode; the entry is 4-byte aligned.
        unsafe { asm!("csrw mtvec, {0}", in(reg) vector, options(nostack)) };
    }

    unsafe fn context_switch(&self, outgoing: Option<ThreadRef>, incoming: ThreadRef) {
        trap::request_switch(outgoing, incoming);
        // SAFETY: interrupts are masked per the caller contract; the trap
        // saves and restores every register.
        unsafe { asm!("ecall", options(nostack)) };
    }

    fn halt(&self) {
        loop {
            // SAFETY: parks the hart with interrupts off.
            unsafe { asm!("csrci mstatus, 8", "wfi", options(nomem, nostack)) };
        }
    }
}
