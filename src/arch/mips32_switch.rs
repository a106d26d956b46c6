//! MIPS32 release 2 context switch.
//!
//! Every switch goes through the general exception path. A voluntary switch
//! stages the outgoing and incoming threads and executes `syscall`; an
//! interrupt arrives through the same vector. `__ukern_exception_entry`
//! pushes a full [`Mips32Frame`] on the interrupted stack, calls
//! [`exception_dispatch`] with its address and restores from whatever frame
//! the dispatcher picks before `eret`. Synthetic frames built at thread
//! creation are restored by the very same sequence.
//!
//! The board's exception vector (`0x8000_0180` with `BEV` clear) must jump to
//! `__ukern_exception_entry`. `k0`/`k1` are scratch for the entry code and
//! are not preserved across a switch.

use core::arch::{asm, global_asm};

use super::mips32::{ExceptionCause, Mips32Frame, SR_EXL, SR_IE};
use super::{trap, Arch, TrapHooks};
use crate::errors::{fatal, FatalError};
use crate::irq::IrqKey;
use crate::offsets::mips32::*;
use crate::offsets::tcb::TCB_STACK_POINTER_OFFSET;
use crate::thread::{Tcb, ThreadEntry, ThreadRef};

global_asm!(
    ".section .text.__ukern_exception_entry, \"ax\"",
    ".global __ukern_exception_entry",
    ".set push",
    ".set noreorder",
    ".set noat",
    "__ukern_exception_entry:",
    "    addiu $sp, $sp, -{size}",
    "    sw    $1,  {at}($sp)",
    "    sw    $2,  {v0}($sp)",
    "    sw    $3,  {v1}($sp)",
    "    sw    $4,  {a0}($sp)",
    "    sw    $5,  {a1}($sp)",
    "    sw    $6,  {a2}($sp)",
    "    sw    $7,  {a3}($sp)",
    "    sw    $8,  {t0}($sp)",
    "    sw    $9,  {t1}($sp)",
    "    sw    $10, {t2}($sp)",
    "    sw    $11, {t3}($sp)",
    "    sw    $12, {t4}($sp)",
    "    sw    $13, {t5}($sp)",
    "    sw    $14, {t6}($sp)",
    "    sw    $15, {t7}($sp)",
    "    sw    $16, {s0}($sp)",
    "    sw    $17, {s1}($sp)",
    "    sw    $18, {s2}($sp)",
    "    sw    $19, {s3}($sp)",
    "    sw    $20, {s4}($sp)",
    "    sw    $21, {s5}($sp)",
    "    sw    $22, {s6}($sp)",
    "    sw    $23, {s7}($sp)",
    "    sw    $24, {t8}($sp)",
    "    sw    $25, {t9}($sp)",
    "    sw    $28, {gp}($sp)",
    "    sw    $30, {fp}($sp)",
    "    sw    $31, {ra}($sp)",
    "    addiu $26, $sp, {size}",
    "    sw    $26, {sp}($sp)",
    "    mfhi  $26",
    "    sw    $26, {hi}($sp)",
    "    mflo  $26",
    "    sw    $26, {lo}($sp)",
    "    mfc0  $26, $12",
    "    sw    $26, {sr}($sp)",
    "    mfc0  $26, $13",
    "    sw    $26, {cause}($sp)",
    "    mfc0  $26, $14",
    "    sw    $26, {epc}($sp)",
    // o32: the callee may spill a0..a3 into the 16 bytes above its sp.
    "    move  $4, $sp",
    "    addiu $sp, $sp, -16",
    "    jal   {dispatch}",
    "    nop",
    "    addiu $sp, $sp, 16",
    "    beqz  $2, 1f",
    "    nop",
    "    lw    $sp, {tcb_sp}($2)",
    "1:",
    "    lw    $26, {hi}($sp)",
    "    mthi  $26",
    "    lw    $26, {lo}($sp)",
    "    mtlo  $26",
    "    lw    $26, {epc}($sp)",
    "    mtc0  $26, $14",
    // The saved status has EXL set, so interrupts stay off until eret.
    "    lw    $26, {sr}($sp)",
    "    mtc0  $26, $12",
    "    ehb",
    "    lw    $1,  {at}($sp)",
    "    lw    $2,  {v0}($sp)",
    "    lw    $3,  {v1}($sp)",
    "    lw    $4,  {a0}($sp)",
    "    lw    $5,  {a1}($sp)",
    "    lw    $6,  {a2}($sp)",
    "    lw    $7,  {a3}($sp)",
    "    lw    $8,  {t0}($sp)",
    "    lw    $9,  {t1}($sp)",
    "    lw    $10, {t2}($sp)",
    "    lw    $11, {t3}($sp)",
    "    lw    $12, {t4}($sp)",
    "    lw    $13, {t5}($sp)",
    "    lw    $14, {t6}($sp)",
    "    lw    $15, {t7}($sp)",
    "    lw    $16, {s0}($sp)",
    "    lw    $17, {s1}($sp)",
    "    lw    $18, {s2}($sp)",
    "    lw    $19, {s3}($sp)",
    "    lw    $20, {s4}($sp)",
    "    lw    $21, {s5}($sp)",
    "    lw    $22, {s6}($sp)",
    "    lw    $23, {s7}($sp)",
    "    lw    $24, {t8}($sp)",
    "    lw    $25, {t9}($sp)",
    "    lw    $28, {gp}($sp)",
    "    lw    $30, {fp}($sp)",
    "    lw    $31, {ra}($sp)",
    "    addiu $sp, $sp, {size}",
    "    eret",
    "",
    ".global __ukern_thread_entry",
    "__ukern_thread_entry:",
    "    addiu $sp, $sp, -16",
    "    jal   {thread_entry}",
    "    nop",
    "2:  b     2b",
    "    nop",
    ".set pop",
    size = const ESF_SIZEOF,
    at = const ESF_AT_OFFSET,
    v0 = const ESF_V0_OFFSET,
    v1 = const ESF_V1_OFFSET,
    a0 = const ESF_A0_OFFSET,
    a1 = const ESF_A1_OFFSET,
    a2 = const ESF_A2_OFFSET,
    a3 = const ESF_A3_OFFSET,
    t0 = const ESF_T0_OFFSET,
    t1 = const ESF_T1_OFFSET,
    t2 = const ESF_T2_OFFSET,
    t3 = const ESF_T3_OFFSET,
    t4 = const ESF_T4_OFFSET,
    t5 = const ESF_T5_OFFSET,
    t6 = const ESF_T6_OFFSET,
    t7 = const ESF_T7_OFFSET,
    s0 = const ESF_S0_OFFSET,
    s1 = const ESF_S1_OFFSET,
    s2 = const ESF_S2_OFFSET,
    s3 = const ESF_S3_OFFSET,
    s4 = const ESF_S4_OFFSET,
    s5 = const ESF_S5_OFFSET,
    s6 = const ESF_S6_OFFSET,
    s7 = const ESF_S7_OFFSET,
    t8 = const ESF_T8_OFFSET,
    t9 = const ESF_T9_OFFSET,
    gp = const ESF_GP_OFFSET,
    sp = const ESF_SP_OFFSET,
    fp = const ESF_FP_OFFSET,
    ra = const ESF_RA_OFFSET,
    hi = const ESF_HI_OFFSET,
    lo = const ESF_LO_OFFSET,
    sr = const ESF_SR_OFFSET,
    cause = const ESF_CAUSE_OFFSET,
    epc = const ESF_EPC_OFFSET,
    tcb_sp = const TCB_STACK_POINTER_OFFSET,
    dispatch = sym exception_dispatch,
    thread_entry = sym thread_entry,
);

extern "C" {
    fn __ukern_thread_entry();
}

/// Called by the exception entry with the frame it pushed. Returns the TCB
/// whose saved frame to restore, or null to restore `frame` itself.
unsafe extern "C" fn exception_dispatch(frame: *mut Mips32Frame) -> *const Tcb {
    // SAFETY: the entry code hands over the frame it just pushed.
    let esf = unsafe { &mut *frame };
    match esf.exception_cause() {
        ExceptionCause::Interrupt => trap::interrupt(frame as usize),
        ExceptionCause::Syscall => {
            // Resume after the `syscall` instruction.
            esf.epc = esf.epc.wrapping_add(4);
            trap::voluntary_switch(frame as usize)
        }
        cause => {
            log::error!("unhandled exception: {}\n{}", cause, esf);
            fatal(FatalError::UnhandledException {
                code: esf.exception_code(),
                pc: esf.epc,
            })
        }
    }
}

/// First code every thread runs, reached through `__ukern_thread_entry`
/// with the argument registers of its synthetic frame.
extern "C" fn thread_entry(entry: u32, p1: u32, p2: u32, p3: u32) -> ! {
    // SAFETY: `entry` was produced by `Mips32::entry_word` from a
    // `ThreadEntry`, and pointers are 32 bits wide here.
    let entry: ThreadEntry = unsafe { core::mem::transmute(entry as usize) };
    entry(p1 as usize, p2 as usize, p3 as usize);
    trap::thread_exit()
}

/// The MIPS32 core this code runs on.
#[derive(Debug, Default, Clone, Copy)]
pub struct Mips32;

impl Mips32 {
    fn global_pointer() -> u32 {
        let gp: u32;
        // SAFETY: reads `$gp` only.
        unsafe { asm!("move {0}, $28", out(reg) gp, options(nomem, nostack, preserves_flags)) };
        gp
    }
}

impl Arch for Mips32 {
    type Frame = Mips32Frame;

    const NAME: &'static str = "mips32";
    const STACK_ALIGN: usize = 8;

    #[inline]
    fn irq_lock(&self) -> IrqKey {
        let status: u32;
        // SAFETY: `di` clears Status.IE and returns the previous status.
        unsafe {
            asm!(
                "di {0}",
                "ehb",
                "andi {0}, {0}, 1",
                out(reg) status,
                options(nostack),
            )
        };
        IrqKey::from_raw(status)
    }

    #[inline]
    fn irq_unlock(&self, key: IrqKey) {
        if key.into_raw() & SR_IE != 0 {
            // SAFETY: re-enables exactly what the matching lock disabled.
            unsafe { asm!("ei", "ehb", options(nostack)) };
        }
    }

    fn irq_is_locked(&self) -> bool {
        let status = self.current_status();
        status & SR_IE == 0 || status & SR_EXL != 0
    }

    fn current_status(&self) -> u32 {
        let status: u32;
        // SAFETY: reads CP0 Status.
        unsafe { asm!("mfc0 {0}, $12", out(reg) status, options(nomem, nostack)) };
        status
    }

    fn cycle_count(&self) -> u32 {
        let count: u32;
        // SAFETY: reads CP0 Count.
        unsafe { asm!("mfc0 {0}, $9", out(reg) count, options(nomem, nostack)) };
        count
    }

    fn entry_trampoline(&self) -> u32 {
        __ukern_thread_entry as usize as u32
    }

    fn entry_word(&self, entry: ThreadEntry) -> u32 {
        entry as usize as u32
    }

    fn prepare_frame(&self, frame: &mut Mips32Frame) {
        frame.gp = Self::global_pointer();
    }

    fn install_hooks(&self, hooks: &'static dyn TrapHooks) {
        trap::install_hooks(hooks);
    }

    unsafe fn context_switch(&self, outgoing: Option<ThreadRef>, incoming: ThreadRef) {
        trap::request_switch(outgoing, incoming);
        // Every register is saved by the trap and restored when `outgoing`
        // is switched back in. Without an outgoing thread the frame pushed
        // here is discarded and this never returns.
        // SAFETY: interrupts are masked per the caller contract.
        unsafe { asm!("syscall", options(nostack)) };
    }

    fn halt(&self) {
        loop {
            // SAFETY: parks the core with interrupts off.
            unsafe { asm!("di", "ehb", "wait", options(nomem, nostack)) };
        }
    }
}
