//! Byte offsets of the structures the switch assembly indexes into.
//!
//! Every constant comes from `core::mem::offset_of!` / `size_of` on the
//! structure definition itself, so the numbers cannot drift from the types.
//! The assembly in `arch::*_switch` takes them as `const` operands; other
//! assembly (board vectors, boot code) can get the same numbers as
//! `#define`s from [`write_asm_header`].
//!
//! Naming: `<STRUCT>_<FIELD>_OFFSET` and `<STRUCT>_SIZEOF`.

use core::fmt;

/// One generated constant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OffsetSymbol {
    pub name: &'static str,
    pub value: usize,
}

macro_rules! gen_offsets {
    (
        $(#[$meta:meta])*
        $table:ident: $ty:ty {
            $( $name:ident = $($field:ident).+ ; )*
        }
        $size:ident
    ) => {
        $( pub const $name: usize = core::mem::offset_of!($ty, $($field).+); )*
        pub const $size: usize = core::mem::size_of::<$ty>();

        $(#[$meta])*
        pub const $table: &[super::OffsetSymbol] = &[
            $( super::OffsetSymbol { name: stringify!($name), value: $name }, )*
            super::OffsetSymbol { name: stringify!($size), value: $size },
        ];
    };
}

/// MIPS32 exception stack frame.
pub mod mips32 {
    use crate::arch::Mips32Frame;

    gen_offsets! {
        /// Frame fields in memory order, then the frame size.
        ESF_TABLE: Mips32Frame {
            ESF_AT_OFFSET = at;
            ESF_V0_OFFSET = v0;
            ESF_V1_OFFSET = v1;
            ESF_A0_OFFSET = a0;
            ESF_A1_OFFSET = a1;
            ESF_A2_OFFSET = a2;
            ESF_A3_OFFSET = a3;
            ESF_T0_OFFSET = t0;
            ESF_T1_OFFSET = t1;
            ESF_T2_OFFSET = t2;
            ESF_T3_OFFSET = t3;
            ESF_T4_OFFSET = t4;
            ESF_T5_OFFSET = t5;
            ESF_T6_OFFSET = t6;
            ESF_T7_OFFSET = t7;
            ESF_S0_OFFSET = s0;
            ESF_S1_OFFSET = s1;
            ESF_S2_OFFSET = s2;
            ESF_S3_OFFSET = s3;
            ESF_S4_OFFSET = s4;
            ESF_S5_OFFSET = s5;
            ESF_S6_OFFSET = s6;
            ESF_S7_OFFSET = s7;
            ESF_T8_OFFSET = t8;
            ESF_T9_OFFSET = t9;
            ESF_K0_OFFSET = k0;
            ESF_K1_OFFSET = k1;
            ESF_GP_OFFSET = gp;
            ESF_SP_OFFSET = sp;
            ESF_FP_OFFSET = fp;
            ESF_RA_OFFSET = ra;
            ESF_HI_OFFSET = hi;
            ESF_LO_OFFSET = lo;
            ESF_SR_OFFSET = sr;
            ESF_CAUSE_OFFSET = cause;
            ESF_EPC_OFFSET = epc;
        }
        ESF_SIZEOF
    }
}

/// RV32 machine-mode trap frame.
pub mod riscv32 {
    use crate::arch::Riscv32Frame;

    gen_offsets! {
        RV32_ESF_TABLE: Riscv32Frame {
            RV32_ESF_RA_OFFSET = ra;
            RV32_ESF_SP_OFFSET = sp;
            RV32_ESF_GP_OFFSET = gp;
            RV32_ESF_TP_OFFSET = tp;
            RV32_ESF_T0_OFFSET = t0;
            RV32_ESF_T1_OFFSET = t1;
            RV32_ESF_T2_OFFSET = t2;
            RV32_ESF_S0_OFFSET = s0;
            RV32_ESF_S1_OFFSET = s1;
            RV32_ESF_A0_OFFSET = a0;
            RV32_ESF_A1_OFFSET = a1;
            RV32_ESF_A2_OFFSET = a2;
            RV32_ESF_A3_OFFSET = a3;
            RV32_ESF_A4_OFFSET = a4;
            RV32_ESF_A5_OFFSET = a5;
            RV32_ESF_A6_OFFSET = a6;
            RV32_ESF_A7_OFFSET = a7;
            RV32_ESF_S2_OFFSET = s2;
            RV32_ESF_S3_OFFSET = s3;
            RV32_ESF_S4_OFFSET = s4;
            RV32_ESF_S5_OFFSET = s5;
            RV32_ESF_S6_OFFSET = s6;
            RV32_ESF_S7_OFFSET = s7;
            RV32_ESF_S8_OFFSET = s8;
            RV32_ESF_S9_OFFSET = s9;
            RV32_ESF_S10_OFFSET = s10;
            RV32_ESF_S11_OFFSET = s11;
            RV32_ESF_T3_OFFSET = t3;
            RV32_ESF_T4_OFFSET = t4;
            RV32_ESF_T5_OFFSET = t5;
            RV32_ESF_T6_OFFSET = t6;
            RV32_ESF_MEPC_OFFSET = mepc;
            RV32_ESF_MSTATUS_OFFSET = mstatus;
            RV32_ESF_MCAUSE_OFFSET = mcause;
        }
        RV32_ESF_SIZEOF
    }
}

/// Thread control block and its nested records.
pub mod tcb {
    use crate::mem::StackInfo;
    use crate::thread::{Tcb, ThreadArch, ThreadBase};

    gen_offsets! {
        TCB_TABLE: Tcb {
            TCB_BASE_OFFSET = base;
            TCB_STACK_POINTER_OFFSET = stack_pointer;
            TCB_STACK_INFO_OFFSET = stack_info;
            TCB_ARCH_OFFSET = arch;
            TCB_PRIORITY_OFFSET = base.priority;
            TCB_STATE_OFFSET = base.state;
            TCB_STACK_START_OFFSET = stack_info.start;
            TCB_STACK_SIZE_OFFSET = stack_info.size;
            TCB_INTERRUPT_LOCK_KEY_OFFSET = arch.interrupt_lock_key;
            TCB_RETURN_VALUE_OFFSET = arch.return_value;
        }
        TCB_SIZEOF
    }

    gen_offsets! {
        THREAD_BASE_TABLE: ThreadBase {
            THREAD_BASE_PRIORITY_OFFSET = priority;
            THREAD_BASE_STATE_OFFSET = state;
            THREAD_BASE_WAKEUP_OFFSET = wakeup;
            THREAD_BASE_SCHED_LOCKED_OFFSET = sched_locked;
        }
        THREAD_BASE_SIZEOF
    }

    gen_offsets! {
        THREAD_ARCH_TABLE: ThreadArch {
            THREAD_ARCH_INTERRUPT_LOCK_KEY_OFFSET = interrupt_lock_key;
            THREAD_ARCH_RETURN_VALUE_OFFSET = return_value;
        }
        THREAD_ARCH_SIZEOF
    }

    gen_offsets! {
        STACK_INFO_TABLE: StackInfo {
            STACK_INFO_START_OFFSET = start;
            STACK_INFO_SIZE_OFFSET = size;
        }
        STACK_INFO_SIZEOF
    }
}

// Layout facts the switch assembly relies on.
const _: () = {
    use mips32::*;
    use riscv32::*;
    use tcb::*;

    assert!(ESF_SIZEOF == crate::arch::mips32::ESF_WORDS * 4);
    assert!(ESF_SIZEOF % 8 == 0);
    assert!(ESF_EPC_OFFSET == ESF_SIZEOF - 4);
    assert!(RV32_ESF_SIZEOF % 16 == 0);
    // Fits the 12-bit signed immediates of RV32 loads and stores.
    assert!(RV32_ESF_SIZEOF < 2048 && ESF_SIZEOF < 2048);
    assert!(TCB_STACK_POINTER_OFFSET % core::mem::size_of::<usize>() == 0);
    assert!(TCB_INTERRUPT_LOCK_KEY_OFFSET == TCB_ARCH_OFFSET + THREAD_ARCH_INTERRUPT_LOCK_KEY_OFFSET);
    assert!(TCB_RETURN_VALUE_OFFSET == TCB_ARCH_OFFSET + THREAD_ARCH_RETURN_VALUE_OFFSET);
    assert!(TCB_STACK_START_OFFSET == TCB_STACK_INFO_OFFSET + STACK_INFO_START_OFFSET);
    assert!(TCB_PRIORITY_OFFSET == TCB_BASE_OFFSET + THREAD_BASE_PRIORITY_OFFSET);
};

/// Every generated table: both frame layouts, whatever the build target,
/// followed by the TCB layout of the current build.
pub const ALL_TABLES: &[&[OffsetSymbol]] = &[
    mips32::ESF_TABLE,
    riscv32::RV32_ESF_TABLE,
    tcb::TCB_TABLE,
    tcb::THREAD_BASE_TABLE,
    tcb::THREAD_ARCH_TABLE,
    tcb::STACK_INFO_TABLE,
];

/// Render `tables` as C preprocessor definitions.
///
/// The TCB numbers depend on the pointer width of the build that renders
/// them; render from a build for the target.
pub fn write_asm_header<W: fmt::Write>(out: &mut W, tables: &[&[OffsetSymbol]]) -> fmt::Result {
    writeln!(out, "/* Generated structure offsets. Do not edit. */")?;
    writeln!(out, "#ifndef UKERN_OFFSETS_H")?;
    writeln!(out, "#define UKERN_OFFSETS_H")?;
    for table in tables {
        writeln!(out)?;
        for sym in table.iter() {
            writeln!(out, "#define {} {:#x}", sym.name, sym.value)?;
        }
    }
    writeln!(out)?;
    writeln!(out, "#endif")
}
