//! MIPS32 register frame, status bits and exception decoding.
//!
//! This part is pure data and builds on every target: the simulated CPU and
//! the offset tables need it even when the assembly in `mips32_switch` is not
//! compiled in.

use core::fmt;

use super::RegisterFrame;

/// Global interrupt enable.
pub const SR_IE: u32 = 1 << 0;
/// Exception level: set while a trap is being handled, masks interrupts.
pub const SR_EXL: u32 = 1 << 1;

/// Mask of the exception code inside the `cause` register.
pub const CAUSE_EXCCODE_MASK: u32 = 0x7c;
pub const CAUSE_EXCCODE_SHIFT: u32 = 2;

/// Number of 32-bit words in a frame.
pub const ESF_WORDS: usize = 36;

/// Saved MIPS32 context.
///
/// One layout serves both kinds of frame: the one the exception entry pushes
/// when a trap is taken and the one `create_thread` synthesizes for a thread
/// that never ran. Keep the field order in sync with the store/load sequence
/// in `mips32_switch`.
#[repr(C)]
#[derive(Clone, Copy, Default, PartialEq, Eq)]
pub struct Mips32Frame {
    pub at: u32,
    pub v0: u32,
    pub v1: u32,
    pub a0: u32,
    pub a1: u32,
    pub a2: u32,
    pub a3: u32,
    pub t0: u32,
    pub t1: u32,
    pub t2: u32,
    pub t3: u32,
    pub t4: u32,
    pub t5: u32,
    pub t6: u32,
    pub t7: u32,
    pub s0: u32,
    pub s1: u32,
    pub s2: u32,
    pub s3: u32,
    pub s4: u32,
    pub s5: u32,
    pub s6: u32,
    pub s7: u32,
    pub t8: u32,
    pub t9: u32,
    pub k0: u32,
    pub k1: u32,
    pub gp: u32,
    pub sp: u32,
    /// `$30`, also known as `s8`.
    pub fp: u32,
    pub ra: u32,
    pub hi: u32,
    pub lo: u32,
    pub sr: u32,
    pub cause: u32,
    pub epc: u32,
}

const _: () = assert!(core::mem::size_of::<Mips32Frame>() == ESF_WORDS * 4);

impl Mips32Frame {
    /// `$30` under its other name.
    pub fn s8(&self) -> u32 {
        self.fp
    }

    pub fn set_s8(&mut self, value: u32) {
        self.fp = value;
    }

    /// Frame as a flat word array, in declaration order.
    pub fn words(&self) -> &[u32; ESF_WORDS] {
        // SAFETY: repr(C), all fields are u32, size checked above.
        unsafe { &*(self as *const Self as *const [u32; ESF_WORDS]) }
    }

    pub fn words_mut(&mut self) -> &mut [u32; ESF_WORDS] {
        // SAFETY: as in `words`.
        unsafe { &mut *(self as *mut Self as *mut [u32; ESF_WORDS]) }
    }

    /// Raw exception code from the saved `cause` register.
    pub fn exception_code(&self) -> u32 {
        (self.cause & CAUSE_EXCCODE_MASK) >> CAUSE_EXCCODE_SHIFT
    }

    pub fn exception_cause(&self) -> ExceptionCause {
        ExceptionCause::from_code(self.exception_code())
    }
}

/// General-purpose registers in frame order, with their hardware numbers.
pub(crate) const GPR_NUMBERS: [(usize, u32); 31] = {
    let mut table = [(0usize, 0u32); 31];
    // at .. ra are $1 .. $31 and occupy the first 31 words.
    let mut i = 0;
    while i < 31 {
        table[i] = (i, i as u32 + 1);
        i += 1;
    }
    table
};

impl RegisterFrame for Mips32Frame {
    fn pc(&self) -> u32 {
        self.epc
    }

    fn set_pc(&mut self, pc: u32) {
        self.epc = pc;
    }

    fn status(&self) -> u32 {
        self.sr
    }

    fn set_status(&mut self, status: u32) {
        self.sr = status;
    }

    fn entry(&self) -> (u32, [u32; 3]) {
        (self.a0, [self.a1, self.a2, self.a3])
    }

    fn set_entry(&mut self, entry: u32, args: [u32; 3]) {
        self.a0 = entry;
        self.a1 = args[0];
        self.a2 = args[1];
        self.a3 = args[2];
    }

    fn first_dispatch_status(current: u32) -> u32 {
        current | SR_EXL
    }

    fn poison(&mut self) {
        let words = self.words_mut();
        for (index, reg) in GPR_NUMBERS {
            words[index] = poison_word(reg);
        }
    }
}

/// Poison value for general register `$reg`.
pub const fn poison_word(reg: u32) -> u32 {
    0xdeaf_0000 | reg
}

/// Decoded `cause.ExcCode`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExceptionCause {
    Interrupt,
    TlbModified,
    TlbLoad,
    TlbStore,
    AddressErrorLoad,
    AddressErrorStore,
    InstructionBusError,
    DataBusError,
    Syscall,
    Breakpoint,
    ReservedInstruction,
    CoprocessorUnusable,
    Overflow,
    Trap,
    Other(u32),
}

impl ExceptionCause {
    pub fn from_code(code: u32) -> Self {
        match code {
            0 => Self::Interrupt,
            1 => Self::TlbModified,
            2 => Self::TlbLoad,
            3 => Self::TlbStore,
            4 => Self::AddressErrorLoad,
            5 => Self::AddressErrorStore,
            6 => Self::InstructionBusError,
            7 => Self::DataBusError,
            8 => Self::Syscall,
            9 => Self::Breakpoint,
            10 => Self::ReservedInstruction,
            11 => Self::CoprocessorUnusable,
            12 => Self::Overflow,
            13 => Self::Trap,
            other => Self::Other(other),
        }
    }

    pub fn description(&self) -> &'static str {
        match self {
            Self::Interrupt => "Interrupt",
            Self::TlbModified => "TLB modification",
            Self::TlbLoad => "TLB miss (load or fetch)",
            Self::TlbStore => "TLB miss (store)",
            Self::AddressErrorLoad => "Address error (load or fetch)",
            Self::AddressErrorStore => "Address error (store)",
            Self::InstructionBusError => "Bus error (instruction fetch)",
            Self::DataBusError => "Bus error (data)",
            Self::Syscall => "Syscall",
            Self::Breakpoint => "Breakpoint",
            Self::ReservedInstruction => "Reserved instruction",
            Self::CoprocessorUnusable => "Coprocessor unusable",
            Self::Overflow => "Arithmetic overflow",
            Self::Trap => "Trap",
            Self::Other(_) => "Unknown",
        }
    }
}

impl fmt::Display for ExceptionCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.description())
    }
}

/// Register dump in the layout the fault path prints.
impl fmt::Display for Mips32Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        const NAMES: [&str; 33] = [
            "at", "v0", "v1", "a0", "a1", "a2", "a3", "t0", "t1", "t2", "t3", "t4", "t5", "t6",
            "t7", "s0", "s1", "s2", "s3", "s4", "s5", "s6", "s7", "t8", "t9", "k0", "k1", "gp",
            "sp", "fp", "ra", "hi", "lo",
        ];
        writeln!(
            f,
            "EPC: {:08x}  STATUS: {:08x}  CAUSE: {:08x} ({})",
            self.epc,
            self.sr,
            self.cause,
            self.exception_cause()
        )?;
        let words = self.words();
        for (i, name) in NAMES.iter().enumerate() {
            write!(f, "  {}: {:08x}", name, words[i])?;
            if i % 4 == 3 || i == NAMES.len() - 1 {
                writeln!(f)?;
            }
        }
        Ok(())
    }
}

impl fmt::Debug for Mips32Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::format;

    #[test]
    fn cause_decoding() {
        let mut frame = Mips32Frame::default();
        frame.cause = 8 << 2;
        assert_eq!(frame.exception_cause(), ExceptionCause::Syscall);
        frame.cause = 0x8000_0000 | (4 << 2);
        assert_eq!(frame.exception_cause(), ExceptionCause::AddressErrorLoad);
        frame.cause = 0x8000_0000;
        assert_eq!(frame.exception_cause(), ExceptionCause::Interrupt);
        assert_eq!(ExceptionCause::from_code(31), ExceptionCause::Other(31));
    }

    #[test]
    fn s8_aliases_fp() {
        let mut frame = Mips32Frame::default();
        frame.set_s8(0x1234);
        assert_eq!(frame.fp, 0x1234);
        assert_eq!(frame.s8(), 0x1234);
    }

    #[test]
    fn poison_covers_general_registers_only() {
        let mut frame = Mips32Frame::default();
        frame.poison();
        assert_eq!(frame.at, poison_word(1));
        assert_eq!(frame.a0, poison_word(4));
        assert_eq!(frame.gp, poison_word(28));
        assert_eq!(frame.ra, poison_word(31));
        assert_eq!((frame.hi, frame.lo, frame.sr, frame.cause, frame.epc), (0, 0, 0, 0, 0));
    }

    #[test]
    fn first_dispatch_forces_exl() {
        assert_eq!(Mips32Frame::first_dispatch_status(SR_IE), SR_IE | SR_EXL);
        assert_eq!(Mips32Frame::first_dispatch_status(0), SR_EXL);
    }

    #[test]
    fn dump_lists_registers() {
        let mut frame = Mips32Frame::default();
        frame.epc = 0x8000_1000;
        frame.ra = 0xbfc0_0004;
        let dump = format!("{}", frame);
        assert!(dump.starts_with("EPC: 80001000"));
        assert!(dump.contains("ra: bfc00004"));
        assert!(dump.contains("(Interrupt)"));
    }
}
