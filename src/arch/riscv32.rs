//! RV32 machine-mode register frame.

use super::RegisterFrame;

/// Machine interrupt enable.
pub const MSTATUS_MIE: u32 = 1 << 3;
/// Previous MIE, restored by `mret`.
pub const MSTATUS_MPIE: u32 = 1 << 7;
/// Previous privilege mode field.
pub const MSTATUS_MPP: u32 = 0b11 << 11;

/// `mcause` interrupt flag.
pub const MCAUSE_INTERRUPT: u32 = 1 << 31;
/// `mcause` code for `ecall` from machine mode.
pub const MCAUSE_ECALL_M: u32 = 11;

pub const RV32_FRAME_WORDS: usize = 36;

/// Saved RV32 context: `x1`..`x31` in register-number order, then the trap
/// CSRs. Padded to a multiple of the 16-byte stack alignment.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Riscv32Frame {
    pub ra: u32,
    pub sp: u32,
    pub gp: u32,
    pub tp: u32,
    pub t0: u32,
    pub t1: u32,
    pub t2: u32,
    /// `x8`, also the frame pointer.
    pub s0: u32,
    pub s1: u32,
    pub a0: u32,
    pub a1: u32,
    pub a2: u32,
    pub a3: u32,
    pub a4: u32,
    pub a5: u32,
    pub a6: u32,
    pub a7: u32,
    pub s2: u32,
    pub s3: u32,
    pub s4: u32,
    pub s5: u32,
    pub s6: u32,
    pub s7: u32,
    pub s8: u32,
    pub s9: u32,
    pub s10: u32,
    pub s11: u32,
    pub t3: u32,
    pub t4: u32,
    pub t5: u32,
    pub t6: u32,
    pub mepc: u32,
    pub mstatus: u32,
    pub mcause: u32,
    pub reserved: [u32; 2],
}

const _: () = assert!(core::mem::size_of::<Riscv32Frame>() == RV32_FRAME_WORDS * 4);

impl Riscv32Frame {
    /// `x8` under its frame-pointer name.
    pub fn fp(&self) -> u32 {
        self.s0
    }

    pub fn set_fp(&mut self, value: u32) {
        self.s0 = value;
    }

    pub fn words(&self) -> &[u32; RV32_FRAME_WORDS] {
        // SAFETY: repr(C), all fields are u32, size checked above.
        unsafe { &*(self as *const Self as *const [u32; RV32_FRAME_WORDS]) }
    }

    pub fn words_mut(&mut self) -> &mut [u32; RV32_FRAME_WORDS] {
        // SAFETY: as in `words`.
        unsafe { &mut *(self as *mut Self as *mut [u32; RV32_FRAME_WORDS]) }
    }

    pub fn is_interrupt(&self) -> bool {
        self.mcause & MCAUSE_INTERRUPT != 0
    }
}

impl RegisterFrame for Riscv32Frame {
    fn pc(&self) -> u32 {
        self.mepc
    }

    fn set_pc(&mut self, pc: u32) {
        self.mepc = pc;
    }

    fn status(&self) -> u32 {
        self.mstatus
    }

    fn set_status(&mut self, status: u32) {
        self.mstatus = status;
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

    /// As if a trap had just been taken from machine mode: MIE clear, MPIE
    /// carrying the creator's MIE so `mret` restores it.
    fn first_dispatch_status(current: u32) -> u32 {
        let mpie = if current & MSTATUS_MIE != 0 { MSTATUS_MPIE } else { 0 };
        (current & !(MSTATUS_MIE | MSTATUS_MPIE)) | MSTATUS_MPP | mpie
    }

    fn poison(&mut self) {
        let words = self.words_mut();
        // x1..x31 occupy words 0..31.
        for (index, word) in words.iter_mut().take(31).enumerate() {
            *word = 0xdeaf_0000 | (index as u32 + 1);
        }
    }
}
