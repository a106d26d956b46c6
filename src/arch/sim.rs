//! Host model of a single MIPS32 core.
//!
//! The model keeps a live register file, a stack pointer into real host
//! memory and the `IE`/`EXL` status bits. Switching out a thread pushes a
//! genuine [`Mips32Frame`] onto that thread's stack and restoring pops one,
//! exactly like the exception entry on hardware, so synthetic frames built at
//! creation and frames saved by a switch or an interrupt go through one
//! restore path.
//!
//! Control transfer is modelled with host threads. Every simulated thread
//! runs on its own host thread; a saved program counter is either the entry
//! trampoline address (start a host thread for the entry function found in
//! `a0`) or a resume token handed out when a context was saved (wake the host
//! thread parked on it). Only the host thread owning the current token makes
//! progress, so execution stays strictly interleaved.

use std::any::Any;
use std::format;
use std::string::{String, ToString};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::{Duration, Instant};
use std::vec::Vec;

use spin::Once;

use super::mips32::{Mips32Frame, SR_EXL, SR_IE};
use super::{trap, Arch, RegisterFrame, TrapHooks};
use crate::irq::IrqKey;
use crate::mem::StackInfo;
use crate::offsets::mips32::*;
use crate::thread::{ThreadEntry, ThreadRef};

/// Address the simulated entry trampoline lives at.
pub const SIM_TRAMPOLINE: u32 = 0xbfc0_1000;
const ENTRY_BASE: u32 = 0x8000_0000;
const RESUME_BASE: u32 = 0x9000_0000;
const CAUSE_SYSCALL: u32 = 8 << 2;
const STALL_TIMEOUT: Duration = Duration::from_secs(10);

/// Registers visible to simulated code. `sp` is managed by the model.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reg {
    At,
    V0,
    V1,
    A0,
    A1,
    A2,
    A3,
    T0,
    T1,
    T2,
    T3,
    T4,
    T5,
    T6,
    T7,
    S0,
    S1,
    S2,
    S3,
    S4,
    S5,
    S6,
    S7,
    T8,
    T9,
    K0,
    K1,
    Gp,
    Fp,
    Ra,
    Hi,
    Lo,
}

impl Reg {
    pub const ALL: [Reg; 32] = [
        Reg::At,
        Reg::V0,
        Reg::V1,
        Reg::A0,
        Reg::A1,
        Reg::A2,
        Reg::A3,
        Reg::T0,
        Reg::T1,
        Reg::T2,
        Reg::T3,
        Reg::T4,
        Reg::T5,
        Reg::T6,
        Reg::T7,
        Reg::S0,
        Reg::S1,
        Reg::S2,
        Reg::S3,
        Reg::S4,
        Reg::S5,
        Reg::S6,
        Reg::S7,
        Reg::T8,
        Reg::T9,
        Reg::K0,
        Reg::K1,
        Reg::Gp,
        Reg::Fp,
        Reg::Ra,
        Reg::Hi,
        Reg::Lo,
    ];

    /// Byte offset of this register's slot in a saved frame.
    pub fn frame_offset(self) -> usize {
        match self {
            Reg::At => ESF_AT_OFFSET,
            Reg::V0 => ESF_V0_OFFSET,
            Reg::V1 => ESF_V1_OFFSET,
            Reg::A0 => ESF_A0_OFFSET,
            Reg::A1 => ESF_A1_OFFSET,
            Reg::A2 => ESF_A2_OFFSET,
            Reg::A3 => ESF_A3_OFFSET,
            Reg::T0 => ESF_T0_OFFSET,
            Reg::T1 => ESF_T1_OFFSET,
            Reg::T2 => ESF_T2_OFFSET,
            Reg::T3 => ESF_T3_OFFSET,
            Reg::T4 => ESF_T4_OFFSET,
            Reg::T5 => ESF_T5_OFFSET,
            Reg::T6 => ESF_T6_OFFSET,
            Reg::T7 => ESF_T7_OFFSET,
            Reg::S0 => ESF_S0_OFFSET,
            Reg::S1 => ESF_S1_OFFSET,
            Reg::S2 => ESF_S2_OFFSET,
            Reg::S3 => ESF_S3_OFFSET,
            Reg::S4 => ESF_S4_OFFSET,
            Reg::S5 => ESF_S5_OFFSET,
            Reg::S6 => ESF_S6_OFFSET,
            Reg::S7 => ESF_S7_OFFSET,
            Reg::T8 => ESF_T8_OFFSET,
            Reg::T9 => ESF_T9_OFFSET,
            Reg::K0 => ESF_K0_OFFSET,
            Reg::K1 => ESF_K1_OFFSET,
            Reg::Gp => ESF_GP_OFFSET,
            Reg::Fp => ESF_FP_OFFSET,
            Reg::Ra => ESF_RA_OFFSET,
            Reg::Hi => ESF_HI_OFFSET,
            Reg::Lo => ESF_LO_OFFSET,
        }
    }
}

struct SimState {
    /// Live register file; `sp`, `sr`, `cause` and `epc` slots are unused.
    regs: Mips32Frame,
    sp: usize,
    /// Bounds of the stack the live context runs on.
    stack: StackInfo,
    status: u32,
    /// Token of the host thread allowed to run; 0 while a freshly started
    /// thread owns the core.
    running: u32,
    next_token: u32,
    parked: Vec<u32>,
    entries: Vec<ThreadEntry>,
    switches: u64,
    /// Only moves through `advance_cycles`.
    cycles: u32,
    halted: bool,
    fault: Option<String>,
}

impl SimState {
    fn alloc_token(&mut self) -> u32 {
        let token = RESUME_BASE + self.next_token * 4;
        self.next_token += 1;
        token
    }

    fn irq_masked(&self) -> bool {
        self.status & SR_IE == 0 || self.status & SR_EXL != 0
    }

    /// Exception entry: push the live context below `sp`.
    fn push_frame(&mut self, pc: u32, cause: u32) -> Result<usize, String> {
        let addr = self
            .sp
            .checked_sub(ESF_SIZEOF)
            .filter(|addr| self.stack.contains(*addr, ESF_SIZEOF))
            .ok_or_else(|| {
                format!(
                    "stack overflow: no room for a frame below sp {:#x} (stack {:#x}..{:#x})",
                    self.sp,
                    self.stack.start,
                    self.stack.end()
                )
            })?;
        let mut frame = self.regs;
        // Diagnostic only: host addresses are wider than the modelled register.
        frame.sp = self.sp as u32;
        frame.sr = self.status | SR_EXL;
        frame.cause = cause;
        frame.epc = pc;
        // SAFETY: inside the live stack (checked above) and 8-byte aligned
        // because every frame address is.
        unsafe { core::ptr::write(addr as *mut Mips32Frame, frame) };
        self.sp = addr;
        Ok(addr)
    }

    /// Exception return: pop the frame at `addr` and return its pc.
    fn pop_frame(&mut self, addr: usize, stack: StackInfo) -> Result<u32, String> {
        if !stack.contains(addr, ESF_SIZEOF) || addr % 8 != 0 {
            return Err(format!(
                "saved frame {:#x} outside its stack {:#x}..{:#x}",
                addr,
                stack.start,
                stack.end()
            ));
        }
        // SAFETY: inside the thread's stack and aligned, checked above.
        let frame = unsafe { core::ptr::read(addr as *const Mips32Frame) };
        self.regs = frame;
        self.sp = addr + ESF_SIZEOF;
        self.stack = stack;
        // `eret` clears EXL.
        self.status = frame.sr & !SR_EXL;
        Ok(frame.epc)
    }

    fn entry_for(&self, word: u32) -> Option<ThreadEntry> {
        let index = word.checked_sub(ENTRY_BASE)? / 4;
        self.entries.get(index as usize).copied()
    }
}

struct Shared {
    state: Mutex<SimState>,
    wake: Condvar,
    hooks: Once<&'static dyn TrapHooks>,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, SimState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn fault(&self, st: &mut SimState, message: String) {
        log::error!("simulated cpu fault: {}", message);
        st.fault.get_or_insert(message);
        st.halted = true;
        self.wake.notify_all();
    }

    fn halt(&self) {
        let mut st = self.lock();
        st.halted = true;
        self.wake.notify_all();
    }
}

/// Simulated single-core MIPS32 CPU.
#[derive(Clone)]
pub struct SimCpu {
    shared: Arc<Shared>,
}

impl SimCpu {
    /// A core fresh out of reset with interrupts enabled.
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(SimState {
                    regs: Mips32Frame::default(),
                    sp: 0,
                    stack: StackInfo::EMPTY,
                    status: SR_IE,
                    running: 0,
                    next_token: 0,
                    parked: Vec::new(),
                    entries: Vec::new(),
                    switches: 0,
                    cycles: 0,
                    halted: false,
                    fault: None,
                }),
                wake: Condvar::new(),
                hooks: Once::new(),
            }),
        }
    }

    pub fn reg(&self, reg: Reg) -> u32 {
        self.shared.lock().regs.words()[reg.frame_offset() / 4]
    }

    pub fn set_reg(&self, reg: Reg, value: u32) {
        self.shared.lock().regs.words_mut()[reg.frame_offset() / 4] = value;
    }

    pub fn status(&self) -> u32 {
        self.shared.lock().status
    }

    /// Live stack pointer.
    pub fn sp(&self) -> usize {
        self.shared.lock().sp
    }

    /// Number of context switches performed so far.
    pub fn switch_count(&self) -> u64 {
        self.shared.lock().switches
    }

    /// Account `cycles` of work to whatever runs now.
    pub fn advance_cycles(&self, cycles: u32) {
        let mut st = self.shared.lock();
        st.cycles = st.cycles.wrapping_add(cycles);
    }

    pub fn is_halted(&self) -> bool {
        self.shared.lock().halted
    }

    /// Block until the core halts. Errors carry the fault message, or a
    /// timeout if nothing happens for a while.
    pub fn wait_halted(&self) -> Result<(), String> {
        let deadline = Instant::now() + STALL_TIMEOUT;
        let mut st = self.shared.lock();
        while !st.halted {
            let now = Instant::now();
            if now >= deadline {
                return Err("timed out waiting for the simulated cpu to halt".to_string());
            }
            st = self
                .shared
                .wake
                .wait_timeout(st, deadline - now)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
        match &st.fault {
            Some(fault) => Err(fault.clone()),
            None => Ok(()),
        }
    }

    /// Deliver an interrupt to the running context, as if it arrived between
    /// two instructions of the calling simulated thread.
    ///
    /// The live context is pushed as a trap frame, `isr` runs with `EXL`
    /// set, and the kernel may then preempt the caller. Returns once the
    /// caller's context is restored again; `false` if interrupts are masked
    /// and nothing was delivered.
    pub fn raise_interrupt(&self, isr: impl FnOnce()) -> bool {
        let mut st = self.shared.lock();
        if st.irq_masked() {
            return false;
        }
        let token = st.alloc_token();
        let addr = match st.push_frame(token, 0) {
            Ok(addr) => addr,
            Err(message) => self.fault_and_stop(st, message),
        };
        st.status |= SR_EXL;
        drop(st);

        let incoming = trap::run_interrupt(self.shared.hooks.get().copied(), addr, isr);

        let mut st = self.shared.lock();
        st.parked.push(token);
        match incoming {
            Some(incoming) => {
                st.switches += 1;
                self.resume(&mut st, incoming);
            }
            None => {
                let stack = st.stack;
                match st.pop_frame(addr, stack) {
                    Ok(pc) => self.jump(&mut st, pc),
                    Err(message) => self.shared.fault(&mut st, message),
                }
            }
        }
        self.park(st, token);
        true
    }

    fn fault_and_stop(&self, mut st: MutexGuard<'_, SimState>, message: String) -> ! {
        self.shared.fault(&mut st, message.clone());
        drop(st);
        panic!("simulated cpu faulted: {}", message)
    }

    fn resume(&self, st: &mut SimState, incoming: ThreadRef) {
        match st.pop_frame(incoming.stack_pointer(), incoming.stack_info()) {
            Ok(pc) => self.jump(st, pc),
            Err(message) => self.shared.fault(st, message),
        }
    }

    fn jump(&self, st: &mut SimState, pc: u32) {
        if pc == SIM_TRAMPOLINE {
            let (word, args) = st.regs.entry();
            let Some(entry) = st.entry_for(word) else {
                return self
                    .shared
                    .fault(st, format!("entry trampoline reached with unknown entry {:#010x}", word));
            };
            st.running = 0;
            let cpu = self.clone();
            let spawned = thread::Builder::new()
                .name(format!("sim-{:#x}", word))
                .spawn(move || cpu.run_thread(entry, args));
            if let Err(err) = spawned {
                self.shared.fault(st, format!("cannot start host thread: {}", err));
            }
        } else if let Some(index) = st.parked.iter().position(|&token| token == pc) {
            st.parked.swap_remove(index);
            st.running = pc;
            self.shared.wake.notify_all();
        } else {
            self.shared
                .fault(st, format!("restored pc {:#010x} does not map to any code", pc));
        }
    }

    /// Block the calling host thread until its context is restored.
    fn park(&self, mut st: MutexGuard<'_, SimState>, token: u32) {
        loop {
            if st.running == token {
                return;
            }
            if let Some(fault) = st.fault.clone() {
                drop(st);
                panic!("simulated cpu faulted: {}", fault);
            }
            if st.halted {
                // Never resumed; the simulation is over.
                st = self.shared.wake.wait(st).unwrap_or_else(PoisonError::into_inner);
                continue;
            }
            let (guard, timeout) = self
                .shared
                .wake
                .wait_timeout(st, STALL_TIMEOUT)
                .unwrap_or_else(PoisonError::into_inner);
            st = guard;
            if timeout.timed_out() && st.running != token && !st.halted {
                drop(st);
                panic!("simulated cpu stalled: context {:#x} never resumed", token);
            }
        }
    }

    /// First code a new thread runs: call the entry function, then leave
    /// through the kernel's exit path.
    fn run_thread(self, entry: ThreadEntry, args: [u32; 3]) {
        let outcome = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            entry(args[0] as usize, args[1] as usize, args[2] as usize);
            match self.shared.hooks.get() {
                Some(hooks) => hooks.thread_exit(),
                None => self.shared.halt(),
            }
        }));
        if let Err(payload) = outcome {
            let mut st = self.shared.lock();
            self.shared.fault(&mut st, panic_message(payload.as_ref()));
        }
    }
}

impl Default for SimCpu {
    fn default() -> Self {
        Self::new()
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(msg) = payload.downcast_ref::<&str>() {
        (*msg).to_string()
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        msg.clone()
    } else {
        "simulated thread panicked".to_string()
    }
}

impl Arch for SimCpu {
    type Frame = Mips32Frame;

    const NAME: &'static str = "mips32-sim";
    const STACK_ALIGN: usize = 8;

    fn irq_lock(&self) -> IrqKey {
        let mut st = self.shared.lock();
        let key = st.status & SR_IE;
        st.status &= !SR_IE;
        IrqKey::from_raw(key)
    }

    fn irq_unlock(&self, key: IrqKey) {
        let mut st = self.shared.lock();
        debug_assert!(st.status & SR_IE == 0, "irq_unlock while interrupts are enabled");
        if key.into_raw() & SR_IE != 0 {
            st.status |= SR_IE;
        }
    }

    fn irq_is_locked(&self) -> bool {
        self.shared.lock().irq_masked()
    }

    fn current_status(&self) -> u32 {
        self.shared.lock().status
    }

    fn cycle_count(&self) -> u32 {
        self.shared.lock().cycles
    }

    fn entry_trampoline(&self) -> u32 {
        SIM_TRAMPOLINE
    }

    fn entry_word(&self, entry: ThreadEntry) -> u32 {
        let mut st = self.shared.lock();
        let index = match st.entries.iter().position(|e| *e as usize == entry as usize) {
            Some(index) => index,
            None => {
                st.entries.push(entry);
                st.entries.len() - 1
            }
        };
        ENTRY_BASE + index as u32 * 4
    }

    fn install_hooks(&self, hooks: &'static dyn TrapHooks) {
        self.shared.hooks.call_once(|| hooks);
    }

    unsafe fn context_switch(&self, outgoing: Option<ThreadRef>, incoming: ThreadRef) {
        let mut st = self.shared.lock();
        debug_assert!(st.irq_masked(), "context switch with interrupts enabled");
        st.switches += 1;
        let token = match outgoing {
            Some(outgoing) => {
                let token = st.alloc_token();
                st.stack = outgoing.stack_info();
                let addr = match st.push_frame(token, CAUSE_SYSCALL) {
                    Ok(addr) => addr,
                    Err(message) => self.fault_and_stop(st, message),
                };
                st.parked.push(token);
                trap::record_outgoing(outgoing, addr);
                Some(token)
            }
            None => None,
        };
        self.resume(&mut st, incoming);
        if let Some(token) = token {
            self.park(st, token);
        }
    }

    fn halt(&self) {
        self.shared.halt();
    }
}
