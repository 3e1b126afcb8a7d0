//! The CPU proper: fetch/decode/execute loop, traps, interrupts.
//!
//! `step()` runs exactly one instruction or dispatches one interrupt.
//! Faults raised anywhere below (bus, MMU, decode) travel up as `Trap`
//! errors and are converted here into vector dispatch: push PSW and PC
//! on the new mode's stack, load PC and PSW from the two-word vector.
//! Trace (T-bit) traps fire after the offending instruction completes.

use tracing::{debug, error, trace};

use crate::bus::{Access, Pdp11Bus, Space, Trap, TrapCause, cpu_error};
use crate::interrupt::InterruptQueue;
use crate::registers::{Mode, Registers};

/// Trace trap vector (T bit, BPT).
const VECTOR_TRACE: u16 = 0o14;

/// A PDP-11/70 processor.
#[derive(Debug)]
pub struct Pdp11 {
    pub regs: Registers,
    pub(crate) interrupts: InterruptQueue,
    pub(crate) halted: bool,
    pub(crate) waiting: bool,
    /// Trace suppression for the instruction that just ran (RTT).
    pub(crate) suppress_trace: bool,
    /// A trap or interrupt vector was entered during this step.
    trap_taken: bool,
    /// Stack limit verdicts, honored once the instruction completes.
    pending_yellow: bool,
    pending_red: bool,
    /// Set while entering a vector so its own pushes skip limit checks.
    dispatching: bool,
    instruction_count: u64,
}

impl Pdp11 {
    /// Create a CPU draining the given interrupt queue.
    #[must_use]
    pub fn new(interrupts: InterruptQueue) -> Self {
        Self {
            regs: Registers::new(),
            interrupts,
            halted: false,
            waiting: false,
            suppress_trace: false,
            trap_taken: false,
            pending_yellow: false,
            pending_red: false,
            dispatching: false,
            instruction_count: 0,
        }
    }

    /// The shared interrupt queue handle.
    #[must_use]
    pub fn interrupts(&self) -> InterruptQueue {
        self.interrupts.clone()
    }

    /// Has the CPU executed a kernel-mode HALT?
    #[must_use]
    pub const fn is_halted(&self) -> bool {
        self.halted
    }

    /// Is the CPU in the WAIT state?
    #[must_use]
    pub const fn is_waiting(&self) -> bool {
        self.waiting
    }

    /// Instructions retired since power-up.
    #[must_use]
    pub const fn instruction_count(&self) -> u64 {
        self.instruction_count
    }

    /// Leave HALT, clear WAIT, restore the power-up PSW. The PC is left
    /// for the caller to set (boot address).
    pub fn reset(&mut self) {
        self.regs.set_psw(0o340);
        self.halted = false;
        self.waiting = false;
        self.interrupts.clear();
    }

    /// Run one instruction or dispatch one pending interrupt.
    ///
    /// Interrupts are honored first: the highest queued level above the
    /// current priority wins and consumes this step. A halted CPU does
    /// nothing; a waiting CPU only watches the queue.
    pub fn step<B: Pdp11Bus>(&mut self, bus: &mut B) {
        if self.halted {
            return;
        }

        if let Some((level, vector)) = self.interrupts.take_pending(self.regs.spl()) {
            trace!("interrupt dispatch: level {level}, vector {vector:o}");
            self.waiting = false;
            self.dispatch(bus, vector);
            return;
        }

        if self.waiting {
            return;
        }

        let trace_armed = self.regs.t();
        self.trap_taken = false;
        self.suppress_trace = false;
        self.pending_yellow = false;
        self.pending_red = false;

        bus.instruction_fetch(self.regs.pc);
        if let Err(fault) = self.fetch_and_execute(bus) {
            self.dispatch_trap(bus, fault);
        }
        self.instruction_count += 1;

        if self.pending_red {
            // Red stack violation: the kernel stack is forced to the
            // emergency area before the trap is taken.
            self.pending_red = false;
            self.regs.set_sp(Mode::Kernel, 4);
            self.dispatch_trap(bus, Trap::new(TrapCause::StackLimit));
        } else if self.pending_yellow {
            self.pending_yellow = false;
            self.dispatch_trap(bus, Trap::new(TrapCause::StackLimit));
        }

        // Trace traps fire once the marked instruction has retired; RTT
        // and an already-dispatched trap both suppress it.
        if trace_armed && !self.suppress_trace && !self.trap_taken && !self.halted {
            self.dispatch(bus, VECTOR_TRACE);
        }
    }

    fn fetch_and_execute<B: Pdp11Bus>(&mut self, bus: &mut B) -> Result<(), Trap> {
        let pc = self.regs.pc;
        let instr = bus.read(&mut self.regs, pc, Access::word(Space::I))?;
        self.regs.pc = pc.wrapping_add(2);
        self.execute(bus, instr)
    }

    // === Stack ===

    /// Push onto the current mode's stack.
    pub(crate) fn push<B: Pdp11Bus>(&mut self, bus: &mut B, value: u16) -> Result<(), Trap> {
        let sp = self.regs.get(6).wrapping_sub(2);
        self.regs.set(6, sp);
        self.check_stack_limit(bus, sp);
        bus.write(&mut self.regs, sp, value, Access::word(Space::D))
    }

    /// Pop from the current mode's stack.
    pub(crate) fn pop<B: Pdp11Bus>(&mut self, bus: &mut B) -> Result<u16, Trap> {
        let sp = self.regs.get(6);
        let value = bus.read(&mut self.regs, sp, Access::word(Space::D))?;
        self.regs.set(6, sp.wrapping_add(2));
        Ok(value)
    }

    /// Kernel-mode pushes below the stack limit schedule a yellow trap
    /// for the instruction boundary; far enough below is red. Vector
    /// dispatch itself is exempt, or the yellow trap could never stack
    /// its own PSW.
    pub(crate) fn check_stack_limit<B: Pdp11Bus>(&mut self, bus: &mut B, sp: u16) {
        if self.dispatching || self.regs.current_mode() != Mode::Kernel {
            return;
        }
        let limit = self.regs.stack_limit().max(0o400);
        if sp >= limit {
            return;
        }
        if sp < limit.saturating_sub(0o40) {
            bus.set_cpu_error(cpu_error::RED_STACK);
            self.pending_red = true;
        } else {
            bus.set_cpu_error(cpu_error::YELLOW_STACK);
            self.pending_yellow = true;
        }
    }

    // === Traps and interrupts ===

    /// Enter a vector: save PSW/PC on the new mode's stack, load PC and
    /// PSW from the vector, record the outgoing mode as previous.
    pub(crate) fn enter_trap<B: Pdp11Bus>(&mut self, bus: &mut B, vector: u16) -> Result<(), Trap> {
        self.trap_taken = true;
        let new_pc = bus.read(&mut self.regs, vector, Access::word(Space::D).kernel())?;
        let new_psw = bus.read(
            &mut self.regs,
            vector.wrapping_add(2),
            Access::word(Space::D).kernel(),
        )?;

        let old_psw = self.regs.psw();
        let old_pc = self.regs.pc;
        let old_mode = self.regs.current_mode();

        self.regs.set_psw(new_psw);
        self.regs.set_previous_mode(old_mode);

        self.dispatching = true;
        let pushed = self
            .push(bus, old_psw)
            .and_then(|()| self.push(bus, old_pc));
        self.dispatching = false;
        pushed?;

        self.regs.pc = new_pc;
        trace!("entered vector {vector:o}, pc {new_pc:o}");
        Ok(())
    }

    /// Enter a vector, falling back to the emergency stack on a double
    /// fault and halting if even that fails.
    fn dispatch<B: Pdp11Bus>(&mut self, bus: &mut B, vector: u16) {
        if let Err(nested) = self.enter_trap(bus, vector) {
            debug!("fault while entering vector {vector:o}: {nested}");
            // Stack fault during dispatch: red condition, emergency stack
            bus.set_cpu_error(cpu_error::RED_STACK);
            self.regs.set_sp(Mode::Kernel, 4);
            if self.enter_trap(bus, 0o4).is_err() {
                error!("double fault on the emergency stack, halting");
                self.halted = true;
            }
        }
    }

    /// Convert a trap raised during execution into vector dispatch.
    fn dispatch_trap<B: Pdp11Bus>(&mut self, bus: &mut B, fault: Trap) {
        debug!("trap at pc {:o}: {fault}", self.regs.pc);
        self.dispatch(bus, fault.vector);
    }
}
