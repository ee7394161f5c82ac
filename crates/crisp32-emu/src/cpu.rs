//! Machine state and the per-cycle step logic.
//!
//! One [`Cpu`] value owns everything the guest can observe: register file,
//! program counter, memory window, privilege flag, paging configuration,
//! and the interrupt controller. A cycle is linear: pending-interrupt check
//! (which may consume the whole cycle), PC alignment check, fetch through
//! the MMU, decode, execute. Interrupt context save and restore live here
//! because they span the register file and guest memory.

use std::collections::BTreeMap;

use tracing::{debug, trace};

use crate::exception::{EmuError, Fault};
use crate::exec;
use crate::instruction::{Inst, MemWidth, RawInst};
use crate::interrupt::{ivt_entry_addr, InterruptController, FRAME_SIZE};
use crate::mem::Memory;
use crate::mmu::{Access, Mmu};
use crate::reg::{RegisterFile, A0, NUM_REGISTERS, SP};

/// Size of one instruction word in bytes.
pub const INST_SIZE: u32 = 8;

/// The CRISP-32 machine.
#[derive(Debug)]
pub struct Cpu {
    /// General-purpose registers. R0 is hardwired to zero.
    pub regs: RegisterFile,
    /// Program counter. Must be 8-byte aligned at the start of a cycle.
    pub pc: u32,
    /// Guest physical memory window.
    pub mem: Memory,
    /// Privilege flag. Kernel mode bypasses paging and unlocks the
    /// privileged instructions.
    pub kernel_mode: bool,
    /// Paging configuration.
    pub mmu: Mmu,
    /// Interrupt controller state.
    pub intc: InterruptController,
    /// Cleared by halting conditions; `run()` loops while set.
    pub running: bool,
    /// The last instruction executed. For host diagnostics after a halt.
    pub last_inst: Option<Inst>,
    /// Per-mnemonic execution counts, filled while `is_count` is set.
    pub inst_counter: BTreeMap<&'static str, u64>,
    /// Count the number of each instruction executed.
    pub is_count: bool,
}

impl Cpu {
    /// Create a machine with `mem_size` bytes of zeroed memory, in kernel
    /// mode with paging and interrupts disabled.
    pub fn new(mem_size: usize) -> Self {
        Cpu {
            regs: RegisterFile::new(),
            pc: 0,
            mem: Memory::new(mem_size),
            kernel_mode: true,
            mmu: Mmu::new(),
            intc: InterruptController::new(),
            running: false,
            last_inst: None,
            inst_counter: BTreeMap::new(),
            is_count: false,
        }
    }

    /// Clear registers, PC, privilege, and the paging configuration.
    ///
    /// Memory contents and the interrupt subsystem are untouched.
    pub fn reset(&mut self) {
        self.regs.reset();
        self.pc = 0;
        self.kernel_mode = true;
        self.mmu.reset();
    }

    /// Record a guest-visible fault by setting its pending bit.
    pub(crate) fn fault(&mut self, fault: Fault) {
        debug!("fault: {} (vector {})", fault, fault.vector());
        self.intc.raise(fault.vector());
    }

    /// Fail with a privilege violation unless in kernel mode.
    pub(crate) fn require_kernel(&self) -> Result<(), Fault> {
        if self.kernel_mode {
            Ok(())
        } else {
            Err(Fault::PrivilegeViolation)
        }
    }

    /// Load a value of `width` bytes from virtual address `vaddr`.
    pub(crate) fn load(&mut self, vaddr: u32, width: MemWidth) -> Result<u32, Fault> {
        let paddr = self
            .mmu
            .translate(vaddr, Access::Read, self.kernel_mode, &self.mem)?;
        match width {
            MemWidth::Byte => self.mem.read_u8(paddr).map(u32::from),
            MemWidth::Half => self.mem.read_u16(paddr).map(u32::from),
            MemWidth::Word => self.mem.read_u32(paddr),
        }
    }

    /// Store the low `width` bytes of `value` at virtual address `vaddr`.
    pub(crate) fn store(&mut self, vaddr: u32, width: MemWidth, value: u32) -> Result<(), Fault> {
        let paddr = self
            .mmu
            .translate(vaddr, Access::Write, self.kernel_mode, &self.mem)?;
        match width {
            MemWidth::Byte => self.mem.write_u8(paddr, value as u8),
            MemWidth::Half => self.mem.write_u16(paddr, value as u16),
            MemWidth::Word => self.mem.write_u32(paddr, value),
        }
    }

    /// Execute one cycle.
    ///
    /// `Ok` covers everything the guest can recover from, including halts
    /// (the caller observes `running`). `Err` is reserved for engine-fatal
    /// conditions; the machine state remains inspectable.
    pub fn step(&mut self) -> Result<(), EmuError> {
        if self.intc.enabled {
            if let Some(vector) = self.intc.lowest_pending() {
                return self.dispatch(vector);
            }
        }

        if self.pc % INST_SIZE != 0 {
            self.fault(Fault::MisalignedPc(self.pc));
            self.running = false;
            return Ok(());
        }

        let paddr = match self
            .mmu
            .translate(self.pc, Access::Execute, self.kernel_mode, &self.mem)
        {
            Ok(paddr) => paddr,
            Err(fault) => {
                // Fetch-side page fault: the cycle is abandoned with PC
                // unchanged; the handler, if installed, runs next step.
                self.fault(fault);
                return Ok(());
            }
        };

        let word = match self.mem.read_inst(paddr) {
            Ok(word) => word,
            Err(fault) => {
                self.fault(fault);
                self.running = false;
                return Err(EmuError::FetchOutOfBounds { pc: self.pc, paddr });
            }
        };

        let inst = Inst::decode(RawInst::from_bytes(word));
        trace!("execute: 0x{:08x} {}", self.pc, inst.mnemonic());
        self.last_inst = Some(inst);
        if self.is_count {
            *self.inst_counter.entry(inst.mnemonic()).or_insert(0) += 1;
        }

        // The PC is advanced before the instruction body runs; branch and
        // jump targets are computed against this post-increment value.
        self.pc = self.pc.wrapping_add(INST_SIZE);

        if let Err(fault) = exec::execute(self, &inst) {
            self.fault(fault);
            match fault {
                Fault::Syscall | Fault::Break => {
                    // Exit contract: R4 carries the interrupt number after
                    // a deliberate host-return.
                    self.regs.write(A0, fault.vector() as u32);
                    self.running = false;
                }
                Fault::IllegalOp(_) => {
                    self.running = false;
                }
                // Data-access and privilege faults abort the instruction
                // without halting; no register-file effects have occurred.
                _ => {}
            }
        }

        Ok(())
    }

    /// Deliver the pending interrupt `vector`, consuming the cycle.
    ///
    /// Saves the interrupted PC, enters kernel mode, pushes the 128-byte
    /// register snapshot below R29, masks interrupts, loads R4 with the
    /// vector, and redirects the PC to the handler from the IVT.
    fn dispatch(&mut self, vector: u8) -> Result<(), EmuError> {
        self.intc.clear(vector);
        self.intc.saved_pc = self.pc;
        self.kernel_mode = true;

        let frame = self.regs.read(SP).wrapping_sub(FRAME_SIZE);
        self.regs.write(SP, frame);
        self.intc.saved_regs_addr = frame;

        // The snapshot records the post-push stack pointer in its R29 cell.
        let mut snapshot = [0u8; FRAME_SIZE as usize];
        for (i, cell) in snapshot.chunks_exact_mut(4).enumerate() {
            cell.copy_from_slice(&self.regs.read(i as u8).to_le_bytes());
        }
        if self.mem.load_at(frame, &snapshot).is_err() {
            self.running = false;
            return Err(EmuError::SnapshotOutOfBounds {
                vector,
                addr: frame,
            });
        }

        self.intc.enabled = false;
        self.regs.write(A0, vector as u32);

        let handler = match self.mem.read_u32(ivt_entry_addr(vector)) {
            Ok(handler) => handler,
            Err(_) => {
                self.running = false;
                return Err(EmuError::VectorTableUnreadable { vector });
            }
        };
        if handler == 0 {
            self.running = false;
            return Err(EmuError::NoHandler { vector });
        }

        trace!(
            "dispatch: vector {} handler 0x{:08x} frame 0x{:08x}",
            vector,
            handler,
            frame
        );
        self.pc = handler;
        Ok(())
    }

    /// Return from an interrupt handler.
    ///
    /// Restores the PC and all 32 registers from the dispatch snapshot,
    /// unwinds the 128-byte frame, and re-enables interrupts. The privilege
    /// flag is deliberately not restored: a handler returning to user mode
    /// must drop privilege itself before IRET.
    pub(crate) fn iret(&mut self) -> Result<(), Fault> {
        let frame = self.intc.saved_regs_addr;
        if frame as u64 + FRAME_SIZE as u64 > self.mem.size() as u64 {
            return Err(Fault::OutOfBounds {
                addr: frame,
                width: FRAME_SIZE,
            });
        }

        // Read the whole snapshot before touching architectural state so a
        // fault cannot leave a partial restore.
        let mut snapshot = [0u32; NUM_REGISTERS];
        for (i, slot) in snapshot.iter_mut().enumerate() {
            *slot = self.mem.read_u32(frame + 4 * i as u32)?;
        }

        self.pc = self.intc.saved_pc;
        for (i, &value) in snapshot.iter().enumerate() {
            self.regs.write(i as u8, value);
        }
        self.regs.write(SP, frame.wrapping_add(FRAME_SIZE));
        self.intc.enabled = true;

        trace!("iret: pc 0x{:08x} frame 0x{:08x}", self.pc, frame);
        Ok(())
    }
}
