//! Virtual-to-physical address translation.
//!
//! Translation is a single-level walk: `ptbr` points at a flat array of
//! 32-bit page-table entries, one per virtual page number. Kernel mode
//! always bypasses paging, so kernel and physical address spaces are
//! identical and page-table reads are always physical. Guest stores into
//! page-table memory take effect on the next translation; there is no TLB.

use bitflags::bitflags;

use crate::exception::Fault;
use crate::mem::Memory;

/// log2 of the page size.
pub const PAGE_SHIFT: u32 = 12;
/// Page size in bytes (4 KiB).
pub const PAGE_SIZE: u32 = 1 << PAGE_SHIFT;
/// Size of one page-table entry in bytes.
pub const PTE_SIZE: u32 = 4;

bitflags! {
    /// Permission bits of a page-table entry (bits 3..0).
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PteFlags: u32 {
        /// V: the entry maps a page.
        const VALID = 1 << 0;
        /// W: the page may be written.
        const WRITE = 1 << 1;
        /// X: the page may be executed.
        const EXEC = 1 << 2;
        /// U: the page is accessible from user mode.
        const USER = 1 << 3;
    }
}

/// A packed 32-bit page-table entry: PPN in bits 31..12, flags in bits 3..0.
///
/// Bits 11..4 are reserved and ignored.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Pte(pub u32);

impl Pte {
    /// Physical page base address (bits 31..12, low bits cleared).
    pub fn ppn_base(self) -> u32 {
        self.0 & 0xffff_f000
    }

    /// Permission bits.
    pub fn flags(self) -> PteFlags {
        PteFlags::from_bits_truncate(self.0)
    }
}

/// The kind of access being translated. Decides which permission bit is
/// checked beyond V and U.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Access {
    /// Data load.
    Read,
    /// Data store.
    Write,
    /// Instruction fetch.
    Execute,
}

/// Paging configuration of the machine.
#[derive(Debug, Clone)]
pub struct Mmu {
    /// Paging flag. Translation only applies in user mode with this set.
    pub paging_enabled: bool,
    /// Physical base address of the page table.
    pub ptbr: u32,
    /// Number of entries in the page table.
    pub num_pages: u32,
}

impl Mmu {
    /// Create an MMU with paging disabled.
    pub fn new() -> Self {
        Mmu {
            paging_enabled: false,
            ptbr: 0,
            num_pages: 0,
        }
    }

    /// Clear the paging configuration back to its initial state.
    pub fn reset(&mut self) {
        self.paging_enabled = false;
        self.ptbr = 0;
        self.num_pages = 0;
    }

    /// Translate `vaddr` under the current privilege and paging settings.
    ///
    /// Kernel mode or paging-off returns `vaddr` unchanged. Otherwise the
    /// PTE for the virtual page is read physically from the table at `ptbr`
    /// and checked in order: V, then U, then W for stores, then X for
    /// fetches. Any denial is a page fault carrying the original `vaddr`.
    pub fn translate(
        &self,
        vaddr: u32,
        access: Access,
        kernel_mode: bool,
        mem: &Memory,
    ) -> Result<u32, Fault> {
        if kernel_mode || !self.paging_enabled {
            return Ok(vaddr);
        }

        let vpn = vaddr >> PAGE_SHIFT;
        let offset = vaddr & (PAGE_SIZE - 1);
        if vpn >= self.num_pages {
            return Err(Fault::PageFault { vaddr });
        }

        // The entry address is computed in 64 bits so a table placed near
        // the top of the address space cannot wrap past the bounds check.
        let pte_addr = self.ptbr as u64 + (vpn as u64) * PTE_SIZE as u64;
        if pte_addr + PTE_SIZE as u64 > mem.size() as u64 {
            return Err(Fault::PageFault { vaddr });
        }
        let pte = Pte(mem
            .read_u32(pte_addr as u32)
            .map_err(|_| Fault::PageFault { vaddr })?);

        let flags = pte.flags();
        if !flags.contains(PteFlags::VALID) {
            return Err(Fault::PageFault { vaddr });
        }
        // Translation only runs in user mode, so a kernel-only page is
        // always a denial.
        if !flags.contains(PteFlags::USER) {
            return Err(Fault::PageFault { vaddr });
        }
        if access == Access::Write && !flags.contains(PteFlags::WRITE) {
            return Err(Fault::PageFault { vaddr });
        }
        if access == Access::Execute && !flags.contains(PteFlags::EXEC) {
            return Err(Fault::PageFault { vaddr });
        }

        Ok(pte.ppn_base() | offset)
    }
}

impl Default for Mmu {
    fn default() -> Self {
        Self::new()
    }
}
