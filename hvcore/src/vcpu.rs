//! Virtual CPU state.
//!
//! One vCPU is pinned to one physical CPU for its lifetime. The entry loop
//! saves the guest's general-purpose registers into [`VCpu::regs`] on every
//! exit, hands the vCPU to [`crate::vmexit::vmexit_handler`], and restores
//! the registers on the way back in; nothing here is ever touched from
//! another CPU.

use crate::{
    msr::{guest_msr_index, MsrBitmap, NUM_GUEST_MSRS},
    vm::Vm,
};
use alloc::{boxed::Box, sync::Arc};
use static_assertions::const_assert_eq;

/// Guest general-purpose registers, saved on exit and restored on entry.
///
/// Field order follows the Intel GPR encoding so the entry stub can address
/// the block with fixed offsets.
#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
pub struct GuestRegs {
    pub rax: u64,
    pub rcx: u64,
    pub rdx: u64,
    pub rbx: u64,
    pub rsp: u64,
    pub rbp: u64,
    pub rsi: u64,
    pub rdi: u64,
    pub r8: u64,
    pub r9: u64,
    pub r10: u64,
    pub r11: u64,
    pub r12: u64,
    pub r13: u64,
    pub r14: u64,
    pub r15: u64,
}

impl GuestRegs {
    /// Read a register by its Intel instruction encoding (0 = RAX .. 15 = R15).
    pub fn get(&self, idx: u8) -> u64 {
        match idx {
            0 => self.rax,
            1 => self.rcx,
            2 => self.rdx,
            3 => self.rbx,
            4 => self.rsp,
            5 => self.rbp,
            6 => self.rsi,
            7 => self.rdi,
            8 => self.r8,
            9 => self.r9,
            10 => self.r10,
            11 => self.r11,
            12 => self.r12,
            13 => self.r13,
            14 => self.r14,
            15 => self.r15,
            _ => unreachable!("gpr encoding is 4 bits"),
        }
    }
}

/// MSR entries of the VMX-transition MSR load/store areas.
///
/// See SDM 24.7.2 VM-Exit Controls for MSRs.
#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
pub struct MsrEntry {
    /// MSR index.
    pub msr_index: u32,
    _rsv: u32,
    /// MSR value.
    pub msr_value: u64,
}

const_assert_eq!(core::mem::size_of::<MsrEntry>(), 16);

impl MsrEntry {
    pub(crate) fn new(msr_index: u32, msr_value: u64) -> Self {
        Self {
            msr_index,
            _rsv: 0,
            msr_value,
        }
    }
}

/// Number of MSRs swapped across VMX transitions.
pub const MSR_AREA_COUNT: usize = 1;

/// Guest and host sides of the VMX-transition MSR areas.
#[repr(C)]
#[derive(Debug, Default)]
pub struct MsrTransitionArea {
    /// Loaded on VM entry, stored on VM exit.
    pub guest: [MsrEntry; MSR_AREA_COUNT],
    /// Loaded on VM exit.
    pub host: [MsrEntry; MSR_AREA_COUNT],
}

/// Direction of a trapped I/O instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PioDirection {
    /// Guest reads from the port.
    In,
    /// Guest writes to the port.
    Out,
}

impl Default for PioDirection {
    fn default() -> Self {
        PioDirection::In
    }
}

/// A decoded port-I/O request, handed to the external I/O dispatch.
#[derive(Debug, Default, Clone, Copy)]
pub struct PioRequest {
    /// Port number.
    pub port: u16,
    /// Access width in bytes: 1, 2 or 4.
    pub size: u8,
    /// Access direction.
    pub direction: PioDirection,
    /// Value written by the guest, or value to deliver to the guest.
    pub value: u32,
}

pub(crate) const REG_CACHED_CR0: u8 = 1 << 0;
pub(crate) const REG_CACHED_CR4: u8 = 1 << 1;
pub(crate) const REG_CACHED_EFER: u8 = 1 << 2;

/// Cached guest register values, reconstructed from the VMCS on first use
/// after an exit.
#[derive(Debug, Default)]
pub(crate) struct RunContext {
    pub(crate) cr0: u64,
    pub(crate) cr2: u64,
    pub(crate) cr4: u64,
    pub(crate) efer: u64,
    /// Which of the values above are valid relative to the VMCS.
    pub(crate) reg_cached: u8,
}

/// Virtual cpu.
pub struct VCpu {
    vm: Arc<Vm>,
    /// Guest-visible index of this vCPU.
    pub vcpu_id: u16,
    /// Physical CPU this vCPU is pinned to.
    pub pcpu_id: u32,
    /// Guest general-purpose registers.
    pub regs: GuestRegs,
    pub(crate) run_ctx: RunContext,
    /// Emulated MSR values, indexed by the canonical guest-MSR enumeration.
    pub(crate) guest_msrs: [u64; NUM_GUEST_MSRS],
    /// MSR intercept bitmap installed into the VMCS.
    pub(crate) msr_bitmap: Box<MsrBitmap>,
    /// VMX-transition MSR load/store entries.
    pub(crate) msr_area: Box<MsrTransitionArea>,
    /// IDT-vectoring snapshot taken at exit entry; cleared once re-injection
    /// has been enqueued.
    pub(crate) idt_vectoring_info: u32,
    /// Latest VMCS exit reason.
    pub(crate) exit_reason: u32,
    /// Latest VMCS exit qualification, if the handler asked for it.
    pub(crate) exit_qualification: u64,
    /// Current I/O request of the port-I/O and EPT-violation paths.
    pub(crate) io_req: PioRequest,
    retain_rip: bool,
}

impl VCpu {
    /// Create a vCPU pinned to `pcpu_id`.
    ///
    /// The MSR bitmap starts with every access intercepted;
    /// [`crate::msr::init_msr_emulation`] opens the pass-through holes and
    /// installs the bitmap into the VMCS.
    pub fn new(vm: Arc<Vm>, vcpu_id: u16, pcpu_id: u32) -> Self {
        Self {
            vm,
            vcpu_id,
            pcpu_id,
            regs: GuestRegs::default(),
            run_ctx: RunContext::default(),
            guest_msrs: [0; NUM_GUEST_MSRS],
            msr_bitmap: Box::new(MsrBitmap::new_trap_all()),
            msr_area: Box::new(MsrTransitionArea::default()),
            idt_vectoring_info: 0,
            exit_reason: 0,
            exit_qualification: 0,
            io_req: PioRequest::default(),
            retain_rip: false,
        }
    }

    /// The owning VM.
    #[inline]
    pub fn vm(&self) -> &Arc<Vm> {
        &self.vm
    }

    /// Whether the owning VM is safety-critical.
    #[inline]
    pub fn is_safety_vm(&self) -> bool {
        self.vm.is_safety_vm()
    }

    /// Latest exit reason, as read from the VMCS by the dispatcher.
    #[inline]
    pub fn exit_reason(&self) -> u32 {
        self.exit_reason
    }

    /// Latest exit qualification.
    #[inline]
    pub fn exit_qualification(&self) -> u64 {
        self.exit_qualification
    }

    /// The I/O request decoded by the latest port-I/O exit; the completion
    /// path reads the device's answer from here.
    #[inline]
    pub fn io_request(&self) -> &PioRequest {
        &self.io_req
    }

    /// Keep RIP where it is for the next entry instead of stepping past the
    /// exiting instruction.
    #[inline]
    pub fn retain_rip(&mut self) {
        self.retain_rip = true;
    }

    /// Consume the retain-RIP flag; called by the entry path.
    #[inline]
    pub fn consume_retained_rip(&mut self) -> bool {
        core::mem::replace(&mut self.retain_rip, false)
    }

    /// Read an emulated MSR shadow.
    ///
    /// MSRs outside the canonical enumeration read as zero.
    pub fn get_guest_msr(&self, msr: u32) -> u64 {
        guest_msr_index(msr)
            .map(|idx| self.guest_msrs[idx])
            .unwrap_or(0)
    }

    /// Update an emulated MSR shadow.
    pub fn set_guest_msr(&mut self, msr: u32, v: u64) {
        if let Some(idx) = guest_msr_index(msr) {
            self.guest_msrs[idx] = v;
        }
    }
}
