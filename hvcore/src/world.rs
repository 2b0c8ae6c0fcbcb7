//! Seams to the rest of the hypervisor.
//!
//! The core emulates instructions; everything an emulation needs from the
//! outside — the working VMCS, the physical CPU, the virtual LAPIC, event
//! injection, guest memory mappings, EPT maintenance, port-I/O devices and
//! VM teardown — comes in through the traits below, bundled per exit into a
//! [`World`]. Production wires the hardware backends in; tests wire fakes.

use crate::{
    vcpu::PioRequest,
    vm::Gpa,
    vmcs::VmcsAccess,
    VmError,
};
use hvhal::{
    addressing::{Pa, Va},
    intrinsics::{self, CpuidResult},
    msr,
};

/// Vector of `#UD`.
pub const UD_VECTOR: u8 = 6;
/// Vector of `#GP`.
pub const GP_VECTOR: u8 = 13;
/// Vector of `#PF`.
pub const PF_VECTOR: u8 = 14;

/// Physical-processor services.
///
/// Wraps the instructions the emulation core executes on the real CPU so the
/// core never reaches for them directly.
pub trait Platform {
    /// Execute `cpuid` with subleaf 0.
    fn cpuid(&self, leaf: u32) -> CpuidResult;
    /// Execute `cpuid` with an explicit subleaf.
    fn cpuid_subleaf(&self, leaf: u32, subleaf: u32) -> CpuidResult;
    /// Read a physical MSR.
    fn rdmsr(&self, msr: u32) -> u64;
    /// Write a physical MSR.
    fn wrmsr(&self, msr: u32, v: u64);
    /// Read the time-stamp counter.
    fn rdtsc(&self) -> u64;
    /// Id of the physical CPU this code runs on.
    fn pcpu_id(&self) -> u32;
    /// Write extended control register 0.
    fn write_xcr0(&self, v: u64);
    /// Translate a hypervisor virtual address to physical.
    fn hva2hpa(&self, va: Va) -> Pa;
    /// Translate a hypervisor physical address to virtual.
    fn hpa2hva(&self, pa: Pa) -> Va;
    /// Flush every cache line in `[va, va + len)`.
    fn cache_flush(&self, va: Va, len: usize);
    /// Allow supervisor access to user pages (`stac`).
    fn enable_user_access(&self);
    /// Re-arm SMAP (`clac`).
    fn disable_user_access(&self);
}

/// Per-vCPU virtual local APIC.
pub trait VirtLapic {
    /// Virtual local-APIC id of the vCPU.
    fn apic_id(&self) -> u32;
    /// Virtual `IA32_APIC_BASE` of the vCPU.
    fn apic_base(&self) -> u64;
    /// Virtual `IA32_TSC_DEADLINE` as the guest sees it.
    fn tsc_deadline(&self) -> u64;
    /// Program the virtual `IA32_TSC_DEADLINE`.
    fn set_tsc_deadline(&mut self, v: u64);
    /// Read an x2APIC register MSR (`0x800..=0x8FF`).
    fn x2apic_read(&mut self, msr: u32) -> Result<u64, VmError>;
    /// Write an x2APIC register MSR (`0x800..=0x8FF`).
    fn x2apic_write(&mut self, msr: u32, v: u64) -> Result<(), VmError>;
}

/// Requests a handler can post against its vCPU; honoured by the virtual-IRQ
/// module before the next entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VcpuRequest {
    /// Invalidate this vCPU's EPT-derived translations.
    EptFlush,
    /// Deliver an NMI to the guest.
    Nmi,
}

/// Per-vCPU virtual interrupt module.
pub trait VirtIrq {
    /// Queue an exception for injection on the next entry.
    fn queue_exception(&mut self, vector: u8, error_code: Option<u32>);
    /// Post a request to be honoured before the next entry.
    fn make_request(&mut self, req: VcpuRequest);
    /// Emulate an exception-or-NMI VM exit.
    fn exception_vmexit(&mut self) -> Result<(), VmError>;
}

/// Guest-physical address mappings of one VM.
pub trait GuestPages {
    /// Translate a guest-physical address to host-physical, if mapped.
    fn gpa2hpa(&self, gpa: Gpa) -> Option<Pa>;
    /// Translate a guest-physical address to a hypervisor virtual address,
    /// if mapped.
    fn gpa2hva(&self, gpa: Gpa) -> Option<Va>;
}

/// EPT maintenance of one VM.
pub trait EptOps {
    /// Grant execute permission on the 4 KiB page containing `gpa`.
    fn add_exec_right(&mut self, gpa: Gpa) -> Result<(), VmError>;
    /// Visit every present leaf mapping as `(hpa, mapping size)`.
    fn walk_leaf_pages(&mut self, visit: &mut dyn FnMut(Pa, usize));
}

/// Port-I/O dispatch beyond the exit point.
pub trait IoEmulator {
    /// Complete the decoded port-I/O request; for reads, fills
    /// [`PioRequest::value`].
    fn emulate_pio(&mut self, req: &mut PioRequest) -> Result<(), VmError>;
}

/// VM lifecycle control.
pub trait VmLifecycle {
    /// Tear the VM down after an unrecoverable guest-side condition.
    fn fatal_shutdown(&mut self);
}

/// Everything outside the core that one exit's emulation may touch.
pub struct World<'a> {
    /// The working VMCS of the exiting vCPU.
    pub vmcs: &'a mut dyn VmcsAccess,
    /// The physical CPU.
    pub plat: &'a dyn Platform,
    /// The exiting vCPU's virtual LAPIC.
    pub lapic: &'a mut dyn VirtLapic,
    /// The exiting vCPU's virtual-IRQ module.
    pub virq: &'a mut dyn VirtIrq,
    /// The owning VM's guest-physical mappings.
    pub pages: &'a dyn GuestPages,
    /// The owning VM's EPT.
    pub ept: &'a mut dyn EptOps,
    /// The owning VM's port-I/O dispatch.
    pub io: &'a mut dyn IoEmulator,
    /// The owning VM's lifecycle control.
    pub life: &'a mut dyn VmLifecycle,
}

/// [`Platform`] backed by the real processor.
pub struct HwPlatform;

impl Platform for HwPlatform {
    fn cpuid(&self, leaf: u32) -> CpuidResult {
        intrinsics::cpuid(leaf)
    }

    fn cpuid_subleaf(&self, leaf: u32, subleaf: u32) -> CpuidResult {
        intrinsics::cpuid_subleaf(leaf, subleaf)
    }

    fn rdmsr(&self, msr: u32) -> u64 {
        msr::rdmsr(msr)
    }

    fn wrmsr(&self, msr: u32, v: u64) {
        unsafe { msr::wrmsr(msr, v) }
    }

    fn rdtsc(&self) -> u64 {
        intrinsics::rdtsc()
    }

    fn pcpu_id(&self) -> u32 {
        intrinsics::pcpu_id()
    }

    fn write_xcr0(&self, v: u64) {
        unsafe { intrinsics::write_xcr0(v) }
    }

    fn hva2hpa(&self, va: Va) -> Pa {
        va.into_pa()
    }

    fn hpa2hva(&self, pa: Pa) -> Va {
        pa.into_va()
    }

    fn cache_flush(&self, va: Va, len: usize) {
        unsafe { intrinsics::cache_flush_range(va.into_usize(), len) }
    }

    fn enable_user_access(&self) {
        unsafe { intrinsics::stac() }
    }

    fn disable_user_access(&self) {
        unsafe { intrinsics::clac() }
    }
}
