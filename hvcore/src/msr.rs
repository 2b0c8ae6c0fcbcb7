//! MSR virtualization.
//!
//! Each vCPU owns a 4 KiB MSR bitmap deciding which guest `rdmsr`/`wrmsr`
//! executions trap. Most MSRs trap by default; a fixed list passes through,
//! the x2APIC page is mostly transparent, and `IA32_TSC_DEADLINE` /
//! `IA32_TSC_ADJUST` flip between the two states depending on whether the
//! guest runs with a nonzero TSC offset. Intercepted accesses land in
//! [`rdmsr_vmexit_handler`] / [`wrmsr_vmexit_handler`].

use crate::{
    cr::is_paging_enabled,
    vcpu::{MsrEntry, VCpu, MSR_AREA_COUNT},
    vm_control::VmcsProcBasedVmexecCtl,
    vmcs::Field,
    world::{VcpuRequest, World},
    VmError,
};
use hvhal::{
    addressing::Va,
    msr::*,
    reg::{Cr0, Efer},
};
use static_assertions::const_assert_eq;

/// Power-on value of `IA32_PAT`.
pub(crate) const PAT_POWER_ON_VALUE: u64 = 0x0007_0406_0007_0406;
/// `IA32_PAT` with every entry uncacheable; installed while CR0.CD is set.
pub(crate) const PAT_ALL_UC_VALUE: u64 = 0x0000_0000_0000_0000;

/// `IA32_MCG_CAP` presented to a safety VM: 10 banks, TES supported.
const MCG_CAP_SAFETY_VALUE: u64 = 0x040A;

/// Number of slots in the canonical guest-MSR enumeration.
pub const NUM_GUEST_MSRS: usize = 17;

/// Placeholder for a reserved slot of the enumeration.
const MSR_RSVD: u32 = 0xFFFF_FFFF;

/// Canonical guest-MSR enumeration: MSR address per dense array slot.
///
/// The slot order is load-bearing (external tooling indexes the array), so
/// reserved slots stay in place.
const EMULATED_GUEST_MSRS: [u32; NUM_GUEST_MSRS] = [
    MSR_IA32_PAT,
    MSR_IA32_TSC_ADJUST,
    MSR_IA32_TSC_DEADLINE,
    MSR_RSVD,
    MSR_IA32_BIOS_SIGN_ID,
    MSR_IA32_TIME_STAMP_COUNTER,
    MSR_RSVD,
    MSR_RSVD,
    MSR_IA32_FEATURE_CONTROL,
    MSR_IA32_MCG_CAP,
    MSR_RSVD,
    MSR_IA32_MISC_ENABLE,
    MSR_RSVD,
    MSR_RSVD,
    MSR_RSVD,
    MSR_RSVD,
    MSR_RSVD,
];

/// MSRs that never trap.
const UNINTERCEPTED_MSRS: [u32; 20] = [
    MSR_IA32_P5_MC_ADDR,
    MSR_IA32_P5_MC_TYPE,
    MSR_IA32_PLATFORM_ID,
    MSR_SMI_COUNT,
    MSR_IA32_PRED_CMD,
    MSR_PLATFORM_INFO,
    MSR_IA32_FLUSH_CMD,
    MSR_FEATURE_CONFIG,
    MSR_IA32_SYSENTER_CS,
    MSR_IA32_SYSENTER_ESP,
    MSR_IA32_SYSENTER_EIP,
    MSR_IA32_MCG_STATUS,
    MSR_IA32_STAR,
    MSR_IA32_LSTAR,
    MSR_IA32_CSTAR,
    MSR_IA32_FMASK,
    MSR_IA32_FS_BASE,
    MSR_IA32_GS_BASE,
    MSR_IA32_KERNEL_GS_BASE,
    MSR_IA32_TSC_AUX,
];

/// Map an MSR address to its slot in the canonical enumeration.
///
/// Misses mean the MSR has no dense-array shadow; they are logged because a
/// caller asking for one is usually a policy bug.
pub fn guest_msr_index(msr: u32) -> Option<usize> {
    let idx = EMULATED_GUEST_MSRS
        .iter()
        .position(|&m| m != MSR_RSVD && m == msr);
    if idx.is_none() {
        log::warn!("no guest MSR slot for {:#x}", msr);
    }
    idx
}

/// Interception state of one `(MSR, direction)` pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InterceptMode {
    /// Reads and writes pass through.
    None,
    /// Reads trap, writes pass through.
    Read,
    /// Writes trap, reads pass through.
    Write,
    /// Reads and writes trap.
    ReadWrite,
}

/// Access direction of an MSR query.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MsrAccess {
    Read,
    Write,
}

/// The 4 KiB MSR bitmap, covering `0x0000_0000..0x0000_2000` ("low") and
/// `0xC000_0000..0xC000_2000` ("high") in both directions.
///
/// See SDM 24.6.9 MSR-Bitmap Address.
#[repr(C, align(4096))]
pub struct MsrBitmap {
    read_low: [u8; 1024],
    read_high: [u8; 1024],
    write_low: [u8; 1024],
    write_high: [u8; 1024],
}

const_assert_eq!(core::mem::size_of::<MsrBitmap>(), 4096);

impl MsrBitmap {
    /// A bitmap that traps every MSR access in both windows.
    pub(crate) fn new_trap_all() -> Self {
        Self {
            read_low: [0xFF; 1024],
            read_high: [0xFF; 1024],
            write_low: [0xFF; 1024],
            write_high: [0xFF; 1024],
        }
    }

    fn in_window(msr: u32) -> bool {
        matches!(msr & !0x1FFF, 0x0000_0000 | 0xC000_0000)
    }

    fn set_bit(panel: &mut [u8; 1024], msr: u32, trap: bool) {
        let byte = ((msr & 0x1FFF) >> 3) as usize;
        let bit = (msr & 0x7) as u8;
        if trap {
            panel[byte] |= 1 << bit;
        } else {
            panel[byte] &= !(1 << bit);
        }
    }

    /// Program the interception state of `msr` in both directions.
    ///
    /// Addresses outside the two windows cannot be expressed in the bitmap
    /// and are ignored.
    pub fn set_intercept(&mut self, msr: u32, mode: InterceptMode) {
        if !Self::in_window(msr) {
            debug_assert!(false, "MSR {msr:#x} outside bitmap windows");
            return;
        }
        let high = msr & 0xC000_0000 != 0;
        let (read, write) = match mode {
            InterceptMode::None => (false, false),
            InterceptMode::Read => (true, false),
            InterceptMode::Write => (false, true),
            InterceptMode::ReadWrite => (true, true),
        };
        if high {
            Self::set_bit(&mut self.read_high, msr, read);
            Self::set_bit(&mut self.write_high, msr, write);
        } else {
            Self::set_bit(&mut self.read_low, msr, read);
            Self::set_bit(&mut self.write_low, msr, write);
        }
    }

    /// Whether `msr` traps in the given direction.
    pub fn is_intercepted(&self, msr: u32, access: MsrAccess) -> bool {
        if !Self::in_window(msr) {
            return true;
        }
        let high = msr & 0xC000_0000 != 0;
        let panel = match (access, high) {
            (MsrAccess::Read, false) => &self.read_low,
            (MsrAccess::Read, true) => &self.read_high,
            (MsrAccess::Write, false) => &self.write_low,
            (MsrAccess::Write, true) => &self.write_high,
        };
        let byte = ((msr & 0x1FFF) >> 3) as usize;
        panel[byte] & (1 << (msr & 0x7)) != 0
    }
}

fn is_x2apic_msr(msr: u32) -> bool {
    (0x800..=0x8FF).contains(&msr)
}

/// `MC0..MC3` CTL2: opened in the intercept bitmap for safety VMs, like the
/// CTL/STATUS registers below.
fn is_mc_ctl2_passthru(msr: u32) -> bool {
    (MSR_IA32_MC0_CTL2..MSR_IA32_MC0_CTL2 + 4).contains(&msr)
}

/// `MC4..MC9` CTL2: these banks stay intercepted even for safety VMs, so
/// every guest access lands here.
fn is_mc_ctl2_restricted(msr: u32) -> bool {
    (MSR_IA32_MC0_CTL2 + 4..MSR_IA32_MC0_CTL2 + 10).contains(&msr)
}

/// `MC0..MC9` CTL and STATUS.
fn is_mc_ctl_status(msr: u32) -> bool {
    (MSR_IA32_MC0_CTL..MSR_IA32_MC0_CTL + 40).contains(&msr) && msr & 0x3 < 2
}

fn for_each_x2apic_msr(mut f: impl FnMut(u32)) {
    for msr in [
        MSR_IA32_EXT_XAPICID,
        MSR_IA32_EXT_APIC_VERSION,
        MSR_IA32_EXT_APIC_TPR,
        MSR_IA32_EXT_APIC_PPR,
        MSR_IA32_EXT_APIC_EOI,
        MSR_IA32_EXT_APIC_LDR,
        MSR_IA32_EXT_APIC_SIVR,
    ] {
        f(msr);
    }
    for i in 0..8 {
        f(MSR_IA32_EXT_APIC_ISR0 + i);
    }
    for i in 0..8 {
        f(MSR_IA32_EXT_APIC_TMR0 + i);
    }
    for i in 0..8 {
        f(MSR_IA32_EXT_APIC_IRR0 + i);
    }
    for msr in [
        MSR_IA32_EXT_APIC_ESR,
        MSR_IA32_EXT_APIC_LVT_CMCI,
        MSR_IA32_EXT_APIC_ICR,
        MSR_IA32_EXT_APIC_LVT_TIMER,
        MSR_IA32_EXT_APIC_LVT_THERMAL,
        MSR_IA32_EXT_APIC_LVT_PMI,
        MSR_IA32_EXT_APIC_LVT_LINT0,
        MSR_IA32_EXT_APIC_LVT_LINT1,
        MSR_IA32_EXT_APIC_LVT_ERROR,
        MSR_IA32_EXT_APIC_INIT_COUNT,
        MSR_IA32_EXT_APIC_CUR_COUNT,
        MSR_IA32_EXT_APIC_DIV_CONF,
        MSR_IA32_EXT_APIC_SELF_IPI,
    ] {
        f(msr);
    }
}

/// Drive `IA32_TSC_DEADLINE`/`IA32_TSC_ADJUST` interception from the TSC
/// offset state.
///
/// With a zero offset the guest's deadline programming is correct as-is and
/// both MSRs run at hardware speed; once an offset exists, deadlines must be
/// rescaled, so both trap.
fn set_tsc_msr_interception(vcpu: &mut VCpu, w: &mut World, intercept: bool) {
    let is_intercepted = vcpu
        .msr_bitmap
        .is_intercepted(MSR_IA32_TSC_DEADLINE, MsrAccess::Read);
    if !intercept && is_intercepted {
        vcpu.msr_bitmap
            .set_intercept(MSR_IA32_TSC_DEADLINE, InterceptMode::None);
        vcpu.msr_bitmap
            .set_intercept(MSR_IA32_TSC_ADJUST, InterceptMode::Write);
        // Keep the guest-visible deadline and the hardware deadline in step
        // across the hand-over.
        let phys = w.plat.rdmsr(MSR_IA32_TSC_DEADLINE);
        if phys != 0 {
            vcpu.set_guest_msr(MSR_IA32_TSC_DEADLINE, phys);
        } else {
            w.plat
                .wrmsr(MSR_IA32_TSC_DEADLINE, vcpu.get_guest_msr(MSR_IA32_TSC_DEADLINE));
        }
    } else if intercept && !is_intercepted {
        vcpu.msr_bitmap
            .set_intercept(MSR_IA32_TSC_DEADLINE, InterceptMode::ReadWrite);
        vcpu.msr_bitmap
            .set_intercept(MSR_IA32_TSC_ADJUST, InterceptMode::ReadWrite);
        vcpu.set_guest_msr(MSR_IA32_TSC_DEADLINE, w.plat.rdmsr(MSR_IA32_TSC_DEADLINE));
    }
}

fn update_msr_bitmap_x2apic_passthru(vcpu: &mut VCpu, w: &mut World) -> Result<(), VmError> {
    for_each_x2apic_msr(|msr| vcpu.msr_bitmap.set_intercept(msr, InterceptMode::None));
    // The id registers and the ICR stay virtualized.
    vcpu.msr_bitmap
        .set_intercept(MSR_IA32_EXT_XAPICID, InterceptMode::Read);
    vcpu.msr_bitmap
        .set_intercept(MSR_IA32_EXT_APIC_LDR, InterceptMode::Read);
    vcpu.msr_bitmap
        .set_intercept(MSR_IA32_EXT_APIC_ICR, InterceptMode::ReadWrite);
    let offset = w.vmcs.read(Field::TscOffset)?;
    set_tsc_msr_interception(vcpu, w, offset != 0);
    Ok(())
}

/// Set up MSR interception and the VMX-transition MSR areas for a vCPU.
///
/// Called once at exec-control setup time, before the first entry.
pub fn init_msr_emulation(vcpu: &mut VCpu, w: &mut World) -> Result<(), VmError> {
    // The bitmap is only consulted when the exec controls enable it; a vCPU
    // set up without USEMSRBMP would trap every MSR access regardless of
    // what gets programmed below.
    let proc_ctls = VmcsProcBasedVmexecCtl::from_bits_truncate(
        w.vmcs.read(Field::ProcessorBasedVmexecControls)? as u32,
    );
    assert!(
        proc_ctls.contains(VmcsProcBasedVmexecCtl::USEMSRBMP),
        "exec controls must enable the MSR bitmap"
    );

    *vcpu.msr_bitmap = MsrBitmap::new_trap_all();
    for msr in UNINTERCEPTED_MSRS {
        vcpu.msr_bitmap.set_intercept(msr, InterceptMode::None);
    }
    // Reads of these run at hardware speed; only writes are emulated.
    vcpu.msr_bitmap
        .set_intercept(MSR_IA32_TIME_STAMP_COUNTER, InterceptMode::Write);
    vcpu.msr_bitmap
        .set_intercept(MSR_IA32_EFER, InterceptMode::Write);
    if vcpu.is_safety_vm() {
        for i in 0..4 {
            vcpu.msr_bitmap
                .set_intercept(MSR_IA32_MC0_CTL2 + i, InterceptMode::None);
        }
        for bank in 0..10 {
            vcpu.msr_bitmap
                .set_intercept(MSR_IA32_MC0_CTL + 4 * bank, InterceptMode::None);
            vcpu.msr_bitmap
                .set_intercept(MSR_IA32_MC0_STATUS + 4 * bank, InterceptMode::None);
        }
    }
    update_msr_bitmap_x2apic_passthru(vcpu, w)?;

    let bitmap_va = Va::new(&*vcpu.msr_bitmap as *const MsrBitmap as usize).unwrap();
    w.vmcs
        .write(Field::MsrBitmaps, w.plat.hva2hpa(bitmap_va).into_usize() as u64)?;

    // TSC_AUX follows the vCPU into the guest and the physical CPU back out.
    vcpu.msr_area.guest[0] = MsrEntry::new(MSR_IA32_TSC_AUX, vcpu.vcpu_id as u64);
    vcpu.msr_area.host[0] = MsrEntry::new(MSR_IA32_TSC_AUX, vcpu.pcpu_id as u64);
    let guest_va = Va::new(vcpu.msr_area.guest.as_ptr() as usize).unwrap();
    let host_va = Va::new(vcpu.msr_area.host.as_ptr() as usize).unwrap();
    let guest_pa = w.plat.hva2hpa(guest_va).into_usize() as u64;
    let host_pa = w.plat.hva2hpa(host_va).into_usize() as u64;
    w.vmcs.write(Field::VmexitMsrStoreAddr, guest_pa)?;
    w.vmcs.write(Field::VmexitMsrStoreCount, MSR_AREA_COUNT as u64)?;
    w.vmcs.write(Field::VmexitMsrLoadAddr, host_pa)?;
    w.vmcs.write(Field::VmexitMsrLoadCount, MSR_AREA_COUNT as u64)?;
    w.vmcs.write(Field::VmentryMsrLoadAddr, guest_pa)?;
    w.vmcs.write(Field::VmentryMsrLoadCount, MSR_AREA_COUNT as u64)?;

    vcpu.set_guest_msr(MSR_IA32_PAT, PAT_POWER_ON_VALUE);
    vcpu.set_guest_msr(MSR_IA32_MISC_ENABLE, w.plat.rdmsr(MSR_IA32_MISC_ENABLE));
    vcpu.set_guest_msr(MSR_IA32_BIOS_SIGN_ID, w.plat.rdmsr(MSR_IA32_BIOS_SIGN_ID));
    vcpu.set_guest_msr(MSR_IA32_FEATURE_CONTROL, MSR_IA32_FEATURE_CONTROL_LOCK);
    vcpu.set_guest_msr(
        MSR_IA32_MCG_CAP,
        if vcpu.is_safety_vm() {
            MCG_CAP_SAFETY_VALUE
        } else {
            0
        },
    );
    Ok(())
}

fn is_pat_mem_type_invalid(t: u64) -> bool {
    t & !0x7 != 0 || t == 2 || t == 3
}

fn write_pat_msr(vcpu: &mut VCpu, w: &mut World, value: u64) -> Result<(), VmError> {
    for i in 0..8 {
        if is_pat_mem_type_invalid((value >> (i * 8)) & 0xFF) {
            return Err(VmError::InvalidGuestWrite);
        }
    }
    vcpu.set_guest_msr(MSR_IA32_PAT, value);
    // While CR0.CD forces all-UC the shadow alone changes; the CD clear path
    // re-installs it.
    if vcpu.get_cr0(w.vmcs)? & Cr0::CD.bits() == 0 {
        w.vmcs.write(Field::GuestIa32Pat, value)?;
    }
    Ok(())
}

fn write_efer_msr(vcpu: &mut VCpu, w: &mut World, value: u64) -> Result<(), VmError> {
    const EFER_RESERVED: u64 =
        !(Efer::SCE.bits() | Efer::LME.bits() | Efer::LMA.bits() | Efer::NXE.bits());
    // CPUID.8000_0001H:EDX execute-disable bit.
    const CPUID_EXT1_EDX_XD: u32 = 1 << 20;

    let cur = vcpu.get_efer(w.vmcs)?;
    if (value ^ cur) & EFER_RESERVED != 0 {
        return Err(VmError::InvalidGuestWrite);
    }
    if (value ^ cur) & Efer::LME.bits() != 0 && is_paging_enabled(vcpu, w)? {
        return Err(VmError::InvalidGuestState);
    }
    if value & Efer::NXE.bits() != 0 && cur & Efer::NXE.bits() == 0 {
        let (mut eax, mut ebx, mut ecx, mut edx) = (0x8000_0001u32, 0u32, 0u32, 0u32);
        crate::cpuid::guest_cpuid(vcpu, w, &mut eax, &mut ebx, &mut ecx, &mut edx)?;
        if edx & CPUID_EXT1_EDX_XD == 0 {
            return Err(VmError::InvalidGuestWrite);
        }
    }
    // LMA is read-only; mode transitions maintain it.
    let new = (value & !Efer::LMA.bits()) | (cur & Efer::LMA.bits());
    vcpu.set_efer(w.vmcs, new)?;
    if (new ^ cur) & Efer::NXE.bits() != 0 {
        w.virq.make_request(VcpuRequest::EptFlush);
    }
    Ok(())
}

fn write_misc_enable(vcpu: &mut VCpu, w: &mut World, value: u64) -> Result<(), VmError> {
    const WRITABLE: u64 = MSR_IA32_MISC_ENABLE_LIMIT_CPUID | MSR_IA32_MISC_ENABLE_XD_DISABLE;

    let cur = vcpu.get_guest_msr(MSR_IA32_MISC_ENABLE);
    if (value ^ cur) & !WRITABLE != 0 {
        return Err(VmError::InvalidGuestWrite);
    }
    vcpu.set_guest_msr(MSR_IA32_MISC_ENABLE, value);
    if value & MSR_IA32_MISC_ENABLE_XD_DISABLE != 0 {
        let efer = vcpu.get_efer(w.vmcs)?;
        if efer & Efer::NXE.bits() != 0 {
            vcpu.set_efer(w.vmcs, efer & !Efer::NXE.bits())?;
            w.virq.make_request(VcpuRequest::EptFlush);
        }
    }
    Ok(())
}

fn set_guest_tsc_adjust(vcpu: &mut VCpu, w: &mut World, value: u64) -> Result<(), VmError> {
    let delta = value.wrapping_sub(vcpu.get_guest_msr(MSR_IA32_TSC_ADJUST));
    let offset = w.vmcs.read(Field::TscOffset)?.wrapping_add(delta);
    w.vmcs.write(Field::TscOffset, offset)?;
    vcpu.set_guest_msr(MSR_IA32_TSC_ADJUST, value);
    set_tsc_msr_interception(vcpu, w, offset != 0);
    Ok(())
}

fn set_guest_tsc(vcpu: &mut VCpu, w: &mut World, value: u64) -> Result<(), VmError> {
    let tsc_delta = value.wrapping_sub(w.plat.rdtsc());
    let offset_delta = tsc_delta.wrapping_sub(w.vmcs.read(Field::TscOffset)?);
    // The guest moved its own timebase; fold the movement into TSC_ADJUST so
    // the two MSRs stay architecturally consistent.
    let adjust = vcpu.get_guest_msr(MSR_IA32_TSC_ADJUST);
    vcpu.set_guest_msr(MSR_IA32_TSC_ADJUST, adjust.wrapping_add(offset_delta));
    w.vmcs.write(Field::TscOffset, tsc_delta)?;
    set_tsc_msr_interception(vcpu, w, tsc_delta != 0);
    Ok(())
}

/// Emulate an intercepted `rdmsr`.
///
/// RCX selects the MSR; the result is zero-extended into RAX (low half) and
/// RDX (high half) even when the access faults.
pub fn rdmsr_vmexit_handler(vcpu: &mut VCpu, w: &mut World) -> Result<(), VmError> {
    let msr = vcpu.regs.rcx as u32;
    let result = match msr {
        MSR_IA32_TSC_DEADLINE => Ok(w.lapic.tsc_deadline()),
        MSR_IA32_TSC_ADJUST => Ok(vcpu.get_guest_msr(MSR_IA32_TSC_ADJUST)),
        MSR_IA32_BIOS_SIGN_ID => Ok(vcpu.get_guest_msr(MSR_IA32_BIOS_SIGN_ID)),
        MSR_IA32_PAT => Ok(vcpu.get_guest_msr(MSR_IA32_PAT)),
        MSR_IA32_APIC_BASE => Ok(w.lapic.apic_base()),
        MSR_IA32_FEATURE_CONTROL => Ok(MSR_IA32_FEATURE_CONTROL_LOCK),
        MSR_IA32_MISC_ENABLE => Ok(vcpu.get_guest_msr(MSR_IA32_MISC_ENABLE)),
        MSR_IA32_SPEC_CTRL => Ok(w.plat.rdmsr(MSR_IA32_SPEC_CTRL) & !MSR_IA32_SPEC_CTRL_STIBP),
        MSR_IA32_MONITOR_FILTER_SIZE => Ok(0),
        MSR_IA32_MCG_CAP => Ok(vcpu.get_guest_msr(MSR_IA32_MCG_CAP)),
        m if is_x2apic_msr(m) => w.lapic.x2apic_read(m),
        // CTL2 of banks 4..9 stays intercepted even for safety VMs; the
        // hidden banks read as zero.
        m if is_mc_ctl2_restricted(m) => {
            if vcpu.is_safety_vm() {
                Ok(0)
            } else {
                Err(VmError::InvalidGuestWrite)
            }
        }
        // The remaining MC registers are open in the bitmap for safety VMs;
        // should one trap anyway, behave like the hardware would have.
        m if is_mc_ctl2_passthru(m) || is_mc_ctl_status(m) => {
            if vcpu.is_safety_vm() {
                Ok(w.plat.rdmsr(m))
            } else {
                Err(VmError::InvalidGuestWrite)
            }
        }
        _ => {
            log::warn!("vcpu{}: rdmsr of unemulated MSR {:#x}", vcpu.vcpu_id, msr);
            Err(VmError::InvalidGuestWrite)
        }
    };
    let v = *result.as_ref().unwrap_or(&0);
    vcpu.regs.rax = v & 0xFFFF_FFFF;
    vcpu.regs.rdx = v >> 32;
    result.map(|_| ())
}

/// Emulate an intercepted `wrmsr`.
///
/// RCX selects the MSR; the value is `(RDX << 32) | RAX[31:0]`.
pub fn wrmsr_vmexit_handler(vcpu: &mut VCpu, w: &mut World) -> Result<(), VmError> {
    let msr = vcpu.regs.rcx as u32;
    let value = (vcpu.regs.rdx << 32) | (vcpu.regs.rax & 0xFFFF_FFFF);
    match msr {
        MSR_IA32_TSC_DEADLINE => w.lapic.set_tsc_deadline(value),
        MSR_IA32_TSC_ADJUST => set_guest_tsc_adjust(vcpu, w, value)?,
        MSR_IA32_TIME_STAMP_COUNTER => set_guest_tsc(vcpu, w, value)?,
        MSR_IA32_BIOS_SIGN_ID => {
            // Microcode loading is not virtualized; writing the reset value
            // is tolerated, anything else faults.
            if value != 0 {
                return Err(VmError::InvalidGuestWrite);
            }
        }
        MSR_IA32_PAT => write_pat_msr(vcpu, w, value)?,
        MSR_IA32_EFER => write_efer_msr(vcpu, w, value)?,
        MSR_IA32_MISC_ENABLE => write_misc_enable(vcpu, w, value)?,
        MSR_IA32_SPEC_CTRL => w
            .plat
            .wrmsr(MSR_IA32_SPEC_CTRL, value & !MSR_IA32_SPEC_CTRL_STIBP),
        MSR_IA32_MONITOR_FILTER_SIZE => {}
        m if is_x2apic_msr(m) => w.lapic.x2apic_write(m, value)?,
        // CTL2 of banks 4..9 stays intercepted even for safety VMs; writes
        // to the hidden banks are dropped.
        m if is_mc_ctl2_restricted(m) => {
            if !vcpu.is_safety_vm() {
                return Err(VmError::InvalidGuestWrite);
            }
        }
        m if is_mc_ctl2_passthru(m) || is_mc_ctl_status(m) => {
            if vcpu.is_safety_vm() {
                w.plat.wrmsr(m, value);
            } else {
                return Err(VmError::InvalidGuestWrite);
            }
        }
        _ => {
            log::warn!(
                "vcpu{}: wrmsr of unemulated MSR {:#x} = {:#x}",
                vcpu.vcpu_id,
                msr,
                value
            );
            return Err(VmError::InvalidGuestWrite);
        }
    }
    Ok(())
}
