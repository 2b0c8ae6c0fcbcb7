//! CR0/CR4 virtualization.
//!
//! The guest-host masks make most CR0/CR4 bits hypervisor-owned: guest reads
//! come from the read shadows, and writes to owned bits trap here. Every
//! trapped write is validated against the VMX fixed-bit MSRs and policy, and
//! the mode-switch side effects (IA-32e enable/disable, PAE PDPTR reload,
//! PAT shadowing under CR0.CD, TLB flushes) are synthesised before the new
//! value is installed.

use crate::{
    msr::PAT_ALL_UC_VALUE,
    vcpu::{VCpu, REG_CACHED_CR0, REG_CACHED_CR4, REG_CACHED_EFER},
    vm::Gpa,
    vm_control::VmcsEntryCtl,
    vmcs::{Field, VmcsAccess},
    world::{Platform, VcpuRequest, World},
    VmError,
};
use hvhal::{
    msr::{
        MSR_IA32_PAT, MSR_IA32_VMX_CR0_FIXED0, MSR_IA32_VMX_CR0_FIXED1, MSR_IA32_VMX_CR4_FIXED0,
        MSR_IA32_VMX_CR4_FIXED1,
    },
    reg::{Cr0, Cr4, Efer},
};

/// CR0 bits whose guest writes must always trap.
const CR0_TRAP_MASK: u64 = Cr0::PE.bits()
    | Cr0::PG.bits()
    | Cr0::WP.bits()
    | Cr0::CD.bits()
    | Cr0::NW.bits();

/// Architecturally undefined CR0 bits.
const CR0_RESERVED_MASK: u64 = !Cr0::all().bits();

/// CR0 bits whose illegal values raise `#GP`; the remaining positions
/// (`[28:19]`, `17`, `[15:6]`) are silently tolerated.
const CR0_FAULTING_BITS_MASK: u64 = 0xFFFF_FFFF_E005_003F;

/// CR4 bits whose guest writes must always trap.
const CR4_TRAP_MASK: u64 = Cr4::PSE.bits()
    | Cr4::PAE.bits()
    | Cr4::VMXE.bits()
    | Cr4::PCIDE.bits()
    | Cr4::SMEP.bits()
    | Cr4::SMAP.bits()
    | Cr4::PKE.bits()
    | Cr4::SMXE.bits()
    | Cr4::DE.bits()
    | Cr4::MCE.bits()
    | Cr4::PCE.bits()
    | Cr4::VME.bits()
    | Cr4::PVI.bits();

/// Architecturally undefined CR4 bits.
const CR4_RESERVED_MASK: u64 = !Cr4::all().bits();

/// CR4 features the hypervisor never lets any guest enable.
const CR4_DENIED_MASK: u64 = Cr4::VMXE.bits()
    | Cr4::SMXE.bits()
    | Cr4::PKE.bits()
    | Cr4::PCE.bits()
    | Cr4::DE.bits()
    | Cr4::VME.bits()
    | Cr4::PVI.bits();

/// PAE PDPTE bits `[2:1]` and `[8:5]`, reserved and checked on reload.
const PAE_PDPTE_FIXED_RESVD_BITS: u64 = 0x1E6;

/// Boot-time VMX capability snapshot: the CR0/CR4 ownership masks derived
/// from `IA32_VMX_CR0_FIXED0/1` and `IA32_VMX_CR4_FIXED0/1`, and the
/// physical-address width.
///
/// Computed once on the boot CPU and threaded by reference into every VM
/// constructor; never modified afterwards.
#[derive(Debug, Clone, Copy)]
pub struct VmxCaps {
    pub(crate) cr0_host_owned: u64,
    pub(crate) cr0_always_on: u64,
    pub(crate) cr0_always_off: u64,
    pub(crate) cr4_host_owned: u64,
    pub(crate) cr4_always_on: u64,
    pub(crate) cr4_always_off: u64,
    /// MAXPHYADDR from CPUID.8000_0008H:EAX[7:0].
    pub(crate) maxphysaddr: u32,
}

impl VmxCaps {
    /// Derive the CR masks from the VMX fixed-bit MSRs of this processor.
    ///
    /// `CR0.PE` and `CR0.PG` are softened out of the always-on mask: with
    /// unrestricted guest they stay guest-settable even though `FIXED0`
    /// reports them fixed.
    pub fn probe(plat: &dyn Platform) -> Self {
        let cr0_fixed0 = plat.rdmsr(MSR_IA32_VMX_CR0_FIXED0);
        let cr0_fixed1 = plat.rdmsr(MSR_IA32_VMX_CR0_FIXED1);
        let cr4_fixed0 = plat.rdmsr(MSR_IA32_VMX_CR4_FIXED0);
        let cr4_fixed1 = plat.rdmsr(MSR_IA32_VMX_CR4_FIXED1);
        Self {
            cr0_host_owned: (!(cr0_fixed0 ^ cr0_fixed1) | CR0_TRAP_MASK) & !CR0_RESERVED_MASK,
            cr0_always_on: cr0_fixed0 & !(Cr0::PE.bits() | Cr0::PG.bits()),
            cr0_always_off: (!cr0_fixed1 | CR0_RESERVED_MASK) & CR0_FAULTING_BITS_MASK,
            cr4_host_owned: (!(cr4_fixed0 ^ cr4_fixed1) | CR4_TRAP_MASK) & !CR4_RESERVED_MASK,
            cr4_always_on: cr4_fixed0,
            cr4_always_off: !cr4_fixed1 | CR4_RESERVED_MASK,
            maxphysaddr: plat.cpuid(0x8000_0008).eax & 0xFF,
        }
    }

    /// CR0 bits every guest must keep set.
    #[inline]
    pub fn cr0_always_on(&self) -> u64 {
        self.cr0_always_on
    }

    /// CR0 bits no guest may set.
    #[inline]
    pub fn cr0_always_off(&self) -> u64 {
        self.cr0_always_off
    }

    /// CR4 bits every guest must keep set.
    #[inline]
    pub fn cr4_always_on(&self) -> u64 {
        self.cr4_always_on
    }

    /// CR4 bits no guest may set.
    #[inline]
    pub fn cr4_always_off(&self) -> u64 {
        self.cr4_always_off
    }
}

/// Install the CR0/CR4 guest-host ownership masks into the vCPU's VMCS.
///
/// Part of exec-control setup, before the first entry.
pub fn init_cr_masks(vcpu: &VCpu, w: &mut World) -> Result<(), VmError> {
    let caps = vcpu.vm().caps();
    w.vmcs.write(Field::Cr0GuestHostMask, caps.cr0_host_owned)?;
    w.vmcs.write(Field::Cr4GuestHostMask, caps.cr4_host_owned)?;
    Ok(())
}

impl VCpu {
    /// Guest CR0 as the guest believes it to be.
    ///
    /// Reconstructed from the read shadow and `GUEST_CR0` on first use after
    /// an exit, then served from the cache.
    pub fn get_cr0(&mut self, vmcs: &dyn VmcsAccess) -> Result<u64, VmError> {
        if self.run_ctx.reg_cached & REG_CACHED_CR0 == 0 {
            let mask = self.vm().caps().cr0_host_owned;
            let shadow = vmcs.read(Field::Cr0ReadShadow)?;
            let guest = vmcs.read(Field::GuestCr0)?;
            self.run_ctx.cr0 = (shadow & mask) | (guest & !mask);
            self.run_ctx.reg_cached |= REG_CACHED_CR0;
        }
        Ok(self.run_ctx.cr0)
    }

    /// Guest CR4 as the guest believes it to be.
    pub fn get_cr4(&mut self, vmcs: &dyn VmcsAccess) -> Result<u64, VmError> {
        if self.run_ctx.reg_cached & REG_CACHED_CR4 == 0 {
            let mask = self.vm().caps().cr4_host_owned;
            let shadow = vmcs.read(Field::Cr4ReadShadow)?;
            let guest = vmcs.read(Field::GuestCr4)?;
            self.run_ctx.cr4 = (shadow & mask) | (guest & !mask);
            self.run_ctx.reg_cached |= REG_CACHED_CR4;
        }
        Ok(self.run_ctx.cr4)
    }

    /// Guest CR2.
    #[inline]
    pub fn get_cr2(&self) -> u64 {
        self.run_ctx.cr2
    }

    /// Guest EFER.
    pub fn get_efer(&mut self, vmcs: &dyn VmcsAccess) -> Result<u64, VmError> {
        if self.run_ctx.reg_cached & REG_CACHED_EFER == 0 {
            self.run_ctx.efer = vmcs.read(Field::GuestIa32Efer)?;
            self.run_ctx.reg_cached |= REG_CACHED_EFER;
        }
        Ok(self.run_ctx.efer)
    }

    /// Update guest EFER in the cache and the VMCS.
    pub fn set_efer(&mut self, vmcs: &mut dyn VmcsAccess, v: u64) -> Result<(), VmError> {
        self.run_ctx.efer = v;
        self.run_ctx.reg_cached |= REG_CACHED_EFER;
        vmcs.write(Field::GuestIa32Efer, v)
    }
}

/// Whether the guest runs with paging enabled.
pub fn is_paging_enabled(vcpu: &mut VCpu, w: &mut World) -> Result<bool, VmError> {
    Ok(vcpu.get_cr0(w.vmcs)? & Cr0::PG.bits() != 0)
}

/// Whether the guest runs in IA-32e mode.
pub fn is_long_mode(vcpu: &mut VCpu, w: &mut World) -> Result<bool, VmError> {
    Ok(vcpu.get_efer(w.vmcs)? & Efer::LMA.bits() != 0)
}

/// Reload the four PAE PDPTEs from guest CR3 into the VMCS.
///
/// Fails if any present entry has reserved bits set or the PDPT page is
/// unmapped; on failure no PDPTE is written.
fn load_pdptrs(vcpu: &mut VCpu, w: &mut World) -> Result<(), VmError> {
    let cr3 = w.vmcs.read(Field::GuestCr3)?;
    let mut buf = [0u8; 32];
    crate::mem::copy_from_gpa(w, &mut buf, Gpa::new(cr3 & 0xFFFF_FFE0))?;

    let resvd = PAE_PDPTE_FIXED_RESVD_BITS | (u64::MAX << vcpu.vm().caps().maxphysaddr);
    let mut pdptes = [0u64; 4];
    for (i, pdpte) in pdptes.iter_mut().enumerate() {
        *pdpte = u64::from_le_bytes(buf[i * 8..i * 8 + 8].try_into().unwrap());
        if *pdpte & 0x1 != 0 && *pdpte & resvd != 0 {
            return Err(VmError::InvalidGuestState);
        }
    }
    w.vmcs.write(Field::GuestIa32Pdpte0, pdptes[0])?;
    w.vmcs.write(Field::GuestIa32Pdpte1, pdptes[1])?;
    w.vmcs.write(Field::GuestIa32Pdpte2, pdptes[2])?;
    w.vmcs.write(Field::GuestIa32Pdpte3, pdptes[3])?;
    Ok(())
}

fn write_cr0(vcpu: &mut VCpu, w: &mut World, value: u64) -> Result<(), VmError> {
    let caps = *vcpu.vm().caps();
    let old = vcpu.get_cr0(w.vmcs)?;
    let cr4 = vcpu.get_cr4(w.vmcs)?;
    let efer = vcpu.get_efer(w.vmcs)?;

    if value & caps.cr0_always_off != 0 {
        return Err(VmError::InvalidGuestWrite);
    }
    // No return to real mode once protected mode is on.
    if old & Cr0::PE.bits() != 0 && value & Cr0::PE.bits() == 0 {
        return Err(VmError::InvalidGuestState);
    }
    if value & Cr0::PG.bits() != 0
        && cr4 & Cr4::PAE.bits() == 0
        && efer & Efer::LME.bits() != 0
    {
        return Err(VmError::InvalidGuestState);
    }
    if value & Cr0::PE.bits() == 0 && value & Cr0::PG.bits() != 0 {
        return Err(VmError::InvalidGuestState);
    }
    if value & Cr0::NW.bits() != 0 && value & Cr0::CD.bits() == 0 {
        return Err(VmError::InvalidGuestState);
    }

    let changed = old ^ value;
    if changed & Cr0::PG.bits() != 0 {
        if value & Cr0::PG.bits() != 0 {
            if efer & Efer::LME.bits() != 0 {
                // IA-32e enable: CS must not already be 64-bit and TR must
                // not be a 16-bit busy TSS.
                let cs_ar = w.vmcs.read(Field::GuestCsAccessRights)?;
                let tr_ar = w.vmcs.read(Field::GuestTrAccessRights)?;
                if cs_ar & 0x2000 != 0 || tr_ar & 0xF == 0x3 {
                    return Err(VmError::InvalidGuestState);
                }
                let entry = w.vmcs.read(Field::VmentryControls)? as u32
                    | VmcsEntryCtl::IA32E_MODE_GUEST.bits();
                w.vmcs.write(Field::VmentryControls, entry as u64)?;
                vcpu.set_efer(w.vmcs, efer | Efer::LMA.bits())?;
            } else if cr4 & Cr4::PAE.bits() != 0 {
                load_pdptrs(vcpu, w)?;
            }
        } else if efer & Efer::LME.bits() != 0 {
            // IA-32e disable is legal only from compatibility mode.
            let cs_ar = w.vmcs.read(Field::GuestCsAccessRights)?;
            if cs_ar & 0x2000 != 0 {
                return Err(VmError::InvalidGuestState);
            }
            let entry = w.vmcs.read(Field::VmentryControls)? as u32
                & !VmcsEntryCtl::IA32E_MODE_GUEST.bits();
            w.vmcs.write(Field::VmentryControls, entry as u64)?;
            vcpu.set_efer(w.vmcs, efer & !Efer::LMA.bits())?;
        }
    }

    if changed & Cr0::CD.bits() != 0 {
        if value & Cr0::CD.bits() != 0 {
            w.vmcs.write(Field::GuestIa32Pat, PAT_ALL_UC_VALUE)?;
        } else {
            w.vmcs
                .write(Field::GuestIa32Pat, vcpu.get_guest_msr(MSR_IA32_PAT))?;
        }
    }

    if changed & (Cr0::PG.bits() | Cr0::WP.bits() | Cr0::CD.bits()) != 0 {
        w.virq.make_request(VcpuRequest::EptFlush);
    }

    let cr0_vmx = (caps.cr0_always_on | value) & !(Cr0::CD.bits() | Cr0::NW.bits());
    w.vmcs.write(Field::GuestCr0, cr0_vmx & 0xFFFF_FFFF)?;
    w.vmcs
        .write(Field::Cr0ReadShadow, (value | Cr0::NE.bits()) & 0xFFFF_FFFF)?;
    vcpu.run_ctx.reg_cached &= !REG_CACHED_CR0;
    Ok(())
}

fn write_cr4(vcpu: &mut VCpu, w: &mut World, value: u64) -> Result<(), VmError> {
    let caps = *vcpu.vm().caps();
    let old = vcpu.get_cr4(w.vmcs)?;

    if value & caps.cr4_always_off != 0 {
        return Err(VmError::InvalidGuestWrite);
    }
    if value & CR4_DENIED_MASK != 0 {
        return Err(VmError::InvalidGuestWrite);
    }
    if value & Cr4::MCE.bits() != 0 && !vcpu.is_safety_vm() {
        return Err(VmError::InvalidGuestWrite);
    }
    if value & Cr4::PCIDE.bits() != 0 {
        return Err(VmError::InvalidGuestWrite);
    }
    if is_long_mode(vcpu, w)? && value & Cr4::PAE.bits() == 0 {
        return Err(VmError::InvalidGuestState);
    }

    let changed = old ^ value;
    if changed
        & (Cr4::PGE.bits() | Cr4::PSE.bits() | Cr4::PAE.bits() | Cr4::SMEP.bits()
            | Cr4::SMAP.bits())
        != 0
    {
        if value & Cr4::PAE.bits() != 0 && is_paging_enabled(vcpu, w)? && !is_long_mode(vcpu, w)? {
            load_pdptrs(vcpu, w)?;
        }
        w.virq.make_request(VcpuRequest::EptFlush);
    }

    w.vmcs.write(Field::GuestCr4, caps.cr4_always_on | value)?;
    w.vmcs.write(Field::Cr4ReadShadow, value)?;
    vcpu.run_ctx.reg_cached &= !REG_CACHED_CR4;
    Ok(())
}

/// Set guest CR0.
///
/// With `is_init` the value is recorded without validation or side effects
/// (vCPU reset path); otherwise the full trapped-write path runs.
pub fn vcpu_set_cr0(vcpu: &mut VCpu, w: &mut World, value: u64, is_init: bool) -> Result<(), VmError> {
    if is_init {
        vcpu.run_ctx.cr0 = value;
        vcpu.run_ctx.reg_cached |= REG_CACHED_CR0;
        Ok(())
    } else {
        write_cr0(vcpu, w, value)
    }
}

/// Set guest CR4. See [`vcpu_set_cr0`] for `is_init`.
pub fn vcpu_set_cr4(vcpu: &mut VCpu, w: &mut World, value: u64, is_init: bool) -> Result<(), VmError> {
    if is_init {
        vcpu.run_ctx.cr4 = value;
        vcpu.run_ctx.reg_cached |= REG_CACHED_CR4;
        Ok(())
    } else {
        write_cr4(vcpu, w, value)
    }
}

/// Set guest CR2. There is no VMCS field for CR2; the entry stub loads it.
pub fn vcpu_set_cr2(vcpu: &mut VCpu, value: u64) {
    vcpu.run_ctx.cr2 = value;
}

/// Decoded CR-access kind, from exit qualification bits `[5:4]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CrAccessKind {
    MovToCr,
    MovFromCr,
    Clts,
    Lmsw,
}

impl CrAccessKind {
    fn decode(qual: u64) -> Self {
        match (qual >> 4) & 0x3 {
            0 => CrAccessKind::MovToCr,
            1 => CrAccessKind::MovFromCr,
            2 => CrAccessKind::Clts,
            _ => CrAccessKind::Lmsw,
        }
    }
}

/// Handle a control-register access VM exit.
pub fn cr_access_vmexit_handler(vcpu: &mut VCpu, w: &mut World) -> Result<(), VmError> {
    let qual = vcpu.exit_qualification;
    let cr_num = (qual & 0xF) as u8;
    match (CrAccessKind::decode(qual), cr_num) {
        (CrAccessKind::MovToCr, 0) => {
            let value = vcpu.regs.get(((qual >> 8) & 0xF) as u8);
            write_cr0(vcpu, w, value)
        }
        (CrAccessKind::MovToCr, 4) => {
            let value = vcpu.regs.get(((qual >> 8) & 0xF) as u8);
            write_cr4(vcpu, w, value)
        }
        (CrAccessKind::Lmsw, _) => {
            // LMSW replaces CR0[3:0] except that PE cannot be cleared.
            let old = vcpu.get_cr0(w.vmcs)?;
            let new = (old & !0xE) | ((qual >> 16) & 0xF);
            write_cr0(vcpu, w, new)
        }
        _ => Err(VmError::UnhandledCrAccess(qual)),
    }
}
