//! Virtual CPUID.
//!
//! Most CPUID leaves are the same for every vCPU of a VM and never change,
//! so they are computed once at VM creation into a sorted table ([`Vm`]
//! holds it). The handful of leaves that depend on the executing vCPU — its
//! APIC id, CR4, emulated MSRs or the vCPU count — are synthesised at exit
//! time by [`guest_cpuid`] on top of the table.
//!
//! Features the hypervisor refuses to virtualize (monitor/mwait, PMU, RDT,
//! SGX, MPX, processor trace, PCID, …) are masked here so guests never
//! attempt to use them.

use crate::{
    vcpu::VCpu,
    vm::Vm,
    world::{Platform, World},
    VmError,
};
use alloc::vec::Vec;
use hvhal::{
    intrinsics::fls32,
    msr::{MSR_IA32_MISC_ENABLE_LIMIT_CPUID, MSR_IA32_MISC_ENABLE_XD_DISABLE},
    reg::Cr4,
};
use static_assertions::const_assert_eq;

/// Capacity of the per-VM virtual CPUID table.
pub const MAX_VM_VCPUID_ENTRIES: usize = 64;

/// Entry flag: the lookup must also match the subleaf.
pub const CPUID_CHECK_SUBLEAF: u32 = 1 << 0;

/// One precomputed CPUID result.
#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
pub struct CpuidEntry {
    /// Input EAX.
    pub leaf: u32,
    /// Input ECX, meaningful when [`CPUID_CHECK_SUBLEAF`] is set.
    pub subleaf: u32,
    /// Lookup flags.
    pub flags: u32,
    pub eax: u32,
    pub ebx: u32,
    pub ecx: u32,
    pub edx: u32,
}

const_assert_eq!(core::mem::size_of::<CpuidEntry>(), 28);

// Leaf 01H ECX features never exposed to guests.
const LEAF1_ECX_MASKED: u32 = (1 << 2)   // DTES64
    | (1 << 3)   // MONITOR
    | (1 << 4)   // DS-CPL
    | (1 << 5)   // VMX
    | (1 << 6)   // SMX
    | (1 << 7)   // EST
    | (1 << 8)   // TM2
    | (1 << 11)  // SDBG
    | (1 << 15)  // PDCM
    | (1 << 17); // PCID
const LEAF1_ECX_OSXSAVE: u32 = 1 << 27;

// Leaf 01H EDX features never exposed to guests.
const LEAF1_EDX_MASKED: u32 = (1 << 1)   // VME
    | (1 << 2)   // DE
    | (1 << 12)  // MTRR
    | (1 << 21)  // DS
    | (1 << 22)  // ACPI
    | (1 << 29)  // TM
    | (1 << 31); // PBE
const LEAF1_EDX_MCE: u32 = 1 << 7;
const LEAF1_EDX_MCA: u32 = 1 << 14;
const LEAF1_EDX_HTT: u32 = 1 << 28;

// Leaf 07H:0 features never exposed to guests.
const LEAF7_EBX_MASKED: u32 = (1 << 2)   // SGX
    | (1 << 4)   // HLE
    | (1 << 10)  // INVPCID
    | (1 << 12)  // RDT-M
    | (1 << 14)  // MPX
    | (1 << 15)  // RDT-A
    | (1 << 25); // Processor Trace
const LEAF7_ECX_MASKED: u32 = 1 << 30; // SGX_LC
const LEAF7_EDX_MASKED: u32 = (1 << 13) // TSX_FORCE_ABORT
    | (1 << 27); // STIBP

/// Leaf 06H EAX: APIC-timer-always-running, the only thermal/power feature
/// guests get.
const LEAF6_EAX_ARAT: u32 = 1 << 2;

/// Leaf 15H ECX: nominal frequency of the virtual core crystal clock, Hz.
const VIRT_CRYSTAL_CLOCK_HZ: u32 = 0x016C_2154;

// Leaf 0DH XCR0 bits and state sizes.
const XCR0_SSE: u64 = 1 << 1;
const XCR0_AVX: u64 = 1 << 2;
const XCR0_BNDREGS: u64 = 1 << 3;
const XCR0_BNDCSR: u64 = 1 << 4;
const XSAVE_LEGACY_AREA_SIZE: u32 = 512;
const XSAVE_HEADER_AREA_SIZE: u32 = 64;
const LEAF_D_1_EAX_XSAVES: u32 = 1 << 3;
const LEAF_D_1_ECX_PT_STATE: u32 = 1 << 8;

const LEAF_EXT1_EDX_XD: u32 = 1 << 20;

/// The populated per-VM table.
pub(crate) struct VcpuidTable {
    pub(crate) level: u32,
    pub(crate) xlevel: u32,
    pub(crate) entries: Vec<CpuidEntry>,
}

/// Lift the reported basic level to 16H on platforms that hide the
/// frequency leaves.
#[cfg(feature = "leaf16-fixup")]
fn fixup_leaf0(entry: &mut CpuidEntry) {
    if entry.eax < 0x16 {
        entry.eax = 0x16;
    }
}

#[cfg(not(feature = "leaf16-fixup"))]
fn fixup_leaf0(_entry: &mut CpuidEntry) {}

fn native_entry(plat: &dyn Platform, leaf: u32, subleaf: u32, flags: u32) -> CpuidEntry {
    let r = plat.cpuid_subleaf(leaf, subleaf);
    CpuidEntry {
        leaf,
        subleaf,
        flags,
        eax: r.eax,
        ebx: r.ebx,
        ecx: r.ecx,
        edx: r.edx,
    }
}

fn push(entries: &mut Vec<CpuidEntry>, entry: CpuidEntry) -> Result<(), VmError> {
    if entries.len() >= MAX_VM_VCPUID_ENTRIES {
        return Err(VmError::TooManyCpuidEntries);
    }
    entries.push(entry);
    Ok(())
}

/// Populate the virtual CPUID table for a VM being constructed.
///
/// Iterates the basic leaves `0..=level` and extended leaves
/// `8000_0000H..=xlevel` of the processor this runs on. Per-vCPU leaves
/// (`1`, `B`, `D`, `8000_0001H`) are skipped and synthesised at exit time;
/// leaves of features the hypervisor hides are omitted entirely, so lookups
/// of them fall through to the all-zeros result.
pub(crate) fn build_vcpuid_entries(plat: &dyn Platform) -> Result<VcpuidTable, VmError> {
    let mut entries = Vec::new();

    let mut leaf0 = native_entry(plat, 0, 0, 0);
    fixup_leaf0(&mut leaf0);
    let level = leaf0.eax;
    push(&mut entries, leaf0)?;

    for leaf in 1..=level {
        match leaf {
            // Synthesised per-vCPU by guest_cpuid.
            0x1 | 0xB | 0xD => {}
            // Deterministic cache parameters, one entry per subleaf.
            0x4 => {
                let mut subleaf = 0;
                loop {
                    let entry = native_entry(plat, leaf, subleaf, CPUID_CHECK_SUBLEAF);
                    if entry.eax & 0xF == 0 {
                        // No more caches.
                        break;
                    }
                    push(&mut entries, entry)?;
                    subleaf += 1;
                }
            }
            // MWAIT, PMU, RDT, SGX, processor trace and the reserved leaves
            // around them: no entry, guests read zeros.
            0x5 | 0x8 | 0x9 | 0xA | 0xC | 0xE | 0xF | 0x10 | 0x11 | 0x12 | 0x13 | 0x14 => {}
            0x6 => {
                push(
                    &mut entries,
                    CpuidEntry {
                        leaf,
                        eax: LEAF6_EAX_ARAT,
                        ..CpuidEntry::default()
                    },
                )?;
            }
            0x7 => {
                let mut entry = native_entry(plat, leaf, 0, CPUID_CHECK_SUBLEAF);
                entry.ebx &= !LEAF7_EBX_MASKED;
                entry.ecx &= !LEAF7_ECX_MASKED;
                entry.edx &= !LEAF7_EDX_MASKED;
                push(&mut entries, entry)?;
            }
            0x15 => {
                let mut entry = native_entry(plat, leaf, 0, 0);
                entry.ecx = VIRT_CRYSTAL_CLOCK_HZ;
                push(&mut entries, entry)?;
            }
            _ => push(&mut entries, native_entry(plat, leaf, 0, 0))?,
        }
    }

    let ext0 = native_entry(plat, 0x8000_0000, 0, 0);
    let xlevel = ext0.eax;
    push(&mut entries, ext0)?;
    if xlevel > 0x8000_0000 {
        for leaf in 0x8000_0001..=xlevel {
            match leaf {
                // Synthesised per-vCPU by guest_cpuid.
                0x8000_0001 => {}
                0x8000_0006 => {
                    let mut entry = native_entry(plat, leaf, 0, 0);
                    // Force the L2 associativity field to encode 4-way.
                    entry.ecx = (entry.ecx & !0xF000) | 0x4000;
                    push(&mut entries, entry)?;
                }
                _ => push(&mut entries, native_entry(plat, leaf, 0, 0))?,
            }
        }
    }

    Ok(VcpuidTable {
        level,
        xlevel,
        entries,
    })
}

fn local_find_entry(vm: &Vm, leaf: u32, subleaf: u32) -> Option<&CpuidEntry> {
    let entries = &vm.vcpuid_entries;
    let nr = entries.len();
    if nr == 0 {
        return None;
    }
    // The table is sorted; the midpoint tells which half holds the leaf.
    let half = nr / 2;
    let mut i = if entries[half].leaf < leaf { half } else { 0 };
    while i < nr {
        let entry = &entries[i];
        if entry.leaf < leaf
            || (entry.leaf == leaf
                && (entry.flags & CPUID_CHECK_SUBLEAF) != 0
                && entry.subleaf != subleaf)
        {
            i += 1;
        } else if entry.leaf == leaf {
            return Some(entry);
        } else {
            break;
        }
    }
    None
}

/// Look up `(leaf, subleaf)` in the VM's virtual CPUID table.
///
/// An input EAX beyond the reported basic or extended maximum returns
/// information as if EAX were the basic maximum, matching hardware.
pub fn find_vcpuid_entry(vm: &Vm, leaf: u32, subleaf: u32) -> Option<&CpuidEntry> {
    let mut entry = local_find_entry(vm, leaf, subleaf);
    if entry.is_none() {
        let limit = if leaf & 0x8000_0000 != 0 {
            vm.vcpuid_xlevel
        } else {
            vm.vcpuid_level
        };
        if leaf > limit {
            entry = local_find_entry(vm, vm.vcpuid_level, subleaf);
        }
    }
    entry
}

fn guest_cpuid_01h(
    vcpu: &mut VCpu,
    w: &mut World,
    eax: &mut u32,
    ebx: &mut u32,
    ecx: &mut u32,
    edx: &mut u32,
) -> Result<(), VmError> {
    let r = w.plat.cpuid(0x1);
    *eax = r.eax;
    // EBX[31:24] carries the initial APIC id; everything below stays native.
    *ebx = (r.ebx & 0x00FF_FFFF) | (w.lapic.apic_id() << 24);
    *ecx = r.ecx & !(LEAF1_ECX_MASKED | LEAF1_ECX_OSXSAVE);
    if vcpu.get_cr4(w.vmcs)? & Cr4::OSXSAVE.bits() != 0 {
        *ecx |= LEAF1_ECX_OSXSAVE;
    }
    *edx = r.edx & !LEAF1_EDX_MASKED;
    if vcpu.is_safety_vm() {
        *edx &= !LEAF1_EDX_HTT;
    } else {
        *edx &= !(LEAF1_EDX_MCE | LEAF1_EDX_MCA);
    }
    Ok(())
}

fn guest_cpuid_0bh(
    vcpu: &VCpu,
    w: &mut World,
    eax: &mut u32,
    ebx: &mut u32,
    ecx: &mut u32,
    edx: &mut u32,
) {
    let subleaf = *ecx;
    let created = vcpu.vm().created_vcpus() as u32;
    *ecx = subleaf & 0xFF;
    *edx = w.lapic.apic_id();
    match subleaf {
        // SMT level: one logical processor per core.
        0 => {
            *eax = 0;
            *ebx = 1;
            *ecx |= 1 << 8;
        }
        // Core level: every vCPU of the VM.
        1 => {
            *eax = if created == 1 {
                0
            } else {
                fls32(created - 1) + 1
            };
            *ebx = created;
            *ecx |= 2 << 8;
        }
        _ => {
            *eax = 0;
            *ebx = 0;
        }
    }
}

fn guest_cpuid_0dh(w: &mut World, eax: &mut u32, ebx: &mut u32, ecx: &mut u32, edx: &mut u32) {
    let subleaf = *ecx;
    let avx_size = w.plat.cpuid_subleaf(0xD, 2).eax;
    match subleaf {
        0 => {
            let r = w.plat.cpuid_subleaf(0xD, 0);
            *eax = r.eax & !((XCR0_BNDREGS | XCR0_BNDCSR) as u32);
            *ebx = r.ebx;
            // Maximum save-area size for the states a guest can enable.
            *ecx = XSAVE_LEGACY_AREA_SIZE + XSAVE_HEADER_AREA_SIZE + avx_size;
            *edx = r.edx;
        }
        1 => {
            let r = w.plat.cpuid_subleaf(0xD, 1);
            *eax = r.eax & !LEAF_D_1_EAX_XSAVES;
            *ebx = r.ebx;
            *ecx = r.ecx & !LEAF_D_1_ECX_PT_STATE;
            *edx = r.edx;
        }
        2 => {
            let r = w.plat.cpuid_subleaf(0xD, 2);
            *eax = r.eax;
            *ebx = r.ebx;
            *ecx = r.ecx;
            *edx = r.edx;
        }
        _ => {
            *eax = 0;
            *ebx = 0;
            *ecx = 0;
            *edx = 0;
        }
    }
}

fn guest_cpuid_ext01h(
    vcpu: &VCpu,
    w: &mut World,
    eax: &mut u32,
    ebx: &mut u32,
    ecx: &mut u32,
    edx: &mut u32,
) {
    let r = w.plat.cpuid(0x8000_0001);
    *eax = r.eax;
    *ebx = r.ebx;
    *ecx = r.ecx;
    *edx = r.edx;
    let misc = vcpu.get_guest_msr(hvhal::msr::MSR_IA32_MISC_ENABLE);
    if misc & MSR_IA32_MISC_ENABLE_XD_DISABLE != 0 {
        *edx &= !LEAF_EXT1_EDX_XD;
    }
}

/// Clamp the result when the guest has set `IA32_MISC_ENABLE[22]`.
fn limit_cpuid(vcpu: &VCpu, leaf: u32, eax: &mut u32, ebx: &mut u32, ecx: &mut u32, edx: &mut u32) {
    let misc = vcpu.get_guest_msr(hvhal::msr::MSR_IA32_MISC_ENABLE);
    if misc & MSR_IA32_MISC_ENABLE_LIMIT_CPUID == 0 {
        return;
    }
    if leaf == 0 {
        *eax = 2;
    } else if (leaf > 2 && leaf < 0x8000_0000) || leaf > vcpu.vm().vcpuid_xlevel {
        match local_find_entry(vcpu.vm(), 2, 0) {
            Some(entry) => {
                *eax = entry.eax;
                *ebx = entry.ebx;
                *ecx = entry.ecx;
                *edx = entry.edx;
            }
            None => {
                *eax = 0;
                *ebx = 0;
                *ecx = 0;
                *edx = 0;
            }
        }
    }
}

/// Emulate `cpuid` for a vCPU.
///
/// On call, `eax` and `ecx` hold the guest's inputs; on return all four hold
/// the virtualized result.
pub fn guest_cpuid(
    vcpu: &mut VCpu,
    w: &mut World,
    eax: &mut u32,
    ebx: &mut u32,
    ecx: &mut u32,
    edx: &mut u32,
) -> Result<(), VmError> {
    let leaf = *eax;
    match leaf {
        0x1 => guest_cpuid_01h(vcpu, w, eax, ebx, ecx, edx)?,
        0xB => guest_cpuid_0bh(vcpu, w, eax, ebx, ecx, edx),
        0xD => guest_cpuid_0dh(w, eax, ebx, ecx, edx),
        0x8000_0001 => guest_cpuid_ext01h(vcpu, w, eax, ebx, ecx, edx),
        _ => match find_vcpuid_entry(vcpu.vm(), leaf, *ecx) {
            Some(entry) => {
                *eax = entry.eax;
                *ebx = entry.ebx;
                *ecx = entry.ecx;
                *edx = entry.edx;
            }
            None => {
                *eax = 0;
                *ebx = 0;
                *ecx = 0;
                *edx = 0;
            }
        },
    }
    limit_cpuid(vcpu, leaf, eax, ebx, ecx, edx);
    Ok(())
}
