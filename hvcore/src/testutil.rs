//! In-memory fakes of the collaborator traits, shared by the unit tests.

use crate::{
    cr::VmxCaps,
    vcpu::{PioDirection, PioRequest, VCpu},
    vm::{Gpa, Vm, VmConfig},
    vm_control::VmcsProcBasedVmexecCtl,
    vmcs::{Field, VmcsAccess},
    world::{
        EptOps, GuestPages, IoEmulator, Platform, VcpuRequest, VirtIrq, VirtLapic, VmLifecycle,
        World,
    },
    VmError,
};
use alloc::{collections::BTreeMap, sync::Arc, vec::Vec};
use core::cell::{Cell, RefCell, UnsafeCell};
use hvhal::{
    addressing::{Pa, Va},
    intrinsics::CpuidResult,
    msr::*,
};

/// VMCS backed by a map; reads of unwritten fields return zero.
pub(crate) struct SoftVmcs {
    fields: BTreeMap<u32, u64>,
}

impl SoftVmcs {
    pub(crate) fn new() -> Self {
        Self {
            fields: BTreeMap::new(),
        }
    }

    pub(crate) fn get(&self, field: Field) -> u64 {
        *self.fields.get(&(field as u32)).unwrap_or(&0)
    }

    pub(crate) fn set(&mut self, field: Field, v: u64) {
        self.fields.insert(field as u32, v);
    }
}

impl VmcsAccess for SoftVmcs {
    fn read(&self, field: Field) -> Result<u64, VmError> {
        Ok(self.get(field))
    }

    fn write(&mut self, field: Field, v: u64) -> Result<(), VmError> {
        self.set(field, v);
        Ok(())
    }
}

/// Scripted processor: CPUID from a table, MSRs from a map, a settable TSC.
pub(crate) struct FakePlatform {
    pub(crate) cpuid: BTreeMap<(u32, u32), (u32, u32, u32, u32)>,
    pub(crate) msrs: RefCell<BTreeMap<u32, u64>>,
    pub(crate) tsc: Cell<u64>,
    pub(crate) pcpu: u32,
    pub(crate) xcr0: Cell<u64>,
    pub(crate) flushed: RefCell<Vec<(usize, usize)>>,
    pub(crate) smap_depth: Cell<isize>,
}

impl FakePlatform {
    /// A processor resembling a small Intel part: CPUID level 0x16, xlevel
    /// 0x8000_0008, MAXPHYADDR 39, and feature bits chosen so every masking
    /// path in the emulators has something to clear.
    pub(crate) fn new() -> Self {
        let mut cpuid = BTreeMap::new();
        cpuid.insert((0, 0), (0x16, 0x756E_6547, 0x6C65_746E, 0x4965_6E69));
        cpuid.insert((0x1, 0), (0x0009_06EA, 0x0010_0800, 0x0D22_89A9, 0xB7E9_FBFF));
        cpuid.insert((0x2, 0), (0x7603_6301, 0x00F0_B5FF, 0, 0x00C3_0000));
        cpuid.insert((0x4, 0), (0x1C00_4121, 0x01C0_003F, 0x3F, 0));
        cpuid.insert((0x4, 1), (0x1C00_4122, 0x01C0_003F, 0x3F, 0));
        cpuid.insert((0x4, 2), (0x1C00_4143, 0x03C0_003F, 0x3FF, 0));
        cpuid.insert((0x4, 3), (0x1C03_C163, 0x02C0_003F, 0x1FFF, 0x6));
        cpuid.insert((0x6, 0), (0x27F7, 0x2, 0x9, 0));
        cpuid.insert((0x7, 0), (0, 0x0210_D49C, 0x4000_0004, 0x0C00_2000));
        cpuid.insert((0xB, 0), (0x1, 0x2, 0x100, 0));
        cpuid.insert((0xB, 1), (0x4, 0x10, 0x201, 0));
        cpuid.insert((0xD, 0), (0x1F, 0x440, 0x440, 0));
        cpuid.insert((0xD, 1), (0xF, 0x3C0, 0x100, 0));
        cpuid.insert((0xD, 2), (0x100, 0x240, 0, 0));
        cpuid.insert((0x15, 0), (0x2, 0xD8, 0x0262_5A00, 0));
        cpuid.insert((0x16, 0), (0xBB8, 0xFA0, 0x64, 0));
        cpuid.insert((0x8000_0000, 0), (0x8000_0008, 0, 0, 0));
        cpuid.insert((0x8000_0001, 0), (0, 0, 0x121, 0x2C10_0800));
        cpuid.insert((0x8000_0002, 0), (0x656B_6146, 0x6F72_5020, 0x7365_7363, 0x2072_6F73));
        cpuid.insert((0x8000_0006, 0), (0, 0, 0x0100_6040, 0));
        cpuid.insert((0x8000_0008, 0), (0x3027, 0, 0, 0));

        let mut msrs = BTreeMap::new();
        msrs.insert(MSR_IA32_VMX_CR0_FIXED0, 0x8000_0021u64);
        msrs.insert(MSR_IA32_VMX_CR0_FIXED1, 0xFFFF_FFFFu64);
        msrs.insert(MSR_IA32_VMX_CR4_FIXED0, 0x2000u64);
        msrs.insert(MSR_IA32_VMX_CR4_FIXED1, 0x003F_FFFFu64);
        msrs.insert(MSR_IA32_MISC_ENABLE, 0x0085_0089u64);
        msrs.insert(MSR_IA32_BIOS_SIGN_ID, 0x0000_00B4_0000_0000u64);
        msrs.insert(MSR_IA32_SPEC_CTRL, 0x0u64);

        Self {
            cpuid,
            msrs: RefCell::new(msrs),
            tsc: Cell::new(5000),
            pcpu: 2,
            xcr0: Cell::new(1),
            flushed: RefCell::new(Vec::new()),
            smap_depth: Cell::new(0),
        }
    }
}

impl Platform for FakePlatform {
    fn cpuid(&self, leaf: u32) -> CpuidResult {
        self.cpuid_subleaf(leaf, 0)
    }

    fn cpuid_subleaf(&self, leaf: u32, subleaf: u32) -> CpuidResult {
        let (eax, ebx, ecx, edx) = *self.cpuid.get(&(leaf, subleaf)).unwrap_or(&(0, 0, 0, 0));
        CpuidResult { eax, ebx, ecx, edx }
    }

    fn rdmsr(&self, msr: u32) -> u64 {
        *self.msrs.borrow().get(&msr).unwrap_or(&0)
    }

    fn wrmsr(&self, msr: u32, v: u64) {
        self.msrs.borrow_mut().insert(msr, v);
    }

    fn rdtsc(&self) -> u64 {
        self.tsc.get()
    }

    fn pcpu_id(&self) -> u32 {
        self.pcpu
    }

    fn write_xcr0(&self, v: u64) {
        self.xcr0.set(v);
    }

    fn hva2hpa(&self, va: Va) -> Pa {
        va.into_pa()
    }

    fn hpa2hva(&self, pa: Pa) -> Va {
        pa.into_va()
    }

    fn cache_flush(&self, va: Va, len: usize) {
        self.flushed.borrow_mut().push((va.into_usize(), len));
    }

    fn enable_user_access(&self) {
        self.smap_depth.set(self.smap_depth.get() + 1);
    }

    fn disable_user_access(&self) {
        self.smap_depth.set(self.smap_depth.get() - 1);
        assert!(self.smap_depth.get() >= 0, "unbalanced SMAP window");
    }
}

#[derive(Default)]
pub(crate) struct FakeLapic {
    pub(crate) apic_id: u32,
    pub(crate) apic_base: u64,
    pub(crate) deadline: u64,
    pub(crate) x2apic_reads: Vec<u32>,
    pub(crate) x2apic_writes: Vec<(u32, u64)>,
    pub(crate) x2apic_value: u64,
}

impl VirtLapic for FakeLapic {
    fn apic_id(&self) -> u32 {
        self.apic_id
    }

    fn apic_base(&self) -> u64 {
        self.apic_base
    }

    fn tsc_deadline(&self) -> u64 {
        self.deadline
    }

    fn set_tsc_deadline(&mut self, v: u64) {
        self.deadline = v;
    }

    fn x2apic_read(&mut self, msr: u32) -> Result<u64, VmError> {
        self.x2apic_reads.push(msr);
        Ok(self.x2apic_value)
    }

    fn x2apic_write(&mut self, msr: u32, v: u64) -> Result<(), VmError> {
        self.x2apic_writes.push((msr, v));
        Ok(())
    }
}

#[derive(Default)]
pub(crate) struct FakeVirq {
    pub(crate) exceptions: Vec<(u8, Option<u32>)>,
    pub(crate) requests: Vec<VcpuRequest>,
    pub(crate) exception_exits: usize,
}

impl VirtIrq for FakeVirq {
    fn queue_exception(&mut self, vector: u8, error_code: Option<u32>) {
        self.exceptions.push((vector, error_code));
    }

    fn make_request(&mut self, req: VcpuRequest) {
        self.requests.push(req);
    }

    fn exception_vmexit(&mut self) -> Result<(), VmError> {
        self.exception_exits += 1;
        Ok(())
    }
}

/// One contiguous guest-physical range backed by a host buffer.
pub(crate) struct FakeGuestMem {
    base: u64,
    bytes: UnsafeCell<Vec<u8>>,
}

impl FakeGuestMem {
    pub(crate) fn new(base: u64, size: usize) -> Self {
        Self {
            base,
            bytes: UnsafeCell::new(alloc::vec![0; size]),
        }
    }

    pub(crate) fn write_u64(&self, gpa: u64, v: u64) {
        let off = (gpa - self.base) as usize;
        let bytes = unsafe { &mut *self.bytes.get() };
        bytes[off..off + 8].copy_from_slice(&v.to_le_bytes());
    }

    pub(crate) fn read_u64(&self, gpa: u64) -> u64 {
        let off = (gpa - self.base) as usize;
        let bytes = unsafe { &*self.bytes.get() };
        u64::from_le_bytes(bytes[off..off + 8].try_into().unwrap())
    }
}

impl GuestPages for FakeGuestMem {
    fn gpa2hpa(&self, gpa: Gpa) -> Option<Pa> {
        self.gpa2hva(gpa).map(|va| va.into_pa())
    }

    fn gpa2hva(&self, gpa: Gpa) -> Option<Va> {
        let off = gpa.into_u64().checked_sub(self.base)?;
        let bytes = unsafe { &mut *self.bytes.get() };
        if (off as usize) < bytes.len() {
            Va::new(bytes.as_mut_ptr() as usize + off as usize)
        } else {
            None
        }
    }
}

#[derive(Default)]
pub(crate) struct FakeEpt {
    pub(crate) exec_grants: Vec<u64>,
    pub(crate) leaf_pages: Vec<(usize, usize)>,
}

impl EptOps for FakeEpt {
    fn add_exec_right(&mut self, gpa: Gpa) -> Result<(), VmError> {
        self.exec_grants.push(gpa.into_u64());
        Ok(())
    }

    fn walk_leaf_pages(&mut self, visit: &mut dyn FnMut(Pa, usize)) {
        for &(hpa, size) in &self.leaf_pages {
            visit(Pa::new(hpa).unwrap(), size);
        }
    }
}

#[derive(Default)]
pub(crate) struct FakeIo {
    pub(crate) last: Option<PioRequest>,
    pub(crate) read_value: u32,
}

impl IoEmulator for FakeIo {
    fn emulate_pio(&mut self, req: &mut PioRequest) -> Result<(), VmError> {
        if req.direction == PioDirection::In {
            req.value = self.read_value;
        }
        self.last = Some(*req);
        Ok(())
    }
}

#[derive(Default)]
pub(crate) struct FakeLife {
    pub(crate) shutdowns: usize,
}

impl VmLifecycle for FakeLife {
    fn fatal_shutdown(&mut self) {
        self.shutdowns += 1;
    }
}

/// Owns one fake of everything and lends them out as a [`World`].
pub(crate) struct TestHarness {
    pub(crate) vmcs: SoftVmcs,
    pub(crate) plat: FakePlatform,
    pub(crate) lapic: FakeLapic,
    pub(crate) virq: FakeVirq,
    pub(crate) mem: FakeGuestMem,
    pub(crate) ept: FakeEpt,
    pub(crate) io: FakeIo,
    pub(crate) life: FakeLife,
}

impl TestHarness {
    pub(crate) fn new() -> Self {
        let mut vmcs = SoftVmcs::new();
        // Exec controls as the entry loop would have programmed them.
        vmcs.set(
            Field::ProcessorBasedVmexecControls,
            (VmcsProcBasedVmexecCtl::USETSCOFF
                | VmcsProcBasedVmexecCtl::USEMSRBMP
                | VmcsProcBasedVmexecCtl::ACTIVATE_SECONDARY_CTL)
                .bits() as u64,
        );
        Self {
            vmcs,
            plat: FakePlatform::new(),
            lapic: FakeLapic::default(),
            virq: FakeVirq::default(),
            mem: FakeGuestMem::new(0x1000, 0x4000),
            ept: FakeEpt::default(),
            io: FakeIo::default(),
            life: FakeLife::default(),
        }
    }

    pub(crate) fn world(&mut self) -> World<'_> {
        World {
            vmcs: &mut self.vmcs,
            plat: &self.plat,
            lapic: &mut self.lapic,
            virq: &mut self.virq,
            pages: &self.mem,
            ept: &mut self.ept,
            io: &mut self.io,
            life: &mut self.life,
        }
    }

    pub(crate) fn new_vm(&self, is_safety_vm: bool, vcpu_num: u16) -> Arc<Vm> {
        let caps = VmxCaps::probe(&self.plat);
        Vm::new(
            VmConfig {
                vcpu_num,
                is_safety_vm,
            },
            &caps,
            &self.plat,
        )
        .unwrap()
    }

    pub(crate) fn new_vcpu(&self, is_safety_vm: bool, vcpu_num: u16) -> VCpu {
        VCpu::new(self.new_vm(is_safety_vm, vcpu_num), 0, self.plat.pcpu)
    }
}
