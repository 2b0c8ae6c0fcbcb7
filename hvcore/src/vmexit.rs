//! VM-exit dispatch.
//!
//! Every basic exit reason maps to one entry of a dense table; the few
//! instructions this hypervisor emulates get real handlers, everything else
//! lands in [`unexpected_vmexit_handler`]. The dispatcher first re-queues any
//! event that was mid-delivery when the exit happened (IDT vectoring), then
//! routes by reason.
//!
//! Handler contract: `Ok(())` resumes the guest; a guest-fault error makes
//! the dispatcher inject `#GP(0)` and resume; any other error is fatal and
//! propagates to the entry loop.

use crate::{
    cpuid::guest_cpuid,
    cr::{self, cr_access_vmexit_handler},
    msr::{rdmsr_vmexit_handler, wrmsr_vmexit_handler},
    vcpu::{PioDirection, PioRequest, VCpu},
    vm::Gpa,
    vmcs::Field,
    world::{VcpuRequest, World, GP_VECTOR, PF_VECTOR},
    VmError,
};
use hvhal::reg::Cr4;

/// Number of basic exit reasons the dispatch table covers.
pub const NR_VMX_EXIT_REASONS: usize = 65;

// IDT-vectoring information fields, SDM Table 24-16.
const VMX_INT_INFO_VALID: u32 = 1 << 31;
const VMX_INT_INFO_ERR_CODE_VALID: u32 = 1 << 11;
const VMX_INT_TYPE_NMI: u32 = 2;
const VMX_INT_TYPE_HW_EXCEPTION: u32 = 3;

type ExitHandler = fn(&mut VCpu, &mut World) -> Result<(), VmError>;

#[derive(Clone, Copy)]
struct VmExitDispatch {
    handler: ExitHandler,
    need_exit_qualification: bool,
}

const UNEXPECTED: VmExitDispatch = VmExitDispatch {
    handler: unexpected_vmexit_handler,
    need_exit_qualification: false,
};

const fn plain(handler: ExitHandler) -> VmExitDispatch {
    VmExitDispatch {
        handler,
        need_exit_qualification: false,
    }
}

const fn with_qual(handler: ExitHandler) -> VmExitDispatch {
    VmExitDispatch {
        handler,
        need_exit_qualification: true,
    }
}

/// Dispatch table indexed by the basic exit reason, SDM Appendix C.
static DISPATCH_TABLE: [VmExitDispatch; NR_VMX_EXIT_REASONS] = [
    plain(exception_vmexit_handler),       // 0: exception or NMI
    UNEXPECTED,                            // 1: external interrupt
    UNEXPECTED,                            // 2: triple fault
    plain(init_signal_vmexit_handler),     // 3: INIT signal
    UNEXPECTED,                            // 4: startup IPI
    UNEXPECTED,                            // 5: I/O SMI
    UNEXPECTED,                            // 6: other SMI
    UNEXPECTED,                            // 7: interrupt window
    UNEXPECTED,                            // 8: NMI window
    with_qual(task_switch_vmexit_handler), // 9: task switch
    plain(cpuid_vmexit_handler),           // 10: CPUID
    UNEXPECTED,                            // 11: GETSEC
    UNEXPECTED,                            // 12: HLT
    plain(invd_vmexit_handler),            // 13: INVD
    UNEXPECTED,                            // 14: INVLPG
    UNEXPECTED,                            // 15: RDPMC
    UNEXPECTED,                            // 16: RDTSC
    UNEXPECTED,                            // 17: RSM
    UNEXPECTED,                            // 18: VMCALL
    UNEXPECTED,                            // 19: VMCLEAR
    UNEXPECTED,                            // 20: VMLAUNCH
    UNEXPECTED,                            // 21: VMPTRLD
    UNEXPECTED,                            // 22: VMPTRST
    UNEXPECTED,                            // 23: VMREAD
    UNEXPECTED,                            // 24: VMRESUME
    UNEXPECTED,                            // 25: VMWRITE
    UNEXPECTED,                            // 26: VMXOFF
    UNEXPECTED,                            // 27: VMXON
    with_qual(cr_access_vmexit_handler),   // 28: control-register access
    plain(mov_dr_vmexit_handler),          // 29: MOV DR
    with_qual(pio_instr_vmexit_handler),   // 30: I/O instruction
    plain(rdmsr_vmexit_handler),           // 31: RDMSR
    plain(wrmsr_vmexit_handler),           // 32: WRMSR
    UNEXPECTED,                            // 33: entry failure: guest state
    UNEXPECTED,                            // 34: entry failure: MSR loading
    UNEXPECTED,                            // 35: (reserved)
    UNEXPECTED,                            // 36: MWAIT
    UNEXPECTED,                            // 37: monitor trap flag
    UNEXPECTED,                            // 38: (reserved)
    UNEXPECTED,                            // 39: MONITOR
    UNEXPECTED,                            // 40: PAUSE
    UNEXPECTED,                            // 41: entry failure: machine check
    UNEXPECTED,                            // 42: (reserved)
    UNEXPECTED,                            // 43: TPR below threshold
    UNEXPECTED,                            // 44: APIC access
    UNEXPECTED,                            // 45: virtualized EOI
    UNEXPECTED,                            // 46: GDTR/IDTR access
    UNEXPECTED,                            // 47: LDTR/TR access
    with_qual(ept_violation_vmexit_handler), // 48: EPT violation
    UNEXPECTED,                            // 49: EPT misconfiguration
    UNEXPECTED,                            // 50: INVEPT
    UNEXPECTED,                            // 51: RDTSCP
    UNEXPECTED,                            // 52: VMX-preemption timer
    UNEXPECTED,                            // 53: INVVPID
    plain(wbinvd_vmexit_handler),          // 54: WBINVD
    plain(xsetbv_vmexit_handler),          // 55: XSETBV
    UNEXPECTED,                            // 56: APIC write
    UNEXPECTED,                            // 57: RDRAND
    UNEXPECTED,                            // 58: INVPCID
    UNEXPECTED,                            // 59: VMFUNC
    UNEXPECTED,                            // 60: ENCLS
    UNEXPECTED,                            // 61: RDSEED
    UNEXPECTED,                            // 62: page-modification log full
    UNEXPECTED,                            // 63: XSAVES
    UNEXPECTED,                            // 64: XRSTORS
];

/// Process IDT-vectoring information: an event that was being delivered when
/// the exit happened is re-queued so the next entry injects it.
///
/// The snapshot is cleared exactly when a re-injection was enqueued.
fn reinject_idt_vectoring_event(vcpu: &mut VCpu, w: &mut World) -> Result<(), VmError> {
    vcpu.idt_vectoring_info = w.vmcs.read(Field::IdtVectoringInfo)? as u32;
    let info = vcpu.idt_vectoring_info;
    if info & VMX_INT_INFO_VALID == 0 {
        return Ok(());
    }
    let vector = (info & 0xFF) as u8;
    match (info >> 8) & 0x7 {
        VMX_INT_TYPE_HW_EXCEPTION => {
            let err_code = if info & VMX_INT_INFO_ERR_CODE_VALID != 0 {
                Some(w.vmcs.read(Field::IdtVectoringErrCode)? as u32)
            } else {
                None
            };
            w.virq.queue_exception(vector, err_code);
            vcpu.idt_vectoring_info = 0;
        }
        VMX_INT_TYPE_NMI => {
            w.virq.make_request(VcpuRequest::Nmi);
            vcpu.idt_vectoring_info = 0;
        }
        // External interrupts are re-raised by the interrupt controller and
        // software exceptions re-execute; neither is re-injected here.
        _ => {}
    }
    Ok(())
}

/// Central VM-exit dispatcher, invoked by the entry loop on every exit.
pub fn vmexit_handler(vcpu: &mut VCpu, w: &mut World) -> Result<(), VmError> {
    let pcpu = w.plat.pcpu_id();
    if pcpu != vcpu.pcpu_id {
        return Err(VmError::WrongPcpu {
            expected: vcpu.pcpu_id,
            found: pcpu,
        });
    }

    reinject_idt_vectoring_event(vcpu, w)?;

    let reason = w.vmcs.read(Field::VmexitReason)? as u32;
    vcpu.exit_reason = reason;
    let basic = (reason & 0xFFFF) as usize;
    if basic >= NR_VMX_EXIT_REASONS {
        return Err(VmError::BadExitReason(reason));
    }
    let dispatch = &DISPATCH_TABLE[basic];
    if dispatch.need_exit_qualification {
        vcpu.exit_qualification = w.vmcs.read(Field::VmexitQualification)?;
    }
    match (dispatch.handler)(vcpu, w) {
        Err(e) if e.is_guest_fault() => {
            w.virq.queue_exception(GP_VECTOR, Some(0));
            Ok(())
        }
        r => r,
    }
}

fn exception_vmexit_handler(_vcpu: &mut VCpu, w: &mut World) -> Result<(), VmError> {
    w.virq.exception_vmexit()
}

fn init_signal_vmexit_handler(vcpu: &mut VCpu, _w: &mut World) -> Result<(), VmError> {
    // INIT is ignored in VMX non-root operation; resume at the same RIP.
    vcpu.retain_rip();
    Ok(())
}

fn task_switch_vmexit_handler(vcpu: &mut VCpu, w: &mut World) -> Result<(), VmError> {
    w.virq.queue_exception(
        GP_VECTOR,
        Some((vcpu.exit_qualification & 0xFFFF) as u32),
    );
    Ok(())
}

fn cpuid_vmexit_handler(vcpu: &mut VCpu, w: &mut World) -> Result<(), VmError> {
    let mut eax = vcpu.regs.rax as u32;
    let mut ebx = vcpu.regs.rbx as u32;
    let mut ecx = vcpu.regs.rcx as u32;
    let mut edx = vcpu.regs.rdx as u32;
    guest_cpuid(vcpu, w, &mut eax, &mut ebx, &mut ecx, &mut edx)?;
    vcpu.regs.rax = eax as u64;
    vcpu.regs.rbx = ebx as u64;
    vcpu.regs.rcx = ecx as u64;
    vcpu.regs.rdx = edx as u64;
    Ok(())
}

fn invd_vmexit_handler(_vcpu: &mut VCpu, _w: &mut World) -> Result<(), VmError> {
    // Discarding modified cache lines would lose hypervisor state.
    Err(VmError::InvalidGuestWrite)
}

fn mov_dr_vmexit_handler(_vcpu: &mut VCpu, _w: &mut World) -> Result<(), VmError> {
    // TODO: revisit once debug-register virtualization lands. Injecting #GP
    // here triple-faults the current guests.
    Ok(())
}

fn pio_instr_vmexit_handler(vcpu: &mut VCpu, w: &mut World) -> Result<(), VmError> {
    let qual = vcpu.exit_qualification;
    let size = ((qual & 0x7) + 1) as u8;
    let port = ((qual >> 16) & 0xFFFF) as u16;
    let is_in = qual & 0x8 != 0;
    let mask: u32 = match size {
        1 => 0xFF,
        2 => 0xFFFF,
        _ => 0xFFFF_FFFF,
    };
    let mut req = PioRequest {
        port,
        size,
        direction: if is_in {
            PioDirection::In
        } else {
            PioDirection::Out
        },
        value: if is_in {
            0
        } else {
            vcpu.regs.rax as u32 & mask
        },
    };
    w.io.emulate_pio(&mut req)?;
    vcpu.io_req = req;
    if is_in {
        vcpu.regs.rax = (vcpu.regs.rax & !(mask as u64)) | ((req.value & mask) as u64);
    }
    Ok(())
}

fn ept_violation_vmexit_handler(vcpu: &mut VCpu, w: &mut World) -> Result<(), VmError> {
    let qual = vcpu.exit_qualification;
    let gpa = Gpa::new(w.vmcs.read(Field::GuestPhysicalAddr)?);
    if qual & 0x4 != 0 {
        // Instruction fetch from a page mapped without execute: grant and
        // re-execute.
        w.ept.add_exec_right(gpa & !0xFFF)?;
        w.virq.make_request(VcpuRequest::EptFlush);
        vcpu.retain_rip();
    } else {
        // Data access outside the mapped guest-physical space reflects back
        // as a page fault at the offending address.
        let err_code = if qual & 0x2 != 0 { 0x2 } else { 0x0 };
        cr::vcpu_set_cr2(vcpu, gpa.into_u64());
        w.virq.queue_exception(PF_VECTOR, Some(err_code));
    }
    Ok(())
}

fn wbinvd_vmexit_handler(_vcpu: &mut VCpu, w: &mut World) -> Result<(), VmError> {
    // Flush the guest's pages only; a full wbinvd on behalf of one VM would
    // penalise every core.
    let plat = w.plat;
    w.ept.walk_leaf_pages(&mut |hpa, size| {
        plat.cache_flush(plat.hpa2hva(hpa), size);
    });
    Ok(())
}

fn xsetbv_vmexit_handler(vcpu: &mut VCpu, w: &mut World) -> Result<(), VmError> {
    const XCR0_X87: u64 = 1 << 0;
    const XCR0_SSE: u64 = 1 << 1;
    const XCR0_AVX: u64 = 1 << 2;
    const XCR0_BNDREGS: u64 = 1 << 3;
    const XCR0_BNDCSR: u64 = 1 << 4;

    if vcpu.get_cr4(w.vmcs)? & Cr4::OSXSAVE.bits() == 0 {
        return Err(VmError::InvalidGuestWrite);
    }
    if vcpu.regs.rcx & 0xFFFF_FFFF != 0 {
        return Err(VmError::InvalidGuestWrite);
    }
    let value = (vcpu.regs.rdx << 32) | (vcpu.regs.rax & 0xFFFF_FFFF);
    if value & XCR0_X87 == 0 {
        return Err(VmError::InvalidGuestWrite);
    }
    let sup = w.plat.cpuid_subleaf(0xD, 0);
    let supported = ((sup.edx as u64) << 32) | sup.eax as u64;
    if value & !supported != 0 {
        return Err(VmError::InvalidGuestWrite);
    }
    // SSE must accompany AVX, and MPX is never exposed.
    if value & (XCR0_SSE | XCR0_AVX) == XCR0_AVX {
        return Err(VmError::InvalidGuestWrite);
    }
    if value & (XCR0_BNDREGS | XCR0_BNDCSR) != 0 {
        return Err(VmError::InvalidGuestWrite);
    }
    w.plat.write_xcr0(value);
    Ok(())
}

fn unexpected_vmexit_handler(vcpu: &mut VCpu, w: &mut World) -> Result<(), VmError> {
    let rip = w.vmcs.read(Field::GuestRip).unwrap_or(0);
    log::error!(
        "vcpu{}: unexpected VM exit, reason {:#x}, guest rip {:#x}",
        vcpu.vcpu_id,
        vcpu.exit_reason,
        rip
    );
    log::trace!(
        "exit qualification {:#x}",
        w.vmcs.read(Field::VmexitQualification).unwrap_or(0)
    );
    if vcpu.is_safety_vm() {
        panic!(
            "unexpected VM exit {:#x} on safety VM vcpu{}",
            vcpu.exit_reason, vcpu.vcpu_id
        );
    }
    w.life.fatal_shutdown();
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        cr::{vcpu_set_cr0, vcpu_set_cr4},
        msr::{init_msr_emulation, PAT_POWER_ON_VALUE},
        testutil::TestHarness,
        vcpu::VCpu,
        VmError,
    };
    use hvhal::msr::MSR_IA32_PAT;

    fn dispatch(vcpu: &mut VCpu, h: &mut TestHarness, reason: u64) -> Result<(), VmError> {
        h.vmcs.set(Field::VmexitReason, reason);
        let mut w = h.world();
        vmexit_handler(vcpu, &mut w)
    }

    #[test]
    fn rejects_the_wrong_physical_cpu() {
        let mut h = TestHarness::new();
        let vm = h.new_vm(false, 1);
        let mut vcpu = VCpu::new(vm, 0, h.plat.pcpu + 1);
        assert_eq!(
            dispatch(&mut vcpu, &mut h, 10),
            Err(VmError::WrongPcpu {
                expected: h.plat.pcpu + 1,
                found: h.plat.pcpu
            })
        );
    }

    #[test]
    fn rejects_out_of_range_reasons() {
        let mut h = TestHarness::new();
        let mut vcpu = h.new_vcpu(false, 1);
        assert_eq!(
            dispatch(&mut vcpu, &mut h, 100),
            Err(VmError::BadExitReason(100))
        );
    }

    #[test]
    fn cpuid_exit_rewrites_registers() {
        let mut h = TestHarness::new();
        let mut vcpu = h.new_vcpu(false, 1);
        vcpu.regs.rax = 0;
        vcpu.regs.rcx = 0;
        dispatch(&mut vcpu, &mut h, 10).unwrap();
        assert_eq!(vcpu.regs.rax, 0x16);
        assert_eq!(vcpu.regs.rbx, 0x756E_6547);
        assert_eq!(vcpu.regs.rdx, 0x4965_6E69);
        assert_eq!(vcpu.regs.rcx, 0x6C65_746E);
    }

    #[test]
    fn qualification_is_read_only_when_needed() {
        let mut h = TestHarness::new();
        let mut vcpu = h.new_vcpu(false, 1);
        h.vmcs.set(Field::VmexitQualification, 0x55);
        dispatch(&mut vcpu, &mut h, 10).unwrap();
        assert_eq!(vcpu.exit_qualification(), 0);
    }

    #[test]
    fn guest_faults_become_gp0() {
        let mut h = TestHarness::new();
        let mut vcpu = h.new_vcpu(false, 1);
        {
            let mut w = h.world();
            init_msr_emulation(&mut vcpu, &mut w).unwrap();
        }
        // WRMSR of a PAT value with an invalid memory type.
        vcpu.regs.rcx = MSR_IA32_PAT as u64;
        vcpu.regs.rax = 0x2;
        vcpu.regs.rdx = 0;
        dispatch(&mut vcpu, &mut h, 32).unwrap();
        assert_eq!(h.virq.exceptions, alloc::vec![(GP_VECTOR, Some(0))]);
        assert_eq!(vcpu.get_guest_msr(MSR_IA32_PAT), PAT_POWER_ON_VALUE);
    }

    #[test]
    fn idt_vectoring_requeues_hardware_exceptions() {
        let mut h = TestHarness::new();
        let mut vcpu = h.new_vcpu(false, 1);
        h.vmcs.set(
            Field::IdtVectoringInfo,
            (VMX_INT_INFO_VALID | VMX_INT_INFO_ERR_CODE_VALID | (VMX_INT_TYPE_HW_EXCEPTION << 8) | 14)
                as u64,
        );
        h.vmcs.set(Field::IdtVectoringErrCode, 0x2);
        dispatch(&mut vcpu, &mut h, 10).unwrap();
        assert_eq!(h.virq.exceptions, alloc::vec![(14, Some(0x2))]);
        assert_eq!(vcpu.idt_vectoring_info, 0);
    }

    #[test]
    fn idt_vectoring_requeues_nmi() {
        let mut h = TestHarness::new();
        let mut vcpu = h.new_vcpu(false, 1);
        h.vmcs.set(
            Field::IdtVectoringInfo,
            (VMX_INT_INFO_VALID | (VMX_INT_TYPE_NMI << 8) | 2) as u64,
        );
        dispatch(&mut vcpu, &mut h, 10).unwrap();
        assert_eq!(h.virq.requests, alloc::vec![VcpuRequest::Nmi]);
        assert_eq!(vcpu.idt_vectoring_info, 0);
    }

    #[test]
    fn idt_vectoring_leaves_external_interrupts_alone() {
        let mut h = TestHarness::new();
        let mut vcpu = h.new_vcpu(false, 1);
        let info = VMX_INT_INFO_VALID | 0x20;
        h.vmcs.set(Field::IdtVectoringInfo, info as u64);
        dispatch(&mut vcpu, &mut h, 10).unwrap();
        assert!(h.virq.exceptions.is_empty());
        assert!(h.virq.requests.is_empty());
        assert_eq!(vcpu.idt_vectoring_info, info);
    }

    #[test]
    fn exception_exits_delegate_to_virq() {
        let mut h = TestHarness::new();
        let mut vcpu = h.new_vcpu(false, 1);
        dispatch(&mut vcpu, &mut h, 0).unwrap();
        assert_eq!(h.virq.exception_exits, 1);
    }

    #[test]
    fn init_signal_retains_rip() {
        let mut h = TestHarness::new();
        let mut vcpu = h.new_vcpu(false, 1);
        dispatch(&mut vcpu, &mut h, 3).unwrap();
        assert!(vcpu.consume_retained_rip());
        assert!(!vcpu.consume_retained_rip());
    }

    #[test]
    fn task_switch_reflects_gp_with_selector() {
        let mut h = TestHarness::new();
        let mut vcpu = h.new_vcpu(false, 1);
        h.vmcs.set(Field::VmexitQualification, 0x1234_0055);
        dispatch(&mut vcpu, &mut h, 9).unwrap();
        assert_eq!(h.virq.exceptions, alloc::vec![(GP_VECTOR, Some(0x55))]);
    }

    #[test]
    fn invd_injects_gp() {
        let mut h = TestHarness::new();
        let mut vcpu = h.new_vcpu(false, 1);
        dispatch(&mut vcpu, &mut h, 13).unwrap();
        assert_eq!(h.virq.exceptions, alloc::vec![(GP_VECTOR, Some(0))]);
    }

    #[test]
    fn mov_dr_is_a_noop() {
        let mut h = TestHarness::new();
        let mut vcpu = h.new_vcpu(false, 1);
        dispatch(&mut vcpu, &mut h, 29).unwrap();
        assert!(h.virq.exceptions.is_empty());
        assert!(!vcpu.consume_retained_rip());
    }

    #[test]
    fn out_instruction_forwards_masked_rax() {
        let mut h = TestHarness::new();
        let mut vcpu = h.new_vcpu(false, 1);
        vcpu.regs.rax = 0x12AB;
        h.vmcs.set(Field::VmexitQualification, 0x70 << 16);
        dispatch(&mut vcpu, &mut h, 30).unwrap();
        let req = h.io.last.unwrap();
        assert_eq!(req.port, 0x70);
        assert_eq!(req.size, 1);
        assert_eq!(req.direction, PioDirection::Out);
        assert_eq!(req.value, 0xAB);
    }

    #[test]
    fn in_instruction_merges_into_rax() {
        let mut h = TestHarness::new();
        h.io.read_value = 0xCDEF;
        let mut vcpu = h.new_vcpu(false, 1);
        vcpu.regs.rax = 0xFFFF_FFFF_FFFF_0000;
        h.vmcs.set(Field::VmexitQualification, (0x71 << 16) | 0x8 | 0x1);
        dispatch(&mut vcpu, &mut h, 30).unwrap();
        assert_eq!(vcpu.regs.rax, 0xFFFF_FFFF_FFFF_CDEF);
        let req = h.io.last.unwrap();
        assert_eq!((req.port, req.size, req.direction), (0x71, 2, PioDirection::In));
    }

    #[test]
    fn ept_fetch_violation_grants_exec_and_reenters() {
        let mut h = TestHarness::new();
        let mut vcpu = h.new_vcpu(false, 1);
        h.vmcs.set(Field::GuestPhysicalAddr, 0x2345);
        h.vmcs.set(Field::VmexitQualification, 0x4);
        dispatch(&mut vcpu, &mut h, 48).unwrap();
        assert_eq!(h.ept.exec_grants, alloc::vec![0x2000]);
        assert!(h.virq.requests.contains(&VcpuRequest::EptFlush));
        assert!(vcpu.consume_retained_rip());
    }

    #[test]
    fn ept_data_violation_reflects_page_fault() {
        let mut h = TestHarness::new();
        let mut vcpu = h.new_vcpu(false, 1);
        h.vmcs.set(Field::GuestPhysicalAddr, 0x2345);
        h.vmcs.set(Field::VmexitQualification, 0x2);
        dispatch(&mut vcpu, &mut h, 48).unwrap();
        assert_eq!(h.virq.exceptions, alloc::vec![(PF_VECTOR, Some(0x2))]);
        assert_eq!(vcpu.get_cr2(), 0x2345);
        assert!(h.ept.exec_grants.is_empty());
    }

    #[test]
    fn wbinvd_flushes_every_leaf_page() {
        let mut h = TestHarness::new();
        h.ept.leaf_pages = alloc::vec![(0x10000, 0x1000), (0x30000, 0x200000)];
        let mut vcpu = h.new_vcpu(false, 1);
        dispatch(&mut vcpu, &mut h, 54).unwrap();
        assert_eq!(
            *h.plat.flushed.borrow(),
            alloc::vec![(0x10000, 0x1000), (0x30000, 0x200000)]
        );
    }

    #[test]
    fn xsetbv_programs_xcr0() {
        let mut h = TestHarness::new();
        let mut vcpu = h.new_vcpu(false, 1);
        {
            let mut w = h.world();
            vcpu_set_cr4(&mut vcpu, &mut w, Cr4::OSXSAVE.bits(), true).unwrap();
        }
        vcpu.regs.rcx = 0;
        vcpu.regs.rax = 0x7;
        vcpu.regs.rdx = 0;
        dispatch(&mut vcpu, &mut h, 55).unwrap();
        assert_eq!(h.plat.xcr0.get(), 0x7);
        assert!(h.virq.exceptions.is_empty());
    }

    #[test]
    fn xsetbv_validation() {
        let mut h = TestHarness::new();
        let mut vcpu = h.new_vcpu(false, 1);
        let mut w = h.world();
        vcpu.regs.rcx = 0;
        vcpu.regs.rax = 0x7;
        vcpu.regs.rdx = 0;
        // CR4.OSXSAVE required.
        vcpu_set_cr0(&mut vcpu, &mut w, 0x11, true).unwrap();
        vcpu_set_cr4(&mut vcpu, &mut w, 0, true).unwrap();
        assert_eq!(
            xsetbv_vmexit_handler(&mut vcpu, &mut w),
            Err(VmError::InvalidGuestWrite)
        );

        vcpu_set_cr4(&mut vcpu, &mut w, Cr4::OSXSAVE.bits(), true).unwrap();
        for (rcx, value) in [
            (0x1u64, 0x7u64),  // ECX must be zero
            (0, 0x6),          // x87 cannot be cleared
            (0, 0x5),          // AVX without SSE
            (0, 0x19),         // MPX state
            (0, 0x207),        // reserved bit
        ] {
            vcpu.regs.rcx = rcx;
            vcpu.regs.rax = value & 0xFFFF_FFFF;
            vcpu.regs.rdx = value >> 32;
            assert_eq!(
                xsetbv_vmexit_handler(&mut vcpu, &mut w),
                Err(VmError::InvalidGuestWrite),
                "rcx={rcx:#x} value={value:#x}"
            );
        }
    }

    #[test]
    fn unexpected_exit_shuts_down_a_normal_vm() {
        let mut h = TestHarness::new();
        let mut vcpu = h.new_vcpu(false, 1);
        // MONITOR exit.
        dispatch(&mut vcpu, &mut h, 39).unwrap();
        assert_eq!(h.life.shutdowns, 1);
    }

    #[test]
    #[should_panic(expected = "unexpected VM exit")]
    fn unexpected_exit_panics_a_safety_vm() {
        let mut h = TestHarness::new();
        let mut vcpu = h.new_vcpu(true, 1);
        let _ = dispatch(&mut vcpu, &mut h, 39);
    }

    #[test]
    fn high_reason_bits_do_not_change_routing() {
        let mut h = TestHarness::new();
        let mut vcpu = h.new_vcpu(false, 1);
        vcpu.regs.rax = 0;
        // Entry-failure flag set in the upper half of the reason.
        dispatch(&mut vcpu, &mut h, 0x8000_0000 | 10).unwrap();
        assert_eq!(vcpu.exit_reason(), 0x8000_000A);
        assert_eq!(vcpu.regs.rax, 0x16);
    }
}
