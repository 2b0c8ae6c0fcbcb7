//! Guest-instruction virtualization core.
//!
//! A VMX guest cannot be allowed to execute every privileged or sensitive
//! instruction directly: `cpuid`, MSR accesses, control-register writes and a
//! tail of rarer instructions trap to the hypervisor, which emulates them
//! against per-vCPU virtual machine state and resumes the guest. This crate
//! is that trap-and-emulate core:
//!
//! - [`vmexit`] routes every basic VM-exit reason to a handler and performs
//!   IDT-vectoring re-injection.
//! - [`cpuid`] precomputes the per-VM virtual CPUID table and emulates the
//!   per-vCPU leaves at exit time.
//! - [`msr`] owns the per-vCPU MSR intercept bitmap and emulates intercepted
//!   reads and writes.
//! - [`cr`] validates guest CR0/CR4 writes and synthesises the mode-switch
//!   side effects.
//! - [`mem`] copies between guest-physical space and hypervisor memory under
//!   SMAP discipline.
//!
//! The surrounding machinery (virtual LAPIC, EPT maintenance, port-I/O
//! devices, the entry loop itself) stays outside; the core reaches it through
//! the traits in [`world`].
//!
//! One vCPU is pinned to one physical CPU for its lifetime; every handler
//! here runs to completion on the exiting CPU, so per-vCPU state needs no
//! locking and the per-VM CPUID table is immutable after construction.

#![no_std]

extern crate alloc;

pub mod cpuid;
pub mod cr;
pub mod mem;
pub mod msr;
pub mod vcpu;
pub mod vm;
pub mod vm_control;
pub mod vmcs;
pub mod vmexit;
pub mod world;

#[cfg(test)]
pub(crate) mod testutil;

pub use vmcs::InstructionError;

/// Possible errors of the virtualization core.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VmError {
    /// A vmread/vmwrite on the working VMCS failed.
    VmxOperationError(InstructionError),
    /// Guest wrote a value that architecture or policy forbids.
    ///
    /// The dispatcher turns this into `#GP(0)` in the guest.
    InvalidGuestWrite,
    /// Guest attempted an illegal mode transition.
    ///
    /// The dispatcher turns this into `#GP(0)` in the guest.
    InvalidGuestState,
    /// A guest-physical address had no mapping during emulation.
    ///
    /// The dispatcher turns this into `#GP(0)` in the guest.
    MemoryFault(u64),
    /// The virtual CPUID table overflowed while being populated.
    TooManyCpuidEntries,
    /// A vCPU exited on a physical CPU it is not pinned to.
    WrongPcpu {
        /// The pinned physical CPU.
        expected: u32,
        /// The CPU the exit was observed on.
        found: u32,
    },
    /// The basic exit reason is outside the dispatch table.
    BadExitReason(u32),
    /// A CR-access qualification the core does not emulate.
    UnhandledCrAccess(u64),
}

impl VmError {
    /// Whether this error is a guest fault to be reflected as `#GP(0)`,
    /// as opposed to a hypervisor-fatal condition.
    pub fn is_guest_fault(&self) -> bool {
        matches!(
            self,
            VmError::InvalidGuestWrite | VmError::InvalidGuestState | VmError::MemoryFault(_)
        )
    }
}
