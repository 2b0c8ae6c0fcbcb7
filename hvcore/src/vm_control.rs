//! VM-execution and VM-entry control bits the emulation core depends on.

bitflags::bitflags! {
    /// Primary processor-based VM-execution controls.
    ///
    /// See SDM Table 24-6. Definitions of Primary Processor-Based
    /// VM-Execution Controls. Only the bits this crate reads, writes or
    /// assumes are listed; the entry loop owns the rest of the word.
    /// [`crate::msr::init_msr_emulation`] checks the word before installing
    /// the MSR bitmap.
    pub struct VmcsProcBasedVmexecCtl: u32 {
        /// Executions of RDTSC, RDTSCP, and RDMSR of IA32_TIME_STAMP_COUNTER
        /// return a value modified by the TSC offset field.
        const USETSCOFF = 1 << 3;
        /// Executions of MOV DR cause VM exits.
        const MOVDREXIT = 1 << 23;
        /// Executions of I/O instructions cause VM exits.
        const UNCONDIOEXIT = 1 << 24;
        /// MSR bitmaps control executions of RDMSR and WRMSR; without this,
        /// every guest MSR access exits.
        const USEMSRBMP = 1 << 28;
        /// The secondary processor-based VM-execution controls are used.
        const ACTIVATE_SECONDARY_CTL = 1 << 31;
    }
}

bitflags::bitflags! {
    /// VM-entry controls.
    ///
    /// See SDM Table 24-15. Definitions of VM-Entry Controls.
    pub struct VmcsEntryCtl: u32 {
        /// The logical processor is in IA-32e mode after VM entry. Its value
        /// is loaded into IA32_EFER.LMA as part of VM entry.
        const IA32E_MODE_GUEST = 1 << 9;
        /// The IA32_PAT MSR is loaded on VM entry.
        const LOAD_IA32_PAT = 1 << 14;
        /// The IA32_EFER MSR is loaded on VM entry.
        const LOAD_IA32_EFER = 1 << 15;
    }
}
