//! Virtual machine state shared by its vCPUs.

use crate::{cpuid::CpuidEntry, cr::VmxCaps, world::Platform, VmError};
use alloc::{sync::Arc, vec::Vec};
use core::sync::atomic::{AtomicU8, Ordering};

/// Guest physical address.
#[repr(transparent)]
#[derive(Clone, Copy, Eq, PartialEq, PartialOrd, Ord)]
pub struct Gpa(u64);

impl Gpa {
    /// Create a new guest physical address.
    #[inline]
    pub const fn new(addr: u64) -> Self {
        Self(addr)
    }

    /// Cast into u64.
    #[inline]
    pub const fn into_u64(self) -> u64 {
        self.0
    }
}

impl core::ops::Add<u64> for Gpa {
    type Output = Self;

    fn add(self, other: u64) -> Self::Output {
        Self(self.0 + other)
    }
}

impl core::ops::BitAnd<u64> for Gpa {
    type Output = Self;

    fn bitand(self, other: u64) -> Self {
        Self(self.0 & other)
    }
}

impl core::fmt::Debug for Gpa {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "Gpa(0x{:x})", self.0)
    }
}

/// Static per-VM configuration, fixed at boot.
#[derive(Debug, Clone, Copy)]
pub struct VmConfig {
    /// Number of vCPUs this VM is created with.
    pub vcpu_num: u16,
    /// Safety-critical VM: exposes MCA and panics the physical CPU on
    /// unexpected exits instead of shutting the guest down.
    pub is_safety_vm: bool,
}

/// The virtual machine.
///
/// Shared by every vCPU of the guest; everything here is immutable after
/// construction except the vRTC index latch, which is a single byte.
pub struct Vm {
    config: VmConfig,
    caps: VmxCaps,
    /// Highest basic CPUID input EAX supported by the virtual processor.
    pub(crate) vcpuid_level: u32,
    /// Highest extended CPUID input EAX supported.
    pub(crate) vcpuid_xlevel: u32,
    /// Virtual CPUID table, sorted ascending by `(leaf, subleaf)`.
    pub(crate) vcpuid_entries: Vec<CpuidEntry>,
    /// Last write to the RTC address port.
    vrtc_offset: AtomicU8,
}

impl Vm {
    /// Create a VM and populate its virtual CPUID table.
    ///
    /// Must run after physical-CPU topology is known; the table is derived
    /// from the processor this constructor executes on and never changes
    /// afterwards.
    pub fn new(
        config: VmConfig,
        caps: &VmxCaps,
        plat: &dyn Platform,
    ) -> Result<Arc<Self>, VmError> {
        let table = crate::cpuid::build_vcpuid_entries(plat)?;
        Ok(Arc::new(Self {
            config,
            caps: *caps,
            vcpuid_level: table.level,
            vcpuid_xlevel: table.xlevel,
            vcpuid_entries: table.entries,
            vrtc_offset: AtomicU8::new(0),
        }))
    }

    /// Whether this VM is marked safety-critical.
    #[inline]
    pub fn is_safety_vm(&self) -> bool {
        self.config.is_safety_vm
    }

    /// Number of vCPUs this VM was created with.
    #[inline]
    pub fn created_vcpus(&self) -> u16 {
        self.config.vcpu_num
    }

    /// The boot-time VMX capability snapshot.
    #[inline]
    pub fn caps(&self) -> &VmxCaps {
        &self.caps
    }

    /// Latch a write to the RTC address port.
    #[inline]
    pub fn set_vrtc_offset(&self, index: u8) {
        self.vrtc_offset.store(index & 0x7F, Ordering::Relaxed);
    }

    /// The last RTC address-port write.
    #[inline]
    pub fn vrtc_offset(&self) -> u8 {
        self.vrtc_offset.load(Ordering::Relaxed)
    }
}
