//! Virtual-Machine Control State (VMCS) field access.
//!
//! The emulation code reads and writes the working VMCS through the
//! [`VmcsAccess`] trait; [`ActiveVmcs`] is the hardware backend speaking
//! `vmread`/`vmwrite`. Tests substitute an in-memory table.
//!
//! ## Details
//! See Intel® 64 and IA-32 Architectures Software Developer’s Manual,
//! 24.11.2 VMREAD, VMWRITE, and Encodings of VMCS Fields.

use crate::VmError;
use core::arch::asm;

/// Vmcs field.
///
/// Only the fields the emulation core touches are enumerated.
#[allow(missing_docs)]
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Field {
    // 64bit fields
    MsrBitmaps = 0x00002004,
    VmexitMsrStoreAddr = 0x00002006,
    VmexitMsrLoadAddr = 0x00002008,
    VmentryMsrLoadAddr = 0x0000200A,
    TscOffset = 0x00002010,
    GuestPhysicalAddr = 0x00002400,
    GuestIa32Pat = 0x00002804,
    GuestIa32Efer = 0x00002806,
    GuestIa32Pdpte0 = 0x0000280A,
    GuestIa32Pdpte1 = 0x0000280C,
    GuestIa32Pdpte2 = 0x0000280E,
    GuestIa32Pdpte3 = 0x00002810,
    // 32bit fields
    ProcessorBasedVmexecControls = 0x00004002,
    VmexitMsrStoreCount = 0x0000400E,
    VmexitMsrLoadCount = 0x00004010,
    VmentryControls = 0x00004012,
    VmentryMsrLoadCount = 0x00004014,
    InstructionError = 0x00004400,
    VmexitReason = 0x00004402,
    IdtVectoringInfo = 0x00004408,
    IdtVectoringErrCode = 0x0000440A,
    GuestCsAccessRights = 0x00004816,
    GuestTrAccessRights = 0x00004822,
    // Natural-width fields
    Cr0GuestHostMask = 0x00006000,
    Cr4GuestHostMask = 0x00006002,
    Cr0ReadShadow = 0x00006004,
    Cr4ReadShadow = 0x00006006,
    VmexitQualification = 0x00006400,
    GuestCr0 = 0x00006800,
    GuestCr3 = 0x00006802,
    GuestCr4 = 0x00006804,
    GuestRip = 0x0000681E,
}

/// Possible errors for vm-related instructions.
///
/// # Details
/// See Intel® 64 and IA-32 Architectures Software Developer’s Manual,
/// Table 30-1. VM-Instruction Error Numbers.
#[derive(Debug, Eq, PartialEq, Ord, PartialOrd, Clone, Copy)]
pub enum InstructionError {
    /// VMREAD/VMWRITE from/to unsupported VMCS component
    UnsupportedVmcsField,
    /// VMWRITE to read-only VMCS component
    WriteToRoField,
    /// VM entry with invalid control field(s)
    InvalidControlField,
    /// VM entry with invalid host-state field(s)
    InvalidHostState,
    /// Unknown error.
    Unknown,
}

/// Read and write access to the working VMCS of the current physical CPU.
pub trait VmcsAccess {
    /// Read from the vmcs field.
    fn read(&self, field: Field) -> Result<u64, VmError>;
    /// Write to the vmcs field.
    fn write(&mut self, field: Field, v: u64) -> Result<(), VmError>;
}

/// The hardware VMCS that is current on this physical CPU.
///
/// The entry loop makes a VMCS current with `vmptrld` before dispatching an
/// exit; everything here operates on that implicit current VMCS.
pub struct ActiveVmcs {
    _p: (),
}

impl ActiveVmcs {
    /// Get a handle to the current VMCS.
    ///
    /// # Safety
    /// A VMCS must have been made current on this physical CPU and must stay
    /// current for the lifetime of the handle.
    pub unsafe fn current() -> Self {
        Self { _p: () }
    }

    fn instruction_error() -> InstructionError {
        unsafe {
            let err: i8;
            let v: u64;
            asm!(
                "clc",
                "vmread {}, {}",
                "setna {}",
                out(reg) v,
                in(reg) Field::InstructionError as u64,
                out(reg_byte) err
            );
            if err != 0 {
                InstructionError::Unknown
            } else {
                match v {
                    7 => InstructionError::InvalidControlField,
                    8 => InstructionError::InvalidHostState,
                    12 => InstructionError::UnsupportedVmcsField,
                    13 => InstructionError::WriteToRoField,
                    _ => InstructionError::Unknown,
                }
            }
        }
    }
}

impl VmcsAccess for ActiveVmcs {
    fn read(&self, field: Field) -> Result<u64, VmError> {
        unsafe {
            let err: i8;
            let v: u64;
            asm!(
                "clc",
                "vmread {}, {}",
                "setna {}",
                out(reg) v,
                in(reg) field as u64,
                out(reg_byte) err
            );
            if err != 0 {
                Err(VmError::VmxOperationError(Self::instruction_error()))
            } else {
                Ok(v)
            }
        }
    }

    fn write(&mut self, field: Field, v: u64) -> Result<(), VmError> {
        unsafe {
            let err: i8;
            asm!(
                "clc",
                "vmwrite {}, {}",
                "setna {}",
                in(reg) field as u64,
                in(reg) v,
                out(reg_byte) err
            );
            if err != 0 {
                Err(VmError::VmxOperationError(Self::instruction_error()))
            } else {
                Ok(())
            }
        }
    }
}
