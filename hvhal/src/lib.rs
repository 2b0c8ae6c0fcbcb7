//! Bare-metal x86-64 support layer for the hypervisor.
//!
//! This crate carries the pieces of the architecture that the
//! virtualization core consumes but that are not themselves part of the
//! VMX machinery: model-specific register access, `cpuid` and `rdtsc`
//! intrinsics, control-register bit definitions, physical/virtual address
//! newtypes and the SMAP access primitives.
//!
//! Nothing in this crate knows about VMCSs, vCPUs or guests.

#![no_std]

pub mod addressing;
pub mod intrinsics;
pub mod msr;
pub mod reg;
