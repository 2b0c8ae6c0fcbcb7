//! Copies between guest-physical address space and hypervisor memory.
//!
//! Guest pages are user mappings from the hypervisor's point of view, so
//! every touch happens inside an SMAP window that is guaranteed to close on
//! all exit paths. Copies proceed at most one page per iteration because
//! contiguity in guest-physical space says nothing about host-physical
//! contiguity.

use crate::{
    vm::Gpa,
    world::{Platform, World},
    VmError,
};
use hvhal::addressing::{PAGE_MASK, PAGE_SIZE};

/// Scoped SMAP suspension; `stac` on construction, `clac` on drop.
struct UserAccessGuard<'a> {
    plat: &'a dyn Platform,
}

impl<'a> UserAccessGuard<'a> {
    fn new(plat: &'a dyn Platform) -> Self {
        plat.enable_user_access();
        Self { plat }
    }
}

impl Drop for UserAccessGuard<'_> {
    fn drop(&mut self) {
        self.plat.disable_user_access();
    }
}

/// Copy `dst.len()` bytes from guest-physical `gpa` into `dst`.
///
/// Fails with [`VmError::MemoryFault`] on the first unmapped page; earlier
/// pages may already have been copied.
pub fn copy_from_gpa(w: &World, dst: &mut [u8], gpa: Gpa) -> Result<(), VmError> {
    let mut copied = 0;
    while copied < dst.len() {
        let cur = gpa + copied as u64;
        let hva = w
            .pages
            .gpa2hva(cur)
            .ok_or(VmError::MemoryFault(cur.into_u64()))?;
        let offset = cur.into_u64() as usize & PAGE_MASK;
        let len = (PAGE_SIZE - offset).min(dst.len() - copied);
        let _window = UserAccessGuard::new(w.plat);
        unsafe {
            core::ptr::copy_nonoverlapping(
                hva.into_usize() as *const u8,
                dst[copied..].as_mut_ptr(),
                len,
            );
        }
        copied += len;
    }
    Ok(())
}

/// Copy `src` to guest-physical `gpa`.
///
/// Fails with [`VmError::MemoryFault`] on the first unmapped page; earlier
/// pages may already have been written.
pub fn copy_to_gpa(w: &World, src: &[u8], gpa: Gpa) -> Result<(), VmError> {
    let mut copied = 0;
    while copied < src.len() {
        let cur = gpa + copied as u64;
        let hva = w
            .pages
            .gpa2hva(cur)
            .ok_or(VmError::MemoryFault(cur.into_u64()))?;
        let offset = cur.into_u64() as usize & PAGE_MASK;
        let len = (PAGE_SIZE - offset).min(src.len() - copied);
        let _window = UserAccessGuard::new(w.plat);
        unsafe {
            core::ptr::copy_nonoverlapping(
                src[copied..].as_ptr(),
                hva.into_usize() as *mut u8,
                len,
            );
        }
        copied += len;
    }
    Ok(())
}
