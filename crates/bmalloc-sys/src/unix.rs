#[cfg(any(target_os = "linux", target_os = "macos"))]
use core::ptr::NonNull;

#[cfg(any(target_os = "linux", target_os = "macos"))]
use crate::{
  prim::is_page_aligned,
  system::{
    SysError,
    SysResult,
    System,
  },
};

pub struct UnixSystem {}

#[cfg(any(target_os = "linux", target_os = "macos"))]
pub static UNIX_SYSTEM: UnixSystem = UnixSystem {};

#[cfg(any(target_os = "linux", target_os = "macos"))]
impl UnixSystem {
  const fn prot() -> i32 {
    libc::PROT_READ | libc::PROT_WRITE
  }

  const fn flags() -> i32 {
    libc::MAP_PRIVATE | libc::MAP_ANONYMOUS
  }

  const fn as_c(addr: NonNull<u8>) -> *mut libc::c_void {
    addr.as_ptr() as *mut libc::c_void
  }

  fn check_sizes(old_size: usize, new_size: usize) -> SysResult<()> {
    if old_size == 0 || new_size == 0 {
      return Err(SysError::InvalidArgument);
    }
    if !is_page_aligned(old_size) || !is_page_aligned(new_size) {
      return Err(SysError::InvalidArgument);
    }
    Ok(())
  }
}

#[cfg(any(target_os = "linux", target_os = "macos"))]
unsafe impl System for UnixSystem {
  unsafe fn map(&self, size: usize) -> SysResult<NonNull<u8>> {
    if size == 0 || !is_page_aligned(size) {
      return Err(SysError::InvalidArgument);
    }

    let ptr = unsafe {
      libc::mmap(core::ptr::null_mut(), size, Self::prot(), Self::flags(), -1, 0)
    };
    if ptr == libc::MAP_FAILED {
      return Err(SysError::OutOfMemory);
    }
    NonNull::new(ptr as *mut u8).ok_or(SysError::OutOfMemory)
  }

  unsafe fn unmap(&self, addr: NonNull<u8>, size: usize) -> SysResult<()> {
    let result = unsafe { libc::munmap(Self::as_c(addr), size) };
    if result == 0 {
      return Ok(());
    }

    Err(SysError::InvalidArgument)
  }

  #[cfg(target_os = "linux")]
  unsafe fn remap(
    &self,
    addr: NonNull<u8>,
    old_size: usize,
    new_size: usize,
    may_move: bool,
  ) -> SysResult<NonNull<u8>> {
    Self::check_sizes(old_size, new_size)?;

    let flags = if may_move { libc::MREMAP_MAYMOVE } else { 0 };
    let ptr = unsafe { libc::mremap(Self::as_c(addr), old_size, new_size, flags) };
    if ptr == libc::MAP_FAILED {
      return Err(SysError::OutOfMemory);
    }
    NonNull::new(ptr as *mut u8).ok_or(SysError::OutOfMemory)
  }

  // No mremap on macOS: shrink by unmapping the tail, grow by map-copy-unmap.
  #[cfg(target_os = "macos")]
  unsafe fn remap(
    &self,
    addr: NonNull<u8>,
    old_size: usize,
    new_size: usize,
    may_move: bool,
  ) -> SysResult<NonNull<u8>> {
    Self::check_sizes(old_size, new_size)?;

    if new_size == old_size {
      return Ok(addr);
    }

    if new_size < old_size {
      let tail = unsafe { NonNull::new_unchecked(addr.as_ptr().add(new_size)) };
      unsafe { self.unmap(tail, old_size - new_size) }?;
      return Ok(addr);
    }

    if !may_move {
      return Err(SysError::Unsupported);
    }
    let fresh = unsafe { self.map(new_size) }?;
    unsafe {
      core::ptr::copy_nonoverlapping(addr.as_ptr(), fresh.as_ptr(), old_size);
      self.unmap(addr, old_size)?;
    }
    Ok(fresh)
  }
}

#[cfg(all(test, any(target_os = "linux", target_os = "macos")))]
mod tests {
  use super::*;
  use crate::prim::page_size;

  #[test]
  fn test_map_unmap() {
    let ps = page_size();
    let addr = unsafe { UNIX_SYSTEM.map(ps) }.unwrap();
    unsafe {
      addr.as_ptr().write(0xA5);
      assert_eq!(addr.as_ptr().read(), 0xA5);
      UNIX_SYSTEM.unmap(addr, ps).unwrap();
    }
  }

  #[test]
  fn test_map_rejects_unaligned() {
    assert!(matches!(
      unsafe { UNIX_SYSTEM.map(3) },
      Err(SysError::InvalidArgument)
    ));
    assert!(matches!(
      unsafe { UNIX_SYSTEM.map(0) },
      Err(SysError::InvalidArgument)
    ));
  }

  #[test]
  fn test_remap_grow_preserves_contents() {
    let ps = page_size();
    let addr = unsafe { UNIX_SYSTEM.map(ps) }.unwrap();
    unsafe {
      for i in 0..ps {
        addr.as_ptr().add(i).write((i % 251) as u8);
      }
      let grown = UNIX_SYSTEM.remap(addr, ps, ps * 4, true).unwrap();
      for i in 0..ps {
        assert_eq!(grown.as_ptr().add(i).read(), (i % 251) as u8);
      }
      UNIX_SYSTEM.unmap(grown, ps * 4).unwrap();
    }
  }

  #[test]
  fn test_remap_shrink_keeps_address() {
    let ps = page_size();
    let addr = unsafe { UNIX_SYSTEM.map(ps * 4) }.unwrap();
    unsafe {
      addr.as_ptr().write(7);
      let shrunk = UNIX_SYSTEM.remap(addr, ps * 4, ps, false).unwrap();
      assert_eq!(shrunk, addr);
      assert_eq!(shrunk.as_ptr().read(), 7);
      UNIX_SYSTEM.unmap(shrunk, ps).unwrap();
    }
  }
}
