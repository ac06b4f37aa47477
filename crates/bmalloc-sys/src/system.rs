use core::ptr::NonNull;

#[cfg(any(target_os = "linux", target_os = "macos"))]
use crate::unix::UNIX_SYSTEM;

#[derive(Debug)]
pub enum SysError {
  Unsupported,
  OutOfMemory,
  InvalidArgument,
}

pub type SysResult<T> = Result<T, SysError>;

/// Anonymous read-write memory obtained from the operating system.
///
/// # Safety
///
/// Implementors must ensure that:
/// - `map` returns valid, page-aligned memory of at least `size` bytes
/// - `unmap` and `remap` only operate on memory previously mapped by this
///   system, with the exact mapped length
/// - memory is not accessed after `unmap`, nor through a stale address after
///   a `remap` that moved the mapping
pub unsafe trait System
where
  Self: Send + Sync,
{
  /// Maps `size` bytes of anonymous memory.
  ///
  /// # Safety
  ///
  /// Caller must ensure `size` is page-aligned and nonzero.
  unsafe fn map(&self, size: usize) -> SysResult<NonNull<u8>> {
    _ = size;
    Err(SysError::Unsupported)
  }

  /// Returns a mapping to the system.
  ///
  /// # Safety
  ///
  /// Caller must ensure `addr`/`size` describe a live mapping obtained from
  /// this system and that it is not accessed afterwards.
  unsafe fn unmap(&self, addr: NonNull<u8>, size: usize) -> SysResult<()> {
    _ = (addr, size);
    Err(SysError::Unsupported)
  }

  /// Resizes a mapping. Growing requires `may_move`; the mapping may then
  /// relocate and the old address becomes invalid. Shrinking keeps the
  /// address. Bytes uncovered by a shrink are gone; bytes gained by a grow
  /// have unspecified contents.
  ///
  /// # Safety
  ///
  /// Caller must ensure `addr`/`old_size` describe a live mapping from this
  /// system and both sizes are page-aligned and nonzero.
  unsafe fn remap(
    &self,
    addr: NonNull<u8>,
    old_size: usize,
    new_size: usize,
    may_move: bool,
  ) -> SysResult<NonNull<u8>> {
    _ = (addr, old_size, new_size, may_move);
    Err(SysError::Unsupported)
  }
}

pub struct UnsupportedSystem {}
unsafe impl System for UnsupportedSystem {}

#[cfg(any(target_os = "linux", target_os = "macos"))]
pub static GLOBAL_SYSTEM: &dyn System = &UNIX_SYSTEM;

#[cfg(not(any(target_os = "linux", target_os = "macos")))]
pub static GLOBAL_SYSTEM: &dyn System = &UnsupportedSystem {};
