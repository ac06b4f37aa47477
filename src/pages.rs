use core::ptr::NonNull;

use bmalloc_sys::{
  GLOBAL_SYSTEM,
  prim::page_align,
};

use crate::{
  AllocError,
  AllocResult,
};

/// Zeroes `[start, end)` of the block at `addr`.
pub(crate) unsafe fn cleanse(addr: NonNull<u8>, start: usize, end: usize) {
  debug_assert!(start <= end);
  unsafe { core::ptr::write_bytes(addr.as_ptr().add(start), 0, end - start) };
}

/// Maps enough whole pages for `nbytes`. The system may hand back an address
/// it unmapped moments ago, so `clean` zeroes the mapping explicitly.
pub(crate) fn map_pages(nbytes: usize, clean: bool) -> AllocResult<NonNull<u8>> {
  let size = page_align(nbytes).map_err(|_| AllocError::OutOfMemory)?;
  let addr = unsafe { GLOBAL_SYSTEM.map(size) }.map_err(|err| {
    log::error!("map of {size} bytes failed: {err:?}");
    AllocError::OutOfMemory
  })?;
  if clean {
    unsafe { cleanse(addr, 0, size) };
  }
  Ok(addr)
}

/// Returns the whole pages backing `nbytes` to the system.
///
/// # Safety
///
/// `addr` must be a mapping obtained from [`map_pages`] (or [`remap_pages`])
/// whose length rounds to the same page count as `nbytes`.
pub(crate) unsafe fn unmap_pages(addr: NonNull<u8>, nbytes: usize) {
  let Ok(size) = page_align(nbytes) else {
    log::error!("unmap of {:p}: size {nbytes} overflows", addr.as_ptr());
    return;
  };
  if let Err(err) = unsafe { GLOBAL_SYSTEM.unmap(addr, size) } {
    log::error!("unmap of {size} bytes at {:p} failed: {err:?}", addr.as_ptr());
  }
}

/// Resizes a direct mapping, rounding both byte counts to whole pages.
///
/// Equal rounded sizes are a no-op apart from zeroing the grown tail when
/// `clean`. A grow may move the mapping and fails with OutOfMemory. A shrink
/// never moves and never zeroes; if the system refuses it, the old mapping
/// stays in place and the old address is returned.
///
/// # Safety
///
/// `addr`/`old_nbytes` must describe a live mapping as for [`unmap_pages`].
pub(crate) unsafe fn remap_pages(
  addr: NonNull<u8>,
  old_nbytes: usize,
  new_nbytes: usize,
  clean: bool,
) -> AllocResult<NonNull<u8>> {
  let old_size = page_align(old_nbytes).map_err(|_| AllocError::OutOfMemory)?;
  let new_size = page_align(new_nbytes).map_err(|_| AllocError::OutOfMemory)?;

  if new_size == old_size {
    if clean && new_nbytes > old_nbytes {
      unsafe { cleanse(addr, old_nbytes, new_nbytes) };
    }
    return Ok(addr);
  }

  if new_size > old_size {
    let fresh = unsafe { GLOBAL_SYSTEM.remap(addr, old_size, new_size, true) }.map_err(|err| {
      log::error!(
        "remap of {:p} from {old_size} to {new_size} failed: {err:?}",
        addr.as_ptr()
      );
      AllocError::OutOfMemory
    })?;
    if clean {
      unsafe { cleanse(fresh, old_nbytes, new_nbytes) };
    }
    return Ok(fresh);
  }

  match unsafe { GLOBAL_SYSTEM.remap(addr, old_size, new_size, false) } {
    Ok(shrunk) => Ok(shrunk),
    Err(err) => {
      log::error!(
        "remap of {:p} from {old_size} to {new_size} failed: {err:?}",
        addr.as_ptr()
      );
      Ok(addr)
    }
  }
}
