use core::{
  alloc::{
    GlobalAlloc,
    Layout,
  },
  ptr::NonNull,
};

use crate::{
  Allocator,
  BITMAP,
  UNIT_SIZE,
};

/// Routes Rust's global allocation interface into the process-wide bitmap
/// allocator. `dealloc` and `realloc` hand the layout back, which supplies
/// the caller-tracked sizes the allocator requires.
///
/// Small blocks are unit-aligned and large blocks page-aligned, so layouts
/// demanding more than [`UNIT_SIZE`] alignment are refused.
///
/// ```ignore
/// #[global_allocator]
/// static GLOBAL: bmalloc::GlobalBitmap = bmalloc::GlobalBitmap;
/// ```
pub struct GlobalBitmap;

unsafe impl GlobalAlloc for GlobalBitmap {
  unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
    if layout.align() > UNIT_SIZE {
      return core::ptr::null_mut();
    }
    match BITMAP.allocate(layout.size(), false) {
      Ok(Some(block)) => block.as_ptr(),
      // zero-size allocations get a dangling, well-aligned address
      Ok(None) => layout.align() as *mut u8,
      Err(_) => core::ptr::null_mut(),
    }
  }

  unsafe fn alloc_zeroed(&self, layout: Layout) -> *mut u8 {
    if layout.align() > UNIT_SIZE {
      return core::ptr::null_mut();
    }
    match BITMAP.allocate(layout.size(), true) {
      Ok(Some(block)) => block.as_ptr(),
      Ok(None) => layout.align() as *mut u8,
      Err(_) => core::ptr::null_mut(),
    }
  }

  unsafe fn dealloc(&self, ptr: *mut u8, layout: Layout) {
    if layout.size() == 0 {
      return;
    }
    let mut addr = NonNull::new(ptr);
    BITMAP.release(&mut addr, layout.size());
  }

  unsafe fn realloc(&self, ptr: *mut u8, layout: Layout, new_size: usize) -> *mut u8 {
    if layout.align() > UNIT_SIZE {
      return core::ptr::null_mut();
    }
    if layout.size() == 0 {
      return match Layout::from_size_align(new_size, layout.align()) {
        Ok(new_layout) => unsafe { self.alloc(new_layout) },
        Err(_) => core::ptr::null_mut(),
      };
    }

    let mut addr = NonNull::new(ptr);
    match BITMAP.reallocate(&mut addr, layout.size(), new_size, false) {
      Ok(_) => addr.map_or(core::ptr::null_mut(), |block| block.as_ptr()),
      Err(_) => core::ptr::null_mut(),
    }
  }
}
