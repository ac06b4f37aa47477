use core::ptr::NonNull;

use crate::{
  Addr,
  AllocError,
  AllocResult,
  Allocator,
  AllocatorStats,
};

/// The host allocator behind the same interface: `malloc`/`calloc` for
/// allocate, `realloc` for reallocate, `free` for release. The caller still
/// supplies sizes even though the host tracks them itself, so the contract
/// is interchangeable with the bitmap allocator's.
pub struct StdAllocator {
  stats: AllocatorStats,
}

impl StdAllocator {
  pub const fn new() -> Self {
    Self {
      stats: AllocatorStats::new(),
    }
  }

  fn host_allocate(nbytes: usize, clean: bool) -> Option<NonNull<u8>> {
    let raw = if clean {
      unsafe { libc::calloc(1, nbytes) }
    } else {
      unsafe { libc::malloc(nbytes) }
    };
    NonNull::new(raw as *mut u8)
  }
}

impl Default for StdAllocator {
  fn default() -> Self {
    Self::new()
  }
}

impl Allocator for StdAllocator {
  fn allocate(&self, nbytes: usize, clean: bool) -> AllocResult<Addr> {
    if nbytes == 0 {
      return Ok(None);
    }
    match Self::host_allocate(nbytes, clean) {
      Some(block) => {
        self.stats.block_added();
        Ok(Some(block))
      }
      None => Err(AllocError::OutOfMemory),
    }
  }

  fn release(&self, addr: &mut Addr, _nbytes: usize) {
    if let Some(block) = addr.take() {
      unsafe { libc::free(block.as_ptr() as *mut libc::c_void) };
      self.stats.block_removed();
    }
  }

  fn reallocate(
    &self,
    addr: &mut Addr,
    old_nbytes: usize,
    new_nbytes: usize,
    clean: bool,
  ) -> AllocResult<bool> {
    if old_nbytes == new_nbytes {
      return Ok(false);
    }

    let Some(block) = *addr else {
      if old_nbytes != 0 {
        return Err(AllocError::InvalidArgument(
          "reallocate from empty with a nonzero old size",
        ));
      }
      // new_nbytes differs from old_nbytes == 0, so it is nonzero
      let Some(fresh) = Self::host_allocate(new_nbytes, clean) else {
        return Err(AllocError::OutOfMemory);
      };
      self.stats.block_added();
      *addr = Some(fresh);
      return Ok(true);
    };

    if old_nbytes == 0 || new_nbytes == 0 {
      return Err(AllocError::InvalidArgument(
        "reallocate of a live block with a zero size",
      ));
    }

    let raw = unsafe { libc::realloc(block.as_ptr() as *mut libc::c_void, new_nbytes) };
    let Some(fresh) = NonNull::new(raw as *mut u8) else {
      return Err(AllocError::OutOfMemory);
    };
    if clean && new_nbytes > old_nbytes {
      unsafe {
        core::ptr::write_bytes(fresh.as_ptr().add(old_nbytes), 0, new_nbytes - old_nbytes)
      };
    }
    *addr = Some(fresh);
    Ok(fresh != block)
  }

  fn dump(&self) {
    eprintln!(
      "Stdlib allocator: {} blocks allocated",
      self.stats.blocks_allocated()
    );
  }

  fn stats(&self) -> &AllocatorStats {
    &self.stats
  }
}
