use core::{
  cmp,
  mem,
  ptr::NonNull,
};

use crate::{
  Addr,
  AllocError,
  AllocResult,
  Allocator,
  AllocatorStats,
  dump::dump_hex,
  stdlib::StdAllocator,
};

/// Bytes of sentinel padding on each side of a debug block.
pub const RED_ZONE: usize = 32;

const SENTINEL: u8 = 0xFF;

/// Record at the head of every debug region, kept for cross-checking the
/// caller's address and size on release.
#[repr(C)]
struct BlockInfo {
  addr: *mut u8,
  nbytes: usize,
}

/// Red-zone wrapper over [`StdAllocator`]. Every block is surrounded by
/// sentinel-filled zones; a release that finds a zone disturbed prints the
/// damage and terminates. Reallocation always moves the block so that the
/// old zones are validated on every resize.
///
/// Region layout:
///
/// ```text
/// | BlockInfo | red zone | user block (nbytes) | red zone |
/// ```
pub struct DebugAllocator {
  inner: StdAllocator,
  stats: AllocatorStats,
}

impl DebugAllocator {
  pub const fn new() -> Self {
    Self {
      inner: StdAllocator::new(),
      stats: AllocatorStats::new(),
    }
  }

  const fn region_size(nbytes: usize) -> usize {
    mem::size_of::<BlockInfo>() + nbytes + 2 * RED_ZONE
  }

  fn region_of(block: NonNull<u8>) -> NonNull<u8> {
    unsafe {
      NonNull::new_unchecked(block.as_ptr().sub(mem::size_of::<BlockInfo>() + RED_ZONE))
    }
  }

  fn block_of(region: NonNull<u8>) -> NonNull<u8> {
    unsafe {
      NonNull::new_unchecked(region.as_ptr().add(mem::size_of::<BlockInfo>() + RED_ZONE))
    }
  }

  fn check_region(caller: &str, block: NonNull<u8>, nbytes: usize) {
    let region = Self::region_of(block);

    let (damaged_below, damaged_above) = unsafe {
      let info = &*(region.as_ptr() as *const BlockInfo);
      if info.addr != block.as_ptr() || info.nbytes != nbytes {
        eprintln!(
          "{caller}: record for {:p} disagrees: recorded {:p}/{} bytes, caller said {nbytes}",
          block.as_ptr(),
          info.addr,
          info.nbytes
        );
        panic!("debug allocator: block record damaged or sizes disagree");
      }

      let lower =
        core::slice::from_raw_parts(region.as_ptr().add(mem::size_of::<BlockInfo>()), RED_ZONE);
      let upper = core::slice::from_raw_parts(block.as_ptr().add(nbytes), RED_ZONE);

      let damaged_below = lower.iter().filter(|&&byte| byte != SENTINEL).count();
      let damaged_above = upper.iter().filter(|&&byte| byte != SENTINEL).count();
      if damaged_below != 0 {
        eprintln!(
          "{caller}: damaged {damaged_below} bytes below {:p}",
          block.as_ptr()
        );
        dump_hex(lower);
      }
      if damaged_above != 0 {
        eprintln!(
          "{caller}: damaged {damaged_above} bytes above {:p} + {nbytes}",
          block.as_ptr()
        );
        dump_hex(upper);
      }
      (damaged_below, damaged_above)
    };

    if damaged_below != 0 && damaged_above != 0 {
      panic!("debug allocator: damaged below and above the block");
    }
    if damaged_above != 0 {
      panic!("debug allocator: damaged above the block");
    }
    if damaged_below != 0 {
      panic!("debug allocator: damaged below the block");
    }
  }
}

impl Default for DebugAllocator {
  fn default() -> Self {
    Self::new()
  }
}

impl Allocator for DebugAllocator {
  fn allocate(&self, nbytes: usize, clean: bool) -> AllocResult<Addr> {
    if nbytes == 0 {
      return Ok(None);
    }
    let Some(region) = self.inner.allocate(Self::region_size(nbytes), clean)? else {
      return Err(AllocError::OutOfMemory);
    };
    let block = Self::block_of(region);
    unsafe {
      core::ptr::write_bytes(
        region.as_ptr().add(mem::size_of::<BlockInfo>()),
        SENTINEL,
        RED_ZONE,
      );
      core::ptr::write_bytes(block.as_ptr().add(nbytes), SENTINEL, RED_ZONE);
      (region.as_ptr() as *mut BlockInfo).write(BlockInfo {
        addr: block.as_ptr(),
        nbytes,
      });
    }
    self.stats.block_added();
    log::trace!("{nbytes} bytes -> {:p}", block.as_ptr());
    Ok(Some(block))
  }

  fn release(&self, addr: &mut Addr, nbytes: usize) {
    let Some(block) = *addr else {
      return;
    };
    Self::check_region("release", block, nbytes);

    let mut region = Some(Self::region_of(block));
    self.inner.release(&mut region, Self::region_size(nbytes));
    self.stats.block_removed();
    log::trace!("released {:p}, {nbytes} bytes", block.as_ptr());
    *addr = None;
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
      let Some(fresh) = self.allocate(new_nbytes, clean)? else {
        return Err(AllocError::OutOfMemory);
      };
      *addr = Some(fresh);
      return Ok(true);
    };

    if old_nbytes == 0 || new_nbytes == 0 {
      return Err(AllocError::InvalidArgument(
        "reallocate of a live block with a zero size",
      ));
    }

    // always move, so the old zones get validated on every resize
    let Some(fresh) = self.allocate(new_nbytes, false)? else {
      return Err(AllocError::OutOfMemory);
    };
    unsafe {
      core::ptr::copy_nonoverlapping(
        block.as_ptr(),
        fresh.as_ptr(),
        cmp::min(old_nbytes, new_nbytes),
      );
    }
    let mut old = Some(block);
    self.release(&mut old, old_nbytes);

    if clean && new_nbytes > old_nbytes {
      unsafe {
        core::ptr::write_bytes(fresh.as_ptr().add(old_nbytes), 0, new_nbytes - old_nbytes)
      };
    }
    *addr = Some(fresh);
    Ok(true)
  }

  fn dump(&self) {
    eprintln!(
      "Debug allocator: {} blocks allocated",
      self.stats.blocks_allocated()
    );
  }

  fn stats(&self) -> &AllocatorStats {
    &self.stats
  }
}
