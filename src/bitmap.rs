use core::{
  ptr::NonNull,
  sync::atomic::{
    AtomicUsize,
    Ordering,
  },
};

use bmalloc_sys::prim::is_page_aligned;
use spin::Once;

use crate::{
  Addr,
  AllocError,
  AllocResult,
  Allocator,
  AllocatorStats,
  UNIT_SIZE,
  layout::PageLayout,
  page::BmPage,
  pages,
  superblock::Superblock,
};

struct Shared {
  layout: PageLayout,
  directory: Superblock,
}

/// Allocator packing small blocks into bitmap-managed OS pages.
///
/// Blocks shorter than the data area of one page are carved out of shared
/// pages at unit granularity; anything larger becomes its own page-aligned
/// mapping. The two cases are told apart on release by address alignment
/// alone: a bitmap-page block can never be page-aligned because the page
/// header occupies the leading units.
///
/// Block sizes are not recorded anywhere. The caller passes the size back on
/// `release` and `reallocate`; passing a different size than was allocated
/// is undefined behavior.
pub struct BitmapAllocator {
  shared: Once<Shared>,
  stats: AllocatorStats,
  num_pages: AtomicUsize,
}

impl BitmapAllocator {
  pub const fn new() -> Self {
    Self {
      shared: Once::new(),
      stats: AllocatorStats::new(),
      num_pages: AtomicUsize::new(0),
    }
  }

  /// Live bitmap pages owned by this instance.
  pub fn num_pages(&self) -> usize {
    self.num_pages.load(Ordering::Relaxed)
  }

  pub fn layout(&self) -> PageLayout {
    self.shared().layout
  }

  fn shared(&self) -> &Shared {
    self.shared.call_once(|| {
      let layout = PageLayout::current();
      let directory = match Superblock::new(&layout) {
        Ok(directory) => directory,
        Err(err) => panic!("cannot map the page directory: {err}"),
      };
      log::debug!(
        "page size {}; units per page {}; header {} units; data units {} ({} bytes)",
        layout.page_size(),
        layout.units_per_page(),
        layout.header_units(),
        layout.max_data_units(),
        layout.max_data_units() * UNIT_SIZE
      );
      Shared { layout, directory }
    })
  }

  fn bm_allocate(&self, units: usize, clean: bool) -> AllocResult<NonNull<u8>> {
    let shared = self.shared();
    let layout = &shared.layout;

    let block = if let Some(page) = shared.directory.find_and_detach(units) {
      let page_ref = unsafe { page.as_ref() };
      let offset = match page_ref.find_free(layout, units) {
        Some(offset) => offset,
        None => panic!(
          "detached page {:p} must hold {units} free units",
          page.as_ptr()
        ),
      };
      page_ref.mark(layout, offset, units);
      shared.directory.attach(page, page_ref.longest_free(layout));
      page_ref.addr_of_unit(offset)
    } else {
      log::trace!("mapping a new page for {units} units");
      let base = pages::map_pages(layout.page_size(), false)?;
      let page = unsafe { BmPage::init(base, layout) };
      let page_ref = unsafe { page.as_ref() };
      page_ref.mark(layout, layout.header_units(), units);
      // the allocation sits at the head of the data area, so the longest
      // free run is the contiguous tail
      shared.directory.attach(page, layout.max_data_units() - units);
      self.num_pages.fetch_add(1, Ordering::Relaxed);
      page_ref.addr_of_unit(layout.header_units())
    };

    self.stats.block_added();
    if clean {
      unsafe { pages::cleanse(block, 0, units * UNIT_SIZE) };
    }
    Ok(block)
  }

  fn bm_release(&self, page: NonNull<BmPage>, offset: usize, units: usize) {
    let shared = self.shared();
    let layout = &shared.layout;
    let page_ref = unsafe { page.as_ref() };

    shared.directory.detach(page);
    debug_assert!(
      page_ref.live_run(layout, offset, units),
      "release of units that are not all in use"
    );
    page_ref.clear(layout, offset, units);

    let longest = page_ref.longest_free(layout);
    if longest < layout.max_data_units() {
      shared.directory.attach(page, longest);
    } else {
      log::trace!("releasing page {:p}", page.as_ptr());
      unsafe { pages::unmap_pages(page.cast(), layout.page_size()) };
      self.num_pages.fetch_sub(1, Ordering::Relaxed);
    }
    self.stats.block_removed();
  }

  fn bm_shrink(&self, page: NonNull<BmPage>, offset: usize, old_units: usize, new_units: usize) {
    let shared = self.shared();
    let layout = &shared.layout;
    let page_ref = unsafe { page.as_ref() };

    shared.directory.detach(page);
    page_ref.shrink(layout, offset, old_units, new_units);
    shared.directory.attach(page, page_ref.longest_free(layout));
  }

  fn bm_grow(
    &self,
    page: NonNull<BmPage>,
    offset: usize,
    old_units: usize,
    new_units: usize,
  ) -> bool {
    let shared = self.shared();
    let layout = &shared.layout;
    let page_ref = unsafe { page.as_ref() };

    let previous = shared.directory.detach(page);
    let grown = page_ref.try_grow(layout, offset, old_units, new_units);
    let bucket = if grown {
      page_ref.longest_free(layout)
    } else {
      // nothing changed, the page goes back where it came from
      previous
    };
    shared.directory.attach(page, bucket);
    grown
  }

  fn allocate_block(&self, nbytes: usize, clean: bool) -> AllocResult<NonNull<u8>> {
    let layout = self.shared().layout;
    let units = PageLayout::bytes_to_units(nbytes);
    if units < layout.max_data_units() {
      self.bm_allocate(units, clean)
    } else {
      let block = pages::map_pages(nbytes, clean)?;
      self.stats.block_added();
      Ok(block)
    }
  }
}

impl Default for BitmapAllocator {
  fn default() -> Self {
    Self::new()
  }
}

impl Allocator for BitmapAllocator {
  fn init(&self) {
    self.shared();
  }

  fn allocate(&self, nbytes: usize, clean: bool) -> AllocResult<Addr> {
    if nbytes == 0 {
      return Ok(None);
    }
    self.allocate_block(nbytes, clean).map(Some)
  }

  fn release(&self, addr: &mut Addr, nbytes: usize) {
    let Some(block) = *addr else {
      return;
    };
    if nbytes == 0 {
      panic!("release of {:p} with zero size", block.as_ptr());
    }

    if is_page_aligned(block.as_ptr() as usize) {
      // page-aligned means the block was mapped directly
      unsafe { pages::unmap_pages(block, nbytes) };
      self.stats.block_removed();
    } else {
      let page = unsafe { BmPage::from_addr(block) };
      let offset = unsafe { page.as_ref() }.unit_of_addr(block);
      self.bm_release(page, offset, PageLayout::bytes_to_units(nbytes));
    }
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
      let fresh = self.allocate_block(new_nbytes, clean)?;
      *addr = Some(fresh);
      return Ok(true);
    };

    if old_nbytes == 0 || new_nbytes == 0 {
      return Err(AllocError::InvalidArgument(
        "reallocate of a live block with a zero size",
      ));
    }

    let old_units = PageLayout::bytes_to_units(old_nbytes);
    let new_units = PageLayout::bytes_to_units(new_nbytes);

    if new_units == old_units {
      if clean && new_nbytes > old_nbytes {
        unsafe { pages::cleanse(block, old_nbytes, new_nbytes) };
      }
      return Ok(false);
    }

    let max_data = self.shared().layout.max_data_units();
    let page_aligned = is_page_aligned(block.as_ptr() as usize);

    if new_units < old_units {
      // shrink
      if new_units < max_data {
        if old_units < max_data {
          if page_aligned {
            panic!(
              "shrink of {:p}: address is not within a data area",
              block.as_ptr()
            );
          }
          let page = unsafe { BmPage::from_addr(block) };
          let offset = unsafe { page.as_ref() }.unit_of_addr(block);
          self.bm_shrink(page, offset, old_units, new_units);
          return Ok(false);
        }

        // the block leaves the direct-page path for a bitmap page
        if !page_aligned {
          panic!("shrink of {:p}: address is not page-aligned", block.as_ptr());
        }
        if let Ok(fresh) = self.bm_allocate(new_units, false) {
          unsafe {
            core::ptr::copy_nonoverlapping(block.as_ptr(), fresh.as_ptr(), new_nbytes);
            pages::unmap_pages(block, old_nbytes);
          }
          self.stats.block_removed();
          *addr = Some(fresh);
          return Ok(true);
        }
        // no room on the bitmap path: shrink the mapping in place; the
        // address stays page-aligned and the block stays on the direct path
        log::trace!("falling back to an in-place shrink of {:p}", block.as_ptr());
        unsafe { pages::remap_pages(block, old_nbytes, new_nbytes, false) }?;
        return Ok(false);
      }

      if !page_aligned {
        panic!("shrink of {:p}: address is not page-aligned", block.as_ptr());
      }
      unsafe { pages::remap_pages(block, old_nbytes, new_nbytes, false) }?;
      return Ok(false);
    }

    // grow
    if old_units < max_data {
      if new_units < max_data {
        if page_aligned {
          panic!(
            "grow of {:p}: address is not within a data area",
            block.as_ptr()
          );
        }
        let page = unsafe { BmPage::from_addr(block) };
        let offset = unsafe { page.as_ref() }.unit_of_addr(block);
        if self.bm_grow(page, offset, old_units, new_units) {
          if clean {
            unsafe { pages::cleanse(block, old_nbytes, new_nbytes) };
          }
          return Ok(false);
        }
      }

      // move to a fresh block, possibly onto the direct-page path
      let fresh = self.allocate_block(new_nbytes, false)?;
      unsafe {
        core::ptr::copy_nonoverlapping(block.as_ptr(), fresh.as_ptr(), old_nbytes);
      }
      let mut old = Some(block);
      self.release(&mut old, old_nbytes);
      if clean {
        unsafe { pages::cleanse(fresh, old_nbytes, new_nbytes) };
      }
      *addr = Some(fresh);
      return Ok(fresh != block);
    }

    if !page_aligned {
      panic!("grow of {:p}: address is not page-aligned", block.as_ptr());
    }
    let fresh = unsafe { pages::remap_pages(block, old_nbytes, new_nbytes, clean) }?;
    *addr = Some(fresh);
    Ok(fresh != block)
  }

  fn dump(&self) {
    let shared = self.shared();
    eprintln!(
      "\nBitmap allocator: {} pages, {} blocks allocated",
      self.num_pages(),
      self.stats.blocks_allocated()
    );
    shared.directory.dump(&shared.layout);
    eprintln!();
  }

  fn stats(&self) -> &AllocatorStats {
    &self.stats
  }
}
