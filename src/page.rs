use core::{
  cmp,
  ptr::NonNull,
  sync::atomic::{
    AtomicUsize,
    Ordering,
  },
};

use bmalloc_bitmap::{
  Bitmap,
  BitmapError,
  BitmapWord,
};
use bmalloc_list::{
  HasLink,
  Link,
};
use bmalloc_sys::prim::page_align_down;

use crate::{
  UNIT_SIZE,
  layout::PageLayout,
};

/// Bucket value carried by a page that is not linked anywhere.
pub(crate) const UNLINKED: usize = usize::MAX;

fn breach(err: BitmapError) -> ! {
  panic!("bitmap page invariant breached: {err:?}");
}

/// Header at the base of every bitmap-managed page. The occupancy bitmap
/// (one bit per unit, 1 = in use) sits directly after this struct; the rest
/// of the page is the data area. Header units are permanently marked in use,
/// so no address handed out from a bitmap page is ever page-aligned.
#[repr(C)]
pub(crate) struct BmPage {
  bucket: AtomicUsize,
  link: Link<BmPage>,
}

impl HasLink for BmPage {
  fn link(&self) -> &Link<Self> {
    &self.link
  }
}

impl BmPage {
  /// Writes a fresh header over `base` and marks the header units in use.
  ///
  /// # Safety
  ///
  /// `base` must be the start of a writable OS page described by `layout`
  /// that carries no live header.
  pub unsafe fn init(base: NonNull<u8>, layout: &PageLayout) -> NonNull<BmPage> {
    let page = base.cast::<BmPage>();
    unsafe {
      page.as_ptr().write(BmPage {
        bucket: AtomicUsize::new(UNLINKED),
        link: Link::new(),
      });
    }
    let page_ref = unsafe { page.as_ref() };
    let bitmap = page_ref.bitmap(layout);
    bitmap.clear_all();
    bitmap
      .set_run(0, layout.header_units())
      .unwrap_or_else(|err| breach(err));
    page
  }

  /// Owning page of a small-block address.
  ///
  /// # Safety
  ///
  /// `addr` must lie in the data area of a live bitmap page.
  pub unsafe fn from_addr(addr: NonNull<u8>) -> NonNull<BmPage> {
    let base = page_align_down(addr.as_ptr() as usize);
    unsafe { NonNull::new_unchecked(base as *mut BmPage) }
  }

  fn words(&self, layout: &PageLayout) -> &[BitmapWord] {
    let base = self as *const BmPage as *const u8;
    unsafe {
      let words = base.add(core::mem::size_of::<BmPage>()) as *const BitmapWord;
      core::slice::from_raw_parts(words, layout.bitmap_words())
    }
  }

  pub fn bitmap(&self, layout: &PageLayout) -> Bitmap {
    Bitmap::over(self.words(layout), layout.units_per_page()).unwrap_or_else(|err| breach(err))
  }

  pub fn bucket(&self) -> usize {
    self.bucket.load(Ordering::Relaxed)
  }

  pub(crate) fn set_bucket(&self, bucket: usize) {
    self.bucket.store(bucket, Ordering::Relaxed);
  }

  pub fn base(&self) -> NonNull<u8> {
    NonNull::from(self).cast()
  }

  /// Address of the unit at `offset`.
  pub fn addr_of_unit(&self, offset: usize) -> NonNull<u8> {
    unsafe { NonNull::new_unchecked(self.base().as_ptr().add(offset * UNIT_SIZE)) }
  }

  /// Unit offset of an address within this page.
  pub fn unit_of_addr(&self, addr: NonNull<u8>) -> usize {
    (addr.as_ptr() as usize - self.base().as_ptr() as usize) / UNIT_SIZE
  }

  /// Lowest data-area offset where `units` consecutive free units begin.
  /// The scan alternates zero and one runs to skip over live blocks.
  pub fn find_free(&self, layout: &PageLayout, units: usize) -> Option<usize> {
    let bitmap = self.bitmap(layout);
    let end = layout.units_per_page();
    let mut offset = layout.header_units();
    while offset < end {
      let zeros = bitmap.count_zeros(offset, units);
      if zeros >= units {
        return Some(offset);
      }
      offset += zeros;
      offset += bitmap.count_ones(offset, usize::MAX);
    }
    None
  }

  /// Longest free run in the data area; the page's bucket key.
  pub fn longest_free(&self, layout: &PageLayout) -> usize {
    let bitmap = self.bitmap(layout);
    let mut offset = layout.header_units();
    let mut remaining = layout.max_data_units();
    let mut longest = 0;
    while remaining > 0 {
      let zeros = cmp::min(bitmap.count_zeros(offset, remaining), remaining);
      if zeros > longest {
        longest = zeros;
      }
      offset += zeros;
      remaining -= zeros;
      if remaining == 0 {
        break;
      }
      let ones = cmp::min(bitmap.count_ones(offset, remaining), remaining);
      offset += ones;
      remaining -= ones;
    }
    longest
  }

  /// Marks `[offset, offset + units)` in use.
  pub fn mark(&self, layout: &PageLayout, offset: usize, units: usize) {
    self
      .bitmap(layout)
      .set_run(offset, units)
      .unwrap_or_else(|err| breach(err));
  }

  /// Frees `[offset, offset + units)`.
  pub fn clear(&self, layout: &PageLayout, offset: usize, units: usize) {
    self
      .bitmap(layout)
      .clear_run(offset, units)
      .unwrap_or_else(|err| breach(err));
  }

  /// Trims a live run from `old_units` down to `new_units`.
  pub fn shrink(&self, layout: &PageLayout, offset: usize, old_units: usize, new_units: usize) {
    debug_assert!(new_units < old_units);
    debug_assert!(self.live_run(layout, offset, old_units));
    self.clear(layout, offset + new_units, old_units - new_units);
  }

  /// Extends a live run in place. Succeeds only when the trailing
  /// `new_units - old_units` units are free; fails without mutating.
  pub fn try_grow(
    &self,
    layout: &PageLayout,
    offset: usize,
    old_units: usize,
    new_units: usize,
  ) -> bool {
    debug_assert!(new_units > old_units);
    debug_assert!(self.live_run(layout, offset, old_units));
    let increment = new_units - old_units;
    let bitmap = self.bitmap(layout);
    if bitmap.count_zeros(offset + old_units, increment) < increment {
      return false;
    }
    bitmap
      .set_run(offset + old_units, increment)
      .unwrap_or_else(|err| breach(err));
    true
  }

  /// True when every unit of `[offset, offset + units)` is in use.
  pub fn live_run(&self, layout: &PageLayout, offset: usize, units: usize) -> bool {
    self.bitmap(layout).count_ones(offset, units) >= units
  }
}
