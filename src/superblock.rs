use core::ptr::NonNull;

use bmalloc_list::Ring;
use spin::Mutex;

use crate::{
  AllocResult,
  dump,
  layout::PageLayout,
  page::{
    BmPage,
    UNLINKED,
  },
  pages,
};

type Slot = Option<NonNull<BmPage>>;

/// Directory of bitmap pages, bucketed by longest free run.
///
/// One mapped OS page holds `units_per_page` slots; slot `k` heads a
/// circular ring of pages whose longest free run is exactly `k`. The lock
/// covers linking and unlinking only: a detached page belongs to the
/// detaching thread, which mutates its bitmap without the lock and attaches
/// it back under its new bucket.
pub(crate) struct Superblock {
  slots: NonNull<Slot>,
  len: usize,
  lock: Mutex<()>,
}

// The raw slot page is only touched under the lock.
unsafe impl Send for Superblock {}
unsafe impl Sync for Superblock {}

impl Superblock {
  /// Maps the slot page. A fresh mapping is zeroed, and a zeroed slot is an
  /// empty bucket, so no further initialization is needed.
  pub fn new(layout: &PageLayout) -> AllocResult<Self> {
    let base = pages::map_pages(layout.page_size(), true)?;
    Ok(Self {
      slots: base.cast::<Slot>(),
      len: layout.units_per_page(),
      lock: Mutex::new(()),
    })
  }

  #[allow(clippy::mut_from_ref)]
  fn slot(&self, bucket: usize) -> &mut Slot {
    debug_assert!(bucket < self.len);
    unsafe { &mut *self.slots.as_ptr().add(bucket) }
  }

  /// Links `page` at the tail of bucket `bucket`.
  pub fn attach(&self, page: NonNull<BmPage>, bucket: usize) {
    let _guard = self.lock.lock();
    unsafe { Ring::push_tail(self.slot(bucket), page) };
    unsafe { page.as_ref() }.set_bucket(bucket);
  }

  /// Unlinks `page` from whatever bucket holds it and returns that bucket.
  /// The caller owns the page exclusively until it attaches it back.
  ///
  /// Another thread may hold the page detached for a different block in the
  /// same page; it always attaches the page back (a page with our caller's
  /// live block can never empty out and be unmapped under us), so this
  /// waits for it.
  pub fn detach(&self, page: NonNull<BmPage>) -> usize {
    loop {
      let guard = self.lock.lock();
      let bucket = unsafe { page.as_ref() }.bucket();
      if bucket == UNLINKED {
        drop(guard);
        core::hint::spin_loop();
        continue;
      }
      if bucket >= self.len {
        panic!(
          "detach of page {:p} with corrupt bucket {bucket}",
          page.as_ptr()
        );
      }
      unsafe { Ring::remove(self.slot(bucket), page) };
      unsafe { page.as_ref() }.set_bucket(UNLINKED);
      return bucket;
    }
  }

  /// Detaches the head page of the smallest non-empty bucket `k >= units`.
  pub fn find_and_detach(&self, units: usize) -> Option<NonNull<BmPage>> {
    let _guard = self.lock.lock();
    for bucket in units..self.len {
      let slot = self.slot(bucket);
      if let Some(page) = *slot {
        unsafe { Ring::remove(slot, page) };
        unsafe { page.as_ref() }.set_bucket(UNLINKED);
        return Some(page);
      }
    }
    None
  }

  /// Prints every non-empty bucket and its pages. Holds the lock for the
  /// whole walk; diagnostics only.
  pub fn dump(&self, layout: &PageLayout) {
    let _guard = self.lock.lock();
    for bucket in 0..self.len {
      if let Some(head) = *self.slot(bucket) {
        eprintln!("Bucket {bucket}: head {:p}", head.as_ptr());
        for page in unsafe { Ring::iter(Some(head)) } {
          dump::dump_page(page, layout);
        }
      }
    }
  }
}
