//! Pluggable allocator with a bitmap-page core.
//!
//! Small blocks are packed into OS pages at [`UNIT_SIZE`] granularity, with
//! a per-page occupancy bitmap and a process-wide directory that buckets
//! pages by their longest free run. Large blocks are individual anonymous
//! mappings. Two more backends share the same interface: the host allocator
//! ([`StdAllocator`]) and a red-zone wrapper over it ([`DebugAllocator`]).
//!
//! The interface is deliberately size-in: blocks carry no size metadata, so
//! `release` and `reallocate` take the byte count back from the caller.
//! `release` clears the caller's address; `reallocate` reports whether the
//! address moved so dependent pointers can be refreshed. `clean` requests
//! zeroed memory over the user-visible range only, never the padding.

use core::{
  ptr::NonNull,
  sync::atomic::{
    AtomicUsize,
    Ordering,
  },
};

use spin::Once;
use thiserror::Error;

mod bitmap;
mod debug;
mod dump;
mod global;
mod layout;
mod page;
mod pages;
mod stdlib;
mod superblock;

#[cfg(test)]
mod tests;

pub use bitmap::BitmapAllocator;
pub use debug::{
  DebugAllocator,
  RED_ZONE,
};
pub use global::GlobalBitmap;
pub use layout::PageLayout;
pub use stdlib::StdAllocator;

/// Allocation quantum of the bitmap path in bytes. Every small block is
/// rounded up to whole units.
pub const UNIT_SIZE: usize = 16;

const _: () = assert!(UNIT_SIZE.is_power_of_two());
// a unit must hold a pointer; this also keeps the bucket directory within
// one OS page
const _: () = assert!(UNIT_SIZE >= core::mem::size_of::<*const u8>());

/// A block address. `None` stands for "no block"; a zero-size allocation
/// returns it and releasing it is a no-op.
pub type Addr = Option<NonNull<u8>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum AllocError {
  #[error("out of memory")]
  OutOfMemory,
  #[error("invalid argument: {0}")]
  InvalidArgument(&'static str),
}

pub type AllocResult<T> = Result<T, AllocError>;

#[derive(Debug, Default)]
pub struct AllocatorStats {
  blocks_allocated: AtomicUsize,
}

impl AllocatorStats {
  pub const fn new() -> Self {
    Self {
      blocks_allocated: AtomicUsize::new(0),
    }
  }

  /// Blocks currently live. Updated with relaxed atomics, so concurrent
  /// readers see an eventually consistent value.
  pub fn blocks_allocated(&self) -> usize {
    self.blocks_allocated.load(Ordering::Relaxed)
  }

  pub(crate) fn block_added(&self) {
    self.blocks_allocated.fetch_add(1, Ordering::Relaxed);
  }

  pub(crate) fn block_removed(&self) {
    self.blocks_allocated.fetch_sub(1, Ordering::Relaxed);
  }
}

/// The capability set every backend implements. All methods take `&self`;
/// implementations are thread-safe.
///
/// The caller is the source of truth for block sizes: supplying a different
/// size on `release`/`reallocate` than was allocated is undefined behavior.
pub trait Allocator: Send + Sync {
  /// One-time setup; optional. Backends that need no setup inherit the
  /// empty default.
  fn init(&self) {}

  /// Allocates `nbytes`. Returns `Ok(None)` for a zero-size request and
  /// `Err` when memory is exhausted. With `clean`, bytes `[0, nbytes)` of
  /// the block are zero.
  fn allocate(&self, nbytes: usize, clean: bool) -> AllocResult<Addr>;

  /// Resizes `*addr` from `old_nbytes` to `new_nbytes`, updating `*addr` in
  /// place. Returns whether the address changed. With `clean`, a grow
  /// zeroes `[old_nbytes, new_nbytes)` of the final block. On error `*addr`
  /// is untouched.
  fn reallocate(
    &self,
    addr: &mut Addr,
    old_nbytes: usize,
    new_nbytes: usize,
    clean: bool,
  ) -> AllocResult<bool>;

  /// Releases `*addr` and clears it to `None`. Releasing `None` is a no-op.
  /// For a directly mapped block, `nbytes` must round to the same page
  /// count as the size it was allocated with.
  fn release(&self, addr: &mut Addr, nbytes: usize);

  /// Prints backend diagnostics to stderr.
  fn dump(&self) {}

  fn stats(&self) -> &AllocatorStats;
}

/// The process-wide bitmap allocator instance.
pub static BITMAP: BitmapAllocator = BitmapAllocator::new();
/// The process-wide host-allocator adaptor.
pub static STDLIB: StdAllocator = StdAllocator::new();
/// The process-wide red-zone adaptor.
pub static DEBUG: DebugAllocator = DebugAllocator::new();

static DEFAULT: Once<&'static dyn Allocator> = Once::new();

/// Installs `allocator` as the process-wide default behind the free
/// functions below, running its `init` first. The first installation wins;
/// later calls return the already-installed instance.
pub fn install(allocator: &'static dyn Allocator) -> &'static dyn Allocator {
  *DEFAULT.call_once(|| {
    allocator.init();
    allocator
  })
}

pub fn default_allocator() -> &'static dyn Allocator {
  match DEFAULT.get() {
    Some(allocator) => *allocator,
    None => panic!("no default allocator installed; call install() first"),
  }
}

/// [`Allocator::allocate`] on the installed default.
pub fn allocate(nbytes: usize, clean: bool) -> AllocResult<Addr> {
  default_allocator().allocate(nbytes, clean)
}

/// [`Allocator::reallocate`] on the installed default.
pub fn reallocate(
  addr: &mut Addr,
  old_nbytes: usize,
  new_nbytes: usize,
  clean: bool,
) -> AllocResult<bool> {
  default_allocator().reallocate(addr, old_nbytes, new_nbytes, clean)
}

/// [`Allocator::release`] on the installed default.
pub fn release(addr: &mut Addr, nbytes: usize) {
  default_allocator().release(addr, nbytes)
}

/// [`Allocator::dump`] on the installed default.
pub fn dump() {
  default_allocator().dump()
}
