use core::sync::atomic::{
  AtomicUsize,
  Ordering,
};

#[derive(Debug, PartialEq)]
pub enum PrimError {
  Overflow,
}

pub type PrimResult<T> = Result<T, PrimError>;

#[cfg(not(any(target_os = "linux", target_os = "macos")))]
const COMMON_PAGE_SIZE: usize = 4096;

#[cfg(any(target_os = "linux", target_os = "macos"))]
fn page_size_helper() -> usize {
  unsafe { libc::sysconf(libc::_SC_PAGESIZE) as usize }
}

#[cfg(not(any(target_os = "linux", target_os = "macos")))]
fn page_size_helper() -> usize {
  COMMON_PAGE_SIZE
}

/// System page size, queried once and cached. The power-of-two check runs
/// here, once, so the alignment helpers below can use plain mask arithmetic.
pub fn page_size() -> usize {
  static PAGE_SIZE: AtomicUsize = AtomicUsize::new(0);

  let cached = PAGE_SIZE.load(Ordering::Relaxed);
  if cached != 0 {
    return cached;
  }
  let size = page_size_helper();
  assert!(
    size.is_power_of_two(),
    "system page size {size} is not a power of two"
  );
  PAGE_SIZE.store(size, Ordering::Relaxed);
  size
}

/// Rounds `value` up to whole pages.
pub fn page_align(value: usize) -> PrimResult<usize> {
  let mask = page_size() - 1;
  match value.checked_add(mask) {
    Some(sum) => Ok(sum & !mask),
    None => Err(PrimError::Overflow),
  }
}

/// Rounds `value` down to the start of its page.
pub fn page_align_down(value: usize) -> usize {
  value & !(page_size() - 1)
}

pub fn is_page_aligned(value: usize) -> bool {
  value & (page_size() - 1) == 0
}
