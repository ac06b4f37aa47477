use bmalloc_bitmap::Bitmap;
use bmalloc_sys::prim::page_size;
use getset::CloneGetters;

use crate::{
  UNIT_SIZE,
  page::BmPage,
};

/// Geometry of a bitmap page for the runtime OS page size.
///
/// A page is divided into `units_per_page` units of [`UNIT_SIZE`] bytes. The
/// leading `header_units` hold the [`BmPage`] header and the occupancy
/// bitmap and are permanently marked in use; the remaining `max_data_units`
/// form the data area.
#[derive(Debug, Clone, Copy, CloneGetters)]
pub struct PageLayout {
  #[getset(get_clone = "pub")]
  page_size: usize,
  #[getset(get_clone = "pub")]
  units_per_page: usize,
  #[getset(get_clone = "pub")]
  header_units: usize,
  #[getset(get_clone = "pub")]
  max_data_units: usize,
}

impl PageLayout {
  pub fn current() -> Self {
    let page_size = page_size();
    let units_per_page = page_size / UNIT_SIZE;
    let header_bytes = core::mem::size_of::<BmPage>() + Bitmap::bytes(units_per_page);
    let header_units = header_bytes.div_ceil(UNIT_SIZE);

    Self {
      page_size,
      units_per_page,
      header_units,
      max_data_units: units_per_page - header_units,
    }
  }

  /// Units needed to hold `nbytes`.
  pub const fn bytes_to_units(nbytes: usize) -> usize {
    nbytes.div_ceil(UNIT_SIZE)
  }

  /// Words backing one page's bitmap.
  pub fn bitmap_words(&self) -> usize {
    Bitmap::words(self.units_per_page)
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_geometry() {
    let layout = PageLayout::current();
    assert_eq!(layout.page_size() % UNIT_SIZE, 0);
    assert_eq!(
      layout.header_units() + layout.max_data_units(),
      layout.units_per_page()
    );
    assert!(layout.header_units() >= 1);
    assert!(layout.max_data_units() > 0);

    // literal values for the common 4 KiB page
    if layout.page_size() == 4096 && UNIT_SIZE == 16 && !cfg!(feature = "word32") {
      assert_eq!(layout.units_per_page(), 256);
      assert_eq!(layout.header_units(), 4);
      assert_eq!(layout.max_data_units(), 252);
    }
  }

  #[test]
  fn test_bytes_to_units() {
    assert_eq!(PageLayout::bytes_to_units(0), 0);
    assert_eq!(PageLayout::bytes_to_units(1), 1);
    assert_eq!(PageLayout::bytes_to_units(UNIT_SIZE), 1);
    assert_eq!(PageLayout::bytes_to_units(UNIT_SIZE + 1), 2);
    assert_eq!(PageLayout::bytes_to_units(3 * UNIT_SIZE), 3);
  }
}
