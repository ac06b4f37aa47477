//! On-demand diagnostics, printed straight to stderr.

use core::sync::atomic::Ordering;

use bmalloc_list::HasLink;

use crate::{
  layout::PageLayout,
  page::BmPage,
};

/// Prints `buf` as 16-byte hex rows with an ASCII gutter.
pub(crate) fn dump_hex(buf: &[u8]) {
  for (row, chunk) in buf.chunks(16).enumerate() {
    let mut line = format!("{:06x}:", row * 16);
    for byte in chunk {
      line.push_str(&format!(" {byte:02x}"));
    }
    for _ in chunk.len()..16 {
      line.push_str("   ");
    }
    line.push_str("  ");
    for byte in chunk {
      line.push(if byte.is_ascii_graphic() {
        *byte as char
      } else {
        '.'
      });
    }
    eprintln!("{line}");
  }
}

/// Prints one page header and its occupancy bitmap as hex words.
pub(crate) fn dump_page(page: &BmPage, layout: &PageLayout) {
  let next = page
    .link()
    .next()
    .map_or(core::ptr::null_mut(), |p| p.as_ptr());
  let prev = page
    .link()
    .prev()
    .map_or(core::ptr::null_mut(), |p| p.as_ptr());
  eprintln!(
    "  page {:p}: bucket {}, next {next:p}, prev {prev:p}",
    page as *const BmPage,
    page.bucket()
  );

  let bitmap = page.bitmap(layout);
  let mut line = String::from("   ");
  for word in bitmap.store() {
    line.push_str(&format!(" {:016x}", word.load(Ordering::Relaxed)));
  }
  eprintln!("{line}");
}
