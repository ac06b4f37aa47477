use core::ptr::NonNull;

use bmalloc_sys::prim::is_page_aligned;
use rand::{
  Rng,
  SeedableRng,
  rngs::StdRng,
};

use crate::{
  page::BmPage,
  *,
};

fn init_logs() {
  let _ = env_logger::builder().is_test(true).try_init();
}

fn bytes<'buf>(addr: NonNull<u8>, len: usize) -> &'buf [u8] {
  unsafe { core::slice::from_raw_parts(addr.as_ptr(), len) }
}

fn fill(addr: NonNull<u8>, len: usize, byte: u8) {
  unsafe { core::ptr::write_bytes(addr.as_ptr(), byte, len) };
}

fn assert_filled(addr: NonNull<u8>, len: usize, byte: u8) {
  assert!(bytes(addr, len).iter().all(|&b| b == byte));
}

#[test]
fn test_small_cycle() {
  init_logs();
  let alloc = BitmapAllocator::new();
  let layout = alloc.layout();
  let head = layout.header_units();

  let mut addr = alloc.allocate(3 * UNIT_SIZE, true).unwrap();
  let block = addr.expect("small allocation");

  assert_eq!(block.as_ptr() as usize % UNIT_SIZE, 0);
  assert!(!is_page_aligned(block.as_ptr() as usize));
  assert_eq!(alloc.stats().blocks_allocated(), 1);
  assert_eq!(alloc.num_pages(), 1);
  assert_filled(block, 3 * UNIT_SIZE, 0);

  let page = unsafe { BmPage::from_addr(block) };
  let page_ref = unsafe { page.as_ref() };
  assert_eq!(page_ref.unit_of_addr(block), head);
  let bitmap = page_ref.bitmap(&layout);
  for i in 0..layout.units_per_page() {
    let expected = i < head + 3;
    assert_eq!(bitmap.get(i).unwrap(), expected, "unit {i}");
  }

  alloc.release(&mut addr, 3 * UNIT_SIZE);
  assert_eq!(addr, None);
  assert_eq!(alloc.stats().blocks_allocated(), 0);
  assert_eq!(alloc.num_pages(), 0);
}

#[test]
fn test_bucket_migration() {
  let alloc = BitmapAllocator::new();
  let layout = alloc.layout();

  let mut blocks: Vec<Addr> = (0..10)
    .map(|_| alloc.allocate(UNIT_SIZE, false).unwrap())
    .collect();
  assert_eq!(alloc.num_pages(), 1);

  let page = unsafe { BmPage::from_addr(blocks[0].unwrap()) };
  assert_eq!(
    unsafe { page.as_ref() }.bucket(),
    layout.max_data_units() - 10
  );

  for addr in blocks.iter_mut().rev() {
    alloc.release(addr, UNIT_SIZE);
  }
  assert_eq!(alloc.stats().blocks_allocated(), 0);
  assert_eq!(alloc.num_pages(), 0);
}

#[test]
fn test_large_path() {
  let alloc = BitmapAllocator::new();
  let ps = alloc.layout().page_size();

  let mut addr = alloc.allocate(2 * ps, false).unwrap();
  let block = addr.expect("large allocation");
  assert!(is_page_aligned(block.as_ptr() as usize));
  assert_eq!(alloc.stats().blocks_allocated(), 1);
  assert_eq!(alloc.num_pages(), 0);

  alloc.release(&mut addr, 2 * ps);
  assert_eq!(addr, None);
  assert_eq!(alloc.stats().blocks_allocated(), 0);
  assert_eq!(alloc.num_pages(), 0);
}

#[test]
fn test_small_to_large_grow() {
  let alloc = BitmapAllocator::new();
  let ps = alloc.layout().page_size();

  let mut addr = alloc.allocate(64, true).unwrap();
  fill(addr.unwrap(), 64, 0x5A);

  let changed = alloc.reallocate(&mut addr, 64, 2 * ps, true).unwrap();
  let block = addr.unwrap();
  assert!(changed);
  assert!(is_page_aligned(block.as_ptr() as usize));
  assert_filled(block, 64, 0x5A);
  assert!(bytes(block, 2 * ps)[64..].iter().all(|&b| b == 0));
  assert_eq!(alloc.stats().blocks_allocated(), 1);
  assert_eq!(alloc.num_pages(), 0);

  alloc.release(&mut addr, 2 * ps);
  assert_eq!(alloc.stats().blocks_allocated(), 0);
}

#[test]
fn test_in_place_small_grow() {
  let alloc = BitmapAllocator::new();
  let layout = alloc.layout();
  let head = layout.header_units();

  let mut first = alloc.allocate(UNIT_SIZE, false).unwrap();
  let mut second = alloc.allocate(UNIT_SIZE, false).unwrap();
  let page = unsafe { BmPage::from_addr(first.unwrap()) };
  let page_ref = unsafe { page.as_ref() };
  assert_eq!(page_ref.unit_of_addr(first.unwrap()), head);
  assert_eq!(page_ref.unit_of_addr(second.unwrap()), head + 1);

  alloc.release(&mut second, UNIT_SIZE);
  assert!(!page_ref.bitmap(&layout).get(head + 1).unwrap());

  let kept = first.unwrap();
  let changed = alloc
    .reallocate(&mut first, UNIT_SIZE, 2 * UNIT_SIZE, false)
    .unwrap();
  assert!(!changed);
  assert_eq!(first, Some(kept));
  assert!(page_ref.bitmap(&layout).get(head + 1).unwrap());

  alloc.release(&mut first, 2 * UNIT_SIZE);
  assert_eq!(alloc.stats().blocks_allocated(), 0);
  assert_eq!(alloc.num_pages(), 0);
}

#[test]
fn test_small_shrink_in_place() {
  let alloc = BitmapAllocator::new();
  let layout = alloc.layout();
  let head = layout.header_units();

  let mut addr = alloc.allocate(4 * UNIT_SIZE, false).unwrap();
  fill(addr.unwrap(), 4 * UNIT_SIZE, 0x21);
  let kept = addr.unwrap();

  let changed = alloc
    .reallocate(&mut addr, 4 * UNIT_SIZE, UNIT_SIZE, false)
    .unwrap();
  assert!(!changed);
  assert_eq!(addr, Some(kept));
  assert_filled(kept, UNIT_SIZE, 0x21);

  let page = unsafe { BmPage::from_addr(kept) };
  let bitmap = unsafe { page.as_ref() }.bitmap(&layout);
  assert!(bitmap.get(head).unwrap());
  for i in 1..4 {
    assert!(!bitmap.get(head + i).unwrap(), "unit {i} still marked");
  }

  alloc.release(&mut addr, UNIT_SIZE);
  assert_eq!(alloc.stats().blocks_allocated(), 0);
  assert_eq!(alloc.num_pages(), 0);
}

#[test]
fn test_large_to_small_shrink() {
  let alloc = BitmapAllocator::new();
  let ps = alloc.layout().page_size();

  let mut addr = alloc.allocate(2 * ps, false).unwrap();
  fill(addr.unwrap(), 48, 0x77);

  let changed = alloc.reallocate(&mut addr, 2 * ps, 48, false).unwrap();
  let block = addr.unwrap();
  assert!(changed);
  assert!(!is_page_aligned(block.as_ptr() as usize));
  assert_filled(block, 48, 0x77);
  assert_eq!(alloc.stats().blocks_allocated(), 1);
  assert_eq!(alloc.num_pages(), 1);

  alloc.release(&mut addr, 48);
  assert_eq!(alloc.stats().blocks_allocated(), 0);
  assert_eq!(alloc.num_pages(), 0);
}

#[test]
fn test_large_grow_preserves_contents() {
  let alloc = BitmapAllocator::new();
  let ps = alloc.layout().page_size();

  let mut addr = alloc.allocate(2 * ps, false).unwrap();
  fill(addr.unwrap(), 2 * ps, 0x42);

  let changed = alloc.reallocate(&mut addr, 2 * ps, 6 * ps, true).unwrap();
  let block = addr.unwrap();
  assert!(is_page_aligned(block.as_ptr() as usize));
  assert_filled(block, 2 * ps, 0x42);
  assert!(bytes(block, 6 * ps)[2 * ps..].iter().all(|&b| b == 0));
  let _ = changed; // the system may or may not have moved the mapping

  alloc.release(&mut addr, 6 * ps);
  assert_eq!(alloc.stats().blocks_allocated(), 0);
}

#[test]
fn test_same_unit_reallocate_keeps_address() {
  let alloc = BitmapAllocator::new();

  let mut addr = alloc.allocate(17, false).unwrap();
  fill(addr.unwrap(), 17, 0x33);
  let kept = addr.unwrap();

  let changed = alloc.reallocate(&mut addr, 17, 2 * UNIT_SIZE, true).unwrap();
  assert!(!changed);
  assert_eq!(addr, Some(kept));
  assert_filled(kept, 17, 0x33);
  assert!(bytes(kept, 2 * UNIT_SIZE)[17..].iter().all(|&b| b == 0));

  alloc.release(&mut addr, 2 * UNIT_SIZE);
  assert_eq!(alloc.stats().blocks_allocated(), 0);
}

#[test]
fn test_clean_allocations_are_zeroed() {
  let alloc = BitmapAllocator::new();
  let ps = alloc.layout().page_size();

  for nbytes in [1, UNIT_SIZE, 7 * UNIT_SIZE + 3, ps / 2, ps, 3 * ps + 1] {
    let mut addr = alloc.allocate(nbytes, true).unwrap();
    let block = addr.unwrap();
    assert_filled(block, nbytes, 0);
    // dirty it so a reused page would be caught next time around
    fill(block, nbytes, 0xDD);
    alloc.release(&mut addr, nbytes);
  }
  assert_eq!(alloc.stats().blocks_allocated(), 0);
  assert_eq!(alloc.num_pages(), 0);
}

#[test]
fn test_best_fit_reuses_partial_page() {
  let alloc = BitmapAllocator::new();

  let mut a = alloc.allocate(5 * UNIT_SIZE, false).unwrap();
  let mut b = alloc.allocate(9 * UNIT_SIZE, false).unwrap();
  assert_eq!(
    unsafe { BmPage::from_addr(a.unwrap()) },
    unsafe { BmPage::from_addr(b.unwrap()) },
    "both blocks fit one page"
  );
  assert_eq!(alloc.num_pages(), 1);

  alloc.release(&mut a, 5 * UNIT_SIZE);
  alloc.release(&mut b, 9 * UNIT_SIZE);
  assert_eq!(alloc.num_pages(), 0);
}

#[test]
fn test_page_bucket_tracks_longest_free() {
  let alloc = BitmapAllocator::new();
  let layout = alloc.layout();

  let mut a = alloc.allocate(2 * UNIT_SIZE, false).unwrap();
  let page = unsafe { BmPage::from_addr(a.unwrap()) };
  let check = |when: &str| {
    let page_ref = unsafe { page.as_ref() };
    assert_eq!(page_ref.bucket(), page_ref.longest_free(&layout), "{when}");
  };
  check("after first allocation");

  let mut b = alloc.allocate(5 * UNIT_SIZE, false).unwrap();
  check("after second allocation");
  let mut c = alloc.allocate(UNIT_SIZE, false).unwrap();
  check("after third allocation");

  alloc.release(&mut b, 5 * UNIT_SIZE);
  check("after releasing the middle block");
  alloc.release(&mut a, 2 * UNIT_SIZE);
  check("after releasing the first block");

  alloc.release(&mut c, UNIT_SIZE);
  assert_eq!(alloc.num_pages(), 0);
}

#[test]
fn test_spills_to_new_pages_and_drains() {
  let alloc = BitmapAllocator::new();
  let layout = alloc.layout();
  let quarter = (layout.max_data_units() / 4) * UNIT_SIZE;

  let mut blocks: Vec<Addr> = (0..12)
    .map(|_| alloc.allocate(quarter, false).unwrap())
    .collect();
  assert!(alloc.num_pages() >= 2, "twelve quarter-page blocks spill");
  assert_eq!(alloc.stats().blocks_allocated(), 12);

  for addr in blocks.iter_mut() {
    alloc.release(addr, quarter);
  }
  assert_eq!(alloc.stats().blocks_allocated(), 0);
  assert_eq!(alloc.num_pages(), 0);
}

#[test]
#[should_panic(expected = "zero size")]
fn test_release_zero_size_is_fatal() {
  let alloc = BitmapAllocator::new();
  let mut addr = alloc.allocate(UNIT_SIZE, false).unwrap();
  alloc.release(&mut addr, 0);
}

#[test]
fn test_reallocate_invalid_arguments() {
  let alloc = BitmapAllocator::new();

  let mut empty: Addr = None;
  assert!(matches!(
    alloc.reallocate(&mut empty, 5, 10, false),
    Err(AllocError::InvalidArgument(_))
  ));
  // equal sizes are an unconditional no-op, even with no block
  assert_eq!(alloc.reallocate(&mut empty, 0, 0, false), Ok(false));
  assert_eq!(alloc.reallocate(&mut empty, 7, 7, false), Ok(false));
  assert_eq!(empty, None);

  let mut addr = alloc.allocate(UNIT_SIZE, false).unwrap();
  let kept = addr;
  assert!(matches!(
    alloc.reallocate(&mut addr, UNIT_SIZE, 0, false),
    Err(AllocError::InvalidArgument(_))
  ));
  assert!(matches!(
    alloc.reallocate(&mut addr, 0, UNIT_SIZE, false),
    Err(AllocError::InvalidArgument(_))
  ));
  assert_eq!(addr, kept, "failed reallocate leaves the address alone");

  alloc.release(&mut addr, UNIT_SIZE);
  assert_eq!(alloc.stats().blocks_allocated(), 0);
}

#[test]
fn test_reallocate_from_empty_allocates() {
  let alloc = BitmapAllocator::new();

  let mut addr: Addr = None;
  let changed = alloc.reallocate(&mut addr, 0, 3 * UNIT_SIZE, true).unwrap();
  assert!(changed);
  let block = addr.expect("allocated through reallocate");
  assert_filled(block, 3 * UNIT_SIZE, 0);

  alloc.release(&mut addr, 3 * UNIT_SIZE);
  assert_eq!(alloc.stats().blocks_allocated(), 0);
}

#[test]
fn test_zero_size_and_empty_are_noops() {
  let alloc = BitmapAllocator::new();

  assert_eq!(alloc.allocate(0, true).unwrap(), None);
  assert_eq!(alloc.stats().blocks_allocated(), 0);
  assert_eq!(alloc.num_pages(), 0);

  let mut addr: Addr = None;
  alloc.release(&mut addr, 123);
  assert_eq!(alloc.stats().blocks_allocated(), 0);
}

struct Shadow {
  addr: NonNull<u8>,
  nbytes: usize,
  pattern: u8,
}

#[test]
fn test_random_stress_with_shadow_model() {
  init_logs();
  let alloc = BitmapAllocator::new();
  let ps = alloc.layout().page_size();
  let mut rng = StdRng::seed_from_u64(0xB17_A110C);
  let mut live: Vec<Shadow> = Vec::new();
  let mut serial: u8 = 0;

  for _ in 0..2000 {
    let action = rng.random_range(0..10);
    if action < 5 || live.is_empty() {
      // allocate, large once in a while
      let nbytes = if rng.random_bool(0.1) {
        rng.random_range(ps..3 * ps)
      } else {
        rng.random_range(1..=ps / 8)
      };
      let clean = rng.random_bool(0.5);
      let block = alloc.allocate(nbytes, clean).unwrap().unwrap();
      if clean {
        assert_filled(block, nbytes, 0);
      }
      serial = serial.wrapping_add(1).max(1);
      fill(block, nbytes, serial);
      live.push(Shadow {
        addr: block,
        nbytes,
        pattern: serial,
      });
    } else if action < 8 {
      let victim = live.swap_remove(rng.random_range(0..live.len()));
      assert_filled(victim.addr, victim.nbytes, victim.pattern);
      let mut addr = Some(victim.addr);
      alloc.release(&mut addr, victim.nbytes);
      assert_eq!(addr, None);
    } else {
      let index = rng.random_range(0..live.len());
      let old_nbytes = live[index].nbytes;
      let new_nbytes = rng.random_range(1..=ps / 4);
      let mut addr = Some(live[index].addr);
      alloc
        .reallocate(&mut addr, old_nbytes, new_nbytes, false)
        .unwrap();
      let block = addr.unwrap();
      let preserved = old_nbytes.min(new_nbytes);
      assert_filled(block, preserved, live[index].pattern);
      serial = serial.wrapping_add(1).max(1);
      fill(block, new_nbytes, serial);
      live[index] = Shadow {
        addr: block,
        nbytes: new_nbytes,
        pattern: serial,
      };
    }
  }

  for shadow in live.drain(..) {
    assert_filled(shadow.addr, shadow.nbytes, shadow.pattern);
    let mut addr = Some(shadow.addr);
    alloc.release(&mut addr, shadow.nbytes);
  }
  assert_eq!(alloc.stats().blocks_allocated(), 0);
  assert_eq!(alloc.num_pages(), 0);
}

#[test]
fn test_threaded_allocate_release() {
  let alloc = BitmapAllocator::new();
  let threads = 4;
  let rounds = 300;

  std::thread::scope(|scope| {
    for thread in 0..threads {
      let alloc = &alloc;
      scope.spawn(move || {
        let mut rng = StdRng::seed_from_u64(thread as u64);
        let mut mine: Vec<Shadow> = Vec::new();
        for _ in 0..rounds {
          if rng.random_bool(0.6) || mine.is_empty() {
            let nbytes = rng.random_range(1..=6 * UNIT_SIZE);
            let block = alloc.allocate(nbytes, false).unwrap().unwrap();
            let pattern = thread as u8 + 1;
            fill(block, nbytes, pattern);
            mine.push(Shadow {
              addr: block,
              nbytes,
              pattern,
            });
          } else {
            let victim = mine.swap_remove(rng.random_range(0..mine.len()));
            assert_filled(victim.addr, victim.nbytes, victim.pattern);
            let mut addr = Some(victim.addr);
            alloc.release(&mut addr, victim.nbytes);
          }
        }
        for shadow in mine.drain(..) {
          assert_filled(shadow.addr, shadow.nbytes, shadow.pattern);
          let mut addr = Some(shadow.addr);
          alloc.release(&mut addr, shadow.nbytes);
        }
      });
    }
  });

  assert_eq!(alloc.stats().blocks_allocated(), 0);
  assert_eq!(alloc.num_pages(), 0);
}

#[test]
fn test_dump_walks_the_directory() {
  let alloc = BitmapAllocator::new();
  let mut a = alloc.allocate(2 * UNIT_SIZE, false).unwrap();
  let mut b = alloc.allocate(3 * alloc.layout().page_size(), false).unwrap();
  alloc.dump();
  alloc.release(&mut a, 2 * UNIT_SIZE);
  alloc.release(&mut b, 3 * alloc.layout().page_size());
}

#[test]
fn test_stdlib_allocator_contract() {
  let alloc = StdAllocator::new();

  assert_eq!(alloc.allocate(0, false).unwrap(), None);

  let mut addr = alloc.allocate(64, true).unwrap();
  let block = addr.unwrap();
  assert_filled(block, 64, 0);
  fill(block, 64, 0x9C);
  assert_eq!(alloc.stats().blocks_allocated(), 1);

  let changed = alloc.reallocate(&mut addr, 64, 256, true).unwrap();
  let grown = addr.unwrap();
  assert_filled(grown, 64, 0x9C);
  assert!(bytes(grown, 256)[64..].iter().all(|&b| b == 0));
  let _ = changed; // the host may grow in place or move

  let mut empty: Addr = None;
  assert!(matches!(
    alloc.reallocate(&mut empty, 8, 16, false),
    Err(AllocError::InvalidArgument(_))
  ));
  let created = alloc.reallocate(&mut empty, 0, 32, false).unwrap();
  assert!(created);
  alloc.release(&mut empty, 32);

  alloc.release(&mut addr, 256);
  assert_eq!(addr, None);
  assert_eq!(alloc.stats().blocks_allocated(), 0);
}

#[test]
fn test_debug_allocator_cycle() {
  let alloc = DebugAllocator::new();

  let mut addr = alloc.allocate(100, true).unwrap();
  let block = addr.unwrap();
  assert_filled(block, 100, 0);
  fill(block, 100, 0x6E);

  let changed = alloc.reallocate(&mut addr, 100, 200, true).unwrap();
  assert!(changed);
  let grown = addr.unwrap();
  assert_filled(grown, 100, 0x6E);
  assert!(bytes(grown, 200)[100..].iter().all(|&b| b == 0));

  alloc.release(&mut addr, 200);
  assert_eq!(addr, None);
  assert_eq!(alloc.stats().blocks_allocated(), 0);
}

#[test]
#[should_panic(expected = "damaged above")]
fn test_red_zone_detects_write_past_end() {
  let alloc = DebugAllocator::new();
  let mut addr = alloc.allocate(10, false).unwrap();
  unsafe { addr.unwrap().as_ptr().add(10).write(0) };
  alloc.release(&mut addr, 10);
}

#[test]
#[should_panic(expected = "damaged below")]
fn test_red_zone_detects_write_before_start() {
  let alloc = DebugAllocator::new();
  let mut addr = alloc.allocate(24, false).unwrap();
  unsafe { addr.unwrap().as_ptr().sub(1).write(0) };
  alloc.release(&mut addr, 24);
}

#[test]
#[should_panic(expected = "sizes disagree")]
fn test_debug_release_size_mismatch() {
  let alloc = DebugAllocator::new();
  let mut addr = alloc.allocate(32, false).unwrap();
  alloc.release(&mut addr, 16);
}

#[test]
fn test_default_instance_wrappers() {
  let installed = install(&BITMAP);
  assert_eq!(installed.stats() as *const _, BITMAP.stats() as *const _);

  let mut addr = allocate(40, true).unwrap();
  let block = addr.expect("default allocator serves small blocks");
  assert_filled(block, 40, 0);

  let changed = reallocate(&mut addr, 40, 80, true).unwrap();
  let _ = changed;
  assert_filled(addr.unwrap(), 40, 0);

  release(&mut addr, 80);
  assert_eq!(addr, None);
  dump();
}

#[test]
fn test_global_alloc_adapter() {
  use core::alloc::{
    GlobalAlloc,
    Layout,
  };

  unsafe {
    let layout = Layout::from_size_align(100, 8).unwrap();
    let block = GlobalBitmap.alloc(layout);
    assert!(!block.is_null());
    core::ptr::write_bytes(block, 0xAB, 100);

    let grown = GlobalBitmap.realloc(block, layout, 300);
    assert!(!grown.is_null());
    for i in 0..100 {
      assert_eq!(*grown.add(i), 0xAB);
    }
    GlobalBitmap.dealloc(grown, Layout::from_size_align(300, 8).unwrap());

    let zeroed_layout = Layout::from_size_align(64, 16).unwrap();
    let zeroed = GlobalBitmap.alloc_zeroed(zeroed_layout);
    for i in 0..64 {
      assert_eq!(*zeroed.add(i), 0);
    }
    GlobalBitmap.dealloc(zeroed, zeroed_layout);

    // more than unit alignment is refused
    assert!(GlobalBitmap.alloc(Layout::from_size_align(64, 64).unwrap()).is_null());

    // zero-size allocations get a dangling address and a no-op dealloc
    let empty_layout = Layout::from_size_align(0, 8).unwrap();
    let dangling = GlobalBitmap.alloc(empty_layout);
    assert!(!dangling.is_null());
    GlobalBitmap.dealloc(dangling, empty_layout);
  }
}
