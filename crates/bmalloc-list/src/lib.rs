#![cfg_attr(not(test), no_std)]

use core::{
  marker::PhantomData,
  ptr::NonNull,
  sync::atomic::{
    AtomicPtr,
    Ordering,
  },
};

#[cfg(test)]
pub mod tests;

pub trait HasLink {
  fn link(&self) -> &Link<Self>
  where
    Self: Sized;
}

#[derive(Debug)]
pub struct Link<T>
where
  T: HasLink,
{
  next: AtomicPtr<T>,
  prev: AtomicPtr<T>,
}

impl<T> Link<T>
where
  T: HasLink,
{
  pub const fn new() -> Self {
    Self {
      next: AtomicPtr::new(core::ptr::null_mut()),
      prev: AtomicPtr::new(core::ptr::null_mut()),
    }
  }

  pub fn next(&self) -> Option<NonNull<T>> {
    NonNull::new(self.next.load(Ordering::Acquire))
  }

  pub fn prev(&self) -> Option<NonNull<T>> {
    NonNull::new(self.prev.load(Ordering::Acquire))
  }

  pub fn set_next(&self, ptr: Option<NonNull<T>>) {
    let raw = ptr.map_or(core::ptr::null_mut(), |p| p.as_ptr());
    self.next.store(raw, Ordering::Release);
  }

  pub fn set_prev(&self, ptr: Option<NonNull<T>>) {
    let raw = ptr.map_or(core::ptr::null_mut(), |p| p.as_ptr());
    self.prev.store(raw, Ordering::Release);
  }

  /// A node is linked iff both neighbors are set; rings are never
  /// half-linked.
  pub fn is_linked(&self) -> bool {
    !self.next.load(Ordering::Acquire).is_null()
  }
}

impl<T> Default for Link<T>
where
  T: HasLink,
{
  fn default() -> Self {
    Self::new()
  }
}

/// Operations over a circular doubly-linked ring addressed through a head
/// slot. A ring of one node links to itself; an empty ring is `None` in the
/// slot.
pub struct Ring {}

impl Ring {
  /// Inserts `item` at the tail of the ring (just before the head node), or
  /// starts a fresh ring with `item` as head.
  ///
  /// # Safety
  ///
  /// `item` must point to a live, unlinked node, and every node reachable
  /// from `*head` must be live.
  pub unsafe fn push_tail<T>(head: &mut Option<NonNull<T>>, item: NonNull<T>)
  where
    T: HasLink,
  {
    let item_link = unsafe { item.as_ref() }.link();
    match *head {
      Some(first) => {
        let first_link = unsafe { first.as_ref() }.link();
        let last = first_link.prev().unwrap();
        item_link.set_prev(Some(last));
        item_link.set_next(Some(first));
        unsafe { last.as_ref() }.link().set_next(Some(item));
        first_link.set_prev(Some(item));
      }
      None => {
        item_link.set_next(Some(item));
        item_link.set_prev(Some(item));
        *head = Some(item);
      }
    }
  }

  /// Unlinks `item` from the ring. The slot is emptied only when `item` was
  /// the sole member; when `item` was the head, the head moves to its
  /// successor. The node's own links are cleared.
  ///
  /// # Safety
  ///
  /// `item` must be a live node linked into the ring headed by `*head`.
  pub unsafe fn remove<T>(head: &mut Option<NonNull<T>>, item: NonNull<T>)
  where
    T: HasLink,
  {
    let item_link = unsafe { item.as_ref() }.link();
    let next = item_link.next().unwrap();
    let prev = item_link.prev().unwrap();

    if next == item {
      *head = None;
    } else {
      unsafe { prev.as_ref() }.link().set_next(Some(next));
      unsafe { next.as_ref() }.link().set_prev(Some(prev));
      if *head == Some(item) {
        *head = Some(next);
      }
    }

    item_link.set_next(None);
    item_link.set_prev(None);
  }

  /// Walks the ring once, starting at the head.
  ///
  /// # Safety
  ///
  /// Every node in the ring must stay live and unlinked by nobody for the
  /// iterator's lifetime.
  pub unsafe fn iter<'ring, T>(head: Option<NonNull<T>>) -> RingIter<'ring, T>
  where
    T: HasLink + 'ring,
  {
    RingIter {
      head,
      next: head,
      started: false,
      marker: PhantomData,
    }
  }
}

pub struct RingIter<'ring, T>
where
  T: HasLink + 'ring,
{
  head: Option<NonNull<T>>,
  next: Option<NonNull<T>>,
  started: bool,
  marker: PhantomData<&'ring T>,
}

impl<'ring, T> Iterator for RingIter<'ring, T>
where
  T: HasLink + 'ring,
{
  type Item = &'ring T;

  fn next(&mut self) -> Option<Self::Item> {
    let current = self.next?;
    if self.started && Some(current) == self.head {
      return None;
    }
    self.started = true;
    let current_ref = unsafe { &*current.as_ptr() };
    self.next = current_ref.link().next();
    Some(current_ref)
  }
}
