//! Intrusive circular doubly-linked list (`struct list_head`).
//!
//! Links are embedded in the owning structure and point at each other's
//! `ListHead`; [`container_of!`] recovers the owner. A list is circular and
//! empty when the head links to itself. Nodes must not move while linked.
//!
//! There is no locking. Lists are shared the way the hosted code shares them,
//! under its own protection.

use std::cell::Cell;
use std::ptr::{self, NonNull};

/// `struct list_head`: a pair of links.
#[derive(Debug)]
pub struct ListHead {
    next: Cell<*const ListHead>,
    prev: Cell<*const ListHead>,
}

impl Default for ListHead {
    fn default() -> Self {
        Self::new()
    }
}

impl ListHead {
    /// Unlinked head. Call [`Self::init_empty`] once it sits at its final
    /// address.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            next: Cell::new(ptr::null()),
            prev: Cell::new(ptr::null()),
        }
    }

    /// `INIT_LIST_HEAD`: make this head an empty circular list.
    pub fn init_empty(&self) {
        let me: *const ListHead = self;
        self.next.set(me);
        self.prev.set(me);
    }

    /// `list_empty`.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        ptr::eq(self.next.get(), self)
    }

    /// Successor link, `None` while uninitialized.
    #[must_use]
    pub fn next(&self) -> Option<NonNull<ListHead>> {
        NonNull::new(self.next.get().cast_mut())
    }

    /// Predecessor link, `None` while uninitialized.
    #[must_use]
    pub fn prev(&self) -> Option<NonNull<ListHead>> {
        NonNull::new(self.prev.get().cast_mut())
    }

    /// `list_add`: link `new` right after this head (stack order).
    ///
    /// # Safety
    ///
    /// `self` must be initialized and every node of its list alive and
    /// unmoved; `new` must not be linked elsewhere and must stay alive and
    /// unmoved while linked.
    pub unsafe fn insert_after(&self, new: &ListHead) {
        let next = self.next.get();
        // SAFETY: forwarded to the caller.
        unsafe { link_between(new, self, next) };
    }

    /// `list_add_tail`: link `new` right before this head (queue order).
    ///
    /// # Safety
    ///
    /// Same contract as [`Self::insert_after`].
    pub unsafe fn insert_before(&self, new: &ListHead) {
        let prev = self.prev.get();
        // SAFETY: forwarded to the caller.
        unsafe { link_between(new, prev, self) };
    }

    /// `list_for_each`: every node after the head, in link order.
    ///
    /// # Safety
    ///
    /// The list must be initialized, intact, and left unmodified while the
    /// iterator is in use.
    #[must_use]
    pub unsafe fn iter(&self) -> Iter<'_> {
        Iter {
            head: self,
            cursor: self.next.get(),
        }
    }

    /// Walk the list and confirm every `next.prev` points back.
    ///
    /// Stops at the first broken or missing link, so a corrupted list is
    /// reported instead of traversed forever.
    ///
    /// # Safety
    ///
    /// Every node reachable through `next` links up to the first broken one
    /// must be alive.
    #[must_use]
    pub unsafe fn check_integrity(&self) -> bool {
        let head: *const ListHead = self;
        let mut cur = head;
        loop {
            // SAFETY: `cur` is the head or a node reached through an intact
            // link; the caller keeps those alive.
            let next = unsafe { (*cur).next.get() };
            if next.is_null() {
                return false;
            }
            // SAFETY: as above.
            if !ptr::eq(unsafe { (*next).prev.get() }, cur) {
                return false;
            }
            if ptr::eq(next, head) {
                return true;
            }
            cur = next;
        }
    }
}

unsafe fn link_between(new: &ListHead, prev: *const ListHead, next: *const ListHead) {
    // SAFETY: `prev` and `next` are live neighbours (caller contract).
    unsafe {
        (*next).prev.set(new);
        (*prev).next.set(new);
    }
    new.next.set(next);
    new.prev.set(prev);
}

/// Iterator over the nodes of a list, excluding the head.
pub struct Iter<'a> {
    head: &'a ListHead,
    cursor: *const ListHead,
}

impl Iterator for Iter<'_> {
    type Item = NonNull<ListHead>;

    fn next(&mut self) -> Option<NonNull<ListHead>> {
        if ptr::eq(self.cursor, self.head) {
            return None;
        }
        let node = NonNull::new(self.cursor.cast_mut())?;
        // SAFETY: `iter`'s contract keeps every node alive and linked.
        self.cursor = unsafe { node.as_ref() }.next.get();
        Some(node)
    }
}

/// `container_of(ptr, type, member)`: owner of an embedded field.
///
/// Expands to a `*const $ty`. Dereferencing it is unsafe and only valid when
/// `$ptr` really points at the `$field` of a live `$ty`.
#[macro_export]
macro_rules! container_of {
    ($ptr:expr, $ty:ty, $field:ident) => {{
        let field: *const _ = $ptr;
        field
            .cast::<u8>()
            .wrapping_sub(::core::mem::offset_of!($ty, $field))
            .cast::<$ty>()
    }};
}

#[cfg(all(test, not(feature = "loom")))]
mod tests {
    use super::*;

    struct Callback {
        id: u32,
        link: ListHead,
    }

    impl Callback {
        fn new(id: u32) -> Self {
            Self {
                id,
                link: ListHead::new(),
            }
        }
    }

    fn ids(head: &ListHead) -> Vec<u32> {
        // SAFETY: every node in these tests outlives the walk.
        unsafe {
            head.iter()
                .map(|node| (*container_of!(node.as_ptr(), Callback, link)).id)
                .collect()
        }
    }

    #[test]
    fn fresh_head_is_empty_after_init() {
        let head = ListHead::new();
        assert!(head.next().is_none());
        head.init_empty();
        assert!(head.is_empty());
        // SAFETY: initialized head with no nodes.
        assert!(unsafe { head.check_integrity() });
        assert!(ids(&head).is_empty());
    }

    #[test]
    fn insert_after_is_stack_order() {
        let head = ListHead::new();
        head.init_empty();
        let (a, b, c) = (Callback::new(1), Callback::new(2), Callback::new(3));
        // SAFETY: nodes live until the end of the test and never move.
        unsafe {
            head.insert_after(&a.link);
            head.insert_after(&b.link);
            head.insert_after(&c.link);
        }
        assert!(!head.is_empty());
        assert_eq!(ids(&head), vec![3, 2, 1]);
        // SAFETY: as above.
        assert!(unsafe { head.check_integrity() });
    }

    #[test]
    fn insert_before_is_queue_order() {
        let head = ListHead::new();
        head.init_empty();
        let nodes: Vec<Callback> = (10..14).map(Callback::new).collect();
        for node in &nodes {
            // SAFETY: `nodes` is not resized while linked.
            unsafe { head.insert_before(&node.link) };
        }
        assert_eq!(ids(&head), vec![10, 11, 12, 13]);
        let last = head.prev().unwrap();
        // SAFETY: the tail node is alive.
        let last = unsafe { &*container_of!(last.as_ptr(), Callback, link) };
        assert_eq!(last.id, 13);
    }

    #[test]
    fn integrity_check_catches_broken_back_link() {
        let head = ListHead::new();
        head.init_empty();
        let (a, b) = (Callback::new(1), Callback::new(2));
        // SAFETY: nodes outlive the list.
        unsafe {
            head.insert_before(&a.link);
            head.insert_before(&b.link);
        }
        b.link.prev.set(&b.link);
        // SAFETY: nodes are alive; the walk stops at the broken link.
        assert!(!unsafe { head.check_integrity() });
    }
}
