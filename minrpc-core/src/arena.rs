//! Per-packet scratch arena.
//!
//! The event handler decodes a packed argument sequence into views backed by
//! this arena, and stages bulk copy payloads here too. Everything the arena
//! hands out stays valid until [`Arena::recycle_all`] runs, which happens
//! exactly once per return to the idle state (`RecvPacketNumBytes`) — each
//! [`ArenaSlice`] holds its own reference to the backing page, so it is free
//! to outlive the `&mut Arena` borrow used to create it and several can be
//! alive at once (an argument array, several string views, a copy staging
//! buffer), matching how the packed codec decodes a whole argument list in
//! one pass.
//!
//! This is the only module in the crate allowed to hold raw pointers; every
//! invariant that makes that safe is enforced here so the rest of the
//! protocol stack can stay ordinary safe Rust operating on `&[u8]`/`Bytes`.

#![allow(unsafe_code)]

use std::alloc::{alloc, dealloc, Layout};
use std::ops::{Deref, DerefMut};
use std::ptr::NonNull;
use std::sync::Arc;

/// Size of one arena page. Large enough that most packets fit one allocation.
pub const PAGE_SIZE: usize = 64 * 1024;
const PAGE_ALIGN: usize = 16;

struct Page {
    ptr: NonNull<u8>,
    layout: Layout,
}

// SAFETY: Page is an owned heap allocation; no aliasing mutable access
// happens once an ArenaSlice has been handed out (the arena never reuses a
// page's bytes until the last ArenaSlice referencing it is dropped, which
// `recycle_all` guarantees by only truncating pages with refcount 1).
unsafe impl Send for Page {}
unsafe impl Sync for Page {}

impl Drop for Page {
    fn drop(&mut self) {
        unsafe { dealloc(self.ptr.as_ptr(), self.layout) };
    }
}

/// An arena allocation: owns a reference to its backing page, so it is not
/// tied to the arena's borrow and several can be live simultaneously.
pub struct ArenaSlice {
    _page: Arc<Page>,
    ptr: NonNull<u8>,
    len: usize,
}

// SAFETY: ArenaSlice has exclusive access to its byte range for its entire
// lifetime (the arena never re-issues that range until the page is freed).
unsafe impl Send for ArenaSlice {}
unsafe impl Sync for ArenaSlice {}

impl Deref for ArenaSlice {
    type Target = [u8];
    fn deref(&self) -> &[u8] {
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr(), self.len) }
    }
}

impl DerefMut for ArenaSlice {
    fn deref_mut(&mut self) -> &mut [u8] {
        unsafe { std::slice::from_raw_parts_mut(self.ptr.as_ptr(), self.len) }
    }
}

/// Bump allocator recycled once per packet.
pub struct Arena {
    current: Option<Arc<Page>>,
    offset: usize,
}

impl Default for Arena {
    fn default() -> Self {
        Self::new()
    }
}

impl Arena {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            current: None,
            offset: PAGE_SIZE, // force a page allocation on first use
        }
    }

    /// Allocate `size` uninitialized bytes.
    ///
    /// # Panics
    ///
    /// Allocation failure is fatal to the process: arena exhaustion on a
    /// single packet is unrecoverable.
    pub fn alloc_slice(&mut self, size: usize) -> ArenaSlice {
        if size > PAGE_SIZE {
            return self.alloc_dedicated_page(size);
        }

        if self.current.is_none() || self.offset + size > PAGE_SIZE {
            self.alloc_page(PAGE_SIZE);
        }

        let page = self.current.as_ref().unwrap().clone();
        let ptr = unsafe { NonNull::new_unchecked(page.ptr.as_ptr().add(self.offset)) };
        self.offset += size;

        ArenaSlice {
            _page: page,
            ptr,
            len: size,
        }
    }

    /// Copy `src` into a fresh arena allocation and return it.
    pub fn alloc_copy(&mut self, src: &[u8]) -> ArenaSlice {
        let mut slot = self.alloc_slice(src.len());
        slot.copy_from_slice(src);
        slot
    }

    fn alloc_dedicated_page(&mut self, size: usize) -> ArenaSlice {
        let layout = Layout::from_size_align(size, PAGE_ALIGN).expect("valid layout");
        let ptr = unsafe { alloc(layout) };
        let Some(ptr) = NonNull::new(ptr) else {
            std::alloc::handle_alloc_error(layout);
        };
        let page = Arc::new(Page { ptr, layout });
        ArenaSlice {
            _page: page,
            ptr,
            len: size,
        }
    }

    fn alloc_page(&mut self, size: usize) {
        let layout = Layout::from_size_align(size, PAGE_ALIGN).expect("valid layout");
        let ptr = unsafe { alloc(layout) };
        let Some(ptr) = NonNull::new(ptr) else {
            std::alloc::handle_alloc_error(layout);
        };
        self.current = Some(Arc::new(Page { ptr, layout }));
        self.offset = 0;
    }

    /// Drop the arena's own reference to its current page. Any
    /// [`ArenaSlice`]s still held by a caller keep the underlying memory
    /// alive until they too are dropped; the next allocation request simply
    /// starts a fresh page. Callers must not hold arena slices across a
    /// recycle if they intend to reuse the memory — the idle-state
    /// invariant is that nothing from the previous packet is referenced
    /// past this point.
    pub fn recycle_all(&mut self) {
        self.current = None;
        self.offset = PAGE_SIZE;
    }
}
