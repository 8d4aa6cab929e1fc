//! Request sequence numbers

use std::sync::atomic::{AtomicU8, Ordering};

/// Hands out management sequence numbers
///
/// Starts at a random value and wraps after 255. Shared by every command
/// sent over one session so that concurrent requests get distinct keys.
#[derive(Debug)]
pub struct SeqAllocator {
    next: AtomicU8,
}

impl SeqAllocator {
    /// Create an allocator starting at a random sequence number
    pub fn new() -> Self {
        Self::starting_at(rand::random())
    }

    /// Create an allocator whose first number is `first`
    pub fn starting_at(first: u8) -> Self {
        Self {
            next: AtomicU8::new(first),
        }
    }

    /// Take the next sequence number
    pub fn next_seq(&self) -> u8 {
        self.next.fetch_add(1, Ordering::Relaxed)
    }
}

impl Default for SeqAllocator {
    fn default() -> Self {
        Self::new()
    }
}
