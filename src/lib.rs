//! A malloc-style dynamic memory allocator over OS-granted anonymous memory.
//!
//! Every allocation lives in its own region obtained from the OS, with the
//! block's metadata embedded right before the payload:
//!
//! ```text
//! +----------------------------+
//! | Header | Actual payload    |
//! +----------------------------+
//! ```
//!
//! The headers form the *directory*: a singly linked chain of every block in
//! the order its region was acquired.
//!
//! ```text
//! +--------+-----------+      +--------+---------+      +--------+---------+
//! | Header |  Payload  | ---> | Header | Payload | ---> | Header | Payload |
//! +--------+-----------+      +--------+---------+      +--------+---------+
//!   used                        free                      used
//! ```
//!
//! [`Allocator::allocate`] scans the directory first-fit and only asks the OS
//! for a new region on a miss. [`Allocator::release`] marks a block free,
//! merges adjacent free blocks and gives the trailing region back to the OS
//! when the directory's tail ends up free. [`Allocator::zero_allocate`] is
//! the calloc analog, with an overflow-checked element count and a mandatory
//! zero fill.
//!
//! The allocator is single-threaded by contract and by construction: it is
//! neither `Send` nor `Sync`, and each instance owns all of its state, so
//! tests and callers can run as many independent allocators as they like.

mod allocator;
mod block;
mod error;
mod source;
mod utils;

pub use allocator::Allocator;
pub use error::{AllocError, AllocResult};
