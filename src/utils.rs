//! Helper functions that don't particularly belong to any concrete module.

/// Rounds `value` up to the next multiple of `alignment`.
///
/// Used to round commit and decommit ranges to page boundaries, since the OS
/// primitives ([`libc::mprotect`] and friends) only operate on whole pages,
/// and to keep region sizes a multiple of the header alignment. Saturates at
/// the largest aligned `usize` instead of overflowing, so callers can feed it
/// untrusted sizes and let the capacity check reject them. `alignment` must
/// be a power of two.
pub(crate) fn align_up(value: usize, alignment: usize) -> usize {
    match value.checked_add(alignment - 1) {
        Some(padded) => padded & !(alignment - 1),
        None => usize::MAX & !(alignment - 1),
    }
}
