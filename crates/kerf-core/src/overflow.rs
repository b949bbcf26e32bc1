//! Overflow chain reassembly.
//!
//! Payload that does not fit inside a btree page spills to a chain of
//! overflow pages. Each overflow page starts with a 4-byte big-endian link to
//! the next page in the chain (0 terminates); the rest of the usable region
//! is payload. Chains in damaged images routinely point at garbage, so every
//! link is validated and an explicit visited set breaks cycles.

use crate::error::{Error, Result};
use crate::pager::PageSource;
use std::collections::HashSet;
use tracing::trace;

/// Follow an overflow chain starting at `first`, concatenating payload.
///
/// `limit` bounds the number of payload bytes collected; `None` reads until
/// the chain terminates. Pages are stitched in chain order, terminal page
/// last.
///
/// # Errors
///
/// All errors here are recoverable at the record level:
/// - [`Error::PageOutOfRange`] for a link outside `1..=page_count`
/// - [`Error::OverflowCycle`] when a page is revisited
/// - [`Error::Truncated`] when the chain ends before `limit` bytes arrive
pub fn read_overflow(
    source: &dyn PageSource,
    first: u32,
    limit: Option<usize>,
) -> Result<Vec<u8>> {
    let page_count = source.page_count();
    let usable = source.usable_size();
    let mut payload = Vec::new();
    let mut visited = HashSet::new();
    let mut current = first;

    while current != 0 {
        if current > page_count {
            return Err(Error::page_out_of_range(current, page_count));
        }
        if !visited.insert(current) {
            return Err(Error::overflow_cycle(current));
        }

        let page = source
            .read_page(current)
            .ok_or_else(|| Error::page_out_of_range(current, page_count))?;
        let data = page.data();
        if data.len() < 4 {
            return Err(Error::truncated(payload.len()));
        }

        let next = u32::from_be_bytes([data[0], data[1], data[2], data[3]]);
        let content = &data[4..data.len().min(usable)];

        match limit {
            Some(limit) => {
                let want = limit - payload.len();
                let take = want.min(content.len());
                payload.extend_from_slice(&content[..take]);
                if payload.len() >= limit {
                    trace!("overflow chain satisfied {limit} bytes across {} pages", visited.len());
                    return Ok(payload);
                }
            }
            None => payload.extend_from_slice(content),
        }

        current = next;
    }

    if let Some(limit) = limit {
        if payload.len() < limit {
            return Err(Error::truncated(payload.len()));
        }
    }
    Ok(payload)
}
