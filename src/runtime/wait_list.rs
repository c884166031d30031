//! Wait-list construction with same-stream deduplication
//!
//! Within one native stream command order is FIFO, so waiting on the newest
//! event recorded on a stream transitively waits on every earlier one. The
//! builder therefore retains, per stream, only the event with the highest
//! sequence token. Interop events carry no stream-relative ordering
//! guarantee and are never elided.
//!
//! This runs on the hot path of every enqueue call: the empty and
//! single-event cases allocate nothing.

use crate::error::HalResult;
use crate::runtime::event::Event;

/// Apply `f` to the latest event per stream in `wait_list`.
///
/// Tiered sort creating sublists of streams (smallest identity first) in
/// which the corresponding events are sorted into a sequence of newest
/// first; a linear pass then keeps each sublist's head. Iteration stops at
/// the first error.
pub(crate) fn for_latest_events<F>(wait_list: &[Event], mut f: F) -> HalResult<()>
where
    F: FnMut(&Event) -> HalResult<()>,
{
    // An empty list is a valid "no dependencies" request.
    if wait_list.is_empty() {
        return Ok(());
    }

    // Fast path if we only have a single event
    if wait_list.len() == 1 {
        return f(&wait_list[0]);
    }

    let mut events: Vec<&Event> = wait_list.iter().collect();
    events.sort_by(|a, b| {
        a.stream_key()
            .cmp(&b.stream_key())
            .then_with(|| b.sequence().cmp(&a.sequence()))
    });

    let mut last_stream: Option<u64> = None;
    for event in events {
        if !event.is_interop() && last_stream == Some(event.stream_key()) {
            continue;
        }
        last_stream = Some(event.stream_key());
        f(event)?;
    }
    Ok(())
}

/// Materialized form of [`for_latest_events`], for callers that need the
/// retained set up front (wait-list length capping, diagnostics, tests).
pub fn latest_events(wait_list: &[Event]) -> HalResult<Vec<Event>> {
    let mut out = Vec::new();
    for_latest_events(wait_list, |event| {
        out.push(event.clone());
        Ok(())
    })?;
    Ok(out)
}
