//! Poll span helpers.

use tracing::Span;

/// Start a span covering one poll attempt.
///
/// `poll.outcome` and the count fields are declared empty and filled by
/// [`record_poll_result`].
pub fn start_poll_span(attempt: u64) -> Span {
    tracing::info_span!(
        "feed.poll",
        "poll.attempt" = attempt,
        "poll.outcome" = tracing::field::Empty,
        "poll.fetched" = tracing::field::Empty,
        "poll.inserted" = tracing::field::Empty,
        "poll.next_in_secs" = tracing::field::Empty,
    )
}

pub fn record_poll_result(span: &Span, outcome: &str, fetched: usize, inserted: u64, next_in_secs: u64) {
    span.record("poll.outcome", outcome);
    span.record("poll.fetched", fetched);
    span.record("poll.inserted", inserted);
    span.record("poll.next_in_secs", next_in_secs);
}

/// Emit a scheduler phase change inside `span`.
pub fn record_phase_change(span: &Span, from: &str, to: &str) {
    span.in_scope(|| {
        tracing::debug!(from = from, to = to, "scheduler phase change");
    });
}
