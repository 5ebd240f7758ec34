//! Request matching
//!
//! Decides whether a live request corresponds to a recorded one. Checks run
//! in a fixed order and stop at the first mismatch:
//!
//! 1. Method, case-sensitive
//! 2. Target: path, raw query and fragment (never scheme or host)
//! 3. The headers named in the match policy, value lists compared in order
//! 4. Body: form fields when the live request carries a form, raw bytes
//!    otherwise
//!
//! Form comparison is driven by the live request's fields only. A recorded
//! form with extra fields the live request lacks still matches.

use crate::cassette::{Episode, RecordedRequest};

/// Whether `live` matches `recorded` under the given header policy
#[must_use]
pub fn matches(recorded: &RecordedRequest, live: &RecordedRequest, match_headers: &[String]) -> bool {
    recorded.method == live.method
        && recorded.target == live.target
        && same_headers(recorded, live, match_headers)
        && same_body(recorded, live)
}

/// First episode matching `live`, in insertion order
#[must_use]
pub fn find_episode<'a, I>(episodes: I, live: &RecordedRequest, match_headers: &[String]) -> Option<&'a Episode>
where
    I: IntoIterator<Item = &'a Episode>,
{
    episodes
        .into_iter()
        .find(|episode| matches(&episode.request, live, match_headers))
}

fn same_headers(recorded: &RecordedRequest, live: &RecordedRequest, match_headers: &[String]) -> bool {
    match_headers
        .iter()
        .all(|name| recorded.headers.get_all(name) == live.headers.get_all(name))
}

fn same_body(recorded: &RecordedRequest, live: &RecordedRequest) -> bool {
    if live.form.is_empty() {
        return recorded.body.bytes() == live.body.bytes();
    }

    live.form.iter().all(|(key, values)| {
        recorded
            .form
            .get(key)
            .is_some_and(|recorded_values| recorded_values == values)
    })
}
