//! Message wrapping: random filler around real content.
//!
//! ```text
//! [filler][PREPEND_MARKER][content][APPEND_MARKER][filler]
//! ```
//!
//! Unwrapping takes the content between the first prepend marker and the last
//! append marker.
//!
//! # Invariants
//!
//! - `unwrap(wrap(p)) == p` for every payload and padding profile, including
//!   empty ranges. The markers are always written.
//! - Generated filler never contains a marker occurrence that would move the
//!   boundaries: the prefix `filler || PREPEND_MARKER` contains the prepend
//!   marker exactly once, at its end, and the suffix `APPEND_MARKER || filler`
//!   contains the append marker exactly once, at its start.

use crate::{env::Environment, error::SessionError, params::PaddingProfile};

/// Marks the start of real content.
pub const PREPEND_MARKER: [u8; 6] = [255, 1, 254, 2, 253, 3];

/// Marks the end of real content.
pub const APPEND_MARKER: [u8; 6] = [1, 255, 2, 254, 3, 253];

/// Attempts at drawing filler before falling back to none.
const FILLER_ATTEMPTS: usize = 16;

/// Surround `payload` with random filler drawn from `profile`.
pub fn wrap<E: Environment>(env: &E, payload: &[u8], profile: &PaddingProfile) -> Vec<u8> {
    let prefix = prefix_filler(env, profile.prepend.sample(env));
    let suffix = suffix_filler(env, profile.append.sample(env));

    let mut out = Vec::with_capacity(prefix.len() + suffix.len() + payload.len() + 12);
    out.extend_from_slice(&prefix);
    out.extend_from_slice(&PREPEND_MARKER);
    out.extend_from_slice(payload);
    out.extend_from_slice(&APPEND_MARKER);
    out.extend_from_slice(&suffix);
    out
}

/// Strip filler and markers.
///
/// # Errors
///
/// - `SessionError::Protocol` if either marker is missing or they are out of
///   order
pub fn unwrap(data: &[u8]) -> Result<Vec<u8>, SessionError> {
    let start = find_first(data, &PREPEND_MARKER).map(|i| i + PREPEND_MARKER.len());
    let end = find_last(data, &APPEND_MARKER);
    match (start, end) {
        (Some(start), Some(end)) if start <= end => Ok(data[start..end].to_vec()),
        _ => Err(SessionError::Protocol(dtm_proto::ProtocolError::Encoding(
            "padding markers missing or out of order".to_string(),
        ))),
    }
}

fn prefix_filler<E: Environment>(env: &E, len: usize) -> Vec<u8> {
    draw_filler(env, len, |filler| {
        let mut probe = filler.to_vec();
        probe.extend_from_slice(&PREPEND_MARKER);
        find_first(&probe, &PREPEND_MARKER) == Some(filler.len())
    })
}

fn suffix_filler<E: Environment>(env: &E, len: usize) -> Vec<u8> {
    draw_filler(env, len, |filler| {
        let mut probe = APPEND_MARKER.to_vec();
        probe.extend_from_slice(filler);
        find_last(&probe, &APPEND_MARKER) == Some(0)
    })
}

fn draw_filler<E: Environment>(env: &E, len: usize, accept: impl Fn(&[u8]) -> bool) -> Vec<u8> {
    if len == 0 {
        return Vec::new();
    }
    let mut filler = vec![0u8; len];
    for _ in 0..FILLER_ATTEMPTS {
        env.random_bytes(&mut filler);
        if accept(&filler) {
            return filler;
        }
    }
    tracing::debug!(len, "filler kept colliding with a marker, sending none");
    Vec::new()
}

fn find_first(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|w| w == needle)
}

fn find_last(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).rposition(|w| w == needle)
}
