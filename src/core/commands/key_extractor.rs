// src/core/commands/key_extractor.rs

//! Centralized key extraction for cluster routing and key prefixing.
//! Positions are computed from the command's `KeySpec` against the full
//! argument vector, so index 0 is always the command name.

use super::command_spec::KeySpec;
use bytes::Bytes;

/// Returns the indices of every key argument in `parts`.
///
/// Malformed argument lists (too short, a bad `numkeys`) yield the keys that
/// can be located; the server reports the syntax error itself.
pub fn key_positions(spec: &KeySpec, parts: &[Bytes]) -> Vec<usize> {
    match *spec {
        KeySpec::None => Vec::new(),
        KeySpec::Range { first, last, step } => range_positions(parts.len(), first, last, step),
        KeySpec::NumKeys { numkeys_at, leading } => numkeys_positions(parts, numkeys_at, leading),
        KeySpec::Streams => streams_positions(parts),
    }
}

fn range_positions(argc: usize, first: usize, last: isize, step: usize) -> Vec<usize> {
    if first >= argc || step == 0 {
        return Vec::new();
    }
    let last = if last < 0 {
        match argc.checked_sub(last.unsigned_abs()) {
            Some(l) => l,
            None => return Vec::new(),
        }
    } else {
        (last as usize).min(argc - 1)
    };
    if last < first {
        return Vec::new();
    }
    (first..=last).step_by(step).collect()
}

fn numkeys_positions(parts: &[Bytes], numkeys_at: usize, leading: bool) -> Vec<usize> {
    let mut positions = Vec::new();
    if leading && numkeys_at > 1 && parts.len() > 1 {
        positions.push(1);
    }
    let Some(numkeys) = parts
        .get(numkeys_at)
        .and_then(|b| std::str::from_utf8(b).ok())
        .and_then(|s| s.parse::<usize>().ok())
    else {
        return positions;
    };
    let first = numkeys_at + 1;
    let end = (first + numkeys).min(parts.len());
    positions.extend(first..end);
    positions
}

/// `XREAD [COUNT n] [BLOCK ms] STREAMS k1 .. kn id1 .. idn`
fn streams_positions(parts: &[Bytes]) -> Vec<usize> {
    let Some(streams_at) = parts
        .iter()
        .position(|p| p.eq_ignore_ascii_case(b"STREAMS"))
    else {
        return Vec::new();
    };
    let remaining = parts.len() - streams_at - 1;
    let count = remaining / 2;
    (streams_at + 1..streams_at + 1 + count).collect()
}
