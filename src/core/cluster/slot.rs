// src/core/cluster/slot.rs

//! Implements the cluster hash slot algorithm.

use crate::core::commands::Command;
use crate::core::errors::ClientError;
use crc::{CRC_16_XMODEM, Crc};

/// The total number of hash slots in the cluster.
pub const NUM_SLOTS: usize = 16384;

/// Redis Cluster hashes keys with CRC16/XMODEM (polynomial 0x1021, init 0).
const CRC16_ALGO: Crc<u16> = Crc::<u16>::new(&CRC_16_XMODEM);

/// Returns the part of `key` that is hashed: the contents of the first
/// `{...}` pair if that is non-empty, otherwise the whole key.
pub fn hash_tag(key: &[u8]) -> &[u8] {
    if let Some(start) = key.iter().position(|&b| b == b'{')
        && let Some(end_offset) = key[start + 1..].iter().position(|&b| b == b'}')
        && end_offset > 0
    {
        return &key[start + 1..start + 1 + end_offset];
    }
    key
}

/// Calculates the hash slot for a given key.
///
/// `user:{42}:profile` and `user:{42}:orders` share a slot because only `42`
/// is hashed. An empty tag (`a{}b`) hashes the whole key.
pub fn get_slot(key: &[u8]) -> u16 {
    CRC16_ALGO.checksum(hash_tag(key)) % (NUM_SLOTS as u16)
}

/// The single slot every key of `command` maps to.
///
/// Returns `Ok(None)` for keyless commands and `CrossSlot` when the keys span
/// more than one slot.
pub fn command_slot(command: &Command) -> Result<Option<u16>, ClientError> {
    slot_of_keys(command.keys().into_iter().map(|k| k.as_ref()))
}

/// The common slot of a set of keys, see [`command_slot`].
pub fn slot_of_keys<'a>(
    keys: impl IntoIterator<Item = &'a [u8]>,
) -> Result<Option<u16>, ClientError> {
    let mut slot = None;
    for key in keys {
        let s = get_slot(key);
        match slot {
            None => slot = Some(s),
            Some(existing) if existing != s => return Err(ClientError::CrossSlot),
            Some(_) => {}
        }
    }
    Ok(slot)
}
