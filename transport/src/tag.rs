//! Tag encoding and matching (C9).
//!
//! Every submitted operation converts a user-visible 32-bit tag and a peer
//! rank into a 64-bit wire tag: the upper 32 bits carry the user tag, the
//! lower 32 bits carry the sender's rank. This lets the backend's own
//! tag-matcher disambiguate senders without the core tracking outstanding
//! unexpected messages itself (see §4.1, §6.4).

/// Matches only the exact (user_tag, sender_rank) pair encoded in the tag.
pub const EXACT_MASK: u64 = 0xFFFF_FFFF_FFFF_FFFF;

/// Matches any sender rank for the given user tag.
pub const ANY_SOURCE_MASK: u64 = 0xFFFF_FFFF_0000_0000;

/// Sentinel passed as `src` to `recv` to mean "match any sender".
pub const ANY_SOURCE: usize = usize::MAX;

/// Combines a user tag and a sender rank into the 64-bit wire tag.
///
/// `sender_rank` must fit in 32 bits; ranks beyond that are a usage error the
/// caller should have rejected earlier (a run with more than 2^32 ranks is
/// not representable here regardless).
pub fn encode(user_tag: u32, sender_rank: usize) -> u64 {
    (u64::from(user_tag) << 32) | (sender_rank as u32 as u64)
}

/// Splits a wire tag back into its (user_tag, sender_rank) components.
///
/// `encode` followed by `decode` is the identity (P1).
pub fn decode(wire_tag: u64) -> (u32, usize) {
    let user_tag = (wire_tag >> 32) as u32;
    let sender_rank = (wire_tag & 0xFFFF_FFFF) as usize;
    (user_tag, sender_rank)
}

/// The mask to post a receive with, given whether the caller asked for a
/// specific source or `ANY_SOURCE`.
pub fn mask_for(src: usize) -> u64 {
    if src == ANY_SOURCE { ANY_SOURCE_MASK } else { EXACT_MASK }
}
