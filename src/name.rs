//! Hierarchical names.
//!
//! A name on the wire is a `Name` element whose value is a sequence of
//! component elements. The daemon keeps names as the raw encoded component
//! bytes plus a parallel array of byte offsets marking where each component
//! begins; every comparison and prefix check works off those two.

use crate::tlv::{self, Tlv};
use std::cmp::Ordering;

pub const COMPONENT_IMPLICIT_DIGEST: u64 = 1;
pub const COMPONENT_GENERIC: u64 = 8;

/// An upper bound on components per name; longer names are dropped.
pub const MAX_NAME_COMPONENTS: usize = 256;

pub const DIGEST_BYTES: usize = 32;

/// Walks the component elements of `bytes` and records the byte offset at
/// which each one starts, with a final offset equal to `bytes.len()`.
///
/// Returns the component count, or None when the bytes are not a wellformed
/// component sequence or the count exceeds [`MAX_NAME_COMPONENTS`].
pub fn component_offsets(bytes: &[u8], offsets: &mut Vec<u32>) -> Option<usize> {
    offsets.clear();
    let mut cursor = 0usize;
    while cursor < bytes.len() {
        if offsets.len() >= MAX_NAME_COMPONENTS {
            return None;
        }
        let (tlv, used) = Tlv::try_decode(&bytes[cursor..]).ok()?;
        if tlv.typ > u16::MAX as u64 {
            return None;
        }
        offsets.push(cursor as u32);
        cursor += used;
    }
    offsets.push(bytes.len() as u32);
    Some(offsets.len() - 1)
}

/// The encoded segment of component `i`, given the offsets array.
pub fn component<'a>(bytes: &'a [u8], offsets: &[u32], i: usize) -> &'a [u8] {
    &bytes[offsets[i] as usize..offsets[i + 1] as usize]
}

/// Whether the encoded component is the explicit content-digest form,
/// a digest-typed component carrying exactly 32 bytes.
pub fn is_digest_component(segment: &[u8]) -> bool {
    match Tlv::try_decode(segment) {
        Ok((tlv, used)) => {
            used == segment.len()
                && tlv.typ == COMPONENT_IMPLICIT_DIGEST
                && tlv.val.len() == DIGEST_BYTES
        }
        Err(_) => false,
    }
}

/// Orders two parsed names component by component.
///
/// Each component is compared as its encoded byte segment; when one name is
/// a component-sequence prefix of the other, the shorter sorts first. This
/// is the order the content index lives in, so all extensions of a prefix
/// are contiguous and directly follow the prefix itself.
pub fn compare(a: &[u8], a_offs: &[u32], b: &[u8], b_offs: &[u32]) -> Ordering {
    let a_n = a_offs.len().saturating_sub(1);
    let b_n = b_offs.len().saturating_sub(1);
    for i in 0..a_n.min(b_n) {
        let ord = component(a, a_offs, i).cmp(component(b, b_offs, i));
        if ord != Ordering::Equal {
            return ord;
        }
    }
    a_n.cmp(&b_n)
}

/// Whether the first `prefix_count` components of `name` are byte-identical
/// to the whole of `prefix`.
pub fn has_prefix(
    name: &[u8],
    name_offs: &[u32],
    prefix: &[u8],
    prefix_count: usize,
) -> bool {
    if name_offs.len() <= prefix_count {
        return false;
    }
    let end = name_offs[prefix_count] as usize;
    end == prefix.len() && &name[..end] == prefix
}

/// Appends one encoded component to a component-sequence buffer.
pub fn push_component(out: &mut Vec<u8>, typ: u64, val: &[u8]) {
    tlv::write_tlv(out, typ, val);
}

/// Builds a component-sequence from byte-string components, all generic.
/// Handy for tests and client tooling.
pub fn from_parts<P: AsRef<[u8]>>(parts: &[P]) -> Vec<u8> {
    let mut out = Vec::new();
    for p in parts {
        push_component(&mut out, COMPONENT_GENERIC, p.as_ref());
    }
    out
}
