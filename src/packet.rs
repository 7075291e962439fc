//! The wire codec: parsing and emitting Interest and ContentObject
//! messages, plus the link-level protocol data unit envelope.
//!
//! Every message is one outer element whose value is a sequence of child
//! elements in canonical order, the name always first. Unknown children are
//! skipped so the format can grow.

use crate::name;
use crate::tlv::{self, Tlv};
use sha2::{Digest, Sha256};

pub const MSG_INTEREST: u64 = 5;
pub const MSG_CONTENT_OBJECT: u64 = 6;
/// The one-level outer envelope marking a link-framed peer.
pub const MSG_PDU: u64 = 20;

pub const TT_NAME: u64 = 7;
pub const TT_NONCE: u64 = 10;
pub const TT_SCOPE: u64 = 11;
pub const TT_CHILD_SELECTOR: u64 = 12;
pub const TT_MIN_SUFFIX_COMPONENTS: u64 = 13;
pub const TT_MAX_SUFFIX_COMPONENTS: u64 = 14;
pub const TT_RESPONSE_FILTER: u64 = 15;
pub const TT_PUBLISHER_KEY_DIGEST: u64 = 16;
pub const TT_EXCLUDE: u64 = 17;
/// Marker inside an Exclude: everything between its neighbors is excluded.
pub const TT_EXCLUDE_ANY: u64 = 19;
pub const TT_PAYLOAD: u64 = 21;
pub const TT_SIGNATURE_VALUE: u64 = 23;

/// Child selector value asking for the largest matching name.
pub const CHILD_SELECTOR_RIGHTMOST: u8 = 5;

pub const NONCE_BYTES: usize = 6;

/// A parsed Interest. Borrowed slices point into the received message.
pub struct InterestMsg<'a> {
    /// Component bytes of the name (the value of the Name element).
    pub name: &'a [u8],
    /// Byte offsets of the name components, one extra for the end.
    pub comps: Vec<u32>,
    pub nonce: Option<&'a [u8]>,
    pub scope: Option<u8>,
    pub child_selector: u8,
    pub min_suffix: Option<u64>,
    pub max_suffix: Option<u64>,
    /// Only content carrying this publisher digest answers the interest.
    pub publisher: Option<&'a [u8]>,
    pub exclude: Option<ExcludeFilter<'a>>,
    pub filter: Option<&'a [u8]>,
}

impl<'a> InterestMsg<'a> {
    pub fn ncomps(&self) -> usize {
        self.comps.len() - 1
    }

    /// Parses the value of an Interest element.
    pub fn from_value(value: &'a [u8]) -> Option<Self> {
        let mut children = ChildIter { rest: value };

        let name_tlv = children.next()?;
        if name_tlv.typ != TT_NAME {
            return None;
        }
        let mut comps = Vec::new();
        name::component_offsets(name_tlv.val, &mut comps)?;

        let mut nonce = None;
        let mut scope = None;
        let mut child_selector = 0u8;
        let mut min_suffix = None;
        let mut max_suffix = None;
        let mut publisher = None;
        let mut exclude = None;
        let mut filter = None;

        for tlv in children {
            match tlv.typ {
                TT_NONCE => nonce = Some(tlv.val),
                TT_SCOPE => scope = Some(tlv.val_as_u64()?.min(u8::MAX as u64) as u8),
                TT_CHILD_SELECTOR => {
                    child_selector = tlv.val_as_u64()?.min(u8::MAX as u64) as u8
                }
                TT_MIN_SUFFIX_COMPONENTS => min_suffix = Some(tlv.val_as_u64()?),
                TT_MAX_SUFFIX_COMPONENTS => max_suffix = Some(tlv.val_as_u64()?),
                TT_PUBLISHER_KEY_DIGEST => {
                    if tlv.val.len() != name::DIGEST_BYTES {
                        return None;
                    }
                    publisher = Some(tlv.val)
                }
                TT_EXCLUDE => exclude = Some(ExcludeFilter::from_value(tlv.val)?),
                TT_RESPONSE_FILTER => filter = Some(tlv.val),
                _ => {} // unknown selectors are skipped
            }
        }

        Some(InterestMsg {
            name: name_tlv.val,
            comps,
            nonce,
            scope,
            child_selector,
            min_suffix,
            max_suffix,
            publisher,
            exclude,
            filter,
        })
    }
}

/// An interest's Exclude element: components (and Any markers) in
/// ascending component order. The excluded set is every listed component
/// plus everything an Any marker brackets between its neighbors.
#[derive(Copy, Clone)]
pub struct ExcludeFilter<'a> {
    bytes: &'a [u8],
}

impl<'a> ExcludeFilter<'a> {
    pub fn from_value(bytes: &'a [u8]) -> Option<Self> {
        let mut cursor = 0;
        while cursor < bytes.len() {
            let (tlv, used) = Tlv::try_decode(&bytes[cursor..]).ok()?;
            if tlv.typ == TT_EXCLUDE_ANY {
                if !tlv.val.is_empty() {
                    return None;
                }
            } else if tlv.typ > u16::MAX as u64 {
                return None;
            }
            cursor += used;
        }
        Some(ExcludeFilter { bytes })
    }

    /// Whether an encoded component segment falls in the excluded set.
    pub fn excludes(&self, component: &[u8]) -> bool {
        let mut cursor = 0;
        let mut open = false;
        while cursor < self.bytes.len() {
            let (tlv, used) = match Tlv::try_decode(&self.bytes[cursor..]) {
                Ok(decoded) => decoded,
                Err(_) => return false,
            };
            let segment = &self.bytes[cursor..cursor + used];
            cursor += used;
            if tlv.typ == TT_EXCLUDE_ANY {
                open = true;
                continue;
            }
            match component.cmp(segment) {
                std::cmp::Ordering::Equal => return true,
                std::cmp::Ordering::Less => return open,
                std::cmp::Ordering::Greater => open = false,
            }
        }
        // Past the last listed component; only a trailing Any reaches here.
        open
    }
}

/// Appends an Any marker to an exclude list under construction.
pub fn exclude_any(out: &mut Vec<u8>) {
    tlv::write_tlv(out, TT_EXCLUDE_ANY, &[]);
}

/// A parsed ContentObject. Borrowed slices point into the received message.
pub struct ContentMsg<'a> {
    pub name: &'a [u8],
    pub comps: Vec<u32>,
    /// Everything after the Name element, kept verbatim for re-emission.
    pub tail: &'a [u8],
    /// Offset of the 32-byte signature hash within `tail`, when present.
    pub sig_offset: Option<u32>,
    /// Offset of the 32-byte publisher digest within `tail`, when present.
    pub publisher_offset: Option<u32>,
    pub payload: Option<&'a [u8]>,
}

impl<'a> ContentMsg<'a> {
    pub fn ncomps(&self) -> usize {
        self.comps.len() - 1
    }

    /// Parses the value of a ContentObject element.
    pub fn from_value(value: &'a [u8]) -> Option<Self> {
        let (name_tlv, name_used) = Tlv::try_decode(value).ok()?;
        if name_tlv.typ != TT_NAME {
            return None;
        }
        let mut comps = Vec::new();
        name::component_offsets(name_tlv.val, &mut comps)?;

        let tail = &value[name_used..];
        let mut sig_offset = None;
        let mut publisher_offset = None;
        let mut payload = None;

        let mut cursor = 0usize;
        while cursor < tail.len() {
            let (tlv, used) = Tlv::try_decode(&tail[cursor..]).ok()?;
            match tlv.typ {
                TT_SIGNATURE_VALUE => {
                    if tlv.val.len() == name::DIGEST_BYTES {
                        let val_start = cursor + used - tlv.val.len();
                        sig_offset = Some(val_start as u32);
                    }
                }
                TT_PUBLISHER_KEY_DIGEST => {
                    if tlv.val.len() != name::DIGEST_BYTES {
                        return None;
                    }
                    let val_start = cursor + used - tlv.val.len();
                    publisher_offset = Some(val_start as u32);
                }
                TT_PAYLOAD => payload = Some(tlv.val),
                _ => {}
            }
            cursor += used;
        }

        Some(ContentMsg {
            name: name_tlv.val,
            comps,
            tail,
            sig_offset,
            publisher_offset,
            payload,
        })
    }
}

/// The two message kinds the daemon forwards.
pub enum Msg<'a> {
    Interest(InterestMsg<'a>),
    ContentObject(ContentMsg<'a>),
}

/// Parses a complete outer message (not the PDU envelope).
pub fn parse_msg(bytes: &[u8]) -> Option<Msg<'_>> {
    let (outer, used) = Tlv::try_decode(bytes).ok()?;
    if used != bytes.len() {
        return None;
    }
    match outer.typ {
        MSG_INTEREST => Some(Msg::Interest(InterestMsg::from_value(outer.val)?)),
        MSG_CONTENT_OBJECT => Some(Msg::ContentObject(ContentMsg::from_value(outer.val)?)),
        _ => None,
    }
}

/// The implicit digest of a content object, hashed over the whole
/// encoded message.
pub fn implicit_digest(msg: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(msg);
    hasher.finalize().into()
}

/// Inserts a Nonce element at its canonical position, directly after the
/// Name, re-emitting the outer header for the new length. Returns None if
/// `msg` is not a wellformed Interest.
pub fn splice_nonce(msg: &[u8], nonce: &[u8; NONCE_BYTES]) -> Option<Vec<u8>> {
    let (outer, used) = Tlv::try_decode(msg).ok()?;
    if outer.typ != MSG_INTEREST || used != msg.len() {
        return None;
    }
    let (_, name_used) = Tlv::try_decode(outer.val).ok()?;

    let nonce_len = tlv::varint_len(TT_NONCE) + tlv::varint_len(NONCE_BYTES as u64) + NONCE_BYTES;
    let mut out = Vec::with_capacity(msg.len() + nonce_len + 2);
    tlv::write_header(&mut out, MSG_INTEREST, outer.val.len() + nonce_len);
    out.extend_from_slice(&outer.val[..name_used]);
    tlv::write_tlv(&mut out, TT_NONCE, nonce);
    out.extend_from_slice(&outer.val[name_used..]);
    Some(out)
}

/// Wraps an encoded message in the link envelope.
pub fn wrap_pdu(msg: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(msg.len() + 4);
    tlv::write_tlv(&mut out, MSG_PDU, msg);
    out
}

/// Tests a 32-byte signature hash against an interest's response filter.
///
/// The filter value is one byte giving the hash-function count followed by
/// the bloom bit array; each hash is a big-endian word drawn from the
/// digest, reduced modulo the bit count.
pub fn bloom_seen(filter: &[u8], sig_hash: &[u8]) -> bool {
    if filter.len() < 2 || sig_hash.len() < 32 {
        return false;
    }
    let nhash = filter[0].clamp(1, 8) as usize;
    let bits = &filter[1..];
    let nbits = bits.len() * 8;
    for i in 0..nhash {
        let word: [u8; 4] = match sig_hash[i * 4..i * 4 + 4].try_into() {
            Ok(w) => w,
            Err(_) => return false,
        };
        let pos = u32::from_be_bytes(word) as usize % nbits;
        if bits[pos / 8] & (1 << (pos % 8)) == 0 {
            return false;
        }
    }
    true
}

/// Builds a response filter that reports the given signature hashes as seen.
pub fn bloom_build(nhash: u8, nbits: usize, sig_hashes: &[[u8; 32]]) -> Vec<u8> {
    let nhash = nhash.clamp(1, 8);
    let mut out = vec![0u8; 1 + nbits.div_ceil(8)];
    out[0] = nhash;
    let nbits = (out.len() - 1) * 8;
    for h in sig_hashes {
        for i in 0..nhash as usize {
            let word: [u8; 4] = h[i * 4..i * 4 + 4].try_into().unwrap_or([0; 4]);
            let pos = u32::from_be_bytes(word) as usize % nbits;
            out[1 + pos / 8] |= 1 << (pos % 8);
        }
    }
    out
}

/// The big-endian fixed-width segment-number component used by
/// segmentation-aware clients.
pub fn segment_component(segment: u64) -> Vec<u8> {
    let mut out = Vec::with_capacity(2 + 8);
    name::push_component(&mut out, name::COMPONENT_GENERIC, &segment.to_be_bytes());
    out
}

/// Options for [`encode_interest`].
#[derive(Default)]
pub struct InterestOptions<'a> {
    pub nonce: Option<&'a [u8]>,
    pub scope: Option<u8>,
    pub child_selector: u8,
    pub min_suffix: Option<u64>,
    pub max_suffix: Option<u64>,
    pub publisher: Option<&'a [u8]>,
    /// Raw Exclude value: component elements and Any markers, ascending.
    pub exclude: Option<&'a [u8]>,
    pub filter: Option<&'a [u8]>,
}

/// Encodes an Interest for the given component-sequence name.
pub fn encode_interest(name_value: &[u8], opts: &InterestOptions<'_>) -> Vec<u8> {
    let mut body = Vec::new();
    tlv::write_tlv(&mut body, TT_NAME, name_value);
    if let Some(nonce) = opts.nonce {
        tlv::write_tlv(&mut body, TT_NONCE, nonce);
    }
    if let Some(scope) = opts.scope {
        tlv::write_tlv(&mut body, TT_SCOPE, &[scope]);
    }
    if opts.child_selector != 0 {
        tlv::write_tlv(&mut body, TT_CHILD_SELECTOR, &[opts.child_selector]);
    }
    if let Some(min) = opts.min_suffix {
        tlv::write_tlv(&mut body, TT_MIN_SUFFIX_COMPONENTS, &[min.min(255) as u8]);
    }
    if let Some(max) = opts.max_suffix {
        tlv::write_tlv(&mut body, TT_MAX_SUFFIX_COMPONENTS, &[max.min(255) as u8]);
    }
    if let Some(publisher) = opts.publisher {
        tlv::write_tlv(&mut body, TT_PUBLISHER_KEY_DIGEST, publisher);
    }
    if let Some(exclude) = opts.exclude {
        tlv::write_tlv(&mut body, TT_EXCLUDE, exclude);
    }
    if let Some(filter) = opts.filter {
        tlv::write_tlv(&mut body, TT_RESPONSE_FILTER, filter);
    }
    let mut out = Vec::with_capacity(body.len() + 4);
    tlv::write_tlv(&mut out, MSG_INTEREST, &body);
    out
}

/// Encodes a ContentObject with a signature hash derived from the name
/// and payload. Used by tests and client tooling; the daemon itself only
/// re-emits stored bytes.
pub fn encode_content(name_value: &[u8], payload: &[u8]) -> Vec<u8> {
    encode_content_by(name_value, payload, None)
}

/// As [`encode_content`], attributing the object to a publisher digest.
pub fn encode_content_by(
    name_value: &[u8],
    payload: &[u8],
    publisher: Option<&[u8]>,
) -> Vec<u8> {
    let mut hasher = Sha256::new();
    hasher.update(name_value);
    hasher.update(payload);
    let sig: [u8; 32] = hasher.finalize().into();

    let mut body = Vec::new();
    tlv::write_tlv(&mut body, TT_NAME, name_value);
    if let Some(publisher) = publisher {
        tlv::write_tlv(&mut body, TT_PUBLISHER_KEY_DIGEST, publisher);
    }
    tlv::write_tlv(&mut body, TT_SIGNATURE_VALUE, &sig);
    tlv::write_tlv(&mut body, TT_PAYLOAD, payload);
    let mut out = Vec::with_capacity(body.len() + 4);
    tlv::write_tlv(&mut out, MSG_CONTENT_OBJECT, &body);
    out
}

struct ChildIter<'a> {
    rest: &'a [u8],
}

impl<'a> Iterator for ChildIter<'a> {
    type Item = Tlv<'a>;

    fn next(&mut self) -> Option<Tlv<'a>> {
        if self.rest.is_empty() {
            return None;
        }
        match Tlv::try_decode(self.rest) {
            Ok((tlv, used)) => {
                self.rest = &self.rest[used..];
                Some(tlv)
            }
            Err(_) => {
                self.rest = &[];
                None
            }
        }
    }
}
