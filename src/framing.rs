//! Message framing.
//!
//! A sliding decoder over each face's input buffer. Elements are
//! self-delimiting, so framing is a matter of measuring the element at the
//! front and waiting for the rest of it. A protocol data unit envelope is
//! unwrapped one level, never deeper, and its presence on a face's first
//! message marks the face as link-framed.

use crate::face::FaceFlags;
use crate::forwarder::Ccnd;
use crate::packet;
use crate::tlv::{measure, Measured};
use crate::MAX_MESSAGE_BYTES;
use log::debug;

enum Step {
    NeedMore,
    Bad,
    Consumed(usize),
}

/// Drains complete messages from a stream face's input buffer. A protocol
/// error tears the face down; a partial message stays buffered.
pub fn process_face(h: &mut Ccnd, faceid: u32) {
    let buf = match h.faces.lookup_mut(faceid) {
        Some(face) => std::mem::take(&mut face.inbuf),
        None => return,
    };

    let mut cursor = 0;
    let mut bad = false;
    while cursor < buf.len() {
        match step(h, faceid, &buf[cursor..]) {
            Step::Consumed(n) => cursor += n,
            Step::NeedMore => break,
            Step::Bad => {
                bad = true;
                break;
            }
        }
    }

    if bad {
        debug!("protocol error on stream face {faceid:#x}, tearing down");
        h.destroy_face(faceid);
        return;
    }

    if let Some(face) = h.faces.lookup_mut(faceid) {
        face.inbuf = buf;
        face.inbuf.drain(..cursor);
    }
}

/// Processes one received datagram. Datagram faces survive protocol
/// errors; the offending buffer is simply discarded.
pub fn process_datagram(h: &mut Ccnd, faceid: u32, datagram: &[u8]) {
    let mut cursor = 0;
    while cursor < datagram.len() {
        match step(h, faceid, &datagram[cursor..]) {
            Step::Consumed(n) => cursor += n,
            Step::NeedMore | Step::Bad => {
                debug!("malformed datagram on face {faceid:#x}, remainder discarded");
                break;
            }
        }
    }
}

fn step(h: &mut Ccnd, faceid: u32, bytes: &[u8]) -> Step {
    match measure(bytes) {
        Measured::Incomplete => Step::NeedMore,
        Measured::Invalid => Step::Bad,
        Measured::Complete {
            typ,
            header_len,
            value_len,
        } => {
            let total = header_len + value_len;
            if total > MAX_MESSAGE_BYTES {
                return Step::Bad;
            }
            if bytes.len() < total {
                return Step::NeedMore;
            }

            if let Some(face) = h.faces.lookup_mut(faceid) {
                if !face.seen_first {
                    face.seen_first = true;
                    if typ == packet::MSG_PDU {
                        face.flags.insert(FaceFlags::LINK);
                    }
                }
            }

            if typ == packet::MSG_PDU {
                // Drain the envelope body; exactly one level is allowed.
                let body = &bytes[header_len..total];
                let mut inner = 0;
                while inner < body.len() {
                    match measure(&body[inner..]) {
                        Measured::Complete {
                            typ: inner_typ,
                            header_len: ih,
                            value_len: iv,
                        } => {
                            let inner_total = ih + iv;
                            if inner_typ == packet::MSG_PDU
                                || body.len() - inner < inner_total
                            {
                                return Step::Bad;
                            }
                            h.process_message(faceid, &body[inner..inner + inner_total]);
                            inner += inner_total;
                        }
                        _ => return Step::Bad,
                    }
                }
            } else {
                h.process_message(faceid, &bytes[..total]);
            }
            Step::Consumed(total)
        }
    }
}
