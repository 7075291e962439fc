//! Faces and the face table.
//!
//! A face is one endpoint the daemon exchanges messages with: an accepted
//! stream connection, a bound datagram socket, or a datagram peer seen
//! through one. Face ids stay valid across slot reuse: the low bits index
//! the dense array and the high bits carry a generation that moves on every
//! wrap of the free scan, so a stale id simply fails to resolve.

use crate::error::CcndError;
use crate::io::FaceSock;
use bitflags::bitflags;
use std::net::SocketAddr;

/// Slot mask for face ids; the dense array never outgrows this.
pub const MAXFACES: u32 = (1 << 24) - 1;

bitflags! {
    #[derive(Copy, Clone, Debug, PartialEq, Eq)]
    pub struct FaceFlags: u16 {
        /// Carries datagrams rather than a byte stream.
        const DGRAM = 1 << 0;
        /// The peer wraps its messages in the link envelope.
        const LINK = 1 << 1;
        /// A local stream client.
        const LOCAL = 1 << 2;
        /// The daemon's own bound datagram socket; never a send target.
        const PASSIVE = 1 << 3;
        /// Seen idle by the reaper once; idle twice means teardown.
        const CLOSING = 1 << 4;
    }
}

pub struct Face {
    pub id: u32,
    pub sock: Option<FaceSock>,
    pub flags: FaceFlags,
    /// Peer address, for datagram faces.
    pub peer: Option<SocketAddr>,
    /// Bytes received but not yet framed into messages.
    pub inbuf: Vec<u8>,
    /// Decoder state: whether the framer has seen this face's first message.
    pub seen_first: bool,
    /// Bytes accepted for sending but not yet written, with the flushed
    /// index alongside.
    pub outbuf: Option<Vec<u8>>,
    pub outbufindex: usize,
    /// Receive activity since the last reaper pass.
    pub recvcount: u32,
    /// Accession of the last content matched for this face, used to resume
    /// enumeration on the next interest.
    pub cached_accession: Option<u64>,
}

impl Face {
    pub fn new(flags: FaceFlags) -> Self {
        Face {
            id: 0,
            sock: None,
            flags,
            peer: None,
            inbuf: Vec::new(),
            seen_first: false,
            outbuf: None,
            outbufindex: 0,
            recvcount: 0,
            cached_accession: None,
        }
    }

    pub fn with_sock(mut self, sock: FaceSock) -> Self {
        self.sock = Some(sock);
        self
    }

    pub fn with_peer(mut self, peer: SocketAddr) -> Self {
        self.peer = Some(peer);
        self
    }

    /// Queues bytes for a later flush.
    pub fn defer_send(&mut self, bytes: &[u8]) {
        self.outbuf.get_or_insert_with(Vec::new).extend_from_slice(bytes);
    }

    pub fn has_pending_output(&self) -> bool {
        self.outbuf
            .as_ref()
            .map(|b| b.len() > self.outbufindex)
            .unwrap_or(false)
    }
}

#[derive(Default)]
pub struct FaceTable {
    faces_by_faceid: Vec<Option<Face>>,
    face_rover: usize,
    face_gen: u32,
    count: usize,
}

impl FaceTable {
    pub fn new() -> Self {
        FaceTable {
            faces_by_faceid: Vec::new(),
            face_rover: 0,
            face_gen: MAXFACES.wrapping_add(1),
            count: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    /// Registers a face, assigning it a fresh id.
    pub fn enroll(&mut self, mut face: Face) -> Result<u32, CcndError> {
        let slot = match self.free_slot() {
            Some(slot) => slot,
            None => {
                let cap = MAXFACES as usize + 1;
                let len = self.faces_by_faceid.len();
                if len >= cap {
                    return Err(CcndError::FaceTableFull);
                }
                let grown = (len + len / 2 + 10).min(cap);
                self.faces_by_faceid.resize_with(grown, || None);
                self.face_rover = len;
                len
            }
        };

        let id = self.face_gen.wrapping_add(slot as u32);
        face.id = id;
        self.faces_by_faceid[slot] = Some(face);
        self.face_rover = slot + 1;
        self.count += 1;
        Ok(id)
    }

    /// Resolves a face id, failing on anything stale.
    pub fn lookup(&self, id: u32) -> Option<&Face> {
        let slot = (id & MAXFACES) as usize;
        match self.faces_by_faceid.get(slot)? {
            Some(face) if face.id == id => Some(face),
            _ => None,
        }
    }

    pub fn lookup_mut(&mut self, id: u32) -> Option<&mut Face> {
        let slot = (id & MAXFACES) as usize;
        match self.faces_by_faceid.get_mut(slot)? {
            Some(face) if face.id == id => Some(face),
            _ => None,
        }
    }

    /// Clears the slot and returns the face so its sockets can be shut
    /// down. The peer sockaddr under which a datagram face is known lives
    /// in the event loop's peer map and is removed there.
    pub fn release(&mut self, id: u32) -> Option<Face> {
        let slot = (id & MAXFACES) as usize;
        let entry = self.faces_by_faceid.get_mut(slot)?;
        if entry.as_ref().map(|f| f.id) != Some(id) {
            return None;
        }
        self.count -= 1;
        entry.take()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Face> {
        self.faces_by_faceid.iter().filter_map(|f| f.as_ref())
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Face> {
        self.faces_by_faceid.iter_mut().filter_map(|f| f.as_mut())
    }

    // Scans from the rover for a free slot; crossing the end of the array
    //  bumps the generation so ids minted before the wrap cannot resolve
    //  to whatever reuses their slot.
    fn free_slot(&mut self) -> Option<usize> {
        let len = self.faces_by_faceid.len();
        if len == 0 {
            return None;
        }
        let mut slot = self.face_rover;
        for _ in 0..=len {
            if slot >= len {
                slot = 0;
                self.face_gen = self.face_gen.wrapping_add(MAXFACES.wrapping_add(1));
            }
            if self.faces_by_faceid[slot].is_none() {
                return Some(slot);
            }
            slot += 1;
        }
        None
    }
}
