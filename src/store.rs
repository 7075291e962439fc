//! The content store.
//!
//! Every stored object is reachable three ways: by its accession through a
//! moving dense window, by its full key through a hashtable, and in name
//! order through a probabilistic skiplist. The skiplist order is what makes
//! prefix interests cheap: all names extending a prefix sit in one
//! contiguous run starting right after the prefix itself.

use crate::name;
use crate::packet;
use crate::sched::TaskId;
use crate::tlv;
use rand::rngs::SmallRng;
use rand::Rng;
use std::cmp::Ordering;
use std::collections::HashMap;

pub const MAX_SKIPLIST_DEPTH: usize = 30;

/// A stored ContentObject.
pub struct ContentEntry {
    pub accession: u64,
    /// Encoded name components with the implicit digest component appended.
    pub key: Box<[u8]>,
    /// Byte offsets of the key's components, one extra for the end.
    pub comps: Box<[u32]>,
    /// The message bytes following the Name element, re-emitted verbatim.
    pub tail: Box<[u8]>,
    /// Offset of the 32-byte signature hash within `tail`.
    pub sig_offset: Option<u32>,
    /// Offset of the 32-byte publisher digest within `tail`.
    pub publisher_offset: Option<u32>,
    /// Face ids owed a copy. The first `nface_done` are already sent;
    /// `nface_old` of those were already done on the last cleaning pass.
    pub faces: Vec<u32>,
    pub nface_done: usize,
    pub nface_old: usize,
    /// The active send-scheduling task, if any.
    pub sender: Option<TaskId>,
    /// Set for content that arrived unsolicited.
    pub slow_send: bool,
    skiplinks: Vec<u64>,
}

impl ContentEntry {
    pub fn ncomps(&self) -> usize {
        self.comps.len() - 1
    }

    pub fn depth(&self) -> usize {
        self.skiplinks.len()
    }

    pub fn sig_hash(&self) -> Option<&[u8]> {
        let off = self.sig_offset? as usize;
        self.tail.get(off..off + name::DIGEST_BYTES)
    }

    pub fn publisher_digest(&self) -> Option<&[u8]> {
        let off = self.publisher_offset? as usize;
        self.tail.get(off..off + name::DIGEST_BYTES)
    }

    /// Re-emits the original ContentObject message: the stored name minus
    /// the implicit digest component, then the preserved tail.
    pub fn encode_message(&self, out: &mut Vec<u8>) {
        let name_value = &self.key[..self.comps[self.ncomps() - 1] as usize];
        let name_len =
            tlv::varint_len(packet::TT_NAME) + tlv::varint_len(name_value.len() as u64) + name_value.len();
        tlv::write_header(out, packet::MSG_CONTENT_OBJECT, name_len + self.tail.len());
        tlv::write_tlv(out, packet::TT_NAME, name_value);
        out.extend_from_slice(&self.tail);
    }

    pub fn pending_faces(&self) -> &[u32] {
        &self.faces[self.nface_done..]
    }

    fn face_position(&self, faceid: u32) -> Option<usize> {
        self.faces.iter().position(|f| *f == faceid)
    }

    pub fn is_done_for(&self, faceid: u32) -> bool {
        matches!(self.face_position(faceid), Some(pos) if pos < self.nface_done)
    }

    /// Adds a face past the done partition so the sender will visit it.
    /// Returns false when the face is already queued or already done.
    pub fn enqueue_face(&mut self, faceid: u32) -> bool {
        if self.face_position(faceid).is_some() {
            return false;
        }
        self.faces.push(faceid);
        true
    }

    /// Records a face inside the done partition, so it is not sent a copy
    /// it already has.
    pub fn mark_done(&mut self, faceid: u32) {
        match self.face_position(faceid) {
            Some(pos) if pos < self.nface_done => {}
            Some(pos) => {
                self.faces.remove(pos);
                self.faces.insert(self.nface_done, faceid);
                self.nface_done += 1;
            }
            None => {
                self.faces.insert(self.nface_done, faceid);
                self.nface_done += 1;
            }
        }
    }

    /// Pulls a face back out of the done partition so a fresh send can be
    /// queued. Returns whether the mark was present.
    pub fn clear_done(&mut self, faceid: u32) -> bool {
        match self.face_position(faceid) {
            Some(pos) if pos < self.nface_done => {
                self.faces.remove(pos);
                self.nface_done -= 1;
                if pos < self.nface_old {
                    self.nface_old -= 1;
                }
                true
            }
            _ => false,
        }
    }

    /// Drops face ids the predicate rejects, keeping order, and resets the
    /// old-partition boundary to the surviving done count.
    pub fn compact_faces(&mut self, mut alive: impl FnMut(u32) -> bool) {
        let old_done = self.nface_done;
        let mut kept_done = 0;
        let mut w = 0;
        for i in 0..self.faces.len() {
            if alive(self.faces[i]) {
                self.faces[w] = self.faces[i];
                if i < old_done {
                    kept_done += 1;
                }
                w += 1;
            }
        }
        self.faces.truncate(w);
        self.nface_done = kept_done;
        self.nface_old = kept_done;
    }
}

pub enum InsertOutcome {
    New(u64),
    /// An identical object was already stored.
    Duplicate(u64),
    /// Same key, different bytes. Both entries are discarded; the store
    /// tolerates at most one object per name.
    Collision,
}

pub struct ContentStore {
    content_by_accession: Vec<Option<ContentEntry>>,
    accession_base: u64,
    next_accession: u64,
    by_key: HashMap<Box<[u8]>, u64>,
    head: [u64; MAX_SKIPLIST_DEPTH],
    level: usize,
}

impl Default for ContentStore {
    fn default() -> Self {
        Self::new()
    }
}

impl ContentStore {
    pub fn new() -> Self {
        ContentStore {
            content_by_accession: Vec::new(),
            accession_base: 1, // accession 0 is the skiplist nil
            next_accession: 1,
            by_key: HashMap::new(),
            head: [0; MAX_SKIPLIST_DEPTH],
            level: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.by_key.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_key.is_empty()
    }

    pub fn accession_window(&self) -> std::ops::Range<u64> {
        self.accession_base..self.accession_base + self.content_by_accession.len() as u64
    }

    /// Numeric lookup through the dense window.
    pub fn get(&self, accession: u64) -> Option<&ContentEntry> {
        let idx = accession.checked_sub(self.accession_base)? as usize;
        match self.content_by_accession.get(idx)? {
            Some(entry) if entry.accession == accession => Some(entry),
            _ => None,
        }
    }

    pub fn get_mut(&mut self, accession: u64) -> Option<&mut ContentEntry> {
        let idx = accession.checked_sub(self.accession_base)? as usize;
        match self.content_by_accession.get_mut(idx)? {
            Some(entry) if entry.accession == accession => Some(entry),
            _ => None,
        }
    }

    pub fn lookup_key(&self, key: &[u8]) -> Option<u64> {
        self.by_key.get(key).copied()
    }

    /// Stores a content object under `key` (name components plus digest
    /// component; `comps` covers both).
    pub fn insert(
        &mut self,
        key: Vec<u8>,
        comps: Vec<u32>,
        tail: &[u8],
        sig_offset: Option<u32>,
        publisher_offset: Option<u32>,
        rng: &mut SmallRng,
    ) -> InsertOutcome {
        if let Some(&acc) = self.by_key.get(key.as_slice()) {
            let same = self
                .get(acc)
                .map(|e| e.tail.as_ref() == tail)
                .unwrap_or(false);
            if same {
                return InsertOutcome::Duplicate(acc);
            }
            self.remove(acc);
            return InsertOutcome::Collision;
        }

        let depth = self.draw_depth(rng);
        let entry = ContentEntry {
            accession: 0,
            key: key.into_boxed_slice(),
            comps: comps.into_boxed_slice(),
            tail: tail.into(),
            sig_offset,
            publisher_offset,
            faces: Vec::new(),
            nface_done: 0,
            nface_old: 0,
            sender: None,
            slow_send: false,
            skiplinks: vec![0; depth],
        };

        let acc = self.enroll(entry);
        self.link(acc, depth);
        if let Some(key) = self.get(acc).map(|e| e.key.clone()) {
            self.by_key.insert(key, acc);
        }
        InsertOutcome::New(acc)
    }

    /// Removes an entry from all three indices.
    pub fn remove(&mut self, accession: u64) -> Option<ContentEntry> {
        let (key, comps) = {
            let entry = self.get(accession)?;
            (entry.key.clone(), entry.comps.clone())
        };

        let mut preds = Vec::new();
        self.find_before(&key, &comps, &mut preds);
        for lvl in 0..self.level {
            let pred = preds[lvl];
            if self.link_of(pred, lvl) == accession {
                let next = self
                    .get(accession)
                    .map(|e| e.skiplinks[lvl])
                    .unwrap_or(0);
                self.set_link(pred, lvl, next);
            }
        }
        while self.level > 0 && self.head[self.level - 1] == 0 {
            self.level -= 1;
        }

        self.by_key.remove(&key);
        let idx = (accession - self.accession_base) as usize;
        self.content_by_accession[idx].take()
    }

    /// For each level, the rightmost entry whose name compares strictly
    /// less than the probe (accession 0 standing for the list head).
    /// `preds` is resized to the current level count.
    pub fn find_before(&self, key: &[u8], comps: &[u32], preds: &mut Vec<u64>) {
        preds.clear();
        preds.resize(self.level, 0);
        let mut cur = 0u64;
        for lvl in (0..self.level).rev() {
            loop {
                let next = self.link_of(cur, lvl);
                if next == 0 {
                    break;
                }
                let less = match self.get(next) {
                    Some(e) => name::compare(&e.key, &e.comps, key, comps) == Ordering::Less,
                    None => false,
                };
                if less {
                    cur = next;
                } else {
                    break;
                }
            }
            preds[lvl] = cur;
        }
    }

    /// The first entry whose name is greater than or equal to the probe.
    pub fn find_first_ge(&self, key: &[u8], comps: &[u32]) -> u64 {
        let mut preds = Vec::new();
        self.find_first_ge_with(key, comps, &mut preds)
    }

    /// As [`find_first_ge`], reusing a caller-provided predecessor vector.
    pub fn find_first_ge_with(&self, key: &[u8], comps: &[u32], preds: &mut Vec<u64>) -> u64 {
        self.find_before(key, comps, preds);
        match preds.first() {
            Some(&pred) => self.link_of(pred, 0),
            None => 0,
        }
    }

    /// Visits every entry currently in the accession window.
    pub fn for_each_entry_mut(&mut self, mut visit: impl FnMut(&mut ContentEntry)) {
        for slot in self.content_by_accession.iter_mut() {
            if let Some(entry) = slot.as_mut() {
                visit(entry);
            }
        }
    }

    /// Level-0 successor: the next entry in name order, 0 at the end.
    pub fn next(&self, accession: u64) -> u64 {
        self.get(accession).map(|e| e.skiplinks[0]).unwrap_or(0)
    }

    /// The smallest-named entry, 0 when the store is empty.
    pub fn first(&self) -> u64 {
        if self.level == 0 {
            0
        } else {
            self.head[0]
        }
    }

    fn enroll(&mut self, mut entry: ContentEntry) -> u64 {
        let acc = self.next_accession;
        self.next_accession += 1;
        entry.accession = acc;

        let mut idx = (acc - self.accession_base) as usize;
        if idx >= self.content_by_accession.len() {
            // Reallocation time: first trim dead slots off the low end by
            //  advancing the base, then grow what remains.
            let trim = self
                .content_by_accession
                .iter()
                .take_while(|e| e.is_none())
                .count();
            if trim > 0 {
                self.content_by_accession.drain(..trim);
                self.accession_base += trim as u64;
                idx = (acc - self.accession_base) as usize;
            }
            let len = self.content_by_accession.len();
            let grown = (len + len / 2 + 20).max(idx + 1);
            self.content_by_accession.resize_with(grown, || None);
        }
        self.content_by_accession[idx] = Some(entry);
        acc
    }

    fn link(&mut self, accession: u64, depth: usize) {
        let (key, comps) = match self.get(accession) {
            Some(e) => (e.key.clone(), e.comps.clone()),
            None => return,
        };
        let mut preds = Vec::new();
        self.find_before(&key, &comps, &mut preds);
        if depth > self.level {
            self.level = depth;
        }
        for lvl in 0..depth {
            let pred = preds.get(lvl).copied().unwrap_or(0);
            let next = self.link_of(pred, lvl);
            self.set_link(pred, lvl, accession);
            if let Some(e) = self.get_mut(accession) {
                e.skiplinks[lvl] = next;
            }
        }
    }

    fn link_of(&self, accession: u64, lvl: usize) -> u64 {
        if accession == 0 {
            self.head[lvl]
        } else {
            self.get(accession)
                .and_then(|e| e.skiplinks.get(lvl).copied())
                .unwrap_or(0)
        }
    }

    fn set_link(&mut self, accession: u64, lvl: usize, to: u64) {
        if accession == 0 {
            self.head[lvl] = to;
        } else if let Some(e) = self.get_mut(accession) {
            if let Some(slot) = e.skiplinks.get_mut(lvl) {
                *slot = to;
            }
        }
    }

    // Depth 1 plus a run of quarter-probability promotions, capped below
    //  the table maximum and never more than one level above the current
    //  top so the list grows gradually.
    fn draw_depth(&self, rng: &mut SmallRng) -> usize {
        let mut d = 1;
        while d < MAX_SKIPLIST_DEPTH - 1 && (rng.gen::<u32>() & 3) == 0 {
            d += 1;
        }
        d.min(self.level + 1)
    }

    #[cfg(test)]
    pub(crate) fn head_link(&self, lvl: usize) -> u64 {
        self.head[lvl]
    }
}
