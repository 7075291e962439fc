//! The two interest tables.
//!
//! The prefix table aggregates demand: one entry per name prefix, holding a
//! decaying counter per interested face. The propagating table holds the
//! live forwarded interests keyed by nonce; its entries form a doubly
//! linked list per prefix entry, threaded through arena slot indices
//! rather than pointers, with the prefix entry acting as the sentinel.

use crate::sched::TaskId;
use std::collections::HashMap;

/// One fresh interest's worth of demand.
pub const CCN_UNIT_INTEREST: u32 = 12;
/// Counters never aggregate past a handful of units.
pub const DEMAND_CAP: u32 = CCN_UNIT_INTEREST * 8;
/// Empty aging passes a prefix entry survives before deletion.
pub const PREFIX_IDLE_LIMIT: u32 = 8;

pub struct PrefixEntry {
    pub ncomps: usize,
    /// Parallel vectors: one demanding face and its counter per index.
    pub interested_faceid: Vec<u32>,
    pub counter: Vec<u32>,
    /// Consecutive aging passes with no active demand.
    pub idle: u32,
    prop_head: Option<usize>,
}

impl PrefixEntry {
    pub fn demand_for(&self, faceid: u32) -> u32 {
        self.interested_faceid
            .iter()
            .position(|f| *f == faceid)
            .map(|i| self.counter[i])
            .unwrap_or(0)
    }

    pub fn has_demand(&self) -> bool {
        !self.counter.is_empty()
    }
}

pub struct PropEntry {
    pub nonce: Box<[u8]>,
    /// The encoded interest; None once a matching content consumed it.
    pub interest_msg: Option<Box<[u8]>>,
    /// The face the interest arrived on.
    pub faceid: u32,
    /// Faces still owed a forwarded copy, drained one per tick.
    pub outbound: Vec<u32>,
    pub task: Option<TaskId>,
    /// Set by a reaper pass that found nothing left to do; a second such
    /// pass retires the entry.
    pub stale: bool,
    prefix_key: Box<[u8]>,
    prev: Option<usize>,
    next: Option<usize>,
}

impl PropEntry {
    /// Nothing left to send and no tick pending: the entry is awaiting a
    /// reply and only suppresses nonce loops until the reaper retires it.
    pub fn is_drained(&self) -> bool {
        self.outbound.is_empty() && self.task.is_none()
    }
}

#[derive(Default)]
pub struct InterestTables {
    prefixes: HashMap<Box<[u8]>, PrefixEntry>,
    slots: Vec<Option<PropEntry>>,
    free: Vec<usize>,
    by_nonce: HashMap<Box<[u8]>, usize>,
}

impl InterestTables {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn prefix(&self, key: &[u8]) -> Option<&PrefixEntry> {
        self.prefixes.get(key)
    }

    pub fn prefix_mut(&mut self, key: &[u8]) -> Option<&mut PrefixEntry> {
        self.prefixes.get_mut(key)
    }

    pub fn prefix_count(&self) -> usize {
        self.prefixes.len()
    }

    pub fn no_demand(&self) -> bool {
        self.prefixes.is_empty()
    }

    /// Bumps the demand one face has expressed at one prefix, creating the
    /// entry as needed.
    pub fn record_demand(&mut self, key: &[u8], ncomps: usize, faceid: u32) {
        if !self.prefixes.contains_key(key) {
            self.prefixes.insert(
                key.into(),
                PrefixEntry {
                    ncomps,
                    interested_faceid: Vec::new(),
                    counter: Vec::new(),
                    idle: 0,
                    prop_head: None,
                },
            );
        }
        let entry = match self.prefixes.get_mut(key) {
            Some(entry) => entry,
            None => return,
        };
        entry.idle = 0;
        match entry.interested_faceid.iter().position(|f| *f == faceid) {
            Some(i) => {
                entry.counter[i] = entry.counter[i].saturating_add(CCN_UNIT_INTEREST).min(DEMAND_CAP)
            }
            None => {
                entry.interested_faceid.push(faceid);
                entry.counter.push(CCN_UNIT_INTEREST);
            }
        }
    }

    /// One aging pass: counters above a unit lose a sixth, others step down
    /// by one, spent slots are swap-removed, and prefixes idle past the
    /// limit are deleted together with their propagating entries. Returns
    /// the task ids of any propagation ticks that must be cancelled.
    pub fn age_pass(&mut self) -> Vec<TaskId> {
        let mut expired: Vec<Box<[u8]>> = Vec::new();
        for (key, entry) in self.prefixes.iter_mut() {
            let mut i = 0;
            while i < entry.counter.len() {
                let c = entry.counter[i];
                entry.counter[i] = if c > CCN_UNIT_INTEREST {
                    c * 5 / 6
                } else {
                    c.saturating_sub(1)
                };
                if entry.counter[i] == 0 {
                    entry.counter.swap_remove(i);
                    entry.interested_faceid.swap_remove(i);
                } else {
                    i += 1;
                }
            }
            if entry.has_demand() {
                entry.idle = 0;
            } else {
                entry.idle += 1;
                if entry.idle > PREFIX_IDLE_LIMIT && entry.prop_head.is_none() {
                    expired.push(key.clone());
                }
            }
        }

        let mut cancelled = Vec::new();
        for key in expired {
            cancelled.extend(self.remove_prefix(&key));
        }
        cancelled
    }

    /// Deletes a prefix entry and retires its propagating list.
    pub fn remove_prefix(&mut self, key: &[u8]) -> Vec<TaskId> {
        let mut cancelled = Vec::new();
        if let Some(entry) = self.prefixes.remove(key) {
            let mut cur = entry.prop_head;
            while let Some(slot) = cur {
                let prop = self.slots[slot].take();
                self.free.push(slot);
                if let Some(mut prop) = prop {
                    cur = prop.next;
                    self.by_nonce.remove(&prop.nonce);
                    if let Some(task) = prop.task.take() {
                        cancelled.push(task);
                    }
                } else {
                    break;
                }
            }
        }
        cancelled
    }

    /// O(1) loop detection: has this nonce been seen anywhere recently?
    pub fn nonce_seen(&self, nonce: &[u8]) -> bool {
        self.by_nonce.contains_key(nonce)
    }

    /// Registers a forwarded interest under its nonce and links it into the
    /// owning prefix entry's list. Returns None on a duplicate nonce or a
    /// missing prefix entry.
    pub fn add_propagating(
        &mut self,
        nonce: &[u8],
        interest_msg: Box<[u8]>,
        faceid: u32,
        outbound: Vec<u32>,
        prefix_key: &[u8],
    ) -> Option<usize> {
        if self.by_nonce.contains_key(nonce) {
            return None;
        }
        let prefix = self.prefixes.get_mut(prefix_key)?;

        let slot = match self.free.pop() {
            Some(slot) => slot,
            None => {
                self.slots.push(None);
                self.slots.len() - 1
            }
        };

        let old_head = prefix.prop_head;
        prefix.prop_head = Some(slot);
        self.slots[slot] = Some(PropEntry {
            nonce: nonce.into(),
            interest_msg: Some(interest_msg),
            faceid,
            outbound,
            task: None,
            stale: false,
            prefix_key: prefix_key.into(),
            prev: None,
            next: old_head,
        });
        if let Some(next) = old_head {
            if let Some(e) = self.slots[next].as_mut() {
                e.prev = Some(slot);
            }
        }
        self.by_nonce.insert(nonce.into(), slot);
        Some(slot)
    }

    pub fn prop(&self, slot: usize) -> Option<&PropEntry> {
        self.slots.get(slot)?.as_ref()
    }

    pub fn prop_mut(&mut self, slot: usize) -> Option<&mut PropEntry> {
        self.slots.get_mut(slot)?.as_mut()
    }

    pub fn prop_count(&self) -> usize {
        self.by_nonce.len()
    }

    /// Unlinks and frees one propagating entry.
    pub fn remove_propagating(&mut self, slot: usize) -> Option<PropEntry> {
        let entry = self.slots.get_mut(slot)?.take()?;
        self.free.push(slot);
        self.by_nonce.remove(&entry.nonce);

        match entry.prev {
            Some(prev) => {
                if let Some(e) = self.slots[prev].as_mut() {
                    e.next = entry.next;
                }
            }
            None => {
                if let Some(prefix) = self.prefixes.get_mut(&entry.prefix_key) {
                    prefix.prop_head = entry.next;
                }
            }
        }
        if let Some(next) = entry.next {
            if let Some(e) = self.slots[next].as_mut() {
                e.prev = entry.prev;
            }
        }
        Some(entry)
    }

    /// Marks every propagating interest under a prefix as consumed by an
    /// arriving content. Returns the tick tasks to cancel.
    pub fn consume_matching(&mut self, prefix_key: &[u8]) -> Vec<TaskId> {
        let mut cancelled = Vec::new();
        let mut cur = self.prefixes.get(prefix_key).and_then(|p| p.prop_head);
        while let Some(slot) = cur {
            let entry = match self.slots[slot].as_mut() {
                Some(e) => e,
                None => break,
            };
            cur = entry.next;
            entry.interest_msg = None;
            entry.outbound.clear();
            entry.stale = false;
            if let Some(task) = entry.task.take() {
                cancelled.push(task);
            }
        }
        cancelled
    }

    /// One reaper pass over the propagating entries: a drained entry is
    /// marked on the first pass and retired on the second; any activity in
    /// between clears the mark.
    pub fn reap_props(&mut self) {
        let mut retire = Vec::new();
        for (slot, entry) in self.slots.iter_mut().enumerate() {
            if let Some(e) = entry.as_mut() {
                if e.is_drained() {
                    if e.stale {
                        retire.push(slot);
                    } else {
                        e.stale = true;
                    }
                }
            }
        }
        for slot in retire {
            self.remove_propagating(slot);
        }
    }

    #[cfg(test)]
    fn check_links(&self) {
        for (slot, entry) in self.slots.iter().enumerate() {
            let Some(e) = entry.as_ref() else { continue };
            match e.prev {
                Some(p) => assert_eq!(self.slots[p].as_ref().map(|x| x.next), Some(Some(slot))),
                None => assert_eq!(
                    self.prefixes.get(&e.prefix_key).and_then(|p| p.prop_head),
                    Some(slot)
                ),
            }
            if let Some(n) = e.next {
                assert_eq!(self.slots[n].as_ref().map(|x| x.prev), Some(Some(slot)));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::name;

    fn prefix_key(parts: &[&str]) -> Vec<u8> {
        name::from_parts(parts)
    }

    #[test]
    fn test_demand_accumulates_and_caps() {
        let mut t = InterestTables::new();
        let key = prefix_key(&["x", "y"]);
        for _ in 0..100 {
            t.record_demand(&key, 2, 7);
        }
        let entry = t.prefix(&key).unwrap();
        assert_eq!(entry.interested_faceid.len(), entry.counter.len());
        assert_eq!(entry.demand_for(7), DEMAND_CAP);
        t.record_demand(&key, 2, 9);
        assert_eq!(t.prefix(&key).unwrap().demand_for(9), CCN_UNIT_INTEREST);
    }

    #[test]
    fn test_aging_decays_and_removes() {
        let mut t = InterestTables::new();
        let key = prefix_key(&["x"]);
        t.record_demand(&key, 1, 7);
        assert_eq!(t.prefix(&key).unwrap().demand_for(7), CCN_UNIT_INTEREST);

        // One unit of demand drains one step per pass
        for expected in (0..CCN_UNIT_INTEREST).rev() {
            t.age_pass();
            assert_eq!(t.prefix(&key).unwrap().demand_for(7), expected);
        }
        let entry = t.prefix(&key).unwrap();
        assert!(entry.counter.is_empty());
        assert_eq!(entry.idle, 1);

        // More empty passes keep it until the ninth consecutive one
        for _ in 0..(PREFIX_IDLE_LIMIT - 1) {
            t.age_pass();
            assert!(t.prefix(&key).is_some());
        }
        t.age_pass();
        assert!(t.prefix(&key).is_none());
        assert!(t.no_demand());
    }

    #[test]
    fn test_aging_halves_over_four_passes() {
        let mut t = InterestTables::new();
        let key = prefix_key(&["h"]);
        for _ in 0..8 {
            t.record_demand(&key, 1, 1);
        }
        let start = t.prefix(&key).unwrap().demand_for(1);
        for _ in 0..4 {
            t.age_pass();
        }
        let after = t.prefix(&key).unwrap().demand_for(1);
        // Four five-sixths steps land close to a half
        assert!(after <= start / 2 + 2 && after >= start / 3);
    }

    #[test]
    fn test_nonce_loop_detection() {
        let mut t = InterestTables::new();
        let key = prefix_key(&["x"]);
        t.record_demand(&key, 1, 1);
        assert!(!t.nonce_seen(b"nonce1"));
        let slot = t
            .add_propagating(b"nonce1", Box::from(&b"msg"[..]), 1, vec![2, 3], &key)
            .unwrap();
        assert!(t.nonce_seen(b"nonce1"));
        assert!(t
            .add_propagating(b"nonce1", Box::from(&b"msg"[..]), 2, vec![], &key)
            .is_none());
        t.remove_propagating(slot);
        assert!(!t.nonce_seen(b"nonce1"));
    }

    #[test]
    fn test_propagating_list_linkage() {
        let mut t = InterestTables::new();
        let key = prefix_key(&["x"]);
        t.record_demand(&key, 1, 1);
        let a = t
            .add_propagating(b"na", Box::from(&b"m"[..]), 1, vec![], &key)
            .unwrap();
        let b = t
            .add_propagating(b"nb", Box::from(&b"m"[..]), 1, vec![], &key)
            .unwrap();
        let c = t
            .add_propagating(b"nc", Box::from(&b"m"[..]), 1, vec![], &key)
            .unwrap();
        t.check_links();

        // Remove the middle of the list, then the head
        t.remove_propagating(b);
        t.check_links();
        t.remove_propagating(c);
        t.check_links();
        t.remove_propagating(a);
        t.check_links();
        assert_eq!(t.prop_count(), 0);
        assert!(t.prefix(&key).unwrap().prop_head.is_none());
    }

    #[test]
    fn test_consume_and_reap() {
        let mut t = InterestTables::new();
        let key = prefix_key(&["x"]);
        t.record_demand(&key, 1, 1);
        let slot = t
            .add_propagating(b"nn", Box::from(&b"m"[..]), 1, vec![4, 5], &key)
            .unwrap();
        t.prop_mut(slot).unwrap().task = Some(42);

        let cancelled = t.consume_matching(&key);
        assert_eq!(cancelled, vec![42]);
        assert!(t.prop(slot).unwrap().is_drained());

        // First reap pass marks, second retires
        t.reap_props();
        assert!(t.prop(slot).unwrap().stale);
        t.reap_props();
        assert!(t.prop(slot).is_none());
        assert_eq!(t.prop_count(), 0);
    }

    #[test]
    fn test_expired_prefix_takes_its_props_along() {
        let mut t = InterestTables::new();
        let key = prefix_key(&["x"]);
        t.record_demand(&key, 1, 1);
        let slot = t
            .add_propagating(b"np", Box::from(&b"m"[..]), 1, vec![], &key)
            .unwrap();
        t.prop_mut(slot).unwrap().task = Some(9);
        // Entries with a live propagating list are not expired by aging
        for _ in 0..40 {
            t.age_pass();
        }
        assert!(t.prefix(&key).is_some());
        let cancelled = t.remove_prefix(&key);
        assert_eq!(cancelled, vec![9]);
        assert!(t.prop(slot).is_none());
        assert!(t.no_demand());
    }
}
