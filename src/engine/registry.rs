//! Ordered position registry.
//!
//! A doubly-linked list of slot indices kept in descending `rank_key` order
//! (head = highest rank, tail = lowest). Nodes live in a fixed arena indexed
//! by slot, so insertion never allocates. Insert positions are located from
//! caller-supplied hints; a good hint makes every mutation O(1), a stale one
//! degrades to a walk but never to a wrong answer.

use bytemuck::{Pod, Zeroable};

use super::{BorrowerRole, EngineError, ManagerRole, Result, MAX_POSITIONS, NIL};

#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Pod, Zeroable)]
pub struct RegistryNode {
    pub rank_key: u64,
    pub prev: u16,
    pub next: u16,
    pub linked: u8,
    pub _padding: [u8; 3],
}

#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Pod, Zeroable)]
pub struct OrderedRegistry {
    pub head: u16,
    pub tail: u16,
    pub _padding: [u8; 4],
    pub size: u64,
    pub nodes: [RegistryNode; MAX_POSITIONS],
}

impl OrderedRegistry {
    /// Reset to the empty list. Zeroed memory is not empty: head/tail must be NIL.
    pub fn init(&mut self) {
        self.head = NIL;
        self.tail = NIL;
        self.size = 0;
        for node in self.nodes.iter_mut() {
            *node = RegistryNode { rank_key: 0, prev: NIL, next: NIL, linked: 0, _padding: [0; 3] };
        }
    }

    #[inline]
    pub fn contains(&self, id: u16) -> bool {
        (id as usize) < MAX_POSITIONS && self.nodes[id as usize].linked != 0
    }

    #[inline]
    pub fn size(&self) -> u64 {
        self.size
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.size == 0
    }

    /// Highest-rank id, or NIL.
    #[inline]
    pub fn first(&self) -> u16 {
        self.head
    }

    /// Lowest-rank id, or NIL. Redemption starts here.
    #[inline]
    pub fn last(&self) -> u16 {
        self.tail
    }

    /// Next id toward the tail (lower rank), or NIL.
    pub fn next(&self, id: u16) -> u16 {
        if !self.contains(id) {
            return NIL;
        }
        self.nodes[id as usize].next
    }

    /// Previous id toward the head (higher rank), or NIL.
    pub fn prev(&self, id: u16) -> u16 {
        if !self.contains(id) {
            return NIL;
        }
        self.nodes[id as usize].prev
    }

    pub fn rank_key(&self, id: u16) -> Option<u64> {
        if !self.contains(id) {
            return None;
        }
        Some(self.nodes[id as usize].rank_key)
    }

    pub fn insert(&mut self, _role: &BorrowerRole, id: u16, rank_key: u64, hint_prev: u16, hint_next: u16) -> Result<()> {
        self.insert_inner(id, rank_key, hint_prev, hint_next)
    }

    pub fn remove(&mut self, _role: &ManagerRole, id: u16) -> Result<()> {
        self.remove_inner(id)
    }

    /// Move `id` to the bracket for `new_rank_key`. Fails untouched if absent.
    pub fn reinsert(&mut self, _role: &BorrowerRole, id: u16, new_rank_key: u64, hint_prev: u16, hint_next: u16) -> Result<()> {
        if !self.contains(id) {
            return Err(EngineError::NotPresent);
        }
        self.remove_inner(id)?;
        self.insert_inner(id, new_rank_key, hint_prev, hint_next)
    }

    fn insert_inner(&mut self, id: u16, rank_key: u64, hint_prev: u16, hint_next: u16) -> Result<()> {
        if id == NIL || (id as usize) >= MAX_POSITIONS {
            return Err(EngineError::InvalidId);
        }
        if self.contains(id) {
            return Err(EngineError::AlreadyPresent);
        }

        let (prev, next) = self.find_insert_position(rank_key, hint_prev, hint_next);

        {
            let node = &mut self.nodes[id as usize];
            node.rank_key = rank_key;
            node.prev = prev;
            node.next = next;
            node.linked = 1;
        }

        match (prev == NIL, next == NIL) {
            (true, true) => {
                self.head = id;
                self.tail = id;
            }
            (true, false) => {
                self.nodes[next as usize].prev = id;
                self.head = id;
            }
            (false, true) => {
                self.nodes[prev as usize].next = id;
                self.tail = id;
            }
            (false, false) => {
                self.nodes[prev as usize].next = id;
                self.nodes[next as usize].prev = id;
            }
        }

        self.size += 1;
        Ok(())
    }

    fn remove_inner(&mut self, id: u16) -> Result<()> {
        if !self.contains(id) {
            return Err(EngineError::NotPresent);
        }
        let RegistryNode { prev, next, .. } = self.nodes[id as usize];

        if prev == NIL {
            self.head = next;
        } else {
            self.nodes[prev as usize].next = next;
        }
        if next == NIL {
            self.tail = prev;
        } else {
            self.nodes[next as usize].prev = prev;
        }

        let node = &mut self.nodes[id as usize];
        node.prev = NIL;
        node.next = NIL;
        node.linked = 0;
        node.rank_key = 0;
        self.size -= 1;
        Ok(())
    }

    /// Whether (prev, next) is a tight bracket for `rank_key`.
    pub fn valid_insert_position(&self, rank_key: u64, prev: u16, next: u16) -> bool {
        match (prev == NIL, next == NIL) {
            (true, true) => self.is_empty(),
            (true, false) => self.head == next && rank_key >= self.nodes[next as usize].rank_key,
            (false, true) => self.tail == prev && rank_key <= self.nodes[prev as usize].rank_key,
            (false, false) => {
                self.nodes[prev as usize].next == next
                    && self.nodes[prev as usize].rank_key >= rank_key
                    && rank_key >= self.nodes[next as usize].rank_key
            }
        }
    }

    fn descend_list(&self, rank_key: u64, start: u16) -> (u16, u16) {
        if self.head == start && rank_key >= self.nodes[start as usize].rank_key {
            return (NIL, start);
        }
        let mut prev = start;
        let mut next = self.nodes[prev as usize].next;
        while prev != NIL && !self.valid_insert_position(rank_key, prev, next) {
            prev = self.nodes[prev as usize].next;
            next = if prev == NIL { NIL } else { self.nodes[prev as usize].next };
        }
        (prev, next)
    }

    fn ascend_list(&self, rank_key: u64, start: u16) -> (u16, u16) {
        if self.tail == start && rank_key <= self.nodes[start as usize].rank_key {
            return (start, NIL);
        }
        let mut next = start;
        let mut prev = self.nodes[next as usize].prev;
        while next != NIL && !self.valid_insert_position(rank_key, prev, next) {
            next = self.nodes[next as usize].prev;
            prev = if next == NIL { NIL } else { self.nodes[next as usize].prev };
        }
        (prev, next)
    }

    /// Tightest (prev, next) with prev.rank >= rank_key >= next.rank.
    ///
    /// Hints that are absent or on the wrong side of `rank_key` are dropped
    /// before the walk.
    pub fn find_insert_position(&self, rank_key: u64, hint_prev: u16, hint_next: u16) -> (u16, u16) {
        if self.is_empty() {
            return (NIL, NIL);
        }

        let mut prev = hint_prev;
        let mut next = hint_next;

        if prev != NIL && (!self.contains(prev) || rank_key > self.nodes[prev as usize].rank_key) {
            prev = NIL;
        }
        if next != NIL && (!self.contains(next) || rank_key < self.nodes[next as usize].rank_key) {
            next = NIL;
        }

        match (prev == NIL, next == NIL) {
            (true, true) => self.descend_list(rank_key, self.head),
            (true, false) => self.ascend_list(rank_key, next),
            (false, _) => self.descend_list(rank_key, prev),
        }
    }
}
