//! Per-window FIFO of lock requests that could not be granted on arrival.

use std::collections::VecDeque;

use crate::packet::{LockMode, Packet};
use crate::Rank;

/// What a queued entry keeps of the operation that came with the lock request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LockEntryPayload {
    /// Operation data is buffered (possibly still arriving).
    Buffered(Vec<u8>),
    /// Only the lock request is kept; the origin re-sends the operation after the grant.
    BareRequest,
    /// Nothing could be kept; the origin retransmits the lock request.
    Discarded,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EntryId(u64);

/// Outcome of [`LockQueue::admit`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// Queued with room for the payload.
    Buffered(EntryId),
    /// Queued as a bare lock request; the payload must be drained and dropped.
    Bare(EntryId),
    Discarded,
}

impl Admission {
    pub fn entry(self) -> Option<EntryId> {
        match self {
            Admission::Buffered(id) | Admission::Bare(id) => Some(id),
            Admission::Discarded => None,
        }
    }
}

/// A queued lock request.
#[derive(Debug)]
pub struct LockEntry {
    pub id: EntryId,
    /// Copy of the request; a bare entry holds a LOCK packet with the original flags.
    pub pkt: Packet,
    pub payload: LockEntryPayload,
    pub source: Rank,
    pub all_data_received: bool,
    /// Payload bytes the origin sends after the header.
    expected: usize,
    received: usize,
    /// Bytes charged against the window budget.
    charged: usize,
}

impl LockEntry {
    pub fn mode(&self) -> Option<LockMode> {
        self.pkt.lock_mode()
    }
}

/// FIFO of pending lock requests with a bounded payload budget.
#[derive(Debug)]
pub struct LockQueue {
    entries: VecDeque<LockEntry>,
    next_id: u64,
    max_entries: usize,
    data_bytes: usize,
    data_budget: usize,
}

impl LockQueue {
    pub fn new(max_entries: usize, data_budget: usize) -> Self {
        Self {
            entries: VecDeque::new(),
            next_id: 0,
            max_entries,
            data_bytes: 0,
            data_budget,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Payload bytes currently buffered.
    pub fn data_bytes(&self) -> usize {
        self.data_bytes
    }

    pub fn front(&self) -> Option<&LockEntry> {
        self.entries.front()
    }

    pub fn iter(&self) -> impl Iterator<Item = &LockEntry> {
        self.entries.iter()
    }

    /// Append `pkt` from `source` unless no entry can be had.
    ///
    /// `bare` is the LOCK packet kept instead of `pkt` when the payload cannot be buffered.
    pub fn admit(&mut self, pkt: Packet, bare: Packet, source: Rank) -> Admission {
        let expected = pkt.data_len();
        let payload = self.payload_for(expected);
        let (pkt, charged) = match payload {
            LockEntryPayload::Discarded => return Admission::Discarded,
            LockEntryPayload::BareRequest => (bare, 0),
            LockEntryPayload::Buffered(_) => (pkt, expected),
        };
        self.data_bytes += charged;

        let id = EntryId(self.next_id);
        self.next_id += 1;
        let admission = match payload {
            LockEntryPayload::BareRequest => Admission::Bare(id),
            _ => Admission::Buffered(id),
        };
        self.entries.push_back(LockEntry {
            id,
            pkt,
            payload,
            source,
            all_data_received: expected == 0,
            expected,
            received: 0,
            charged,
        });
        admission
    }

    /// Decide what an entry with `expected` payload bytes can keep.
    fn payload_for(&mut self, expected: usize) -> LockEntryPayload {
        if self.entries.len() >= self.max_entries || self.entries.try_reserve(1).is_err() {
            return LockEntryPayload::Discarded;
        }
        if expected == 0 {
            return LockEntryPayload::Buffered(Vec::new());
        }
        if self.data_bytes + expected >= self.data_budget {
            return LockEntryPayload::BareRequest;
        }
        let mut buf = Vec::new();
        match buf.try_reserve_exact(expected) {
            Ok(()) => LockEntryPayload::Buffered(buf),
            Err(_) => LockEntryPayload::BareRequest,
        }
    }

    /// Feed payload bytes into entry `id`. Return how many were consumed and whether the
    /// entry now has all its data.
    pub fn receive(&mut self, id: EntryId, bytes: &[u8]) -> Option<(usize, bool)> {
        let entry = self.entries.iter_mut().find(|e| e.id == id)?;
        let take = bytes.len().min(entry.expected - entry.received);
        if let LockEntryPayload::Buffered(buf) = &mut entry.payload {
            buf.extend_from_slice(&bytes[..take]);
        }
        entry.received += take;
        entry.all_data_received = entry.received == entry.expected;
        Some((take, entry.all_data_received))
    }

    /// Remove the head entry and refund its budget.
    pub fn pop_front(&mut self) -> Option<LockEntry> {
        let entry = self.entries.pop_front()?;
        assert!(
            self.data_bytes >= entry.charged,
            "lock data budget underflow: {} < {}",
            self.data_bytes,
            entry.charged
        );
        self.data_bytes -= entry.charged;
        Some(entry)
    }
}
