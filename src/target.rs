//! Origin-side synchronization state of one (window, target rank) pair.

use std::collections::VecDeque;

use crate::op::{IssuedClass, PendingOp};
use crate::packet::{LockMode, RequestHandle, SyncBits};
use crate::Rank;

/// Lock phase of a target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, strum::Display)]
pub enum TargetAccessState {
    /// `lock` was called; no request has left yet.
    LockCalled,
    /// A request is in flight or queued at the target.
    LockIssued,
    LockGranted,
}

/// Synchronization the origin wants to attach to the next packet it sends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SyncFlag {
    #[default]
    None,
    Flush,
    Unlock,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LockAssert {
    #[default]
    None,
    /// The caller guarantees no conflicting lock exists; no request is sent.
    NoCheck,
}

#[derive(Debug)]
pub struct TargetSync {
    pub rank: Rank,
    pub mode: LockMode,
    pub assert: LockAssert,
    access_state: TargetAccessState,
    pub sync_flag: SyncFlag,
    pub outstanding_acks: usize,
    /// A put or accumulate went out after the last FLUSH / UNLOCK was sent.
    pub put_acc_issued: bool,
    /// Lock request was counted in the window's `outstanding_locks`.
    pub lock_counted: bool,
    /// Ask for the lock even without operations to carry it.
    pub force_lock: bool,

    /// Operations not yet confirmed issued, in submission order.
    pub pending: VecDeque<PendingOp>,
    /// Index into `pending` of the next operation to send.
    pub next_op_to_issue: usize,
    pub issued_write: VecDeque<PendingOp>,
    pub issued_read: VecDeque<PendingOp>,
    pub issued_dt: VecDeque<PendingOp>,
}

impl TargetSync {
    pub fn new(rank: Rank, mode: LockMode, assert: LockAssert) -> Self {
        Self {
            rank,
            mode,
            assert,
            access_state: TargetAccessState::LockCalled,
            sync_flag: SyncFlag::None,
            outstanding_acks: 0,
            put_acc_issued: false,
            lock_counted: false,
            force_lock: false,
            pending: VecDeque::new(),
            next_op_to_issue: 0,
            issued_write: VecDeque::new(),
            issued_read: VecDeque::new(),
            issued_dt: VecDeque::new(),
        }
    }

    pub fn access_state(&self) -> TargetAccessState {
        self.access_state
    }

    /// Move to `to`.
    ///
    /// # Panics
    ///
    /// Panic on a transition the lock protocol never makes. The only backward step is
    /// `LockIssued -> LockCalled` after a discarded request.
    pub fn transition(&mut self, to: TargetAccessState) {
        use TargetAccessState::*;
        let ok = matches!(
            (self.access_state, to),
            (LockCalled, LockIssued)
                | (LockCalled, LockGranted)
                | (LockIssued, LockGranted)
                | (LockIssued, LockCalled)
        );
        assert!(ok, "invalid lock transition {} -> {}", self.access_state, to);
        self.access_state = to;
    }

    /// Sync intent to restore when an operation carrying these bits is rewound.
    pub fn restore_sync(&mut self, flush: bool, unlock: bool) {
        if unlock {
            self.sync_flag = SyncFlag::Unlock;
        } else if flush && self.sync_flag == SyncFlag::None {
            self.sync_flag = SyncFlag::Flush;
        }
    }

    /// Record one more FLUSH / UNLOCK that the target must acknowledge.
    pub fn expect_ack(&mut self) {
        self.outstanding_acks += 1;
    }

    /// # Panics
    ///
    /// Panic if no acknowledgment is outstanding.
    pub fn ack_received(&mut self) {
        assert!(
            self.outstanding_acks > 0,
            "flush acknowledgment from rank {} without a request",
            self.rank
        );
        self.outstanding_acks -= 1;
    }

    /// Take the pending sync intent as the bits to send with the next packet.
    ///
    /// An unlock of a `NoCheck` epoch never held a lock at the target and goes out as a
    /// flush. Writes issued before this point are covered by the acknowledgment, so
    /// `put_acc_issued` starts over.
    pub fn take_sync(&mut self) -> SyncBits {
        let bits = match self.sync_flag {
            SyncFlag::None => return SyncBits::default(),
            SyncFlag::Unlock if self.assert == LockAssert::None => SyncBits {
                unlock: true,
                ..Default::default()
            },
            SyncFlag::Flush | SyncFlag::Unlock => SyncBits {
                flush: true,
                ..Default::default()
            },
        };
        self.sync_flag = SyncFlag::None;
        self.put_acc_issued = false;
        self.expect_ack();
        bits
    }

    /// Undo the issue of the head operation after its lock request was discarded.
    pub(crate) fn rewind_head(&mut self) {
        let Some(op) = self.pending.front_mut() else {
            return;
        };
        let sync = op.flags.sync();
        op.rewind();
        self.next_op_to_issue = 0;
        if sync.flush || sync.unlock {
            assert!(self.outstanding_acks > 0, "rewound sync bits were never counted");
            self.outstanding_acks -= 1;
            self.put_acc_issued = true;
            self.restore_sync(sync.flush, sync.unlock);
        }
    }

    /// A lock request has to go out for this target.
    pub fn needs_lock(&self) -> bool {
        self.unissued() > 0 || self.force_lock || self.sync_flag != SyncFlag::None
    }

    /// No request was ever made and none is wanted; sync calls complete at once.
    pub fn never_requested(&self) -> bool {
        self.access_state == TargetAccessState::LockCalled
            && !self.lock_counted
            && !self.force_lock
            && self.pending.is_empty()
    }

    /// Number of operations not yet sent.
    pub fn unissued(&self) -> usize {
        self.pending.len() - self.next_op_to_issue
    }

    /// Put an issued operation where it waits for completion, or finish it.
    pub fn retire_issued(&mut self, op: PendingOp) {
        op.set_user_req_after_issue();
        if op.reqs.is_empty() {
            return;
        }
        match op.classify() {
            IssuedClass::Derived => self.issued_dt.push_back(op),
            IssuedClass::Write => self.issued_write.push_back(op),
            IssuedClass::Read => self.issued_read.push_back(op),
        }
    }

    /// Find an operation waiting for data or acknowledgment.
    pub fn find_op_mut(&mut self, id: RequestHandle) -> Option<&mut PendingOp> {
        self.pending
            .iter_mut()
            .chain(self.issued_read.iter_mut())
            .chain(self.issued_dt.iter_mut())
            .chain(self.issued_write.iter_mut())
            .find(|op| op.id == id)
    }

    /// Drop a completed operation from whichever issued list holds it.
    pub fn remove_completed(&mut self, id: RequestHandle) -> Option<PendingOp> {
        for list in [
            &mut self.issued_read,
            &mut self.issued_dt,
            &mut self.issued_write,
        ] {
            if let Some(pos) = list.iter().position(|op| op.id == id && op.reqs.is_empty()) {
                return list.remove(pos);
            }
        }
        None
    }

    /// Every issued operation has completed locally.
    pub fn issued_lists_empty(&self) -> bool {
        self.issued_write.is_empty() && self.issued_read.is_empty() && self.issued_dt.is_empty()
    }

    /// Nothing is queued, in flight, or waiting for an acknowledgment.
    pub fn is_quiet(&self) -> bool {
        self.pending.is_empty()
            && self.issued_lists_empty()
            && self.sync_flag == SyncFlag::None
            && self.outstanding_acks == 0
    }
}
