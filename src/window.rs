//! Exposed window state: the target-side lock and the origin-side epochs.

use std::collections::BTreeMap;

use crate::config::RmaConfig;
use crate::error::{Result, RmaError};
use crate::lockqueue::LockQueue;
use crate::packet::{LockMode, WinHandle};
use crate::target::{LockAssert, TargetSync};
use crate::Rank;

/// Holders of a window's local lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LocalLock {
    #[default]
    Unlocked,
    Shared(usize),
    Exclusive,
}

impl LocalLock {
    pub fn compatible(self, mode: LockMode) -> bool {
        match (self, mode) {
            (LocalLock::Unlocked, _) => true,
            (LocalLock::Shared(_), LockMode::Shared) => true,
            _ => false,
        }
    }

    /// Take the lock in `mode` if compatible with the current holders.
    pub fn acquire(&mut self, mode: LockMode) -> bool {
        if !self.compatible(mode) {
            return false;
        }
        *self = match (mode, *self) {
            (LockMode::Exclusive, _) => LocalLock::Exclusive,
            (LockMode::Shared, LocalLock::Shared(n)) => LocalLock::Shared(n + 1),
            (LockMode::Shared, _) => LocalLock::Shared(1),
        };
        true
    }

    pub fn release(&mut self) -> Result<()> {
        *self = match *self {
            LocalLock::Unlocked => {
                return Err(RmaError::Protocol("release of an unheld window lock".into()))
            }
            LocalLock::Shared(1) | LocalLock::Exclusive => LocalLock::Unlocked,
            LocalLock::Shared(n) => LocalLock::Shared(n - 1),
        };
        Ok(())
    }
}

/// Origin-side epoch kind of a window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, strum::Display)]
pub enum WinAccessState {
    #[default]
    None,
    /// Per-target `lock` epochs.
    PerTarget,
    /// `lock_all`; locks are requested per target on demand.
    LockAllCalled,
    /// `lock_all`; a shared lock request went to every rank.
    LockAllIssued,
    /// Every request of `LockAllIssued` has been granted.
    LockAllGranted,
}

impl WinAccessState {
    pub fn is_lock_all(self) -> bool {
        matches!(
            self,
            WinAccessState::LockAllCalled
                | WinAccessState::LockAllIssued
                | WinAccessState::LockAllGranted
        )
    }
}

#[derive(Debug)]
pub struct Window {
    handle: WinHandle,
    base: Vec<u8>,
    /// Handle of this window at every rank.
    peer_handles: Vec<WinHandle>,
    shm_allocated: bool,

    pub(crate) lock_state: LocalLock,
    pub(crate) lock_queue: LockQueue,
    /// Set while the lock queue is being serviced.
    pub(crate) servicing: bool,
    /// Own lock request that found the queue full; retried by the next poke.
    pub(crate) local_retry: Option<LockMode>,

    outstanding_locks: usize,
    at_completion_counter: usize,
    /// Completion notices that arrived before they were expected.
    early_completions: usize,
    pub(crate) access_state: WinAccessState,
    pub(crate) lock_all_assert: LockAssert,
    pub(crate) targets: BTreeMap<Rank, TargetSync>,
}

impl Window {
    pub(crate) fn new(
        handle: WinHandle,
        size: usize,
        comm_size: usize,
        shm_allocated: bool,
        config: &RmaConfig,
    ) -> Self {
        Self {
            handle,
            base: vec![0; size],
            peer_handles: vec![handle; comm_size],
            shm_allocated,
            lock_state: LocalLock::Unlocked,
            lock_queue: LockQueue::new(config.lock_entry_pool, config.lock_data_bytes),
            servicing: false,
            local_retry: None,
            outstanding_locks: 0,
            at_completion_counter: 0,
            early_completions: 0,
            access_state: WinAccessState::None,
            lock_all_assert: LockAssert::None,
            targets: BTreeMap::new(),
        }
    }

    pub fn handle(&self) -> WinHandle {
        self.handle
    }

    pub fn size(&self) -> usize {
        self.base.len()
    }

    pub fn local(&self) -> &[u8] {
        &self.base
    }

    pub fn local_mut(&mut self) -> &mut [u8] {
        &mut self.base
    }

    pub fn is_shm_allocated(&self) -> bool {
        self.shm_allocated
    }

    pub fn lock_state(&self) -> LocalLock {
        self.lock_state
    }

    pub fn lock_queue(&self) -> &LockQueue {
        &self.lock_queue
    }

    pub fn access_state(&self) -> WinAccessState {
        self.access_state
    }

    pub fn target(&self, rank: Rank) -> Option<&TargetSync> {
        self.targets.get(&rank)
    }

    pub(crate) fn target_mut(&mut self, rank: Rank) -> Result<&mut TargetSync> {
        self.targets.get_mut(&rank).ok_or(RmaError::NoEpoch(rank))
    }

    pub(crate) fn peer_handle(&self, rank: Rank) -> Result<WinHandle> {
        self.peer_handles
            .get(rank)
            .copied()
            .ok_or(RmaError::InvalidRank(rank))
    }

    pub(crate) fn set_peer_handles(&mut self, handles: Vec<WinHandle>) -> Result<()> {
        if handles.len() != self.peer_handles.len() {
            return Err(RmaError::InvalidRank(handles.len()));
        }
        self.peer_handles = handles;
        Ok(())
    }

    /// Try the local lock. Queued requests go first, so this fails while any are waiting.
    pub(crate) fn try_acquire_lock(&mut self, mode: LockMode) -> bool {
        self.lock_queue.is_empty() && self.lock_state.acquire(mode)
    }

    pub fn outstanding_locks(&self) -> usize {
        self.outstanding_locks
    }

    /// Count a lock request that will be answered by a grant.
    pub(crate) fn lock_requested(&mut self) {
        self.outstanding_locks += 1;
    }

    /// Account for a received grant.
    ///
    /// # Panics
    ///
    /// Panic if no request is outstanding.
    pub(crate) fn grant(&mut self) {
        assert!(
            self.outstanding_locks > 0,
            "lock grant on window {:#x} without an outstanding request",
            self.handle.0
        );
        self.outstanding_locks -= 1;
    }

    pub fn at_completion_counter(&self) -> usize {
        self.at_completion_counter
    }

    /// Expect `n` more completion notices, net of those that already arrived.
    pub(crate) fn expect_completions(&mut self, n: usize) {
        let banked = n.min(self.early_completions);
        self.early_completions -= banked;
        self.at_completion_counter += n - banked;
    }

    /// Account for one DECR_AT_COUNTER notification. Return true when the counter hits zero.
    ///
    /// A notice that nothing expects yet is banked for the next
    /// [`Window::expect_completions`].
    pub(crate) fn decrement_completion(&mut self) -> bool {
        if self.at_completion_counter == 0 {
            self.early_completions += 1;
            return false;
        }
        self.at_completion_counter -= 1;
        self.at_completion_counter == 0
    }
}
