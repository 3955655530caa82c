//! Origin side: access epochs, operation issue and acknowledgment handling.

use tracing::{debug, trace, warn};

use super::{window_mut, RecvSink, Response, RmaProcess};
use crate::config::RmaConfig;
use crate::error::{Result, RmaError};
use crate::lockqueue::Admission;
use crate::op::{PendingOp, RmaCall, RmaRequest, SubRequest};
use crate::packet::{
    LockAckStatus, LockMode, OpHeader, Packet, PacketFlags, RequestHandle, SyncBits, WinHandle,
};
use crate::target::{LockAssert, SyncFlag, TargetAccessState, TargetSync};
use crate::transport::Transport;
use crate::utils::timing::{self, TimeItem};
use crate::utils::units_of;
use crate::window::WinAccessState;
use crate::Rank;

/// Elements per streaming unit of `op`, or all of them if it is not streamed.
fn unit_elems(op: &PendingOp, config: &RmaConfig) -> usize {
    let size = op.origin_type.size();
    if op.kind.is_streamed() {
        (config.stream_buf_size / size).max(1)
    } else {
        op.data.len() / size
    }
}

fn stream_units(op: &PendingOp, config: &RmaConfig) -> usize {
    if op.kind.is_streamed() {
        units_of(op.data.len() / op.origin_type.size(), unit_elems(op, config))
    } else {
        1
    }
}

/// `op` may ride on the lock request itself.
fn can_piggyback(op: &PendingOp, config: &RmaConfig) -> bool {
    op.data.len() <= config.piggyback_lock_data_size && stream_units(op, config) == 1
}

/// Send `op` as one packet per streaming unit.
///
/// `sync` goes on the packets that need it: the lock request on the first, flush and
/// unlock on the last.
fn issue_op<T: Transport>(
    transport: &mut T,
    config: &RmaConfig,
    dest: Rank,
    target_win: WinHandle,
    source_win: WinHandle,
    op: &mut PendingOp,
    sync: SyncBits,
) -> Result<()> {
    let size = op.origin_type.size();
    let per_unit = unit_elems(op, config);
    let units = stream_units(op, config);
    op.stream_elems = per_unit;
    op.reqs.clear();

    for unit in 0..units {
        let last = unit + 1 == units;
        let (lo, hi) = if units == 1 {
            (0, op.data.len())
        } else {
            let lo = unit * per_unit * size;
            (lo, (lo + per_unit * size).min(op.data.len()))
        };
        let bits = SyncBits {
            lock: if unit == 0 { sync.lock } else { None },
            flush: last && sync.flush,
            unlock: last && sync.unlock,
            decr_at_counter: last && op.notify_target,
            stream: units > 1,
        };
        let flags = PacketFlags::from(bits);
        op.flags = op.flags.union(flags);
        if op.kind.has_response() {
            op.reqs.push(SubRequest { unit: unit as u32 });
        }
        let hdr = OpHeader {
            kind: op.kind,
            target_win,
            source_win,
            request_handle: op.id,
            target: op.target.clone(),
            origin_type: op.origin_type,
            op: op.op,
            flags,
            stream_offset: if op.kind.is_streamed() { lo } else { 0 },
            unit: unit as u32,
            data_len: hi - lo,
        };
        transport.send(dest, Packet::Op(hdr), &op.data[lo..hi])?;
    }
    op.issued_stream_count = units;
    trace!("issued {} to rank {} in {} unit(s)", op.kind, dest, units);
    Ok(())
}

/// What is left to send once the operation list of a granted target is drained.
enum SyncMessage {
    Flush,
    Unlock,
}

impl<T: Transport> RmaProcess<T> {
    /// Open a per-target epoch on `rank`. The lock request is deferred until an operation
    /// or a synchronization call needs it.
    pub fn lock(
        &mut self,
        win: WinHandle,
        rank: Rank,
        mode: LockMode,
        assert: LockAssert,
    ) -> Result<()> {
        self.check_rank(rank)?;
        let w = self.win(win)?;
        if w.access_state().is_lock_all() || w.targets.contains_key(&rank) {
            return Err(RmaError::EpochInProgress(rank));
        }
        let mut target = TargetSync::new(rank, mode, assert);
        if assert == LockAssert::NoCheck {
            target.transition(TargetAccessState::LockGranted);
        }
        w.targets.insert(rank, target);
        w.access_state = WinAccessState::PerTarget;
        debug!("lock({}) on rank {} of window {:#x}", mode, rank, win.0);
        Ok(())
    }

    /// Send the lock request of `rank` now, even without operations to carry it.
    pub fn request_lock(&mut self, win: WinHandle, rank: Rank) -> Result<()> {
        self.ensure_target(win, rank)?.force_lock = true;
        self.make_progress_target(win, rank)
    }

    pub fn test_lock_granted(&self, win: WinHandle, rank: Rank) -> Result<bool> {
        let w = self.window(win)?;
        if w.access_state() == WinAccessState::LockAllGranted {
            return Ok(true);
        }
        let target = w.target(rank).ok_or(RmaError::NoEpoch(rank))?;
        Ok(target.access_state() == TargetAccessState::LockGranted)
    }

    /// Block until the lock on `rank` is held.
    pub fn wait_lock_granted(&mut self, win: WinHandle, rank: Rank) -> Result<()> {
        self.request_lock(win, rank)?;
        timing::timed(TimeItem::WaitLockGranted, || {
            self.progress_until(|p| p.test_lock_granted(win, rank))
        })
    }

    /// Queue an RMA call on `rank`.
    pub fn rma(&mut self, win: WinHandle, rank: Rank, call: RmaCall) -> Result<()> {
        self.submit(win, rank, call, None, false)
    }

    /// Queue an RMA call on `rank` and return a handle that completes with it locally.
    pub fn rma_request(
        &mut self,
        win: WinHandle,
        rank: Rank,
        call: RmaCall,
    ) -> Result<RmaRequest> {
        let ureq = RmaRequest::new();
        self.submit(win, rank, call, Some(ureq.clone()), false)?;
        Ok(ureq)
    }

    /// Queue an RMA call whose application also counts as a completion notice at `rank`.
    pub fn rma_notify(&mut self, win: WinHandle, rank: Rank, call: RmaCall) -> Result<()> {
        self.submit(win, rank, call, None, true)
    }

    fn submit(
        &mut self,
        win: WinHandle,
        rank: Rank,
        call: RmaCall,
        ureq: Option<RmaRequest>,
        notify: bool,
    ) -> Result<()> {
        self.check_rank(rank)?;
        let id = self.next_request();
        let mut op = PendingOp::from_call(id, call)?;
        op.ureq = ureq;
        op.notify_target = notify;
        let target = self.ensure_target(win, rank)?;
        target.pending.push_back(op);
        // Wait for a sync call before asking for the lock, so it can carry the unlock too.
        if target.access_state() == TargetAccessState::LockCalled && !target.lock_counted {
            return Ok(());
        }
        self.make_progress_target(win, rank)
    }

    /// Tell `rank` one more of its expected completions happened.
    ///
    /// Ordered only after operations already issued to `rank`; [`RmaProcess::rma_notify`]
    /// orders the notice after its own operation.
    pub fn send_completion_notice(&mut self, win: WinHandle, rank: Rank) -> Result<()> {
        self.check_rank(rank)?;
        self.send_decr_at_cnt_msg(rank, win)
    }

    /// Target state of `rank`, created as the window epoch dictates.
    fn ensure_target(&mut self, win: WinHandle, rank: Rank) -> Result<&mut TargetSync> {
        let w = self.win(win)?;
        let state = w.access_state();
        let assert = w.lock_all_assert;
        if !w.targets.contains_key(&rank) {
            let initial = match state {
                WinAccessState::None | WinAccessState::PerTarget => {
                    return Err(RmaError::NoEpoch(rank))
                }
                WinAccessState::LockAllCalled => None,
                WinAccessState::LockAllIssued => Some(TargetAccessState::LockIssued),
                WinAccessState::LockAllGranted => Some(TargetAccessState::LockGranted),
            };
            let mut target = TargetSync::new(rank, LockMode::Shared, assert);
            if let Some(to) = initial {
                target.transition(to);
            }
            w.targets.insert(rank, target);
        }
        w.target_mut(rank)
    }

    /// Move the epoch of `rank` forward as far as it can go without waiting.
    pub(crate) fn make_progress_target(&mut self, win: WinHandle, rank: Rank) -> Result<()> {
        let state = {
            let w = self.win(win)?;
            let Some(target) = w.targets.get(&rank) else {
                return Ok(());
            };
            if target.access_state() == TargetAccessState::LockCalled && !target.needs_lock() {
                return Ok(());
            }
            target.access_state()
        };
        match state {
            TargetAccessState::LockCalled => {
                self.issue_lock_request(win, rank)?;
                // Only a local request can be granted on the spot.
                let granted = self
                    .win(win)?
                    .targets
                    .get(&rank)
                    .is_some_and(|t| t.access_state() == TargetAccessState::LockGranted);
                if granted {
                    self.issue_granted(win, rank)?;
                }
                Ok(())
            }
            TargetAccessState::LockIssued => Ok(()),
            TargetAccessState::LockGranted => self.issue_granted(win, rank),
        }
    }

    pub(crate) fn make_progress_win(&mut self, win: WinHandle) -> Result<()> {
        let ranks: Vec<Rank> = self.win(win)?.targets.keys().copied().collect();
        for rank in ranks {
            self.make_progress_target(win, rank)?;
        }
        Ok(())
    }

    fn issue_lock_request(&mut self, win: WinHandle, rank: Rank) -> Result<()> {
        let me = self.rank();
        let (mode, first) = {
            let target = self.win(win)?.target_mut(rank)?;
            let first = !target.lock_counted;
            target.lock_counted = true;
            target.transition(TargetAccessState::LockIssued);
            (target.mode, first)
        };
        if first {
            self.win(win)?.lock_requested();
        }
        if rank == me {
            return self.acquire_local_lock(win, mode);
        }

        let piggybacked = {
            let Self {
                windows,
                transport,
                config,
                ..
            } = self;
            let config: &RmaConfig = config;
            let w = window_mut(windows, win)?;
            let target_win = w.peer_handle(rank)?;
            let target = w.target_mut(rank)?;
            let head_fits = target.next_op_to_issue == 0
                && target.pending.front().is_some_and(|op| can_piggyback(op, config));
            if head_fits {
                let is_write = target.pending.front().is_some_and(|op| op.kind.is_write());
                target.put_acc_issued |= is_write;
                let mut sync = if target.pending.len() == 1 {
                    target.take_sync()
                } else {
                    SyncBits::default()
                };
                sync.lock = Some(mode);
                if let Some(op) = target.pending.front_mut() {
                    issue_op(transport, config, rank, target_win, win, op, sync)?;
                    target.next_op_to_issue = 1;
                }
            }
            head_fits
        };
        if !piggybacked {
            self.send_lock_msg(rank, win, mode)?;
        }
        Ok(())
    }

    /// Take the lock of our own window, or queue for it.
    fn acquire_local_lock(&mut self, win: WinHandle, mode: LockMode) -> Result<()> {
        let me = self.rank();
        let w = self.win(win)?;
        if w.try_acquire_lock(mode) {
            return self.handle_lock_ack(win, me, LockAckStatus::Granted);
        }
        let pkt = Packet::Lock {
            target_win: win,
            source_win: win,
            request_handle: RequestHandle::NULL,
            flags: SyncBits {
                lock: Some(mode),
                ..Default::default()
            }
            .into(),
        };
        if w.lock_queue.admit(pkt.clone(), pkt, me) == Admission::Discarded {
            warn!("own lock request on window {:#x} discarded; retrying", win.0);
            w.local_retry = Some(mode);
        }
        Ok(())
    }

    /// Retry own lock requests that found the local queue full.
    pub(crate) fn retry_local_locks(&mut self) -> Result<()> {
        let retries: Vec<(WinHandle, LockMode)> = self
            .windows
            .iter_mut()
            .filter_map(|(h, w)| w.local_retry.take().map(|mode| (*h, mode)))
            .collect();
        for (win, mode) in retries {
            self.acquire_local_lock(win, mode)?;
        }
        Ok(())
    }

    /// Issue every pending operation of a granted target, then its sync message.
    fn issue_granted(&mut self, win: WinHandle, rank: Rank) -> Result<()> {
        let message = {
            let Self {
                windows,
                transport,
                config,
                ..
            } = self;
            let config: &RmaConfig = config;
            let w = window_mut(windows, win)?;
            let target_win = w.peer_handle(rank)?;
            let target = w.target_mut(rank)?;

            while target.next_op_to_issue < target.pending.len() {
                let idx = target.next_op_to_issue;
                let Some(mut op) = target.pending.remove(idx) else {
                    break;
                };
                target.put_acc_issued |= op.kind.is_write();
                let sync = if idx == target.pending.len() {
                    target.take_sync()
                } else {
                    SyncBits::default()
                };
                issue_op(transport, config, rank, target_win, win, &mut op, sync)?;
                target.retire_issued(op);
            }

            let sync = match target.sync_flag {
                SyncFlag::Unlock if target.assert == LockAssert::NoCheck => SyncFlag::Flush,
                other => other,
            };
            match sync {
                SyncFlag::None => None,
                SyncFlag::Flush if !target.put_acc_issued => {
                    target.sync_flag = SyncFlag::None;
                    None
                }
                SyncFlag::Flush => {
                    target.take_sync();
                    Some(SyncMessage::Flush)
                }
                SyncFlag::Unlock => {
                    target.take_sync();
                    Some(SyncMessage::Unlock)
                }
            }
        };
        match message {
            Some(SyncMessage::Flush) => self.send_flush_msg(rank, win),
            Some(SyncMessage::Unlock) => self.send_unlock_msg(rank, win),
            None => Ok(()),
        }
    }

    /// Apply the outcome of a lock request to the epoch state.
    pub(crate) fn handle_lock_ack(
        &mut self,
        win: WinHandle,
        rank: Rank,
        status: LockAckStatus,
    ) -> Result<()> {
        let w = self.win(win)?;
        if w.access_state() == WinAccessState::LockAllIssued {
            match status {
                LockAckStatus::Granted => {
                    w.grant();
                    if w.outstanding_locks() == 0 {
                        debug!("lock_all granted on window {:#x}", win.0);
                        w.access_state = WinAccessState::LockAllGranted;
                        for target in w.targets.values_mut() {
                            if target.access_state() == TargetAccessState::LockIssued {
                                target.transition(TargetAccessState::LockGranted);
                            }
                        }
                    }
                }
                LockAckStatus::Discarded => {
                    warn!("lock_all request to rank {} discarded; retrying", rank);
                    if rank == self.rank() {
                        self.acquire_local_lock(win, LockMode::Shared)?;
                    } else {
                        self.send_lock_msg(rank, win, LockMode::Shared)?;
                    }
                }
                _ => {}
            }
            return Ok(());
        }

        let target = w.targets.get_mut(&rank).ok_or_else(|| {
            RmaError::Protocol(format!("lock acknowledgment from rank {rank} without an epoch"))
        })?;
        match status {
            LockAckStatus::Granted => {
                if target.access_state() == TargetAccessState::LockIssued {
                    target.transition(TargetAccessState::LockGranted);
                    let counted = std::mem::take(&mut target.lock_counted);
                    if counted {
                        w.grant();
                    }
                }
            }
            LockAckStatus::Discarded => {
                debug!("lock request to rank {} discarded; will retry", rank);
                target.transition(TargetAccessState::LockCalled);
            }
            LockAckStatus::QueuedDataQueued | LockAckStatus::QueuedDataDiscarded => {}
        }
        Ok(())
    }

    /// Settle the head operation that carried the lock request, given the target's answer.
    fn adjust_op_piggybacked_with_lock(
        &mut self,
        win: WinHandle,
        rank: Rank,
        status: LockAckStatus,
    ) -> Result<()> {
        let w = self.win(win)?;
        let Some(target) = w.targets.get_mut(&rank) else {
            return Ok(());
        };
        let carried_lock = target.next_op_to_issue > 0
            && target
                .pending
                .front()
                .is_some_and(|op| op.flags.lock_mode().is_some());
        if !carried_lock {
            return Ok(());
        }
        match status {
            LockAckStatus::Granted | LockAckStatus::QueuedDataQueued => {
                if let Some(op) = target.pending.pop_front() {
                    target.next_op_to_issue -= 1;
                    target.retire_issued(op);
                }
            }
            LockAckStatus::Discarded | LockAckStatus::QueuedDataDiscarded => {
                trace!("re-queueing operation piggybacked on a {} lock", status);
                target.rewind_head();
            }
        }
        Ok(())
    }

    fn handle_flush_ack(&mut self, win: WinHandle, rank: Rank) -> Result<()> {
        let target = self.win(win)?.targets.get_mut(&rank).ok_or_else(|| {
            RmaError::Protocol(format!("flush acknowledgment from rank {rank} without an epoch"))
        })?;
        target.ack_received();
        Ok(())
    }

    pub(super) fn handle_lock_ack_pkt(
        &mut self,
        win: WinHandle,
        rank: Rank,
        flags: PacketFlags,
    ) -> Result<()> {
        let status = flags
            .ack()
            .status
            .ok_or_else(|| RmaError::Protocol("LOCK_ACK without a status".into()))?;
        let lock_all = self.win(win)?.access_state() == WinAccessState::LockAllIssued;
        self.handle_lock_ack(win, rank, status)?;
        if lock_all {
            self.make_progress_win(win)
        } else {
            self.adjust_op_piggybacked_with_lock(win, rank, status)?;
            self.make_progress_target(win, rank)
        }
    }

    pub(super) fn handle_lock_op_ack_pkt(
        &mut self,
        win: WinHandle,
        rank: Rank,
        flags: PacketFlags,
    ) -> Result<()> {
        let ack = flags.ack();
        let status = ack
            .status
            .ok_or_else(|| RmaError::Protocol("LOCK_OP_ACK without a status".into()))?;
        self.handle_lock_ack(win, rank, status)?;
        if ack.flush_ack {
            self.handle_flush_ack(win, rank)?;
        }
        self.adjust_op_piggybacked_with_lock(win, rank, status)?;
        self.make_progress_target(win, rank)
    }

    pub(super) fn handle_flush_ack_pkt(&mut self, win: WinHandle, rank: Rank) -> Result<()> {
        self.handle_flush_ack(win, rank)?;
        self.make_progress_target(win, rank)
    }

    pub(super) fn handle_get_resp(
        &mut self,
        source: Rank,
        resp: Response,
        expected: usize,
        data: &[u8],
    ) -> Result<(usize, bool)> {
        if data.len() >= expected {
            self.complete_response(resp, &data[..expected])?;
            return Ok((expected, true));
        }
        let sink = RecvSink::Response {
            resp,
            buf: data.to_vec(),
        };
        Ok(self.defer_payload(source, data.len(), expected, sink))
    }

    /// Store response data of one unit and apply the piggybacked acknowledgments.
    pub(super) fn complete_response(&mut self, resp: Response, data: &[u8]) -> Result<()> {
        let Response {
            win,
            rank,
            request,
            unit,
            flags,
        } = resp;
        {
            let target = self.win(win)?.target_mut(rank)?;
            let op = target.find_op_mut(request).ok_or_else(|| {
                RmaError::Protocol(format!("response for unknown request {}", request.0))
            })?;
            let first = unit as usize * op.stream_elems * op.origin_type.size();
            if let Some(result) = &op.result {
                if let Err(e) = result.store(first, data) {
                    if let Some(ureq) = &op.ureq {
                        ureq.fail(&e);
                    }
                    return Err(e);
                }
            }
            if !op.complete_unit(unit) {
                return Err(RmaError::Protocol(format!(
                    "duplicate response for unit {unit} of request {}",
                    request.0
                )));
            }
            if let Some(done) = target.remove_completed(request) {
                done.set_user_req_after_issue();
            }
        }

        let ack = flags.ack();
        if let Some(status) = ack.status {
            self.handle_lock_ack(win, rank, status)?;
        }
        if ack.flush_ack {
            self.handle_flush_ack(win, rank)?;
        }
        if let Some(status) = ack.status {
            self.adjust_op_piggybacked_with_lock(win, rank, status)?;
        }
        self.make_progress_target(win, rank)
    }

    /// Ask for the completion of everything issued to `rank` so far.
    pub fn flush_start(&mut self, win: WinHandle, rank: Rank) -> Result<()> {
        let target = self.win(win)?.target_mut(rank)?;
        if target.never_requested() {
            return Ok(());
        }
        if target.sync_flag == SyncFlag::None {
            target.sync_flag = SyncFlag::Flush;
        }
        self.make_progress_target(win, rank)
    }

    /// Everything issued to `rank` before the flush is complete at the target.
    pub fn test_flush(&self, win: WinHandle, rank: Rank) -> Result<bool> {
        let target = self
            .window(win)?
            .target(rank)
            .ok_or(RmaError::NoEpoch(rank))?;
        Ok(target.is_quiet() && target.access_state() != TargetAccessState::LockIssued)
    }

    pub fn flush(&mut self, win: WinHandle, rank: Rank) -> Result<()> {
        self.flush_start(win, rank)?;
        timing::timed(TimeItem::WaitFlush, || {
            self.progress_until(|p| p.test_flush(win, rank))
        })
    }

    pub fn flush_all(&mut self, win: WinHandle) -> Result<()> {
        let ranks: Vec<Rank> = self.win(win)?.targets.keys().copied().collect();
        for &rank in &ranks {
            self.flush_start(win, rank)?;
        }
        timing::timed(TimeItem::WaitFlush, || {
            self.progress_until(|p| {
                for &rank in &ranks {
                    if !p.test_flush(win, rank)? {
                        return Ok(false);
                    }
                }
                Ok(true)
            })
        })
    }

    /// Operations to `rank` have been issued and their results, if any, delivered.
    pub fn test_flush_local(&self, win: WinHandle, rank: Rank) -> Result<bool> {
        let target = self
            .window(win)?
            .target(rank)
            .ok_or(RmaError::NoEpoch(rank))?;
        Ok(target.pending.is_empty() && target.issued_lists_empty())
    }

    pub fn flush_local(&mut self, win: WinHandle, rank: Rank) -> Result<()> {
        self.make_progress_target(win, rank)?;
        timing::timed(TimeItem::WaitFlushLocal, || {
            self.progress_until(|p| p.test_flush_local(win, rank))
        })
    }

    pub fn flush_local_all(&mut self, win: WinHandle) -> Result<()> {
        self.make_progress_win(win)?;
        let ranks: Vec<Rank> = self.win(win)?.targets.keys().copied().collect();
        timing::timed(TimeItem::WaitFlushLocal, || {
            self.progress_until(|p| {
                for &rank in &ranks {
                    if !p.test_flush_local(win, rank)? {
                        return Ok(false);
                    }
                }
                Ok(true)
            })
        })
    }

    /// Ask for the end of the epoch on `rank`.
    pub fn unlock_start(&mut self, win: WinHandle, rank: Rank) -> Result<()> {
        let target = self.win(win)?.target_mut(rank)?;
        if target.never_requested() {
            target.sync_flag = SyncFlag::None;
            return Ok(());
        }
        target.sync_flag = SyncFlag::Unlock;
        self.make_progress_target(win, rank)
    }

    /// The epoch on `rank` is over once every operation completed and the lock was
    /// released. Closes the epoch when it returns true.
    pub fn test_unlock(&mut self, win: WinHandle, rank: Rank) -> Result<bool> {
        let w = self.win(win)?;
        let done = {
            let target = w.target_mut(rank)?;
            target.is_quiet() && target.access_state() != TargetAccessState::LockIssued
        };
        if done {
            w.targets.remove(&rank);
            if w.access_state() == WinAccessState::PerTarget && w.targets.is_empty() {
                w.access_state = WinAccessState::None;
            }
            debug!("unlocked rank {} of window {:#x}", rank, win.0);
        }
        Ok(done)
    }

    pub fn unlock(&mut self, win: WinHandle, rank: Rank) -> Result<()> {
        if self.win(win)?.access_state() != WinAccessState::PerTarget {
            return Err(RmaError::NoEpoch(rank));
        }
        self.unlock_start(win, rank)?;
        timing::timed(TimeItem::WaitUnlock, || {
            self.progress_until(|p| p.test_unlock(win, rank))
        })
    }

    /// Open a shared epoch on every rank.
    pub fn lock_all(&mut self, win: WinHandle, assert: LockAssert) -> Result<()> {
        let me = self.rank();
        let size = self.size();
        let eager = self.config.lock_all_eager;
        let same_node: Vec<Rank> = (0..size)
            .filter(|&r| self.transport.node_of(r) == self.transport.node_of(me))
            .collect();

        let w = self.win(win)?;
        if w.access_state() != WinAccessState::None {
            return Err(RmaError::EpochInProgress(me));
        }
        w.lock_all_assert = assert;
        if assert == LockAssert::NoCheck {
            w.access_state = WinAccessState::LockAllGranted;
            return Ok(());
        }

        if eager {
            w.access_state = WinAccessState::LockAllIssued;
            for _ in 0..size {
                w.lock_requested();
            }
            debug!("lock_all on window {:#x}: requesting {} locks", win.0, size);
            for rank in 0..size {
                if rank == me {
                    self.acquire_local_lock(win, LockMode::Shared)?;
                } else {
                    self.send_lock_msg(rank, win, LockMode::Shared)?;
                }
            }
            return Ok(());
        }

        w.access_state = WinAccessState::LockAllCalled;
        if w.is_shm_allocated() {
            for rank in same_node {
                self.request_lock(win, rank)?;
            }
        }
        Ok(())
    }

    pub fn unlock_all(&mut self, win: WinHandle) -> Result<()> {
        let me = self.rank();
        let (state, assert) = {
            let w = self.win(win)?;
            (w.access_state(), w.lock_all_assert)
        };
        if !state.is_lock_all() {
            return Err(RmaError::NoEpoch(me));
        }
        if state == WinAccessState::LockAllIssued {
            timing::timed(TimeItem::WaitUnlockAll, || {
                self.progress_until(|p| {
                    Ok(p.window(win)?.access_state() == WinAccessState::LockAllGranted)
                })
            })?;
        }
        // Every rank holds a lock from an eager request.
        if state != WinAccessState::LockAllCalled && assert == LockAssert::None {
            for rank in 0..self.size() {
                self.ensure_target(win, rank)?;
            }
        }

        let ranks: Vec<Rank> = self.win(win)?.targets.keys().copied().collect();
        for &rank in &ranks {
            self.unlock_start(win, rank)?;
        }
        timing::timed(TimeItem::WaitUnlockAll, || {
            self.progress_until(|p| {
                for &rank in &ranks {
                    let w = p.window(win)?;
                    if w.target(rank).is_some() && !p.test_unlock(win, rank)? {
                        return Ok(false);
                    }
                }
                Ok(true)
            })
        })?;

        let w = self.win(win)?;
        w.access_state = WinAccessState::None;
        w.lock_all_assert = LockAssert::None;
        debug!("unlock_all on window {:#x}", win.0);
        Ok(())
    }
}
