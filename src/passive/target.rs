//! Target side: lock grants, the lock queue and operation application.

use tracing::{debug, warn};

use super::{RecvSink, RmaProcess};
use crate::accumulate::do_accumulate_op;
use crate::datatype::Datatype;
use crate::error::{Result, RmaError};
use crate::lockqueue::{Admission, LockEntry, LockEntryPayload};
use crate::op::OpKind;
use crate::packet::{
    AckBits, LockAckStatus, OpHeader, Packet, PacketFlags, RequestHandle, WinHandle,
};
use crate::transport::Transport;
use crate::Rank;

impl<T: Transport> RmaProcess<T> {
    pub(super) fn handle_lock(
        &mut self,
        source: Rank,
        target_win: WinHandle,
        source_win: WinHandle,
        request_handle: RequestHandle,
        flags: PacketFlags,
    ) -> Result<()> {
        let mode = flags
            .lock_mode()
            .ok_or_else(|| RmaError::Protocol("LOCK packet without a lock mode".into()))?;
        if self.win(target_win)?.try_acquire_lock(mode) {
            let granted = LockAckStatus::Granted;
            return self.send_lock_ack_pkt(source, source_win, request_handle, granted);
        }
        let pkt = Packet::Lock {
            target_win,
            source_win,
            request_handle,
            flags,
        };
        self.enqueue_lock_origin(source, pkt, &[])?;
        Ok(())
    }

    /// Handle an RMA operation header with the first bytes of its payload.
    pub(super) fn handle_op(
        &mut self,
        source: Rank,
        hdr: OpHeader,
        data: &[u8],
    ) -> Result<(usize, bool)> {
        if let Some(mode) = hdr.flags.lock_mode() {
            if !self.win(hdr.target_win)?.try_acquire_lock(mode) {
                return self.enqueue_lock_origin(source, Packet::Op(hdr), data);
            }
        }

        let expected = hdr.data_len;
        if data.len() >= expected {
            self.perform_op(source, &hdr, &data[..expected])?;
            return Ok((expected, true));
        }
        let consumed = data.len();
        let sink = RecvSink::Apply {
            hdr,
            buf: data.to_vec(),
        };
        Ok(self.defer_payload(source, consumed, expected, sink))
    }

    /// Queue a lock request that cannot be granted now and tell the origin what was kept.
    fn enqueue_lock_origin(
        &mut self,
        source: Rank,
        pkt: Packet,
        data: &[u8],
    ) -> Result<(usize, bool)> {
        let (target_win, source_win, request_handle, flags) = match &pkt {
            Packet::Op(hdr) => (hdr.target_win, hdr.source_win, hdr.request_handle, hdr.flags),
            Packet::Lock {
                target_win,
                source_win,
                request_handle,
                flags,
            } => (*target_win, *source_win, *request_handle, *flags),
            other => {
                return Err(RmaError::Protocol(format!(
                    "{} cannot wait for a lock",
                    other.name()
                )))
            }
        };
        let is_op = matches!(pkt, Packet::Op(_));
        let expected = pkt.data_len();
        // A degraded entry keeps the request flags as they came.
        let bare = Packet::Lock {
            target_win,
            source_win,
            request_handle,
            flags,
        };

        let win = self.win(target_win)?;
        let admission = win.lock_queue.admit(pkt, bare, source);
        let take = data.len().min(expected);
        let consumed = match admission.entry() {
            Some(entry) if expected > 0 => {
                let (n, _) = win.lock_queue.receive(entry, &data[..take]).ok_or_else(|| {
                    RmaError::Protocol("lock entry vanished on admission".into())
                })?;
                n
            }
            _ => take,
        };

        let status = match admission {
            Admission::Discarded => {
                warn!(
                    "lock queue of window {:#x} is full; discarding request of rank {}",
                    target_win.0, source
                );
                LockAckStatus::Discarded
            }
            Admission::Bare(_) => {
                warn!(
                    "lock data budget exhausted; queueing bare request of rank {}",
                    source
                );
                LockAckStatus::QueuedDataDiscarded
            }
            Admission::Buffered(_) => {
                debug!(
                    "queued lock request of rank {} on window {:#x}",
                    source, target_win.0
                );
                LockAckStatus::QueuedDataQueued
            }
        };
        if is_op {
            let ack = AckBits {
                status: Some(status),
                flush_ack: false,
            };
            self.send_lock_op_ack_pkt(source, source_win, request_handle, ack.into())?;
        } else {
            self.send_lock_ack_pkt(source, source_win, request_handle, status)?;
        }

        let sink = match admission.entry() {
            Some(entry) => RecvSink::Queued {
                win: target_win,
                entry,
            },
            None => RecvSink::Discard,
        };
        Ok(self.defer_payload(source, consumed, expected, sink))
    }

    /// Apply a fully received operation to the local window and finish it.
    pub(super) fn perform_op(&mut self, source: Rank, hdr: &OpHeader, data: &[u8]) -> Result<()> {
        let me = self.rank();
        let response = {
            let win = self.win(hdr.target_win)?;
            let mem = hdr.target.slice_of_mut(win.local_mut())?;
            apply_op(hdr, data, mem)?
        };

        if let Some(resp) = response {
            let sync = hdr.flags.sync();
            let ack = AckBits {
                status: sync.lock.map(|_| LockAckStatus::Granted),
                flush_ack: sync.flush || sync.unlock,
            };
            let pkt = Packet::GetResp {
                source_win: hdr.source_win,
                request_handle: hdr.request_handle,
                unit: hdr.unit,
                target_rank: me,
                flags: ack.into(),
                data_len: resp.len(),
            };
            self.transport.send(source, pkt, &resp)?;
        }
        self.finish_op_on_target(source, hdr)
    }

    /// Carry out the sync bits of an applied operation.
    ///
    /// The unlock takes effect before any acknowledgment leaves. Operations with a
    /// response already reported the lock and flush outcome in their GET_RESP.
    fn finish_op_on_target(&mut self, source: Rank, hdr: &OpHeader) -> Result<()> {
        let sync = hdr.flags.sync();
        if sync.unlock {
            self.release_lock(hdr.target_win)?;
        }
        if !hdr.kind.has_response() {
            if sync.lock.is_some() {
                let ack = AckBits {
                    status: Some(LockAckStatus::Granted),
                    flush_ack: sync.flush || sync.unlock,
                };
                let flags = ack.into();
                self.send_lock_op_ack_pkt(source, hdr.source_win, hdr.request_handle, flags)?;
            } else if sync.flush || sync.unlock {
                self.send_flush_ack_pkt(source, hdr.source_win)?;
            }
        }
        if sync.decr_at_counter {
            self.handle_decr_at_counter(hdr.target_win)?;
        }
        Ok(())
    }

    pub(crate) fn release_lock(&mut self, win: WinHandle) -> Result<()> {
        self.win(win)?.lock_state.release()?;
        self.process_lock_queue(win)
    }

    /// Grant queued requests in arrival order while the head fits the lock state.
    pub(super) fn process_lock_queue(&mut self, win: WinHandle) -> Result<()> {
        {
            let w = self.win(win)?;
            if w.servicing {
                return Ok(());
            }
            w.servicing = true;
        }
        let result = self.service_lock_queue(win);
        if let Ok(w) = self.win(win) {
            w.servicing = false;
        }
        result
    }

    fn service_lock_queue(&mut self, win: WinHandle) -> Result<()> {
        loop {
            let w = self.win(win)?;
            let Some(head) = w.lock_queue.front() else {
                return Ok(());
            };
            if !head.all_data_received {
                return Ok(());
            }
            let mode = head
                .mode()
                .ok_or_else(|| RmaError::Protocol("queued entry without a lock mode".into()))?;
            if !w.lock_state.acquire(mode) {
                return Ok(());
            }
            let Some(entry) = w.lock_queue.pop_front() else {
                return Ok(());
            };
            debug!(
                "granting queued {} lock of rank {} on window {:#x}",
                mode, entry.source, win.0
            );
            self.perform_op_in_lock_queue(entry)?;
        }
    }

    fn perform_op_in_lock_queue(&mut self, entry: LockEntry) -> Result<()> {
        let me = self.rank();
        match entry.pkt {
            // Own request: granted without a round trip.
            Packet::Lock { source_win, .. } if entry.source == me => {
                self.handle_lock_ack(source_win, me, LockAckStatus::Granted)?;
                self.make_progress_win(source_win)
            }
            Packet::Lock {
                source_win,
                request_handle,
                ..
            } => self.send_lock_ack_pkt(
                entry.source,
                source_win,
                request_handle,
                LockAckStatus::Granted,
            ),
            Packet::Op(hdr) => {
                let LockEntryPayload::Buffered(data) = entry.payload else {
                    return Err(RmaError::Protocol("queued operation without its data".into()));
                };
                self.perform_op(entry.source, &hdr, &data)
            }
            other => Err(RmaError::Protocol(format!("{} in the lock queue", other.name()))),
        }
    }

    pub(super) fn handle_unlock(
        &mut self,
        source: Rank,
        target_win: WinHandle,
        source_win: WinHandle,
    ) -> Result<()> {
        self.release_lock(target_win)?;
        self.send_flush_ack_pkt(source, source_win)
    }

    /// Every earlier operation from `source` was applied on arrival, so answer at once.
    pub(super) fn handle_flush(
        &mut self,
        source: Rank,
        target_win: WinHandle,
        source_win: WinHandle,
    ) -> Result<()> {
        self.win(target_win)?;
        self.send_flush_ack_pkt(source, source_win)
    }

    pub(super) fn handle_decr_at_counter(&mut self, target_win: WinHandle) -> Result<()> {
        if self.win(target_win)?.decrement_completion() {
            debug!("all completion notices arrived on window {:#x}", target_win.0);
        }
        Ok(())
    }
}

/// Apply `hdr` to the target region `mem` and return the response payload, if any.
fn apply_op(hdr: &OpHeader, data: &[u8], mem: &mut [u8]) -> Result<Option<Vec<u8>>> {
    let target = &hdr.target;
    let size = hdr.origin_type.size();
    let elems = data.len() / size;
    match hdr.kind {
        OpKind::Put => {
            target
                .datatype
                .unpack_range(data, target.count, hdr.stream_offset, mem)?;
            Ok(None)
        }
        OpKind::Accumulate => {
            do_accumulate_op(
                data,
                elems,
                hdr.origin_type,
                mem,
                target.count,
                &target.datatype,
                hdr.stream_offset,
                hdr.op,
            )?;
            Ok(None)
        }
        OpKind::Get => Ok(Some(target.datatype.pack(mem, target.count)?)),
        OpKind::GetAccumulate => {
            let first = hdr.stream_offset;
            let old = target
                .datatype
                .pack_range(mem, target.count, first, first + data.len())?;
            do_accumulate_op(
                data,
                elems,
                hdr.origin_type,
                mem,
                target.count,
                &target.datatype,
                first,
                hdr.op,
            )?;
            Ok(Some(old))
        }
        OpKind::CompareAndSwap => {
            if data.len() != 2 * size || mem.len() < size {
                return Err(RmaError::Protocol("malformed compare-and-swap".into()));
            }
            let (origin, compare) = data.split_at(size);
            let old = mem[..size].to_vec();
            if old == compare {
                mem[..size].copy_from_slice(origin);
            }
            Ok(Some(old))
        }
        OpKind::FetchAndOp => {
            let old = target.datatype.pack(mem, 1)?;
            do_accumulate_op(
                data,
                1,
                hdr.origin_type,
                mem,
                1,
                &Datatype::Predefined(hdr.origin_type),
                0,
                hdr.op,
            )?;
            Ok(Some(old))
        }
    }
}
