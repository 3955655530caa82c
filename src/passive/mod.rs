//! Passive-target synchronization engine of one process.
//!
//! An [`RmaProcess`] plays both roles at once. As an origin it queues RMA calls per
//! (window, target) pair, asks targets for their lock lazily and issues operations once
//! the lock is granted. As a target it grants, queues or discards incoming lock requests
//! and applies incoming operations to its local window memory.
//!
//! Nothing happens in the background: the engine only moves when one of its methods is
//! called, and the blocking calls drive progress themselves through [`RmaProcess::poke`]
//! or [`RmaProcess::wait_progress`].

mod origin;
mod progress;
mod send;
mod target;

#[cfg(test)]
mod tests;

use std::collections::HashMap;

use tracing::{debug, trace};

use crate::config::RmaConfig;
use crate::error::{Result, RmaError};
use crate::lockqueue::EntryId;
use crate::packet::{OpHeader, Packet, PacketFlags, RequestHandle, WinHandle};
use crate::transport::{Delivery, Transport};
use crate::utils::timing::{self, TimeItem};
use crate::window::{LocalLock, WinAccessState, Window};
use crate::Rank;

/// Where the remaining payload of a packet from one source goes.
#[derive(Debug)]
enum RecvSink {
    /// Operation applied once its data is complete.
    Apply { hdr: OpHeader, buf: Vec<u8> },
    /// Data of a queued lock entry.
    Queued { win: WinHandle, entry: EntryId },
    /// Data of a discarded request, dropped on arrival.
    Discard,
    /// Response data for one of our operations.
    Response { resp: Response, buf: Vec<u8> },
}

#[derive(Debug)]
struct PendingRecv {
    remaining: usize,
    sink: RecvSink,
}

/// Routing fields of a GET_RESP packet.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Response {
    win: WinHandle,
    rank: Rank,
    request: RequestHandle,
    unit: u32,
    flags: PacketFlags,
}

pub struct RmaProcess<T: Transport> {
    transport: T,
    config: RmaConfig,
    windows: HashMap<WinHandle, Window>,
    next_win: u32,
    next_req: u64,
    /// Packet payloads still arriving, by source rank.
    recvs: HashMap<Rank, PendingRecv>,
}

fn window_mut(windows: &mut HashMap<WinHandle, Window>, win: WinHandle) -> Result<&mut Window> {
    windows.get_mut(&win).ok_or(RmaError::UnknownWindow(win.0))
}

impl<T: Transport> RmaProcess<T> {
    pub fn new(transport: T, config: RmaConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            transport,
            config,
            windows: HashMap::new(),
            next_win: 1,
            next_req: 1,
            recvs: HashMap::new(),
        })
    }

    pub fn rank(&self) -> Rank {
        self.transport.rank()
    }

    pub fn size(&self) -> usize {
        self.transport.size()
    }

    pub fn config(&self) -> &RmaConfig {
        &self.config
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// Create a window of `size` zeroed bytes.
    ///
    /// Handles are assigned in creation order, so processes that create their windows in
    /// the same order agree on them without an exchange. Otherwise use
    /// [`RmaProcess::set_peer_handles`].
    pub fn win_create(&mut self, size: usize) -> WinHandle {
        self.new_window(size, false)
    }

    /// Like [`RmaProcess::win_create`], for a window shared among the ranks of a node.
    /// Lock-all epochs on such a window request same-node locks up front.
    pub fn win_allocate_shared(&mut self, size: usize) -> WinHandle {
        self.new_window(size, true)
    }

    fn new_window(&mut self, size: usize, shm: bool) -> WinHandle {
        let handle = WinHandle(self.next_win);
        self.next_win += 1;
        let win = Window::new(handle, size, self.size(), shm, &self.config);
        self.windows.insert(handle, win);
        debug!("created window {:#x} of {} bytes", handle.0, size);
        handle
    }

    /// Record the handle every rank uses for `win`.
    pub fn set_peer_handles(&mut self, win: WinHandle, handles: Vec<WinHandle>) -> Result<()> {
        self.win(win)?.set_peer_handles(handles)
    }

    pub fn window(&self, win: WinHandle) -> Result<&Window> {
        self.windows.get(&win).ok_or(RmaError::UnknownWindow(win.0))
    }

    /// Local access to a window, e.g. to initialize its memory.
    pub fn window_mut(&mut self, win: WinHandle) -> Result<&mut Window> {
        self.win(win)
    }

    pub(crate) fn win(&mut self, win: WinHandle) -> Result<&mut Window> {
        window_mut(&mut self.windows, win)
    }

    pub(crate) fn check_rank(&self, rank: Rank) -> Result<()> {
        if rank >= self.size() {
            return Err(RmaError::InvalidRank(rank));
        }
        Ok(())
    }

    fn next_request(&mut self) -> RequestHandle {
        let id = RequestHandle(self.next_req);
        self.next_req += 1;
        id
    }

    /// Free `win` once no other process holds or waits for its lock.
    ///
    /// Fails if this process still has an access epoch open on it.
    pub fn win_free(&mut self, win: WinHandle) -> Result<()> {
        let me = self.rank();
        {
            let w = self.win(win)?;
            if w.access_state() != WinAccessState::None || !w.targets.is_empty() {
                return Err(RmaError::EpochInProgress(me));
            }
        }
        timing::timed(TimeItem::WaitWinFree, || {
            self.progress_until(|p| {
                let w = p.win(win)?;
                Ok(w.lock_state() == LocalLock::Unlocked
                    && w.lock_queue().is_empty()
                    && w.at_completion_counter() == 0)
            })
        })?;
        self.windows.remove(&win);
        debug!("freed window {:#x}", win.0);
        Ok(())
    }

    /// Expect `n` more completion notices on `win`.
    pub fn expect_completions(&mut self, win: WinHandle, n: usize) -> Result<()> {
        self.win(win)?.expect_completions(n);
        Ok(())
    }

    /// All expected completion notices on `win` have arrived.
    pub fn test_completions(&self, win: WinHandle) -> Result<bool> {
        Ok(self.window(win)?.at_completion_counter() == 0)
    }

    pub fn wait_completions(&mut self, win: WinHandle) -> Result<()> {
        timing::timed(TimeItem::WaitCompletions, || {
            self.progress_until(|p| p.test_completions(win))
        })
    }

    /// Handle one delivery from the transport.
    pub(crate) fn dispatch(&mut self, delivery: Delivery) -> Result<()> {
        let (consumed, len) = match delivery {
            Delivery::Packet {
                source,
                packet,
                data,
            } => (self.on_packet(source, packet, &data)?.0, data.len()),
            Delivery::Data { source, data } => (self.on_data(source, &data)?.0, data.len()),
        };
        if consumed != len {
            return Err(RmaError::Protocol(format!(
                "{} trailing bytes after a delivery",
                len - consumed
            )));
        }
        Ok(())
    }

    /// Handle a packet header from `source` with the first bytes of its payload.
    ///
    /// Return how many bytes of `data` were consumed and whether the packet's payload is
    /// complete. The rest of an incomplete payload goes through [`RmaProcess::on_data`].
    pub fn on_packet(
        &mut self,
        source: Rank,
        packet: Packet,
        data: &[u8],
    ) -> Result<(usize, bool)> {
        trace!("rank {} <- {}: {:?}", self.rank(), source, packet);
        if self.recvs.contains_key(&source) {
            return Err(RmaError::Protocol(format!(
                "packet from rank {source} while its previous payload is incomplete"
            )));
        }
        match packet {
            Packet::Op(hdr) => self.handle_op(source, hdr, data),
            Packet::GetResp {
                source_win,
                request_handle,
                unit,
                target_rank,
                flags,
                data_len,
            } => {
                let resp = Response {
                    win: source_win,
                    rank: target_rank,
                    request: request_handle,
                    unit,
                    flags,
                };
                self.handle_get_resp(source, resp, data_len, data)
            }
            Packet::Lock {
                target_win,
                source_win,
                request_handle,
                flags,
            } => {
                self.handle_lock(source, target_win, source_win, request_handle, flags)?;
                Ok((0, true))
            }
            Packet::LockAck {
                source_win,
                target_rank,
                flags,
                ..
            } => {
                self.handle_lock_ack_pkt(source_win, target_rank, flags)?;
                Ok((0, true))
            }
            Packet::LockOpAck {
                source_win,
                target_rank,
                flags,
                ..
            } => {
                self.handle_lock_op_ack_pkt(source_win, target_rank, flags)?;
                Ok((0, true))
            }
            Packet::Flush {
                target_win,
                source_win,
            } => {
                self.handle_flush(source, target_win, source_win)?;
                Ok((0, true))
            }
            Packet::FlushAck {
                source_win,
                target_rank,
            } => {
                self.handle_flush_ack_pkt(source_win, target_rank)?;
                Ok((0, true))
            }
            Packet::Unlock {
                target_win,
                source_win,
                ..
            } => {
                self.handle_unlock(source, target_win, source_win)?;
                Ok((0, true))
            }
            Packet::DecrAtCounter { target_win } => {
                self.handle_decr_at_counter(target_win)?;
                Ok((0, true))
            }
        }
    }

    /// Handle more payload of the packet most recently received from `source`.
    pub fn on_data(&mut self, source: Rank, data: &[u8]) -> Result<(usize, bool)> {
        let Some(mut recv) = self.recvs.remove(&source) else {
            return Err(RmaError::Protocol(format!(
                "payload from rank {source} without a packet"
            )));
        };
        let take = data.len().min(recv.remaining);
        let chunk = &data[..take];
        recv.remaining -= take;
        match &mut recv.sink {
            RecvSink::Apply { buf, .. } | RecvSink::Response { buf, .. } => {
                buf.extend_from_slice(chunk)
            }
            RecvSink::Queued { win, entry } => {
                let (win, entry) = (*win, *entry);
                self.win(win)?.lock_queue.receive(entry, chunk).ok_or_else(|| {
                    RmaError::Protocol("payload for a lock entry that is gone".into())
                })?;
            }
            RecvSink::Discard => {}
        }
        if recv.remaining > 0 {
            self.recvs.insert(source, recv);
            return Ok((take, false));
        }

        match recv.sink {
            RecvSink::Apply { hdr, buf } => self.perform_op(source, &hdr, &buf)?,
            RecvSink::Queued { win, .. } => self.process_lock_queue(win)?,
            RecvSink::Discard => {}
            RecvSink::Response { resp, buf } => self.complete_response(resp, &buf)?,
        }
        Ok((take, true))
    }

    /// Keep the rest of a partially delivered payload for later [`RmaProcess::on_data`]
    /// calls. Return the packet's progress as reported by [`RmaProcess::on_packet`].
    fn defer_payload(
        &mut self,
        source: Rank,
        consumed: usize,
        expected: usize,
        sink: RecvSink,
    ) -> (usize, bool) {
        if consumed == expected {
            return (consumed, true);
        }
        self.recvs.insert(
            source,
            PendingRecv {
                remaining: expected - consumed,
                sink,
            },
        );
        (consumed, false)
    }
}
