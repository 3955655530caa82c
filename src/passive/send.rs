//! Control packets of the lock protocol.

use tracing::debug;

use super::RmaProcess;
use crate::error::Result;
use crate::packet::{
    AckBits, LockAckStatus, LockMode, Packet, PacketFlags, RequestHandle, SyncBits, WinHandle,
};
use crate::transport::Transport;
use crate::Rank;

impl<T: Transport> RmaProcess<T> {
    pub(crate) fn send_lock_msg(
        &mut self,
        dest: Rank,
        win: WinHandle,
        mode: LockMode,
    ) -> Result<()> {
        let target_win = self.win(win)?.peer_handle(dest)?;
        let flags = SyncBits {
            lock: Some(mode),
            ..Default::default()
        };
        debug!("rank {} requests {} lock on {}", self.rank(), mode, dest);
        let pkt = Packet::Lock {
            target_win,
            source_win: win,
            request_handle: RequestHandle::NULL,
            flags: flags.into(),
        };
        self.transport.send(dest, pkt, &[])
    }

    pub(crate) fn send_unlock_msg(&mut self, dest: Rank, win: WinHandle) -> Result<()> {
        let target_win = self.win(win)?.peer_handle(dest)?;
        let flags = SyncBits {
            unlock: true,
            ..Default::default()
        };
        let pkt = Packet::Unlock {
            target_win,
            source_win: win,
            flags: flags.into(),
        };
        self.transport.send(dest, pkt, &[])
    }

    pub(crate) fn send_flush_msg(&mut self, dest: Rank, win: WinHandle) -> Result<()> {
        let target_win = self.win(win)?.peer_handle(dest)?;
        let pkt = Packet::Flush {
            target_win,
            source_win: win,
        };
        self.transport.send(dest, pkt, &[])
    }

    pub(crate) fn send_decr_at_cnt_msg(&mut self, dest: Rank, win: WinHandle) -> Result<()> {
        let target_win = self.win(win)?.peer_handle(dest)?;
        self.transport
            .send(dest, Packet::DecrAtCounter { target_win }, &[])
    }

    /// Answer a LOCK packet. `source_win` is the requester's own window handle.
    pub(crate) fn send_lock_ack_pkt(
        &mut self,
        dest: Rank,
        source_win: WinHandle,
        request_handle: RequestHandle,
        status: LockAckStatus,
    ) -> Result<()> {
        let flags = AckBits {
            status: Some(status),
            flush_ack: false,
        };
        debug!("rank {} answers lock of {}: {}", self.rank(), dest, status);
        let pkt = Packet::LockAck {
            source_win,
            request_handle,
            target_rank: self.rank(),
            flags: flags.into(),
        };
        self.transport.send(dest, pkt, &[])
    }

    /// Answer an operation that carried a lock request.
    pub(crate) fn send_lock_op_ack_pkt(
        &mut self,
        dest: Rank,
        source_win: WinHandle,
        request_handle: RequestHandle,
        flags: PacketFlags,
    ) -> Result<()> {
        let pkt = Packet::LockOpAck {
            source_win,
            request_handle,
            target_rank: self.rank(),
            flags,
        };
        self.transport.send(dest, pkt, &[])
    }

    pub(crate) fn send_flush_ack_pkt(&mut self, dest: Rank, source_win: WinHandle) -> Result<()> {
        let pkt = Packet::FlushAck {
            source_win,
            target_rank: self.rank(),
        };
        self.transport.send(dest, pkt, &[])
    }
}
