//! In-process transport over channels, one endpoint per rank.

use std::sync::mpsc::{channel, Receiver, Sender, TryRecvError};

use tracing::trace;

use super::{Delivery, Transport};
use crate::error::{Result, RmaError};
use crate::packet::Packet;
use crate::Rank;

#[derive(Debug, Clone, Copy)]
pub struct LoopbackOptions {
    /// Split payloads into deliveries of at most this many bytes.
    pub chunk: Option<usize>,
    /// Ranks sharing one shared-memory node.
    pub ranks_per_node: usize,
}

impl Default for LoopbackOptions {
    fn default() -> Self {
        Self {
            chunk: None,
            ranks_per_node: 1,
        }
    }
}

/// Endpoint of one rank.
pub struct LoopbackEndpoint {
    rank: Rank,
    peers: Vec<Sender<Delivery>>,
    inbox: Receiver<Delivery>,
    options: LoopbackOptions,
}

/// Create connected endpoints for `n` ranks.
pub fn loopback_fabric(n: usize) -> Vec<LoopbackEndpoint> {
    loopback_fabric_with(n, LoopbackOptions::default())
}

pub fn loopback_fabric_with(n: usize, options: LoopbackOptions) -> Vec<LoopbackEndpoint> {
    let (senders, receivers): (Vec<_>, Vec<_>) = (0..n).map(|_| channel()).unzip();
    receivers
        .into_iter()
        .enumerate()
        .map(|(rank, inbox)| LoopbackEndpoint {
            rank,
            peers: senders.clone(),
            inbox,
            options,
        })
        .collect()
}

impl LoopbackEndpoint {
    fn push(&self, dest: Rank, delivery: Delivery) -> Result<()> {
        let peer = self.peers.get(dest).ok_or(RmaError::InvalidRank(dest))?;
        peer.send(delivery)
            .map_err(|_| RmaError::Transport(format!("rank {dest} is unreachable")))
    }
}

impl Transport for LoopbackEndpoint {
    fn rank(&self) -> Rank {
        self.rank
    }

    fn size(&self) -> usize {
        self.peers.len()
    }

    fn node_of(&self, rank: Rank) -> usize {
        rank / self.options.ranks_per_node.max(1)
    }

    fn send(&mut self, dest: Rank, packet: Packet, data: &[u8]) -> Result<()> {
        trace!(src = self.rank, dest, pkt = packet.name(), len = data.len(), "send");
        let chunk = self.options.chunk.unwrap_or(usize::MAX).max(1);
        let mut parts = data.chunks(chunk);
        let first = parts.next().unwrap_or(&[]).to_vec();
        self.push(
            dest,
            Delivery::Packet {
                source: self.rank,
                packet,
                data: first,
            },
        )?;
        for part in parts {
            self.push(
                dest,
                Delivery::Data {
                    source: self.rank,
                    data: part.to_vec(),
                },
            )?;
        }
        Ok(())
    }

    fn poll(&mut self) -> Result<Option<Delivery>> {
        match self.inbox.try_recv() {
            Ok(d) => Ok(Some(d)),
            Err(TryRecvError::Empty) => Ok(None),
            Err(TryRecvError::Disconnected) => {
                Err(RmaError::Transport("every peer has gone away".into()))
            }
        }
    }

    fn wait(&mut self) -> Result<Delivery> {
        self.inbox
            .recv()
            .map_err(|_| RmaError::Transport("every peer has gone away".into()))
    }
}
