//! Transport collaborator: moves packets and their payload between processes.

mod loopback;

pub use loopback::*;

use crate::error::Result;
use crate::packet::Packet;
use crate::Rank;

/// Something that arrived from a peer.
#[derive(Debug)]
pub enum Delivery {
    /// A packet, with the first part (possibly all) of its payload.
    Packet {
        source: Rank,
        packet: Packet,
        data: Vec<u8>,
    },
    /// More payload of the last packet from `source`.
    Data { source: Rank, data: Vec<u8> },
}

/// Point-to-point packet transport between the ranks of a group.
///
/// Deliveries from one source arrive in the order that source sent them.
pub trait Transport {
    fn rank(&self) -> Rank;

    /// Number of ranks in the group.
    fn size(&self) -> usize;

    /// Shared-memory node of `rank`.
    fn node_of(&self, rank: Rank) -> usize {
        let _ = rank;
        0
    }

    /// Send `packet` followed by `data` to `dest`. The data is copied; sends complete locally
    /// on return.
    fn send(&mut self, dest: Rank, packet: Packet, data: &[u8]) -> Result<()>;

    /// Return the next delivery, if one is ready.
    fn poll(&mut self) -> Result<Option<Delivery>>;

    /// Block until the next delivery.
    fn wait(&mut self) -> Result<Delivery>;
}
