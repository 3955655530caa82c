//! Packets exchanged by the passive-target protocol.

use bitvec::{field::BitField, prelude as bv};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::accumulate::OpHandle;
use crate::datatype::BasicType;
use crate::op::OpKind;
use crate::region::MemRegion;
use crate::Rank;

/// Window handle as exchanged between processes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct WinHandle(pub u32);

impl WinHandle {
    pub const NULL: Self = WinHandle(0);

    pub fn is_null(self) -> bool {
        self == Self::NULL
    }
}

/// Origin-side identifier of one RMA operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RequestHandle(pub u64);

impl RequestHandle {
    pub const NULL: Self = RequestHandle(0);

    pub fn is_null(self) -> bool {
        self == Self::NULL
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, strum::Display)]
pub enum LockMode {
    Shared,
    Exclusive,
}

/// Wire flag word carried by RMA and control packets.
///
/// | Bit | Flag                          |
/// | --- | ----------------------------- |
/// | 0   | `LOCK_SHARED`                 |
/// | 1   | `LOCK_EXCLUSIVE`              |
/// | 2   | `LOCK_GRANTED`                |
/// | 3   | `LOCK_DISCARDED`              |
/// | 4   | `LOCK_QUEUED_DATA_QUEUED`     |
/// | 5   | `LOCK_QUEUED_DATA_DISCARDED`  |
/// | 6   | `FLUSH`                       |
/// | 7   | `FLUSH_ACK`                   |
/// | 8   | `UNLOCK`                      |
/// | 9   | `DECR_AT_COUNTER`             |
/// | 10  | `RMA_STREAM`                  |
/// | 11+ | reserved                      |
#[derive(Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "u16", into = "u16")]
#[repr(transparent)]
pub struct PacketFlags(bv::BitArr!(for 16, in u16, bv::Lsb0));

impl_flag_word_basic_methods!(PacketFlags, 16);

impl PacketFlags {
    define_flag_accessor!(lock_shared, 0);
    define_flag_accessor!(lock_exclusive, 1);
    define_flag_accessor!(lock_granted, 2);
    define_flag_accessor!(lock_discarded, 3);
    define_flag_accessor!(lock_queued_data_queued, 4);
    define_flag_accessor!(lock_queued_data_discarded, 5);
    define_flag_accessor!(flush, 6);
    define_flag_accessor!(flush_ack, 7);
    define_flag_accessor!(unlock, 8);
    define_flag_accessor!(decr_at_counter, 9);
    define_flag_accessor!(stream, 10);

    /// Flags that ask the target to do something beyond the base operation.
    pub const SYNC_MASK: u64 =
        mask_of!(PacketFlags: lock_shared, lock_exclusive, flush, unlock, decr_at_counter);

    /// Flags only ever set on acknowledgments.
    pub const ACK_MASK: u64 = mask_of!(
        PacketFlags: lock_granted,
        lock_discarded,
        lock_queued_data_queued,
        lock_queued_data_discarded,
        flush_ack,
    );

    /// Lock request carried by the packet, if any.
    pub fn lock_mode(self) -> Option<LockMode> {
        match (self.lock_shared(), self.lock_exclusive()) {
            (true, _) => Some(LockMode::Shared),
            (false, true) => Some(LockMode::Exclusive),
            (false, false) => None,
        }
    }

    pub fn set_lock_mode(&mut self, mode: Option<LockMode>) {
        self.set_lock_shared(mode == Some(LockMode::Shared));
        self.set_lock_exclusive(mode == Some(LockMode::Exclusive));
    }

    /// Clear every flag.
    pub fn erase(&mut self) {
        *self = Self::new();
    }

    pub fn is_empty(self) -> bool {
        self.as_u16() == 0
    }

    pub fn union(self, other: Self) -> Self {
        Self::from_u16(self.as_u16() | other.as_u16())
    }

    pub fn sync(self) -> SyncBits {
        SyncBits::from(self)
    }

    pub fn ack(self) -> AckBits {
        AckBits::from(self)
    }
}

impl From<u16> for PacketFlags {
    fn from(raw: u16) -> Self {
        Self::from_u16(raw)
    }
}

impl From<PacketFlags> for u16 {
    fn from(flags: PacketFlags) -> Self {
        flags.as_u16()
    }
}

impl fmt::Debug for PacketFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        const NAMES: [&str; 11] = [
            "LOCK_SHARED",
            "LOCK_EXCLUSIVE",
            "LOCK_GRANTED",
            "LOCK_DISCARDED",
            "LOCK_QUEUED_DATA_QUEUED",
            "LOCK_QUEUED_DATA_DISCARDED",
            "FLUSH",
            "FLUSH_ACK",
            "UNLOCK",
            "DECR_AT_COUNTER",
            "RMA_STREAM",
        ];
        let mut set = f.debug_set();
        for (bit, name) in NAMES.iter().enumerate() {
            if self.0[bit] {
                set.entry(&format_args!("{name}"));
            }
        }
        set.finish()
    }
}

/// Decoded request bits of a packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SyncBits {
    pub lock: Option<LockMode>,
    pub flush: bool,
    pub unlock: bool,
    pub decr_at_counter: bool,
    pub stream: bool,
}

impl From<PacketFlags> for SyncBits {
    fn from(flags: PacketFlags) -> Self {
        Self {
            lock: flags.lock_mode(),
            flush: flags.flush(),
            unlock: flags.unlock(),
            decr_at_counter: flags.decr_at_counter(),
            stream: flags.stream(),
        }
    }
}

impl From<SyncBits> for PacketFlags {
    fn from(bits: SyncBits) -> Self {
        let raw = bit_repr_of!(PacketFlags: {
            lock_shared: bits.lock == Some(LockMode::Shared),
            lock_exclusive: bits.lock == Some(LockMode::Exclusive),
            flush: bits.flush,
            unlock: bits.unlock,
            decr_at_counter: bits.decr_at_counter,
            stream: bits.stream,
        });
        PacketFlags::from_u16(raw as u16)
    }
}

/// Outcome of a lock request, as reported by the target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
pub enum LockAckStatus {
    Granted,
    /// No queue entry could be allocated; the origin must ask again.
    Discarded,
    /// Queued together with the operation data.
    QueuedDataQueued,
    /// Queued as a bare lock request; the operation must be re-sent after the grant.
    QueuedDataDiscarded,
}

/// Decoded acknowledgment bits of a packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct AckBits {
    pub status: Option<LockAckStatus>,
    pub flush_ack: bool,
}

impl From<PacketFlags> for AckBits {
    fn from(flags: PacketFlags) -> Self {
        let status = if flags.lock_granted() {
            Some(LockAckStatus::Granted)
        } else if flags.lock_discarded() {
            Some(LockAckStatus::Discarded)
        } else if flags.lock_queued_data_queued() {
            Some(LockAckStatus::QueuedDataQueued)
        } else if flags.lock_queued_data_discarded() {
            Some(LockAckStatus::QueuedDataDiscarded)
        } else {
            None
        };
        Self {
            status,
            flush_ack: flags.flush_ack(),
        }
    }
}

impl From<AckBits> for PacketFlags {
    fn from(bits: AckBits) -> Self {
        let mut flags = PacketFlags::new();
        match bits.status {
            Some(LockAckStatus::Granted) => flags.set_lock_granted(true),
            Some(LockAckStatus::Discarded) => flags.set_lock_discarded(true),
            Some(LockAckStatus::QueuedDataQueued) => flags.set_lock_queued_data_queued(true),
            Some(LockAckStatus::QueuedDataDiscarded) => flags.set_lock_queued_data_discarded(true),
            None => {}
        }
        flags.set_flush_ack(bits.flush_ack);
        flags
    }
}

/// Header of an RMA operation packet. Payload bytes, if any, follow the header.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OpHeader {
    pub kind: OpKind,
    pub target_win: WinHandle,
    /// Origin window, where acknowledgments are routed.
    pub source_win: WinHandle,
    /// Origin operation, where response data is routed.
    pub request_handle: RequestHandle,
    pub target: MemRegion,
    /// Element type of the payload.
    pub origin_type: BasicType,
    pub op: OpHandle,
    pub flags: PacketFlags,
    /// Packed-stream byte offset of this unit within the whole operation.
    pub stream_offset: usize,
    /// Index of this streaming unit.
    pub unit: u32,
    /// Payload bytes following the header.
    pub data_len: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, strum::IntoStaticStr)]
pub enum Packet {
    Op(OpHeader),
    GetResp {
        source_win: WinHandle,
        request_handle: RequestHandle,
        unit: u32,
        target_rank: Rank,
        flags: PacketFlags,
        data_len: usize,
    },
    Lock {
        target_win: WinHandle,
        source_win: WinHandle,
        request_handle: RequestHandle,
        flags: PacketFlags,
    },
    LockAck {
        source_win: WinHandle,
        request_handle: RequestHandle,
        target_rank: Rank,
        flags: PacketFlags,
    },
    LockOpAck {
        source_win: WinHandle,
        request_handle: RequestHandle,
        target_rank: Rank,
        flags: PacketFlags,
    },
    Flush {
        target_win: WinHandle,
        source_win: WinHandle,
    },
    FlushAck {
        source_win: WinHandle,
        target_rank: Rank,
    },
    Unlock {
        target_win: WinHandle,
        source_win: WinHandle,
        flags: PacketFlags,
    },
    DecrAtCounter {
        target_win: WinHandle,
    },
}

impl Packet {
    pub fn name(&self) -> &'static str {
        self.into()
    }

    /// Payload bytes that follow this packet.
    pub fn data_len(&self) -> usize {
        match self {
            Packet::Op(hdr) => hdr.data_len,
            Packet::GetResp { data_len, .. } => *data_len,
            _ => 0,
        }
    }

    /// Lock mode requested by the packet, if it carries a lock request.
    pub fn lock_mode(&self) -> Option<LockMode> {
        match self {
            Packet::Op(hdr) => hdr.flags.lock_mode(),
            Packet::Lock { flags, .. } => flags.lock_mode(),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_layout() {
        assert_eq!(std::mem::size_of::<PacketFlags>(), 2);
        assert_eq!(PacketFlags::MASK_lock_shared, 0b1);
        assert_eq!(PacketFlags::MASK_flush, 1 << 6);
        assert_eq!(PacketFlags::MASK_stream, 1 << 10);
        assert_eq!(PacketFlags::SYNC_MASK & PacketFlags::ACK_MASK, 0);

        let mut f = PacketFlags::new();
        f.set_unlock(true);
        f.set_lock_exclusive(true);
        assert_eq!(f.as_u16(), (1 << 8) | (1 << 1));
        assert_eq!(format!("{f:?}"), r#"{LOCK_EXCLUSIVE, UNLOCK}"#);
    }

    #[test]
    fn test_sync_bits() {
        let bits = SyncBits {
            lock: Some(LockMode::Shared),
            flush: true,
            decr_at_counter: true,
            ..Default::default()
        };
        let flags = PacketFlags::from(bits);
        assert!(flags.lock_shared() && !flags.lock_exclusive());
        assert_eq!(flags.sync(), bits);
        assert_eq!(flags.ack(), AckBits::default());
        assert_eq!(flags.as_u16() as u64 & !PacketFlags::SYNC_MASK, 0);
    }

    #[test]
    fn test_ack_bits() {
        let flags = PacketFlags::from(AckBits {
            status: Some(LockAckStatus::QueuedDataDiscarded),
            flush_ack: true,
        });
        assert!(flags.lock_queued_data_discarded());
        assert!(flags.flush_ack());
        assert_eq!(flags.lock_mode(), None);
        assert_eq!(flags.ack().status, Some(LockAckStatus::QueuedDataDiscarded));
    }

    #[test]
    fn test_erase_and_union() {
        let mut f = PacketFlags::from(SyncBits {
            lock: Some(LockMode::Exclusive),
            unlock: true,
            ..Default::default()
        });
        let g = PacketFlags::from_u16(PacketFlags::MASK_stream as u16);
        assert!(f.union(g).stream());
        f.erase();
        assert!(f.is_empty());
    }

    #[test]
    fn test_serde_as_integer() {
        let mut f = PacketFlags::new();
        f.set_flush_ack(true);
        assert_eq!(serde_json::to_string(&f).unwrap(), "128");
        let back: PacketFlags = serde_json::from_str("128").unwrap();
        assert_eq!(back, f);
    }
}
