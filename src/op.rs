//! Origin-side RMA operations.

use std::sync::{Arc, Mutex, PoisonError};

use serde::{Deserialize, Serialize};

use crate::accumulate::{OpHandle, ReduceOp};
use crate::datatype::{encode, BasicType, Datatype, Element};
use crate::error::{Result, RmaError};
use crate::packet::{PacketFlags, RequestHandle};
use crate::region::{MemRegion, ResultBuffer};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, strum::Display)]
pub enum OpKind {
    Put,
    Get,
    Accumulate,
    GetAccumulate,
    CompareAndSwap,
    FetchAndOp,
}

impl OpKind {
    /// Operations that only modify target memory.
    pub fn is_write(self) -> bool {
        matches!(self, OpKind::Put | OpKind::Accumulate)
    }

    /// Operations whose target answers with data.
    pub fn has_response(self) -> bool {
        !self.is_write()
    }

    /// Operations whose payload is split into streaming units.
    pub fn is_streamed(self) -> bool {
        matches!(self, OpKind::Accumulate | OpKind::GetAccumulate)
    }
}

/// Origin data of a put or accumulate: `count` instances of `datatype` laid out in `buf`.
#[derive(Debug, Clone, PartialEq)]
pub struct OriginData {
    pub buf: Vec<u8>,
    pub count: usize,
    pub datatype: Datatype,
}

impl OriginData {
    pub fn new(buf: Vec<u8>, count: usize, datatype: impl Into<Datatype>) -> Self {
        Self {
            buf,
            count,
            datatype: datatype.into(),
        }
    }

    /// Contiguous values of a scalar type.
    pub fn values<T: Element>(values: &[T]) -> Self {
        Self::new(encode(values), values.len(), T::BASIC)
    }
}

/// Where fetched data lands: `region` inside `buf`.
#[derive(Debug, Clone)]
pub struct OriginResult {
    pub buf: ResultBuffer,
    pub region: MemRegion,
}

impl OriginResult {
    /// The whole of `buf`, as contiguous elements of `basic`.
    pub fn whole(buf: ResultBuffer, basic: BasicType) -> Self {
        let count = buf.len() / basic.size();
        Self {
            buf,
            region: MemRegion::contiguous(0, count, basic),
        }
    }

    /// Unpack packed bytes starting at packed-stream offset `first`.
    pub(crate) fn store(&self, first: usize, data: &[u8]) -> Result<()> {
        let mut buf = self.buf.lock();
        let dst = self.region.slice_of_mut(&mut buf)?;
        self.region
            .datatype
            .unpack_range(data, self.region.count, first, dst)
    }
}

/// One RMA call as issued by the application.
#[derive(Debug, Clone)]
pub enum RmaCall {
    Put {
        origin: OriginData,
        target: MemRegion,
    },
    Get {
        result: OriginResult,
        target: MemRegion,
    },
    Accumulate {
        origin: OriginData,
        target: MemRegion,
        op: OpHandle,
    },
    GetAccumulate {
        origin: OriginData,
        result: OriginResult,
        target: MemRegion,
        op: OpHandle,
    },
    CompareAndSwap {
        origin: Vec<u8>,
        compare: Vec<u8>,
        result: ResultBuffer,
        target_disp: usize,
        basic: BasicType,
    },
    FetchAndOp {
        origin: Vec<u8>,
        result: ResultBuffer,
        target_disp: usize,
        basic: BasicType,
        op: OpHandle,
    },
}

impl RmaCall {
    pub fn kind(&self) -> OpKind {
        match self {
            RmaCall::Put { .. } => OpKind::Put,
            RmaCall::Get { .. } => OpKind::Get,
            RmaCall::Accumulate { .. } => OpKind::Accumulate,
            RmaCall::GetAccumulate { .. } => OpKind::GetAccumulate,
            RmaCall::CompareAndSwap { .. } => OpKind::CompareAndSwap,
            RmaCall::FetchAndOp { .. } => OpKind::FetchAndOp,
        }
    }
}

#[derive(Debug, Default)]
struct RequestState {
    complete: bool,
    error: Option<String>,
}

/// User-visible completion handle of a request-based RMA call.
#[derive(Debug, Clone, Default)]
pub struct RmaRequest(Arc<Mutex<RequestState>>);

impl RmaRequest {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub fn is_complete(&self) -> bool {
        self.0.lock().unwrap_or_else(PoisonError::into_inner).complete
    }

    /// Error recorded by the engine while completing the operation.
    pub fn error(&self) -> Option<String> {
        self.0
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .error
            .clone()
    }

    pub(crate) fn complete(&self) {
        self.0.lock().unwrap_or_else(PoisonError::into_inner).complete = true;
    }

    pub(crate) fn fail(&self, err: &RmaError) {
        let mut state = self.0.lock().unwrap_or_else(PoisonError::into_inner);
        state.complete = true;
        state.error = Some(err.to_string());
    }
}

/// A network fragment of an issued operation that is not complete yet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubRequest {
    pub unit: u32,
}

/// Which issued list an operation belongs to once it leaves the pending list.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IssuedClass {
    /// Any of the origin, target or result layouts is derived.
    Derived,
    Write,
    Read,
}

/// Origin-side record of one RMA call.
#[derive(Debug)]
pub struct PendingOp {
    pub id: RequestHandle,
    pub kind: OpKind,
    pub target: MemRegion,
    pub origin_layout: Datatype,
    /// Packed origin bytes; for compare-and-swap, origin followed by compare.
    pub data: Vec<u8>,
    /// Element type of `data`.
    pub origin_type: BasicType,
    pub op: OpHandle,
    pub result: Option<OriginResult>,

    /// Union of the flags sent with this operation's packets.
    pub flags: PacketFlags,
    /// Set DECR_AT_COUNTER on the last unit.
    pub notify_target: bool,
    pub reqs: Vec<SubRequest>,
    pub issued_stream_count: usize,
    /// Elements per streaming unit, fixed at issue.
    pub stream_elems: usize,
    pub ureq: Option<RmaRequest>,
}

impl PendingOp {
    pub(crate) fn from_call(id: RequestHandle, call: RmaCall) -> Result<Self> {
        let kind = call.kind();
        let (data, origin_layout, origin_type, target, op, result) = match call {
            RmaCall::Put { origin, target } => {
                let data = pack_origin(&origin, &target)?;
                let basic = origin.datatype.basic_type();
                let op = OpHandle::builtin(ReduceOp::Replace);
                (data, origin.datatype, basic, target, op, None)
            }
            RmaCall::Get { result, target } => {
                check_types(result.region.basic_type(), &target)?;
                check_sizes(result.region.data_size(), &target)?;
                let basic = target.basic_type();
                let op = OpHandle::builtin(ReduceOp::NoOp);
                (Vec::new(), Datatype::Predefined(basic), basic, target, op, Some(result))
            }
            RmaCall::Accumulate { origin, target, op } => {
                let data = pack_origin(&origin, &target)?;
                let basic = origin.datatype.basic_type();
                (data, origin.datatype, basic, target, op, None)
            }
            RmaCall::GetAccumulate {
                origin,
                result,
                target,
                op,
            } => {
                let data = pack_origin(&origin, &target)?;
                check_types(result.region.basic_type(), &target)?;
                check_sizes(result.region.data_size(), &target)?;
                let basic = origin.datatype.basic_type();
                (data, origin.datatype, basic, target, op, Some(result))
            }
            RmaCall::CompareAndSwap {
                mut origin,
                compare,
                result,
                target_disp,
                basic,
            } => {
                if origin.len() != basic.size() || compare.len() != basic.size() {
                    return Err(RmaError::InvalidDatatype("compare-and-swap takes one element"));
                }
                origin.extend_from_slice(&compare);
                let target = MemRegion::contiguous(target_disp, 1, basic);
                let result = OriginResult::whole(result, basic);
                let op = OpHandle::builtin(ReduceOp::Replace);
                (origin, Datatype::Predefined(basic), basic, target, op, Some(result))
            }
            RmaCall::FetchAndOp {
                origin,
                result,
                target_disp,
                basic,
                op,
            } => {
                if origin.len() != basic.size() {
                    return Err(RmaError::InvalidDatatype("fetch-and-op takes one element"));
                }
                let target = MemRegion::contiguous(target_disp, 1, basic);
                let result = OriginResult::whole(result, basic);
                (origin, Datatype::Predefined(basic), basic, target, op, Some(result))
            }
        };

        Ok(Self {
            id,
            kind,
            target,
            origin_layout,
            data,
            origin_type,
            op,
            result,
            flags: PacketFlags::new(),
            notify_target: false,
            reqs: Vec::new(),
            issued_stream_count: 0,
            stream_elems: 0,
            ureq: None,
        })
    }

    /// List this operation joins after it has been issued.
    pub fn classify(&self) -> IssuedClass {
        let result_derived = self
            .result
            .as_ref()
            .is_some_and(|r| !r.region.datatype.is_predefined());
        if !self.origin_layout.is_predefined()
            || !self.target.datatype.is_predefined()
            || result_derived
        {
            IssuedClass::Derived
        } else if self.kind.is_write() {
            IssuedClass::Write
        } else {
            IssuedClass::Read
        }
    }

    /// Mark the sub-request of `unit` complete. Return true if it was outstanding.
    pub(crate) fn complete_unit(&mut self, unit: u32) -> bool {
        match self.reqs.iter().position(|r| r.unit == unit) {
            Some(pos) => {
                self.reqs.swap_remove(pos);
                true
            }
            None => false,
        }
    }

    /// Forget everything learned from a discarded issue so the op can be sent again.
    pub(crate) fn rewind(&mut self) {
        self.reqs.clear();
        self.flags.erase();
        self.issued_stream_count = 0;
    }

    /// Complete the user handle if nothing is left in flight.
    pub(crate) fn set_user_req_after_issue(&self) {
        if self.reqs.is_empty() {
            if let Some(ureq) = &self.ureq {
                ureq.complete();
            }
        }
    }
}

fn check_types(basic: BasicType, target: &MemRegion) -> Result<()> {
    if basic != target.basic_type() {
        return Err(RmaError::InvalidDatatype(
            "origin and target element types differ",
        ));
    }
    Ok(())
}

fn check_sizes(bytes: usize, target: &MemRegion) -> Result<()> {
    if bytes != target.data_size() {
        return Err(RmaError::InvalidDatatype(
            "origin and target describe different amounts of data",
        ));
    }
    Ok(())
}

fn pack_origin(origin: &OriginData, target: &MemRegion) -> Result<Vec<u8>> {
    check_types(origin.datatype.basic_type(), target)?;
    check_sizes(origin.datatype.size() * origin.count, target)?;
    origin.datatype.pack(&origin.buf, origin.count)
}
