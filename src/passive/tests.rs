use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use super::RmaProcess;
use crate::accumulate::{OpHandle, ReduceOp};
use crate::config::RmaConfig;
use crate::datatype::{decode, encode, BasicType, DerivedType};
use crate::error::RmaError;
use crate::lockqueue::LockEntryPayload;
use crate::op::{OriginData, OriginResult, RmaCall};
use crate::packet::{LockMode, WinHandle};
use crate::region::{MemRegion, ResultBuffer};
use crate::target::{LockAssert, SyncFlag, TargetAccessState};
use crate::transport::{loopback_fabric_with, LoopbackEndpoint, LoopbackOptions};
use crate::window::{LocalLock, WinAccessState};
use crate::Rank;

type Proc = RmaProcess<LoopbackEndpoint>;

fn group(n: usize, config: RmaConfig) -> (Vec<Proc>, WinHandle) {
    group_with(n, config, LoopbackOptions::default(), false)
}

fn group_with(
    n: usize,
    config: RmaConfig,
    options: LoopbackOptions,
    shm: bool,
) -> (Vec<Proc>, WinHandle) {
    let mut procs: Vec<Proc> = loopback_fabric_with(n, options)
        .into_iter()
        .map(|ep| RmaProcess::new(ep, config.clone()).unwrap())
        .collect();
    let wins: Vec<WinHandle> = procs
        .iter_mut()
        .map(|p| {
            if shm {
                p.win_allocate_shared(64)
            } else {
                p.win_create(64)
            }
        })
        .collect();
    assert!(wins.iter().all(|w| *w == wins[0]));
    (procs, wins[0])
}

/// Poke every rank round-robin until a whole round handles nothing.
fn drive(procs: &mut [Proc]) {
    for _ in 0..10_000 {
        let mut handled = 0;
        for p in procs.iter_mut() {
            handled += p.poke().unwrap();
        }
        if handled == 0 {
            return;
        }
    }
    panic!("ranks never went quiet");
}

fn pump(procs: &mut [Proc], rounds: usize) {
    for _ in 0..rounds {
        for p in procs.iter_mut() {
            p.poke().unwrap();
        }
    }
}

fn ints(p: &Proc, win: WinHandle, n: usize) -> Vec<i32> {
    decode(&p.window(win).unwrap().local()[..4 * n])
}

fn put_ints(values: &[i32], disp: usize) -> RmaCall {
    RmaCall::Put {
        origin: OriginData::values(values),
        target: MemRegion::contiguous(disp, values.len(), BasicType::Int32),
    }
}

fn acc_ints(values: &[i32], disp: usize, op: ReduceOp) -> RmaCall {
    RmaCall::Accumulate {
        origin: OriginData::values(values),
        target: MemRegion::contiguous(disp, values.len(), BasicType::Int32),
        op: op.into(),
    }
}

fn get_ints(result: &ResultBuffer, disp: usize) -> RmaCall {
    RmaCall::Get {
        result: OriginResult::whole(result.clone(), BasicType::Int32),
        target: MemRegion::contiguous(disp, result.len() / 4, BasicType::Int32),
    }
}

fn target_state(p: &Proc, win: WinHandle, rank: Rank) -> TargetAccessState {
    p.window(win).unwrap().target(rank).unwrap().access_state()
}

/// Take the lock of `origin` on `target` and wait for the grant.
fn hold_lock(procs: &mut [Proc], win: WinHandle, origin: Rank, target: Rank, mode: LockMode) {
    procs[origin].lock(win, target, mode, LockAssert::None).unwrap();
    procs[origin].request_lock(win, target).unwrap();
    drive(procs);
    assert!(procs[origin].test_lock_granted(win, target).unwrap());
}

fn release(procs: &mut [Proc], win: WinHandle, origin: Rank, target: Rank) {
    procs[origin].unlock_start(win, target).unwrap();
    drive(procs);
    assert!(procs[origin].test_unlock(win, target).unwrap());
}

#[test]
fn test_single_op_epoch_is_one_round_trip() {
    let (mut procs, win) = group(2, RmaConfig::default());
    procs[0].lock(win, 1, LockMode::Exclusive, LockAssert::None).unwrap();
    procs[0].rma(win, 1, put_ints(&[7, 8], 0)).unwrap();
    procs[0].unlock_start(win, 1).unwrap();

    // One packet carries lock, data and unlock; one acknowledgment answers all three.
    assert_eq!(procs[1].poke().unwrap(), 1);
    assert_eq!(ints(&procs[1], win, 2), vec![7, 8]);
    assert_eq!(procs[1].window(win).unwrap().lock_state(), LocalLock::Unlocked);
    assert_eq!(procs[0].poke().unwrap(), 1);

    assert!(procs[0].test_unlock(win, 1).unwrap());
    let w = procs[0].window(win).unwrap();
    assert_eq!(w.access_state(), WinAccessState::None);
    assert_eq!(w.outstanding_locks(), 0);
}

#[test]
fn test_empty_epoch_sends_nothing() {
    let (mut procs, win) = group(2, RmaConfig::default());
    procs[0].lock(win, 1, LockMode::Shared, LockAssert::None).unwrap();
    procs[0].flush_start(win, 1).unwrap();
    assert!(procs[0].test_flush(win, 1).unwrap());
    procs[0].unlock_start(win, 1).unwrap();
    assert!(procs[0].test_unlock(win, 1).unwrap());
    assert_eq!(procs[1].poke().unwrap(), 0);
}

#[test]
fn test_queued_request_is_granted_on_release() {
    let (mut procs, win) = group(3, RmaConfig::default());
    hold_lock(&mut procs, win, 1, 0, LockMode::Exclusive);

    procs[2].lock(win, 0, LockMode::Exclusive, LockAssert::None).unwrap();
    procs[2].rma(win, 0, put_ints(&[5, 6], 0)).unwrap();
    procs[2].unlock_start(win, 0).unwrap();
    drive(&mut procs);

    let queue = procs[0].window(win).unwrap().lock_queue();
    assert_eq!(queue.len(), 1);
    assert_eq!(queue.data_bytes(), 8);
    assert_eq!(ints(&procs[0], win, 2), vec![0, 0]);
    assert_eq!(target_state(&procs[2], win, 0), TargetAccessState::LockIssued);
    assert!(!procs[2].test_unlock(win, 0).unwrap());

    release(&mut procs, win, 1, 0);
    assert!(procs[2].test_unlock(win, 0).unwrap());
    assert_eq!(ints(&procs[0], win, 2), vec![5, 6]);
    let w = procs[0].window(win).unwrap();
    assert_eq!(w.lock_state(), LocalLock::Unlocked);
    assert!(w.lock_queue().is_empty());
    assert_eq!(w.lock_queue().data_bytes(), 0);
}

#[test]
fn test_zero_budget_keeps_bare_request() {
    let (mut procs, win) = group(3, RmaConfig::default().with_lock_data_bytes(0));
    hold_lock(&mut procs, win, 1, 0, LockMode::Exclusive);

    procs[2].lock(win, 0, LockMode::Exclusive, LockAssert::None).unwrap();
    procs[2].rma(win, 0, put_ints(&[1, 2, 3, 4], 0)).unwrap();
    procs[2].unlock_start(win, 0).unwrap();
    drive(&mut procs);

    let head = procs[0].window(win).unwrap().lock_queue().front().unwrap();
    assert_eq!(head.payload, LockEntryPayload::BareRequest);
    assert_eq!(head.mode(), Some(LockMode::Exclusive));
    // The operation went back to the origin's list, with the unlock intent.
    let t = procs[2].window(win).unwrap().target(0).unwrap();
    assert_eq!(t.pending.len(), 1);
    assert!(t.pending[0].flags.is_empty());
    assert_eq!(t.sync_flag, SyncFlag::Unlock);
    assert_eq!(t.outstanding_acks, 0);

    release(&mut procs, win, 1, 0);
    assert!(procs[2].test_unlock(win, 0).unwrap());
    assert_eq!(ints(&procs[0], win, 4), vec![1, 2, 3, 4]);
}

#[test]
fn test_full_pool_discards_and_retries() {
    let (mut procs, win) = group(3, RmaConfig::default().with_lock_entry_pool(0));
    hold_lock(&mut procs, win, 1, 0, LockMode::Exclusive);

    procs[2].lock(win, 0, LockMode::Shared, LockAssert::None).unwrap();
    procs[2].rma(win, 0, acc_ints(&[9], 0, ReduceOp::Sum)).unwrap();
    procs[2].unlock_start(win, 0).unwrap();
    pump(&mut procs, 20);
    assert!(procs[0].window(win).unwrap().lock_queue().is_empty());
    assert_ne!(target_state(&procs[2], win, 0), TargetAccessState::LockGranted);
    assert_eq!(ints(&procs[0], win, 1), vec![0]);

    release(&mut procs, win, 1, 0);
    drive(&mut procs);
    assert!(procs[2].test_unlock(win, 0).unwrap());
    assert_eq!(ints(&procs[0], win, 1), vec![9]);
    assert_eq!(procs[2].window(win).unwrap().outstanding_locks(), 0);
}

#[test]
fn test_queue_is_fifo() {
    let (mut procs, win) = group(5, RmaConfig::default());
    hold_lock(&mut procs, win, 1, 0, LockMode::Exclusive);
    for (rank, mode) in [
        (2, LockMode::Shared),
        (3, LockMode::Exclusive),
        (4, LockMode::Shared),
    ] {
        procs[rank].lock(win, 0, mode, LockAssert::None).unwrap();
        procs[rank].request_lock(win, 0).unwrap();
        drive(&mut procs);
    }
    assert_eq!(procs[0].window(win).unwrap().lock_queue().len(), 3);

    release(&mut procs, win, 1, 0);
    // Rank 4 is compatible with rank 2 but must not pass rank 3.
    assert!(procs[2].test_lock_granted(win, 0).unwrap());
    assert!(!procs[3].test_lock_granted(win, 0).unwrap());
    assert!(!procs[4].test_lock_granted(win, 0).unwrap());
    assert_eq!(procs[0].window(win).unwrap().lock_state(), LocalLock::Shared(1));

    release(&mut procs, win, 2, 0);
    assert!(procs[3].test_lock_granted(win, 0).unwrap());
    assert!(!procs[4].test_lock_granted(win, 0).unwrap());

    release(&mut procs, win, 3, 0);
    assert!(procs[4].test_lock_granted(win, 0).unwrap());
    release(&mut procs, win, 4, 0);
    assert_eq!(procs[0].window(win).unwrap().lock_state(), LocalLock::Unlocked);
}

#[test]
fn test_shared_accumulates_combine() {
    let (mut procs, win) = group(3, RmaConfig::default());
    for (rank, values) in [(1, [1, 2, 3]), (2, [10, 20, 30])] {
        procs[rank].lock(win, 0, LockMode::Shared, LockAssert::None).unwrap();
        procs[rank]
            .rma(win, 0, acc_ints(&values, 0, ReduceOp::Sum))
            .unwrap();
        procs[rank].unlock_start(win, 0).unwrap();
    }
    drive(&mut procs);
    assert!(procs[1].test_unlock(win, 0).unwrap());
    assert!(procs[2].test_unlock(win, 0).unwrap());
    assert_eq!(ints(&procs[0], win, 3), vec![11, 22, 33]);
}

#[test]
fn test_flush_keeps_lock() {
    let (mut procs, win) = group(2, RmaConfig::default());
    procs[0].lock(win, 1, LockMode::Exclusive, LockAssert::None).unwrap();
    procs[0].rma(win, 1, put_ints(&[4], 0)).unwrap();
    procs[0].flush_start(win, 1).unwrap();
    assert!(!procs[0].test_flush(win, 1).unwrap());
    drive(&mut procs);
    assert!(procs[0].test_flush(win, 1).unwrap());
    assert_eq!(ints(&procs[1], win, 1), vec![4]);
    assert_eq!(procs[1].window(win).unwrap().lock_state(), LocalLock::Exclusive);

    // A flush with nothing written since needs no message.
    procs[0].flush_start(win, 1).unwrap();
    assert!(procs[0].test_flush(win, 1).unwrap());

    procs[0].rma(win, 1, put_ints(&[5], 4)).unwrap();
    release(&mut procs, win, 0, 1);
    assert_eq!(ints(&procs[1], win, 2), vec![4, 5]);
    assert_eq!(procs[1].window(win).unwrap().lock_state(), LocalLock::Unlocked);
}

#[test]
fn test_flush_after_flush_covers_later_write() {
    let config = RmaConfig {
        poke_batch: 2,
        ..RmaConfig::default()
    };
    let (mut procs, win) = group(2, config);
    hold_lock(&mut procs, win, 0, 1, LockMode::Exclusive);

    procs[0].rma(win, 1, put_ints(&[1], 0)).unwrap();
    procs[0].flush_start(win, 1).unwrap();
    procs[0].rma(win, 1, put_ints(&[2], 4)).unwrap();

    // The first flush is answered before the second put lands.
    assert_eq!(procs[1].poke().unwrap(), 2);
    assert_eq!(procs[0].poke().unwrap(), 1);
    assert!(procs[0].test_flush(win, 1).unwrap());
    assert_eq!(ints(&procs[1], win, 2), vec![1, 0]);

    procs[0].flush_start(win, 1).unwrap();
    assert!(!procs[0].test_flush(win, 1).unwrap());
    drive(&mut procs);
    assert!(procs[0].test_flush(win, 1).unwrap());
    assert_eq!(ints(&procs[1], win, 2), vec![1, 2]);
    release(&mut procs, win, 0, 1);
}

#[test]
fn test_streamed_accumulate() {
    let config = RmaConfig::default().with_stream_buf_size(8);
    let (mut procs, win) = group(2, config);
    procs[1].window_mut(win).unwrap().local_mut()[..40].copy_from_slice(&encode(&[100i32; 10]));

    let values: Vec<i32> = (1..=10).collect();
    let result = ResultBuffer::zeroed(40);
    procs[0].lock(win, 1, LockMode::Exclusive, LockAssert::None).unwrap();
    procs[0]
        .rma(win, 1, acc_ints(&values, 0, ReduceOp::Sum))
        .unwrap();
    procs[0]
        .rma(
            win,
            1,
            RmaCall::GetAccumulate {
                origin: OriginData::values(&[1i32; 10]),
                result: OriginResult::whole(result.clone(), BasicType::Int32),
                target: MemRegion::contiguous(0, 10, BasicType::Int32),
                op: ReduceOp::Sum.into(),
            },
        )
        .unwrap();
    procs[0].unlock_start(win, 1).unwrap();
    drive(&mut procs);

    assert!(procs[0].test_unlock(win, 1).unwrap());
    let before: Vec<i32> = (101..=110).collect();
    let after: Vec<i32> = (102..=111).collect();
    assert_eq!(result.values::<i32>(), before);
    assert_eq!(ints(&procs[1], win, 10), after);
}

#[test]
fn test_streamed_derived_accumulate() {
    let config = RmaConfig::default().with_stream_buf_size(8);
    let (mut procs, win) = group(2, config);
    procs[1].window_mut(win).unwrap().local_mut()[..36].copy_from_slice(&encode(&[100i32; 9]));

    // Pairs at elements 0, 3 and 6; each pair is one streamed unit.
    let layout = DerivedType::vector(3, 2, 3, BasicType::Int32).unwrap();
    let old = ResultBuffer::zeroed(24);
    procs[0].lock(win, 1, LockMode::Exclusive, LockAssert::None).unwrap();
    procs[0]
        .rma(
            win,
            1,
            RmaCall::Accumulate {
                origin: OriginData::values(&[1i32, 2, 3, 4, 5, 6]),
                target: MemRegion::new(0, 1, layout.clone()),
                op: ReduceOp::Sum.into(),
            },
        )
        .unwrap();
    procs[0]
        .rma(
            win,
            1,
            RmaCall::GetAccumulate {
                origin: OriginData::values(&[10i32; 6]),
                result: OriginResult::whole(old.clone(), BasicType::Int32),
                target: MemRegion::new(0, 1, layout),
                op: ReduceOp::Sum.into(),
            },
        )
        .unwrap();
    procs[0].unlock_start(win, 1).unwrap();
    drive(&mut procs);

    assert!(procs[0].test_unlock(win, 1).unwrap());
    assert_eq!(old.values::<i32>(), vec![101, 102, 103, 104, 105, 106]);
    assert_eq!(
        ints(&procs[1], win, 9),
        vec![111, 112, 100, 113, 114, 100, 115, 116, 100]
    );
}

#[test]
fn test_empty_derived_accumulate() {
    let (mut procs, win) = group(2, RmaConfig::default());
    let layout = DerivedType::vector(2, 1, 2, BasicType::Int32).unwrap();
    let result = ResultBuffer::zeroed(0);
    procs[0].lock(win, 1, LockMode::Exclusive, LockAssert::None).unwrap();
    procs[0]
        .rma(
            win,
            1,
            RmaCall::Accumulate {
                origin: OriginData::values::<i32>(&[]),
                target: MemRegion::new(0, 0, layout.clone()),
                op: ReduceOp::Sum.into(),
            },
        )
        .unwrap();
    procs[0]
        .rma(
            win,
            1,
            RmaCall::GetAccumulate {
                origin: OriginData::values::<i32>(&[]),
                result: OriginResult::whole(result, BasicType::Int32),
                target: MemRegion::new(0, 0, layout),
                op: ReduceOp::Sum.into(),
            },
        )
        .unwrap();
    procs[0].unlock_start(win, 1).unwrap();
    drive(&mut procs);

    assert!(procs[0].test_unlock(win, 1).unwrap());
    assert_eq!(ints(&procs[1], win, 3), vec![0, 0, 0]);
    assert_eq!(procs[1].window(win).unwrap().lock_state(), LocalLock::Unlocked);
}

#[test]
fn test_split_delivery() {
    let options = LoopbackOptions {
        chunk: Some(3),
        ranks_per_node: 1,
    };
    let (mut procs, win) = group_with(3, RmaConfig::default(), options, false);
    let values: Vec<i32> = (0..10).map(|v| v * 3).collect();
    let result = ResultBuffer::zeroed(40);
    procs[0].lock(win, 1, LockMode::Exclusive, LockAssert::None).unwrap();
    procs[0].rma(win, 1, put_ints(&values, 0)).unwrap();
    procs[0].rma(win, 1, get_ints(&result, 0)).unwrap();
    procs[0].unlock_start(win, 1).unwrap();
    drive(&mut procs);
    assert!(procs[0].test_unlock(win, 1).unwrap());
    assert_eq!(ints(&procs[1], win, 10), values);
    assert_eq!(result.values::<i32>(), values);

    // Payload of a queued request also arrives in pieces.
    hold_lock(&mut procs, win, 0, 1, LockMode::Exclusive);
    procs[2].lock(win, 1, LockMode::Exclusive, LockAssert::None).unwrap();
    procs[2].rma(win, 1, put_ints(&[-1; 6], 16)).unwrap();
    procs[2].unlock_start(win, 1).unwrap();
    drive(&mut procs);
    let head = procs[1].window(win).unwrap().lock_queue().front().unwrap();
    assert!(head.all_data_received);
    release(&mut procs, win, 0, 1);
    assert!(procs[2].test_unlock(win, 1).unwrap());
    assert_eq!(ints(&procs[1], win, 10), vec![0, 3, 6, 9, -1, -1, -1, -1, -1, -1]);
}

#[test]
fn test_atomics() {
    let (mut procs, win) = group(2, RmaConfig::default());
    procs[1].window_mut(win).unwrap().local_mut()[..8].copy_from_slice(&encode(&[5u64]));

    let hit = ResultBuffer::zeroed(8);
    let miss = ResultBuffer::zeroed(8);
    let fetched = ResultBuffer::zeroed(8);
    let cas = |origin: u64, compare: u64, result: &ResultBuffer| RmaCall::CompareAndSwap {
        origin: encode(&[origin]),
        compare: encode(&[compare]),
        result: result.clone(),
        target_disp: 0,
        basic: BasicType::Uint64,
    };
    procs[0].lock(win, 1, LockMode::Exclusive, LockAssert::None).unwrap();
    procs[0].rma(win, 1, cas(9, 5, &hit)).unwrap();
    procs[0].rma(win, 1, cas(1, 5, &miss)).unwrap();
    procs[0]
        .rma(
            win,
            1,
            RmaCall::FetchAndOp {
                origin: encode(&[3u64]),
                result: fetched.clone(),
                target_disp: 0,
                basic: BasicType::Uint64,
                op: ReduceOp::Sum.into(),
            },
        )
        .unwrap();
    procs[0].unlock_start(win, 1).unwrap();
    drive(&mut procs);

    assert!(procs[0].test_unlock(win, 1).unwrap());
    assert_eq!(hit.values::<u64>(), vec![5]);
    assert_eq!(miss.values::<u64>(), vec![9]);
    assert_eq!(fetched.values::<u64>(), vec![9]);
    assert_eq!(decode::<u64>(&procs[1].window(win).unwrap().local()[..8]), vec![12]);
}

#[test]
fn test_queued_get_is_granted_by_its_response() {
    let (mut procs, win) = group(3, RmaConfig::default());
    procs[0].window_mut(win).unwrap().local_mut()[..8].copy_from_slice(&encode(&[41i32, 42]));
    hold_lock(&mut procs, win, 1, 0, LockMode::Exclusive);

    let result = ResultBuffer::zeroed(8);
    procs[2].lock(win, 0, LockMode::Exclusive, LockAssert::None).unwrap();
    let req = procs[2].rma_request(win, 0, get_ints(&result, 0)).unwrap();
    procs[2].unlock_start(win, 0).unwrap();
    drive(&mut procs);
    assert!(!req.is_complete());
    assert_eq!(target_state(&procs[2], win, 0), TargetAccessState::LockIssued);

    release(&mut procs, win, 1, 0);
    assert!(req.is_complete());
    assert_eq!(req.error(), None);
    assert_eq!(result.values::<i32>(), vec![41, 42]);
    assert!(procs[2].test_unlock(win, 0).unwrap());
}

#[test]
fn test_put_request_completes_at_issue() {
    let (mut procs, win) = group(2, RmaConfig::default());
    procs[0].lock(win, 1, LockMode::Shared, LockAssert::None).unwrap();
    let req = procs[0].rma_request(win, 1, put_ints(&[1], 0)).unwrap();
    assert!(!req.is_complete());
    procs[0].unlock_start(win, 1).unwrap();
    drive(&mut procs);
    assert!(req.is_complete());
    assert!(procs[0].test_unlock(win, 1).unwrap());
}

#[test]
fn test_self_lock() {
    let (mut procs, win) = group(1, RmaConfig::default());
    let result = ResultBuffer::zeroed(8);
    procs[0].lock(win, 0, LockMode::Exclusive, LockAssert::None).unwrap();
    procs[0].rma(win, 0, put_ints(&[3, 4], 0)).unwrap();
    procs[0].rma(win, 0, get_ints(&result, 0)).unwrap();
    procs[0].unlock(win, 0).unwrap();
    assert_eq!(result.values::<i32>(), vec![3, 4]);
    assert_eq!(procs[0].window(win).unwrap().lock_state(), LocalLock::Unlocked);
}

#[test]
fn test_flush_local_delivers_results() {
    let (mut procs, win) = group(1, RmaConfig::default());
    procs[0].window_mut(win).unwrap().local_mut()[..4].copy_from_slice(&encode(&[17i32]));
    let result = ResultBuffer::zeroed(4);
    procs[0].lock(win, 0, LockMode::Shared, LockAssert::None).unwrap();
    procs[0].rma(win, 0, get_ints(&result, 0)).unwrap();
    assert!(!procs[0].test_flush_local(win, 0).unwrap());
    procs[0].flush_local(win, 0).unwrap();
    assert_eq!(result.values::<i32>(), vec![17]);
    procs[0].flush_local_all(win).unwrap();
    procs[0].unlock(win, 0).unwrap();
}

#[test]
fn test_own_request_retried_when_queue_full() {
    let (mut procs, win) = group(2, RmaConfig::default().with_lock_entry_pool(0));
    hold_lock(&mut procs, win, 1, 0, LockMode::Exclusive);

    procs[0].lock(win, 0, LockMode::Exclusive, LockAssert::None).unwrap();
    procs[0].request_lock(win, 0).unwrap();
    pump(&mut procs, 5);
    assert!(!procs[0].test_lock_granted(win, 0).unwrap());

    procs[1].unlock_start(win, 0).unwrap();
    drive(&mut procs);
    assert!(procs[1].test_unlock(win, 0).unwrap());
    assert!(procs[0].test_lock_granted(win, 0).unwrap());
    assert_eq!(procs[0].window(win).unwrap().lock_state(), LocalLock::Exclusive);
    release(&mut procs, win, 0, 0);
}

#[test]
fn test_completion_notices() {
    let (mut procs, win) = group(3, RmaConfig::default());
    procs[0].expect_completions(win, 3).unwrap();
    for rank in [1, 2] {
        procs[rank].lock(win, 0, LockMode::Shared, LockAssert::None).unwrap();
        procs[rank]
            .rma_notify(win, 0, acc_ints(&[1], 0, ReduceOp::Sum))
            .unwrap();
        procs[rank].unlock_start(win, 0).unwrap();
    }
    drive(&mut procs);
    assert!(!procs[0].test_completions(win).unwrap());
    assert_eq!(ints(&procs[0], win, 1), vec![2]);

    procs[1].send_completion_notice(win, 0).unwrap();
    drive(&mut procs);
    assert!(procs[0].test_completions(win).unwrap());
}

#[test]
fn test_completion_notice_before_expectation() {
    let (mut procs, win) = group(2, RmaConfig::default());
    procs[1].send_completion_notice(win, 0).unwrap();
    drive(&mut procs);

    procs[0].expect_completions(win, 2).unwrap();
    assert!(!procs[0].test_completions(win).unwrap());
    procs[1].send_completion_notice(win, 0).unwrap();
    drive(&mut procs);
    assert!(procs[0].test_completions(win).unwrap());
}

#[test]
fn test_lock_all_without_check() {
    let (mut procs, win) = group(1, RmaConfig::default());
    procs[0].lock_all(win, LockAssert::NoCheck).unwrap();
    assert!(procs[0].test_lock_granted(win, 0).unwrap());
    procs[0].rma(win, 0, put_ints(&[6], 0)).unwrap();
    procs[0].flush_all(win).unwrap();
    assert_eq!(ints(&procs[0], win, 1), vec![6]);
    procs[0].unlock_all(win).unwrap();
    let w = procs[0].window(win).unwrap();
    assert_eq!(w.access_state(), WinAccessState::None);
    assert_eq!(w.lock_state(), LocalLock::Unlocked);
}

#[test]
fn test_epoch_misuse() {
    let (mut procs, win) = group(2, RmaConfig::default());
    procs[0].lock(win, 1, LockMode::Shared, LockAssert::None).unwrap();
    assert!(matches!(
        procs[0].lock(win, 1, LockMode::Shared, LockAssert::None),
        Err(RmaError::EpochInProgress(1))
    ));
    assert!(matches!(
        procs[0].lock_all(win, LockAssert::None),
        Err(RmaError::EpochInProgress(_))
    ));
    assert!(matches!(
        procs[0].rma(win, 0, put_ints(&[1], 0)),
        Err(RmaError::NoEpoch(0))
    ));
    assert!(matches!(
        procs[0].lock(win, 2, LockMode::Shared, LockAssert::None),
        Err(RmaError::InvalidRank(2))
    ));
    assert!(matches!(
        procs[0].win_free(win),
        Err(RmaError::EpochInProgress(_))
    ));
    assert!(matches!(procs[0].unlock_all(win), Err(RmaError::NoEpoch(_))));

    procs[1].win_free(win).unwrap();
    assert!(matches!(
        procs[1].window(win),
        Err(RmaError::UnknownWindow(_))
    ));
}

#[test]
fn test_transport_error_surfaces() {
    let (mut procs, win) = group(2, RmaConfig::default());
    drop(procs.pop());
    procs[0].lock(win, 1, LockMode::Exclusive, LockAssert::None).unwrap();
    procs[0].rma(win, 1, put_ints(&[1], 0)).unwrap();
    let err = procs[0].unlock_start(win, 1).unwrap_err();
    assert!(matches!(err, RmaError::Transport(_)));
    assert!(!err.is_fatal());
}

#[test]
fn test_user_op_is_fatal_at_target() {
    let (mut procs, win) = group(2, RmaConfig::default());
    procs[0].lock(win, 1, LockMode::Exclusive, LockAssert::None).unwrap();
    procs[0]
        .rma(
            win,
            1,
            RmaCall::Accumulate {
                origin: OriginData::values(&[1i32]),
                target: MemRegion::contiguous(0, 1, BasicType::Int32),
                op: OpHandle(0x1234),
            },
        )
        .unwrap();
    procs[0].unlock_start(win, 1).unwrap();
    let err = procs[1].poke().unwrap_err();
    assert!(matches!(err, RmaError::OpNotPredefined(0x1234)));
    assert!(err.is_fatal());
}

/// Run `work` on every rank in its own thread with blocking calls. Ranks keep serving
/// until all are done. Return each rank's window memory.
fn run_ranks<F>(n: usize, config: RmaConfig, options: LoopbackOptions, shm: bool, work: F) -> Vec<Vec<u8>>
where
    F: Fn(&mut Proc, WinHandle) + Sync,
{
    let (procs, win) = group_with(n, config, options, shm);
    let done = AtomicUsize::new(0);
    std::thread::scope(|s| {
        let handles: Vec<_> = procs
            .into_iter()
            .map(|mut p| {
                let (done, work) = (&done, &work);
                s.spawn(move || {
                    work(&mut p, win);
                    done.fetch_add(1, Ordering::SeqCst);
                    while done.load(Ordering::SeqCst) < n {
                        p.poke().unwrap();
                    }
                    p.window(win).unwrap().local().to_vec()
                })
            })
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    })
}

#[test]
fn test_threaded_exclusive_counter() {
    const ITERS: usize = 30;
    let seen = Mutex::new(Vec::new());
    let mems = run_ranks(4, RmaConfig::default(), LoopbackOptions::default(), false, |p, win| {
        for _ in 0..ITERS {
            let fetched = ResultBuffer::zeroed(8);
            p.lock(win, 0, LockMode::Exclusive, LockAssert::None).unwrap();
            p.rma(
                win,
                0,
                RmaCall::FetchAndOp {
                    origin: encode(&[1i64]),
                    result: fetched.clone(),
                    target_disp: 0,
                    basic: BasicType::Int64,
                    op: ReduceOp::Sum.into(),
                },
            )
            .unwrap();
            p.unlock(win, 0).unwrap();
            seen.lock().unwrap().push(fetched.values::<i64>()[0]);
        }
    });
    assert_eq!(decode::<i64>(&mems[0][..8]), vec![4 * ITERS as i64]);
    let mut seen = seen.into_inner().unwrap();
    seen.sort_unstable();
    assert_eq!(seen, (0..4 * ITERS as i64).collect::<Vec<_>>());
}

#[test]
fn test_threaded_lock_all_eager() {
    let config = RmaConfig::default().with_lock_all_eager(true);
    let mems = run_ranks(3, config, LoopbackOptions::default(), false, |p, win| {
        if p.rank() != 0 {
            return;
        }
        p.lock_all(win, LockAssert::None).unwrap();
        for rank in 0..3 {
            p.wait_lock_granted(win, rank).unwrap();
            p.rma(win, rank, put_ints(&[rank as i32 + 1], 0)).unwrap();
        }
        p.flush_all(win).unwrap();
        p.unlock_all(win).unwrap();
        let w = p.window(win).unwrap();
        assert_eq!(w.access_state(), WinAccessState::None);
        assert_eq!(w.outstanding_locks(), 0);
    });
    for (rank, mem) in mems.iter().enumerate() {
        assert_eq!(decode::<i32>(&mem[..4]), vec![rank as i32 + 1]);
    }
}

#[test]
fn test_threaded_lock_all_shared_window() {
    let options = LoopbackOptions {
        chunk: None,
        ranks_per_node: 2,
    };
    let mems = run_ranks(4, RmaConfig::default(), options, true, |p, win| {
        if p.rank() != 0 {
            return;
        }
        p.lock_all(win, LockAssert::None).unwrap();
        let w = p.window(win).unwrap();
        assert_ne!(target_state(p, win, 1), TargetAccessState::LockCalled);
        assert!(w.target(3).is_none());

        p.rma(win, 3, acc_ints(&[7], 0, ReduceOp::Sum)).unwrap();
        p.rma(win, 1, put_ints(&[8], 0)).unwrap();
        p.unlock_all(win).unwrap();
    });
    assert_eq!(decode::<i32>(&mems[1][..4]), vec![8]);
    assert_eq!(decode::<i32>(&mems[3][..4]), vec![7]);
}
