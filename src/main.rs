//! Many ranks hammering each other's windows with locked accumulates over the in-process
//! transport, then checking that nothing was lost.

use std::io;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;

use anyhow::{bail, Context};
use clap::Parser;
use quanta::Instant;
use rand::Rng;
use rmalock::utils::{timing, Timer, TimerOp};
use rmalock::*;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(version, about, long_about = None)]
pub struct Args {
    /// Number of ranks, one thread each.
    #[clap(short, long, default_value = "4")]
    pub nranks: usize,

    /// Epochs per rank.
    #[clap(short, long, default_value = "1000")]
    pub iters: usize,

    /// Probability of taking an exclusive lock.
    #[clap(short, long, default_value = "0.2")]
    pub exclusive: f64,

    /// JSON configuration file; `RMALOCK_*` environment variables are used otherwise.
    #[clap(short, long)]
    pub config: Option<String>,
}

#[derive(Debug, Default)]
struct RankReport {
    exclusive: usize,
    shared: usize,
    epochs: Timer,
}

/// Slot 0 of every window counts exclusive epochs; slot `1 + r` counts shared epochs of rank `r`.
fn run_rank(
    p: &mut RmaProcess<impl Transport>,
    win: WinHandle,
    args: &Args,
) -> anyhow::Result<RankReport> {
    let mut rng = rand::thread_rng();
    let mut report = RankReport::default();
    let me = p.rank();
    for _ in 0..args.iters {
        let target = rng.gen_range(0..p.size());
        let _t = TimerOp::new(&mut report.epochs);
        if rng.gen_bool(args.exclusive) {
            let old = ResultBuffer::zeroed(8);
            p.lock(win, target, LockMode::Exclusive, LockAssert::None)?;
            p.rma(
                win,
                target,
                RmaCall::FetchAndOp {
                    origin: datatype::encode(&[1i64]),
                    result: old.clone(),
                    target_disp: 0,
                    basic: BasicType::Int64,
                    op: ReduceOp::Sum.into(),
                },
            )?;
            p.unlock(win, target)?;
            report.exclusive += 1;
        } else {
            p.lock(win, target, LockMode::Shared, LockAssert::None)?;
            p.rma(
                win,
                target,
                RmaCall::Accumulate {
                    origin: OriginData::values(&[1i64]),
                    target: MemRegion::contiguous(8 * (1 + me), 1, BasicType::Int64),
                    op: ReduceOp::Sum.into(),
                },
            )?;
            p.unlock(win, target)?;
            report.shared += 1;
        }
    }
    timing::commit();
    Ok(report)
}

fn load_config(args: &Args) -> anyhow::Result<RmaConfig> {
    match &args.config {
        Some(path) => {
            let json = std::fs::read_to_string(path).with_context(|| format!("reading {path}"))?;
            Ok(RmaConfig::from_json(&json)?)
        }
        None => Ok(RmaConfig::from_env()?),
    }
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .with_writer(io::stderr)
        .init();

    let args = Args::parse();
    if args.nranks == 0 || !(0.0..=1.0).contains(&args.exclusive) {
        bail!("need at least one rank and an exclusive ratio in [0, 1]");
    }
    let config = load_config(&args)?;
    info!("{:?}", config);

    let win_size = 8 * (1 + args.nranks);
    let mut procs = Vec::with_capacity(args.nranks);
    for ep in loopback_fabric(args.nranks) {
        let mut p = RmaProcess::new(ep, config.clone())?;
        let win = p.win_create(win_size);
        procs.push((p, win));
    }

    let done = AtomicUsize::new(0);
    let start = Instant::now();
    let results: Vec<anyhow::Result<(RankReport, Vec<u8>)>> = thread::scope(|s| {
        let handles: Vec<_> = procs
            .into_iter()
            .map(|(mut p, win)| {
                let (done, args) = (&done, &args);
                s.spawn(move || -> anyhow::Result<(RankReport, Vec<u8>)> {
                    let report = run_rank(&mut p, win, args);
                    done.fetch_add(1, Ordering::SeqCst);
                    // A passive target keeps serving until every rank is through.
                    while done.load(Ordering::SeqCst) < args.nranks {
                        p.poke()?;
                    }
                    let mem = p.window(win)?.local().to_vec();
                    p.win_free(win)?;
                    Ok((report?, mem))
                })
            })
            .collect();
        handles
            .into_iter()
            .map(|h| match h.join() {
                Ok(r) => r,
                Err(_) => Err(anyhow::anyhow!("rank thread panicked")),
            })
            .collect()
    });
    let elapsed = start.elapsed();

    let mut reports = Vec::with_capacity(results.len());
    let mut mems = Vec::with_capacity(results.len());
    for result in results {
        let (report, mem) = result?;
        reports.push(report);
        mems.push(mem);
    }

    let slot = |mem: &[u8], i: usize| datatype::decode::<i64>(&mem[8 * i..8 * (i + 1)])[0];
    let exclusive: usize = reports.iter().map(|r| r.exclusive).sum();
    let seen: i64 = mems.iter().map(|m| slot(m, 0)).sum();
    if seen != exclusive as i64 {
        bail!("exclusive counters sum to {seen}, expected {exclusive}");
    }
    for (rank, report) in reports.iter().enumerate() {
        let seen: i64 = mems.iter().map(|m| slot(m, 1 + rank)).sum();
        if seen != report.shared as i64 {
            bail!("rank {rank}: shared counters sum to {seen}, expected {}", report.shared);
        }
    }

    let mut epochs = Timer::new();
    for report in &mut reports {
        epochs.merge_mut(&mut report.epochs);
    }
    let total = epochs.len();
    let stats = epochs.report();
    println!(
        "OK: {} ranks, {} epochs in {:.2?} ({:.0} epochs/s), median {:?}, p99 {:?}",
        args.nranks,
        total,
        elapsed,
        total as f64 / elapsed.as_secs_f64(),
        stats.median(),
        stats.p99()
    );
    timing::report(&mut io::stderr())?;
    Ok(())
}
