//! The namespace-wide driver: partitions namespaces among ranks, runs a
//! producer/consumer thread team per namespace (producers scan
//! reference directories, consumers walk streams and execute operation
//! chains), reduces per-thread reports, and writes quota totals back.
//!
//! Process placement is the launcher's concern: `rank` / `n_ranks`
//! arrive as options, worker rank `r` handles namespaces with
//! `index mod (n_ranks - 1) == r`, and the last rank reports. A
//! single-rank run does both jobs in-process.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::mpsc;
use std::sync::{Arc, Mutex};

use time::OffsetDateTime;

use crate::config::{MarfsConfig, NsRef, PosMode, Position};
use crate::dal::Location;
use crate::error::Error;
use crate::rsrc::log::{LogMode, LogSummary, OpExt, OpInfo, OpType, ResourceLog};
use crate::rsrc::process::{self, WorkItem};
use crate::rsrc::repack::RepackStreamer;
use crate::rsrc::walker::{StreamWalker, Thresholds, WalkerOpen, WalkerReport};

const DEFAULT_PRODUCERS: usize = 10;
const DEFAULT_CONSUMERS: usize = 10;

/// Options of one resource-manager pass.
#[derive(Debug, Clone)]
pub struct RsrcMgrOpts {
    /// Identifier of this pass; log files land under
    /// `<log_root>/<iteration>/<namespace>/`.
    pub iteration: String,
    pub log_root: PathBuf,
    pub thresholds: Thresholds,
    pub rebuild_loc: Option<Location>,
    /// Execute planned operations. Without it the pass only counts what
    /// would be collected.
    pub delete: bool,
    /// Restrict the pass to one namespace subtree.
    pub ns_target: Option<String>,
    pub n_prod: usize,
    pub n_cons: usize,
    pub rank: usize,
    pub n_ranks: usize,
    /// Client tag applied to repack streams.
    pub ctag: String,
}

impl Default for RsrcMgrOpts {
    fn default() -> Self {
        RsrcMgrOpts {
            iteration: format!("iter-{}", OffsetDateTime::now_utc().unix_timestamp()),
            log_root: PathBuf::from("/var/tmp/marfs-rsrc-mgr"),
            thresholds: Thresholds::quota_only(),
            rebuild_loc: None,
            delete: false,
            ns_target: None,
            n_prod: DEFAULT_PRODUCERS,
            n_cons: DEFAULT_CONSUMERS,
            rank: 0,
            n_ranks: 1,
            ctag: "RMAN".to_string(),
        }
    }
}

/// Per-namespace outcome of a pass.
#[derive(Debug, Clone)]
pub struct NsSummary {
    pub ns: String,
    pub report: WalkerReport,
    pub log: LogSummary,
    pub deleted: bool,
    pub errors: u64,
}

impl fmt::Display for NsSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let verb = if self.deleted {
            "Deleted"
        } else {
            "Eligible for GC"
        };
        write!(
            f,
            "{}: {} files / {} bytes in use; {} streams walked; {verb}: {} objects, {} refs; \
             {} volatile, {} repack candidates, {} rebuild candidates, {} errors",
            self.ns,
            self.report.fileusage,
            self.report.byteusage,
            self.report.streamcount,
            self.report.delobjs,
            self.report.delfiles,
            self.report.volfiles,
            self.report.rpckfiles,
            self.report.rbldobjs,
            self.errors,
        )
    }
}

/// Aggregate outcome of a pass.
#[derive(Debug, Clone, Default)]
pub struct RunSummary {
    pub namespaces: Vec<NsSummary>,
}

impl RunSummary {
    pub fn totals(&self) -> WalkerReport {
        let mut totals = WalkerReport::default();
        for ns in &self.namespaces {
            totals.absorb(&ns.report);
        }
        totals
    }

    pub fn errors(&self) -> u64 {
        self.namespaces.iter().map(|ns| ns.errors).sum()
    }
}

/// Whether a worker rank owns the namespace at `index`. The final rank
/// of a multi-rank run is the reporter and owns none.
pub fn rank_handles(index: usize, rank: usize, n_ranks: usize) -> bool {
    if n_ranks <= 1 {
        return true;
    }
    let workers = n_ranks - 1;
    if rank >= workers {
        return false;
    }
    index % workers == rank
}

fn ns_log_dir(idstr: &str) -> String {
    idstr.trim_start_matches('/').replace('/', "#")
}

/// Drive one full pass.
pub fn run(config: &Arc<MarfsConfig>, opts: &RsrcMgrOpts) -> crate::Result<RunSummary> {
    let mut targets: Vec<NsRef> = Vec::new();
    for (index, nsref) in config.namespaces().into_iter().enumerate() {
        if let Some(tgt) = &opts.ns_target {
            let idstr = &config.ns(nsref).idstr;
            if idstr != tgt && !idstr.starts_with(&format!("{tgt}/")) {
                continue;
            }
        }
        if rank_handles(index, opts.rank, opts.n_ranks) {
            targets.push(nsref);
        }
    }
    if targets.is_empty() && opts.ns_target.is_some() && opts.n_ranks <= 1 {
        return Err(Error::not_found(format!(
            "namespace target \"{}\"",
            opts.ns_target.as_deref().unwrap_or_default()
        )));
    }

    let mut summary = RunSummary::default();
    for nsref in targets {
        let ns_summary = process_namespace(config, nsref, opts)?;
        log::info!("{}", ns_summary);
        summary.namespaces.push(ns_summary);
    }
    Ok(summary)
}

/// Shared state of one namespace's thread team.
struct TeamState {
    refdirs: Vec<String>,
    next_refdir: Mutex<usize>,
    rlog: Mutex<ResourceLog>,
    repack: RepackStreamer,
}

impl TeamState {
    fn next_dir(&self) -> Option<String> {
        let mut next = self.next_refdir.lock().unwrap();
        let dir = self.refdirs.get(*next).cloned();
        if dir.is_some() {
            *next += 1;
        }
        dir
    }
}

fn process_namespace(
    config: &Arc<MarfsConfig>,
    nsref: NsRef,
    opts: &RsrcMgrOpts,
) -> crate::Result<NsSummary> {
    let ns_name = config.ns(nsref).idstr.clone();
    log::info!("Processing namespace \"{}\"", ns_name);
    let pos = config.establish_position(nsref, PosMode::Batch)?;

    // fresh modify-log for this pass
    let ns_dir = ns_log_dir(&ns_name);
    let log_path = opts
        .log_root
        .join(&opts.iteration)
        .join(&ns_dir)
        .join(format!("resourcelog-{}", opts.rank));
    let mut rlog = ResourceLog::init(&log_path, LogMode::Modify)?;

    let repack = RepackStreamer::new();

    // a previous pass may have died mid-operation; replay its logs
    let replayed = replay_previous(&opts.log_root, &opts.iteration, &ns_dir, &mut rlog)?;
    if !replayed.is_empty() && opts.delete {
        process::execute_chain(&pos, replayed, &mut rlog, &repack, &opts.ctag)?;
    }

    let team = Arc::new(TeamState {
        refdirs: config.repo(nsref).metascheme.reftable.refdirs(),
        next_refdir: Mutex::new(0),
        rlog: Mutex::new(rlog),
        repack,
    });

    let n_prod = opts.n_prod.clamp(1, team.refdirs.len().max(1));
    let n_cons = opts.n_cons.max(1);
    let (tx, rx) = mpsc::channel::<WorkItem>();
    let rx = Arc::new(Mutex::new(rx));

    let mut report = WalkerReport::default();
    let mut errors = 0u64;

    std::thread::scope(|scope| -> crate::Result<()> {
        let mut producers = Vec::new();
        for tid in 0..n_prod {
            let team = team.clone();
            let tx = tx.clone();
            let pos = config.duplicate_position(&pos)?;
            let recent_thresh = opts.thresholds.cleanup;
            producers.push(scope.spawn(move || -> u64 {
                let mut errors = 0;
                while let Some(refdir) = team.next_dir() {
                    let mut scanner = match pos.ctxt().openscanner(&refdir) {
                        Ok(s) => s,
                        Err(e) => {
                            log::error!("Producer {tid}: failed to scan \"{refdir}\": {e}");
                            errors += 1;
                            continue;
                        }
                    };
                    loop {
                        match process::process_refdir(
                            &pos,
                            scanner.as_mut(),
                            &refdir,
                            recent_thresh,
                        ) {
                            Ok(Some(item)) => {
                                if tx.send(item).is_err() {
                                    return errors;
                                }
                            }
                            Ok(None) => break,
                            Err(e) => {
                                log::error!(
                                    "Producer {tid}: error scanning \"{refdir}\": {e}"
                                );
                                errors += 1;
                                break;
                            }
                        }
                    }
                }
                errors
            }));
        }
        drop(tx);

        let mut consumers = Vec::new();
        for tid in 0..n_cons {
            let team = team.clone();
            let rx = rx.clone();
            let pos = config.duplicate_position(&pos)?;
            let opts = opts.clone();
            let config = config.clone();
            consumers.push(scope.spawn(move || -> (WalkerReport, u64) {
                let mut report = WalkerReport::default();
                let mut errors = 0;
                loop {
                    let item = {
                        let rx = rx.lock().unwrap();
                        rx.recv()
                    };
                    let item = match item {
                        Ok(item) => item,
                        Err(_) => break,
                    };
                    match consume_item(&config, &pos, &team, &opts, item) {
                        Ok(Some(item_report)) => report.absorb(&item_report),
                        Ok(None) => {}
                        Err(e) => {
                            log::error!("Consumer {tid}: {e}");
                            errors += 1;
                        }
                    }
                }
                (report, errors)
            }));
        }

        for producer in producers {
            errors += producer.join().unwrap_or_else(|_| {
                log::error!("A producer thread panicked");
                1
            });
        }
        for consumer in consumers {
            match consumer.join() {
                Ok((thread_report, thread_errors)) => {
                    report.absorb(&thread_report);
                    errors += thread_errors;
                }
                Err(_) => {
                    log::error!("A consumer thread panicked");
                    errors += 1;
                }
            }
        }
        Ok(())
    })?;

    // drain anything an aborted worker left behind
    let leftover = rx.lock().unwrap();
    while let Ok(item) = leftover.try_recv() {
        match consume_item(config, &pos, &team, opts, item) {
            Ok(Some(item_report)) => report.absorb(&item_report),
            Ok(None) => {}
            Err(e) => {
                log::error!("Driver drain: {e}");
                errors += 1;
            }
        }
    }
    drop(leftover);

    // write quota totals back through the MDAL
    pos.ctxt().set_data_usage(report.byteusage)?;
    pos.ctxt().set_inode_usage(report.fileusage)?;

    let team = Arc::into_inner(team)
        .ok_or_else(|| Error::inval("namespace team state is still shared"))?;
    if opts.delete {
        team.repack.complete()?;
    } else {
        team.repack.abort();
    }
    let log_summary = team.rlog.into_inner().unwrap().term()?;

    config.abandon_position(pos);
    Ok(NsSummary {
        ns: ns_name,
        report,
        log: log_summary,
        deleted: opts.delete,
        errors,
    })
}

/// Replay modify-logs left under the log root by earlier iterations of
/// this namespace, re-queueing their outstanding operations.
fn replay_previous(
    log_root: &Path,
    current_iteration: &str,
    ns_dir: &str,
    rlog: &mut ResourceLog,
) -> crate::Result<Vec<OpInfo>> {
    let mut outstanding = Vec::new();
    let iterations = match std::fs::read_dir(log_root) {
        Ok(entries) => entries,
        Err(_) => return Ok(outstanding),
    };
    for entry in iterations.flatten() {
        if entry.file_name().to_string_lossy() == current_iteration {
            continue;
        }
        let old_ns_dir = entry.path().join(ns_dir);
        let logs = match std::fs::read_dir(&old_ns_dir) {
            Ok(entries) => entries,
            Err(_) => continue,
        };
        for logfile in logs.flatten() {
            log::info!(
                "Replaying previous resource log \"{}\"",
                logfile.path().display()
            );
            outstanding.extend(rlog.replay(&logfile.path())?);
        }
        // fully-drained iteration directories disappear
        let _ = std::fs::remove_dir(&old_ns_dir);
        let _ = std::fs::remove_dir(entry.path());
    }
    Ok(outstanding)
}

/// Handle one work item, returning the walk report it produced (if
/// any).
fn consume_item(
    config: &Arc<MarfsConfig>,
    pos: &Position,
    team: &TeamState,
    opts: &RsrcMgrOpts,
    item: WorkItem,
) -> crate::Result<Option<WalkerReport>> {
    match item {
        WorkItem::Stream { rpath } => {
            let walk_pos = config.duplicate_position(pos)?;
            match StreamWalker::open(walk_pos, &rpath, opts.thresholds, opts.rebuild_loc)? {
                WalkerOpen::Incomplete { cleanup, report } => {
                    if cleanup && opts.delete {
                        match pos.ctxt().unlinkref(&rpath) {
                            Ok(()) | Err(Error::NotFound(_)) => {}
                            Err(e) => return Err(e),
                        }
                    }
                    Ok(Some(report))
                }
                WalkerOpen::Walker(mut walker) => {
                    while let Some(step) = walker.iterate()? {
                        if !opts.delete {
                            continue;
                        }
                        let mut rlog = team.rlog.lock().unwrap();
                        process::execute_chain(pos, step.gc, &mut rlog, &team.repack, &opts.ctag)?;
                        process::execute_chain(
                            pos,
                            step.repack,
                            &mut rlog,
                            &team.repack,
                            &opts.ctag,
                        )?;
                        process::execute_chain(
                            pos,
                            step.rebuild,
                            &mut rlog,
                            &team.repack,
                            &opts.ctag,
                        )?;
                    }
                    let (report, complete) = walker.close();
                    if !complete {
                        log::warn!("Stream walk of \"{}\" ended early", rpath);
                    }
                    Ok(Some(report))
                }
            }
        }
        WorkItem::RebuildMarker { rpath, ftag, rtag } => {
            if opts.thresholds.rebuild == 0 {
                return Ok(None);
            }
            let mut op = OpInfo::new(OpType::Rebuild, (*ftag).clone());
            op.count = 1;
            op.ext = OpExt::Rebuild {
                marker: Some(rpath),
                rtag,
            };
            let mut report = WalkerReport::default();
            report.rbldobjs += 1;
            report.rbldbytes += ftag.bytes;
            if opts.delete {
                let mut rlog = team.rlog.lock().unwrap();
                process::execute_chain(pos, vec![op], &mut rlog, &team.repack, &opts.ctag)?;
            }
            Ok(Some(report))
        }
        WorkItem::RepackMarker { rpath } => {
            if opts.delete {
                process::process_repack_marker(pos, &rpath, opts.thresholds.cleanup)?;
            }
            Ok(None)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rank_partition_reserves_a_reporter() {
        // single-rank runs own everything
        assert!(rank_handles(0, 0, 1));
        assert!(rank_handles(7, 0, 1));
        // with 4 ranks, three work and the last reports
        let n_ranks = 4;
        for index in 0..12 {
            let owners: Vec<usize> = (0..n_ranks)
                .filter(|rank| rank_handles(index, *rank, n_ranks))
                .collect();
            assert_eq!(owners.len(), 1);
            assert_eq!(owners[0], index % 3);
            assert!(!rank_handles(index, 3, n_ranks));
        }
    }

    #[test]
    fn ns_log_dirs_are_flat() {
        assert_eq!(ns_log_dir("/pool/sub"), "pool#sub");
        assert_eq!(ns_log_dir("/pool"), "pool");
    }
}
