//! The streamwalker: a stateful iterator over one datastream. Each pass
//! over a reference file accumulates quota totals and plans operations;
//! chains are handed back to the caller as soon as any are sealed, so
//! the driver can pipeline execution with further traversal.

use std::mem;

use crate::config::{Position, RefTable};
use crate::dal::Location;
use crate::datastream::DataStream;
use crate::error::Error;
use crate::mdal::MdStat;
use crate::recovery::RecoveryHeader;
use crate::rsrc::log::{OpExt, OpInfo, OpType};
use crate::tagging::{DataState, Ftag, Gctag, FTAG_NAME, GCTAG_NAME, ORIG_FTAG_NAME};

/// Age thresholds steering a walk, unix seconds. Files younger than a
/// threshold are exempt from that class of operation; a zero threshold
/// disables the class entirely (and a fully-zero set short-circuits
/// xattr retrieval for quota-only passes).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Thresholds {
    pub gc: i64,
    pub repack: i64,
    pub rebuild: i64,
    pub cleanup: i64,
}

impl Thresholds {
    pub fn quota_only() -> Self {
        Thresholds::default()
    }

    pub fn full_walk(&self) -> bool {
        self.gc != 0 || self.repack != 0 || self.rebuild != 0
    }
}

/// Aggregate totals of one walk.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WalkerReport {
    pub fileusage: u64,
    pub byteusage: u64,
    pub filecount: u64,
    pub objcount: u64,
    pub bytecount: u64,
    pub streamcount: u64,
    pub delobjs: u64,
    pub delfiles: u64,
    pub delstreams: u64,
    pub volfiles: u64,
    pub rpckfiles: u64,
    pub rpckbytes: u64,
    pub rbldobjs: u64,
    pub rbldbytes: u64,
}

impl WalkerReport {
    pub fn absorb(&mut self, other: &WalkerReport) {
        self.fileusage += other.fileusage;
        self.byteusage += other.byteusage;
        self.filecount += other.filecount;
        self.objcount += other.objcount;
        self.bytecount += other.bytecount;
        self.streamcount += other.streamcount;
        self.delobjs += other.delobjs;
        self.delfiles += other.delfiles;
        self.delstreams += other.delstreams;
        self.volfiles += other.volfiles;
        self.rpckfiles += other.rpckfiles;
        self.rpckbytes += other.rpckbytes;
        self.rbldobjs += other.rbldobjs;
        self.rbldbytes += other.rbldbytes;
    }
}

/// Operation chains produced by one iteration step.
#[derive(Debug, Default)]
pub struct WalkStep {
    pub gc: Vec<OpInfo>,
    pub repack: Vec<OpInfo>,
    pub rebuild: Vec<OpInfo>,
}

impl WalkStep {
    fn is_empty(&self) -> bool {
        self.gc.is_empty() && self.repack.is_empty() && self.rebuild.is_empty()
    }
}

/// Result of opening a walker on a fileno-zero reference.
pub enum WalkerOpen {
    Walker(Box<StreamWalker>),
    /// The stream never got an FTAG (crash between reference creation
    /// and tagging). `cleanup` asks the caller to unlink the reference.
    Incomplete {
        cleanup: bool,
        report: WalkerReport,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FileState {
    Missing,
    Inactive,
    Active,
}

struct Fetched {
    state: FileState,
    /// Navigation FTAG: the one whose stream owns the reference path
    /// being walked (a repacked inode carries tags for two streams).
    ftag: Option<Ftag>,
    gctag: Gctag,
    stval: MdStat,
    /// This walk's view of the file is the pre-repack one; its data
    /// lives in (and is accounted by) a repack stream.
    repacked: bool,
}

fn fetch_file(pos: &Position, reftgt: &str, pull_xattrs: bool) -> crate::Result<Fetched> {
    let missing = || Fetched {
        state: FileState::Missing,
        ftag: None,
        gctag: Gctag::default(),
        stval: MdStat::default(),
        repacked: false,
    };

    if !pull_xattrs {
        let stval = match pos.ctxt().statref(reftgt) {
            Ok(st) => st,
            Err(Error::NotFound(_)) => return Ok(missing()),
            Err(e) => return Err(e),
        };
        let state = if stval.nlink > 1 {
            FileState::Active
        } else {
            FileState::Inactive
        };
        return Ok(Fetched {
            state,
            stval,
            ..missing()
        });
    }

    let handle = match pos.ctxt().openref(reftgt, false, 0) {
        Ok(h) => h,
        Err(Error::NotFound(_)) => return Ok(missing()),
        Err(e) => return Err(e),
    };

    let gctag = match handle.fgetxattr(GCTAG_NAME) {
        Ok(raw) => {
            let text = String::from_utf8(raw)
                .map_err(|_| Error::tag("GCTAG value is not valid UTF-8"))?;
            text.parse()?
        }
        Err(Error::NotFound(_)) => Gctag::default(),
        Err(e) => return Err(e),
    };

    // a repacked inode carries two tags; navigate by the one whose
    // stream owns this reference path
    let basename = reftgt.rsplit('/').next().unwrap_or(reftgt);
    let mut repacked = false;
    let mut dual = false;
    let ftag = match handle.fgetxattr(FTAG_NAME) {
        Ok(raw) => {
            let text = String::from_utf8(raw)
                .map_err(|_| Error::tag("FTAG value is not valid UTF-8"))?;
            let main: Ftag = text.parse()?;
            match handle.fgetxattr(ORIG_FTAG_NAME) {
                Ok(raw) => {
                    let text = String::from_utf8(raw)
                        .map_err(|_| Error::tag("stashed FTAG value is not valid UTF-8"))?;
                    let orig: Ftag = text.parse()?;
                    dual = true;
                    if main.meta_tgt() == basename {
                        Some(main)
                    } else {
                        repacked = true;
                        Some(orig)
                    }
                }
                Err(Error::NotFound(_)) => Some(main),
                Err(e) => return Err(e),
            }
        }
        Err(Error::NotFound(_)) => None,
        Err(e) => return Err(e),
    };

    let stval = handle.fstat()?;
    if let Err(e) = handle.close() {
        log::warn!("Failed to close reference handle \"{}\": {}", reftgt, e);
    }

    // both streams' reference links are baseline; user links beyond
    // that baseline mean the file is active
    let baseline = if dual { 2 } else { 1 };
    let state = if stval.nlink > baseline {
        FileState::Active
    } else {
        FileState::Inactive
    };
    Ok(Fetched {
        state,
        ftag,
        gctag,
        stval,
        repacked,
    })
}

/// Locate (or create) the operation a new target coalesces into,
/// returning its index within the chain.
fn identify_op(chain: &mut Vec<OpInfo>, optype: OpType, ftag: &Ftag) -> usize {
    for (idx, op) in chain.iter().enumerate() {
        let contiguous = match optype {
            OpType::DeleteObj | OpType::Rebuild => ftag.objno == op.ftag.objno + op.count,
            OpType::Repack => ftag.fileno == op.ftag.fileno + op.count,
            OpType::DeleteRef => true,
        };
        if op.optype == optype && contiguous {
            return idx;
        }
    }
    let newop = OpInfo::new(optype, ftag.clone());
    if optype == OpType::DeleteRef {
        // reference deletions execute after the object deletions they
        // depend on
        chain.push(newop);
        chain.len() - 1
    } else {
        chain.insert(0, newop);
        0
    }
}

fn delref_ext(op: &mut OpInfo) -> (&mut u64, &mut bool, &mut bool) {
    match &mut op.ext {
        OpExt::DelRef {
            prev_active_index,
            eos,
            delzero,
        } => (prev_active_index, eos, delzero),
        _ => unreachable!("DEL-REF operations always carry DelRef info"),
    }
}

/// Extend a DELETE-OBJ (or REBUILD) run, verifying contiguity.
fn extend_obj_run(chain: &mut Vec<OpInfo>, optype: OpType, tmptag: &Ftag) -> crate::Result<usize> {
    let idx = identify_op(chain, optype, tmptag);
    let op = &mut chain[idx];
    if op.count + op.ftag.objno != tmptag.objno {
        return Err(Error::inval(format!(
            "{:?} chain at object {} does not reach object {}",
            optype,
            op.ftag.objno + op.count,
            tmptag.objno
        )));
    }
    op.count += 1;
    Ok(idx)
}

/// A stateful iterator over one datastream.
pub struct StreamWalker {
    pos: Position,
    thresh: Thresholds,
    rebuild_loc: Option<Location>,
    report: WalkerReport,
    fileno: u64,
    objno: u64,
    reftable: RefTable,
    stval: MdStat,
    ftag: Ftag,
    gctag: Gctag,
    repacked: bool,
    headerlen: u64,
    gcops: Vec<OpInfo>,
    activefiles: u64,
    activeindex: u64,
    rpckops: Vec<OpInfo>,
    activebytes: u64,
    rbldops: Vec<OpInfo>,
    /// A repacked file references the current object (its vacated data
    /// still sits there).
    repacked_in_obj: bool,
    /// Any GCTAG seen so far noted deletion of object zero.
    delzero_seen: bool,
}

impl StreamWalker {
    /// Open a walker on the fileno-zero reference of a stream.
    pub fn open(
        pos: Position,
        reftgt: &str,
        thresh: Thresholds,
        rebuild_loc: Option<Location>,
    ) -> crate::Result<WalkerOpen> {
        if thresh.rebuild != 0 && rebuild_loc.is_none() {
            return Err(Error::inval(
                "rebuild threshold is set without a rebuild location",
            ));
        }

        let fetched = fetch_file(&pos, reftgt, true)?;
        if fetched.state == FileState::Missing {
            return Err(Error::not_found(format!(
                "initial reference target \"{reftgt}\""
            )));
        }

        let mut report = WalkerReport::default();
        report.filecount += 1;
        report.streamcount += 1;

        let ftag = match fetched.ftag {
            Some(ftag) => ftag,
            None => {
                // no FTAG on file zero: the stream is stillborn
                report.bytecount += fetched.stval.size;
                let mut cleanup = false;
                if fetched.state == FileState::Inactive
                    && thresh.gc != 0
                    && fetched.stval.ctime < thresh.gc
                {
                    report.delfiles += 1;
                    report.delstreams += 1;
                    cleanup = true;
                }
                return Ok(WalkerOpen::Incomplete { cleanup, report });
            }
        };

        let headerlen = RecoveryHeader::new(&ftag.ctag, &ftag.streamid).encoded_len();
        let reftable = RefTable::new(ftag.refbreadth, ftag.refdepth, ftag.refdigits)?;
        let mut walker = StreamWalker {
            pos,
            thresh,
            rebuild_loc,
            report,
            fileno: 0,
            objno: 0,
            reftable,
            stval: fetched.stval,
            ftag,
            gctag: fetched.gctag,
            repacked: fetched.repacked,
            headerlen,
            gcops: Vec::new(),
            activefiles: 0,
            activeindex: 0,
            rpckops: Vec::new(),
            activebytes: 0,
            rbldops: Vec::new(),
            repacked_in_obj: false,
            delzero_seen: false,
        };
        walker.repacked_in_obj = walker.repacked;
        walker.delzero_seen = walker.gctag.delzero;

        let endobj = if walker.repacked {
            walker.objno
        } else {
            DataStream::file_bounds(&walker.ftag, walker.headerlen)?
        };
        let mut eos = walker.ftag.endofstream;
        if walker.ftag.state < DataState::Fin {
            eos = true;
        }
        if walker.gctag.eos {
            eos = true;
        }

        let mut assumeactive = false;
        if fetched.state == FileState::Inactive {
            if walker.thresh.gc != 0 && walker.stval.ctime < walker.thresh.gc {
                if eos {
                    // only GC the initial ref when it is the last one
                    // remaining
                    let idx = identify_op(&mut walker.gcops, OpType::DeleteRef, &walker.ftag);
                    let op = &mut walker.gcops[idx];
                    op.count = 1;
                    let (prev, ext_eos, _) = delref_ext(op);
                    *prev = walker.activeindex;
                    *ext_eos = true;
                    walker.report.delfiles += 1;
                    walker.report.delstreams += 1;
                }
                if (endobj != walker.objno || eos) && !walker.gctag.delzero {
                    // GC every object this file spans
                    let mut tmptag = walker.ftag.clone();
                    let finobj = if eos { endobj + 1 } else { endobj };
                    while tmptag.objno < finobj {
                        extend_obj_run(&mut walker.gcops, OpType::DeleteObj, &tmptag)?;
                        walker.report.delobjs += 1;
                        tmptag.objno += 1;
                    }
                    // a dummy ref-deletion records the del-zero state on
                    // file zero
                    let refcnt = walker.gctag.refcnt;
                    let idx = identify_op(&mut walker.gcops, OpType::DeleteRef, &walker.ftag);
                    let op = &mut walker.gcops[idx];
                    if op.count == 0 && refcnt > 0 {
                        op.count = refcnt;
                        op.ftag.fileno += 1;
                    }
                    let (_, ext_eos, ext_delzero) = delref_ext(op);
                    *ext_delzero = true;
                    *ext_eos = eos;
                }
            } else if walker.stval.ctime >= walker.thresh.gc {
                // deactivated too recently to collect
                walker.report.volfiles += 1;
                assumeactive = true;
            }
        }

        walker.report.bytecount += walker.ftag.bytes;
        if walker.thresh.full_walk() {
            // objcount runs one object ahead until iteration completes
            if !walker.gctag.delzero {
                walker.report.objcount += endobj + 1;
            } else if !eos {
                walker.report.objcount += 1;
            }
        }

        if fetched.state == FileState::Active {
            if !walker.repacked {
                // a repacked file's live data is accounted by the walk
                // of its repack stream
                walker.report.fileusage += 1;
                walker.report.byteusage += walker.ftag.bytes;
                let finobj = if eos { endobj + 1 } else { endobj };
                walker.note_rebuild_candidates(walker.ftag.objno, finobj)?;
                walker.note_repack_candidate(endobj)?;
            }
        }

        if (fetched.state == FileState::Active || assumeactive) && !walker.repacked {
            walker.activefiles += 1;
            walker.activebytes += walker.ftag.bytes;
        }

        walker.objno = endobj;
        Ok(WalkerOpen::Walker(Box::new(walker)))
    }

    /// Advance the walk. Returns operation chains as soon as any are
    /// sealed, or `None` once the stream is exhausted and nothing
    /// remains to dispatch.
    pub fn iterate(&mut self) -> crate::Result<Option<WalkStep>> {
        let repackbytethresh = if self.ftag.objsize > self.headerlen {
            (self.ftag.objsize - self.headerlen) / 2
        } else {
            0
        };
        let mut pullxattrs = self.thresh.full_walk();
        let mut step = WalkStep::default();
        let mut dispatched = false;

        while !self.ftag.endofstream && self.ftag.state >= DataState::Fin {
            // account for any already-collected run recorded on this
            // file
            let mut tgtoffset = 1;
            if self.gctag.refcnt > 0 {
                tgtoffset += self.gctag.refcnt;
                if self.gctag.inprog && self.thresh.gc != 0 {
                    log::info!(
                        "Resuming in-progress deletion of {} references of stream \"{}\"",
                        self.gctag.refcnt,
                        self.ftag.streamid
                    );
                    let mut tmptag = self.ftag.clone();
                    tmptag.fileno += 1;
                    let idx = identify_op(&mut self.gcops, OpType::DeleteRef, &tmptag);
                    let op = &mut self.gcops[idx];
                    if op.count > 0 {
                        if op.ftag.fileno + op.count - 1 != self.fileno {
                            return Err(Error::inval(format!(
                                "active ref deletion does not reach fileno {}",
                                self.fileno
                            )));
                        }
                        op.count += self.gctag.refcnt;
                        let gctag_eos = self.gctag.eos;
                        let (_, ext_eos, _) = delref_ext(op);
                        if gctag_eos {
                            *ext_eos = true;
                        }
                    } else {
                        op.count = self.gctag.refcnt;
                        op.ftag.fileno = self.ftag.fileno + 1;
                        let (activeindex, gctag_eos) = (self.activeindex, self.gctag.eos);
                        let (prev, ext_eos, _) = delref_ext(op);
                        *prev = activeindex;
                        *ext_eos = gctag_eos;
                    }
                    self.report.delfiles += self.gctag.refcnt;
                    // never resume the same run twice
                    self.gctag.inprog = false;
                }
                if self.gctag.eos {
                    log::debug!("GC tag marks end of stream at fileno {}", self.fileno);
                    break;
                }
            }

            // fetch the next reference target
            let mut tmptag = self.ftag.clone();
            tmptag.fileno = self.fileno + tgtoffset;
            let reftgt = self.reftable.rpath_for(&tmptag.meta_tgt());
            let prevdelzero = self.gctag.delzero;
            let fetched = fetch_file(&self.pos, &reftgt, pullxattrs)?;

            if fetched.state == FileState::Missing {
                if self.fileno == self.ftag.fileno && pullxattrs {
                    // this file's xattrs are already in hand and showed
                    // no GCTAG covering the gap
                    if self.ftag.state == DataState::Fin {
                        // writer died between reference creation and
                        // FTAG write: assume end of stream
                        log::warn!(
                            "Datastream break (assumed EOS) at fileno {} of stream \"{}\"",
                            tmptag.fileno,
                            self.ftag.streamid
                        );
                        if self.thresh.gc != 0 {
                            for op in self.gcops.iter_mut() {
                                if op.optype == OpType::DeleteRef {
                                    let (_, ext_eos, _) = delref_ext(op);
                                    *ext_eos = true;
                                }
                            }
                        }
                        self.ftag.endofstream = true;
                        break;
                    }
                    return Err(Error::StreamBreak(tmptag.fileno));
                }

                // pull xattrs from the current file; a GCTAG there
                // likely explains the gap
                tmptag.fileno = self.fileno;
                let reftgt = self.reftable.rpath_for(&tmptag.meta_tgt());
                log::debug!(
                    "Pulling xattrs from fileno {} to explain missing fileno {}",
                    self.fileno,
                    self.fileno + tgtoffset
                );
                let refetched = fetch_file(&self.pos, &reftgt, true)?;
                if refetched.state == FileState::Missing {
                    return Err(Error::not_found(format!(
                        "previous reference target \"{reftgt}\""
                    )));
                }
                match refetched.ftag {
                    Some(ftag) => {
                        self.ftag = ftag;
                        self.gctag = refetched.gctag;
                        self.stval = refetched.stval;
                        self.repacked = refetched.repacked;
                        pullxattrs = true;
                        // restart this iteration with full info
                        continue;
                    }
                    None => {
                        // FTAG-less tail file ends the walk
                        self.report.filecount += 1;
                        self.report.bytecount += refetched.stval.size;
                        self.note_tail_cleanup(&tmptag, refetched.state, refetched.stval.ctime);
                        self.ftag.state = DataState::Init;
                        break;
                    }
                }
            }

            if fetched.ftag.is_none() && pullxattrs {
                // missing FTAG: the stream cannot be walked further
                log::debug!("Reference target \"{}\" lacks an FTAG", reftgt);
                self.report.filecount += 1;
                self.report.bytecount += fetched.stval.size;
                self.note_tail_cleanup(&tmptag, fetched.state, fetched.stval.ctime);
                break;
            }

            let haveftag = fetched.ftag.is_some();
            if let Some(ftag) = fetched.ftag {
                self.ftag = ftag;
            }
            self.gctag = fetched.gctag;
            self.stval = fetched.stval;
            self.repacked = fetched.repacked;
            self.delzero_seen |= self.gctag.delzero;
            pullxattrs = self.thresh.full_walk();

            let mut endobj = self.objno;
            let mut eos = false;
            if haveftag {
                if self.ftag.fileno != self.fileno + tgtoffset {
                    return Err(Error::inval(format!(
                        "FTAG file number {} does not match expected {}",
                        self.ftag.fileno,
                        self.fileno + tgtoffset
                    )));
                }
                endobj = if self.repacked {
                    self.objno
                } else {
                    DataStream::file_bounds(&self.ftag, self.headerlen)?
                };
                eos = self.ftag.endofstream;
                if self.ftag.state < DataState::Fin {
                    eos = true;
                }
                if self.gctag.refcnt > 0 && self.gctag.eos {
                    eos = true;
                }

                // object transition: settle accounts for the object we
                // are leaving
                if self.ftag.objno != self.objno && !self.repacked {
                    if self.thresh.full_walk() {
                        self.report.objcount += 1;
                    }
                    if self.thresh.gc != 0
                        && self.activefiles == 0
                        && (self.objno != 0 || !prevdelzero)
                    {
                        self.delete_prev_object()?;
                    }
                    if let Some(mut ops) = self.flush_repack_ops(repackbytethresh) {
                        step.repack.append(&mut ops);
                        dispatched = true;
                    }
                    if self.thresh.rebuild != 0
                        && self.activefiles > 0
                        && self.stval.ctime < self.thresh.rebuild
                    {
                        let prev_obj = self.objno;
                        self.note_rebuild_candidates(prev_obj, prev_obj + 1)?;
                    }
                    self.activefiles = 0;
                    self.activebytes = 0;
                    self.repacked_in_obj = false;
                    self.objno = self.ftag.objno;
                }
            }

            let mut assumeactive = false;
            if fetched.state == FileState::Inactive {
                if self.thresh.gc != 0 && self.stval.ctime < self.thresh.gc && haveftag {
                    self.plan_file_gc(endobj, eos)?;
                } else if self.stval.ctime >= self.thresh.gc {
                    self.report.volfiles += 1;
                    assumeactive = true;
                }
            }

            self.report.filecount += 1;
            self.report.bytecount += if haveftag {
                self.ftag.bytes
            } else {
                self.stval.size
            };
            if fetched.state == FileState::Active && !self.repacked {
                self.report.fileusage += 1;
                self.report.byteusage += if haveftag {
                    self.ftag.bytes
                } else {
                    self.stval.size
                };
                if haveftag {
                    if self.thresh.rebuild != 0 && self.stval.ctime < self.thresh.rebuild {
                        let finobj = if eos { endobj + 1 } else { endobj };
                        self.note_rebuild_candidates(self.ftag.objno, finobj)?;
                    }
                    self.note_repack_candidate(endobj)?;
                }
            }

            // spanned objects of a chunked file reset the active counts
            if self.objno != endobj {
                self.activefiles = 0;
                self.activebytes = 0;
                self.repacked_in_obj = false;
                if self.thresh.full_walk() {
                    self.report.objcount += endobj - self.objno;
                }
                if !self.rbldops.is_empty() {
                    step.rebuild.append(&mut self.rbldops);
                    dispatched = true;
                }
            }

            if fetched.state == FileState::Active || assumeactive {
                self.activeindex = self.fileno + tgtoffset;
                if !self.repacked {
                    self.activefiles += 1;
                    self.activebytes += if haveftag {
                        self.ftag.bytes
                    } else {
                        self.stval.size
                    };
                }
                // an active file seals any pending deletion run
                if !self.gcops.is_empty() {
                    step.gc.append(&mut self.gcops);
                    dispatched = true;
                }
            }

            self.repacked_in_obj |= self.repacked;
            self.fileno += tgtoffset;
            self.objno = endobj;

            if dispatched {
                log::debug!("Dispatching sealed operation chains at fileno {}", self.fileno);
                return Ok(Some(step));
            }
        }

        // an object whose only remaining references were repacked away
        // holds no live data; sweep it once the stream ends
        if self.thresh.gc != 0
            && self.activefiles == 0
            && self.repacked_in_obj
            && !(self.objno == 0 && self.delzero_seen)
        {
            let mut tmptag = self.ftag.clone();
            tmptag.objno = self.objno;
            extend_obj_run(&mut self.gcops, OpType::DeleteObj, &tmptag)?;
            self.report.delobjs += 1;
            self.repacked_in_obj = false;
            // flag the sweep on the last survivor so it runs only once
            let mut survivor = self.ftag.clone();
            survivor.fileno = self.activeindex;
            let idx = identify_op(&mut self.gcops, OpType::DeleteRef, &survivor);
            let op = &mut self.gcops[idx];
            if op.count == 0 {
                op.ftag.fileno = self.activeindex;
            }
            let objno = self.objno;
            let (_, _, ext_delzero) = delref_ext(op);
            if objno == 0 {
                *ext_delzero = true;
            }
        }

        // end of stream: hand over whatever remains
        step.gc.append(&mut self.gcops);
        step.rebuild.append(&mut self.rbldops);
        if let Some(mut ops) = self.flush_repack_ops(repackbytethresh) {
            step.repack.append(&mut ops);
        }
        if step.is_empty() {
            Ok(None)
        } else {
            Ok(Some(step))
        }
    }

    /// Close the walk, yielding the final report and whether iteration
    /// genuinely reached the end of the stream.
    pub fn close(self) -> (WalkerReport, bool) {
        let complete = self.gcops.is_empty()
            && self.rpckops.is_empty()
            && self.rbldops.is_empty()
            && (self.ftag.endofstream
                || (self.gctag.refcnt > 0 && self.gctag.eos)
                || self.ftag.state < DataState::Fin);
        if !complete {
            log::warn!(
                "Streamwalker for \"{}\" closed before iteration completion",
                self.ftag.streamid
            );
        }
        (self.report, complete)
    }

    pub fn report(&self) -> &WalkerReport {
        &self.report
    }

    //   -------------   INTERNALS    -------------

    /// Plan GC for an FTAG-less or broken tail file.
    fn note_tail_cleanup(&mut self, tmptag: &Ftag, state: FileState, ctime: i64) {
        if state == FileState::Inactive && self.thresh.gc != 0 && ctime < self.thresh.gc {
            let refcnt = self.gctag.refcnt;
            let activeindex = self.activeindex;
            let idx = identify_op(&mut self.gcops, OpType::DeleteRef, tmptag);
            let op = &mut self.gcops[idx];
            let was_empty = op.count == 0;
            if was_empty {
                op.ftag.fileno = tmptag.fileno;
            }
            op.count += 1 + refcnt;
            let (prev, ext_eos, _) = delref_ext(op);
            if was_empty {
                *prev = activeindex;
            }
            *ext_eos = true;
            self.report.delfiles += 1;
        } else {
            self.report.volfiles += 1;
        }
    }

    /// Emit a deletion for the object the walk is leaving, and note
    /// del-zero on the stream head when that object is object zero.
    fn delete_prev_object(&mut self) -> crate::Result<()> {
        log::debug!(
            "Planning deletion of object {} of stream \"{}\"",
            self.objno,
            self.ftag.streamid
        );
        let mut tmptag = self.ftag.clone();
        tmptag.objno = self.objno;
        extend_obj_run(&mut self.gcops, OpType::DeleteObj, &tmptag)?;
        self.report.delobjs += 1;

        if self.objno == 0 {
            // record deletion of object zero on the ref-del op, without
            // growing its count
            let idx = identify_op(&mut self.gcops, OpType::DeleteRef, &self.ftag);
            let (_, _, ext_delzero) = delref_ext(&mut self.gcops[idx]);
            *ext_delzero = true;
        }
        Ok(())
    }

    /// Plan GC of an inactive file: its reference plus any objects only
    /// it spans.
    fn plan_file_gc(&mut self, endobj: u64, eos: bool) -> crate::Result<()> {
        let refcnt = self.gctag.refcnt;
        let activeindex = self.activeindex;
        let fileno = self.ftag.fileno;
        let idx = identify_op(&mut self.gcops, OpType::DeleteRef, &self.ftag);
        let op = &mut self.gcops[idx];
        if op.count > 0 {
            op.count += 1 + refcnt;
            let (prev, ext_eos, _) = delref_ext(op);
            if *prev != activeindex {
                return Err(Error::inval(format!(
                    "ref deletion previous-active index {} does not match {}",
                    prev, activeindex
                )));
            }
            if !*ext_eos {
                *ext_eos = eos;
            }
        } else {
            op.ftag.fileno = fileno;
            op.count = 1 + refcnt;
            let (prev, ext_eos, _) = delref_ext(op);
            *prev = activeindex;
            *ext_eos = eos;
        }
        self.report.delfiles += 1;

        if self.repacked {
            return Ok(());
        }

        let mut delzero_hit = false;
        if endobj != self.objno {
            let mut tmptag = self.ftag.clone();
            // the first object only goes when no other file shares it
            if self.activefiles == 0 && (self.ftag.objno != 0 || !self.gctag.delzero) {
                extend_obj_run(&mut self.gcops, OpType::DeleteObj, &tmptag)?;
                self.report.delobjs += 1;
                if tmptag.objno == 0 {
                    delzero_hit = true;
                }
            }
            // interior spanned objects belong to this file alone
            tmptag.objno += 1;
            while tmptag.objno < endobj {
                extend_obj_run(&mut self.gcops, OpType::DeleteObj, &tmptag)?;
                self.report.delobjs += 1;
                tmptag.objno += 1;
            }
        }

        // the final object of the stream goes too once nothing shares it
        if eos && (endobj != self.objno || self.activefiles == 0) {
            let mut tmptag = self.ftag.clone();
            tmptag.objno = endobj;
            extend_obj_run(&mut self.gcops, OpType::DeleteObj, &tmptag)?;
            self.report.delobjs += 1;
            if endobj == 0 {
                delzero_hit = true;
            }
        }

        if delzero_hit {
            let idx = identify_op(&mut self.gcops, OpType::DeleteRef, &self.ftag);
            let (_, _, ext_delzero) = delref_ext(&mut self.gcops[idx]);
            *ext_delzero = true;
        }
        Ok(())
    }

    /// Queue rebuild operations for objects `[first, finobj)` matching
    /// the rebuild location.
    fn note_rebuild_candidates(&mut self, first: u64, finobj: u64) -> crate::Result<()> {
        if self.thresh.rebuild == 0 || self.stval.ctime >= self.thresh.rebuild {
            return Ok(());
        }
        let loc_tgt = match self.rebuild_loc {
            Some(loc) => loc,
            None => return Ok(()),
        };
        let ds = self.pos.repo().datascheme.clone();
        let mut tmptag = self.ftag.clone();
        tmptag.objno = first;
        while tmptag.objno < finobj {
            let (_objname, _erasure, location) = DataStream::obj_target(&tmptag, &ds);
            if loc_tgt.covers(&location) {
                extend_obj_run(&mut self.rbldops, OpType::Rebuild, &tmptag)?;
                self.report.rbldobjs += 1;
                self.report.rbldbytes += self.ftag.bytes;
            }
            tmptag.objno += 1;
        }
        Ok(())
    }

    /// Note an active, settled file as a repack candidate. Only files
    /// confined to a single object can repack, and a file already
    /// serving as a GC-skip survivor stays put: its GCTAG is bound to
    /// this stream's geometry and must not follow the inode into a
    /// repack stream.
    fn note_repack_candidate(&mut self, endobj: u64) -> crate::Result<()> {
        if self.thresh.repack == 0
            || self.stval.ctime >= self.thresh.repack
            || endobj != self.ftag.objno
            || self.ftag.state != DataState::Comp
            || self.gctag.refcnt > 0
            || self.gctag.eos
            || self.gctag.delzero
        {
            return Ok(());
        }
        let bytes = self.ftag.bytes;
        let idx = identify_op(&mut self.rpckops, OpType::Repack, &self.ftag);
        let op = &mut self.rpckops[idx];
        op.count += 1;
        if let OpExt::Repack { totalbytes } = &mut op.ext {
            *totalbytes += bytes;
        }
        Ok(())
    }

    /// At an object transition (or walk end), hand back the gathered
    /// repack candidates when the object was sparse, or discard them
    /// when it carried enough live data.
    fn flush_repack_ops(&mut self, repackbytethresh: u64) -> Option<Vec<OpInfo>> {
        if self.rpckops.is_empty() {
            return None;
        }
        if repackbytethresh == 0 || self.activebytes >= repackbytethresh {
            log::debug!(
                "Discarding repack candidates: {} active bytes around object {}",
                self.activebytes,
                self.objno
            );
            self.rpckops.clear();
            return None;
        }
        let ops = mem::take(&mut self.rpckops);
        for op in &ops {
            self.report.rpckfiles += op.count;
            if let OpExt::Repack { totalbytes } = &op.ext {
                self.report.rpckbytes += totalbytes;
            }
        }
        Some(ops)
    }
}
