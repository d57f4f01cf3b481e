//! Reference-directory scanning and operation execution: the hands of
//! the resource manager. Scanning classifies entries into work items;
//! execution applies planned operation chains through the resource log,
//! honoring the GCTAG in-progress protocol so every step is idempotent
//! and crash-resumable.

use crate::config::{Position, RefTable};
use crate::datastream::{DataStream, StreamType, Whence};
use crate::error::Error;
use crate::mdal::MdalScanner;
use crate::rsrc::log::{OpExt, OpInfo, OpType, ResourceLog};
use crate::rsrc::repack::RepackStreamer;
use crate::tagging::{Ftag, Gctag, MetaKind, Rtag, FTAG_NAME, GCTAG_NAME, ORIG_FTAG_NAME, TGT_FTAG_NAME};

/// One unit of consumer work, produced by reference-directory scans.
#[derive(Debug)]
pub enum WorkItem {
    /// Walk the datastream anchored at this fileno-zero reference.
    Stream { rpath: String },
    /// Rebuild the object a marker names.
    RebuildMarker {
        rpath: String,
        ftag: Box<Ftag>,
        rtag: Option<Rtag>,
    },
    /// Clean up (or leave) an in-flight repack marker.
    RepackMarker { rpath: String },
}

fn parent_dir(path: &str) -> &str {
    match path.rfind('/') {
        Some(idx) => &path[..idx],
        None => "",
    }
}

/// Pull the next interesting entry from a reference-directory scanner.
/// Returns `None` once the directory is exhausted. Entries too recent
/// to judge (younger than `recent_thresh`) are skipped silently.
pub fn process_refdir(
    pos: &Position,
    scanner: &mut dyn MdalScanner,
    refdir: &str,
    recent_thresh: i64,
) -> crate::Result<Option<WorkItem>> {
    while let Some(name) = scanner.next_entry()? {
        if name.starts_with('.') {
            continue;
        }
        let rpath = format!("{refdir}/{name}");
        let (number, kind) = Ftag::parse_meta_info(&name);
        match kind {
            MetaKind::File => {
                if number == 0 {
                    return Ok(Some(WorkItem::Stream { rpath }));
                }
                // interior files are reached by their stream's walker
            }
            MetaKind::RebuildMarker => {
                let handle = match pos.ctxt().openref(&rpath, false, 0) {
                    Ok(h) => h,
                    // raced against a concurrent rebuild completion
                    Err(Error::NotFound(_)) => continue,
                    Err(e) => return Err(e),
                };
                let ftag: Ftag = match handle.fgetxattr(FTAG_NAME) {
                    Ok(raw) => String::from_utf8(raw)
                        .map_err(|_| Error::tag("FTAG value is not valid UTF-8"))?
                        .parse()?,
                    Err(Error::NotFound(_)) => {
                        // a marker should gain its tags promptly; give a
                        // young one time
                        let stval = handle.fstat()?;
                        if stval.ctime >= recent_thresh {
                            continue;
                        }
                        return Err(Error::tag(format!(
                            "rebuild marker \"{rpath}\" never received an FTAG"
                        )));
                    }
                    Err(e) => return Err(e),
                };
                let rtag = match handle.fgetxattr(&Rtag::xattr_name(number)) {
                    Ok(raw) => Some(
                        String::from_utf8(raw)
                            .map_err(|_| Error::tag("RTAG value is not valid UTF-8"))?
                            .parse::<Rtag>()?,
                    ),
                    Err(Error::NotFound(_)) => None,
                    Err(e) => return Err(e),
                };
                let mut ftag = ftag;
                ftag.objno = number;
                return Ok(Some(WorkItem::RebuildMarker {
                    rpath,
                    ftag: Box::new(ftag),
                    rtag,
                }));
            }
            MetaKind::RepackMarker => {
                return Ok(Some(WorkItem::RepackMarker { rpath }));
            }
            MetaKind::Unknown => {
                log::warn!("Unrecognized reference entry \"{}\"", rpath);
            }
        }
    }
    Ok(None)
}

/// Tag a damaged object for rebuild: create its marker file carrying the
/// FTAG and the per-block health hint. Returns the marker's reference
/// path.
pub fn mark_for_rebuild(pos: &Position, ftag: &Ftag, rtag: &Rtag) -> crate::Result<String> {
    let reftable = RefTable::new(ftag.refbreadth, ftag.refdepth, ftag.refdigits)?;
    let marker = ftag.rebuild_marker();
    let rpath = reftable.rpath_for(&marker);
    let mut handle = match pos.ctxt().openref(&rpath, true, 0o600) {
        Ok(h) => h,
        // an existing marker means the object is already tagged
        Err(Error::Exists(_)) => return Ok(rpath),
        Err(e) => return Err(e),
    };
    handle.fsetxattr(FTAG_NAME, ftag.to_string().as_bytes())?;
    handle.fsetxattr(&Rtag::xattr_name(ftag.objno), rtag.to_string().as_bytes())?;
    handle.close()?;
    log::info!("Marked object {} of stream \"{}\" for rebuild", ftag.objno, ftag.streamid);
    Ok(rpath)
}

/// Execute one chain of planned operations, recording starts and
/// completions through the resource log. A failed operation marks the
/// remainder of its chain skipped; only critical internal errors fail
/// the call itself.
pub fn execute_chain(
    pos: &Position,
    mut ops: Vec<OpInfo>,
    rlog: &mut ResourceLog,
    repack: &RepackStreamer,
    ctag: &str,
) -> crate::Result<Vec<OpInfo>> {
    if ops.is_empty() {
        return Ok(ops);
    }
    rlog.record_ops(&ops)?;
    let mut abort = false;
    for op in ops.iter_mut() {
        op.start = false;
        if abort {
            op.errval = Error::OpSkipped.errno();
            rlog.process_op(op)?;
            continue;
        }
        let result = match op.optype {
            OpType::DeleteObj => exec_delete_obj(pos, op),
            OpType::DeleteRef => exec_delete_ref(pos, op),
            OpType::Rebuild => exec_rebuild(pos, op),
            OpType::Repack => exec_repack(pos, op, repack, ctag),
        };
        op.errval = match result {
            Ok(()) => 0,
            Err(e) => {
                log::error!(
                    "{:?} operation at fileno {} objno {} failed: {}",
                    op.optype,
                    op.ftag.fileno,
                    op.ftag.objno,
                    e
                );
                e.errno()
            }
        };
        if rlog.process_op(op)? < 0 {
            abort = true;
        }
    }
    Ok(ops)
}

fn exec_delete_obj(pos: &Position, op: &OpInfo) -> crate::Result<()> {
    let ds = &pos.repo().datascheme;
    let mut tmptag = op.ftag.clone();
    for idx in 0..op.count {
        tmptag.objno = op.ftag.objno + idx;
        let (objname, _erasure, location) = DataStream::obj_target(&tmptag, ds);
        log::debug!("Deleting object \"{}\"", objname);
        match ds.dal.delete(&objname, location) {
            // an earlier, interrupted pass may already have removed it
            Ok(()) | Err(Error::NotFound(_)) => {}
            Err(e) => return Err(e),
        }
    }
    Ok(())
}

fn read_gctag(handle: &dyn crate::mdal::MdalFile) -> crate::Result<Gctag> {
    match handle.fgetxattr(GCTAG_NAME) {
        Ok(raw) => String::from_utf8(raw)
            .map_err(|_| Error::tag("GCTAG value is not valid UTF-8"))?
            .parse(),
        Err(Error::NotFound(_)) => Ok(Gctag::default()),
        Err(e) => Err(e),
    }
}

fn exec_delete_ref(pos: &Position, op: &OpInfo) -> crate::Result<()> {
    let (prev_active, eos, delzero) = match &op.ext {
        OpExt::DelRef {
            prev_active_index,
            eos,
            delzero,
        } => (*prev_active_index, *eos, *delzero),
        _ => return Err(Error::inval("DEL-REF operation lacks its extended info")),
    };
    let reftable = RefTable::new(op.ftag.refbreadth, op.ftag.refdepth, op.ftag.refdigits)?;

    if op.count == 0 {
        // a bookkeeping-only record: fold the flags into the target's
        // GCTAG
        let rpath = reftable.rpath_for(&op.ftag.meta_tgt());
        let mut handle = pos.ctxt().openref(&rpath, false, 0)?;
        let mut gctag = read_gctag(handle.as_ref())?;
        gctag.delzero |= delzero;
        gctag.eos |= eos;
        handle.fsetxattr(GCTAG_NAME, gctag.to_string().as_bytes())?;
        return handle.close();
    }

    if op.ftag.fileno == 0 {
        // the whole stream is going; no survivor needs a GCTAG
        let mut tmptag = op.ftag.clone();
        for idx in 0..op.count {
            tmptag.fileno = op.ftag.fileno + idx;
            let rpath = reftable.rpath_for(&tmptag.meta_tgt());
            log::debug!("Unlinking reference \"{}\"", rpath);
            match pos.ctxt().unlinkref(&rpath) {
                Ok(()) | Err(Error::NotFound(_)) => {}
                Err(e) => return Err(e),
            }
        }
        return Ok(());
    }

    // standard case: the last survivor records the skip, in-progress
    // first so a crash mid-deletion is re-driven
    let mut survivor = op.ftag.clone();
    survivor.fileno = prev_active;
    let survivor_rpath = reftable.rpath_for(&survivor.meta_tgt());
    let mut handle = pos.ctxt().openref(&survivor_rpath, false, 0)?;
    let old = read_gctag(handle.as_ref())?;
    let mut gctag = Gctag {
        refcnt: op.ftag.fileno + op.count - 1 - prev_active,
        eos: eos || old.eos,
        delzero: delzero || old.delzero,
        inprog: true,
    };
    handle.fsetxattr(GCTAG_NAME, gctag.to_string().as_bytes())?;

    let mut tmptag = op.ftag.clone();
    for idx in 0..op.count {
        tmptag.fileno = op.ftag.fileno + idx;
        let rpath = reftable.rpath_for(&tmptag.meta_tgt());
        log::debug!("Unlinking reference \"{}\"", rpath);
        match pos.ctxt().unlinkref(&rpath) {
            Ok(()) | Err(Error::NotFound(_)) => {}
            Err(e) => return Err(e),
        }
    }

    gctag.inprog = false;
    handle.fsetxattr(GCTAG_NAME, gctag.to_string().as_bytes())?;
    handle.close()
}

fn exec_rebuild(pos: &Position, op: &OpInfo) -> crate::Result<()> {
    let ds = &pos.repo().datascheme;
    let (marker, rtag) = match &op.ext {
        OpExt::Rebuild { marker, rtag } => (marker.clone(), rtag.clone()),
        _ => (None, None),
    };
    let hint = rtag.as_ref().and_then(|r| r.state.as_ref());

    let mut tmptag = op.ftag.clone();
    for idx in 0..op.count {
        tmptag.objno = op.ftag.objno + idx;
        let (objname, erasure, location) = DataStream::obj_target(&tmptag, ds);
        log::debug!("Rebuilding object \"{}\"", objname);
        let mut remaining = ds.dal.rebuild(&objname, location, erasure, hint)?;
        if remaining > 0 {
            // residual damage warrants exactly one retry
            remaining = ds.dal.rebuild(&objname, location, erasure, hint)?;
        }
        if remaining > 0 {
            return Err(Error::RebuildIncomplete(remaining));
        }
    }

    if let Some(marker_rpath) = marker {
        match pos.ctxt().unlinkref(&marker_rpath) {
            Ok(()) | Err(Error::NotFound(_)) => {}
            Err(e) => return Err(e),
        }
    }
    Ok(())
}

fn exec_repack(
    pos: &Position,
    op: &OpInfo,
    repack: &RepackStreamer,
    ctag: &str,
) -> crate::Result<()> {
    let reftable = RefTable::new(op.ftag.refbreadth, op.ftag.refdepth, op.ftag.refdigits)?;
    let (slot, mut stream) = repack.checkout();
    let mut markers = Vec::new();

    let result = (|| -> crate::Result<()> {
        let mut tmptag = op.ftag.clone();
        for idx in 0..op.count {
            tmptag.fileno = op.ftag.fileno + idx;
            let orig_rpath = reftable.rpath_for(&tmptag.meta_tgt());

            // the marker makes an interrupted repack discoverable
            let marker_rpath =
                format!("{}/{}", parent_dir(&orig_rpath), tmptag.repack_marker());
            match pos.ctxt().linkref_to_ref(&orig_rpath, &marker_rpath) {
                Ok(()) | Err(Error::Exists(_)) => {}
                Err(e) => return Err(e),
            }
            markers.push(marker_rpath);

            // pull the live bytes out of the sparse object
            let mut rstream = None;
            DataStream::open_ref(&mut rstream, StreamType::Read, &orig_rpath, pos)?;
            let mut rst = rstream.take().unwrap();
            let total = rst.file_tag()?.availbytes;
            let mut data = vec![0u8; usize::try_from(total)?];
            let mut read = 0;
            rst.seek(0, Whence::Set)?;
            while read < data.len() {
                let got = rst.read(&mut data[read..])?;
                if got == 0 {
                    return Err(Error::Io(std::io::Error::new(
                        std::io::ErrorKind::UnexpectedEof,
                        "repack source ended early",
                    )));
                }
                read += got;
            }
            rst.close()?;

            // append into the repack stream
            DataStream::repack_create(&mut stream, &orig_rpath, pos, ctag)?;
            let st = stream.as_mut().unwrap();
            st.write(&data)?;
            log::debug!(
                "Repacked {} bytes of \"{}\" into stream \"{}\"",
                data.len(),
                orig_rpath,
                st.stream_id()
            );
        }

        // seal the stream so every staged target tag promotes
        if let Some(st) = stream.take() {
            st.close()?;
        }
        Ok(())
    })();

    match result {
        Ok(()) => {
            repack.checkin(slot, None);
            for marker in markers {
                match pos.ctxt().unlinkref(&marker) {
                    Ok(()) | Err(Error::NotFound(_)) => {}
                    Err(e) => return Err(e),
                }
            }
            Ok(())
        }
        Err(e) => {
            // leave the markers: a later cleanup pass rolls the files
            // back
            if let Some(st) = stream.take() {
                let _ = st.release();
            }
            repack.checkin(slot, None);
            Err(e)
        }
    }
}

/// Inspect a repack marker. A marker older than the cleanup threshold
/// whose repack never completed is rolled back (staging tags removed,
/// repack-stream link withdrawn); a completed one is simply dropped.
pub fn process_repack_marker(
    pos: &Position,
    marker_rpath: &str,
    cleanup_thresh: i64,
) -> crate::Result<()> {
    let stval = match pos.ctxt().statref(marker_rpath) {
        Ok(st) => st,
        Err(Error::NotFound(_)) => return Ok(()),
        Err(e) => return Err(e),
    };
    if cleanup_thresh == 0 || stval.ctime >= cleanup_thresh {
        // young enough that the repack may still be running
        return Ok(());
    }

    let mut handle = pos.ctxt().openref(marker_rpath, false, 0)?;
    let main: Option<Ftag> = match handle.fgetxattr(FTAG_NAME) {
        Ok(raw) => Some(
            String::from_utf8(raw)
                .map_err(|_| Error::tag("FTAG value is not valid UTF-8"))?
                .parse()?,
        ),
        Err(Error::NotFound(_)) => None,
        Err(e) => return Err(e),
    };
    let orig: Option<Ftag> = match handle.fgetxattr(ORIG_FTAG_NAME) {
        Ok(raw) => Some(
            String::from_utf8(raw)
                .map_err(|_| Error::tag("stashed FTAG value is not valid UTF-8"))?
                .parse()?,
        ),
        Err(Error::NotFound(_)) => None,
        Err(e) => return Err(e),
    };

    let promoted = match (&main, &orig) {
        (Some(main), Some(orig)) => main.streamid != orig.streamid,
        _ => false,
    };
    if !promoted {
        // roll the interrupted repack back
        log::info!("Rolling back interrupted repack at \"{}\"", marker_rpath);
        if let Ok(raw) = handle.fgetxattr(TGT_FTAG_NAME) {
            if let Ok(text) = String::from_utf8(raw) {
                if let Ok(tgt) = text.parse::<Ftag>() {
                    let table = RefTable::new(tgt.refbreadth, tgt.refdepth, tgt.refdigits)?;
                    let tgt_rpath = table.rpath_for(&tgt.meta_tgt());
                    match pos.ctxt().unlinkref(&tgt_rpath) {
                        Ok(()) | Err(Error::NotFound(_)) => {}
                        Err(e) => return Err(e),
                    }
                }
            }
            match handle.fremovexattr(TGT_FTAG_NAME) {
                Ok(()) | Err(Error::NotFound(_)) => {}
                Err(e) => return Err(e),
            }
        }
        match handle.fremovexattr(ORIG_FTAG_NAME) {
            Ok(()) | Err(Error::NotFound(_)) => {}
            Err(e) => return Err(e),
        }
    }
    handle.close()?;

    match pos.ctxt().unlinkref(marker_rpath) {
        Ok(()) | Err(Error::NotFound(_)) => Ok(()),
        Err(e) => Err(e),
    }
}
