//! Streamwalker scenarios: interior-file collection, crash-resumed
//! deletions, whole-stream teardown, datastream breaks, and the
//! reconstruction-conservation property.

mod common;

use common::{env, log_root, now, pattern};

use marfs::datastream::DataStream;
use marfs::error::Error;
use marfs::mdal::{MdalCtxt as _, MdalFile as _};
use marfs::recovery::Recovery;
use marfs::rsrc::log::{LogMode, OpType, ResourceLog};
use marfs::rsrc::process::execute_chain;
use marfs::rsrc::repack::RepackStreamer;
use marfs::rsrc::walker::{StreamWalker, Thresholds, WalkStep, WalkerOpen, WalkerReport};
use marfs::tagging::{Gctag, DataState, GCTAG_NAME, FTAG_NAME};

fn gc_thresholds() -> Thresholds {
    // a future threshold makes every existing file old enough
    Thresholds {
        gc: now() + 120,
        repack: 0,
        rebuild: 0,
        cleanup: 0,
    }
}

/// Walk a stream to completion, executing every dispatched chain.
fn walk_and_execute(
    env: &common::Env,
    rpath0: &str,
    thresh: Thresholds,
    logname: &str,
) -> (WalkerReport, bool) {
    let pos = env.position();
    let mut rlog = ResourceLog::init(
        &log_root(logname).join("resourcelog-0"),
        LogMode::Modify,
    )
    .unwrap();
    let repack = RepackStreamer::new();
    let walk_pos = env.position();
    match StreamWalker::open(walk_pos, rpath0, thresh, None).unwrap() {
        WalkerOpen::Incomplete { report, .. } => (report, true),
        WalkerOpen::Walker(mut walker) => {
            while let Some(WalkStep { gc, repack: rp, rebuild }) = walker.iterate().unwrap() {
                execute_chain(&pos, gc, &mut rlog, &repack, "RMAN").unwrap();
                execute_chain(&pos, rp, &mut rlog, &repack, "RMAN").unwrap();
                execute_chain(&pos, rebuild, &mut rlog, &repack, "RMAN").unwrap();
            }
            assert_eq!(rlog.summary().errors, 0);
            rlog.term().unwrap();
            repack.complete().unwrap();
            walker.close()
        }
    }
}

fn gctag_of(env: &common::Env, rpath: &str) -> Option<Gctag> {
    let pos = env.position();
    let handle = pos.ctxt().openref(rpath, false, 0).unwrap();
    match handle.fgetxattr(GCTAG_NAME) {
        Ok(raw) => Some(String::from_utf8(raw).unwrap().parse().unwrap()),
        Err(_) => None,
    }
}

#[test_log::test]
fn interior_file_gc() {
    // one file per object, so file N maps onto object N
    let e = env(1 << 20, 1);
    let names = ["f0", "f1", "f2", "f3", "f4"];
    let files: Vec<(&str, usize)> = names.iter().map(|n| (*n, 1024)).collect();
    let tags = e.write_stream("CL", &files);
    let objnames: Vec<String> = tags
        .iter()
        .map(|t| t.object_tgt())
        .collect();
    assert_eq!(e.dal.object_count(), 5);

    e.unlink("f2");
    e.unlink("f4");

    let rpath0 = e.rpath_of("f0");
    let (report, complete) = walk_and_execute(&e, &rpath0, gc_thresholds(), "interior");
    assert!(complete);
    assert_eq!(report.fileusage, 3);
    assert_eq!(report.byteusage, 3 * 1024);
    assert_eq!(report.filecount, 5);
    assert_eq!(report.objcount, 5);
    assert_eq!(report.delobjs, 2);
    assert_eq!(report.delfiles, 2);
    assert_eq!(report.volfiles, 0);

    // objects 2 and 4 are gone, the rest survive
    for (idx, objname) in objnames.iter().enumerate() {
        let present = e.dal.object_bytes(objname).is_some();
        assert_eq!(present, idx != 2 && idx != 4, "object {idx}");
    }
    // the deleted runs are recorded on their surviving predecessors
    let skip1 = gctag_of(&e, &DataStream::gen_rpath(&tags[1]).unwrap()).unwrap();
    assert_eq!(skip1.refcnt, 1);
    assert!(!skip1.eos);
    assert!(!skip1.inprog);
    let skip3 = gctag_of(&e, &DataStream::gen_rpath(&tags[3]).unwrap()).unwrap();
    assert_eq!(skip3.refcnt, 1);
    assert!(skip3.eos);

    // the survivors still read back intact
    assert_eq!(e.read_back("f0"), pattern(1024));
    assert_eq!(e.read_back("f3"), pattern(1024));

    // a second pass finds nothing more to do
    let (report, complete) = walk_and_execute(&e, &rpath0, gc_thresholds(), "interior2");
    assert!(complete);
    assert_eq!(report.delobjs, 0);
    assert_eq!(report.delfiles, 0);
    assert_eq!(report.fileusage, 3);
    assert_eq!(report.byteusage, 3 * 1024);
}

#[test_log::test]
fn crash_resumed_deletion() {
    let e = env(1 << 20, 1);
    let files: Vec<(&str, usize)> = ["g0", "g1", "g2", "g3"]
        .iter()
        .map(|n| (*n, 512))
        .collect();
    let tags = e.write_stream("CL", &files);

    // simulate a GC run that died mid-deletion: refs 1 and 2 already
    // unlinked, the in-progress flag still set on their survivor
    e.unlink("g1");
    e.unlink("g2");
    let pos = e.position();
    for tag in &tags[1..3] {
        pos.ctxt()
            .unlinkref(&DataStream::gen_rpath(tag).unwrap())
            .unwrap();
    }
    let rpath0 = e.rpath_of("g0");
    let inflight = Gctag {
        refcnt: 2,
        eos: false,
        delzero: false,
        inprog: true,
    };
    let mut handle = pos.ctxt().openref(&rpath0, false, 0).unwrap();
    handle
        .fsetxattr(GCTAG_NAME, inflight.to_string().as_bytes())
        .unwrap();
    handle.close().unwrap();

    // the next pass re-emits the deletion and clears the flag
    let (report, complete) = walk_and_execute(&e, &rpath0, gc_thresholds(), "resume");
    assert!(complete);
    assert_eq!(report.delfiles, 2);
    let resumed = gctag_of(&e, &rpath0).unwrap();
    assert_eq!(resumed.refcnt, 2);
    assert!(!resumed.inprog);

    // idempotent: nothing further on a rerun
    let (report, _) = walk_and_execute(&e, &rpath0, gc_thresholds(), "resume2");
    assert_eq!(report.delfiles, 0);
}

#[test_log::test]
fn whole_stream_gc_takes_two_passes() {
    let e = env(1 << 20, 1);
    let tags = e.write_stream("CL", &[("h0", 256), ("h1", 256)]);
    e.unlink("h0");
    e.unlink("h1");
    let rpath0 = DataStream::gen_rpath(&tags[0]).unwrap();

    // first pass: every object goes, file zero stays behind as the
    // stream anchor carrying the del-zero note
    let (report, complete) = walk_and_execute(&e, &rpath0, gc_thresholds(), "whole1");
    assert!(complete);
    assert_eq!(report.delobjs, 2);
    assert_eq!(report.delfiles, 1);
    assert_eq!(e.dal.object_count(), 0);
    let anchor = gctag_of(&e, &rpath0).unwrap();
    assert!(anchor.delzero);
    assert!(anchor.eos);
    assert_eq!(anchor.refcnt, 1);

    // second pass: the anchor itself is collected
    let (report, complete) = walk_and_execute(&e, &rpath0, gc_thresholds(), "whole2");
    assert!(complete);
    assert_eq!(report.delfiles, 1);
    assert_eq!(report.delstreams, 1);
    assert_eq!(e.mdal.ref_count(&e.ns_path()), 0);
}

#[test_log::test]
fn volatile_files_block_gc() {
    let e = env(1 << 20, 1);
    e.write_stream("CL", &[("v0", 128), ("v1", 128)]);
    e.unlink("v1");

    // a past threshold makes every ctime "too recent"
    let thresh = Thresholds {
        gc: now() - 10_000,
        repack: 0,
        rebuild: 0,
        cleanup: 0,
    };
    let rpath0 = e.rpath_of("v0");
    let (report, complete) = walk_and_execute(&e, &rpath0, thresh, "volatile");
    assert!(complete);
    assert_eq!(report.delfiles, 0);
    assert_eq!(report.delobjs, 0);
    assert_eq!(report.volfiles, 1);
    assert_eq!(e.dal.object_count(), 2);
}

#[test_log::test]
fn datastream_break_paths() {
    let e = env(1 << 20, 1);
    let tags = e.write_stream("CL", &[("b0", 128), ("b1", 128)]);
    let pos = e.position();

    // lose file 1's reference outright
    pos.ctxt()
        .unlinkref(&DataStream::gen_rpath(&tags[1]).unwrap())
        .unwrap();
    let rpath0 = DataStream::gen_rpath(&tags[0]).unwrap();

    // a COMP predecessor makes the gap a hard inconsistency
    let walk_pos = e.position();
    let mut walker = match StreamWalker::open(walk_pos, &rpath0, gc_thresholds(), None).unwrap() {
        WalkerOpen::Walker(w) => w,
        WalkerOpen::Incomplete { .. } => panic!("walker failed to open"),
    };
    assert!(matches!(walker.iterate(), Err(Error::StreamBreak(1))));

    // a FIN predecessor means the writer died mid-append: assumed EOS
    let mut tag0 = tags[0].clone();
    tag0.state = DataState::Fin;
    tag0.availbytes = 0;
    tag0.readable = false;
    tag0.writable = true;
    let mut handle = pos.ctxt().openref(&rpath0, false, 0).unwrap();
    handle
        .fsetxattr(FTAG_NAME, tag0.to_string().as_bytes())
        .unwrap();
    handle.close().unwrap();

    let (report, complete) = walk_and_execute(&e, &rpath0, Thresholds::quota_only(), "break");
    assert!(complete);
    assert_eq!(report.filecount, 1);
}

#[test_log::test]
fn stillborn_stream_cleanup() {
    let e = env(1 << 20, 4);
    let pos = e.position();
    // a reference that never received its FTAG
    pos.ctxt()
        .openref("00/00/CL|lost|0", true, 0o600)
        .unwrap()
        .close()
        .unwrap();

    let walk_pos = e.position();
    match StreamWalker::open(walk_pos, "00/00/CL|lost|0", gc_thresholds(), None).unwrap() {
        WalkerOpen::Incomplete { cleanup, report } => {
            assert!(cleanup);
            assert_eq!(report.delstreams, 1);
        }
        WalkerOpen::Walker(_) => panic!("stillborn stream produced a walker"),
    }
}

#[test_log::test]
fn reconstruction_conserves_every_byte() {
    // chunking plus packing in one stream
    let e = env(4096, 4);
    let files = [("r0", 700usize), ("r1", 9000), ("r2", 300), ("r3", 64)];
    let tags = e.write_stream("CL", &files);

    // walk every object of the stream through the recovery codec
    let endobj = DataStream::file_bounds(
        tags.last().unwrap(),
        marfs::recovery::RecoveryHeader::new(&tags[0].ctag, &tags[0].streamid).encoded_len(),
    )
    .unwrap();
    let mut recovered: std::collections::HashMap<String, Vec<u8>> = Default::default();
    let mut scan: Option<Recovery> = None;
    for objno in 0..=endobj {
        let mut tmptag = tags[0].clone();
        tmptag.objno = objno;
        let object = e
            .dal
            .object_bytes(&tmptag.object_tgt())
            .expect("every stream object exists");
        match scan.as_mut() {
            None => scan = Some(Recovery::new(&object).unwrap()),
            Some(scan) => scan.continue_with(&object).unwrap(),
        }
        let scanner = scan.as_mut().unwrap();
        while let Some((finfo, range)) = scanner.next_file() {
            recovered
                .entry(finfo.path.clone())
                .or_default()
                .extend_from_slice(&object[range]);
        }
    }

    // every written byte is recoverable from the raw objects alone
    for (path, len) in files {
        assert_eq!(recovered.get(path).map(Vec::len), Some(len), "{path}");
        assert_eq!(recovered[path], pattern(len), "{path}");
    }
    let total_recovered: usize = recovered.values().map(Vec::len).sum();
    let total_written: usize = files.iter().map(|(_, len)| len).sum();
    assert_eq!(total_recovered, total_written);
}

#[test_log::test]
fn gc_of_chunked_interior_file() {
    // file c1 spans several objects; collecting it must take its
    // interior objects while the shared boundary objects survive
    let e = env(4096, 4);
    let tags = e.write_stream("CL", &[("c0", 500), ("c1", 12000), ("c2", 500)]);
    e.unlink("c1");

    let rpath0 = DataStream::gen_rpath(&tags[0]).unwrap();
    let (report, complete) = walk_and_execute(&e, &rpath0, gc_thresholds(), "chunked");
    assert!(complete);
    assert!(report.delobjs >= 2, "interior objects collected");
    assert_eq!(report.delfiles, 1);

    // the packed neighbors remain readable
    assert_eq!(e.read_back("c0"), pattern(500));
    assert_eq!(e.read_back("c2"), pattern(500));
}

#[test]
fn walker_requires_location_for_rebuild_walks() {
    let e = env(1 << 20, 4);
    e.write_stream("CL", &[("x0", 64)]);
    let rpath0 = e.rpath_of("x0");
    let thresh = Thresholds {
        gc: 0,
        repack: 0,
        rebuild: now() + 120,
        cleanup: 0,
    };
    let pos = e.position();
    assert!(matches!(
        StreamWalker::open(pos, &rpath0, thresh, None),
        Err(Error::InvalidArgument(_))
    ));
}

#[test]
fn op_chains_coalesce_contiguous_objects() {
    let e = env(4096, 1);
    // a chunked file alone in its stream: deletion plans one op whose
    // count covers the whole contiguous object range
    let tags = e.write_stream("CL", &[("solo", 10000)]);
    e.unlink("solo");
    let rpath0 = DataStream::gen_rpath(&tags[0]).unwrap();

    let walk_pos = e.position();
    let mut walker = match StreamWalker::open(walk_pos, &rpath0, gc_thresholds(), None).unwrap() {
        WalkerOpen::Walker(w) => w,
        WalkerOpen::Incomplete { .. } => panic!("walker failed to open"),
    };
    let mut objdel_ops = Vec::new();
    while let Some(step) = walker.iterate().unwrap() {
        objdel_ops.extend(step.gc.into_iter().filter(|op| op.optype == OpType::DeleteObj));
    }
    assert_eq!(objdel_ops.len(), 1);
    let total_objects = e.dal.object_count() as u64;
    assert_eq!(objdel_ops[0].count, total_objects);
    assert_eq!(objdel_ops[0].ftag.objno, 0);
}
