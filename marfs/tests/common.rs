#![allow(dead_code)]
//! Shared scaffolding: a sandboxed single-repo config over the
//! in-memory drivers, plus datastream helpers the scenarios lean on.

use std::sync::Arc;

use marfs::config::{
    DataScheme, MarfsConfig, MetaScheme, Namespace, NsRef, PosMode, Position, RefTable, Repo,
};
use marfs::dal::mem::MemDal;
use marfs::dal::Erasure;
use marfs::datastream::{DataStream, StreamType};
use marfs::mdal::mem::MemMdal;
use marfs::mdal::MdalCtxt as _;
use marfs::tagging::Ftag;

pub struct Env {
    pub cfg: Arc<MarfsConfig>,
    pub mdal: MemMdal,
    pub dal: MemDal,
    pub nsref: NsRef,
}

pub fn env(objsize: u64, objfiles: u64) -> Env {
    let mdal = MemMdal::new();
    let dal = MemDal::new();
    let mut root = Namespace::new("pool", "/pool");
    root.subspaces.push(1);
    let mut sub = Namespace::new("batch", "/pool/batch");
    sub.parent = Some(0);
    let repo = Repo {
        name: "pool".to_string(),
        datascheme: DataScheme {
            dal: Arc::new(dal.clone()),
            protection: Erasure {
                n: 10,
                e: 2,
                o: 0,
                partsz: 1024,
            },
            objfiles,
            objsize,
            pods: 4,
            caps: 4,
            scatters: 4,
            latency_ms: 0,
        },
        metascheme: MetaScheme {
            mdal: Arc::new(mdal.clone()),
            reftable: RefTable::new(3, 2, 2).unwrap(),
            directread: true,
        },
        namespaces: vec![root, sub],
    };
    let cfg = MarfsConfig::new(vec![repo]).unwrap();
    cfg.verify().unwrap();
    let nsref = cfg.find_namespace("/pool/batch").unwrap();
    Env {
        cfg,
        mdal,
        dal,
        nsref,
    }
}

impl Env {
    pub fn position(&self) -> Position {
        self.cfg
            .establish_position(self.nsref, PosMode::Batch)
            .unwrap()
    }

    pub fn ns_path(&self) -> String {
        self.cfg.ns(self.nsref).idstr.clone()
    }

    /// Create one stream holding the given files, returning their FTAGs
    /// as of close.
    pub fn write_stream(&self, ctag: &str, files: &[(&str, usize)]) -> Vec<Ftag> {
        let pos = self.position();
        let mut stream = None;
        for (path, len) in files {
            DataStream::create(&mut stream, path, &pos, 0o644, ctag).unwrap();
            let st = stream.as_mut().unwrap();
            st.write(&pattern(*len)).unwrap();
        }
        stream.take().unwrap().close().unwrap();

        files
            .iter()
            .map(|(path, _)| self.file_tag(path))
            .collect()
    }

    /// FTAG of a user-visible file.
    pub fn file_tag(&self, path: &str) -> Ftag {
        let pos = self.position();
        let mut stream = None;
        DataStream::open(&mut stream, StreamType::Read, path, &pos).unwrap();
        let st = stream.take().unwrap();
        let ftag = st.file_tag().unwrap().clone();
        st.close().unwrap();
        ftag
    }

    /// Reference path of a user-visible file.
    pub fn rpath_of(&self, path: &str) -> String {
        DataStream::gen_rpath(&self.file_tag(path)).unwrap()
    }

    pub fn read_back(&self, path: &str) -> Vec<u8> {
        let pos = self.position();
        let mut stream = None;
        DataStream::open(&mut stream, StreamType::Read, path, &pos).unwrap();
        let mut st = stream.take().unwrap();
        let mut out = Vec::new();
        let mut buf = [0u8; 512];
        loop {
            let n = st.read(&mut buf).unwrap();
            if n == 0 {
                break;
            }
            out.extend_from_slice(&buf[..n]);
        }
        st.close().unwrap();
        out
    }

    pub fn unlink(&self, path: &str) {
        let pos = self.position();
        pos.ctxt().unlink(path).unwrap();
    }
}

pub fn pattern(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}

pub fn now() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap()
        .as_secs() as i64
}

/// A temp directory for resource logs, fresh per test.
pub fn log_root(name: &str) -> std::path::PathBuf {
    let dir = std::env::temp_dir().join(format!("marfs-test-{name}-{}", std::process::id()));
    let _ = std::fs::remove_dir_all(&dir);
    std::fs::create_dir_all(&dir).unwrap();
    dir
}
