//! Shared test scaffolding: a sandboxed config over the in-memory
//! drivers, mirroring how deployments construct `MarfsConfig`
//! programmatically.

use std::sync::Arc;

use crate::config::{
    DataScheme, MarfsConfig, MetaScheme, Namespace, NsRef, PosMode, Position, RefTable, Repo,
};
use crate::dal::mem::MemDal;
use crate::dal::Erasure;
use crate::mdal::mem::MemMdal;

pub(crate) struct TestEnv {
    pub cfg: Arc<MarfsConfig>,
    pub mdal: MemMdal,
    pub dal: MemDal,
    pub nsref: NsRef,
}

pub(crate) fn test_repo_with(
    name: &str,
    objsize: u64,
    objfiles: u64,
    mdal: MemMdal,
    dal: MemDal,
) -> Repo {
    let mut root = Namespace::new(name, &format!("/{name}"));
    root.subspaces.push(1);
    let mut sub = Namespace::new("sub", &format!("/{name}/sub"));
    sub.parent = Some(0);
    Repo {
        name: name.to_string(),
        datascheme: DataScheme {
            dal: Arc::new(dal),
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
            mdal: Arc::new(mdal),
            reftable: RefTable::new(3, 2, 2).unwrap(),
            directread: true,
        },
        namespaces: vec![root, sub],
    }
}

pub(crate) fn test_repo(name: &str, objsize: u64, objfiles: u64) -> Repo {
    test_repo_with(name, objsize, objfiles, MemMdal::new(), MemDal::new())
}

/// A single-repo sandbox, verified and ready for positions.
pub(crate) fn test_env(objsize: u64, objfiles: u64) -> TestEnv {
    let mdal = MemMdal::new();
    let dal = MemDal::new();
    let repo = test_repo_with("pool", objsize, objfiles, mdal.clone(), dal.clone());
    let cfg = MarfsConfig::new(vec![repo]).unwrap();
    cfg.verify().unwrap();
    let nsref = cfg.find_namespace("/pool/sub").unwrap();
    TestEnv {
        cfg,
        mdal,
        dal,
        nsref,
    }
}

impl TestEnv {
    pub fn position(&self) -> Position {
        self.cfg
            .establish_position(self.nsref, PosMode::Batch)
            .unwrap()
    }

    pub fn ns_path(&self) -> String {
        self.cfg.ns(self.nsref).idstr.clone()
    }
}
