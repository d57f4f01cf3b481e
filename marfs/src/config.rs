//! In-memory repository / namespace tree and the client position type.
//!
//! The tree is arena-shaped: repositories own a flat `Vec<Namespace>` and
//! every parent/child/ghost-target relation is an integer index, so the
//! namespace/repository graph carries no reference cycles. The whole
//! config is shared behind an `Arc`; positions hold a clone of it plus a
//! private MDAL context.

use std::fmt;
use std::sync::Arc;

use modular_bitfield::prelude::*;

use crate::dal::{Dal, Erasure, Location};
use crate::error::Error;
use crate::mdal::{Mdal, MdalCtxt};

/// Permission bits of one namespace access class.
///
/// Bit layout matches the on-disk byte: `{rmeta=0x1, wmeta=0x2,
/// rdata=0x10, wdata=0x20, trunc=0x40, unlink=0x80}` with two reserved
/// bits.
#[bitfield]
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct NsPerms {
    pub read_meta: bool,
    pub write_meta: bool,
    #[skip]
    __: B2,
    pub read_data: bool,
    pub write_data: bool,
    pub truncate_data: bool,
    pub unlink_data: bool,
}

impl NsPerms {
    /// Full access.
    pub fn rw() -> Self {
        NsPerms::new()
            .with_read_meta(true)
            .with_write_meta(true)
            .with_read_data(true)
            .with_write_data(true)
            .with_truncate_data(true)
            .with_unlink_data(true)
    }

    /// Metadata + data read access only.
    pub fn ro() -> Self {
        NsPerms::new().with_read_meta(true).with_read_data(true)
    }

    pub fn as_byte(&self) -> u8 {
        self.into_bytes()[0]
    }

    pub fn from_byte(value: u8) -> Self {
        NsPerms::from_bytes([value])
    }
}

/// Access class a position was established under.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PosMode {
    Interactive,
    Batch,
}

/// Content-addressed layout of a namespace's reference tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RefTable {
    breadth: u32,
    depth: u32,
    digits: u32,
}

const FNV_OFFSET: u64 = 0xcbf29ce484222325;
const FNV_PRIME: u64 = 0x100000001b3;

fn fnv1a(bytes: &[u8]) -> u64 {
    let mut hash = FNV_OFFSET;
    for b in bytes {
        hash ^= *b as u64;
        hash = hash.wrapping_mul(FNV_PRIME);
    }
    hash
}

impl RefTable {
    pub fn new(breadth: u32, depth: u32, digits: u32) -> crate::Result<Self> {
        if breadth == 0 || depth == 0 || digits == 0 {
            return Err(Error::inval("reference table dimensions must be non-zero"));
        }
        if 10u64.checked_pow(digits).map(|max| breadth as u64 > max) != Some(false) {
            return Err(Error::inval(format!(
                "reference breadth {breadth} does not fit in {digits} digits"
            )));
        }
        if (breadth as u64).checked_pow(depth).is_none()
            || (breadth as u64).pow(depth) > 1_000_000
        {
            return Err(Error::inval(format!(
                "reference tree of {breadth}^{depth} directories is unmanageable"
            )));
        }
        Ok(RefTable {
            breadth,
            depth,
            digits,
        })
    }

    pub fn breadth(&self) -> u32 {
        self.breadth
    }

    pub fn depth(&self) -> u32 {
        self.depth
    }

    pub fn digits(&self) -> u32 {
        self.digits
    }

    /// Reference directory a file id hashes into, without the final name
    /// component.
    pub fn refdir_for(&self, fileid: &str) -> String {
        let mut hash = fnv1a(fileid.as_bytes());
        let mut parts = Vec::with_capacity(self.depth as usize);
        for _ in 0..self.depth {
            let level = hash % self.breadth as u64;
            parts.push(format!("{:0width$}", level, width = self.digits as usize));
            hash = fnv1a(&hash.to_le_bytes());
        }
        parts.join("/")
    }

    /// Full reference path of a file id.
    pub fn rpath_for(&self, fileid: &str) -> String {
        format!("{}/{}", self.refdir_for(fileid), fileid)
    }

    /// Every leaf reference directory, in scan order.
    pub fn refdirs(&self) -> Vec<String> {
        let mut dirs = vec![String::new()];
        for _ in 0..self.depth {
            let mut next = Vec::with_capacity(dirs.len() * self.breadth as usize);
            for prefix in &dirs {
                for level in 0..self.breadth {
                    let part = format!("{:0width$}", level, width = self.digits as usize);
                    if prefix.is_empty() {
                        next.push(part);
                    } else {
                        next.push(format!("{prefix}/{part}"));
                    }
                }
            }
            dirs = next;
        }
        dirs
    }
}

/// Data half of a repository: object store, protection and packing shape.
#[derive(Clone)]
pub struct DataScheme {
    pub dal: Arc<dyn Dal>,
    pub protection: Erasure,
    /// Maximum count of files packed into one object. Zero disables
    /// packing entirely.
    pub objfiles: u64,
    /// Target object size in bytes, recovery info included.
    pub objsize: u64,
    /// Placement dimensions objects are scattered over.
    pub pods: u16,
    pub caps: u16,
    pub scatters: u16,
    /// DAL operation latency bound, enforced by the DAL layer itself.
    pub latency_ms: u64,
}

impl fmt::Debug for DataScheme {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DataScheme")
            .field("protection", &self.protection)
            .field("objfiles", &self.objfiles)
            .field("objsize", &self.objsize)
            .finish_non_exhaustive()
    }
}

impl DataScheme {
    /// Placement of an object, derived from its name.
    pub fn location_of(&self, objname: &str) -> Location {
        let hash = fnv1a(objname.as_bytes());
        let pods = self.pods.max(1) as u64;
        let caps = self.caps.max(1) as u64;
        let scatters = self.scatters.max(1) as u64;
        Location {
            pod: (hash % pods) as i32,
            cap: ((hash / pods) % caps) as i32,
            scatter: ((hash / (pods * caps)) % scatters) as i32,
        }
    }
}

/// Metadata half of a repository.
#[derive(Clone)]
pub struct MetaScheme {
    pub mdal: Arc<dyn Mdal>,
    pub reftable: RefTable,
    /// Allow READ handles onto zero-data / special files to fall back to
    /// direct metadata reads.
    pub directread: bool,
}

impl fmt::Debug for MetaScheme {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MetaScheme")
            .field("reftable", &self.reftable)
            .field("directread", &self.directread)
            .finish_non_exhaustive()
    }
}

/// A logical mount subtree.
#[derive(Debug, Clone)]
pub struct Namespace {
    pub name: String,
    /// Namespace id string: the full path from the repository root.
    pub idstr: String,
    pub iperms: NsPerms,
    pub bperms: NsPerms,
    /// Byte quota, zero meaning unlimited.
    pub dquota: u64,
    /// File-count quota, zero meaning unlimited.
    pub fquota: u64,
    /// Index of the parent namespace within the owning repository.
    pub parent: Option<usize>,
    pub subspaces: Vec<usize>,
    /// Ghost namespaces name a target whose data storage they share.
    pub ghost_target: Option<usize>,
}

impl Namespace {
    pub fn new(name: &str, idstr: &str) -> Self {
        Namespace {
            name: name.to_string(),
            idstr: idstr.to_string(),
            iperms: NsPerms::rw(),
            bperms: NsPerms::rw(),
            dquota: 0,
            fquota: 0,
            parent: None,
            subspaces: Vec::new(),
            ghost_target: None,
        }
    }

    pub fn is_ghost(&self) -> bool {
        self.ghost_target.is_some()
    }
}

/// A storage tier: one DAL + MDAL pairing and its namespace tree.
#[derive(Debug)]
pub struct Repo {
    pub name: String,
    pub datascheme: DataScheme,
    pub metascheme: MetaScheme,
    pub namespaces: Vec<Namespace>,
}

/// Index of one namespace within a config.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NsRef {
    pub repo: usize,
    pub ns: usize,
}

/// The complete configuration tree.
#[derive(Debug)]
pub struct MarfsConfig {
    pub repos: Vec<Repo>,
}

impl MarfsConfig {
    /// Validate and seal a config. Ghost targets must name non-ghost
    /// namespaces within the same repository.
    pub fn new(repos: Vec<Repo>) -> crate::Result<Arc<Self>> {
        for repo in &repos {
            if repo.namespaces.is_empty() {
                return Err(Error::inval(format!(
                    "repository \"{}\" has no namespaces",
                    repo.name
                )));
            }
            for ns in &repo.namespaces {
                if let Some(target) = ns.ghost_target {
                    let tgt = repo.namespaces.get(target).ok_or_else(|| {
                        Error::inval(format!(
                            "ghost \"{}\" names a missing target namespace",
                            ns.idstr
                        ))
                    })?;
                    if tgt.is_ghost() {
                        return Err(Error::NsCannotBeTarget);
                    }
                }
            }
        }
        Ok(Arc::new(MarfsConfig { repos }))
    }

    pub fn repo(&self, nsref: NsRef) -> &Repo {
        &self.repos[nsref.repo]
    }

    pub fn ns(&self, nsref: NsRef) -> &Namespace {
        &self.repos[nsref.repo].namespaces[nsref.ns]
    }

    /// Every namespace of every repository, in enumeration order.
    pub fn namespaces(&self) -> Vec<NsRef> {
        let mut out = Vec::new();
        for (repo, r) in self.repos.iter().enumerate() {
            for ns in 0..r.namespaces.len() {
                out.push(NsRef { repo, ns });
            }
        }
        out
    }

    /// Look a namespace up by its id string.
    pub fn find_namespace(&self, idstr: &str) -> Option<NsRef> {
        for (repo, r) in self.repos.iter().enumerate() {
            for (ns, n) in r.namespaces.iter().enumerate() {
                if n.idstr == idstr {
                    return Some(NsRef { repo, ns });
                }
            }
        }
        None
    }

    /// Create every namespace root and reference directory that does not
    /// exist yet. Run once at deployment, harmless afterwards.
    pub fn verify(&self) -> crate::Result<()> {
        for nsref in self.namespaces() {
            let repo = self.repo(nsref);
            let ns = self.ns(nsref);
            match repo.metascheme.mdal.create_namespace(&ns.idstr) {
                Ok(()) | Err(Error::Exists(_)) => {}
                Err(e) => return Err(e),
            }
            let ctxt = repo.metascheme.mdal.new_ctxt(&ns.idstr)?;
            for refdir in repo.metascheme.reftable.refdirs() {
                ctxt.createrefdir(&refdir)?;
            }
        }
        Ok(())
    }

    /// Whether a link/rename between two namespaces is permitted: only a
    /// ghost and its own target may exchange entries.
    pub fn check_ns_link(&self, a: NsRef, b: NsRef) -> crate::Result<()> {
        if a == b {
            return Ok(());
        }
        if a.repo == b.repo {
            let na = self.ns(a);
            let nb = self.ns(b);
            if na.ghost_target == Some(b.ns) || nb.ghost_target == Some(a.ns) {
                return Ok(());
            }
        }
        Err(Error::CrossNamespace)
    }

    /// Establish a client position within a namespace. This is the only
    /// privileged step: it opens the namespace MDAL root. Subsequent
    /// operations are confined to the returned context.
    pub fn establish_position(
        self: &Arc<Self>,
        nsref: NsRef,
        mode: PosMode,
    ) -> crate::Result<Position> {
        let repo = self.repo(nsref);
        let ns = self.ns(nsref);
        let ctxt = repo.metascheme.mdal.new_ctxt(&ns.idstr)?;
        let perms = match mode {
            PosMode::Interactive => ns.iperms,
            PosMode::Batch => ns.bperms,
        };
        Ok(Position {
            cfg: self.clone(),
            ns: nsref,
            depth: 0,
            perms,
            ctxt,
        })
    }

    /// Duplicate a position, cloning its MDAL context.
    pub fn duplicate_position(&self, pos: &Position) -> crate::Result<Position> {
        Ok(Position {
            cfg: pos.cfg.clone(),
            ns: pos.ns,
            depth: pos.depth,
            perms: pos.perms,
            ctxt: pos.ctxt.dup()?,
        })
    }

    /// Release a position and its MDAL context.
    pub fn abandon_position(&self, pos: Position) {
        drop(pos);
    }
}

/// A client's foothold in a namespace: the triple every operation
/// carries.
pub struct Position {
    pub(crate) cfg: Arc<MarfsConfig>,
    pub ns: NsRef,
    pub depth: u32,
    pub perms: NsPerms,
    pub(crate) ctxt: Box<dyn MdalCtxt>,
}

impl fmt::Debug for Position {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Position")
            .field("ns", &self.ns)
            .field("depth", &self.depth)
            .finish_non_exhaustive()
    }
}

impl Position {
    pub fn config(&self) -> &Arc<MarfsConfig> {
        &self.cfg
    }

    pub fn repo(&self) -> &Repo {
        // self-index through the owned Arc keeps the borrow local
        &self.cfg.repos[self.ns.repo]
    }

    pub fn namespace(&self) -> &Namespace {
        &self.cfg.repos[self.ns.repo].namespaces[self.ns.ns]
    }

    pub fn ctxt(&self) -> &dyn MdalCtxt {
        self.ctxt.as_ref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::test_repo;

    #[test]
    fn perm_byte_layout() {
        assert_eq!(NsPerms::rw().as_byte(), 0xf3);
        assert_eq!(NsPerms::ro().as_byte(), 0x11);
        let perms = NsPerms::from_byte(0x21);
        assert!(perms.read_meta());
        assert!(perms.write_data());
        assert!(!perms.write_meta());
    }

    #[test]
    fn reftable_paths_are_stable_and_bounded() {
        let table = RefTable::new(3, 2, 2).unwrap();
        let p1 = table.rpath_for("ctag|stream|0");
        let p2 = table.rpath_for("ctag|stream|0");
        assert_eq!(p1, p2);
        assert!(p1.ends_with("/ctag|stream|0"));

        let dirs = table.refdirs();
        assert_eq!(dirs.len(), 9);
        assert!(dirs.contains(&"00/02".to_string()));
        let refdir = table.refdir_for("ctag|stream|0");
        assert!(dirs.contains(&refdir));
    }

    #[test]
    fn reftable_rejects_bad_dimensions() {
        assert!(RefTable::new(0, 2, 2).is_err());
        assert!(RefTable::new(100, 2, 1).is_err());
        assert!(RefTable::new(100, 4, 3).is_err());
    }

    #[test]
    fn ghost_target_must_not_be_a_ghost() {
        let mut repo = test_repo("pool", 1 << 20, 4);
        let mut ghost = Namespace::new("ghost", "/pool/ghost");
        ghost.ghost_target = Some(1);
        repo.namespaces.push(ghost);
        let mut double = Namespace::new("double", "/pool/double");
        double.ghost_target = Some(2);
        repo.namespaces.push(double);
        assert!(matches!(
            MarfsConfig::new(vec![repo]),
            Err(Error::NsCannotBeTarget)
        ));
    }

    #[test]
    fn cross_ns_link_rules() {
        let mut repo = test_repo("pool", 1 << 20, 4);
        let mut ghost = Namespace::new("ghost", "/pool/ghost");
        ghost.ghost_target = Some(1);
        repo.namespaces.push(ghost);
        let cfg = MarfsConfig::new(vec![repo]).unwrap();

        let root = NsRef { repo: 0, ns: 0 };
        let sub = NsRef { repo: 0, ns: 1 };
        let ghost = NsRef { repo: 0, ns: 2 };
        assert!(cfg.check_ns_link(sub, sub).is_ok());
        assert!(cfg.check_ns_link(ghost, sub).is_ok());
        assert!(cfg.check_ns_link(sub, ghost).is_ok());
        assert!(matches!(
            cfg.check_ns_link(root, sub),
            Err(Error::CrossNamespace)
        ));
    }

    #[test]
    fn position_lifecycle() {
        let mut repo = test_repo("pool", 1 << 20, 4);
        repo.namespaces[1].iperms = NsPerms::ro();
        let cfg = MarfsConfig::new(vec![repo]).unwrap();
        cfg.verify().unwrap();
        let nsref = cfg.find_namespace("/pool/sub").unwrap();
        let pos = cfg.establish_position(nsref, PosMode::Batch).unwrap();
        let dup = cfg.duplicate_position(&pos).unwrap();
        assert_eq!(dup.ns, pos.ns);
        cfg.abandon_position(dup);
        cfg.abandon_position(pos);

        // each access class carries its own permission byte
        let ipos = cfg.establish_position(nsref, PosMode::Interactive).unwrap();
        assert!(!ipos.perms.write_data());
        let bpos = cfg.establish_position(nsref, PosMode::Batch).unwrap();
        assert!(bpos.perms.write_data());
    }
}
