//! Data Abstraction Layer: the contract the core consumes for
//! erasure-coded object I/O. Erasure coding, block checksumming and block
//! placement all live behind these traits; the core only names objects,
//! moves bytes and asks for rebuilds.

use std::fmt;

pub mod mem;

/// Erasure protection profile of a data object: `N` data blocks, `E`
/// erasure blocks, starting block offset `O`, and the part size each
/// block is split into.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Erasure {
    pub n: u16,
    pub e: u16,
    pub o: u16,
    pub partsz: u64,
}

impl Erasure {
    pub fn stripe_width(&self) -> usize {
        (self.n + self.e) as usize
    }
}

/// Physical placement of an object. A negative component in a rebuild
/// target acts as a wildcard.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Location {
    pub pod: i32,
    pub cap: i32,
    pub scatter: i32,
}

impl Location {
    /// Whether `other` falls inside this (possibly wildcarded) target.
    pub fn covers(&self, other: &Location) -> bool {
        (self.pod < 0 || self.pod == other.pod)
            && (self.cap < 0 || self.cap == other.cap)
            && (self.scatter < 0 || self.scatter == other.scatter)
    }
}

impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "p{}-c{}-s{}", self.pod, self.cap, self.scatter)
    }
}

/// Per-block health of one object stripe, as reported by a verification
/// or rebuild pass. `true` means the block is known good.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct StripeState {
    pub versz: u64,
    pub blocksz: u64,
    pub totsz: u64,
    pub meta_status: Vec<bool>,
    pub data_status: Vec<bool>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DalMode {
    /// Read the full object content.
    Read,
    /// Write a fresh object.
    Write,
    /// Reconstruct damaged blocks in place.
    Rebuild,
}

/// An erasure context, one per repository data scheme.
pub trait Dal: Send + Sync + fmt::Debug {
    fn open(
        &self,
        objname: &str,
        loc: Location,
        erasure: Erasure,
        mode: DalMode,
    ) -> crate::Result<Box<dyn DalObject>>;

    fn delete(&self, objname: &str, loc: Location) -> crate::Result<()>;

    /// Byte length of the stored object.
    fn stat(&self, objname: &str, loc: Location) -> crate::Result<u64>;

    /// Reconstruct damaged blocks. `hint` seeds known-good block state so
    /// a resumed rebuild can skip verified blocks. Returns the number of
    /// blocks still damaged afterwards; zero means full success. Callers
    /// retry a non-zero result at most once.
    fn rebuild(
        &self,
        objname: &str,
        loc: Location,
        erasure: Erasure,
        hint: Option<&StripeState>,
    ) -> crate::Result<u32>;
}

/// An open object handle.
pub trait DalObject: Send {
    fn read(&mut self, buf: &mut [u8]) -> crate::Result<usize>;
    fn write(&mut self, buf: &[u8]) -> crate::Result<usize>;
    fn seek(&mut self, offset: u64) -> crate::Result<u64>;
    /// Commit the object. Written data is not visible to readers until
    /// close succeeds.
    fn close(self: Box<Self>) -> crate::Result<()>;
    /// Discard the object without committing written data. Never fails on
    /// an already-broken handle.
    fn abort(self: Box<Self>) -> crate::Result<()>;
}
