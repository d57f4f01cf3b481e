//! In-memory MDAL driver. Each namespace is a pair of path maps (user
//! tree and reference tree) over a shared inode table, so hardlinks
//! between reference and user paths behave like their POSIX counterparts:
//! link counts, ctime updates, and inode survival while handles remain
//! open.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Arc, Mutex};

use time::OffsetDateTime;

use super::{FileTimes, MdStat, Mdal, MdalCtxt, MdalFile, MdalScanner};
use crate::error::Error;

fn now() -> i64 {
    OffsetDateTime::now_utc().unix_timestamp()
}

#[derive(Debug, Default)]
struct Inode {
    data: Vec<u8>,
    xattrs: BTreeMap<String, Vec<u8>>,
    nlink: u32,
    open: u32,
    mode: u32,
    atime: i64,
    mtime: i64,
    ctime: i64,
}

#[derive(Debug, Default)]
struct NsState {
    next_ino: u64,
    inodes: HashMap<u64, Inode>,
    user: BTreeMap<String, u64>,
    refs: BTreeMap<String, u64>,
    refdirs: BTreeSet<String>,
    data_usage: u64,
    inode_usage: u64,
}

impl NsState {
    fn alloc(&mut self, mode: u32) -> u64 {
        let ino = self.next_ino;
        self.next_ino += 1;
        let ts = now();
        self.inodes.insert(
            ino,
            Inode {
                nlink: 1,
                mode,
                atime: ts,
                mtime: ts,
                ctime: ts,
                ..Default::default()
            },
        );
        ino
    }

    fn drop_link(&mut self, ino: u64) {
        if let Some(inode) = self.inodes.get_mut(&ino) {
            inode.nlink = inode.nlink.saturating_sub(1);
            inode.ctime = now();
            if inode.nlink == 0 && inode.open == 0 {
                self.inodes.remove(&ino);
            }
        }
    }

    fn stat_of(&self, ino: u64) -> crate::Result<MdStat> {
        let inode = self
            .inodes
            .get(&ino)
            .ok_or_else(|| Error::not_found("stale inode"))?;
        Ok(MdStat {
            size: inode.data.len() as u64,
            nlink: inode.nlink,
            mode: inode.mode,
            atime: inode.atime,
            mtime: inode.mtime,
            ctime: inode.ctime,
        })
    }
}

#[derive(Debug, Default)]
struct MemMdalState {
    namespaces: HashMap<String, NsState>,
}

impl MemMdalState {
    fn ns(&self, ns_path: &str) -> crate::Result<&NsState> {
        self.namespaces
            .get(ns_path)
            .ok_or_else(|| Error::not_found(format!("namespace \"{ns_path}\"")))
    }

    fn ns_mut(&mut self, ns_path: &str) -> crate::Result<&mut NsState> {
        self.namespaces
            .get_mut(ns_path)
            .ok_or_else(|| Error::not_found(format!("namespace \"{ns_path}\"")))
    }
}

/// Shared in-memory metadata store.
#[derive(Debug, Default, Clone)]
pub struct MemMdal {
    state: Arc<Mutex<MemMdalState>>,
}

impl MemMdal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Test hook: backdate the ctime of a reference file so GC threshold
    /// checks see it as old.
    pub fn set_ref_ctime(&self, ns_path: &str, rpath: &str, ctime: i64) -> crate::Result<()> {
        let mut state = self.state.lock().unwrap();
        let ns = state.ns_mut(ns_path)?;
        let ino = *ns
            .refs
            .get(rpath)
            .ok_or_else(|| Error::not_found(format!("reference \"{rpath}\"")))?;
        ns.inodes.get_mut(&ino).unwrap().ctime = ctime;
        Ok(())
    }

    /// Test hook: count of live reference files in a namespace.
    pub fn ref_count(&self, ns_path: &str) -> usize {
        let state = self.state.lock().unwrap();
        state.ns(ns_path).map(|ns| ns.refs.len()).unwrap_or(0)
    }
}

impl Mdal for MemMdal {
    fn new_ctxt(&self, ns_path: &str) -> crate::Result<Box<dyn MdalCtxt>> {
        let state = self.state.lock().unwrap();
        state.ns(ns_path)?;
        Ok(Box::new(MemCtxt {
            state: self.state.clone(),
            ns_path: ns_path.to_string(),
        }))
    }

    fn create_namespace(&self, ns_path: &str) -> crate::Result<()> {
        let mut state = self.state.lock().unwrap();
        if state.namespaces.contains_key(ns_path) {
            return Err(Error::Exists(format!("namespace \"{ns_path}\"")));
        }
        state.namespaces.insert(ns_path.to_string(), NsState::default());
        Ok(())
    }

    fn destroy_namespace(&self, ns_path: &str) -> crate::Result<()> {
        let mut state = self.state.lock().unwrap();
        let ns = state.ns(ns_path)?;
        if !ns.user.is_empty() || !ns.refs.is_empty() {
            return Err(Error::inval(format!("namespace \"{ns_path}\" is not empty")));
        }
        state.namespaces.remove(ns_path);
        Ok(())
    }

    fn stat_namespace(&self, ns_path: &str) -> crate::Result<MdStat> {
        let state = self.state.lock().unwrap();
        let ns = state.ns(ns_path)?;
        Ok(MdStat {
            size: 0,
            nlink: 2 + ns.refdirs.len() as u32,
            mode: 0o755,
            atime: 0,
            mtime: 0,
            ctime: 0,
        })
    }
}

#[derive(Debug)]
struct MemCtxt {
    state: Arc<Mutex<MemMdalState>>,
    ns_path: String,
}

impl MemCtxt {
    fn open_ino(&self, ino: u64) -> Box<dyn MdalFile> {
        Box::new(MemFile {
            state: self.state.clone(),
            ns_path: self.ns_path.clone(),
            ino,
            pos: 0,
            closed: false,
        })
    }

    fn with_ns<R>(&self, f: impl FnOnce(&mut NsState) -> crate::Result<R>) -> crate::Result<R> {
        let mut state = self.state.lock().unwrap();
        f(state.ns_mut(&self.ns_path)?)
    }
}

fn parent_dir(path: &str) -> &str {
    match path.rfind('/') {
        Some(idx) => &path[..idx],
        None => "",
    }
}

impl MdalCtxt for MemCtxt {
    fn dup(&self) -> crate::Result<Box<dyn MdalCtxt>> {
        Ok(Box::new(MemCtxt {
            state: self.state.clone(),
            ns_path: self.ns_path.clone(),
        }))
    }

    fn ns_path(&self) -> &str {
        &self.ns_path
    }

    fn stat(&self, path: &str) -> crate::Result<MdStat> {
        self.with_ns(|ns| {
            let ino = *ns
                .user
                .get(path)
                .ok_or_else(|| Error::not_found(format!("\"{path}\"")))?;
            ns.stat_of(ino)
        })
    }

    fn access(&self, path: &str) -> crate::Result<bool> {
        self.with_ns(|ns| Ok(ns.user.contains_key(path)))
    }

    fn open(&self, path: &str) -> crate::Result<Box<dyn MdalFile>> {
        let ino = self.with_ns(|ns| {
            let ino = *ns
                .user
                .get(path)
                .ok_or_else(|| Error::not_found(format!("\"{path}\"")))?;
            ns.inodes.get_mut(&ino).unwrap().open += 1;
            Ok(ino)
        })?;
        Ok(self.open_ino(ino))
    }

    fn unlink(&self, path: &str) -> crate::Result<()> {
        self.with_ns(|ns| {
            let ino = ns
                .user
                .remove(path)
                .ok_or_else(|| Error::not_found(format!("\"{path}\"")))?;
            ns.drop_link(ino);
            Ok(())
        })
    }

    fn rename(&self, from: &str, to: &str) -> crate::Result<()> {
        self.with_ns(|ns| {
            let ino = ns
                .user
                .remove(from)
                .ok_or_else(|| Error::not_found(format!("\"{from}\"")))?;
            if let Some(old) = ns.user.insert(to.to_string(), ino) {
                ns.drop_link(old);
            }
            if let Some(inode) = ns.inodes.get_mut(&ino) {
                inode.ctime = now();
            }
            Ok(())
        })
    }

    fn link(&self, existing: &str, new: &str) -> crate::Result<()> {
        self.with_ns(|ns| {
            let ino = *ns
                .user
                .get(existing)
                .ok_or_else(|| Error::not_found(format!("\"{existing}\"")))?;
            if ns.user.contains_key(new) {
                return Err(Error::Exists(format!("\"{new}\"")));
            }
            ns.user.insert(new.to_string(), ino);
            let inode = ns.inodes.get_mut(&ino).unwrap();
            inode.nlink += 1;
            inode.ctime = now();
            Ok(())
        })
    }

    fn chmod(&self, path: &str, mode: u32) -> crate::Result<()> {
        self.with_ns(|ns| {
            let ino = *ns
                .user
                .get(path)
                .ok_or_else(|| Error::not_found(format!("\"{path}\"")))?;
            let inode = ns.inodes.get_mut(&ino).unwrap();
            inode.mode = mode;
            inode.ctime = now();
            Ok(())
        })
    }

    fn utimens(&self, path: &str, times: FileTimes) -> crate::Result<()> {
        self.with_ns(|ns| {
            let ino = *ns
                .user
                .get(path)
                .ok_or_else(|| Error::not_found(format!("\"{path}\"")))?;
            let inode = ns.inodes.get_mut(&ino).unwrap();
            inode.atime = times.atime;
            inode.mtime = times.mtime;
            inode.ctime = now();
            Ok(())
        })
    }

    fn openref(&self, rpath: &str, create: bool, mode: u32) -> crate::Result<Box<dyn MdalFile>> {
        let ino = self.with_ns(|ns| {
            let ino = match ns.refs.get(rpath) {
                Some(ino) => {
                    if create {
                        return Err(Error::Exists(format!("reference \"{rpath}\"")));
                    }
                    *ino
                }
                None => {
                    if !create {
                        return Err(Error::not_found(format!("reference \"{rpath}\"")));
                    }
                    let ino = ns.alloc(mode);
                    ns.refs.insert(rpath.to_string(), ino);
                    ino
                }
            };
            ns.inodes.get_mut(&ino).unwrap().open += 1;
            Ok(ino)
        })?;
        Ok(self.open_ino(ino))
    }

    fn statref(&self, rpath: &str) -> crate::Result<MdStat> {
        self.with_ns(|ns| {
            if let Some(ino) = ns.refs.get(rpath) {
                return ns.stat_of(*ino);
            }
            if ns.refdirs.contains(rpath) {
                return Ok(MdStat {
                    mode: 0o755,
                    nlink: 2,
                    ..Default::default()
                });
            }
            Err(Error::not_found(format!("reference \"{rpath}\"")))
        })
    }

    fn unlinkref(&self, rpath: &str) -> crate::Result<()> {
        self.with_ns(|ns| {
            let ino = ns
                .refs
                .remove(rpath)
                .ok_or_else(|| Error::not_found(format!("reference \"{rpath}\"")))?;
            ns.drop_link(ino);
            Ok(())
        })
    }

    fn linkref(&self, rpath: &str, userpath: &str) -> crate::Result<()> {
        self.with_ns(|ns| {
            let ino = *ns
                .refs
                .get(rpath)
                .ok_or_else(|| Error::not_found(format!("reference \"{rpath}\"")))?;
            if ns.user.contains_key(userpath) {
                return Err(Error::Exists(format!("\"{userpath}\"")));
            }
            ns.user.insert(userpath.to_string(), ino);
            let inode = ns.inodes.get_mut(&ino).unwrap();
            inode.nlink += 1;
            inode.ctime = now();
            Ok(())
        })
    }

    fn linkref_to_ref(&self, rpath: &str, new_rpath: &str) -> crate::Result<()> {
        self.with_ns(|ns| {
            let ino = *ns
                .refs
                .get(rpath)
                .ok_or_else(|| Error::not_found(format!("reference \"{rpath}\"")))?;
            if ns.refs.contains_key(new_rpath) {
                return Err(Error::Exists(format!("reference \"{new_rpath}\"")));
            }
            ns.refs.insert(new_rpath.to_string(), ino);
            let inode = ns.inodes.get_mut(&ino).unwrap();
            inode.nlink += 1;
            inode.ctime = now();
            Ok(())
        })
    }

    fn renameref(&self, from: &str, to: &str) -> crate::Result<()> {
        self.with_ns(|ns| {
            let ino = ns
                .refs
                .remove(from)
                .ok_or_else(|| Error::not_found(format!("reference \"{from}\"")))?;
            if let Some(old) = ns.refs.insert(to.to_string(), ino) {
                ns.drop_link(old);
            }
            if let Some(inode) = ns.inodes.get_mut(&ino) {
                inode.ctime = now();
            }
            Ok(())
        })
    }

    fn createrefdir(&self, refdir: &str) -> crate::Result<()> {
        self.with_ns(|ns| {
            ns.refdirs.insert(refdir.to_string());
            Ok(())
        })
    }

    fn destroyrefdir(&self, refdir: &str) -> crate::Result<()> {
        self.with_ns(|ns| {
            if ns.refs.keys().any(|r| parent_dir(r) == refdir) {
                return Err(Error::inval(format!("reference dir \"{refdir}\" is not empty")));
            }
            if !ns.refdirs.remove(refdir) {
                return Err(Error::not_found(format!("reference dir \"{refdir}\"")));
            }
            Ok(())
        })
    }

    fn openscanner(&self, refdir: &str) -> crate::Result<Box<dyn MdalScanner>> {
        let entries = self.with_ns(|ns| {
            if !ns.refdirs.contains(refdir) {
                return Err(Error::not_found(format!("reference dir \"{refdir}\"")));
            }
            let mut entries: Vec<String> = ns
                .refs
                .keys()
                .filter(|r| parent_dir(r) == refdir)
                .map(|r| r[refdir.len() + 1..].to_string())
                .collect();
            entries.reverse();
            Ok(entries)
        })?;
        Ok(Box::new(MemScanner { entries }))
    }

    fn data_usage(&self) -> crate::Result<u64> {
        self.with_ns(|ns| Ok(ns.data_usage))
    }

    fn set_data_usage(&self, value: u64) -> crate::Result<()> {
        self.with_ns(|ns| {
            ns.data_usage = value;
            Ok(())
        })
    }

    fn inode_usage(&self) -> crate::Result<u64> {
        self.with_ns(|ns| Ok(ns.inode_usage))
    }

    fn set_inode_usage(&self, value: u64) -> crate::Result<()> {
        self.with_ns(|ns| {
            ns.inode_usage = value;
            Ok(())
        })
    }
}

struct MemFile {
    state: Arc<Mutex<MemMdalState>>,
    ns_path: String,
    ino: u64,
    pos: usize,
    closed: bool,
}

impl MemFile {
    fn with_inode<R>(&self, f: impl FnOnce(&mut Inode) -> crate::Result<R>) -> crate::Result<R> {
        let mut state = self.state.lock().unwrap();
        let ns = state.ns_mut(&self.ns_path)?;
        let inode = ns
            .inodes
            .get_mut(&self.ino)
            .ok_or_else(|| Error::not_found("stale inode"))?;
        f(inode)
    }

    fn release(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        let mut state = self.state.lock().unwrap();
        if let Ok(ns) = state.ns_mut(&self.ns_path) {
            if let Some(inode) = ns.inodes.get_mut(&self.ino) {
                inode.open = inode.open.saturating_sub(1);
                if inode.nlink == 0 && inode.open == 0 {
                    ns.inodes.remove(&self.ino);
                }
            }
        }
    }
}

impl MdalFile for MemFile {
    fn read(&mut self, buf: &mut [u8]) -> crate::Result<usize> {
        self.with_inode(|inode| {
            let avail = inode.data.len().saturating_sub(self.pos);
            let count = avail.min(buf.len());
            buf[..count].copy_from_slice(&inode.data[self.pos..self.pos + count]);
            Ok(count)
        })
        .map(|count| {
            self.pos += count;
            count
        })
    }

    fn write(&mut self, buf: &[u8]) -> crate::Result<usize> {
        let pos = self.pos;
        self.with_inode(|inode| {
            let end = pos + buf.len();
            if end > inode.data.len() {
                inode.data.resize(end, 0);
            }
            inode.data[pos..end].copy_from_slice(buf);
            inode.mtime = now();
            inode.ctime = inode.mtime;
            Ok(buf.len())
        })
        .map(|count| {
            self.pos += count;
            count
        })
    }

    fn seek(&mut self, offset: u64) -> crate::Result<u64> {
        self.pos = usize::try_from(offset)?;
        Ok(offset)
    }

    fn ftruncate(&mut self, length: u64) -> crate::Result<()> {
        let length = usize::try_from(length)?;
        self.with_inode(|inode| {
            inode.data.resize(length, 0);
            inode.mtime = now();
            inode.ctime = inode.mtime;
            Ok(())
        })
    }

    fn fstat(&self) -> crate::Result<MdStat> {
        self.with_inode(|inode| {
            Ok(MdStat {
                size: inode.data.len() as u64,
                nlink: inode.nlink,
                mode: inode.mode,
                atime: inode.atime,
                mtime: inode.mtime,
                ctime: inode.ctime,
            })
        })
    }

    fn fsetxattr(&mut self, name: &str, value: &[u8]) -> crate::Result<()> {
        self.with_inode(|inode| {
            inode.xattrs.insert(name.to_string(), value.to_vec());
            inode.ctime = now();
            Ok(())
        })
    }

    fn fgetxattr(&self, name: &str) -> crate::Result<Vec<u8>> {
        self.with_inode(|inode| {
            inode
                .xattrs
                .get(name)
                .cloned()
                .ok_or_else(|| Error::not_found(format!("xattr \"{name}\"")))
        })
    }

    fn fremovexattr(&mut self, name: &str) -> crate::Result<()> {
        self.with_inode(|inode| {
            inode
                .xattrs
                .remove(name)
                .map(|_| ())
                .ok_or_else(|| Error::not_found(format!("xattr \"{name}\"")))?;
            inode.ctime = now();
            Ok(())
        })
    }

    fn flistxattr(&self) -> crate::Result<Vec<String>> {
        self.with_inode(|inode| Ok(inode.xattrs.keys().cloned().collect()))
    }

    fn futimens(&mut self, times: FileTimes) -> crate::Result<()> {
        self.with_inode(|inode| {
            inode.atime = times.atime;
            inode.mtime = times.mtime;
            inode.ctime = now();
            Ok(())
        })
    }

    fn close(mut self: Box<Self>) -> crate::Result<()> {
        self.release();
        Ok(())
    }
}

impl Drop for MemFile {
    fn drop(&mut self) {
        self.release();
    }
}

struct MemScanner {
    entries: Vec<String>,
}

impl MdalScanner for MemScanner {
    fn next_entry(&mut self) -> crate::Result<Option<String>> {
        Ok(self.entries.pop())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctxt() -> (MemMdal, Box<dyn MdalCtxt>) {
        let mdal = MemMdal::new();
        mdal.create_namespace("/ns").unwrap();
        let ctxt = mdal.new_ctxt("/ns").unwrap();
        (mdal, ctxt)
    }

    #[test]
    fn ref_and_user_paths_share_an_inode() {
        let (_mdal, ctxt) = ctxt();
        let mut fh = ctxt.openref("r/0/file", true, 0o644).unwrap();
        fh.fsetxattr("MARFS-FILE", b"tagvalue").unwrap();
        fh.close().unwrap();

        ctxt.linkref("r/0/file", "user-name").unwrap();
        assert_eq!(ctxt.stat("user-name").unwrap().nlink, 2);
        assert_eq!(ctxt.statref("r/0/file").unwrap().nlink, 2);

        ctxt.unlink("user-name").unwrap();
        assert_eq!(ctxt.statref("r/0/file").unwrap().nlink, 1);
        let fh = ctxt.openref("r/0/file", false, 0).unwrap();
        assert_eq!(fh.fgetxattr("MARFS-FILE").unwrap(), b"tagvalue");
    }

    #[test]
    fn exclusive_ref_creation() {
        let (_mdal, ctxt) = ctxt();
        ctxt.openref("r/0/a", true, 0o644).unwrap().close().unwrap();
        assert!(matches!(
            ctxt.openref("r/0/a", true, 0o644),
            Err(Error::Exists(_))
        ));
    }

    #[test]
    fn scanner_lists_only_direct_children() {
        let (_mdal, ctxt) = ctxt();
        ctxt.createrefdir("r/0").unwrap();
        ctxt.createrefdir("r/1").unwrap();
        ctxt.openref("r/0/a", true, 0o644).unwrap().close().unwrap();
        ctxt.openref("r/0/b", true, 0o644).unwrap().close().unwrap();
        ctxt.openref("r/1/c", true, 0o644).unwrap().close().unwrap();

        let mut scanner = ctxt.openscanner("r/0").unwrap();
        let mut seen = Vec::new();
        while let Some(name) = scanner.next_entry().unwrap() {
            seen.push(name);
        }
        seen.sort();
        assert_eq!(seen, vec!["a".to_string(), "b".to_string()]);
    }

    #[test]
    fn unlinked_inode_survives_open_handles() {
        let (_mdal, ctxt) = ctxt();
        let mut fh = ctxt.openref("r/0/gone", true, 0o644).unwrap();
        fh.write(b"payload").unwrap();
        ctxt.unlinkref("r/0/gone").unwrap();
        assert!(ctxt.statref("r/0/gone").is_err());

        let mut buf = [0u8; 7];
        fh.seek(0).unwrap();
        assert_eq!(fh.read(&mut buf).unwrap(), 7);
        assert_eq!(&buf, b"payload");
        fh.close().unwrap();
    }

    #[test]
    fn user_path_surface() {
        let (_mdal, ctxt) = ctxt();
        let mut fh = ctxt.openref("r/0/src", true, 0o640).unwrap();
        fh.write(b"content").unwrap();
        fh.close().unwrap();
        ctxt.linkref("r/0/src", "alpha").unwrap();

        assert!(ctxt.access("alpha").unwrap());
        assert!(!ctxt.access("beta").unwrap());

        ctxt.link("alpha", "beta").unwrap();
        assert_eq!(ctxt.stat("beta").unwrap().nlink, 3);
        assert!(matches!(ctxt.link("alpha", "beta"), Err(Error::Exists(_))));

        ctxt.rename("beta", "gamma").unwrap();
        assert!(!ctxt.access("beta").unwrap());
        assert!(ctxt.access("gamma").unwrap());

        ctxt.chmod("gamma", 0o444).unwrap();
        assert_eq!(ctxt.stat("gamma").unwrap().mode, 0o444);

        ctxt.utimens(
            "gamma",
            FileTimes {
                atime: 111,
                mtime: 222,
            },
        )
        .unwrap();
        let st = ctxt.stat("gamma").unwrap();
        assert_eq!((st.atime, st.mtime), (111, 222));
    }

    #[test]
    fn ref_rename_and_xattr_listing() {
        let (_mdal, ctxt) = ctxt();
        let mut fh = ctxt.openref("r/0/plain", true, 0o600).unwrap();
        fh.fsetxattr("MARFS-FILE", b"a").unwrap();
        fh.fsetxattr("MARFS-GC", b"b").unwrap();
        let mut names = fh.flistxattr().unwrap();
        names.sort();
        assert_eq!(names, vec!["MARFS-FILE".to_string(), "MARFS-GC".to_string()]);
        fh.fremovexattr("MARFS-GC").unwrap();
        assert!(fh.fgetxattr("MARFS-GC").is_err());
        fh.close().unwrap();

        ctxt.renameref("r/0/plain", "r/1/moved").unwrap();
        assert!(ctxt.statref("r/0/plain").is_err());
        assert!(ctxt.statref("r/1/moved").is_ok());
    }

    #[test]
    fn refdir_lifecycle() {
        let (_mdal, ctxt) = ctxt();
        ctxt.createrefdir("r/9").unwrap();
        ctxt.openref("r/9/occupant", true, 0o600)
            .unwrap()
            .close()
            .unwrap();
        assert!(ctxt.destroyrefdir("r/9").is_err());
        ctxt.unlinkref("r/9/occupant").unwrap();
        ctxt.destroyrefdir("r/9").unwrap();
        assert!(ctxt.openscanner("r/9").is_err());
    }

    #[test]
    fn namespace_lifecycle() {
        let mdal = MemMdal::new();
        mdal.create_namespace("/short-lived").unwrap();
        assert!(matches!(
            mdal.create_namespace("/short-lived"),
            Err(Error::Exists(_))
        ));
        assert_eq!(mdal.stat_namespace("/short-lived").unwrap().nlink, 2);

        let ctxt = mdal.new_ctxt("/short-lived").unwrap();
        ctxt.openref("keeper", true, 0o600).unwrap().close().unwrap();
        assert!(mdal.destroy_namespace("/short-lived").is_err());
        ctxt.unlinkref("keeper").unwrap();
        mdal.destroy_namespace("/short-lived").unwrap();
        assert!(mdal.new_ctxt("/short-lived").is_err());
    }

    #[test]
    fn usage_counters_round_trip() {
        let (_mdal, ctxt) = ctxt();
        ctxt.set_data_usage(4096).unwrap();
        ctxt.set_inode_usage(3).unwrap();
        assert_eq!(ctxt.data_usage().unwrap(), 4096);
        assert_eq!(ctxt.inode_usage().unwrap(), 3);
    }
}
