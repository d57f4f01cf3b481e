//! The datastream engine: per-client sequences of logical files sharing
//! erasure-coded data objects.
//!
//! A stream multiplexes three handle types. CREATE streams append files,
//! packing small ones into the current object and chunking large ones
//! across object boundaries. EDIT streams reopen an existing file for
//! parallel writers at object-aligned chunk boundaries. READ streams map
//! logical file offsets onto objects, skipping the embedded recovery
//! records.
//!
//! Object layout is `[recovery header][file bytes][recovery footer]...`;
//! every object run of a file is closed by a footer, so a single intact
//! object is sufficient to identify and recover its contents.

mod bounds;

use std::fmt;

use rand::Rng;
use time::OffsetDateTime;

use crate::config::{DataScheme, Position, RefTable};
use crate::dal::{DalMode, DalObject, Erasure, Location};
use crate::error::Error;
use crate::mdal::{FileTimes, MdalFile};
use crate::recovery::{Finfo, RecoveryHeader};
use crate::tagging::{id_is_clean, DataState, Ftag, FTAG_NAME, ORIG_FTAG_NAME, TGT_FTAG_NAME};
use crate::tagging::{FTAG_CURRENT_MAJORVERSION, FTAG_CURRENT_MINORVERSION};

/// Handle flavor of an open datastream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamType {
    Create,
    Edit,
    Read,
}

/// Seek origin.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Whence {
    Set,
    Cur,
    End,
}

/// One file tracked by an open stream.
struct StreamFile {
    handle: Box<dyn MdalFile>,
    ftag: Ftag,
    recovery_path: String,
    /// Bytes written through this handle (not the file's total).
    written: u64,
    times: Option<FileTimes>,
    /// Repack target: the tag stages under `TGT-MARFS-FILE` and is only
    /// promoted to the live FTAG at close.
    repack_tgt: bool,
}

impl StreamFile {
    /// Xattr the in-flight tag persists under.
    fn tag_name(&self) -> &'static str {
        if self.repack_tgt && self.ftag.state != DataState::Comp {
            TGT_FTAG_NAME
        } else {
            FTAG_NAME
        }
    }
}

enum OpenTarget<'a> {
    User(&'a str),
    Ref(&'a str),
}

/// An open datastream handle.
///
/// Public operations take `&mut self`: a handle shared between threads
/// sits behind a mutex at the caller, giving the serialized-per-handle
/// semantics of the original API.
pub struct DataStream {
    stype: StreamType,
    pos: Position,
    ctag: String,
    streamid: String,
    recoveryheaderlen: u64,
    /// Object currently open (write position for CREATE/EDIT, cached
    /// read object for READ).
    objno: u64,
    /// Intra-object offset of the next write / current read position.
    offset: u64,
    /// Logical position within the current file.
    filepos: u64,
    /// Files whose data begins (or continues) in the current object.
    objfilecount: u64,
    /// Metadata size of the current file (READ streams).
    msize: u64,
    meta_only: bool,
    datahandle: Option<Box<dyn DalObject>>,
    files: Vec<StreamFile>,
    curfile: usize,
    broken: bool,
}

impl fmt::Debug for DataStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DataStream")
            .field("type", &self.stype)
            .field("ctag", &self.ctag)
            .field("streamid", &self.streamid)
            .field("fileno", &self.files.get(self.curfile).map(|f| f.ftag.fileno))
            .field("objno", &self.objno)
            .field("broken", &self.broken)
            .finish()
    }
}

fn gen_streamid() -> String {
    let ts = OffsetDateTime::now_utc().unix_timestamp_nanos();
    let salt: u32 = rand::thread_rng().gen();
    format!("{:x}-{:08x}", ts, salt)
}

impl DataStream {
    //   -------------   PUBLIC OPERATIONS    -------------

    /// Create a new file, appending to `stream` when it is a compatible
    /// CREATE stream (same namespace and client tag) and packing policy
    /// allows, or beginning a fresh stream otherwise.
    ///
    /// On catastrophic failure the passed stream is left in a terminal
    /// state and only [`DataStream::release`] will succeed on it.
    pub fn create(
        stream: &mut Option<DataStream>,
        path: &str,
        pos: &Position,
        mode: u32,
        ctag: &str,
    ) -> crate::Result<()> {
        if !id_is_clean(ctag) {
            return Err(Error::inval(format!(
                "client tag \"{ctag}\" holds reserved characters"
            )));
        }
        if !pos.perms.write_meta() || !pos.perms.write_data() {
            return Err(Error::PermissionDenied(
                "create requires metadata and data write permission".to_string(),
            ));
        }
        let ns = pos.namespace();
        if ns.fquota > 0 && pos.ctxt().inode_usage()? >= ns.fquota {
            return Err(Error::QuotaExceeded);
        }
        if ns.dquota > 0 && pos.ctxt().data_usage()? >= ns.dquota {
            return Err(Error::QuotaExceeded);
        }

        // decide whether the passed stream can be extended
        let existing = match stream.take() {
            Some(st)
                if st.stype == StreamType::Create
                    && !st.broken
                    && st.ctag == ctag
                    && st.pos.ns == pos.ns =>
            {
                Some(st)
            }
            Some(st) => {
                st.close()?;
                None
            }
            None => None,
        };

        let mut st = match existing {
            Some(mut st) => {
                // seal the previous file and make room for the new one
                if let Err(e) = st.append_setup(path) {
                    log::error!("Failed to extend stream for \"{}\": {}", path, e);
                    st.broken = true;
                    *stream = Some(st);
                    return Err(e);
                }
                st
            }
            None => DataStream::fresh(StreamType::Create, pos, ctag)?,
        };

        if let Err(e) = st.create_file(path, mode) {
            st.broken = true;
            *stream = Some(st);
            return Err(e);
        }
        *stream = Some(st);
        Ok(())
    }

    /// Open an existing file for READ or EDIT. A compatible READ stream
    /// (same underlying datastream) is extended in place, keeping its
    /// object handle warm for packed neighbors.
    pub fn open(
        stream: &mut Option<DataStream>,
        stype: StreamType,
        path: &str,
        pos: &Position,
    ) -> crate::Result<()> {
        Self::open_common(stream, stype, OpenTarget::User(path), pos)
    }

    /// Open a file through its reference path, for offline passes that
    /// never see user-visible names.
    pub fn open_ref(
        stream: &mut Option<DataStream>,
        stype: StreamType,
        rpath: &str,
        pos: &Position,
    ) -> crate::Result<()> {
        Self::open_common(stream, stype, OpenTarget::Ref(rpath), pos)
    }

    /// Append an existing file to a repack stream. The file keeps its
    /// metadata inode; its rewritten data lands in this stream's objects
    /// and the replacement tag stages under `TGT-MARFS-FILE` (original
    /// stashed under `ORIG-MARFS-FILE`) until close promotes it. The
    /// stream's reference tree gains a hardlink to the inode, so the
    /// repack stream is walkable like any other.
    pub fn repack_create(
        stream: &mut Option<DataStream>,
        orig_rpath: &str,
        pos: &Position,
        ctag: &str,
    ) -> crate::Result<()> {
        if !id_is_clean(ctag) {
            return Err(Error::inval(format!(
                "client tag \"{ctag}\" holds reserved characters"
            )));
        }
        if !pos.perms.write_meta() || !pos.perms.write_data() {
            return Err(Error::PermissionDenied(
                "repack requires metadata and data write permission".to_string(),
            ));
        }

        let existing = match stream.take() {
            Some(st)
                if st.stype == StreamType::Create
                    && !st.broken
                    && st.ctag == ctag
                    && st.pos.ns == pos.ns =>
            {
                Some(st)
            }
            Some(st) => {
                st.close()?;
                None
            }
            None => None,
        };

        let mut st = match existing {
            Some(mut st) => {
                if let Err(e) = st.append_setup(orig_rpath) {
                    log::error!("Failed to extend repack stream: {}", e);
                    st.broken = true;
                    *stream = Some(st);
                    return Err(e);
                }
                st
            }
            None => DataStream::fresh(StreamType::Create, pos, ctag)?,
        };

        if let Err(e) = st.repack_file(orig_rpath) {
            st.broken = true;
            *stream = Some(st);
            return Err(e);
        }
        *stream = Some(st);
        Ok(())
    }

    /// Write at the current position. Emits recovery footers and rolls
    /// objects over as capacity is exhausted.
    pub fn write(&mut self, buf: &[u8]) -> crate::Result<usize> {
        self.check_live()?;
        self.guard(|st| st.write_inner(buf))
    }

    /// Read from the current position, skipping embedded recovery bytes
    /// and crossing chunk boundaries transparently. Returns 0 at end of
    /// file.
    pub fn read(&mut self, buf: &mut [u8]) -> crate::Result<usize> {
        self.check_live()?;
        self.guard(|st| st.read_inner(buf))
    }

    /// Reposition within the current file. READ streams may seek
    /// anywhere; EDIT streams only to chunk boundaries (or the file
    /// end).
    pub fn seek(&mut self, offset: i64, whence: Whence) -> crate::Result<u64> {
        self.check_live()?;
        let file = self.cur()?;
        let logical_end = file.ftag.availbytes.max(self.msize);
        let base = match whence {
            Whence::Set => 0i128,
            Whence::Cur => self.filepos as i128,
            Whence::End => logical_end as i128,
        };
        let target = base + offset as i128;
        if target < 0 {
            return Err(Error::inval("seek before start of file"));
        }
        let target = u64::try_from(target as u128).map_err(Error::Range)?;
        match self.stype {
            StreamType::Read => {
                self.filepos = target;
            }
            StreamType::Edit => {
                self.guard(|st| st.edit_seek(target))?;
            }
            StreamType::Create => {
                return Err(Error::inval("CREATE streams are write-sequential"));
            }
        }
        Ok(self.filepos)
    }

    /// `(logical offset, size)` of one chunk of the current file, as a
    /// parallel writer must write it.
    pub fn chunk_bounds(&self, chunknum: u64) -> crate::Result<(u64, u64)> {
        let file = self.cur()?;
        bounds::chunk_bounds(&file.ftag, self.recoveryheaderlen, chunknum)?.ok_or_else(|| {
            Error::inval(format!(
                "file of {} bytes has no chunk {chunknum}",
                file.ftag.bytes
            ))
        })
    }

    /// Declare the final size of the current file ahead of parallel
    /// writes. Legal only on the original CREATE handle, before any data
    /// has been written, for an unpacked file.
    pub fn extend(&mut self, length: u64) -> crate::Result<()> {
        self.check_live()?;
        self.guard(|st| st.extend_inner(length))
    }

    /// Shrink the readable size of a completed file.
    pub fn truncate(&mut self, length: u64) -> crate::Result<()> {
        self.check_live()?;
        if !self.pos.perms.truncate_data() {
            return Err(Error::PermissionDenied(
                "truncate requires data truncate permission".to_string(),
            ));
        }
        self.guard(|st| st.truncate_inner(length))
    }

    /// Buffer a time update for the current file; it is applied at
    /// close. Repeated flushes without close remain a no-op.
    pub fn utimens(&mut self, times: FileTimes) -> crate::Result<()> {
        self.check_live()?;
        self.cur_mut()?.times = Some(times);
        Ok(())
    }

    /// Override the path recorded in this file's recovery footers.
    /// Parallel writers that opened by a temporary name use this to
    /// record the canonical one.
    pub fn set_recovery_path(&mut self, path: &str) -> crate::Result<()> {
        self.check_live()?;
        if self.stype == StreamType::Read {
            return Err(Error::inval("READ streams record no recovery info"));
        }
        let newlen = Finfo::recovery_bytes(path);
        let file = self.cur_mut()?;
        if file.written > 0 || file.ftag.state >= DataState::Sized {
            // layout is already published; only a same-length path fits
            if newlen != file.ftag.recoverybytes {
                return Err(Error::inval(format!(
                    "recovery path \"{path}\" does not fit the reserved {} bytes",
                    file.ftag.recoverybytes
                )));
            }
            file.recovery_path = path.to_string();
        } else {
            file.recovery_path = path.to_string();
            file.ftag.recoverybytes = newlen;
            let tag = file.ftag.to_string();
            let tag_name = file.tag_name();
            file.handle.fsetxattr(tag_name, tag.as_bytes())?;
        }
        Ok(())
    }

    /// Finalize the stream: seal the current file, mark every file
    /// complete and readable, flush buffered times, and commit the last
    /// object. Fails if any file could not be finalized.
    pub fn close(mut self) -> crate::Result<()> {
        if self.broken {
            self.cleanup();
            return Err(Error::HandleBroken);
        }
        let result = self.close_inner();
        if result.is_err() {
            self.cleanup();
        }
        result
    }

    /// Drop the handle without finalizing, leaving the stream
    /// re-openable. Always succeeds and never leaks resources.
    pub fn release(mut self) -> crate::Result<()> {
        // commit whatever was already written, so parallel writers can
        // rejoin
        if let Some(handle) = self.datahandle.take() {
            let res = if self.broken {
                handle.abort()
            } else {
                handle.close()
            };
            if let Err(e) = res {
                log::warn!("Failed to commit object during release: {}", e);
            }
        }
        for file in self.files.drain(..) {
            let mut handle = file.handle;
            if let Some(times) = file.times {
                if let Err(e) = handle.futimens(times) {
                    log::warn!("Failed to flush times during release: {}", e);
                }
            }
            if let Err(e) = handle.close() {
                log::warn!("Failed to close meta handle during release: {}", e);
            }
        }
        Ok(())
    }

    //   -------------   ACCESSORS    -------------

    pub fn stream_type(&self) -> StreamType {
        self.stype
    }

    pub fn stream_id(&self) -> &str {
        &self.streamid
    }

    pub fn client_tag(&self) -> &str {
        &self.ctag
    }

    /// FTAG of the current file.
    pub fn file_tag(&self) -> crate::Result<&Ftag> {
        Ok(&self.cur()?.ftag)
    }

    pub fn header_len(&self) -> u64 {
        self.recoveryheaderlen
    }

    //   -------------   NAME GENERATION    -------------

    /// Reference path of a file, derived from the tree shape recorded in
    /// its FTAG (which may predate the current config).
    pub fn gen_rpath(ftag: &Ftag) -> crate::Result<String> {
        let table = RefTable::new(ftag.refbreadth, ftag.refdepth, ftag.refdigits)?;
        Ok(table.rpath_for(&ftag.meta_tgt()))
    }

    /// Object name, erasure profile and placement of a file's current
    /// object number.
    pub fn obj_target(ftag: &Ftag, ds: &DataScheme) -> (String, Erasure, Location) {
        let objname = ftag.object_tgt();
        let location = ds.location_of(&objname);
        (objname, ftag.protection, location)
    }

    /// Final object number referenced by a file.
    pub fn file_bounds(ftag: &Ftag, headerlen: u64) -> crate::Result<u64> {
        bounds::file_bounds(ftag, headerlen)
    }

    //   -------------   INTERNALS    -------------

    fn check_live(&self) -> crate::Result<()> {
        if self.broken {
            return Err(Error::HandleBroken);
        }
        Ok(())
    }

    /// Run a mutating operation, downgrading the handle to its terminal
    /// state when the failure is more than an argument-validation
    /// rejection.
    fn guard<R>(
        &mut self,
        op: impl FnOnce(&mut Self) -> crate::Result<R>,
    ) -> crate::Result<R> {
        match op(self) {
            Ok(v) => Ok(v),
            Err(e) => {
                if !matches!(e, Error::InvalidArgument(_) | Error::PermissionDenied(_)) {
                    log::error!(
                        "Datastream \"{}\" entered terminal state: {}",
                        self.streamid,
                        e
                    );
                    self.broken = true;
                }
                Err(e)
            }
        }
    }

    fn cur(&self) -> crate::Result<&StreamFile> {
        self.files
            .get(self.curfile)
            .ok_or_else(|| Error::inval("stream holds no current file"))
    }

    fn cur_mut(&mut self) -> crate::Result<&mut StreamFile> {
        self.files
            .get_mut(self.curfile)
            .ok_or_else(|| Error::inval("stream holds no current file"))
    }

    fn fresh(stype: StreamType, pos: &Position, ctag: &str) -> crate::Result<DataStream> {
        let streamid = gen_streamid();
        let recoveryheaderlen = RecoveryHeader::new(ctag, &streamid).encoded_len();
        Ok(DataStream {
            stype,
            pos: pos.config().duplicate_position(pos)?,
            ctag: ctag.to_string(),
            streamid,
            recoveryheaderlen,
            objno: 0,
            offset: recoveryheaderlen,
            filepos: 0,
            objfilecount: 0,
            msize: 0,
            meta_only: false,
            datahandle: None,
            files: Vec::new(),
            curfile: 0,
            broken: false,
        })
    }

    /// Seal the current file and position the stream for the next one.
    fn append_setup(&mut self, next_path: &str) -> crate::Result<()> {
        self.finalize_file()?;
        // clear the assumed end-of-stream on the sealed file
        let file = self.cur_mut()?;
        file.ftag.endofstream = false;
        let tag = file.ftag.to_string();
        let tag_name = file.tag_name();
        file.handle.fsetxattr(tag_name, tag.as_bytes())?;

        let ds = &self.pos.repo().datascheme;
        let pack_ok = ds.objfiles != 0
            && self.objfilecount < ds.objfiles
            && self.offset + Finfo::recovery_bytes(next_path) < ds.objsize;
        if !pack_ok {
            self.object_advance()?;
        }
        Ok(())
    }

    /// Commit the current object (if any) and step to the next object
    /// number.
    fn object_advance(&mut self) -> crate::Result<()> {
        if let Some(handle) = self.datahandle.take() {
            handle.close()?;
        }
        if self.offset > self.recoveryheaderlen || self.objfilecount > 0 {
            self.objno += 1;
        }
        self.offset = self.recoveryheaderlen;
        self.objfilecount = 0;
        Ok(())
    }

    fn create_file(&mut self, path: &str, mode: u32) -> crate::Result<()> {
        let repo = self.pos.repo();
        let ds = &repo.datascheme;
        let ms = &repo.metascheme;
        let recoverybytes = Finfo::recovery_bytes(path);
        // the object must hold at least one data byte past the recovery
        // overhead
        bounds::chunk_cap(ds.objsize, self.recoveryheaderlen, recoverybytes)?;

        let fileno = match self.files.last() {
            Some(prev) => prev.ftag.fileno + 1,
            None => 0,
        };
        let ftag = Ftag {
            majorversion: FTAG_CURRENT_MAJORVERSION,
            minorversion: FTAG_CURRENT_MINORVERSION,
            ctag: self.ctag.clone(),
            streamid: self.streamid.clone(),
            objfiles: ds.objfiles,
            objsize: ds.objsize,
            refbreadth: ms.reftable.breadth(),
            refdepth: ms.reftable.depth(),
            refdigits: ms.reftable.digits(),
            fileno,
            objno: self.objno,
            offset: self.offset,
            // a lone trailing file is the assumed end of its stream
            // until a successor is created
            endofstream: true,
            protection: ds.protection,
            bytes: 0,
            availbytes: 0,
            recoverybytes,
            state: DataState::Init,
            readable: false,
            writable: false,
        };

        let rpath = ms.reftable.rpath_for(&ftag.meta_tgt());
        let mut handle = self.pos.ctxt().openref(&rpath, true, mode)?;
        let tag = ftag.to_string();
        if let Err(e) = handle.fsetxattr(FTAG_NAME, tag.as_bytes()) {
            let _ = self.pos.ctxt().unlinkref(&rpath);
            return Err(e);
        }
        if let Err(e) = self.pos.ctxt().linkref(&rpath, path) {
            let _ = self.pos.ctxt().unlinkref(&rpath);
            return Err(e);
        }
        log::debug!(
            "Created file {} of stream \"{}\" at reference \"{}\"",
            fileno,
            self.streamid,
            rpath
        );

        self.files.push(StreamFile {
            handle,
            ftag,
            recovery_path: path.to_string(),
            written: 0,
            times: None,
            repack_tgt: false,
        });
        self.curfile = self.files.len() - 1;
        self.filepos = 0;
        self.objfilecount += 1;
        Ok(())
    }

    /// Attach an existing file's inode as the next file of this repack
    /// stream.
    fn repack_file(&mut self, orig_rpath: &str) -> crate::Result<()> {
        let repo = self.pos.repo();
        let ds = &repo.datascheme;
        let ms = &repo.metascheme;

        let mut handle = self.pos.ctxt().openref(orig_rpath, false, 0)?;
        let raw = handle.fgetxattr(FTAG_NAME)?;
        let text =
            String::from_utf8(raw).map_err(|_| Error::tag("FTAG value is not valid UTF-8"))?;
        let old: Ftag = text.parse()?;

        // stash the pre-repack tag, unless a previous attempt already
        // did
        match handle.fgetxattr(ORIG_FTAG_NAME) {
            Ok(_) => {}
            Err(Error::NotFound(_)) => {
                handle.fsetxattr(ORIG_FTAG_NAME, text.as_bytes())?;
            }
            Err(e) => return Err(e),
        }

        // the recovery path keeps naming the original file id
        let recovery_path = old.meta_tgt();
        let recoverybytes = Finfo::recovery_bytes(&recovery_path);
        bounds::chunk_cap(ds.objsize, self.recoveryheaderlen, recoverybytes)?;

        let fileno = match self.files.last() {
            Some(prev) => prev.ftag.fileno + 1,
            None => 0,
        };
        let ftag = Ftag {
            majorversion: FTAG_CURRENT_MAJORVERSION,
            minorversion: FTAG_CURRENT_MINORVERSION,
            ctag: self.ctag.clone(),
            streamid: self.streamid.clone(),
            objfiles: ds.objfiles,
            objsize: ds.objsize,
            refbreadth: ms.reftable.breadth(),
            refdepth: ms.reftable.depth(),
            refdigits: ms.reftable.digits(),
            fileno,
            objno: self.objno,
            offset: self.offset,
            endofstream: true,
            protection: ds.protection,
            bytes: 0,
            availbytes: 0,
            recoverybytes,
            state: DataState::Init,
            readable: false,
            writable: false,
        };
        handle.fsetxattr(TGT_FTAG_NAME, ftag.to_string().as_bytes())?;

        // expose the inode in this stream's reference tree
        let rpath = ms.reftable.rpath_for(&ftag.meta_tgt());
        match self.pos.ctxt().linkref_to_ref(orig_rpath, &rpath) {
            Ok(()) | Err(Error::Exists(_)) => {}
            Err(e) => return Err(e),
        }
        log::debug!(
            "Repacking \"{}\" as file {} of stream \"{}\"",
            orig_rpath,
            fileno,
            self.streamid
        );

        self.files.push(StreamFile {
            handle,
            ftag,
            recovery_path,
            written: 0,
            times: None,
            repack_tgt: true,
        });
        self.curfile = self.files.len() - 1;
        self.filepos = 0;
        self.objfilecount += 1;
        Ok(())
    }

    fn open_common(
        stream: &mut Option<DataStream>,
        stype: StreamType,
        target: OpenTarget<'_>,
        pos: &Position,
    ) -> crate::Result<()> {
        match stype {
            StreamType::Read => {
                if !pos.perms.read_meta() || !pos.perms.read_data() {
                    return Err(Error::PermissionDenied(
                        "open for read requires metadata and data read permission".to_string(),
                    ));
                }
            }
            StreamType::Edit => {
                if !pos.perms.read_meta() || !pos.perms.write_data() {
                    return Err(Error::PermissionDenied(
                        "open for edit requires metadata read and data write permission"
                            .to_string(),
                    ));
                }
            }
            StreamType::Create => {
                return Err(Error::inval("CREATE streams begin at create()"));
            }
        }

        let (pathstr, handle) = match target {
            OpenTarget::User(path) => (path, pos.ctxt().open(path)?),
            OpenTarget::Ref(rpath) => (rpath, pos.ctxt().openref(rpath, false, 0)?),
        };
        let tagstr = handle.fgetxattr(FTAG_NAME)?;
        let tagstr = String::from_utf8(tagstr)
            .map_err(|_| Error::tag("FTAG value is not valid UTF-8"))?;
        let ftag: Ftag = tagstr.parse()?;
        let msize = handle.fstat()?.size;
        let repo = pos.repo();

        let meta_only = stype == StreamType::Read
            && !ftag.readable
            && ftag.bytes == 0
            && repo.metascheme.directread;
        match stype {
            StreamType::Read => {
                if !ftag.readable && !meta_only {
                    return Err(Error::PermissionDenied(format!(
                        "file \"{pathstr}\" is not readable yet"
                    )));
                }
            }
            StreamType::Edit => {
                let editable = (ftag.writable && ftag.state >= DataState::Sized)
                    || ftag.state == DataState::Comp;
                if !editable {
                    return Err(Error::PermissionDenied(format!(
                        "file \"{pathstr}\" does not admit parallel writes"
                    )));
                }
            }
            StreamType::Create => unreachable!(),
        }

        // a compatible READ stream keeps its object handle warm for
        // packed neighbors
        let reusable = matches!(
            stream,
            Some(st) if st.stype == StreamType::Read
                && stype == StreamType::Read
                && !st.broken
                && st.ctag == ftag.ctag
                && st.streamid == ftag.streamid
        );
        let mut st = if reusable {
            stream.take().unwrap()
        } else {
            if let Some(old) = stream.take() {
                old.close()?;
            }
            let mut st = DataStream::fresh(stype, pos, &ftag.ctag)?;
            st.streamid = ftag.streamid.clone();
            st.recoveryheaderlen =
                RecoveryHeader::new(&ftag.ctag, &ftag.streamid).encoded_len();
            st.objno = ftag.objno;
            st.offset = ftag.offset;
            st
        };

        st.msize = msize;
        st.meta_only = meta_only;
        st.filepos = 0;
        if stype == StreamType::Edit {
            st.objno = ftag.objno;
            st.offset = ftag.offset;
        }
        st.files.push(StreamFile {
            handle,
            ftag,
            recovery_path: pathstr.to_string(),
            written: 0,
            times: None,
            repack_tgt: false,
        });
        st.curfile = st.files.len() - 1;
        *stream = Some(st);
        Ok(())
    }

    fn ensure_object_open(&mut self) -> crate::Result<()> {
        if self.datahandle.is_some() {
            return Ok(());
        }
        if self.offset != self.recoveryheaderlen {
            return Err(Error::inval(
                "object writes must begin at the recovery header boundary",
            ));
        }
        let mut tmptag = self.cur()?.ftag.clone();
        tmptag.objno = self.objno;
        let ds = &self.pos.repo().datascheme;
        let (objname, erasure, location) = Self::obj_target(&tmptag, ds);
        log::debug!("Opening object \"{}\" for write", objname);
        let mut handle = ds.dal.open(&objname, location, erasure, DalMode::Write)?;
        let header = RecoveryHeader::new(&self.ctag, &self.streamid);
        handle.write(header.to_string().as_bytes())?;
        self.datahandle = Some(handle);
        Ok(())
    }

    /// Append the current file's recovery footer at the write position.
    fn emit_footer(&mut self, eof: bool) -> crate::Result<()> {
        let filepos = self.filepos;
        let file = self.cur()?;
        let finfo = Finfo {
            path: file.recovery_path.clone(),
            size: filepos,
            eof,
        };
        if finfo.encoded_len() != file.ftag.recoverybytes {
            return Err(Error::inval(format!(
                "recovery path \"{}\" does not match the reserved {} bytes",
                finfo.path, file.ftag.recoverybytes
            )));
        }
        let recoverybytes = file.ftag.recoverybytes;
        let handle = self
            .datahandle
            .as_mut()
            .ok_or_else(|| Error::inval("no object open for recovery info"))?;
        handle.write(finfo.to_string().as_bytes())?;
        self.offset += recoverybytes;
        Ok(())
    }

    fn write_inner(&mut self, buf: &[u8]) -> crate::Result<usize> {
        if self.stype == StreamType::Read {
            return Err(Error::inval("READ streams do not accept writes"));
        }
        let objsize = self.cur()?.ftag.objsize;
        let mut consumed = 0;
        while consumed < buf.len() {
            let file_cap = match self.stype {
                StreamType::Edit => {
                    let ftag = &self.cur()?.ftag;
                    if ftag.state == DataState::Comp {
                        return Err(Error::inval("completed files do not accept writes"));
                    }
                    ftag.bytes.saturating_sub(self.filepos)
                }
                _ => u64::MAX,
            };
            if file_cap == 0 {
                return Err(Error::inval("write exceeds the declared file size"));
            }
            let recoverybytes = self.cur()?.ftag.recoverybytes;
            let room = objsize
                .saturating_sub(self.offset)
                .saturating_sub(recoverybytes);
            if room == 0 {
                // the object is full and more data is coming: close the
                // run with a continuation footer
                self.emit_footer(false)?;
                self.object_advance()?;
                self.objfilecount = 1;
                continue;
            }
            self.ensure_object_open()?;
            let count = (buf.len() - consumed)
                .min(usize::try_from(room.min(file_cap)).unwrap_or(usize::MAX));
            let chunk = &buf[consumed..consumed + count];
            let handle = self.datahandle.as_mut().unwrap();
            let wrote = handle.write(chunk)?;
            consumed += wrote;
            self.offset += wrote as u64;
            self.filepos += wrote as u64;
            let filepos = self.filepos;
            let is_create = self.stype == StreamType::Create;
            let file = self.cur_mut()?;
            file.written += wrote as u64;
            if is_create {
                file.ftag.bytes = filepos;
            }

            if self.stype == StreamType::Edit {
                let ftag = &self.cur()?.ftag;
                let file_done = self.filepos == ftag.bytes;
                let object_full =
                    self.offset + ftag.recoverybytes == ftag.objsize;
                if file_done || object_full {
                    // parallel writers own their objects whole, footer
                    // included
                    self.emit_footer(file_done)?;
                    self.object_advance()?;
                    self.objfilecount = 1;
                    if file_done {
                        break;
                    }
                }
            }
        }
        Ok(consumed)
    }

    fn read_inner(&mut self, buf: &mut [u8]) -> crate::Result<usize> {
        if self.stype != StreamType::Read {
            return Err(Error::inval("only READ streams accept reads"));
        }
        let mut out = 0;
        while out < buf.len() {
            let (avail, logical_end) = {
                let ftag = &self.cur()?.ftag;
                (ftag.availbytes, ftag.availbytes.max(self.msize))
            };
            if self.filepos >= logical_end {
                break;
            }
            if self.filepos >= avail {
                // zero-filled tail past the recovered data
                let n = (buf.len() - out)
                    .min(usize::try_from(logical_end - self.filepos).unwrap_or(usize::MAX));
                buf[out..out + n].fill(0);
                out += n;
                self.filepos += n as u64;
                continue;
            }
            if self.meta_only {
                let filepos = self.filepos;
                let file = self.cur_mut()?;
                file.handle.seek(filepos)?;
                let n = file.handle.read(&mut buf[out..])?;
                if n == 0 {
                    break;
                }
                out += n;
                self.filepos += n as u64;
                continue;
            }

            let (objno, objoff, chunk_rem) = {
                let ftag = &self.cur()?.ftag;
                bounds::locate(ftag, self.recoveryheaderlen, self.filepos)?
            };
            if self.datahandle.is_none() || self.objno != objno {
                if let Some(old) = self.datahandle.take() {
                    old.close()?;
                }
                let mut tmptag = self.cur()?.ftag.clone();
                tmptag.objno = objno;
                let ds = &self.pos.repo().datascheme;
                let (objname, erasure, location) = Self::obj_target(&tmptag, ds);
                log::debug!("Opening object \"{}\" for read", objname);
                let mut handle = ds.dal.open(&objname, location, erasure, DalMode::Read)?;
                handle.seek(objoff)?;
                self.datahandle = Some(handle);
                self.objno = objno;
                self.offset = objoff;
            } else if self.offset != objoff {
                self.datahandle.as_mut().unwrap().seek(objoff)?;
                self.offset = objoff;
            }

            let n = (buf.len() - out)
                .min(usize::try_from(chunk_rem.min(avail - self.filepos)).unwrap_or(usize::MAX));
            let got = self.datahandle.as_mut().unwrap().read(&mut buf[out..out + n])?;
            if got == 0 {
                return Err(Error::Io(std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    "object ended before the recorded available bytes",
                )));
            }
            out += got;
            self.filepos += got as u64;
            self.offset += got as u64;
        }
        Ok(out)
    }

    fn edit_seek(&mut self, target: u64) -> crate::Result<()> {
        let ftag = self.cur()?.ftag.clone();
        if target > ftag.bytes {
            return Err(Error::inval("seek beyond the declared file size"));
        }
        if target != ftag.bytes {
            let cap = bounds::chunk_cap(ftag.objsize, self.recoveryheaderlen, ftag.recoverybytes)?;
            let cap0 =
                bounds::first_cap(ftag.objsize, ftag.offset, ftag.recoverybytes)?;
            let aligned =
                target == 0 || (target >= cap0 && (target - cap0) % cap == 0);
            if !aligned {
                return Err(Error::inval(format!(
                    "EDIT seek to {target} is not a chunk boundary"
                )));
            }
        }
        if let Some(handle) = self.datahandle.take() {
            handle.close()?;
        }
        self.filepos = target;
        let (objno, objoff, _) = bounds::locate(&ftag, self.recoveryheaderlen, target)?;
        self.objno = objno;
        self.offset = objoff;
        Ok(())
    }

    fn extend_inner(&mut self, length: u64) -> crate::Result<()> {
        if self.stype != StreamType::Create {
            return Err(Error::inval("extend is legal only on the original CREATE handle"));
        }
        let headerlen = self.recoveryheaderlen;
        let objfilecount = self.objfilecount;
        let file = self.cur_mut()?;
        if file.ftag.state != DataState::Init || file.written > 0 {
            return Err(Error::inval("extend requires an unwritten INIT file"));
        }
        if file.ftag.offset != headerlen || objfilecount != 1 {
            return Err(Error::inval("extend requires an unpacked file"));
        }
        file.ftag.bytes = length;
        file.ftag.state = DataState::Sized;
        file.ftag.writable = true;
        let tag = file.ftag.to_string();
        file.handle.fsetxattr(FTAG_NAME, tag.as_bytes())?;
        file.handle.ftruncate(length)?;
        let fileno = file.ftag.fileno;
        log::debug!(
            "Extended file {} of stream \"{}\" to {} bytes",
            fileno,
            self.streamid,
            length
        );
        Ok(())
    }

    fn truncate_inner(&mut self, length: u64) -> crate::Result<()> {
        if self.stype != StreamType::Edit {
            return Err(Error::inval("truncate requires an EDIT handle"));
        }
        let file = self.cur_mut()?;
        if file.ftag.state != DataState::Comp {
            return Err(Error::inval("truncate requires a completed file"));
        }
        file.handle.ftruncate(length)?;
        if length < file.ftag.availbytes {
            file.ftag.availbytes = length;
            let tag = file.ftag.to_string();
            file.handle.fsetxattr(FTAG_NAME, tag.as_bytes())?;
        }
        self.msize = length;
        Ok(())
    }

    /// Seal the current file of a CREATE stream: final recovery footer
    /// and FIN state.
    fn finalize_file(&mut self) -> crate::Result<()> {
        let file = self.cur_mut()?;
        if file.ftag.state >= DataState::Fin {
            return Ok(());
        }
        if file.ftag.state == DataState::Sized && file.written == 0 {
            return Err(Error::inval(
                "file was extended for parallel writes and must be released, not sealed",
            ));
        }
        if file.written > 0 {
            self.emit_footer(true)?;
        }
        let file = self.cur_mut()?;
        file.ftag.state = DataState::Fin;
        let tag = file.ftag.to_string();
        let tag_name = file.tag_name();
        file.handle.fsetxattr(tag_name, tag.as_bytes())?;
        Ok(())
    }

    fn close_inner(&mut self) -> crate::Result<()> {
        match self.stype {
            StreamType::Read => {
                if let Some(handle) = self.datahandle.take() {
                    handle.close()?;
                }
                for file in self.files.drain(..) {
                    file.handle.close()?;
                }
                Ok(())
            }
            StreamType::Create => {
                self.finalize_file()?;
                if let Some(handle) = self.datahandle.take() {
                    handle.close()?;
                }
                for file in self.files.iter_mut() {
                    file.ftag.state = DataState::Comp;
                    file.ftag.readable = true;
                    file.ftag.writable = false;
                    file.ftag.availbytes = file.ftag.bytes;
                    let tag = file.ftag.to_string();
                    file.handle.fsetxattr(FTAG_NAME, tag.as_bytes())?;
                    if file.repack_tgt {
                        // promotion complete; drop the staging tag
                        match file.handle.fremovexattr(TGT_FTAG_NAME) {
                            Ok(()) | Err(Error::NotFound(_)) => {}
                            Err(e) => return Err(e),
                        }
                    } else {
                        file.handle.ftruncate(file.ftag.bytes)?;
                    }
                    if let Some(times) = file.times.take() {
                        file.handle.futimens(times)?;
                    }
                }
                for file in self.files.drain(..) {
                    file.handle.close()?;
                }
                Ok(())
            }
            StreamType::Edit => {
                if let Some(handle) = self.datahandle.take() {
                    handle.close()?;
                }
                let msize = self.msize;
                let file = self.cur_mut()?;
                // an already-completed file (truncate target) keeps its
                // FTAG; finalization applies to in-flight ones
                if file.ftag.state != DataState::Comp {
                    file.ftag.state = DataState::Comp;
                    file.ftag.readable = true;
                    file.ftag.writable = false;
                    file.ftag.availbytes = file.ftag.bytes;
                    let tag = file.ftag.to_string();
                    file.handle.fsetxattr(FTAG_NAME, tag.as_bytes())?;
                    if msize < file.ftag.bytes {
                        file.handle.ftruncate(file.ftag.bytes)?;
                    }
                }
                if let Some(times) = file.times.take() {
                    file.handle.futimens(times)?;
                }
                for file in self.files.drain(..) {
                    file.handle.close()?;
                }
                Ok(())
            }
        }
    }

    /// Best-effort resource teardown for failed closes.
    fn cleanup(&mut self) {
        if let Some(handle) = self.datahandle.take() {
            if let Err(e) = handle.abort() {
                log::warn!("Failed to abort object handle: {}", e);
            }
        }
        for file in self.files.drain(..) {
            if let Err(e) = file.handle.close() {
                log::warn!("Failed to close meta handle: {}", e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PosMode;
    use crate::recovery::Recovery;
    use crate::testutil::test_env;

    fn pattern(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 251) as u8).collect()
    }

    fn write_file(env: &crate::testutil::TestEnv, path: &str, data: &[u8]) -> String {
        let pos = env.position();
        let mut stream = None;
        DataStream::create(&mut stream, path, &pos, 0o644, "TEST").unwrap();
        let mut st = stream.unwrap();
        st.write(data).unwrap();
        let sid = st.stream_id().to_string();
        st.close().unwrap();
        sid
    }

    fn read_file(env: &crate::testutil::TestEnv, path: &str) -> Vec<u8> {
        let pos = env.position();
        let mut stream = None;
        DataStream::open(&mut stream, StreamType::Read, path, &pos).unwrap();
        let mut st = stream.unwrap();
        let mut out = Vec::new();
        let mut buf = [0u8; 777];
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

    #[test]
    fn single_file_round_trip() {
        let env = test_env(1 << 20, 4);
        let data = pattern(2048);
        write_file(&env, "plain", &data);
        assert_eq!(read_file(&env, "plain"), data);
    }

    #[test]
    fn small_files_pack_into_one_object() {
        let env = test_env(1 << 20, 4);
        let pos = env.position();
        let mut stream = None;
        let payloads = [pattern(2048), pattern(110), pattern(4096)];
        for (idx, data) in payloads.iter().enumerate() {
            DataStream::create(&mut stream, &format!("f{}", idx + 1), &pos, 0o644, "TEST")
                .unwrap();
            let st = stream.as_mut().unwrap();
            st.write(data).unwrap();
            assert_eq!(st.file_tag().unwrap().objno, 0);
            assert_eq!(st.file_tag().unwrap().fileno, idx as u64);
        }
        stream.take().unwrap().close().unwrap();

        assert_eq!(env.dal.object_count(), 1);
        for (idx, data) in payloads.iter().enumerate() {
            assert_eq!(&read_file(&env, &format!("f{}", idx + 1)), data);
        }
    }

    #[test]
    fn packed_object_recovery_scan() {
        let env = test_env(1 << 20, 4);
        let pos = env.position();
        let mut stream = None;
        for (path, len) in [("file1", 2048usize), ("file2", 110)] {
            DataStream::create(&mut stream, path, &pos, 0o644, "TEST").unwrap();
            stream.as_mut().unwrap().write(&pattern(len)).unwrap();
        }
        let st = stream.as_ref().unwrap();
        let objname = st.file_tag().unwrap().object_tgt();
        stream.take().unwrap().close().unwrap();

        let object = env.dal.object_bytes(&objname).unwrap();
        let mut recovery = Recovery::new(&object).unwrap();
        assert_eq!(recovery.header().ctag, "TEST");
        let (finfo, range) = recovery.next_file().unwrap();
        assert_eq!((finfo.path.as_str(), finfo.size, finfo.eof), ("file1", 2048, true));
        assert_eq!(object[range].to_vec(), pattern(2048));
        let (finfo, range) = recovery.next_file().unwrap();
        assert_eq!((finfo.path.as_str(), finfo.size, finfo.eof), ("file2", 110, true));
        assert_eq!(range.len(), 110);
        assert!(recovery.next_file().is_none());
    }

    #[test]
    fn large_file_chunks_across_objects() {
        // tiny objects force chunking
        let env = test_env(4096, 4);
        let data = pattern(20000);
        write_file(&env, "big", &data);

        let pos = env.position();
        let mut stream = None;
        DataStream::open(&mut stream, StreamType::Read, "big", &pos).unwrap();
        let st = stream.as_ref().unwrap();
        let ftag = st.file_tag().unwrap();
        assert_eq!(ftag.objno, 0);
        let endobj = DataStream::file_bounds(ftag, st.header_len()).unwrap();
        assert!(endobj > 0);
        assert_eq!(env.dal.object_count() as u64, endobj + 1);
        stream.take().unwrap().close().unwrap();

        assert_eq!(read_file(&env, "big"), data);
    }

    #[test]
    fn truncate_extends_with_zeros() {
        let env = test_env(1 << 20, 4);
        let data = pattern(110);
        write_file(&env, "short", &data);

        let pos = env.position();
        let mut stream = None;
        DataStream::open(&mut stream, StreamType::Edit, "short", &pos).unwrap();
        let mut st = stream.take().unwrap();
        st.truncate(1024).unwrap();
        st.close().unwrap();

        let read = read_file(&env, "short");
        assert_eq!(read.len(), 1024);
        assert_eq!(&read[..110], &data[..]);
        assert!(read[110..].iter().all(|b| *b == 0));
    }

    #[test]
    fn truncate_shrinks_readable_size() {
        let env = test_env(1 << 20, 4);
        write_file(&env, "wide", &pattern(4096));

        let pos = env.position();
        let mut stream = None;
        DataStream::open(&mut stream, StreamType::Edit, "wide", &pos).unwrap();
        let mut st = stream.take().unwrap();
        st.truncate(1000).unwrap();
        st.close().unwrap();

        assert_eq!(read_file(&env, "wide"), pattern(4096)[..1000].to_vec());
    }

    #[test]
    fn zero_byte_file_reads_direct() {
        let env = test_env(1 << 20, 4);
        write_file(&env, "empty", &[]);
        assert_eq!(read_file(&env, "empty"), Vec::<u8>::new());
        assert_eq!(env.dal.object_count(), 0);
    }

    #[test]
    fn parallel_extend_write() {
        let env = test_env(4096, 1);
        let total: u64 = 17000;
        let data = pattern(total as usize);

        let pos = env.position();
        let mut stream = None;
        DataStream::create(&mut stream, "pf", &pos, 0o644, "TEST").unwrap();
        let mut st = stream.take().unwrap();
        st.extend(total).unwrap();
        let nchunks = {
            let mut n = 0;
            while st.chunk_bounds(n).is_ok() {
                n += 1;
            }
            n
        };
        st.release().unwrap();
        assert!(nchunks > 2);

        // write chunks out of order, one EDIT handle each
        let order: Vec<u64> = (0..nchunks).rev().collect();
        for chunk in order {
            let pos = env.position();
            let mut stream = None;
            DataStream::open(&mut stream, StreamType::Edit, "pf", &pos).unwrap();
            let mut st = stream.take().unwrap();
            let (off, size) = st.chunk_bounds(chunk).unwrap();
            st.seek(off as i64, Whence::Set).unwrap();
            let wrote = st
                .write(&data[off as usize..(off + size) as usize])
                .unwrap();
            assert_eq!(wrote as u64, size);
            st.release().unwrap();
        }

        // finalization pass
        let mut stream = None;
        DataStream::open(&mut stream, StreamType::Edit, "pf", &pos).unwrap();
        stream.take().unwrap().close().unwrap();

        let pos = env.position();
        assert_eq!(pos.ctxt().stat("pf").unwrap().size, total);
        assert_eq!(read_file(&env, "pf"), data);
    }

    #[test]
    fn edit_seek_must_hit_chunk_boundaries() {
        let env = test_env(4096, 1);
        let pos = env.position();
        let mut stream = None;
        DataStream::create(&mut stream, "pf2", &pos, 0o644, "TEST").unwrap();
        let mut st = stream.take().unwrap();
        st.extend(10000).unwrap();
        st.release().unwrap();

        let mut stream = None;
        DataStream::open(&mut stream, StreamType::Edit, "pf2", &pos).unwrap();
        let mut st = stream.take().unwrap();
        let (off, _) = st.chunk_bounds(1).unwrap();
        assert!(st.seek(off as i64 + 17, Whence::Set).is_err());
    }

    #[test]
    fn broken_handle_only_releases() {
        let env = test_env(1 << 20, 4);
        write_file(&env, "pf3", &pattern(100));

        let pos = env.position();
        let mut stream = None;
        DataStream::open(&mut stream, StreamType::Read, "pf3", &pos).unwrap();
        let mut st = stream.take().unwrap();

        // lose the backing object out from under the open handle
        use crate::dal::Dal;
        let objname = st.file_tag().unwrap().object_tgt();
        let ds = &env.cfg.repo(env.nsref).datascheme;
        ds.dal.delete(&objname, ds.location_of(&objname)).unwrap();

        let mut buf = [0u8; 32];
        assert!(st.read(&mut buf).is_err());
        assert!(matches!(st.read(&mut buf), Err(Error::HandleBroken)));
        assert!(matches!(st.seek(0, Whence::Set), Err(Error::HandleBroken)));
        st.release().unwrap();
    }

    #[test]
    fn create_requires_clean_client_tag() {
        let env = test_env(1 << 20, 4);
        let pos = env.position();
        let mut stream = None;
        assert!(matches!(
            DataStream::create(&mut stream, "x", &pos, 0o644, "BAD|TAG"),
            Err(Error::InvalidArgument(_))
        ));
    }

    #[test]
    fn create_enforces_permissions() {
        let env = test_env(1 << 20, 4);
        let cfg = &env.cfg;
        let nsref = cfg.find_namespace("/pool").unwrap();
        let mut pos = cfg.establish_position(nsref, PosMode::Batch).unwrap();
        pos.perms = crate::config::NsPerms::ro();
        let mut stream = None;
        assert!(matches!(
            DataStream::create(&mut stream, "x", &pos, 0o644, "TEST"),
            Err(Error::PermissionDenied(_))
        ));
    }

    #[test]
    fn set_recovery_path_before_writes() {
        let env = test_env(1 << 20, 4);
        let pos = env.position();
        let mut stream = None;
        DataStream::create(&mut stream, "tmp-name", &pos, 0o644, "TEST").unwrap();
        let st = stream.as_mut().unwrap();
        st.set_recovery_path("canonical/long/path").unwrap();
        st.write(&pattern(100)).unwrap();
        let objname = st.file_tag().unwrap().object_tgt();
        stream.take().unwrap().close().unwrap();

        let object = env.dal.object_bytes(&objname).unwrap();
        let mut recovery = Recovery::new(&object).unwrap();
        let (finfo, _) = recovery.next_file().unwrap();
        assert_eq!(finfo.path, "canonical/long/path");
    }

    #[test]
    fn utimens_is_buffered_until_close() {
        let env = test_env(1 << 20, 4);
        let pos = env.position();
        let mut stream = None;
        DataStream::create(&mut stream, "timed", &pos, 0o644, "TEST").unwrap();
        let st = stream.as_mut().unwrap();
        st.write(&pattern(10)).unwrap();
        st.utimens(FileTimes {
            atime: 11111,
            mtime: 22222,
        })
        .unwrap();
        stream.take().unwrap().close().unwrap();

        let st = pos.ctxt().stat("timed").unwrap();
        assert_eq!(st.mtime, 22222);
        assert_eq!(st.atime, 11111);
    }
}
