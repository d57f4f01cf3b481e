//! The per-file tag: every MarFS file carries exactly one.

use std::fmt;
use std::str::FromStr;

use super::{check_version, parse_num, sanitize, split_tagged, take_section};
use crate::dal::Erasure;
use crate::error::Error;

pub const FTAG_CURRENT_MAJORVERSION: u32 = 0;
pub const FTAG_CURRENT_MINORVERSION: u32 = 1;

/// Xattr name the FTAG is stored under.
pub const FTAG_NAME: &str = "MARFS-FILE";
/// Pre-repack FTAG stash, left on a file whose data has been repacked.
pub const ORIG_FTAG_NAME: &str = "ORIG-MARFS-FILE";
/// In-flight repack target tag.
pub const TGT_FTAG_NAME: &str = "TGT-MARFS-FILE";

/// Data object state of a file. Transitions are monotonic:
/// `Init -> Sized -> Fin -> Comp`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum DataState {
    /// No file data exists yet.
    Init,
    /// Known lower bound on the file size.
    Sized,
    /// Known total file size.
    Fin,
    /// All data written.
    Comp,
}

impl DataState {
    fn token(&self) -> &'static str {
        match self {
            DataState::Init => "INIT",
            DataState::Sized => "SIZED",
            DataState::Fin => "FIN",
            DataState::Comp => "COMP",
        }
    }
}

/// Kind of entry a reference-directory name refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetaKind {
    /// A meta file id; the associated number is a file number.
    File,
    /// A rebuild marker; the associated number is an object number.
    RebuildMarker,
    /// A repack marker; the associated number is a file number.
    RepackMarker,
    Unknown,
}

/// The file tag.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ftag {
    pub majorversion: u32,
    pub minorversion: u32,
    // stream identification
    pub ctag: String,
    pub streamid: String,
    // stream structure
    pub objfiles: u64,
    pub objsize: u64,
    // reference tree shape
    pub refbreadth: u32,
    pub refdepth: u32,
    pub refdigits: u32,
    // file position
    pub fileno: u64,
    pub objno: u64,
    pub offset: u64,
    pub endofstream: bool,
    // data content
    pub protection: Erasure,
    pub bytes: u64,
    pub availbytes: u64,
    pub recoverybytes: u64,
    pub state: DataState,
    pub readable: bool,
    pub writable: bool,
}

impl Ftag {
    fn access_token(&self) -> &'static str {
        match (self.readable, self.writable) {
            (false, false) => "NO",
            (true, false) => "RO",
            (false, true) => "WO",
            (true, true) => "RW",
        }
    }

    /// Meta file id: the final component of the file's reference path.
    pub fn meta_tgt(&self) -> String {
        format!(
            "{}|{}|{}",
            sanitize(&self.ctag),
            sanitize(&self.streamid),
            self.fileno
        )
    }

    /// Rebuild marker name for this file's object.
    pub fn rebuild_marker(&self) -> String {
        format!(
            "{}|{}|{}rebuild",
            sanitize(&self.ctag),
            sanitize(&self.streamid),
            self.objno
        )
    }

    /// Repack marker name. Repack markers are not hashed to a reference
    /// location of their own; they sit alongside the original meta
    /// target.
    pub fn repack_marker(&self) -> String {
        format!(
            "{}|{}|{}REPACK",
            sanitize(&self.ctag),
            sanitize(&self.streamid),
            self.fileno
        )
    }

    /// Object id for this file's current object number.
    pub fn object_tgt(&self) -> String {
        format!(
            "{}|{}|{}",
            sanitize(&self.ctag),
            sanitize(&self.streamid),
            self.objno
        )
    }

    /// Classify a reference-directory entry name and extract its
    /// file/object number.
    pub fn parse_meta_info(name: &str) -> (u64, MetaKind) {
        let tail = match name.rfind('|') {
            Some(idx) => &name[idx + 1..],
            None => return (0, MetaKind::Unknown),
        };
        let digits: String = tail.chars().take_while(|c| c.is_ascii_digit()).collect();
        if digits.is_empty() {
            return (0, MetaKind::Unknown);
        }
        let number = match digits.parse::<u64>() {
            Ok(n) => n,
            Err(_) => return (0, MetaKind::Unknown),
        };
        match &tail[digits.len()..] {
            "" => (number, MetaKind::File),
            "rebuild" => (number, MetaKind::RebuildMarker),
            "REPACK" => (number, MetaKind::RepackMarker),
            _ => (0, MetaKind::Unknown),
        }
    }
}

impl fmt::Display for Ftag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "VER({}.{:03})STM({}|{}|F{}-D{})REF(B{}-D{}-d{})POS(f{}-o{}-@{}-e{})DAT(n{}-e{}-o{}-p{}-b{}-a{}-r{}-{}-{})",
            self.majorversion,
            self.minorversion,
            self.ctag,
            self.streamid,
            self.objfiles,
            self.objsize,
            self.refbreadth,
            self.refdepth,
            self.refdigits,
            self.fileno,
            self.objno,
            self.offset,
            self.endofstream as u8,
            self.protection.n,
            self.protection.e,
            self.protection.o,
            self.protection.partsz,
            self.bytes,
            self.availbytes,
            self.recoverybytes,
            self.state.token(),
            self.access_token(),
        )
    }
}

impl FromStr for Ftag {
    type Err = Error;

    fn from_str(value: &str) -> crate::Result<Self> {
        // version section
        let (ver, rest) = take_section(value, "VER")?;
        check_version(ver, FTAG_CURRENT_MAJORVERSION, FTAG_CURRENT_MINORVERSION)?;

        // stream identification
        let (stm, rest) = take_section(rest, "STM")?;
        let mut parts = stm.splitn(3, '|');
        let ctag = parts
            .next()
            .filter(|p| !p.is_empty())
            .ok_or_else(|| Error::tag("FTAG stream info lacks a client tag"))?;
        let streamid = parts
            .next()
            .filter(|p| !p.is_empty())
            .ok_or_else(|| Error::tag("FTAG stream info lacks a stream id"))?;
        let shape = parts
            .next()
            .ok_or_else(|| Error::tag("FTAG stream info lacks object values"))?;
        let mut objfiles = None;
        let mut objsize = None;
        for field in shape.split('-') {
            match split_tagged(field)? {
                ("F", v) => objfiles = Some(parse_num(v, "objfiles")?),
                ("D", v) => objsize = Some(parse_num(v, "objsize")?),
                (key, _) => {
                    return Err(Error::tag(format!("unrecognized stream value tag \"{key}\"")))
                }
            }
        }
        let objfiles = objfiles.ok_or_else(|| Error::tag("FTAG lacks an objfiles value"))?;
        let objsize = objsize.ok_or_else(|| Error::tag("FTAG lacks an objsize value"))?;

        // reference tree shape
        let (reftree, rest) = take_section(rest, "REF")?;
        let mut breadth = None;
        let mut depth = None;
        let mut digits = None;
        for field in reftree.split('-') {
            match split_tagged(field)? {
                ("B", v) => breadth = Some(parse_num(v, "refbreadth")?),
                ("D", v) => depth = Some(parse_num(v, "refdepth")?),
                ("d", v) => digits = Some(parse_num(v, "refdigits")?),
                (key, _) => {
                    return Err(Error::tag(format!("unrecognized ref tree value tag \"{key}\"")))
                }
            }
        }
        let (breadth, depth, digits) = match (breadth, depth, digits) {
            (Some(b), Some(d), Some(g)) => (b, d, g),
            _ => return Err(Error::tag("FTAG lacks some reference tree values")),
        };

        // file position
        let (posinfo, rest) = take_section(rest, "POS")?;
        let mut fileno = None;
        let mut objno = None;
        let mut offset = None;
        let mut endofstream = None;
        for field in posinfo.split('-') {
            match split_tagged(field)? {
                ("f", v) => fileno = Some(parse_num(v, "fileno")?),
                ("o", v) => objno = Some(parse_num(v, "objno")?),
                ("@", v) => offset = Some(parse_num(v, "offset")?),
                ("e", v) => {
                    endofstream = Some(match parse_num(v, "endofstream")? {
                        0 => false,
                        1 => true,
                        other => {
                            return Err(Error::tag(format!(
                                "unexpected end-of-stream value {other}"
                            )))
                        }
                    })
                }
                (key, _) => {
                    return Err(Error::tag(format!("unrecognized position value tag \"{key}\"")))
                }
            }
        }
        let (fileno, objno, offset, endofstream) = match (fileno, objno, offset, endofstream) {
            (Some(f), Some(o), Some(at), Some(e)) => (f, o, at, e),
            _ => return Err(Error::tag("FTAG lacks some position values")),
        };

        // data content
        let (dat, rest) = take_section(rest, "DAT")?;
        if !rest.is_empty() {
            return Err(Error::tag(format!("FTAG has trailing characters \"{rest}\"")));
        }
        let mut protection = Erasure::default();
        let mut bytes = None;
        let mut avail = None;
        let mut recovery = None;
        let mut state = None;
        let mut access = None;
        for field in dat.split('-') {
            match field {
                "INIT" => state = Some(DataState::Init),
                "SIZED" => state = Some(DataState::Sized),
                "FIN" => state = Some(DataState::Fin),
                "COMP" => state = Some(DataState::Comp),
                "NO" => access = Some((false, false)),
                "RO" => access = Some((true, false)),
                "WO" => access = Some((false, true)),
                "RW" => access = Some((true, true)),
                _ => match split_tagged(field)? {
                    ("n", v) => protection.n = u16::try_from(parse_num(v, "protection N")?)?,
                    ("e", v) => protection.e = u16::try_from(parse_num(v, "protection E")?)?,
                    ("o", v) => protection.o = u16::try_from(parse_num(v, "protection O")?)?,
                    ("p", v) => protection.partsz = parse_num(v, "protection partsz")?,
                    ("b", v) => bytes = Some(parse_num(v, "bytes")?),
                    ("a", v) => avail = Some(parse_num(v, "availbytes")?),
                    ("r", v) => recovery = Some(parse_num(v, "recoverybytes")?),
                    (key, _) => {
                        return Err(Error::tag(format!(
                            "unrecognized data content value tag \"{key}\""
                        )))
                    }
                },
            }
        }
        let (bytes, availbytes, recoverybytes) = match (bytes, avail, recovery) {
            (Some(b), Some(a), Some(r)) => (b, a, r),
            _ => return Err(Error::tag("FTAG lacks some data content values")),
        };
        let state = state.ok_or_else(|| Error::tag("FTAG lacks a data state"))?;
        let (readable, writable) =
            access.ok_or_else(|| Error::tag("FTAG lacks a data access value"))?;

        Ok(Ftag {
            majorversion: FTAG_CURRENT_MAJORVERSION,
            minorversion: FTAG_CURRENT_MINORVERSION,
            ctag: ctag.to_string(),
            streamid: streamid.to_string(),
            objfiles,
            objsize,
            refbreadth: u32::try_from(breadth)?,
            refdepth: u32::try_from(depth)?,
            refdigits: u32::try_from(digits)?,
            fileno,
            objno,
            offset,
            endofstream,
            protection,
            bytes,
            availbytes,
            recoverybytes,
            state,
            readable,
            writable,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    pub(crate) fn sample() -> Ftag {
        Ftag {
            majorversion: FTAG_CURRENT_MAJORVERSION,
            minorversion: FTAG_CURRENT_MINORVERSION,
            ctag: "CLIENT".to_string(),
            streamid: "stream-0001".to_string(),
            objfiles: 4,
            objsize: 1 << 20,
            refbreadth: 3,
            refdepth: 3,
            refdigits: 3,
            fileno: 7,
            objno: 2,
            offset: 345,
            endofstream: false,
            protection: Erasure {
                n: 10,
                e: 2,
                o: 1,
                partsz: 1024,
            },
            bytes: 1048576,
            availbytes: 1048576,
            recoverybytes: 234,
            state: DataState::Comp,
            readable: true,
            writable: false,
        }
    }

    #[test]
    fn round_trip() {
        let tag = sample();
        let encoded = tag.to_string();
        assert_eq!(
            encoded,
            "VER(0.001)STM(CLIENT|stream-0001|F4-D1048576)REF(B3-D3-d3)\
             POS(f7-o2-@345-e0)DAT(n10-e2-o1-p1024-b1048576-a1048576-r234-COMP-RO)"
                .replace(char::is_whitespace, "")
        );
        let reparsed: Ftag = encoded.parse().unwrap();
        assert_eq!(reparsed, tag);
        assert_eq!(reparsed.to_string(), encoded);
    }

    #[test]
    fn state_order_is_monotonic() {
        assert!(DataState::Init < DataState::Sized);
        assert!(DataState::Sized < DataState::Fin);
        assert!(DataState::Fin < DataState::Comp);
    }

    #[test]
    fn rejects_unknown_sections_and_keys() {
        let tag = sample().to_string();
        assert!(tag.replace("POS(", "XOS(").parse::<Ftag>().is_err());
        assert!(tag.replace("-b1048576", "-q1048576").parse::<Ftag>().is_err());
        assert!(format!("{tag}JUNK(1)").parse::<Ftag>().is_err());
    }

    #[test]
    fn rejects_version_mismatch() {
        let tag = sample().to_string().replace("VER(0.001)", "VER(9.001)");
        assert!(tag.parse::<Ftag>().is_err());
    }

    #[test]
    fn overflow_fails_with_range_error() {
        let tag = sample()
            .to_string()
            .replace("-b1048576", "-b99999999999999999999999999");
        assert!(matches!(tag.parse::<Ftag>(), Err(Error::Overflow(_))));
    }

    #[test]
    fn name_generation_sanitizes_reserved_chars() {
        let mut tag = sample();
        tag.streamid = "str|eam".to_string();
        assert_eq!(tag.meta_tgt(), "CLIENT|str#eam|7");
        assert_eq!(tag.rebuild_marker(), "CLIENT|str#eam|2rebuild");
        assert_eq!(tag.repack_marker(), "CLIENT|str#eam|7REPACK");
        assert_eq!(tag.object_tgt(), "CLIENT|str#eam|2");
    }

    #[test]
    fn meta_info_classification() {
        assert_eq!(
            Ftag::parse_meta_info("CLIENT|stream|42"),
            (42, MetaKind::File)
        );
        assert_eq!(
            Ftag::parse_meta_info("CLIENT|stream|3rebuild"),
            (3, MetaKind::RebuildMarker)
        );
        assert_eq!(
            Ftag::parse_meta_info("CLIENT|stream|9REPACK"),
            (9, MetaKind::RepackMarker)
        );
        assert_eq!(
            Ftag::parse_meta_info("CLIENT|stream|9trailing"),
            (0, MetaKind::Unknown)
        );
        assert_eq!(Ftag::parse_meta_info("no-separator"), (0, MetaKind::Unknown));
    }
}
