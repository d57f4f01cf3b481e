//! Inline recovery records. Every data object begins with a header
//! naming its stream and ends each file's byte run with a footer naming
//! the file, so an erasure-intact object alone is enough to reconstruct
//! what it held, even with the metadata store destroyed.
//!
//! Object layout: `[header][file bytes][footer][file bytes][footer]...`.
//! A footer's size field is cumulative over the whole file through the
//! end of the object, and its end-of-file flag distinguishes a finished
//! file from one continuing into the next object. Footers carry a
//! fixed-width trailing path length, so the [`Recovery`] scan locates
//! them backwards from the object tail, then yields files in forward
//! order.

use std::collections::VecDeque;
use std::fmt;
use std::ops::Range;
use std::str::FromStr;

use crate::error::Error;
use crate::tagging::{parse_num, take_section};

pub const RECOVERY_CURRENT_MAJORVERSION: u32 = 0;
pub const RECOVERY_CURRENT_MINORVERSION: u32 = 1;

const HEADER_TAG: &str = "RHEAD";
const FOOTER_TAG: &str = "RTAIL";
// "RTAIL(" + path + '|' + 20-digit size + '|' + flag + '|' + 10-digit
// path length + ')'
const FOOTER_FIXED_LEN: usize = 41;

/// Per-object stream header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecoveryHeader {
    pub majorversion: u32,
    pub minorversion: u32,
    pub ctag: String,
    pub streamid: String,
}

impl RecoveryHeader {
    pub fn new(ctag: &str, streamid: &str) -> Self {
        RecoveryHeader {
            majorversion: RECOVERY_CURRENT_MAJORVERSION,
            minorversion: RECOVERY_CURRENT_MINORVERSION,
            ctag: ctag.to_string(),
            streamid: streamid.to_string(),
        }
    }

    /// Encoded length, fixed for the life of a stream.
    pub fn encoded_len(&self) -> u64 {
        self.to_string().len() as u64
    }
}

impl fmt::Display for RecoveryHeader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{HEADER_TAG}({}.{:03}|{}|{})",
            self.majorversion, self.minorversion, self.ctag, self.streamid
        )
    }
}

impl FromStr for RecoveryHeader {
    type Err = Error;

    fn from_str(value: &str) -> crate::Result<Self> {
        let (content, _rest) = take_section(value, HEADER_TAG)?;
        let mut parts = content.splitn(3, '|');
        let version = parts
            .next()
            .ok_or_else(|| Error::tag("recovery header lacks a version"))?;
        let (maj, min) = version
            .split_once('.')
            .ok_or_else(|| Error::tag(format!("malformed recovery version \"{version}\"")))?;
        let majorversion = u32::try_from(parse_num(maj, "recovery major version")?)?;
        let minorversion = u32::try_from(parse_num(min, "recovery minor version")?)?;
        if majorversion != RECOVERY_CURRENT_MAJORVERSION
            || minorversion != RECOVERY_CURRENT_MINORVERSION
        {
            return Err(Error::tag(format!(
                "unrecognized recovery version \"{version}\""
            )));
        }
        let ctag = parts
            .next()
            .filter(|p| !p.is_empty())
            .ok_or_else(|| Error::tag("recovery header lacks a client tag"))?;
        let streamid = parts
            .next()
            .filter(|p| !p.is_empty())
            .ok_or_else(|| Error::tag("recovery header lacks a stream id"))?;
        Ok(RecoveryHeader {
            majorversion,
            minorversion,
            ctag: ctag.to_string(),
            streamid: streamid.to_string(),
        })
    }
}

/// Per-file recovery info, closing a file's byte run within one object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Finfo {
    /// Path recorded for reconstruction; normally the user-visible path
    /// at creation, overridable via `set_recovery_path`.
    pub path: String,
    /// Bytes of the file written through the end of this object. In the
    /// file's final object this is the total file size.
    pub size: u64,
    pub eof: bool,
}

impl Finfo {
    /// Encoded footer length for a recovery path; stored in the FTAG as
    /// `recoverybytes` and fixed at file creation.
    pub fn recovery_bytes(path: &str) -> u64 {
        (FOOTER_FIXED_LEN + path.len()) as u64
    }

    pub fn encoded_len(&self) -> u64 {
        Self::recovery_bytes(&self.path)
    }

    /// Parse the footer terminating `bytes`, returning it and its encoded
    /// length.
    pub fn parse_suffix(bytes: &[u8]) -> crate::Result<(Finfo, usize)> {
        if bytes.len() < FOOTER_FIXED_LEN || *bytes.last().unwrap() != b')' {
            return Err(Error::tag("object tail holds no recovery footer"));
        }
        let lenfield = &bytes[bytes.len() - 11..bytes.len() - 1];
        let lenfield = std::str::from_utf8(lenfield)
            .map_err(|_| Error::tag("recovery footer length field is not ASCII"))?;
        let pathlen = usize::try_from(parse_num(lenfield, "recovery path length")?)?;
        let total = FOOTER_FIXED_LEN + pathlen;
        if bytes.len() < total {
            return Err(Error::tag("recovery footer is truncated"));
        }
        let footer = &bytes[bytes.len() - total..];
        let footer = std::str::from_utf8(footer)
            .map_err(|_| Error::tag("recovery footer is not ASCII"))?;
        let body = footer
            .strip_prefix(FOOTER_TAG)
            .and_then(|r| r.strip_prefix('('))
            .and_then(|r| r.strip_suffix(')'))
            .ok_or_else(|| Error::tag("recovery footer frame is malformed"))?;
        // path may contain any character, so split the fixed fields from
        // the right
        if body.len() < pathlen + 2 {
            return Err(Error::tag("recovery footer is malformed"));
        }
        let path = &body[..pathlen];
        let fields = body[pathlen..]
            .strip_prefix('|')
            .ok_or_else(|| Error::tag("recovery footer is malformed"))?;
        let mut parts = fields.split('|');
        let size = parse_num(
            parts.next().unwrap_or_default(),
            "recovery size",
        )?;
        let eof = match parts.next() {
            Some("E") => true,
            Some("-") => false,
            _ => return Err(Error::tag("recovery footer eof flag is malformed")),
        };
        Ok((
            Finfo {
                path: path.to_string(),
                size,
                eof,
            },
            total,
        ))
    }
}

impl fmt::Display for Finfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{FOOTER_TAG}({}|{:020}|{}|{:010})",
            self.path,
            self.size,
            if self.eof { 'E' } else { '-' },
            self.path.len()
        )
    }
}

/// Stateful scan over the objects of one stream, yielding each file's
/// info and the range its content occupies within the supplied object
/// buffer.
#[derive(Debug)]
pub struct Recovery {
    header: RecoveryHeader,
    entries: VecDeque<(Finfo, Range<usize>)>,
}

fn scan_object(object: &[u8], header_len: usize) -> crate::Result<VecDeque<(Finfo, Range<usize>)>> {
    let mut footers = Vec::new();
    let mut end = object.len();
    while end > header_len {
        let (finfo, flen) = Finfo::parse_suffix(&object[..end])?;
        end -= flen;
        footers.push((finfo, end, end + flen));
    }
    footers.reverse();

    let mut entries = VecDeque::with_capacity(footers.len());
    let mut cursor = header_len;
    for (finfo, start, fend) in footers {
        if start < cursor {
            return Err(Error::tag("recovery footers overlap"));
        }
        entries.push_back((finfo, cursor..start));
        cursor = fend;
    }
    if cursor != object.len() {
        return Err(Error::tag("object holds bytes past the final footer"));
    }
    Ok(entries)
}

fn parse_header_prefix(object: &[u8]) -> crate::Result<RecoveryHeader> {
    let end = object
        .iter()
        .position(|b| *b == b')')
        .ok_or_else(|| Error::tag("object holds no recovery header"))?;
    let text = std::str::from_utf8(&object[..=end])
        .map_err(|_| Error::tag("recovery header is not ASCII"))?;
    text.parse()
}

impl Recovery {
    /// Begin a scan with the first available object of a stream.
    pub fn new(object: &[u8]) -> crate::Result<Self> {
        let header = parse_header_prefix(object)?;
        let header_len = header.encoded_len() as usize;
        let entries = scan_object(object, header_len)?;
        Ok(Recovery { header, entries })
    }

    pub fn header(&self) -> &RecoveryHeader {
        &self.header
    }

    /// Next file in forward order: its info plus the range of `object`
    /// holding its content.
    pub fn next_file(&mut self) -> Option<(Finfo, Range<usize>)> {
        self.entries.pop_front()
    }

    /// Feed the next object of the same stream. The previous object must
    /// be fully drained.
    pub fn continue_with(&mut self, object: &[u8]) -> crate::Result<()> {
        if !self.entries.is_empty() {
            return Err(Error::inval("previous object was not fully drained"));
        }
        let header = parse_header_prefix(object)?;
        if header != self.header {
            return Err(Error::tag("object belongs to a different stream"));
        }
        self.entries = scan_object(object, header.encoded_len() as usize)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn build_object(header: &RecoveryHeader, files: &[(&str, &[u8], u64, bool)]) -> Vec<u8> {
        let mut object = header.to_string().into_bytes();
        for (path, content, cumulative, eof) in files {
            object.extend_from_slice(content);
            let finfo = Finfo {
                path: path.to_string(),
                size: *cumulative,
                eof: *eof,
            };
            object.extend_from_slice(finfo.to_string().as_bytes());
        }
        object
    }

    #[test]
    fn header_round_trip() {
        let header = RecoveryHeader::new("CLIENT", "stream-17");
        let encoded = header.to_string();
        assert_eq!(encoded, "RHEAD(0.001|CLIENT|stream-17)");
        assert_eq!(encoded.parse::<RecoveryHeader>().unwrap(), header);
        assert_eq!(header.encoded_len(), encoded.len() as u64);
    }

    #[test]
    fn footer_length_is_deterministic() {
        let finfo = Finfo {
            path: "some/user/path".to_string(),
            size: 12345,
            eof: true,
        };
        assert_eq!(finfo.to_string().len() as u64, finfo.encoded_len());
        assert_eq!(Finfo::recovery_bytes("some/user/path"), finfo.encoded_len());
    }

    #[test]
    fn packed_object_scan() {
        let header = RecoveryHeader::new("CLIENT", "s1");
        let object = build_object(
            &header,
            &[
                ("file1", &[b'a'; 2048], 2048, true),
                ("file2", &[b'b'; 110], 110, true),
                ("file3", &[b'c'; 300], 300, false),
            ],
        );

        let mut recovery = Recovery::new(&object).unwrap();
        assert_eq!(recovery.header(), &header);

        let (finfo, range) = recovery.next_file().unwrap();
        assert_eq!(finfo.path, "file1");
        assert_eq!(finfo.size, 2048);
        assert!(finfo.eof);
        assert_eq!(range.len(), 2048);
        assert!(object[range].iter().all(|b| *b == b'a'));

        let (finfo, range) = recovery.next_file().unwrap();
        assert_eq!((finfo.path.as_str(), finfo.size, finfo.eof), ("file2", 110, true));
        assert_eq!(range.len(), 110);

        let (finfo, range) = recovery.next_file().unwrap();
        assert_eq!((finfo.path.as_str(), finfo.size, finfo.eof), ("file3", 300, false));
        assert_eq!(range.len(), 300);
        assert!(recovery.next_file().is_none());
    }

    #[test]
    fn chunked_file_continues_into_next_object() {
        let header = RecoveryHeader::new("CLIENT", "s2");
        let first = build_object(&header, &[("big", &[b'x'; 500], 500, false)]);
        let second = build_object(&header, &[("big", &[b'y'; 200], 700, true)]);

        let mut recovery = Recovery::new(&first).unwrap();
        let (finfo, range) = recovery.next_file().unwrap();
        assert_eq!((finfo.size, finfo.eof), (500, false));
        assert_eq!(range.len(), 500);

        recovery.continue_with(&second).unwrap();
        let (finfo, range) = recovery.next_file().unwrap();
        // final footer carries the total file size
        assert_eq!((finfo.size, finfo.eof), (700, true));
        assert_eq!(range.len(), 200);
    }

    #[test]
    fn mismatched_stream_is_rejected() {
        let first = build_object(&RecoveryHeader::new("CLIENT", "s3"), &[]);
        let second = build_object(&RecoveryHeader::new("CLIENT", "other"), &[]);
        let mut recovery = Recovery::new(&first).unwrap();
        assert!(recovery.continue_with(&second).is_err());
    }

    #[test]
    fn paths_with_separators_survive() {
        let header = RecoveryHeader::new("CLIENT", "s4");
        let tricky = "dir|with(odd)chars/name";
        let object = build_object(&header, &[(tricky, b"data", 4, true)]);
        let mut recovery = Recovery::new(&object).unwrap();
        let (finfo, _) = recovery.next_file().unwrap();
        assert_eq!(finfo.path, tricky);
    }
}
