//! The extended-attribute tagging format. Three tags make every data
//! object self-describing and every offline pass idempotent:
//!
//! - [`Ftag`] (`MARFS-FILE`): stream position, erasure parameters and
//!   data state of one file;
//! - [`Gctag`] (`MARFS-GC`): a run of already-collected reference files
//!   following this one;
//! - [`Rtag`] (`MARFS-REBUILD-<objno>`): per-block health of an object
//!   awaiting rebuild.
//!
//! All three share the `SECTION(k=v-...)` header grammar. Parsers reject
//! unknown sections and keys, check versions against the compiled
//! current, and fail numeric overflow with a range error.

mod ftag;
mod gctag;
mod rtag;

pub use ftag::{
    DataState, Ftag, MetaKind, FTAG_CURRENT_MAJORVERSION, FTAG_CURRENT_MINORVERSION, FTAG_NAME,
    ORIG_FTAG_NAME, TGT_FTAG_NAME,
};
pub use gctag::{Gctag, GCTAG_NAME};
pub use rtag::Rtag;

use crate::error::Error;

/// Characters forbidden inside path-visible client tags and stream ids.
pub const RESERVED_CHARS: [char; 3] = ['(', ')', '|'];

/// Replace reserved characters with `#` for use in path-visible ids
/// (object names, reference paths).
pub(crate) fn sanitize(value: &str) -> String {
    value
        .chars()
        .map(|c| if RESERVED_CHARS.contains(&c) { '#' } else { c })
        .collect()
}

/// Whether a client-supplied id is free of reserved characters.
pub fn id_is_clean(value: &str) -> bool {
    !value.is_empty() && !value.chars().any(|c| RESERVED_CHARS.contains(&c))
}

/// Split `HDR(content)rest`, returning `(content, rest)`.
pub(crate) fn take_section<'a>(input: &'a str, header: &str) -> crate::Result<(&'a str, &'a str)> {
    let body = input
        .strip_prefix(header)
        .and_then(|r| r.strip_prefix('('))
        .ok_or_else(|| Error::tag(format!("expected \"{header}(\" section")))?;
    let end = body
        .find(')')
        .ok_or_else(|| Error::tag(format!("unterminated \"{header}\" section")))?;
    Ok((&body[..end], &body[end + 1..]))
}

/// Split a `<key-char><value>` field, rejecting empty or non-ASCII keys.
pub(crate) fn split_tagged(field: &str) -> crate::Result<(&str, &str)> {
    if field.len() < 2 || !field.is_char_boundary(1) {
        return Err(Error::tag(format!("malformed value field \"{field}\"")));
    }
    Ok(field.split_at(1))
}

/// Parse a decimal value, mapping overflow onto a range error.
pub(crate) fn parse_num(value: &str, what: &str) -> crate::Result<u64> {
    value.parse::<u64>().map_err(|e| {
        use std::num::IntErrorKind;
        if *e.kind() == IntErrorKind::PosOverflow {
            Error::Overflow(format!("{what} value \"{value}\""))
        } else {
            Error::tag(format!("malformed {what} value \"{value}\""))
        }
    })
}

/// Parse and check a `M.mmm` version body against the compiled current.
pub(crate) fn check_version(content: &str, major: u32, minor: u32) -> crate::Result<()> {
    let (maj, min) = content
        .split_once('.')
        .ok_or_else(|| Error::tag(format!("malformed version \"{content}\"")))?;
    if parse_num(maj, "major version")? != major as u64
        || parse_num(min, "minor version")? != minor as u64
    {
        return Err(Error::tag(format!(
            "unrecognized version \"{content}\" (current is {major}.{minor:03})"
        )));
    }
    Ok(())
}
