//! The garbage-collection tag, attached to the last surviving file
//! before a run of collected references.

use std::fmt;
use std::str::FromStr;

use super::{check_version, parse_num, take_section};
use crate::error::Error;

pub const GCTAG_CURRENT_MAJORVERSION: u32 = 0;
pub const GCTAG_CURRENT_MINORVERSION: u32 = 1;

/// Xattr name the GCTAG is stored under.
pub const GCTAG_NAME: &str = "MARFS-GC";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Gctag {
    /// Count of subsequent reference files already deleted on behalf of
    /// GC: walkers skip this many filenos.
    pub refcnt: u64,
    /// The collected run extends to the end of the stream.
    pub eos: bool,
    /// Object zero of the stream has been removed.
    pub delzero: bool,
    /// A deletion was mid-flight when this tag was written; the next pass
    /// must re-emit it.
    pub inprog: bool,
}

impl fmt::Display for Gctag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "VER({}.{:03})SKIP({}|{})",
            GCTAG_CURRENT_MAJORVERSION,
            GCTAG_CURRENT_MINORVERSION,
            self.refcnt,
            if self.eos { 'E' } else { '-' },
        )?;
        if self.delzero || self.inprog {
            write!(
                f,
                "PROG({}|{})",
                if self.delzero { 'D' } else { '-' },
                if self.inprog { 'I' } else { '-' },
            )?;
        }
        Ok(())
    }
}

impl FromStr for Gctag {
    type Err = Error;

    fn from_str(value: &str) -> crate::Result<Self> {
        let (ver, rest) = take_section(value, "VER")?;
        check_version(ver, GCTAG_CURRENT_MAJORVERSION, GCTAG_CURRENT_MINORVERSION)?;

        let (skip, rest) = take_section(rest, "SKIP")?;
        let (refcnt, eos) = skip
            .split_once('|')
            .ok_or_else(|| Error::tag("GCTAG skip stanza lacks a separator"))?;
        let refcnt = parse_num(refcnt, "refcnt")?;
        let eos = match eos {
            "E" => true,
            "-" => false,
            other => return Err(Error::tag(format!("unexpected EOS value \"{other}\""))),
        };

        let mut delzero = false;
        let mut inprog = false;
        let rest = if rest.is_empty() {
            rest
        } else {
            let (prog, rest) = take_section(rest, "PROG")?;
            let (dz, ip) = prog
                .split_once('|')
                .ok_or_else(|| Error::tag("GCTAG progress stanza lacks a separator"))?;
            delzero = match dz {
                "D" => true,
                "-" => false,
                other => return Err(Error::tag(format!("unexpected del-zero value \"{other}\""))),
            };
            inprog = match ip {
                "I" => true,
                "-" => false,
                other => return Err(Error::tag(format!("unexpected in-prog value \"{other}\""))),
            };
            rest
        };
        if !rest.is_empty() {
            return Err(Error::tag(format!("GCTAG has trailing characters \"{rest}\"")));
        }

        Ok(Gctag {
            refcnt,
            eos,
            delzero,
            inprog,
        })
    }
}
