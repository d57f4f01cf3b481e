//! The rebuild tag, attached to rebuild marker files. A create-only tag
//! carries just the version and timestamp; a verification pass may add
//! stripe geometry and per-block health so a resumed rebuild can skip
//! known-good blocks.

use std::fmt;
use std::str::FromStr;

use super::{check_version, parse_num, split_tagged, take_section};
use crate::dal::StripeState;
use crate::error::Error;

pub const RTAG_CURRENT_MAJORVERSION: u32 = 0;
pub const RTAG_CURRENT_MINORVERSION: u32 = 1;

const RTAG_NAME_PREFIX: &str = "MARFS-REBUILD";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rtag {
    /// Marker creation time, unix seconds.
    pub createtime: i64,
    /// Stripe geometry + health, absent on a create-only tag.
    pub state: Option<StripeState>,
}

impl Rtag {
    pub fn new(createtime: i64) -> Self {
        Rtag {
            createtime,
            state: None,
        }
    }

    /// Xattr name for the RTAG of a specific object number.
    pub fn xattr_name(objno: u64) -> String {
        format!("{RTAG_NAME_PREFIX}-{objno}")
    }

    /// Object number an RTAG xattr name refers to, if it is one.
    pub fn objno_of_name(name: &str) -> Option<u64> {
        name.strip_prefix(RTAG_NAME_PREFIX)?
            .strip_prefix('-')?
            .parse()
            .ok()
    }

    pub fn stripe_width(&self) -> usize {
        self.state.as_ref().map(|s| s.data_status.len()).unwrap_or(0)
    }
}

fn fmt_health(f: &mut fmt::Formatter<'_>, header: &str, blocks: &[bool]) -> fmt::Result {
    write!(f, "{header}(")?;
    for (idx, ok) in blocks.iter().enumerate() {
        if idx > 0 {
            write!(f, "-")?;
        }
        write!(f, "{}", if *ok { '1' } else { '0' })?;
    }
    write!(f, ")")
}

impl fmt::Display for Rtag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "VER({}.{:03})TIME({})",
            RTAG_CURRENT_MAJORVERSION, RTAG_CURRENT_MINORVERSION, self.createtime,
        )?;
        if let Some(state) = &self.state {
            write!(
                f,
                "STP(w{}|v{}|b{}|t{})",
                state.data_status.len(),
                state.versz,
                state.blocksz,
                state.totsz,
            )?;
            fmt_health(f, "DHLTH", &state.data_status)?;
            fmt_health(f, "MHLTH", &state.meta_status)?;
        }
        Ok(())
    }
}

fn parse_health(content: &str, width: usize, what: &str) -> crate::Result<Vec<bool>> {
    let mut blocks = Vec::with_capacity(width);
    for field in content.split('-') {
        match field {
            "1" => blocks.push(true),
            "0" => blocks.push(false),
            other => {
                return Err(Error::tag(format!(
                    "{what} health value is neither '0' nor '1': \"{other}\""
                )))
            }
        }
    }
    if blocks.len() != width {
        return Err(Error::tag(format!(
            "{what} health stanza covers {} of {width} blocks",
            blocks.len()
        )));
    }
    Ok(blocks)
}

impl FromStr for Rtag {
    type Err = Error;

    fn from_str(value: &str) -> crate::Result<Self> {
        let (ver, rest) = take_section(value, "VER")?;
        check_version(ver, RTAG_CURRENT_MAJORVERSION, RTAG_CURRENT_MINORVERSION)?;

        let (timestr, rest) = take_section(rest, "TIME")?;
        let createtime = i64::try_from(parse_num(timestr, "timestamp")?)?;

        // stripe info and health stanzas are optional as a group
        if rest.is_empty() {
            return Ok(Rtag {
                createtime,
                state: None,
            });
        }

        let (stripe, rest) = take_section(rest, "STP")?;
        let mut width = None;
        let mut versz = None;
        let mut blocksz = None;
        let mut totsz = None;
        for field in stripe.split('|') {
            let (key, v) = split_tagged(field)?;
            let parsed = parse_num(v, "stripe info")?;
            if parsed == 0 {
                return Err(Error::Overflow(format!(
                    "stripe info '{key}' value must be non-zero"
                )));
            }
            match key {
                "w" => width = Some(parsed),
                "v" => versz = Some(parsed),
                "b" => blocksz = Some(parsed),
                "t" => totsz = Some(parsed),
                _ => {
                    return Err(Error::tag(format!(
                        "unrecognized stripe info value tag \"{key}\""
                    )))
                }
            }
        }
        let (width, versz, blocksz, totsz) = match (width, versz, blocksz, totsz) {
            (Some(w), Some(v), Some(b), Some(t)) => (w, v, b, t),
            _ => return Err(Error::tag("RTAG lacks some required stripe info values")),
        };
        let width = usize::try_from(width)?;

        let (dhlth, rest) = take_section(rest, "DHLTH")?;
        let data_status = parse_health(dhlth, width, "data")?;
        let (mhlth, rest) = take_section(rest, "MHLTH")?;
        let meta_status = parse_health(mhlth, width, "meta")?;
        if !rest.is_empty() {
            return Err(Error::tag(format!("RTAG has trailing characters \"{rest}\"")));
        }

        Ok(Rtag {
            createtime,
            state: Some(StripeState {
                versz,
                blocksz,
                totsz,
                meta_status,
                data_status,
            }),
        })
    }
}
