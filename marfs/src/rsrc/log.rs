//! The resource log: an append-only file of operation records. Every
//! operation is written once with `start=1` before execution and again
//! with `start=0` plus its error code once complete, so a crashed run
//! can be replayed and its unfinished operations re-queued.
//!
//! Records reuse the tag grammar, one per line:
//!
//! `OP(<TYPE>|S<0|1>|C<count>|E<errno>)FTAG(<ftag>)[EXT(...)][RTAG(<rtag>)]`

use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use crate::error::Error;
use crate::tagging::{parse_num, split_tagged, take_section, Ftag, Rtag};

/// Split `HDR(content)rest` where `content` itself nests balanced
/// parentheses (FTAG and RTAG strings do).
fn take_balanced<'a>(input: &'a str, header: &str) -> crate::Result<(&'a str, &'a str)> {
    let body = input
        .strip_prefix(header)
        .and_then(|r| r.strip_prefix('('))
        .ok_or_else(|| Error::tag(format!("expected \"{header}(\" section")))?;
    let mut depth = 1usize;
    for (idx, ch) in body.char_indices() {
        match ch {
            '(' => depth += 1,
            ')' => {
                depth -= 1;
                if depth == 0 {
                    return Ok((&body[..idx], &body[idx + 1..]));
                }
            }
            _ => {}
        }
    }
    Err(Error::tag(format!("unterminated \"{header}\" section")))
}

/// Operation class.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OpType {
    DeleteObj,
    DeleteRef,
    Rebuild,
    Repack,
}

impl OpType {
    fn token(&self) -> &'static str {
        match self {
            OpType::DeleteObj => "DEL-OBJ",
            OpType::DeleteRef => "DEL-REF",
            OpType::Rebuild => "REBUILD",
            OpType::Repack => "REPACK",
        }
    }

    fn from_token(token: &str) -> crate::Result<Self> {
        match token {
            "DEL-OBJ" => Ok(OpType::DeleteObj),
            "DEL-REF" => Ok(OpType::DeleteRef),
            "REBUILD" => Ok(OpType::Rebuild),
            "REPACK" => Ok(OpType::Repack),
            other => Err(Error::tag(format!("unknown operation type \"{other}\""))),
        }
    }
}

/// Type-specific payload of an operation.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum OpExt {
    #[default]
    None,
    DelRef {
        /// Fileno of the last surviving file ahead of the deleted run;
        /// it receives the GCTAG.
        prev_active_index: u64,
        eos: bool,
        delzero: bool,
    },
    Rebuild {
        marker: Option<String>,
        rtag: Option<Rtag>,
    },
    Repack {
        totalbytes: u64,
    },
}

/// One planned or completed operation. Contiguous object/file ranges
/// coalesce into a single record whose `count` is the run length.
#[derive(Debug, Clone, PartialEq)]
pub struct OpInfo {
    pub optype: OpType,
    pub start: bool,
    pub count: u64,
    pub errval: i32,
    pub ftag: Ftag,
    pub ext: OpExt,
}

impl OpInfo {
    pub fn new(optype: OpType, ftag: Ftag) -> Self {
        let ext = match optype {
            OpType::DeleteRef => OpExt::DelRef {
                prev_active_index: 0,
                eos: false,
                delzero: false,
            },
            OpType::Rebuild => OpExt::Rebuild {
                marker: None,
                rtag: None,
            },
            OpType::Repack => OpExt::Repack { totalbytes: 0 },
            OpType::DeleteObj => OpExt::None,
        };
        OpInfo {
            optype,
            start: true,
            count: 0,
            errval: 0,
            ftag,
            ext,
        }
    }

    fn key(&self) -> OpKey {
        (
            self.optype,
            self.ftag.streamid.clone(),
            self.ftag.fileno,
            self.ftag.objno,
        )
    }

    fn to_line(&self) -> String {
        let mut line = format!(
            "OP({}|S{}|C{}|E{})FTAG({})",
            self.optype.token(),
            self.start as u8,
            self.count,
            self.errval,
            self.ftag
        );
        match &self.ext {
            OpExt::None => {}
            OpExt::DelRef {
                prev_active_index,
                eos,
                delzero,
            } => {
                line.push_str(&format!(
                    "EXT(p{}|{}|{})",
                    prev_active_index,
                    if *eos { 'E' } else { '-' },
                    if *delzero { 'D' } else { '-' },
                ));
            }
            OpExt::Repack { totalbytes } => {
                line.push_str(&format!("EXT(t{totalbytes})"));
            }
            OpExt::Rebuild { marker, rtag } => {
                if let Some(marker) = marker {
                    line.push_str(&format!("EXT(m{marker})"));
                }
                if let Some(rtag) = rtag {
                    line.push_str(&format!("RTAG({rtag})"));
                }
            }
        }
        line
    }

    fn from_line(line: &str) -> crate::Result<Self> {
        let (head, rest) = take_section(line, "OP")?;
        let mut parts = head.split('|');
        let optype = OpType::from_token(
            parts
                .next()
                .ok_or_else(|| Error::tag("operation record lacks a type"))?,
        )?;
        let mut start = None;
        let mut count = None;
        let mut errval = None;
        for field in parts {
            match split_tagged(field)? {
                ("S", v) => start = Some(parse_num(v, "start flag")? != 0),
                ("C", v) => count = Some(parse_num(v, "count")?),
                ("E", v) => {
                    errval = Some(
                        v.parse::<i32>()
                            .map_err(|_| Error::tag(format!("malformed errval \"{v}\"")))?,
                    )
                }
                (key, _) => {
                    return Err(Error::tag(format!("unknown operation field \"{key}\"")))
                }
            }
        }
        let (start, count, errval) = match (start, count, errval) {
            (Some(s), Some(c), Some(e)) => (s, c, e),
            _ => return Err(Error::tag("operation record lacks required fields")),
        };

        let (ftagstr, rest) = take_balanced(rest, "FTAG")?;
        let ftag: Ftag = ftagstr.parse()?;

        let mut ext = match optype {
            OpType::DeleteObj => OpExt::None,
            OpType::DeleteRef => OpExt::DelRef {
                prev_active_index: 0,
                eos: false,
                delzero: false,
            },
            OpType::Rebuild => OpExt::Rebuild {
                marker: None,
                rtag: None,
            },
            OpType::Repack => OpExt::Repack { totalbytes: 0 },
        };
        let mut rest = rest;
        if rest.starts_with("EXT(") {
            let (extstr, after) = take_section(rest, "EXT")?;
            rest = after;
            match &mut ext {
                OpExt::DelRef {
                    prev_active_index,
                    eos,
                    delzero,
                } => {
                    let mut fields = extstr.split('|');
                    let (key, v) = split_tagged(
                        fields
                            .next()
                            .ok_or_else(|| Error::tag("DEL-REF ext lacks fields"))?,
                    )?;
                    if key != "p" {
                        return Err(Error::tag("DEL-REF ext lacks a previous-active index"));
                    }
                    *prev_active_index = parse_num(v, "previous active index")?;
                    *eos = matches!(fields.next(), Some("E"));
                    *delzero = matches!(fields.next(), Some("D"));
                }
                OpExt::Repack { totalbytes } => {
                    let (key, v) = split_tagged(extstr)?;
                    if key != "t" {
                        return Err(Error::tag("REPACK ext lacks a byte total"));
                    }
                    *totalbytes = parse_num(v, "repack byte total")?;
                }
                OpExt::Rebuild { marker, .. } => {
                    let (key, v) = split_tagged(extstr)?;
                    if key != "m" {
                        return Err(Error::tag("REBUILD ext lacks a marker path"));
                    }
                    *marker = Some(v.to_string());
                }
                OpExt::None => {
                    return Err(Error::tag("DEL-OBJ records carry no extended info"))
                }
            }
        }
        if rest.starts_with("RTAG(") {
            let (rtagstr, after) = take_balanced(rest, "RTAG")?;
            if !after.is_empty() {
                return Err(Error::tag(format!(
                    "operation record has trailing characters \"{after}\""
                )));
            }
            match &mut ext {
                OpExt::Rebuild { rtag, .. } => *rtag = Some(rtagstr.parse()?),
                _ => return Err(Error::tag("only REBUILD records carry an RTAG")),
            }
        } else if !rest.is_empty() {
            return Err(Error::tag(format!(
                "operation record has trailing characters \"{rest}\""
            )));
        }

        Ok(OpInfo {
            optype,
            start,
            count,
            errval,
            ftag,
            ext,
        })
    }
}

type OpKey = (OpType, String, u64, u64);

/// Log flavor: `Modify` logs drive live runs and are replayable;
/// `Record` logs are written for audit only.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogMode {
    Modify,
    Record,
}

/// Completion totals of one log.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LogSummary {
    pub deleted_objects: u64,
    pub deleted_refs: u64,
    pub rebuilds: u64,
    pub repacks: u64,
    pub errors: u64,
}

/// An open resource log.
#[derive(Debug)]
pub struct ResourceLog {
    path: PathBuf,
    mode: LogMode,
    file: File,
    inprogress: HashMap<OpKey, u64>,
    summary: LogSummary,
}

impl ResourceLog {
    /// Create a fresh log file. Fails if one already exists at the path:
    /// an existing modify-log means a previous run did not complete and
    /// must be replayed first.
    pub fn init(path: &Path, mode: LogMode) -> crate::Result<ResourceLog> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new()
            .create_new(true)
            .append(true)
            .open(path)?;
        log::debug!("Initialized {:?} resource log at \"{}\"", mode, path.display());
        Ok(ResourceLog {
            path: path.to_path_buf(),
            mode,
            file,
            inprogress: HashMap::new(),
            summary: LogSummary::default(),
        })
    }

    pub fn mode(&self) -> LogMode {
        self.mode
    }

    pub fn summary(&self) -> LogSummary {
        self.summary
    }

    /// Count of started operations lacking a completion record.
    pub fn outstanding(&self) -> usize {
        self.inprogress.len()
    }

    /// Record a chain of planned operations ahead of execution.
    pub fn record_ops(&mut self, ops: &[OpInfo]) -> crate::Result<()> {
        for op in ops {
            if !op.start {
                return Err(Error::inval("planned operations must carry start=1"));
            }
            self.append_line(&op.to_line())?;
            if self.mode == LogMode::Modify {
                self.inprogress.insert(op.key(), op.count);
            }
        }
        Ok(())
    }

    /// Record the completion of one operation. The caller sets `start =
    /// false` and `errval` to the execution result beforehand.
    ///
    /// Returns the chain progress indicator: `0` when sibling operations
    /// of the same stream remain outstanding, `> 0` when the chain may
    /// proceed, `< 0` when the remainder of the chain must abort.
    pub fn process_op(&mut self, op: &OpInfo) -> crate::Result<i32> {
        if op.start {
            return Err(Error::inval("completion records must carry start=0"));
        }
        if self.mode == LogMode::Modify && self.inprogress.remove(&op.key()).is_none() {
            return Err(Error::inval(format!(
                "operation {:?} on fileno {} was never started",
                op.optype, op.ftag.fileno
            )));
        }
        self.append_line(&op.to_line())?;
        if op.errval != 0 {
            self.summary.errors += 1;
            return Ok(-1);
        }
        match op.optype {
            OpType::DeleteObj => self.summary.deleted_objects += op.count,
            OpType::DeleteRef => self.summary.deleted_refs += op.count,
            OpType::Rebuild => self.summary.rebuilds += op.count,
            OpType::Repack => self.summary.repacks += op.count,
        }
        let pending = self
            .inprogress
            .keys()
            .any(|(_, streamid, _, _)| *streamid == op.ftag.streamid);
        Ok(if pending { 0 } else { 1 })
    }

    /// Replay a previous run's modify-log: any operation started but
    /// never completed is re-recorded into this log and returned for
    /// re-execution. The old log is removed afterwards. Replaying the
    /// log of a completed run is a no-op.
    pub fn replay(&mut self, oldpath: &Path) -> crate::Result<Vec<OpInfo>> {
        let reader = BufReader::new(File::open(oldpath)?);
        let mut started: HashMap<OpKey, OpInfo> = HashMap::new();
        for line in reader.lines() {
            let line = line?;
            if line.is_empty() {
                continue;
            }
            let op = match OpInfo::from_line(&line) {
                Ok(op) => op,
                Err(e) => {
                    // a torn final record is the expected crash artifact
                    log::warn!(
                        "Halting replay of \"{}\" at unparsable record: {}",
                        oldpath.display(),
                        e
                    );
                    break;
                }
            };
            if op.start {
                started.insert(op.key(), op);
            } else {
                started.remove(&op.key());
            }
        }

        let mut outstanding: Vec<OpInfo> = started.into_values().collect();
        outstanding.sort_by(|a, b| {
            (a.ftag.fileno, a.ftag.objno).cmp(&(b.ftag.fileno, b.ftag.objno))
        });
        if !outstanding.is_empty() {
            log::info!(
                "Replaying {} outstanding operations from \"{}\"",
                outstanding.len(),
                oldpath.display()
            );
            self.record_ops(&outstanding)?;
        }
        std::fs::remove_file(oldpath)?;
        Ok(outstanding)
    }

    /// Close the log. A completed modify-log (no outstanding operations)
    /// is removed; anything else is preserved for replay or audit.
    pub fn term(mut self) -> crate::Result<LogSummary> {
        self.file.flush()?;
        if self.mode == LogMode::Modify && self.inprogress.is_empty() {
            std::fs::remove_file(&self.path)?;
        }
        Ok(self.summary)
    }

    fn append_line(&mut self, line: &str) -> crate::Result<()> {
        self.file.write_all(line.as_bytes())?;
        self.file.write_all(b"\n")?;
        self.file.sync_data()?;
        Ok(())
    }
}
