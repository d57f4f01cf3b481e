use std::path::PathBuf;
use std::str::FromStr;

use clap::Parser;
use marfs::dal::Location;
use marfs::rsrc::Thresholds;

/// Offline MarFS resource manager: walks every datastream of the
/// selected namespaces, enforces quota accounting, and (with `-d`)
/// drives garbage collection, rebuild and repack.
#[derive(Parser)]
#[command(name = "marfs-rsrc_mgr", version, about, long_about = None)]
pub struct Cli {
    /// Config file path. Defaults to $MARFS_CONFIG_PATH.
    #[arg(short = 'c', long)]
    pub config: Option<PathBuf>,

    /// Verbose logging.
    #[arg(short = 'v', long)]
    pub verbose: bool,

    /// Execute planned operations. Without this flag the run only
    /// reports what would be collected.
    #[arg(short = 'd', long)]
    pub delete: bool,

    /// Restrict the run to one namespace subtree.
    #[arg(short = 'n', long)]
    pub namespace: Option<String>,

    /// Producer and consumer thread counts, as `<nprod>:<ncons>`.
    #[arg(short = 't', long)]
    pub threads: Option<ThreadCounts>,

    /// Directory holding per-run resource logs.
    #[arg(long, default_value = "/var/tmp/marfs-rsrc-mgr")]
    pub log_root: PathBuf,

    /// Identifier of this run; defaults to a timestamp.
    #[arg(short = 'i', long)]
    pub iteration: Option<String>,

    /// Garbage-collect files deactivated more than this many seconds
    /// ago. Zero disables GC.
    #[arg(long, default_value_t = 0)]
    pub gc_thresh: i64,

    /// Repack files settled more than this many seconds ago. Zero
    /// disables repacking.
    #[arg(long, default_value_t = 0)]
    pub repack_thresh: i64,

    /// Rebuild objects of files settled more than this many seconds
    /// ago. Zero disables location-based rebuilds.
    #[arg(long, default_value_t = 0)]
    pub rebuild_thresh: i64,

    /// Clean up in-flight markers older than this many seconds. Zero
    /// disables marker cleanup.
    #[arg(long, default_value_t = 0)]
    pub cleanup_thresh: i64,

    /// Rebuild target location, as `<pod>:<cap>:<scatter>` with `-1`
    /// as a wildcard.
    #[arg(long)]
    pub rebuild_loc: Option<CliLocation>,

    /// This process's rank, as assigned by the launcher.
    #[arg(long, default_value_t = 0)]
    pub rank: usize,

    /// Total rank count of the launch.
    #[arg(long, default_value_t = 1)]
    pub ranks: usize,
}

#[derive(Debug, Clone, Copy)]
pub struct ThreadCounts {
    pub producers: usize,
    pub consumers: usize,
}

impl FromStr for ThreadCounts {
    type Err = &'static str;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        let (prod, cons) = input
            .split_once(':')
            .ok_or("thread counts must be given as <nprod>:<ncons>")?;
        let producers = prod
            .parse()
            .map_err(|_| "producer count must be a positive integer")?;
        let consumers = cons
            .parse()
            .map_err(|_| "consumer count must be a positive integer")?;
        if producers == 0 || consumers == 0 {
            return Err("thread counts must be non-zero");
        }
        Ok(ThreadCounts {
            producers,
            consumers,
        })
    }
}

#[derive(Debug, Clone, Copy)]
pub struct CliLocation(pub Location);

impl FromStr for CliLocation {
    type Err = &'static str;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = input.split(':').collect();
        if parts.len() != 3 {
            return Err("rebuild location must be given as <pod>:<cap>:<scatter>");
        }
        let parse = |s: &str| s.parse::<i32>().map_err(|_| "location values are integers");
        Ok(CliLocation(Location {
            pod: parse(parts[0])?,
            cap: parse(parts[1])?,
            scatter: parse(parts[2])?,
        }))
    }
}

impl Cli {
    /// Fold a wall-clock "now" into absolute threshold timestamps.
    pub fn thresholds(&self, now: i64) -> Thresholds {
        let resolve = |secs: i64| if secs == 0 { 0 } else { now - secs };
        Thresholds {
            gc: resolve(self.gc_thresh),
            repack: resolve(self.repack_thresh),
            rebuild: resolve(self.rebuild_thresh),
            cleanup: resolve(self.cleanup_thresh),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn thread_counts_parse() {
        let counts: ThreadCounts = "4:16".parse().unwrap();
        assert_eq!((counts.producers, counts.consumers), (4, 16));
        assert!("4".parse::<ThreadCounts>().is_err());
        assert!("0:4".parse::<ThreadCounts>().is_err());
        assert!("a:b".parse::<ThreadCounts>().is_err());
    }

    #[test]
    fn locations_parse_with_wildcards() {
        let loc: CliLocation = "-1:2:-1".parse().unwrap();
        assert_eq!(loc.0.pod, -1);
        assert_eq!(loc.0.cap, 2);
        assert_eq!(loc.0.scatter, -1);
        assert!("1:2".parse::<CliLocation>().is_err());
    }

    #[test]
    fn zero_thresholds_stay_disabled() {
        let cli = Cli::parse_from(["marfs-rsrc_mgr", "-c", "/tmp/cfg", "--gc-thresh", "600"]);
        let thresh = cli.thresholds(10_000);
        assert_eq!(thresh.gc, 9_400);
        assert_eq!(thresh.repack, 0);
        assert_eq!(thresh.rebuild, 0);
        assert_eq!(thresh.cleanup, 0);
    }
}
