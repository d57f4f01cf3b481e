//! Compact sandbox-config loader. The production XML config loader is a
//! separate collaborator; this binary accepts a minimal `key = value`
//! description of the repository/namespace shape and instantiates the
//! in-memory reference drivers, which is enough to exercise a full
//! resource-manager pass. Deployments embedding real drivers construct
//! `MarfsConfig` programmatically instead.
//!
//! ```text
//! [repo pool]
//! objsize = 1048576
//! objfiles = 4
//! protection = 10+2
//! partsz = 1024
//! refs = 3x3x3
//!
//! [ns /pool]
//! [ns /pool/batch]
//! bperms = rw
//! dquota = 0
//! ```

use std::path::Path;
use std::sync::Arc;

use marfs::config::{DataScheme, MarfsConfig, MetaScheme, Namespace, NsPerms, RefTable, Repo};
use marfs::dal::mem::MemDal;
use marfs::dal::Erasure;
use marfs::mdal::mem::MemMdal;

#[derive(Debug)]
pub struct ConfigError(pub String);

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "config error: {}", self.0)
    }
}

impl std::error::Error for ConfigError {}

fn err(msg: impl Into<String>) -> ConfigError {
    ConfigError(msg.into())
}

struct RepoBuilder {
    name: String,
    objsize: u64,
    objfiles: u64,
    protection: Erasure,
    reftable: RefTable,
    pods: u16,
    caps: u16,
    scatters: u16,
    directread: bool,
    namespaces: Vec<Namespace>,
}

impl RepoBuilder {
    fn new(name: &str) -> Self {
        RepoBuilder {
            name: name.to_string(),
            objsize: 1 << 20,
            objfiles: 4,
            protection: Erasure {
                n: 10,
                e: 2,
                o: 0,
                partsz: 1024,
            },
            reftable: RefTable::new(3, 3, 3).unwrap(),
            pods: 4,
            caps: 4,
            scatters: 4,
            directread: true,
            namespaces: Vec::new(),
        }
    }

    fn build(self) -> Result<Repo, ConfigError> {
        let mut namespaces = self.namespaces;
        if namespaces.is_empty() {
            namespaces.push(Namespace::new(&self.name, &format!("/{}", self.name)));
        }
        Ok(Repo {
            name: self.name,
            datascheme: DataScheme {
                dal: Arc::new(MemDal::new()),
                protection: self.protection,
                objfiles: self.objfiles,
                objsize: self.objsize,
                pods: self.pods,
                caps: self.caps,
                scatters: self.scatters,
                latency_ms: 0,
            },
            metascheme: MetaScheme {
                mdal: Arc::new(MemMdal::new()),
                reftable: self.reftable,
                directread: self.directread,
            },
            namespaces,
        })
    }
}

fn parse_perms(value: &str) -> Result<NsPerms, ConfigError> {
    match value {
        "rw" => Ok(NsPerms::rw()),
        "ro" => Ok(NsPerms::ro()),
        "none" => Ok(NsPerms::new()),
        other => {
            let byte = u8::from_str_radix(other.trim_start_matches("0x"), 16)
                .map_err(|_| err(format!("unrecognized permission value \"{other}\"")))?;
            Ok(NsPerms::from_byte(byte))
        }
    }
}

fn parse_num(value: &str, what: &str) -> Result<u64, ConfigError> {
    value
        .parse()
        .map_err(|_| err(format!("malformed {what} value \"{value}\"")))
}

/// Parse a sandbox config file into a sealed `MarfsConfig`.
pub fn load(path: &Path) -> Result<Arc<MarfsConfig>, Box<dyn std::error::Error>> {
    let text = std::fs::read_to_string(path)?;
    let mut repos: Vec<RepoBuilder> = Vec::new();
    let mut in_ns = false;

    for (lineno, raw) in text.lines().enumerate() {
        let line = raw.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let at = |msg: String| err(format!("line {}: {}", lineno + 1, msg));

        if let Some(section) = line.strip_prefix('[').and_then(|l| l.strip_suffix(']')) {
            let (kind, name) = section
                .split_once(' ')
                .ok_or_else(|| at("section header needs a kind and a name".to_string()))?;
            match kind {
                "repo" => {
                    repos.push(RepoBuilder::new(name.trim()));
                    in_ns = false;
                }
                "ns" => {
                    let repo = repos
                        .last_mut()
                        .ok_or_else(|| at("namespace declared before any repo".to_string()))?;
                    let idstr = name.trim();
                    let ns_name = idstr.rsplit('/').next().unwrap_or(idstr);
                    let mut ns = Namespace::new(ns_name, idstr);
                    if let Some(parent) = repo.namespaces.len().checked_sub(1) {
                        // flat declaration order: parent is the nearest
                        // prefix namespace
                        if idstr.starts_with(&format!("{}/", repo.namespaces[parent].idstr)) {
                            ns.parent = Some(parent);
                            let new_idx = repo.namespaces.len();
                            repo.namespaces[parent].subspaces.push(new_idx);
                        }
                    }
                    repo.namespaces.push(ns);
                    in_ns = true;
                }
                other => return Err(at(format!("unknown section kind \"{other}\"")).into()),
            }
            continue;
        }

        let (key, value) = line
            .split_once('=')
            .ok_or_else(|| at("expected key = value".to_string()))?;
        let (key, value) = (key.trim(), value.trim());
        let repo = repos
            .last_mut()
            .ok_or_else(|| at("values declared before any section".to_string()))?;

        if in_ns {
            let ns = repo.namespaces.last_mut().unwrap();
            match key {
                "iperms" => ns.iperms = parse_perms(value)?,
                "bperms" => ns.bperms = parse_perms(value)?,
                "dquota" => ns.dquota = parse_num(value, "dquota")?,
                "fquota" => ns.fquota = parse_num(value, "fquota")?,
                "ghost-of" => {
                    let target = repo
                        .namespaces
                        .iter()
                        .position(|n| n.idstr == value)
                        .ok_or_else(|| at(format!("unknown ghost target \"{value}\"")))?;
                    let last = repo.namespaces.len() - 1;
                    repo.namespaces[last].ghost_target = Some(target);
                }
                other => return Err(at(format!("unknown namespace key \"{other}\"")).into()),
            }
        } else {
            match key {
                "objsize" => repo.objsize = parse_num(value, "objsize")?,
                "objfiles" => repo.objfiles = parse_num(value, "objfiles")?,
                "partsz" => repo.protection.partsz = parse_num(value, "partsz")?,
                "protection" => {
                    let (n, e) = value
                        .split_once('+')
                        .ok_or_else(|| at("protection is given as N+E".to_string()))?;
                    repo.protection.n = parse_num(n, "protection N")? as u16;
                    repo.protection.e = parse_num(e, "protection E")? as u16;
                }
                "refs" => {
                    let parts: Vec<&str> = value.split('x').collect();
                    if parts.len() != 3 {
                        return Err(at("refs is given as BxDxd".to_string()).into());
                    }
                    repo.reftable = RefTable::new(
                        parse_num(parts[0], "ref breadth")? as u32,
                        parse_num(parts[1], "ref depth")? as u32,
                        parse_num(parts[2], "ref digits")? as u32,
                    )
                    .map_err(|e| at(e.to_string()))?;
                }
                "pods" => repo.pods = parse_num(value, "pods")? as u16,
                "caps" => repo.caps = parse_num(value, "caps")? as u16,
                "scatters" => repo.scatters = parse_num(value, "scatters")? as u16,
                "directread" => repo.directread = value == "true" || value == "1",
                other => return Err(at(format!("unknown repo key \"{other}\"")).into()),
            }
        }
    }

    if repos.is_empty() {
        return Err(err("config declares no repositories").into());
    }
    let repos: Vec<Repo> = repos
        .into_iter()
        .map(RepoBuilder::build)
        .collect::<Result<_, _>>()?;
    Ok(MarfsConfig::new(repos)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn load_text(name: &str, text: &str) -> Result<Arc<MarfsConfig>, Box<dyn std::error::Error>> {
        let path = std::env::temp_dir().join(format!("marfs-sbx-{name}-{}", std::process::id()));
        std::fs::write(&path, text).unwrap();
        let result = load(&path);
        let _ = std::fs::remove_file(&path);
        result
    }

    #[test]
    fn full_config_parses() {
        let cfg = load_text(
            "full",
            "# sandbox\n\
             [repo pool]\n\
             objsize = 4096\n\
             objfiles = 2\n\
             protection = 4+1\n\
             partsz = 512\n\
             refs = 2x2x2\n\
             pods = 2\n\
             directread = false\n\
             \n\
             [ns /pool]\n\
             iperms = ro\n\
             [ns /pool/batch]\n\
             bperms = rw\n\
             dquota = 1000000\n\
             fquota = 50\n",
        )
        .unwrap();
        assert_eq!(cfg.repos.len(), 1);
        let repo = &cfg.repos[0];
        assert_eq!(repo.datascheme.objsize, 4096);
        assert_eq!(repo.datascheme.objfiles, 2);
        assert_eq!(repo.datascheme.protection.n, 4);
        assert_eq!(repo.datascheme.protection.e, 1);
        assert_eq!(repo.metascheme.reftable.breadth(), 2);
        assert!(!repo.metascheme.directread);
        let batch = cfg.find_namespace("/pool/batch").unwrap();
        assert_eq!(cfg.ns(batch).dquota, 1_000_000);
        assert_eq!(cfg.ns(batch).fquota, 50);
        assert_eq!(cfg.ns(batch).parent, Some(0));
    }

    #[test]
    fn ghost_targets_resolve_by_id() {
        let cfg = load_text(
            "ghost",
            "[repo pool]\n\
             [ns /pool]\n\
             [ns /pool/shadow]\n\
             ghost-of = /pool\n",
        )
        .unwrap();
        let shadow = cfg.find_namespace("/pool/shadow").unwrap();
        assert_eq!(cfg.ns(shadow).ghost_target, Some(0));
    }

    #[test]
    fn malformed_configs_are_rejected() {
        assert!(load_text("bad1", "objsize = 10\n").is_err());
        assert!(load_text("bad2", "[repo pool]\nnonsense = 1\n").is_err());
        assert!(load_text("bad3", "[repo pool]\nrefs = 3x3\n").is_err());
        assert!(load_text("bad4", "[ns /lost]\n").is_err());
        assert!(load_text("bad5", "").is_err());
    }
}
