use crate::config::CategoryRule;
use crate::models::{ArgValue, Category};
use anyhow::{Result, bail};
use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::Path;
use tracing::{info, warn};

/// Maps raw syscall numbers to symbolic names, parsed from the kernel's
/// unistd header. An empty table is usable — every lookup just degrades to a
/// synthetic name.
#[derive(Debug, Default)]
pub struct SyscallTable {
    names: HashMap<u64, String>,
}

impl SyscallTable {
    /// Reads the first candidate header that exists. No candidate found is
    /// not an error; name resolution is best-effort.
    pub fn load(paths: &[String]) -> Self {
        for path in paths {
            if !Path::new(path).exists() {
                continue;
            }
            match fs::read_to_string(path) {
                Ok(raw) => {
                    let table = Self::parse(&raw);
                    info!(path = %path, entries = table.len(), "loaded syscall number table");
                    return table;
                }
                Err(err) => {
                    warn!(?err, path = %path, "failed to read syscall header");
                }
            }
        }
        warn!("no syscall number table found; names will be synthetic");
        Self::default()
    }

    pub fn parse(raw: &str) -> Self {
        let names = raw.lines().filter_map(parse_define_line).collect();
        Self { names }
    }

    pub fn resolve(&self, id: u64) -> Option<&str> {
        self.names.get(&id).map(String::as_str)
    }

    /// Resolved name, or the synthetic `sys_<id>` form on a miss.
    pub fn name_for(&self, id: u64) -> String {
        match self.resolve(id) {
            Some(name) => name.to_string(),
            None => format!("sys_{id}"),
        }
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }
}

/// Parses one `#define __NR_<name> <nr>` header line.
pub fn parse_define_line(line: &str) -> Option<(u64, String)> {
    let rest = line.trim_start().strip_prefix("#define __NR_")?;
    let mut parts = rest.split_whitespace();
    let name = parts.next()?;
    let number = parts.next()?.parse::<u64>().ok()?;
    if name.is_empty() {
        return None;
    }
    Some((number, name.to_string()))
}

/// Prefix-based syscall categorizer compiled from config rules. Rules are
/// checked in order, first match wins; anything unmatched lands in the fixed
/// `other` fallback.
#[derive(Debug)]
pub struct CategoryClassifier {
    rules: Vec<(Category, Vec<String>)>,
    fallback: Category,
}

impl CategoryClassifier {
    /// Running with an empty rule set would silently shunt every syscall
    /// into the fallback bucket, so that is a startup failure instead.
    pub fn from_rules(rules: &[CategoryRule]) -> Result<Self> {
        if rules.is_empty() {
            bail!("no syscall category rules configured");
        }
        let compiled = rules
            .iter()
            .map(|rule| (Category::new(rule.name.clone()), rule.prefixes.clone()))
            .collect();
        Ok(Self {
            rules: compiled,
            fallback: Category::other(),
        })
    }

    pub fn classify(&self, name: &str) -> Category {
        for (category, prefixes) in &self.rules {
            if prefixes.iter().any(|prefix| name.starts_with(prefix.as_str())) {
                return category.clone();
            }
        }
        self.fallback.clone()
    }

    /// Every category this classifier can produce, fallback included.
    pub fn categories(&self) -> Vec<Category> {
        let mut out: Vec<Category> = self.rules.iter().map(|(c, _)| c.clone()).collect();
        out.push(self.fallback.clone());
        out
    }

    pub fn fallback(&self) -> &Category {
        &self.fallback
    }
}

/// Per-syscall argument names, used to zip the raw six-register tuple into a
/// named argument map. Sourced from a JSON file; a missing or unreadable
/// source degrades to "no signatures known".
#[derive(Debug, Default)]
pub struct SignatureTable {
    signatures: HashMap<String, Vec<String>>,
}

impl SignatureTable {
    pub fn load(path: &Path) -> Self {
        if !path.exists() {
            warn!(path = %path.display(), "signature file missing; parameter names unavailable");
            return Self::default();
        }
        let raw = match fs::read_to_string(path) {
            Ok(raw) => raw,
            Err(err) => {
                warn!(?err, path = %path.display(), "failed to read signature file");
                return Self::default();
            }
        };
        match Self::from_json(&raw) {
            Ok(table) => {
                info!(path = %path.display(), entries = table.len(), "loaded syscall signatures");
                table
            }
            Err(err) => {
                warn!(?err, path = %path.display(), "invalid signature file");
                Self::default()
            }
        }
    }

    pub fn from_json(raw: &str) -> Result<Self> {
        let signatures: HashMap<String, Vec<String>> = serde_json::from_str(raw)?;
        Ok(Self { signatures })
    }

    pub fn signature_for(&self, name: &str) -> Option<&[String]> {
        self.signatures.get(name).map(Vec::as_slice)
    }

    /// Zips raw register values against the syscall's signature. Unknown
    /// signatures produce an empty map.
    pub fn zip_args(&self, name: &str, raw_args: &[u64; 6]) -> BTreeMap<String, ArgValue> {
        let Some(signature) = self.signature_for(name) else {
            return BTreeMap::new();
        };
        signature
            .iter()
            .zip(raw_args.iter())
            .map(|(key, value)| (key.clone(), ArgValue::Int(*value as i64)))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.signatures.len()
    }

    pub fn is_empty(&self) -> bool {
        self.signatures.is_empty()
    }
}
