//! `_CodeSignature/CodeResources`: the sealed hash list of a bundle's files.
//!
//! The plist has a legacy `files` dictionary (SHA-1 only), a `files2`
//! dictionary (SHA-1 and SHA-256, symlinks recorded by target) and the two
//! standard rule sets. The main executable is left out because it carries
//! its own embedded signature, which in turn seals this plist in special
//! slot -3.

use crate::codesign::DigestType;
use crate::{Cancellation, Error, Result};
use plist::{Dictionary, Value};
use rayon::prelude::*;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::debug;
use walkdir::WalkDir;

/// Directory holding the seal, relative to the bundle root.
pub const CODE_SIGNATURE_DIR: &str = "_CodeSignature";

/// Path of the seal, relative to the bundle root.
pub const CODE_RESOURCES_PATH: &str = "_CodeSignature/CodeResources";

/// Hashes of one sealed file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceEntry {
    pub sha1: Vec<u8>,
    pub sha256: Vec<u8>,
    /// Link target, for symlinks. The hashes are then over the target path.
    pub symlink: Option<String>,
}

impl ResourceEntry {
    fn of(data: &[u8], symlink: Option<String>) -> Self {
        Self {
            sha1: DigestType::Sha1.digest(data),
            sha256: DigestType::Sha256.digest(data),
            symlink,
        }
    }
}

/// Collects file hashes under a bundle root and renders the plist.
#[derive(Debug)]
pub struct CodeResourcesBuilder {
    root: PathBuf,
    files: BTreeMap<String, ResourceEntry>,
    excluded: Vec<String>,
    cancellation: Option<Cancellation>,
}

impl CodeResourcesBuilder {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            files: BTreeMap::new(),
            excluded: Vec::new(),
            cancellation: None,
        }
    }

    /// Leave out the file at `relative` (slash separated), typically the
    /// main executable.
    pub fn exclude(mut self, relative: impl Into<String>) -> Self {
        self.excluded.push(relative.into());
        self
    }

    pub fn cancellation(mut self, cancellation: Cancellation) -> Self {
        self.cancellation = Some(cancellation);
        self
    }

    fn is_excluded(&self, relative: &str) -> bool {
        relative == CODE_SIGNATURE_DIR
            || relative.starts_with("_CodeSignature/")
            || self.excluded.iter().any(|e| e == relative)
    }

    /// Walk the root and hash every file and symlink, in parallel.
    pub fn scan(&mut self) -> Result<&mut Self> {
        let mut entries = Vec::new();
        for entry in WalkDir::new(&self.root).min_depth(1).follow_links(false) {
            let entry = entry.map_err(|e| {
                let path = e.path().map(Path::to_path_buf).unwrap_or_else(|| self.root.clone());
                Error::from(std::io::Error::from(e)).with_path(path)
            })?;
            if entry.file_type().is_dir() {
                continue;
            }
            let relative = relative_path(&self.root, entry.path());
            if !self.is_excluded(&relative) {
                entries.push((relative, entry.path().to_path_buf(), entry.path_is_symlink()));
            }
        }

        let hashed = entries
            .par_iter()
            .map(|(relative, path, is_symlink)| {
                if self.cancellation.as_ref().map_or(false, Cancellation::is_cancelled) {
                    return Err(Error::Cancelled);
                }
                Ok((relative.clone(), hash_entry(path, *is_symlink)?))
            })
            .collect::<Result<Vec<_>>>()?;

        debug!(root = %self.root.display(), files = hashed.len(), "hashed bundle resources");
        self.files.extend(hashed);
        Ok(self)
    }

    /// Add (or replace) an entry for in-memory `data`.
    pub fn add_file(&mut self, relative: impl Into<String>, data: &[u8]) {
        self.files.insert(relative.into(), ResourceEntry::of(data, None));
    }

    pub fn files(&self) -> &BTreeMap<String, ResourceEntry> {
        &self.files
    }

    /// Render the XML plist.
    pub fn build(&self) -> Result<Vec<u8>> {
        let mut files = Dictionary::new();
        let mut files2 = Dictionary::new();
        for (path, entry) in &self.files {
            let optional = path.contains(".lproj/");

            if entry.symlink.is_none() {
                let legacy = if optional {
                    dict(&[("hash", Value::Data(entry.sha1.clone())), ("optional", Value::Boolean(true))])
                } else {
                    Value::Data(entry.sha1.clone())
                };
                files.insert(path.clone(), legacy);
            }

            if omitted_from_files2(path) {
                continue;
            }
            let mut modern = match &entry.symlink {
                Some(target) => vec![("symlink", Value::String(target.clone()))],
                None => vec![
                    ("hash", Value::Data(entry.sha1.clone())),
                    ("hash2", Value::Data(entry.sha256.clone())),
                ],
            };
            if optional {
                modern.push(("optional", Value::Boolean(true)));
            }
            files2.insert(path.clone(), dict(&modern));
        }

        let mut root = Dictionary::new();
        root.insert("files".into(), Value::Dictionary(files));
        root.insert("files2".into(), Value::Dictionary(files2));
        root.insert("rules".into(), Value::Dictionary(rules(LEGACY_RULES)));
        root.insert("rules2".into(), Value::Dictionary(rules(RULES2)));

        let mut xml = Vec::new();
        plist::to_writer_xml(&mut xml, &Value::Dictionary(root))?;
        Ok(xml)
    }
}

/// Hash the bundle at `root` (leaving out `main_executable`) and write the
/// seal to `_CodeSignature/CodeResources`. Returns the written bytes.
pub fn seal_bundle(root: &Path, main_executable: &Path, cancellation: Option<&Cancellation>) -> Result<Vec<u8>> {
    let mut builder = CodeResourcesBuilder::new(root).exclude(relative_path(root, main_executable));
    if let Some(cancel) = cancellation {
        builder = builder.cancellation(cancel.clone());
    }
    let plist = builder.scan()?.build()?;

    let dir = root.join(CODE_SIGNATURE_DIR);
    std::fs::create_dir_all(&dir).map_err(|e| Error::from(e).with_path(&dir))?;
    crate::macho::write_atomic(root.join(CODE_RESOURCES_PATH), &plist)?;
    Ok(plist)
}

fn hash_entry(path: &Path, is_symlink: bool) -> Result<ResourceEntry> {
    if is_symlink {
        let target = std::fs::read_link(path).map_err(|e| Error::from(e).with_path(path))?;
        let target = target.to_string_lossy().into_owned();
        return Ok(ResourceEntry::of(target.as_bytes(), Some(target.clone())));
    }
    let data = std::fs::read(path).map_err(|e| Error::from(e).with_path(path))?;
    Ok(ResourceEntry::of(&data, None))
}

/// `path` relative to `root`, with `/` separators.
fn relative_path(root: &Path, path: &Path) -> String {
    let relative = path.strip_prefix(root).unwrap_or(path);
    relative
        .components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/")
}

fn omitted_from_files2(path: &str) -> bool {
    path == "Info.plist" || path == "PkgInfo" || path == ".DS_Store" || path.ends_with("/.DS_Store")
}

fn dict(pairs: &[(&str, Value)]) -> Value {
    Value::Dictionary(pairs.iter().map(|(k, v)| (k.to_string(), v.clone())).collect())
}

/// A rule: pattern, `omit`, `optional`, weight. A bare `true` is written
/// when all three are unset.
type Rule = (&'static str, bool, bool, Option<f64>);

const LEGACY_RULES: &[Rule] = &[
    ("^.*", false, false, None),
    ("^.*\\.lproj/", false, true, Some(1000.0)),
    ("^.*\\.lproj/locversion.plist$", true, false, Some(1100.0)),
    ("^Base\\.lproj/", false, false, Some(1010.0)),
    ("^version.plist$", false, false, None),
];

const RULES2: &[Rule] = &[
    (".*\\.dSYM($|/)", false, false, Some(11.0)),
    ("^(.*/)?\\.DS_Store$", true, false, Some(2000.0)),
    ("^.*", false, false, None),
    ("^.*\\.lproj/", false, true, Some(1000.0)),
    ("^.*\\.lproj/locversion.plist$", true, false, Some(1100.0)),
    ("^Base\\.lproj/", false, false, Some(1010.0)),
    ("^Info\\.plist$", true, false, Some(20.0)),
    ("^PkgInfo$", true, false, Some(20.0)),
    ("^embedded\\.provisionprofile$", false, false, Some(20.0)),
    ("^version\\.plist$", false, false, Some(20.0)),
];

fn rules(table: &[Rule]) -> Dictionary {
    table
        .iter()
        .map(|&(pattern, omit, optional, weight)| {
            let mut rule = Dictionary::new();
            if omit {
                rule.insert("omit".into(), Value::Boolean(true));
            }
            if optional {
                rule.insert("optional".into(), Value::Boolean(true));
            }
            if let Some(weight) = weight {
                rule.insert("weight".into(), Value::Real(weight));
            }
            let value = if rule.is_empty() {
                Value::Boolean(true)
            } else {
                Value::Dictionary(rule)
            };
            (pattern.to_string(), value)
        })
        .collect()
}
