//! Durable key/value cache for search results, labels, hierarchy verdicts,
//! and final translations.
//!
//! The store owns all on-disk state: callers mutate the in-memory tables
//! through `put_*` methods and the store decides when to persist. Every
//! mutation runs a synchronous flush check — a full flush happens once the
//! dirty-mutation count reaches [`FlushPolicy::max_dirty`] or once
//! [`FlushPolicy::max_age`] has passed since the previous flush, whichever
//! comes first. Flushing writes the whole document to a temporary file and
//! atomically renames it over the previous one, so an abrupt termination
//! leaves either the old complete file or the new complete file, never a
//! torn write.
//!
//! The on-disk format is a single pretty-printed JSON document per language
//! pair, deliberately kept human-diffable for debugging. Concurrent writers
//! are not supported: one store instance per cache file (single-writer
//! discipline, enforced by the caller).

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::common::TranslationResult;
use crate::wikidata::qid::Qid;

/// Version stamp of the on-disk format.
///
/// Older files are quarantined to `.bak` and the store starts cold; newer
/// files fail loudly with [`CacheError::SchemaMismatch`].
pub const SCHEMA_VERSION: u32 = 2;

/// Errors surfaced by the cache store.
///
/// Only structural failures reach callers; an unusable-but-quarantinable
/// file is recovered from silently (cold start).
#[derive(Error, Debug)]
pub enum CacheError {
    #[error("cache file io error")]
    Io(#[from] std::io::Error),
    #[error("cache serialization error")]
    Serialize(#[from] serde_json::Error),
    /// The file was written by a newer engine. Refusing to guess at forward
    /// compatibility; delete or migrate the file by hand.
    #[error("cache file uses schema version {found}, newer than supported {supported}")]
    SchemaMismatch { found: u32, supported: u32 },
    /// An unusable cache file could not be renamed aside.
    #[error("failed to quarantine unusable cache file {path:?}")]
    Quarantine {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// When the deferred flush commits in-memory mutations to disk.
#[derive(Debug, Clone, Copy)]
pub struct FlushPolicy {
    /// Flush once this many mutations have accumulated.
    pub max_dirty: usize,
    /// Flush once this much wall-clock time has passed since the last flush.
    pub max_age: Duration,
}

impl Default for FlushPolicy {
    fn default() -> Self {
        Self {
            max_dirty: 20,
            max_age: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Metadata {
    version: u32,
    source_lang: String,
    target_lang: String,
    created_at: u64,
    #[serde(default)]
    last_flush_at: u64,
}

/// The four lookup tables of the on-disk document.
///
/// Every key is either a request id or an entity id — never a raw name — so
/// same-named places in different hierarchies cannot share state.
#[derive(Debug, Default, Serialize, Deserialize)]
struct Tables {
    /// request id → candidate entity ids, in search-result order.
    search: BTreeMap<String, Vec<Qid>>,
    /// entity id → language → label text.
    labels: BTreeMap<Qid, BTreeMap<String, String>>,
    /// "candidate_ancestor" → transitively-located-in verdict.
    hierarchy: BTreeMap<String, bool>,
    /// entity id → ontology type ids (P31 values).
    instance_of: BTreeMap<Qid, Vec<Qid>>,
}

#[derive(Debug, Serialize, Deserialize)]
struct CacheFile {
    metadata: Metadata,
    /// request id → final translation result.
    translations: BTreeMap<String, TranslationResult>,
    cache: Tables,
}

impl CacheFile {
    fn empty(source_lang: &str, target_lang: &str) -> Self {
        Self {
            metadata: Metadata {
                version: SCHEMA_VERSION,
                source_lang: source_lang.to_owned(),
                target_lang: target_lang.to_owned(),
                created_at: now_unix(),
                last_flush_at: 0,
            },
            translations: BTreeMap::new(),
            cache: Tables::default(),
        }
    }
}

/// Durable cache store with deferred, crash-resilient flushing.
#[derive(Debug)]
pub struct CacheStore {
    path: Option<PathBuf>,
    file: CacheFile,
    policy: FlushPolicy,
    dirty: usize,
    last_flush: Instant,
}

impl CacheStore {
    /// Creates a store that never touches disk. Used for one-off runs and
    /// tests.
    pub fn in_memory(source_lang: &str, target_lang: &str) -> Self {
        Self {
            path: None,
            file: CacheFile::empty(source_lang, target_lang),
            policy: FlushPolicy::default(),
            dirty: 0,
            last_flush: Instant::now(),
        }
    }

    /// Opens (or cold-starts) the cache file at `path`.
    ///
    /// A missing file yields an empty store. An unparsable file, an older
    /// schema version, or a different language pair quarantines the file to
    /// `<path>.bak` and starts cold. A *newer* schema version fails with
    /// [`CacheError::SchemaMismatch`].
    ///
    /// Idempotent and safe to call once at startup; there is no reload path.
    pub fn load(
        path: impl AsRef<Path>,
        source_lang: &str,
        target_lang: &str,
    ) -> Result<Self, CacheError> {
        let path = path.as_ref();
        let mut store = Self::in_memory(source_lang, target_lang);
        store.path = Some(path.to_owned());

        if !path.exists() {
            return Ok(store);
        }

        // Read as bytes so that corruption down to the encoding level is
        // handled by the parse path below, not surfaced as an io error.
        let raw = std::fs::read(path)?;
        let parsed: CacheFile = match serde_json::from_slice(&raw) {
            Ok(parsed) => parsed,
            Err(err) => {
                log::warn!("cache file {} is unreadable ({err}), starting cold", path.display());
                quarantine(path)?;
                return Ok(store);
            }
        };

        let version = parsed.metadata.version;
        if version > SCHEMA_VERSION {
            return Err(CacheError::SchemaMismatch {
                found: version,
                supported: SCHEMA_VERSION,
            });
        }
        if version < SCHEMA_VERSION {
            log::info!(
                "cache file {} uses old schema v{version}, quarantining and starting cold",
                path.display()
            );
            quarantine(path)?;
            return Ok(store);
        }
        if parsed.metadata.source_lang != source_lang
            || parsed.metadata.target_lang != target_lang
        {
            log::warn!(
                "cache file {} holds language pair {}→{}, expected {source_lang}→{target_lang}; starting cold",
                path.display(),
                parsed.metadata.source_lang,
                parsed.metadata.target_lang
            );
            quarantine(path)?;
            return Ok(store);
        }

        store.file = parsed;
        Ok(store)
    }

    /// Replaces the flush policy.
    pub fn with_policy(mut self, policy: FlushPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Number of mutations not yet committed to disk.
    pub fn dirty(&self) -> usize {
        self.dirty
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    // Reads. All lookups are exact-key; no table supports range queries.

    pub fn translation(&self, id: &str) -> Option<&TranslationResult> {
        self.file.translations.get(id)
    }

    pub fn search_results(&self, id: &str) -> Option<&[Qid]> {
        self.file.cache.search.get(id).map(Vec::as_slice)
    }

    pub fn labels(&self, qid: &Qid) -> Option<&BTreeMap<String, String>> {
        self.file.cache.labels.get(qid)
    }

    pub fn hierarchy(&self, candidate: &Qid, ancestor: &Qid) -> Option<bool> {
        self.file
            .cache
            .hierarchy
            .get(&hierarchy_key(candidate, ancestor))
            .copied()
    }

    pub fn instance_of(&self, qid: &Qid) -> Option<&[Qid]> {
        self.file.cache.instance_of.get(qid).map(Vec::as_slice)
    }

    // Writes. Each marks the store dirty and runs the flush check.

    pub fn put_translation(&mut self, id: &str, result: TranslationResult) {
        self.file.translations.insert(id.to_owned(), result);
        self.mark_dirty();
    }

    pub fn put_search(&mut self, id: &str, candidates: Vec<Qid>) {
        self.file.cache.search.insert(id.to_owned(), candidates);
        self.mark_dirty();
    }

    pub fn put_labels(&mut self, qid: Qid, labels: BTreeMap<String, String>) {
        self.file.cache.labels.insert(qid, labels);
        self.mark_dirty();
    }

    pub fn put_hierarchy(&mut self, candidate: &Qid, ancestor: &Qid, verdict: bool) {
        self.file
            .cache
            .hierarchy
            .insert(hierarchy_key(candidate, ancestor), verdict);
        self.mark_dirty();
    }

    pub fn put_instance_of(&mut self, qid: Qid, types: Vec<Qid>) {
        self.file.cache.instance_of.insert(qid, types);
        self.mark_dirty();
    }

    /// Commits the in-memory tables to disk.
    ///
    /// With `force` the flush is unconditional; otherwise it only happens
    /// when the policy says a flush is due. A successful flush resets the
    /// dirty counter and the age clock.
    pub fn flush(&mut self, force: bool) -> Result<(), CacheError> {
        if !force && !self.flush_due() {
            return Ok(());
        }

        if let Some(path) = self.path.clone() {
            self.file.metadata.last_flush_at = now_unix();

            if let Some(parent) = path.parent() {
                if !parent.as_os_str().is_empty() {
                    std::fs::create_dir_all(parent)?;
                }
            }

            // Atomic replace: a crash between write and rename leaves the
            // previous complete file untouched.
            let tmp = sibling_with_suffix(&path, ".tmp");
            std::fs::write(&tmp, serde_json::to_string_pretty(&self.file)?)?;
            std::fs::rename(&tmp, &path)?;
        }

        self.dirty = 0;
        self.last_flush = Instant::now();
        Ok(())
    }

    fn flush_due(&self) -> bool {
        self.dirty >= self.policy.max_dirty || self.last_flush.elapsed() >= self.policy.max_age
    }

    fn mark_dirty(&mut self) {
        self.dirty += 1;
        if self.flush_due() {
            // Auto-flush failures must not poison the mutation path; the
            // forced end-of-batch flush will surface persistent problems.
            if let Err(err) = self.flush(true) {
                log::warn!("deferred cache flush failed: {err}");
            }
        }
    }
}

/// Builds the composite key of the hierarchy table.
fn hierarchy_key(candidate: &Qid, ancestor: &Qid) -> String {
    format!("{candidate}_{ancestor}")
}

fn now_unix() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// Appends `suffix` to the full file name (`cache.json` → `cache.json.tmp`).
fn sibling_with_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(suffix);
    PathBuf::from(name)
}

/// Renames an unusable cache file to `<path>.bak`.
fn quarantine(path: &Path) -> Result<(), CacheError> {
    let bak = sibling_with_suffix(path, ".bak");
    std::fs::rename(path, &bak).map_err(|source| CacheError::Quarantine {
        path: path.to_owned(),
        source,
    })
}
