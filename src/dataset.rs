//! Request model, request collection, and batch iteration.
//!
//! A [`TranslationRequest`] describes one place name to translate together
//! with its full administrative ancestry. The ancestry is folded into the
//! request id, so two places with the same name under different parents
//! never share cache state. [`RequestSet`] is the ordered, keyed collection
//! the engine consumes, and [`Batches`] slices it into fixed-size batches
//! while reporting progress.

use std::collections::{BTreeMap, HashMap, HashSet};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Administrative tier of a place name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AdminLevel {
    /// First-order administrative division (province, prefecture, state).
    #[serde(rename = "ADM1")]
    Admin1,
    /// Second-order administrative division (city, county, district).
    #[serde(rename = "ADM2")]
    Admin2,
    /// Third-order administrative division.
    #[serde(rename = "ADM3")]
    Admin3,
    /// Fourth-order administrative division.
    #[serde(rename = "ADM4")]
    Admin4,
}

impl AdminLevel {
    /// Returns the stable short code used inside request ids.
    pub fn as_str(&self) -> &'static str {
        match self {
            AdminLevel::Admin1 => "ADM1",
            AdminLevel::Admin2 => "ADM2",
            AdminLevel::Admin3 => "ADM3",
            AdminLevel::Admin4 => "ADM4",
        }
    }
}

impl std::fmt::Display for AdminLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors produced while building a [`RequestSet`] from raw records.
///
/// These are structural input failures: they abort the run before any
/// network call is made.
#[derive(Error, Debug)]
pub enum ValidationError {
    /// A record lacks a column required by its administrative level.
    #[error("record {row} is missing required column {column:?}")]
    MissingColumn { row: usize, column: String },
    /// A required column is present but blank.
    #[error("record {row} has a blank value in required column {column:?}")]
    BlankColumn { row: usize, column: String },
}

/// Escapes a single id segment so that the segment separator `|` can never
/// be forged by input data.
fn escape_segment(segment: &str) -> String {
    segment.replace('\\', "\\\\").replace('|', "\\|")
}

/// Builds the context-aware request id from its identity triple.
///
/// The id is a pure function of `(level, parent_chain, original_name)`:
/// equal triples always yield equal ids and distinct triples never collide,
/// because every segment is escaped before joining.
fn request_id(level: AdminLevel, parent_chain: &[String], original_name: &str) -> String {
    let mut id = String::from(level.as_str());
    for parent in parent_chain {
        id.push('|');
        id.push_str(&escape_segment(parent));
    }
    id.push('|');
    id.push_str(&escape_segment(original_name));
    id
}

/// One place name to translate, with its hierarchy context.
///
/// Immutable after construction; the id is computed once from
/// `(level, parent_chain, original_name)` and is the sole key used by the
/// cache and the result map.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TranslationRequest {
    id: String,
    level: AdminLevel,
    original_name: String,
    source_lang: String,
    target_lang: String,
    parent_chain: Vec<String>,
    metadata: BTreeMap<String, String>,
}

impl TranslationRequest {
    /// Constructs a request and derives its id.
    pub fn from_values(
        level: AdminLevel,
        original_name: impl Into<String>,
        source_lang: impl Into<String>,
        target_lang: impl Into<String>,
        parent_chain: Vec<String>,
        metadata: BTreeMap<String, String>,
    ) -> Self {
        let original_name = original_name.into();
        let id = request_id(level, &parent_chain, &original_name);
        Self {
            id,
            level,
            original_name,
            source_lang: source_lang.into(),
            target_lang: target_lang.into(),
            parent_chain,
            metadata,
        }
    }

    /// The context-aware cache/lookup key for this request.
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn level(&self) -> AdminLevel {
        self.level
    }

    pub fn original_name(&self) -> &str {
        &self.original_name
    }

    pub fn source_lang(&self) -> &str {
        &self.source_lang
    }

    pub fn target_lang(&self) -> &str {
        &self.target_lang
    }

    /// Ancestor names, root first (e.g. country code, then province).
    pub fn parent_chain(&self) -> &[String] {
        &self.parent_chain
    }

    /// Opaque caller-supplied context. Never interpreted by the engine.
    pub fn metadata(&self) -> &BTreeMap<String, String> {
        &self.metadata
    }
}

/// Summary statistics over a [`RequestSet`], for observability only.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestStats {
    /// Number of requests in the set.
    pub len: usize,
    /// Number of distinct parent chains.
    pub unique_parents: usize,
    pub source_lang: String,
    pub target_lang: String,
}

/// Ordered collection of requests keyed by `(level, parent_chain, name)`.
///
/// Duplicate keys always collapse onto the first occurrence; `dedup`
/// controls whether a collapse is silent or logged.
#[derive(Debug, Default, Clone)]
pub struct RequestSet {
    items: Vec<TranslationRequest>,
    index: HashMap<String, usize>,
}

impl RequestSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts a request, preserving insertion order.
    ///
    /// Returns false if a request with the same id was already present. With
    /// `dedup` set the repeat is dropped silently; otherwise it is logged so
    /// pipelines that expect distinct rows notice the duplication.
    pub fn push(&mut self, request: TranslationRequest, dedup: bool) -> bool {
        if self.index.contains_key(request.id()) {
            if !dedup {
                log::warn!(
                    "duplicate request collapsed onto existing entry: {}",
                    request.id()
                );
            }
            return false;
        }
        self.index.insert(request.id().to_owned(), self.items.len());
        self.items.push(request);
        true
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&TranslationRequest> {
        self.items.get(index)
    }

    /// Looks a request up by its id.
    pub fn get_by_id(&self, id: &str) -> Option<&TranslationRequest> {
        self.index.get(id).map(|&i| &self.items[i])
    }

    pub fn iter(&self) -> std::slice::Iter<'_, TranslationRequest> {
        self.items.iter()
    }

    /// Computes summary statistics. Never consulted by translation logic.
    pub fn stats(&self) -> RequestStats {
        let unique_parents = self
            .items
            .iter()
            .map(|item| item.parent_chain())
            .collect::<HashSet<_>>()
            .len();
        let (source_lang, target_lang) = self
            .items
            .first()
            .map(|item| (item.source_lang().to_owned(), item.target_lang().to_owned()))
            .unwrap_or_default();
        RequestStats {
            len: self.items.len(),
            unique_parents,
            source_lang,
            target_lang,
        }
    }

    /// Returns a batch iterator in insertion order.
    ///
    /// `progress` is invoked after each yielded batch with
    /// `(processed, total)`. The iterator is stateless between runs: calling
    /// this again replays all batches.
    pub fn batches<'a>(
        &'a self,
        batch_size: usize,
        progress: Option<&'a dyn Fn(usize, usize)>,
    ) -> Batches<'a> {
        Batches::new(self.items.iter().collect(), batch_size, progress)
    }

    /// Returns a batch iterator ordered by a caller-supplied comparator.
    pub fn batches_by<'a, F>(
        &'a self,
        batch_size: usize,
        compare: F,
        progress: Option<&'a dyn Fn(usize, usize)>,
    ) -> Batches<'a>
    where
        F: FnMut(&&TranslationRequest, &&TranslationRequest) -> std::cmp::Ordering,
    {
        let mut ordered: Vec<&TranslationRequest> = self.items.iter().collect();
        ordered.sort_by(compare);
        Batches::new(ordered, batch_size, progress)
    }
}

impl<'a> IntoIterator for &'a RequestSet {
    type Item = &'a TranslationRequest;
    type IntoIter = std::slice::Iter<'a, TranslationRequest>;

    fn into_iter(self) -> Self::IntoIter {
        self.items.iter()
    }
}

/// Iterator over fixed-size request batches with a progress callback.
///
/// The last batch may be shorter. The callback fires after each batch is
/// produced, with the cumulative processed count and the total.
pub struct Batches<'a> {
    ordered: Vec<&'a TranslationRequest>,
    batch_size: usize,
    cursor: usize,
    progress: Option<&'a dyn Fn(usize, usize)>,
}

impl<'a> Batches<'a> {
    fn new(
        ordered: Vec<&'a TranslationRequest>,
        batch_size: usize,
        progress: Option<&'a dyn Fn(usize, usize)>,
    ) -> Self {
        Self {
            ordered,
            batch_size: batch_size.max(1),
            cursor: 0,
            progress,
        }
    }
}

impl<'a> Iterator for Batches<'a> {
    type Item = Vec<&'a TranslationRequest>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.cursor >= self.ordered.len() {
            return None;
        }
        let end = (self.cursor + self.batch_size).min(self.ordered.len());
        let batch = self.ordered[self.cursor..end].to_vec();
        self.cursor = end;
        if let Some(progress) = self.progress {
            progress(self.cursor, self.ordered.len());
        }
        Some(batch)
    }
}

/// Columns to extract from raw records for one administrative level.
#[derive(Debug, Clone, Default)]
pub struct FieldSpec {
    /// Column holding the place name. Required and must be non-blank.
    pub name: String,
    /// Columns holding ancestor names, outermost first. Required per record.
    pub parents: Vec<String>,
    /// Columns copied verbatim into the request metadata bag when present.
    pub metadata: Vec<String>,
}

/// Builds [`RequestSet`]s from normalized tabular records.
///
/// Column-to-level mapping is the country-specific collaborator's business;
/// this builder only validates that the requested columns exist and are
/// non-blank, and prefixes every parent chain with the country code.
#[derive(Debug, Clone)]
pub struct RequestSetBuilder {
    country_code: String,
    source_lang: String,
    target_lang: String,
}

impl RequestSetBuilder {
    pub fn new(
        country_code: impl Into<String>,
        source_lang: impl Into<String>,
        target_lang: impl Into<String>,
    ) -> Self {
        Self {
            country_code: country_code.into(),
            source_lang: source_lang.into(),
            target_lang: target_lang.into(),
        }
    }

    /// Builds a request set from raw records.
    ///
    /// # Arguments
    ///
    /// * `records`: column name → value rows, as produced by the extraction
    ///   pipeline.
    /// * `level`: administrative level all records belong to.
    /// * `fields`: which columns provide the name, parents, and metadata.
    /// * `dedup`: silently drop exact key repeats instead of warning.
    ///
    /// # Errors
    ///
    /// Fails with a [`ValidationError`] naming the first missing or blank
    /// required column.
    pub fn build(
        &self,
        records: &[HashMap<String, String>],
        level: AdminLevel,
        fields: &FieldSpec,
        dedup: bool,
    ) -> Result<RequestSet, ValidationError> {
        let mut set = RequestSet::new();

        for (row, record) in records.iter().enumerate() {
            let name = required_column(record, row, &fields.name)?;

            let mut parent_chain = Vec::with_capacity(fields.parents.len() + 1);
            parent_chain.push(self.country_code.clone());
            for column in &fields.parents {
                parent_chain.push(required_column(record, row, column)?.to_owned());
            }

            let metadata: BTreeMap<String, String> = fields
                .metadata
                .iter()
                .filter_map(|column| {
                    record
                        .get(column)
                        .map(|value| (column.clone(), value.clone()))
                })
                .collect();

            let request = TranslationRequest::from_values(
                level,
                name,
                self.source_lang.clone(),
                self.target_lang.clone(),
                parent_chain,
                metadata,
            );
            set.push(request, dedup);
        }

        Ok(set)
    }

    /// Builds first-order divisions: parent chain is the country code only,
    /// exact repeats are dropped.
    pub fn build_admin1(
        &self,
        records: &[HashMap<String, String>],
        name_field: &str,
    ) -> Result<RequestSet, ValidationError> {
        let fields = FieldSpec {
            name: name_field.to_owned(),
            ..FieldSpec::default()
        };
        self.build(records, AdminLevel::Admin1, &fields, true)
    }

    /// Builds second-order divisions: same names under different parents are
    /// kept distinct, and collapsed repeats are logged.
    pub fn build_admin2(
        &self,
        records: &[HashMap<String, String>],
        parent_field: &str,
        name_field: &str,
        metadata_fields: &[&str],
    ) -> Result<RequestSet, ValidationError> {
        let fields = FieldSpec {
            name: name_field.to_owned(),
            parents: vec![parent_field.to_owned()],
            metadata: metadata_fields.iter().map(|s| (*s).to_owned()).collect(),
        };
        self.build(records, AdminLevel::Admin2, &fields, false)
    }
}

/// Fetches a required column, distinguishing missing from blank.
fn required_column<'a>(
    record: &'a HashMap<String, String>,
    row: usize,
    column: &str,
) -> Result<&'a str, ValidationError> {
    let value = record.get(column).ok_or_else(|| ValidationError::MissingColumn {
        row,
        column: column.to_owned(),
    })?;
    let value = value.trim();
    if value.is_empty() {
        return Err(ValidationError::BlankColumn {
            row,
            column: column.to_owned(),
        });
    }
    Ok(value)
}
