//! The translation engine.
//!
//! [`Translator`] resolves place names against the knowledge graph in three
//! phases per batch: candidate collection (cache-first entity search), bulk
//! label retrieval for the union of all candidates, and per-request
//! resolution (hierarchy verification, then the language fallback chain).
//! Network failures degrade individual requests to their fallback results;
//! only cache-store failures abort a batch.

pub mod client;
pub mod qid;

use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::PathBuf;

use nohash_hasher::IntMap;

use crate::cache::{CacheError, CacheStore, FlushPolicy};
use crate::common::{contains_han, is_simplified_tag, Source, TranslationResult};
use crate::dataset::{AdminLevel, RequestSet, TranslationRequest};
use client::{KnowledgeGraph, WikidataClient, ENTITY_CHUNK_SIZE, ZHWIKI_LANG};
use qid::Qid;

/// Builds the default label fallback chain for a language pair:
/// the target language first, then the traditional/simplified Chinese tags,
/// then English, then the source language. Duplicates collapse in order.
pub fn default_fallback_langs(source_lang: &str, target_lang: &str) -> Vec<String> {
    let mut chain: Vec<String> = Vec::new();
    for lang in [target_lang, "zh-hant", "zh", "en", source_lang] {
        if !chain.iter().any(|l| l == lang) {
            chain.push(lang.to_owned());
        }
    }
    chain
}

/// Construction options for [`Translator::new`].
#[derive(Default)]
pub struct TranslatorOptions {
    /// Where to persist the cache. `None` keeps the cache in memory only.
    pub cache_path: Option<PathBuf>,
    /// Overrides the label fallback chain. `None` uses
    /// [`default_fallback_langs`].
    pub fallback_langs: Option<Vec<String>>,
    /// When deferred cache flushes happen.
    pub flush_policy: FlushPolicy,
}

/// Everything known about one candidate entity, as presented to a
/// caller-supplied filter.
#[derive(Debug, Clone)]
pub struct CandidateInfo {
    pub qid: Qid,
    /// Labels by language tag, including the zhwiki sitelink title.
    pub labels: BTreeMap<String, String>,
    /// `instance of` (P31) type ids.
    pub instance_of: Vec<Qid>,
}

/// Per-call options for batch translation.
#[derive(Default)]
pub struct BatchOptions<'a> {
    /// Expected ancestor entity per request id, for hierarchy verification.
    /// Requests without an entry skip verification.
    pub parent_qids: Option<&'a HashMap<String, Qid>>,
    /// Drops candidates the predicate rejects, before selection. Called with
    /// the request's original name and the candidate's info.
    pub candidate_filter: Option<&'a dyn Fn(&str, &CandidateInfo) -> bool>,
}

/// Translates place names through the knowledge graph, with a durable
/// local cache.
pub struct Translator {
    graph: Box<dyn KnowledgeGraph>,
    cache: CacheStore,
    source_lang: String,
    target_lang: String,
    fallback_langs: Vec<String>,
}

struct Pending<'a> {
    request: &'a TranslationRequest,
    candidates: Vec<Qid>,
}

impl Translator {
    /// Creates a translator backed by the live Wikidata endpoints.
    ///
    /// # Arguments
    ///
    /// * `source_lang`: Language of the input names (e.g. `"ja"`).
    /// * `target_lang`: Language to translate into (e.g. `"zh-tw"`).
    /// * `options`: Cache location, fallback chain and flush policy.
    pub fn new(
        source_lang: &str,
        target_lang: &str,
        options: TranslatorOptions,
    ) -> Result<Self, CacheError> {
        let fallback_langs = options
            .fallback_langs
            .unwrap_or_else(|| default_fallback_langs(source_lang, target_lang));
        let cache = match &options.cache_path {
            Some(path) => CacheStore::load(path, source_lang, target_lang)?,
            None => CacheStore::in_memory(source_lang, target_lang),
        }
        .with_policy(options.flush_policy);
        let graph = Box::new(WikidataClient::new(source_lang, &fallback_langs));

        Ok(Self::from_parts(
            graph,
            cache,
            source_lang,
            target_lang,
            fallback_langs,
        ))
    }

    /// Assembles a translator from explicit parts. This is the seam tests
    /// use to substitute a scripted graph.
    pub fn from_parts(
        graph: Box<dyn KnowledgeGraph>,
        cache: CacheStore,
        source_lang: &str,
        target_lang: &str,
        fallback_langs: Vec<String>,
    ) -> Self {
        Self {
            graph,
            cache,
            source_lang: source_lang.to_owned(),
            target_lang: target_lang.to_owned(),
            fallback_langs,
        }
    }

    pub fn source_lang(&self) -> &str {
        &self.source_lang
    }

    pub fn target_lang(&self) -> &str {
        &self.target_lang
    }

    pub fn cache(&self) -> &CacheStore {
        &self.cache
    }

    /// Forces pending cache mutations to disk.
    pub fn flush(&mut self) -> Result<(), CacheError> {
        self.cache.flush(true)
    }

    /// Translates one batch of requests.
    ///
    /// Returns a map from request id to result, with every request present.
    /// Requests whose remote lookups fail degrade to fallback results; the
    /// only error path is the cache store.
    pub async fn translate_batch(
        &mut self,
        batch: &[&TranslationRequest],
        options: &BatchOptions<'_>,
    ) -> Result<HashMap<String, TranslationResult>, CacheError> {
        let mut results: HashMap<String, TranslationResult> = HashMap::with_capacity(batch.len());

        // Phase 1: settle cached translations, search candidates for the
        // rest. Search results are cached per request id, not per name, so
        // context changes never reuse stale candidate lists.
        let mut working: Vec<Pending> = Vec::new();
        for request in batch {
            if let Some(hit) = self.cache.translation(request.id()) {
                results.insert(request.id().to_owned(), hit.clone());
                continue;
            }

            let candidates = match self.cache.search_results(request.id()) {
                Some(cached) => cached.to_vec(),
                None => match self.graph.search(request.original_name()).await {
                    Ok(found) => {
                        self.cache.put_search(request.id(), found.clone());
                        found
                    }
                    Err(err) => {
                        // Not cached, so the search is retried next run.
                        log::warn!(
                            "entity search failed for {:?}: {err}",
                            request.original_name()
                        );
                        Vec::new()
                    }
                },
            };
            working.push(Pending {
                request: *request,
                candidates,
            });
        }
        log::info!(
            "batch: {} cached, {} to resolve",
            results.len(),
            working.len()
        );

        // Phase 1.5: apply the caller's candidate filter, if any. The filter
        // sees labels and types, so those are fetched up front.
        if let Some(filter) = options.candidate_filter {
            let all: Vec<Qid> = working
                .iter()
                .flat_map(|pending| pending.candidates.iter().cloned())
                .collect();
            let labels = self.ensure_labels(&all).await;
            let types = self.ensure_types(&all).await;

            for pending in &mut working {
                let name = pending.request.original_name();
                pending.candidates.retain(|qid| {
                    let info = CandidateInfo {
                        qid: qid.clone(),
                        labels: labels.get(qid).cloned().unwrap_or_default(),
                        instance_of: types.get(qid).cloned().unwrap_or_default(),
                    };
                    let keep = filter(name, &info);
                    if !keep {
                        log::debug!("candidate {qid} rejected for {name:?}");
                    }
                    keep
                });
            }
        }

        // Phase 2: fetch labels for the union of surviving candidates.
        let all: Vec<Qid> = working
            .iter()
            .flat_map(|pending| pending.candidates.iter().cloned())
            .collect();
        let labels = self.ensure_labels(&all).await;

        // Phase 3: per-request selection and label resolution.
        for pending in working {
            let request = pending.request;
            let ancestor = options
                .parent_qids
                .and_then(|parents| parents.get(request.id()));

            let (selected, parent_verified) =
                self.select_candidate(&pending.candidates, ancestor).await;

            let result = match selected {
                Some(qid) => {
                    let entity_labels = labels.get(&qid).cloned().unwrap_or_default();
                    self.pick_label(request.original_name(), qid, entity_labels, parent_verified)
                        .await
                }
                None => self.title_fallback(request.original_name()).await,
            };

            self.cache.put_translation(request.id(), result.clone());
            results.insert(request.id().to_owned(), result);
        }

        // A batch boundary is a durability point regardless of the deferred
        // flush policy.
        self.cache.flush(true)?;
        Ok(results)
    }

    /// Translates a whole request set in batches.
    ///
    /// # Arguments
    ///
    /// * `set`: The requests to translate.
    /// * `batch_size`: Requests per batch.
    /// * `options`: Shared per-batch options.
    /// * `progress`: Invoked with `(processed, total)` after each batch.
    pub async fn translate_dataset(
        &mut self,
        set: &RequestSet,
        batch_size: usize,
        options: &BatchOptions<'_>,
        progress: Option<&dyn Fn(usize, usize)>,
    ) -> Result<HashMap<String, TranslationResult>, CacheError> {
        let mut all = HashMap::with_capacity(set.len());
        for batch in set.batches(batch_size, progress) {
            let resolved = self.translate_batch(&batch, options).await?;
            all.extend(resolved);
        }
        Ok(all)
    }

    /// Translates a single name, optionally verified against an ancestor
    /// entity. Convenience wrapper over the batch path, sharing its cache.
    pub async fn translate_one(
        &mut self,
        level: AdminLevel,
        name: &str,
        parent_chain: Vec<String>,
        ancestor: Option<Qid>,
    ) -> Result<TranslationResult, CacheError> {
        let request = TranslationRequest::from_values(
            level,
            name,
            self.source_lang.clone(),
            self.target_lang.clone(),
            parent_chain,
            BTreeMap::new(),
        );
        let parents = ancestor.map(|qid| HashMap::from([(request.id().to_owned(), qid)]));
        let options = BatchOptions {
            parent_qids: parents.as_ref(),
            candidate_filter: None,
        };

        let mut results = self.translate_batch(&[&request], &options).await?;
        Ok(results
            .remove(request.id())
            .unwrap_or_else(|| original_result(name)))
    }

    /// Returns labels for every id, fetching uncached entities in chunks of
    /// [`ENTITY_CHUNK_SIZE`]. Failed chunks are skipped and their entities
    /// simply stay absent.
    async fn ensure_labels(&mut self, qids: &[Qid]) -> IntMap<Qid, BTreeMap<String, String>> {
        let unique = dedup(qids);
        let missing: Vec<Qid> = unique
            .iter()
            .filter(|qid| self.cache.labels(qid).is_none())
            .cloned()
            .collect();

        if !missing.is_empty() {
            log::info!(
                "fetching labels for {} entities in {} calls",
                missing.len(),
                missing.len().div_ceil(ENTITY_CHUNK_SIZE)
            );
        }
        for chunk in missing.chunks(ENTITY_CHUNK_SIZE) {
            match self.graph.batch_labels(chunk).await {
                Ok(fetched) => {
                    for (qid, labels) in fetched {
                        self.cache.put_labels(qid, labels);
                    }
                }
                Err(err) => log::warn!("label fetch failed for {} entities: {err}", chunk.len()),
            }
        }

        unique
            .iter()
            .filter_map(|qid| self.cache.labels(qid).map(|l| (qid.clone(), l.clone())))
            .collect()
    }

    /// Returns `instance of` types for every id, fetching uncached entities
    /// in chunks of [`ENTITY_CHUNK_SIZE`].
    async fn ensure_types(&mut self, qids: &[Qid]) -> IntMap<Qid, Vec<Qid>> {
        let unique = dedup(qids);
        let missing: Vec<Qid> = unique
            .iter()
            .filter(|qid| self.cache.instance_of(qid).is_none())
            .cloned()
            .collect();

        for chunk in missing.chunks(ENTITY_CHUNK_SIZE) {
            match self.graph.batch_types(chunk).await {
                Ok(fetched) => {
                    for (qid, types) in fetched {
                        self.cache.put_instance_of(qid, types);
                    }
                }
                Err(err) => log::warn!("type fetch failed for {} entities: {err}", chunk.len()),
            }
        }

        unique
            .iter()
            .filter_map(|qid| {
                self.cache
                    .instance_of(qid)
                    .map(|t| (qid.clone(), t.to_vec()))
            })
            .collect()
    }

    /// Picks the winning candidate.
    ///
    /// With an ancestor, candidates are probed in relevance order and the
    /// first one verified to lie within the ancestor wins. Without one, or
    /// when nothing verifies, the most relevant candidate wins unverified.
    async fn select_candidate(
        &mut self,
        candidates: &[Qid],
        ancestor: Option<&Qid>,
    ) -> (Option<Qid>, bool) {
        let Some(first) = candidates.first() else {
            return (None, false);
        };

        if let Some(ancestor) = ancestor {
            for candidate in candidates {
                let verdict = match self.cache.hierarchy(candidate, ancestor) {
                    Some(cached) => cached,
                    None => match self.graph.is_located_in(candidate, ancestor).await {
                        Ok(verdict) => {
                            self.cache.put_hierarchy(candidate, ancestor, verdict);
                            verdict
                        }
                        Err(err) => {
                            // Treated as unverified, not cached as false.
                            log::warn!("hierarchy check failed for {candidate}: {err}");
                            false
                        }
                    },
                };
                if verdict {
                    return (Some(candidate.clone()), true);
                }
            }
            log::debug!(
                "no candidate of {} verified under {ancestor}, keeping the most relevant",
                candidates.len()
            );
        }

        (Some(first.clone()), false)
    }

    /// Resolves the translated text for a selected entity by walking the
    /// language fallback chain over its labels.
    async fn pick_label(
        &mut self,
        name: &str,
        qid: Qid,
        labels: BTreeMap<String, String>,
        parent_verified: bool,
    ) -> TranslationResult {
        for lang in &self.fallback_langs {
            let Some(text) = labels.get(lang).filter(|text| !text.trim().is_empty()) else {
                continue;
            };

            // Labels under simplified-Chinese tags get normalized to the
            // traditional script before use.
            let translated = if is_simplified_tag(lang) && contains_han(text) {
                match self.graph.convert_title(text).await {
                    Ok(converted) if !converted.trim().is_empty() => converted,
                    Ok(_) => text.clone(),
                    Err(err) => {
                        log::warn!("script normalization failed for {text:?}: {err}");
                        text.clone()
                    }
                }
            } else {
                text.clone()
            };

            return TranslationResult {
                translated,
                qid: Some(qid),
                source: Source::Graph,
                used_lang: lang.clone(),
                parent_verified,
            };
        }

        // The zhwiki sitelink title comes after the configured chain. It is
        // simplified script, so it always goes through normalization.
        if let Some(title) = labels
            .get(ZHWIKI_LANG)
            .filter(|title| !title.trim().is_empty())
        {
            let translated = match self.graph.convert_title(title).await {
                Ok(converted) if !converted.trim().is_empty() => converted,
                _ => title.clone(),
            };
            return TranslationResult {
                translated,
                qid: Some(qid),
                source: Source::Graph,
                used_lang: ZHWIKI_LANG.to_owned(),
                parent_verified,
            };
        }

        // Entity without a usable label: try title normalization of the
        // input, keeping the entity attribution.
        let mut result = self.title_fallback(name).await;
        result.qid = Some(qid);
        result.parent_verified = parent_verified;
        result
    }

    /// Last resort when no entity (or no label) is available: run the input
    /// name through title normalization. An echo means the wiki knows
    /// nothing about the title, so the original name is returned as-is.
    async fn title_fallback(&mut self, name: &str) -> TranslationResult {
        match self.graph.convert_title(name).await {
            Ok(converted) if !converted.trim().is_empty() && converted != name => {
                TranslationResult {
                    translated: converted,
                    qid: None,
                    source: Source::FallbackTitle,
                    used_lang: ZHWIKI_LANG.to_owned(),
                    parent_verified: false,
                }
            }
            Ok(_) => original_result(name),
            Err(err) => {
                log::warn!("title conversion failed for {name:?}: {err}");
                original_result(name)
            }
        }
    }
}

fn original_result(name: &str) -> TranslationResult {
    TranslationResult {
        translated: name.to_owned(),
        qid: None,
        source: Source::Original,
        used_lang: "original".to_owned(),
        parent_verified: false,
    }
}

fn dedup(qids: &[Qid]) -> Vec<Qid> {
    let mut seen: HashSet<Qid> = HashSet::with_capacity(qids.len());
    qids.iter()
        .filter(|qid| seen.insert((*qid).clone()))
        .cloned()
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::FetchError;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    #[derive(Default)]
    struct Counters {
        search: AtomicU32,
        labels: AtomicU32,
        types: AtomicU32,
        locate: AtomicU32,
        convert: AtomicU32,
    }

    #[derive(Default)]
    struct MockGraph {
        search_map: HashMap<String, Vec<Qid>>,
        labels_map: HashMap<Qid, BTreeMap<String, String>>,
        types_map: HashMap<Qid, Vec<Qid>>,
        located: HashSet<(u64, u64)>,
        converts: HashMap<String, String>,
        offline: bool,
        counters: Arc<Counters>,
    }

    fn fetch_error() -> FetchError {
        let source = reqwest::Client::new()
            .get("http://exa mple.invalid")
            .build()
            .unwrap_err();
        FetchError::RetriesExhausted {
            attempts: 5,
            source,
        }
    }

    #[async_trait]
    impl KnowledgeGraph for MockGraph {
        async fn search(&mut self, name: &str) -> Result<Vec<Qid>, FetchError> {
            self.counters.search.fetch_add(1, Ordering::SeqCst);
            if self.offline {
                return Err(fetch_error());
            }
            Ok(self.search_map.get(name).cloned().unwrap_or_default())
        }

        async fn batch_labels(
            &mut self,
            ids: &[Qid],
        ) -> Result<IntMap<Qid, BTreeMap<String, String>>, FetchError> {
            self.counters.labels.fetch_add(1, Ordering::SeqCst);
            if self.offline {
                return Err(fetch_error());
            }
            assert!(ids.len() <= ENTITY_CHUNK_SIZE, "oversized label chunk");
            Ok(ids
                .iter()
                .map(|qid| {
                    (
                        qid.clone(),
                        self.labels_map.get(qid).cloned().unwrap_or_default(),
                    )
                })
                .collect())
        }

        async fn batch_types(
            &mut self,
            ids: &[Qid],
        ) -> Result<IntMap<Qid, Vec<Qid>>, FetchError> {
            self.counters.types.fetch_add(1, Ordering::SeqCst);
            if self.offline {
                return Err(fetch_error());
            }
            assert!(ids.len() <= ENTITY_CHUNK_SIZE, "oversized type chunk");
            Ok(ids
                .iter()
                .map(|qid| {
                    (
                        qid.clone(),
                        self.types_map.get(qid).cloned().unwrap_or_default(),
                    )
                })
                .collect())
        }

        async fn is_located_in(
            &mut self,
            candidate: &Qid,
            ancestor: &Qid,
        ) -> Result<bool, FetchError> {
            self.counters.locate.fetch_add(1, Ordering::SeqCst);
            if self.offline {
                return Err(fetch_error());
            }
            Ok(self
                .located
                .contains(&(candidate.as_u64(), ancestor.as_u64())))
        }

        async fn convert_title(&mut self, title: &str) -> Result<String, FetchError> {
            self.counters.convert.fetch_add(1, Ordering::SeqCst);
            if self.offline {
                return Err(fetch_error());
            }
            Ok(self
                .converts
                .get(title)
                .cloned()
                .unwrap_or_else(|| title.to_owned()))
        }
    }

    fn translator(graph: MockGraph) -> (Translator, Arc<Counters>) {
        let counters = graph.counters.clone();
        let translator = Translator::from_parts(
            Box::new(graph),
            CacheStore::in_memory("ja", "zh-tw"),
            "ja",
            "zh-tw",
            default_fallback_langs("ja", "zh-tw"),
        );
        (translator, counters)
    }

    fn request(name: &str, parents: &[&str]) -> TranslationRequest {
        TranslationRequest::from_values(
            AdminLevel::Admin1,
            name,
            "ja",
            "zh-tw",
            parents.iter().map(|p| p.to_string()).collect(),
            BTreeMap::new(),
        )
    }

    fn labels(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(lang, text)| (lang.to_string(), text.to_string()))
            .collect()
    }

    #[test]
    fn fallback_chain_deduplicates_in_order() {
        assert_eq!(
            default_fallback_langs("ja", "zh-tw"),
            vec!["zh-tw", "zh-hant", "zh", "en", "ja"]
        );
        // Source equal to a chain member collapses.
        assert_eq!(
            default_fallback_langs("en", "zh-tw"),
            vec!["zh-tw", "zh-hant", "zh", "en"]
        );
    }

    #[tokio::test]
    async fn resolves_a_name_through_the_graph() {
        let mut graph = MockGraph::default();
        graph
            .search_map
            .insert("東京都".to_owned(), vec![Qid::from(1490)]);
        graph
            .labels_map
            .insert(Qid::from(1490), labels(&[("zh-tw", "東京都"), ("en", "Tokyo")]));
        let (mut translator, _) = translator(graph);

        let result = translator
            .translate_one(AdminLevel::Admin1, "東京都", vec!["JP".to_owned()], None)
            .await
            .unwrap();

        assert_eq!(result.translated, "東京都");
        assert_eq!(result.qid, Some(Qid::from(1490)));
        assert_eq!(result.source, Source::Graph);
        assert_eq!(result.used_lang, "zh-tw");
        assert!(!result.parent_verified);
    }

    #[tokio::test]
    async fn same_name_under_different_parents_resolves_distinctly() {
        // Two wards named 中区 under different prefectures. The search is
        // ambiguous; hierarchy verification disambiguates.
        let osaka = Qid::from(1000);
        let kanagawa = Qid::from(2000);
        let ward_osaka = Qid::from(111);
        let ward_kanagawa = Qid::from(222);

        let mut graph = MockGraph::default();
        graph
            .search_map
            .insert("中区".to_owned(), vec![ward_osaka.clone(), ward_kanagawa.clone()]);
        graph
            .labels_map
            .insert(ward_osaka.clone(), labels(&[("zh-tw", "中區（大阪）")]));
        graph
            .labels_map
            .insert(ward_kanagawa.clone(), labels(&[("zh-tw", "中區（橫濱）")]));
        graph.located.insert((ward_osaka.as_u64(), osaka.as_u64()));
        graph
            .located
            .insert((ward_kanagawa.as_u64(), kanagawa.as_u64()));
        let (mut translator, _) = translator(graph);

        let first = request("中区", &["JP", "大阪府"]);
        let second = request("中区", &["JP", "神奈川県"]);
        assert_ne!(first.id(), second.id());

        let parents = HashMap::from([
            (first.id().to_owned(), osaka),
            (second.id().to_owned(), kanagawa),
        ]);
        let options = BatchOptions {
            parent_qids: Some(&parents),
            candidate_filter: None,
        };

        let results = translator
            .translate_batch(&[&first, &second], &options)
            .await
            .unwrap();

        let first_result = &results[first.id()];
        let second_result = &results[second.id()];
        assert_eq!(first_result.translated, "中區（大阪）");
        assert!(first_result.parent_verified);
        assert_eq!(second_result.translated, "中區（橫濱）");
        assert!(second_result.parent_verified);

        // Both outcomes are cached under their own context-aware ids.
        assert!(translator.cache().translation(first.id()).is_some());
        assert!(translator.cache().translation(second.id()).is_some());
    }

    #[tokio::test]
    async fn no_data_anywhere_returns_the_original_name() {
        // No candidates and title conversion only echoes the input.
        let (mut translator, _) = translator(MockGraph::default());

        let result = translator
            .translate_one(AdminLevel::Admin2, "架空村", vec![], None)
            .await
            .unwrap();

        assert_eq!(result.translated, "架空村");
        assert_eq!(result.qid, None);
        assert_eq!(result.source, Source::Original);
        assert_eq!(result.used_lang, "original");
    }

    #[tokio::test]
    async fn labels_are_fetched_in_chunks_of_fifty() {
        let mut graph = MockGraph::default();
        let mut requests = Vec::new();
        for i in 0..250u64 {
            let name = format!("町{i}");
            let qid = Qid::from(10_000 + i);
            graph.search_map.insert(name.clone(), vec![qid.clone()]);
            graph
                .labels_map
                .insert(qid, labels(&[("zh-tw", &format!("鎮{i}"))]));
            requests.push(request(&name, &["JP"]));
        }
        let (mut translator, counters) = translator(graph);

        let refs: Vec<&TranslationRequest> = requests.iter().collect();
        let results = translator
            .translate_batch(&refs, &BatchOptions::default())
            .await
            .unwrap();

        assert_eq!(results.len(), 250);
        assert_eq!(counters.search.load(Ordering::SeqCst), 250);
        // 250 distinct candidates at 50 per call.
        assert_eq!(counters.labels.load(Ordering::SeqCst), 5);
    }

    #[tokio::test]
    async fn hierarchy_verification_beats_relevance_order() {
        let ancestor = Qid::from(9000);
        let wrong = Qid::from(1);
        let right = Qid::from(2);

        let mut graph = MockGraph::default();
        graph
            .search_map
            .insert("北区".to_owned(), vec![wrong, right.clone()]);
        graph
            .labels_map
            .insert(right.clone(), labels(&[("zh-tw", "北區（正）")]));
        graph.located.insert((right.as_u64(), ancestor.as_u64()));
        let (mut translator, _) = translator(graph);

        let result = translator
            .translate_one(
                AdminLevel::Admin2,
                "北区",
                vec!["JP".to_owned()],
                Some(ancestor),
            )
            .await
            .unwrap();

        assert_eq!(result.qid, Some(right));
        assert_eq!(result.translated, "北區（正）");
        assert!(result.parent_verified);
    }

    #[tokio::test]
    async fn unverifiable_candidates_fall_back_to_most_relevant() {
        let ancestor = Qid::from(9000);
        let first = Qid::from(1);

        let mut graph = MockGraph::default();
        graph
            .search_map
            .insert("南区".to_owned(), vec![first.clone(), Qid::from(2)]);
        graph
            .labels_map
            .insert(first.clone(), labels(&[("zh-tw", "南區")]));
        let (mut translator, _) = translator(graph);

        let result = translator
            .translate_one(
                AdminLevel::Admin2,
                "南区",
                vec!["JP".to_owned()],
                Some(ancestor),
            )
            .await
            .unwrap();

        assert_eq!(result.qid, Some(first));
        assert!(!result.parent_verified);
    }

    #[tokio::test]
    async fn candidate_filter_drops_rejected_entities() {
        let city_type = Qid::from(515);
        let bad = Qid::from(100);
        let good = Qid::from(200);

        let mut graph = MockGraph::default();
        graph
            .search_map
            .insert("春日".to_owned(), vec![bad, good.clone()]);
        graph
            .labels_map
            .insert(good.clone(), labels(&[("zh-tw", "春日市")]));
        graph.types_map.insert(good.clone(), vec![city_type.clone()]);
        let (mut translator, _) = translator(graph);

        let req = request("春日", &["JP", "福岡県"]);
        let filter = |_name: &str, info: &CandidateInfo| info.instance_of.contains(&city_type);
        let options = BatchOptions {
            parent_qids: None,
            candidate_filter: Some(&filter),
        };

        let results = translator.translate_batch(&[&req], &options).await.unwrap();
        assert_eq!(results[req.id()].qid, Some(good));
    }

    #[tokio::test]
    async fn simplified_labels_are_script_normalized() {
        let qid = Qid::from(300);
        let mut graph = MockGraph::default();
        graph.search_map.insert("広島".to_owned(), vec![qid.clone()]);
        // Only a simplified-Chinese label exists.
        graph.labels_map.insert(qid, labels(&[("zh", "广岛")]));
        graph
            .converts
            .insert("广岛".to_owned(), "廣島".to_owned());
        let (mut translator, _) = translator(graph);

        let result = translator
            .translate_one(AdminLevel::Admin1, "広島", vec![], None)
            .await
            .unwrap();

        assert_eq!(result.translated, "廣島");
        assert_eq!(result.used_lang, "zh");
        assert_eq!(result.source, Source::Graph);
    }

    #[tokio::test]
    async fn chain_order_prefers_earlier_languages() {
        let qid = Qid::from(301);
        let mut graph = MockGraph::default();
        graph.search_map.insert("奈良".to_owned(), vec![qid.clone()]);
        graph
            .labels_map
            .insert(qid, labels(&[("en", "Nara"), ("zh-hant", "奈良")]));
        let (mut translator, _) = translator(graph);

        let result = translator
            .translate_one(AdminLevel::Admin1, "奈良", vec![], None)
            .await
            .unwrap();

        // zh-hant precedes en in the chain.
        assert_eq!(result.translated, "奈良");
        assert_eq!(result.used_lang, "zh-hant");
    }

    #[tokio::test]
    async fn zhwiki_sitelink_is_the_last_labeled_resort() {
        let qid = Qid::from(302);
        let mut graph = MockGraph::default();
        graph.search_map.insert("佐賀".to_owned(), vec![qid.clone()]);
        graph.labels_map.insert(qid.clone(), labels(&[("zhwiki", "佐贺县")]));
        graph
            .converts
            .insert("佐贺县".to_owned(), "佐賀縣".to_owned());
        let (mut translator, _) = translator(graph);

        let result = translator
            .translate_one(AdminLevel::Admin1, "佐賀", vec![], None)
            .await
            .unwrap();

        assert_eq!(result.translated, "佐賀縣");
        assert_eq!(result.used_lang, "zhwiki");
        assert_eq!(result.qid, Some(qid));
        assert_eq!(result.source, Source::Graph);
    }

    #[tokio::test]
    async fn entity_without_labels_uses_title_conversion() {
        let qid = Qid::from(303);
        let mut graph = MockGraph::default();
        graph.search_map.insert("小値賀町".to_owned(), vec![qid.clone()]);
        graph.labels_map.insert(qid.clone(), BTreeMap::new());
        graph
            .converts
            .insert("小値賀町".to_owned(), "小值賀町".to_owned());
        let (mut translator, _) = translator(graph);

        let result = translator
            .translate_one(AdminLevel::Admin3, "小値賀町", vec![], None)
            .await
            .unwrap();

        assert_eq!(result.translated, "小值賀町");
        assert_eq!(result.source, Source::FallbackTitle);
        // The entity attribution survives the fallback.
        assert_eq!(result.qid, Some(qid));
    }

    #[tokio::test]
    async fn cached_translations_short_circuit_the_graph() {
        let req = request("京都", &["JP"]);
        let mut cache = CacheStore::in_memory("ja", "zh-tw");
        cache.put_translation(
            req.id(),
            TranslationResult {
                translated: "京都".to_owned(),
                qid: Some(Qid::from(34600)),
                source: Source::Graph,
                used_lang: "zh-tw".to_owned(),
                parent_verified: false,
            },
        );

        let graph = MockGraph::default();
        let counters = graph.counters.clone();
        let mut translator = Translator::from_parts(
            Box::new(graph),
            cache,
            "ja",
            "zh-tw",
            default_fallback_langs("ja", "zh-tw"),
        );

        let results = translator
            .translate_batch(&[&req], &BatchOptions::default())
            .await
            .unwrap();

        assert_eq!(results[req.id()].translated, "京都");
        assert_eq!(counters.search.load(Ordering::SeqCst), 0);
        assert_eq!(counters.labels.load(Ordering::SeqCst), 0);
        assert_eq!(counters.convert.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn offline_runs_degrade_to_originals_without_failing() {
        let graph = MockGraph {
            offline: true,
            ..MockGraph::default()
        };
        let (mut translator, _) = translator(graph);

        let first = request("盛岡", &["JP"]);
        let second = request("青森", &["JP"]);
        let results = translator
            .translate_batch(&[&first, &second], &BatchOptions::default())
            .await
            .unwrap();

        for req in [&first, &second] {
            let result = &results[req.id()];
            assert_eq!(result.translated, req.original_name());
            assert_eq!(result.source, Source::Original);
        }
        // Failed searches are not cached as empty, so a later run retries.
        assert!(translator.cache().search_results(first.id()).is_none());
    }

    #[tokio::test]
    async fn dataset_translation_covers_every_request_and_reports_progress() {
        let mut graph = MockGraph::default();
        let mut set = RequestSet::new();
        for i in 0..5u64 {
            let name = format!("市{i}");
            let qid = Qid::from(500 + i);
            graph.search_map.insert(name.clone(), vec![qid.clone()]);
            graph
                .labels_map
                .insert(qid, labels(&[("zh-tw", &format!("市鎮{i}"))]));
            set.push(request(&name, &["JP"]), true);
        }
        let (mut translator, _) = translator(graph);

        let seen = std::sync::Mutex::new(Vec::new());
        let progress = |done: usize, total: usize| {
            seen.lock().unwrap().push((done, total));
        };
        let results = translator
            .translate_dataset(&set, 2, &BatchOptions::default(), Some(&progress))
            .await
            .unwrap();

        assert_eq!(results.len(), 5);
        assert_eq!(*seen.lock().unwrap(), vec![(2, 5), (4, 5), (5, 5)]);
        for request in &set {
            assert!(results.contains_key(request.id()));
        }
    }

    #[tokio::test]
    async fn second_run_is_served_entirely_from_cache() {
        let qid = Qid::from(600);
        let mut graph = MockGraph::default();
        graph.search_map.insert("熊本".to_owned(), vec![qid.clone()]);
        graph.labels_map.insert(qid, labels(&[("zh-tw", "熊本")]));
        let (mut translator, counters) = translator(graph);

        let first = translator
            .translate_one(AdminLevel::Admin1, "熊本", vec![], None)
            .await
            .unwrap();
        let searches_after_first = counters.search.load(Ordering::SeqCst);

        let second = translator
            .translate_one(AdminLevel::Admin1, "熊本", vec![], None)
            .await
            .unwrap();

        assert_eq!(first, second);
        assert_eq!(counters.search.load(Ordering::SeqCst), searches_after_first);
    }
}
