//! HTTP client for the Wikidata APIs: entity search, batched entity fetch,
//! and hierarchy verification through the SPARQL endpoint.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use nohash_hasher::IntMap;
use serde_json::Value;

use super::qid::Qid;
use crate::net::{self, FetchError, Throttle};
use crate::zhwiki;

/// Endpoint of the Wikidata action API.
static WD_API_URL: &str = "https://www.wikidata.org/w/api.php";

/// Endpoint of the Wikidata Query Service (SPARQL).
static WDQS_URL: &str = "https://query.wikidata.org/sparql";

/// Identifies this crate to the Wikimedia services, per their API etiquette.
static USER_AGENT: &str = concat!(
    "wikigeo/",
    env!("CARGO_PKG_VERSION"),
    " (offline geocoding dataset builder)"
);

/// Maximum number of entity ids per `wbgetentities` call.
pub const ENTITY_CHUNK_SIZE: usize = 50;

/// Maximum number of search hits requested per name.
const SEARCH_LIMIT: u32 = 7;

/// Minimum interval between SPARQL queries. The query service is the most
/// heavily loaded of the three endpoints and rate limits aggressively.
const WDQS_THROTTLE: Duration = Duration::from_millis(800);

/// Minimum interval between action API calls.
const API_THROTTLE: Duration = Duration::from_millis(200);

/// Pseudo-language under which the Chinese Wikipedia sitelink title is
/// reported alongside ordinary labels.
pub static ZHWIKI_LANG: &str = "zhwiki";

/// Read access to the knowledge graph.
///
/// The translation engine is written against this trait so that tests can
/// substitute a scripted graph for the live one.
#[async_trait]
pub trait KnowledgeGraph: Send {
    /// Searches entities by name in the source language.
    ///
    /// Returns candidate ids in the service's relevance order.
    async fn search(&mut self, name: &str) -> Result<Vec<Qid>, FetchError>;

    /// Fetches labels (and the zhwiki sitelink title, under [`ZHWIKI_LANG`])
    /// for up to [`ENTITY_CHUNK_SIZE`] entities.
    async fn batch_labels(
        &mut self,
        ids: &[Qid],
    ) -> Result<IntMap<Qid, BTreeMap<String, String>>, FetchError>;

    /// Fetches the `instance of` (P31) type ids for up to
    /// [`ENTITY_CHUNK_SIZE`] entities.
    async fn batch_types(&mut self, ids: &[Qid]) -> Result<IntMap<Qid, Vec<Qid>>, FetchError>;

    /// Checks whether `candidate` lies (transitively) within `ancestor`
    /// along the `located in the administrative territorial entity` (P131)
    /// chain.
    async fn is_located_in(&mut self, candidate: &Qid, ancestor: &Qid)
        -> Result<bool, FetchError>;

    /// Normalizes a title through the secondary wiki endpoint. Returns the
    /// input unchanged when no conversion exists.
    async fn convert_title(&mut self, title: &str) -> Result<String, FetchError>;
}

/// The live client. One instance keeps independent throttle state for each
/// of the three endpoints it talks to.
pub struct WikidataClient {
    client: reqwest::Client,
    source_lang: String,
    /// Pipe-joined language list sent with label queries.
    label_langs: String,
    wdqs_throttle: Throttle,
    api_throttle: Throttle,
    zhwiki_throttle: Throttle,
}

impl WikidataClient {
    /// Creates a client that searches in `source_lang` and fetches labels
    /// for every language in `label_langs`.
    pub fn new(source_lang: &str, label_langs: &[String]) -> Self {
        let client = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .build()
            .unwrap_or_else(|err| {
                log::warn!("falling back to a default http client: {err}");
                reqwest::Client::new()
            });

        let mut langs: Vec<&str> = Vec::new();
        for lang in label_langs {
            if lang != ZHWIKI_LANG && !langs.contains(&lang.as_str()) {
                langs.push(lang.as_str());
            }
        }

        Self {
            client,
            source_lang: source_lang.to_owned(),
            label_langs: langs.join("|"),
            wdqs_throttle: Throttle::new(WDQS_THROTTLE),
            api_throttle: Throttle::new(API_THROTTLE),
            zhwiki_throttle: Throttle::new(zhwiki::ZHWIKI_THROTTLE),
        }
    }
}

#[async_trait]
impl KnowledgeGraph for WikidataClient {
    async fn search(&mut self, name: &str) -> Result<Vec<Qid>, FetchError> {
        let limit = SEARCH_LIMIT.to_string();
        let json = net::request_json(
            &self.client,
            &mut self.api_throttle,
            WD_API_URL,
            &[
                ("action", "wbsearchentities"),
                ("format", "json"),
                ("search", name),
                ("language", &self.source_lang),
                ("uselang", &self.source_lang),
                ("type", "item"),
                ("limit", &limit),
            ],
        )
        .await?;

        Ok(parse_search(&json))
    }

    async fn batch_labels(
        &mut self,
        ids: &[Qid],
    ) -> Result<IntMap<Qid, BTreeMap<String, String>>, FetchError> {
        if ids.is_empty() {
            return Ok(IntMap::default());
        }
        let ids_param = join_ids(ids);
        let json = net::request_json(
            &self.client,
            &mut self.api_throttle,
            WD_API_URL,
            &[
                ("action", "wbgetentities"),
                ("format", "json"),
                ("ids", &ids_param),
                ("props", "labels|sitelinks"),
                ("languages", &self.label_langs),
            ],
        )
        .await?;

        Ok(parse_labels(&json))
    }

    async fn batch_types(&mut self, ids: &[Qid]) -> Result<IntMap<Qid, Vec<Qid>>, FetchError> {
        if ids.is_empty() {
            return Ok(IntMap::default());
        }
        let ids_param = join_ids(ids);
        let json = net::request_json(
            &self.client,
            &mut self.api_throttle,
            WD_API_URL,
            &[
                ("action", "wbgetentities"),
                ("format", "json"),
                ("ids", &ids_param),
                ("props", "claims"),
            ],
        )
        .await?;

        Ok(parse_types(&json))
    }

    async fn is_located_in(
        &mut self,
        candidate: &Qid,
        ancestor: &Qid,
    ) -> Result<bool, FetchError> {
        let query = format!("ASK {{ wd:{candidate} (wdt:P131)+ wd:{ancestor} . }}");
        let json = net::request_json(
            &self.client,
            &mut self.wdqs_throttle,
            WDQS_URL,
            &[("query", &query), ("format", "json")],
        )
        .await?;

        Ok(parse_ask(&json))
    }

    async fn convert_title(&mut self, title: &str) -> Result<String, FetchError> {
        zhwiki::convert_title(&self.client, &mut self.zhwiki_throttle, title).await
    }
}

fn join_ids(ids: &[Qid]) -> String {
    ids.iter()
        .map(|qid| qid.to_string())
        .collect::<Vec<_>>()
        .join("|")
}

/// Extracts candidate ids from a `wbsearchentities` response, preserving the
/// service's relevance order. Entries without a parseable id are skipped.
fn parse_search(json: &Value) -> Vec<Qid> {
    json.get("search")
        .and_then(Value::as_array)
        .map(|hits| {
            hits.iter()
                .filter_map(|hit| hit.get("id").and_then(Value::as_str))
                .filter_map(|id| Qid::try_from(id).ok())
                .collect()
        })
        .unwrap_or_default()
}

/// Extracts per-entity label maps from a `wbgetentities` response. The
/// zhwiki sitelink title is folded in under [`ZHWIKI_LANG`].
fn parse_labels(json: &Value) -> IntMap<Qid, BTreeMap<String, String>> {
    let mut result: IntMap<Qid, BTreeMap<String, String>> = IntMap::default();
    let Some(entities) = json.get("entities").and_then(Value::as_object) else {
        return result;
    };

    for (id, entity) in entities {
        let Ok(qid) = Qid::try_from(id.as_str()) else {
            continue;
        };

        let mut labels = BTreeMap::new();
        if let Some(label_obj) = entity.get("labels").and_then(Value::as_object) {
            for (lang, label) in label_obj {
                if let Some(text) = label.get("value").and_then(Value::as_str) {
                    labels.insert(lang.clone(), text.to_owned());
                }
            }
        }
        if let Some(title) = entity
            .pointer("/sitelinks/zhwiki/title")
            .and_then(Value::as_str)
        {
            labels.insert(ZHWIKI_LANG.to_owned(), title.to_owned());
        }

        result.insert(qid, labels);
    }
    result
}

/// Extracts P31 type ids per entity from a `wbgetentities` claims response.
fn parse_types(json: &Value) -> IntMap<Qid, Vec<Qid>> {
    let mut result: IntMap<Qid, Vec<Qid>> = IntMap::default();
    let Some(entities) = json.get("entities").and_then(Value::as_object) else {
        return result;
    };

    for (id, entity) in entities {
        let Ok(qid) = Qid::try_from(id.as_str()) else {
            continue;
        };

        let types = entity
            .pointer("/claims/P31")
            .and_then(Value::as_array)
            .map(|claims| {
                claims
                    .iter()
                    .filter_map(|claim| {
                        claim
                            .pointer("/mainsnak/datavalue/value/id")
                            .and_then(Value::as_str)
                    })
                    .filter_map(|id| Qid::try_from(id).ok())
                    .collect()
            })
            .unwrap_or_default();

        result.insert(qid, types);
    }
    result
}

/// Reads the boolean out of a SPARQL ASK response. Anything malformed reads
/// as false, which downgrades the candidate rather than failing the batch.
fn parse_ask(json: &Value) -> bool {
    json.get("boolean").and_then(Value::as_bool).unwrap_or(false)
}
