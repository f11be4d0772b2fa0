//! Small shared types and script helpers used across the crate.

use serde::{Deserialize, Serialize};

use crate::wikidata::qid::Qid;

/// Where a translation ultimately came from.
///
/// Serialized into the cache file, so the wire names are part of the
/// on-disk format and must stay stable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Source {
    /// A label taken directly from the knowledge graph.
    #[serde(rename = "graph")]
    Graph,
    /// The secondary wiki endpoint converted the original title.
    #[serde(rename = "fallback-title")]
    FallbackTitle,
    /// No usable data anywhere; the original input name was returned.
    #[serde(rename = "original")]
    Original,
}

/// The outcome of translating one request.
///
/// Computed once per request id and then cached indefinitely; there is no
/// TTL. Entries disappear only when the cache file is removed or its schema
/// version changes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TranslationResult {
    /// The translated text, or the original name when nothing better exists.
    pub translated: String,
    /// The knowledge-graph entity the translation came from, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub qid: Option<Qid>,
    /// Where the translation came from.
    pub source: Source,
    /// The language (or pseudo-language) whose label was used.
    pub used_lang: String,
    /// Whether the selected entity passed hierarchy verification against the
    /// supplied ancestor.
    pub parent_verified: bool,
}

/// Language tags whose labels are written in simplified Chinese and need
/// script normalization before being returned.
static SIMPLIFIED_TAGS: &[&str] = &["zh", "zh-cn", "zh-hans", "zh-sg", "zh-my"];

lazy_static::lazy_static! {
    /// Matches text containing at least one Han character.
    static ref HAN_ANY_REGEX: regex::Regex =
        regex::Regex::new(r"\p{Han}").expect("HAN_ANY_REGEX failed to compile");
}

/// Returns true if `text` contains any Han character.
pub fn contains_han(text: &str) -> bool {
    HAN_ANY_REGEX.is_match(text)
}

/// Returns true if `lang` is a simplified-Chinese language tag.
pub fn is_simplified_tag(lang: &str) -> bool {
    SIMPLIFIED_TAGS
        .iter()
        .any(|tag| tag.eq_ignore_ascii_case(lang))
}
