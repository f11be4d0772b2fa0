//! Translates administrative place names between languages using a public
//! knowledge graph, with durable local caching.
//!
//! The typical entry point is [`Translator`], fed from a [`RequestSet`]
//! built out of tabular records. See [`translate_names`] for a one-shot
//! convenience wrapper.

pub mod cache;
pub mod common;
pub mod dataset;
pub mod net;
pub mod wikidata;
pub mod zhwiki;

use std::collections::HashMap;

use thiserror::Error;

pub use cache::{CacheStore, FlushPolicy};
pub use common::{Source, TranslationResult};
pub use dataset::{AdminLevel, RequestSet, RequestSetBuilder, TranslationRequest};
pub use wikidata::qid::Qid;
pub use wikidata::{
    BatchOptions, CandidateInfo, Translator, TranslatorOptions,
};

#[derive(Error, Debug)]
pub enum Error {
    #[error("invalid input records")]
    Validation(#[from] dataset::ValidationError),
    #[error("cache store error")]
    Cache(#[from] cache::CacheError),
    #[error("remote fetch error")]
    Fetch(#[from] net::FetchError),
}

/// Translates a flat list of names at one administrative level.
///
/// Builds an in-memory translator for the language pair, so nothing is
/// persisted between calls. Long-running pipelines should construct a
/// [`Translator`] with a cache path instead.
pub async fn translate_names<T>(
    names: &[T],
    level: AdminLevel,
    source_lang: &str,
    target_lang: &str,
) -> Result<HashMap<String, TranslationResult>, Error>
where
    T: AsRef<str>,
{
    let mut set = RequestSet::new();
    for name in names {
        set.push(
            TranslationRequest::from_values(
                level,
                name.as_ref(),
                source_lang,
                target_lang,
                Vec::new(),
                Default::default(),
            ),
            true,
        );
    }

    let mut translator = Translator::new(source_lang, target_lang, TranslatorOptions::default())?;
    let by_id = translator
        .translate_dataset(&set, 50, &BatchOptions::default(), None)
        .await?;

    // Callers pass names, so key the output by name rather than request id.
    let mut by_name = HashMap::with_capacity(by_id.len());
    for request in &set {
        if let Some(result) = by_id.get(request.id()) {
            by_name.insert(request.original_name().to_owned(), result.clone());
        }
    }
    Ok(by_name)
}
