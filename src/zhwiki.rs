//! Handles interactions with the Chinese Wikipedia query API for title
//! conversion.
//!
//! Note: this is the secondary endpoint of the pipeline. It only offers
//! best-effort script normalization (simplified → traditional variants) via
//! the `converttitles` action, not entity data; the primary knowledge-graph
//! lookups live in the `wikidata` module. Conversion failures degrade to the
//! input title and are never fatal.

use std::time::Duration;

use anyhow::{Context, Result};
use serde_json::Value;

use crate::net::{self, FetchError, Throttle};

/// Endpoint of the Chinese Wikipedia MediaWiki API.
static ZHWIKI_URL: &str = "https://zh.wikipedia.org/w/api.php";

/// Minimum interval between calls to the zh.wikipedia endpoint.
pub const ZHWIKI_THROTTLE: Duration = Duration::from_millis(200);

/// Converts a title through the `converttitles` API.
///
/// Returns the converted title, or the input title unchanged when the wiki
/// has no conversion for it (the API echoes unconvertible titles).
///
/// # Arguments
///
/// * `client`: The shared `reqwest::Client`.
/// * `throttle`: Throttle state for the zh.wikipedia endpoint.
/// * `title`: The title to convert.
pub async fn convert_title(
    client: &reqwest::Client,
    throttle: &mut Throttle,
    title: &str,
) -> Result<String, FetchError> {
    let json = net::request_json(
        client,
        throttle,
        ZHWIKI_URL,
        &[
            ("action", "query"),
            ("format", "json"),
            ("converttitles", "1"),
            ("titles", title),
        ],
    )
    .await?;

    Ok(parse_converted_title(&json, title))
}

/// Extracts the converted title from a `converttitles` response.
///
/// Falls back to the original title when the response carries no usable
/// conversion; a malformed response is logged, not raised.
pub fn parse_converted_title(json: &Value, original: &str) -> String {
    match extract_title(json) {
        Ok(title) => title,
        Err(err) => {
            log::debug!("title conversion response unusable for {original:?}: {err:#}");
            original.to_owned()
        }
    }
}

/// Pulls the first converted or resolved title out of the response body.
fn extract_title(json: &Value) -> Result<String> {
    let query = json.get("query").context("response has no query object")?;

    // Preferred: the explicit conversion list.
    if let Some(converted) = query
        .get("converted")
        .and_then(Value::as_array)
        .and_then(|list| list.first())
    {
        let to = converted
            .get("to")
            .and_then(Value::as_str)
            .context("converted entry has no 'to' title")?;
        return Ok(to.to_owned());
    }

    // Fallback: the title of the first resolved page.
    let pages = query
        .get("pages")
        .and_then(Value::as_object)
        .context("response has no pages object")?;
    let page = pages.values().next().context("pages object is empty")?;
    let title = page
        .get("title")
        .and_then(Value::as_str)
        .context("page entry has no title")?;
    Ok(title.to_owned())
}
