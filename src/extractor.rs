//! Media URL extraction from post HTML.
//!
//! The page layout is an unstable external format, so every step is a
//! heuristic that may miss. Strategies run in a fixed priority order and the
//! first non-empty hit wins; none of them can fail the whole extraction.

use once_cell::sync::Lazy;
use regex::Regex;
use scraper::{Html, Selector};
use serde::Serialize;
use serde_json::Value;

// ── Selectors ────────────────────────────────────────────────────────────────

static OG_VIDEO_SEL: Lazy<Selector> = Lazy::new(|| {
    Selector::parse(r#"meta[property="og:video"], meta[name="og:video"]"#).unwrap()
});

static OG_VIDEO_SECURE_SEL: Lazy<Selector> =
    Lazy::new(|| Selector::parse(r#"meta[property="og:video:secure_url"]"#).unwrap());

static TWITTER_STREAM_SEL: Lazy<Selector> =
    Lazy::new(|| Selector::parse(r#"meta[name="twitter:player:stream"]"#).unwrap());

static VIDEO_SEL: Lazy<Selector> = Lazy::new(|| Selector::parse("video").unwrap());

static JSON_LD_SEL: Lazy<Selector> =
    Lazy::new(|| Selector::parse(r#"script[type="application/ld+json"]"#).unwrap());

static SCRIPT_SEL: Lazy<Selector> = Lazy::new(|| Selector::parse("script").unwrap());

// ── Inline script patterns ───────────────────────────────────────────────────

static INLINE_URL_RES: Lazy<[Regex; 5]> = Lazy::new(|| {
    [
        Regex::new(r#""video_versions"\s*:\s*\[\s*\{[^}]*"url"\s*:\s*"([^"]+)""#).unwrap(),
        Regex::new(r#""playable_url_quality_hd"\s*:\s*"([^"]+)""#).unwrap(),
        Regex::new(r#""playable_url"\s*:\s*"([^"]+)""#).unwrap(),
        Regex::new(r#""video_url"\s*:\s*"([^"]+)""#).unwrap(),
        Regex::new(r#""contentUrl"\s*:\s*"([^"]+)""#).unwrap(),
    ]
});

static DASH_MANIFEST_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#""dash_manifest"\s*:\s*"([^"]+)""#).unwrap());

static DASH_MP4_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)BaseURL>([^<]+\.mp4[^<]*)<").unwrap());

static MEDIA_SCRIPT_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"video_versions|playable_url|video_url|dash_manifest").unwrap());

const SAMPLE_MAX_CHARS: usize = 1000;

// ── Public API ───────────────────────────────────────────────────────────────

pub fn extract_media_url(html: &str) -> Option<String> {
    let document = Html::parse_document(html);
    extract_from_document(&document, html)
}

fn extract_from_document(document: &Html, html: &str) -> Option<String> {
    meta_content(document, &OG_VIDEO_SEL)
        .or_else(|| meta_content(document, &OG_VIDEO_SECURE_SEL))
        .or_else(|| meta_content(document, &TWITTER_STREAM_SEL))
        .or_else(|| first_video_src(document))
        .or_else(|| json_ld_content_url(document))
        .or_else(|| inline_script_url(html))
        .or_else(|| dash_manifest_mp4(html))
}

/// Meta tag values as seen by the first three strategies.
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MetaSnapshot {
    pub og_video: Option<String>,
    pub og_video_secure: Option<String>,
    pub twitter_stream: Option<String>,
}

/// Raw findings for one page, for human inspection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HtmlProbe {
    pub metas: MetaSnapshot,
    pub json_ld_first: Option<String>,
    pub script_match_sample: Option<String>,
    pub video_url: Option<String>,
}

pub fn probe_html(html: &str) -> HtmlProbe {
    let document = Html::parse_document(html);

    let metas = MetaSnapshot {
        og_video: meta_content(&document, &OG_VIDEO_SEL),
        og_video_secure: meta_content(&document, &OG_VIDEO_SECURE_SEL),
        twitter_stream: meta_content(&document, &TWITTER_STREAM_SEL),
    };

    let json_ld_first = document
        .select(&JSON_LD_SEL)
        .map(|node| node.text().collect::<String>().trim().to_string())
        .find(|text| !text.is_empty())
        .map(|text| truncate_sample(&text));

    let script_match_sample = document
        .select(&SCRIPT_SEL)
        .map(|node| node.text().collect::<String>().trim().to_string())
        .find(|text| !text.is_empty() && MEDIA_SCRIPT_RE.is_match(text))
        .map(|text| truncate_sample(&text));

    HtmlProbe {
        metas,
        json_ld_first,
        script_match_sample,
        video_url: extract_from_document(&document, html),
    }
}

// ── Strategies ───────────────────────────────────────────────────────────────

/// Content of the first element matching `selector`; only that element is
/// consulted, an empty value means the strategy missed.
fn meta_content(document: &Html, selector: &Selector) -> Option<String> {
    document
        .select(selector)
        .next()
        .and_then(|node| node.value().attr("content"))
        .and_then(non_blank)
}

fn first_video_src(document: &Html) -> Option<String> {
    document
        .select(&VIDEO_SEL)
        .next()
        .and_then(|node| node.value().attr("src"))
        .and_then(non_blank)
}

fn json_ld_content_url(document: &Html) -> Option<String> {
    document.select(&JSON_LD_SEL).find_map(|node| {
        let text = node.text().collect::<String>();
        // Malformed blocks are common; skip them and keep looking.
        let data: Value = serde_json::from_str(text.trim()).ok()?;
        match &data {
            Value::Array(items) => items.iter().find_map(json_ld_item_url),
            item => json_ld_item_url(item),
        }
    })
}

fn json_ld_item_url(item: &Value) -> Option<String> {
    let object = item.as_object()?;
    if let Some(url) = object.get("contentUrl").and_then(Value::as_str).and_then(non_blank) {
        return Some(url);
    }

    match object.get("video")? {
        Value::Array(videos) => videos
            .iter()
            .find_map(|video| video.get("contentUrl")?.as_str().and_then(non_blank)),
        video => video.get("contentUrl")?.as_str().and_then(non_blank),
    }
}

fn inline_script_url(html: &str) -> Option<String> {
    INLINE_URL_RES.iter().find_map(|pattern| {
        let raw = pattern.captures(html)?.get(1)?.as_str();
        Some(unescape_json_string(raw).unwrap_or_else(|| raw.to_string()))
    })
}

fn dash_manifest_mp4(html: &str) -> Option<String> {
    let raw = DASH_MANIFEST_RE.captures(html)?.get(1)?.as_str();
    let manifest = unescape_json_string(raw)?;
    let url = DASH_MP4_RE.captures(&manifest)?.get(1)?.as_str();
    Some(url.to_string())
}

// ── Helpers ──────────────────────────────────────────────────────────────────

/// Decodes a JSON string body captured without its quotes (`\/`, `\u0026`).
fn unescape_json_string(raw: &str) -> Option<String> {
    serde_json::from_str::<String>(&format!("\"{raw}\"")).ok()
}

fn non_blank(value: &str) -> Option<String> {
    if value.is_empty() {
        None
    } else {
        Some(value.to_string())
    }
}

fn truncate_sample(text: &str) -> String {
    match text.char_indices().nth(SAMPLE_MAX_CHARS) {
        Some((cut, _)) => format!("{}...", &text[..cut]),
        None => text.to_string(),
    }
}
