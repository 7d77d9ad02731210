use url::Url;

use crate::error::AppError;

const EMBED_SUFFIX: &str = "embed/captioned/";
const LOCALE_SUFFIX: &str = "?hl=en";
const NON_SHORTCODE_SEGMENTS: [&str; 3] = ["p", "reel", "tv"];
const VIDEO_HOST_DOMAINS: [&str; 2] = ["youtube.com", "youtu.be"];

/// A post URL reduced to `origin + path/`, without query or fragment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PostUrl(String);

impl PostUrl {
    pub fn parse(input: &str) -> Result<Self, AppError> {
        normalize_post_url(input).map(Self)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Probe order: plain page, embed view, locale-qualified page.
    pub fn candidates(&self) -> [String; 3] {
        [
            self.0.clone(),
            format!("{}{EMBED_SUFFIX}", self.0),
            format!("{}{LOCALE_SUFFIX}", self.0),
        ]
    }

    pub fn download_stem(&self) -> String {
        Url::parse(&self.0)
            .ok()
            .and_then(|parsed| {
                parsed
                    .path_segments()?
                    .filter(|segment| !segment.is_empty())
                    .find(|segment| !NON_SHORTCODE_SEGMENTS.contains(segment))
                    .map(|shortcode| format!("instagram_{shortcode}"))
            })
            .unwrap_or_else(|| "instagram_video".to_string())
    }
}

pub fn normalize_post_url(input: &str) -> Result<String, AppError> {
    let parsed = Url::parse(input.trim())
        .map_err(|error| AppError::InvalidInput(format!("{input:?} is not a valid URL: {error}")))?;

    if !matches!(parsed.scheme(), "http" | "https") || parsed.host_str().is_none() {
        return Err(AppError::InvalidInput(format!(
            "{input:?} is not an http(s) URL"
        )));
    }

    let origin = parsed.origin().ascii_serialization();
    let path = parsed.path();
    if path.ends_with('/') {
        Ok(format!("{origin}{path}"))
    } else {
        Ok(format!("{origin}{path}/"))
    }
}

/// True for hosts that belong to the yt-dlp path.
pub fn is_video_host(input: &str) -> bool {
    let Some(host) = Url::parse(input.trim())
        .ok()
        .and_then(|parsed| parsed.host_str().map(str::to_ascii_lowercase))
    else {
        return false;
    };

    VIDEO_HOST_DOMAINS
        .iter()
        .any(|domain| host == *domain || host.ends_with(&format!(".{domain}")))
}
