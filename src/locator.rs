use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, info};

use crate::{
    error::AppError,
    extractor::{MetaSnapshot, extract_media_url, probe_html},
    fetcher::HtmlSource,
    post_url::PostUrl,
};

/// One probed candidate page in a `/debug` report.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DebugEntry {
    pub url: String,
    pub metas: MetaSnapshot,
    pub json_ld_first: Option<String>,
    pub script_match_sample: Option<String>,
    pub video_url: Option<String>,
}

#[derive(Clone)]
pub struct MediaLocator {
    source: Arc<dyn HtmlSource>,
}

impl MediaLocator {
    pub fn new(source: Arc<dyn HtmlSource>) -> Self {
        Self { source }
    }

    /// Walks the candidate pages in order. A fetch failure aborts the walk;
    /// a page without media just moves on to the next candidate.
    pub async fn locate(&self, post: &PostUrl) -> Result<Option<String>, AppError> {
        for candidate in post.candidates() {
            let html = self.source.fetch_html(&candidate).await?;
            if let Some(media_url) = extract_media_url(&html) {
                info!("media url found via {candidate}");
                return Ok(Some(media_url));
            }
            debug!("no media url in {candidate}");
        }

        Ok(None)
    }

    pub async fn probe(&self, post: &PostUrl) -> Result<Vec<DebugEntry>, AppError> {
        let mut report = Vec::new();
        for candidate in post.candidates() {
            let html = self.source.fetch_html(&candidate).await?;
            let probe = probe_html(&html);
            let found = probe.video_url.is_some();

            report.push(DebugEntry {
                url: candidate,
                metas: probe.metas,
                json_ld_first: probe.json_ld_first,
                script_match_sample: probe.script_match_sample,
                video_url: probe.video_url,
            });

            if found {
                break;
            }
        }

        Ok(report)
    }
}
