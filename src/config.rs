use std::path::PathBuf;

use tokio::time::Duration;
use tracing::warn;

use crate::ytdlp::DeliveryStrategy;

const DEFAULT_BIND_ADDR: &str = "0.0.0.0:3000";
const DEFAULT_PUBLIC_DIR: &str = "public";
const DEFAULT_YT_DLP_BIN: &str = "yt-dlp";
const DEFAULT_YT_DLP_TIMEOUT_SECONDS: u64 = 600;
const DEFAULT_YT_DLP_META_TIMEOUT_SECONDS: u64 = 30;

#[derive(Debug, Clone)]
pub struct Config {
    pub bind_addr: String,
    pub public_dir: PathBuf,
    pub temp_dir: PathBuf,
    pub yt_dlp_bin: String,
    pub yt_dlp_timeout: Duration,
    pub yt_dlp_meta_timeout: Duration,
    pub strategy: DeliveryStrategy,
    pub allowed_origins: Vec<String>,
}

impl Config {
    pub fn from_env() -> Self {
        let strategy = match read_string_env("YT_DLP_STRATEGY") {
            Some(value) => DeliveryStrategy::parse(&value).unwrap_or_else(|| {
                warn!("YT_DLP_STRATEGY={value:?} is not staged|direct, using staged");
                DeliveryStrategy::Staged
            }),
            None => DeliveryStrategy::Staged,
        };

        Self {
            bind_addr: resolve_bind_addr(),
            public_dir: read_string_env("PUBLIC_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from(DEFAULT_PUBLIC_DIR)),
            temp_dir: read_string_env("DOWNLOAD_TEMP_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(std::env::temp_dir),
            yt_dlp_bin: read_string_env("YT_DLP_BIN")
                .unwrap_or_else(|| DEFAULT_YT_DLP_BIN.to_string()),
            yt_dlp_timeout: Duration::from_secs(
                read_u64_env("YT_DLP_TIMEOUT_SECONDS")
                    .filter(|value| *value > 0)
                    .unwrap_or(DEFAULT_YT_DLP_TIMEOUT_SECONDS),
            ),
            yt_dlp_meta_timeout: Duration::from_secs(
                read_u64_env("YT_DLP_META_TIMEOUT_SECONDS")
                    .filter(|value| *value > 0)
                    .unwrap_or(DEFAULT_YT_DLP_META_TIMEOUT_SECONDS),
            ),
            strategy,
            allowed_origins: read_string_env("ALLOWED_ORIGINS")
                .map(|value| parse_origin_list(&value))
                .unwrap_or_default(),
        }
    }
}

fn read_string_env(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .and_then(|value| non_empty(&value).map(ToString::to_string))
}

fn read_u64_env(name: &str) -> Option<u64> {
    std::env::var(name)
        .ok()
        .and_then(|value| value.trim().parse::<u64>().ok())
}

fn resolve_bind_addr() -> String {
    if let Some(configured) = read_string_env("APP_ADDR") {
        return configured;
    }

    if let Some(port) = std::env::var("PORT")
        .ok()
        .and_then(|value| value.trim().parse::<u16>().ok())
    {
        return format!("0.0.0.0:{port}");
    }

    DEFAULT_BIND_ADDR.to_string()
}

fn parse_origin_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|origin| !origin.is_empty())
        .map(ToString::to_string)
        .collect()
}

pub fn non_empty(value: &str) -> Option<&str> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn origin_list_skips_blanks() {
        assert_eq!(
            parse_origin_list(" https://a.com , ,http://b.dev:8080"),
            vec!["https://a.com".to_string(), "http://b.dev:8080".to_string()]
        );
    }

    #[test]
    fn non_empty_trims() {
        assert_eq!(non_empty("  x "), Some("x"));
        assert_eq!(non_empty("   "), None);
    }
}
