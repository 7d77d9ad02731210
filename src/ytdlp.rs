//! yt-dlp orchestration for the video-hosting path.
//!
//! Integration contract with the tool: every download invocation passes
//! `--print after_move:filepath --print filepath`, so on success the last
//! non-empty stdout line is the final file path. Anything else on stdout is
//! ignored. When that line is missing or stale, the temp directory is scanned
//! for files sharing the job's temp-base prefix.
//!
//! Two delivery strategies exist. `Staged` downloads into the temp directory
//! (tier A merges best video+audio with ffmpeg, tier B falls back to a single
//! progressive stream) and streams the file afterwards. `Direct` pipes the
//! tool's stdout straight into the response: no temp files and no wait for
//! the download to finish, but a pipe cannot be seeked back for muxing, so
//! only progressive formats are possible and a failing tool shows up as a
//! truncated body rather than an error status. The run timeout still applies
//! there: the body errors out when it expires and the child is killed.

use std::{
    io::{self, ErrorKind},
    path::{Path, PathBuf},
    pin::Pin,
    process::{Output, Stdio},
    task::{Context, Poll},
};

use axum::body::Body;
use chrono::Utc;
use futures::Stream;
use tokio::{
    io::{AsyncBufReadExt, BufReader},
    process::{Child, Command},
    time::{Duration, Sleep, timeout},
};
use tokio_util::io::ReaderStream;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::{error::AppError, filename::sanitize_filename};

const COMMON_ARGS: [&str; 5] = [
    "--force-ipv4",
    "--geo-bypass",
    "--no-check-certificates",
    "--extractor-args",
    "youtube:player_client=android,player_skip=webpage",
];
const MERGED_SELECTOR: &str = "bv*+ba/best";
const PROGRESSIVE_SELECTOR: &str = "best[ext=mp4][acodec!=none]/best[acodec!=none]/best";
const TOOL_USER_AGENT: &str = "Mozilla/5.0";
const META_TEMPLATE: &str = "%(id)s\t%(title)s";
const DEFAULT_TITLE: &str = "youtube_video";
const PARTIAL_SUFFIX: &str = ".part";
const OUTPUT_EXTENSION: &str = "mp4";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryStrategy {
    Staged,
    Direct,
}

impl DeliveryStrategy {
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "staged" | "temp-file" | "file" => Some(Self::Staged),
            "direct" | "stream" | "pipe" => Some(Self::Direct),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FormatTier {
    /// Best separate video and audio, merged into mp4 by ffmpeg.
    Merged,
    /// A single pre-muxed stream; needs no ffmpeg.
    Progressive,
}

impl FormatTier {
    fn args(self, temp_base: &Path) -> Vec<String> {
        let mut args = vec![
            "-f".to_string(),
            match self {
                Self::Merged => MERGED_SELECTOR,
                Self::Progressive => PROGRESSIVE_SELECTOR,
            }
            .to_string(),
            "--no-playlist".to_string(),
        ];
        if self == Self::Merged {
            args.push("--merge-output-format".to_string());
            args.push(OUTPUT_EXTENSION.to_string());
        }
        args.extend(
            [
                "--restrict-filenames".to_string(),
                "-o".to_string(),
                format!("{}.%(ext)s", temp_base.to_string_lossy()),
                "--user-agent".to_string(),
                TOOL_USER_AGENT.to_string(),
                "--print".to_string(),
                "after_move:filepath".to_string(),
                "--print".to_string(),
                "filepath".to_string(),
            ],
        );
        args
    }
}

/// One way of starting the tool, e.g. the native binary or `python3 -m yt_dlp`.
#[derive(Debug, Clone)]
pub struct ToolInvocation {
    pub program: String,
    pub leading_args: Vec<String>,
}

impl ToolInvocation {
    pub fn binary(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            leading_args: Vec::new(),
        }
    }

    pub fn python_module() -> Self {
        Self {
            program: "python3".to_string(),
            leading_args: vec!["-m".to_string(), "yt_dlp".to_string()],
        }
    }

    fn command(&self, args: &[String]) -> Command {
        let mut command = Command::new(&self.program);
        command
            .args(&self.leading_args)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        command
    }
}

#[derive(Debug, Clone)]
pub struct YtDlpSettings {
    pub invocations: Vec<ToolInvocation>,
    pub temp_dir: PathBuf,
    pub run_timeout: Duration,
    pub meta_timeout: Duration,
    pub strategy: DeliveryStrategy,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VideoMeta {
    pub id: String,
    pub title: String,
}

/// State of one staged download request.
#[derive(Debug)]
pub struct DownloadJob {
    pub target_url: String,
    pub temp_base: PathBuf,
    pub tier: Option<FormatTier>,
    pub printed_path: Option<String>,
    pub diagnostics: String,
}

impl DownloadJob {
    fn new(target_url: &str, temp_base: PathBuf) -> Self {
        Self {
            target_url: target_url.to_string(),
            temp_base,
            tier: None,
            printed_path: None,
            diagnostics: String::new(),
        }
    }
}

/// A finished download waiting in the temp directory.
#[derive(Debug)]
pub struct StagedFile {
    pub path: PathBuf,
    pub title: String,
    pub len: u64,
    artifacts: TempArtifacts,
}

/// Response-ready media: the body owns whatever must be released once the
/// client is done with it.
pub struct MediaDownload {
    pub filename: String,
    pub content_length: Option<u64>,
    pub body: Body,
}

#[derive(Debug, Clone)]
pub struct YtDlp {
    settings: YtDlpSettings,
}

impl YtDlp {
    pub fn new(settings: YtDlpSettings) -> Self {
        Self { settings }
    }

    pub async fn run(&self, url: &str) -> Result<MediaDownload, AppError> {
        match self.settings.strategy {
            DeliveryStrategy::Staged => self.stage(url).await?.into_download().await,
            DeliveryStrategy::Direct => self.stream_direct(url).await,
        }
    }

    /// Id and title of the target. Never fails: a timestamp id and a generic
    /// title stand in when the tool cannot answer in time.
    pub async fn fetch_metadata(&self, url: &str) -> VideoMeta {
        let mut args = common_args();
        args.extend([
            "--no-warnings".to_string(),
            "--print".to_string(),
            META_TEMPLATE.to_string(),
            url.to_string(),
        ]);

        let parsed = match self.run_tool(&args, self.settings.meta_timeout).await {
            Ok(output) if output.status.success() => parse_meta_line(&output.stdout),
            Ok(output) => {
                debug!("metadata lookup exited with {}", output.status);
                None
            }
            Err(error) => {
                debug!("metadata lookup failed: {error}");
                None
            }
        };

        parsed.unwrap_or_else(|| VideoMeta {
            id: Utc::now().timestamp_millis().to_string(),
            title: DEFAULT_TITLE.to_string(),
        })
    }

    pub async fn stage(&self, url: &str) -> Result<StagedFile, AppError> {
        let meta = self.fetch_metadata(url).await;
        let mut job = DownloadJob::new(url, self.temp_base(&meta.id));
        // Armed before the tool runs so failed jobs are cleaned up too.
        let artifacts = TempArtifacts::for_base(&job.temp_base);

        self.download_to_file(&mut job).await?;
        let path = match resolve_final_path(&job).await {
            Ok(path) => path,
            Err(error) => {
                warn!(
                    "yt-dlp left no file for {}; diagnostics: {}",
                    job.target_url,
                    non_empty_or(&job.diagnostics, "(empty)")
                );
                return Err(error);
            }
        };

        let len = tokio::fs::metadata(&path).await?.len();
        info!(
            "yt-dlp staged {} ({len} bytes, tier {:?})",
            path.display(),
            job.tier
        );

        Ok(StagedFile {
            path,
            title: sanitize_filename(&meta.title),
            len,
            artifacts,
        })
    }

    fn temp_base(&self, id: &str) -> PathBuf {
        let unique = Uuid::new_v4().simple().to_string();
        self.settings
            .temp_dir
            .join(format!("yt-{}-{}", safe_id(id), &unique[..8]))
    }

    /// Tier A, then tier B when tier A exits non-zero or cannot start.
    /// A timeout on either tier is final.
    async fn download_to_file(&self, job: &mut DownloadJob) -> Result<(), AppError> {
        for tier in [FormatTier::Merged, FormatTier::Progressive] {
            job.tier = Some(tier);
            let mut args = common_args();
            args.extend(tier.args(&job.temp_base));
            args.push(job.target_url.clone());

            match self.run_tool(&args, self.settings.run_timeout).await {
                Ok(output) => {
                    let stderr = String::from_utf8_lossy(&output.stderr);
                    for line in stderr.lines().filter(|line| !line.trim().is_empty()) {
                        debug!("[yt-dlp] {line}");
                    }
                    job.diagnostics.push_str(&stderr);

                    if output.status.success() {
                        job.printed_path = last_printed_line(&output.stdout);
                        return Ok(());
                    }
                    warn!("yt-dlp tier {tier:?} exited with {}", output.status);
                }
                Err(AppError::ToolExecution(message)) => {
                    warn!("yt-dlp tier {tier:?} could not run: {message}");
                    job.diagnostics.push_str(&message);
                    job.diagnostics.push('\n');
                }
                Err(error) => return Err(error),
            }
        }

        Err(AppError::ToolExecution(format!(
            "every format tier failed for {}: {}",
            job.target_url,
            last_line(&job.diagnostics).unwrap_or("no diagnostics")
        )))
    }

    async fn stream_direct(&self, url: &str) -> Result<MediaDownload, AppError> {
        let meta = self.fetch_metadata(url).await;
        let mut args = common_args();
        args.extend([
            "-f".to_string(),
            PROGRESSIVE_SELECTOR.to_string(),
            "--no-playlist".to_string(),
            "-o".to_string(),
            "-".to_string(),
            "--user-agent".to_string(),
            TOOL_USER_AGENT.to_string(),
            url.to_string(),
        ]);

        let mut child = self.spawn_tool(&args)?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| AppError::ToolExecution("yt-dlp stdout was not captured".to_string()))?;
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    debug!("[yt-dlp] {line}");
                }
            });
        }

        info!("streaming yt-dlp stdout for {url}");
        Ok(MediaDownload {
            filename: format!("{}.{OUTPUT_EXTENSION}", sanitize_filename(&meta.title)),
            content_length: None,
            body: Body::from_stream(
                GuardedStream::new(ReaderStream::new(stdout), child)
                    .with_deadline(self.settings.run_timeout),
            ),
        })
    }

    /// Starts the first invocation that can be spawned.
    fn spawn_tool(&self, args: &[String]) -> Result<Child, AppError> {
        let mut failures = Vec::new();
        for invocation in &self.settings.invocations {
            match invocation.command(args).spawn() {
                Ok(child) => return Ok(child),
                Err(error) => {
                    if error.kind() == ErrorKind::NotFound {
                        debug!("{} is not installed", invocation.program);
                    } else {
                        warn!("could not start {}: {error}", invocation.program);
                    }
                    failures.push(format!("{}: {error}", invocation.program));
                }
            }
        }

        Err(AppError::ToolExecution(format!(
            "no yt-dlp invocation could be started ({})",
            failures.join("; ")
        )))
    }

    async fn run_tool(&self, args: &[String], limit: Duration) -> Result<Output, AppError> {
        let child = self.spawn_tool(args)?;
        // Dropping the child on expiry kills it (kill_on_drop).
        timeout(limit, child.wait_with_output())
            .await
            .map_err(|_| AppError::ToolTimeout(limit.as_secs()))?
            .map_err(AppError::Io)
    }
}

impl StagedFile {
    pub async fn into_download(self) -> Result<MediaDownload, AppError> {
        let file = tokio::fs::File::open(&self.path).await?;
        let body = Body::from_stream(GuardedStream::new(ReaderStream::new(file), self.artifacts));

        Ok(MediaDownload {
            filename: format!("{}.{OUTPUT_EXTENSION}", self.title),
            content_length: Some(self.len),
            body,
        })
    }
}

fn common_args() -> Vec<String> {
    COMMON_ARGS.iter().map(ToString::to_string).collect()
}

fn parse_meta_line(stdout: &[u8]) -> Option<VideoMeta> {
    let text = String::from_utf8_lossy(stdout);
    let line = text.lines().map(str::trim).find(|line| !line.is_empty())?;
    let (id, title) = line.split_once('\t').unwrap_or((line, ""));
    let id = id.trim();
    if id.is_empty() {
        return None;
    }
    let title = title.trim();

    Some(VideoMeta {
        id: id.to_string(),
        title: if title.is_empty() { DEFAULT_TITLE } else { title }.to_string(),
    })
}

fn safe_id(id: &str) -> String {
    let cleaned: String = id
        .chars()
        .map(|character| {
            if character.is_ascii_alphanumeric() || matches!(character, '-' | '_') {
                character
            } else {
                '_'
            }
        })
        .take(64)
        .collect();
    if cleaned.is_empty() {
        "video".to_string()
    } else {
        cleaned
    }
}

fn last_printed_line(stdout: &[u8]) -> Option<String> {
    String::from_utf8_lossy(stdout)
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .next_back()
        .map(ToString::to_string)
}

fn last_line(text: &str) -> Option<&str> {
    text.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .next_back()
}

fn non_empty_or<'a>(value: &'a str, fallback: &'a str) -> &'a str {
    if value.trim().is_empty() {
        fallback
    } else {
        value
    }
}

/// Printed path first, then the largest non-partial file sharing the
/// temp-base prefix. Empty files never count.
async fn resolve_final_path(job: &DownloadJob) -> Result<PathBuf, AppError> {
    let (dir, prefix) = split_base(&job.temp_base);
    let canonical_dir = tokio::fs::canonicalize(&dir).await?;

    if let Some(printed) = job.printed_path.as_deref()
        && let Some((path, len)) = resolve_download_candidate(&canonical_dir, Path::new(printed)).await?
        && len > 0
    {
        return Ok(path);
    }

    let mut best: Option<(PathBuf, u64)> = None;
    for path in prefixed_files(&dir, &prefix).await? {
        if path.to_string_lossy().ends_with(PARTIAL_SUFFIX) {
            continue;
        }
        if let Some((path, len)) = resolve_download_candidate(&canonical_dir, &path).await?
            && best.as_ref().is_none_or(|(_, best_len)| len > *best_len)
        {
            best = Some((path, len));
        }
    }

    match best {
        Some((path, len)) if len > 0 => Ok(path),
        _ => Err(AppError::OutputNotFound(job.target_url.clone())),
    }
}

/// The canonical path and size of a regular file inside the temp directory.
async fn resolve_download_candidate(
    canonical_dir: &Path,
    candidate_path: &Path,
) -> Result<Option<(PathBuf, u64)>, AppError> {
    let metadata = match tokio::fs::metadata(candidate_path).await {
        Ok(metadata) => metadata,
        Err(error) if error.kind() == ErrorKind::NotFound => return Ok(None),
        Err(error) => return Err(AppError::Io(error)),
    };

    if !metadata.is_file() {
        return Ok(None);
    }

    let canonical_candidate = tokio::fs::canonicalize(candidate_path).await?;
    if !canonical_candidate.starts_with(canonical_dir) {
        warn!(
            "ignoring yt-dlp output outside the temp directory: {:?}",
            canonical_candidate
        );
        return Ok(None);
    }

    Ok(Some((canonical_candidate, metadata.len())))
}

async fn prefixed_files(dir: &Path, prefix: &str) -> Result<Vec<PathBuf>, AppError> {
    let mut entries = tokio::fs::read_dir(dir).await?;
    let mut matches = Vec::new();
    while let Some(entry) = entries.next_entry().await? {
        if entry.file_name().to_string_lossy().starts_with(prefix) {
            matches.push(entry.path());
        }
    }
    Ok(matches)
}

/// Every file whose name starts with a job's temp-base prefix. Dropping the
/// guard schedules their removal; removal errors are ignored.
#[derive(Debug)]
pub struct TempArtifacts {
    dir: PathBuf,
    prefix: String,
}

impl TempArtifacts {
    pub fn for_base(temp_base: &Path) -> Self {
        let (dir, prefix) = split_base(temp_base);
        Self { dir, prefix }
    }
}

fn split_base(temp_base: &Path) -> (PathBuf, String) {
    let dir = temp_base
        .parent()
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from("."));
    let prefix = temp_base
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default();
    (dir, prefix)
}

impl Drop for TempArtifacts {
    fn drop(&mut self) {
        if self.prefix.is_empty() {
            return;
        }

        let dir = std::mem::take(&mut self.dir);
        let prefix = std::mem::take(&mut self.prefix);
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(remove_prefixed(dir, prefix));
            }
            Err(_) => remove_prefixed_blocking(&dir, &prefix),
        }
    }
}

async fn remove_prefixed(dir: PathBuf, prefix: String) {
    let files = match prefixed_files(&dir, &prefix).await {
        Ok(files) => files,
        Err(error) => {
            debug!("temp cleanup could not list {}: {error}", dir.display());
            return;
        }
    };

    for path in files {
        if let Err(error) = tokio::fs::remove_file(&path).await
            && error.kind() != ErrorKind::NotFound
        {
            debug!("temp cleanup could not remove {}: {error}", path.display());
        }
    }
    debug!("temp cleanup done for {prefix}");
}

fn remove_prefixed_blocking(dir: &Path, prefix: &str) {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return;
    };
    for entry in entries.flatten() {
        if entry.file_name().to_string_lossy().starts_with(prefix) {
            let _ = std::fs::remove_file(entry.path());
        }
    }
}

/// A byte stream that keeps `guard` alive until the response body is
/// dropped, whether it finished, failed or the client went away. With a
/// deadline, the stream ends in a `TimedOut` error once it expires, which
/// makes the server drop the body and with it the guard.
struct GuardedStream<S, G> {
    inner: S,
    deadline: Option<Pin<Box<Sleep>>>,
    _guard: G,
}

impl<S, G> GuardedStream<S, G> {
    fn new(inner: S, guard: G) -> Self {
        Self {
            inner,
            deadline: None,
            _guard: guard,
        }
    }

    fn with_deadline(mut self, limit: Duration) -> Self {
        self.deadline = Some(Box::pin(tokio::time::sleep(limit)));
        self
    }
}

impl<S, G, B> Stream for GuardedStream<S, G>
where
    S: Stream<Item = io::Result<B>> + Unpin,
    G: Unpin,
{
    type Item = io::Result<B>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        if let Some(deadline) = self.deadline.as_mut()
            && deadline.as_mut().poll(cx).is_ready()
        {
            self.deadline = None;
            warn!("yt-dlp stream exceeded its time limit; closing the body");
            return Poll::Ready(Some(Err(io::Error::new(
                ErrorKind::TimedOut,
                "yt-dlp stream exceeded its time limit",
            ))));
        }

        Pin::new(&mut self.inner).poll_next(cx)
    }
}
