use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use tokio::time::Duration;
use tracing::{debug, warn};

use crate::error::AppError;

const FETCH_TIMEOUT_SECONDS: u64 = 60;
const MEDIA_IDLE_TIMEOUT_SECONDS: u64 = 60;
const MAX_REDIRECTS: usize = 5;

/// Browser-like request headers sent with every page and media request.
#[derive(Debug, Clone)]
pub struct BrowserHeaders(Vec<(&'static str, &'static str)>);

impl Default for BrowserHeaders {
    fn default() -> Self {
        Self(vec![
            (
                "user-agent",
                "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/122.0.0.0 Safari/537.36",
            ),
            (
                "accept",
                "text/html,application/xhtml+xml,application/xml;q=0.9,*/*;q=0.8",
            ),
            ("accept-language", "pt-BR,pt;q=0.9,en-US;q=0.8,en;q=0.7"),
            ("cache-control", "no-cache"),
            ("pragma", "no-cache"),
            ("referer", "https://www.instagram.com/"),
            ("sec-fetch-dest", "document"),
            ("sec-fetch-mode", "navigate"),
            ("sec-fetch-site", "same-origin"),
            ("sec-fetch-user", "?1"),
            (
                "sec-ch-ua",
                "\"Chromium\";v=\"122\", \"Not(A:Brand\";v=\"8\", \"Google Chrome\";v=\"122\"",
            ),
            ("sec-ch-ua-mobile", "?0"),
            ("sec-ch-ua-platform", "\"Windows\""),
        ])
    }
}

impl BrowserHeaders {
    fn to_header_map(&self) -> Result<HeaderMap, AppError> {
        let mut headers = HeaderMap::with_capacity(self.0.len());
        for &(name, value) in &self.0 {
            let name = HeaderName::from_static(name);
            let value = HeaderValue::from_str(value).map_err(|error| {
                AppError::Config(format!("invalid header value for {name}: {error}"))
            })?;
            headers.insert(name, value);
        }
        Ok(headers)
    }
}

/// Where the locator gets page HTML from.
#[async_trait]
pub trait HtmlSource: Send + Sync {
    async fn fetch_html(&self, url: &str) -> Result<String, AppError>;
}

/// Pages are bounded by a total deadline. Media bodies are streamed for as
/// long as they take, so they only get a connect limit and an idle limit
/// between reads.
#[derive(Debug, Clone)]
pub struct HtmlFetcher {
    client: reqwest::Client,
    page_timeout: Duration,
}

impl HtmlFetcher {
    pub fn new(headers: BrowserHeaders) -> Result<Self, AppError> {
        Self::with_timeouts(
            headers,
            Duration::from_secs(FETCH_TIMEOUT_SECONDS),
            Duration::from_secs(MEDIA_IDLE_TIMEOUT_SECONDS),
        )
    }

    fn with_timeouts(
        headers: BrowserHeaders,
        page_timeout: Duration,
        idle_timeout: Duration,
    ) -> Result<Self, AppError> {
        let client = reqwest::Client::builder()
            .default_headers(headers.to_header_map()?)
            .connect_timeout(page_timeout)
            .read_timeout(idle_timeout)
            .redirect(reqwest::redirect::Policy::limited(MAX_REDIRECTS))
            .build()
            .map_err(|error| AppError::Config(format!("could not build HTTP client: {error}")))?;

        Ok(Self {
            client,
            page_timeout,
        })
    }

    /// Opens a streaming GET on a media URL. Statuses >= 400 become
    /// `UpstreamFetch` carrying the status so callers can pass it through.
    pub async fn open_media(&self, url: &str) -> Result<reqwest::Response, AppError> {
        let response = send(self.client.get(url), url).await?;
        let status = response.status();
        if status.as_u16() >= 400 {
            warn!("media request {url} answered {status}");
            return Err(AppError::upstream_status(url, status.as_u16()));
        }
        Ok(response)
    }

}

#[async_trait]
impl HtmlSource for HtmlFetcher {
    async fn fetch_html(&self, url: &str) -> Result<String, AppError> {
        let request = self.client.get(url).timeout(self.page_timeout);
        let response = send(request, url).await?;
        let status = response.status();
        debug!("GET {url} -> {status}");
        if status.as_u16() >= 400 {
            return Err(AppError::upstream_status(url, status.as_u16()));
        }

        response
            .text()
            .await
            .map_err(|error| transport_error(url, &error))
    }
}

async fn send(request: reqwest::RequestBuilder, url: &str) -> Result<reqwest::Response, AppError> {
    request
        .send()
        .await
        .map_err(|error| transport_error(url, &error))
}

fn transport_error(url: &str, error: &reqwest::Error) -> AppError {
    let kind = if error.is_timeout() {
        "timeout"
    } else if error.is_redirect() {
        "redirect limit"
    } else if error.is_connect() {
        "connect"
    } else {
        "request"
    };

    AppError::UpstreamFetch {
        url: url.to_string(),
        status: error.status().map(|status| status.as_u16()),
        detail: format!("{kind}: {error}"),
    }
}

#[cfg(test)]
mod tests {
    use tokio::{
        io::{AsyncReadExt, AsyncWriteExt},
        net::TcpListener,
    };

    use super::*;

    /// What the stub server sends back: a raw status line plus headers, a
    /// body, and the pause between body bytes (zero sends it in one go).
    struct Reply {
        head: String,
        body: Vec<u8>,
        drip: Duration,
    }

    impl Reply {
        fn status(code: u16, reason: &str) -> Self {
            Self {
                head: format!("HTTP/1.1 {code} {reason}\r\nContent-Length: 0\r\n"),
                body: Vec::new(),
                drip: Duration::ZERO,
            }
        }

        fn redirect(location: &str) -> Self {
            Self {
                head: format!(
                    "HTTP/1.1 302 Found\r\nLocation: {location}\r\nContent-Length: 0\r\n"
                ),
                body: Vec::new(),
                drip: Duration::ZERO,
            }
        }

        fn ok(body: &[u8], drip: Duration) -> Self {
            Self {
                head: format!(
                    "HTTP/1.1 200 OK\r\nContent-Type: text/html\r\nContent-Length: {}\r\n",
                    body.len()
                ),
                body: body.to_vec(),
                drip,
            }
        }
    }

    /// Serves `route(path)` for every request on an ephemeral port and
    /// returns the base URL.
    async fn stub_server(route: fn(&str) -> Reply) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        tokio::spawn(async move {
            while let Ok((mut socket, _)) = listener.accept().await {
                tokio::spawn(async move {
                    let mut head = Vec::new();
                    let mut buf = [0u8; 1024];
                    while !head.windows(4).any(|window| window == b"\r\n\r\n") {
                        match socket.read(&mut buf).await {
                            Ok(0) | Err(_) => return,
                            Ok(n) => head.extend_from_slice(&buf[..n]),
                        }
                    }
                    let request = String::from_utf8_lossy(&head);
                    let path = request.split_whitespace().nth(1).unwrap_or("/").to_string();

                    let reply = route(&path);
                    let head = format!("{}Connection: close\r\n\r\n", reply.head);
                    if socket.write_all(head.as_bytes()).await.is_err() {
                        return;
                    }
                    if reply.drip.is_zero() {
                        let _ = socket.write_all(&reply.body).await;
                    } else {
                        for byte in reply.body {
                            if socket.write_all(&[byte]).await.is_err() {
                                return;
                            }
                            tokio::time::sleep(reply.drip).await;
                        }
                    }
                    let _ = socket.shutdown().await;
                });
            }
        });

        format!("http://{addr}")
    }

    fn routes(path: &str) -> Reply {
        if let Some(hop) = path.strip_prefix("/hop/") {
            let next = hop.parse::<u32>().unwrap_or(0) + 1;
            return Reply::redirect(&format!("/hop/{next}"));
        }
        match path {
            "/page" => Reply::ok(b"<html>ok</html>", Duration::ZERO),
            "/missing" => Reply::status(404, "Not Found"),
            "/busy" => Reply::status(503, "Service Unavailable"),
            "/forbidden" => Reply::status(403, "Forbidden"),
            "/moved" => Reply::redirect("/hop-end"),
            "/hop-end" => Reply::ok(b"landed", Duration::ZERO),
            "/slow" => Reply::ok(&[b'v'; 20], Duration::from_millis(50)),
            _ => Reply::status(500, "Internal Server Error"),
        }
    }

    fn fetcher() -> HtmlFetcher {
        HtmlFetcher::new(BrowserHeaders::default()).unwrap()
    }

    fn upstream_status(error: &AppError) -> Option<u16> {
        match error {
            AppError::UpstreamFetch { status, .. } => *status,
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn default_headers_are_valid() {
        let headers = BrowserHeaders::default().to_header_map().unwrap();
        assert!(headers.contains_key("user-agent"));
        assert_eq!(headers["referer"], "https://www.instagram.com/");
        assert_eq!(headers.len(), 13);
    }

    #[test]
    fn fetcher_builds_from_default_headers() {
        assert!(HtmlFetcher::new(BrowserHeaders::default()).is_ok());
    }

    #[tokio::test]
    async fn unreachable_host_is_an_upstream_failure() {
        let error = fetcher()
            .fetch_html("http://127.0.0.1:9/p/none/")
            .await
            .unwrap_err();
        assert!(matches!(error, AppError::UpstreamFetch { status: None, .. }));
    }

    #[tokio::test]
    async fn page_body_is_returned_and_redirects_are_followed() {
        let base = stub_server(routes).await;

        assert_eq!(
            fetcher().fetch_html(&format!("{base}/page")).await.unwrap(),
            "<html>ok</html>"
        );
        assert_eq!(
            fetcher().fetch_html(&format!("{base}/moved")).await.unwrap(),
            "landed"
        );
    }

    #[tokio::test]
    async fn error_statuses_carry_the_upstream_code() {
        let base = stub_server(routes).await;
        let fetcher = fetcher();

        let missing = fetcher.fetch_html(&format!("{base}/missing")).await.unwrap_err();
        assert_eq!(upstream_status(&missing), Some(404));

        let busy = fetcher.fetch_html(&format!("{base}/busy")).await.unwrap_err();
        assert_eq!(upstream_status(&busy), Some(503));

        let forbidden = fetcher
            .open_media(&format!("{base}/forbidden"))
            .await
            .unwrap_err();
        assert_eq!(upstream_status(&forbidden), Some(403));
    }

    #[tokio::test]
    async fn redirect_chain_past_the_cap_fails_without_status() {
        let base = stub_server(routes).await;

        let error = fetcher()
            .fetch_html(&format!("{base}/hop/0"))
            .await
            .unwrap_err();

        match error {
            AppError::UpstreamFetch { status, detail, .. } => {
                assert_eq!(status, None);
                assert!(detail.contains("redirect limit"), "{detail}");
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[tokio::test]
    async fn media_body_outlives_the_page_deadline() {
        let base = stub_server(routes).await;
        let fetcher = HtmlFetcher::with_timeouts(
            BrowserHeaders::default(),
            Duration::from_millis(300),
            Duration::from_millis(500),
        )
        .unwrap();

        let response = fetcher.open_media(&format!("{base}/slow")).await.unwrap();
        let bytes = response.bytes().await.unwrap();
        assert_eq!(bytes.len(), 20);

        let error = fetcher
            .fetch_html(&format!("{base}/slow"))
            .await
            .unwrap_err();
        match error {
            AppError::UpstreamFetch { detail, .. } => assert!(detail.starts_with("timeout"), "{detail}"),
            other => panic!("unexpected error {other:?}"),
        }
    }
}
