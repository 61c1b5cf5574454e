use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::mpsc;
use std::thread::JoinHandle;

use anyhow::Result;
use hyper::service::{make_service_fn, service_fn};
use hyper::{Body, Method, Request, Response, StatusCode};
use tokio::sync::oneshot;
use tracing::{debug, info};

use crate::observability::MetricsCollector;

const LANDING_PAGE: &str = r#"<!DOCTYPE html>
<html>
<head>
  <meta charset="utf-8">
  <title>framecast</title>
  <script src="https://cdn.jsdelivr.net/npm/hls.js@1"></script>
</head>
<body>
  <h1>framecast streams</h1>
  <select id="streams"></select>
  <video id="player" controls width="640"></video>
  <script>
    const select = document.getElementById('streams');
    const video = document.getElementById('player');
    fetch('/streams').then(r => r.json()).then(names => {
      for (const name of names) {
        const option = document.createElement('option');
        option.value = option.textContent = name;
        select.appendChild(option);
      }
      if (names.length > 0) play(names[0]);
    });
    select.addEventListener('change', () => play(select.value));
    function play(name) {
      const url = '/videos/' + name;
      if (Hls.isSupported()) {
        const hls = new Hls();
        hls.loadSource(url);
        hls.attachMedia(video);
      } else {
        video.src = url;
      }
    }
  </script>
</body>
</html>
"#;

struct ServerState {
    dir: PathBuf,
    metrics: Option<MetricsCollector>,
}

/// Serves produced manifests and segments over HTTP on a dedicated
/// thread. Stateless per request: the manifest listing is a fresh
/// directory scan every time, so new runs show up without restarts.
pub struct StreamServer {
    shutdown_tx: Option<oneshot::Sender<()>>,
    thread: Option<JoinHandle<()>>,
    address: SocketAddr,
}

impl StreamServer {
    pub fn start(
        listen: SocketAddr,
        dir: PathBuf,
        metrics: Option<MetricsCollector>,
    ) -> Result<Self> {
        let (tx, rx) = oneshot::channel::<()>();
        let (addr_tx, addr_rx) = mpsc::channel::<Result<SocketAddr, hyper::Error>>();
        let state = Arc::new(ServerState { dir, metrics });

        let thread = std::thread::spawn(move || {
            let runtime = tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
                .expect("failed to build server runtime");

            runtime.block_on(async move {
                let make_svc = make_service_fn(move |_| {
                    let state = state.clone();
                    async move {
                        Ok::<_, hyper::Error>(service_fn(move |req| {
                            let state = state.clone();
                            async move { handle_request(req, state).await }
                        }))
                    }
                });

                let builder = match hyper::Server::try_bind(&listen) {
                    Ok(builder) => builder,
                    Err(err) => {
                        addr_tx.send(Err(err)).ok();
                        return;
                    }
                };
                addr_tx.send(Ok(builder.local_addr())).ok();
                let server = builder.serve(make_svc);
                let graceful = server.with_graceful_shutdown(async move {
                    let _ = rx.await;
                });

                if let Err(err) = graceful.await {
                    tracing::error!(error = %err, "Stream server error");
                }
            });
        });

        let address = match addr_rx.recv() {
            Ok(Ok(address)) => address,
            Ok(Err(err)) => {
                let _ = thread.join();
                return Err(anyhow::Error::new(err)
                    .context(format!("failed to bind stream server on {listen}")));
            }
            Err(_) => {
                let _ = thread.join();
                anyhow::bail!("stream server thread exited before binding {listen}");
            }
        };
        info!(%address, "Stream server listening");

        Ok(Self {
            shutdown_tx: Some(tx),
            thread: Some(thread),
            address,
        })
    }

    pub fn address(&self) -> SocketAddr {
        self.address
    }

    pub fn stop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

impl Drop for StreamServer {
    fn drop(&mut self) {
        self.stop();
    }
}

async fn handle_request(
    req: Request<Body>,
    state: Arc<ServerState>,
) -> Result<Response<Body>, hyper::Error> {
    let path = req.uri().path().to_string();
    debug!(method = %req.method(), path = path.as_str(), "Request");

    match (req.method(), path.as_str()) {
        (&Method::GET, "/") => Ok(Response::builder()
            .header("Content-Type", "text/html; charset=utf-8")
            .body(Body::from(LANDING_PAGE))
            .unwrap()),
        (&Method::GET, "/streams") => Ok(list_manifests(&state.dir)),
        (&Method::GET, "/metrics") => match &state.metrics {
            Some(collector) => Ok(Response::new(Body::from(
                collector.snapshot().to_prometheus(),
            ))),
            None => Ok(not_found()),
        },
        (&Method::GET, "/metrics.json") => match &state.metrics {
            Some(collector) => {
                let body =
                    serde_json::to_vec(&collector.snapshot()).unwrap_or_else(|_| b"{}".to_vec());
                Ok(Response::builder()
                    .header("Content-Type", "application/json")
                    .body(Body::from(body))
                    .unwrap())
            }
            None => Ok(not_found()),
        },
        (&Method::GET, _) if path.starts_with("/videos/") => {
            let name = &path["/videos/".len()..];
            let range = req
                .headers()
                .get(hyper::header::RANGE)
                .and_then(|v| v.to_str().ok())
                .map(str::to_string);
            Ok(serve_file(&state.dir, name, range.as_deref()))
        }
        _ => Ok(not_found()),
    }
}

/// Lists every manifest currently on disk, freshly globbed per request.
fn list_manifests(dir: &Path) -> Response<Body> {
    let pattern = dir.join("*.m3u8");
    let mut names: Vec<String> = glob::glob(&pattern.to_string_lossy())
        .map(|entries| {
            entries
                .filter_map(|entry| entry.ok())
                .filter_map(|p| p.file_name().map(|n| n.to_string_lossy().to_string()))
                .collect()
        })
        .unwrap_or_default();
    names.sort();

    let body = serde_json::to_vec(&names).unwrap_or_else(|_| b"[]".to_vec());
    Response::builder()
        .header("Content-Type", "application/json")
        .body(Body::from(body))
        .unwrap()
}

/// Serves one manifest or segment by bare file name, honoring a single
/// byte range. Names with path separators or parent components are
/// rejected so the handler can never leave the output directory.
fn serve_file(dir: &Path, name: &str, range: Option<&str>) -> Response<Body> {
    if !is_safe_name(name) {
        return not_found();
    }

    let path = dir.join(name);
    let data = match std::fs::read(&path) {
        Ok(data) => data,
        Err(_) => return not_found(),
    };
    let total = data.len() as u64;
    let content_type = content_type_for(name);

    match range.map(|spec| parse_range(spec, total)) {
        None => Response::builder()
            .header("Content-Type", content_type)
            .header("Accept-Ranges", "bytes")
            .header("Content-Length", total.to_string())
            .body(Body::from(data))
            .unwrap(),
        Some(Some((start, end))) => {
            let slice = data[start as usize..=end as usize].to_vec();
            Response::builder()
                .status(StatusCode::PARTIAL_CONTENT)
                .header("Content-Type", content_type)
                .header("Accept-Ranges", "bytes")
                .header("Content-Range", format!("bytes {start}-{end}/{total}"))
                .header("Content-Length", slice.len().to_string())
                .body(Body::from(slice))
                .unwrap()
        }
        Some(None) => Response::builder()
            .status(StatusCode::RANGE_NOT_SATISFIABLE)
            .header("Content-Range", format!("bytes */{total}"))
            .body(Body::empty())
            .unwrap(),
    }
}

fn is_safe_name(name: &str) -> bool {
    !name.is_empty()
        && !name.contains('/')
        && !name.contains('\\')
        && !name.starts_with("..")
}

fn content_type_for(name: &str) -> &'static str {
    if name.ends_with(".m3u8") {
        "application/vnd.apple.mpegurl"
    } else if name.ends_with(".ts") {
        "video/mp2t"
    } else {
        "application/octet-stream"
    }
}

/// Parses a single-range `Range` header against a known length. Returns
/// the inclusive byte span, or `None` when the header is malformed or
/// unsatisfiable.
fn parse_range(spec: &str, total: u64) -> Option<(u64, u64)> {
    if total == 0 {
        return None;
    }
    let spec = spec.strip_prefix("bytes=")?;
    if spec.contains(',') {
        // Multi-range requests are not supported.
        return None;
    }
    let (start_str, end_str) = spec.split_once('-')?;

    if start_str.is_empty() {
        // Suffix range: last N bytes.
        let suffix: u64 = end_str.parse().ok()?;
        if suffix == 0 {
            return None;
        }
        let start = total.saturating_sub(suffix);
        return Some((start, total - 1));
    }

    let start: u64 = start_str.parse().ok()?;
    if start >= total {
        return None;
    }
    let end = if end_str.is_empty() {
        total - 1
    } else {
        end_str.parse::<u64>().ok()?.min(total - 1)
    };
    if end < start {
        return None;
    }
    Some((start, end))
}

fn not_found() -> Response<Body> {
    Response::builder()
        .status(StatusCode::NOT_FOUND)
        .body(Body::from("Not Found"))
        .unwrap()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn range_parsing() {
        assert_eq!(parse_range("bytes=0-9", 100), Some((0, 9)));
        assert_eq!(parse_range("bytes=50-", 100), Some((50, 99)));
        assert_eq!(parse_range("bytes=-10", 100), Some((90, 99)));
        assert_eq!(parse_range("bytes=0-200", 100), Some((0, 99)));
        assert_eq!(parse_range("bytes=100-", 100), None);
        assert_eq!(parse_range("bytes=5-2", 100), None);
        assert_eq!(parse_range("bytes=0-9,20-29", 100), None);
        assert_eq!(parse_range("items=0-9", 100), None);
        assert_eq!(parse_range("bytes=0-9", 0), None);
    }

    #[test]
    fn unsafe_names_are_rejected() {
        assert!(is_safe_name("playlist-abc.m3u8"));
        assert!(is_safe_name("playlist-abc-00001.ts"));
        assert!(!is_safe_name(""));
        assert!(!is_safe_name("../secret"));
        assert!(!is_safe_name("a/b.ts"));
        assert!(!is_safe_name("a\\b.ts"));
    }

    #[test]
    fn bind_failure_surfaces_from_start() {
        let temp = tempfile::tempdir().unwrap();
        let first = StreamServer::start(
            "127.0.0.1:0".parse().unwrap(),
            temp.path().to_path_buf(),
            None,
        )
        .unwrap();

        let second = StreamServer::start(first.address(), temp.path().to_path_buf(), None);
        assert!(second.is_err(), "binding an in-use port must fail loudly");
        drop(first);
    }

    #[tokio::test]
    async fn listing_reflects_directory_contents() {
        let temp = tempfile::tempdir().unwrap();
        std::fs::write(temp.path().join("playlist-a.m3u8"), "#EXTM3U").unwrap();
        std::fs::write(temp.path().join("playlist-b.m3u8"), "#EXTM3U").unwrap();
        std::fs::write(temp.path().join("playlist-a-00000.ts"), [0u8; 4]).unwrap();

        let state = Arc::new(ServerState {
            dir: temp.path().to_path_buf(),
            metrics: None,
        });
        let req = Request::builder()
            .uri("/streams")
            .body(Body::empty())
            .unwrap();
        let resp = handle_request(req, state).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let body = hyper::body::to_bytes(resp.into_body()).await.unwrap();
        let names: Vec<String> = serde_json::from_slice(&body).unwrap();
        assert_eq!(names, vec!["playlist-a.m3u8", "playlist-b.m3u8"]);
    }

    #[tokio::test]
    async fn segments_support_byte_ranges() {
        let temp = tempfile::tempdir().unwrap();
        std::fs::write(temp.path().join("seg.ts"), (0u8..100).collect::<Vec<_>>()).unwrap();

        let state = Arc::new(ServerState {
            dir: temp.path().to_path_buf(),
            metrics: None,
        });
        let req = Request::builder()
            .uri("/videos/seg.ts")
            .header("Range", "bytes=10-19")
            .body(Body::empty())
            .unwrap();
        let resp = handle_request(req, state).await.unwrap();
        assert_eq!(resp.status(), StatusCode::PARTIAL_CONTENT);
        assert_eq!(
            resp.headers().get("Content-Range").unwrap(),
            "bytes 10-19/100"
        );
        let body = hyper::body::to_bytes(resp.into_body()).await.unwrap();
        assert_eq!(body.as_ref(), &(10u8..20).collect::<Vec<_>>()[..]);
    }

    #[tokio::test]
    async fn traversal_is_rejected() {
        let temp = tempfile::tempdir().unwrap();
        let state = Arc::new(ServerState {
            dir: temp.path().to_path_buf(),
            metrics: None,
        });
        let req = Request::builder()
            .uri("/videos/..%2Fsecret")
            .body(Body::empty())
            .unwrap();
        let resp = handle_request(req, state).await.unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn landing_page_is_served() {
        let temp = tempfile::tempdir().unwrap();
        let state = Arc::new(ServerState {
            dir: temp.path().to_path_buf(),
            metrics: None,
        });
        let req = Request::builder().uri("/").body(Body::empty()).unwrap();
        let resp = handle_request(req, state).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let body = hyper::body::to_bytes(resp.into_body()).await.unwrap();
        assert!(std::str::from_utf8(&body).unwrap().contains("framecast"));
    }
}
