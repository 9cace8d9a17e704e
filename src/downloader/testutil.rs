//! Fixtures shared by the engine tests: an in-memory database, an engine
//! wired to a drainable queue, and a local HTTP server that speaks ranges.

use std::{
    io::Cursor,
    net::SocketAddr,
    sync::{
        Arc, Mutex,
        atomic::{AtomicU32, Ordering},
    },
    time::Duration,
};

use axum::{
    Router,
    body::{Body, Bytes},
    extract::State,
    http::{HeaderMap, HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
    routing::head,
};
use futures_util::StreamExt;
use tempfile::TempDir;
use tokio::{sync::broadcast, task::JoinHandle};

use super::engine::{Engine, EngineSettings};
use super::models::{TransferEvent, TransferStatus};
use super::notify::BroadcastNotifier;
use super::queue::{RetryPolicy, Task, TaskQueue};
use crate::db::memory_db;

pub struct Harness {
    pub engine: Arc<Engine>,
    pub queue: TaskQueue,
    pub notifier: Arc<BroadcastNotifier>,
    events: broadcast::Receiver<TransferEvent>,
    pub dir: TempDir,
}

pub fn test_policy() -> RetryPolicy {
    RetryPolicy {
        max_attempts: 3,
        base: Duration::from_millis(1),
        max: Duration::from_millis(5),
    }
}

/// Engine over a fresh database and temp directories. Progress is flushed
/// after every body read so tests see every boundary.
pub async fn harness(configure: impl FnOnce(&mut EngineSettings)) -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let mut settings = EngineSettings {
        storage_root: dir.path().join("storage"),
        tmp_dir: dir.path().join("tmp"),
        http_timeout: Duration::from_secs(5),
        progress_flush_bytes: 1,
        ..Default::default()
    };
    configure(&mut settings);

    let queue = TaskQueue::new(test_policy());
    let notifier = Arc::new(BroadcastNotifier::new(4096));
    let events = notifier.subscribe();
    let engine = Engine::new(memory_db().await, settings, queue.scheduler(), notifier.clone())
        .expect("engine builds");

    Harness {
        engine: Arc::new(engine),
        queue,
        notifier,
        events,
        dir,
    }
}

impl Harness {
    /// Runs queued tasks until nothing is left
    pub async fn drain(&mut self) -> usize {
        self.queue.drain(self.engine.as_ref()).await
    }

    pub fn take_tasks(&mut self) -> Vec<Task> {
        self.queue.take_pending()
    }

    pub fn events(&mut self) -> Vec<TransferEvent> {
        let mut events = Vec::new();
        loop {
            match self.events.try_recv() {
                Ok(event) => events.push(event),
                Err(broadcast::error::TryRecvError::Lagged(_)) => continue,
                Err(_) => return events,
            }
        }
    }

    /// Progress percents emitted for one transfer, in order
    pub fn progress_of(&mut self, transfer: &str) -> Vec<u8> {
        self.events()
            .into_iter()
            .filter_map(|event| match event {
                TransferEvent::Progress(p) if p.transfer_id == transfer => Some(p.percent),
                _ => None,
            })
            .collect()
    }

    /// Terminal statuses announced for one transfer
    pub fn finished_of(events: &[TransferEvent], transfer: &str) -> Vec<TransferStatus> {
        events
            .iter()
            .filter_map(|event| match event {
                TransferEvent::Finished(f) if f.transfer_id == transfer => Some(f.status),
                _ => None,
            })
            .collect()
    }
}

/// Behaviour of the fixture server's `/file` route
#[derive(Debug, Clone, Default)]
pub struct Fixture {
    body: Arc<Vec<u8>>,
    accept_ranges: bool,
    content_type: Option<String>,
    disposition: Option<String>,
    head_status: Option<StatusCode>,
    get_status: Option<StatusCode>,
    fail_gets: u32,
    ignore_ranges: bool,
    hide_length: bool,
    pace: Option<Duration>,
}

impl Fixture {
    pub fn new(body: Vec<u8>) -> Self {
        Self {
            body: Arc::new(body),
            accept_ranges: true,
            ..Default::default()
        }
    }

    /// Advertise no range support and ignore `Range` headers
    pub fn no_ranges(mut self) -> Self {
        self.accept_ranges = false;
        self
    }

    /// Advertise range support but answer every GET with the full body
    pub fn ignore_ranges(mut self) -> Self {
        self.ignore_ranges = true;
        self
    }

    pub fn content_type(mut self, value: &str) -> Self {
        self.content_type = Some(value.to_string());
        self
    }

    pub fn disposition(mut self, value: &str) -> Self {
        self.disposition = Some(value.to_string());
        self
    }

    pub fn head_status(mut self, status: StatusCode) -> Self {
        self.head_status = Some(status);
        self
    }

    pub fn get_status(mut self, status: StatusCode) -> Self {
        self.get_status = Some(status);
        self
    }

    /// Answer the first `n` GETs with 503
    pub fn fail_gets(mut self, n: u32) -> Self {
        self.fail_gets = n;
        self
    }

    /// Omit `Content-Length` and stream the body chunked
    pub fn hide_length(mut self) -> Self {
        self.hide_length = true;
        self
    }

    /// Stream the body in 1 KiB pieces with a delay before each
    pub fn pace(mut self, delay: Duration) -> Self {
        self.pace = Some(delay);
        self
    }
}

#[derive(Clone)]
struct FixtureState {
    fixture: Arc<Fixture>,
    gets: Arc<AtomicU32>,
    ranges: Arc<Mutex<Vec<Option<String>>>>,
}

pub struct FixtureServer {
    addr: SocketAddr,
    state: FixtureState,
    handle: JoinHandle<()>,
}

impl FixtureServer {
    pub fn url(&self, path: &str) -> String {
        format!("http://{}{}", self.addr, path)
    }

    /// Number of GET requests served so far
    pub fn gets(&self) -> u32 {
        self.state.gets.load(Ordering::SeqCst)
    }

    /// `Range` header of every GET, in arrival order
    pub fn ranges(&self) -> Vec<Option<String>> {
        self.state.ranges.lock().unwrap().clone()
    }
}

impl Drop for FixtureServer {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

pub async fn serve(fixture: Fixture) -> FixtureServer {
    let state = FixtureState {
        fixture: Arc::new(fixture),
        gets: Arc::new(AtomicU32::new(0)),
        ranges: Arc::new(Mutex::new(Vec::new())),
    };
    let app = Router::new()
        .route("/file", head(handle_head).get(handle_get))
        .with_state(state.clone());

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let handle = tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    FixtureServer {
        addr,
        state,
        handle,
    }
}

fn common_headers(fixture: &Fixture) -> HeaderMap {
    let mut headers = HeaderMap::new();
    if let Some(content_type) = &fixture.content_type {
        headers.insert(header::CONTENT_TYPE, HeaderValue::from_str(content_type).unwrap());
    }
    if let Some(disposition) = &fixture.disposition {
        headers.insert(header::CONTENT_DISPOSITION, HeaderValue::from_str(disposition).unwrap());
    }
    if fixture.accept_ranges {
        headers.insert(header::ACCEPT_RANGES, HeaderValue::from_static("bytes"));
    }
    headers
}

async fn handle_head(State(state): State<FixtureState>) -> Response {
    let fixture = &state.fixture;
    if let Some(status) = fixture.head_status {
        return status.into_response();
    }
    let mut headers = common_headers(fixture);
    if !fixture.hide_length {
        headers.insert(
            header::CONTENT_LENGTH,
            HeaderValue::from_str(&fixture.body.len().to_string()).unwrap(),
        );
    }
    (StatusCode::OK, headers).into_response()
}

async fn handle_get(State(state): State<FixtureState>, headers: HeaderMap) -> Response {
    let n = state.gets.fetch_add(1, Ordering::SeqCst) + 1;
    let requested = headers
        .get(header::RANGE)
        .and_then(|v| v.to_str().ok())
        .map(str::to_owned);
    state.ranges.lock().unwrap().push(requested.clone());

    let fixture = &state.fixture;
    if let Some(status) = fixture.get_status {
        return status.into_response();
    }
    if n <= fixture.fail_gets {
        return StatusCode::SERVICE_UNAVAILABLE.into_response();
    }

    let total = fixture.body.len();
    let range = if fixture.accept_ranges && !fixture.ignore_ranges {
        requested.as_deref().and_then(|v| parse_range(v, total))
    } else {
        None
    };

    let mut out = common_headers(fixture);
    let (status, slice) = match range {
        Some((start, end)) => {
            out.insert(
                header::CONTENT_RANGE,
                HeaderValue::from_str(&format!("bytes {start}-{end}/{total}")).unwrap(),
            );
            (StatusCode::PARTIAL_CONTENT, fixture.body[start..=end].to_vec())
        }
        None => (StatusCode::OK, fixture.body.to_vec()),
    };

    let body = if fixture.hide_length || fixture.pace.is_some() {
        if !fixture.hide_length {
            out.insert(
                header::CONTENT_LENGTH,
                HeaderValue::from_str(&slice.len().to_string()).unwrap(),
            );
        }
        let delay = fixture.pace.unwrap_or_default();
        let pieces: Vec<Bytes> = slice.chunks(1024).map(Bytes::copy_from_slice).collect();
        Body::from_stream(futures_util::stream::iter(pieces).then(move |piece| async move {
            tokio::time::sleep(delay).await;
            Ok::<_, std::io::Error>(piece)
        }))
    } else {
        Body::from(slice)
    };

    (status, out, body).into_response()
}

/// `bytes=a-b` or `bytes=a-`, clamped to the body
fn parse_range(value: &str, total: usize) -> Option<(usize, usize)> {
    let value = value.strip_prefix("bytes=")?;
    let (start, end) = value.split_once('-')?;
    let start: usize = start.parse().ok()?;
    let end = match end {
        "" => total.checked_sub(1)?,
        end => end.parse::<usize>().ok()?.min(total.checked_sub(1)?),
    };
    (start <= end).then_some((start, end))
}

/// Deterministic bytes that differ per offset
pub fn patterned(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}

/// Encodes a solid image of the given size
pub fn image_bytes(width: u32, height: u32, alpha: bool, format: image::ImageFormat) -> Vec<u8> {
    let image = if alpha {
        image::DynamicImage::ImageRgba8(image::RgbaImage::from_pixel(
            width,
            height,
            image::Rgba([10, 20, 30, 128]),
        ))
    } else {
        image::DynamicImage::ImageRgb8(image::RgbImage::from_pixel(
            width,
            height,
            image::Rgb([200, 100, 50]),
        ))
    };
    let mut out = Cursor::new(Vec::new());
    image.write_to(&mut out, format).unwrap();
    out.into_inner()
}
