//! HTTP client for inspecting and fetching remote objects
//!
//! Thin wrapper around reqwest that knows how to read the headers a chunked
//! download depends on: `Content-Length`, `Accept-Ranges`, `Content-Range`
//! and `Content-Disposition`.

use std::{sync::LazyLock, time::Duration};

use regex::Regex;
use reqwest::{
    Client, Response,
    header::{self, HeaderMap, HeaderValue},
};
use tracing::{debug, instrument, trace};

use super::error::{Result, TransferError};
use super::models::ByteRange;

static CONTENT_RANGE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^bytes (\d+)-(\d+)/(\d+|\*)$").expect("content range pattern is valid")
});

/// What a HEAD request told us about the remote object
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RemoteHead {
    pub content_length: Option<u64>,
    pub accept_ranges: bool,
    pub content_type: Option<String>,
    pub filename: Option<String>,
}

/// Parsed `Content-Range: bytes start-end/total`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContentRange {
    pub start: u64,
    pub end: u64,
    pub total: Option<u64>,
}

#[derive(Debug, Clone)]
pub struct Downloader {
    client: Client,
    timeout: Duration,
}

impl Downloader {
    pub fn new(timeout: Duration) -> Result<Self> {
        let mut headers = HeaderMap::new();
        headers.insert(header::ACCEPT, HeaderValue::from_static("*/*"));
        // Byte offsets must refer to the stored representation
        headers.insert(header::ACCEPT_ENCODING, HeaderValue::from_static("identity"));

        let client = Client::builder()
            .user_agent(concat!("chunkline/", env!("CARGO_PKG_VERSION")))
            .redirect(reqwest::redirect::Policy::limited(10))
            .connect_timeout(timeout)
            .default_headers(headers)
            .build()?;

        Ok(Self { client, timeout })
    }

    /// Inactivity timeout applied to the request and to every body read
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    #[instrument(level = "debug", skip(self))]
    pub async fn inspect(&self, url: &str) -> Result<RemoteHead> {
        let response = tokio::time::timeout(self.timeout, self.client.head(url).send())
            .await
            .map_err(|_| TransferError::Timeout(self.timeout))??;

        if !response.status().is_success() {
            return Err(TransferError::Status(response.status()));
        }

        // reqwest reports a zero length for bodiless HEAD responses, read the header
        let headers = response.headers();
        let head = RemoteHead {
            content_length: header_str(headers, header::CONTENT_LENGTH)
                .and_then(|v| v.parse::<u64>().ok()),
            accept_ranges: header_str(headers, header::ACCEPT_RANGES)
                .is_some_and(|v| v.to_ascii_lowercase().contains("bytes")),
            content_type: header_str(headers, header::CONTENT_TYPE).and_then(mime_essence),
            filename: header_str(headers, header::CONTENT_DISPOSITION)
                .and_then(parse_content_disposition),
        };
        debug!(?head, "Inspected remote object");
        Ok(head)
    }

    /// Sends a GET, with a `Range` header when `range` is given.
    ///
    /// The status is left for the caller to interpret.
    #[instrument(level = "debug", skip(self, range), fields(range = ?range.map(|r| r.header_value())))]
    pub async fn fetch(&self, url: &str, range: Option<ByteRange>) -> Result<Response> {
        let mut request = self.client.get(url);
        if let Some(range) = range {
            request = request.header(header::RANGE, range.header_value());
        }

        let response = tokio::time::timeout(self.timeout, request.send())
            .await
            .map_err(|_| TransferError::Timeout(self.timeout))??;
        trace!(status = %response.status(), "Got response");
        Ok(response)
    }
}

pub fn header_str(headers: &HeaderMap, name: header::HeaderName) -> Option<&str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

/// Lowercased `type/subtype` without parameters
pub fn mime_essence(value: &str) -> Option<String> {
    let essence = value.split(';').next()?.trim().to_ascii_lowercase();
    (!essence.is_empty()).then_some(essence)
}

pub fn parse_content_range(value: &str) -> Option<ContentRange> {
    let caps = CONTENT_RANGE.captures(value.trim())?;
    let start = caps[1].parse().ok()?;
    let end = caps[2].parse().ok()?;
    let total = match &caps[3] {
        "*" => None,
        total => Some(total.parse().ok()?),
    };
    (start <= end).then_some(ContentRange { start, end, total })
}

/// Extracts a filename from a `Content-Disposition` header value.
///
/// The RFC 5987 `filename*` form wins over the plain one.
pub fn parse_content_disposition(content_disposition: &str) -> Option<String> {
    trace!(content_disposition = %content_disposition, "Parsing Content-Disposition");

    for param in content_disposition.split(';').map(str::trim) {
        let Some((name, value)) = param.split_once('=') else {
            continue;
        };
        if !name.trim().eq_ignore_ascii_case("filename*") {
            continue;
        }
        // charset'language'percent-encoded
        let Some(encoded) = value.trim().splitn(3, '\'').nth(2) else {
            continue;
        };
        if let Ok(decoded) = urlencoding::decode(encoded) {
            if !decoded.is_empty() {
                return Some(decoded.into_owned());
            }
        }
    }

    for param in content_disposition.split(';').map(str::trim) {
        let Some((name, value)) = param.split_once('=') else {
            continue;
        };
        if name.trim().eq_ignore_ascii_case("filename") {
            let value = value.trim().trim_matches('"');
            if !value.is_empty() {
                return Some(value.to_string());
            }
        }
    }

    None
}
