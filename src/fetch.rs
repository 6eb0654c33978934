use std::fs;
use std::io::{Read, Write};
use std::thread;
use std::time::Duration;

use camino::{Utf8Path, Utf8PathBuf};
use reqwest::blocking::Client;
use reqwest::header::{HeaderMap, HeaderValue, USER_AGENT};
use serde::Serialize;
use tracing::{info, warn};

use crate::config::HttpSettings;
use crate::error::FetchError;
use crate::layout::{ensure_parent, non_empty_file, partial_path_for, remove_if_exists};
use crate::progress::{ProgressTracker, Stage};

pub const CHUNK_BYTES: usize = 1 << 20;

pub struct RemoteBody {
    pub content_length: Option<u64>,
    pub reader: Box<dyn Read + Send>,
}

pub trait DatasetSource: Send + Sync {
    fn open(&self, url: &str) -> Result<RemoteBody, FetchError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum FetchAction {
    Cached,
    Downloaded,
}

#[derive(Debug, Clone, Serialize)]
pub struct RawDataset {
    pub path: Utf8PathBuf,
    pub bytes: u64,
    pub action: FetchAction,
}

#[derive(Clone)]
pub struct HttpSource {
    client: Client,
    max_retries: usize,
}

impl HttpSource {
    pub fn new(settings: HttpSettings) -> Result<Self, FetchError> {
        let mut headers = HeaderMap::new();
        headers.insert(
            USER_AGENT,
            HeaderValue::from_str(&format!("effectifs-etl/{}", env!("CARGO_PKG_VERSION")))
                .map_err(|err| FetchError::Http(err.to_string()))?,
        );
        // The export streams for minutes; only the connection phase is bounded.
        let client = Client::builder()
            .default_headers(headers)
            .connect_timeout(Duration::from_secs(settings.connect_timeout_secs))
            .timeout(None::<Duration>)
            .build()
            .map_err(|err| FetchError::Http(err.to_string()))?;
        Ok(Self {
            client,
            max_retries: settings.max_retries,
        })
    }

    fn handle_status(
        response: reqwest::blocking::Response,
    ) -> Result<reqwest::blocking::Response, FetchError> {
        if response.status().is_success() {
            return Ok(response);
        }
        let status = response.status().as_u16();
        let message = response
            .text()
            .map(|body| body.chars().take(512).collect())
            .unwrap_or_else(|_| "download request failed".to_string());
        Err(FetchError::Status { status, message })
    }

    fn send_with_retries(&self, url: &str) -> Result<reqwest::blocking::Response, FetchError> {
        const BASE_DELAY_MS: u64 = 500;
        let mut attempt = 0usize;
        loop {
            match self.client.get(url).send() {
                Ok(resp) => {
                    let status = resp.status().as_u16();
                    if attempt < self.max_retries && is_retryable_status(status) {
                        let delay = BASE_DELAY_MS * (attempt as u64 + 1);
                        warn!(status, attempt, delay_ms = delay, "retrying dataset request");
                        thread::sleep(Duration::from_millis(delay));
                        attempt += 1;
                        continue;
                    }
                    return Ok(resp);
                }
                Err(err) => {
                    if attempt < self.max_retries && is_retryable_error(&err) {
                        let delay = BASE_DELAY_MS * (attempt as u64 + 1);
                        warn!(error = %err, attempt, delay_ms = delay, "retrying dataset request");
                        thread::sleep(Duration::from_millis(delay));
                        attempt += 1;
                        continue;
                    }
                    return Err(FetchError::Http(err.to_string()));
                }
            }
        }
    }
}

impl DatasetSource for HttpSource {
    fn open(&self, url: &str) -> Result<RemoteBody, FetchError> {
        let response = self.send_with_retries(url)?;
        let response = Self::handle_status(response)?;
        Ok(RemoteBody {
            content_length: response.content_length(),
            reader: Box::new(response),
        })
    }
}

fn is_retryable_status(status: u16) -> bool {
    matches!(status, 429 | 500 | 502 | 503 | 504)
}

fn is_retryable_error(err: &reqwest::Error) -> bool {
    err.is_timeout() || err.is_connect()
}

pub fn ensure_raw_dataset(
    destination: &Utf8Path,
    source_url: &str,
    force: bool,
    source: &dyn DatasetSource,
    tracker: &ProgressTracker,
) -> Result<RawDataset, FetchError> {
    if !force && non_empty_file(destination) {
        let bytes = fs::metadata(destination.as_std_path())
            .map(|meta| meta.len())
            .map_err(|err| FetchError::Io(err.to_string()))?;
        info!(path = %destination, bytes, "raw dataset already present");
        tracker.report(
            Stage::Fetching,
            Some(100.0),
            format!("raw dataset already present: {destination}"),
        );
        return Ok(RawDataset {
            path: destination.to_owned(),
            bytes,
            action: FetchAction::Cached,
        });
    }

    ensure_parent(destination).map_err(|err| FetchError::Io(err.to_string()))?;
    // A partial file left by an abandoned run is truncated and reused.
    let part_path = partial_path_for(destination);

    info!(url = source_url, "downloading raw dataset");
    tracker.report(Stage::Fetching, Some(0.0), format!("connecting to {source_url}"));
    let written = match download_to(&part_path, source, source_url, tracker) {
        Ok(written) => written,
        Err(err) => {
            if let Err(cleanup) = remove_if_exists(&part_path) {
                warn!(path = %part_path, error = %cleanup, "failed to remove partial download");
            }
            return Err(err);
        }
    };
    fs::rename(part_path.as_std_path(), destination.as_std_path())
        .map_err(|err| FetchError::Io(err.to_string()))?;

    info!(path = %destination, bytes = written, "raw dataset downloaded");
    tracker.report(
        Stage::Fetching,
        Some(100.0),
        format!("downloaded {} to {destination}", format_bytes(written)),
    );
    Ok(RawDataset {
        path: destination.to_owned(),
        bytes: written,
        action: FetchAction::Downloaded,
    })
}

// Fills as much of `buf` as the stream allows so progress ticks once per full chunk.
fn download_to(
    part_path: &Utf8Path,
    source: &dyn DatasetSource,
    source_url: &str,
    tracker: &ProgressTracker,
) -> Result<u64, FetchError> {
    let body = source.open(source_url)?;
    let total = body.content_length.filter(|len| *len > 0);
    let mut reader = body.reader;
    let mut file = fs::File::create(part_path.as_std_path())
        .map_err(|err| FetchError::Io(err.to_string()))?;

    let mut buf = vec![0u8; CHUNK_BYTES];
    let mut written = 0u64;
    loop {
        let read = read_chunk(&mut reader, &mut buf)?;
        if read == 0 {
            break;
        }
        file.write_all(&buf[..read])
            .map_err(|err| FetchError::Io(err.to_string()))?;
        written += read as u64;
        report_transfer(tracker, written, total);
    }

    if let Some(expected) = total {
        if written != expected {
            return Err(FetchError::Http(format!(
                "transfer truncated: received {written} of {expected} bytes"
            )));
        }
    }
    if written == 0 {
        return Err(FetchError::Http("empty response body".to_string()));
    }
    file.sync_all().map_err(|err| FetchError::Io(err.to_string()))?;
    Ok(written)
}

fn read_chunk(reader: &mut dyn Read, buf: &mut [u8]) -> Result<usize, FetchError> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(read) => filled += read,
            Err(err) if err.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(err) => return Err(FetchError::Http(err.to_string())),
        }
    }
    Ok(filled)
}

fn report_transfer(tracker: &ProgressTracker, written: u64, total: Option<u64>) {
    match total {
        Some(total) => {
            let percent = (written as f64 / total as f64 * 100.0) as f32;
            tracker.report(
                Stage::Fetching,
                Some(percent),
                format!(
                    "downloaded {} of {}",
                    format_bytes(written),
                    format_bytes(total)
                ),
            );
        }
        None => {
            tracker.report(
                Stage::Fetching,
                None,
                format!("downloaded {} (size unknown)", format_bytes(written)),
            );
        }
    }
}

pub fn format_bytes(bytes: u64) -> String {
    const MIB: f64 = (1u64 << 20) as f64;
    if bytes >= 1 << 20 {
        format!("{:.1} MiB", bytes as f64 / MIB)
    } else {
        format!("{bytes} B")
    }
}
