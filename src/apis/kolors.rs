use std::env;
use std::error::Error;
use std::fmt;
use std::time::Duration;

use futures_util::StreamExt;
use reqwest::header::{ACCEPT, ACCEPT_LANGUAGE, CONTENT_TYPE, ORIGIN, REFERER};
use reqwest::{RequestBuilder, Response, StatusCode, multipart};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;
use tokio::time::timeout;

use crate::utilities::session_hash;

const SPACE_URL: &str = "https://kwai-kolors-kolors.hf.space";
const TOKEN_URL: &str = "https://huggingface.co/api/spaces/Kwai-Kolors/Kolors/jwt";
const POLL_TIMEOUT: Duration = Duration::from_secs(3);

const TOKEN_HEADER: &str = "x-zerogpu-token";
const DATA_PREFIX: &str = "data: ";

// Positional arguments of the remote predict call, in the order its signature
// expects them: prompt, reference image, IP-Adapter scale, negative prompt,
// seed, randomize-seed flag, width, height, guidance scale, inference steps.
// The values and both identifying indices below are fixed by the deployed
// space and must not change.
type PredictArgs<'a> = (&'a str, FileData<'a>, f64, &'a str, u32, bool, u32, u32, u32, u32);

const IP_ADAPTER_SCALE: f64 = 0.3;
const NEGATIVE_PROMPT: &str = "";
const SEED: u32 = 0;
const RANDOMIZE_SEED: bool = true;
const IMAGE_WIDTH: u32 = 1024;
const IMAGE_HEIGHT: u32 = 1536;
const GUIDANCE_SCALE: u32 = 5;
const INFERENCE_STEPS: u32 = 25;
const FN_INDEX: u32 = 2;
const TRIGGER_ID: u32 = 26;

const ASSET_NAME: &str = "image.webp";
const ASSET_MIME_TYPE: &str = "image/webp";
const ASSET_SIZE: u64 = 172_602;

pub struct KolorsConfig {
    pub space_url: String,
    pub token_url: String,
    pub poll_timeout: Duration,
}

impl Default for KolorsConfig {
    fn default() -> Self {
        Self {
            space_url: SPACE_URL.to_string(),
            token_url: TOKEN_URL.to_string(),
            poll_timeout: POLL_TIMEOUT,
        }
    }
}

impl KolorsConfig {
    /// default endpoints with `KOLORS_SPACE_URL`, `KOLORS_TOKEN_URL` and
    /// `KOLORS_POLL_TIMEOUT` (seconds) overrides applied
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(space_url) = env::var("KOLORS_SPACE_URL") {
            config.space_url = space_url.trim_end_matches('/').to_string();
        }

        if let Ok(token_url) = env::var("KOLORS_TOKEN_URL") {
            config.token_url = token_url;
        }

        if let Some(seconds) =
            env::var("KOLORS_POLL_TIMEOUT").ok().and_then(|value| value.parse().ok())
        {
            config.poll_timeout = Duration::from_secs(seconds);
        }

        config
    }

    fn referer(&self) -> String {
        format!("{}/?__theme=dark", self.space_url)
    }
}

pub struct Kolors {
    http_client: reqwest::Client,
    config: KolorsConfig,
}

#[derive(Debug, PartialEq, Eq)]
pub enum PollOutcome {
    /// the artifact URL from the first completed event
    Completed(String),
    /// nothing completed within the timeout; poll again with this handle
    Pending(String),
}

#[derive(Debug)]
pub enum KolorsError {
    Upstream(reqwest::Error),
    Server(StatusCode),
    BadEvent(serde_json::Error),
    StreamEnded,
    EmptyUpload,
}

impl fmt::Display for KolorsError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Upstream(err) => write!(f, "upstream request failed: {err}"),
            Self::Server(status) => write!(f, "the space is currently offline ({status})"),
            Self::BadEvent(err) => write!(f, "unreadable queue event: {err}"),
            Self::StreamEnded => write!(f, "stream ended without completion"),
            Self::EmptyUpload => write!(f, "upload acknowledged without a stored path"),
        }
    }
}

impl Error for KolorsError {}

impl From<reqwest::Error> for KolorsError {
    fn from(err: reqwest::Error) -> Self {
        Self::Upstream(err)
    }
}

trait DetectServerError {
    fn server_error(self) -> Result<Response, KolorsError>;
}

impl DetectServerError for Response {
    fn server_error(self) -> Result<Response, KolorsError> {
        if self.status().is_server_error()
            && self.headers().get(CONTENT_TYPE).is_some_and(|header| {
                header.to_str().is_ok_and(|header| header.starts_with("text/html"))
            })
        {
            return Err(KolorsError::Server(self.status()));
        }

        Ok(self)
    }
}

#[derive(Deserialize)]
struct TokenResponse {
    token: String,
}

#[derive(Serialize)]
struct QueueJoinPayload<'a> {
    data: PredictArgs<'a>,
    event_data: Option<()>,
    fn_index: u32,
    trigger_id: u32,
    session_hash: &'a str,
}

#[derive(Serialize)]
struct FileData<'a> {
    path: &'a str,
    url: String,
    orig_name: &'a str,
    size: u64,
    mime_type: &'a str,
    meta: FileMeta,
}

#[derive(Serialize)]
struct FileMeta {
    #[serde(rename = "_type")]
    kind: &'static str,
}

#[derive(Deserialize)]
#[serde(tag = "msg")]
enum QueueEvent {
    #[serde(rename = "process_completed")]
    ProcessCompleted { output: Option<QueueOutput> },
    #[serde(other)]
    Other,
}

#[derive(Deserialize)]
struct QueueOutput {
    #[serde(default)]
    data: Vec<QueueFile>,
}

#[derive(Deserialize)]
struct QueueFile {
    url: String,
}

impl Kolors {
    pub fn new(http_client: reqwest::Client, config: KolorsConfig) -> Self {
        Self { http_client, config }
    }

    /// queues one job; the returned session handle is the only key correlating
    /// it with later polls
    pub async fn submit_job(&self, prompt: &str, asset_path: &str) -> Result<String, KolorsError> {
        let session_hash = session_hash::generate();
        let token = self.fetch_token().await?;

        self.join_queue(&session_hash, asset_path, &token, prompt).await?;

        Ok(session_hash)
    }

    /// fetches a fresh short-lived token; one per submission, never cached
    pub async fn fetch_token(&self) -> Result<String, KolorsError> {
        let expiration = OffsetDateTime::now_utc().format(&Rfc3339).unwrap();

        let response = self
            .with_common_headers(self.http_client.get(&self.config.token_url))
            .query(&[("expiration", expiration.as_str())])
            .header(ACCEPT, "*/*")
            .send()
            .await?
            .server_error()?
            .error_for_status()?
            .json::<TokenResponse>()
            .await?;

        Ok(response.token)
    }

    pub async fn upload_image(&self, image: Vec<u8>) -> Result<String, KolorsError> {
        let part =
            multipart::Part::bytes(image).file_name(ASSET_NAME).mime_str(ASSET_MIME_TYPE)?;
        let form = multipart::Form::new().part("image", part);

        let paths = self
            .with_common_headers(
                self.http_client.post(format!("{}/upload", self.config.space_url)),
            )
            .query(&[("upload_id", session_hash::generate())])
            .header(ACCEPT, "*/*")
            .multipart(form)
            .send()
            .await?
            .server_error()?
            .error_for_status()?
            .json::<Vec<String>>()
            .await?;

        paths.into_iter().next().ok_or(KolorsError::EmptyUpload)
    }

    pub async fn join_queue(
        &self,
        session_hash: &str,
        asset_path: &str,
        token: &str,
        prompt: &str,
    ) -> Result<String, KolorsError> {
        let payload = QueueJoinPayload {
            data: (
                prompt,
                self.file_data(asset_path),
                IP_ADAPTER_SCALE,
                NEGATIVE_PROMPT,
                SEED,
                RANDOMIZE_SEED,
                IMAGE_WIDTH,
                IMAGE_HEIGHT,
                GUIDANCE_SCALE,
                INFERENCE_STEPS,
            ),
            event_data: None,
            fn_index: FN_INDEX,
            trigger_id: TRIGGER_ID,
            session_hash,
        };

        let response = self
            .with_common_headers(
                self.http_client.post(format!("{}/queue/join", self.config.space_url)),
            )
            .query(&[("__theme", "dark")])
            .header(ACCEPT, "*/*")
            .header(TOKEN_HEADER, token)
            .json(&payload)
            .send()
            .await?
            .server_error()?
            .error_for_status()?
            .text()
            .await?;

        log::debug!("queue join acknowledged: {response}");

        Ok(response)
    }

    /// Waits on the event stream for the first completed event carrying an
    /// output. When the timeout fires first, the session handle comes back as
    /// a sentinel meaning the job is still queued and should be polled again.
    pub async fn poll_job(&self, session_hash: &str) -> Result<PollOutcome, KolorsError> {
        let response = self
            .with_common_headers(
                self.http_client.get(format!("{}/queue/data", self.config.space_url)),
            )
            .query(&[("session_hash", session_hash)])
            .header(ACCEPT, "text/event-stream")
            .send()
            .await?
            .server_error()?
            .error_for_status()?;

        let completed = async {
            let mut stream = response.bytes_stream();
            let mut buffer = Vec::new();

            while let Some(chunk) = stream.next().await {
                buffer.extend_from_slice(&chunk?);

                while let Some(line) = next_line(&mut buffer) {
                    if let Some(url) = completed_url(&line)? {
                        return Ok(url);
                    }
                }
            }

            Err(KolorsError::StreamEnded)
        };

        // Dropping the unfinished future on timeout tears the stream down;
        // every other exit finishes the future, which cancels the timer.
        match timeout(self.config.poll_timeout, completed).await {
            Ok(result) => result.map(PollOutcome::Completed),
            Err(_) => Ok(PollOutcome::Pending(session_hash.to_string())),
        }
    }

    fn with_common_headers(&self, request: RequestBuilder) -> RequestBuilder {
        request
            .header(ACCEPT_LANGUAGE, "en-US,en;q=0.9")
            .header("priority", "u=1, i")
            .header(REFERER, self.config.referer())
            .header(ORIGIN, self.config.space_url.as_str())
    }

    fn file_data<'a>(&self, asset_path: &'a str) -> FileData<'a> {
        FileData {
            path: asset_path,
            url: format!("{}/file={asset_path}", self.config.space_url),
            orig_name: ASSET_NAME,
            size: ASSET_SIZE,
            mime_type: ASSET_MIME_TYPE,
            meta: FileMeta { kind: "gradio.FileData" },
        }
    }
}

/// splits the next full line off the front of the buffer, if one has formed
fn next_line(buffer: &mut Vec<u8>) -> Option<String> {
    let index = buffer.iter().position(|&byte| byte == b'\n')?;
    let line = buffer.drain(..=index).collect::<Vec<_>>();

    Some(String::from_utf8_lossy(&line).trim_end().to_string())
}

/// reads one stream line; `Some(url)` only for a completed event with output
fn completed_url(line: &str) -> Result<Option<String>, KolorsError> {
    let Some(data) = line.strip_prefix(DATA_PREFIX) else {
        return Ok(None);
    };

    log::debug!("queue event: {data}");

    match serde_json::from_str(data).map_err(KolorsError::BadEvent)? {
        QueueEvent::ProcessCompleted { output } => Ok(output
            .map(|output| output.data)
            .unwrap_or_default()
            .into_iter()
            .next()
            .map(|file| file.url)),
        QueueEvent::Other => Ok(None),
    }
}
