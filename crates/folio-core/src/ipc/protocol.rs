//! Line protocol between the supervisor and a renderer process.
//!
//! Requests are single JSON lines written to the renderer's stdin:
//!
//! ```text
//! {"html":"<h1>Hi</h1>","options":{"id":7,"timeout":15000,"type":"pdf"}}\n
//! ```
//!
//! A blank line is a no-op the renderer must ignore; the keepalive probe uses it.
//!
//! Responses are JSON objects found anywhere on the renderer's stdout. An
//! object carrying a `filename` key completes the job in flight; any other
//! object is advisory logging, and text that is not JSON is noise. Renderers
//! routinely print banners and diagnostics to stdout, so decoding never fails.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::Result;
use crate::job::RenderJob;

/// Frame written by the keepalive probe.
pub const KEEPALIVE_FRAME: &[u8] = b"\n";

/// Output buffered without a newline beyond this size is dropped as noise.
pub const MAX_PENDING_BYTES: usize = 100 * 1024 * 1024;

/// Correlation token linking a request to its response.
///
/// Renderers echo the token verbatim, so both JSON numbers and strings are
/// accepted on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum JobId {
    Number(u64),
    Text(String),
}

impl JobId {
    /// Generate a random token.
    pub fn generate() -> Self {
        Self::Text(uuid::Uuid::new_v4().to_string())
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Number(n) => write!(f, "{n}"),
            Self::Text(s) => f.write_str(s),
        }
    }
}

impl From<u64> for JobId {
    fn from(n: u64) -> Self {
        Self::Number(n)
    }
}

impl From<&str> for JobId {
    fn from(s: &str) -> Self {
        Self::Text(s.to_string())
    }
}

impl From<String> for JobId {
    fn from(s: String) -> Self {
        Self::Text(s)
    }
}

/// Artifact descriptor reported by the renderer when a job completes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Artifact {
    /// Path of the rendered file.
    pub filename: String,
    /// Id of the job that produced it.
    pub id: JobId,
}

/// Request envelope as read by a renderer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WireRequest {
    /// Document text.
    pub html: String,
    /// Job options.
    #[serde(default)]
    pub options: WireOptions,
}

/// The `options` object of a request.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WireOptions {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<JobId>,
    /// Job deadline in milliseconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<u64>,
    /// Renderer-specific fields.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl WireOptions {
    /// Look up a renderer-specific string option.
    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.extra.get(key).and_then(Value::as_str)
    }
}

#[derive(Serialize)]
struct OutboundRequest<'a> {
    html: &'a str,
    options: Map<String, Value>,
}

/// Encode a job as one newline-terminated request line.
///
/// `id` and `timeout` always reflect the job itself, overriding option
/// entries of the same name.
pub fn encode_job(job: &RenderJob) -> Result<Vec<u8>> {
    let mut options = job.options().clone();
    options.insert("id".to_string(), serde_json::to_value(job.id())?);
    if let Some(timeout) = job.timeout() {
        let millis = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX);
        options.insert("timeout".to_string(), Value::from(millis));
    }

    let mut line = serde_json::to_vec(&OutboundRequest {
        html: job.payload(),
        options,
    })?;
    line.push(b'\n');
    Ok(line)
}

/// Decode one request line (renderer side).
pub fn decode_request(line: &str) -> Result<WireRequest> {
    Ok(serde_json::from_str(line.trim())?)
}

/// Encode a completion line (renderer side).
pub fn encode_artifact(artifact: &Artifact) -> Result<Vec<u8>> {
    let mut line = serde_json::to_vec(artifact)?;
    line.push(b'\n');
    Ok(line)
}

/// One decoded piece of renderer output.
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    /// A completion envelope.
    Completed(Artifact),
    /// An object with a `filename` key that is not a valid completion.
    Malformed { reason: String, line: String },
    /// Any other JSON object, typically structured logging.
    Advisory(Value),
    /// Text that is not JSON.
    Noise(String),
}

/// Incremental decoder for renderer stdout.
///
/// Complete lines are scanned independently, so a garbled line can never
/// swallow the envelope on the next one. The unterminated tail is scanned
/// as well, since some renderers do not end their completion with a newline;
/// an object cut off mid-way is kept until more bytes arrive.
#[derive(Debug, Default)]
pub struct EnvelopeDecoder {
    buf: Vec<u8>,
}

impl EnvelopeDecoder {
    /// Create an empty decoder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a chunk of output and collect everything it completes.
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<Inbound> {
        self.buf.extend_from_slice(chunk);
        let mut out = Vec::new();

        while let Some(newline) = self.buf.iter().position(|&b| b == b'\n') {
            let line: Vec<u8> = self.buf.drain(..=newline).collect();
            scan(&line[..newline], true, &mut out);
        }

        let consumed = scan(&self.buf, false, &mut out);
        self.buf.drain(..consumed);

        if self.buf.len() > MAX_PENDING_BYTES {
            out.push(Inbound::Noise(format!(
                "<discarded {} bytes without a newline>",
                self.buf.len()
            )));
            self.buf.clear();
        }

        out
    }

    /// Flush whatever is buffered once the stream has ended.
    pub fn finish(&mut self) -> Vec<Inbound> {
        let rest = std::mem::take(&mut self.buf);
        let mut out = Vec::new();
        scan(&rest, true, &mut out);
        out
    }

    /// Number of buffered bytes not yet decoded.
    pub fn pending(&self) -> usize {
        self.buf.len()
    }
}

/// Scan a segment for JSON objects, returning the number of bytes consumed.
fn scan(segment: &[u8], terminated: bool, out: &mut Vec<Inbound>) -> usize {
    let mut cursor = 0;
    let mut noise_start = 0;

    while let Some(offset) = segment[cursor..].iter().position(|&b| b == b'{') {
        let start = cursor + offset;
        let mut values = serde_json::Deserializer::from_slice(&segment[start..]).into_iter::<Value>();
        match values.next() {
            Some(Ok(value)) => {
                let end = start + values.byte_offset();
                push_noise(&segment[noise_start..start], out);
                out.push(classify(value, &segment[start..end]));
                cursor = end;
                noise_start = end;
            }
            Some(Err(e)) if e.is_eof() && !terminated => {
                push_noise(&segment[noise_start..start], out);
                return start;
            }
            _ => cursor = start + 1,
        }
    }

    push_noise(&segment[noise_start..], out);
    segment.len()
}

fn push_noise(bytes: &[u8], out: &mut Vec<Inbound>) {
    let text = String::from_utf8_lossy(bytes);
    let text = text.trim();
    if !text.is_empty() {
        out.push(Inbound::Noise(text.to_string()));
    }
}

fn classify(value: Value, raw: &[u8]) -> Inbound {
    let is_completion = value
        .as_object()
        .is_some_and(|object| object.contains_key("filename"));
    if !is_completion {
        return Inbound::Advisory(value);
    }

    match serde_json::from_value::<Artifact>(value) {
        Ok(artifact) => Inbound::Completed(artifact),
        Err(e) => Inbound::Malformed {
            reason: e.to_string(),
            line: String::from_utf8_lossy(raw).into_owned(),
        },
    }
}
