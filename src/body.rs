//! Body reconstruction for both capture backends.
//!
//! The protocol backend pulls a finished body from the host in one piece,
//! already flagged as base64 or text. The webRequest backend receives the
//! body as pushed chunks through a response filter and has to decide the
//! encoding itself from the declared content type.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use bytes::Bytes;
use regex::Regex;
use tracing::warn;

use crate::capture::host::ResponseFilter;
use crate::config::Config;
use crate::entry::BodyEncoding;
use crate::Result;

/// Decoded byte length of a base64 payload of `encoded_len` characters.
pub fn base64_decoded_len(encoded_len: usize) -> usize {
    (encoded_len * 3).div_ceil(4)
}

/// A body ready to be placed on either side of a [`crate::entry::CaptureEntry`].
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ReconstructedBody {
    pub body: Option<String>,
    pub encoding: BodyEncoding,
    pub size: usize,
    pub truncated: bool,
}

impl ReconstructedBody {
    /// Body the host declined to expose. Not an error.
    pub fn unavailable() -> Self {
        Self::default()
    }
}

/// Text/binary classification and size limiting.
#[derive(Debug, Clone)]
pub struct BodyPolicy {
    textual: Vec<Regex>,
    max_body_bytes: Option<usize>,
}

impl Default for BodyPolicy {
    fn default() -> Self {
        Self {
            textual: vec![Regex::new(crate::config::DEFAULT_TEXTUAL_CONTENT_TYPE)
                .expect("default textual pattern is valid")],
            max_body_bytes: None,
        }
    }
}

impl BodyPolicy {
    pub fn new(textual_patterns: &[String], max_body_bytes: Option<usize>) -> Result<Self> {
        let textual = textual_patterns
            .iter()
            .map(|pattern| Regex::new(pattern))
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(Self {
            textual,
            max_body_bytes,
        })
    }

    pub fn from_config(config: &Config) -> Result<Self> {
        Self::new(&config.textual_content_types, config.max_body_bytes)
    }

    pub fn max_body_bytes(&self) -> Option<usize> {
        self.max_body_bytes
    }

    pub fn is_textual(&self, content_type: &str) -> bool {
        let content_type = content_type.trim();
        content_type.is_empty() || self.textual.iter().any(|re| re.is_match(content_type))
    }

    /// Request bodies are always text when present.
    pub fn request_body(&self, body: Option<&str>) -> ReconstructedBody {
        match body {
            Some(text) if !text.is_empty() => {
                let (text, truncated) = self.limit_text(text);
                ReconstructedBody {
                    size: text.len(),
                    body: Some(text),
                    encoding: BodyEncoding::Text,
                    truncated,
                }
            }
            _ => ReconstructedBody::default(),
        }
    }

    /// Classify a body pulled from the protocol host.
    pub fn from_fetched(&self, body: Option<String>, base64_encoded: bool) -> ReconstructedBody {
        let Some(body) = body else {
            return ReconstructedBody::unavailable();
        };

        if base64_encoded {
            let (body, truncated) = self.limit_base64(body);
            return ReconstructedBody {
                size: base64_decoded_len(body.len()),
                body: Some(body),
                encoding: BodyEncoding::Base64,
                truncated,
            };
        }

        if body.is_empty() {
            return ReconstructedBody::unavailable();
        }

        let (body, truncated) = self.limit_text(&body);
        ReconstructedBody {
            size: body.len(),
            body: Some(body),
            encoding: BodyEncoding::Text,
            truncated,
        }
    }

    /// Classify raw bytes collected from a response filter.
    pub fn from_bytes(&self, bytes: &[u8], content_type: &str, truncated: bool) -> ReconstructedBody {
        let (bytes, limited) = match self.max_body_bytes {
            Some(max) if bytes.len() > max => (&bytes[..max], true),
            _ => (bytes, false),
        };

        let (body, encoding) = if self.is_textual(content_type) {
            (String::from_utf8_lossy(bytes).into_owned(), BodyEncoding::Text)
        } else {
            (STANDARD.encode(bytes), BodyEncoding::Base64)
        };

        ReconstructedBody {
            body: Some(body),
            encoding,
            size: bytes.len(),
            truncated: truncated || limited,
        }
    }

    fn limit_text(&self, text: &str) -> (String, bool) {
        match self.max_body_bytes {
            Some(max) if text.len() > max => {
                let mut end = max;
                while !text.is_char_boundary(end) {
                    end -= 1;
                }
                (text[..end].to_string(), true)
            }
            _ => (text.to_string(), false),
        }
    }

    fn limit_base64(&self, encoded: String) -> (String, bool) {
        let Some(max) = self.max_body_bytes else {
            return (encoded, false);
        };
        if base64_decoded_len(encoded.len()) <= max {
            return (encoded, false);
        }
        match STANDARD.decode(encoded.as_bytes()) {
            Ok(decoded) if decoded.len() > max => (STANDARD.encode(&decoded[..max]), true),
            Ok(_) => (encoded, false),
            Err(e) => {
                warn!("Leaving undecodable base64 body untruncated: {}", e);
                (encoded, false)
            }
        }
    }
}

/// Incremental body accumulator bound to one response filter.
///
/// Every chunk is written back through the filter unchanged so the page keeps
/// working, and a copy is kept for reconstruction. The filter is disconnected
/// when the accumulator is dropped, whichever way the stream ends.
pub struct StreamingBody {
    filter: Option<Box<dyn ResponseFilter>>,
    chunks: Vec<Bytes>,
    accumulated: usize,
    limit: Option<usize>,
    overflowed: bool,
    content_type: String,
}

impl std::fmt::Debug for StreamingBody {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamingBody")
            .field("chunks", &self.chunks.len())
            .field("accumulated", &self.accumulated)
            .field("overflowed", &self.overflowed)
            .field("content_type", &self.content_type)
            .finish()
    }
}

impl StreamingBody {
    pub fn new(filter: Box<dyn ResponseFilter>, content_type: String, limit: Option<usize>) -> Self {
        Self {
            filter: Some(filter),
            chunks: Vec::new(),
            accumulated: 0,
            limit,
            overflowed: false,
            content_type,
        }
    }

    pub fn accumulated(&self) -> usize {
        self.accumulated
    }

    /// Pass a chunk through to the page and keep a copy.
    pub fn on_data(&mut self, chunk: Bytes) -> Result<()> {
        let write_result = match self.filter.as_mut() {
            Some(filter) => filter.write(&chunk),
            None => Ok(()),
        };

        let keep = match self.limit {
            Some(limit) => {
                let room = limit.saturating_sub(self.accumulated);
                if chunk.len() > room {
                    self.overflowed = true;
                }
                chunk.slice(..chunk.len().min(room))
            }
            None => chunk,
        };
        if !keep.is_empty() {
            self.accumulated += keep.len();
            self.chunks.push(keep);
        }

        write_result
    }

    /// Concatenate the collected chunks and classify them.
    pub fn finish(mut self, policy: &BodyPolicy) -> ReconstructedBody {
        let mut merged = Vec::with_capacity(self.accumulated);
        for chunk in self.chunks.drain(..) {
            merged.extend_from_slice(&chunk);
        }
        policy.from_bytes(&merged, &self.content_type, self.overflowed)
    }

    fn disconnect(&mut self) {
        if let Some(mut filter) = self.filter.take() {
            filter.disconnect();
        }
    }
}

impl Drop for StreamingBody {
    fn drop(&mut self) {
        self.disconnect();
    }
}
