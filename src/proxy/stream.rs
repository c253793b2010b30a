//! Translation of the upstream chat event stream into OpenAI chunks.
//!
//! Everything here is lazy: nothing is read from the upstream connection
//! until the client pulls the next frame, and dropping the stream drops the
//! upstream response (which releases its connection).

use std::convert::Infallible;
use std::fmt::Display;

use async_stream::stream;
use axum::body::Body;
use axum::http::header::{CACHE_CONTROL, CONTENT_TYPE};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use futures_util::{Stream, StreamExt, pin_mut};
use serde_json::Value;
use tracing::{error, info, warn};

use crate::logging::{http_debug_options, make_body_preview};
use crate::openai::ChatChunk;
use crate::upstream::UpstreamClient;

/// One outbound SSE frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Chunk(ChatChunk),
    Done,
}

impl Frame {
    pub fn to_sse(&self) -> String {
        match self {
            Frame::Chunk(chunk) => match serde_json::to_string(chunk) {
                Ok(json) => format!("data: {json}\n\n"),
                Err(err) => {
                    error!("failed to serialize chunk {}: {}", chunk.id, err);
                    String::new()
                }
            },
            Frame::Done => "data: [DONE]\n\n".to_string(),
        }
    }
}

/// Identity shared by every chunk of one response.
#[derive(Debug, Clone)]
pub struct StreamContext {
    pub completion_id: String,
    pub model: String,
}

impl StreamContext {
    fn error_chunk(&self, message: &str) -> Frame {
        Frame::Chunk(ChatChunk::error(&self.completion_id, &self.model, message))
    }

    fn trailer(&self) -> [Frame; 2] {
        [
            Frame::Chunk(ChatChunk::stop(&self.completion_id, &self.model)),
            Frame::Done,
        ]
    }
}

/// What one upstream line means for the translator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpstreamEvent {
    /// Not a data line, an empty payload, or nothing we act on.
    Skip,
    Malformed(String),
    Error(String),
    End,
    Text(String),
}

fn is_zero_code(code: Option<&Value>) -> bool {
    match code {
        Some(Value::Number(n)) => n.as_i64() == Some(0) || n.as_f64() == Some(0.0),
        Some(Value::String(s)) => s.trim() == "0",
        _ => false,
    }
}

pub fn parse_line(line: &str) -> UpstreamEvent {
    let Some(data) = line.strip_prefix("data:") else {
        return UpstreamEvent::Skip;
    };
    let data = data.trim();
    if data.is_empty() || data == "[DONE]" {
        return UpstreamEvent::Skip;
    }

    let json = match serde_json::from_str::<Value>(data) {
        Ok(v @ Value::Object(_)) => v,
        Ok(_) => return UpstreamEvent::Malformed("not a JSON object".to_string()),
        Err(err) => return UpstreamEvent::Malformed(err.to_string()),
    };

    // A missing code counts as non-zero.
    if let Some(err) = json.get("error").filter(|e| !e.is_null())
        && !is_zero_code(json.get("code"))
    {
        let message = match err {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        };
        return UpstreamEvent::Error(message);
    }

    let Some(delta) = json.get("message").and_then(|m| m.get("delta")) else {
        return UpstreamEvent::Skip;
    };
    if delta.get("type").and_then(Value::as_str) == Some("status")
        && delta.get("status").and_then(Value::as_str) == Some("end")
    {
        return UpstreamEvent::End;
    }
    match delta.get("text").and_then(Value::as_str) {
        Some(text) => UpstreamEvent::Text(text.to_string()),
        None => UpstreamEvent::Skip,
    }
}

/// Split a byte stream into lines ending in `\n`, `\r` or `\r\n`, decoding
/// each line lossily. A trailing line without a terminator is still emitted.
/// The first transport error is passed through and ends the stream.
pub fn upstream_lines<S, B, E>(bytes: S) -> impl Stream<Item = Result<String, E>> + Send
where
    S: Stream<Item = Result<B, E>> + Send,
    B: AsRef<[u8]> + Send,
    E: Send,
{
    stream! {
        pin_mut!(bytes);
        let mut buf: Vec<u8> = Vec::new();
        // A `\r` ended the previous line; a `\n` right after it is the same
        // terminator, even when it arrives in the next chunk.
        let mut after_cr = false;
        while let Some(item) = bytes.next().await {
            let chunk = match item {
                Ok(chunk) => chunk,
                Err(err) => {
                    yield Err(err);
                    return;
                }
            };

            let mut ready = Vec::new();
            for &b in chunk.as_ref() {
                if std::mem::take(&mut after_cr) && b == b'\n' {
                    continue;
                }
                match b {
                    b'\n' | b'\r' => {
                        after_cr = b == b'\r';
                        ready.push(String::from_utf8_lossy(&buf).into_owned());
                        buf.clear();
                    }
                    _ => buf.push(b),
                }
            }
            for line in ready {
                yield Ok(line);
            }
        }
        if !buf.is_empty() {
            yield Ok(String::from_utf8_lossy(&buf).into_owned());
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TranslatorState {
    AwaitingFirstContent,
    StreamingContent,
    Ended,
    Errored,
}

/// Drive the translator state machine over upstream lines and close with the
/// `stop` chunk plus `[DONE]`, whatever ended the loop.
pub fn translate<S, E>(lines: S, ctx: StreamContext) -> impl Stream<Item = Frame> + Send
where
    S: Stream<Item = Result<String, E>> + Send,
    E: Display + Send,
{
    stream! {
        pin_mut!(lines);
        let mut state = TranslatorState::AwaitingFirstContent;

        while let Some(item) = lines.next().await {
            let line = match item {
                Ok(line) => line,
                Err(err) => {
                    error!("upstream stream error for {}: {}", ctx.completion_id, err);
                    yield ctx.error_chunk(&format!("An unexpected error occurred: {err}"));
                    state = TranslatorState::Errored;
                    break;
                }
            };

            match parse_line(&line) {
                UpstreamEvent::Skip => {}
                UpstreamEvent::Malformed(reason) => {
                    warn!("could not parse stream chunk: {}. Raw chunk: {}", reason, line);
                }
                UpstreamEvent::Error(message) => {
                    error!("upstream API returned an error in stream: {}", message);
                    yield ctx.error_chunk(&message);
                    state = TranslatorState::Errored;
                    break;
                }
                UpstreamEvent::End => {
                    state = TranslatorState::Ended;
                    break;
                }
                UpstreamEvent::Text(text) => {
                    if state == TranslatorState::AwaitingFirstContent {
                        yield Frame::Chunk(ChatChunk::role(&ctx.completion_id, &ctx.model));
                        state = TranslatorState::StreamingContent;
                    }
                    yield Frame::Chunk(ChatChunk::content(&ctx.completion_id, &ctx.model, text));
                }
            }
        }

        for frame in ctx.trailer() {
            yield frame;
        }
        info!("stream finished for request {} ({:?})", ctx.completion_id, state);
    }
}

/// Open the upstream chat call and translate it. Connection failures and
/// non-200 statuses become a single in-band error chunk before the trailer.
pub fn chat_frames(
    upstream: UpstreamClient,
    headers: HeaderMap,
    body: Value,
    ctx: StreamContext,
) -> impl Stream<Item = Frame> + Send + 'static {
    stream! {
        let resp = match upstream.open_chat(headers, &body).await {
            Ok(resp) => resp,
            Err(err) => {
                error!(
                    "upstream chat request to {} failed for {}: {}",
                    upstream.base_url(),
                    ctx.completion_id,
                    err
                );
                yield ctx.error_chunk(&format!("An unexpected error occurred: {err}"));
                for frame in ctx.trailer() {
                    yield frame;
                }
                return;
            }
        };

        let status = resp.status();
        if status != StatusCode::OK {
            let body = match resp.bytes().await {
                Ok(b) => b.to_vec(),
                Err(err) => {
                    warn!("failed to read upstream error body: {}", err);
                    Vec::new()
                }
            };
            error!(
                "upstream returned status {} for {}: {}",
                status.as_u16(),
                ctx.completion_id,
                make_body_preview(&body, http_debug_options().max_body_bytes)
            );
            let message = format!(
                "Upstream API returned status code {}: {}",
                status.as_u16(),
                String::from_utf8_lossy(&body)
            );
            yield ctx.error_chunk(&message);
            for frame in ctx.trailer() {
                yield frame;
            }
            return;
        }

        let frames = translate(upstream_lines(resp.bytes_stream()), ctx);
        pin_mut!(frames);
        while let Some(frame) = frames.next().await {
            yield frame;
        }
    }
}

/// Wrap frames as a `text/event-stream` response. The HTTP status is always
/// 200; failures travel inside the stream.
pub fn sse_response<S>(frames: S) -> Response
where
    S: Stream<Item = Frame> + Send + 'static,
{
    let body = Body::from_stream(frames.map(|frame| Ok::<_, Infallible>(frame.to_sse())));
    (
        [(CONTENT_TYPE, "text/event-stream"), (CACHE_CONTROL, "no-cache")],
        body,
    )
        .into_response()
}
