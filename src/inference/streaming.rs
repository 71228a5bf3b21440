//! Response parsing for OpenAI-compatible chat completions.
//!
//! Reads a `reqwest::Response` as a byte stream, splits on SSE boundaries
//! (`data: …\n\n`), parses each chunk as JSON, and yields the text deltas.
//! The non-streaming parser handles a full completion body.

use std::fmt::Display;

use futures::stream::{self, Stream, StreamExt};

use super::errors::InferenceError;
use super::types::{ChatCompletionChunk, ChatCompletionResponse};

// ─── SSE Stream ──────────────────────────────────────────────────────────────

/// Parse an SSE completion body into a stream of text deltas.
///
/// Keep-alives, empty deltas, and the `[DONE]` marker yield nothing.
pub fn parse_sse_stream(
    response: reqwest::Response,
) -> impl Stream<Item = Result<String, InferenceError>> {
    sse_text_stream(response.bytes_stream())
}

/// Decode SSE events from raw body chunks.
///
/// Network chunks can end in the middle of a UTF-8 sequence, so bytes are
/// buffered and only complete events are decoded.
fn sse_text_stream<S, B, E>(byte_stream: S) -> impl Stream<Item = Result<String, InferenceError>>
where
    S: Stream<Item = Result<B, E>> + Unpin,
    B: AsRef<[u8]>,
    E: Display,
{
    stream::unfold(
        (byte_stream, Vec::<u8>::new(), false),
        |(mut byte_stream, mut buffer, mut done)| async move {
            loop {
                if done {
                    return None;
                }

                if let Some((event_end, separator_len)) = find_event_boundary(&buffer) {
                    let event: Vec<u8> = buffer.drain(..event_end + separator_len).collect();
                    let event = String::from_utf8_lossy(&event[..event_end]).replace("\r\n", "\n");

                    match process_event(&event) {
                        Ok(SseEvent::Text(text)) => {
                            return Some((Ok(text), (byte_stream, buffer, done)))
                        }
                        Ok(SseEvent::Done) => {
                            done = true;
                            continue;
                        }
                        Ok(SseEvent::Skip) => continue,
                        Err(e) => return Some((Err(e), (byte_stream, buffer, done))),
                    }
                }

                match byte_stream.next().await {
                    Some(Ok(bytes)) => buffer.extend_from_slice(bytes.as_ref()),
                    Some(Err(e)) => {
                        done = true;
                        return Some((
                            Err(InferenceError::StreamError {
                                reason: format!("stream read error: {e}"),
                            }),
                            (byte_stream, buffer, done),
                        ));
                    }
                    None => {
                        // Trailing event without the final blank line.
                        done = true;
                        let rest = String::from_utf8_lossy(&std::mem::take(&mut buffer))
                            .replace("\r\n", "\n");
                        match process_event(rest.trim()) {
                            Ok(SseEvent::Text(text)) => {
                                return Some((Ok(text), (byte_stream, buffer, done)))
                            }
                            Ok(_) => return None,
                            Err(e) => return Some((Err(e), (byte_stream, buffer, done))),
                        }
                    }
                }
            }
        },
    )
}

/// Position and length of the first event separator. SSE frames use
/// `\n\n`; some servers send `\r\n\r\n`.
fn find_event_boundary(buffer: &[u8]) -> Option<(usize, usize)> {
    let lf = buffer.windows(2).position(|w| w == b"\n\n").map(|i| (i, 2));
    let crlf = buffer.windows(4).position(|w| w == b"\r\n\r\n").map(|i| (i, 4));
    match (lf, crlf) {
        (Some(a), Some(b)) => Some(if b.0 < a.0 { b } else { a }),
        (a, b) => a.or(b),
    }
}

#[derive(Debug, PartialEq)]
enum SseEvent {
    Text(String),
    Done,
    Skip,
}

/// Process a single SSE event string (may contain multiple `data:` lines).
fn process_event(event: &str) -> Result<SseEvent, InferenceError> {
    let mut data_content = String::new();

    for line in event.lines() {
        if let Some(data) = line.strip_prefix("data: ").or_else(|| line.strip_prefix("data:")) {
            let data = data.trim();
            if data == "[DONE]" {
                return Ok(SseEvent::Done);
            }
            data_content.push_str(data);
        }
    }

    if data_content.is_empty() {
        return Ok(SseEvent::Skip);
    }

    let chunk: ChatCompletionChunk =
        serde_json::from_str(&data_content).map_err(|e| InferenceError::StreamError {
            reason: format!("failed to parse SSE chunk: {e} (data: {data_content})"),
        })?;

    let text = chunk
        .choices
        .into_iter()
        .next()
        .and_then(|c| c.delta.content)
        .filter(|c| !c.is_empty());

    Ok(match text {
        Some(text) => SseEvent::Text(text),
        None => SseEvent::Skip,
    })
}

// ─── Non-streaming ───────────────────────────────────────────────────────────

/// Extract the reply text from a non-streaming completion body.
///
/// Only `content` is used. Reasoning models that spend their whole token
/// budget thinking return empty content; that is reported as malformed so
/// the caller can fall back.
pub fn parse_non_streaming_response(body: &str) -> Result<String, InferenceError> {
    let resp: ChatCompletionResponse =
        serde_json::from_str(body).map_err(|e| InferenceError::MalformedResponse {
            reason: format!("failed to parse completion body: {e}"),
        })?;

    let choice = resp
        .choices
        .into_iter()
        .next()
        .ok_or_else(|| InferenceError::MalformedResponse {
            reason: "empty choices array".into(),
        })?;

    match choice.message.content.filter(|c| !c.trim().is_empty()) {
        Some(content) => Ok(content),
        None => Err(InferenceError::MalformedResponse {
            reason: format!(
                "empty content (finish_reason: {})",
                choice.finish_reason.as_deref().unwrap_or("none")
            ),
        }),
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_non_streaming_with_content() {
        let body = r#"{
            "choices": [{
                "message": {"role": "assistant", "content": "Hello, world!"},
                "finish_reason": "stop"
            }]
        }"#;
        assert_eq!(parse_non_streaming_response(body).unwrap(), "Hello, world!");
    }

    #[test]
    fn test_parse_non_streaming_ignores_reasoning() {
        let body = r#"{
            "choices": [{
                "message": {
                    "role": "assistant",
                    "content": "{\"steps\":[]}",
                    "reasoning": "Let me think about this task..."
                },
                "finish_reason": "stop"
            }]
        }"#;
        assert_eq!(parse_non_streaming_response(body).unwrap(), "{\"steps\":[]}");
    }

    #[test]
    fn test_parse_non_streaming_empty_content_is_malformed() {
        let body = r#"{
            "choices": [{
                "message": {"role": "assistant", "content": "", "reasoning": "thinking..."},
                "finish_reason": "length"
            }]
        }"#;
        let err = parse_non_streaming_response(body).unwrap_err();
        assert!(err.to_string().contains("finish_reason: length"));
    }

    #[test]
    fn test_parse_non_streaming_empty_choices() {
        assert!(parse_non_streaming_response(r#"{"choices": []}"#).is_err());
        assert!(parse_non_streaming_response("not json").is_err());
    }

    #[test]
    fn test_process_event_text_and_markers() {
        let event = r#"data: {"choices":[{"delta":{"content":"Hi"},"finish_reason":null}]}"#;
        assert_eq!(process_event(event).unwrap(), SseEvent::Text("Hi".into()));
        assert_eq!(process_event("data: [DONE]").unwrap(), SseEvent::Done);
        assert_eq!(process_event(": keep-alive").unwrap(), SseEvent::Skip);

        let empty = r#"data: {"choices":[{"delta":{},"finish_reason":"stop"}]}"#;
        assert_eq!(process_event(empty).unwrap(), SseEvent::Skip);
    }

    fn chunk(content: &str) -> Vec<u8> {
        format!("data: {{\"choices\":[{{\"delta\":{{\"content\":\"{content}\"}}}}]}}\n\n").into_bytes()
    }

    #[tokio::test]
    async fn test_sse_multibyte_char_split_across_reads() {
        let event = chunk("café");
        let split = event.iter().position(|&b| b == 0xC3).unwrap() + 1;
        let reads: Vec<Result<Vec<u8>, InferenceError>> = vec![
            Ok(event[..split].to_vec()),
            Ok(event[split..].to_vec()),
            Ok(b"data: [DONE]\n\n".to_vec()),
        ];

        let deltas: Vec<_> = sse_text_stream(stream::iter(reads)).collect().await;
        assert_eq!(deltas.len(), 1);
        assert_eq!(deltas[0].as_ref().unwrap(), "café");
    }

    #[tokio::test]
    async fn test_sse_crlf_frames_and_trailing_event() {
        let mut body = chunk("one").to_vec();
        body.truncate(body.len() - 2);
        body.extend_from_slice(b"\r\n\r\n: keep-alive\r\n\r\n");
        let mut tail = chunk("two");
        tail.truncate(tail.len() - 2);
        let reads: Vec<Result<Vec<u8>, InferenceError>> = vec![Ok(body), Ok(tail)];

        let deltas: Vec<String> = sse_text_stream(stream::iter(reads))
            .map(|d| d.unwrap())
            .collect()
            .await;
        assert_eq!(deltas, vec!["one".to_string(), "two".to_string()]);
    }

    #[test]
    fn test_process_event_bad_json() {
        let err = process_event("data: {nope").unwrap_err();
        assert!(matches!(err, InferenceError::StreamError { .. }));
    }
}
