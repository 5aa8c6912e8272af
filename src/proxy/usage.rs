// Completion accounting - derives a completion character count from the
// captured copy of an upstream response body.
//
// Two shapes are understood:
//
// 1. Buffered JSON: a single object with a "completion" field.
// 2. SSE streams: successive `data:` frames, each carrying a JSON object
//    with the cumulative completion text so far. Frames that are not JSON
//    objects (keep-alives, heartbeats, `[DONE]` markers) are expected and
//    skipped; the last frame that decodes wins.
//
// NOTE: last-frame-wins assumes the provider sends cumulative rather than
// delta text per frame. Revisit per upstream integration.
//
// Accounting failures never affect the response already relayed to the
// client; they only degrade the count to the unknown sentinel.

use serde::Deserialize;

/// Sentinel for "the completion character count could not be derived".
pub const UNKNOWN_COMPLETION_CHARS: i64 = -1;

#[derive(Debug, Deserialize)]
struct CompletionPayload {
    completion: String,
}

/// Derive the completion character count from a captured response body.
pub fn completion_characters(body: &[u8], streaming: bool) -> i64 {
    if streaming {
        sse_completion_characters(body)
    } else {
        buffered_completion_characters(body)
    }
}

fn buffered_completion_characters(body: &[u8]) -> i64 {
    match serde_json::from_slice::<CompletionPayload>(body) {
        Ok(payload) => payload.completion.chars().count() as i64,
        Err(err) => {
            tracing::debug!("could not decode buffered completion response: {err}");
            UNKNOWN_COMPLETION_CHARS
        }
    }
}

fn sse_completion_characters(body: &[u8]) -> i64 {
    let text = String::from_utf8_lossy(body);
    let mut last: Option<i64> = None;

    for line in text.lines() {
        let line = line.trim();
        let Some(payload) = line.strip_prefix("data:") else {
            continue;
        };
        let payload = payload.trim();
        if payload.is_empty() || payload == "[DONE]" {
            continue;
        }
        // Non-JSON frames are part of the protocol; skip, never abort.
        let Ok(frame) = serde_json::from_str::<CompletionPayload>(payload) else {
            continue;
        };
        last = Some(frame.completion.chars().count() as i64);
    }

    last.unwrap_or(UNKNOWN_COMPLETION_CHARS)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn buffered_response_counts_completion_text() {
        assert_eq!(
            completion_characters(br#"{"completion":"hello"}"#, false),
            5
        );
    }

    #[test]
    fn buffered_garbage_yields_unknown() {
        assert_eq!(
            completion_characters(b"<html>bad gateway</html>", false),
            UNKNOWN_COMPLETION_CHARS
        );
    }

    #[test]
    fn sse_last_json_frame_wins_and_keepalives_are_skipped() {
        let body = concat!(
            "data: {\"completion\":\"Hel\"}\n\n",
            "data: keepalive\n\n",
            "data: {\"completion\":\"Hello!\"}\n\n",
        );
        assert_eq!(completion_characters(body.as_bytes(), true), 6);
    }

    #[test]
    fn sse_done_marker_does_not_clobber_the_count() {
        let body = concat!(
            "event: completion\n",
            "data: {\"completion\":\"hi there\"}\n\n",
            "data: [DONE]\n\n",
        );
        assert_eq!(completion_characters(body.as_bytes(), true), 8);
    }

    #[test]
    fn sse_with_no_decodable_frame_yields_unknown() {
        let body = "data: keepalive\n\ndata: still nothing\n\n";
        assert_eq!(
            completion_characters(body.as_bytes(), true),
            UNKNOWN_COMPLETION_CHARS
        );
        assert_eq!(
            completion_characters(b"", true),
            UNKNOWN_COMPLETION_CHARS
        );
    }

    #[test]
    fn counts_are_characters_not_bytes() {
        // Four characters, more than four bytes.
        assert_eq!(
            completion_characters("{\"completion\":\"héllo\"}".as_bytes(), false),
            5
        );
    }
}
