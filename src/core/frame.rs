//! Decoder for the line-framed generation protocol.
//!
//! Each frame is one newline-terminated line of the form `<tag>:<payload>`:
//!
//! | tag        | payload                                              |
//! |------------|------------------------------------------------------|
//! | `a0`, `b0` | quoted, escaped text chunk for participant a / b     |
//! | `ad`, `bd` | `{"finishReason":string,"error"?:string}`            |
//!
//! Lines with any other tag, or whose payload does not parse, are dropped so
//! the server can extend the protocol without breaking older clients. A
//! completion line always ends its channel; only `"error"` marks a failure.

use memchr::memchr;
use serde::Deserialize;
use tracing::debug;

use crate::core::message::Participant;

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(from = "String")]
pub enum FinishReason {
    Stop,
    Error,
    /// Any other reason the server reports, e.g. `length`.
    Other(String),
}

impl FinishReason {
    pub fn is_error(&self) -> bool {
        *self == FinishReason::Error
    }
}

impl From<String> for FinishReason {
    fn from(value: String) -> Self {
        match value.as_str() {
            "stop" => FinishReason::Stop,
            "error" => FinishReason::Error,
            _ => FinishReason::Other(value),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Content {
        participant: Participant,
        text: String,
    },
    Completion {
        participant: Participant,
        reason: FinishReason,
        error: Option<String>,
    },
}

impl Frame {
    pub fn participant(&self) -> Participant {
        match self {
            Frame::Content { participant, .. } | Frame::Completion { participant, .. } => {
                *participant
            }
        }
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct CompletionPayload {
    finish_reason: FinishReason,
    #[serde(default)]
    error: Option<String>,
}

enum Tag {
    Content(Participant),
    Done(Participant),
}

impl Tag {
    fn parse(tag: &str) -> Option<Self> {
        match tag {
            "a0" => Some(Tag::Content(Participant::A)),
            "b0" => Some(Tag::Content(Participant::B)),
            "ad" => Some(Tag::Done(Participant::A)),
            "bd" => Some(Tag::Done(Participant::B)),
            _ => None,
        }
    }
}

/// Reverses the server's text escaping in a single left-to-right pass:
/// `\\` becomes `\` and `\n` becomes a newline. Any other backslash sequence
/// is kept verbatim.
pub fn unescape(text: &str) -> String {
    if !text.contains('\\') {
        return text.to_string();
    }

    let mut out = String::with_capacity(text.len());
    let mut chars = text.chars();
    while let Some(ch) = chars.next() {
        if ch != '\\' {
            out.push(ch);
            continue;
        }
        match chars.next() {
            Some('\\') => out.push('\\'),
            Some('n') => out.push('\n'),
            Some(other) => {
                out.push('\\');
                out.push(other);
            }
            None => out.push('\\'),
        }
    }
    out
}

/// Inverse of [`unescape`], producing the form the server puts on the wire.
pub fn escape(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for ch in text.chars() {
        match ch {
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            other => out.push(other),
        }
    }
    out
}

/// Parses one complete line (without its terminator) into a frame.
pub fn parse_line(line: &str) -> Option<Frame> {
    let line = line.strip_suffix('\r').unwrap_or(line);
    if line.trim().is_empty() {
        return None;
    }

    let (tag, payload) = line.split_once(':')?;
    match Tag::parse(tag)? {
        Tag::Content(participant) => {
            let quoted = payload.strip_prefix('"')?.strip_suffix('"')?;
            Some(Frame::Content {
                participant,
                text: unescape(quoted),
            })
        }
        Tag::Done(participant) => match serde_json::from_str::<CompletionPayload>(payload) {
            Ok(done) => Some(Frame::Completion {
                participant,
                reason: done.finish_reason,
                error: done.error,
            }),
            Err(err) => {
                debug!(%participant, error = %err, "dropping unparseable completion frame");
                None
            }
        },
    }
}

/// Incremental frame decoder.
///
/// Chunks may split a line (or a UTF-8 sequence) anywhere; the incomplete
/// tail is retained and joined with the next chunk.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buffer: Vec<u8>,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends `chunk` and returns the frames completed by it, in delivery
    /// order. The returned iterator decodes lazily; lines it does not reach
    /// stay buffered for the next call.
    pub fn feed(&mut self, chunk: &[u8]) -> Frames<'_> {
        self.buffer.extend_from_slice(chunk);
        Frames { decoder: self }
    }

    /// Bytes of an incomplete trailing line currently held back.
    pub fn pending_len(&self) -> usize {
        self.buffer.len()
    }

    /// Decodes whatever unterminated line remains at end of stream.
    pub fn finish(mut self) -> Option<Frame> {
        let rest = std::mem::take(&mut self.buffer);
        match std::str::from_utf8(&rest) {
            Ok(line) => parse_line(line),
            Err(err) => {
                debug!(error = %err, "dropping trailing fragment with invalid UTF-8");
                None
            }
        }
    }

    fn next_frame(&mut self) -> Option<Frame> {
        while let Some(newline_pos) = memchr(b'\n', &self.buffer) {
            let frame = match std::str::from_utf8(&self.buffer[..newline_pos]) {
                Ok(line) => {
                    let frame = parse_line(line);
                    if frame.is_none() && !line.trim().is_empty() {
                        debug!(line, "ignoring unrecognized stream line");
                    }
                    frame
                }
                Err(err) => {
                    debug!(error = %err, "ignoring stream line with invalid UTF-8");
                    None
                }
            };
            self.buffer.drain(..=newline_pos);
            if frame.is_some() {
                return frame;
            }
        }
        None
    }
}

pub struct Frames<'a> {
    decoder: &'a mut FrameDecoder,
}

impl Iterator for Frames<'_> {
    type Item = Frame;

    fn next(&mut self) -> Option<Frame> {
        self.decoder.next_frame()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TRANSCRIPT: &str = concat!(
        "a0:\"Hi\"\n",
        "b0:\"Yo\"\n",
        "x9:{\"future\":true}\n",
        "a0:\" there\\nfriend \\\\o/\"\n",
        "ad:{\"finishReason\":\"stop\"}\n",
        "\n",
        "b0:\"caf\u{e9} \u{1f980}\"\n",
        "bd:{\"finishReason\":\"error\",\"error\":\"overloaded\"}\n",
    );

    fn decode_chunks(chunks: &[&[u8]]) -> Vec<Frame> {
        let mut decoder = FrameDecoder::new();
        let mut frames = Vec::new();
        for chunk in chunks {
            frames.extend(decoder.feed(chunk));
        }
        frames.extend(decoder.finish());
        frames
    }

    fn content(participant: Participant, text: &str) -> Frame {
        Frame::Content {
            participant,
            text: text.to_string(),
        }
    }

    #[test]
    fn decodes_all_frame_kinds_and_skips_unknown_tags() {
        let frames = decode_chunks(&[TRANSCRIPT.as_bytes()]);
        assert_eq!(
            frames,
            vec![
                content(Participant::A, "Hi"),
                content(Participant::B, "Yo"),
                content(Participant::A, " there\nfriend \\o/"),
                Frame::Completion {
                    participant: Participant::A,
                    reason: FinishReason::Stop,
                    error: None,
                },
                content(Participant::B, "caf\u{e9} \u{1f980}"),
                Frame::Completion {
                    participant: Participant::B,
                    reason: FinishReason::Error,
                    error: Some("overloaded".to_string()),
                },
            ]
        );
    }

    #[test]
    fn every_split_point_yields_the_same_frames() {
        let bytes = TRANSCRIPT.as_bytes();
        let expected = decode_chunks(&[bytes]);
        for split in 0..=bytes.len() {
            let (head, tail) = bytes.split_at(split);
            assert_eq!(decode_chunks(&[head, tail]), expected, "split at {split}");
        }
    }

    #[test]
    fn byte_at_a_time_delivery_matches_whole_delivery() {
        let bytes = TRANSCRIPT.as_bytes();
        let chunks: Vec<&[u8]> = bytes.chunks(1).collect();
        assert_eq!(decode_chunks(&chunks), decode_chunks(&[bytes]));
    }

    #[test]
    fn incomplete_line_is_held_until_its_terminator_arrives() {
        let mut decoder = FrameDecoder::new();
        assert_eq!(decoder.feed(b"a0:\"Hel").count(), 0);
        assert_eq!(decoder.pending_len(), 7);
        let frames: Vec<Frame> = decoder.feed(b"lo\"\r\n").collect();
        assert_eq!(frames, vec![content(Participant::A, "Hello")]);
        assert_eq!(decoder.pending_len(), 0);
    }

    #[test]
    fn frames_not_pulled_stay_buffered() {
        let mut decoder = FrameDecoder::new();
        let first = decoder.feed(b"a0:\"1\"\na0:\"2\"\n").next();
        assert_eq!(first, Some(content(Participant::A, "1")));
        let rest: Vec<Frame> = decoder.feed(b"").collect();
        assert_eq!(rest, vec![content(Participant::A, "2")]);
    }

    #[test]
    fn malformed_payloads_are_dropped() {
        assert_eq!(parse_line("a0:unquoted"), None);
        assert_eq!(parse_line("ad:not json"), None);
        assert_eq!(parse_line("ad:{}"), None);
        assert_eq!(parse_line("no separator"), None);
        assert_eq!(parse_line(""), None);
    }

    #[test]
    fn unfamiliar_finish_reasons_still_complete_the_channel() {
        assert_eq!(
            parse_line(r#"bd:{"finishReason":"length"}"#),
            Some(Frame::Completion {
                participant: Participant::B,
                reason: FinishReason::Other("length".to_string()),
                error: None,
            })
        );
        let Some(Frame::Completion { reason, .. }) =
            parse_line(r#"ad:{"finishReason":"content-filter"}"#)
        else {
            panic!("expected a completion frame");
        };
        assert!(!reason.is_error());
    }

    #[test]
    fn escaped_newline_becomes_a_real_newline() {
        assert_eq!(
            parse_line(r#"a0:"Line1\nLine2""#),
            Some(content(Participant::A, "Line1\nLine2"))
        );
    }

    #[test]
    fn unescape_handles_escaped_backslash_before_n() {
        // `\\n` on the wire is a literal backslash followed by `n`.
        assert_eq!(unescape(r"C:\\new"), r"C:\new");
        assert_eq!(unescape(r"tab\t stays"), r"tab\t stays");
        assert_eq!(unescape("trailing\\"), "trailing\\");
    }

    #[test]
    fn unescape_leaves_plain_text_untouched() {
        for text in ["plain", "multi\nline", "", "quotes \" inside"] {
            assert_eq!(unescape(text), text);
            assert_eq!(unescape(&unescape(text)), text);
        }
    }

    #[test]
    fn escape_then_unescape_restores_backslashes_and_newlines() {
        for text in [r"\", r"\\", "\\n", "a\\\nb", "\n\n\\", r"dir\name\"] {
            assert_eq!(unescape(&escape(text)), text, "round trip of {text:?}");
        }
    }
}
