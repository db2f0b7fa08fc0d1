//! Incremental `text/event-stream` decoding.
//!
//! Frames are separated by a blank line. Within a frame, `data:` lines are
//! joined with `\n`, `id:` and `event:` are captured, and comment lines
//! (the producer's `:` keep-alives) are skipped. Frames without any data
//! carry nothing for the monitor and are not yielded.

use futures::{Stream, StreamExt};

use crate::error::{Error, Result};

/// One dispatched server-sent event.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SseFrame {
    pub id: Option<String>,
    pub event: Option<String>,
    pub data: String,
}

/// Parse a single frame (without its trailing blank line).
pub fn parse_frame(text: &str) -> Option<SseFrame> {
    let mut frame = SseFrame::default();
    let mut data_lines = Vec::new();

    for line in text.lines() {
        if line.is_empty() || line.starts_with(':') {
            continue;
        }
        let (field, value) = match line.split_once(':') {
            Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
            None => (line, ""),
        };
        match field {
            "data" => data_lines.push(value),
            "id" => frame.id = Some(value.to_string()),
            "event" => frame.event = Some(value.to_string()),
            _ => {}
        }
    }

    if data_lines.is_empty() {
        return None;
    }
    frame.data = data_lines.join("\n");
    Some(frame)
}

/// Upper bound on a single buffered frame.
pub const MAX_FRAME_BYTES: usize = 1 << 20;

/// Decode a chunked byte stream into frames.
///
/// `\r\n`, `\r` and `\n` are all accepted as line terminators, including a
/// `\r\n` split across chunks. Transport errors end the stream, as does a
/// frame that grows past [`MAX_FRAME_BYTES`]. A trailing partial frame at end
/// of stream is discarded.
pub fn decode_frames<S, B, E>(bytes: S) -> impl Stream<Item = Result<SseFrame>>
where
    S: Stream<Item = std::result::Result<B, E>>,
    B: AsRef<[u8]>,
    Error: From<E>,
{
    async_stream::try_stream! {
        let mut buf = Vec::<u8>::new();
        let mut after_cr = false;

        futures::pin_mut!(bytes);
        while let Some(chunk) = bytes.next().await {
            let chunk = chunk.map_err(Error::from)?;
            for &b in chunk.as_ref() {
                match b {
                    b'\r' => buf.push(b'\n'),
                    b'\n' if after_cr => {}
                    _ => buf.push(b),
                }
                after_cr = b == b'\r';
            }

            while let Some(pos) = find_double_newline(&buf) {
                let raw = buf.drain(..pos + 2).collect::<Vec<_>>();
                if let Some(frame) = parse_frame(&String::from_utf8_lossy(&raw)) {
                    yield frame;
                }
            }

            if buf.len() > MAX_FRAME_BYTES {
                Err::<(), _>(Error::MalformedEvent(format!(
                    "event-stream frame exceeds {MAX_FRAME_BYTES} bytes"
                )))?;
            }
        }
    }
}

/// Find the position of a double newline in the buffer.
fn find_double_newline(buf: &[u8]) -> Option<usize> {
    buf.windows(2).position(|w| w == b"\n\n")
}
