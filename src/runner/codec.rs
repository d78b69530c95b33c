//! Newline-delimited JSON framing of [`Envelope`]s.
//!
//! Every frame is one JSON object followed by a single `\n`. `serde_json` escapes newlines
//! inside strings, so a payload never contains the delimiter.

use crate::error::CodecError;
use crate::runner::protocol::Envelope;

const DELIMITER: u8 = b'\n';

/// Serialize an envelope into a self-delimiting frame.
pub fn encode(envelope: &Envelope) -> Result<Vec<u8>, CodecError> {
    let mut frame = serde_json::to_vec(envelope).map_err(CodecError::Encode)?;
    frame.push(DELIMITER);
    Ok(frame)
}

/// Decode all envelopes from a buffer that ends on a frame boundary.
///
/// Empty fragments are skipped, each fragment is parsed independently so a malformed one
/// doesn't affect its neighbours.
pub fn decode(buffer: &[u8]) -> Vec<Result<Envelope, CodecError>> {
    fragments(buffer).map(decode_frame).collect()
}

/// Decode a single frame, the delimiter is optional.
pub fn decode_frame(frame: &[u8]) -> Result<Envelope, CodecError> {
    serde_json::from_slice(frame).map_err(|source| CodecError::Decode {
        fragment: String::from_utf8_lossy(frame).into_owned(),
        source,
    })
}

fn is_blank(fragment: &[u8]) -> bool {
    fragment.iter().all(u8::is_ascii_whitespace)
}

fn fragments(buffer: &[u8]) -> impl Iterator<Item = &[u8]> {
    buffer
        .split(|b| *b == DELIMITER)
        .filter(|fragment| !is_blank(fragment))
}

/// Streaming decoder for transport reads.
///
/// Unlike [`decode`] it does not require reads to be aligned with frames: the bytes after the
/// last delimiter are kept until the rest of the frame arrives.
#[derive(Default)]
pub struct FrameDecoder {
    partial: Vec<u8>,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed bytes from a single read, return all envelopes completed by them.
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<Result<Envelope, CodecError>> {
        self.feed_raw(chunk)
            .iter()
            .map(|frame| decode_frame(frame))
            .collect()
    }

    /// Like [`FrameDecoder::feed`] but return completed frames undecoded, without delimiters.
    /// Blank frames are skipped.
    pub fn feed_raw(&mut self, chunk: &[u8]) -> Vec<Vec<u8>> {
        let Some(last_delimiter) = chunk.iter().rposition(|b| *b == DELIMITER) else {
            self.partial.extend_from_slice(chunk);
            return vec![];
        };

        let (complete, rest) = chunk.split_at(last_delimiter + 1);
        let mut buffer = std::mem::take(&mut self.partial);
        buffer.extend_from_slice(complete);
        self.partial.extend_from_slice(rest);

        fragments(&buffer).map(<[u8]>::to_vec).collect()
    }

    /// Return true if the decoder holds an incomplete frame.
    pub fn has_partial(&self) -> bool {
        !is_blank(&self.partial)
    }
}
