//! Splits the raw stream into records. A record is whatever the server wrote
//! between two `<MSG_SEP>` separators; only a record that is exactly a sentinel
//! counts as a control marker.

use crate::message::StreamMessage;

pub const MSG_SEP: &str = "<MSG_SEP>";
pub const DESC: &str = "<DESC>";
pub const RESUME: &str = "<RESUME>";
pub const END: &str = "<END>";
pub const ABORT: &str = "<ABORT>";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Sentinel {
    Describe,
    Resume,
    End,
    Abort,
}

impl Sentinel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Sentinel::Describe => DESC,
            Sentinel::Resume => RESUME,
            Sentinel::End => END,
            Sentinel::Abort => ABORT,
        }
    }

    fn parse(record: &str) -> Option<Self> {
        match record {
            DESC => Some(Sentinel::Describe),
            RESUME => Some(Sentinel::Resume),
            END => Some(Sentinel::End),
            ABORT => Some(Sentinel::Abort),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    Sentinel(Sentinel),
    Message(Box<StreamMessage>),
    /// Plain assistant text from a server that does not wrap replies in JSON.
    Text(String),
}

pub fn parse_record(record: &str) -> Option<Frame> {
    if record.is_empty() {
        return None;
    }
    if let Some(sentinel) = Sentinel::parse(record) {
        return Some(Frame::Sentinel(sentinel));
    }
    if record.trim_start().starts_with('{')
        && let Ok(msg) = serde_json::from_str::<StreamMessage>(record)
    {
        return Some(Frame::Message(Box::new(msg)));
    }
    Some(Frame::Text(record.to_string()))
}

/// Incremental decoder; bytes may arrive split anywhere, including inside a
/// separator or a multi-byte character.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buf: Vec<u8>,
    /// Bytes of `buf` already known not to start a separator.
    scanned: usize,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, bytes: &[u8]) -> Vec<Frame> {
        self.buf.extend_from_slice(bytes);
        let sep = MSG_SEP.as_bytes();
        let mut frames = Vec::new();
        let mut start = 0;
        let mut from = self.scanned;
        while let Some(pos) = find(&self.buf[from..], sep) {
            let end = from + pos;
            let record = String::from_utf8_lossy(&self.buf[start..end]);
            if let Some(frame) = parse_record(&record) {
                frames.push(frame);
            }
            start = end + sep.len();
            from = start;
        }
        self.buf.drain(..start);
        // a separator may still complete across the last few bytes
        self.scanned = self.buf.len().saturating_sub(sep.len() - 1);
        frames
    }

    /// Whatever trails the last separator when the stream closes.
    pub fn finish(&mut self) -> Option<Frame> {
        self.scanned = 0;
        let rest = std::mem::take(&mut self.buf);
        parse_record(&String::from_utf8_lossy(&rest))
    }

    pub fn pending_len(&self) -> usize {
        self.buf.len()
    }
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if haystack.len() < needle.len() {
        return None;
    }
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

pub fn encode_record(frame: &Frame) -> String {
    let body = match frame {
        Frame::Sentinel(s) => s.as_str().to_string(),
        Frame::Message(msg) => serde_json::to_string(msg).unwrap_or_default(),
        Frame::Text(text) => text.clone(),
    };
    format!("{body}{MSG_SEP}")
}
