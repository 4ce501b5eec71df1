//! Rebuilds logical records from line-broken export text.
//!
//! Exported markup wraps records at arbitrary points. The assembler keeps one
//! accumulator, appends every line with its line noise removed, and hands out
//! the accumulated text as soon as it holds both an opening and a closing
//! record marker.

use crate::constants::{RECORD_CLOSE, RECORD_OPEN};
use crate::metrics::PipelineMetrics;
use encoding_rs::ISO_8859_15;
use std::io;
use tokio::io::{AsyncBufRead, AsyncBufReadExt};
use tracing::warn;

/// One reconstructed logical record, still as markup text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordSpan {
    /// Zero-based position of the span within its file.
    pub index: usize,
    pub text: String,
}

#[derive(Debug, Default)]
pub struct RecordAssembler {
    buffer: String,
    emitted: usize,
}

impl RecordAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append one raw line. Returns a span once the buffer holds a complete
    /// record; the buffer is empty again afterwards.
    pub fn push_line(&mut self, line: &str) -> Option<RecordSpan> {
        self.buffer
            .extend(line.chars().filter(|c| !matches!(c, '\n' | '\r' | '\t')));

        if !is_complete(&self.buffer) {
            return None;
        }

        let span = RecordSpan {
            index: self.emitted,
            text: std::mem::take(&mut self.buffer),
        };
        self.emitted += 1;
        PipelineMetrics::record_assembled();
        Some(span)
    }

    /// End of input. Incomplete trailing content is dropped; the dropped text
    /// is returned so the caller can report it.
    pub fn finish(self) -> Option<String> {
        let rest = self.buffer.trim();
        if rest.is_empty() {
            return None;
        }
        warn!(
            "Discarding {} bytes of incomplete trailing record after {} records",
            rest.len(),
            self.emitted
        );
        PipelineMetrics::record_trailing_discarded();
        Some(rest.to_string())
    }
}

/// True when the text contains an opening record tag and a closing tag after it.
fn is_complete(text: &str) -> bool {
    let Some(open) = find_open_marker(text) else {
        return false;
    };
    text[open..].contains(RECORD_CLOSE)
}

/// Position of `<Event` used as a tag name, so `<EventData` does not count.
fn find_open_marker(text: &str) -> Option<usize> {
    let mut from = 0;
    while let Some(pos) = text[from..].find(RECORD_OPEN) {
        let at = from + pos;
        let after = at + RECORD_OPEN.len();
        match text[after..].chars().next() {
            Some(c) if c == '>' || c == '/' || c.is_whitespace() => return Some(at),
            _ => from = after,
        }
    }
    None
}

/// Lazy span sequence over an export reader. Lines are decoded as
/// ISO-8859-15. Consumes the reader; not restartable.
pub struct RecordSpans<R> {
    reader: R,
    raw: Vec<u8>,
    assembler: Option<RecordAssembler>,
    discarded: Option<String>,
}

impl<R> RecordSpans<R>
where
    R: AsyncBufRead + Unpin,
{
    pub fn new(reader: R) -> Self {
        Self {
            reader,
            raw: Vec::new(),
            assembler: Some(RecordAssembler::new()),
            discarded: None,
        }
    }

    /// Next complete record, or `None` once the reader is exhausted.
    pub async fn next_span(&mut self) -> Option<io::Result<RecordSpan>> {
        loop {
            let assembler = self.assembler.as_mut()?;
            self.raw.clear();
            match self.reader.read_until(b'\n', &mut self.raw).await {
                Ok(0) => {
                    self.discarded = self.assembler.take().and_then(RecordAssembler::finish);
                    return None;
                }
                Ok(_) => {
                    let (line, _) = ISO_8859_15.decode_without_bom_handling(&self.raw);
                    if let Some(span) = assembler.push_line(&line) {
                        return Some(Ok(span));
                    }
                }
                Err(e) => return Some(Err(e)),
            }
        }
    }

    /// Trailing text dropped at end of input, available once the sequence is exhausted.
    pub fn discarded(&self) -> Option<&str> {
        self.discarded.as_deref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn spans(lines: &[&str]) -> (Vec<RecordSpan>, Option<String>) {
        let mut input = String::new();
        for line in lines {
            input.push_str(line);
            if !line.ends_with('\n') {
                input.push('\n');
            }
        }
        let mut spans = RecordSpans::new(input.as_bytes());
        let mut out = Vec::new();
        while let Some(span) = spans.next_span().await {
            out.push(span.unwrap());
        }
        assert!(spans.next_span().await.is_none());
        (out, spans.discarded().map(str::to_string))
    }

    #[tokio::test]
    async fn test_split_record_is_rebuilt_once() {
        let record = "<Event xmlns='x'><System><EventID>4624</EventID></System></Event>";
        // Every possible single split point, plus a three-way split
        for cut in 1..record.len() {
            let (a, b) = record.split_at(cut);
            let (out, rest) = spans(&[&format!("{a}\r\n"), &format!("\t{b}\n")]).await;
            assert_eq!(out.len(), 1, "split at {cut}");
            assert_eq!(out[0].text, record);
            assert!(rest.is_none());
        }
        let (out, _) = spans(&["<Event><Sys", "tem/></Ev", "ent>"]).await;
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].text, "<Event><System/></Event>");
    }

    #[tokio::test]
    async fn test_consecutive_records_are_indexed_in_order() {
        let (out, _) = spans(&[
            "<Event><System><EventID>1</EventID></System></Event>",
            "<Event>",
            "<System><EventID>2</EventID></System>",
            "</Event>",
        ])
        .await;
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].index, 0);
        assert_eq!(out[1].index, 1);
        assert!(out[1].text.contains("<EventID>2</EventID>"));
    }

    #[tokio::test]
    async fn test_trailing_partial_is_dropped_and_reported() {
        let (out, rest) = spans(&[
            "<Event><System/></Event>",
            "<Event><System><EventID>9</EventID>",
        ])
        .await;
        assert_eq!(out.len(), 1);
        assert_eq!(rest.as_deref(), Some("<Event><System><EventID>9</EventID>"));
    }

    #[test]
    fn test_event_data_tag_is_not_an_opening_marker() {
        let mut assembler = RecordAssembler::new();
        assert!(assembler.push_line("<EventData></EventData></Event>").is_none());
        assert!(assembler.push_line("<Event>").is_none());
        let span = assembler.push_line("</Event>").unwrap();
        assert_eq!(span.text, "<EventData></EventData></Event><Event></Event>");
    }

    #[tokio::test]
    async fn test_blank_trailing_lines_are_not_reported() {
        let (out, rest) = spans(&["<Event></Event>", "", "\r\n"]).await;
        assert_eq!(out.len(), 1);
        assert!(rest.is_none());
    }
}
