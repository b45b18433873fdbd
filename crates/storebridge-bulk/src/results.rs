//! Incremental consumption of newline-delimited JSON result files.
//!
//! Result files arrive as a byte stream and are decoded line by line;
//! malformed lines are skipped and counted, never fatal to the stream.
//! Records can optionally be validated and transformed per entity type,
//! then consumed either as cursor-paginated pages or as one full drain.

use bytes::Bytes;
use futures::StreamExt;
use serde_json::Value;

use crate::api::ResultByteStream;
use crate::error::BulkJobResult;

/// Pluggable per-entity-type record hooks.
///
/// `validate` gates records (failures are counted and dropped);
/// `transform` reshapes those that pass.
#[derive(Clone, Copy)]
pub struct EntityProcessor {
    pub validate: fn(&Value) -> bool,
    pub transform: fn(Value) -> Value,
}

impl EntityProcessor {
    /// Accept everything, change nothing.
    #[must_use]
    pub fn passthrough() -> Self {
        Self {
            validate: |_| true,
            transform: |v| v,
        }
    }
}

/// Fully parsed result set with skip accounting.
#[derive(Debug, Clone, Default)]
pub struct ParsedResults {
    pub records: Vec<Value>,
    /// Lines that were not valid JSON.
    pub skipped_malformed: usize,
    /// Records rejected by the entity validator.
    pub skipped_invalid: usize,
}

/// One page of a cursor-paginated result view.
#[derive(Debug, Clone)]
pub struct ResultPage {
    pub records: Vec<Value>,
    pub has_next_page: bool,
    /// Id of the last record in this page; pass back as the cursor.
    pub end_cursor: Option<String>,
    pub total_count: usize,
}

/// Splits a byte stream into complete lines across chunk boundaries.
#[derive(Default)]
struct LineDecoder {
    buffer: Vec<u8>,
}

impl LineDecoder {
    /// Feed a chunk, yielding every line completed by it.
    fn feed(&mut self, chunk: &[u8]) -> Vec<String> {
        self.buffer.extend_from_slice(chunk);
        let mut lines = Vec::new();
        while let Some(pos) = self.buffer.iter().position(|b| *b == b'\n') {
            let rest = self.buffer.split_off(pos + 1);
            let mut line = std::mem::replace(&mut self.buffer, rest);
            line.pop(); // trailing \n
            if line.last() == Some(&b'\r') {
                line.pop();
            }
            lines.push(String::from_utf8_lossy(&line).into_owned());
        }
        lines
    }

    /// The final unterminated line, if any.
    fn finish(self) -> Option<String> {
        if self.buffer.is_empty() {
            None
        } else {
            Some(String::from_utf8_lossy(&self.buffer).into_owned())
        }
    }
}

/// Parse an entire result stream into records.
///
/// Applies the processor per record when given. Malformed and invalid
/// lines are logged and counted, and the rest of the stream continues.
pub async fn collect_records(
    mut stream: ResultByteStream,
    processor: Option<&EntityProcessor>,
) -> BulkJobResult<ParsedResults> {
    let mut decoder = LineDecoder::default();
    let mut results = ParsedResults::default();

    while let Some(chunk) = stream.next().await {
        let chunk: Bytes = chunk?;
        for line in decoder.feed(&chunk) {
            ingest_line(&line, processor, &mut results);
        }
    }
    if let Some(line) = decoder.finish() {
        ingest_line(&line, processor, &mut results);
    }

    if results.skipped_malformed > 0 || results.skipped_invalid > 0 {
        tracing::warn!(
            target: "bulk_results",
            records = results.records.len(),
            skipped_malformed = results.skipped_malformed,
            skipped_invalid = results.skipped_invalid,
            "Result stream contained skipped lines"
        );
    }

    Ok(results)
}

fn ingest_line(line: &str, processor: Option<&EntityProcessor>, results: &mut ParsedResults) {
    let trimmed = line.trim();
    if trimmed.is_empty() {
        return;
    }

    let record: Value = match serde_json::from_str(trimmed) {
        Ok(value) => value,
        Err(e) => {
            tracing::warn!(
                target: "bulk_results",
                error = %e,
                "Skipping malformed result line"
            );
            results.skipped_malformed += 1;
            return;
        }
    };

    match processor {
        Some(p) => {
            if !(p.validate)(&record) {
                results.skipped_invalid += 1;
                return;
            }
            results.records.push((p.transform)(record));
        }
        None => results.records.push(record),
    }
}

/// Cursor-paginate parsed records.
///
/// The cursor is the `id` of the last record of the previous page; an
/// unknown cursor restarts from the beginning.
#[must_use]
pub fn paginate(records: &[Value], cursor: Option<&str>, limit: usize) -> ResultPage {
    let start = cursor
        .and_then(|c| records.iter().position(|r| record_id(r) == Some(c)))
        .map_or(0, |idx| idx + 1);

    let end = (start + limit).min(records.len());
    let page: Vec<Value> = records[start..end].to_vec();
    let has_next_page = end < records.len();
    let end_cursor = page
        .last()
        .and_then(|r| record_id(r).map(str::to_string));

    ResultPage {
        records: page,
        has_next_page,
        end_cursor,
        total_count: records.len(),
    }
}

fn record_id(record: &Value) -> Option<&str> {
    record.get("id").and_then(|v| v.as_str())
}
