//! Null-sanitizing transform for gzip newline-delimited JSON parts.
//!
//! Some upstream tables carry arrays with `null` entries in a few top-level
//! columns, which the warehouse rejects for `REPEATED` fields. The transform
//! streams a part record by record, drops those nulls and writes a new part.

use flate2::Compression;
use flate2::read::MultiGzDecoder;
use flate2::write::GzEncoder;
use serde_json::{Map, Value};
use snafu::prelude::*;
use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

use crate::error::{
    CreateOutputSnafu, FinalizeSnafu, MalformedJsonSnafu, OpenInputSnafu, ReadLineSnafu,
    TransformError, WriteOutputSnafu,
};

/// What happened to one designated field of one record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldOutcome {
    /// The field was an array; `removed` nulls were dropped from it.
    Cleaned { removed: usize },
    /// The record has no such field.
    Absent,
    /// The field holds something other than an array and was left alone.
    NotArray,
}

/// Result of transforming one part.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransformOutcome {
    /// Output was written.
    Written { records: u64, nulls_removed: u64 },
    /// Output already existed; nothing was read or written.
    Skipped,
}

/// Drop `null` entries from `field` if it holds an array.
pub fn sanitize_field(record: &mut Map<String, Value>, field: &str) -> FieldOutcome {
    match record.get_mut(field) {
        None => FieldOutcome::Absent,
        Some(Value::Array(items)) => {
            let before = items.len();
            items.retain(|item| !item.is_null());
            FieldOutcome::Cleaned {
                removed: before - items.len(),
            }
        }
        Some(_) => FieldOutcome::NotArray,
    }
}

/// Sanitize every designated field of a record, returning the nulls removed.
///
/// Records that are not JSON objects are left untouched.
pub fn sanitize_record(record: &mut Value, fields: &[String]) -> u64 {
    let Value::Object(map) = record else {
        return 0;
    };

    fields
        .iter()
        .map(|field| match sanitize_field(map, field) {
            FieldOutcome::Cleaned { removed } => removed as u64,
            FieldOutcome::Absent | FieldOutcome::NotArray => 0,
        })
        .sum()
}

/// Temp path a part is written to before being renamed into place.
pub fn temp_path(output: &Path) -> PathBuf {
    let mut name = output.as_os_str().to_owned();
    name.push(".tmp");
    PathBuf::from(name)
}

/// Sanitize `input` into `output`.
///
/// Does nothing if `output` already exists. Output goes to a temp file that is
/// renamed over `output` only once the whole part succeeded; on any error the
/// temp file is removed and `output` does not appear.
pub fn transform_part(
    input: &Path,
    fields: &[String],
    output: &Path,
) -> Result<TransformOutcome, TransformError> {
    if output.exists() {
        debug!(output = %output.display(), "Sanitized part exists, skipping");
        return Ok(TransformOutcome::Skipped);
    }

    let tmp = temp_path(output);
    match write_sanitized(input, fields, &tmp) {
        Ok((records, nulls_removed)) => {
            std::fs::rename(&tmp, output).context(FinalizeSnafu { path: output })?;
            Ok(TransformOutcome::Written {
                records,
                nulls_removed,
            })
        }
        Err(e) => {
            match std::fs::remove_file(&tmp) {
                Err(rm) if rm.kind() != std::io::ErrorKind::NotFound => {
                    warn!(path = %tmp.display(), error = %rm, "Failed to remove temp output");
                }
                _ => {}
            }
            Err(e)
        }
    }
}

fn write_sanitized(
    input: &Path,
    fields: &[String],
    tmp: &Path,
) -> Result<(u64, u64), TransformError> {
    let source = File::open(input).context(OpenInputSnafu { path: input })?;
    let mut reader = BufReader::new(MultiGzDecoder::new(BufReader::new(source)));

    let sink = File::create(tmp).context(CreateOutputSnafu { path: tmp })?;
    let mut encoder = GzEncoder::new(BufWriter::new(sink), Compression::default());

    let mut records = 0u64;
    let mut nulls_removed = 0u64;
    let mut line = String::new();
    let mut line_no = 0usize;

    loop {
        line.clear();
        line_no += 1;
        let read = reader.read_line(&mut line).context(ReadLineSnafu {
            path: input,
            line: line_no,
        })?;
        if read == 0 {
            break;
        }
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }

        let mut record: Value = serde_json::from_str(trimmed).context(MalformedJsonSnafu {
            path: input,
            line: line_no,
        })?;
        nulls_removed += sanitize_record(&mut record, fields);

        serde_json::to_writer(&mut encoder, &record)
            .map_err(std::io::Error::from)
            .and_then(|()| encoder.write_all(b"\n"))
            .context(WriteOutputSnafu { path: tmp })?;
        records += 1;
    }

    let writer = encoder.finish().context(WriteOutputSnafu { path: tmp })?;
    let file = writer
        .into_inner()
        .map_err(|e| e.into_error())
        .context(WriteOutputSnafu { path: tmp })?;
    file.sync_all().context(WriteOutputSnafu { path: tmp })?;

    Ok((records, nulls_removed))
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use serde_json::json;
    use std::io::Read;
    use tempfile::TempDir;

    pub(crate) fn write_part(path: &Path, lines: &[&str]) {
        let file = File::create(path).unwrap();
        let mut encoder = GzEncoder::new(file, Compression::default());
        for line in lines {
            encoder.write_all(line.as_bytes()).unwrap();
            encoder.write_all(b"\n").unwrap();
        }
        encoder.finish().unwrap();
    }

    pub(crate) fn read_part(path: &Path) -> Vec<Value> {
        let mut text = String::new();
        MultiGzDecoder::new(File::open(path).unwrap())
            .read_to_string(&mut text)
            .unwrap();
        text.lines()
            .filter(|l| !l.trim().is_empty())
            .map(|l| serde_json::from_str(l).unwrap())
            .collect()
    }

    fn fields(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_sanitize_field_outcomes() {
        let mut record = json!({"source": ["a", null, "b", null], "title": "x", "author": []});
        let map = record.as_object_mut().unwrap();

        assert_eq!(
            sanitize_field(map, "source"),
            FieldOutcome::Cleaned { removed: 2 }
        );
        assert_eq!(sanitize_field(map, "title"), FieldOutcome::NotArray);
        assert_eq!(sanitize_field(map, "missing"), FieldOutcome::Absent);
        assert_eq!(
            sanitize_field(map, "author"),
            FieldOutcome::Cleaned { removed: 0 }
        );
        assert_eq!(record["source"], json!(["a", "b"]));
    }

    #[test]
    fn test_sanitize_record_only_touches_designated_top_level_fields() {
        let mut record = json!({
            "id": "50|doi",
            "source": [null, "Crossref"],
            "other": [null],
            "nested": {"source": [null]}
        });
        let removed = sanitize_record(&mut record, &fields(&["source"]));

        assert_eq!(removed, 1);
        assert_eq!(
            record,
            json!({
                "id": "50|doi",
                "source": ["Crossref"],
                "other": [null],
                "nested": {"source": [null]}
            })
        );
    }

    #[test]
    fn test_sanitize_record_preserves_key_order() {
        let mut record: Value =
            serde_json::from_str(r#"{"z": 1, "source": [null, "x"], "a": 2}"#).unwrap();
        sanitize_record(&mut record, &fields(&["source"]));
        assert_eq!(
            serde_json::to_string(&record).unwrap(),
            r#"{"z":1,"source":["x"],"a":2}"#
        );
    }

    #[test]
    fn test_non_object_record_passes_through() {
        let mut record = json!([null, 1]);
        assert_eq!(sanitize_record(&mut record, &fields(&["source"])), 0);
        assert_eq!(record, json!([null, 1]));
    }

    #[test]
    fn test_transform_part_preserves_count_and_order() {
        let dir = TempDir::new().unwrap();
        let input = dir.path().join("part-0.json.gz");
        let output = dir.path().join("part-0_NR.json.gz");
        write_part(
            &input,
            &[
                r#"{"id": 1, "source": [null, "a"]}"#,
                "",
                r#"{"id": 2, "title": "no source"}"#,
                r#"{"id": 3, "source": "scalar"}"#,
                r#"{"id": 4, "source": [null, null]}"#,
            ],
        );

        let outcome = transform_part(&input, &fields(&["source"]), &output).unwrap();
        assert_eq!(
            outcome,
            TransformOutcome::Written {
                records: 4,
                nulls_removed: 3
            }
        );

        let records = read_part(&output);
        assert_eq!(
            records,
            vec![
                json!({"id": 1, "source": ["a"]}),
                json!({"id": 2, "title": "no source"}),
                json!({"id": 3, "source": "scalar"}),
                json!({"id": 4, "source": []}),
            ]
        );
        assert!(!temp_path(&output).exists());
    }

    #[test]
    fn test_transform_keeps_number_text() {
        let dir = TempDir::new().unwrap();
        let input = dir.path().join("part-0.json.gz");
        let output = dir.path().join("part-0_NR.json.gz");
        write_part(
            &input,
            &[r#"{"id":123456789012345678901234,"score":1e5,"ratio":0.1,"source":[null,"a"]}"#],
        );

        transform_part(&input, &fields(&["source"]), &output).unwrap();

        let mut text = String::new();
        MultiGzDecoder::new(File::open(&output).unwrap())
            .read_to_string(&mut text)
            .unwrap();
        assert_eq!(
            text,
            "{\"id\":123456789012345678901234,\"score\":1e5,\"ratio\":0.1,\"source\":[\"a\"]}\n"
        );
    }

    #[test]
    fn test_transform_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let input = dir.path().join("part-0.json.gz");
        let once = dir.path().join("once.json.gz");
        let twice = dir.path().join("twice.json.gz");
        write_part(&input, &[r#"{"source": [null, "a", null], "author": [null]}"#]);

        let f = fields(&["source", "author"]);
        transform_part(&input, &f, &once).unwrap();
        let outcome = transform_part(&once, &f, &twice).unwrap();

        assert_eq!(
            outcome,
            TransformOutcome::Written {
                records: 1,
                nulls_removed: 0
            }
        );
        assert_eq!(read_part(&once), read_part(&twice));
    }

    #[test]
    fn test_existing_output_is_skipped() {
        let dir = TempDir::new().unwrap();
        let input = dir.path().join("missing.json.gz");
        let output = dir.path().join("part-0_NR.json.gz");
        std::fs::write(&output, b"already here").unwrap();

        let outcome = transform_part(&input, &fields(&["source"]), &output).unwrap();
        assert_eq!(outcome, TransformOutcome::Skipped);
        assert_eq!(std::fs::read(&output).unwrap(), b"already here");
    }

    #[test]
    fn test_malformed_json_leaves_no_output() {
        let dir = TempDir::new().unwrap();
        let input = dir.path().join("part-0.json.gz");
        let output = dir.path().join("part-0_NR.json.gz");
        write_part(&input, &[r#"{"source": []}"#, r#"{"source": [nul"#]);

        let err = transform_part(&input, &fields(&["source"]), &output).unwrap_err();
        assert!(matches!(err, TransformError::MalformedJson { line: 2, .. }));
        assert!(!output.exists());
        assert!(!temp_path(&output).exists());
    }

    #[test]
    fn test_missing_input_is_error() {
        let dir = TempDir::new().unwrap();
        let err = transform_part(
            &dir.path().join("absent.json.gz"),
            &fields(&["source"]),
            &dir.path().join("absent_NR.json.gz"),
        )
        .unwrap_err();
        assert!(matches!(err, TransformError::OpenInput { .. }));
    }

    #[test]
    fn test_stale_temp_file_is_overwritten() {
        let dir = TempDir::new().unwrap();
        let input = dir.path().join("part-0.json.gz");
        let output = dir.path().join("part-0_NR.json.gz");
        write_part(&input, &[r#"{"source": [null]}"#]);
        std::fs::write(temp_path(&output), b"garbage from a crashed run").unwrap();

        transform_part(&input, &fields(&["source"]), &output).unwrap();
        assert_eq!(read_part(&output), vec![json!({"source": []})]);
    }
}
