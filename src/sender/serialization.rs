use crate::domain::WireRecord;
use flate2::Compression;
use flate2::write::GzEncoder;
use std::io::Write;
use thiserror::Error;

// Rough per-record size used to pre-size the output buffer
const ESTIMATED_RECORD_SIZE: usize = 256;
const MAX_PREALLOCATION: usize = 16 * 1024 * 1024;

#[derive(Error, Debug)]
pub enum SerializationError {
    #[error("JSON serialization failed: {0}")]
    JsonError(#[from] serde_json::Error),
    #[error("IO error during serialization: {0}")]
    IoError(#[from] std::io::Error),
    #[error("Batch is empty")]
    EmptyBatch,
}

/// One JSON document per line.
pub fn serialize_ndjson(records: &[WireRecord]) -> Result<Vec<u8>, SerializationError> {
    if records.is_empty() {
        return Err(SerializationError::EmptyBatch);
    }

    let capacity = records
        .len()
        .saturating_mul(ESTIMATED_RECORD_SIZE)
        .min(MAX_PREALLOCATION);
    let mut buffer = Vec::with_capacity(capacity);

    for record in records {
        serde_json::to_writer(&mut buffer, record)?;
        buffer.write_all(b"\n")?;
    }

    Ok(buffer)
}

pub fn gzip(data: &[u8]) -> Result<Vec<u8>, SerializationError> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(data)?;
    Ok(encoder.finish()?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::MetricHeader;
    use flate2::read::GzDecoder;
    use std::io::Read;

    fn scalar(value: f64) -> WireRecord {
        WireRecord::Scalar {
            header: MetricHeader {
                task: None,
                timestamp: 1,
                metric: "m".to_string(),
                variant: "v".to_string(),
                iter: Some(0),
                model_event: None,
            },
            value,
        }
    }

    #[test]
    fn ndjson_has_one_line_per_record() {
        let data = serialize_ndjson(&[scalar(1.0), scalar(2.0)]).unwrap();
        let text = String::from_utf8(data).unwrap();
        let lines: Vec<_> = text.lines().collect();
        assert_eq!(lines.len(), 2);
        let second: WireRecord = serde_json::from_str(lines[1]).unwrap();
        assert_eq!(second, scalar(2.0));
    }

    #[test]
    fn empty_batches_are_rejected() {
        assert!(matches!(serialize_ndjson(&[]), Err(SerializationError::EmptyBatch)));
    }

    #[test]
    fn gzip_is_reversible() {
        let data = serialize_ndjson(&[scalar(3.0)]).unwrap();
        let compressed = gzip(&data).unwrap();
        let mut restored = Vec::new();
        GzDecoder::new(compressed.as_slice())
            .read_to_end(&mut restored)
            .unwrap();
        assert_eq!(restored, data);
    }
}
