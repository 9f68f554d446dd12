use serde::Serialize;

/// Progress record for long operations, framed for SSE consumers as
/// newline-delimited JSON prefixed with `data: `.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamStatus {
    Started,
    Info,
    Progress,
    Complete,
    Error,
}

#[derive(Debug, Clone, Serialize)]
pub struct StreamRecord {
    pub status: StreamStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub progress: Option<f64>,
}

impl StreamRecord {
    pub fn started(message: impl Into<String>) -> Self {
        Self {
            status: StreamStatus::Started,
            message: Some(message.into()),
            progress: None,
        }
    }

    pub fn info(message: impl Into<String>) -> Self {
        Self {
            status: StreamStatus::Info,
            message: Some(message.into()),
            progress: None,
        }
    }

    pub fn progress(fraction: f64, message: impl Into<String>) -> Self {
        Self {
            status: StreamStatus::Progress,
            message: Some(message.into()),
            progress: Some(fraction.clamp(0.0, 1.0)),
        }
    }

    pub fn complete(message: impl Into<String>) -> Self {
        Self {
            status: StreamStatus::Complete,
            message: Some(message.into()),
            progress: Some(1.0),
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            status: StreamStatus::Error,
            message: Some(message.into()),
            progress: None,
        }
    }
}

/// One SSE-framed line, newline-terminated.
pub fn sse_line(record: &StreamRecord) -> String {
    let json = serde_json::to_string(record).expect("stream record serialises");
    format!("data: {json}\n")
}

/// Consumer of progress records.
pub trait ProgressSink: Send + Sync {
    fn emit(&self, record: StreamRecord);
}

/// Writes SSE-framed records to stdout (CLI mode).
pub struct StdoutSink;

impl ProgressSink for StdoutSink {
    fn emit(&self, record: StreamRecord) {
        print!("{}", sse_line(&record));
    }
}

/// Discards records (tests, library embedding).
pub struct NullSink;

impl ProgressSink for NullSink {
    fn emit(&self, _record: StreamRecord) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sse_framing_matches_protocol() {
        let line = sse_line(&StreamRecord::progress(0.5, "compared 3/6 pairs"));
        assert!(line.starts_with("data: {"));
        assert!(line.ends_with('\n'));
        assert!(line.contains("\"status\":\"progress\""));
        assert!(line.contains("\"progress\":0.5"));
    }

    #[test]
    fn progress_is_clamped() {
        let record = StreamRecord::progress(1.7, "done");
        assert_eq!(record.progress, Some(1.0));
    }

    #[test]
    fn info_omits_progress_field() {
        let line = sse_line(&StreamRecord::info("hello"));
        assert!(!line.contains("progress"));
    }
}
