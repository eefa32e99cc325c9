use serde::Serialize;
use std::path::PathBuf;

pub const PARSE_FAILURE_MESSAGE: &str = "Failed to parse a valid JSON response from the MLLM.";

/// Terminal failure outcome of one analysis request, shaped for the caller.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ErrorRecord {
    pub error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub raw_output: Option<String>,
}

impl ErrorRecord {
    pub fn new(error: impl Into<String>) -> Self {
        Self {
            error: error.into(),
            details: None,
            raw_output: None,
        }
    }

    pub fn with_details(mut self, details: impl Into<String>) -> Self {
        self.details = Some(details.into());
        self
    }

    pub fn with_raw_output(mut self, raw: impl Into<String>) -> Self {
        self.raw_output = Some(raw.into());
        self
    }

    /// Human-readable message, embedding the raw model output when present.
    pub fn user_message(&self) -> String {
        let mut out = self.error.clone();
        if let Some(details) = self.details.as_deref() {
            out.push_str(&format!(" ({details})"));
        }
        if let Some(raw) = self.raw_output.as_deref() {
            out.push_str(&format!("\n\nRaw Output: {raw}"));
        }
        out
    }
}

#[derive(Debug, thiserror::Error)]
pub enum AnalysisError {
    #[error("Please upload a screenshot and provide a user review (screenshot missing)")]
    MissingImage,

    #[error("Please upload a screenshot and provide a user review (review is empty)")]
    EmptyReview,

    #[error("configuration error: {0}")]
    Config(String),

    #[error("MLLM analyzer is not available: {0}")]
    AnalyzerUnavailable(String),

    #[error("failed to process the screenshot {}: {reason}", .path.display())]
    UnreadableImage { path: PathBuf, reason: String },

    #[error("MLLM generation failed: {details}")]
    Generation { details: String },

    #[error("{}", .0.error)]
    Response(ErrorRecord),

    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },
}

impl AnalysisError {
    pub fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }

    pub fn is_input_error(&self) -> bool {
        matches!(self, Self::MissingImage | Self::EmptyReview)
    }

    pub fn to_record(&self) -> ErrorRecord {
        match self {
            Self::Generation { details } => {
                ErrorRecord::new("MLLM generation failed.").with_details(details.clone())
            }
            Self::Response(record) => record.clone(),
            other => ErrorRecord::new(other.to_string()),
        }
    }
}
