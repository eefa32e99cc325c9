use crate::error::{ErrorRecord, PARSE_FAILURE_MESSAGE};
use serde::{Deserialize, Serialize, Serializer};
use serde_json::{Map, Value};
use tracing::{debug, warn};

pub const REQUIRED_KEYS: [&str; 4] = [
    "mismatch_detected",
    "confidence_score",
    "mismatch_type",
    "rationale",
];

static NULL: Value = Value::Null;

/// How much of the response schema is enforced beyond the required keys.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ValidationMode {
    /// Required keys, a Yes/No verdict and a numeric confidence.
    #[default]
    Lenient,
    /// Additionally: confidence in [0, 1], a known mismatch type, and a
    /// widget id that was assigned in this run.
    Strict,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum MismatchDetected {
    Yes,
    No,
}

impl MismatchDetected {
    pub fn is_yes(self) -> bool {
        self == Self::Yes
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MismatchType {
    NonFunctionalElement,
    FeatureMisrepresentation,
    VisualGlitch,
    None,
    /// Unrecognized value kept verbatim in lenient mode.
    Other(String),
}

impl MismatchType {
    pub fn as_str(&self) -> &str {
        match self {
            Self::NonFunctionalElement => "Non-Functional Element",
            Self::FeatureMisrepresentation => "Feature Misrepresentation",
            Self::VisualGlitch => "Visual Glitch",
            Self::None => "None",
            Self::Other(raw) => raw,
        }
    }

    /// Case, spaces, hyphens and underscores are ignored.
    pub fn from_label(raw: &str) -> Option<Self> {
        let key: String = raw
            .chars()
            .filter(|c| c.is_alphanumeric())
            .flat_map(char::to_lowercase)
            .collect();
        match key.as_str() {
            "nonfunctionalelement" => Some(Self::NonFunctionalElement),
            "featuremisrepresentation" => Some(Self::FeatureMisrepresentation),
            "visualglitch" => Some(Self::VisualGlitch),
            "none" => Some(Self::None),
            _ => None,
        }
    }
}

impl Serialize for MismatchType {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AnalysisResult {
    pub mismatch_detected: MismatchDetected,
    pub confidence_score: f64,
    pub mismatch_type: MismatchType,
    pub rationale: String,
    /// Serialized as `null` when the model names no widget.
    pub relevant_widget_id: Option<u32>,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ParseOptions<'a> {
    pub mode: ValidationMode,
    /// Labels assigned by the annotator in this run, when known.
    pub known_labels: Option<&'a [u32]>,
}

/// Slice from the first `{` to the last `}`.
pub fn extract_json_block(raw: &str) -> Option<&str> {
    let start = raw.find('{')?;
    let end = raw.rfind('}')?;
    (end > start).then(|| &raw[start..=end])
}

/// Turn raw model output into a validated result, or an error record that
/// carries the raw text.
pub fn parse_model_output(raw: &str, opts: ParseOptions<'_>) -> Result<AnalysisResult, ErrorRecord> {
    parse_inner(raw, opts).map_err(|reason| {
        warn!(%reason, "error parsing MLLM output");
        debug!("raw MLLM output:\n{raw}");
        ErrorRecord::new(PARSE_FAILURE_MESSAGE)
            .with_details(reason)
            .with_raw_output(raw)
    })
}

fn parse_inner(raw: &str, opts: ParseOptions<'_>) -> Result<AnalysisResult, String> {
    let block = extract_json_block(raw).ok_or("JSON block not found in the output.")?;
    let value: Value =
        serde_json::from_str(block).map_err(|err| format!("invalid JSON: {err}"))?;
    let obj = value
        .as_object()
        .ok_or("the generated JSON is not an object.")?;

    let missing: Vec<&str> = REQUIRED_KEYS
        .iter()
        .copied()
        .filter(|key| !obj.contains_key(*key))
        .collect();
    if !missing.is_empty() {
        return Err(format!(
            "the generated JSON is missing required keys: {}",
            missing.join(", ")
        ));
    }

    let mismatch_detected = match obj.get("mismatch_detected").and_then(Value::as_str) {
        Some(s) if s.eq_ignore_ascii_case("yes") => MismatchDetected::Yes,
        Some(s) if s.eq_ignore_ascii_case("no") => MismatchDetected::No,
        _ => return Err("`mismatch_detected` must be 'Yes' or 'No'.".to_string()),
    };

    let confidence_score = obj
        .get("confidence_score")
        .and_then(Value::as_f64)
        .ok_or("`confidence_score` must be a number.")?;
    if opts.mode == ValidationMode::Strict && !(0.0..=1.0).contains(&confidence_score) {
        return Err(format!(
            "`confidence_score` must be between 0.0 and 1.0, got {confidence_score}."
        ));
    }

    let mismatch_type = mismatch_type_field(obj, opts.mode)?;
    let rationale = match obj.get("rationale") {
        Some(Value::String(s)) => s.clone(),
        Some(other) if opts.mode == ValidationMode::Lenient => other.to_string(),
        _ => return Err("`rationale` must be a string.".to_string()),
    };
    let relevant_widget_id = widget_id_field(obj, opts)?;

    Ok(AnalysisResult {
        mismatch_detected,
        confidence_score,
        mismatch_type,
        rationale,
        relevant_widget_id,
    })
}

fn mismatch_type_field(obj: &Map<String, Value>, mode: ValidationMode) -> Result<MismatchType, String> {
    let value = obj.get("mismatch_type").unwrap_or(&NULL);
    if let Some(parsed) = value.as_str().and_then(MismatchType::from_label) {
        return Ok(parsed);
    }
    match (mode, value) {
        (ValidationMode::Strict, _) => Err(format!(
            "`mismatch_type` must be one of 'Non-Functional Element', 'Feature Misrepresentation', 'Visual Glitch', 'None'; got {value}."
        )),
        (ValidationMode::Lenient, Value::Null) => Ok(MismatchType::None),
        (ValidationMode::Lenient, Value::String(s)) => {
            warn!(mismatch_type = %s, "unrecognized mismatch_type kept verbatim");
            Ok(MismatchType::Other(s.clone()))
        }
        (ValidationMode::Lenient, other) => Ok(MismatchType::Other(other.to_string())),
    }
}

fn widget_id_field(obj: &Map<String, Value>, opts: ParseOptions<'_>) -> Result<Option<u32>, String> {
    let value = obj.get("relevant_widget_id").unwrap_or(&NULL);
    let id = match value {
        Value::Null => return Ok(None),
        Value::Number(n) => n
            .as_u64()
            .or_else(|| n.as_f64().filter(|f| f.fract() == 0.0 && *f >= 0.0).map(|f| f as u64))
            .and_then(|v| u32::try_from(v).ok()),
        Value::String(s) if opts.mode == ValidationMode::Lenient => s.trim().parse::<u32>().ok(),
        _ => None,
    };

    let Some(id) = id else {
        if opts.mode == ValidationMode::Strict {
            return Err(format!(
                "`relevant_widget_id` must be a widget label or null, got {value}."
            ));
        }
        warn!(%value, "ignoring non-integer relevant_widget_id");
        return Ok(None);
    };

    let assigned = opts.known_labels.map_or(true, |labels| labels.contains(&id));
    if !assigned {
        if opts.mode == ValidationMode::Strict {
            return Err(format!(
                "`relevant_widget_id` {id} does not match any annotated widget."
            ));
        }
        warn!(id, "relevant_widget_id does not match any annotated widget");
    }
    Ok(Some(id))
}
