use crate::annotate::{annotate_screenshot, AnnotatedWidget, SkipDiagnostic};
use crate::config::Settings;
use crate::error::AnalysisError;
use crate::invoker::{CommandInvoker, ModelInvoker};
use crate::prompt::build_analysis_prompt;
use crate::response::{parse_model_output, AnalysisResult, ParseOptions, ValidationMode};
use crate::review::{segment_review, KeywordSelector, SnippetSelector};
use crate::util::{run_id, slugify, timestamp_iso, write_text_file};
use crate::widgets::load_widgets;
use serde::Serialize;
use std::path::{Path, PathBuf};
use tracing::{error, info, warn};

/// Caller-supplied inputs for one analysis.
#[derive(Debug, Clone, Copy)]
pub struct AnalysisInput<'a> {
    pub screenshot: Option<&'a Path>,
    pub review: &'a str,
    pub xml: Option<&'a Path>,
}

/// What the prompt builder and the model invoker consume.
#[derive(Debug, Clone)]
pub struct AnalysisRequest {
    pub annotated_image: PathBuf,
    pub widget_descriptions: Vec<String>,
    pub review_snippet: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct AnalysisReport {
    pub generated_at: String,
    pub model: String,
    pub validation: ValidationMode,
    pub review_snippet: String,
    pub sentences: Vec<String>,
    pub widget_count: usize,
    pub annotated_image: PathBuf,
    pub prompt_path: PathBuf,
    pub raw_output_path: PathBuf,
    pub widgets: Vec<AnnotatedWidget>,
    pub skipped: Vec<SkipDiagnostic>,
    pub result: AnalysisResult,
}

/// Settings, model invoker and snippet selector, built once and shared
/// read-only across requests.
pub struct Analyzer {
    settings: Settings,
    invoker: Box<dyn ModelInvoker>,
    selector: Box<dyn SnippetSelector>,
    out_dir: PathBuf,
}

impl Analyzer {
    pub fn new(
        settings: Settings,
        invoker: Box<dyn ModelInvoker>,
        selector: Box<dyn SnippetSelector>,
        out_dir: PathBuf,
    ) -> Self {
        Self {
            settings,
            invoker,
            selector,
            out_dir,
        }
    }

    /// Load settings and resolve the model command. Any failure here is
    /// fatal for the process's analyzer.
    pub fn initialize(config_path: &Path, out_dir: PathBuf) -> Result<Self, AnalysisError> {
        let settings = Settings::load(config_path)?;
        let invoker = CommandInvoker::from_settings(&settings.mllm)?;
        let selector = KeywordSelector::new(settings.analysis.keywords.clone());
        Ok(Self::new(settings, Box::new(invoker), Box::new(selector), out_dir))
    }

    pub fn analyze(&self, input: &AnalysisInput<'_>) -> Result<AnalysisReport, AnalysisError> {
        let screenshot = input.screenshot.ok_or(AnalysisError::MissingImage)?;
        if input.review.trim().is_empty() {
            return Err(AnalysisError::EmptyReview);
        }

        let sentences = segment_review(input.review);
        let review_snippet = self.selector.select(&sentences);
        if review_snippet.is_empty() {
            return Err(AnalysisError::EmptyReview);
        }
        info!(selector = self.selector.name(), snippet = %review_snippet, "selected review snippet");

        let widgets = input.xml.map(load_widgets).unwrap_or_default();

        let stem = screenshot
            .file_stem()
            .and_then(|s| s.to_str())
            .map(slugify)
            .unwrap_or_else(|| "screenshot".to_string());
        let base = self.out_dir.join(format!("{stem}-{}", run_id()));
        let annotated_path = with_suffix(&base, "-annotated.png");
        let prompt_path = with_suffix(&base, "-prompt.txt");
        let raw_output_path = with_suffix(&base, "-raw.txt");

        let annotation = annotate_screenshot(screenshot, &widgets, &annotated_path)?;
        info!(
            widgets = widgets.len(),
            annotated = annotation.widgets.len(),
            skipped = annotation.skipped.len(),
            path = %annotation.image_path.display(),
            "annotated screenshot"
        );

        let request = AnalysisRequest {
            annotated_image: annotation.image_path.clone(),
            widget_descriptions: annotation.descriptions(),
            review_snippet,
        };
        let prompt = build_analysis_prompt(&request.widget_descriptions, &request.review_snippet);
        write_text_file(&prompt_path, &prompt).map_err(|err| {
            AnalysisError::io(format!("failed to write prompt: {}", prompt_path.display()), err)
        })?;

        info!(model = %self.invoker.describe(), "performing MLLM analysis");
        let raw = self
            .invoker
            .generate(&request.annotated_image, &prompt)
            .inspect_err(|err| error!("MLLM generation failed: {err}"))?;
        if let Err(err) = write_text_file(&raw_output_path, &raw) {
            warn!("failed to keep raw MLLM output at {}: {err}", raw_output_path.display());
        }

        let labels = annotation.labels();
        let result = parse_model_output(
            &raw,
            ParseOptions {
                mode: self.settings.analysis.validation,
                known_labels: Some(&labels),
            },
        )
        .map_err(AnalysisError::Response)?;
        info!(
            mismatch = ?result.mismatch_detected,
            confidence = result.confidence_score,
            "analysis complete"
        );

        Ok(AnalysisReport {
            generated_at: timestamp_iso(),
            model: self.invoker.describe(),
            validation: self.settings.analysis.validation,
            review_snippet: request.review_snippet,
            sentences,
            widget_count: widgets.len(),
            annotated_image: annotation.image_path,
            prompt_path,
            raw_output_path,
            widgets: annotation.widgets,
            skipped: annotation.skipped,
            result,
        })
    }
}

fn with_suffix(base: &Path, suffix: &str) -> PathBuf {
    let mut name = base.as_os_str().to_os_string();
    name.push(suffix);
    PathBuf::from(name)
}

/// Outcome of process startup. An unavailable analyzer answers every
/// request with the startup failure instead of retrying.
pub enum AnalyzerState {
    Ready(Analyzer),
    Unavailable(String),
}

impl AnalyzerState {
    pub fn start(config_path: &Path, out_dir: PathBuf) -> Self {
        match Analyzer::initialize(config_path, out_dir) {
            Ok(analyzer) => {
                info!("analyzer initialized");
                Self::Ready(analyzer)
            }
            Err(err) => {
                error!("FATAL: could not initialize the MLLM analyzer: {err}");
                Self::Unavailable(err.to_string())
            }
        }
    }

    pub fn analyze(&self, input: &AnalysisInput<'_>) -> Result<AnalysisReport, AnalysisError> {
        match self {
            Self::Ready(analyzer) => analyzer.analyze(input),
            Self::Unavailable(reason) => Err(AnalysisError::AnalyzerUnavailable(format!(
                "{reason}. Check server logs for initialization errors."
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::annotate::CLICKABLE_COLOR;
    use crate::error::PARSE_FAILURE_MESSAGE;
    use crate::response::MismatchDetected;
    use image::{Rgba, RgbaImage};
    use std::fs;
    use std::sync::{Arc, Mutex};
    use tempfile::{tempdir, TempDir};

    const SETTINGS: &str = "mllm:\n  model_name: stub\n  device: cpu\n  max_new_tokens: 128\n";
    const GOOD_OUTPUT: &str = r#"Here is my analysis:
{"mismatch_detected": "Yes", "confidence_score": 0.85, "mismatch_type": "Non-Functional Element", "rationale": "The login button is visible and clickable but the user says it does nothing.", "relevant_widget_id": 1}"#;

    struct StubInvoker {
        reply: Result<String, String>,
        prompts: Mutex<Vec<(PathBuf, String)>>,
    }

    impl StubInvoker {
        fn replying(reply: &str) -> Self {
            Self {
                reply: Ok(reply.to_string()),
                prompts: Mutex::new(Vec::new()),
            }
        }

        fn failing(details: &str) -> Self {
            Self {
                reply: Err(details.to_string()),
                prompts: Mutex::new(Vec::new()),
            }
        }
    }

    struct SharedStub(Arc<StubInvoker>);

    impl ModelInvoker for SharedStub {
        fn describe(&self) -> String {
            "stub".to_string()
        }

        fn generate(&self, image: &Path, prompt: &str) -> Result<String, AnalysisError> {
            self.0
                .prompts
                .lock()
                .unwrap()
                .push((image.to_path_buf(), prompt.to_string()));
            self.0.reply.clone().map_err(|details| AnalysisError::Generation { details })
        }
    }

    fn analyzer(stub: &Arc<StubInvoker>, out_dir: &Path) -> Analyzer {
        analyzer_with(SETTINGS, stub, out_dir)
    }

    fn analyzer_with(settings: &str, stub: &Arc<StubInvoker>, out_dir: &Path) -> Analyzer {
        Analyzer::new(
            Settings::from_yaml(settings).unwrap(),
            Box::new(SharedStub(Arc::clone(stub))),
            Box::new(KeywordSelector::default()),
            out_dir.to_path_buf(),
        )
    }

    fn fixtures() -> (TempDir, PathBuf, PathBuf) {
        let dir = tempdir().unwrap();
        let shot = dir.path().join("login.png");
        RgbaImage::from_pixel(300, 400, Rgba([250, 250, 250, 255]))
            .save(&shot)
            .unwrap();
        let xml = dir.path().join("login.xml");
        fs::write(
            &xml,
            r#"<hierarchy>
  <node class="android.widget.FrameLayout" bounds="[0,0][300,400]">
    <node class="android.widget.Button" text="" resource-id="com.app:id/login" clickable="true" bounds="[50,200][250,260]" />
  </node>
</hierarchy>"#,
        )
        .unwrap();
        (dir, shot, xml)
    }

    #[test]
    fn end_to_end_grounds_the_login_complaint() {
        let (dir, shot, xml) = fixtures();
        let stub = Arc::new(StubInvoker::replying(GOOD_OUTPUT));
        let analyzer = analyzer(&stub, &dir.path().join("out"));

        let report = analyzer
            .analyze(&AnalysisInput {
                screenshot: Some(&shot),
                review: "The login button does nothing when I tap it.",
                xml: Some(&xml),
            })
            .unwrap();

        assert_eq!(report.widget_count, 2);
        assert_eq!(report.widgets.len(), 1);
        assert_eq!(report.widgets[0].label, 1);
        assert_eq!(report.result.mismatch_detected, MismatchDetected::Yes);
        assert_eq!(report.result.relevant_widget_id, Some(1));

        let prompts = stub.prompts.lock().unwrap();
        assert_eq!(prompts.len(), 1);
        let (image, prompt) = &prompts[0];
        assert_eq!(image, &report.annotated_image);
        assert!(prompt.contains("does nothing when i tap it."));
        assert!(prompt.contains(&report.widgets[0].description));
        assert!(report.widgets[0].description.starts_with("label 1: class=android.widget.Button"));

        let annotated = image::open(&report.annotated_image).unwrap().to_rgba8();
        assert_eq!(annotated.dimensions(), (300, 400));
        assert_eq!(*annotated.get_pixel(250, 230), CLICKABLE_COLOR);
        assert_eq!(*annotated.get_pixel(150, 230), Rgba([250, 250, 250, 255]));
        assert_eq!(fs::read_to_string(&report.prompt_path).unwrap(), *prompt);
        assert_eq!(fs::read_to_string(&report.raw_output_path).unwrap(), GOOD_OUTPUT);
    }

    #[test]
    fn missing_xml_proceeds_without_widgets() {
        let (dir, shot, _) = fixtures();
        let stub = Arc::new(StubInvoker::replying(GOOD_OUTPUT));
        let analyzer = analyzer(&stub, dir.path());
        let missing = dir.path().join("absent.xml");

        let report = analyzer
            .analyze(&AnalysisInput {
                screenshot: Some(&shot),
                review: "Everything is stuck.",
                xml: Some(&missing),
            })
            .unwrap();
        assert!(report.widgets.is_empty());
        let prompts = stub.prompts.lock().unwrap();
        assert!(prompts[0].1.contains("No widget details extracted."));
    }

    #[test]
    fn input_errors_are_rejected_before_the_model_runs() {
        let (dir, shot, _) = fixtures();
        let stub = Arc::new(StubInvoker::replying(GOOD_OUTPUT));
        let analyzer = analyzer(&stub, dir.path());

        let no_image = analyzer.analyze(&AnalysisInput {
            screenshot: None,
            review: "broken",
            xml: None,
        });
        assert!(matches!(no_image, Err(AnalysisError::MissingImage)));

        let empty_review = analyzer.analyze(&AnalysisInput {
            screenshot: Some(&shot),
            review: "   \n",
            xml: None,
        });
        assert!(matches!(empty_review, Err(AnalysisError::EmptyReview)));
        assert!(stub.prompts.lock().unwrap().is_empty());
    }

    #[test]
    fn corrupt_screenshot_aborts_the_request() {
        let (dir, _, _) = fixtures();
        let bad = dir.path().join("bad.png");
        fs::write(&bad, b"\x89PNG truncated").unwrap();
        let stub = Arc::new(StubInvoker::replying(GOOD_OUTPUT));
        let result = analyzer(&stub, dir.path()).analyze(&AnalysisInput {
            screenshot: Some(&bad),
            review: "It crashed.",
            xml: None,
        });
        assert!(matches!(result, Err(AnalysisError::UnreadableImage { .. })));
        assert!(stub.prompts.lock().unwrap().is_empty());
    }

    #[test]
    fn generation_failure_carries_the_underlying_message() {
        let (dir, shot, _) = fixtures();
        let stub = Arc::new(StubInvoker::failing("device lost"));
        let err = analyzer(&stub, dir.path())
            .analyze(&AnalysisInput {
                screenshot: Some(&shot),
                review: "It crashed.",
                xml: None,
            })
            .unwrap_err();
        assert_eq!(err.to_record().details.as_deref(), Some("device lost"));
    }

    #[test]
    fn unparseable_reply_returns_raw_output() {
        let (dir, shot, _) = fixtures();
        let stub = Arc::new(StubInvoker::replying("I think there is a mismatch."));
        let err = analyzer(&stub, dir.path())
            .analyze(&AnalysisInput {
                screenshot: Some(&shot),
                review: "It crashed.",
                xml: None,
            })
            .unwrap_err();
        let record = err.to_record();
        assert_eq!(record.error, PARSE_FAILURE_MESSAGE);
        assert_eq!(record.raw_output.as_deref(), Some("I think there is a mismatch."));
    }

    #[test]
    fn unavailable_analyzer_answers_every_request() {
        let dir = tempdir().unwrap();
        let state = AnalyzerState::start(&dir.path().join("config.yaml"), dir.path().to_path_buf());
        assert!(matches!(state, AnalyzerState::Unavailable(_)));
        for _ in 0..2 {
            let err = state
                .analyze(&AnalysisInput {
                    screenshot: None,
                    review: "",
                    xml: None,
                })
                .unwrap_err();
            assert!(matches!(err, AnalysisError::AnalyzerUnavailable(ref msg) if msg.contains("not found")));
        }
    }

    #[test]
    fn strict_settings_reject_a_widget_id_that_was_never_drawn() {
        let (dir, shot, xml) = fixtures();
        let strict_settings = format!("{SETTINGS}analysis:\n  validation: strict\n");
        let reply = GOOD_OUTPUT.replace("\"relevant_widget_id\": 1", "\"relevant_widget_id\": 7");
        let input = AnalysisInput {
            screenshot: Some(&shot),
            review: "The login button does nothing.",
            xml: Some(&xml),
        };

        let strict_stub = Arc::new(StubInvoker::replying(&reply));
        let err = analyzer_with(&strict_settings, &strict_stub, dir.path())
            .analyze(&input)
            .unwrap_err();
        let record = err.to_record();
        assert_eq!(record.error, PARSE_FAILURE_MESSAGE);
        assert!(record.details.unwrap().contains("does not match any annotated widget"));
        assert_eq!(record.raw_output.as_deref(), Some(reply.as_str()));

        let lenient_stub = Arc::new(StubInvoker::replying(&reply));
        let report = analyzer(&lenient_stub, dir.path()).analyze(&input).unwrap();
        assert_eq!(report.validation, ValidationMode::Lenient);
        assert_eq!(report.result.relevant_widget_id, Some(7));
    }
}
