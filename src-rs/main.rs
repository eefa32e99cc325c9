mod analyzer;
mod annotate;
mod config;
mod error;
mod invoker;
mod prompt;
mod response;
mod review;
mod util;
mod widgets;

use analyzer::{AnalysisInput, AnalyzerState};
use anyhow::{bail, Context, Result};
use clap::{ArgAction, Args, Parser, Subcommand};
use config::{Settings, DEFAULT_CONFIG_PATH};
use review::{segment_review, KeywordSelector, SnippetSelector};
use response::{parse_model_output, ParseOptions, ValidationMode};
use serde::Deserialize;
use serde_json::{json, Value};
use std::fs;
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use util::{abs_path, default_sidecar_for, out_root, run_id, timestamp_iso, write_json_pretty};

const CASES_HELP: &str = r##"Batch cases JSON (relative paths resolve against the cases file):
[
  {"id": "login", "screenshot": "login.png", "review": "The login button does nothing.", "xml": "login.xml"},
  {"id": "dark-mode", "screenshot": "settings.png", "review": "I can't find dark mode."}
]
"##;

#[derive(Parser, Debug)]
#[command(
    name = "vipra-ui",
    version,
    about = "Detect mismatches between a mobile UI screenshot and a user review with a grounded vision-language model"
)]
struct Cli {
    /// Increase log verbosity (-v info, -vv debug); RUST_LOG overrides
    #[arg(short, long, global = true, action = ArgAction::Count)]
    verbose: u8,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
#[allow(clippy::enum_variant_names)]
enum Commands {
    /// Print supported commands in JSON
    Commands,
    /// Run the full pipeline on one screenshot/review pair
    Analyze(AnalyzeArgs),
    /// Run the full pipeline over a JSON list of cases with one analyzer
    Batch(BatchArgs),
    /// Dump widget records extracted from a view hierarchy XML
    Widgets(WidgetsArgs),
    /// Draw numbered widget boxes on a screenshot
    Annotate(AnnotateArgs),
    /// Split a review into sentences and select the complaint snippet
    Segment(SegmentArgs),
    /// Render the analysis prompt without invoking a model
    Prompt(PromptArgs),
    /// Parse and validate a saved raw model output
    Parse(ParseArgs),
}

#[derive(Args, Debug)]
struct ReviewSource {
    /// Review text
    #[arg(long)]
    review: Option<String>,
    /// Read the review text from a file (or - for stdin)
    #[arg(long, conflicts_with = "review")]
    review_file: Option<String>,
}

#[derive(Args, Debug)]
struct AnalyzeArgs {
    /// Screenshot image path
    #[arg(long)]
    screenshot: Option<PathBuf>,
    #[command(flatten)]
    review: ReviewSource,
    /// Optional view hierarchy XML
    #[arg(long)]
    xml: Option<PathBuf>,
    /// Settings YAML path
    #[arg(long, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,
    /// Artifact directory (default: VIPRA_OUT_DIR / .vipra-ui)
    #[arg(long)]
    out_dir: Option<PathBuf>,
    /// Report JSON path (default: next to the annotated image)
    #[arg(long)]
    report_out: Option<PathBuf>,
    /// Print the full report instead of only the analysis result
    #[arg(long, action = ArgAction::SetTrue)]
    json: bool,
}

#[derive(Args, Debug)]
struct BatchArgs {
    /// Cases JSON path
    #[arg(long, required_unless_present = "cases_help")]
    cases: Option<PathBuf>,
    /// Settings YAML path
    #[arg(long, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,
    /// Artifact directory (default: VIPRA_OUT_DIR / .vipra-ui)
    #[arg(long)]
    out_dir: Option<PathBuf>,
    /// Exit non-zero when any case fails
    #[arg(long, action = ArgAction::SetTrue)]
    strict: bool,
    /// Print cases schema and exit
    #[arg(long, action = ArgAction::SetTrue)]
    cases_help: bool,
}

#[derive(Args, Debug)]
struct WidgetsArgs {
    /// View hierarchy XML path
    xml: PathBuf,
    /// Output JSON path (default: stdout)
    #[arg(long)]
    out: Option<PathBuf>,
}

#[derive(Args, Debug)]
struct AnnotateArgs {
    /// Input screenshot path
    input: PathBuf,
    /// Output PNG path
    output: PathBuf,
    /// View hierarchy XML path
    #[arg(long)]
    xml: Option<PathBuf>,
    /// Path to write annotation metadata sidecar (default: <output>.json)
    #[arg(long)]
    meta_out: Option<PathBuf>,
    /// Disable metadata sidecar output
    #[arg(long, action = ArgAction::SetTrue)]
    no_meta: bool,
}

#[derive(Args, Debug)]
struct SegmentArgs {
    #[command(flatten)]
    review: ReviewSource,
    /// Settings YAML to take the keyword list from
    #[arg(long)]
    config: Option<PathBuf>,
}

#[derive(Args, Debug)]
struct PromptArgs {
    #[command(flatten)]
    review: ReviewSource,
    /// View hierarchy XML path
    #[arg(long)]
    xml: Option<PathBuf>,
    /// Output text path (default: stdout)
    #[arg(long)]
    out: Option<PathBuf>,
}

#[derive(Args, Debug)]
struct ParseArgs {
    /// Raw model output file (or - for stdin)
    #[arg(default_value = "-")]
    input: String,
    /// Enforce the full response schema
    #[arg(long, action = ArgAction::SetTrue)]
    strict: bool,
    /// Comma-separated widget labels assigned in the run
    #[arg(long, value_delimiter = ',')]
    labels: Option<Vec<u32>>,
}

#[derive(Debug, Deserialize)]
struct BatchCase {
    #[serde(default)]
    id: Option<String>,
    screenshot: Option<PathBuf>,
    #[serde(default)]
    review: String,
    #[serde(default)]
    xml: Option<PathBuf>,
}

fn main() {
    let cli = Cli::parse();
    init_logging(cli.verbose);
    if let Err(err) = run(cli) {
        eprintln!("error: {err:#}");
        std::process::exit(1);
    }
}

fn init_logging(verbose: u8) {
    let level = match verbose {
        0 => "warn",
        1 => "info",
        _ => "debug",
    };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("vipra_ui={level}")));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .with_target(false)
        .init();
}

fn run(cli: Cli) -> Result<()> {
    match cli.command {
        Commands::Commands => print_commands(),
        Commands::Analyze(args) => command_analyze(args),
        Commands::Batch(args) => command_batch(args),
        Commands::Widgets(args) => command_widgets(args),
        Commands::Annotate(args) => command_annotate(args),
        Commands::Segment(args) => command_segment(args),
        Commands::Prompt(args) => command_prompt(args),
        Commands::Parse(args) => command_parse(args),
    }
}

fn print_commands() -> Result<()> {
    let rows = vec![
        json!({
            "name": "analyze",
            "description": "Segment review, annotate screenshot, prompt the MLLM and validate its JSON verdict."
        }),
        json!({
            "name": "batch",
            "description": "Analyze a list of screenshot/review cases against one analyzer instance."
        }),
        json!({
            "name": "widgets",
            "description": "Extract widget records from a view hierarchy XML."
        }),
        json!({
            "name": "annotate",
            "description": "Draw numbered boxes for clickable or text-bearing widgets."
        }),
        json!({
            "name": "segment",
            "description": "Split a review into sentences and select the functional complaint."
        }),
        json!({
            "name": "prompt",
            "description": "Render the grounded analysis prompt without a model call."
        }),
        json!({
            "name": "parse",
            "description": "Extract and validate the JSON verdict from raw model output."
        }),
    ];

    println!(
        "{}",
        serde_json::to_string_pretty(&json!({ "commands": rows }))?
    );
    Ok(())
}

fn command_analyze(args: AnalyzeArgs) -> Result<()> {
    let review = read_review(&args.review)?;
    let out_dir = args.out_dir.clone().unwrap_or_else(|| out_root().join("analyze"));
    let state = AnalyzerState::start(&args.config, out_dir);

    let outcome = state.analyze(&AnalysisInput {
        screenshot: args.screenshot.as_deref(),
        review: &review,
        xml: args.xml.as_deref(),
    });

    let report = match outcome {
        Ok(report) => report,
        Err(err) => {
            let record = err.to_record();
            if args.json {
                println!("{}", serde_json::to_string_pretty(&record)?);
            }
            bail!("{}", record.user_message());
        }
    };

    let report_path = args
        .report_out
        .clone()
        .unwrap_or_else(|| default_sidecar_for(&report.annotated_image));
    write_json_pretty(&report_path, &report)?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        println!("{}", serde_json::to_string_pretty(&report.result)?);
    }
    eprintln!(
        "annotated image: {}",
        abs_path(&report.annotated_image).display()
    );
    eprintln!("report: {}", abs_path(&report_path).display());
    Ok(())
}

fn command_batch(args: BatchArgs) -> Result<()> {
    if args.cases_help {
        println!("{}", CASES_HELP.trim());
        return Ok(());
    }
    let Some(cases_path) = args.cases.as_deref() else {
        bail!("--cases is required");
    };

    let raw = fs::read_to_string(cases_path)
        .with_context(|| format!("failed to read cases file: {}", cases_path.display()))?;
    let cases: Vec<BatchCase> = serde_json::from_str(&raw)
        .with_context(|| format!("invalid cases JSON: {}", cases_path.display()))?;
    let base_dir = cases_path.parent().unwrap_or_else(|| Path::new(""));

    let out_dir = args
        .out_dir
        .clone()
        .unwrap_or_else(|| out_root().join("batch"));
    let state = AnalyzerState::start(&args.config, out_dir.clone());

    let mut rows: Vec<Value> = Vec::with_capacity(cases.len());
    let mut failures = 0usize;
    for (index, case) in cases.iter().enumerate() {
        let id = case
            .id
            .clone()
            .unwrap_or_else(|| format!("case-{}", index + 1));
        let screenshot = case.screenshot.as_ref().map(|p| base_dir.join(p));
        let xml = case.xml.as_ref().map(|p| base_dir.join(p));
        info!(case = %id, "analyzing case");

        let outcome = state.analyze(&AnalysisInput {
            screenshot: screenshot.as_deref(),
            review: &case.review,
            xml: xml.as_deref(),
        });
        match outcome {
            Ok(report) => {
                let report_path = default_sidecar_for(&report.annotated_image);
                write_json_pretty(&report_path, &report)?;
                rows.push(json!({
                    "id": id,
                    "ok": true,
                    "mismatch": report.result.mismatch_detected.is_yes(),
                    "result": report.result,
                    "annotated_image": abs_path(&report.annotated_image).display().to_string(),
                    "report_path": abs_path(&report_path).display().to_string(),
                }));
            }
            Err(err) => {
                failures += 1;
                warn!(case = %id, "case failed: {err}");
                rows.push(json!({
                    "id": id,
                    "ok": false,
                    "input_error": err.is_input_error(),
                    "error": err.to_record(),
                }));
            }
        }
    }

    let summary = json!({
        "generated_at": timestamp_iso(),
        "cases_path": abs_path(cases_path).display().to_string(),
        "case_count": cases.len(),
        "failed": failures,
        "cases": rows,
    });
    let summary_path = out_dir.join(format!("batch-{}.json", run_id()));
    write_json_pretty(&summary_path, &summary)?;
    println!("{}", serde_json::to_string_pretty(&summary)?);

    if args.strict && failures > 0 {
        bail!("{failures} of {} cases failed", cases.len());
    }
    Ok(())
}

fn command_widgets(args: WidgetsArgs) -> Result<()> {
    if !args.xml.exists() {
        bail!("xml not found: {}", args.xml.display());
    }
    let records = widgets::load_widgets(&args.xml);
    let notable = records.iter().filter(|w| w.is_notable()).count();
    let payload = json!({
        "source": abs_path(&args.xml).display().to_string(),
        "extracted_at": timestamp_iso(),
        "element_count": records.len(),
        "notable_count": notable,
        "elements": records,
    });

    match args.out {
        Some(out) => {
            write_json_pretty(&out, &payload)?;
            println!("{}", abs_path(&out).display());
        }
        None => println!("{}", serde_json::to_string_pretty(&payload)?),
    }
    Ok(())
}

fn command_annotate(args: AnnotateArgs) -> Result<()> {
    if !args.input.exists() {
        bail!("input not found: {}", args.input.display());
    }
    let records = args
        .xml
        .as_deref()
        .map(widgets::load_widgets)
        .unwrap_or_default();
    let annotation = annotate::annotate_screenshot(&args.input, &records, &args.output)?;

    if !args.no_meta {
        let meta_path = args
            .meta_out
            .clone()
            .unwrap_or_else(|| default_sidecar_for(&args.output));
        let payload = json!({
            "annotation_meta_version": 1,
            "input_path": abs_path(&args.input).display().to_string(),
            "output_path": abs_path(&args.output).display().to_string(),
            "meta_path": abs_path(&meta_path).display().to_string(),
            "generated_at": timestamp_iso(),
            "size": {"width": annotation.width, "height": annotation.height, "units": "px"},
            "descriptions": annotation.descriptions(),
            "widgets": annotation.widgets,
            "skipped": annotation.skipped,
        });
        write_json_pretty(&meta_path, &payload)?;
    }

    println!("{}", abs_path(&args.output).display());
    Ok(())
}

fn command_segment(args: SegmentArgs) -> Result<()> {
    let review = read_review(&args.review)?;
    let selector = match args.config.as_deref() {
        Some(path) => KeywordSelector::new(Settings::load(path)?.analysis.keywords),
        None => KeywordSelector::default(),
    };
    let sentences = segment_review(&review);
    let snippet = selector.select(&sentences);
    println!(
        "{}",
        serde_json::to_string_pretty(&json!({
            "selector": selector.name(),
            "keywords": selector.keywords(),
            "sentences": sentences,
            "snippet": snippet,
        }))?
    );
    Ok(())
}

fn command_prompt(args: PromptArgs) -> Result<()> {
    let review = read_review(&args.review)?;
    let snippet = KeywordSelector::default().select(&segment_review(&review));
    if snippet.is_empty() {
        bail!("review is empty");
    }
    let records = args
        .xml
        .as_deref()
        .map(widgets::load_widgets)
        .unwrap_or_default();
    let (annotated, skipped) = annotate::plan_annotations(&records, None);
    for skip in &skipped {
        warn!(index = skip.index, "widget skipped: {}", skip.reason);
    }
    let descriptions: Vec<String> = annotated.into_iter().map(|w| w.description).collect();
    let text = prompt::build_analysis_prompt(&descriptions, &snippet);

    match args.out {
        Some(out) => {
            util::write_text_file(&out, &text)
                .with_context(|| format!("failed to write prompt: {}", out.display()))?;
            println!("{}", abs_path(&out).display());
        }
        None => print!("{text}"),
    }
    Ok(())
}

fn command_parse(args: ParseArgs) -> Result<()> {
    let raw = read_text_arg(&args.input)?;
    let opts = ParseOptions {
        mode: if args.strict {
            ValidationMode::Strict
        } else {
            ValidationMode::Lenient
        },
        known_labels: args.labels.as_deref(),
    };
    match parse_model_output(&raw, opts) {
        Ok(result) => {
            println!("{}", serde_json::to_string_pretty(&result)?);
            Ok(())
        }
        Err(record) => {
            println!("{}", serde_json::to_string_pretty(&record)?);
            bail!("{}", record.error);
        }
    }
}

fn read_review(source: &ReviewSource) -> Result<String> {
    match (&source.review, &source.review_file) {
        (Some(text), _) => Ok(text.clone()),
        (None, Some(path)) => read_text_arg(path),
        (None, None) => Ok(String::new()),
    }
}

fn read_text_arg(path: &str) -> Result<String> {
    if path == "-" {
        let mut buf = String::new();
        io::stdin()
            .read_to_string(&mut buf)
            .context("failed to read stdin")?;
        return Ok(buf);
    }
    fs::read_to_string(path).with_context(|| format!("failed to read file: {path}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_parses_analyze_arguments() {
        let cli = Cli::try_parse_from([
            "vipra-ui",
            "-v",
            "analyze",
            "--screenshot",
            "shot.png",
            "--review",
            "It crashed.",
            "--xml",
            "ui.xml",
            "--json",
        ])
        .unwrap();
        assert_eq!(cli.verbose, 1);
        let Commands::Analyze(args) = cli.command else {
            panic!("expected analyze");
        };
        assert_eq!(args.screenshot, Some(PathBuf::from("shot.png")));
        assert_eq!(args.review.review.as_deref(), Some("It crashed."));
        assert_eq!(args.config, PathBuf::from(DEFAULT_CONFIG_PATH));
        assert!(args.json);
    }

    #[test]
    fn review_and_review_file_conflict() {
        let parsed = Cli::try_parse_from([
            "vipra-ui",
            "segment",
            "--review",
            "a",
            "--review-file",
            "b.txt",
        ]);
        assert!(parsed.is_err());
    }

    #[test]
    fn parse_accepts_label_list() {
        let cli = Cli::try_parse_from(["vipra-ui", "parse", "out.txt", "--strict", "--labels", "1,2,3"])
            .unwrap();
        let Commands::Parse(args) = cli.command else {
            panic!("expected parse");
        };
        assert!(args.strict);
        assert_eq!(args.labels, Some(vec![1, 2, 3]));
    }

    #[test]
    fn batch_cases_default_optional_fields() {
        let cases: Vec<BatchCase> =
            serde_json::from_str(r#"[{"screenshot": "a.png"}, {"id": "x", "review": "r", "xml": "a.xml"}]"#)
                .unwrap();
        assert_eq!(cases[0].review, "");
        assert!(cases[0].id.is_none());
        assert_eq!(cases[1].xml, Some(PathBuf::from("a.xml")));
    }

    #[test]
    fn missing_review_reads_as_empty() {
        let source = ReviewSource {
            review: None,
            review_file: None,
        };
        assert_eq!(read_review(&source).unwrap(), "");
    }

    #[cfg(unix)]
    fn batch_fixture(dir: &Path) -> (PathBuf, PathBuf) {
        use std::os::unix::fs::PermissionsExt;

        let model = dir.join("model.sh");
        fs::write(
            &model,
            "#!/bin/sh\ncat > /dev/null\necho '{\"mismatch_detected\": \"No\", \"confidence_score\": 0.4, \"mismatch_type\": \"None\", \"rationale\": \"Matches the screen.\", \"relevant_widget_id\": null}'\n",
        )
        .unwrap();
        fs::set_permissions(&model, fs::Permissions::from_mode(0o755)).unwrap();

        let config = dir.join("config.yaml");
        fs::write(
            &config,
            format!(
                "mllm:\n  model_name: stub\n  device: cpu\n  max_new_tokens: 64\n  command: \"{}\"\n",
                model.display()
            ),
        )
        .unwrap();

        image::RgbaImage::from_pixel(40, 40, image::Rgba([255, 255, 255, 255]))
            .save(dir.join("home.png"))
            .unwrap();
        let cases = dir.join("cases.json");
        fs::write(
            &cases,
            r#"[
  {"id": "no-shot", "review": "It crashed."},
  {"id": "home", "screenshot": "home.png", "review": "The app is slow."}
]"#,
        )
        .unwrap();
        (config, cases)
    }

    #[cfg(unix)]
    #[test]
    fn batch_failure_is_terminal_for_its_case_only() {
        let dir = tempfile::tempdir().unwrap();
        let (config, cases) = batch_fixture(dir.path());
        let out_dir = dir.path().join("out");
        let args = |strict| BatchArgs {
            cases: Some(cases.clone()),
            config: config.clone(),
            out_dir: Some(out_dir.clone()),
            strict,
            cases_help: false,
        };

        command_batch(args(false)).unwrap();
        let summaries: Vec<PathBuf> = fs::read_dir(&out_dir)
            .unwrap()
            .map(|entry| entry.unwrap().path())
            .filter(|path| {
                path.file_name()
                    .and_then(|name| name.to_str())
                    .is_some_and(|name| name.starts_with("batch-"))
            })
            .collect();
        assert_eq!(summaries.len(), 1);
        let summary: Value = serde_json::from_str(&fs::read_to_string(&summaries[0]).unwrap()).unwrap();
        assert_eq!(summary["case_count"], 2);
        assert_eq!(summary["failed"], 1);
        assert_eq!(summary["cases"][0]["id"], "no-shot");
        assert_eq!(summary["cases"][0]["ok"], false);
        assert_eq!(summary["cases"][0]["input_error"], true);
        assert_eq!(summary["cases"][1]["ok"], true);
        assert_eq!(summary["cases"][1]["mismatch"], false);
        assert_eq!(summary["cases"][1]["result"]["mismatch_detected"], "No");

        let err = command_batch(args(true)).unwrap_err();
        assert!(err.to_string().contains("1 of 2 cases failed"));
    }
}
