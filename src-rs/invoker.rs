use crate::config::MllmSettings;
use crate::error::AnalysisError;
use crate::prompt::with_task_prefix;
use crate::util::{resolve_executable, truncate_text};
use std::ffi::OsString;
use std::fs::{self, File};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};
use wait_timeout::ChildExt;

/// A vision-language model reachable with one image and one prompt.
pub trait ModelInvoker: Send + Sync {
    /// Short identification for logs and reports.
    fn describe(&self) -> String;

    /// Entire raw generation, including any prose around the answer.
    fn generate(&self, image: &Path, prompt: &str) -> Result<String, AnalysisError>;
}

/// Runs the model as an external command: prompt on stdin, generation on
/// stdout, stderr to a log file next to the image.
#[derive(Debug, Clone)]
pub struct CommandInvoker {
    program: PathBuf,
    extra_args: Vec<String>,
    model_name: String,
    device: String,
    max_new_tokens: u32,
    num_beams: u32,
    task_prefix: Option<String>,
    timeout: Option<Duration>,
}

impl CommandInvoker {
    /// Fails when the configured command cannot be found.
    pub fn from_settings(settings: &MllmSettings) -> Result<Self, AnalysisError> {
        let program = resolve_executable(&settings.command).ok_or_else(|| {
            AnalysisError::AnalyzerUnavailable(format!(
                "MLLM command not found: {} (set mllm.command in the settings file)",
                settings.command
            ))
        })?;
        info!(
            model = %settings.model_name,
            device = %settings.device,
            command = %program.display(),
            "configured MLLM command"
        );
        Ok(Self {
            program,
            extra_args: settings.args.clone(),
            model_name: settings.model_name.clone(),
            device: settings.device.clone(),
            max_new_tokens: settings.max_new_tokens,
            num_beams: settings.num_beams,
            task_prefix: settings.task_prefix.clone(),
            timeout: settings.timeout_secs.map(Duration::from_secs),
        })
    }

    /// Arguments after the program name. Decoding is always greedy/beam, never sampled.
    pub fn command_args(&self, image: &Path) -> Vec<OsString> {
        let mut args: Vec<OsString> = self.extra_args.iter().map(OsString::from).collect();
        for (flag, value) in [
            ("--model", self.model_name.clone()),
            ("--device", self.device.clone()),
            ("--max-new-tokens", self.max_new_tokens.to_string()),
            ("--num-beams", self.num_beams.to_string()),
        ] {
            args.push(flag.into());
            args.push(value.into());
        }
        args.push("--no-sample".into());
        args.push("--image".into());
        args.push(image.as_os_str().to_os_string());
        args
    }

    fn log_path_for(image: &Path) -> PathBuf {
        image.with_extension("mllm.log")
    }
}

impl ModelInvoker for CommandInvoker {
    fn describe(&self) -> String {
        format!(
            "{} ({} on {})",
            self.program.display(),
            self.model_name,
            self.device
        )
    }

    fn generate(&self, image: &Path, prompt: &str) -> Result<String, AnalysisError> {
        let log_path = Self::log_path_for(image);
        let log_file = File::create(&log_path).map_err(|err| {
            AnalysisError::io(format!("failed to create MLLM log: {}", log_path.display()), err)
        })?;

        let mut cmd = Command::new(&self.program);
        cmd.args(self.command_args(image))
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::from(log_file));

        let started = Instant::now();
        let mut child = cmd.spawn().map_err(|err| AnalysisError::Generation {
            details: format!("failed to start {}: {err}", self.program.display()),
        })?;

        let reader = child.stdout.take().map(|mut stdout| {
            thread::spawn(move || {
                let mut buf = Vec::new();
                stdout.read_to_end(&mut buf).map(|_| buf)
            })
        });

        // The pipe closes when the writer thread drops stdin.
        let writer = child.stdin.take().map(|mut stdin| {
            let full_prompt = with_task_prefix(prompt, self.task_prefix.as_deref());
            thread::spawn(move || {
                if let Err(err) = stdin.write_all(full_prompt.as_bytes()) {
                    warn!("failed to write prompt to MLLM stdin: {err}");
                }
            })
        });

        let status = match self.timeout {
            Some(timeout) => match child.wait_timeout(timeout) {
                Ok(Some(status)) => status,
                Ok(None) => {
                    let _ = child.kill();
                    let _ = child.wait();
                    if let Some(handle) = writer {
                        let _ = handle.join();
                    }
                    return Err(AnalysisError::Generation {
                        details: format!("MLLM command timed out after {}s", timeout.as_secs()),
                    });
                }
                Err(err) => {
                    return Err(AnalysisError::Generation {
                        details: format!("failed to wait for MLLM command: {err}"),
                    })
                }
            },
            None => child.wait().map_err(|err| AnalysisError::Generation {
                details: format!("failed to wait for MLLM command: {err}"),
            })?,
        };

        if let Some(handle) = writer {
            let _ = handle.join();
        }
        let stdout = match reader.map(|handle| handle.join()) {
            Some(Ok(Ok(buf))) => String::from_utf8_lossy(&buf).to_string(),
            Some(Ok(Err(err))) => {
                return Err(AnalysisError::Generation {
                    details: format!("failed to read MLLM output: {err}"),
                })
            }
            Some(Err(_)) => {
                return Err(AnalysisError::Generation {
                    details: "MLLM output reader panicked".to_string(),
                })
            }
            None => String::new(),
        };
        debug!(
            elapsed_ms = started.elapsed().as_millis() as u64,
            bytes = stdout.len(),
            "MLLM command finished"
        );

        if !status.success() {
            let stderr = fs::read_to_string(&log_path).unwrap_or_default();
            return Err(AnalysisError::Generation {
                details: format!(
                    "MLLM command exited with status {}: {}",
                    status.code().unwrap_or(1),
                    truncate_text(stderr.trim(), 2400)
                ),
            });
        }
        if stdout.trim().is_empty() {
            return Err(AnalysisError::Generation {
                details: "MLLM command produced no output".to_string(),
            });
        }
        Ok(stdout)
    }
}
