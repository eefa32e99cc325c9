use anyhow::{Context, Result};
use chrono::Utc;
use rand::Rng;
use serde::Serialize;
use std::env;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

pub fn write_json_pretty<T: Serialize + ?Sized>(path: &Path, value: &T) -> Result<()> {
    ensure_parent_dir(path)
        .with_context(|| format!("failed to create parent directory: {}", path.display()))?;
    let raw = serde_json::to_string_pretty(value)?;
    fs::write(path, raw).with_context(|| format!("failed to write JSON: {}", path.display()))?;
    Ok(())
}

pub fn write_text_file(path: &Path, content: &str) -> io::Result<()> {
    ensure_parent_dir(path)?;
    fs::write(path, content)
}

pub fn ensure_parent_dir(path: &Path) -> io::Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }
    Ok(())
}

pub fn default_sidecar_for(path: &Path) -> PathBuf {
    let stem = path
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("output")
        .to_string();
    let parent = path.parent().unwrap_or_else(|| Path::new(""));
    parent.join(format!("{stem}.json"))
}

/// Artifact root: `VIPRA_OUT_DIR` or `.vipra-ui`.
pub fn out_root() -> PathBuf {
    env::var("VIPRA_OUT_DIR")
        .ok()
        .filter(|v| !v.trim().is_empty())
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(".vipra-ui"))
}

pub fn abs_path(path: &Path) -> PathBuf {
    if path.is_absolute() {
        return path.to_path_buf();
    }
    env::current_dir()
        .unwrap_or_else(|_| PathBuf::from("."))
        .join(path)
}

pub fn slugify(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    for ch in input.chars() {
        let lower = ch.to_ascii_lowercase();
        if lower.is_ascii_alphanumeric() || matches!(lower, '.' | '_' | '-') {
            out.push(lower);
        } else if lower.is_ascii_whitespace() {
            out.push('-');
        }
    }
    if out.is_empty() {
        "run".to_string()
    } else {
        out
    }
}

/// `<timestamp>-<pid>-<random>`, unique enough for per-run artifact names.
pub fn run_id() -> String {
    format!(
        "{}-{}-{}",
        timestamp_compact(),
        std::process::id(),
        rand::thread_rng().gen_range(1000..9999)
    )
}

pub fn timestamp_compact() -> String {
    Utc::now().format("%Y%m%d-%H%M%S").to_string()
}

pub fn timestamp_iso() -> String {
    Utc::now().to_rfc3339()
}

pub fn truncate_text(text: &str, limit: usize) -> String {
    if text.chars().count() <= limit {
        return text.to_string();
    }
    text.chars().take(limit).collect::<String>() + "\n...<truncated>..."
}

/// Resolve a bare command name against `PATH`; paths are checked directly.
pub fn resolve_executable(name: &str) -> Option<PathBuf> {
    let candidate = Path::new(name);
    if candidate.components().count() > 1 || candidate.is_absolute() {
        return candidate.is_file().then(|| candidate.to_path_buf());
    }
    let path_var = env::var_os("PATH")?;
    env::split_paths(&path_var)
        .map(|dir| dir.join(name))
        .find(|full| full.is_file())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn writes_json_pretty() {
        let dir = tempdir().unwrap();
        let target = dir.path().join("a").join("b.json");
        write_json_pretty(&target, &serde_json::json!({"ok": true})).unwrap();
        assert!(target.exists());
    }

    #[test]
    fn sidecar_sits_next_to_output() {
        assert_eq!(
            default_sidecar_for(Path::new("out/shot-annotated.png")),
            PathBuf::from("out/shot-annotated.json")
        );
    }

    #[test]
    fn slugify_keeps_safe_characters() {
        assert_eq!(slugify("Login Fail/v2"), "login-failv2");
        assert_eq!(slugify("///"), "run");
    }

    #[test]
    fn truncate_marks_cut_text() {
        assert_eq!(truncate_text("abc", 5), "abc");
        assert!(truncate_text("abcdef", 3).starts_with("abc\n"));
    }

    #[test]
    fn resolves_explicit_paths_only_when_present() {
        let dir = tempdir().unwrap();
        let script = dir.path().join("model.sh");
        fs::write(&script, "#!/bin/sh\n").unwrap();
        assert_eq!(
            resolve_executable(script.to_str().unwrap()),
            Some(script.clone())
        );
        assert!(resolve_executable(dir.path().join("nope").to_str().unwrap()).is_none());
    }
}
