//! Checkpoint filename templates

use regex::Regex;
use runtime_core::{Epoch, Error, Result, Step};
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use tracing::warn;

/// Extension of every checkpoint file
pub const CHECKPOINT_EXTENSION: &str = ".ckpt";

/// Stem of the canonical checkpoint
pub const LAST_CHECKPOINT_NAME: &str = "last";

fn placeholder() -> &'static Regex {
    static PLACEHOLDER: OnceLock<Regex> = OnceLock::new();
    PLACEHOLDER.get_or_init(|| {
        Regex::new(r"\{([^{}:]*)(?::[^{}]*)?\}").expect("placeholder pattern is valid")
    })
}

/// Expand a filename template into a checkpoint file name.
///
/// `{epoch}` and `{step}` become `epoch=<n>` / `step=<n>`; format directives
/// such as `:02d` are dropped. Any other placeholder is removed.
pub fn format_checkpoint_name(template: &str, epoch: Epoch, step: Step) -> String {
    let stem = placeholder().replace_all(template, |caps: &regex::Captures<'_>| {
        match caps[1].trim() {
            "epoch" => format!("epoch={}", epoch),
            "step" => format!("step={}", step),
            other => {
                warn!(
                    placeholder = other,
                    template, "Only {{epoch}} and {{step}} are supported in checkpoint names"
                );
                String::new()
            }
        }
    });
    format!("{}{}", stem, CHECKPOINT_EXTENSION)
}

/// File name of the canonical checkpoint
pub fn last_checkpoint_name() -> String {
    format!("{}{}", LAST_CHECKPOINT_NAME, CHECKPOINT_EXTENSION)
}

/// Split a configured file path into its directory and filename template
pub fn split_filepath(filepath: &Path) -> Result<(PathBuf, String)> {
    let template = filepath
        .file_name()
        .and_then(|name| name.to_str())
        .filter(|name| !name.is_empty())
        .ok_or_else(|| {
            Error::config(format!(
                "checkpoint filepath {} has no filename template",
                filepath.display()
            ))
        })?
        .to_string();

    let dir = match filepath.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    };
    Ok((dir, template))
}
