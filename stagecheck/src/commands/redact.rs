//! The `redact` command: masks secrets in text or JSON from stdin or a file.

use crate::cli::RedactCommand;
use anyhow::{Context, Result};
use log::debug;
use stagecheck_core::Redactor;
use std::fs;
use std::io::{self, Read, Write};

fn read_input(cmd: &RedactCommand) -> Result<String> {
    match &cmd.input_file {
        Some(path) => fs::read_to_string(path)
            .with_context(|| format!("Failed to read input file {}", path.display())),
        None => {
            let mut buf = String::new();
            io::stdin()
                .read_to_string(&mut buf)
                .context("Failed to read stdin")?;
            Ok(buf)
        }
    }
}

/// Redacts `input` as JSON (structurally) or as free text.
pub fn redact_input(redactor: &Redactor, input: &str, json: bool) -> Result<String> {
    if json {
        let value: serde_json::Value =
            serde_json::from_str(input).context("Input is not valid JSON")?;
        let mut out = serde_json::to_string_pretty(&redactor.redact(&value))?;
        out.push('\n');
        return Ok(out);
    }
    let plain = strip_ansi_escapes::strip_str(input);
    Ok(redactor.redact_text(&plain))
}

pub fn redact_command(cmd: &RedactCommand) -> Result<i32> {
    let redactor = if cmd.keywords.is_empty() {
        Redactor::default()
    } else {
        debug!("Adding {} extra secret key word(s)", cmd.keywords.len());
        Redactor::with_extra_keywords(&cmd.keywords)
    };
    let input = read_input(cmd)?;
    let output = redact_input(&redactor, &input, cmd.json)?;

    match &cmd.output {
        Some(path) => fs::write(path, output)
            .with_context(|| format!("Failed to write output file {}", path.display()))?,
        None => {
            let stdout = io::stdout();
            let mut writer = stdout.lock();
            writer.write_all(output.as_bytes())?;
            writer.flush()?;
        }
    }
    Ok(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn text_is_redacted_and_ansi_stripped() {
        let out = redact_input(
            &Redactor::default(),
            "\u{1b}[31mdb password=hunter2secret\u{1b}[0m\n",
            false,
        )
        .unwrap();
        assert_eq!(out, "db password=***cret\n");
    }

    #[test]
    fn json_is_redacted_by_key() {
        let out = redact_input(
            &Redactor::default(),
            r#"{"user":"ops","api_key":"abcd1234efgh5678"}"#,
            true,
        )
        .unwrap();
        let value: serde_json::Value = serde_json::from_str(&out).unwrap();
        assert_eq!(value["user"], "ops");
        assert_eq!(value["api_key"], "***5678");
    }

    #[test]
    fn invalid_json_is_an_error() {
        assert!(redact_input(&Redactor::default(), "not json", true).is_err());
    }
}
