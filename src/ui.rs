// UI layer: everything that talks to the terminal or the desktop. Spinner
// while the pipeline runs, prompts for `login`, history listing and the
// clipboard copy of the final URL.

use std::cell::Cell;
use std::time::Duration;

use anyhow::Result;
use chrono::Local;
use crossterm::style::Stylize;
use dialoguer::{Input, Password};
use indicatif::{ProgressBar, ProgressStyle};
use log::warn;

use crate::history::HistoryRecord;
use crate::pipeline::PipelineState;

/// Spinner shown on stderr while the pipeline is busy, so stdout stays
/// clean for the URL.
pub struct Spinner {
    bar: ProgressBar,
    ticking: Cell<bool>,
}

impl Spinner {
    pub fn new() -> Self {
        let bar = ProgressBar::new_spinner();
        if let Ok(style) = ProgressStyle::with_template("{spinner} {msg}") {
            bar.set_style(style);
        }
        Self {
            bar,
            ticking: Cell::new(false),
        }
    }

    /// Update the message for a pipeline state. Nothing is drawn until the
    /// upload starts: area selection tools own the screen while capturing.
    pub fn show(&self, state: &PipelineState) {
        match state {
            PipelineState::Uploading => {
                self.bar.set_message("Uploading...");
                self.start_ticking();
            }
            PipelineState::Recording => self.bar.set_message("Saving history..."),
            _ => {}
        }
    }

    fn start_ticking(&self) {
        if !self.ticking.replace(true) {
            self.bar.enable_steady_tick(Duration::from_millis(100));
        }
    }

    pub fn finish(self) {
        self.bar.finish_and_clear();
    }
}

impl Default for Spinner {
    fn default() -> Self {
        Self::new()
    }
}

/// Ask for account e-mail and password.
pub fn prompt_login() -> Result<(String, String)> {
    let email: String = Input::new().with_prompt("E-mail").interact_text()?;
    // `Password` hides input in terminal for passwords.
    let password: String = Password::new().with_prompt("Password").interact()?;
    Ok((email, password))
}

pub fn print_url(url: &str) {
    println!("{}", url);
}

pub fn print_history(records: &[HistoryRecord]) {
    if records.is_empty() {
        println!("No uploads yet.");
        return;
    }
    for line in records.iter().map(format_record) {
        println!("{}", line);
    }
}

fn format_record(record: &HistoryRecord) -> String {
    let when = record
        .captured_at
        .with_timezone(&Local)
        .format("%Y-%m-%d %H:%M:%S")
        .to_string();
    match &record.local_path {
        Some(path) => format!(
            "{}  {}  {}",
            when.as_str().dark_grey(),
            record.url.as_str().cyan(),
            path.display()
        ),
        None => format!("{}  {}", when.as_str().dark_grey(), record.url.as_str().cyan()),
    }
}

pub fn print_error(message: &str) {
    eprintln!("{} {}", "error:".red().bold(), message);
}

/// Put the URL on the clipboard. Failing to do so is not fatal.
pub fn copy_to_clipboard(url: &str) -> bool {
    let result = arboard::Clipboard::new()
        .and_then(|mut clipboard| clipboard.set_text(url.to_string()));
    match result {
        Ok(()) => true,
        Err(e) => {
            warn!("could not copy URL to clipboard: {}", e);
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use std::path::PathBuf;

    fn record(local_path: Option<PathBuf>) -> HistoryRecord {
        HistoryRecord {
            url: "https://puu.sh/abc.png".into(),
            captured_at: Utc::now(),
            local_path,
        }
    }

    #[test]
    fn formats_url_and_optional_path() {
        let path = PathBuf::from("/home/me/Pictures/puush/a.png");
        let with_path = format_record(&record(Some(path)));
        assert!(with_path.contains("https://puu.sh/abc.png"));
        assert!(with_path.contains("/home/me/Pictures/puush/a.png"));

        let without = format_record(&record(None));
        assert!(without.contains("https://puu.sh/abc.png"));
        assert!(!without.contains("Pictures"));
    }

    #[test]
    fn spinner_stays_quiet_until_upload() {
        let spinner = Spinner::new();
        spinner.show(&PipelineState::Capturing);
        assert!(!spinner.ticking.get());

        spinner.show(&PipelineState::Uploading);
        assert!(spinner.ticking.get());
        spinner.show(&PipelineState::Recording);
        assert!(spinner.ticking.get());
        spinner.finish();
    }
}
