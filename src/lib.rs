// Library root
// -----------
// This crate exposes the screenshot-upload pipeline as a library; the binary
// (`main.rs`) wires it to the command line.
//
// Module responsibilities:
// - `capture`: turns a screenshot tool run (or an existing file) into an
//   `Artifact`.
// - `api`: HTTP interactions with the puush host (upload, login) and the
//   retrying `Uploader`.
// - `retry`: backoff schedule and cancellation token.
// - `history`: append-only log of finished uploads.
// - `pipeline`: capture -> upload -> record state machine.
// - `config`: TOML configuration with environment overrides.
// - `ui`: spinner, prompts, clipboard and terminal output.
// - `error`: error types and exit codes.
pub mod api;
pub mod capture;
pub mod config;
pub mod error;
pub mod history;
pub mod pipeline;
pub mod retry;
pub mod ui;
