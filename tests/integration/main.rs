//! Integration tests for the quillforge orchestrator and CLI.

mod cli;
mod recovery;
mod scenarios;
mod support;
