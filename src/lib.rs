//! Bridge between a callback-driven conformance test engine and a JSON-lines
//! stream on stdout.
//!
//! One process runs one test case. Engine log records and operator prompts
//! become JSON records on stdout; answers to prompts are read from stdin.

pub mod cli;
pub mod codec;
pub mod completion;
pub mod config;
pub mod engine;
pub mod events;
pub mod orchestrator;
pub mod paths;
pub mod prompt;
