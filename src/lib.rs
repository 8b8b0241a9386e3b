//! # autonav
//!
//! Navigator harness layer and the memento development loop.
//!
//! This library provides:
//! - One session contract over three agent runtimes (in-process SDK,
//!   subprocess JSONL, HTTP/SSE server)
//! - The memento plan → implement → commit loop
//! - Rate-limit and transient-failure retry policy
//! - Cross-navigator `ask_<peer>` tools with a depth bound
//!
//! ## Architecture
//!
//! ```text
//!        ┌──────────────────────────────────┐
//!        │           MementoLoop            │
//!        │  planner → implementer → commit  │
//!        └───────┬──────────────────┬───────┘
//!                │                  │
//!                ▼                  ▼
//!        ┌───────────────┐   ┌─────────────┐
//!        │    Harness    │   │     Git     │
//!        │ sdk/cli/server│   └─────────────┘
//!        └───────────────┘
//! ```
//!
//! ## Modules
//! - `harness`: session contract, event model and the three runtimes
//! - `memento`: the loop controller and its prompts
//! - `plan`: plan-capture tool and plan validation
//! - `retry`: error classification and backoff delays
//! - `ask`: cross-agent query tools
//! - `git`: git collaborator

pub mod ask;
pub mod config;
pub mod git;
pub mod harness;
pub mod memento;
pub mod plan;
pub mod retry;
pub mod util;

pub use config::Config;
