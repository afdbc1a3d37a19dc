//! CLI command implementations.
//!
//! Each submodule owns one or more related `Commands` variants:
//!
//! | Module      | Commands handled        |
//! |-------------|-------------------------|
//! | `run`       | `Preview`, `Plan`       |
//! | `history`   | `History`               |
//! | `workflows` | `Workflows`, `Stages`   |
//! | `config`    | `Config`                |
//!
//! `session` loads and saves the stored state the commands share.

pub mod config;
pub mod history;
pub mod run;
pub mod session;
pub mod workflows;

pub use config::cmd_config;
pub use history::cmd_history;
pub use run::{cmd_plan, cmd_preview};
pub use workflows::{cmd_stages, cmd_workflows};
