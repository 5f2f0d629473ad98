//! CLI command implementations.
//!
//! Each submodule owns one or more related `Commands` variants:
//!
//! | Module   | Commands handled |
//! |----------|------------------|
//! | `run`    | `Run`, `Exec`    |
//! | `logs`   | `Logs`           |
//! | `config` | `Config`         |

pub mod config;
pub mod logs;
pub mod run;

pub use config::cmd_config;
pub use logs::cmd_logs;
pub use run::{cmd_exec, cmd_run};
