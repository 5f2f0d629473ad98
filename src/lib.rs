pub mod config;
pub mod debug_log;
pub mod dispatch;
pub mod errors;
pub mod logging;
pub mod notes;
pub mod parser;
pub mod planner;
pub mod prompt;
pub mod providers;
pub mod reasoning;
pub mod registry;
pub mod reporter;
pub mod scheduler;
pub mod session;
pub mod workflow;
