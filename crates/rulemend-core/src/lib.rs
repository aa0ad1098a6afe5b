pub mod categories;
pub mod config;
pub mod db;
pub mod diagnosis;
pub mod email;
pub mod groups;
pub mod llm;
pub mod migrations;
pub mod owner;
pub mod repair;
pub mod rules;
pub mod telemetry;

pub use config::{Config, DiagnosisConfig};
pub use db::Database;
pub use diagnosis::{DiagnosisOrchestrator, DiagnosisOutcome, DiagnosisRequest, Termination};
pub use owner::Owner;
pub use telemetry::{TelemetryError, TelemetryGuard, init_logging, init_telemetry};
