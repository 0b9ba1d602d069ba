//! Test doubles and helpers shared by unit and behaviour suites.

mod client;
mod config_loader;
mod observer;
mod reporter;

pub use client::{RawResponse, send_request};
pub use config_loader::{FailingConfigLoader, TestConfigLoader};
pub use observer::{ObservedEvent, RecordingObserver};
pub use reporter::{HealthEvent, RecordingHealthReporter};
