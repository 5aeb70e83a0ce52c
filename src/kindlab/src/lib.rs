//! kindlab - bring-up and teardown of a local Kind + Cilium demo lab.
//!
//! The lab is a Kind cluster running Cilium with Gateway API, an FRR router
//! peering with every node over BGP, and a small demo application behind a
//! Gateway. All host interaction goes through [`runner::CommandRunner`].

pub mod app;
pub mod background;
pub mod bgp;
pub mod cluster;
pub mod cni;
pub mod config;
pub mod embedded_templates;
pub mod error;
pub mod images;
pub mod probe;
pub mod progress;
pub mod report;
pub mod runner;
pub mod sequencer;
pub mod system_check;
pub mod tasks;
pub mod template_renderer;
pub mod wait;
pub mod workflow;

pub use config::LabConfig;
pub use error::{LabError, Result};
pub use progress::{ChannelProgressReporter, ProgressReporter, StageProgress, TracingProgressReporter};
pub use runner::{CommandOutput, CommandRunner, CommandSpec, ProcessRunner};
pub use sequencer::{DeployOptions, DeploySummary, Lab, Stage};
