//! Gantry-CI: a self-hosted staged pipeline runner
//!
//! Provides a pipeline orchestrator that:
//! - Parses and validates GitLab-style YAML pipeline definitions
//! - Runs stages strictly in order and the jobs of a stage concurrently
//! - Passes artifacts between jobs through an `ArtifactStore`
//! - Gates jobs on the triggering branch or tag
//! - Publishes container images with explicitly supplied credentials
//! - Records every run into a `RunLedger` for gate evaluation

pub mod config;
pub mod definition;
pub mod environment;
pub mod error;
pub mod gate;
pub mod graph;
pub mod obs;
pub mod pipeline;
pub mod publish;
pub mod recorder;
pub mod resolver;
pub mod run;
pub mod runner;
pub mod telemetry;
pub mod trigger;

// Re-export key types
pub use config::{Executor, RunnerConfig};
pub use definition::{parse_expire_in, PipelineDef};
pub use environment::{
    DockerProvider, Environment, EnvironmentProvider, ExecOutput, LocalProvider,
};
pub use error::{CiError, Result};
pub use gate::{GateVerdict, RunGate};
pub use graph::{JobSpec, StageGraph, StagePlan};
pub use pipeline::{PipelineResult, PipelineRunner};
pub use publish::{DockerCliRegistry, PublishConfig, Publisher, Registry, RegistryCredentials};
pub use recorder::RunRecorder;
pub use resolver::DependencyResolver;
pub use run::{JobStatus, RunState};
pub use runner::{JobResult, JobRunner};
pub use trigger::{TriggerEvent, TriggerGate};
