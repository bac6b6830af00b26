//! The build execution engine.
//!
//! A build's plan compiles to a tree of [`step::Step`]s sharing one
//! lifecycle: run to completion (or signal), expose typed results, release
//! worker resources. Composite steps implement the hook, try, aggregate
//! and timeout semantics; leaf steps drive containers on the worker fleet.
//! The engine itself persists the plan as the build's engine metadata so a
//! restarted process can reconstruct and resume the tree.

pub mod clock;
pub mod delegate;
pub mod engine;
pub mod signals;
pub mod source_repository;
pub mod step;
pub mod steps;
pub mod task_config;
pub mod worker;

pub use clock::{Clock, SystemClock, TestClock};
pub use delegate::{
    BuildDelegate, ExecBuildDelegate, GetDelegate, LogSink, OutputDelegate, TaskDelegate,
};
pub use engine::{Engine, EngineBuild, ExecBuild, ExecEngine, ENGINE_NAME};
pub use signals::{signal_channel, signalled, Ready, Signal, SignalHandle, Signals};
pub use source_repository::{ArtifactError, ArtifactSource, SourceRepository};
pub use step::{BoxStep, ExitStatus, Step, Success, VersionInfo};
pub use task_config::{
    DeprecationConfigSource, FileConfigSource, MergedConfigSource, StaticConfigSource,
    TaskConfigError, TaskConfigSource, ValidatingConfigSource,
};
pub use worker::{Client, ContainerSpec, Pool, ProcessIo, ResourceResult, WorkerContainer, WorkerError};
