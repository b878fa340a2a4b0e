//! # tango-core: steps, workspaces and configuration
//!
//! The pieces every Tango integration builds on:
//! - [`step::Step`]: a named, cacheable unit of work with a stable unique id
//! - [`workspace::Workspace`]: where step records and results are kept
//! - [`executor::Executor`]: runs a [`executor::StepGraph`] in dependency order
//! - [`registry::Registry`]: string-keyed component factories, resolved at startup
//! - [`config`] and [`logging`]: layered configuration and tracing setup

pub mod config;
pub mod error;
pub mod executor;
pub mod format;
pub mod logging;
pub mod registry;
pub mod step;
pub mod workspace;

pub use config::{TangoConfig, load_config};
pub use error::{ConfigError, RegistryError, StepError, TangoError};
pub use executor::{Executor, ExecutorOutput, StepGraph};
pub use format::JsonFormat;
pub use registry::Registry;
pub use step::{Step, StepContext, StepInfo, StepState};
pub use workspace::{LocalWorkspace, MemoryWorkspace, Workspace};
