#![forbid(unsafe_code)]
#![doc = include_str!("../README.md")]

pub mod cleanup;
pub mod config;
pub mod engine;
mod error;
pub mod filter;
mod lock;
pub mod manifest;
pub mod project;
mod registry;
pub mod stage;
mod task;
pub mod utils;

pub use crate::config::{Config, RuntimeArgs};
pub use crate::engine::{
    Engine, ExecOptions, Outcome, Plan, Report, Selection, schedule, schedule_order,
};
pub use crate::error::*;
pub use crate::lock::InvocationLock;
pub use crate::project::Project;
pub use crate::registry::{Registry, RegistryBuilder, TaskDef};
pub use crate::task::{SkipReason, Task, TaskContext, TaskId, TaskStatus};
