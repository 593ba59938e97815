//! Orchestrates container-based security scanning workflows.
//!
//! A workflow spec is parsed into a [`Workflow`] by [`parser::SpecParser`],
//! which resolves component references, pulls or builds images and renders
//! parameters. [`engine::Executor`] then runs every step as a container
//! sharing one workspace. Components are distributed as OCI artifacts through
//! [`registry::OciRegistry`].

pub mod component;
pub mod creds;
pub mod engine;
pub mod error;
pub mod images;
pub mod parser;
pub mod registry;
pub mod workflow;

pub use component::{Component, ComponentKind, Parameter, ParameterType, ParameterValue, Step};
pub use error::{is_cancelled, Error};
pub use workflow::{Stage, Workflow};
