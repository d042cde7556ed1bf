//! Shared entity types, wire-format constants, and the package dependency
//! graph consumed by every component of the Skyhook reconciliation engine.

pub mod batch;
pub mod config;
pub mod declaration;
pub mod graph;
pub mod keys;
pub mod node_meta;
pub mod node_record;
pub mod selector;
pub mod validate;
pub mod worker;

pub use batch::BatchState;
pub use declaration::{
  BatchStrategy, Compartment, ConfigEntry, Declaration,
  DeploymentPolicy, EnvVar, InterruptSpec, InterruptType,
  InterruptionBudget, PackageSpec, Toleration, TolerationOperator,
  DEFAULT_COMPARTMENT,
};
pub use graph::{GraphError, PackageGraph};
pub use node_meta::NodeMetaSnapshot;
pub use node_record::{
  NodeRecord, NodeStatus, PackageRecord, PackageState, Stage,
};
pub use selector::{evaluate, LabelSelector, Labels, MatchResult, Requirement};
pub use validate::{validate_declaration, ValidationError};
pub use worker::{
  compose_args, init_container_names, InitContainer, WorkerFingerprint,
  WorkerObject,
};
