//! hive-services — the coordinator's stateful components.
//!
//! `SessionRegistry` and `TaskQueue` own all mutable state. `Dispatcher`
//! pairs them; `ClusterRegistrar` mirrors membership into the external
//! schedulers through `RegistrationBackend`s.

pub mod backend;
pub mod dispatcher;
pub mod kubernetes;
pub mod queue;
pub mod registrar;
pub mod session;
pub mod slurm;

pub use backend::{BackendError, BackendKind, NodeDescriptor, RegistrationBackend};
pub use dispatcher::{DispatchSettings, Dispatcher, Outbound, ResultOutcome, SweepReport};
pub use kubernetes::KubernetesBackend;
pub use queue::{NewTask, TaskCounts, TaskQueue, TaskSnapshot};
pub use registrar::{
    ClusterRegistrar, HealthCounts, RegistrationHealth, RegistrationOutcome, RegistrationRecord, RetryPolicy,
};
pub use session::{ConnectionHandle, Detach, NodeCounts, SessionRegistry, SessionSnapshot};
pub use slurm::SlurmBackend;
