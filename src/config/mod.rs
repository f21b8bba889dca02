//! Configuration.
//!
//! [`AppConfig`] holds one section per subsystem (worker launch, RPC method
//! overrides, supervisor timings, notification aliases, session history,
//! artifacts) and persists as TOML at [`AppPaths::settings_file`].

pub mod paths;
pub mod settings;

pub use paths::AppPaths;
pub use settings::{
    AppConfig, ArtifactConfig, ArtifactEntry, DispatchConfig, MethodOverride, RpcConfig,
    SessionConfig, SupervisorConfig, WorkerConfig,
};
