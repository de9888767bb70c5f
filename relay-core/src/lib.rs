pub mod config;
pub mod provider;
pub mod quality;
pub mod registry;
pub mod schedule;
pub mod scheduler;
pub mod supervisor;

pub use config::{
    load_relay_config, ConfigError, ConfigResult, EncoderSection, IngestSection, PathsSection,
    ProviderSection, RelayConfig, SchedulerSection, SystemSection,
};
pub use provider::{
    BroadcastProvider, BroadcastResource, BroadcastSpec, HttpBroadcastProvider,
    NullBroadcastProvider, ProviderError,
};
pub use quality::{Quality, QualityProfile, UnknownQuality};
pub use registry::{
    mask_key, RegistryError, RegistryResult, StreamRecord, StreamRegistry, StreamStatus,
};
pub use schedule::{
    countdown, is_due, next_occurrence, Schedule, ScheduleError, IMMEDIATE_SENTINEL,
};
pub use scheduler::{
    NewStream, RelayScheduler, SchedulerError, StatusSummary, StreamView, TickReport,
};
pub use supervisor::{
    build_encoder_invocation, EncoderInvocation, EncoderLauncher, StartError, StopError,
    StreamSupervisor, SystemEncoderLauncher,
};
