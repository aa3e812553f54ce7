//! Slot Sentinel: coordination engine that watches a scheduling page for capacity and claims it.

pub mod availability;
pub mod backoff;
pub mod channel;
pub mod config;
pub mod engine;
pub mod error;
pub mod events;
pub mod grab;
pub mod preference;
pub mod safety;
pub mod signals;
pub mod urgent;

pub use availability::{AvailabilityMachine, AvailabilityState, Evaluation, Transition};
pub use backoff::{BackoffController, BackoffPolicy, PollSession};
pub use config::{SentinelConfig, Timings};
pub use engine::{Engine, EngineHandle, EngineParts, EngineSnapshot};
pub use error::{SentinelError, SentinelResult};
pub use events::{EventBus, LogLevel, SentinelEvent};
pub use grab::{
    ConfirmProbe, GrabOutcome, GrabStep, GrabTrigger, PageAdapter, PageScript, ScriptedPage,
    UnitRef, UnitSelection,
};
pub use signals::{
    AvailabilitySignal, PollReport, RequestTemplate, SignalSource, StatusTransport,
    StructuralReport,
};
pub use safety::detect_block_page;
pub use urgent::{MemoryMarker, UrgentMarker};
