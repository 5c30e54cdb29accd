//! Rivulet — a flow-based message routing runtime.
//!
//! Users describe a directed graph of typed node instances connected by
//! ordered wires; the runtime loads that graph, instantiates enabled node
//! types from a pluggable registry, and routes messages along the wires.
//! Deploys can be partial: only the flows or nodes a diff names restart,
//! everything else keeps running. A named-hook pipeline lets cross-cutting
//! code observe or halt message delivery without touching node code.
//!
//! The editor UI, admin HTTP surface, and persistence backends live outside
//! this crate; they drive it through [`FlowsManager`] and the
//! [`storage::StorageBackend`] / [`settings::SettingsManager`] seams.

pub mod context;
pub mod events;
pub mod flow;
pub mod hooks;
pub mod logger;
pub mod message;
pub mod registry;
pub mod settings;
pub mod storage;
pub mod value;

pub use context::{Context, ContextScope};
pub use events::{RuntimeEvent, RuntimeEvents};
pub use flow::config::{
    ConfigError, EnvEntry, FlowConfiguration, FlowDefinition, RawNode, parse_config,
};
pub use flow::diff::{FlowDiff, diff_configs};
pub use flow::flow::{Flow, FlowServices, GLOBAL_FLOW_ID};
pub use flow::manager::{
    DeployType, FlowError, FlowPayload, FlowsManager, FlowsOptions, FlowsState,
    calculate_revision,
};
pub use flow::node::{
    CloseHandler, DeliveryMode, InputHandler, NodeConstructor, NodeError, NodeInstance,
    NodeStatus,
};
pub use hooks::{
    CompleteEvent, HookAction, HookCallback, HookError, HookFailure, HookManager, HookPayload,
    ModuleEvent, SendEvent,
};
pub use message::Message;
pub use registry::{ModuleDescriptor, NodeRegistry, NodeSetDescriptor, RegistryError};
pub use settings::{SettingsError, SettingsManager};
pub use storage::{InMemoryStorage, Storage, StorageBackend, StorageError, StoredFlows};
pub use value::{Handle, PathSegment, Payload, ValueError, get_path, parse_path, set_path};
