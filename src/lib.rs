pub mod bridge;
pub mod callins;
pub mod config;
pub mod context;
pub mod coordinator;
pub mod errors;
mod fallback;
pub mod handles;
pub mod loader;
pub mod permissions;
pub mod plugin;
pub mod session;

pub use callins::{CallIn, ContextKind};
pub use config::{HandleConfig, MessageRouting, ScriptLimits};
pub use context::{DefKind, DeterministicContext, PresentationContext, ScriptContext};
pub use coordinator::{CodeHooks, Coordinator, HandleState, StackReport};
pub use errors::{LoadError, ScriptError, ScriptErrors};
pub use handles::ScriptHandles;
pub use loader::{DirectoryLoader, MemoryLoader, ScriptLoader};
pub use permissions::{CapabilityGate, Permission, Permissions};
pub use plugin::{ActiveSession, LockstepScriptingPlugin, ScriptSet, SimulationFrame};
pub use session::Session;
