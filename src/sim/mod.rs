//! The simulation engine hosted inside a server process.

pub mod bridge;
pub mod engine;
pub mod instructions;
pub mod planner;
pub mod plugin;
pub mod pump;
pub mod store;

pub use engine::EngineConfig;
pub use plugin::{Plugin, ServerHandle};
pub use pump::{BuildContext, PluginDependency, PluginRegistry, Pump};
pub use store::Store;
