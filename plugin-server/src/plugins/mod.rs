pub mod builtin;
pub mod registry;
pub mod runtime;
pub mod schedule;
pub mod types;
pub mod vm;

pub use registry::PluginRegistry;
pub use runtime::{NativePluginLibrary, PluginCompiler, PluginMeta, PluginMethods, PluginVm};
pub use schedule::PluginSchedule;
pub use types::{
    Plugin, PluginAttachment, PluginCapabilities, PluginConfig, PluginConfigId, PluginErrorRecord,
    PluginId, PluginSetupError,
};
pub use vm::LazyVm;
