pub mod capability;
pub mod config;
pub mod context;
pub mod definition;
pub mod error;
pub mod event;
pub mod history;
pub mod instance;
pub mod stream;
pub mod traits;
pub mod types;

pub use config::AppConfig;
pub use context::{ExecutionContext, InitContext, RunContext};
pub use definition::{GraphDefinition, RawEdge, RawNode};
pub use error::{ChainflowError, Result};
pub use event::{EngineEvent, EventBus, RunState};
pub use history::{ChatHistory, MemoryBindings};
pub use instance::{NodeInstance, ResolvedInputs, ResolvedValue};
pub use stream::{StreamEvent, StreamReceiver, StreamSink};
pub use types::*;
