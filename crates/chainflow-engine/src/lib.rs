pub mod cache;
pub mod engine;
pub mod executor;
pub mod graph;
pub mod memory;
pub mod registry;
pub mod request;
pub mod session;

pub use cache::{CacheKey, InstanceCache};
pub use engine::{Engine, RunHandle};
pub use executor::{Executor, NodeReport, RunReport, RunTracker};
pub use graph::{resolve, Edge, ExecutionPlan, Graph, GraphBuilder, NodeDefinition};
pub use memory::MemoryBinder;
pub use registry::{RegisteredType, TypeRegistry};
pub use request::{EngineRequest, EngineResponse, HistoryEntry};
pub use session::SessionRunner;

pub use chainflow_core::definition::{GraphDefinition, RawEdge, RawNode};
