use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use futures::future::BoxFuture;
use serde::Deserialize;
use tracing::debug;

use chainflow_core::capability::TOOL;
use chainflow_core::context::InitContext;
use chainflow_core::error::{ChainflowError, Result};
use chainflow_core::instance::{NodeInstance, ResolvedInputs};
use chainflow_core::traits::{AgentTool, NodeType};
use chainflow_core::types::{InputPort, NodeSchema};

/// Reads text files below a base directory.
pub struct ReadFileTool {
    base_path: PathBuf,
}

#[derive(Deserialize)]
struct ReadFileInput {
    file_path: String,
}

impl ReadFileTool {
    pub fn new(base_path: impl Into<PathBuf>) -> Self {
        Self {
            base_path: base_path.into(),
        }
    }

    /// Join `requested` onto the base path, refusing paths that climb out of it.
    fn resolve(&self, requested: &str) -> Result<PathBuf> {
        let requested = Path::new(requested);
        if requested.is_absolute() && self.base_path.as_os_str().is_empty() {
            return Ok(requested.to_path_buf());
        }
        let mut resolved = self.base_path.clone();
        let mut depth = 0usize;
        for component in requested.components() {
            match component {
                Component::Normal(part) => {
                    resolved.push(part);
                    depth += 1;
                }
                Component::ParentDir if depth > 0 => {
                    resolved.pop();
                    depth -= 1;
                }
                Component::ParentDir => {
                    return Err(ChainflowError::Node(format!(
                        "path escapes base directory: {}",
                        requested.display()
                    )));
                }
                Component::CurDir | Component::RootDir | Component::Prefix(_) => {}
            }
        }
        Ok(resolved)
    }
}

impl AgentTool for ReadFileTool {
    fn name(&self) -> &str {
        "read_file"
    }

    fn description(&self) -> &str {
        "Read a file from disk. Input is the file path, or JSON {\"file_path\": \"...\"}."
    }

    fn call(&self, input: String) -> BoxFuture<'_, Result<String>> {
        Box::pin(async move {
            let raw = serde_json::from_str::<ReadFileInput>(&input)
                .map(|p| p.file_path)
                .unwrap_or_else(|_| input.trim().trim_matches('"').to_string());
            let path = self.resolve(&raw)?;
            debug!(path = %path.display(), "Reading file");
            tokio::fs::read_to_string(&path)
                .await
                .map_err(|e| ChainflowError::Node(format!("{}: {}", path.display(), e)))
        })
    }
}

pub struct ReadFileNode;

impl NodeType for ReadFileNode {
    fn schema(&self) -> NodeSchema {
        NodeSchema::new("readFile", "Tools")
            .label("Read File")
            .description("Read a file from disk")
            .capabilities(["ReadFile", TOOL])
            .input(InputPort::param("basePath", "string").with_label("Base Path").optional())
    }

    fn init(&self, inputs: ResolvedInputs, _ctx: InitContext) -> BoxFuture<'_, Result<NodeInstance>> {
        Box::pin(async move {
            let tool: Arc<dyn AgentTool> =
                Arc::new(ReadFileTool::new(inputs.str("basePath").unwrap_or_default()));
            Ok(NodeInstance::new(tool))
        })
    }
}
