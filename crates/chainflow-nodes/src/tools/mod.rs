pub mod read_file;
pub mod requests_get;

pub use read_file::{ReadFileNode, ReadFileTool};
pub use requests_get::{RequestsGetNode, RequestsGetTool};
