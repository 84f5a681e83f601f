pub mod error;
pub mod models;
pub mod parser;

pub use error::ParseError;
pub use models::{Command, EnvironmentSpec, Job, Requires, RetryPolicy, Workflow};
pub use parser::WorkflowParser;
