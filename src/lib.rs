pub mod catalog;
pub mod config;
pub mod corrector;
pub mod detector;
pub mod error;
pub mod execution;
pub mod execution_loop;
pub mod llm;
pub mod pipeline;
pub mod plan;
pub mod prompts;
pub mod router;
pub mod table_ref;
pub mod validator;

pub use catalog::{EntityCatalog, EntitySchema, FieldDescriptor, FieldType};
pub use config::PipelineConfig;
pub use detector::{DetectedEntity, EntityDetector};
pub use error::{NlqError, Result};
pub use pipeline::{QueryPipeline, QueryResponse};
pub use plan::ExecutionPlan;
