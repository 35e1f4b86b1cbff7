//! 操作工具层：目录输入 → 描述符 → 注册表 → 受治理的执行

pub mod catalogue;
pub mod descriptor;
pub mod executor;
pub mod http;
pub mod registry;
pub mod schema;

pub use catalogue::{CatalogueDocument, OperationSpec, ParameterLocation, ParameterSpec};
pub use descriptor::{ActionDescriptor, ActionScope, Verb};
pub use executor::{ActionBackend, ActionExecutor};
pub use http::HttpBackend;
pub use registry::{ActionCatalogue, ActionFilter, ActionRegistry};
pub use schema::action_call_schema_json;
