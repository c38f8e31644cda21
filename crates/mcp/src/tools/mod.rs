pub mod cache;
pub mod web;
mod registry;

pub use cache::CacheStatusTool;
pub use web::WebFetchTool;
pub use registry::{
    json_schema_boolean, json_schema_object, json_schema_string, Tool,
    ToolRegistry,
};
