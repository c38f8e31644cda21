// MCP (Model Context Protocol) server for generative-engine visibility analysis.
// The dispatcher routes JSON-RPC methods to tools, resources and prompts;
// transports (stdio here, HTTP in geoscope-server) feed it.

pub mod completion;
pub mod config;
pub mod context;
pub mod dispatcher;
pub mod logging;
pub mod prompts;
pub mod protocol;
pub mod requests;
pub mod resources;
pub mod server;
pub mod tools;
pub mod transport;

pub use config::McpConfig;
pub use context::{RequestContext, UserContext};
pub use dispatcher::{CallContext, Dispatcher, Handler, HandlerFuture};
pub use server::McpServer;
