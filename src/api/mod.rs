//! HTTP API.

mod routes;
mod types;

pub use routes::{router, serve, AppState};
pub use types::{CostsResponse, CreateTaskRequest, CreateTaskResponse, ListTasksQuery};
