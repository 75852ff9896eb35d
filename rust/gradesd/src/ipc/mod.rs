mod error;
mod handlers;
mod helpers;
mod router;
mod types;

pub use handlers::core::open_workspace;
pub use handlers::entry::{next_wake, tick};
pub use router::handle_request;
pub use types::{AppState, Request};
