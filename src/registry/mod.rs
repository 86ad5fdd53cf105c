pub mod listeners;
pub mod routes;
pub mod streams;

pub use listeners::ListenerRegistry;
pub use routes::{HttpMethod, RouteRegistry, RouteTarget};
pub use streams::StreamHub;
