pub mod timeout;

pub use timeout::{RequestTimeout, request_timeout_middleware};
