pub mod error;
pub mod sql_text;
pub mod text;

pub use error::{ApiError, ApiResult};
