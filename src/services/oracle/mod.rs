//! Oracle execution surface: the executor contract, the HTTP gateway
//! implementation, and the per-user pool.

pub mod executor;
pub mod gateway;
pub mod pool;

pub use executor::{
    ExecError, ExecErrorClass, ExecOptions, ExecResult, MIN_CALL_TIMEOUT_MS, SqlExecutor,
    classify_error, effective_timeout_ms, is_connection_reset,
};
pub use gateway::OracleGatewayExecutor;
pub use pool::{ExecutorPool, GLOBAL_POOL_KEY};
