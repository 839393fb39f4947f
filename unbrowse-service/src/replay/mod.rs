//! Replay: request preparation and chain execution

pub mod chain;
pub mod prepare;

pub use chain::{
    execute_capture_chain, ChainOptions, ChainResult, HttpTransport, StepOutcome, Transport,
};
pub use prepare::{
    extract_from_runtime, prepare_request_for_step, PrepareOptions, PreparedRequest,
    StepResponseRuntime,
};
