pub mod backpressure;
pub mod coalescer;
pub mod dispatcher;
pub mod gate;
pub mod pipeline;

pub use backpressure::{Admission, BackpressureController};
pub use coalescer::{CoalesceKey, Coalescer};
pub use dispatcher::FanoutDispatcher;
pub use gate::ConsistencyGate;
pub use pipeline::Pipeline;
