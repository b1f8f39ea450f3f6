//! Discovery engine: sensors that poll sources and emit one run request per
//! new item, and schedules that emit one per cron tick.

pub mod filter;
pub mod runner;
pub mod schedule;
pub mod sensor;
pub mod sink;

pub use filter::{compile_pattern, list_request, ItemFilter};
pub use runner::{run_sensors, SensorRunner};
pub use schedule::ScheduleEvaluator;
pub use sensor::{CycleOutcome, SensorCore, SensorState};
pub use sink::{ChannelSink, MemorySink, RunRequestSink, SinkError};
