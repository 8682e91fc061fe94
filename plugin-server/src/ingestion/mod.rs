pub mod persons;
pub mod process;
pub mod sink;
pub mod teams;

pub use persons::PersonResolver;
pub use process::EventProcessor;
pub use sink::{EventSink, KafkaEventSink, MemorySink, PrintSink};
pub use teams::TeamManager;
