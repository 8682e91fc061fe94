pub mod element;
pub mod event;
pub mod person;
pub mod team;
pub mod timestamp;

pub use element::Element;
pub use event::{ClickHouseEvent, EventError, PluginEvent, RawEvent, SessionRecordingEvent};
pub use person::{Person, PersonDistinctId, PersonId};
pub use team::{Team, TeamId};
