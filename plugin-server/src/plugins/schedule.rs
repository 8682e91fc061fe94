use serde::{Deserialize, Serialize};

use crate::plugins::types::PluginConfigId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Periodicity {
    Minute,
    Hour,
    Day,
}

impl Periodicity {
    pub const ALL: [Periodicity; 3] = [Periodicity::Minute, Periodicity::Hour, Periodicity::Day];

    /// The task name plugins export for this cadence.
    pub fn task_name(&self) -> &'static str {
        match self {
            Periodicity::Minute => "runEveryMinute",
            Periodicity::Hour => "runEveryHour",
            Periodicity::Day => "runEveryDay",
        }
    }
}

/// Which configs want to run at each cadence. Rebuilt from the VMs' task
/// maps after every plugin reload; consumers treat "not loaded yet" (`None`
/// at the registry level) as "wait".
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PluginSchedule {
    pub run_every_minute: Vec<PluginConfigId>,
    pub run_every_hour: Vec<PluginConfigId>,
    pub run_every_day: Vec<PluginConfigId>,
}

impl PluginSchedule {
    pub fn bucket(&self, periodicity: Periodicity) -> &[PluginConfigId] {
        match periodicity {
            Periodicity::Minute => &self.run_every_minute,
            Periodicity::Hour => &self.run_every_hour,
            Periodicity::Day => &self.run_every_day,
        }
    }

    pub fn bucket_mut(&mut self, periodicity: Periodicity) -> &mut Vec<PluginConfigId> {
        match periodicity {
            Periodicity::Minute => &mut self.run_every_minute,
            Periodicity::Hour => &mut self.run_every_hour,
            Periodicity::Day => &mut self.run_every_day,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.run_every_minute.is_empty()
            && self.run_every_hour.is_empty()
            && self.run_every_day.is_empty()
    }
}
