use std::fmt;

/// Where the collector is in its run cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RunState {
    #[default]
    Idle,
    Running,
    /// A fatal error ended the run; no data is merged until the next start
    Aborted,
    Terminated,
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Idle => "idle",
            Self::Running => "running",
            Self::Aborted => "aborted",
            Self::Terminated => "terminated",
        };
        write!(f, "{name}")
    }
}

/// Snapshot of the collector sent from the run loop to whoever is watching (the CLI)
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CollectorStatus {
    pub run_number: u32,
    pub events_merged: u64,
    pub bytes_written: u64,
    pub sources_connected: usize,
    pub state: RunState,
}

impl CollectorStatus {
    pub fn new(
        run_number: u32,
        events_merged: u64,
        bytes_written: u64,
        sources_connected: usize,
        state: RunState,
    ) -> Self {
        Self {
            run_number,
            events_merged,
            bytes_written,
            sources_connected,
            state,
        }
    }
}

impl fmt::Display for CollectorStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "run {} {} | {} sources | {} merged | {} written",
            self.run_number,
            self.state,
            self.sources_connected,
            self.events_merged,
            human_bytes::human_bytes(self.bytes_written as f64)
        )
    }
}
