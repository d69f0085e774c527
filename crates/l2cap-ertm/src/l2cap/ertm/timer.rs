use std::time::Instant;

/// Timers owned by one ERTM engine
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum ErtmTimer {
    /// Fires when an I-frame has gone unacknowledged for too long
    Retransmission = 0,
    /// Fires when a poll has gone unanswered for too long
    Monitor = 1,
}

impl ErtmTimer {
    pub const VALUES: [Self; 2] = [Self::Retransmission, Self::Monitor];
}

/// Deadline for each [`ErtmTimer`], advanced with [`TimerTable::expire_before`]
#[derive(Debug, Clone, Copy, Default)]
pub struct TimerTable {
    data: [Option<Instant>; ErtmTimer::VALUES.len()],
}

impl TimerTable {
    /// Sets the timer unconditionally
    pub fn set(&mut self, timer: ErtmTimer, time: Instant) {
        self.data[timer as usize] = Some(time);
    }

    pub fn stop(&mut self, timer: ErtmTimer) {
        self.data[timer as usize] = None;
    }

    pub fn is_armed(&self, timer: ErtmTimer) -> bool {
        self.data[timer as usize].is_some()
    }

    pub fn stop_all(&mut self) {
        self.data = Default::default();
    }

    /// Get the next queued timeout
    pub fn peek(&self) -> Option<Instant> {
        self.data.iter().filter_map(|&x| x).min()
    }

    /// Remove the next timer up until `now`, including it
    pub fn expire_before(&mut self, now: Instant) -> Option<ErtmTimer> {
        let (timer, _) = ErtmTimer::VALUES
            .iter()
            .filter_map(|&t| self.data[t as usize].map(|time| (t, time)))
            .filter(|&(_, time)| time <= now)
            .min_by_key(|&(_, time)| time)?;
        self.data[timer as usize] = None;
        Some(timer)
    }
}
