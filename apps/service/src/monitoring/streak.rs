use serde::Serialize;

use super::types::Status;

/// Consecutive-result counters for one check.
///
/// Owned by the check's polling loop; starts at (0, 0) every time a loop is
/// spawned.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StreakState {
    /// Consecutive `down` outcomes
    pub down: u32,
    /// Consecutive `up` or `degraded` outcomes
    pub up: u32,
}

impl StreakState {
    /// Fold one status into the counters. At most one counter is nonzero afterwards.
    #[must_use]
    pub fn advance(self, status: Status) -> Self {
        if status.is_available() {
            Self { down: 0, up: self.up.saturating_add(1) }
        } else {
            Self { down: self.down.saturating_add(1), up: 0 }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use Status::{Degraded, Down, Up};

    fn trailing_run(statuses: &[Status], available: bool) -> u32 {
        statuses.iter().rev().take_while(|s| s.is_available() == available).count() as u32
    }

    #[test]
    fn counters_track_trailing_runs() {
        let sequences: &[&[Status]] = &[
            &[],
            &[Up],
            &[Down, Down],
            &[Up, Down, Down, Down, Up, Up],
            &[Down, Degraded, Up, Degraded],
            &[Up, Up, Down],
            &[Degraded, Down, Down, Up, Down],
        ];

        for statuses in sequences {
            let state = statuses.iter().fold(StreakState::default(), |s, &st| s.advance(st));
            assert_eq!(state.down, trailing_run(statuses, false), "down for {statuses:?}");
            assert_eq!(state.up, trailing_run(statuses, true), "up for {statuses:?}");
            assert!(state.down == 0 || state.up == 0);
        }
    }

    #[test]
    fn degraded_counts_as_available() {
        let state = StreakState { down: 4, up: 0 }.advance(Degraded);
        assert_eq!(state, StreakState { down: 0, up: 1 });
    }

    #[test]
    fn counters_saturate() {
        let state = StreakState { down: u32::MAX, up: 0 }.advance(Down);
        assert_eq!(state.down, u32::MAX);
    }
}
