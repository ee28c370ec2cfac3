//! Keyed timer queue owned by the match.
//!
//! Every deferred effect (reload completion, grenade fuse, countdown ticks,
//! round clock, next round) is an entry keyed by what it belongs to. Scheduling
//! the same key again replaces the earlier deadline, so a key never has more
//! than one pending timer. Due entries are drained by the tick loop and
//! resolved on the match task; resolvers must re-check state.

use super::grenades::GrenadeId;
use super::player::PlayerSlot;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TimerKey {
    Reload { player: PlayerSlot, slot: usize },
    GrenadeFuse(GrenadeId),
    Countdown,
    RoundClock,
    NextRound,
}

impl TimerKey {
    /// Player the timer belongs to, if it is player scoped
    fn owner(&self) -> Option<PlayerSlot> {
        match self {
            TimerKey::Reload { player, .. } => Some(*player),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct TimerEntry {
    key: TimerKey,
    due_at: u64,
}

#[derive(Debug, Default)]
pub struct Timers {
    entries: Vec<TimerEntry>,
}

impl Timers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn schedule(&mut self, key: TimerKey, due_at: u64) {
        self.cancel(key);
        self.entries.push(TimerEntry { key, due_at });
    }

    pub fn cancel(&mut self, key: TimerKey) -> bool {
        let before = self.entries.len();
        self.entries.retain(|e| e.key != key);
        before != self.entries.len()
    }

    /// Drop every timer scoped to `player`
    pub fn cancel_player(&mut self, player: PlayerSlot) {
        self.entries.retain(|e| e.key.owner() != Some(player));
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn due_at(&self, key: TimerKey) -> Option<u64> {
        self.entries.iter().find(|e| e.key == key).map(|e| e.due_at)
    }

    pub fn is_pending(&self, key: TimerKey) -> bool {
        self.due_at(key).is_some()
    }

    /// Remove and return every timer due at or before `now`, earliest first
    pub fn drain_due(&mut self, now: u64) -> Vec<TimerKey> {
        let mut due: Vec<TimerEntry> = Vec::new();
        self.entries.retain(|e| {
            if e.due_at <= now {
                due.push(*e);
                false
            } else {
                true
            }
        });
        due.sort_by_key(|e| e.due_at);
        due.into_iter().map(|e| e.key).collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rescheduling_replaces_deadline() {
        let mut timers = Timers::new();
        timers.schedule(TimerKey::Countdown, 1000);
        timers.schedule(TimerKey::Countdown, 2000);
        assert_eq!(timers.len(), 1);
        assert_eq!(timers.due_at(TimerKey::Countdown), Some(2000));
    }

    #[test]
    fn drains_in_deadline_order() {
        let mut timers = Timers::new();
        timers.schedule(TimerKey::GrenadeFuse(2), 300);
        timers.schedule(TimerKey::GrenadeFuse(1), 100);
        timers.schedule(TimerKey::RoundClock, 5000);

        assert!(timers.drain_due(50).is_empty());
        assert_eq!(
            timers.drain_due(300),
            vec![TimerKey::GrenadeFuse(1), TimerKey::GrenadeFuse(2)]
        );
        assert_eq!(timers.len(), 1);
    }

    #[test]
    fn player_sweep_leaves_other_timers() {
        let mut timers = Timers::new();
        timers.schedule(TimerKey::Reload { player: 0, slot: 0 }, 100);
        timers.schedule(TimerKey::Reload { player: 1, slot: 1 }, 100);
        timers.schedule(TimerKey::GrenadeFuse(9), 100);

        timers.cancel_player(0);

        assert!(!timers.is_pending(TimerKey::Reload { player: 0, slot: 0 }));
        assert!(timers.is_pending(TimerKey::Reload { player: 1, slot: 1 }));
        assert!(timers.is_pending(TimerKey::GrenadeFuse(9)));
    }
}
