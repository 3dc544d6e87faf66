//! The per-connection timer array.
//!
//! A fixed array of six slots kept sorted by expiration, with `u64::MAX`
//! sentinels packed at the tail. Insertion sort over six cache-resident
//! entries beats a heap here; the layout is deliberate.

use std::fmt;

pub const TIMER_COUNT: usize = 6;

#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd)]
pub enum TimerType {
    Pacing,
    AckDelay,
    LossDetection,
    KeepAlive,
    Idle,
    Shutdown,
}

pub const TIMER_TYPES: [TimerType; TIMER_COUNT] = [
    TimerType::Pacing,
    TimerType::AckDelay,
    TimerType::LossDetection,
    TimerType::KeepAlive,
    TimerType::Idle,
    TimerType::Shutdown,
];

impl fmt::Display for TimerType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match *self {
            TimerType::Pacing => "PACING",
            TimerType::AckDelay => "ACK_DELAY",
            TimerType::LossDetection => "LOSS_DETECTION",
            TimerType::KeepAlive => "KEEP_ALIVE",
            TimerType::Idle => "IDLE",
            TimerType::Shutdown => "SHUTDOWN",
        };
        f.write_str(name)
    }
}

impl slog::Value for TimerType {
    fn serialize(
        &self,
        _: &slog::Record<'_>,
        key: slog::Key,
        serializer: &mut dyn slog::Serializer,
    ) -> slog::Result {
        serializer.emit_arguments(key, &format_args!("{}", self))
    }
}

#[derive(Debug, Copy, Clone)]
struct Entry {
    ty: TimerType,
    /// Absolute microseconds; `u64::MAX` marks an unused slot.
    expiration: u64,
}

pub struct TimerTable {
    entries: [Entry; TIMER_COUNT],
}

impl Default for TimerTable {
    fn default() -> Self {
        let mut entries = [Entry {
            ty: TimerType::Pacing,
            expiration: u64::MAX,
        }; TIMER_COUNT];
        for (entry, &ty) in entries.iter_mut().zip(TIMER_TYPES.iter()) {
            entry.ty = ty;
        }
        TimerTable { entries }
    }
}

impl TimerTable {
    pub fn new() -> Self {
        Default::default()
    }

    /// Earliest pending expiration, if any timer is armed.
    pub fn next_expiration(&self) -> Option<u64> {
        match self.entries[0].expiration {
            u64::MAX => None,
            x => Some(x),
        }
    }

    pub fn expiration(&self, ty: TimerType) -> Option<u64> {
        self.entries
            .iter()
            .find(|e| e.ty == ty)
            .and_then(|e| match e.expiration {
                u64::MAX => None,
                x => Some(x),
            })
    }

    /// Arm `ty` to fire at `expiration`. Returns true when the front slot
    /// changed, meaning the external timer wheel must be refreshed.
    pub fn set(&mut self, ty: TimerType, expiration: u64) -> bool {
        debug_assert!(expiration != u64::MAX);
        let mut cur_index = 0;
        let mut new_index = TIMER_COUNT;
        for i in 0..TIMER_COUNT {
            if self.entries[i].ty == ty {
                cur_index = i;
            }
            if i < new_index && expiration < self.entries[i].expiration {
                new_index = i;
            }
        }

        if new_index < cur_index {
            // Shift the intervening range right and drop the entry in front.
            self.entries
                .copy_within(new_index..cur_index, new_index + 1);
            self.entries[new_index] = Entry { ty, expiration };
        } else if new_index > cur_index + 1 {
            self.entries
                .copy_within(cur_index + 1..new_index, cur_index);
            self.entries[new_index - 1] = Entry { ty, expiration };
            new_index -= 1;
        } else {
            self.entries[cur_index].expiration = expiration;
            new_index = cur_index;
        }

        new_index == 0
    }

    /// Disarm `ty`, compacting it past the valid timers. Returns true when
    /// the front slot changed.
    pub fn cancel(&mut self, ty: TimerType) -> bool {
        for i in 0..TIMER_COUNT {
            if self.entries[i].expiration == u64::MAX {
                break;
            }
            if self.entries[i].ty != ty {
                continue;
            }
            let mut j = i + 1;
            while j < TIMER_COUNT && self.entries[j].expiration != u64::MAX {
                j += 1;
            }
            self.entries.copy_within(i + 1..j, i);
            self.entries[j - 1] = Entry {
                ty,
                expiration: u64::MAX,
            };
            return i == 0;
        }
        false
    }

    /// Collect the timers whose expiration is due, rotating them to the tail
    /// as sentinels. Order of the returned types is by expiration.
    pub fn expire(&mut self, now: u64) -> Vec<TimerType> {
        let mut due = Vec::new();
        let mut count = 0;
        while count < TIMER_COUNT && self.entries[count].expiration <= now {
            due.push(self.entries[count].ty);
            count += 1;
        }
        if count > 0 && count < TIMER_COUNT {
            let expired: Vec<Entry> = self.entries[..count].to_vec();
            self.entries.copy_within(count.., 0);
            for (slot, entry) in self.entries[TIMER_COUNT - count..]
                .iter_mut()
                .zip(expired.into_iter())
            {
                *slot = Entry {
                    ty: entry.ty,
                    expiration: u64::MAX,
                };
            }
        } else if count == TIMER_COUNT {
            for entry in self.entries.iter_mut() {
                entry.expiration = u64::MAX;
            }
        }
        due
    }

    /// Disarm everything except the shutdown timer. Done on first close.
    /// Returns true when the front slot changed, meaning the external timer
    /// wheel must be refreshed.
    pub fn cancel_all_but_shutdown(&mut self) -> bool {
        let mut front_changed = false;
        for &ty in TIMER_TYPES.iter() {
            if ty != TimerType::Shutdown {
                front_changed |= self.cancel(ty);
            }
        }
        front_changed
    }

    #[cfg(test)]
    fn assert_sorted(&self) {
        for pair in self.entries.windows(2) {
            assert!(pair[0].expiration <= pair[1].expiration);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_orders_by_expiration() {
        let mut timers = TimerTable::new();
        assert!(timers.set(TimerType::Idle, 1000));
        assert!(!timers.set(TimerType::KeepAlive, 2000));
        assert!(timers.set(TimerType::LossDetection, 500));
        timers.assert_sorted();
        assert_eq!(timers.next_expiration(), Some(500));
        assert_eq!(timers.expiration(TimerType::Idle), Some(1000));
    }

    #[test]
    fn reset_moves_single_entry() {
        let mut timers = TimerTable::new();
        timers.set(TimerType::Idle, 1000);
        timers.set(TimerType::KeepAlive, 2000);
        // Re-arm with a later deadline: still exactly one IDLE entry.
        timers.set(TimerType::Idle, 3000);
        timers.assert_sorted();
        assert_eq!(timers.next_expiration(), Some(2000));
        assert_eq!(timers.expiration(TimerType::Idle), Some(3000));
        let due = timers.expire(5000);
        assert_eq!(due, vec![TimerType::KeepAlive, TimerType::Idle]);
    }

    #[test]
    fn cancel_compacts() {
        let mut timers = TimerTable::new();
        timers.set(TimerType::Idle, 1000);
        timers.set(TimerType::KeepAlive, 2000);
        timers.set(TimerType::Shutdown, 3000);
        assert!(timers.cancel(TimerType::Idle));
        timers.assert_sorted();
        assert_eq!(timers.next_expiration(), Some(2000));
        assert_eq!(timers.expiration(TimerType::Idle), None);
        // Cancelling an unarmed timer is a no-op.
        assert!(!timers.cancel(TimerType::Pacing));
    }

    #[test]
    fn expire_returns_due_prefix() {
        let mut timers = TimerTable::new();
        timers.set(TimerType::Idle, 1000);
        timers.set(TimerType::KeepAlive, 2000);
        timers.set(TimerType::Shutdown, 3000);
        let due = timers.expire(2000);
        assert_eq!(due, vec![TimerType::Idle, TimerType::KeepAlive]);
        timers.assert_sorted();
        assert_eq!(timers.next_expiration(), Some(3000));
        assert!(timers.expire(2500).is_empty());
    }

    #[test]
    fn cancel_all_but_shutdown() {
        let mut timers = TimerTable::new();
        timers.set(TimerType::Idle, 1000);
        timers.set(TimerType::Pacing, 500);
        timers.set(TimerType::Shutdown, 9000);
        assert!(timers.cancel_all_but_shutdown());
        timers.assert_sorted();
        assert_eq!(timers.next_expiration(), Some(9000));
        // Nothing left to cancel; the front slot stays put.
        assert!(!timers.cancel_all_but_shutdown());
    }
}
