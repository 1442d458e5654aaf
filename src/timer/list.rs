//! Deadline-ordered timer list on a wrapping millisecond tick
//!
//! Deadlines are compared by the signed distance from "now" rather than by
//! raw value, so the order survives the tick counter wrapping through zero.
//! That holds as long as every armed deadline is within 2^31 ms (about 24
//! days) of the current tick.

/// Millisecond tick counter, wraps at `u32::MAX`
pub type Tick = u32;

/// True once `deadline` has been reached at `now`.
#[inline]
pub fn is_expired(deadline: Tick, now: Tick) -> bool {
    deadline.wrapping_sub(now) & 0x8000_0000 != 0 || deadline == now
}

/// Signed milliseconds from `now` until `deadline`
#[inline]
fn remaining(deadline: Tick, now: Tick) -> i32 {
    deadline.wrapping_sub(now) as i32
}

/// One armed timer
#[derive(Debug, Clone)]
pub struct TimerEntry<T> {
    /// Identity of the timer this entry belongs to
    pub key: u64,
    pub payload: T,
    pub periodic: bool,
    pub period_ms: u32,
    pub deadline: Tick,
}

/// Armed timers, earliest deadline first. Equal deadlines keep insertion order.
#[derive(Debug)]
pub struct TimerList<T> {
    entries: Vec<TimerEntry<T>>,
}

impl<T> Default for TimerList<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> TimerList<T> {
    pub fn new() -> Self {
        Self {
            entries: Vec::new(),
        }
    }

    /// Insert in deadline order and return the position taken.
    pub fn insert(&mut self, entry: TimerEntry<T>, now: Tick) -> usize {
        let due_in = remaining(entry.deadline, now);
        let pos = self
            .entries
            .iter()
            .position(|e| remaining(e.deadline, now) > due_in)
            .unwrap_or(self.entries.len());
        self.entries.insert(pos, entry);
        debug_assert!(self.is_sorted(now));
        pos
    }

    pub fn remove(&mut self, key: u64) -> Option<TimerEntry<T>> {
        let pos = self.entries.iter().position(|e| e.key == key)?;
        Some(self.entries.remove(pos))
    }

    pub fn contains(&self, key: u64) -> bool {
        self.entries.iter().any(|e| e.key == key)
    }

    pub fn head(&self) -> Option<&TimerEntry<T>> {
        self.entries.first()
    }

    /// Remove and return the head if its deadline has passed.
    pub fn pop_expired(&mut self, now: Tick) -> Option<TimerEntry<T>> {
        match self.entries.first() {
            Some(head) if is_expired(head.deadline, now) => Some(self.entries.remove(0)),
            _ => None,
        }
    }

    /// Milliseconds until the head expires, `None` when empty.
    pub fn time_until_next(&self, now: Tick) -> Option<u32> {
        self.entries
            .first()
            .map(|head| remaining(head.deadline, now).max(0) as u32)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn is_sorted(&self, now: Tick) -> bool {
        self.entries
            .windows(2)
            .all(|w| remaining(w[0].deadline, now) <= remaining(w[1].deadline, now))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(key: u64, deadline: Tick) -> TimerEntry<()> {
        TimerEntry {
            key,
            payload: (),
            periodic: false,
            period_ms: 0,
            deadline,
        }
    }

    #[test]
    fn test_expiry_across_wrap() {
        assert!(is_expired(100, 100));
        assert!(is_expired(99, 100));
        assert!(!is_expired(101, 100));

        let now = u32::MAX - 5;
        assert!(!is_expired(3, now));
        assert!(is_expired(u32::MAX - 10, now));
        assert!(is_expired(u32::MAX - 5, 2));
    }

    #[test]
    fn test_insert_orders_relative_to_now() {
        let now = u32::MAX - 10;
        let mut list = TimerList::new();
        list.insert(entry(1, 20), now);
        list.insert(entry(2, u32::MAX - 1), now);
        list.insert(entry(3, 5), now);

        let keys: Vec<u64> = list.entries.iter().map(|e| e.key).collect();
        assert_eq!(keys, vec![2, 3, 1]);
        assert_eq!(list.time_until_next(now), Some(9));
    }

    #[test]
    fn test_equal_deadlines_keep_insertion_order() {
        let mut list = TimerList::new();
        assert_eq!(list.insert(entry(1, 50), 0), 0);
        assert_eq!(list.insert(entry(2, 50), 0), 1);
        assert_eq!(list.insert(entry(3, 10), 0), 0);

        assert_eq!(list.pop_expired(60).unwrap().key, 3);
        assert_eq!(list.pop_expired(60).unwrap().key, 1);
        assert_eq!(list.pop_expired(60).unwrap().key, 2);
        assert!(list.pop_expired(60).is_none());
    }

    #[test]
    fn test_pop_waits_for_deadline() {
        let mut list = TimerList::new();
        list.insert(entry(1, 30), 0);

        assert!(list.pop_expired(29).is_none());
        assert_eq!(list.time_until_next(29), Some(1));
        assert_eq!(list.time_until_next(40), Some(0));
        assert!(list.pop_expired(30).is_some());
        assert_eq!(list.time_until_next(30), None);
    }

    #[test]
    fn test_remove_and_contains() {
        let mut list = TimerList::new();
        list.insert(entry(1, 10), 0);
        list.insert(entry(2, 20), 0);

        assert!(list.contains(2));
        assert_eq!(list.remove(2).unwrap().deadline, 20);
        assert!(!list.contains(2));
        assert!(list.remove(2).is_none());
        assert_eq!(list.len(), 1);
    }
}
