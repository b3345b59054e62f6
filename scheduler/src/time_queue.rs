
/// Handle for an event sitting in an [`EventQueue`].
#[derive(Copy, Clone, PartialEq, Eq, Hash, Debug)]
pub struct EventId(u64);

#[derive(Debug)]
struct Entry<E> {
    id: EventId,
    remaining: u64,
    event: E,
}

/// Pending events ordered by the number of cycles until they fire.
///
/// The queue is a sorted list. Events due at the same cycle fire in the order they were inserted.
/// It's expected to hold a handful of timers and interrupts, so every operation is a linear scan.
#[derive(Debug)]
pub struct EventQueue<E> {
    entries: Vec<Entry<E>>,
    next_id: u64,
}

impl<E> Default for EventQueue<E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E> EventQueue<E> {
    pub fn new() -> Self {
        Self {
            entries: Vec::new(),
            next_id: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Schedules `event` to fire after `remaining` cycles.
    pub fn add(&mut self, remaining: u64, event: E) -> EventId {
        let id = EventId(self.next_id);
        self.next_id += 1;
        self.insert(Entry { id, remaining, event });
        id
    }

    fn insert(&mut self, entry: Entry<E>) {
        let pos = self.entries.partition_point(|e| e.remaining <= entry.remaining);
        self.entries.insert(pos, entry);
    }

    fn position(&self, id: EventId) -> Option<usize> {
        self.entries.iter().position(|e| e.id == id)
    }

    /// Moves an already scheduled event. Returns false if it already fired or was removed.
    pub fn change_time(&mut self, id: EventId, remaining: u64) -> bool {
        match self.position(id) {
            Some(pos) => {
                let mut entry = self.entries.remove(pos);
                entry.remaining = remaining;
                self.insert(entry);
                true
            }
            None => false,
        }
    }

    pub fn remove(&mut self, id: EventId) -> Option<E> {
        let pos = self.position(id)?;
        Some(self.entries.remove(pos).event)
    }

    pub fn remaining(&self, id: EventId) -> Option<u64> {
        self.position(id).map(|pos| self.entries[pos].remaining)
    }

    /// Cycles until the earliest event fires.
    pub fn next_deadline(&self) -> Option<u64> {
        self.entries.first().map(|e| e.remaining)
    }

    pub fn peek(&self) -> Option<(u64, &E)> {
        self.entries.first().map(|e| (e.remaining, &e.event))
    }

    /// Moves time forward by `cycles` and returns every event that became due, earliest first.
    ///
    /// Events that were overshot fire too, they just fire late.
    pub fn advance(&mut self, cycles: u64) -> Vec<E> {
        for entry in self.entries.iter_mut() {
            entry.remaining = entry.remaining.saturating_sub(cycles);
        }
        let due = self.entries.partition_point(|e| e.remaining == 0);
        self.entries.drain(..due).map(|e| e.event).collect()
    }
}

impl<E: PartialEq> EventQueue<E> {
    /// Reschedules the queued event equal to `event`, or adds it if there is none.
    pub fn add_or_reschedule(&mut self, remaining: u64, event: E) -> EventId {
        match self.entries.iter().position(|e| e.event == event) {
            Some(pos) => {
                let id = self.entries[pos].id;
                self.change_time(id, remaining);
                id
            }
            None => self.add(remaining, event),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, PartialEq, Eq, Clone, Copy)]
    enum Ev {
        Timer0,
        Timer1,
        VBlank,
    }

    #[test]
    fn fires_in_deadline_order() {
        let mut queue = EventQueue::new();
        queue.add(300, Ev::VBlank);
        queue.add(100, Ev::Timer0);
        queue.add(200, Ev::Timer1);
        assert_eq!(queue.next_deadline(), Some(100));

        assert_eq!(queue.advance(50), vec![]);
        assert_eq!(queue.next_deadline(), Some(50));
        assert_eq!(queue.advance(160), vec![Ev::Timer0, Ev::Timer1]);
        assert_eq!(queue.advance(90), vec![Ev::VBlank]);
        assert!(queue.is_empty());
    }

    #[test]
    fn ties_keep_insertion_order() {
        let mut queue = EventQueue::new();
        queue.add(10, Ev::Timer1);
        queue.add(10, Ev::Timer0);
        assert_eq!(queue.advance(10), vec![Ev::Timer1, Ev::Timer0]);
    }

    #[test]
    fn change_time_and_remove() {
        let mut queue = EventQueue::new();
        let a = queue.add(10, Ev::Timer0);
        let b = queue.add(20, Ev::Timer1);
        assert!(queue.change_time(a, 30));
        assert_eq!(queue.peek(), Some((20, &Ev::Timer1)));
        assert_eq!(queue.remaining(a), Some(30));

        assert_eq!(queue.remove(b), Some(Ev::Timer1));
        assert_eq!(queue.remove(b), None);
        assert!(!queue.change_time(b, 5));
        assert_eq!(queue.advance(30), vec![Ev::Timer0]);
    }

    #[test]
    fn add_or_reschedule_keeps_one_entry() {
        let mut queue = EventQueue::new();
        let first = queue.add_or_reschedule(100, Ev::VBlank);
        let second = queue.add_or_reschedule(40, Ev::VBlank);
        assert_eq!(first, second);
        assert_eq!(queue.len(), 1);
        assert_eq!(queue.next_deadline(), Some(40));
    }
}
