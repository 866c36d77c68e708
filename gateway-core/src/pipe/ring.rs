//! Fixed-capacity "most recent N" container

/// Circular array with a single write cursor.
///
/// The cursor always points at the most recently pushed slot; pushing moves
/// it forward and overwrites whatever was there.
#[derive(Debug)]
pub(crate) struct RecentRing<T> {
    slots: Vec<Option<T>>,
    cursor: usize,
}

impl<T> RecentRing<T> {
    /// `capacity` must be at least 1
    pub(crate) fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "ring capacity must be at least 1");
        Self {
            slots: (0..capacity).map(|_| None).collect(),
            cursor: 0,
        }
    }

    pub(crate) fn push(&mut self, value: T) {
        self.cursor = (self.cursor + 1) % self.slots.len();
        self.slots[self.cursor] = Some(value);
    }

    /// The most recently pushed value, unless it has been removed
    pub(crate) fn current(&self) -> Option<&T> {
        self.slots[self.cursor].as_ref()
    }

    pub(crate) fn find<P>(&self, mut predicate: P) -> Option<&T>
    where
        P: FnMut(&T) -> bool,
    {
        self.slots.iter().flatten().find(|value| predicate(*value))
    }

    pub(crate) fn contains<P>(&self, predicate: P) -> bool
    where
        P: FnMut(&T) -> bool,
    {
        self.find(predicate).is_some()
    }

    /// Drop every value matching `predicate`, returning how many were
    /// dropped.
    ///
    /// The remaining values keep their order and close up behind the
    /// cursor, so the freed slots are the next ones pushed into and nothing
    /// else is evicted early.
    pub(crate) fn remove<P>(&mut self, mut predicate: P) -> usize
    where
        P: FnMut(&T) -> bool,
    {
        let capacity = self.slots.len();
        let mut kept = Vec::with_capacity(capacity);
        let mut removed = 0;

        // newest first
        for age in 0..capacity {
            let index = (self.cursor + capacity - age) % capacity;
            match self.slots[index].take() {
                Some(value) if predicate(&value) => removed += 1,
                Some(value) => kept.push(value),
                None => {}
            }
        }

        for (age, value) in kept.into_iter().enumerate() {
            let index = (self.cursor + capacity - age) % capacity;
            self.slots[index] = Some(value);
        }

        removed
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.slots.iter().flatten().count()
    }
}
