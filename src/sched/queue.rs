//! Priority-indexed ready queue.

use crate::thread::PRIORITY_LEVELS;
use std::collections::VecDeque;

/// FIFO lists, one per priority level, with an occupancy bitmap.
///
/// Level 0 is the highest priority. Bit `n` of the bitmap is set while
/// level `n` is non-empty, so the best level is found with one
/// `trailing_zeros`.
#[derive(Debug, Clone)]
pub struct MultiLevelQueue<T> {
    levels: Vec<VecDeque<T>>,
    occupied: u64,
}

impl<T: Copy + PartialEq> MultiLevelQueue<T> {
    pub fn new() -> Self {
        Self {
            levels: (0..PRIORITY_LEVELS).map(|_| VecDeque::new()).collect(),
            occupied: 0,
        }
    }

    #[inline]
    fn level(priority: u32) -> usize {
        let level = priority as usize;
        assert!(level < PRIORITY_LEVELS, "priority {priority} out of range");
        level
    }

    pub fn push_back(&mut self, priority: u32, item: T) {
        let level = Self::level(priority);
        self.levels[level].push_back(item);
        self.occupied |= 1 << level;
    }

    pub fn push_front(&mut self, priority: u32, item: T) {
        let level = Self::level(priority);
        self.levels[level].push_front(item);
        self.occupied |= 1 << level;
    }

    /// Remove `item` from the `priority` level. Returns whether it was queued.
    pub fn remove(&mut self, priority: u32, item: T) -> bool {
        let level = Self::level(priority);
        let list = &mut self.levels[level];
        let Some(pos) = list.iter().position(|queued| *queued == item) else {
            return false;
        };
        list.remove(pos);
        if list.is_empty() {
            self.occupied &= !(1 << level);
        }
        true
    }

    /// Move `item` between levels, keeping FIFO order within the target.
    pub fn adjust(&mut self, item: T, old_priority: u32, new_priority: u32) {
        if self.remove(old_priority, item) {
            self.push_back(new_priority, item);
        }
    }

    /// Best priority currently queued.
    pub fn highest_priority(&self) -> Option<u32> {
        (self.occupied != 0).then(|| self.occupied.trailing_zeros())
    }

    /// First item of the best level.
    pub fn front(&self) -> Option<(u32, T)> {
        let priority = self.highest_priority()?;
        self.levels[priority as usize]
            .front()
            .map(|item| (priority, *item))
    }

    pub fn pop_front(&mut self) -> Option<(u32, T)> {
        let (priority, item) = self.front()?;
        self.remove(priority, item);
        Some((priority, item))
    }

    pub fn contains(&self, priority: u32, item: T) -> bool {
        self.levels[Self::level(priority)].contains(&item)
    }

    /// Items in scheduling order: best level first, FIFO within a level.
    pub fn iter(&self) -> impl Iterator<Item = (u32, T)> + '_ {
        let mut bits = self.occupied;
        core::iter::from_fn(move || {
            if bits == 0 {
                return None;
            }
            let level = bits.trailing_zeros();
            bits &= bits - 1;
            Some(level)
        })
        .flat_map(move |level| {
            self.levels[level as usize]
                .iter()
                .map(move |item| (level, *item))
        })
    }

    pub fn len(&self) -> usize {
        self.levels.iter().map(VecDeque::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.occupied == 0
    }
}

impl<T: Copy + PartialEq> Default for MultiLevelQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}
