//! 时间轮：按刻度分槽的延迟队列
//!
//! 槽位为`(time / tick_ms) % ring_size`，每个槽位内是按时间排序的小顶堆。
//! 轮询时处理当前槽和上一个槽，只取出到期的元素。

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::Mutex;

/// 可放入时间轮的元素
pub trait Timing {
    /// 期望的触发时间(毫秒)
    fn timing(&self) -> i64;
}

struct Entry<T> {
    time: i64,
    seq: u64,
    item: T,
}

impl<T> PartialEq for Entry<T> {
    fn eq(&self, other: &Self) -> bool {
        self.time == other.time && self.seq == other.seq
    }
}

impl<T> Eq for Entry<T> {}

impl<T> PartialOrd for Entry<T> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<T> Ord for Entry<T> {
    // 反转比较，使BinaryHeap成为小顶堆
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .time
            .cmp(&self.time)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

pub struct TimingWheel<T> {
    tick_ms: i64,
    slots: Vec<Mutex<BinaryHeap<Entry<T>>>>,
    seq: AtomicU64,
}

impl<T: Timing> Default for TimingWheel<T> {
    fn default() -> Self {
        Self::new(1_000, 60)
    }
}

impl<T: Timing> TimingWheel<T> {
    pub fn new(tick_ms: i64, ring_size: usize) -> Self {
        let tick_ms = tick_ms.max(1);
        let ring_size = ring_size.max(2);
        Self {
            tick_ms,
            slots: (0..ring_size)
                .map(|_| Mutex::new(BinaryHeap::new()))
                .collect(),
            seq: AtomicU64::new(0),
        }
    }

    pub fn tick_ms(&self) -> i64 {
        self.tick_ms
    }

    /// 放入`max(item.timing(), least_time)`所在的槽位
    pub fn offer(&self, item: T, least_time: i64) {
        let slot_time = item.timing().max(least_time);
        let entry = Entry {
            time: item.timing(),
            seq: self.seq.fetch_add(1, AtomicOrdering::Relaxed),
            item,
        };
        let index = self.slot_index(slot_time);
        if let Ok(mut heap) = self.slots[index].lock() {
            heap.push(entry);
        }
    }

    /// 取出当前槽与上一个槽中已到期的元素
    pub fn poll(&self, now: i64) -> Vec<T> {
        let current = self.slot_index(now);
        let size = self.slots.len();
        let mut ready = Vec::new();
        for back in 0..2 {
            let index = (current + size - back) % size;
            let Ok(mut heap) = self.slots[index].lock() else {
                continue;
            };
            while heap.peek().is_some_and(|e| e.time <= now) {
                if let Some(entry) = heap.pop() {
                    ready.push(entry.item);
                }
            }
        }
        ready
    }

    pub fn len(&self) -> usize {
        self.slots
            .iter()
            .filter_map(|s| s.lock().ok().map(|h| h.len()))
            .sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn slot_index(&self, time: i64) -> usize {
        (time.div_euclid(self.tick_ms) as u64 % self.slots.len() as u64) as usize
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, PartialEq)]
    struct Delayed {
        id: u32,
        time: i64,
    }

    impl Timing for Delayed {
        fn timing(&self) -> i64 {
            self.time
        }
    }

    const BASE: i64 = 1_700_000_000_000;

    #[test]
    fn test_item_not_returned_before_due() {
        let wheel = TimingWheel::default();
        let offer_time = BASE + 250;
        wheel.offer(
            Delayed {
                id: 1,
                time: offer_time + 1_500,
            },
            offer_time,
        );

        assert!(wheel.poll(offer_time).is_empty());
        assert!(wheel.poll(offer_time + 1_000).is_empty());
        assert!(wheel.poll(offer_time + 1_499).is_empty());

        let polled = wheel.poll(offer_time + 1_500);
        assert_eq!(polled.len(), 1);
        assert_eq!(polled[0].id, 1);

        // 不会重复返回
        assert!(wheel.poll(offer_time + 1_500).is_empty());
        assert!(wheel.poll(offer_time + 2_500).is_empty());
        assert!(wheel.is_empty());
    }

    #[test]
    fn test_least_time_pushes_slot_forward() {
        let wheel = TimingWheel::default();
        // 已过期的元素放入least_time所在槽位
        wheel.offer(Delayed { id: 1, time: BASE }, BASE + 3_000);
        assert!(wheel.poll(BASE).is_empty());
        assert!(wheel.poll(BASE + 1_000).is_empty());
        assert_eq!(wheel.poll(BASE + 3_000).len(), 1);
    }

    #[test]
    fn test_previous_slot_drained() {
        let wheel = TimingWheel::default();
        wheel.offer(Delayed { id: 1, time: BASE + 100 }, BASE);
        // 跳过一个刻度后仍能从上一个槽取出
        let polled = wheel.poll(BASE + 1_100);
        assert_eq!(polled, vec![Delayed { id: 1, time: BASE + 100 }]);
    }

    #[test]
    fn test_ordered_within_slot() {
        let wheel = TimingWheel::default();
        for (id, offset) in [(1, 900), (2, 100), (3, 500)] {
            wheel.offer(
                Delayed {
                    id,
                    time: BASE + offset,
                },
                BASE,
            );
        }
        let ids: Vec<u32> = wheel.poll(BASE + 999).into_iter().map(|d| d.id).collect();
        assert_eq!(ids, vec![2, 3, 1]);
    }

    #[test]
    fn test_far_future_item_waits_full_round() {
        let wheel = TimingWheel::new(1_000, 60);
        let far = BASE + 60_000;
        wheel.offer(Delayed { id: 1, time: far }, BASE);
        // 与BASE落在同一槽位但未到期
        assert!(wheel.poll(BASE).is_empty());
        assert_eq!(wheel.len(), 1);
        assert_eq!(wheel.poll(far).len(), 1);
    }
}
