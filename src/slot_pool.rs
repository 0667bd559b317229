// Copyright 2026 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Bounded pools of frame slots owned by named consumers.
//!
//! Every consumer owns at most one slot of a pool. A consumer acquiring a slot gets, in order of
//! preference:
//!
//! 1. the slot it already owns,
//! 2. a free slot,
//! 3. the least recently acquired slot of another consumer, provided nobody holds its content
//!    anymore.
//!
//! If none of these exist the pool is saturated and acquisition fails.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::PoisonError;

use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SlotPoolError {
    #[error("all {0} slots are in use")]
    NoFreeSlot(usize),
}

pub type Result<T> = std::result::Result<T, SlotPoolError>;

struct Slot<T> {
    owner: Option<String>,
    content: Option<Arc<T>>,
    /// Value of the pool clock when the slot was last acquired.
    acquired_at: u64,
}

impl<T> Slot<T> {
    /// Whether the content of the slot is held outside of the pool.
    fn is_held(&self) -> bool {
        self.content
            .as_ref()
            .map(|content| Arc::strong_count(content) > 1)
            .unwrap_or(false)
    }
}

struct PoolState<T> {
    slots: Vec<Slot<T>>,
    owners: HashMap<String, usize>,
    free: Vec<usize>,
    clock: u64,
}

impl<T> PoolState<T> {
    /// Picks the slot `consumer` should use and tags it, without touching its content.
    fn select(&mut self, consumer: &str) -> Result<usize> {
        if let Some(&index) = self.owners.get(consumer) {
            return Ok(index);
        }

        let index = match self.free.pop() {
            Some(index) => index,
            None => {
                let index = self
                    .slots
                    .iter()
                    .enumerate()
                    .filter(|(_, slot)| !slot.is_held())
                    .min_by_key(|(_, slot)| slot.acquired_at)
                    .map(|(index, _)| index)
                    .ok_or(SlotPoolError::NoFreeSlot(self.slots.len()))?;

                if let Some(previous) = self.slots[index].owner.take() {
                    log::debug!("Reclaiming slot {} from consumer {}", index, previous);
                    self.owners.remove(&previous);
                }
                index
            }
        };

        self.slots[index].owner = Some(consumer.to_string());
        self.owners.insert(consumer.to_string(), index);
        Ok(index)
    }
}

/// A pool of `capacity` slots, each holding an `Arc<T>` tagged with its owning consumer.
pub struct SlotPool<T> {
    state: Mutex<PoolState<T>>,
}

impl<T> SlotPool<T> {
    pub fn new(capacity: usize) -> Self {
        let slots = (0..capacity)
            .map(|_| Slot {
                owner: None,
                content: None,
                acquired_at: 0,
            })
            .collect();

        Self {
            state: Mutex::new(PoolState {
                slots,
                owners: HashMap::new(),
                // Reversed so slots are handed out in ascending order.
                free: (0..capacity).rev().collect(),
                clock: 0,
            }),
        }
    }

    /// Stores `content` in the slot of `consumer` and returns a handle to it. The slot can't be
    /// reclaimed by another consumer while the handle is alive.
    ///
    /// Returns the index of the slot along with the handle.
    pub fn acquire(&self, consumer: &str, content: T) -> Result<(usize, Arc<T>)> {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);

        let index = state.select(consumer)?;
        state.clock += 1;

        let content = Arc::new(content);
        let clock = state.clock;
        let slot = &mut state.slots[index];
        slot.content = Some(Arc::clone(&content));
        slot.acquired_at = clock;

        Ok((index, content))
    }

    /// Returns the content of the slot owned by `consumer`, if any.
    pub fn owned(&self, consumer: &str) -> Option<Arc<T>> {
        let state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        let &index = state.owners.get(consumer)?;
        state.slots[index].content.clone()
    }

    /// Returns the slot of `consumer` to the free list.
    pub fn release(&self, consumer: &str) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(index) = state.owners.remove(consumer) {
            let slot = &mut state.slots[index];
            slot.owner = None;
            slot.content = None;
            state.free.push(index);
        }
    }

    /// Frees every slot.
    pub fn clear(&self) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        let capacity = state.slots.len();

        for slot in state.slots.iter_mut() {
            slot.owner = None;
            slot.content = None;
        }
        state.owners.clear();
        state.free = (0..capacity).rev().collect();
    }

    pub fn capacity(&self) -> usize {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .slots
            .len()
    }

    /// Number of slots currently owned by a consumer.
    pub fn num_owned(&self) -> usize {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .owners
            .len()
    }
}
