//! Timer services bound to a keyed backend.
//!
//! A [`TimerServiceManager`] is opened once per keyed backend variant
//! and reads the current key from that backend. Timers are held in
//! named services, each with an event time and a processing time
//! queue. Timers fire in timestamp order; timers with the same
//! timestamp fire in the order they were registered.

use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::MutexGuard;
use std::sync::PoisonError;

use chrono::DateTime;
use chrono::TimeZone;
use chrono::Utc;

use crate::backend::Closeable;
use crate::backend::KeyContext;
use crate::errors::StateError;
use crate::errors::StateResult;
use crate::model::*;

/// One queue of timers in a single time domain.
#[derive(Debug, Default)]
struct TimerQueue {
    /// Ordered by timestamp, then registration sequence.
    queue: BTreeSet<(i64, u64, StateKey)>,
    index: HashMap<(StateKey, i64), u64>,
}

impl TimerQueue {
    /// Returns `false` if the key already has a timer at `timestamp`.
    fn insert(&mut self, key: StateKey, timestamp: i64, seq: u64) -> bool {
        if self.index.contains_key(&(key.clone(), timestamp)) {
            return false;
        }
        self.index.insert((key.clone(), timestamp), seq);
        self.queue.insert((timestamp, seq, key));
        true
    }

    fn delete(&mut self, key: StateKey, timestamp: i64) -> bool {
        match self.index.remove(&(key.clone(), timestamp)) {
            Some(seq) => self.queue.remove(&(timestamp, seq, key)),
            None => false,
        }
    }

    /// Remove and return every timer at or before `timestamp`.
    fn pop_until(&mut self, timestamp: i64) -> Vec<(i64, u64, StateKey)> {
        let due = if timestamp == i64::MAX {
            std::mem::take(&mut self.queue)
        } else {
            // `split_off` keeps what is `>=` the bound, so the bound is
            // the smallest possible entry just past `timestamp`.
            let later = self
                .queue
                .split_off(&(timestamp + 1, 0, StateKey(String::new())));
            std::mem::replace(&mut self.queue, later)
        };
        for (ts, _seq, key) in &due {
            self.index.remove(&(key.clone(), *ts));
        }
        due.into_iter().collect()
    }

    fn peek(&self) -> Option<i64> {
        self.queue.first().map(|(ts, _, _)| *ts)
    }

    fn len(&self) -> usize {
        self.queue.len()
    }
}

#[derive(Debug, Default)]
struct TimerService {
    event: TimerQueue,
    processing: TimerQueue,
}

impl TimerService {
    fn queue_mut(&mut self, domain: TimeDomain) -> &mut TimerQueue {
        match domain {
            TimeDomain::EventTime => &mut self.event,
            TimeDomain::ProcessingTime => &mut self.processing,
        }
    }

    fn queue(&self, domain: TimeDomain) -> &TimerQueue {
        match domain {
            TimeDomain::EventTime => &self.event,
            TimeDomain::ProcessingTime => &self.processing,
        }
    }
}

#[derive(Debug, Default)]
struct TimersInner {
    services: BTreeMap<String, TimerService>,
    next_seq: u64,
    closed: bool,
}

pub struct TimerServiceManager {
    step_id: StepId,
    key_context: Arc<dyn KeyContext>,
    inner: Mutex<TimersInner>,
}

impl TimerServiceManager {
    /// Bind a manager to `key_context` and load `restored` timers.
    ///
    /// Restored timers keep their sequence numbers; new ones are
    /// numbered after the largest restored one. A restored sequence
    /// number that leaves no room after it is corrupt.
    pub(crate) fn new(
        step_id: StepId,
        key_context: Arc<dyn KeyContext>,
        restored: Vec<TimerEntry>,
    ) -> StateResult<Self> {
        let mut inner = TimersInner::default();
        let count = restored.len();
        for timer in restored {
            let after = timer.seq.checked_add(1).ok_or_else(|| {
                StateError::corrupt(&format!(
                    "restored timer for key {:?} at {} has sequence number {}",
                    timer.key, timer.timestamp, timer.seq
                ))
            })?;
            inner.next_seq = inner.next_seq.max(after);
            inner
                .services
                .entry(timer.service)
                .or_default()
                .queue_mut(timer.domain)
                .insert(timer.key, timer.timestamp, timer.seq);
        }
        if count > 0 {
            tracing::debug!("Restored {count} timers for {step_id}");
        }
        Ok(Self {
            step_id,
            key_context,
            inner: Mutex::new(inner),
        })
    }

    fn lock(&self) -> StateResult<MutexGuard<'_, TimersInner>> {
        let inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        if inner.closed {
            Err(StateError::released(&format!(
                "timer service manager of {} is closed",
                self.step_id
            )))
        } else {
            Ok(inner)
        }
    }

    fn current_key(&self) -> StateResult<StateKey> {
        self.key_context
            .current_key()
            .ok_or_else(|| StateError::NoCurrentKey(format!("timers of {}", self.step_id)))
    }

    fn register(&self, service: &str, domain: TimeDomain, timestamp: i64) -> StateResult<bool> {
        let key = self.current_key()?;
        let mut inner = self.lock()?;
        let seq = inner.next_seq;
        let next_seq = seq.checked_add(1).ok_or_else(|| {
            StateError::exhausted(&format!(
                "timer sequence numbers of {} are used up",
                self.step_id
            ))
        })?;
        let added = inner
            .services
            .entry(service.to_owned())
            .or_default()
            .queue_mut(domain)
            .insert(key, timestamp, seq);
        if added {
            inner.next_seq = next_seq;
        }
        Ok(added)
    }

    fn delete(&self, service: &str, domain: TimeDomain, timestamp: i64) -> StateResult<bool> {
        let key = self.current_key()?;
        let mut inner = self.lock()?;
        Ok(inner
            .services
            .get_mut(service)
            .map_or(false, |svc| svc.queue_mut(domain).delete(key, timestamp)))
    }

    /// Register an event time timer for the current key.
    ///
    /// Returns `false` if the key already had a timer at that time.
    pub fn register_event_time_timer(&self, service: &str, timestamp: i64) -> StateResult<bool> {
        self.register(service, TimeDomain::EventTime, timestamp)
    }

    /// Register a processing time timer for the current key.
    pub fn register_processing_time_timer(
        &self,
        service: &str,
        at: DateTime<Utc>,
    ) -> StateResult<bool> {
        self.register(service, TimeDomain::ProcessingTime, at.timestamp_millis())
    }

    pub fn delete_event_time_timer(&self, service: &str, timestamp: i64) -> StateResult<bool> {
        self.delete(service, TimeDomain::EventTime, timestamp)
    }

    pub fn delete_processing_time_timer(
        &self,
        service: &str,
        at: DateTime<Utc>,
    ) -> StateResult<bool> {
        self.delete(service, TimeDomain::ProcessingTime, at.timestamp_millis())
    }

    fn fire(&self, domain: TimeDomain, until: i64) -> StateResult<Vec<TimerEntry>> {
        let mut inner = self.lock()?;
        let mut fired: Vec<TimerEntry> = inner
            .services
            .iter_mut()
            .flat_map(|(name, svc)| {
                svc.queue_mut(domain)
                    .pop_until(until)
                    .into_iter()
                    .map(move |(timestamp, seq, key)| TimerEntry {
                        service: name.clone(),
                        domain,
                        key,
                        timestamp,
                        seq,
                    })
            })
            .collect();
        fired.sort_by_key(|timer| (timer.timestamp, timer.seq));
        Ok(fired)
    }

    /// Remove and return all event time timers at or before
    /// `watermark`, in firing order.
    pub fn advance_watermark(&self, watermark: i64) -> StateResult<Vec<TimerEntry>> {
        self.fire(TimeDomain::EventTime, watermark)
    }

    /// Remove and return all processing time timers at or before
    /// `now`, in firing order.
    pub fn advance_processing_time(&self, now: DateTime<Utc>) -> StateResult<Vec<TimerEntry>> {
        self.fire(TimeDomain::ProcessingTime, now.timestamp_millis())
    }

    fn next(&self, domain: TimeDomain) -> StateResult<Option<i64>> {
        let inner = self.lock()?;
        Ok(inner
            .services
            .values()
            .filter_map(|svc| svc.queue(domain).peek())
            .min())
    }

    pub fn next_event_time(&self) -> StateResult<Option<i64>> {
        self.next(TimeDomain::EventTime)
    }

    /// When the next processing time timer is due.
    pub fn next_processing_time(&self) -> StateResult<Option<DateTime<Utc>>> {
        Ok(self
            .next(TimeDomain::ProcessingTime)?
            .and_then(|millis| Utc.timestamp_millis_opt(millis).single()))
    }

    /// Total timers pending across all services and domains.
    pub fn num_timers(&self) -> StateResult<usize> {
        let inner = self.lock()?;
        Ok(inner
            .services
            .values()
            .map(|svc| svc.event.len() + svc.processing.len())
            .sum())
    }

    pub fn service_names(&self) -> StateResult<Vec<String>> {
        Ok(self.lock()?.services.keys().cloned().collect())
    }
}

impl Closeable for TimerServiceManager {
    fn name(&self) -> &'static str {
        "timer service manager"
    }

    fn close(&self) -> StateResult<()> {
        let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        if !inner.closed {
            tracing::debug!("Closing timer service manager of {}", self.step_id);
            inner.closed = true;
            inner.services.clear();
        }
        Ok(())
    }

    fn is_closed(&self) -> bool {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .closed
    }
}
