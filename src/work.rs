//! Cooperative work queue.
//!
//! Every callback in the stack (pipe events, chat matches, script
//! completions, CMUX and supervisor events) executes on one logical worker.
//! Interrupt-side code only touches ring buffers and submits work items;
//! the application pumps the queue by calling [`Worker::process`] with the
//! current time, from a thread or from its executor loop.

use alloc::boxed::Box;
use alloc::collections::VecDeque;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::fmt;
use core::sync::atomic::{AtomicU32, Ordering};

use hermit_sync::SpinMutex;
use log::trace;
pub use smoltcp::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
struct WorkId(u32);

impl WorkId {
	fn new() -> Self {
		static NEXT_ID: AtomicU32 = AtomicU32::new(0);
		WorkId(NEXT_ID.fetch_add(1, Ordering::Relaxed))
	}
}

impl fmt::Display for WorkId {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{}", self.0)
	}
}

struct WorkItemInner {
	id: WorkId,
	handler: Box<dyn Fn() + Send + Sync>,
}

/// A schedulable unit of work.
///
/// Handlers conventionally capture a [`alloc::sync::Weak`] reference to
/// their component, so work left behind by a dropped component degenerates
/// to a no-op instead of keeping the component alive.
#[derive(Clone)]
pub struct WorkItem {
	inner: Arc<WorkItemInner>,
}

impl WorkItem {
	pub fn new(handler: impl Fn() + Send + Sync + 'static) -> Self {
		WorkItem {
			inner: Arc::new(WorkItemInner {
				id: WorkId::new(),
				handler: Box::new(handler),
			}),
		}
	}
}

struct Queues {
	ready: VecDeque<Arc<WorkItemInner>>,
	/// Sorted by deadline, earliest first.
	delayed: Vec<(Instant, Arc<WorkItemInner>)>,
	now: Instant,
}

impl Queues {
	fn is_queued(&self, item: &Arc<WorkItemInner>) -> bool {
		self.ready.iter().any(|queued| Arc::ptr_eq(queued, item))
			|| self.delayed.iter().any(|(_, queued)| Arc::ptr_eq(queued, item))
	}

	fn remove(&mut self, item: &Arc<WorkItemInner>) {
		self.ready.retain(|queued| !Arc::ptr_eq(queued, item));
		self.delayed.retain(|(_, queued)| !Arc::ptr_eq(queued, item));
	}
}

/// Cloneable handle to the single logical worker.
#[derive(Clone)]
pub struct Worker {
	queues: Arc<SpinMutex<Queues>>,
}

impl Worker {
	pub fn new() -> Self {
		Worker {
			queues: Arc::new(SpinMutex::new(Queues {
				ready: VecDeque::new(),
				delayed: Vec::new(),
				now: Instant::from_micros(0),
			})),
		}
	}

	/// Enqueues `item` for immediate execution.
	///
	/// A no-op while the item is already on the ready queue; a delayed
	/// item is promoted to run now.
	pub fn submit(&self, item: &WorkItem) {
		let mut queues = self.queues.lock();

		if queues.ready.iter().any(|queued| Arc::ptr_eq(queued, &item.inner)) {
			return;
		}

		queues.delayed.retain(|(_, queued)| !Arc::ptr_eq(queued, &item.inner));
		queues.ready.push_back(item.inner.clone());
	}

	/// Enqueues `item` to run `delay` after the most recently processed
	/// instant. A no-op while the item is already queued or delayed.
	pub fn schedule(&self, item: &WorkItem, delay: Duration) {
		let mut queues = self.queues.lock();

		if queues.is_queued(&item.inner) {
			return;
		}

		if delay == Duration::ZERO {
			queues.ready.push_back(item.inner.clone());
			return;
		}

		let deadline = queues.now + delay;
		let at = queues.delayed.partition_point(|(instant, _)| *instant <= deadline);
		queues.delayed.insert(at, (deadline, item.inner.clone()));
	}

	/// Removes `item` from both queues.
	pub fn cancel(&self, item: &WorkItem) {
		self.queues.lock().remove(&item.inner);
	}

	pub fn is_pending(&self, item: &WorkItem) -> bool {
		self.queues.lock().is_queued(&item.inner)
	}

	/// The most recent instant passed to [`Worker::process`].
	pub fn now(&self) -> Instant {
		self.queues.lock().now
	}

	/// Runs every item due at `now` once, in submission order.
	///
	/// Items submitted by running handlers stay queued for the next call,
	/// so a handler that re-posts itself cannot monopolize the worker.
	/// Returns the instant of the next pending work, if any.
	pub fn process(&self, now: Instant) -> Option<Instant> {
		let budget = {
			let mut queues = self.queues.lock();
			queues.now = now;

			while let Some((deadline, _)) = queues.delayed.first() {
				if *deadline > now {
					break;
				}

				let (_, item) = queues.delayed.remove(0);
				queues.ready.push_back(item);
			}

			queues.ready.len()
		};

		for _ in 0..budget {
			let Some(item) = self.queues.lock().ready.pop_front() else {
				break;
			};

			trace!("run work item {}", item.id);
			(item.handler)();
		}

		let queues = self.queues.lock();

		if !queues.ready.is_empty() {
			Some(now)
		} else {
			queues.delayed.first().map(|(deadline, _)| *deadline)
		}
	}
}

impl Default for Worker {
	fn default() -> Self {
		Self::new()
	}
}

#[cfg(test)]
mod tests {
	use std::sync::atomic::{AtomicUsize, Ordering};
	use std::sync::{Arc, Mutex};

	use super::*;

	fn counter_item(count: &Arc<AtomicUsize>) -> WorkItem {
		let count = count.clone();
		WorkItem::new(move || {
			count.fetch_add(1, Ordering::Relaxed);
		})
	}

	#[test]
	fn submit_runs_once() {
		let worker = Worker::new();
		let count = Arc::new(AtomicUsize::new(0));
		let item = counter_item(&count);

		worker.submit(&item);
		worker.submit(&item);
		worker.process(Instant::from_millis(0));

		assert_eq!(count.load(Ordering::Relaxed), 1);
	}

	#[test]
	fn schedule_honors_deadline() {
		let worker = Worker::new();
		let count = Arc::new(AtomicUsize::new(0));
		let item = counter_item(&count);

		worker.process(Instant::from_millis(0));
		worker.schedule(&item, Duration::from_millis(10));

		let next = worker.process(Instant::from_millis(5));
		assert_eq!(count.load(Ordering::Relaxed), 0);
		assert_eq!(next, Some(Instant::from_millis(10)));

		worker.process(Instant::from_millis(10));
		assert_eq!(count.load(Ordering::Relaxed), 1);
	}

	#[test]
	fn schedule_is_noop_while_pending() {
		let worker = Worker::new();
		let count = Arc::new(AtomicUsize::new(0));
		let item = counter_item(&count);

		worker.process(Instant::from_millis(0));
		worker.schedule(&item, Duration::from_millis(10));
		worker.schedule(&item, Duration::from_millis(1));

		assert_eq!(worker.process(Instant::from_millis(1)), Some(Instant::from_millis(10)));
	}

	#[test]
	fn cancel_removes_pending_work() {
		let worker = Worker::new();
		let count = Arc::new(AtomicUsize::new(0));
		let item = counter_item(&count);

		worker.schedule(&item, Duration::from_millis(10));
		worker.cancel(&item);
		worker.process(Instant::from_millis(20));

		assert_eq!(count.load(Ordering::Relaxed), 0);
		assert!(!worker.is_pending(&item));
	}

	#[test]
	fn resubmitted_work_waits_for_next_pass() {
		let worker = Worker::new();
		let count = Arc::new(AtomicUsize::new(0));

		let worker_handle = worker.clone();
		let count_handle = count.clone();
		let item = Arc::new(Mutex::new(None::<WorkItem>));
		let item_handle = item.clone();

		let work = WorkItem::new(move || {
			count_handle.fetch_add(1, Ordering::Relaxed);
			if let Some(item) = item_handle.lock().unwrap().as_ref() {
				worker_handle.submit(item);
			}
		});
		*item.lock().unwrap() = Some(work.clone());

		worker.submit(&work);
		let next = worker.process(Instant::from_millis(0));

		assert_eq!(count.load(Ordering::Relaxed), 1);
		assert_eq!(next, Some(Instant::from_millis(0)));
	}
}
