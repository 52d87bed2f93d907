//! In-memory transport.
//!
//! Stands in for the serial bus in tests and host builds: whatever the
//! harness feeds with [`MockBackend::put`] becomes receivable through the
//! pipe, and everything transmitted through the pipe is collectable with
//! [`MockBackend::get`].

use alloc::sync::{Arc, Weak};

use hermit_sync::SpinMutex;

use crate::collections::RingBuffer;
use crate::error::Result;
use crate::pipe::{CallbackSlot, Pipe, PipeCallback, PipeEvent, PipeOps};
use crate::work::{WorkItem, Worker};

struct MockInner {
	rx: SpinMutex<RingBuffer>,
	tx: SpinMutex<RingBuffer>,
	callback: CallbackSlot,
	worker: Worker,
	receive_ready_work: WorkItem,
}

pub struct MockBackend {
	inner: Arc<MockInner>,
}

impl MockBackend {
	pub fn new(worker: &Worker, buf_size: usize) -> Self {
		let inner = Arc::new_cyclic(|weak: &Weak<MockInner>| {
			let backend = weak.clone();

			MockInner {
				rx: SpinMutex::new(RingBuffer::new(buf_size)),
				tx: SpinMutex::new(RingBuffer::new(buf_size)),
				callback: CallbackSlot::new(),
				worker: worker.clone(),
				receive_ready_work: WorkItem::new(move || {
					if let Some(backend) = backend.upgrade() {
						backend.callback.raise(PipeEvent::ReceiveReady);
					}
				}),
			}
		});

		MockBackend { inner }
	}

	pub fn pipe(&self) -> Pipe {
		Pipe::Mock(MockPipe {
			inner: self.inner.clone(),
		})
	}

	/// Feeds bytes the pipe will subsequently receive and signals
	/// receive readiness through the worker.
	pub fn put(&self, data: &[u8]) -> usize {
		let count = self.inner.rx.lock().put(data);

		if count > 0 {
			self.inner.worker.submit(&self.inner.receive_ready_work);
		}

		count
	}

	/// Collects bytes previously transmitted through the pipe.
	pub fn get(&self, buf: &mut [u8]) -> usize {
		self.inner.tx.lock().get(buf)
	}
}

/// Pipe handle over a [`MockBackend`].
#[derive(Clone)]
pub struct MockPipe {
	inner: Arc<MockInner>,
}

impl PipeOps for MockPipe {
	fn open(&self) -> Result<()> {
		self.inner.callback.raise(PipeEvent::Opened);
		Ok(())
	}

	fn close(&self) -> Result<()> {
		self.inner.callback.raise(PipeEvent::Closed);
		Ok(())
	}

	fn transmit(&self, buf: &[u8]) -> Result<usize> {
		Ok(self.inner.tx.lock().put(buf))
	}

	fn receive(&self, buf: &mut [u8]) -> Result<usize> {
		Ok(self.inner.rx.lock().get(buf))
	}

	fn attach(&self, callback: PipeCallback) {
		self.inner.callback.set(Some(callback));
	}

	fn release(&self) {
		self.inner.callback.set(None);
	}
}
