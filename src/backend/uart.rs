//! Interrupt-driven UART transport.
//!
//! The backend owns two receive rings arranged as a double buffer (the
//! interrupt handler fills the active half while the consumer drains the
//! other) and a single transmit ring. The application wires its serial
//! interrupt to [`UartBackend::handle_rx_ready`] /
//! [`UartBackend::handle_tx_ready`]; both only touch ring buffers and
//! submit work, per the stack's interrupt discipline.

use alloc::boxed::Box;
use alloc::sync::{Arc, Weak};
use core::sync::atomic::{AtomicBool, Ordering};

use hermit_sync::SpinMutex;
use log::warn;

use crate::collections::RingBuffer;
use crate::error::{Error, Result};
use crate::pipe::{CallbackSlot, Pipe, PipeCallback, PipeEvent, PipeOps};
use crate::work::{WorkItem, Worker};

/// Non-blocking serial device operations the application provides.
///
/// `fifo_read` and `fifo_fill` move as many bytes as the hardware FIFO
/// allows and return the count; the interrupt enables gate the RX-ready
/// and TX-ready interrupt sources.
pub trait UartDevice: Send {
	fn fifo_read(&mut self, buf: &mut [u8]) -> usize;
	fn fifo_fill(&mut self, buf: &[u8]) -> usize;
	fn irq_rx_enable(&mut self, enabled: bool);
	fn irq_tx_enable(&mut self, enabled: bool);
}

pub struct UartBackendConfig {
	/// Total receive buffer size, split into two halves. Must be even
	/// and at least two bytes.
	pub receive_buf_size: usize,
	pub transmit_buf_size: usize,
}

struct ReceiveRings {
	rdb: [RingBuffer; 2],
	used: usize,
}

struct UartInner {
	dev: SpinMutex<Box<dyn UartDevice>>,
	rx: SpinMutex<ReceiveRings>,
	tx: SpinMutex<RingBuffer>,
	opened: AtomicBool,
	callback: CallbackSlot,
	worker: Worker,
	receive_ready_work: WorkItem,
}

/// UART transport backend.
pub struct UartBackend {
	inner: Arc<UartInner>,
}

impl UartBackend {
	pub fn new(
		dev: Box<dyn UartDevice>,
		config: UartBackendConfig,
		worker: &Worker,
	) -> Result<Self> {
		if config.receive_buf_size < 2
			|| config.receive_buf_size % 2 != 0
			|| config.transmit_buf_size == 0
		{
			return Err(Error::Invalid);
		}

		let half = config.receive_buf_size / 2;

		let inner = Arc::new_cyclic(|weak: &Weak<UartInner>| {
			let backend = weak.clone();

			UartInner {
				dev: SpinMutex::new(dev),
				rx: SpinMutex::new(ReceiveRings {
					rdb: [RingBuffer::new(half), RingBuffer::new(half)],
					used: 0,
				}),
				tx: SpinMutex::new(RingBuffer::new(config.transmit_buf_size)),
				opened: AtomicBool::new(false),
				callback: CallbackSlot::new(),
				worker: worker.clone(),
				receive_ready_work: WorkItem::new(move || {
					if let Some(backend) = backend.upgrade() {
						backend.callback.raise(PipeEvent::ReceiveReady);
					}
				}),
			}
		});

		Ok(UartBackend { inner })
	}

	pub fn pipe(&self) -> Pipe {
		Pipe::Uart(UartPipe {
			inner: self.inner.clone(),
		})
	}

	/// Drains the hardware FIFO into the active half of the receive
	/// double buffer. Call from the RX-ready interrupt.
	pub fn handle_rx_ready(&self) {
		let inner = &self.inner;
		let mut rx = inner.rx.lock();
		let used = rx.used;

		let count = {
			let window = rx.rdb[used].claim_write();

			if window.is_empty() {
				inner.dev.lock().irq_rx_enable(false);
				warn!("receive buffer overrun");
				return;
			}

			inner.dev.lock().fifo_read(window)
		};

		rx.rdb[used].finish_write(count);
		drop(rx);

		if count > 0 {
			inner.worker.submit(&inner.receive_ready_work);
		}
	}

	/// Fills the hardware FIFO from the transmit ring, disabling the
	/// TX-ready interrupt when the ring empties. Call from the TX-ready
	/// interrupt.
	pub fn handle_tx_ready(&self) {
		let inner = &self.inner;
		let mut tx = inner.tx.lock();

		if tx.is_empty() {
			inner.dev.lock().irq_tx_enable(false);
			return;
		}

		let count = inner.dev.lock().fifo_fill(tx.claim_read());
		tx.finish_read(count);
	}
}

/// Pipe handle over a [`UartBackend`].
#[derive(Clone)]
pub struct UartPipe {
	inner: Arc<UartInner>,
}

impl PipeOps for UartPipe {
	fn open(&self) -> Result<()> {
		let inner = &self.inner;

		{
			let mut rx = inner.rx.lock();
			rx.rdb[0].reset();
			rx.rdb[1].reset();
			rx.used = 0;
		}
		inner.tx.lock().reset();

		{
			let mut dev = inner.dev.lock();
			let mut scratch = [0u8; 16];

			while dev.fifo_read(&mut scratch) > 0 {}

			dev.irq_rx_enable(true);
			dev.irq_tx_enable(true);
		}

		inner.opened.store(true, Ordering::Release);
		inner.callback.raise(PipeEvent::Opened);
		Ok(())
	}

	fn close(&self) -> Result<()> {
		self.inner.opened.store(false, Ordering::Release);

		{
			let mut dev = self.inner.dev.lock();
			dev.irq_rx_enable(false);
			dev.irq_tx_enable(false);
		}

		self.inner.callback.raise(PipeEvent::Closed);
		Ok(())
	}

	fn transmit(&self, buf: &[u8]) -> Result<usize> {
		if !self.inner.opened.load(Ordering::Acquire) {
			return Err(Error::Io);
		}

		let count = self.inner.tx.lock().put(buf);
		self.inner.dev.lock().irq_tx_enable(true);
		Ok(count)
	}

	fn receive(&self, buf: &mut [u8]) -> Result<usize> {
		let inner = &self.inner;

		if !inner.opened.load(Ordering::Acquire) {
			return Err(Error::Io);
		}

		let mut rx = inner.rx.lock();

		// Drain the inactive half first.
		let unused = 1 - rx.used;
		let mut count = rx.rdb[unused].get(buf);

		if !rx.rdb[unused].is_empty() {
			return Ok(count);
		}

		// Swap halves inside an interrupt-masked window, then drain the
		// half the interrupt handler was filling.
		let mut dev = inner.dev.lock();
		dev.irq_rx_enable(false);
		rx.used = unused;
		dev.irq_rx_enable(true);

		let previous = 1 - rx.used;
		count += rx.rdb[previous].get(&mut buf[count..]);

		dev.irq_rx_enable(false);
		let remaining = !rx.rdb[rx.used].is_empty();
		dev.irq_rx_enable(true);
		drop(dev);
		drop(rx);

		if remaining {
			inner.worker.submit(&inner.receive_ready_work);
		}

		Ok(count)
	}

	fn attach(&self, callback: PipeCallback) {
		self.inner.callback.set(Some(callback));
	}

	fn release(&self) {
		self.inner.callback.set(None);
	}
}
