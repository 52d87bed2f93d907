//! Uniform byte-channel abstraction.
//!
//! Every transport in the stack (hardware UART, CMUX DLCI channel, mock)
//! is exposed as a [`Pipe`]: non-blocking transmit/receive plus an event
//! callback. Pipes are cheap cloneable handles; the backing engine or
//! backend owns the actual state.

use alloc::boxed::Box;

use enum_dispatch::enum_dispatch;
use hermit_sync::SpinMutex;

use crate::backend::mock::MockPipe;
use crate::backend::uart::UartPipe;
use crate::cmux::DlciPipe;
use crate::error::Result;

/// Events delivered through the pipe callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipeEvent {
	/// The pipe finished opening.
	Opened,
	/// The pipe finished closing.
	Closed,
	/// Buffered receive data crossed the empty to non-empty boundary.
	/// Spurious wakeups are permitted; consumers must drain until
	/// `receive` returns zero.
	ReceiveReady,
}

pub type PipeCallback = Box<dyn FnMut(PipeEvent) + Send>;

/// Byte-channel operations common to all transports.
///
/// `open` and `close` are asynchronous: they request the transition and
/// completion is signalled through [`PipeEvent::Opened`] /
/// [`PipeEvent::Closed`]. `transmit` and `receive` never block and may
/// partially fulfill requests.
#[enum_dispatch]
pub trait PipeOps {
	fn open(&self) -> Result<()>;
	fn close(&self) -> Result<()>;
	/// Queues as much of `buf` as fits, returning the number of bytes
	/// accepted. Zero is valid when the outbound buffer is full.
	fn transmit(&self, buf: &[u8]) -> Result<usize>;
	/// Copies buffered bytes into `buf`, returning the number copied.
	fn receive(&self, buf: &mut [u8]) -> Result<usize>;
	/// Installs the event callback, replacing any previous one.
	fn attach(&self, callback: PipeCallback);
	/// Removes the event callback.
	fn release(&self);
}

/// A byte channel handle.
#[enum_dispatch(PipeOps)]
#[derive(Clone)]
pub enum Pipe {
	Uart(UartPipe),
	Dlci(DlciPipe),
	Mock(MockPipe),
}

/// Holder for the single pipe callback.
///
/// Events are raised with the slot unlocked, so a callback may attach a
/// replacement from within its own invocation; the stack tolerates one
/// trailing event reaching the prior callback.
pub(crate) struct CallbackSlot {
	callback: SpinMutex<Option<PipeCallback>>,
}

impl CallbackSlot {
	pub(crate) const fn new() -> Self {
		CallbackSlot {
			callback: SpinMutex::new(None),
		}
	}

	pub(crate) fn set(&self, callback: Option<PipeCallback>) {
		*self.callback.lock() = callback;
	}

	pub(crate) fn raise(&self, event: PipeEvent) {
		let taken = self.callback.lock().take();

		if let Some(mut callback) = taken {
			callback(event);

			let mut slot = self.callback.lock();
			if slot.is_none() {
				*slot = Some(callback);
			}
		}
	}
}
