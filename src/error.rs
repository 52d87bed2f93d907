use thiserror::Error;

/// Error kinds surfaced across the stack.
///
/// Byte-level and framing problems (CRC mismatch, unknown frame types,
/// parser overruns) are logged and recovered locally; only state-machine
/// precondition violations and transport failures reach the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum Error {
	/// An argument or configuration value is malformed.
	#[error("invalid argument or configuration")]
	Invalid,
	/// A single-in-flight operation is already running.
	#[error("operation already in progress")]
	Busy,
	/// The operation requires a pipe or channel that has not been attached.
	#[error("no pipe attached")]
	NotAttached,
	/// The channel is already open or opening.
	#[error("channel already open")]
	AlreadyOpen,
	/// The channel is already closed or closing.
	#[error("channel already closed")]
	AlreadyClosed,
	/// The transport failed to accept or deliver bytes.
	#[error("transport failure")]
	Io,
	/// The operation did not complete before its deadline.
	#[error("operation timed out")]
	Timeout,
	/// The operation was cancelled or hit an abort pattern.
	#[error("operation aborted")]
	Aborted,
	/// A receive or transmit buffer was full and data was dropped.
	#[error("buffer overrun")]
	Overrun,
}

pub type Result<T> = core::result::Result<T, Error>;
