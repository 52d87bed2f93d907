//! 27.010 CMUX engine.
//!
//! Multiplexes a single serial bus pipe into independent DLCI channels.
//! DLCI 0 carries control traffic; addresses 1..63 carry data and are
//! exposed as pipes of their own:
//!
//! ```text
//!     DLCI1 <-----------+                              +-------> DLCI1
//!                       v                              v
//!     DLCI2 <---> CMUX engine <--> Serial bus <--> Modem  <----> DLCI2
//!                       ^                              ^
//!     DLCI3 <-----------+                              +-------> DLCI3
//! ```
//!
//! The engine owns every DLCI record; the pipes handed out by
//! [`Cmux::create_dlci`] are non-owning handles that go permanently dead
//! once the engine is released.

mod frame;

use alloc::boxed::Box;
use alloc::sync::{Arc, Weak};
use alloc::vec::Vec;

use hermit_sync::SpinMutex;
use log::{debug, warn};
use smallvec::SmallVec;
use smoltcp::time::Duration;

use self::frame::{CommandType, Frame, FrameType};
use crate::collections::RingBuffer;
use crate::error::{Error, Result};
use crate::pipe::{CallbackSlot, Pipe, PipeCallback, PipeEvent, PipeOps};
use crate::work::{WorkItem, Worker};

const DLCI_ADDRESS_MIN: u8 = 1;
const DLCI_ADDRESS_MAX: u8 = 63;

/// Room for a 128 byte payload plus worst-case header and tail.
pub const RECEIVE_BUF_SIZE_MIN: usize = 136;
pub const TRANSMIT_BUF_SIZE_MIN: usize = 149;

/// Bounded wait for the peer's close-down acknowledgment before the
/// engine forces itself disconnected.
const DISCONNECT_TIMEOUT: Duration = Duration::from_millis(300);

const RESYNC: [u8; 3] = [frame::FLAG; 3];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CmuxState {
	Disconnected,
	Connecting,
	Connected,
	Disconnecting,
}

/// Engine lifecycle events delivered through the engine callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CmuxEvent {
	Connected,
	Disconnected,
}

pub type CmuxCallback = Box<dyn FnMut(CmuxEvent) + Send>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DlciState {
	Closed,
	Opening,
	Open,
	Closing,
}

pub struct CmuxConfig {
	/// Frame payload buffer size, at least [`RECEIVE_BUF_SIZE_MIN`].
	pub receive_buf_size: usize,
	/// Shared transmit ring size, at least [`TRANSMIT_BUF_SIZE_MIN`].
	pub transmit_buf_size: usize,
	/// Delay from bus readiness until received data is drained.
	pub process_timeout: Duration,
	/// Drop frames whose FCS does not validate. Leave enabled unless a
	/// modem is known to emit malformed FCS on unsolicited responses.
	pub validate_fcs: bool,
}

impl Default for CmuxConfig {
	fn default() -> Self {
		CmuxConfig {
			receive_buf_size: RECEIVE_BUF_SIZE_MIN,
			transmit_buf_size: 256,
			process_timeout: Duration::from_millis(3),
			validate_fcs: true,
		}
	}
}

pub struct DlciConfig {
	/// Channel address, 1..63.
	pub dlci_address: u8,
	pub receive_buf_size: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ReceiveState {
	Sof,
	Resync0,
	Resync1,
	Resync2,
	Resync3,
	Address,
	Control,
	Length,
	LengthCont,
	Data,
	Fcs,
	Eof,
}

#[derive(Default)]
struct FrameMeta {
	dlci_address: u8,
	cr: bool,
	pf: bool,
	frame_type: u8,
	data_len: usize,
}

struct Parser {
	state: ReceiveState,
	frame: FrameMeta,
	header: [u8; 4],
	header_len: usize,
	buf: Vec<u8>,
	buf_cap: usize,
	drop_frame: bool,
}

impl Parser {
	fn new(buf_cap: usize) -> Self {
		Parser {
			state: ReceiveState::Sof,
			frame: FrameMeta::default(),
			header: [0; 4],
			header_len: 0,
			buf: Vec::with_capacity(buf_cap),
			buf_cap,
			drop_frame: false,
		}
	}

	fn push_header(&mut self, byte: u8) {
		if self.header_len < self.header.len() {
			self.header[self.header_len] = byte;
			self.header_len += 1;
		}
	}

	fn header_fcs(&self) -> u8 {
		let fcs = self.header[..self.header_len]
			.iter()
			.fold(frame::fcs_init(), |fcs, &byte| frame::fcs_update(fcs, byte));

		if self.frame.frame_type == FrameType::Uih as u8 {
			frame::fcs_final(fcs)
		} else {
			let fcs = self.buf.iter().fold(fcs, |fcs, &byte| frame::fcs_update(fcs, byte));
			frame::fcs_final(fcs)
		}
	}
}

struct DlciShared {
	address: u8,
	receive_rb: SpinMutex<RingBuffer>,
	callback: CallbackSlot,
}

struct DlciRecord {
	shared: Arc<DlciShared>,
	state: DlciState,
}

struct Engine {
	state: CmuxState,
	bus: Option<Pipe>,
	parser: Parser,
	dlcis: Vec<DlciRecord>,
}

/// Events collected while the engine lock is held and raised after it is
/// dropped, so callbacks can reenter the engine.
enum Deferred {
	Engine(CmuxEvent),
	Pipe(Arc<DlciShared>, PipeEvent),
	DlciClosed(Arc<DlciShared>),
}

type DeferredEvents = SmallVec<[Deferred; 4]>;

struct CmuxInner {
	engine: SpinMutex<Engine>,
	transmit_rb: SpinMutex<RingBuffer>,
	callback: SpinMutex<Option<CmuxCallback>>,
	worker: Worker,
	receive_work: WorkItem,
	transmit_work: WorkItem,
	force_disconnect_work: WorkItem,
	process_timeout: Duration,
	validate_fcs: bool,
}

/// CMUX engine handle.
pub struct Cmux {
	inner: Arc<CmuxInner>,
}

impl Cmux {
	pub fn new(config: CmuxConfig, worker: &Worker) -> Result<Self> {
		if config.receive_buf_size < RECEIVE_BUF_SIZE_MIN
			|| config.transmit_buf_size < TRANSMIT_BUF_SIZE_MIN
		{
			return Err(Error::Invalid);
		}

		let inner = Arc::new_cyclic(|weak: &Weak<CmuxInner>| {
			let receive = weak.clone();
			let transmit = weak.clone();
			let force = weak.clone();

			CmuxInner {
				engine: SpinMutex::new(Engine {
					state: CmuxState::Disconnected,
					bus: None,
					parser: Parser::new(config.receive_buf_size),
					dlcis: Vec::new(),
				}),
				transmit_rb: SpinMutex::new(RingBuffer::new(config.transmit_buf_size)),
				callback: SpinMutex::new(None),
				worker: worker.clone(),
				receive_work: WorkItem::new(move || {
					if let Some(inner) = receive.upgrade() {
						inner.process_received();
					}
				}),
				transmit_work: WorkItem::new(move || {
					if let Some(inner) = transmit.upgrade() {
						inner.process_transmit();
					}
				}),
				force_disconnect_work: WorkItem::new(move || {
					if let Some(inner) = force.upgrade() {
						inner.force_disconnect();
					}
				}),
				process_timeout: config.process_timeout,
				validate_fcs: config.validate_fcs,
			}
		});

		Ok(Cmux { inner })
	}

	/// Installs the engine event callback, replacing any previous one.
	pub fn set_callback(&self, callback: CmuxCallback) {
		*self.inner.callback.lock() = Some(callback);
	}

	pub fn state(&self) -> CmuxState {
		self.inner.engine.lock().state
	}

	/// Registers a DLCI channel with the engine and returns its pipe.
	pub fn create_dlci(&self, config: &DlciConfig) -> Result<Pipe> {
		if config.dlci_address < DLCI_ADDRESS_MIN
			|| config.dlci_address > DLCI_ADDRESS_MAX
			|| config.receive_buf_size == 0
		{
			return Err(Error::Invalid);
		}

		let mut engine = self.inner.engine.lock();

		if engine
			.dlcis
			.iter()
			.any(|record| record.shared.address == config.dlci_address)
		{
			return Err(Error::Invalid);
		}

		let shared = Arc::new(DlciShared {
			address: config.dlci_address,
			receive_rb: SpinMutex::new(RingBuffer::new(config.receive_buf_size)),
			callback: CallbackSlot::new(),
		});

		engine.dlcis.push(DlciRecord {
			shared: shared.clone(),
			state: DlciState::Closed,
		});

		Ok(Pipe::Dlci(DlciPipe {
			cmux: self.inner.clone(),
			shared,
		}))
	}

	/// Attaches the engine to the serial bus pipe.
	pub fn attach(&self, pipe: Pipe) -> Result<()> {
		let mut engine = self.inner.engine.lock();

		if engine.state != CmuxState::Disconnected {
			return Err(Error::Busy);
		}

		let weak = Arc::downgrade(&self.inner);
		pipe.attach(Box::new(move |event| {
			if event == PipeEvent::ReceiveReady {
				if let Some(inner) = weak.upgrade() {
					inner.worker.schedule(&inner.receive_work, inner.process_timeout);
				}
			}
		}));

		engine.bus = Some(pipe);
		Ok(())
	}

	/// Requests a CMUX connection by sending SABM on DLCI 0. Completion
	/// is signalled through [`CmuxEvent::Connected`].
	pub fn connect_async(&self) -> Result<()> {
		let mut engine = self.inner.engine.lock();

		if engine.bus.is_none() {
			return Err(Error::NotAttached);
		}

		match engine.state {
			CmuxState::Disconnected => {}
			CmuxState::Disconnecting => return Err(Error::Busy),
			CmuxState::Connecting | CmuxState::Connected => return Err(Error::AlreadyOpen),
		}

		let sabm = Frame {
			dlci_address: 0,
			cr: true,
			pf: true,
			frame_type: FrameType::Sabm,
			data: &[],
		};

		if self.inner.transmit_frame(&sabm, false).is_none() {
			return Err(Error::Overrun);
		}

		engine.state = CmuxState::Connecting;
		Ok(())
	}

	/// Closes every open DLCI, sends a close-down command and awaits the
	/// acknowledgment. A mute peer is forced disconnected after 300 ms.
	/// Completion is signalled through [`CmuxEvent::Disconnected`].
	pub fn disconnect_async(&self) -> Result<()> {
		let inner = &self.inner;
		let mut deferred = DeferredEvents::new();

		{
			let mut engine = inner.engine.lock();

			if engine.state != CmuxState::Connected {
				return Err(Error::AlreadyClosed);
			}

			for record in &mut engine.dlcis {
				if record.state != DlciState::Closed {
					record.state = DlciState::Closed;
					deferred.push(Deferred::DlciClosed(record.shared.clone()));
				}
			}

			engine.state = CmuxState::Disconnecting;

			let type_byte = 0x01 | 0x02 | ((CommandType::Cld as u8) << 2);
			let data = [type_byte, 0x01];
			let cld = Frame {
				dlci_address: 0,
				cr: true,
				pf: false,
				frame_type: FrameType::Uih,
				data: &data,
			};

			if inner.transmit_frame(&cld, false).is_none() {
				warn!("close-down request dropped, transmit ring full");
			}

			inner.worker.schedule(&inner.force_disconnect_work, DISCONNECT_TIMEOUT);
		}

		inner.raise_deferred(deferred);
		Ok(())
	}

	/// Detaches the bus pipe and invalidates every DLCI pipe handle.
	pub fn release(&self) {
		let inner = &self.inner;

		{
			let mut engine = inner.engine.lock();

			if let Some(bus) = engine.bus.take() {
				bus.release();
			}

			engine.state = CmuxState::Disconnected;
			engine.parser = Parser::new(engine.parser.buf_cap);

			for record in &mut engine.dlcis {
				record.state = DlciState::Closed;
				record.shared.callback.set(None);
				record.shared.receive_rb.lock().reset();
			}
		}

		inner.transmit_rb.lock().reset();
		inner.worker.cancel(&inner.receive_work);
		inner.worker.cancel(&inner.transmit_work);
		inner.worker.cancel(&inner.force_disconnect_work);
	}
}

impl CmuxInner {
	fn raise_event(&self, event: CmuxEvent) {
		let taken = self.callback.lock().take();

		if let Some(mut callback) = taken {
			callback(event);

			let mut slot = self.callback.lock();
			if slot.is_none() {
				*slot = Some(callback);
			}
		}
	}

	fn raise_deferred(&self, deferred: DeferredEvents) {
		for event in deferred {
			match event {
				Deferred::Engine(event) => self.raise_event(event),
				Deferred::Pipe(shared, event) => shared.callback.raise(event),
				Deferred::DlciClosed(shared) => {
					shared.callback.raise(PipeEvent::Closed);
					shared.callback.set(None);
					shared.receive_rb.lock().reset();
				}
			}
		}
	}

	/// Encodes `frame` onto the shared transmit ring and kicks the
	/// transmit worker. Returns the number of payload bytes accepted.
	fn transmit_frame(&self, frame: &Frame<'_>, allow_partial: bool) -> Option<usize> {
		let result = frame::encode_into(&mut self.transmit_rb.lock(), frame, allow_partial);

		if result.is_some() {
			self.worker.submit(&self.transmit_work);
		}

		result
	}

	fn process_transmit(&self) {
		let Some(bus) = self.engine.lock().bus.clone() else {
			return;
		};

		let mut rb = self.transmit_rb.lock();

		if rb.is_empty() {
			return;
		}

		match bus.transmit(rb.claim_read()) {
			Ok(0) | Err(_) => {
				// Back-pressure: nothing leaves the ring, try again later.
				self.worker.schedule(&self.transmit_work, self.process_timeout);
			}
			Ok(count) => {
				rb.finish_read(count);

				if !rb.is_empty() {
					self.worker.submit(&self.transmit_work);
				}
			}
		}
	}

	fn process_received(&self) {
		let Some(bus) = self.engine.lock().bus.clone() else {
			return;
		};

		let mut buf = [0u8; 16];
		let count = match bus.receive(&mut buf) {
			Ok(count) => count,
			Err(_) => return,
		};

		if count == 0 {
			return;
		}

		let mut deferred = DeferredEvents::new();

		{
			let mut engine = self.engine.lock();

			for &byte in &buf[..count] {
				self.process_received_byte(&mut engine, byte, &mut deferred);
			}
		}

		self.raise_deferred(deferred);
		self.worker.submit(&self.receive_work);
	}

	/// Starts a new frame with `byte` as its address octet.
	fn begin_frame(parser: &mut Parser, byte: u8) {
		parser.buf.clear();
		parser.header_len = 0;
		parser.drop_frame = false;
		parser.push_header(byte);

		parser.frame.cr = byte & frame::CR != 0;
		parser.frame.dlci_address = (byte >> 2) & 0x3F;
		parser.state = ReceiveState::Control;
	}

	fn process_received_byte(&self, engine: &mut Engine, byte: u8, deferred: &mut DeferredEvents) {
		match engine.parser.state {
			ReceiveState::Sof => {
				if byte == frame::FLAG {
					engine.parser.state = ReceiveState::Address;
					return;
				}

				// Lost synchronization: emit resync flags and await the
				// peer's flags.
				if let Some(bus) = engine.bus.clone() {
					let _ = bus.transmit(&RESYNC);
				}

				engine.parser.state = ReceiveState::Resync0;
			}

			ReceiveState::Resync0 => {
				if byte == frame::FLAG {
					engine.parser.state = ReceiveState::Resync1;
				}
			}

			ReceiveState::Resync1 => {
				engine.parser.state = if byte == frame::FLAG {
					ReceiveState::Resync2
				} else {
					ReceiveState::Resync0
				};
			}

			ReceiveState::Resync2 => {
				engine.parser.state = if byte == frame::FLAG {
					ReceiveState::Resync3
				} else {
					ReceiveState::Resync0
				};
			}

			ReceiveState::Resync3 => {
				// Additional flags keep the parser here; the first
				// non-flag byte after the resync flags already is the
				// frame address.
				if byte != frame::FLAG {
					Self::begin_frame(&mut engine.parser, byte);
				}
			}

			ReceiveState::Address => {
				// Absorb boundary and resynchronization flags; the first
				// non-flag byte is the address.
				if byte == frame::FLAG {
					return;
				}

				Self::begin_frame(&mut engine.parser, byte);
			}

			ReceiveState::Control => {
				let parser = &mut engine.parser;
				parser.push_header(byte);

				parser.frame.pf = byte & frame::PF != 0;
				parser.frame.frame_type = byte & !frame::PF;
				parser.state = ReceiveState::Length;
			}

			ReceiveState::Length => {
				let parser = &mut engine.parser;
				parser.push_header(byte);

				parser.frame.data_len = usize::from(byte >> 1);

				parser.state = if byte & frame::EA == 0 {
					ReceiveState::LengthCont
				} else if parser.frame.data_len == 0 {
					ReceiveState::Fcs
				} else {
					ReceiveState::Data
				};
			}

			ReceiveState::LengthCont => {
				let parser = &mut engine.parser;
				parser.push_header(byte);

				parser.frame.data_len |= usize::from(byte) << 7;
				parser.state = ReceiveState::Data;
			}

			ReceiveState::Data => {
				let parser = &mut engine.parser;
				parser.buf.push(byte);

				if parser.buf.len() == parser.frame.data_len {
					parser.state = ReceiveState::Fcs;
				} else if parser.buf.len() == parser.buf_cap {
					debug!("receive buffer overrun, dropping frame");
					parser.drop_frame = true;
					parser.state = ReceiveState::Eof;
				}
			}

			ReceiveState::Fcs => {
				let parser = &mut engine.parser;

				if self.validate_fcs && parser.header_fcs() != byte {
					debug!("frame FCS mismatch, dropping frame");
					parser.state = ReceiveState::Sof;
					return;
				}

				parser.state = ReceiveState::Eof;
			}

			ReceiveState::Eof => {
				if byte == frame::FLAG && !engine.parser.drop_frame {
					self.dispatch_frame(engine, deferred);
				}

				engine.parser.state = ReceiveState::Sof;
			}
		}
	}

	fn dispatch_frame(&self, engine: &mut Engine, deferred: &mut DeferredEvents) {
		let frame_type = FrameType::try_from(engine.parser.frame.frame_type).ok();

		if engine.parser.frame.dlci_address == 0 {
			match frame_type {
				Some(FrameType::Ua) => self.on_control_ua(engine, deferred),
				Some(FrameType::Uih) => self.on_control_command(engine, deferred),
				_ => self.log_unknown_frame(engine),
			}

			return;
		}

		match frame_type {
			Some(FrameType::Ua) => self.on_dlci_ua(engine, deferred),
			Some(FrameType::Uih) => self.on_dlci_data(engine, deferred),
			Some(FrameType::Dm) => {
				debug!("DLCI {} refused by peer", engine.parser.frame.dlci_address);
			}
			_ => self.log_unknown_frame(engine),
		}
	}

	fn on_control_ua(&self, engine: &mut Engine, deferred: &mut DeferredEvents) {
		if engine.state != CmuxState::Connecting {
			return;
		}

		engine.state = CmuxState::Connected;
		deferred.push(Deferred::Engine(CmuxEvent::Connected));
	}

	fn on_control_command(&self, engine: &mut Engine, deferred: &mut DeferredEvents) {
		let data = &engine.parser.buf;

		if data.len() < 2 {
			warn!("short control command");
			return;
		}

		let type_byte = data[0];
		let length_byte = data[1];
		let ea = type_byte & 0x01 != 0;
		let cr = type_byte & 0x02 != 0;
		let value = type_byte >> 2;

		if !ea || length_byte & 0x01 == 0 || usize::from(length_byte >> 1) != data.len() - 2 {
			warn!("malformed control command");
			return;
		}

		match CommandType::try_from(value).ok() {
			Some(CommandType::Cld) if cr && engine.state == CmuxState::Disconnecting => {
				engine.state = CmuxState::Disconnected;

				if let Some(bus) = engine.bus.take() {
					bus.release();
				}

				self.worker.cancel(&self.force_disconnect_work);
				deferred.push(Deferred::Engine(CmuxEvent::Disconnected));
			}

			Some(CommandType::Msc) if cr && ea => self.acknowledge_command(engine),

			_ => self.log_unknown_frame(engine),
		}
	}

	/// Echoes a control command back with the C/R bit cleared.
	fn acknowledge_command(&self, engine: &Engine) {
		let mut data: SmallVec<[u8; 8]> = SmallVec::new();

		if engine.parser.buf.len() > data.inline_size() {
			warn!("command acknowledge buffer overrun");
			return;
		}

		data.extend_from_slice(&engine.parser.buf);
		data[0] &= !0x02;

		let ack = Frame {
			dlci_address: 0,
			cr: engine.parser.frame.cr,
			pf: engine.parser.frame.pf,
			frame_type: FrameType::Uih,
			data: &data,
		};

		if self.transmit_frame(&ack, false).is_none() {
			warn!("command acknowledge dropped, transmit ring full");
		}
	}

	fn on_dlci_ua(&self, engine: &mut Engine, deferred: &mut DeferredEvents) {
		let address = engine.parser.frame.dlci_address;
		let Some(record) = engine
			.dlcis
			.iter_mut()
			.find(|record| record.shared.address == address)
		else {
			return;
		};

		match record.state {
			DlciState::Opening => {
				record.state = DlciState::Open;
				deferred.push(Deferred::Pipe(record.shared.clone(), PipeEvent::Opened));
			}
			DlciState::Closing => {
				record.state = DlciState::Closed;
				deferred.push(Deferred::DlciClosed(record.shared.clone()));
			}
			DlciState::Closed | DlciState::Open => {}
		}
	}

	fn on_dlci_data(&self, engine: &mut Engine, deferred: &mut DeferredEvents) {
		let address = engine.parser.frame.dlci_address;
		let Some(record) = engine
			.dlcis
			.iter()
			.find(|record| record.shared.address == address)
		else {
			debug!("data for unknown DLCI {address}");
			return;
		};

		let stored = record.shared.receive_rb.lock().put(&engine.parser.buf);

		if stored < engine.parser.buf.len() {
			warn!(
				"DLCI {address} receive overrun, dropped {} bytes",
				engine.parser.buf.len() - stored
			);
		}

		deferred.push(Deferred::Pipe(record.shared.clone(), PipeEvent::ReceiveReady));
	}

	fn log_unknown_frame(&self, engine: &Engine) {
		let parser = &engine.parser;
		let preview = &parser.buf[..parser.buf.len().min(8)];

		debug!(
			"unknown frame ch:{} type:{:#04x} data:{:02x?}",
			parser.frame.dlci_address, parser.frame.frame_type, preview
		);
	}

	fn force_disconnect(&self) {
		let mut deferred = DeferredEvents::new();

		{
			let mut engine = self.engine.lock();

			if engine.state != CmuxState::Disconnecting {
				return;
			}

			warn!("close-down not acknowledged, forcing disconnect");
			engine.state = CmuxState::Disconnected;

			if let Some(bus) = engine.bus.take() {
				bus.release();
			}

			deferred.push(Deferred::Engine(CmuxEvent::Disconnected));
		}

		self.raise_deferred(deferred);
	}
}

/// Pipe handle over one DLCI channel.
#[derive(Clone)]
pub struct DlciPipe {
	cmux: Arc<CmuxInner>,
	shared: Arc<DlciShared>,
}

impl DlciPipe {
	fn record_state(&self, engine: &Engine) -> Option<DlciState> {
		engine
			.dlcis
			.iter()
			.find(|record| Arc::ptr_eq(&record.shared, &self.shared))
			.map(|record| record.state)
	}

	fn set_record_state(&self, engine: &mut Engine, state: DlciState) {
		if let Some(record) = engine
			.dlcis
			.iter_mut()
			.find(|record| Arc::ptr_eq(&record.shared, &self.shared))
		{
			record.state = state;
		}
	}
}

impl PipeOps for DlciPipe {
	fn open(&self) -> Result<()> {
		let mut engine = self.cmux.engine.lock();

		if engine.state != CmuxState::Connected {
			return Err(Error::NotAttached);
		}

		match self.record_state(&engine) {
			Some(DlciState::Closed) => {}
			Some(_) => return Err(Error::AlreadyOpen),
			None => return Err(Error::NotAttached),
		}

		let sabm = Frame {
			dlci_address: self.shared.address,
			cr: true,
			pf: true,
			frame_type: FrameType::Sabm,
			data: &[],
		};

		if self.cmux.transmit_frame(&sabm, false).is_none() {
			return Err(Error::Overrun);
		}

		self.set_record_state(&mut engine, DlciState::Opening);
		Ok(())
	}

	fn close(&self) -> Result<()> {
		let mut engine = self.cmux.engine.lock();

		match self.record_state(&engine) {
			Some(DlciState::Open) => {}
			Some(_) => return Err(Error::AlreadyClosed),
			None => return Err(Error::NotAttached),
		}

		let disc = Frame {
			dlci_address: self.shared.address,
			cr: true,
			pf: true,
			frame_type: FrameType::Disc,
			data: &[],
		};

		if self.cmux.transmit_frame(&disc, false).is_none() {
			return Err(Error::Overrun);
		}

		self.set_record_state(&mut engine, DlciState::Closing);
		Ok(())
	}

	fn transmit(&self, buf: &[u8]) -> Result<usize> {
		if self.cmux.engine.lock().state != CmuxState::Connected {
			return Err(Error::NotAttached);
		}

		let uih = Frame {
			dlci_address: self.shared.address,
			cr: false,
			pf: false,
			frame_type: FrameType::Uih,
			data: buf,
		};

		Ok(self.cmux.transmit_frame(&uih, true).unwrap_or(0))
	}

	fn receive(&self, buf: &mut [u8]) -> Result<usize> {
		Ok(self.shared.receive_rb.lock().get(buf))
	}

	fn attach(&self, callback: PipeCallback) {
		self.shared.callback.set(Some(callback));
	}

	fn release(&self) {
		self.shared.callback.set(None);
	}
}

#[cfg(test)]
mod tests {
	use std::sync::{Arc, Mutex};

	use smoltcp::time::Instant;

	use super::*;
	use crate::backend::mock::MockBackend;

	const UA_DLCI0: [u8; 6] = [0xF9, 0x03, 0x73, 0x01, 0xD7, 0xF9];
	const UA_DLCI1: [u8; 6] = [0xF9, 0x07, 0x73, 0x01, 0x15, 0xF9];
	const UA_DLCI2: [u8; 6] = [0xF9, 0x0B, 0x73, 0x01, 0x92, 0xF9];

	const SABM_DLCI0: [u8; 6] = [0xF9, 0x03, 0x3F, 0x01, 0x1C, 0xF9];
	const SABM_DLCI1: [u8; 6] = [0xF9, 0x07, 0x3F, 0x01, 0xDE, 0xF9];

	const UIH_DLCI1_AT: [u8; 8] = [0xF9, 0x07, 0xEF, 0x05, 0x41, 0x54, 0x30, 0xF9];
	const UIH_DLCI1_NEWLINE: [u8; 8] = [0xF9, 0x07, 0xEF, 0x05, 0x0D, 0x0A, 0x30, 0xF9];

	const MSC_CMD: [u8; 10] = [0xF9, 0x01, 0xFF, 0x09, 0xE3, 0x05, 0x0B, 0x09, 0x8F, 0xF9];
	const MSC_ACK: [u8; 10] = [0xF9, 0x01, 0xFF, 0x09, 0xE1, 0x05, 0x0B, 0x09, 0x8F, 0xF9];

	const CLD_FRAME: [u8; 8] = [0xF9, 0x03, 0xEF, 0x05, 0xC3, 0x01, 0xF2, 0xF9];

	const PPP_52: [u8; 52] = [
		0x7E, 0xFF, 0x7D, 0x23, 0xC0, 0x21, 0x7D, 0x21, 0x7D, 0x20, 0x7D, 0x20, 0x7D, 0x38,
		0x7D, 0x22, 0x7D, 0x26, 0x7D, 0x20, 0x7D, 0x20, 0x7D, 0x20, 0x7D, 0x20, 0x7D, 0x23,
		0x7D, 0x24, 0xC0, 0x23, 0x7D, 0x25, 0x7D, 0x26, 0x53, 0x96, 0x7D, 0x38, 0xAA, 0x7D,
		0x27, 0x7D, 0x22, 0x7D, 0x28, 0x7D, 0x22, 0xD5, 0xA8, 0x7E,
	];

	/// Runs all work due within the next `ms` milliseconds of virtual
	/// time, without jumping past longer-term deadlines.
	fn pump_for(worker: &Worker, now: &mut Instant, ms: u64) {
		for _ in 0..=ms {
			for _ in 0..100 {
				if worker.process(*now) != Some(*now) {
					break;
				}
			}

			*now += Duration::from_millis(1);
		}
	}

	fn pump(worker: &Worker, now: &mut Instant) {
		pump_for(worker, now, 50);
	}

	fn drain(bus: &MockBackend) -> Vec<u8> {
		let mut out = Vec::new();
		let mut buf = [0u8; 64];

		loop {
			let count = bus.get(&mut buf);
			if count == 0 {
				break;
			}
			out.extend_from_slice(&buf[..count]);
		}

		out
	}

	struct Harness {
		worker: Worker,
		now: Instant,
		bus: MockBackend,
		cmux: Cmux,
		events: Arc<Mutex<Vec<CmuxEvent>>>,
	}

	impl Harness {
		fn new() -> Self {
			let worker = Worker::new();
			let bus = MockBackend::new(&worker, 4096);
			let cmux = Cmux::new(CmuxConfig::default(), &worker).unwrap();

			let events = Arc::new(Mutex::new(Vec::new()));
			let sink = events.clone();
			cmux.set_callback(Box::new(move |event| {
				sink.lock().unwrap().push(event);
			}));

			cmux.attach(bus.pipe()).unwrap();

			Harness {
				worker,
				now: Instant::from_millis(0),
				bus,
				cmux,
				events,
			}
		}

		fn pump(&mut self) {
			pump(&self.worker, &mut self.now);
		}

		fn connect(&mut self) {
			self.cmux.connect_async().unwrap();
			self.pump();
			assert_eq!(drain(&self.bus), SABM_DLCI0);

			self.bus.put(&UA_DLCI0);
			self.pump();
			assert_eq!(self.cmux.state(), CmuxState::Connected);
		}

		fn open_dlci(&mut self, pipe: &Pipe, ack: &[u8]) -> Arc<Mutex<Vec<PipeEvent>>> {
			let events = Arc::new(Mutex::new(Vec::new()));
			let sink = events.clone();
			pipe.attach(Box::new(move |event| {
				sink.lock().unwrap().push(event);
			}));

			pipe.open().unwrap();
			self.pump();
			drain(&self.bus);

			self.bus.put(ack);
			self.pump();
			assert_eq!(events.lock().unwrap().as_slice(), [PipeEvent::Opened]);

			events
		}
	}

	fn dlci_config(address: u8) -> DlciConfig {
		DlciConfig {
			dlci_address: address,
			receive_buf_size: 128,
		}
	}

	#[test]
	fn connect_emits_single_connected_event() {
		let mut harness = Harness::new();
		harness.connect();

		assert_eq!(harness.events.lock().unwrap().as_slice(), [CmuxEvent::Connected]);
	}

	#[test]
	fn dlci_open_transitions_on_ua() {
		let mut harness = Harness::new();
		let dlci1 = harness.cmux.create_dlci(&dlci_config(1)).unwrap();

		// Opening before the engine is connected is refused.
		assert_eq!(dlci1.open(), Err(Error::NotAttached));

		harness.connect();

		dlci1.open().unwrap();
		harness.pump();
		assert_eq!(drain(&harness.bus), SABM_DLCI1);

		harness.bus.put(&UA_DLCI1);
		harness.pump();
		assert_eq!(dlci1.open(), Err(Error::AlreadyOpen));
	}

	#[test]
	fn dlci_receive_preserves_frame_order() {
		let mut harness = Harness::new();
		let dlci1 = harness.cmux.create_dlci(&dlci_config(1)).unwrap();
		harness.connect();
		harness.open_dlci(&dlci1, &UA_DLCI1);

		harness.bus.put(&UIH_DLCI1_AT);
		harness.bus.put(&UIH_DLCI1_NEWLINE);
		harness.pump();

		let mut buf = [0u8; 16];
		let count = dlci1.receive(&mut buf).unwrap();
		assert_eq!(&buf[..count], [0x41, 0x54, 0x0D, 0x0A]);
	}

	#[test]
	fn dlci_transmit_wraps_payload_in_single_uih_frame() {
		let mut harness = Harness::new();
		let dlci2 = harness.cmux.create_dlci(&dlci_config(2)).unwrap();
		harness.connect();
		harness.open_dlci(&dlci2, &UA_DLCI2);

		assert_eq!(dlci2.transmit(&PPP_52).unwrap(), PPP_52.len());
		harness.pump();

		let wire = drain(&harness.bus);
		assert_eq!(wire[0], 0xF9);
		assert_eq!(wire[1], 0x09);
		assert_eq!(wire[2], 0xEF);
		assert_eq!(wire[3], (52 << 1) | 0x01);
		assert_eq!(&wire[4..56], PPP_52);
		assert_eq!(wire[56], 0x97);
		assert_eq!(wire[57], 0xF9);
		assert_eq!(wire.len(), 58);
	}

	#[test]
	fn desync_triggers_resync_sequence() {
		let mut harness = Harness::new();
		let dlci1 = harness.cmux.create_dlci(&dlci_config(1)).unwrap();
		harness.connect();
		harness.open_dlci(&dlci1, &UA_DLCI1);

		// A frame missing its opening flag.
		harness.bus.put(&[0x41, 0x54, 0x30, 0xF9]);
		harness.pump();
		assert_eq!(drain(&harness.bus), [0xF9, 0xF9, 0xF9]);

		// Peer resynchronizes with flags, then retransmits.
		harness.bus.put(&[0xF9, 0xF9, 0xF9]);
		harness.bus.put(&UIH_DLCI1_AT);
		harness.pump();

		let mut buf = [0u8; 16];
		let count = dlci1.receive(&mut buf).unwrap();
		assert_eq!(&buf[..count], [0x41, 0x54]);
	}

	#[test]
	fn resync_recovers_on_first_byte_after_three_flags() {
		let mut harness = Harness::new();
		let dlci1 = harness.cmux.create_dlci(&dlci_config(1)).unwrap();
		harness.connect();
		harness.open_dlci(&dlci1, &UA_DLCI1);

		// Desync; the trailing 0xF9 counts as the first resync flag.
		harness.bus.put(&[0x41, 0x54, 0x30, 0xF9]);
		harness.pump();
		assert_eq!(drain(&harness.bus), [0xF9, 0xF9, 0xF9]);

		// Two more flags complete the resynchronization; the very next
		// byte is already the address of a frame carrying no leading
		// flag of its own.
		harness.bus.put(&[0xF9, 0xF9]);
		harness.bus.put(&[0x07, 0xEF, 0x05, 0x41, 0x54, 0x30, 0xF9]);
		harness.pump();

		let mut buf = [0u8; 16];
		let count = dlci1.receive(&mut buf).unwrap();
		assert_eq!(&buf[..count], [0x41, 0x54]);
	}

	#[test]
	fn msc_command_is_echoed_with_cr_cleared() {
		let mut harness = Harness::new();
		harness.connect();

		harness.bus.put(&MSC_CMD);
		harness.pump();

		assert_eq!(drain(&harness.bus), MSC_ACK);
	}

	#[test]
	fn fcs_mismatch_drops_frame() {
		let mut harness = Harness::new();
		let dlci1 = harness.cmux.create_dlci(&dlci_config(1)).unwrap();
		harness.connect();
		harness.open_dlci(&dlci1, &UA_DLCI1);

		let mut corrupted = UIH_DLCI1_AT;
		corrupted[6] ^= 0xFF;
		harness.bus.put(&corrupted);
		harness.pump();

		let mut buf = [0u8; 16];
		assert_eq!(dlci1.receive(&mut buf).unwrap(), 0);
	}

	#[test]
	fn disconnect_closes_dlcis_and_awaits_cld() {
		let mut harness = Harness::new();
		let dlci1 = harness.cmux.create_dlci(&dlci_config(1)).unwrap();
		harness.connect();
		let events = harness.open_dlci(&dlci1, &UA_DLCI1);

		harness.cmux.disconnect_async().unwrap();
		assert_eq!(harness.cmux.state(), CmuxState::Disconnecting);
		assert!(events.lock().unwrap().contains(&PipeEvent::Closed));

		harness.pump();
		assert_eq!(drain(&harness.bus), CLD_FRAME);

		harness.bus.put(&CLD_FRAME);
		harness.pump();

		assert_eq!(harness.cmux.state(), CmuxState::Disconnected);
		assert_eq!(
			harness.events.lock().unwrap().as_slice(),
			[CmuxEvent::Connected, CmuxEvent::Disconnected]
		);
	}

	#[test]
	fn unacknowledged_disconnect_is_forced() {
		let mut harness = Harness::new();
		harness.connect();

		harness.cmux.disconnect_async().unwrap();
		harness.pump();
		drain(&harness.bus);
		assert_eq!(harness.cmux.state(), CmuxState::Disconnecting);

		// No CLD acknowledgment arrives; the delayed work fires.
		pump_for(&harness.worker, &mut harness.now, 350);

		assert_eq!(harness.cmux.state(), CmuxState::Disconnected);
		assert_eq!(
			harness.events.lock().unwrap().as_slice(),
			[CmuxEvent::Connected, CmuxEvent::Disconnected]
		);
	}

	#[test]
	fn uih_round_trip_across_payload_sizes() {
		for (len, address) in [(1usize, 1u8), (127, 2), (128, 5), (300, 33), (1000, 63)] {
			let payload: Vec<u8> = (0..len).map(|i| (i % 251) as u8).collect();

			let mut rb = RingBuffer::new(2048);
			let frame = Frame {
				dlci_address: address,
				cr: false,
				pf: false,
				frame_type: FrameType::Uih,
				data: &payload,
			};
			assert_eq!(frame::encode_into(&mut rb, &frame, false), Some(len));

			let mut wire = vec![0u8; rb.len()];
			rb.get(&mut wire);

			let worker = Worker::new();
			let bus = MockBackend::new(&worker, 4096);
			let cmux = Cmux::new(
				CmuxConfig {
					receive_buf_size: 1024,
					..CmuxConfig::default()
				},
				&worker,
			)
			.unwrap();
			let dlci = cmux
				.create_dlci(&DlciConfig {
					dlci_address: address,
					receive_buf_size: 1024,
				})
				.unwrap();
			cmux.attach(bus.pipe()).unwrap();

			let mut now = Instant::from_millis(0);
			bus.put(&wire);
			pump(&worker, &mut now);

			let mut received = vec![0u8; len + 16];
			let count = dlci.receive(&mut received).unwrap();
			assert_eq!(&received[..count], payload.as_slice(), "len {len}");
		}
	}
}
