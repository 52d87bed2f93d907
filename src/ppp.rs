//! PPP framer.
//!
//! HDLC-like byte-stuffed framing between a pipe and the host network
//! stack. The framer does no LCP/IPCP negotiation: inbound frames are
//! handed to the attached [`NetInterface`] with their protocol field
//! intact, outbound IP packets get a protocol field injected, and
//! control traffic passes through opaquely as [`PacketFamily::Ppp`].
//! [`PppDevice`] additionally adapts an attached framer to a smoltcp
//! IP-medium device.

use alloc::boxed::Box;
use alloc::collections::VecDeque;
use alloc::sync::{Arc, Weak};
use alloc::vec;
use alloc::vec::Vec;

use hermit_sync::SpinMutex;
use log::{debug, warn};
use smallvec::SmallVec;
use smoltcp::phy::{self, Device, DeviceCapabilities, Medium};
use smoltcp::time::{Duration, Instant};
use smoltcp::wire::IpVersion;

use crate::collections::RingBuffer;
use crate::error::{Error, Result};
use crate::pipe::{Pipe, PipeEvent, PipeOps};
use crate::work::{WorkItem, Worker};

pub const PPP_PROTOCOL_IPV4: u16 = 0x0021;
pub const PPP_PROTOCOL_IPV6: u16 = 0x0057;

const FLAG: u8 = 0x7E;
const ESCAPE: u8 = 0x7D;
const ESCAPE_MASK: u8 = 0x20;

/// Two trailing FCS bytes on every received frame.
const FRAME_TAIL_SIZE: usize = 2;

const FCS16_INIT: u16 = 0xFFFF;

fn fcs16_update(fcs: u16, byte: u8) -> u16 {
	let mut fcs = fcs ^ u16::from(byte);

	for _ in 0..8 {
		fcs = if fcs & 0x0001 != 0 { (fcs >> 1) ^ 0x8408 } else { fcs >> 1 };
	}

	fcs
}

fn fcs16_final(fcs: u16) -> u16 {
	fcs ^ 0xFFFF
}

fn needs_escape(byte: u8) -> bool {
	byte == FLAG || byte == ESCAPE || byte < 0x20
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketFamily {
	Ipv4,
	Ipv6,
	/// Raw PPP frame content; the first two payload bytes are the
	/// protocol field.
	Ppp,
}

pub struct Packet {
	pub family: PacketFamily,
	pub data: Vec<u8>,
}

/// The network-stack side of the framer: receives unwrapped inbound
/// frames.
pub trait NetInterface: Send {
	fn recv(&mut self, pkt: Packet);
}

pub struct PppConfig {
	/// Largest accepted unwrapped frame, FCS excluded.
	pub mru: usize,
	pub transmit_buf_size: usize,
	/// Transmit retry pacing when the pipe refuses bytes.
	pub process_timeout: Duration,
}

impl Default for PppConfig {
	fn default() -> Self {
		PppConfig {
			mru: 1500,
			transmit_buf_size: 256,
			process_timeout: Duration::from_millis(2),
		}
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RxState {
	HdrSof,
	HdrFf,
	Hdr7d,
	Hdr23,
	Writing,
	Unescaping,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TxState {
	Idle,
	Sof,
	HdrFf,
	Hdr7d,
	Hdr23,
	ProtocolHigh,
	EscapeProtocolHigh,
	ProtocolLow,
	EscapeProtocolLow,
	Data,
	EscapeData,
	FcsLow,
	EscapeFcsLow,
	FcsHigh,
	EscapeFcsHigh,
	Eof,
}

struct TxPacket {
	data: Vec<u8>,
	pos: usize,
	protocol: u16,
	is_ppp: bool,
}

struct PppState {
	pipe: Option<Pipe>,
	started: bool,
	rx_state: RxState,
	rx_pkt: Option<Vec<u8>>,
	tx_state: TxState,
	tx_pkt: Option<TxPacket>,
	tx_escaped: u8,
	tx_fcs: u16,
	transmit_rb: RingBuffer,
}

struct PppInner {
	cell: SpinMutex<PppState>,
	iface: SpinMutex<Option<Box<dyn NetInterface>>>,
	mru: usize,
	process_timeout: Duration,
	worker: Worker,
	process_work: WorkItem,
	send_work: WorkItem,
}

/// PPP framer handle.
#[derive(Clone)]
pub struct Ppp {
	inner: Arc<PppInner>,
}

impl Ppp {
	pub fn new(config: PppConfig, worker: &Worker) -> Result<Self> {
		if config.mru == 0 || config.transmit_buf_size == 0 {
			return Err(Error::Invalid);
		}

		let inner = Arc::new_cyclic(|weak: &Weak<PppInner>| {
			let process = weak.clone();
			let send = weak.clone();

			PppInner {
				cell: SpinMutex::new(PppState {
					pipe: None,
					started: false,
					rx_state: RxState::HdrSof,
					rx_pkt: None,
					tx_state: TxState::Idle,
					tx_pkt: None,
					tx_escaped: 0,
					tx_fcs: 0,
					transmit_rb: RingBuffer::new(config.transmit_buf_size),
				}),
				iface: SpinMutex::new(None),
				mru: config.mru,
				process_timeout: config.process_timeout,
				worker: worker.clone(),
				process_work: WorkItem::new(move || {
					if let Some(inner) = process.upgrade() {
						inner.process_received();
					}
				}),
				send_work: WorkItem::new(move || {
					if let Some(inner) = send.upgrade() {
						inner.process_send();
					}
				}),
			}
		});

		Ok(Ppp { inner })
	}

	/// Installs the network-stack consumer for inbound frames.
	pub fn set_iface(&self, iface: Box<dyn NetInterface>) {
		*self.inner.iface.lock() = Some(iface);
	}

	pub fn attach(&self, pipe: Pipe) {
		self.inner.cell.lock().pipe = Some(pipe.clone());

		let weak = Arc::downgrade(&self.inner);
		pipe.attach(Box::new(move |event| {
			if event == PipeEvent::ReceiveReady {
				if let Some(inner) = weak.upgrade() {
					inner.worker.submit(&inner.process_work);
				}
			}
		}));
	}

	pub fn release(&self) {
		let inner = &self.inner;

		let pipe = {
			let mut cell = inner.cell.lock();
			cell.started = false;
			cell.rx_state = RxState::HdrSof;
			cell.rx_pkt = None;
			cell.tx_state = TxState::Idle;
			cell.tx_pkt = None;
			cell.transmit_rb.reset();
			cell.pipe.take()
		};

		if let Some(pipe) = pipe {
			pipe.release();
		}

		inner.worker.cancel(&inner.process_work);
		inner.worker.cancel(&inner.send_work);
	}

	/// Enables frame exchange with the network stack.
	pub fn start(&self) {
		self.inner.cell.lock().started = true;
	}

	/// Disables frame exchange and drops in-flight packets.
	pub fn stop(&self) {
		let mut cell = self.inner.cell.lock();
		cell.started = false;
		cell.rx_state = RxState::HdrSof;
		cell.rx_pkt = None;
		cell.tx_state = TxState::Idle;
		cell.tx_pkt = None;
		cell.transmit_rb.reset();
	}

	/// Queues one outbound packet for wrapping and transmission.
	pub fn send(&self, pkt: Packet) -> Result<()> {
		let min_len = match pkt.family {
			PacketFamily::Ppp => 2,
			PacketFamily::Ipv4 | PacketFamily::Ipv6 => 1,
		};

		if pkt.data.len() < min_len {
			return Err(Error::Invalid);
		}

		let protocol = match pkt.family {
			PacketFamily::Ipv4 => PPP_PROTOCOL_IPV4,
			PacketFamily::Ipv6 => PPP_PROTOCOL_IPV6,
			PacketFamily::Ppp => 0,
		};

		{
			let mut cell = self.inner.cell.lock();

			if cell.pipe.is_none() || !cell.started {
				return Err(Error::NotAttached);
			}

			if cell.tx_pkt.is_some() {
				return Err(Error::Busy);
			}

			cell.tx_pkt = Some(TxPacket {
				data: pkt.data,
				pos: 0,
				protocol,
				is_ppp: pkt.family == PacketFamily::Ppp,
			});
		}

		self.inner.worker.submit(&self.inner.send_work);
		Ok(())
	}
}

impl PppInner {
	/// Produces the next wire byte of the in-flight packet, advancing
	/// the per-byte wrapping automaton.
	fn wrap_byte(&self, cell: &mut PppState) -> u8 {
		let Some(pkt) = cell.tx_pkt.as_mut() else {
			return 0;
		};

		match cell.tx_state {
			TxState::Idle => {
				warn!("invalid transmit state");
				0
			}

			TxState::Sof => {
				cell.tx_state = TxState::HdrFf;
				FLAG
			}

			TxState::HdrFf => {
				pkt.pos = 0;
				cell.tx_fcs = fcs16_update(FCS16_INIT, 0xFF);
				cell.tx_state = TxState::Hdr7d;
				0xFF
			}

			TxState::Hdr7d => {
				cell.tx_fcs = fcs16_update(cell.tx_fcs, 0x03);
				cell.tx_state = TxState::Hdr23;
				ESCAPE
			}

			TxState::Hdr23 => {
				cell.tx_state = if pkt.is_ppp {
					TxState::Data
				} else {
					TxState::ProtocolHigh
				};
				0x23
			}

			TxState::ProtocolHigh => {
				let byte = (pkt.protocol >> 8) as u8;
				cell.tx_fcs = fcs16_update(cell.tx_fcs, byte);

				if needs_escape(byte) {
					cell.tx_escaped = byte ^ ESCAPE_MASK;
					cell.tx_state = TxState::EscapeProtocolHigh;
					ESCAPE
				} else {
					cell.tx_state = TxState::ProtocolLow;
					byte
				}
			}

			TxState::EscapeProtocolHigh => {
				cell.tx_state = TxState::ProtocolLow;
				cell.tx_escaped
			}

			TxState::ProtocolLow => {
				let byte = (pkt.protocol & 0xFF) as u8;
				cell.tx_fcs = fcs16_update(cell.tx_fcs, byte);

				if needs_escape(byte) {
					cell.tx_escaped = byte ^ ESCAPE_MASK;
					cell.tx_state = TxState::EscapeProtocolLow;
					ESCAPE
				} else {
					cell.tx_state = TxState::Data;
					byte
				}
			}

			TxState::EscapeProtocolLow => {
				cell.tx_state = TxState::Data;
				cell.tx_escaped
			}

			TxState::Data => {
				let byte = pkt.data[pkt.pos];
				pkt.pos += 1;
				cell.tx_fcs = fcs16_update(cell.tx_fcs, byte);

				if needs_escape(byte) {
					cell.tx_escaped = byte ^ ESCAPE_MASK;
					cell.tx_state = TxState::EscapeData;
					ESCAPE
				} else {
					if pkt.pos == pkt.data.len() {
						cell.tx_state = TxState::FcsLow;
					}
					byte
				}
			}

			TxState::EscapeData => {
				cell.tx_state = if pkt.pos == pkt.data.len() {
					TxState::FcsLow
				} else {
					TxState::Data
				};
				cell.tx_escaped
			}

			TxState::FcsLow => {
				cell.tx_fcs = fcs16_final(cell.tx_fcs);
				let byte = (cell.tx_fcs & 0xFF) as u8;

				if needs_escape(byte) {
					cell.tx_escaped = byte ^ ESCAPE_MASK;
					cell.tx_state = TxState::EscapeFcsLow;
					ESCAPE
				} else {
					cell.tx_state = TxState::FcsHigh;
					byte
				}
			}

			TxState::EscapeFcsLow => {
				cell.tx_state = TxState::FcsHigh;
				cell.tx_escaped
			}

			TxState::FcsHigh => {
				let byte = (cell.tx_fcs >> 8) as u8;

				if needs_escape(byte) {
					cell.tx_escaped = byte ^ ESCAPE_MASK;
					cell.tx_state = TxState::EscapeFcsHigh;
					ESCAPE
				} else {
					cell.tx_state = TxState::Eof;
					byte
				}
			}

			TxState::EscapeFcsHigh => {
				cell.tx_state = TxState::Eof;
				cell.tx_escaped
			}

			TxState::Eof => {
				cell.tx_state = TxState::Idle;
				FLAG
			}
		}
	}

	fn process_send(&self) {
		let Some(pipe) = self.cell.lock().pipe.clone() else {
			return;
		};

		let mut cell = self.cell.lock();

		if cell.tx_pkt.is_some() {
			if cell.tx_state == TxState::Idle {
				cell.tx_state = TxState::Sof;
			}

			// Step the wrapping automaton until the ring fills or the
			// packet completes.
			while cell.transmit_rb.space() > 0 {
				let byte = self.wrap_byte(&mut cell);
				cell.transmit_rb.put(&[byte]);

				if cell.tx_state == TxState::Idle {
					cell.tx_pkt = None;
					break;
				}
			}
		}

		if cell.transmit_rb.is_empty() {
			return;
		}

		match pipe.transmit(cell.transmit_rb.claim_read()) {
			Ok(count) if count > 0 => {
				cell.transmit_rb.finish_read(count);

				if !cell.transmit_rb.is_empty() || cell.tx_pkt.is_some() {
					self.worker.submit(&self.send_work);
				}
			}
			_ => {
				self.worker.schedule(&self.send_work, self.process_timeout);
			}
		}
	}

	fn process_received(&self) {
		let Some(pipe) = self.cell.lock().pipe.clone() else {
			return;
		};

		let mut buf = [0u8; 16];
		let count = match pipe.receive(&mut buf) {
			Ok(count) => count,
			Err(_) => return,
		};

		if count == 0 {
			return;
		}

		let mut completed: SmallVec<[Vec<u8>; 2]> = SmallVec::new();

		{
			let mut cell = self.cell.lock();

			for &byte in &buf[..count] {
				if let Some(pkt) = self.process_received_byte(&mut cell, byte) {
					completed.push(pkt);
				}
			}
		}

		for pkt in completed {
			self.deliver(pkt);
		}

		if count == buf.len() {
			self.worker.submit(&self.process_work);
		}
	}

	fn process_received_byte(&self, cell: &mut PppState, byte: u8) -> Option<Vec<u8>> {
		match cell.rx_state {
			RxState::HdrSof => {
				if byte == FLAG {
					cell.rx_state = RxState::HdrFf;
				}

				None
			}

			RxState::HdrFf => {
				cell.rx_state = match byte {
					FLAG => RxState::HdrFf,
					0xFF => RxState::Hdr7d,
					_ => RxState::HdrSof,
				};

				None
			}

			RxState::Hdr7d => {
				cell.rx_state = if byte == ESCAPE { RxState::Hdr23 } else { RxState::HdrSof };
				None
			}

			RxState::Hdr23 => {
				if byte == 0x23 {
					cell.rx_pkt = Some(Vec::with_capacity(64));
					cell.rx_state = RxState::Writing;
				} else {
					cell.rx_state = RxState::HdrSof;
				}

				None
			}

			RxState::Writing => {
				if byte == FLAG {
					cell.rx_state = RxState::HdrSof;
					let mut pkt = cell.rx_pkt.take()?;

					if pkt.len() < FRAME_TAIL_SIZE {
						return None;
					}

					// Strip the FCS.
					pkt.truncate(pkt.len() - FRAME_TAIL_SIZE);
					return Some(pkt);
				}

				if byte == ESCAPE {
					cell.rx_state = RxState::Unescaping;
					return None;
				}

				self.write_received_byte(cell, byte);
				None
			}

			RxState::Unescaping => {
				self.write_received_byte(cell, byte ^ ESCAPE_MASK);

				if cell.rx_pkt.is_some() {
					cell.rx_state = RxState::Writing;
				}

				None
			}
		}
	}

	fn write_received_byte(&self, cell: &mut PppState, byte: u8) {
		let Some(pkt) = cell.rx_pkt.as_mut() else {
			cell.rx_state = RxState::HdrSof;
			return;
		};

		if pkt.len() == self.mru + FRAME_TAIL_SIZE {
			warn!("dropping oversized frame");
			cell.rx_pkt = None;
			cell.rx_state = RxState::HdrSof;
			return;
		}

		pkt.push(byte);
	}

	fn deliver(&self, pkt: Vec<u8>) {
		if !self.cell.lock().started {
			debug!("dropping frame, framer stopped");
			return;
		}

		let mut iface = self.iface.lock();

		let Some(iface) = iface.as_mut() else {
			debug!("dropping frame, no interface attached");
			return;
		};

		iface.recv(Packet {
			family: PacketFamily::Ppp,
			data: pkt,
		});
	}
}

/// Adapts an attached [`Ppp`] framer to a smoltcp IP-medium device.
///
/// Inbound IPv4/IPv6 frames are stripped of their protocol field and
/// queued for the interface; control-protocol frames are dropped here,
/// since negotiation belongs to the host stack when one is present.
pub struct PppDevice {
	ppp: Ppp,
	queue: Arc<SpinMutex<VecDeque<Vec<u8>>>>,
	mtu: usize,
}

/// Queue bound for inbound packets awaiting the interface poll.
const DEVICE_QUEUE_DEPTH: usize = 16;

struct DeviceBridge {
	queue: Arc<SpinMutex<VecDeque<Vec<u8>>>>,
}

impl NetInterface for DeviceBridge {
	fn recv(&mut self, pkt: Packet) {
		if pkt.data.len() < 2 {
			return;
		}

		let protocol = u16::from_be_bytes([pkt.data[0], pkt.data[1]]);

		match protocol {
			PPP_PROTOCOL_IPV4 | PPP_PROTOCOL_IPV6 => {
				let mut queue = self.queue.lock();

				if queue.len() == DEVICE_QUEUE_DEPTH {
					debug!("device queue full, dropping oldest packet");
					queue.pop_front();
				}

				queue.push_back(pkt.data[2..].to_vec());
			}
			_ => debug!("dropping control frame, protocol {protocol:#06x}"),
		}
	}
}

impl PppDevice {
	pub fn new(ppp: Ppp, mtu: usize) -> Self {
		let queue = Arc::new(SpinMutex::new(VecDeque::new()));

		ppp.set_iface(Box::new(DeviceBridge {
			queue: queue.clone(),
		}));

		PppDevice { ppp, queue, mtu }
	}
}

impl Device for PppDevice {
	type RxToken<'a>
		= PppRxToken
	where
		Self: 'a;
	type TxToken<'a>
		= PppTxToken<'a>
	where
		Self: 'a;

	fn capabilities(&self) -> DeviceCapabilities {
		let mut caps = DeviceCapabilities::default();
		caps.medium = Medium::Ip;
		caps.max_transmission_unit = self.mtu;
		caps
	}

	fn receive(&mut self, _timestamp: Instant) -> Option<(Self::RxToken<'_>, Self::TxToken<'_>)> {
		let pkt = self.queue.lock().pop_front()?;
		Some((PppRxToken { pkt }, PppTxToken { ppp: &self.ppp }))
	}

	fn transmit(&mut self, _timestamp: Instant) -> Option<Self::TxToken<'_>> {
		Some(PppTxToken { ppp: &self.ppp })
	}
}

pub struct PppRxToken {
	pkt: Vec<u8>,
}

impl phy::RxToken for PppRxToken {
	fn consume<R, F>(self, f: F) -> R
	where
		F: FnOnce(&[u8]) -> R,
	{
		f(&self.pkt)
	}
}

pub struct PppTxToken<'a> {
	ppp: &'a Ppp,
}

impl phy::TxToken for PppTxToken<'_> {
	fn consume<R, F>(self, len: usize, f: F) -> R
	where
		F: FnOnce(&mut [u8]) -> R,
	{
		let mut data = vec![0; len];
		let result = f(&mut data);

		let family = match IpVersion::of_packet(&data) {
			Ok(IpVersion::Ipv4) => PacketFamily::Ipv4,
			Ok(IpVersion::Ipv6) => PacketFamily::Ipv6,
			Err(_) => {
				warn!("unsupported outbound packet");
				return result;
			}
		};

		if let Err(error) = self.ppp.send(Packet { family, data }) {
			debug!("outbound packet dropped: {error}");
		}

		result
	}
}
