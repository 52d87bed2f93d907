//! Full connection scenario against a scripted modem.
//!
//! A mock modem sits on the far side of the in-memory bus: it answers
//! AT commands in text mode, switches to CMUX on request, acknowledges
//! SABM/DISC, and serves chat responses and PPP data over the DLCI
//! channels. The supervisor must walk idle → init → CMUX → dial →
//! register → roaming, survive a registration loss, exchange PPP frames
//! in steady state, and tear everything down on suspend.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use cellmux::backend::mock::MockBackend;
use cellmux::cellular::{Carrier, Cellular, CellularConfig, CellularState};
use cellmux::ppp::{NetInterface, Packet, PacketFamily, Ppp, PppConfig};
use cellmux::work::{Duration, Instant};
use cellmux::Worker;

const WRAPPED_LCP: [u8; 17] = [
	0x7E, 0xFF, 0x7D, 0x23, 0xC0, 0x21, 0x7D, 0x21, 0x7D, 0x21, 0x7D, 0x20, 0x7D, 0x24, 0xD1,
	0xB5, 0x7E,
];
const UNWRAPPED_LCP: [u8; 6] = [0xC0, 0x21, 0x01, 0x01, 0x00, 0x04];

fn fcs8(bytes: &[u8]) -> u8 {
	let mut fcs: u8 = 0xFF;

	for &byte in bytes {
		fcs ^= byte;
		for _ in 0..8 {
			fcs = if fcs & 0x01 != 0 { (fcs >> 1) ^ 0xE0 } else { fcs >> 1 };
		}
	}

	0xFF - fcs
}

enum ModemMode {
	Text,
	Cmux,
}

struct ParsedFrame {
	dlci: u8,
	frame_type: u8,
	payload: Vec<u8>,
}

/// Scripted peer: the far side of the serial link.
struct MockModem {
	mode: ModemMode,
	line: Vec<u8>,
	stream: Vec<u8>,
	dlci_lines: [Vec<u8>; 2],
	dlci2_ppp: Vec<u8>,
	in_ppp_frame: bool,
	cgatt_responses: VecDeque<&'static str>,
}

impl MockModem {
	fn new(cgatt_responses: &[&'static str]) -> Self {
		MockModem {
			mode: ModemMode::Text,
			line: Vec::new(),
			stream: Vec::new(),
			dlci_lines: [Vec::new(), Vec::new()],
			dlci2_ppp: Vec::new(),
			in_ppp_frame: false,
			cgatt_responses: cgatt_responses.iter().copied().collect(),
		}
	}

	fn poll(&mut self, bus: &MockBackend) {
		let mut buf = [0u8; 64];

		loop {
			let count = bus.get(&mut buf);
			if count == 0 {
				break;
			}

			for &byte in &buf[..count] {
				match self.mode {
					ModemMode::Text => self.on_text_byte(byte, bus),
					ModemMode::Cmux => self.stream.push(byte),
				}
			}
		}

		while let Some(frame) = self.parse_frame() {
			self.on_frame(frame, bus);
		}
	}

	fn on_text_byte(&mut self, byte: u8, bus: &MockBackend) {
		match byte {
			b'\r' => {
				let line = std::mem::take(&mut self.line);
				self.on_command(&line, bus);
			}
			b'\n' => {}
			_ => self.line.push(byte),
		}
	}

	fn on_command(&mut self, line: &[u8], bus: &MockBackend) {
		let command = String::from_utf8_lossy(line).into_owned();

		match command.as_str() {
			"AT" | "ATE0" | "ATH" | "AT+CMEE=1" | "AT+CREG=0" => {
				bus.put(b"OK\r\n");
			}
			"AT+CGSN" => {
				bus.put(b"123456789012345\r\nOK\r\n");
			}
			"AT+CGMM" => {
				bus.put(b"FAKE-MODEM-9000\r\nOK\r\n");
			}
			_ if command.starts_with("AT+CMUX=") => {
				bus.put(b"OK\r\n");
				self.mode = ModemMode::Cmux;
			}
			_ => {
				bus.put(b"ERROR\r\n");
			}
		}
	}

	fn parse_frame(&mut self) -> Option<ParsedFrame> {
		// Strip inter-frame flags.
		let start = self.stream.iter().position(|&byte| byte != 0xF9)?;
		self.stream.drain(..start);

		let bytes = &self.stream;
		if bytes.len() < 4 {
			return None;
		}

		let dlci = bytes[0] >> 2;
		let frame_type = bytes[1] & !0x10;

		let (header_len, data_len) = if bytes[2] & 0x01 != 0 {
			(3, usize::from(bytes[2] >> 1))
		} else {
			(4, usize::from(bytes[2] >> 1) | usize::from(bytes[3]) << 7)
		};

		if bytes.len() < header_len + data_len + 1 {
			return None;
		}

		let payload = bytes[header_len..header_len + data_len].to_vec();
		self.stream.drain(..header_len + data_len + 1);

		Some(ParsedFrame {
			dlci,
			frame_type,
			payload,
		})
	}

	fn send_frame(&self, bus: &MockBackend, dlci: u8, control: u8, payload: &[u8]) {
		let address = 0x01 | 0x02 | (dlci << 2);
		let length = (payload.len() as u8) << 1 | 0x01;
		let header = [address, control, length];

		let fcs = if control & !0x10 == 0xEF {
			fcs8(&header)
		} else {
			let mut covered = header.to_vec();
			covered.extend_from_slice(payload);
			fcs8(&covered)
		};

		let mut frame = vec![0xF9];
		frame.extend_from_slice(&header);
		frame.extend_from_slice(payload);
		frame.push(fcs);
		frame.push(0xF9);
		bus.put(&frame);
	}

	fn send_ua(&self, bus: &MockBackend, dlci: u8) {
		self.send_frame(bus, dlci, 0x63 | 0x10, &[]);
	}

	fn send_uih(&self, bus: &MockBackend, dlci: u8, payload: &[u8]) {
		self.send_frame(bus, dlci, 0xEF, payload);
	}

	fn on_frame(&mut self, frame: ParsedFrame, bus: &MockBackend) {
		match frame.frame_type {
			// SABM or DISC: acknowledge.
			0x2F | 0x43 => self.send_ua(bus, frame.dlci),

			0xEF if frame.dlci == 0 => {
				// Close-down: echo the command back.
				if frame.payload.first().map(|byte| byte >> 2) == Some(0x30) {
					self.send_uih(bus, 0, &frame.payload);
					self.mode = ModemMode::Text;
				}
			}

			0xEF => {
				let payload = frame.payload.clone();
				for &byte in &payload {
					self.on_dlci_byte(frame.dlci, byte, bus);
				}
			}

			_ => {}
		}
	}

	fn on_dlci_byte(&mut self, dlci: u8, byte: u8, bus: &MockBackend) {
		// PPP frames on DLCI 2 are bracketed by 0x7E; everything else is
		// AT command lines.
		if dlci == 2 {
			if self.in_ppp_frame {
				self.dlci2_ppp.push(byte);
				if byte == 0x7E {
					self.in_ppp_frame = false;
				}
				return;
			}

			if byte == 0x7E {
				self.dlci2_ppp.push(byte);
				self.in_ppp_frame = true;
				return;
			}
		}

		let index = usize::from(dlci - 1);

		match byte {
			b'\r' => {
				let line = std::mem::take(&mut self.dlci_lines[index]);
				self.on_dlci_command(dlci, &line, bus);
			}
			b'\n' => {}
			_ => self.dlci_lines[index].push(byte),
		}
	}

	fn on_dlci_command(&mut self, dlci: u8, line: &[u8], bus: &MockBackend) {
		let command = String::from_utf8_lossy(line).into_owned();

		match command.as_str() {
			"ATD*99#" => self.send_uih(bus, dlci, b"CONNECT 150000000\r\n"),
			"AT+CREG?" => self.send_uih(bus, dlci, b"+CREG: 0,5\r\nOK\r\n"),
			"AT+CGATT?" => {
				let state = self.cgatt_responses.pop_front().unwrap_or("1");
				let response = format!("+CGATT: {state}\r\nOK\r\n");
				self.send_uih(bus, dlci, response.as_bytes());
			}
			_ if command.starts_with("AT+CGDCONT=") => {
				self.send_uih(bus, dlci, b"OK\r\n");
			}
			_ => self.send_uih(bus, dlci, b"ERROR\r\n"),
		}
	}
}

struct RecordingCarrier {
	log: Arc<Mutex<Vec<&'static str>>>,
}

impl Carrier for RecordingCarrier {
	fn carrier_on(&mut self) {
		self.log.lock().unwrap().push("on");
	}

	fn carrier_off(&mut self) {
		self.log.lock().unwrap().push("off");
	}
}

struct RecordingIface {
	packets: Arc<Mutex<Vec<Vec<u8>>>>,
}

impl NetInterface for RecordingIface {
	fn recv(&mut self, pkt: Packet) {
		assert_eq!(pkt.family, PacketFamily::Ppp);
		self.packets.lock().unwrap().push(pkt.data);
	}
}

struct Env {
	worker: Worker,
	now: Instant,
	bus: MockBackend,
	modem: MockModem,
	ppp: Ppp,
	cellular: Cellular,
	carrier_log: Arc<Mutex<Vec<&'static str>>>,
	packets: Arc<Mutex<Vec<Vec<u8>>>>,
}

impl Env {
	fn new(cgatt_responses: &[&'static str]) -> Self {
		let worker = Worker::new();
		let bus = MockBackend::new(&worker, 4096);
		let modem = MockModem::new(cgatt_responses);

		let ppp = Ppp::new(PppConfig::default(), &worker).unwrap();
		let packets = Arc::new(Mutex::new(Vec::new()));
		ppp.set_iface(Box::new(RecordingIface {
			packets: packets.clone(),
		}));

		let carrier_log = Arc::new(Mutex::new(Vec::new()));
		let cellular = Cellular::new(
			CellularConfig::new("internet"),
			bus.pipe(),
			ppp.clone(),
			Box::new(RecordingCarrier {
				log: carrier_log.clone(),
			}),
			&worker,
		)
		.unwrap();

		Env {
			worker,
			now: Instant::from_millis(0),
			bus,
			modem,
			ppp,
			cellular,
			carrier_log,
			packets,
		}
	}

	/// Advances `ms` milliseconds of virtual time, interleaving worker
	/// dispatch with modem polling.
	fn run(&mut self, ms: u64) {
		for _ in 0..ms {
			for _ in 0..100 {
				if self.worker.process(self.now) != Some(self.now) {
					break;
				}
			}

			self.modem.poll(&self.bus);
			self.now += Duration::from_millis(1);
		}
	}
}

#[test]
fn connects_roams_and_suspends() {
	let mut env = Env::new(&["0", "1", "0", "1", "1"]);

	assert_eq!(env.cellular.state(), CellularState::Idle);

	env.cellular.resume();

	// Warm-up probes alone take 400 ms; registration succeeds on the
	// second poll, drops once while roaming (forcing a re-dial), then
	// holds.
	env.run(8000);

	assert_eq!(env.cellular.state(), CellularState::Roaming);
	assert!(env.cellular.registered());
	assert_eq!(
		env.cellular.imei(),
		Some([1, 2, 3, 4, 5, 6, 7, 8, 9, 0, 1, 2, 3, 4, 5])
	);
	assert_eq!(env.cellular.model(), "FAKE-MODEM-9000");

	// The registration drop toggled the carrier once.
	assert_eq!(env.carrier_log.lock().unwrap().as_slice(), ["on", "off", "on"]);

	// Steady state: outbound PPP frames reach the modem over DLCI 2.
	env.ppp
		.send(Packet {
			family: PacketFamily::Ppp,
			data: UNWRAPPED_LCP.to_vec(),
		})
		.unwrap();
	env.run(50);
	assert_eq!(env.modem.dlci2_ppp, WRAPPED_LCP);

	// Inbound PPP frames reach the network interface.
	let frame = env.modem.dlci2_ppp.clone();
	env.modem.send_uih(&env.bus, 2, &frame);
	env.run(50);
	assert_eq!(env.packets.lock().unwrap().as_slice(), [UNWRAPPED_LCP.to_vec()]);

	// Orderly teardown.
	env.cellular.suspend();
	env.run(1000);

	assert_eq!(env.cellular.state(), CellularState::Idle);
	assert_eq!(
		env.carrier_log.lock().unwrap().as_slice(),
		["on", "off", "on", "off"]
	);
}

#[test]
fn stays_in_register_until_attached() {
	let mut env = Env::new(&["0", "0", "0"]);

	env.cellular.resume();
	env.run(3000);

	// Three polls, none attached: still registering.
	assert_eq!(env.cellular.state(), CellularState::Register);
	assert!(!env.cellular.registered());
	assert!(env.carrier_log.lock().unwrap().is_empty());
}
