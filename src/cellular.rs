//! Cellular connection supervisor.
//!
//! Drives the modem from cold idle through AT initialization, CMUX
//! connection, DLCI setup, dialing and registration polling into steady
//! IP service, and back down again. The supervisor is a plain value
//! constructed from a [`CellularConfig`]; it owns the CMUX engine and
//! chat engine it composes and consumes a bus pipe, a PPP framer and
//! the application's carrier hooks.

use alloc::boxed::Box;
use alloc::format;
use alloc::string::String;
use alloc::sync::{Arc, Weak};

use heapless::Deque;
use hermit_sync::SpinMutex;
use log::{info, warn};
use smoltcp::time::Duration;

use crate::chat::{Chat, ChatConfig, Match, Script, ScriptCallback, ScriptCmd, ScriptResult};
use crate::cmux::{Cmux, CmuxConfig, CmuxEvent, DlciConfig};
use crate::error::{Error, Result};
use crate::pipe::{Pipe, PipeEvent, PipeOps};
use crate::ppp::Ppp;
use crate::work::{WorkItem, Worker};

/// Network-carrier hooks toward the application's network stack.
pub trait Carrier: Send {
	fn carrier_on(&mut self);
	fn carrier_off(&mut self);
}

pub struct CellularConfig {
	/// Access point name, mandatory.
	pub apn: String,
	/// Appended to the PDP context definition when non-empty.
	pub username: String,
	pub password: String,
	/// Registration poll interval before the modem is registered.
	pub poll_interval_register: Duration,
	/// Registration poll interval while roaming.
	pub poll_interval_roaming: Duration,
}

impl CellularConfig {
	pub fn new(apn: &str) -> Self {
		CellularConfig {
			apn: String::from(apn),
			username: String::new(),
			password: String::new(),
			poll_interval_register: Duration::from_secs(2),
			poll_interval_roaming: Duration::from_secs(4),
		}
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CellularState {
	Idle,
	RunInitScript,
	ConnectCmux,
	OpenDlci1,
	OpenDlci2,
	RunDialScript,
	Register,
	Roaming,
	CloseDlci2,
	CloseDlci1,
	DisconnectCmux,
}

impl CellularState {
	fn as_str(self) -> &'static str {
		match self {
			CellularState::Idle => "idle",
			CellularState::RunInitScript => "run init script",
			CellularState::ConnectCmux => "connect cmux",
			CellularState::OpenDlci1 => "open dlci1",
			CellularState::OpenDlci2 => "open dlci2",
			CellularState::RunDialScript => "run dial script",
			CellularState::Register => "register",
			CellularState::Roaming => "roaming",
			CellularState::CloseDlci2 => "close dlci2",
			CellularState::CloseDlci1 => "close dlci1",
			CellularState::DisconnectCmux => "disconnect cmux",
		}
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CellularEvent {
	Resume,
	Suspend,
	ScriptSuccess,
	ScriptFailed,
	CmuxConnected,
	Dlci1Opened,
	Dlci1Closed,
	Dlci2Opened,
	Dlci2Closed,
	CmuxDisconnected,
	Timeout,
}

impl CellularEvent {
	fn as_str(self) -> &'static str {
		match self {
			CellularEvent::Resume => "resume",
			CellularEvent::Suspend => "suspend",
			CellularEvent::ScriptSuccess => "script success",
			CellularEvent::ScriptFailed => "script failed",
			CellularEvent::CmuxConnected => "cmux connected",
			CellularEvent::Dlci1Opened => "dlci1 opened",
			CellularEvent::Dlci1Closed => "dlci1 closed",
			CellularEvent::Dlci2Opened => "dlci2 opened",
			CellularEvent::Dlci2Closed => "dlci2 closed",
			CellularEvent::CmuxDisconnected => "cmux disconnected",
			CellularEvent::Timeout => "timeout",
		}
	}
}

#[derive(Default)]
struct Status {
	imei: Option<[u8; 15]>,
	model: String,
	access_tech: u8,
	registration_status: u8,
	packet_service_attached: u8,
}

struct Scripts {
	init: Arc<Script>,
	dial: Arc<Script>,
	status: Arc<Script>,
}

struct CellularInner {
	state: SpinMutex<CellularState>,
	status: Arc<SpinMutex<Status>>,
	events: SpinMutex<Deque<CellularEvent, 8>>,
	bus: Pipe,
	cmux: Cmux,
	dlci1: Pipe,
	dlci2: Pipe,
	chat: Chat,
	ppp: Ppp,
	carrier: SpinMutex<Box<dyn Carrier>>,
	scripts: Scripts,
	poll_interval_register: Duration,
	poll_interval_roaming: Duration,
	worker: Worker,
	dispatch_work: WorkItem,
	timeout_work: WorkItem,
	weak_self: Weak<CellularInner>,
}

/// Connection supervisor handle.
pub struct Cellular {
	inner: Arc<CellularInner>,
}

fn script_completion(weak: &Weak<CellularInner>) -> ScriptCallback {
	let weak = weak.clone();

	Arc::new(move |result| {
		if let Some(inner) = weak.upgrade() {
			let event = if result == ScriptResult::Success {
				CellularEvent::ScriptSuccess
			} else {
				CellularEvent::ScriptFailed
			};

			inner.delegate_event(event);
		}
	})
}

fn ok_match() -> Match {
	Match::new("OK", "")
}

fn abortable(script: Script) -> Script {
	script
		.abort_match(Match::new("ERROR", ""))
		.abort_match(Match::new("BUSY", ""))
		.abort_match(Match::new("NO ANSWER", ""))
		.abort_match(Match::new("NO CARRIER", ""))
		.abort_match(Match::new("NO DIALTONE", ""))
}

fn build_init_script(status: &Arc<SpinMutex<Status>>, weak: &Weak<CellularInner>) -> Arc<Script> {
	let imei_status = status.clone();
	let imei_match = Match::new("", "").with_callback(Arc::new(move |argv| {
		if argv.len() != 2 || argv[1].len() != 15 {
			return;
		}

		let mut imei = [0u8; 15];
		for (slot, byte) in imei.iter_mut().zip(argv[1].bytes()) {
			if !byte.is_ascii_digit() {
				return;
			}

			*slot = byte - b'0';
		}

		imei_status.lock().imei = Some(imei);
	}));

	let model_status = status.clone();
	let cgmm_match = Match::new("", "").with_callback(Arc::new(move |argv| {
		if argv.len() != 2 {
			return;
		}

		model_status.lock().model = String::from(argv[1]);
	}));

	let warmup = || ScriptCmd::new("AT").timeout(Duration::from_millis(100));

	Arc::new(
		abortable(Script::new("init", Duration::from_secs(10)))
			.command(warmup())
			.command(warmup())
			.command(warmup())
			.command(warmup())
			.command(ScriptCmd::new("ATE0").response(ok_match()))
			.command(ScriptCmd::new("ATH").response(ok_match()))
			.command(ScriptCmd::new("AT+CMEE=1").response(ok_match()))
			.command(ScriptCmd::new("AT+CREG=0").response(ok_match()))
			.command(ScriptCmd::new("AT+CGSN").response(imei_match))
			.command(ScriptCmd::new("").response(ok_match()))
			.command(ScriptCmd::new("AT+CGMM").response(cgmm_match))
			.command(ScriptCmd::new("").response(ok_match()))
			.command(ScriptCmd::new("AT+CMUX=0,0,5,127,10,3,30,10,2").response(ok_match()))
			.on_complete(script_completion(weak)),
	)
}

fn build_dial_script(config: &CellularConfig, weak: &Weak<CellularInner>) -> Arc<Script> {
	let mut cgdcont = format!("AT+CGDCONT=1,\"IP\",\"{}\"", config.apn);

	if !config.username.is_empty() {
		cgdcont = format!("{cgdcont},\"{}\",\"{}\"", config.username, config.password);
	}

	Arc::new(
		abortable(Script::new("dial", Duration::from_secs(120)))
			.command(ScriptCmd::new(&cgdcont).response(ok_match()))
			.command(ScriptCmd::new("ATD*99#").response(Match::new("CONNECT ", "")))
			.on_complete(script_completion(weak)),
	)
}

fn build_status_script(status: &Arc<SpinMutex<Status>>, weak: &Weak<CellularInner>) -> Arc<Script> {
	let creg_status = status.clone();
	let creg_match = Match::new("+CREG: ", ",").with_callback(Arc::new(move |argv| {
		if argv.len() != 3 {
			return;
		}

		let mut status = creg_status.lock();
		status.access_tech = argv[1].parse().unwrap_or(0);
		status.registration_status = argv[2].parse().unwrap_or(0);
	}));

	let cgatt_status = status.clone();
	let cgatt_match = Match::new("+CGATT: ", ",").with_callback(Arc::new(move |argv| {
		if argv.len() != 2 {
			return;
		}

		cgatt_status.lock().packet_service_attached = argv[1].parse().unwrap_or(0);
	}));

	Arc::new(
		abortable(Script::new("net stat", Duration::from_secs(10)))
			.command(ScriptCmd::new("AT+CREG?").response(creg_match))
			.command(ScriptCmd::new("").response(ok_match()))
			.command(ScriptCmd::new("AT+CGATT?").response(cgatt_match))
			.command(ScriptCmd::new("").response(ok_match()))
			.on_complete(script_completion(weak)),
	)
}

impl Cellular {
	pub fn new(
		config: CellularConfig,
		bus: Pipe,
		ppp: Ppp,
		carrier: Box<dyn Carrier>,
		worker: &Worker,
	) -> Result<Self> {
		if config.apn.is_empty() {
			return Err(Error::Invalid);
		}

		let status = Arc::new(SpinMutex::new(Status::default()));

		let cmux = Cmux::new(CmuxConfig::default(), worker)?;

		let dlci1 = cmux.create_dlci(&DlciConfig {
			dlci_address: 1,
			receive_buf_size: 128,
		})?;

		let dlci2 = cmux.create_dlci(&DlciConfig {
			dlci_address: 2,
			receive_buf_size: 256,
		})?;

		let chat = Chat::new(ChatConfig::default(), worker)?;

		let inner = Arc::new_cyclic(|weak: &Weak<CellularInner>| {
			let dispatch = weak.clone();
			let timeout = weak.clone();

			CellularInner {
				state: SpinMutex::new(CellularState::Idle),
				status: status.clone(),
				events: SpinMutex::new(Deque::new()),
				bus,
				cmux,
				dlci1,
				dlci2,
				chat,
				ppp,
				carrier: SpinMutex::new(carrier),
				scripts: Scripts {
					init: build_init_script(&status, weak),
					dial: build_dial_script(&config, weak),
					status: build_status_script(&status, weak),
				},
				poll_interval_register: config.poll_interval_register,
				poll_interval_roaming: config.poll_interval_roaming,
				worker: worker.clone(),
				dispatch_work: WorkItem::new(move || {
					if let Some(inner) = dispatch.upgrade() {
						inner.dispatch_events();
					}
				}),
				timeout_work: WorkItem::new(move || {
					if let Some(inner) = timeout.upgrade() {
						inner.delegate_event(CellularEvent::Timeout);
					}
				}),
				weak_self: weak.clone(),
			}
		});

		let weak = Arc::downgrade(&inner);
		inner.cmux.set_callback(Box::new(move |event| {
			if let Some(inner) = weak.upgrade() {
				match event {
					CmuxEvent::Connected => inner.delegate_event(CellularEvent::CmuxConnected),
					CmuxEvent::Disconnected => {
						inner.delegate_event(CellularEvent::CmuxDisconnected);
					}
				}
			}
		}));

		Ok(Cellular { inner })
	}

	/// Requests connection establishment.
	pub fn resume(&self) {
		self.inner.delegate_event(CellularEvent::Resume);
	}

	/// Requests an orderly teardown back to idle.
	pub fn suspend(&self) {
		self.inner.delegate_event(CellularEvent::Suspend);
	}

	pub fn state(&self) -> CellularState {
		*self.inner.state.lock()
	}

	/// The 15 IMEI digits captured by the init script.
	pub fn imei(&self) -> Option<[u8; 15]> {
		self.inner.status.lock().imei
	}

	/// The model identification captured by the init script.
	pub fn model(&self) -> String {
		self.inner.status.lock().model.clone()
	}

	pub fn registered(&self) -> bool {
		self.inner.registered()
	}
}

impl CellularInner {
	fn registered(&self) -> bool {
		let status = self.status.lock();
		status.registration_status == 5 && status.packet_service_attached == 1
	}

	fn delegate_event(&self, event: CellularEvent) {
		{
			let mut events = self.events.lock();

			if events.push_back(event).is_err() {
				warn!("event queue full, dropping {}", event.as_str());
				return;
			}
		}

		self.worker.submit(&self.dispatch_work);
	}

	fn dispatch_events(&self) {
		loop {
			let event = self.events.lock().pop_front();

			let Some(event) = event else {
				break;
			};

			self.handle_event(event);
		}
	}

	fn handle_event(&self, event: CellularEvent) {
		let state = *self.state.lock();

		info!("event {}", event.as_str());

		match state {
			CellularState::Idle => {
				if event == CellularEvent::Resume {
					self.enter_state(CellularState::RunInitScript);
				}
			}

			CellularState::RunInitScript => {
				if event == CellularEvent::ScriptSuccess {
					self.enter_state(CellularState::ConnectCmux);
				}
			}

			CellularState::ConnectCmux => {
				if event == CellularEvent::CmuxConnected {
					self.enter_state(CellularState::OpenDlci1);
				}
			}

			CellularState::OpenDlci1 => {
				if event == CellularEvent::Dlci1Opened {
					self.enter_state(CellularState::OpenDlci2);
				}
			}

			CellularState::OpenDlci2 => {
				if event == CellularEvent::Dlci2Opened {
					self.enter_state(CellularState::RunDialScript);
				}
			}

			CellularState::RunDialScript => {
				if event == CellularEvent::ScriptSuccess {
					self.enter_state(CellularState::Register);
				}
			}

			CellularState::Register => match event {
				CellularEvent::ScriptSuccess if self.registered() => {
					self.enter_state(CellularState::Roaming);
				}
				CellularEvent::Timeout => {
					self.start_timer(self.poll_interval_register);

					if let Err(error) = self.chat.run(&self.scripts.status) {
						warn!("status poll failed: {error}");
					}
				}
				_ => {}
			},

			CellularState::Roaming => match event {
				CellularEvent::Suspend => self.enter_state(CellularState::CloseDlci2),
				CellularEvent::ScriptSuccess if !self.registered() => {
					self.enter_state(CellularState::RunDialScript);
				}
				CellularEvent::Timeout => {
					self.start_timer(self.poll_interval_roaming);

					if let Err(error) = self.chat.run(&self.scripts.status) {
						warn!("status poll failed: {error}");
					}
				}
				_ => {}
			},

			CellularState::CloseDlci2 => {
				if event == CellularEvent::Dlci2Closed {
					self.enter_state(CellularState::CloseDlci1);
				}
			}

			CellularState::CloseDlci1 => {
				if event == CellularEvent::Dlci1Closed {
					self.enter_state(CellularState::DisconnectCmux);
				}
			}

			CellularState::DisconnectCmux => {
				if event == CellularEvent::CmuxDisconnected {
					self.enter_state(CellularState::Idle);
				}
			}
		}

		let new_state = *self.state.lock();
		if new_state != state {
			info!("switch from {} to {}", state.as_str(), new_state.as_str());
		}
	}

	fn enter_state(&self, state: CellularState) {
		if let Err(error) = self.on_state_leave() {
			warn!("failed to leave state: {error}");
			return;
		}

		*self.state.lock() = state;

		if let Err(error) = self.on_state_enter() {
			warn!("failed to enter state: {error}");
		}
	}

	fn on_state_enter(&self) -> Result<()> {
		match *self.state.lock() {
			CellularState::RunInitScript => {
				self.bus.open()?;
				self.chat.attach(self.bus.clone());
				self.chat.run(&self.scripts.init)
			}

			CellularState::ConnectCmux => {
				self.cmux.attach(self.bus.clone())?;
				self.cmux.connect_async()
			}

			CellularState::OpenDlci1 => {
				self.attach_dlci_handler(
					&self.dlci1,
					CellularEvent::Dlci1Opened,
					CellularEvent::Dlci1Closed,
				);
				self.dlci1.open()
			}

			CellularState::OpenDlci2 => {
				self.attach_dlci_handler(
					&self.dlci2,
					CellularEvent::Dlci2Opened,
					CellularEvent::Dlci2Closed,
				);
				self.dlci2.open()
			}

			CellularState::RunDialScript => {
				self.chat.attach(self.dlci2.clone());
				self.chat.run(&self.scripts.dial)
			}

			CellularState::Register => {
				self.chat.attach(self.dlci1.clone());
				self.start_timer(self.poll_interval_register);
				self.chat.run(&self.scripts.status)
			}

			CellularState::Roaming => {
				self.chat.attach(self.dlci1.clone());
				self.chat.run(&self.scripts.status)?;
				self.start_timer(self.poll_interval_roaming);
				self.carrier.lock().carrier_on();
				Ok(())
			}

			CellularState::CloseDlci2 => {
				self.ppp.release();
				self.attach_dlci_handler(
					&self.dlci2,
					CellularEvent::Dlci2Opened,
					CellularEvent::Dlci2Closed,
				);
				self.dlci2.close()
			}

			CellularState::CloseDlci1 => {
				self.attach_dlci_handler(
					&self.dlci1,
					CellularEvent::Dlci1Opened,
					CellularEvent::Dlci1Closed,
				);
				self.dlci1.close()
			}

			CellularState::DisconnectCmux => self.cmux.disconnect_async(),

			CellularState::Idle => Ok(()),
		}
	}

	fn on_state_leave(&self) -> Result<()> {
		match *self.state.lock() {
			CellularState::RunInitScript => {
				self.chat.release();
				Ok(())
			}

			CellularState::OpenDlci1 => {
				self.dlci1.release();
				Ok(())
			}

			CellularState::OpenDlci2 => {
				self.dlci2.release();
				Ok(())
			}

			CellularState::RunDialScript => {
				self.chat.release();
				self.ppp.attach(self.dlci2.clone());
				self.ppp.start();
				Ok(())
			}

			CellularState::Register => {
				self.stop_timer();
				self.chat.release();
				Ok(())
			}

			CellularState::Roaming => {
				self.chat.release();
				self.stop_timer();
				self.carrier.lock().carrier_off();
				Ok(())
			}

			CellularState::CloseDlci2 => {
				self.dlci2.release();
				Ok(())
			}

			CellularState::CloseDlci1 => {
				self.dlci1.release();
				Ok(())
			}

			CellularState::DisconnectCmux => {
				self.cmux.release();
				self.bus.close()
			}

			CellularState::Idle | CellularState::ConnectCmux => Ok(()),
		}
	}

	fn attach_dlci_handler(&self, pipe: &Pipe, opened: CellularEvent, closed: CellularEvent) {
		let weak = self.weak_self.clone();

		pipe.attach(Box::new(move |event| {
			if let Some(inner) = weak.upgrade() {
				match event {
					PipeEvent::Opened => inner.delegate_event(opened),
					PipeEvent::Closed => inner.delegate_event(closed),
					PipeEvent::ReceiveReady => {}
				}
			}
		}));
	}

	fn start_timer(&self, interval: Duration) {
		self.worker.schedule(&self.timeout_work, interval);
	}

	fn stop_timer(&self) {
		self.worker.cancel(&self.timeout_work);
	}
}
