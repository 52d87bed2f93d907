//! Scripted AT-command runner.
//!
//! A [`Script`] is a sequence of request/expected-response steps executed
//! over a pipe. Completed lines are matched against the active step's
//! responses, the script's abort patterns and the engine's unsolicited
//! matches, in that order; the first hit wins and its callback receives
//! the line split into arguments.

use alloc::boxed::Box;
use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::str;
use core::sync::atomic::{AtomicBool, Ordering};

use hermit_sync::SpinMutex;
use log::{debug, warn};
use smallvec::{SmallVec, smallvec};
use smoltcp::time::Duration;

use crate::error::{Error, Result};
use crate::pipe::{Pipe, PipeOps};
use crate::work::{WorkItem, Worker};

pub type MatchCallback = Arc<dyn Fn(&[&str]) + Send + Sync>;

/// A response pattern.
///
/// The pattern is compared against the prefix of a completed line; with
/// wildcards enabled the character `?` matches any byte. When separators
/// are given, the rest of the line is split into arguments: the callback
/// receives `argv[0]` holding the full matched line and `argv[1..]` the
/// fields.
#[derive(Clone)]
pub struct Match {
	pattern: Vec<u8>,
	separators: Vec<u8>,
	wildcards: bool,
	callback: Option<MatchCallback>,
}

impl Match {
	pub fn new(pattern: &str, separators: &str) -> Self {
		Match {
			pattern: pattern.as_bytes().to_vec(),
			separators: separators.as_bytes().to_vec(),
			wildcards: false,
			callback: None,
		}
	}

	pub fn with_callback(mut self, callback: MatchCallback) -> Self {
		self.callback = Some(callback);
		self
	}

	pub fn with_wildcards(mut self) -> Self {
		self.wildcards = true;
		self
	}

	fn matches(&self, line: &[u8]) -> bool {
		if line.len() < self.pattern.len() {
			return false;
		}

		self.pattern
			.iter()
			.zip(line)
			.all(|(&pattern, &byte)| pattern == byte || (self.wildcards && pattern == b'?'))
	}
}

/// One script step: an optional request, the responses that advance the
/// script, and an optional fixed delay for steps without responses.
#[derive(Clone)]
pub struct ScriptCmd {
	request: String,
	response_matches: Vec<Match>,
	timeout: Duration,
}

impl ScriptCmd {
	pub fn new(request: &str) -> Self {
		ScriptCmd {
			request: String::from(request),
			response_matches: Vec::new(),
			timeout: Duration::ZERO,
		}
	}

	pub fn response(mut self, response: Match) -> Self {
		self.response_matches.push(response);
		self
	}

	/// Delay before advancing, for steps with no expected response.
	pub fn timeout(mut self, timeout: Duration) -> Self {
		self.timeout = timeout;
		self
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScriptResult {
	Success,
	Abort,
	Timeout,
}

impl ScriptResult {
	/// Folds a completion into a `Result`, mapping aborted and timed out
	/// runs onto their error kinds.
	pub fn into_result(self) -> Result<()> {
		match self {
			ScriptResult::Success => Ok(()),
			ScriptResult::Abort => Err(Error::Aborted),
			ScriptResult::Timeout => Err(Error::Timeout),
		}
	}
}

pub type ScriptCallback = Arc<dyn Fn(ScriptResult) + Send + Sync>;

/// An immutable chat script, shared by reference with the engine.
pub struct Script {
	name: String,
	cmds: Vec<ScriptCmd>,
	abort_matches: Vec<Match>,
	callback: Option<ScriptCallback>,
	timeout: Duration,
}

impl Script {
	pub fn new(name: &str, timeout: Duration) -> Self {
		Script {
			name: String::from(name),
			cmds: Vec::new(),
			abort_matches: Vec::new(),
			callback: None,
			timeout,
		}
	}

	pub fn command(mut self, cmd: ScriptCmd) -> Self {
		self.cmds.push(cmd);
		self
	}

	pub fn abort_match(mut self, abort: Match) -> Self {
		self.abort_matches.push(abort);
		self
	}

	pub fn on_complete(mut self, callback: ScriptCallback) -> Self {
		self.callback = Some(callback);
		self
	}
}

pub struct ChatConfig {
	pub receive_buf_size: usize,
	/// Upper bound on arguments per matched line.
	pub argv_size: usize,
	/// Line terminator, transmitted after each request.
	pub delimiter: Vec<u8>,
	/// Bytes discarded before accumulation, typically `\n`.
	pub filter: Vec<u8>,
	/// Pacing delay for receive processing and transmit retries.
	pub process_timeout: Duration,
	pub unsol_matches: Vec<Match>,
}

impl Default for ChatConfig {
	fn default() -> Self {
		ChatConfig {
			receive_buf_size: 128,
			argv_size: 32,
			delimiter: alloc::vec![b'\r'],
			filter: alloc::vec![b'\n'],
			process_timeout: Duration::from_millis(2),
			unsol_matches: Vec::new(),
		}
	}
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum MatchTier {
	Response,
	Abort,
	Unsolicited,
}

struct ChatState {
	pipe: Option<Pipe>,
	receive_buf: Vec<u8>,
	script: Option<Arc<Script>>,
	pending: Option<Arc<Script>>,
	cmd_index: usize,
	send_request_pos: usize,
	send_delimiter_pos: usize,
}

struct ChatInner {
	cell: SpinMutex<ChatState>,
	running: AtomicBool,
	unsol_matches: Vec<Match>,
	delimiter: Vec<u8>,
	filter: Vec<u8>,
	process_timeout: Duration,
	receive_buf_size: usize,
	argv_size: usize,
	worker: Worker,
	process_work: WorkItem,
	run_work: WorkItem,
	abort_work: WorkItem,
	timeout_work: WorkItem,
	send_work: WorkItem,
	step_work: WorkItem,
}

/// Chat engine handle.
pub struct Chat {
	inner: Arc<ChatInner>,
}

impl Chat {
	pub fn new(config: ChatConfig, worker: &Worker) -> Result<Self> {
		if config.receive_buf_size == 0 || config.argv_size == 0 || config.delimiter.is_empty() {
			return Err(Error::Invalid);
		}

		let inner = Arc::new_cyclic(|weak: &alloc::sync::Weak<ChatInner>| {
			let process = weak.clone();
			let run = weak.clone();
			let abort = weak.clone();
			let timeout = weak.clone();
			let send = weak.clone();
			let step = weak.clone();

			ChatInner {
				cell: SpinMutex::new(ChatState {
					pipe: None,
					receive_buf: Vec::with_capacity(config.receive_buf_size),
					script: None,
					pending: None,
					cmd_index: 0,
					send_request_pos: 0,
					send_delimiter_pos: 0,
				}),
				running: AtomicBool::new(false),
				unsol_matches: config.unsol_matches,
				delimiter: config.delimiter,
				filter: config.filter,
				process_timeout: config.process_timeout,
				receive_buf_size: config.receive_buf_size,
				argv_size: config.argv_size,
				worker: worker.clone(),
				process_work: WorkItem::new(move || {
					if let Some(inner) = process.upgrade() {
						inner.process_received();
					}
				}),
				run_work: WorkItem::new(move || {
					if let Some(inner) = run.upgrade() {
						inner.script_start();
					}
				}),
				abort_work: WorkItem::new(move || {
					if let Some(inner) = abort.upgrade() {
						inner.script_stop(ScriptResult::Abort);
					}
				}),
				timeout_work: WorkItem::new(move || {
					if let Some(inner) = timeout.upgrade() {
						inner.script_stop(ScriptResult::Timeout);
					}
				}),
				send_work: WorkItem::new(move || {
					if let Some(inner) = send.upgrade() {
						inner.script_send();
					}
				}),
				step_work: WorkItem::new(move || {
					if let Some(inner) = step.upgrade() {
						inner.script_next(false);
					}
				}),
			}
		});

		Ok(Chat { inner })
	}

	/// Attaches the engine to `pipe` and begins draining it.
	pub fn attach(&self, pipe: Pipe) {
		let inner = &self.inner;

		{
			let mut cell = inner.cell.lock();
			cell.pipe = Some(pipe.clone());
			cell.receive_buf.clear();
		}

		let weak = Arc::downgrade(inner);
		pipe.attach(Box::new(move |_event| {
			if let Some(inner) = weak.upgrade() {
				inner.worker.schedule(&inner.process_work, inner.process_timeout);
			}
		}));

		inner.worker.submit(&inner.process_work);
	}

	/// Starts `script`. At most one script runs at a time.
	pub fn run(&self, script: &Arc<Script>) -> Result<()> {
		let inner = &self.inner;

		if script.cmds.is_empty() {
			return Err(Error::Invalid);
		}

		for cmd in &script.cmds {
			if cmd.request.is_empty()
				&& cmd.response_matches.is_empty()
				&& cmd.timeout == Duration::ZERO
			{
				return Err(Error::Invalid);
			}
		}

		if inner.cell.lock().pipe.is_none() {
			return Err(Error::NotAttached);
		}

		if inner.running.swap(true, Ordering::AcqRel) {
			return Err(Error::Busy);
		}

		inner.cell.lock().pending = Some(script.clone());
		inner.worker.submit(&inner.run_work);
		Ok(())
	}

	/// Requests termination of the running script; the completion
	/// callback fires with [`ScriptResult::Abort`] on the next worker
	/// dispatch.
	pub fn abort(&self) {
		self.inner.worker.submit(&self.inner.abort_work);
	}

	/// Detaches from the pipe and cancels outstanding work.
	pub fn release(&self) {
		let inner = &self.inner;

		let pipe = inner.cell.lock().pipe.take();
		if let Some(pipe) = pipe {
			pipe.release();
		}

		inner.worker.cancel(&inner.run_work);
		inner.worker.cancel(&inner.abort_work);
		inner.worker.cancel(&inner.process_work);
		inner.worker.cancel(&inner.send_work);
		inner.worker.cancel(&inner.step_work);
	}
}

impl ChatInner {
	fn script_start(&self) {
		{
			let mut cell = self.cell.lock();

			let Some(script) = cell.pending.take() else {
				return;
			};

			debug!("{}", script.name);
			cell.script = Some(script);
		}

		self.script_next(true);

		let timeout = self.cell.lock().script.as_ref().map(|script| script.timeout);
		if let Some(timeout) = timeout {
			self.worker.schedule(&self.timeout_work, timeout);
		}
	}

	fn script_stop(&self, result: ScriptResult) {
		let (script, callback) = {
			let mut cell = self.cell.lock();

			let Some(script) = cell.script.take() else {
				return;
			};

			self.running.store(false, Ordering::Release);
			self.worker.cancel(&self.timeout_work);
			self.worker.cancel(&self.send_work);
			self.worker.cancel(&self.step_work);

			let callback = script.callback.clone();
			(script, callback)
		};

		match result {
			ScriptResult::Success => debug!("{}: complete", script.name),
			ScriptResult::Abort => warn!("{}: aborted", script.name),
			ScriptResult::Timeout => warn!("{}: timed out", script.name),
		}

		if let Some(callback) = callback {
			callback(result);
		}
	}

	fn script_next(&self, initial: bool) {
		enum Action {
			Idle,
			Send,
			Delay(Duration),
			Stop,
		}

		let action = {
			let mut cell = self.cell.lock();

			let Some(script) = cell.script.clone() else {
				return;
			};

			if initial {
				cell.cmd_index = 0;
			} else {
				cell.cmd_index += 1;
			}

			if cell.cmd_index == script.cmds.len() {
				Action::Stop
			} else {
				debug!("{}: step {}", script.name, cell.cmd_index);
				let cmd = &script.cmds[cell.cmd_index];

				if !cmd.request.is_empty() {
					cell.send_request_pos = 0;
					cell.send_delimiter_pos = 0;
					Action::Send
				} else if cmd.response_matches.is_empty() {
					// Pure delay step.
					Action::Delay(cmd.timeout)
				} else {
					Action::Idle
				}
			}
		};

		match action {
			Action::Stop => self.script_stop(ScriptResult::Success),
			Action::Send => self.worker.submit(&self.send_work),
			Action::Delay(delay) => self.worker.schedule(&self.step_work, delay),
			Action::Idle => {}
		}
	}

	fn script_send(&self) {
		let (pipe, script, index) = {
			let cell = self.cell.lock();

			match (&cell.pipe, &cell.script) {
				(Some(pipe), Some(script)) => (pipe.clone(), script.clone(), cell.cmd_index),
				_ => return,
			}
		};

		let request = script.cmds[index].request.as_bytes();

		// Request bytes, then the delimiter, in as-many-as-accepted
		// fragments.
		let mut pos = self.cell.lock().send_request_pos;
		if pos < request.len() {
			match pipe.transmit(&request[pos..]) {
				Ok(count) => pos += count,
				Err(_) => {
					self.worker.schedule(&self.send_work, self.process_timeout);
					return;
				}
			}

			self.cell.lock().send_request_pos = pos;

			if pos < request.len() {
				self.worker.schedule(&self.send_work, self.process_timeout);
				return;
			}
		}

		let mut pos = self.cell.lock().send_delimiter_pos;
		if pos < self.delimiter.len() {
			match pipe.transmit(&self.delimiter[pos..]) {
				Ok(count) => pos += count,
				Err(_) => {
					self.worker.schedule(&self.send_work, self.process_timeout);
					return;
				}
			}

			self.cell.lock().send_delimiter_pos = pos;

			if pos < self.delimiter.len() {
				self.worker.schedule(&self.send_work, self.process_timeout);
				return;
			}
		}

		let cmd = &script.cmds[index];
		if cmd.response_matches.is_empty() {
			if cmd.timeout == Duration::ZERO {
				self.script_next(false);
			} else {
				self.worker.schedule(&self.step_work, cmd.timeout);
			}
		}
	}

	fn process_received(&self) {
		let Some(pipe) = self.cell.lock().pipe.clone() else {
			return;
		};

		let mut buf = [0u8; 32];
		let count = match pipe.receive(&mut buf) {
			Ok(count) => count,
			Err(_) => return,
		};

		if count == 0 {
			return;
		}

		for &byte in &buf[..count] {
			self.process_byte(byte);
		}

		if count == buf.len() {
			self.worker.submit(&self.process_work);
		}
	}

	fn process_byte(&self, byte: u8) {
		if self.filter.contains(&byte) {
			return;
		}

		let completed = {
			let mut cell = self.cell.lock();

			if cell.receive_buf.len() == self.receive_buf_size {
				warn!("receive buffer overrun");
				cell.receive_buf.clear();
				return;
			}

			cell.receive_buf.push(byte);

			if cell.receive_buf.ends_with(&self.delimiter) {
				let line_len = cell.receive_buf.len() - self.delimiter.len();
				let line = cell.receive_buf[..line_len].to_vec();
				cell.receive_buf.clear();

				// Filter out empty lines.
				if line.is_empty() { None } else { Some(line) }
			} else {
				None
			}
		};

		if let Some(line) = completed {
			self.handle_line(&line);
		}
	}

	fn handle_line(&self, line: &[u8]) {
		let Ok(text) = str::from_utf8(line) else {
			warn!("discarding non-utf8 line");
			return;
		};

		debug!("\"{text}\"");

		let matched = {
			let cell = self.cell.lock();
			let script = cell.script.clone();
			let mut found: Option<(Match, MatchTier)> = None;

			if let Some(script) = &script {
				if let Some(cmd) = script.cmds.get(cell.cmd_index) {
					found = cmd
						.response_matches
						.iter()
						.find(|candidate| candidate.matches(line))
						.cloned()
						.map(|candidate| (candidate, MatchTier::Response));
				}

				if found.is_none() {
					found = script
						.abort_matches
						.iter()
						.find(|candidate| candidate.matches(line))
						.cloned()
						.map(|candidate| (candidate, MatchTier::Abort));
				}
			}

			if found.is_none() {
				found = self
					.unsol_matches
					.iter()
					.find(|candidate| candidate.matches(line))
					.cloned()
					.map(|candidate| (candidate, MatchTier::Unsolicited));
			}

			found
		};

		let Some((matched, tier)) = matched else {
			return;
		};

		let mut argv: SmallVec<[&str; 16]> = smallvec![text];
		let Some(remainder) = text.get(matched.pattern.len()..) else {
			return;
		};

		if matched.separators.is_empty() {
			if !remainder.is_empty() {
				argv.push(remainder);
			}
		} else {
			let mut fields: Vec<&str> = remainder
				.split(|c: char| c.is_ascii() && matched.separators.contains(&(c as u8)))
				.collect();

			if fields.last() == Some(&"") {
				fields.pop();
			}

			argv.extend(fields);
		}

		if argv.len() > self.argv_size {
			warn!("argv overrun, truncating arguments");
			argv.truncate(self.argv_size);
		}

		if let Some(callback) = &matched.callback {
			callback(&argv);
		}

		match tier {
			MatchTier::Response => self.script_next(false),
			MatchTier::Abort => self.script_stop(ScriptResult::Abort),
			MatchTier::Unsolicited => {}
		}
	}
}
