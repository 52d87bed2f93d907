//! 27.010 basic-option frame model and encoder.

use num_enum::TryFromPrimitive;

use crate::collections::RingBuffer;

/// Opening/closing flag octet.
pub(crate) const FLAG: u8 = 0xF9;

/// Extension bit in address and length fields.
pub(crate) const EA: u8 = 0x01;
/// Command/response bit in the address field.
pub(crate) const CR: u8 = 0x02;
/// Poll/final bit in the control field.
pub(crate) const PF: u8 = 0x10;

const FCS_POLYNOMIAL: u8 = 0xE0;
const FCS_INIT_VALUE: u8 = 0xFF;

/// Worst-case frame overhead: two flags, address, control, two length
/// octets and the FCS, plus one octet of slack.
pub(crate) const FRAME_SIZE_MAX: usize = 8;

/// Supported frame types, poll/final bit masked out.
#[derive(Debug, Clone, Copy, PartialEq, Eq, TryFromPrimitive)]
#[repr(u8)]
pub enum FrameType {
	Rr = 0x01,
	Ui = 0x03,
	Rnr = 0x05,
	Rej = 0x09,
	Dm = 0x0F,
	Sabm = 0x2F,
	Disc = 0x43,
	Ua = 0x63,
	Uih = 0xEF,
}

/// Control-channel command types carried in UIH frames on DLCI 0.
#[derive(Debug, Clone, Copy, PartialEq, Eq, TryFromPrimitive)]
#[repr(u8)]
pub(crate) enum CommandType {
	Nsc = 0x04,
	Test = 0x08,
	Psc = 0x10,
	Rls = 0x14,
	FcOff = 0x18,
	Pn = 0x20,
	Rpn = 0x24,
	FcOn = 0x28,
	Cld = 0x30,
	Snc = 0x34,
	Msc = 0x38,
}

/// A frame on its way to or from the wire.
pub struct Frame<'a> {
	pub dlci_address: u8,
	pub cr: bool,
	pub pf: bool,
	pub frame_type: FrameType,
	pub data: &'a [u8],
}

/// One step of the reversed CRC-8 used as 27.010 FCS.
pub(crate) fn fcs_update(fcs: u8, byte: u8) -> u8 {
	let mut fcs = fcs ^ byte;

	for _ in 0..8 {
		fcs = if fcs & 0x01 != 0 {
			(fcs >> 1) ^ FCS_POLYNOMIAL
		} else {
			fcs >> 1
		};
	}

	fcs
}

pub(crate) fn fcs_init() -> u8 {
	FCS_INIT_VALUE
}

pub(crate) fn fcs_final(fcs: u8) -> u8 {
	0xFF - fcs
}

/// Encodes `frame` into the shared transmit ring.
///
/// The frame is atomic unless `allow_partial` is set, in which case the
/// longest payload prefix that fits is framed. Returns the number of
/// payload bytes framed, or `None` when nothing could be encoded. For
/// UIH frames the FCS covers the header only; for every other type it
/// covers header plus payload.
pub(crate) fn encode_into(
	rb: &mut RingBuffer,
	frame: &Frame<'_>,
	allow_partial: bool,
) -> Option<usize> {
	let mut space = rb.space();

	if space < FRAME_SIZE_MAX {
		return None;
	}

	space -= FRAME_SIZE_MAX;

	if !allow_partial && space < frame.data.len() {
		return None;
	}

	let data_len = space.min(frame.data.len());

	if data_len == 0 && !frame.data.is_empty() {
		return None;
	}

	rb.put(&[FLAG]);

	let address = EA | (u8::from(frame.cr) << 1) | (frame.dlci_address << 2);
	let mut fcs = fcs_update(fcs_init(), address);
	rb.put(&[address]);

	let control = frame.frame_type as u8 | (u8::from(frame.pf) << 4);
	fcs = fcs_update(fcs, control);
	rb.put(&[control]);

	if data_len > 127 {
		// EA clear: the length field extends into a second octet
		// carrying bits 7..14.
		let low = ((data_len & 0x7F) << 1) as u8;
		fcs = fcs_update(fcs, low);
		rb.put(&[low]);

		let high = (data_len >> 7) as u8;
		fcs = fcs_update(fcs, high);
		rb.put(&[high]);
	} else {
		let length = EA | (data_len << 1) as u8;
		fcs = fcs_update(fcs, length);
		rb.put(&[length]);
	}

	if frame.frame_type != FrameType::Uih {
		for &byte in &frame.data[..data_len] {
			fcs = fcs_update(fcs, byte);
		}
	}

	rb.put(&frame.data[..data_len]);
	rb.put(&[fcs_final(fcs)]);
	rb.put(&[FLAG]);

	Some(data_len)
}
