//! RFC 1035 wire format: building a standard recursion-desired A/IN query, and
//! parsing the handful of response shapes the resolver cares about (a positive A
//! answer, NXDOMAIN, or "nothing usable here").
//!
//! Every read is bounds-checked against the packet slice; a malformed or truncated
//! packet surfaces as `None` rather than a panic, so a hostile or buggy upstream can
//! never take the resolver down.

use std::net::Ipv4Addr;

use bilge::prelude::*;

/// Longest QNAME this codec will emit or accept, matching the public API's limit.
pub const MAX_NAME_LEN: usize = 255;
/// RFC 1035 caps each label at 63 bytes (the top two bits of the length octet are
/// reserved for compression pointers).
pub const MAX_LABEL_LEN: usize = 63;

const TY_A: u16 = 1;
const CLASS_IN: u16 = 1;
const HEADER_LEN: usize = 12;

#[bitsize(4)]
#[derive(FromBits, Clone, Copy, PartialEq, Eq, Debug)]
enum Opcode {
	/// a standard query
	Query = 0,
	/// an inverse query
	IQuery = 1,
	/// a server status request
	Status = 2,
	#[fallback]
	Reserved,
}

#[bitsize(4)]
#[derive(FromBits, Clone, Copy, PartialEq, Eq, Debug)]
enum Rcode {
	Ok = 0,
	FormatErr = 1,
	ServerFailure = 2,
	/// Meaningful only for responses: the queried name does not exist.
	NameErr = 3,
	NotImplemented = 4,
	Refused = 5,
	#[fallback]
	Reserved,
}

#[bitsize(16)]
#[derive(FromBits, Clone, Copy)]
struct Flags {
	rcode: Rcode,
	z: u3,
	ra: bool,
	rd: bool,
	tc: bool,
	aa: bool,
	opcode: Opcode,
	qr: bool,
}

/// The three shapes a parsed response can take.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Answer {
	/// A positive A-record answer with its advertised TTL, in seconds.
	Address { ip: Ipv4Addr, ttl: u32 },
	/// RCODE 3: the name does not exist. Callers cache this for a fixed TTL.
	NxDomain,
	/// Structurally valid, but no address fell out: ANCOUNT was 0, or every
	/// answer RR was something other than an A record (e.g. a bare CNAME).
	Empty,
}

/// A fully decoded response, still addressed by transaction ID and the echoed
/// question name (the dispatcher matches both against the issuing query slot).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
	pub tid: u16,
	pub name: String,
	pub answer: Answer,
}

/// Encode a standard, recursion-desired, single-question A/IN query.
///
/// Returns `None` if `name` cannot be put on the wire: a label over 63 bytes, or
/// an encoded QNAME over 255 bytes. The caller is expected to have already
/// rejected overlong names, so this is a second line of defence, not the primary
/// check.
pub fn encode_query(tid: u16, name: &str) -> Option<Vec<u8>> {
	let mut buf = Vec::with_capacity(HEADER_LEN + name.len() + 6);

	buf.extend_from_slice(&tid.to_be_bytes());

	let flags: u16 = Flags::new(Rcode::Ok, u3::new(0), false, true, false, false, Opcode::Query, false).into();
	buf.extend_from_slice(&flags.to_be_bytes());

	buf.extend_from_slice(&1u16.to_be_bytes()); // qdcount
	buf.extend_from_slice(&0u16.to_be_bytes()); // ancount
	buf.extend_from_slice(&0u16.to_be_bytes()); // nscount
	buf.extend_from_slice(&0u16.to_be_bytes()); // arcount

	let qname_start = buf.len();

	for label in name.split('.') {
		if label.is_empty() {
			// Tolerate a trailing root dot ("example.com.") and nothing else.
			continue;
		}

		if label.len() > MAX_LABEL_LEN {
			return None;
		}

		buf.push(label.len() as u8);
		buf.extend(label.bytes().map(|b| b.to_ascii_lowercase()));
	}

	buf.push(0); // root label

	if buf.len() - qname_start > MAX_NAME_LEN + 1 {
		return None;
	}

	buf.extend_from_slice(&TY_A.to_be_bytes());
	buf.extend_from_slice(&CLASS_IN.to_be_bytes());

	Some(buf)
}

struct Reader<'a> {
	buf: &'a [u8],
	pos: usize,
}

impl<'a> Reader<'a> {
	fn new(buf: &'a [u8]) -> Self {
		Self { buf, pos: 0 }
	}

	fn u8(&mut self) -> Option<u8> {
		let b = *self.buf.get(self.pos)?;
		self.pos += 1;
		Some(b)
	}

	fn u16(&mut self) -> Option<u16> {
		let s: [u8; 2] = self.buf.get(self.pos..self.pos + 2)?.try_into().ok()?;
		self.pos += 2;
		Some(u16::from_be_bytes(s))
	}

	fn u32(&mut self) -> Option<u32> {
		let s: [u8; 4] = self.buf.get(self.pos..self.pos + 4)?.try_into().ok()?;
		self.pos += 4;
		Some(u32::from_be_bytes(s))
	}

	fn take(&mut self, n: usize) -> Option<&'a [u8]> {
		let s = self.buf.get(self.pos..self.pos + n)?;
		self.pos += n;
		Some(s)
	}

	fn skip(&mut self, n: usize) -> Option<()> {
		if self.pos + n > self.buf.len() {
			return None;
		}
		self.pos += n;
		Some(())
	}
}

/// Reads a (possibly compressed) domain name, lowercasing it in the process.
/// Returns `None` on a truncated or malformed name.
fn read_name(r: &mut Reader) -> Option<String> {
	let mut name = String::new();

	loop {
		let len = r.u8()?;

		match len >> 6 {
			// The octet is a length: read that many label bytes.
			0b00 => {
				if len == 0 {
					break;
				}

				let label = r.take(len as usize)?;

				if !name.is_empty() {
					name.push('.');
				}

				name.extend(label.iter().map(|b| b.to_ascii_lowercase() as char));
			}
			// The octet begins a compression pointer: consume its second byte and stop.
			// Answer names in this resolver's single-question replies never need to be
			// followed, only skipped.
			0b11 => {
				r.u8()?;
				break;
			}
			_ => return None,
		}
	}

	Some(name)
}

/// Skip a (possibly compressed) domain name without materialising it.
fn skip_name(r: &mut Reader) -> Option<()> {
	loop {
		let len = r.u8()?;

		match len >> 6 {
			0b00 => {
				if len == 0 {
					break;
				}
				r.skip(len as usize)?;
			}
			0b11 => {
				r.u8()?;
				break;
			}
			_ => return None,
		}
	}

	Some(())
}

/// Parse a response packet for a single-question A/IN query.
///
/// Returns `None` if the packet is not structurally valid for that contract: the
/// QR bit is clear, QDCOUNT isn't 1, the question's QTYPE isn't A, or any field
/// runs past the end of the buffer. Every other shape — NXDOMAIN, an empty answer
/// section, a CNAME chain, or a positive A answer — decodes to a `Response`.
pub fn decode_response(buf: &[u8]) -> Option<Response> {
	let mut r = Reader::new(buf);

	let tid = r.u16()?;
	let flags = Flags::from(r.u16()?);

	if !flags.qr() {
		log::debug!("Dropping packet 0x{tid:x}: QR bit not set (not a response)");
		return None;
	}

	let qdcount = r.u16()?;
	let ancount = r.u16()?;
	let _nscount = r.u16()?;
	let _arcount = r.u16()?;

	if qdcount != 1 {
		log::debug!("Dropping packet 0x{tid:x}: QDCOUNT {qdcount} != 1");
		return None;
	}

	let name = read_name(&mut r)?;
	let qtype = r.u16()?;
	let _qclass = r.u16()?;

	if qtype != TY_A {
		log::debug!("Dropping packet 0x{tid:x}: question QTYPE {qtype} is not A");
		return None;
	}

	if flags.rcode() == Rcode::NameErr {
		// NXDOMAIN is authoritative regardless of whatever garbage (if any) follows
		// in the answer section.
		return Some(Response { tid, name, answer: Answer::NxDomain });
	}

	if ancount == 0 {
		return Some(Response { tid, name, answer: Answer::Empty });
	}

	for _ in 0..ancount {
		skip_name(&mut r)?;

		let rtype = r.u16()?;
		let _rclass = r.u16()?;
		let ttl = r.u32()?;
		let rdlength = r.u16()?;

		if rtype == TY_A {
			if rdlength != 4 {
				log::debug!("Dropping packet 0x{tid:x}: A record with RDLENGTH {rdlength} != 4");
				return None;
			}

			let octets = r.take(4)?;
			let ip = Ipv4Addr::new(octets[0], octets[1], octets[2], octets[3]);

			return Some(Response { tid, name, answer: Answer::Address { ip, ttl } });
		}

		// CNAME or anything else we don't answer to: skip the RDATA and keep
		// scanning the remaining answer RRs for an A record.
		r.skip(rdlength as usize)?;
	}

	Some(Response { tid, name, answer: Answer::Empty })
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn encodes_and_lowercases_name() {
		let pkt = encode_query(0x1234, "Mail.Google.com").unwrap();

		assert_eq!(&pkt[0..2], &0x1234u16.to_be_bytes());

		let qname = &pkt[HEADER_LEN..];
		assert_eq!(&qname[0..5], b"\x04mail");
	}

	#[test]
	fn rejects_overlong_label() {
		let label = "a".repeat(64);
		assert!(encode_query(1, &label).is_none());
	}

	#[test]
	fn round_trips_a_record() {
		let query = encode_query(0xbeef, "mail.google.com").unwrap();

		let mut reply = query.clone();
		// Flip QR and set ANCOUNT=1.
		reply[2] |= 0b1000_0000;
		reply[7] = 1;
		// Append an answer RR pointing back at the question (pointer 0xC00C).
		reply.extend_from_slice(&[0xC0, 0x0C]);
		reply.extend_from_slice(&1u16.to_be_bytes()); // TYPE A
		reply.extend_from_slice(&1u16.to_be_bytes()); // CLASS IN
		reply.extend_from_slice(&300u32.to_be_bytes()); // TTL
		reply.extend_from_slice(&4u16.to_be_bytes()); // RDLENGTH
		reply.extend_from_slice(&[157, 240, 22, 35]);

		let resp = decode_response(&reply).unwrap();

		assert_eq!(resp.tid, 0xbeef);
		assert_eq!(resp.name, "mail.google.com");
		assert_eq!(resp.answer, Answer::Address { ip: Ipv4Addr::new(157, 240, 22, 35), ttl: 300 });
	}

	#[test]
	fn nxdomain_ignores_ancount() {
		let query = encode_query(7, "nope.example").unwrap();

		let mut reply = query.clone();
		reply[2] |= 0b1000_0000; // QR
		reply[3] |= 0b0000_0011; // RCODE = 3 (NameErr), low nibble of second flags byte

		let resp = decode_response(&reply).unwrap();
		assert_eq!(resp.answer, Answer::NxDomain);
	}

	#[test]
	fn truncated_packet_is_rejected() {
		assert!(decode_response(&[0, 1]).is_none());
	}
}
