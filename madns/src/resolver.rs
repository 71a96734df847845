//! The public dispatcher: ties the wire codec, query table, server table and
//! cache together behind a handful of non-blocking operations meant to be
//! driven from an external event loop.

use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};

use madns_utils::error::{Ext as _, ExtOpaque as _};

use crate::cache::{self, Cache};
use crate::config;
use crate::diag::{CacheRow, DumpOpts, Event, NullSink, QueryRow, ServerRow, Sink, Summary};
use crate::queries::{next_tid, QueryTable};
use crate::servers::ServerTable;
use crate::socket::Socket;
use crate::wire;

const DNS_PORT: u16 = 53;
const DEFAULT_QUERY_TIME: i64 = 10;
const DEFAULT_SERVER_REQS: u32 = 20;

/// Re-exported so callers matching on a `lookup()` result don't need to name
/// the `cache` module directly.
pub use crate::cache::Lookup;

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Outcome {
	Address(Ipv4Addr),
	NxDomain,
	TimedOut,
}

/// A multi-server DNS resolver. `C` is an opaque context the caller attaches
/// to each request and gets back, unmodified, from `response()` or `cancel()`.
pub struct Resolver<C: PartialEq> {
	servers: ServerTable,
	queries: QueryTable<C>,
	cache: Cache,
	socket: Socket,
	query_time: i64,
	sink: Box<dyn Sink>,
}

impl<C: PartialEq> Resolver<C> {
	/// Build a resolver from the `nameserver` lines in `resolv_conf`.
	///
	/// `query_time` is the per-query timeout in seconds (0 defaults to 10);
	/// `server_reqs` is the in-flight cap per upstream server (0 defaults to
	/// 20, and is otherwise clamped so that `nservers * server_reqs` fits the
	/// `[2, 32767]` slot budget). Fails (returning `None`, with the reason
	/// logged) if no usable nameserver is found, the resulting slot count
	/// falls outside that range, or the UDP socket can't be bound.
	pub fn create(resolv_conf: &Path, query_time: i64, server_reqs: u32) -> Option<Self> {
		let query_time = if query_time <= 0 { DEFAULT_QUERY_TIME } else { query_time };

		let ips = config::parse_nameservers(resolv_conf).ok_or(|e| log::error!("reading {}: {e}", resolv_conf.display()))?;

		let ips = Some(ips)
			.filter(|ips| !ips.is_empty())
			.some_or(|| log::error!("{}: no usable nameserver lines", resolv_conf.display()))?;

		let nservers = ips.len() as u32;
		let server_reqs = if server_reqs == 0 { DEFAULT_SERVER_REQS } else { server_reqs };
		let server_reqs = server_reqs.min(32767 / nservers);
		let qsize = nservers * server_reqs;

		if !(2..=32767).contains(&qsize) {
			log::error!("qsize {qsize} ({nservers} servers x {server_reqs} reqs) is out of range [2, 32767]");
			return None;
		}

		let socket = Socket::bind_ephemeral().ok_or(|e| log::error!("binding UDP socket: {e}"))?;

		Some(Self {
			servers: ServerTable::new(ips, server_reqs),
			queries: QueryTable::new(qsize as usize),
			cache: Cache::new(),
			socket,
			query_time,
			sink: Box::new(NullSink),
		})
	}

	/// Replace the diagnostic sink (a no-op sink by default).
	pub fn set_sink<S: Sink + 'static>(&mut self, sink: S) {
		self.sink = Box::new(sink);
	}

	#[cfg(unix)]
	pub fn fileno(&self) -> std::os::unix::io::RawFd {
		self.socket.fileno()
	}

	#[cfg(windows)]
	pub fn fileno(&self) -> std::os::windows::io::RawSocket {
		self.socket.fileno()
	}

	/// Free query slots right now.
	pub fn ready(&self) -> usize {
		self.queries.free_count()
	}

	/// Seconds until the earliest-expiring active query times out, or
	/// `query_time + 1` if nothing is outstanding. May be zero or negative if
	/// a reply is already overdue and just hasn't been reaped yet.
	pub fn expires(&self) -> i64 {
		match self.queries.earliest_active() {
			Some(idx) => self.queries.get(idx).expires - unix_now(),
			None => self.query_time + 1,
		}
	}

	/// Consult the cache without issuing a query. A dotted-quad literal is
	/// recognised and returned directly; names over 255 bytes are reported the
	/// same as a cached NXDOMAIN, since the public API never accepts them.
	pub fn lookup(&self, name: &str) -> Lookup {
		if let Ok(ip) = name.parse::<Ipv4Addr>() {
			return Lookup::Address(ip);
		}

		if name.len() > wire::MAX_NAME_LEN {
			return Lookup::NxDomain;
		}

		self.cache.lookup(name, unix_now())
	}

	/// Issue a query for `name`, attaching `ctx` to the slot. Returns the wire
	/// transaction ID, or `None` if the table is full or `name` is too long.
	///
	/// If no server currently has spare capacity, or the name can't be put on
	/// the wire (a single label over 63 bytes), the slot is still allocated
	/// but left unsent (`expires` stays at its sentinel `0`); the next
	/// `response()` call reaps it as a timeout rather than failing `request`
	/// outright — mirroring how a mid-flight server exhaustion is handled.
	pub fn request(&mut self, name: &str, ctx: C) -> Option<u16> {
		if name.len() > wire::MAX_NAME_LEN {
			return None;
		}

		let idx = self.queries.alloc()?;
		let tid = next_tid(&mut rand::thread_rng(), self.queries.qsize() as u16, idx as u16);

		let slot = self.queries.get_mut(idx);
		slot.ctx = Some(ctx);
		slot.name = name.to_string();
		slot.tid = tid;
		slot.server = None;
		slot.expires = 0;
		slot.started = std::time::Instant::now();

		self.try_send(idx);

		Some(tid)
	}

	/// Select a server and put the query in `idx` on the wire. Leaves
	/// `expires == 0` (the slot's reap-as-timeout sentinel) on any failure.
	fn try_send(&mut self, idx: usize) {
		let name = self.queries.get(idx).name.clone();
		let tid = self.queries.get(idx).tid;

		let Some(server) = self.servers.select(None) else {
			self.sink.event(Event::Dropped { name: &name, reason: "no server with spare capacity" });
			return;
		};

		let Some(packet) = wire::encode_query(tid, &name) else {
			self.servers.cancel_selection(server);
			self.sink.event(Event::Dropped { name: &name, reason: "name cannot be encoded" });
			return;
		};

		let addr = SocketAddr::V4(SocketAddrV4::new(self.servers.ip(server), DNS_PORT));

		if let Err(e) = self.socket.send_to(&packet, addr) {
			self.servers.cancel_selection(server);
			log::warn!("sending query for {name} to {addr}: {e}");
			return;
		}

		let slot = self.queries.get_mut(idx);
		slot.server = Some(server);
		slot.expires = unix_now() + self.query_time;
		slot.started = std::time::Instant::now();

		self.sink.event(Event::Sent { name: &name, server: self.servers.ip(server), tid });
	}

	/// Drain pending datagrams, returning the first completed query's context
	/// and outcome. Unmatched, spoofed, or malformed datagrams are discarded
	/// along the way. Once the socket has nothing more to offer, falls back to
	/// reaping the earliest-expiring active query if it is overdue.
	///
	/// Call this repeatedly after the caller's readiness primitive signals the
	/// descriptor from [`Self::fileno`] until it returns `None`.
	pub fn response(&mut self) -> Option<(C, Outcome)> {
		let mut buf = [0u8; 576];

		loop {
			let (n, from) = match self.socket.recv(&mut buf) {
				Ok(Some(v)) => v,
				Ok(None) => break,
				Err(e) => {
					log::warn!("recv: {e}");
					break;
				}
			};

			let Some(parsed) = wire::decode_response(&buf[..n]) else {
				continue;
			};

			let idx = parsed.tid as usize % self.queries.qsize();

			let matches = {
				let slot = self.queries.get(idx);
				slot.ctx.is_some() && slot.tid == parsed.tid && slot.server.is_some()
			};

			if !matches {
				continue;
			}

			let server_idx = self.queries.get(idx).server.expect("checked above");

			let SocketAddr::V4(from_v4) = from else { continue };
			if *from_v4.ip() != self.servers.ip(server_idx) {
				log::debug!("dropping reply for tid {:#06x}: source {from} != server {}", parsed.tid, self.servers.ip(server_idx));
				continue;
			}

			let name = self.queries.get(idx).name.clone();
			let name_matches = parsed.name.eq_ignore_ascii_case(&name);

			let outcome = match &parsed.answer {
				wire::Answer::Address { ip, ttl } if name_matches => {
					self.cache.insert(&name, cache::Value::Address(*ip), *ttl as i64, unix_now());
					Outcome::Address(*ip)
				}
				wire::Answer::NxDomain if name_matches => {
					self.cache.insert(&name, cache::Value::NxDomain, cache::NXDOMAIN_TTL, unix_now());
					Outcome::NxDomain
				}
				// ANCOUNT == 0, a CNAME with no A record following, or a QNAME
				// that doesn't echo the question: nothing usable. Leave the
				// slot armed for a later packet or a timeout.
				_ => continue,
			};

			let elapsed = self.queries.get(idx).started.elapsed().as_secs_f64();
			self.servers.release(server_idx, elapsed);
			let server_ip = self.servers.ip(server_idx);

			let slot = self.queries.release(idx);

			self.sink.event(match outcome {
				Outcome::Address(ip) => Event::Resolved { name: &name, server: server_ip, ip },
				Outcome::NxDomain => Event::NxDomain { name: &name, server: server_ip },
				Outcome::TimedOut => unreachable!("not produced by this branch"),
			});

			return Some((slot.ctx.expect("matched slot always has ctx"), outcome));
		}

		let idx = self.queries.earliest_active()?;

		if self.queries.get(idx).expires > unix_now() {
			return None;
		}

		let name = self.queries.get(idx).name.clone();
		let started = self.queries.get(idx).started;

		if let Some(server_idx) = self.queries.get(idx).server {
			self.servers.release(server_idx, started.elapsed().as_secs_f64());
			self.sink.event(Event::TimedOut { name: &name, server: self.servers.ip(server_idx) });
		} else {
			self.sink.event(Event::Dropped { name: &name, reason: "never sent before timing out" });
		}

		let slot = self.queries.release(idx);
		Some((slot.ctx.expect("active slot always has ctx"), Outcome::TimedOut))
	}

	/// Cancel the first active query whose context equals `ctx`. Its TID is
	/// returned and invalidated; a late reply for it will match no slot.
	pub fn cancel(&mut self, ctx: &C) -> Option<u16> {
		let idx = self.queries.find_active(|c| c == ctx)?;

		if let Some(server_idx) = self.queries.get(idx).server {
			let elapsed = self.queries.get(idx).started.elapsed().as_secs_f64();
			self.servers.release(server_idx, elapsed);
		}

		Some(self.queries.release(idx).tid)
	}

	/// Render the requested diagnostic sections as plain text.
	pub fn dump(&self, opts: DumpOpts) -> String {
		let summary = Summary {
			servers: self.servers.len(),
			qsize: self.queries.qsize(),
			in_flight: self.queries.qsize() - self.queries.free_count(),
			cache_count: self.cache.count(),
			cache_limit: self.cache.limit(),
		};

		let server_rows: Vec<_> =
			self.servers.iter().map(|s| ServerRow { ip: s.ip, in_flight: s.in_flight, latency: s.latency }).collect();

		let now = unix_now();

		let query_rows: Vec<_> = self
			.queries
			.active_indices()
			.map(|idx| {
				let slot = self.queries.get(idx);
				QueryRow {
					name: slot.name.clone(),
					tid: slot.tid,
					server: slot.server.map(|s| self.servers.ip(s)),
					age_secs: slot.started.elapsed().as_secs_f64(),
				}
			})
			.collect();

		let cache_rows: Vec<_> = self
			.cache
			.entries()
			.map(|(name, value, expires)| CacheRow {
				name: name.to_string(),
				value: match value {
					cache::Value::Address(ip) => ip.to_string(),
					cache::Value::NxDomain => "NXDOMAIN".to_string(),
				},
				expires_in: expires - now,
			})
			.collect();

		crate::diag::render(opts, &summary, &server_rows, &query_rows, &cache_rows)
	}
}

impl<C: PartialEq> Drop for Resolver<C> {
	fn drop(&mut self) {
		log::debug!("destroying resolver: {} active, {} cached", self.queries.qsize() - self.queries.free_count(), self.cache.count());
	}
}

fn unix_now() -> i64 {
	SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_secs() as i64).unwrap_or(0)
}

#[cfg(test)]
mod tests {
	use super::*;
	use std::io::Write as _;

	fn write_resolv_conf(servers: &[&str]) -> std::path::PathBuf {
		use std::sync::atomic::{AtomicUsize, Ordering};
		static COUNTER: AtomicUsize = AtomicUsize::new(0);

		let n = COUNTER.fetch_add(1, Ordering::Relaxed);
		let dir = std::env::temp_dir().join(format!("madns-resolver-test-{}-{n}", std::process::id()));
		std::fs::create_dir_all(&dir).unwrap();
		let path = dir.join("resolv.conf");
		let mut f = std::fs::File::create(&path).unwrap();
		for s in servers {
			writeln!(f, "nameserver {s}").unwrap();
		}
		path
	}

	#[test]
	fn create_fails_without_nameservers() {
		let path = write_resolv_conf(&[]);
		assert!(Resolver::<u32>::create(&path, 5, 4).is_none());
	}

	#[test]
	fn create_succeeds_and_reports_ready_slots() {
		let path = write_resolv_conf(&["127.0.0.53"]);
		let resolver = Resolver::<u32>::create(&path, 5, 4).unwrap();

		assert_eq!(resolver.ready(), 4);
		assert_eq!(resolver.expires(), 6);
	}

	#[test]
	fn request_exhausts_the_table_then_refuses() {
		let path = write_resolv_conf(&["127.0.0.53"]);
		let mut resolver = Resolver::<u32>::create(&path, 5, 4).unwrap();

		for i in 0..4 {
			assert!(resolver.request(&format!("host{i}.example"), i).is_some());
		}

		assert_eq!(resolver.ready(), 0);
		assert!(resolver.request("onemore.example", 99).is_none());
	}

	#[test]
	fn cancel_removes_from_active_and_frees_a_slot() {
		let path = write_resolv_conf(&["127.0.0.53"]);
		let mut resolver = Resolver::<u32>::create(&path, 5, 4).unwrap();

		resolver.request("invalid.host1", 1).unwrap();
		let tid = resolver.request("google.com", 2).unwrap();

		let free_before = resolver.ready();
		assert_eq!(resolver.cancel(&2), Some(tid));
		assert_eq!(resolver.ready(), free_before + 1);
		assert_eq!(resolver.cancel(&2), None);
	}

	#[test]
	fn cached_nxdomain_and_overlong_names_both_report_nxdomain() {
		let path = write_resolv_conf(&["127.0.0.53"]);
		let resolver = Resolver::<u32>::create(&path, 5, 4).unwrap();

		let overlong = "a".repeat(300);
		assert!(matches!(resolver.lookup(&overlong), Lookup::NxDomain));
	}

	#[test]
	fn lookup_recognises_a_dotted_quad_literal() {
		let path = write_resolv_conf(&["127.0.0.53"]);
		let resolver = Resolver::<u32>::create(&path, 5, 4).unwrap();

		assert!(matches!(resolver.lookup("93.184.216.34"), Lookup::Address(ip) if ip == "93.184.216.34".parse().unwrap()));
	}
}
