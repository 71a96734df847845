//! Diagnostics: a structured per-event `Sink` the handle owns for the lifetime
//! of the resolver, and a `dump()` formatter selected by `DumpOpts`.
//!
//! The two are deliberately separate. `Sink` receives one line per lifecycle
//! event (request sent, response matched, timeout, cache hit) as it happens;
//! `dump()` is a point-in-time snapshot written to whatever `Write` the caller
//! hands it. Decoupling them means a caller can, say, feed `Sink` into `log`
//! while still taking an explicit `dump()` on SIGUSR1.

use std::fmt::Write as _;
use std::net::Ipv4Addr;

use bitflags::bitflags;

/// One structured diagnostic event, emitted as the resolver does its work.
pub enum Event<'a> {
	Sent { name: &'a str, server: Ipv4Addr, tid: u16 },
	Resolved { name: &'a str, server: Ipv4Addr, ip: Ipv4Addr },
	NxDomain { name: &'a str, server: Ipv4Addr },
	TimedOut { name: &'a str, server: Ipv4Addr },
	CacheHit { name: &'a str },
	Dropped { name: &'a str, reason: &'static str },
}

/// Receives lifecycle events. The default no-op sink means wiring one up is
/// opt-in; `log`'s `Log` impl or a test-only recorder both implement this via
/// the blanket closure impl below.
pub trait Sink {
	fn event(&mut self, event: Event<'_>);
}

pub struct NullSink;

impl Sink for NullSink {
	fn event(&mut self, _event: Event<'_>) {}
}

impl<F: FnMut(Event<'_>)> Sink for F {
	fn event(&mut self, event: Event<'_>) {
		self(event)
	}
}

/// Routes every event to the `log` crate at a level matching its severity.
pub struct LogSink;

impl Sink for LogSink {
	fn event(&mut self, event: Event<'_>) {
		match event {
			Event::Sent { name, server, tid } => {
				log::debug!("sent {name} to {server} (tid {tid})");
			}
			Event::Resolved { name, server, ip } => {
				log::info!("{name} resolved to {ip} via {server}");
			}
			Event::NxDomain { name, server } => {
				log::info!("{name} is NXDOMAIN (from {server})");
			}
			Event::TimedOut { name, server } => {
				log::warn!("{name} timed out on {server}");
			}
			Event::CacheHit { name } => {
				log::trace!("{name} served from cache");
			}
			Event::Dropped { name, reason } => {
				log::warn!("dropped query for {name}: {reason}");
			}
		}
	}
}

bitflags! {
	/// Which sections `dump()` should render.
	#[derive(Clone, Copy, Debug, PartialEq, Eq)]
	pub struct DumpOpts: u8 {
		const SUMMARY = 0b001;
		const QUERIES = 0b010;
		const CACHE   = 0b100;
	}
}

pub struct Summary {
	pub servers: usize,
	pub qsize: usize,
	pub in_flight: usize,
	pub cache_count: usize,
	pub cache_limit: usize,
}

pub struct ServerRow {
	pub ip: Ipv4Addr,
	pub in_flight: u32,
	pub latency: f64,
}

pub struct QueryRow {
	pub name: String,
	pub tid: u16,
	pub server: Option<Ipv4Addr>,
	pub age_secs: f64,
}

pub struct CacheRow {
	pub name: String,
	pub value: String,
	pub expires_in: i64,
}

/// Render the requested sections as plain text. Each section is independent so
/// callers can ask for just `QUERIES`, just `CACHE`, or any combination.
pub fn render(opts: DumpOpts, summary: &Summary, servers: &[ServerRow], queries: &[QueryRow], cache: &[CacheRow]) -> String {
	let mut out = String::new();

	if opts.contains(DumpOpts::SUMMARY) {
		let _ = writeln!(
			out,
			"servers={} qsize={} in_flight={} cache={}/{}",
			summary.servers, summary.qsize, summary.in_flight, summary.cache_count, summary.cache_limit
		);

		for s in servers {
			let _ = writeln!(out, "  {} in_flight={} latency={:.4}s", s.ip, s.in_flight, s.latency);
		}
	}

	if opts.contains(DumpOpts::QUERIES) {
		let _ = writeln!(out, "queries:");
		for q in queries {
			let server = q.server.map(|ip| ip.to_string()).unwrap_or_else(|| "-".to_string());
			let _ = writeln!(out, "  {} tid={} server={} age={:.3}s", q.name, q.tid, server, q.age_secs);
		}
	}

	if opts.contains(DumpOpts::CACHE) {
		let _ = writeln!(out, "cache:");
		for e in cache {
			let _ = writeln!(out, "  {} -> {} expires_in={}s", e.name, e.value, e.expires_in);
		}
	}

	out
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn summary_only_omits_other_sections() {
		let summary = Summary { servers: 2, qsize: 16, in_flight: 3, cache_count: 5, cache_limit: 16 };
		let text = render(DumpOpts::SUMMARY, &summary, &[], &[], &[]);

		assert!(text.contains("servers=2"));
		assert!(!text.contains("queries:"));
		assert!(!text.contains("cache:"));
	}

	#[test]
	fn combined_flags_render_every_requested_section() {
		let summary = Summary { servers: 1, qsize: 4, in_flight: 0, cache_count: 0, cache_limit: 16 };
		let queries = [QueryRow { name: "a.com".into(), tid: 5, server: Some("10.0.0.1".parse().unwrap()), age_secs: 0.5 }];
		let cache = [CacheRow { name: "b.com".into(), value: "1.2.3.4".into(), expires_in: 120 }];

		let text = render(DumpOpts::QUERIES | DumpOpts::CACHE, &summary, &[], &queries, &cache);
		assert!(!text.contains("servers="));
		assert!(text.contains("a.com"));
		assert!(text.contains("b.com"));
	}

	#[test]
	fn null_sink_accepts_every_event_variant() {
		let mut sink = NullSink;
		sink.event(Event::Sent { name: "x", server: "1.1.1.1".parse().unwrap(), tid: 1 });
		sink.event(Event::Dropped { name: "x", reason: "servers exhausted" });
	}

	#[test]
	fn closure_sink_observes_events() {
		let mut seen = Vec::new();
		let mut sink = |e: Event<'_>| {
			if let Event::CacheHit { name } = e {
				seen.push(name.to_string());
			}
		};

		sink.event(Event::CacheHit { name: "cached.example" });
		assert_eq!(seen, vec!["cached.example".to_string()]);
	}
}
