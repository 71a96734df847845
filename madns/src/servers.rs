//! Per-upstream in-flight accounting and latency-aware server selection.

use std::net::Ipv4Addr;

pub struct Server {
	pub ip: Ipv4Addr,
	pub in_flight: u32,
	/// Decaying-average round trip time, in seconds.
	pub latency: f64,
}

pub struct ServerTable {
	servers: Vec<Server>,
	server_reqs: u32,
}

impl ServerTable {
	pub fn new(ips: Vec<Ipv4Addr>, server_reqs: u32) -> Self {
		let servers = ips.into_iter().map(|ip| Server { ip, in_flight: 0, latency: 0.0 }).collect();
		Self { servers, server_reqs }
	}

	pub fn len(&self) -> usize {
		self.servers.len()
	}

	pub fn server_reqs(&self) -> u32 {
		self.server_reqs
	}

	pub fn ip(&self, idx: usize) -> Ipv4Addr {
		self.servers[idx].ip
	}

	pub fn iter(&self) -> impl Iterator<Item = &Server> {
		self.servers.iter()
	}

	/// Choose the lowest-latency server with spare capacity, excluding `prev`
	/// (the server a retry is moving away from). On success, debits `prev`'s
	/// in-flight counter and credits the chosen server's.
	///
	/// Returns `None` if every eligible server (all but `prev`) is already at
	/// `server_reqs` in-flight queries; the caller must leave the query unsent.
	pub fn select(&mut self, prev: Option<usize>) -> Option<usize> {
		let chosen = self
			.servers
			.iter()
			.enumerate()
			.filter(|&(i, s)| Some(i) != prev && s.in_flight < self.server_reqs)
			.min_by(|(_, a), (_, b)| a.latency.total_cmp(&b.latency))
			.map(|(i, _)| i)?;

		if let Some(p) = prev {
			self.servers[p].in_flight -= 1;
		}

		self.servers[chosen].in_flight += 1;

		Some(chosen)
	}

	/// Release a query from `idx`, folding `sample_secs` (its round-trip time,
	/// or the full timeout on expiry) into the decaying average. The effective
	/// averaging window is `server_reqs * 2` samples.
	pub fn release(&mut self, idx: usize, sample_secs: f64) {
		let server = &mut self.servers[idx];

		server.in_flight -= 1;
		server.latency += (sample_secs - server.latency) / (self.server_reqs as f64 * 2.0);
	}

	/// Undo a `select()` credit for a query that was never actually put on the
	/// wire (the name couldn't be encoded, or the `sendto` itself failed). No
	/// sample was observed, so latency is left untouched.
	pub fn cancel_selection(&mut self, idx: usize) {
		self.servers[idx].in_flight -= 1;
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn table(servers: &[&str], server_reqs: u32) -> ServerTable {
		ServerTable {
			servers: servers
				.iter()
				.map(|ip| Server { ip: ip.parse().unwrap(), in_flight: 0, latency: 0.0 })
				.collect(),
			server_reqs,
		}
	}

	#[test]
	fn prefers_lowest_latency_eligible_server() {
		let mut t = table(&["10.0.0.1", "10.0.0.2"], 4);
		t.servers[0].latency = 0.5;
		t.servers[1].latency = 0.1;

		let picked = t.select(None).unwrap();
		assert_eq!(t.ip(picked), "10.0.0.2".parse::<Ipv4Addr>().unwrap());
		assert_eq!(t.servers[picked].in_flight, 1);
	}

	#[test]
	fn excludes_previous_server_on_retry() {
		let mut t = table(&["10.0.0.1", "10.0.0.2"], 4);
		t.servers[0].in_flight = 1;

		let picked = t.select(Some(0)).unwrap();
		assert_eq!(picked, 1);
		assert_eq!(t.servers[0].in_flight, 0, "retry should free the previous server's slot");
	}

	#[test]
	fn exhaustion_returns_none() {
		let mut t = table(&["10.0.0.1"], 1);
		assert!(t.select(None).is_some());
		assert!(t.select(None).is_none());
	}

	#[test]
	fn latency_drifts_toward_samples() {
		let mut t = table(&["10.0.0.1"], 2);
		let idx = t.select(None).unwrap();

		t.release(idx, 1.0);
		assert!(t.servers[idx].latency > 0.0 && t.servers[idx].latency < 1.0);
	}
}
