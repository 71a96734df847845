//! A thin, non-blocking wrapper over a UDP socket: bind to an ephemeral port,
//! grow the receive buffer so a burst of replies doesn't get dropped by the
//! kernel before the resolver drains it, and expose a raw descriptor for
//! callers that poll this resolver alongside other fds.

use std::io;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4, UdpSocket};

/// Requested `SO_RCVBUF` size. The kernel may round this up or down; we don't
/// check what it settled on, since a smaller-than-requested buffer still
/// works, just with a higher chance of a drop under heavy reply bursts.
const RECV_BUFFER_BYTES: usize = 128 * 1024;

pub struct Socket {
	inner: UdpSocket,
}

impl Socket {
	/// Bind to `0.0.0.0:0`, let the OS pick a port, and put the socket in
	/// non-blocking mode so `recv` never stalls the caller's event loop.
	pub fn bind_ephemeral() -> io::Result<Self> {
		let inner = UdpSocket::bind(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 0))?;
		inner.set_nonblocking(true)?;

		let socket = Self { inner };
		socket.set_recv_buffer(RECV_BUFFER_BYTES);
		Ok(socket)
	}

	#[cfg(unix)]
	fn set_recv_buffer(&self, bytes: usize) {
		use std::os::unix::io::AsRawFd;

		let fd = self.inner.as_raw_fd();
		let size = bytes as libc::c_int;

		unsafe {
			libc::setsockopt(
				fd,
				libc::SOL_SOCKET,
				libc::SO_RCVBUF,
				&size as *const _ as *const libc::c_void,
				std::mem::size_of::<libc::c_int>() as libc::socklen_t,
			);
		}
	}

	#[cfg(windows)]
	fn set_recv_buffer(&self, bytes: usize) {
		use std::os::windows::io::AsRawSocket;
		use windows_sys::Win32::Networking::WinSock::{setsockopt, SOL_SOCKET, SO_RCVBUF};

		let socket = self.inner.as_raw_socket() as usize;
		let size = bytes as i32;

		unsafe {
			setsockopt(
				socket,
				SOL_SOCKET,
				SO_RCVBUF,
				&size as *const _ as *const u8,
				std::mem::size_of::<i32>() as i32,
			);
		}
	}

	/// The raw descriptor, for callers driving their own `poll`/`select` loop
	/// and multiplexing this resolver's readability alongside other sources.
	#[cfg(unix)]
	pub fn fileno(&self) -> std::os::unix::io::RawFd {
		use std::os::unix::io::AsRawFd;
		self.inner.as_raw_fd()
	}

	#[cfg(windows)]
	pub fn fileno(&self) -> std::os::windows::io::RawSocket {
		use std::os::windows::io::AsRawSocket;
		self.inner.as_raw_socket()
	}

	pub fn send_to(&self, buf: &[u8], addr: SocketAddr) -> io::Result<()> {
		self.inner.send_to(buf, addr)?;
		Ok(())
	}

	/// Drain one datagram, if any is pending. `Ok(None)` on `WouldBlock`; any
	/// other I/O error is surfaced so the caller can decide whether it's fatal.
	pub fn recv(&self, buf: &mut [u8]) -> io::Result<Option<(usize, SocketAddr)>> {
		match self.inner.recv_from(buf) {
			Ok((n, from)) => Ok(Some((n, from))),
			Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(None),
			Err(e) => Err(e),
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn bind_picks_an_ephemeral_port() {
		let socket = Socket::bind_ephemeral().unwrap();
		assert_eq!(socket.recv(&mut [0u8; 4]).unwrap(), None);
	}

	#[test]
	fn loopback_round_trip() {
		let a = Socket::bind_ephemeral().unwrap();
		let b = Socket::bind_ephemeral().unwrap();

		let b_addr = b.inner.local_addr().unwrap();
		a.send_to(b"hello", b_addr).unwrap();

		let mut buf = [0u8; 16];
		let mut received = None;

		for _ in 0..1000 {
			if let Some((n, _from)) = b.recv(&mut buf).unwrap() {
				received = Some(buf[..n].to_vec());
				break;
			}
			std::thread::sleep(std::time::Duration::from_millis(1));
		}

		assert_eq!(received.as_deref(), Some(&b"hello"[..]));
	}
}
