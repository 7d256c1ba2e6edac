//! Identity of sockets handed to the dispatcher for registration.

use isomer_types::{Domain, Protocol};

use crate::destination::SocketCookie;
use crate::error::Result;

/// Kernel facts about a socket needed to register it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SocketDetails {
    pub cookie: SocketCookie,
    pub domain: Domain,
    pub protocol: Protocol,
    /// Whether a stream socket is in the listening state.
    pub listening: bool,
}

/// Source of [`SocketDetails`].
pub trait SocketIdentity {
    fn describe(&self) -> Result<SocketDetails>;
}

impl SocketIdentity for SocketDetails {
    fn describe(&self) -> Result<SocketDetails> {
        Ok(*self)
    }
}

#[cfg(target_os = "linux")]
pub use self::linux::FdSocket;

#[cfg(target_os = "linux")]
mod linux {
    use super::*;
    use crate::error::IsomerError;
    use std::io;
    use std::os::fd::{AsFd, AsRawFd, BorrowedFd};

    /// A socket identified by a borrowed file descriptor.
    #[derive(Debug, Clone, Copy)]
    pub struct FdSocket<'a> {
        fd: BorrowedFd<'a>,
    }

    impl<'a> FdSocket<'a> {
        pub fn new(fd: BorrowedFd<'a>) -> Self {
            Self { fd }
        }

        pub fn from_fd<T: AsFd>(socket: &'a T) -> Self {
            Self::new(socket.as_fd())
        }

        fn getsockopt<T: Copy + Default>(&self, option: libc::c_int) -> io::Result<T> {
            let mut value = T::default();
            let mut len = std::mem::size_of::<T>() as libc::socklen_t;
            // SAFETY: `value` is a valid, writable buffer of `len` bytes and the
            // descriptor is borrowed for the lifetime of `self`.
            let ret = unsafe {
                libc::getsockopt(
                    self.fd.as_raw_fd(),
                    libc::SOL_SOCKET,
                    option,
                    &mut value as *mut T as *mut libc::c_void,
                    &mut len,
                )
            };
            if ret < 0 {
                return Err(io::Error::last_os_error());
            }
            Ok(value)
        }
    }

    impl SocketIdentity for FdSocket<'_> {
        fn describe(&self) -> Result<SocketDetails> {
            let cookie: u64 = self.getsockopt(libc::SO_COOKIE)?;
            let raw_domain: libc::c_int = self.getsockopt(libc::SO_DOMAIN)?;
            let raw_protocol: libc::c_int = self.getsockopt(libc::SO_PROTOCOL)?;
            let listening: libc::c_int = self.getsockopt(libc::SO_ACCEPTCONN)?;

            let domain = u16::try_from(raw_domain)
                .ok()
                .and_then(Domain::from_raw)
                .ok_or_else(|| {
                    IsomerError::UnsupportedSocket(format!("address family {}", raw_domain))
                })?;
            let protocol = u16::try_from(raw_protocol)
                .ok()
                .and_then(Protocol::from_raw)
                .ok_or_else(|| {
                    IsomerError::UnsupportedSocket(format!("protocol {}", raw_protocol))
                })?;

            Ok(SocketDetails {
                cookie: SocketCookie(cookie),
                domain,
                protocol,
                listening: listening != 0,
            })
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;
        use std::net::{TcpListener, TcpStream, UdpSocket};

        #[test]
        fn test_describe_tcp_listener() {
            let listener = TcpListener::bind("127.0.0.1:0").unwrap();
            let details = FdSocket::from_fd(&listener).describe().unwrap();

            assert_eq!(details.domain, Domain::Inet);
            assert_eq!(details.protocol, Protocol::Tcp);
            assert!(details.listening);
            assert_ne!(details.cookie, SocketCookie(0));
        }

        #[test]
        fn test_describe_udp() {
            let socket = UdpSocket::bind("127.0.0.1:0").unwrap();
            let details = FdSocket::from_fd(&socket).describe().unwrap();

            assert_eq!(details.protocol, Protocol::Udp);
            assert!(!details.listening);
        }

        #[test]
        fn test_connected_stream_is_not_listening() {
            let listener = TcpListener::bind("127.0.0.1:0").unwrap();
            let stream = TcpStream::connect(listener.local_addr().unwrap()).unwrap();
            let details = FdSocket::from_fd(&stream).describe().unwrap();

            assert!(!details.listening);
            assert_ne!(
                details.cookie,
                FdSocket::from_fd(&listener).describe().unwrap().cookie
            );
        }
    }
}
