//! Non-blocking TCP connects
//!
//! A [`PendingConnect`] is a socket whose connect was issued but may not
//! have finished yet. It is polled for completion without blocking, and
//! dropping it closes the socket.

use std::future::Future;
use std::io;
use std::net::{IpAddr, SocketAddr, TcpStream, ToSocketAddrs};
use std::pin::Pin;
use std::task::{Context, Poll};

use smol::{Async, future};

type ConnectFuture = Pin<Box<dyn Future<Output = io::Result<Async<TcpStream>>> + Send>>;

enum ConnectState {
    InFlight(ConnectFuture),
    Done(io::Result<TcpStream>),
    Taken,
}

/// In-flight connect to one subhost
pub struct PendingConnect {
    host: String,
    addr: SocketAddr,
    state: ConnectState,
}

impl std::fmt::Debug for PendingConnect {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PendingConnect")
            .field("host", &self.host)
            .field("addr", &self.addr)
            .field("in_flight", &self.is_in_flight())
            .finish()
    }
}

impl PendingConnect {
    /// Resolve `host` and issue a non-blocking connect to it
    ///
    /// Fails when the host does not resolve or the socket cannot be set up;
    /// a connect that is merely in progress is not a failure.
    pub async fn open(host: &str, default_port: u16) -> io::Result<Self> {
        let addr = resolve_host(host, default_port)?;
        let mut pending = Self {
            host: host.to_string(),
            addr,
            state: ConnectState::InFlight(Box::pin(Async::<TcpStream>::connect(addr))),
        };

        // The first poll creates the socket and issues the connect
        pending.poll_once().await;

        match std::mem::replace(&mut pending.state, ConnectState::Taken) {
            ConnectState::Done(Err(e)) => Err(e),
            state => {
                pending.state = state;
                Ok(pending)
            }
        }
    }

    /// Subhost as given to `open`
    pub fn host(&self) -> &str {
        &self.host
    }

    /// Resolved destination
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Check if the connect has not finished yet
    pub fn is_in_flight(&self) -> bool {
        matches!(self.state, ConnectState::InFlight(_))
    }

    /// Check once whether the connect finished
    ///
    /// `None` while still connecting. A finished stream is returned in
    /// blocking mode, ready to be handed to an HTTP connection.
    pub async fn finish_connect(&mut self) -> Option<io::Result<TcpStream>> {
        self.poll_once().await;

        match std::mem::replace(&mut self.state, ConnectState::Taken) {
            ConnectState::Done(result) => Some(result.and_then(|stream| {
                stream.set_nonblocking(false)?;
                Ok(stream)
            })),
            state => {
                self.state = state;
                None
            }
        }
    }

    /// Drive the connect; ready once it finished either way
    pub fn poll_progress(&mut self, cx: &mut Context<'_>) -> Poll<()> {
        if let ConnectState::InFlight(connect) = &mut self.state {
            let poll = connect.as_mut().poll(cx);
            match poll {
                Poll::Pending => return Poll::Pending,
                Poll::Ready(result) => {
                    self.state = ConnectState::Done(result.and_then(Async::into_inner));
                }
            }
        }
        Poll::Ready(())
    }

    /// Abandon the connect and close the socket
    pub fn close(self) {
        tracing::trace!("Closing pending connection to {}", self.host);
    }

    async fn poll_once(&mut self) {
        future::poll_fn(|cx| {
            let _ = self.poll_progress(cx);
            Poll::Ready(())
        })
        .await;
    }
}

/// Split `host`, `host:port` or `[v6]:port` into name and port
pub fn split_host_port(host: &str, default_port: u16) -> (&str, u16) {
    let host = host.trim();

    if let Some(rest) = host.strip_prefix('[') {
        if let Some((name, tail)) = rest.split_once(']') {
            let port = tail
                .strip_prefix(':')
                .and_then(|p| p.parse().ok())
                .unwrap_or(default_port);
            return (name, port);
        }
    }

    // A bare IPv6 literal has several colons and no port
    if host.parse::<IpAddr>().is_ok() {
        return (host, default_port);
    }

    match host.rsplit_once(':') {
        Some((name, port)) => match port.parse() {
            Ok(port) => (name, port),
            Err(_) => (host, default_port),
        },
        None => (host, default_port),
    }
}

/// Resolve a subhost to the first address it maps to
pub fn resolve_host(host: &str, default_port: u16) -> io::Result<SocketAddr> {
    let (name, port) = split_host_port(host, default_port);
    if name.is_empty() {
        return Err(io::Error::new(io::ErrorKind::InvalidInput, "Empty host"));
    }

    if let Ok(ip) = name.parse::<IpAddr>() {
        return Ok(SocketAddr::new(ip, port));
    }

    (name, port)
        .to_socket_addrs()?
        .next()
        .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "DNS resolution failed"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener;

    #[test]
    fn test_split_host_port() {
        assert_eq!(split_host_port("example.com", 80), ("example.com", 80));
        assert_eq!(split_host_port("example.com:8080", 80), ("example.com", 8080));
        assert_eq!(split_host_port("[::1]:443", 80), ("::1", 443));
        assert_eq!(split_host_port("[::1]", 80), ("::1", 80));
        assert_eq!(split_host_port("::1", 80), ("::1", 80));
        assert_eq!(split_host_port("host:notaport", 80), ("host:notaport", 80));
    }

    #[test]
    fn test_resolve_host_localhost() {
        let addr = resolve_host("127.0.0.1", 80).unwrap();
        assert_eq!(addr.port(), 80);

        let addr = resolve_host("127.0.0.1:8080", 80).unwrap();
        assert_eq!(addr.port(), 8080);
    }

    #[test]
    fn test_resolve_empty_host() {
        let err = resolve_host("  ", 80).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidInput);
    }

    #[test]
    fn test_connect_to_listener() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let host = listener.local_addr().unwrap().to_string();

        smol::block_on(async {
            let mut pending = PendingConnect::open(&host, 80).await.unwrap();
            assert_eq!(pending.host(), host);
            assert_eq!(pending.addr(), listener.local_addr().unwrap());

            let stream = loop {
                if let Some(result) = pending.finish_connect().await {
                    break result.unwrap();
                }
                smol::Timer::after(std::time::Duration::from_millis(5)).await;
            };
            assert_eq!(stream.peer_addr().unwrap(), listener.local_addr().unwrap());
        });
    }
}
