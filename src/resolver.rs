use std::fmt;
use std::io;
use std::net::{IpAddr, SocketAddr, ToSocketAddrs};
use std::str::FromStr;
use std::sync::Arc;
use std::thread;

use crossbeam_channel::{Sender, unbounded};

use crate::error::Error;
use crate::event_loop::EventFd;

/// Parsed endpoint URI of the form `scheme://host:port`.
///
/// IPv6 literal hosts use brackets: `rtp://[2001:db8::1]:5000`. The port is
/// always explicit; per-protocol default ports belong to the layer above.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EndpointUri {
    scheme: String,
    host: String,
    port: u16,
}

impl EndpointUri {
    pub fn scheme(&self) -> &str {
        &self.scheme
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }
}

impl FromStr for EndpointUri {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Error> {
        let (scheme, rest) = s
            .split_once("://")
            .ok_or_else(|| Error::InvalidUri(format!("missing scheme: {s}")))?;
        if scheme.is_empty()
            || !scheme
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '+' | '-' | '.'))
        {
            return Err(Error::InvalidUri(format!("bad scheme: {s}")));
        }

        let (host, port) = if let Some(bracketed) = rest.strip_prefix('[') {
            let (host, tail) = bracketed
                .split_once(']')
                .ok_or_else(|| Error::InvalidUri(format!("unclosed bracket: {s}")))?;
            let port = tail
                .strip_prefix(':')
                .ok_or_else(|| Error::InvalidUri(format!("missing port: {s}")))?;
            (host, port)
        } else {
            rest.rsplit_once(':')
                .ok_or_else(|| Error::InvalidUri(format!("missing port: {s}")))?
        };

        if host.is_empty() {
            return Err(Error::InvalidUri(format!("empty host: {s}")));
        }
        let port: u16 = port
            .parse()
            .map_err(|_| Error::InvalidUri(format!("bad port: {s}")))?;

        Ok(EndpointUri {
            scheme: scheme.to_string(),
            host: host.to_string(),
            port,
        })
    }
}

impl fmt::Display for EndpointUri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "{}://[{}]:{}", self.scheme, self.host, self.port)
        } else {
            write!(f, "{}://{}:{}", self.scheme, self.host, self.port)
        }
    }
}

/// Completed resolution handed back to the loop thread.
pub(crate) struct ResolveOutcome {
    pub(crate) task_id: u64,
    pub(crate) address: Option<SocketAddr>,
}

struct Job {
    task_id: u64,
    host: String,
    port: u16,
}

/// Asynchronous resolver bound to the event loop.
///
/// Blocking `getaddrinfo` lookups run on a dedicated thread; completions are
/// published over a channel and signaled through the loop's data wakeup.
pub(crate) struct Resolver {
    tx: Option<Sender<Job>>,
    thread: Option<thread::JoinHandle<()>>,
}

impl Resolver {
    pub(crate) fn spawn(
        done_tx: Sender<ResolveOutcome>,
        wakeup: Arc<EventFd>,
    ) -> io::Result<Resolver> {
        let (tx, rx) = unbounded::<Job>();
        let thread = thread::Builder::new()
            .name("packetline-resolver".to_string())
            .spawn(move || {
                for job in rx.iter() {
                    let address = lookup_host(&job.host, job.port);
                    if done_tx
                        .send(ResolveOutcome {
                            task_id: job.task_id,
                            address,
                        })
                        .is_err()
                    {
                        break;
                    }
                    wakeup.signal();
                }
            })?;
        Ok(Resolver {
            tx: Some(tx),
            thread: Some(thread),
        })
    }

    /// Begin resolution of `uri`, correlated by `task_id`.
    ///
    /// Returns `false` when the request completed synchronously with the
    /// outcome stored in `out` (IP-literal hosts skip the resolver thread);
    /// `true` when the request was queued and completion will arrive later
    /// on the loop thread.
    pub(crate) fn async_resolve(
        &self,
        task_id: u64,
        uri: &EndpointUri,
        out: &mut Option<SocketAddr>,
    ) -> bool {
        if let Ok(ip) = uri.host().parse::<IpAddr>() {
            *out = Some(SocketAddr::new(ip, uri.port()));
            return false;
        }

        let job = Job {
            task_id,
            host: uri.host().to_string(),
            port: uri.port(),
        };
        match &self.tx {
            Some(tx) if tx.send(job).is_ok() => true,
            _ => {
                *out = None;
                false
            }
        }
    }
}

impl Drop for Resolver {
    fn drop(&mut self) {
        // Closing the job channel lets the thread finish its current lookup
        // and exit.
        self.tx = None;
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

fn lookup_host(host: &str, port: u16) -> Option<SocketAddr> {
    match (host, port).to_socket_addrs() {
        Ok(mut addrs) => addrs.next(),
        Err(err) => {
            log::debug!("resolver: lookup of {host} failed: {err}");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_host_and_port() {
        let uri: EndpointUri = "rtp://example.com:5000".parse().unwrap();
        assert_eq!(uri.scheme(), "rtp");
        assert_eq!(uri.host(), "example.com");
        assert_eq!(uri.port(), 5000);
    }

    #[test]
    fn parses_ipv6_brackets() {
        let uri: EndpointUri = "rtsp://[2001:db8::1]:8554".parse().unwrap();
        assert_eq!(uri.host(), "2001:db8::1");
        assert_eq!(uri.port(), 8554);
    }

    #[test]
    fn rejects_missing_scheme() {
        assert!("example.com:5000".parse::<EndpointUri>().is_err());
    }

    #[test]
    fn rejects_missing_port() {
        assert!("rtp://example.com".parse::<EndpointUri>().is_err());
        assert!("rtp://[2001:db8::1]".parse::<EndpointUri>().is_err());
    }

    #[test]
    fn rejects_empty_host() {
        assert!("rtp://:5000".parse::<EndpointUri>().is_err());
    }

    #[test]
    fn rejects_bad_port() {
        assert!("rtp://example.com:70000".parse::<EndpointUri>().is_err());
        assert!("rtp://example.com:abc".parse::<EndpointUri>().is_err());
    }

    #[test]
    fn display_round_trip() {
        for s in ["rtp://example.com:5000", "rtp://[2001:db8::1]:5000"] {
            let uri: EndpointUri = s.parse().unwrap();
            assert_eq!(uri.to_string(), s);
        }
    }
}
