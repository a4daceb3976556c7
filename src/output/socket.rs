/*!
 * Socket Output
 * Streams events to a single remote collector over TCP
 *
 * The listener is bound when the strategy is built so a busy port fails
 * startup. The collector is accepted lazily on the first event; until it
 * connects the depository blocks, and with it the whole pipeline.
 */

use super::codec::EventEncoder;
use super::{OutputFormat, OutputStrategy};
use crate::core::errors::{CollectorError, Result};
use crate::events::Event;
use std::fmt;
use std::net::{Shutdown, SocketAddr, TcpListener, TcpStream, ToSocketAddrs};
use tracing::{info, warn};

pub struct SocketOutput {
    listener: TcpListener,
    format: OutputFormat,
    peer: Option<EventEncoder<TcpStream>>,
}

impl SocketOutput {
    pub fn bind<A: ToSocketAddrs>(addr: A, format: OutputFormat) -> Result<Self> {
        let addrs: Vec<SocketAddr> = addr.to_socket_addrs()?.collect();
        let port = addrs.first().map(SocketAddr::port).unwrap_or_default();
        let listener =
            TcpListener::bind(addrs.as_slice()).map_err(|source| CollectorError::Bind { port, source })?;
        Ok(Self {
            listener,
            format,
            peer: None,
        })
    }

    /// Address actually bound (useful with port 0)
    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    fn peer(&mut self) -> Result<&mut EventEncoder<TcpStream>> {
        if self.peer.is_none() {
            let (stream, remote) = self.listener.accept()?;
            stream.set_nodelay(true)?;
            info!(%remote, "collector connected");
            self.peer = Some(EventEncoder::new(stream, self.format));
        }
        self.peer
            .as_mut()
            .ok_or_else(|| CollectorError::Internal("no collector connected".into()))
    }
}

impl fmt::Debug for SocketOutput {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SocketOutput")
            .field("listener", &self.listener)
            .field("format", &self.format)
            .field("connected", &self.peer.is_some())
            .finish()
    }
}

impl OutputStrategy for SocketOutput {
    fn handle(&mut self, event: &Event) -> Result<()> {
        self.peer()?.encode(event)
    }

    fn flush(&mut self) -> Result<()> {
        match self.peer.as_mut() {
            Some(peer) => peer.flush(),
            None => Ok(()),
        }
    }

    fn close(&mut self) -> Result<()> {
        let Some(peer) = self.peer.take() else {
            warn!("socket output closed before any collector connected");
            return Ok(());
        };
        let stream = peer.finish()?;
        stream.shutdown(Shutdown::Write)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::output::EventReader;
    use std::thread;

    #[test]
    fn test_streams_to_connected_collector() {
        let mut output = SocketOutput::bind("127.0.0.1:0", OutputFormat::Binary).unwrap();
        let addr = output.local_addr().unwrap();

        let collector = thread::spawn(move || {
            let stream = TcpStream::connect(addr).unwrap();
            EventReader::new(stream, OutputFormat::Binary)
                .collect::<Result<Vec<_>>>()
                .unwrap()
        });

        output.handle(&Event::time()).unwrap();
        output.handle(&Event::final_sentinel()).unwrap();
        output.close().unwrap();

        let events = collector.join().unwrap();
        assert_eq!(events.len(), 2);
        assert!(events[1].is_final());
    }

    #[test]
    fn test_port_in_use_fails_bind() {
        let first = SocketOutput::bind("127.0.0.1:0", OutputFormat::JsonLines).unwrap();
        let port = first.local_addr().unwrap().port();
        let err = SocketOutput::bind(("127.0.0.1", port), OutputFormat::JsonLines).unwrap_err();
        assert!(matches!(err, CollectorError::Bind { port: p, .. } if p == port));
    }

    #[test]
    fn test_debug_reports_connection_state() {
        let output = SocketOutput::bind("127.0.0.1:0", OutputFormat::JsonLines).unwrap();
        let rendered = format!("{output:?}");
        assert!(rendered.contains("connected: false"));
    }
}
