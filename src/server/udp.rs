//! Datagram relay behind a UDP ASSOCIATE request.

use std::io;
use std::net::{IpAddr, SocketAddr};

use bytes::Bytes;
use log::{debug, trace};
use tokio::net::UdpSocket;

use super::connection::{ConnectionId, Event};
use crate::error::{Error, Result};
use crate::protocol::{decode_udp_envelope, encode_udp_envelope, AddressSpec, UdpHeader};
use crate::resolver::{self, Lookup};

const MAX_DATAGRAM_SIZE: usize = 65535;

pub(super) struct UdpAssociation {
    id: ConnectionId,
    socket: UdpSocket,
    // IP of the TCP control connection; only it may register as the client
    client_ip: IpAddr,
    client_peer: Option<SocketAddr>,
    // a datagram waiting on its domain target to resolve
    pending: Option<(Lookup, Bytes)>,
    buf: Box<[u8]>,
}

impl UdpAssociation {
    /// Bind an ephemeral UDP port on `local_ip`.
    ///
    /// `declared` is the address the client put in its request. A non-zero
    /// port registers the client's datagram source right away; otherwise the
    /// first datagram from `client_ip` does.
    pub(super) fn bind(
        id: ConnectionId,
        local_ip: IpAddr,
        client_ip: IpAddr,
        declared: &AddressSpec,
    ) -> io::Result<Self> {
        let socket = std::net::UdpSocket::bind(SocketAddr::new(local_ip, 0))?;
        socket.set_nonblocking(true)?;
        let socket = UdpSocket::from_std(socket)?;

        let client_peer = declared.socket_addr().and_then(|addr| {
            if addr.port() == 0 {
                None
            } else if addr.ip().is_unspecified() {
                Some(SocketAddr::new(client_ip, addr.port()))
            } else {
                Some(addr)
            }
        });

        Ok(UdpAssociation {
            id,
            socket,
            client_ip,
            client_peer,
            pending: None,
            buf: vec![0u8; MAX_DATAGRAM_SIZE].into_boxed_slice(),
        })
    }

    pub(super) fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    /// Wait for a datagram, or for the pending lookup to finish. The socket
    /// is not read while a lookup is in flight.
    pub(super) async fn ready(&mut self) -> Event {
        match &mut self.pending {
            Some((lookup, _)) => Event::Resolved(lookup.await),
            None => {
                let _ = self.socket.readable().await;
                Event::DatagramReadable
            }
        }
    }

    /// Receive one datagram and forward it.
    ///
    /// Only a fragmented datagram from the client is an error; anything else
    /// that cannot be delivered is dropped.
    pub(super) fn on_readable(&mut self) -> Result<()> {
        let (len, from) = match self.socket.try_recv_from(&mut self.buf) {
            Ok(received) => received,
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(()),
            Err(e) => return Err(e.into()),
        };

        if self.is_from_client(&from) {
            if self.client_peer.is_none() {
                debug!("[{}] udp client registered at {}", self.id, from);
                self.client_peer = Some(from);
            }
            self.outbound(len)
        } else {
            self.inbound(len, from)
        }
    }

    pub(super) fn on_resolved(&mut self, result: Result<SocketAddr>) -> Result<()> {
        let Some((_, payload)) = self.pending.take() else {
            return Ok(());
        };
        match result {
            Ok(target) => self.send(&payload, target),
            Err(err) => debug!("[{}] dropping datagram: {}", self.id, err),
        }
        Ok(())
    }

    fn is_from_client(&self, addr: &SocketAddr) -> bool {
        match self.client_peer {
            Some(peer) => peer == *addr,
            None => addr.ip() == self.client_ip,
        }
    }

    // client -> destination: strip the envelope
    fn outbound(&mut self, len: usize) -> Result<()> {
        let (header, offset) = match decode_udp_envelope(&self.buf[..len]) {
            Ok(decoded) => decoded,
            Err(err) => {
                debug!("[{}] dropping malformed datagram: {}", self.id, err);
                return Ok(());
            }
        };

        if header.frag != 0 {
            return Err(Error::Fragmented(header.frag));
        }

        match header.address.socket_addr() {
            Some(target) => self.send(&self.buf[offset..len], target),
            None => {
                let payload = Bytes::copy_from_slice(&self.buf[offset..len]);
                self.pending = Some((resolver::lookup(header.address), payload));
            }
        }
        Ok(())
    }

    // destination -> client: prepend an envelope naming the source
    fn inbound(&mut self, len: usize, from: SocketAddr) -> Result<()> {
        let Some(client) = self.client_peer else {
            trace!("[{}] no udp client yet, dropping datagram from {}", self.id, from);
            return Ok(());
        };

        // ATYP follows the source's family; an IPv6 destination answers with 0x04
        let header = UdpHeader::new(AddressSpec::from(from));
        let packet = encode_udp_envelope(&header, &self.buf[..len])?;
        self.send(&packet, client);
        Ok(())
    }

    fn send(&self, payload: &[u8], target: SocketAddr) {
        match self.socket.try_send_to(payload, target) {
            Ok(n) => trace!("[{}] sent {} bytes to {}", self.id, n, target),
            Err(err) => debug!("[{}] dropping datagram to {}: {}", self.id, target, err),
        }
    }
}
