use std::fmt;
use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::time::Instant;

use bytes::{Buf, BytesMut};
use log::{debug, info, trace, warn};
use tokio::net::{TcpSocket, TcpStream};

use super::relay::{self, Progress};
use super::udp::UdpAssociation;
use crate::config::Config;
use crate::error::Result;
use crate::protocol::{
    check_version, decode_connect_request, decode_handshake, encode_connect_reply,
    encode_handshake_reply, AddressSpec, Command, ConnectReply, ConnectRequest, Reply,
    METHOD_NO_ACCEPTABLE, METHOD_NO_AUTH,
};
use crate::resolver::{self, Lookup};

// Largest negotiation frame is a request with a 255 byte domain name.
const NEGOTIATION_BUFFER_SIZE: usize = 512;

const CONTROL_BUFFER_SIZE: usize = 64;

/// Identity of one client connection, unique within a scheduler.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(u64);

impl ConnectionId {
    pub fn new(id: u64) -> Self {
        ConnectionId(id)
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ContextState {
    AwaitingHandshake,
    AwaitingRequest,
    /// Domain lookup for a CONNECT in flight
    Resolving,
    /// Non-blocking connect waiting for confirmation
    Connecting,
    Connected,
    UdpAssociated,
    HandshakeFailed,
    RequestFailed,
    Closed,
}

impl ContextState {
    /// States subject to negotiation timeout eviction.
    pub fn is_negotiating(self) -> bool {
        matches!(
            self,
            ContextState::AwaitingHandshake
                | ContextState::AwaitingRequest
                | ContextState::Resolving
                | ContextState::Connecting
        )
    }

    pub fn is_closed(self) -> bool {
        self == ContextState::Closed
    }
}

/// What woke a context up.
pub enum Event {
    ClientReadable,
    ClientWritable,
    DestinationReadable,
    DestinationWritable,
    DatagramReadable,
    Resolved(Result<SocketAddr>),
    Dialed(io::Result<TcpStream>),
}

impl fmt::Debug for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Event::ClientReadable => "ClientReadable",
            Event::ClientWritable => "ClientWritable",
            Event::DestinationReadable => "DestinationReadable",
            Event::DestinationWritable => "DestinationWritable",
            Event::DatagramReadable => "DatagramReadable",
            Event::Resolved(_) => "Resolved",
            Event::Dialed(_) => "Dialed",
        };
        f.write_str(name)
    }
}

/// Outcome of one state-machine step.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Step {
    Continue,
    Close,
}

type Dial = Pin<Box<dyn Future<Output = io::Result<TcpStream>> + Send>>;

enum Pending {
    Lookup(Lookup),
    Dial(Dial),
}

enum Destination {
    Tcp(TcpStream),
    Udp(UdpAssociation),
}

/// Per-client protocol state machine.
///
/// The context never blocks: [`ready`](Self::ready) is the only place it
/// waits, and [`step`](Self::step) consumes the event `ready` produced with
/// non-blocking socket calls only.
pub struct ConnectionContext {
    id: ConnectionId,
    peer: SocketAddr,
    client: TcpStream,
    destination: Option<Destination>,
    state: ContextState,
    request: Option<ConnectRequest>,
    pending: Option<Pending>,
    // negotiation bytes received but not yet decoded
    inbound: BytesMut,
    to_client: BytesMut,
    to_destination: BytesMut,
    chunk: usize,
    udp_associate: bool,
    created_at: Instant,
}

impl ConnectionContext {
    pub fn new(id: ConnectionId, client: TcpStream, peer: SocketAddr, config: &Config) -> Self {
        ConnectionContext {
            id,
            peer,
            client,
            destination: None,
            state: ContextState::AwaitingHandshake,
            request: None,
            pending: None,
            inbound: BytesMut::with_capacity(NEGOTIATION_BUFFER_SIZE),
            to_client: BytesMut::new(),
            to_destination: BytesMut::new(),
            chunk: config.relay_buffer_size,
            udp_associate: config.udp_associate,
            created_at: Instant::now(),
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub fn state(&self) -> ContextState {
        self.state
    }

    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    pub fn has_destination(&self) -> bool {
        self.destination.is_some()
    }

    /// Wait until something the current state cares about is ready.
    pub async fn ready(&mut self) -> Event {
        let state = self.state;

        // A reply that did not fit in the socket buffer goes out first.
        if state != ContextState::Connected && !self.to_client.is_empty() {
            let _ = self.client.writable().await;
            return Event::ClientWritable;
        }

        match state {
            ContextState::AwaitingHandshake | ContextState::AwaitingRequest => {
                // the client may have pipelined its request behind the handshake
                if state == ContextState::AwaitingRequest && !self.inbound.is_empty() {
                    return Event::ClientReadable;
                }
                let _ = self.client.readable().await;
                Event::ClientReadable
            }
            ContextState::Resolving | ContextState::Connecting => match &mut self.pending {
                Some(Pending::Lookup(lookup)) => Event::Resolved(lookup.await),
                Some(Pending::Dial(dial)) => Event::Dialed(dial.await),
                None => Event::ClientReadable,
            },
            ContextState::Connected => {
                let client = &self.client;
                let Some(Destination::Tcp(destination)) = &self.destination else {
                    return Event::ClientReadable;
                };
                let to_client = !self.to_client.is_empty();
                let to_destination = !self.to_destination.is_empty();

                // A direction with buffered bytes waits for its writer instead
                // of reading more.
                tokio::select! {
                    _ = client.readable(), if !to_destination => Event::ClientReadable,
                    _ = destination.readable(), if !to_client => Event::DestinationReadable,
                    _ = client.writable(), if to_client => Event::ClientWritable,
                    _ = destination.writable(), if to_destination => Event::DestinationWritable,
                }
            }
            ContextState::UdpAssociated => {
                let client = &self.client;
                let Some(Destination::Udp(association)) = &mut self.destination else {
                    return Event::ClientReadable;
                };
                tokio::select! {
                    _ = client.readable() => Event::ClientReadable,
                    event = association.ready() => event,
                }
            }
            ContextState::HandshakeFailed | ContextState::RequestFailed | ContextState::Closed => {
                Event::ClientReadable
            }
        }
    }

    /// Run one transition for `event`.
    pub fn step(&mut self, event: Event) -> Step {
        trace!("[{}] {:?} in {:?}", self.id, event, self.state);

        let result = match (self.state, event) {
            (ContextState::Closed | ContextState::HandshakeFailed | ContextState::RequestFailed, _) => {
                Ok(Step::Close)
            }
            (ContextState::Connected, event) => self.on_relay(event),
            (_, Event::ClientWritable) => self.flush_client(),
            (ContextState::UdpAssociated, event) => self.on_association(event),
            (ContextState::AwaitingHandshake, Event::ClientReadable) => self.on_handshake(),
            (ContextState::AwaitingRequest, Event::ClientReadable) => self.on_request(),
            (ContextState::Resolving, Event::Resolved(result)) => self.on_resolved(result),
            (ContextState::Connecting, Event::Dialed(result)) => self.on_dialed(result),
            (state, event) => {
                trace!("[{}] ignoring {:?} in {:?}", self.id, event, state);
                Ok(Step::Continue)
            }
        };

        match result {
            Ok(Step::Continue) => Step::Continue,
            Ok(Step::Close) => {
                self.close();
                Step::Close
            }
            Err(err) => {
                if err.is_malformed() {
                    debug!("[{}] closing: {}", self.id, err);
                } else {
                    warn!("[{}] closing: {}", self.id, err);
                }
                self.close();
                Step::Close
            }
        }
    }

    /// Force-close a context that overstayed its negotiation window.
    pub fn evict(&mut self) {
        if matches!(self.state, ContextState::Resolving | ContextState::Connecting) {
            let bound = self.requested();
            if let Err(err) = self.reply(Reply::TtlExpired, bound) {
                debug!("[{}] cannot send timeout reply: {}", self.id, err);
            }
        }
        self.close();
    }

    /// Release the destination side. Calling it again is a no-op; the client
    /// socket goes away with the context itself.
    pub fn close(&mut self) {
        if self.state.is_closed() {
            return;
        }
        trace!("[{}] closed in {:?}", self.id, self.state);

        self.pending = None;
        self.destination = None;
        self.state = ContextState::Closed;
    }

    fn on_handshake(&mut self) -> Result<Step> {
        if !self.fill_inbound()? {
            debug!("[{}] client left during handshake", self.id);
            return Ok(Step::Close);
        }
        if self.inbound.is_empty() {
            return Ok(Step::Continue);
        }

        let request = match decode_handshake(&self.inbound) {
            Ok((request, consumed)) => {
                self.inbound.advance(consumed);
                request
            }
            Err(err) => {
                warn!("[{}] bad handshake: {}", self.id, err);
                return self.reject_handshake();
            }
        };

        if let Err(err) = check_version(request.version) {
            warn!("[{}] bad handshake: {}", self.id, err);
            return self.reject_handshake();
        }
        if request.methods.is_empty() {
            warn!("[{}] handshake offered no methods", self.id);
            return self.reject_handshake();
        }
        if !request.offers(METHOD_NO_AUTH) {
            warn!("[{}] only the no-auth method is supported, offered {:?}", self.id, request.methods);
            return self.reject_handshake();
        }

        self.send_to_client(&encode_handshake_reply(METHOD_NO_AUTH))?;
        self.state = ContextState::AwaitingRequest;
        debug!("[{}] handshake done", self.id);
        Ok(Step::Continue)
    }

    fn reject_handshake(&mut self) -> Result<Step> {
        self.state = ContextState::HandshakeFailed;
        self.send_to_client(&encode_handshake_reply(METHOD_NO_ACCEPTABLE))?;
        Ok(Step::Close)
    }

    fn on_request(&mut self) -> Result<Step> {
        if !self.fill_inbound()? {
            debug!("[{}] client left before sending a request", self.id);
            return Ok(Step::Close);
        }
        if self.inbound.is_empty() {
            return Ok(Step::Continue);
        }

        let request = match decode_connect_request(&self.inbound) {
            Ok((request, consumed)) => {
                self.inbound.advance(consumed);
                request
            }
            Err(err) => {
                warn!("[{}] bad request: {}", self.id, err);
                return self.fail_request(err.reply(), AddressSpec::unspecified());
            }
        };

        if let Err(err) = check_version(request.version) {
            warn!("[{}] bad request: {}", self.id, err);
            return self.fail_request(err.reply(), request.destination);
        }

        debug!("[{}] {:?} {}", self.id, request.command, request.destination);

        match request.command {
            Command::Connect => self.start_connect(request),
            Command::UdpAssociate if self.udp_associate => self.start_association(request),
            command => {
                warn!("[{}] command {:?} not supported", self.id, command);
                self.fail_request(Reply::CommandNotSupported, request.destination)
            }
        }
    }

    fn fail_request(&mut self, reply: Reply, bound: AddressSpec) -> Result<Step> {
        self.state = ContextState::RequestFailed;
        self.reply(reply, bound)?;
        Ok(Step::Close)
    }

    fn start_connect(&mut self, request: ConnectRequest) -> Result<Step> {
        let destination = request.destination.clone();
        self.request = Some(request);

        match destination.socket_addr() {
            Some(addr) => self.dial(addr),
            None => {
                self.pending = Some(Pending::Lookup(resolver::lookup(destination)));
                self.state = ContextState::Resolving;
                Ok(Step::Continue)
            }
        }
    }

    fn on_resolved(&mut self, result: Result<SocketAddr>) -> Result<Step> {
        self.pending = None;
        match result {
            Ok(addr) => self.dial(addr),
            Err(err) => {
                warn!("[{}] {}", self.id, err);
                self.fail_request(err.reply(), self.requested())
            }
        }
    }

    fn dial(&mut self, addr: SocketAddr) -> Result<Step> {
        let socket = if addr.is_ipv4() {
            TcpSocket::new_v4()
        } else {
            TcpSocket::new_v6()
        };
        let socket = match socket {
            Ok(socket) => socket,
            Err(err) => {
                warn!("[{}] cannot allocate a socket: {}", self.id, err);
                return self.fail_request(Reply::GeneralFailure, self.requested());
            }
        };

        trace!("[{}] connecting to {}", self.id, addr);
        self.pending = Some(Pending::Dial(Box::pin(socket.connect(addr))));
        self.state = ContextState::Connecting;
        Ok(Step::Continue)
    }

    fn on_dialed(&mut self, result: io::Result<TcpStream>) -> Result<Step> {
        self.pending = None;

        let stream = match result {
            Ok(stream) => stream,
            Err(err) => {
                warn!(
                    "[{}] connect to {} failed: {} (os error {:?})",
                    self.id,
                    self.requested(),
                    err,
                    err.raw_os_error()
                );
                return self.fail_request(Reply::from(&err), self.requested());
            }
        };

        let bound = match stream.local_addr() {
            Ok(bound) => bound,
            Err(err) => {
                warn!("[{}] connected socket has no local address: {}", self.id, err);
                return self.fail_request(Reply::GeneralFailure, self.requested());
            }
        };
        if let Err(err) = stream.set_nodelay(true) {
            trace!("[{}] set_nodelay: {}", self.id, err);
        }

        self.reply(Reply::Succeeded, AddressSpec::from(bound))?;

        // payload the client sent right behind its request
        if !self.inbound.is_empty() {
            let early = self.inbound.split();
            self.to_destination.unsplit(early);
        }

        info!("[{}] {} connected to {} via {}", self.id, self.peer, self.requested(), bound);
        self.destination = Some(Destination::Tcp(stream));
        self.state = ContextState::Connected;
        Ok(Step::Continue)
    }

    fn start_association(&mut self, request: ConnectRequest) -> Result<Step> {
        let local_ip = self.client.local_addr()?.ip();
        let association =
            match UdpAssociation::bind(self.id, local_ip, self.peer.ip(), &request.destination) {
                Ok(association) => association,
                Err(err) => {
                    warn!("[{}] cannot allocate a udp socket: {}", self.id, err);
                    return self.fail_request(Reply::GeneralFailure, request.destination);
                }
            };
        let bound = association.local_addr()?;

        self.reply(Reply::Succeeded, AddressSpec::from(bound))?;

        info!("[{}] {} associated udp relay on {}", self.id, self.peer, bound);
        self.request = Some(request);
        self.destination = Some(Destination::Udp(association));
        self.state = ContextState::UdpAssociated;
        Ok(Step::Continue)
    }

    fn on_relay(&mut self, event: Event) -> Result<Step> {
        let Some(Destination::Tcp(destination)) = &self.destination else {
            return Ok(Step::Close);
        };

        let progress = match event {
            Event::ClientReadable => {
                relay::relay_chunk(&self.client, destination, &mut self.to_destination, self.chunk)?
            }
            Event::DestinationReadable => {
                relay::relay_chunk(destination, &self.client, &mut self.to_client, self.chunk)?
            }
            Event::ClientWritable => {
                relay::flush(&self.client, &mut self.to_client)?;
                Progress::Idle
            }
            Event::DestinationWritable => {
                relay::flush(destination, &mut self.to_destination)?;
                Progress::Idle
            }
            _ => Progress::Idle,
        };

        if progress != Progress::Eof {
            return Ok(Step::Continue);
        }

        // one last attempt for whatever the other direction still holds
        let _ = relay::flush(&self.client, &mut self.to_client);
        let _ = relay::flush(destination, &mut self.to_destination);
        debug!("[{}] relay finished", self.id);
        Ok(Step::Close)
    }

    fn on_association(&mut self, event: Event) -> Result<Step> {
        let Some(Destination::Udp(association)) = &mut self.destination else {
            return Ok(Step::Close);
        };

        match event {
            Event::ClientReadable => {
                let mut buf = [0u8; CONTROL_BUFFER_SIZE];
                match self.client.try_read(&mut buf) {
                    Ok(0) => {
                        debug!("[{}] control connection closed, ending udp association", self.id);
                        return Ok(Step::Close);
                    }
                    Ok(n) => warn!("[{}] ignoring {} unexpected bytes on control connection", self.id, n),
                    Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {}
                    Err(e) => return Err(e.into()),
                }
            }
            Event::DatagramReadable => association.on_readable()?,
            Event::Resolved(result) => association.on_resolved(result)?,
            _ => {}
        }
        Ok(Step::Continue)
    }

    fn flush_client(&mut self) -> Result<Step> {
        relay::flush(&self.client, &mut self.to_client)?;
        Ok(Step::Continue)
    }

    /// Read whatever the client has. `false` means the client hung up.
    fn fill_inbound(&mut self) -> io::Result<bool> {
        self.inbound.reserve(NEGOTIATION_BUFFER_SIZE);
        match self.client.try_read_buf(&mut self.inbound) {
            Ok(0) => Ok(false),
            Ok(n) => {
                trace!("[{}] read {} bytes", self.id, n);
                Ok(true)
            }
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => Ok(true),
            Err(e) => Err(e),
        }
    }

    fn reply(&mut self, reply: Reply, bound: AddressSpec) -> Result<()> {
        let data = encode_connect_reply(&ConnectReply::new(reply, bound))?;
        self.send_to_client(&data)
    }

    fn send_to_client(&mut self, data: &[u8]) -> Result<()> {
        self.to_client.extend_from_slice(data);
        relay::flush(&self.client, &mut self.to_client)?;
        Ok(())
    }

    fn requested(&self) -> AddressSpec {
        self.request
            .as_ref()
            .map(|request| request.destination.clone())
            .unwrap_or_else(AddressSpec::unspecified)
    }
}

impl fmt::Debug for ConnectionContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionContext")
            .field("id", &self.id)
            .field("peer", &self.peer)
            .field("state", &self.state)
            .field("has_destination", &self.destination.is_some())
            .finish()
    }
}
