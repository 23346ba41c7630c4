use std::io::{self, ErrorKind, Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream, UdpSocket};
use std::time::{Duration, Instant};

use obci_types::{local_clock, SampleBatch};
use tracing::{debug, info, warn};

use crate::discovery::{answer_query, matches_query, parse_shortinfo, SHORTINFO};
use crate::error::{PublishError, PublishResult};
use crate::info::{StreamInfo, PROTOCOL_VERSION};
use crate::publisher::{Advertisement, StreamPublisher};

const FULLINFO: &str = "LSL:fullinfo";
const STREAMFEED: &str = "LSL:streamfeed";
const TIMEDATA: &str = "LSL:timedata";

/// Connections that have not sent a complete request by then are dropped.
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);
const MAX_REQUEST: usize = 16 * 1024;
const MAX_SERVICE_DATAGRAM: usize = 4096;

const TAG_TRANSMITTED_TIMESTAMP: u8 = 2;
const TEST_PATTERN_TIMESTAMP: f64 = 123456.789;

/// Outlet settings.
#[derive(Debug, Clone)]
pub struct OutletOptions {
    /// Address for the data listener and service socket; port 0 picks a free port
    pub bind_addr: SocketAddr,
    /// Longest a slow client may block a push before it is dropped
    pub write_timeout: Duration,
    /// Seconds subtracted from every timestamp
    pub timestamp_offset: f64,
}

impl Default for OutletOptions {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 0)),
            write_timeout: Duration::from_millis(5),
            timestamp_offset: 0.0,
        }
    }
}

/// A connection that has not finished its request yet.
struct Pending {
    peer: SocketAddr,
    stream: TcpStream,
    request: Vec<u8>,
    since: Instant,
}

enum Handshake {
    Incomplete,
    /// Request served; the connection is closed
    Answered,
    /// Stream feed accepted; samples follow
    Subscribed,
}

#[derive(Debug, PartialEq)]
enum Request<'a> {
    FullInfo,
    ShortInfo { query: &'a str },
    StreamFeed { version: u16, uid: &'a str, data_version: u16 },
}

/// `Ok(None)` while more bytes are needed.
fn parse_request(text: &str) -> Result<Option<Request<'_>>, String> {
    let Some(line_end) = text.find('\n') else {
        return Ok(None);
    };
    let first = text[..line_end].trim();
    let rest = &text[line_end + 1..];

    if first == FULLINFO {
        return Ok(Some(Request::FullInfo));
    }
    if first == SHORTINFO {
        return Ok(rest.find('\n').map(|end| Request::ShortInfo { query: rest[..end].trim() }));
    }
    let Some(feed) = first.strip_prefix(STREAMFEED) else {
        return Err(format!("unknown request {:?}", first));
    };
    let Some(feed) = feed.strip_prefix('/') else {
        return Err("protocol 1.00 stream feeds are not supported".to_string());
    };
    let mut parts = feed.split_whitespace();
    let version: u16 = parts
        .next()
        .and_then(|v| v.parse().ok())
        .ok_or_else(|| format!("malformed request line {:?}", first))?;
    let uid = parts.next().unwrap_or("");

    let mut data_version = version;
    for line in rest.split_inclusive('\n') {
        if !line.ends_with('\n') {
            break;
        }
        let line = line.trim();
        if line.is_empty() {
            return Ok(Some(Request::StreamFeed {
                version,
                uid,
                data_version,
            }));
        }
        if let Some((key, value)) = line.split_once(':') {
            if key.trim().eq_ignore_ascii_case("data-protocol-version") {
                data_version = value.trim().parse().unwrap_or(data_version);
            }
        }
    }
    Ok(None)
}

/// Reply to `LSL:timedata\r\n<wave-id> <t0>\r\n`: the wave id, the requester's
/// time, then receive and send times on the local clock.
fn time_reply(text: &str) -> Option<String> {
    let mut lines = text.lines();
    if lines.next()?.trim() != TIMEDATA {
        return None;
    }
    let mut fields = lines.next()?.split_whitespace();
    let wave_id: i64 = fields.next()?.parse().ok()?;
    let t0: f64 = fields.next()?.parse().ok()?;
    let t1 = local_clock();
    Some(format!(" {} {} {} {}", wave_id, t0, t1, local_clock()))
}

/// Known values sent ahead of the data so subscribers can check the encoding.
fn test_pattern(channels: usize, offset: u32) -> Vec<f64> {
    (0..channels)
        .map(|k| {
            let sign = if k % 2 == 0 { 1.0 } else { -1.0 };
            (k as f64 + f64::from(offset) + 16_777_217.0) * sign
        })
        .collect()
}

/// `[tag][f64 timestamp][f64 x channels]`, little-endian.
fn push_sample(buf: &mut Vec<u8>, timestamp: f64, values: &[f64]) {
    buf.push(TAG_TRANSMITTED_TIMESTAMP);
    buf.extend_from_slice(&timestamp.to_le_bytes());
    for value in values {
        buf.extend_from_slice(&value.to_le_bytes());
    }
}

struct Declared {
    info: StreamInfo,
    advert: Advertisement,
    fullinfo: String,
    listener: TcpListener,
    service: UdpSocket,
    scratch: Vec<u8>,
    pending: Vec<Pending>,
    clients: Vec<(SocketAddr, TcpStream)>,
}

impl Declared {
    /// Queue new connections. Errors affect only the connection they occur on.
    fn accept(&mut self) {
        loop {
            match self.listener.accept() {
                Ok((stream, peer)) => {
                    if let Err(e) = stream.set_nonblocking(true) {
                        warn!("Dropping connection {} to '{}': {}", peer, self.info.name, e);
                        continue;
                    }
                    let _ = stream.set_nodelay(true);
                    debug!("Connection {} to '{}'", peer, self.info.name);
                    self.pending.push(Pending {
                        peer,
                        stream,
                        request: Vec::new(),
                        since: Instant::now(),
                    });
                }
                Err(e) if e.kind() == ErrorKind::WouldBlock => break,
                Err(e)
                    if matches!(
                        e.kind(),
                        ErrorKind::Interrupted | ErrorKind::ConnectionAborted | ErrorKind::ConnectionReset
                    ) =>
                {
                    continue
                }
                Err(e) => {
                    warn!("Accepting connections to '{}' failed: {}", self.info.name, e);
                    break;
                }
            }
        }
    }

    fn advance_pending(&mut self, write_timeout: Duration) -> usize {
        let mut subscribed = 0;
        for mut conn in std::mem::take(&mut self.pending) {
            match self.handshake(&mut conn, write_timeout) {
                Ok(Handshake::Incomplete) if conn.since.elapsed() < HANDSHAKE_TIMEOUT => self.pending.push(conn),
                Ok(Handshake::Incomplete) => {
                    warn!("Dropping connection {} to '{}': request timed out", conn.peer, self.info.name)
                }
                Ok(Handshake::Answered) => debug!("Answered {} on '{}'", conn.peer, self.info.name),
                Ok(Handshake::Subscribed) => {
                    info!("Client {} subscribed to '{}'", conn.peer, self.info.name);
                    self.clients.push((conn.peer, conn.stream));
                    subscribed += 1;
                }
                Err(e) => warn!("Dropping connection {} to '{}': {}", conn.peer, self.info.name, e),
            }
        }
        subscribed
    }

    fn handshake(&self, conn: &mut Pending, write_timeout: Duration) -> io::Result<Handshake> {
        let mut chunk = [0u8; 1024];
        loop {
            match conn.stream.read(&mut chunk) {
                Ok(0) => {
                    return Err(io::Error::new(
                        ErrorKind::UnexpectedEof,
                        "closed before completing a request",
                    ))
                }
                Ok(n) => {
                    conn.request.extend_from_slice(&chunk[..n]);
                    if conn.request.len() > MAX_REQUEST {
                        return Err(io::Error::new(ErrorKind::InvalidData, "request too long"));
                    }
                }
                Err(e) if e.kind() == ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }

        let text = String::from_utf8_lossy(&conn.request).into_owned();
        let request = match parse_request(&text) {
            Ok(Some(request)) => request,
            Ok(None) => return Ok(Handshake::Incomplete),
            Err(reason) => return Err(io::Error::new(ErrorKind::InvalidData, reason)),
        };

        conn.stream.set_nonblocking(false)?;
        conn.stream.set_write_timeout(Some(write_timeout))?;
        match request {
            Request::FullInfo => {
                conn.stream.write_all(self.fullinfo.as_bytes())?;
                Ok(Handshake::Answered)
            }
            Request::ShortInfo { query } => {
                if matches_query(query, &self.advert) {
                    conn.stream.write_all(self.advert.xml.as_bytes())?;
                }
                Ok(Handshake::Answered)
            }
            Request::StreamFeed { uid, .. } if !uid.is_empty() && uid != self.info.uid => {
                debug!("{} asked for stale uid {}", conn.peer, uid);
                write!(conn.stream, "LSL/{} 404 Not found\r\n\r\n", PROTOCOL_VERSION)?;
                Ok(Handshake::Answered)
            }
            Request::StreamFeed {
                version, data_version, ..
            } if version.min(data_version) < PROTOCOL_VERSION => {
                write!(conn.stream, "LSL/{} 505 Version not supported\r\n\r\n", PROTOCOL_VERSION)?;
                Ok(Handshake::Answered)
            }
            Request::StreamFeed { .. } => {
                let mut response = format!(
                    "LSL/{v} 200 OK\r\nUID: {uid}\r\nByte-Order: 1234\r\n\
                     Suppress-Subnormals: 0\r\nData-Protocol-Version: {v}\r\n\r\n",
                    v = PROTOCOL_VERSION,
                    uid = self.info.uid
                )
                .into_bytes();
                let channels = self.info.channel_count();
                for offset in [4, 2] {
                    push_sample(&mut response, TEST_PATTERN_TIMESTAMP, &test_pattern(channels, offset));
                }
                conn.stream.write_all(&response)?;
                Ok(Handshake::Subscribed)
            }
        }
    }

    /// Answer time-sync and unicast shortinfo datagrams on the service port.
    fn serve_datagrams(&mut self) {
        loop {
            let (len, peer) = match self.service.recv_from(&mut self.scratch) {
                Ok(r) => r,
                Err(e) if e.kind() == ErrorKind::WouldBlock => break,
                Err(e) if matches!(e.kind(), ErrorKind::ConnectionReset | ErrorKind::Interrupted) => continue,
                Err(e) => {
                    warn!("Service socket of '{}': {}", self.info.name, e);
                    break;
                }
            };
            let text = String::from_utf8_lossy(&self.scratch[..len]);
            if let Some(request) = parse_shortinfo(&text) {
                answer_query(&self.service, peer, &request, [&self.advert]);
            } else if let Some(reply) = time_reply(&text) {
                if let Err(e) = self.service.send_to(reply.as_bytes(), peer) {
                    debug!("Time reply to {} failed: {}", peer, e);
                }
            } else {
                debug!("Ignoring datagram from {}", peer);
            }
        }
    }
}

/// TCP outlet for one stream, speaking the LSL 1.10 data protocol.
pub struct LslOutlet {
    options: OutletOptions,
    declared: Option<Declared>,
    frames_sent: u64,
}

impl LslOutlet {
    pub fn new(options: OutletOptions) -> Self {
        Self {
            options,
            declared: None,
            frames_sent: 0,
        }
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.declared.as_ref().and_then(|d| d.listener.local_addr().ok())
    }

    pub fn service_addr(&self) -> Option<SocketAddr> {
        self.declared.as_ref().and_then(|d| d.service.local_addr().ok())
    }

    pub fn client_count(&self) -> usize {
        self.declared.as_ref().map_or(0, |d| d.clients.len())
    }

    pub fn frames_sent(&self) -> u64 {
        self.frames_sent
    }

    /// One non-blocking pass over the service socket and pending connections.
    /// Returns the number of new subscribers.
    pub fn service(&mut self) -> PublishResult<usize> {
        if self.declared.is_none() {
            return Err(PublishError::NotDeclared);
        }
        Ok(self.poll_clients())
    }

    fn encode(&self, batch: &SampleBatch) -> Vec<u8> {
        let mut buf = Vec::with_capacity(batch.len() * (1 + (batch.channel_count + 1) * 8));
        for (timestamp, values) in batch.frames() {
            push_sample(&mut buf, timestamp - self.options.timestamp_offset, values);
        }
        buf
    }
}

impl Default for LslOutlet {
    fn default() -> Self {
        Self::new(OutletOptions::default())
    }
}

impl StreamPublisher for LslOutlet {
    fn declare(&mut self, mut info: StreamInfo) -> Result<Advertisement, PublishError> {
        if let Some(existing) = &self.declared {
            return Err(PublishError::AlreadyDeclared(existing.info.name.clone()));
        }

        let listener = TcpListener::bind(self.options.bind_addr)?;
        listener.set_nonblocking(true)?;
        let service = UdpSocket::bind(SocketAddr::new(self.options.bind_addr.ip(), 0))?;
        service.set_nonblocking(true)?;
        info.data_port = listener.local_addr()?.port();
        info.service_port = service.local_addr()?.port();

        info!(
            "Declared stream '{}' ({}, {} channels @ {} Hz) on port {}",
            info.name,
            info.stream_type,
            info.channel_count(),
            info.nominal_srate,
            info.data_port
        );
        let advert = Advertisement::new(&info);
        self.declared = Some(Declared {
            fullinfo: info.to_xml(),
            advert: advert.clone(),
            info,
            listener,
            service,
            scratch: vec![0u8; MAX_SERVICE_DATAGRAM],
            pending: Vec::new(),
            clients: Vec::new(),
        });
        Ok(advert)
    }

    fn publish(&mut self, batch: SampleBatch) -> Result<usize, PublishError> {
        let Some(declared) = self.declared.as_ref() else {
            return Err(PublishError::NotDeclared);
        };
        if batch.channel_count != declared.info.channel_count() {
            return Err(PublishError::ChannelMismatch {
                stream: declared.info.name.clone(),
                expected: declared.info.channel_count(),
                got: batch.channel_count,
            });
        }
        if batch.is_empty() {
            return Ok(0);
        }

        let payload = self.encode(&batch);
        if let Some(declared) = self.declared.as_mut() {
            let name = &declared.info.name;
            declared.clients.retain_mut(|(peer, stream)| match stream.write_all(&payload) {
                Ok(()) => true,
                Err(e) => {
                    warn!("Dropping client {} of '{}': {}", peer, name, e);
                    false
                }
            });
            debug!("'{}': {} frames to {} clients", name, batch.len(), declared.clients.len());
        }
        self.frames_sent += batch.len() as u64;
        Ok(batch.len())
    }

    fn poll_clients(&mut self) -> usize {
        let write_timeout = self.options.write_timeout;
        let Some(declared) = self.declared.as_mut() else {
            return 0;
        };
        declared.serve_datagrams();
        declared.accept();
        declared.advance_pending(write_timeout)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use obci_types::{ChannelDesc, DataType, SessionDescriptor};

    fn info(channels: usize) -> StreamInfo {
        let descriptor = SessionDescriptor {
            sample_rate: 250.0,
            channels: (1..=channels)
                .map(|i| ChannelDesc { label: format!("ch{}", i), data_type: DataType::Eeg })
                .collect(),
        };
        StreamInfo::new("test", "EEG", "test-id", &descriptor)
    }

    fn loopback() -> OutletOptions {
        OutletOptions {
            bind_addr: SocketAddr::from(([127, 0, 0, 1], 0)),
            ..OutletOptions::default()
        }
    }

    #[test]
    fn publish_requires_declare() {
        let mut outlet = LslOutlet::new(loopback());
        let err = outlet.publish(SampleBatch::new(0, 2)).unwrap_err();
        assert!(matches!(err, PublishError::NotDeclared));
        assert!(matches!(outlet.service(), Err(PublishError::NotDeclared)));
    }

    #[test]
    fn declare_twice_is_rejected() {
        let mut outlet = LslOutlet::new(loopback());
        let ad = outlet.declare(info(2)).unwrap();
        assert_ne!(ad.data_port, 0);
        assert_ne!(ad.service_port, 0);
        assert_eq!(ad.channel_count, 2);
        assert!(ad.xml.contains(&format!("<v4data_port>{}</v4data_port>", ad.data_port)));
        assert!(matches!(outlet.declare(info(2)), Err(PublishError::AlreadyDeclared(_))));
    }

    #[test]
    fn channel_count_must_match() {
        let mut outlet = LslOutlet::new(loopback());
        outlet.declare(info(2)).unwrap();
        let mut batch = SampleBatch::new(0, 3);
        batch.push_frame(&[1.0, 2.0, 3.0], 0.0).unwrap();
        let err = outlet.publish(batch).unwrap_err();
        assert!(matches!(err, PublishError::ChannelMismatch { expected: 2, got: 3, .. }));
    }

    #[test]
    fn encode_tags_and_applies_offset() {
        let mut outlet = LslOutlet::new(OutletOptions {
            timestamp_offset: 0.5,
            ..loopback()
        });
        outlet.declare(info(1)).unwrap();
        let mut batch = SampleBatch::new(0, 1);
        batch.push_frame(&[-3.25], 10.0).unwrap();
        let bytes = outlet.encode(&batch);
        assert_eq!(bytes.len(), 17);
        assert_eq!(bytes[0], TAG_TRANSMITTED_TIMESTAMP);
        assert_eq!(f64::from_le_bytes(bytes[1..9].try_into().unwrap()), 9.5);
        assert_eq!(f64::from_le_bytes(bytes[9..].try_into().unwrap()), -3.25);
    }

    #[test]
    fn publishing_without_clients_counts_frames() {
        let mut outlet = LslOutlet::new(loopback());
        outlet.declare(info(1)).unwrap();
        let mut batch = SampleBatch::new(0, 1);
        batch.push_frame(&[1.0], 0.0).unwrap();
        batch.push_frame(&[2.0], 0.004).unwrap();
        assert_eq!(outlet.publish(batch).unwrap(), 2);
        assert_eq!(outlet.frames_sent(), 2);
        assert_eq!(outlet.client_count(), 0);
    }

    #[test]
    fn requests_wait_for_their_last_line() {
        assert_eq!(parse_request("LSL:full"), Ok(None));
        assert_eq!(parse_request("LSL:fullinfo\r\n"), Ok(Some(Request::FullInfo)));
        assert_eq!(parse_request("LSL:shortinfo\r\nname='x'"), Ok(None));
        assert_eq!(
            parse_request("LSL:shortinfo\r\nname='x'\r\n"),
            Ok(Some(Request::ShortInfo { query: "name='x'" }))
        );

        let feed = "LSL:streamfeed/110 abc\r\nNative-Byte-Order: 1234\r\nData-Protocol-Version: 100\r\n";
        assert_eq!(parse_request(feed), Ok(None));
        assert_eq!(
            parse_request(&format!("{}\r\n", feed)),
            Ok(Some(Request::StreamFeed {
                version: 110,
                uid: "abc",
                data_version: 100
            }))
        );
        assert!(parse_request("LSL:streamfeed\r\n15 0\r\n").is_err());
        assert!(parse_request("GET / HTTP/1.1\r\n").is_err());
    }

    #[test]
    fn test_pattern_alternates_sign() {
        assert_eq!(test_pattern(3, 4), vec![16_777_221.0, -16_777_222.0, 16_777_223.0]);
        assert_eq!(test_pattern(2, 2), vec![16_777_219.0, -16_777_220.0]);
    }

    #[test]
    fn time_reply_echoes_wave_and_request_time() {
        let reply = time_reply("LSL:timedata\r\n7 1.5\r\n").unwrap();
        let fields: Vec<f64> = reply.split_whitespace().map(|f| f.parse().unwrap()).collect();
        assert_eq!(fields[..2], [7.0, 1.5]);
        assert!(fields[2] <= fields[3]);
        assert!(time_reply("LSL:timedata\r\nnot a number\r\n").is_none());
    }
}
