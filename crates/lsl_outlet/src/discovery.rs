//! UDP stream discovery.
//!
//! A query is the datagram
//!
//! ```text
//! LSL:shortinfo\r\n<query>\r\n<return-port> <query-id>\r\n
//! ```
//!
//! where `<query>` is empty or a conjunction of `key='value'` terms joined by `and`
//! (`name`, `type`, `source_id`, `session_id`, ...). Every matching stream answers
//! `<query-id>\r\n<shortinfo xml>` to the sender's address on the return port.

use std::io::ErrorKind;
use std::net::{Ipv4Addr, SocketAddr, UdpSocket};
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::PublishResult;
use crate::publisher::Advertisement;

pub const LSL_MULTICAST_PORT: u16 = 16571;
pub const LSL_MULTICAST_ADDR: Ipv4Addr = Ipv4Addr::new(224, 0, 0, 183);
/// Site-local group queried by resolvers alongside the link-local one.
pub const LSL_SITE_MULTICAST_ADDR: Ipv4Addr = Ipv4Addr::new(239, 255, 172, 215);

pub(crate) const SHORTINFO: &str = "LSL:shortinfo";
const MAX_DATAGRAM: usize = 65_507;

/// A parsed `LSL:shortinfo` datagram.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct ShortinfoRequest<'a> {
    pub query: &'a str,
    pub return_port: u16,
    pub query_id: &'a str,
}

pub(crate) fn parse_shortinfo(text: &str) -> Option<ShortinfoRequest<'_>> {
    let mut lines = text.lines();
    if lines.next()?.trim() != SHORTINFO {
        return None;
    }
    let query = lines.next()?.trim();
    let mut tail = lines.next()?.split_whitespace();
    let return_port = tail.next()?.parse().ok()?;
    let query_id = tail.next()?;
    Some(ShortinfoRequest {
        query,
        return_port,
        query_id,
    })
}

/// Send one reply per matching advertisement. Returns how many were sent.
pub(crate) fn answer_query<'a>(
    socket: &UdpSocket,
    peer: SocketAddr,
    request: &ShortinfoRequest<'_>,
    adverts: impl IntoIterator<Item = &'a Advertisement>,
) -> usize {
    let reply_to = SocketAddr::new(peer.ip(), request.return_port);
    let mut sent = 0;
    for advert in adverts.into_iter().filter(|a| matches_query(request.query, a)) {
        let reply = format!("{}\r\n{}", request.query_id, advert.xml);
        match socket.send_to(reply.as_bytes(), reply_to) {
            Ok(_) => sent += 1,
            Err(e) => warn!("Discovery reply to {} failed: {}", reply_to, e),
        }
    }
    sent
}

/// Answers discovery queries for every stream declared by this process.
pub struct DiscoveryResponder {
    socket: UdpSocket,
    adverts: Vec<Advertisement>,
    buf: Vec<u8>,
    answered: u64,
}

impl DiscoveryResponder {
    /// Bind the responder. On the well-known port it also joins the discovery
    /// multicast groups.
    pub fn bind(addr: SocketAddr) -> PublishResult<Self> {
        let socket = UdpSocket::bind(addr)?;
        socket.set_nonblocking(true)?;

        if addr.port() == LSL_MULTICAST_PORT {
            for group in [LSL_MULTICAST_ADDR, LSL_SITE_MULTICAST_ADDR] {
                if let Err(e) = socket.join_multicast_v4(&group, &Ipv4Addr::UNSPECIFIED) {
                    warn!("Could not join {}: {}", group, e);
                }
            }
        }
        info!("Discovery responder listening on {}", socket.local_addr()?);

        Ok(Self {
            socket,
            adverts: Vec::new(),
            buf: vec![0u8; MAX_DATAGRAM],
            answered: 0,
        })
    }

    pub fn local_addr(&self) -> PublishResult<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }

    pub fn add(&mut self, advert: Advertisement) {
        self.adverts.push(advert);
    }

    pub fn adverts(&self) -> &[Advertisement] {
        &self.adverts
    }

    /// Queries answered so far.
    pub fn answered(&self) -> u64 {
        self.answered
    }

    /// Answer every pending query without blocking. Returns the number of queries
    /// that matched at least one stream.
    pub fn serve(&mut self) -> PublishResult<usize> {
        let mut handled = 0;
        loop {
            let (len, peer) = match self.socket.recv_from(&mut self.buf) {
                Ok(r) => r,
                Err(e) if e.kind() == ErrorKind::WouldBlock => break,
                // ICMP port-unreachable from an earlier reply
                Err(e) if matches!(e.kind(), ErrorKind::ConnectionReset | ErrorKind::Interrupted) => continue,
                Err(e) => return Err(e.into()),
            };
            let text = String::from_utf8_lossy(&self.buf[..len]);
            let Some(request) = parse_shortinfo(&text) else {
                debug!("Ignoring datagram from {}", peer);
                continue;
            };

            if answer_query(&self.socket, peer, &request, &self.adverts) > 0 {
                debug!("Answered query {:?} from {}", request.query, peer);
                handled += 1;
                self.answered += 1;
            }
        }
        Ok(handled)
    }
}

/// Whether `advert` satisfies every `key='value'` term of `query`.
///
/// Terms are joined by `and`; an empty query matches everything. Unknown keys and
/// unsupported expressions match nothing.
pub fn matches_query(query: &str, advert: &Advertisement) -> bool {
    let query = query.trim();
    if query.is_empty() {
        return true;
    }
    query.split(" and ").all(|term| {
        let term = term.trim();
        let term = term
            .strip_prefix('(')
            .and_then(|t| t.strip_suffix(')'))
            .unwrap_or(term);
        let Some((key, value)) = term.split_once('=') else {
            debug!("Unsupported query term {:?}", term);
            return false;
        };
        let value = value.trim();
        let value = value
            .strip_prefix('\'')
            .and_then(|v| v.strip_suffix('\''))
            .or_else(|| value.strip_prefix('"').and_then(|v| v.strip_suffix('"')))
            .unwrap_or(value);
        let Some(actual) = advert.field(key.trim()) else {
            return false;
        };
        match (actual.parse::<f64>(), value.parse::<f64>()) {
            (Ok(a), Ok(b)) => a == b,
            _ => actual == value,
        }
    })
}

/// Send one discovery query to `target` and collect the answers until `timeout`.
pub fn resolve(target: SocketAddr, query: &str, timeout: Duration) -> PublishResult<Vec<Advertisement>> {
    let local = if target.ip().is_loopback() {
        SocketAddr::from(([127, 0, 0, 1], 0))
    } else {
        SocketAddr::from(([0, 0, 0, 0], 0))
    };
    let socket = UdpSocket::bind(local)?;
    let query_id = (Uuid::new_v4().as_u128() as u64).to_string();
    let request = format!(
        "{}\r\n{}\r\n{} {}\r\n",
        SHORTINFO,
        query.trim(),
        socket.local_addr()?.port(),
        query_id
    );
    socket.send_to(request.as_bytes(), target)?;

    let deadline = Instant::now() + timeout;
    let mut found: Vec<Advertisement> = Vec::new();
    let mut buf = vec![0u8; MAX_DATAGRAM];
    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            break;
        }
        socket.set_read_timeout(Some(remaining))?;
        let len = match socket.recv_from(&mut buf) {
            Ok((len, _)) => len,
            Err(e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => break,
            Err(e) => return Err(e.into()),
        };
        let reply = String::from_utf8_lossy(&buf[..len]);
        let Some((id, xml)) = reply.split_once('\n') else {
            continue;
        };
        if id.trim() != query_id {
            continue;
        }
        match Advertisement::from_xml(xml) {
            Some(advert) if !found.iter().any(|a| a.uid == advert.uid) => found.push(advert),
            Some(_) => {}
            None => warn!("Malformed discovery reply"),
        }
    }
    Ok(found)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::info::StreamInfo;
    use obci_types::{ChannelDesc, DataType, SessionDescriptor};

    fn advert(name: &str, source_id: &str) -> Advertisement {
        let descriptor = SessionDescriptor {
            sample_rate: 250.0,
            channels: (0..11)
                .map(|i| ChannelDesc { label: format!("ch{}", i), data_type: DataType::Eeg })
                .collect(),
        };
        let mut info = StreamInfo::new(name, "EEG_AUX", source_id, &descriptor);
        info.data_port = 40000;
        info.service_port = 40001;
        Advertisement::new(&info)
    }

    #[test]
    fn empty_query_matches_everything() {
        assert!(matches_query("", &advert("a", "1")));
    }

    #[test]
    fn queries_select_by_field() {
        let a = advert("obci_eeg1_COM3", "uid_COM3");
        assert!(matches_query("name='obci_eeg1_COM3'", &a));
        assert!(matches_query("type='EEG_AUX' and source_id='uid_COM3'", &a));
        assert!(matches_query("session_id='default'", &a));
        assert!(matches_query("channel_count=11 and nominal_srate='250.0'", &a));
        assert!(!matches_query("name='other'", &a));
        assert!(!matches_query("contains(name,'COM3')", &a));
        assert!(!matches_query("v4address=''", &a));
    }

    #[test]
    fn liblsl_request_framing_is_parsed() {
        let request = parse_shortinfo("LSL:shortinfo\r\nsession_id='default'\r\n16574 12345\r\n").unwrap();
        assert_eq!(request.query, "session_id='default'");
        assert_eq!(request.return_port, 16574);
        assert_eq!(request.query_id, "12345");

        let empty = parse_shortinfo("LSL:shortinfo\r\n\r\n16574 7\r\n").unwrap();
        assert_eq!(empty.query, "");
        assert!(parse_shortinfo("LSL:shortinfo name=x").is_none());
        assert!(parse_shortinfo("LSL:timedata\r\n1 2.0\r\n").is_none());
    }

    #[test]
    fn liblsl_query_is_answered_on_return_port() {
        let mut responder = DiscoveryResponder::bind(SocketAddr::from(([127, 0, 0, 1], 0))).unwrap();
        responder.add(advert("first", "uid_1"));
        responder.add(advert("second", "uid_2"));
        let target = responder.local_addr().unwrap();

        let client = UdpSocket::bind("127.0.0.1:0").unwrap();
        client.set_read_timeout(Some(Duration::from_millis(500))).unwrap();
        let port = client.local_addr().unwrap().port();
        let query = format!("LSL:shortinfo\r\nsession_id='default' and name='second'\r\n{} 12345\r\n", port);
        client.send_to(query.as_bytes(), target).unwrap();

        let deadline = Instant::now() + Duration::from_millis(500);
        while responder.answered() == 0 && Instant::now() < deadline {
            responder.serve().unwrap();
            std::thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(responder.answered(), 1);

        let mut buf = [0u8; 4096];
        let (len, _) = client.recv_from(&mut buf).unwrap();
        let reply = std::str::from_utf8(&buf[..len]).unwrap();
        let xml = reply.strip_prefix("12345\r\n").expect("reply starts with the query id");
        let found = Advertisement::from_xml(xml).unwrap();
        assert_eq!(found.name, "second");
        assert_eq!(found.data_port, 40000);
        assert_eq!(found.service_port, 40001);
        assert_eq!(found.channel_count, 11);
    }

    #[test]
    fn unicast_resolve_lists_all_streams() {
        let mut responder = DiscoveryResponder::bind(SocketAddr::from(([127, 0, 0, 1], 0))).unwrap();
        responder.add(advert("first", "uid_1"));
        responder.add(advert("second", "uid_2"));
        let target = responder.local_addr().unwrap();

        let handle = std::thread::spawn(move || {
            let deadline = Instant::now() + Duration::from_millis(500);
            while Instant::now() < deadline {
                responder.serve().unwrap();
                std::thread::sleep(Duration::from_millis(5));
            }
            responder.answered()
        });

        let found = resolve(target, "session_id='default'", Duration::from_millis(300)).unwrap();
        let names: Vec<_> = found.iter().map(|a| a.name.as_str()).collect();
        assert_eq!(names, vec!["first", "second"]);
        assert_eq!(found[0].data_port, 40000);
        assert_eq!(handle.join().unwrap(), 1);
    }
}
