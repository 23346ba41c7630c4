use std::io::{Read, Write};
use std::net::{SocketAddr, TcpStream, UdpSocket};
use std::time::{Duration, Instant};

use lsl_outlet::{LslOutlet, OutletOptions, StreamInfo, StreamPublisher};
use obci_types::{ChannelDesc, DataType, SampleBatch, SessionDescriptor};

fn descriptor() -> SessionDescriptor {
    SessionDescriptor {
        sample_rate: 250.0,
        channels: vec![
            ChannelDesc { label: "Fp1".into(), data_type: DataType::Eeg },
            ChannelDesc { label: "Fp2".into(), data_type: DataType::Eeg },
            ChannelDesc { label: "A5".into(), data_type: DataType::Stim },
        ],
    }
}

fn loopback_outlet(timestamp_offset: f64) -> LslOutlet {
    LslOutlet::new(OutletOptions {
        bind_addr: SocketAddr::from(([127, 0, 0, 1], 0)),
        timestamp_offset,
        ..OutletOptions::default()
    })
}

fn connect(outlet: &LslOutlet) -> TcpStream {
    let client = TcpStream::connect(outlet.local_addr().unwrap()).unwrap();
    client.set_read_timeout(Some(Duration::from_secs(2))).unwrap();
    client
}

/// Send the request a liblsl inlet sends when it opens a data connection.
fn send_streamfeed(client: &mut TcpStream, uid: &str) {
    write!(
        client,
        "LSL:streamfeed/110 {}\r\n\
         Native-Byte-Order: 1234\r\n\
         Endian-Performance: 0\r\n\
         Has-IEEE754-Floats: 1\r\n\
         Supports-Subnormals: 1\r\n\
         Value-Size: 8\r\n\
         Data-Protocol-Version: 110\r\n\
         Max-Buffer-Length: 360\r\n\
         Max-Chunk-Length: 0\r\n\
         Hostname: test\r\n\
         Source-Id: \r\n\
         Session-Id: default\r\n\
         \r\n",
        uid
    )
    .unwrap();
}

/// Poll the outlet until `done` holds or two seconds pass.
fn poll_until(outlet: &mut LslOutlet, mut done: impl FnMut(&mut LslOutlet, usize) -> bool) {
    let deadline = Instant::now() + Duration::from_secs(2);
    loop {
        let subscribed = outlet.poll_clients();
        if done(outlet, subscribed) {
            return;
        }
        assert!(Instant::now() < deadline, "outlet did not get there in time");
        std::thread::sleep(Duration::from_millis(5));
    }
}

fn subscribe(outlet: &mut LslOutlet, uid: &str) -> TcpStream {
    let mut client = connect(outlet);
    send_streamfeed(&mut client, uid);
    let before = outlet.client_count();
    poll_until(outlet, |o, _| o.client_count() > before);
    client
}

/// Response lines up to the blank line that ends them.
fn read_response_head(stream: &mut TcpStream) -> Vec<String> {
    let mut head = Vec::new();
    let mut byte = [0u8; 1];
    while !head.ends_with(b"\r\n\r\n") {
        stream.read_exact(&mut byte).unwrap();
        head.push(byte[0]);
    }
    String::from_utf8(head)
        .unwrap()
        .split("\r\n")
        .filter(|l| !l.is_empty())
        .map(str::to_string)
        .collect()
}

fn read_sample(stream: &mut TcpStream, channels: usize) -> (f64, Vec<f64>) {
    let mut tag = [0u8; 1];
    stream.read_exact(&mut tag).unwrap();
    assert_eq!(tag[0], 2, "timestamp is transmitted with every sample");
    let mut buf = vec![0u8; 8 * (channels + 1)];
    stream.read_exact(&mut buf).unwrap();
    let mut values = buf
        .chunks_exact(8)
        .map(|c| f64::from_le_bytes(c.try_into().unwrap()));
    let ts = values.next().unwrap();
    (ts, values.collect())
}

fn batch(first_index: u64, frames: &[([f64; 3], f64)]) -> SampleBatch {
    let mut batch = SampleBatch::new(first_index, 3);
    for (values, ts) in frames {
        batch.push_frame(values, *ts).unwrap();
    }
    batch
}

#[test]
fn streamfeed_subscriber_receives_test_patterns_then_unchanged_values() {
    let mut outlet = loopback_outlet(0.25);
    let info = StreamInfo::new("obci_eeg1_/dev/ttyUSB0", "EEG_AUX", "uid_/dev/ttyUSB0", &descriptor());
    let ad = outlet.declare(info).unwrap();

    let mut client = subscribe(&mut outlet, &ad.uid);
    assert_eq!(client.peer_addr().unwrap().port(), ad.data_port);
    assert_eq!(
        outlet
            .publish(batch(0, &[([12.5, -7.125, 1.0], 100.0), ([13.5, -8.0, 0.0], 100.004)]))
            .unwrap(),
        2
    );

    let head = read_response_head(&mut client);
    assert_eq!(head[0], "LSL/110 200 OK");
    assert!(head.contains(&format!("UID: {}", ad.uid)));
    assert!(head.contains(&"Byte-Order: 1234".to_string()));
    assert!(head.contains(&"Data-Protocol-Version: 110".to_string()));

    let (ts, values) = read_sample(&mut client, 3);
    assert_eq!(ts, 123456.789);
    assert_eq!(values, vec![16_777_221.0, -16_777_222.0, 16_777_223.0]);
    let (_, values) = read_sample(&mut client, 3);
    assert_eq!(values, vec![16_777_219.0, -16_777_220.0, 16_777_221.0]);

    let (ts, values) = read_sample(&mut client, 3);
    assert_eq!(ts, 99.75);
    assert_eq!(values, vec![12.5, -7.125, 1.0]);
    let (ts, values) = read_sample(&mut client, 3);
    assert!((ts - 99.754).abs() < 1e-9);
    assert_eq!(values, vec![13.5, -8.0, 0.0]);
}

#[test]
fn fullinfo_request_returns_channel_description() {
    let mut outlet = loopback_outlet(0.0);
    let ad = outlet
        .declare(StreamInfo::new("s", "EEG", "id", &descriptor()))
        .unwrap();

    let mut client = connect(&outlet);
    client.write_all(b"LSL:fullinfo\r\n").unwrap();
    for _ in 0..20 {
        outlet.poll_clients();
        std::thread::sleep(Duration::from_millis(5));
    }
    let mut xml = String::new();
    client.read_to_string(&mut xml).unwrap();
    assert!(xml.contains("<label>A5</label>"));
    assert!(xml.contains(&format!("<uid>{}</uid>", ad.uid)));
    assert!(xml.contains(&format!("<v4data_port>{}</v4data_port>", ad.data_port)));
    assert_eq!(outlet.client_count(), 0);
}

#[test]
fn stale_uid_is_refused() {
    let mut outlet = loopback_outlet(0.0);
    outlet
        .declare(StreamInfo::new("s", "EEG", "id", &descriptor()))
        .unwrap();

    let mut client = connect(&outlet);
    send_streamfeed(&mut client, "00000000-0000-0000-0000-000000000000");
    for _ in 0..20 {
        outlet.poll_clients();
        std::thread::sleep(Duration::from_millis(5));
    }
    let mut reply = String::new();
    client.read_to_string(&mut reply).unwrap();
    assert!(reply.starts_with("LSL/110 404"));
    assert_eq!(outlet.client_count(), 0);
}

#[test]
fn broken_connections_leave_subscribers_streaming() {
    let mut outlet = loopback_outlet(0.0);
    let ad = outlet
        .declare(StreamInfo::new("s", "EEG", "id", &descriptor()))
        .unwrap();
    let mut subscriber = subscribe(&mut outlet, &ad.uid);

    // closes without a request
    drop(connect(&outlet));
    // speaks another protocol
    let mut stranger = connect(&outlet);
    stranger.write_all(b"GET / HTTP/1.1\r\n\r\n").unwrap();
    // closes halfway through the request
    let mut quitter = connect(&outlet);
    quitter.write_all(b"LSL:streamfeed/110 ").unwrap();
    drop(quitter);

    for _ in 0..20 {
        assert_eq!(outlet.poll_clients(), 0);
        std::thread::sleep(Duration::from_millis(5));
    }
    assert_eq!(outlet.publish(batch(0, &[([1.0, 2.0, 3.0], 5.0)])).unwrap(), 1);
    assert_eq!(outlet.client_count(), 1);

    read_response_head(&mut subscriber);
    read_sample(&mut subscriber, 3);
    read_sample(&mut subscriber, 3);
    assert_eq!(read_sample(&mut subscriber, 3), (5.0, vec![1.0, 2.0, 3.0]));
    drop(stranger);
}

#[test]
fn departed_subscriber_is_dropped() {
    let mut outlet = loopback_outlet(0.0);
    let ad = outlet
        .declare(StreamInfo::new("s", "EEG", "id", &descriptor()))
        .unwrap();

    let client = subscribe(&mut outlet, &ad.uid);
    assert_eq!(outlet.client_count(), 1);
    drop(client);

    // the first write after the peer closes may still succeed; later ones fail
    for i in 0..50 {
        outlet.publish(batch(i, &[([0.0; 3], i as f64)])).unwrap();
        if outlet.client_count() == 0 {
            break;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
    assert_eq!(outlet.client_count(), 0);
}

#[test]
fn service_port_answers_time_sync_and_unicast_queries() {
    let mut outlet = loopback_outlet(0.0);
    let ad = outlet
        .declare(StreamInfo::new("s", "EEG", "id", &descriptor()))
        .unwrap();
    let service = outlet.service_addr().unwrap();
    assert_eq!(service.port(), ad.service_port);

    let client = UdpSocket::bind("127.0.0.1:0").unwrap();
    client.set_read_timeout(Some(Duration::from_secs(2))).unwrap();
    client.send_to(b"LSL:timedata\r\n7 1.5\r\n", service).unwrap();
    let query = format!(
        "LSL:shortinfo\r\nname='s'\r\n{} 99\r\n",
        client.local_addr().unwrap().port()
    );
    client.send_to(query.as_bytes(), service).unwrap();
    for _ in 0..20 {
        outlet.service().unwrap();
        std::thread::sleep(Duration::from_millis(5));
    }

    let mut buf = [0u8; 4096];
    let mut replies = Vec::new();
    for _ in 0..2 {
        let (len, _) = client.recv_from(&mut buf).unwrap();
        replies.push(String::from_utf8(buf[..len].to_vec()).unwrap());
    }
    let time = replies.iter().find(|r| r.starts_with(' ')).expect("time reply");
    let fields: Vec<f64> = time.split_whitespace().map(|f| f.parse().unwrap()).collect();
    assert_eq!(fields[..2], [7.0, 1.5]);
    let info = replies.iter().find(|r| r.starts_with("99\r\n")).expect("shortinfo reply");
    assert!(info.contains(&format!("<uid>{}</uid>", ad.uid)));
}
