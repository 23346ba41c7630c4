use std::io::Write;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::AtomicBool;
use std::time::Duration;

use obci_duo::{
    check_distinct, load_device_config, Bridge, BridgeOptions, BridgeState, ConfigError, StopReason,
};

fn shipped_config(name: &str) -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR"))
        .join("../../configs")
        .join(name)
}

#[test]
fn shipped_configs_are_valid() {
    for name in ["cyton_1.yml", "cyton_2.yml", "synthetic_1.yml", "synthetic_2.yml"] {
        load_device_config(shipped_config(name)).unwrap_or_else(|e| panic!("{name}: {e}"));
    }
    let first = load_device_config(shipped_config("cyton_1.yml")).unwrap();
    let second = load_device_config(shipped_config("cyton_2.yml")).unwrap();
    check_distinct(&first, &second).unwrap();
    assert_eq!(second.session.commands.len(), 16);
}

#[test]
fn missing_serial_port_is_a_config_error() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    writeln!(
        file,
        "args:\n  board_id: 0\n  name: n\n  uid: u\n  data_type: [EEG]\n  \
         channel_names:\n    EEG: a,b,c,d,e,f,g,h\n  max_time: 10"
    )
    .unwrap();
    match load_device_config(file.path()) {
        Err(ConfigError::MissingKeys(keys)) => assert_eq!(keys, vec!["serial_port"]),
        other => panic!("expected missing serial_port, got {:?}", other.map(|c| c.stream_name())),
    }
}

#[test]
fn synthetic_boards_stream_and_are_discoverable() {
    let first = load_device_config(shipped_config("synthetic_1.yml")).unwrap();
    let second = load_device_config(shipped_config("synthetic_2.yml")).unwrap();

    let mut bridge = Bridge::from_configs(
        &first,
        &second,
        BridgeOptions {
            max_ticks: Some(40),
            discovery: Some(SocketAddr::from(([127, 0, 0, 1], 0))),
            ..BridgeOptions::default()
        },
    );
    bridge.start().unwrap();
    let discovery = bridge.discovery_addr().expect("discovery bound");

    let runner = std::thread::spawn(move || {
        let summary = bridge.run(&AtomicBool::new(false)).unwrap();
        (summary, bridge.state())
    });

    let found = lsl_outlet::resolve(discovery, "", Duration::from_millis(200)).unwrap();
    let mut names: Vec<_> = found.iter().map(|a| a.name.clone()).collect();
    names.sort();
    assert_eq!(names, vec!["obci_eeg1_synthetic1", "obci_eeg2_synthetic2"]);
    let first_ad = found.iter().find(|a| a.name == "obci_eeg1_synthetic1").unwrap();
    assert_eq!(first_ad.channel_count, 11);
    assert_eq!(first_ad.source_id, "obci_eeg1_uid_synthetic1");
    assert_eq!(first_ad.nominal_srate, 250.0);
    assert_eq!(first_ad.session_id, "default");
    assert_ne!(first_ad.data_port, 0);

    let (summary, state) = runner.join().unwrap();
    assert_eq!(summary.reason, StopReason::TickBudget);
    assert_eq!(state, BridgeState::Stopped);
    assert!(summary.devices.iter().all(|d| d.frames > 0 && d.failure.is_none()));
}
