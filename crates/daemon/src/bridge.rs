//! The two-device bridge: open both boards, declare both streams, then forward
//! samples tick by tick until interrupted, out of time, or out of devices.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use lsl_outlet::{DiscoveryResponder, LslOutlet, OutletOptions, PublishError, StreamInfo, StreamPublisher};
use obci_sensors::{create_session, AcquisitionSession, DeviceError};
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::clock::{Clock, SystemClock};
use crate::config::DeviceConfig;

/// Lifecycle of a bridge. `Stopped` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BridgeState {
    Idle,
    Starting,
    Running,
    Stopping,
    Stopped,
}

#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("Device {slot} ('{stream}'): {source}")]
    Device {
        slot: usize,
        stream: String,
        #[source]
        source: DeviceError,
    },

    #[error("Stream {slot} ('{stream}'): {source}")]
    Publish {
        slot: usize,
        stream: String,
        #[source]
        source: PublishError,
    },

    #[error("Cannot {action} a bridge in state {state:?}")]
    InvalidState {
        action: &'static str,
        state: BridgeState,
    },
}

/// Longest polling interval honoured; larger ticks are clamped to it.
pub const MAX_TICK: Duration = Duration::from_secs(3600);

#[derive(Debug, Clone)]
pub struct BridgeOptions {
    /// Polling interval, at most [`MAX_TICK`]
    pub tick: Duration,
    /// Poll offset between the devices above which a warning is logged
    pub skew_warn: Duration,
    /// Stop after this much time in `run`
    pub run_limit: Option<Duration>,
    /// Stop after this many ticks
    pub max_ticks: Option<u64>,
    /// Where to answer discovery queries; `None` disables discovery
    pub discovery: Option<SocketAddr>,
}

impl Default for BridgeOptions {
    fn default() -> Self {
        Self {
            tick: Duration::from_millis(10),
            skew_warn: Duration::from_millis(10),
            run_limit: None,
            max_ticks: None,
            discovery: None,
        }
    }
}

/// One device: its session, its publisher and the identity of its stream.
pub struct DeviceLink {
    pub stream_name: String,
    pub stream_type: String,
    pub source_id: String,
    pub session: Box<dyn AcquisitionSession>,
    pub publisher: Box<dyn StreamPublisher>,
}

impl DeviceLink {
    /// Board session plus a TCP outlet applying the configured delay.
    pub fn from_config(config: &DeviceConfig) -> Self {
        let outlet = LslOutlet::new(OutletOptions {
            timestamp_offset: config.delay,
            ..OutletOptions::default()
        });
        Self {
            stream_name: config.stream_name(),
            stream_type: config.stream_type.clone(),
            source_id: config.source_id(),
            session: create_session(config.session.clone()),
            publisher: Box::new(outlet),
        }
    }

    fn stream_info(&self) -> StreamInfo {
        StreamInfo::new(
            self.stream_name.as_str(),
            self.stream_type.as_str(),
            self.source_id.as_str(),
            &self.session.describe(),
        )
    }
}

/// Why `run` returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    Interrupted,
    TimeLimit,
    TickBudget,
    AllDevicesFailed,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DeviceStats {
    pub stream: String,
    pub frames: u64,
    pub publish_errors: u64,
    pub failure: Option<DeviceError>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RunSummary {
    pub reason: StopReason,
    pub ticks: u64,
    pub elapsed: Duration,
    pub devices: Vec<DeviceStats>,
    /// Largest offset between the two devices' poll starts within a tick
    pub max_skew: Duration,
    pub mean_skew: Duration,
}

#[derive(Debug, Default)]
struct SkewStats {
    max: Duration,
    total: Duration,
    count: u32,
}

impl SkewStats {
    fn record(&mut self, offset: Duration) {
        self.max = self.max.max(offset);
        self.total += offset;
        self.count += 1;
    }

    fn mean(&self) -> Duration {
        if self.count == 0 {
            Duration::ZERO
        } else {
            self.total / self.count
        }
    }
}

struct Slot {
    link: DeviceLink,
    failure: Option<DeviceError>,
    frames: u64,
    publish_errors: u64,
}

impl Slot {
    fn new(link: DeviceLink) -> Self {
        Self {
            link,
            failure: None,
            frames: 0,
            publish_errors: 0,
        }
    }

    fn stats(&self) -> DeviceStats {
        DeviceStats {
            stream: self.link.stream_name.clone(),
            frames: self.frames,
            publish_errors: self.publish_errors,
            failure: self.failure.clone(),
        }
    }
}

/// Owns both devices, both publishers and the discovery socket.
pub struct Bridge<C: Clock = SystemClock> {
    state: BridgeState,
    slots: [Slot; 2],
    options: BridgeOptions,
    clock: C,
    discovery: Option<DiscoveryResponder>,
}

impl Bridge<SystemClock> {
    pub fn from_configs(first: &DeviceConfig, second: &DeviceConfig, options: BridgeOptions) -> Self {
        Self::new(
            DeviceLink::from_config(first),
            DeviceLink::from_config(second),
            options,
            SystemClock,
        )
    }
}

impl<C: Clock> Bridge<C> {
    pub fn new(first: DeviceLink, second: DeviceLink, options: BridgeOptions, clock: C) -> Self {
        Self {
            state: BridgeState::Idle,
            slots: [Slot::new(first), Slot::new(second)],
            options,
            clock,
            discovery: None,
        }
    }

    pub fn state(&self) -> BridgeState {
        self.state
    }

    /// Address of the discovery responder, once started.
    pub fn discovery_addr(&self) -> Option<SocketAddr> {
        self.discovery.as_ref().and_then(|d| d.local_addr().ok())
    }

    /// Open device 1, then device 2, then declare both streams.
    ///
    /// Any failure closes whatever was opened and leaves the bridge `Stopped`
    /// without a single stream declared for a failed open.
    pub fn start(&mut self) -> Result<(), BridgeError> {
        if self.state != BridgeState::Idle {
            return Err(BridgeError::InvalidState {
                action: "start",
                state: self.state,
            });
        }
        self.state = BridgeState::Starting;
        info!(
            "Starting bridge for '{}' and '{}'",
            self.slots[0].link.stream_name, self.slots[1].link.stream_name
        );

        for index in 0..self.slots.len() {
            let link = &mut self.slots[index].link;
            if let Err(source) = link.session.open() {
                let err = BridgeError::Device {
                    slot: index + 1,
                    stream: link.stream_name.clone(),
                    source,
                };
                error!("{}; no stream will be published", err);
                self.stop();
                return Err(err);
            }
        }

        let mut adverts = Vec::with_capacity(self.slots.len());
        for index in 0..self.slots.len() {
            let link = &mut self.slots[index].link;
            let info = link.stream_info();
            match link.publisher.declare(info) {
                Ok(advert) => adverts.push(advert),
                Err(source) => {
                    let err = BridgeError::Publish {
                        slot: index + 1,
                        stream: link.stream_name.clone(),
                        source,
                    };
                    error!("{}", err);
                    self.stop();
                    return Err(err);
                }
            }
        }

        self.discovery = self.options.discovery.and_then(|addr| match DiscoveryResponder::bind(addr) {
            Ok(mut responder) => {
                for advert in adverts {
                    responder.add(advert);
                }
                Some(responder)
            }
            Err(e) => {
                warn!("Discovery on {} unavailable: {}; streams stay reachable on their data ports", addr, e);
                None
            }
        });

        self.state = BridgeState::Running;
        info!("Bridge running");
        Ok(())
    }

    /// Forward samples until the stop flag is raised, the run limit or tick budget is
    /// used up, or both devices have failed. The bridge is `Stopped` afterwards.
    pub fn run(&mut self, stop: &AtomicBool) -> Result<RunSummary, BridgeError> {
        if self.state != BridgeState::Running {
            return Err(BridgeError::InvalidState {
                action: "run",
                state: self.state,
            });
        }

        let tick = self.options.tick.min(MAX_TICK);
        let started = self.clock.now();
        let mut ticks = 0u64;
        let mut skew = SkewStats::default();

        let reason = loop {
            if stop.load(Ordering::SeqCst) {
                break StopReason::Interrupted;
            }
            let tick_start = self.clock.now();
            if self
                .options
                .run_limit
                .is_some_and(|limit| tick_start.duration_since(started) >= limit)
            {
                break StopReason::TimeLimit;
            }
            if self.options.max_ticks.is_some_and(|max| ticks >= max) {
                break StopReason::TickBudget;
            }
            if self.slots.iter().all(|slot| slot.failure.is_some()) {
                break StopReason::AllDevicesFailed;
            }

            let first_poll = self.clock.now();
            self.service(0);
            let second_poll = self.clock.now();
            self.service(1);

            if self.slots.iter().all(|slot| slot.failure.is_none()) {
                let offset = second_poll.duration_since(first_poll);
                skew.record(offset);
                if offset > self.options.skew_warn {
                    warn!(
                        "Device 2 polled {:?} after device 1 (bound {:?})",
                        offset, self.options.skew_warn
                    );
                }
            }

            if let Some(discovery) = self.discovery.as_mut() {
                if let Err(e) = discovery.serve() {
                    warn!("Discovery: {}", e);
                }
            }

            ticks += 1;
            let now = self.clock.now();
            if let Some(wait) = tick_start
                .checked_add(tick)
                .and_then(|next_tick| next_tick.checked_duration_since(now))
                .filter(|wait| !wait.is_zero())
            {
                self.clock.sleep(wait);
            }
        };

        let elapsed = self.clock.now().duration_since(started);
        info!("Bridge leaving run loop after {} ticks ({:?}): {:?}", ticks, elapsed, reason);
        let summary = RunSummary {
            reason,
            ticks,
            elapsed,
            devices: self.slots.iter().map(Slot::stats).collect(),
            max_skew: skew.max,
            mean_skew: skew.mean(),
        };
        self.stop();
        Ok(summary)
    }

    /// Close both sessions. Close errors are logged. Safe to call in any state.
    pub fn stop(&mut self) {
        if matches!(self.state, BridgeState::Stopping | BridgeState::Stopped) {
            return;
        }
        self.state = BridgeState::Stopping;
        for (index, slot) in self.slots.iter_mut().enumerate() {
            if let Err(e) = slot.link.session.close() {
                error!("Closing device {} ('{}') failed: {}", index + 1, slot.link.stream_name, e);
            }
        }
        self.discovery = None;
        self.state = BridgeState::Stopped;
        info!("Bridge stopped");
    }

    /// Serve the stream's clients, then poll the device and publish what it produced.
    /// A failed device's stream stays declared and keeps answering clients.
    fn service(&mut self, index: usize) {
        let slot = &mut self.slots[index];
        let subscribed = slot.link.publisher.poll_clients();
        if subscribed > 0 {
            debug!("'{}': {} new subscribers", slot.link.stream_name, subscribed);
        }
        if slot.failure.is_some() {
            return;
        }

        let batches = match slot.link.session.poll() {
            Ok(batches) => batches,
            Err(e) => {
                error!(
                    "Device {} ('{}') failed: {}; it will no longer be polled",
                    index + 1,
                    slot.link.stream_name,
                    e
                );
                slot.failure = Some(e);
                return;
            }
        };

        for batch in batches {
            match slot.link.publisher.publish(batch) {
                Ok(sent) => slot.frames += sent as u64,
                Err(e) => {
                    slot.publish_errors += 1;
                    if slot.publish_errors == 1 || slot.publish_errors % 1000 == 0 {
                        warn!(
                            "Publishing '{}' failed ({} errors so far): {}",
                            slot.link.stream_name, slot.publish_errors, e
                        );
                    }
                }
            }
        }
        debug!("Device {}: {} frames forwarded", index + 1, slot.frames);
    }
}

impl<C: Clock> Drop for Bridge<C> {
    fn drop(&mut self) {
        self.stop();
    }
}
