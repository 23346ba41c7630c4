//! Lab Streaming Layer outlets speaking the 1.10 protocol.
//!
//! Each declared stream gets a TCP data port and a UDP service port. On the data
//! port a subscriber sends
//!
//! ```text
//! LSL:streamfeed/110 <uid>\r\n<headers>\r\n\r\n
//! ```
//!
//! and receives `LSL/110 200 OK` plus response headers, two test-pattern samples,
//! then one sample per frame:
//!
//! ```text
//! [u8 2][f64 timestamp][f64 x channel_count]   (little-endian, repeated)
//! ```
//!
//! `LSL:fullinfo` on the same port returns the XML description. The service port
//! answers `LSL:timedata` time-sync requests. Streams are found through a UDP responder
//! answering `LSL:shortinfo` queries (see [`discovery`]).

pub mod discovery;
pub mod error;
pub mod info;
pub mod outlet;
pub mod publisher;

pub use discovery::{
    matches_query, resolve, DiscoveryResponder, LSL_MULTICAST_ADDR, LSL_MULTICAST_PORT, LSL_SITE_MULTICAST_ADDR,
};
pub use error::{PublishError, PublishResult};
pub use info::{ChannelFormat, StreamInfo, DEFAULT_SESSION_ID, PROTOCOL_VERSION};
pub use outlet::{LslOutlet, OutletOptions};
pub use publisher::{Advertisement, StreamPublisher};
