use obci_types::SampleBatch;

use crate::error::PublishError;
use crate::info::{xml_field, ChannelFormat, StreamInfo};

/// Short description of a declared stream, as returned by discovery queries.
#[derive(Debug, Clone, PartialEq)]
pub struct Advertisement {
    pub name: String,
    pub stream_type: String,
    pub channel_count: usize,
    pub nominal_srate: f64,
    pub channel_format: ChannelFormat,
    pub source_id: String,
    pub hostname: String,
    pub uid: String,
    pub session_id: String,
    /// TCP port serving the data
    pub data_port: u16,
    /// UDP port answering time-sync and unicast queries
    pub service_port: u16,
    /// The shortinfo XML this advertisement was built from or is sent as
    pub xml: String,
}

impl Advertisement {
    pub fn new(info: &StreamInfo) -> Self {
        Self {
            name: info.name.clone(),
            stream_type: info.stream_type.clone(),
            channel_count: info.channel_count(),
            nominal_srate: info.nominal_srate,
            channel_format: info.channel_format,
            source_id: info.source_id.clone(),
            hostname: info.hostname.clone(),
            uid: info.uid.clone(),
            session_id: info.session_id.clone(),
            data_port: info.data_port,
            service_port: info.service_port,
            xml: info.to_shortinfo_xml(),
        }
    }

    /// Parse a shortinfo XML reply. `None` if a required field is missing or malformed.
    pub fn from_xml(xml: &str) -> Option<Self> {
        Some(Self {
            name: xml_field(xml, "name")?,
            stream_type: xml_field(xml, "type")?,
            channel_count: xml_field(xml, "channel_count")?.parse().ok()?,
            nominal_srate: xml_field(xml, "nominal_srate")?.parse().ok()?,
            channel_format: ChannelFormat::parse(&xml_field(xml, "channel_format")?)?,
            source_id: xml_field(xml, "source_id").unwrap_or_default(),
            hostname: xml_field(xml, "hostname").unwrap_or_default(),
            uid: xml_field(xml, "uid")?,
            session_id: xml_field(xml, "session_id").unwrap_or_default(),
            data_port: xml_field(xml, "v4data_port")?.parse().ok()?,
            service_port: xml_field(xml, "v4service_port")
                .and_then(|p| p.parse().ok())
                .unwrap_or(0),
            xml: xml.to_string(),
        })
    }

    /// Value of a queryable field, rendered as text.
    pub(crate) fn field(&self, key: &str) -> Option<String> {
        Some(match key {
            "name" => self.name.clone(),
            "type" => self.stream_type.clone(),
            "source_id" => self.source_id.clone(),
            "hostname" => self.hostname.clone(),
            "uid" => self.uid.clone(),
            "session_id" => self.session_id.clone(),
            "channel_format" => self.channel_format.as_str().to_string(),
            "channel_count" => self.channel_count.to_string(),
            "nominal_srate" => self.nominal_srate.to_string(),
            _ => return None,
        })
    }
}

/// Sink for one device's samples.
///
/// `declare` is called once, before the first `publish`. Values and timestamps are
/// forwarded as given apart from the configured timestamp offset.
pub trait StreamPublisher: Send {
    fn declare(&mut self, info: StreamInfo) -> Result<Advertisement, PublishError>;

    /// Push a batch, returning the number of frames written.
    fn publish(&mut self, batch: SampleBatch) -> Result<usize, PublishError>;

    /// Handle pending connections and requests without blocking. Called once per
    /// tick whether or not there is data. Returns the number of new subscribers.
    fn poll_clients(&mut self) -> usize {
        0
    }
}
