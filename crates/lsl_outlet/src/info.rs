use std::fmt::Write as _;

use obci_types::{local_clock, ChannelDesc, SessionDescriptor};
use uuid::Uuid;

/// Protocol version advertised in the stream description.
pub const PROTOCOL_VERSION: u16 = 110;

/// Session every stream joins unless told otherwise.
pub const DEFAULT_SESSION_ID: &str = "default";

/// Channel value encoding on the wire
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelFormat {
    Float32,
    Double64,
}

impl ChannelFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Float32 => "float32",
            Self::Double64 => "double64",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "float32" => Some(Self::Float32),
            "double64" => Some(Self::Double64),
            _ => None,
        }
    }

    pub fn bytes_per_value(&self) -> usize {
        match self {
            Self::Float32 => 4,
            Self::Double64 => 8,
        }
    }
}

/// Description of one outbound stream.
#[derive(Debug, Clone, PartialEq)]
pub struct StreamInfo {
    /// Stream name, e.g. `obci_eeg1_/dev/ttyUSB0`
    pub name: String,
    /// Content type, e.g. `EEG_AUX`
    pub stream_type: String,
    pub channels: Vec<ChannelDesc>,
    /// Nominal sampling rate in Hz
    pub nominal_srate: f64,
    pub channel_format: ChannelFormat,
    /// Unique source id; recorders use it to re-attach after a restart
    pub source_id: String,
    pub hostname: String,
    /// Creation time on the local clock
    pub created_at: f64,
    /// Random per-declaration id; subscribers name it when requesting data
    pub uid: String,
    pub session_id: String,
    /// TCP data port, set by the outlet on declare
    pub data_port: u16,
    /// UDP service port (time sync and unicast queries), set by the outlet on declare
    pub service_port: u16,
}

impl StreamInfo {
    pub fn new(
        name: impl Into<String>,
        stream_type: impl Into<String>,
        source_id: impl Into<String>,
        descriptor: &SessionDescriptor,
    ) -> Self {
        let hostname = std::env::var("HOSTNAME")
            .or_else(|_| std::env::var("COMPUTERNAME"))
            .unwrap_or_else(|_| "localhost".to_string());

        Self {
            name: name.into(),
            stream_type: stream_type.into(),
            channels: descriptor.channels.clone(),
            nominal_srate: descriptor.sample_rate,
            channel_format: ChannelFormat::Double64,
            source_id: source_id.into(),
            hostname,
            created_at: local_clock(),
            uid: Uuid::new_v4().to_string(),
            session_id: DEFAULT_SESSION_ID.to_string(),
            data_port: 0,
            service_port: 0,
        }
    }

    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }

    /// Bytes per wire sample: timestamp tag, timestamp, one value per channel.
    pub fn frame_len(&self) -> usize {
        1 + 8 + self.channel_count() * self.channel_format.bytes_per_value()
    }

    /// Full XML description, including the channel list.
    pub fn to_xml(&self) -> String {
        self.render(true)
    }

    /// XML description with an empty `<desc />`, as sent in discovery replies.
    pub fn to_shortinfo_xml(&self) -> String {
        self.render(false)
    }

    fn render(&self, with_desc: bool) -> String {
        let mut xml = String::new();
        xml.push_str("<?xml version=\"1.0\"?>\n");
        xml.push_str("<info>\n");
        let _ = writeln!(xml, "  <name>{}</name>", escape(&self.name));
        let _ = writeln!(xml, "  <type>{}</type>", escape(&self.stream_type));
        let _ = writeln!(xml, "  <channel_count>{}</channel_count>", self.channel_count());
        let _ = writeln!(xml, "  <channel_format>{}</channel_format>", self.channel_format.as_str());
        let _ = writeln!(xml, "  <source_id>{}</source_id>", escape(&self.source_id));
        let _ = writeln!(xml, "  <nominal_srate>{}</nominal_srate>", self.nominal_srate);
        let _ = writeln!(xml, "  <version>{:.2}</version>", f64::from(PROTOCOL_VERSION) / 100.0);
        let _ = writeln!(xml, "  <created_at>{}</created_at>", self.created_at);
        let _ = writeln!(xml, "  <uid>{}</uid>", escape(&self.uid));
        let _ = writeln!(xml, "  <session_id>{}</session_id>", escape(&self.session_id));
        let _ = writeln!(xml, "  <hostname>{}</hostname>", escape(&self.hostname));
        xml.push_str("  <v4address />\n");
        let _ = writeln!(xml, "  <v4data_port>{}</v4data_port>", self.data_port);
        let _ = writeln!(xml, "  <v4service_port>{}</v4service_port>", self.service_port);
        xml.push_str("  <v6address />\n");
        xml.push_str("  <v6data_port>0</v6data_port>\n");
        xml.push_str("  <v6service_port>0</v6service_port>\n");
        if with_desc {
            xml.push_str("  <desc>\n");
            xml.push_str("    <channels>\n");
            for ch in &self.channels {
                xml.push_str("      <channel>\n");
                let _ = writeln!(xml, "        <label>{}</label>", escape(&ch.label));
                let _ = writeln!(xml, "        <type>{}</type>", ch.data_type);
                xml.push_str("      </channel>\n");
            }
            xml.push_str("    </channels>\n");
            xml.push_str("  </desc>\n");
        } else {
            xml.push_str("  <desc />\n");
        }
        xml.push_str("</info>\n");
        xml
    }
}

fn escape(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&apos;"),
            _ => out.push(c),
        }
    }
    out
}

fn unescape(s: &str) -> String {
    s.replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&apos;", "'")
        .replace("&amp;", "&")
}

/// Text of the first `<tag>...</tag>` element. Empty elements (`<tag />`) yield `""`.
///
/// Only meant for the flat top-level fields of a stream description.
pub(crate) fn xml_field(xml: &str, tag: &str) -> Option<String> {
    let open = format!("<{}>", tag);
    let close = format!("</{}>", tag);
    if let Some(start) = xml.find(&open) {
        let rest = &xml[start + open.len()..];
        let end = rest.find(&close)?;
        return Some(unescape(rest[..end].trim()));
    }
    if xml.contains(&format!("<{} />", tag)) || xml.contains(&format!("<{}/>", tag)) {
        return Some(String::new());
    }
    None
}
