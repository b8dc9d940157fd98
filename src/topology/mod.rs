//! Topology data model: channels, sockets and provisioned links.
//!
//! Endpoint and link entries are configuration written by an external
//! provisioner; this module parses them into typed properties and serializes
//! channel state back into registry hashes. The resolver that turns symbolic
//! peers into concrete transport addresses lives in [`resolver`].

pub mod address;
pub mod resolver;

use std::collections::BTreeMap;
use std::collections::HashMap;

pub use resolver::TopologyResolver;

/// How a channel attaches to the transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SocketMethod {
    Bind,
    #[default]
    Connect,
}

impl SocketMethod {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Bind => "bind",
            Self::Connect => "connect",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "bind" => Some(Self::Bind),
            "connect" => Some(Self::Connect),
            _ => None,
        }
    }
}

/// Properties of one named messaging endpoint.
///
/// Field names in the registry hash match the wire contract exactly
/// (camelCase); see [`SocketProperty::from_hash`] / [`SocketProperty::to_hash`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SocketProperty {
    pub name: String,
    pub socket_type: String,
    pub method: SocketMethod,
    pub address: String,
    pub transport: String,
    pub snd_buf_size: i64,
    pub rcv_buf_size: i64,
    pub snd_kernel_size: i64,
    pub rcv_kernel_size: i64,
    pub linger: i64,
    pub rate_logging: i64,
    pub port_range_min: u16,
    pub port_range_max: u16,
    pub auto_bind: bool,
    pub num_sockets: usize,
    pub auto_sub_channel: bool,
    pub bound: bool,
}

impl Default for SocketProperty {
    fn default() -> Self {
        Self {
            name: String::new(),
            socket_type: String::new(),
            method: SocketMethod::Connect,
            address: String::new(),
            transport: "zeromq".to_string(),
            snd_buf_size: 1000,
            rcv_buf_size: 1000,
            snd_kernel_size: 0,
            rcv_kernel_size: 0,
            linger: 500,
            rate_logging: 1,
            port_range_min: 22000,
            port_range_max: 32000,
            auto_bind: true,
            num_sockets: 0,
            auto_sub_channel: false,
            bound: false,
        }
    }
}

fn truthy(v: &str) -> bool {
    let v = v.to_ascii_lowercase();
    v == "1" || v == "true"
}

impl SocketProperty {
    /// Build from a registry hash, ignoring unknown fields and keeping
    /// defaults for unparsable numbers.
    pub fn from_hash(fields: &HashMap<String, String>) -> Self {
        let mut sp = Self::default();
        for (field, value) in fields {
            match field.as_str() {
                "name" => sp.name = value.clone(),
                "type" => sp.socket_type = value.clone(),
                "method" => {
                    if let Some(m) = SocketMethod::parse(value) {
                        sp.method = m;
                    }
                }
                "address" => sp.address = value.clone(),
                "transport" => sp.transport = value.clone(),
                "sndBufSize" => sp.snd_buf_size = value.parse().unwrap_or(sp.snd_buf_size),
                "rcvBufSize" => sp.rcv_buf_size = value.parse().unwrap_or(sp.rcv_buf_size),
                "sndKernelSize" => sp.snd_kernel_size = value.parse().unwrap_or(sp.snd_kernel_size),
                "rcvKernelSize" => sp.rcv_kernel_size = value.parse().unwrap_or(sp.rcv_kernel_size),
                "linger" => sp.linger = value.parse().unwrap_or(sp.linger),
                "rateLogging" => sp.rate_logging = value.parse().unwrap_or(sp.rate_logging),
                "portRangeMin" => sp.port_range_min = value.parse().unwrap_or(sp.port_range_min),
                "portRangeMax" => sp.port_range_max = value.parse().unwrap_or(sp.port_range_max),
                "autoBind" => sp.auto_bind = truthy(value),
                "numSockets" => sp.num_sockets = value.parse().unwrap_or(sp.num_sockets),
                "autoSubChannel" => sp.auto_sub_channel = truthy(value),
                "bound" => sp.bound = truthy(value),
                _ => {}
            }
        }
        sp
    }

    /// Serialize into registry hash fields.
    pub fn to_hash(&self) -> Vec<(String, String)> {
        vec![
            ("name".into(), self.name.clone()),
            ("type".into(), self.socket_type.clone()),
            ("method".into(), self.method.as_str().into()),
            ("address".into(), self.address.clone()),
            ("transport".into(), self.transport.clone()),
            ("sndBufSize".into(), self.snd_buf_size.to_string()),
            ("rcvBufSize".into(), self.rcv_buf_size.to_string()),
            ("sndKernelSize".into(), self.snd_kernel_size.to_string()),
            ("rcvKernelSize".into(), self.rcv_kernel_size.to_string()),
            ("linger".into(), self.linger.to_string()),
            ("rateLogging".into(), self.rate_logging.to_string()),
            ("portRangeMin".into(), self.port_range_min.to_string()),
            ("portRangeMax".into(), self.port_range_max.to_string()),
            ("autoBind".into(), (self.auto_bind as u8).to_string()),
            ("numSockets".into(), self.num_sockets.to_string()),
            ("autoSubChannel".into(), (self.auto_sub_channel as u8).to_string()),
            ("bound".into(), (self.bound as u8).to_string()),
        ]
    }

    /// The channel configuration sub-option string handed to the device's
    /// channel factory (one `key=value` list per channel).
    pub fn to_channel_config(&self) -> String {
        let mut address = self.address.clone();
        if address.is_empty() || address == "unspecified" {
            address = "unspecified".to_string();
            for _ in 1..self.num_sockets.max(1) {
                address.push_str(",address=unspecified");
            }
        } else if address.contains(',') {
            let mut parts: Vec<&str> = address.split(',').collect();
            while parts.len() < self.num_sockets {
                parts.push("unspecified");
            }
            address = parts.join(",address=");
        }
        format!(
            "name={},type={},method={},address={},transport={},rcvBufSize={},sndBufSize={},linger={},rateLogging={},portRangeMin={},portRangeMax={},autoBind={}",
            self.name,
            self.socket_type,
            self.method.as_str(),
            address,
            self.transport,
            self.rcv_buf_size,
            self.snd_buf_size,
            self.linger,
            self.rate_logging,
            self.port_range_min,
            self.port_range_max,
            self.auto_bind as u8,
        )
    }
}

/// A provisioner-declared pairing of two channels, normalized so that the
/// `my_*` side refers to the local service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkProperty {
    pub my_service: String,
    pub my_channel: String,
    pub peer_service: String,
    pub peer_channel: String,
    pub options: String,
}

impl LinkProperty {
    /// Parse a link pair name `svcA<S>chA,svcB<S>chB` from the tail of a link
    /// key, orienting the sides around `my_service`. When both sides name the
    /// same service the lexicographically smaller channel becomes `my_channel`.
    pub fn parse(pair: &str, my_service: &str, separator: &str, options: String) -> Option<Self> {
        let comma = pair.find(',')?;
        let (left, right) = (&pair[..comma], &pair[comma + 1..]);
        let first_sep = left.rfind(separator)?;
        let second_sep = right.rfind(separator)?;
        let (service_l, channel_l) = (&left[..first_sep], &left[first_sep + separator.len()..]);
        let (service_r, channel_r) = (&right[..second_sep], &right[second_sep + separator.len()..]);

        let mut lp = Self {
            my_service: String::new(),
            my_channel: String::new(),
            peer_service: String::new(),
            peer_channel: String::new(),
            options,
        };
        if service_l == service_r {
            lp.my_service = service_l.to_string();
            lp.peer_service = service_r.to_string();
            if channel_l < channel_r {
                lp.my_channel = channel_l.to_string();
                lp.peer_channel = channel_r.to_string();
            } else {
                lp.my_channel = channel_r.to_string();
                lp.peer_channel = channel_l.to_string();
            }
            return Some(lp);
        }
        if service_l == my_service {
            lp.my_service = service_l.to_string();
            lp.my_channel = channel_l.to_string();
            lp.peer_service = service_r.to_string();
            lp.peer_channel = channel_r.to_string();
        } else {
            lp.my_service = service_r.to_string();
            lp.my_channel = channel_r.to_string();
            lp.peer_service = service_l.to_string();
            lp.peer_channel = channel_l.to_string();
        }
        Some(lp)
    }

    /// Stable identity of a link, used to merge duplicate declarations.
    pub fn pair_key(&self, separator: &str) -> String {
        format!(
            "{}{sep}{},{}{sep}{}",
            self.my_service,
            self.my_channel,
            self.peer_service,
            self.peer_channel,
            sep = separator
        )
    }
}

/// Channel maps keyed by channel name.
pub type ChannelMap = BTreeMap<String, SocketProperty>;
