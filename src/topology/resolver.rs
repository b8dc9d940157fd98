//! Resolution of symbolic peer references into concrete transport addresses.
//!
//! The resolver runs on three device transitions:
//!
//! - entering `InitializingDevice` it builds the channel catalog from
//!   provisioned endpoint and link entries, counts expected peers into
//!   fan-out channels and publishes the catalog (phase A);
//! - entering `Bound` it publishes the bound sub-socket addresses, blocks
//!   until every linked peer reports `bound`, resolves connect addresses via
//!   peer-list matchmaking or an explicit connect configuration, and
//!   publishes those too (phase B);
//! - entering `ResettingDevice` it deletes everything it registered and
//!   drops its cached maps (phase C).
//!
//! Every blocking wait polls at one-second cadence and aborts on the shared
//! cancellation flag. Addresses that cannot be resolved within the retry
//! budget leave the channel partial; the device then fails its own
//! transition.

use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use parking_lot::Mutex;
use serde_json::Value;
use tracing::debug;
use tracing::warn;

use super::ChannelMap;
use super::LinkProperty;
use super::SocketMethod;
use super::SocketProperty;
use super::address::PeerExpr;
use super::address::make_address;
use super::address::uds_address;
use crate::cancel::CancelFlag;
use crate::constants::HEALTH_PREFIX;
use crate::constants::PRESENCE_PREFIX;
use crate::constants::TOP_PREFIX;
use crate::constants::topology;
use crate::device::DeviceChannels;
use crate::keyspace::join;
use crate::registry::PipelineCommand;
use crate::registry::Registry;

/// Poll cadence for bind/address waits.
const RESOLVE_POLL: Duration = Duration::from_secs(1);

/// Connect-config fields copied into a channel's socket properties.
const CONNECT_CONFIG_FIELDS: [&str; 10] = [
    "type",
    "transport",
    "sndBufSize",
    "rcvBufSize",
    "sndKernelSize",
    "rcvKernelSize",
    "linger",
    "rateLogging",
    "numSockets",
    "autoSubChannel",
];

/// Per-instance topology state and resolution logic.
pub struct TopologyResolver {
    registry: Arc<dyn Registry>,
    separator: String,
    service: String,
    instance_id: String,
    host_ip: String,
    max_ttl: Duration,
    enable_uds: bool,
    connect_config: Option<Value>,
    max_retry: u32,
    cancel: CancelFlag,
    bind_channels: Mutex<ChannelMap>,
    connect_channels: Mutex<ChannelMap>,
    links: Mutex<BTreeMap<String, LinkProperty>>,
    /// Keys whose TTL the liveness task must keep extending. Shared with the
    /// agent's refresh pipeline.
    registered_keys: Arc<Mutex<BTreeSet<String>>>,
}

#[allow(clippy::too_many_arguments)]
impl TopologyResolver {
    pub fn new(
        registry: Arc<dyn Registry>,
        separator: impl Into<String>,
        service: impl Into<String>,
        instance_id: impl Into<String>,
        host_ip: impl Into<String>,
        max_ttl: Duration,
        enable_uds: bool,
        connect_config: Option<Value>,
        max_retry: u32,
        cancel: CancelFlag,
        registered_keys: Arc<Mutex<BTreeSet<String>>>,
    ) -> Self {
        Self {
            registry,
            separator: separator.into(),
            service: service.into(),
            instance_id: instance_id.into(),
            host_ip: host_ip.into(),
            max_ttl,
            enable_uds,
            connect_config,
            max_retry,
            cancel,
            bind_channels: Mutex::new(ChannelMap::new()),
            connect_channels: Mutex::new(ChannelMap::new()),
            links: Mutex::new(BTreeMap::new()),
            registered_keys,
        }
    }

    /// Snapshot of the bind channels (post phase A).
    pub fn bind_channel_list(&self) -> Vec<SocketProperty> {
        self.bind_channels.lock().values().cloned().collect()
    }

    /// Snapshot of the connect channels (post phase B carries addresses).
    pub fn connect_channel_list(&self) -> Vec<SocketProperty> {
        self.connect_channels.lock().values().cloned().collect()
    }

    // ------------------------------------------------------------------
    // key helpers
    // ------------------------------------------------------------------

    fn sep(&self) -> &str {
        &self.separator
    }

    fn instance_prefix(&self) -> String {
        join(&[TOP_PREFIX, &self.service, &self.instance_id], self.sep())
    }

    fn channel_key(&self, name: &str) -> String {
        join(&[&self.instance_prefix(), topology::CHANNEL_PREFIX, name], self.sep())
    }

    fn peer_list_key(&self, channel_key: &str) -> String {
        join(&[channel_key, topology::PEER_PREFIX], self.sep())
    }

    fn socket_key(&self, channel: &str, sub_index: usize) -> String {
        let field = format!("chans.{channel}.{sub_index}");
        join(&[&self.instance_prefix(), topology::SOCKET_PREFIX, &field], self.sep())
    }

    // ------------------------------------------------------------------
    // phase A: channel catalog
    // ------------------------------------------------------------------

    /// Build the channel catalog and publish it.
    pub async fn initialize(&self) -> Result<()> {
        if let Some(config) = self.connect_config.clone() {
            self.seed_connect_channels(&config);
        }
        self.read_endpoints().await?;
        self.read_links().await?;

        let mut catalog: Vec<SocketProperty> = Vec::new();
        catalog.extend(self.bind_channels.lock().values().cloned());
        catalog.extend(self.connect_channels.lock().values().cloned());
        debug!(
            service = %self.service,
            id = %self.instance_id,
            bind = self.bind_channels.lock().len(),
            connect = self.connect_channels.lock().len(),
            "channel catalog read"
        );

        for mut sp in catalog {
            let peers = self.expected_peers(&mut sp).await?;

            if self.enable_uds
                && sp.method == SocketMethod::Bind
                && sp.transport == "zeromq"
                && self.is_uds_available(&peers).await
            {
                let mut addresses = Vec::new();
                for i in 0..sp.num_sockets.max(1) {
                    addresses.push(uds_address(&self.service, &self.instance_id, &sp.name, i));
                }
                sp.address = addresses.join(",");
                debug!(channel = %sp.name, address = %sp.address, "using unix domain sockets");
            }

            self.write_channel(&sp, &peers).await?;

            match sp.method {
                SocketMethod::Bind => self.bind_channels.lock().insert(sp.name.clone(), sp),
                SocketMethod::Connect => self.connect_channels.lock().insert(sp.name.clone(), sp),
            };
        }
        Ok(())
    }

    fn seed_connect_channels(&self, config: &Value) {
        let Some(object) = config.as_object() else {
            warn!(id = %self.instance_id, "connect-config is not a JSON object");
            return;
        };
        let mut connect = self.connect_channels.lock();
        for (name, spec) in object {
            let mut fields = std::collections::HashMap::new();
            for key in CONNECT_CONFIG_FIELDS {
                if let Some(v) = spec.get(key) {
                    let s = match v {
                        Value::String(s) => s.clone(),
                        other => other.to_string(),
                    };
                    fields.insert(key.to_string(), s);
                }
            }
            let mut sp = SocketProperty::from_hash(&fields);
            sp.name = name.clone();
            sp.method = SocketMethod::Connect;
            connect.entry(name.clone()).or_insert(sp);
        }
    }

    async fn read_endpoints(&self) -> Result<()> {
        let prefix = join(
            &[TOP_PREFIX, topology::PREFIX, topology::ENDPOINT_PREFIX, &self.service, ""],
            self.sep(),
        );
        let pattern = format!("{prefix}*");
        let keys = self.registry.scan(&pattern).await?;
        if keys.is_empty() {
            warn!(service = %self.service, "no endpoint entries");
        }
        for key in keys {
            let fields = self.registry.hgetall(&key).await?;
            let mut sp = SocketProperty::from_hash(&fields);
            sp.name = key[prefix.len()..].to_string();
            match sp.method {
                SocketMethod::Bind => {
                    self.bind_channels.lock().entry(sp.name.clone()).or_insert(sp);
                }
                SocketMethod::Connect => {
                    self.connect_channels.lock().entry(sp.name.clone()).or_insert(sp);
                }
            }
        }
        Ok(())
    }

    async fn read_links(&self) -> Result<()> {
        let prefix = join(&[TOP_PREFIX, topology::PREFIX, topology::LINK_PREFIX, ""], self.sep());
        // this service on either side of the pair
        let left = format!("{prefix}{}{}*,*{}*", self.service, self.sep(), self.sep());
        let right = format!("{prefix}*{}*,{}{}*", self.sep(), self.service, self.sep());
        let mut keys = self.registry.scan(&left).await?;
        keys.extend(self.registry.scan(&right).await?);
        keys.sort();
        keys.dedup();
        if keys.is_empty() {
            warn!(service = %self.service, "no link entries");
        }

        for key in keys {
            let options = self.registry.get(&key).await?.unwrap_or_default();
            let pair = &key[prefix.len()..];
            let Some(lp) = LinkProperty::parse(pair, &self.service, self.sep(), options) else {
                warn!(key = %key, "unparsable link entry");
                continue;
            };
            let pair_key = lp.pair_key(self.sep());
            let mut links = self.links.lock();
            match links.get_mut(&pair_key) {
                Some(existing) => {
                    if !lp.options.is_empty() {
                        if !existing.options.is_empty() {
                            existing.options.push(',');
                        }
                        existing.options.push_str(&lp.options);
                    }
                }
                None => {
                    links.insert(pair_key, lp);
                }
            }
        }
        Ok(())
    }

    /// Peer channel keys of `sp`, one per live instance of each linked peer
    /// service; fan-out channels grow `num_sockets` by the peer count.
    async fn expected_peers(&self, sp: &mut SocketProperty) -> Result<Vec<String>> {
        let links: Vec<LinkProperty> = self.links.lock().values().cloned().collect();
        let mut peers = Vec::new();
        for lp in &links {
            if lp.my_service != lp.peer_service && lp.my_channel != sp.name {
                continue;
            }
            let self_link_far_side = lp.my_service == lp.peer_service && lp.peer_channel == sp.name;
            let (peer_service, peer_channel) = if self_link_far_side {
                (&lp.my_service, &lp.my_channel)
            } else {
                (&lp.peer_service, &lp.peer_channel)
            };
            let pattern = join(&[TOP_PREFIX, peer_service, "*", PRESENCE_PREFIX], self.sep());
            let presence_keys = self.registry.scan(&pattern).await?;
            debug!(channel = %sp.name, peer_service = %peer_service, n = presence_keys.len(), "peer instances");
            for presence in &presence_keys {
                let instance = match presence.rfind(self.sep()) {
                    Some(pos) => &presence[..pos],
                    None => continue,
                };
                peers.push(join(&[instance, topology::CHANNEL_PREFIX, peer_channel], self.sep()));
            }
            if sp.auto_sub_channel {
                sp.num_sockets += presence_keys.len();
            }
        }
        peers.sort();
        peers.dedup();
        Ok(peers)
    }

    async fn is_uds_available(&self, peers: &[String]) -> bool {
        for peer in peers {
            match self.read_peer_ip(peer).await {
                Some(ip) if ip == self.host_ip => {}
                _ => return false,
            }
        }
        true
    }

    /// Publish a channel's properties and its peer list, both TTL'd.
    async fn write_channel(&self, sp: &SocketProperty, peers: &[String]) -> Result<()> {
        if peers.is_empty() {
            return Ok(());
        }
        let channel_key = self.channel_key(&sp.name);
        let peer_key = self.peer_list_key(&channel_key);
        self.registry
            .pipeline(vec![
                PipelineCommand::HSet {
                    key: channel_key.clone(),
                    fields: sp.to_hash(),
                },
                PipelineCommand::Expire {
                    key: channel_key.clone(),
                    ttl: self.max_ttl,
                },
                PipelineCommand::RPush {
                    key: peer_key.clone(),
                    values: peers.to_vec(),
                },
                PipelineCommand::Expire {
                    key: peer_key.clone(),
                    ttl: self.max_ttl,
                },
            ])
            .await?;
        let mut registered = self.registered_keys.lock();
        registered.insert(channel_key);
        registered.insert(peer_key);
        Ok(())
    }

    // ------------------------------------------------------------------
    // phase B: address exchange
    // ------------------------------------------------------------------

    /// Publish bound addresses, wait for peers, resolve connect addresses.
    pub async fn on_bound(&self, channels: &DeviceChannels) -> Result<()> {
        self.write_bind_address(channels).await?;
        if self.cancel.is_cancelled() {
            return Ok(());
        }
        self.wait_bind_address().await?;
        if self.cancel.is_cancelled() {
            return Ok(());
        }
        if self.connect_config.is_some() {
            self.config_connect().await?;
        } else {
            self.resolve_connect_address().await?;
        }
        if self.cancel.is_cancelled() {
            return Ok(());
        }
        self.write_connect_address().await
    }

    async fn write_bind_address(&self, channels: &DeviceChannels) -> Result<()> {
        let bind: Vec<SocketProperty> = self.bind_channels.lock().values().cloned().collect();
        if bind.is_empty() {
            return Ok(());
        }
        let mut commands = Vec::new();
        let mut keys = Vec::new();
        for sp in &bind {
            let Some(sockets) = channels.get(&sp.name) else {
                warn!(channel = %sp.name, "bind channel has no sockets");
                continue;
            };
            for socket in sockets {
                let key = self.socket_key(&sp.name, socket.index);
                commands.push(PipelineCommand::HSet {
                    key: key.clone(),
                    fields: vec![
                        ("name".into(), sp.name.clone()),
                        ("type".into(), sp.socket_type.clone()),
                        ("method".into(), sp.method.as_str().into()),
                        ("address".into(), socket.address.clone()),
                        ("transport".into(), sp.transport.clone()),
                        ("numSockets".into(), sp.num_sockets.to_string()),
                        ("autoSubChannel".into(), (sp.auto_sub_channel as u8).to_string()),
                    ],
                });
                commands.push(PipelineCommand::Expire {
                    key: key.clone(),
                    ttl: self.max_ttl,
                });
                keys.push(key);
            }
            // announce bind completion on the channel hash
            let channel_key = self.channel_key(&sp.name);
            commands.push(PipelineCommand::HSet {
                key: channel_key.clone(),
                fields: vec![("bound".into(), "1".into())],
            });
            commands.push(PipelineCommand::Expire {
                key: channel_key,
                ttl: self.max_ttl,
            });
            debug!(channel = %sp.name, n = sockets.len(), "bind addresses published");
        }
        self.registry.pipeline(commands).await?;
        {
            let mut registered = self.registered_keys.lock();
            registered.extend(keys);
        }
        let mut bind_map = self.bind_channels.lock();
        for sp in bind_map.values_mut() {
            sp.bound = true;
        }
        Ok(())
    }

    /// Block until every linked peer channel reports `bound=1`.
    async fn wait_bind_address(&self) -> Result<()> {
        let connect: Vec<String> = self.connect_channels.lock().keys().cloned().collect();
        if connect.is_empty() {
            return Ok(());
        }
        let links: Vec<LinkProperty> = self.links.lock().values().cloned().collect();

        let mut waited: BTreeSet<String> = BTreeSet::new();
        for name in &connect {
            for lp in &links {
                let (peer_service, peer_channel) =
                    if self.service == lp.my_service && *name == lp.my_channel {
                        (&lp.peer_service, &lp.peer_channel)
                    } else if self.service == lp.peer_service && *name == lp.peer_channel {
                        (&lp.my_service, &lp.my_channel)
                    } else {
                        continue;
                    };
                let pattern = join(&[TOP_PREFIX, peer_service, "*", PRESENCE_PREFIX], self.sep());
                for presence in self.registry.scan(&pattern).await? {
                    if let Some(pos) = presence.rfind(self.sep()) {
                        waited.insert(join(
                            &[&presence[..pos], topology::CHANNEL_PREFIX, peer_channel],
                            self.sep(),
                        ));
                    }
                }
            }
        }

        for channel_key in waited {
            loop {
                match self.registry.hget(&channel_key, "bound").await {
                    Ok(Some(v)) if v == "1" || v.eq_ignore_ascii_case("true") => break,
                    Ok(_) => {}
                    Err(e) if e.is_transient() => warn!(key = %channel_key, error = %e, "bound poll failed"),
                    Err(e) => return Err(e.into()),
                }
                if self.cancel.is_cancelled() {
                    return Ok(());
                }
                debug!(key = %channel_key, "waiting for peer channel to bind");
                tokio::time::sleep(RESOLVE_POLL).await;
            }
        }
        Ok(())
    }

    /// Matchmake each connect channel against its published peer lists.
    async fn resolve_connect_address(&self) -> Result<()> {
        let connect: Vec<SocketProperty> = self.connect_channels.lock().values().cloned().collect();
        if connect.is_empty() {
            return Ok(());
        }

        for mut sp in connect {
            if !sp.address.is_empty() && sp.address != "unspecified" {
                continue; // explicitly configured
            }
            let my_channel_key = self.channel_key(&sp.name);
            let peers = self.registry.lrange(&self.peer_list_key(&my_channel_key)).await?;
            debug!(channel = %sp.name, peers = peers.len(), "resolving connect addresses");

            let mut resolved: Vec<String> = Vec::new();
            let mut one_to_one = false;
            for (peer_index, peer) in peers.iter().enumerate() {
                // our position in the peer's own neighbor list selects which
                // of its sub-sockets belongs to us
                let neighbors = self.registry.lrange(&self.peer_list_key(peer)).await?;
                let my_index = neighbors
                    .iter()
                    .position(|n| n == &my_channel_key)
                    .unwrap_or(neighbors.len());
                if one_to_one && my_index != peer_index {
                    continue;
                }

                let peer_fields = self.registry.hgetall(peer).await?;
                let peer_property = SocketProperty::from_hash(&peer_fields);
                let addresses = self.read_peer_address(peer).await?;
                if addresses.is_empty() {
                    warn!(peer = %peer, "no addresses resolved within the retry budget");
                    continue;
                }

                let me_single = sp.num_sockets <= 1;
                let peer_single = peer_property.num_sockets <= 1;
                match (me_single, peer_single) {
                    (true, true) => {
                        one_to_one = true;
                        if my_index == peer_index || peers.len() == 1 {
                            resolved = vec![addresses[0].clone()];
                            break;
                        }
                    }
                    (true, false) => {
                        // the peer fans out; pick our slot
                        match addresses.get(my_index) {
                            Some(a) => resolved = vec![a.clone()],
                            None => warn!(peer = %peer, my_index, "peer has no sub-socket for us"),
                        }
                    }
                    (false, true) => resolved.push(addresses[0].clone()),
                    (false, false) => match addresses.get(my_index) {
                        Some(a) => resolved.push(a.clone()),
                        None => warn!(peer = %peer, my_index, "peer has no sub-socket for us"),
                    },
                }
            }

            if resolved.is_empty() {
                warn!(channel = %sp.name, "connect channel left unresolved");
                continue;
            }
            sp.address = resolved.join(",");
            debug!(channel = %sp.name, address = %sp.address, "connect addresses resolved");
            self.connect_channels.lock().insert(sp.name.clone(), sp);
        }
        Ok(())
    }

    /// Resolve connect channels against an explicit connect configuration of
    /// symbolic peer expressions.
    async fn config_connect(&self) -> Result<()> {
        let Some(config) = self.connect_config.clone() else {
            return Ok(());
        };
        let Some(object) = config.as_object() else {
            return Ok(());
        };

        for (name, spec) in object {
            let Some(mut sp) = self.connect_channels.lock().get(name).cloned() else {
                continue;
            };
            let peer_exprs: Vec<String> = match spec.get("peer") {
                Some(Value::String(s)) => vec![s.clone()],
                Some(Value::Array(items)) => items
                    .iter()
                    .filter_map(|v| v.as_str().map(str::to_string))
                    .collect(),
                _ => {
                    warn!(channel = %name, "connect-config entry has no peer");
                    continue;
                }
            };

            let mut addresses = Vec::new();
            for expr in &peer_exprs {
                let Some(peer) = PeerExpr::parse(expr, self.sep()) else {
                    warn!(channel = %name, expr = %expr, "unparsable peer expression");
                    continue;
                };
                match peer.sub_index {
                    Some(sub) => {
                        if let Some(a) = self
                            .find_address(&peer.service, &peer.instance_id, &peer.channel, sub)
                            .await
                        {
                            addresses.push(a);
                        }
                    }
                    None if sp.auto_sub_channel => {
                        addresses.extend(
                            self.find_addresses(&peer.service, &peer.instance_id, &peer.channel)
                                .await,
                        );
                    }
                    None => {
                        if let Some(a) = self
                            .find_address(&peer.service, &peer.instance_id, &peer.channel, 0)
                            .await
                        {
                            addresses.push(a);
                        }
                    }
                }
            }

            for address in addresses {
                if sp.address.is_empty() {
                    sp.address = address;
                } else {
                    sp.address.push(',');
                    sp.address.push_str(&address);
                }
            }
            debug!(channel = %name, address = %sp.address, "connect-config resolved");
            self.connect_channels.lock().insert(name.clone(), sp);
        }
        Ok(())
    }

    /// Publish the resolved connect addresses as socket hashes.
    async fn write_connect_address(&self) -> Result<()> {
        let connect: Vec<SocketProperty> = self.connect_channels.lock().values().cloned().collect();
        if connect.is_empty() {
            return Ok(());
        }
        let mut commands = Vec::new();
        let mut keys = Vec::new();
        for sp in &connect {
            for (index, address) in sp
                .address
                .split(',')
                .filter(|a| !a.is_empty() && *a != "unspecified")
                .enumerate()
            {
                let key = self.socket_key(&sp.name, index);
                commands.push(PipelineCommand::HSet {
                    key: key.clone(),
                    fields: vec![
                        ("name".into(), sp.name.clone()),
                        ("type".into(), sp.socket_type.clone()),
                        ("method".into(), sp.method.as_str().into()),
                        ("address".into(), address.to_string()),
                        ("transport".into(), sp.transport.clone()),
                        ("numSockets".into(), sp.num_sockets.to_string()),
                        ("autoSubChannel".into(), (sp.auto_sub_channel as u8).to_string()),
                    ],
                });
                commands.push(PipelineCommand::Expire {
                    key: key.clone(),
                    ttl: self.max_ttl,
                });
                keys.push(key);
            }
        }
        if commands.is_empty() {
            return Ok(());
        }
        self.registry.pipeline(commands).await?;
        self.registered_keys.lock().extend(keys);
        Ok(())
    }

    // ------------------------------------------------------------------
    // phase C: reset
    // ------------------------------------------------------------------

    /// Delete every registered key and drop the cached maps.
    pub async fn reset(&self) -> Result<()> {
        let keys: Vec<String> = {
            let mut registered = self.registered_keys.lock();
            let keys = registered.iter().cloned().collect();
            registered.clear();
            keys
        };
        if !keys.is_empty() {
            let n = self.registry.del(&keys).await?;
            debug!(id = %self.instance_id, n, "topology keys deleted");
        }
        self.bind_channels.lock().clear();
        self.connect_channels.lock().clear();
        self.links.lock().clear();
        Ok(())
    }

    // ------------------------------------------------------------------
    // peer lookups
    // ------------------------------------------------------------------

    async fn read_peer_ip(&self, peer_channel_key: &str) -> Option<String> {
        let marker = format!("{}{}", self.sep(), topology::CHANNEL_PREFIX);
        let instance_key = match peer_channel_key.find(&marker) {
            Some(pos) => &peer_channel_key[..pos],
            None => peer_channel_key,
        };
        let health_key = join(&[instance_key, HEALTH_PREFIX], self.sep());
        match self.registry.hget(&health_key, "hostIp").await {
            Ok(Some(ip)) => Some(ip),
            Ok(None) => {
                warn!(key = %health_key, "peer hostIp not found");
                None
            }
            Err(e) => {
                warn!(key = %health_key, error = %e, "peer health read failed");
                None
            }
        }
    }

    /// Sorted addresses of a peer channel's sub-sockets, wildcard-rewritten
    /// to the peer's host IP.
    async fn read_peer_address(&self, peer_channel_key: &str) -> Result<Vec<String>> {
        let Some(peer_ip) = self.read_peer_ip(peer_channel_key).await else {
            return Ok(Vec::new());
        };
        let marker = format!("{}{}", self.sep(), topology::CHANNEL_PREFIX);
        let instance_key = match peer_channel_key.find(&marker) {
            Some(pos) => &peer_channel_key[..pos],
            None => peer_channel_key,
        };
        let peer_channel = match peer_channel_key.rfind(self.sep()) {
            Some(pos) => &peer_channel_key[pos + self.sep().len()..],
            None => peer_channel_key,
        };
        let pattern = join(
            &[instance_key, topology::SOCKET_PREFIX, &format!("chans.{peer_channel}.*")],
            self.sep(),
        );
        let socket_keys = self.registry.scan(&pattern).await?;

        let mut addresses = Vec::new();
        for key in socket_keys {
            match self.retry_hget_address(&key).await {
                Some(address) => addresses.push(make_address(&address, &peer_ip)),
                None => warn!(key = %key, "peer address lookup abandoned"),
            }
        }
        Ok(addresses)
    }

    async fn find_address(
        &self,
        service: &str,
        instance_id: &str,
        channel: &str,
        sub_index: usize,
    ) -> Option<String> {
        let health_key = join(&[TOP_PREFIX, service, instance_id, HEALTH_PREFIX], self.sep());
        let peer_ip = match self.registry.hget(&health_key, "hostIp").await {
            Ok(Some(ip)) => ip,
            _ => {
                warn!(key = %health_key, "peer hostIp not found");
                return None;
            }
        };
        let field = format!("chans.{channel}.{sub_index}");
        let key = join(&[TOP_PREFIX, service, instance_id, topology::SOCKET_PREFIX, &field], self.sep());
        self.retry_hget_address(&key)
            .await
            .map(|a| make_address(&a, &peer_ip))
    }

    async fn find_addresses(&self, service: &str, instance_id: &str, channel: &str) -> Vec<String> {
        let health_key = join(&[TOP_PREFIX, service, instance_id, HEALTH_PREFIX], self.sep());
        let peer_ip = match self.registry.hget(&health_key, "hostIp").await {
            Ok(Some(ip)) => ip,
            _ => {
                warn!(key = %health_key, "peer hostIp not found");
                return Vec::new();
            }
        };
        let pattern = join(
            &[TOP_PREFIX, service, instance_id, topology::SOCKET_PREFIX, &format!("chans.{channel}.*")],
            self.sep(),
        );
        let socket_keys = match self.registry.scan(&pattern).await {
            Ok(keys) => keys,
            Err(e) => {
                warn!(pattern = %pattern, error = %e, "socket scan failed");
                return Vec::new();
            }
        };
        let mut out = Vec::new();
        for key in socket_keys {
            if let Some(a) = self.retry_hget_address(&key).await {
                out.push(make_address(&a, &peer_ip));
            }
        }
        out
    }

    /// Poll a socket hash for its address, once per second up to the retry
    /// budget, aborting on cancellation.
    async fn retry_hget_address(&self, key: &str) -> Option<String> {
        let mut tries = 0;
        loop {
            match self.registry.hget(key, "address").await {
                Ok(Some(address)) => return Some(address),
                Ok(None) => {}
                Err(e) if e.is_transient() => warn!(key = %key, error = %e, "address poll failed"),
                Err(e) => {
                    warn!(key = %key, error = %e, "address poll hit protocol error");
                    return None;
                }
            }
            if self.cancel.is_cancelled() || tries >= self.max_retry {
                return None;
            }
            tries += 1;
            tokio::time::sleep(RESOLVE_POLL).await;
        }
    }
}
