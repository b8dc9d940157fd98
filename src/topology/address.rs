//! Address rewriting, UDS synthesis and symbolic peer expressions.

use std::sync::OnceLock;

use regex::Regex;

/// Rewrite a wildcard bind address into something a peer can dial: in a
/// `tcp://` address, `*` or `0.0.0.0` becomes the owner's host IP. Anything
/// else passes through untouched.
pub fn make_address(address: &str, peer_ip: &str) -> String {
    if !address.starts_with("tcp://") {
        return address.to_string();
    }
    if !address.contains('*') && !address.contains("0.0.0.0") {
        return address.to_string();
    }
    match address.rfind(':') {
        Some(port_pos) => format!("tcp://{}{}", peer_ip, &address[port_pos..]),
        None => address.to_string(),
    }
}

/// Abstract unix-domain-socket address for a local sub-socket.
pub fn uds_address(service: &str, instance_id: &str, channel: &str, sub_index: usize) -> String {
    format!("ipc://@/tmp/nestdaq/{service}/{instance_id}/{channel}[{sub_index}]")
}

/// A symbolic peer reference from an explicit connect configuration,
/// e.g. `Sampler:Sampler-0:out[2]`, `Sampler-0:out` or `Sampler:out`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerExpr {
    pub service: String,
    pub instance_id: String,
    pub channel: String,
    pub sub_index: Option<usize>,
}

struct PeerGrammar {
    full: Regex,
    instance: Regex,
    service: Regex,
}

fn grammar(separator: &str) -> &'static PeerGrammar {
    // the separator is configurable in principle but fixed per process
    static GRAMMAR: OnceLock<PeerGrammar> = OnceLock::new();
    GRAMMAR.get_or_init(|| {
        let sep = regex::escape(separator);
        PeerGrammar {
            full: Regex::new(&format!(r"^(\w+){sep}(\w+)-(\d+){sep}(\w+)(?:\[(\d+)\])?$"))
                .unwrap_or_else(|e| panic!("peer grammar: {e}")),
            instance: Regex::new(&format!(r"^(\w+)-(\d+){sep}(\w+)(?:\[(\d+)\])?$"))
                .unwrap_or_else(|e| panic!("peer grammar: {e}")),
            service: Regex::new(&format!(r"^(\w+){sep}(\w+)(?:\[(\d+)\])?$"))
                .unwrap_or_else(|e| panic!("peer grammar: {e}")),
        }
    })
}

impl PeerExpr {
    /// Parse a peer expression. Missing parts default to
    /// `instance = <service>-0` and the service inferred from the instance
    /// name; a missing sub-index is left to the caller (0, or all sub-sockets
    /// when the local channel fans out).
    pub fn parse(expr: &str, separator: &str) -> Option<Self> {
        let g = grammar(separator);
        if let Some(c) = g.full.captures(expr) {
            return Some(Self {
                service: c[1].to_string(),
                instance_id: format!("{}-{}", &c[2], &c[3]),
                channel: c[4].to_string(),
                sub_index: c.get(5).map(|m| m.as_str().parse().ok()).flatten(),
            });
        }
        if let Some(c) = g.instance.captures(expr) {
            return Some(Self {
                service: c[1].to_string(),
                instance_id: format!("{}-{}", &c[1], &c[2]),
                channel: c[3].to_string(),
                sub_index: c.get(4).map(|m| m.as_str().parse().ok()).flatten(),
            });
        }
        if let Some(c) = g.service.captures(expr) {
            return Some(Self {
                service: c[1].to_string(),
                instance_id: format!("{}-0", &c[1]),
                channel: c[2].to_string(),
                sub_index: c.get(3).map(|m| m.as_str().parse().ok()).flatten(),
            });
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wildcard_rewrite() {
        assert_eq!(make_address("tcp://0.0.0.0:22000", "10.0.0.7"), "tcp://10.0.0.7:22000");
        assert_eq!(make_address("tcp://*:22000", "10.0.0.7"), "tcp://10.0.0.7:22000");
        assert_eq!(make_address("tcp://10.0.0.3:22000", "10.0.0.7"), "tcp://10.0.0.3:22000");
        assert_eq!(make_address("ipc://@/tmp/nestdaq/x", "10.0.0.7"), "ipc://@/tmp/nestdaq/x");
    }

    #[test]
    fn uds_layout() {
        assert_eq!(
            uds_address("Sampler", "Sampler-0", "out", 2),
            "ipc://@/tmp/nestdaq/Sampler/Sampler-0/out[2]"
        );
    }

    #[test]
    fn peer_expression_full_form() {
        let p = PeerExpr::parse("Sampler:Sampler-0:out[2]", ":").unwrap();
        assert_eq!(p.service, "Sampler");
        assert_eq!(p.instance_id, "Sampler-0");
        assert_eq!(p.channel, "out");
        assert_eq!(p.sub_index, Some(2));

        let p = PeerExpr::parse("Sampler:Sink-1:data", ":").unwrap();
        assert_eq!(p.service, "Sampler");
        assert_eq!(p.instance_id, "Sink-1");
        assert_eq!(p.sub_index, None);
    }

    #[test]
    fn peer_expression_instance_form_infers_service() {
        let p = PeerExpr::parse("Sampler-3:out", ":").unwrap();
        assert_eq!(p.service, "Sampler");
        assert_eq!(p.instance_id, "Sampler-3");
        assert_eq!(p.sub_index, None);

        let p = PeerExpr::parse("Sampler-3:out[1]", ":").unwrap();
        assert_eq!(p.sub_index, Some(1));
    }

    #[test]
    fn peer_expression_service_form_defaults_instance() {
        let p = PeerExpr::parse("Sampler:out", ":").unwrap();
        assert_eq!(p.service, "Sampler");
        assert_eq!(p.instance_id, "Sampler-0");
        assert_eq!(p.channel, "out");

        let p = PeerExpr::parse("Sampler:out[0]", ":").unwrap();
        assert_eq!(p.sub_index, Some(0));
    }

    #[test]
    fn peer_expression_rejects_garbage() {
        assert!(PeerExpr::parse("", ":").is_none());
        assert!(PeerExpr::parse("justone", ":").is_none());
        assert!(PeerExpr::parse("a:b:c:d:e", ":").is_none());
    }
}
