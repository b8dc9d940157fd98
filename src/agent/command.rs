//! Messages on the `daqctl` command channel.

use serde::Deserialize;
use serde::Serialize;

/// A command published by the controller.
///
/// A message applies to an agent iff `"all"` is among the services, or the
/// agent's service is listed and either `"all"` or the agent's
/// `<service><S><instanceId>` is among the instances.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandMessage {
    pub command: String,
    pub value: String,
    pub services: Vec<String>,
    pub instances: Vec<String>,
}

impl CommandMessage {
    /// The state-change command kind.
    pub const CHANGE_STATE: &'static str = "change_state";

    pub fn change_state(value: &str, services: Vec<String>, instances: Vec<String>) -> Self {
        Self {
            command: Self::CHANGE_STATE.to_string(),
            value: value.to_string(),
            services,
            instances,
        }
    }

    pub fn applies_to(&self, service: &str, instance_id: &str, separator: &str) -> bool {
        if self.services.iter().any(|s| s == "all") {
            return true;
        }
        if !self.services.iter().any(|s| s == service) {
            return false;
        }
        let long_id = format!("{service}{separator}{instance_id}");
        self.instances.iter().any(|i| i == "all" || i == &long_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn msg(services: &[&str], instances: &[&str]) -> CommandMessage {
        CommandMessage::change_state(
            "RUN",
            services.iter().map(|s| s.to_string()).collect(),
            instances.iter().map(|s| s.to_string()).collect(),
        )
    }

    #[test]
    fn all_services_matches_everyone() {
        assert!(msg(&["all"], &[]).applies_to("Sampler", "Sampler-0", ":"));
        assert!(msg(&["all"], &["Sink:Sink-0"]).applies_to("Sampler", "Sampler-1", ":"));
    }

    #[test]
    fn service_plus_instance_selection() {
        let m = msg(&["Sampler"], &["all"]);
        assert!(m.applies_to("Sampler", "Sampler-0", ":"));
        assert!(!m.applies_to("Sink", "Sink-0", ":"));

        let m = msg(&["Sampler"], &["Sampler:Sampler-1"]);
        assert!(m.applies_to("Sampler", "Sampler-1", ":"));
        assert!(!m.applies_to("Sampler", "Sampler-0", ":"));
    }

    #[test]
    fn wire_shape_roundtrip() {
        let m = msg(&["Sampler"], &["all"]);
        let json = serde_json::to_string(&m).unwrap();
        assert!(json.contains(r#""command":"change_state""#));
        assert!(json.contains(r#""value":"RUN""#));
        let back: CommandMessage = serde_json::from_str(&json).unwrap();
        assert_eq!(back.value, "RUN");
        assert_eq!(back.services, vec!["Sampler"]);
    }

    #[test]
    fn missing_fields_fail_parse() {
        assert!(serde_json::from_str::<CommandMessage>(r#"{"command":"change_state"}"#).is_err());
    }
}
