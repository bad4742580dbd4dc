use crate::model::DeviceDescriptor;

/// Default topic namespace.
pub const DEFAULT_NAMESPACE: &str = "energy";

/// Pseudo-device owning the system controls topic.
pub const SYSTEM_SEGMENT: &str = "system";

/// Builder for bus topics.
///
/// Topics follow the pattern `<namespace>/<device>/<channel>`:
/// - `energy/solar/command` commands to a device
/// - `energy/solar/status` status reported by a device
/// - `energy/system/controls` system-wide controls
/// - `energy/relay/status` relay liveness (retained)
#[derive(Debug, Clone)]
pub struct TopicBuilder {
    namespace: String,
}

impl Default for TopicBuilder {
    fn default() -> Self {
        Self::new(DEFAULT_NAMESPACE)
    }
}

impl TopicBuilder {
    pub fn new(namespace: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
        }
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// Topic a device listens on for commands.
    ///
    /// # Example
    /// ```
    /// use voltlink_common::topics::TopicBuilder;
    ///
    /// let topics = TopicBuilder::default();
    /// assert_eq!(topics.command_topic("heatpump"), "energy/heatpump/command");
    /// ```
    pub fn command_topic(&self, device_id: &str) -> String {
        format!("{}/{}/command", self.namespace, device_id)
    }

    /// Topic a device reports its status on.
    pub fn status_topic(&self, device_id: &str) -> String {
        format!("{}/{}/status", self.namespace, device_id)
    }

    pub fn system_controls_topic(&self) -> String {
        format!("{}/{}/controls", self.namespace, SYSTEM_SEGMENT)
    }

    pub fn relay_status_topic(&self) -> String {
        format!("{}/relay/status", self.namespace)
    }

    /// Fixed inbound subscription set: one status topic per device, then
    /// the system controls topic.
    pub fn status_topics(&self, devices: &[DeviceDescriptor]) -> Vec<String> {
        devices
            .iter()
            .map(|d| self.status_topic(&d.id))
            .chain(std::iter::once(self.system_controls_topic()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::DeviceClass;
    use crate::register::{RegisterMap, RegisterSpec};

    fn device(id: &str) -> DeviceDescriptor {
        DeviceDescriptor::new(
            id,
            id,
            "127.0.0.1",
            502,
            DeviceClass::Other("test".to_string()),
            RegisterMap::power_only(RegisterSpec::new(1)),
        )
    }

    #[test]
    fn test_topic_builder() {
        let topics = TopicBuilder::default();

        assert_eq!(topics.command_topic("solar"), "energy/solar/command");
        assert_eq!(topics.status_topic("charger"), "energy/charger/status");
        assert_eq!(topics.system_controls_topic(), "energy/system/controls");
        assert_eq!(topics.relay_status_topic(), "energy/relay/status");
    }

    #[test]
    fn test_status_topics_follow_devices() {
        let topics = TopicBuilder::new("site1");
        let set = topics.status_topics(&[device("solar"), device("heatpump")]);

        assert_eq!(
            set,
            vec![
                "site1/solar/status",
                "site1/heatpump/status",
                "site1/system/controls"
            ]
        );
    }
}
