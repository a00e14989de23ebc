//! Device topic naming
//!
//! Every device owns exactly one topic pair:
//!
//! - `{type_code}/{serial_number}/user/up`   — device → gateway
//! - `{type_code}/{serial_number}/user/down` — gateway → device

use crate::auth::ChannelDirection;

/// A parsed device channel topic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceTopic {
    pub type_code: String,
    pub serial_number: String,
    pub direction: ChannelDirection,
}

impl DeviceTopic {
    /// Parse a topic of the form `{type}/{serial}/user/{up|down}`.
    pub fn parse(topic: &str) -> Option<Self> {
        let mut segments = topic.split('/');
        let type_code = segments.next()?;
        let serial_number = segments.next()?;
        let channel = segments.next()?;
        let direction = segments.next()?;
        if segments.next().is_some() || channel != "user" {
            return None;
        }
        if type_code.is_empty() || serial_number.is_empty() {
            return None;
        }
        let direction = match direction {
            "up" => ChannelDirection::Up,
            "down" => ChannelDirection::Down,
            _ => return None,
        };
        Some(Self {
            type_code: type_code.to_string(),
            serial_number: serial_number.to_string(),
            direction,
        })
    }
}

/// Topic the device publishes on.
pub fn up_topic(type_code: &str, serial_number: &str) -> String {
    format!("{}/{}/user/up", type_code, serial_number)
}

/// Topic the device subscribes to.
pub fn down_topic(type_code: &str, serial_number: &str) -> String {
    format!("{}/{}/user/down", type_code, serial_number)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_valid_topics() {
        let up = DeviceTopic::parse("EVC01/SN123/user/up").unwrap();
        assert_eq!(up.type_code, "EVC01");
        assert_eq!(up.serial_number, "SN123");
        assert_eq!(up.direction, ChannelDirection::Up);

        let down = DeviceTopic::parse("EVC01/SN123/user/down").unwrap();
        assert_eq!(down.direction, ChannelDirection::Down);
    }

    #[test]
    fn parse_rejects_malformed_topics() {
        assert!(DeviceTopic::parse("EVC01/SN123/user").is_none());
        assert!(DeviceTopic::parse("EVC01/SN123/user/up/extra").is_none());
        assert!(DeviceTopic::parse("EVC01/SN123/system/up").is_none());
        assert!(DeviceTopic::parse("EVC01/SN123/user/sideways").is_none());
        assert!(DeviceTopic::parse("/SN123/user/up").is_none());
        assert!(DeviceTopic::parse("EVC01//user/up").is_none());
    }

    #[test]
    fn formatting_matches_parsing() {
        let topic = up_topic("EVC01", "SN123");
        assert_eq!(topic, "EVC01/SN123/user/up");
        assert!(DeviceTopic::parse(&topic).is_some());
        assert_eq!(down_topic("EVC01", "SN123"), "EVC01/SN123/user/down");
    }
}
