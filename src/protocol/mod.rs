//! Wire protocol for the alert feed and per-camera detection streams.
//!
//! Inbound frames are text-framed JSON envelopes tagged by `type`; outbound
//! commands are tagged by `action`. Parsing into the closed [`ServerEvent`]
//! sum type rejects unrecognized tags, so malformed or unknown messages are
//! dropped at the boundary instead of leaking partial data downstream.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Severity of a detection or alert.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Critical,
    High,
    Medium,
    Low,
}

impl Severity {
    /// Numeric rank for comparisons (higher = more severe).
    pub fn rank(&self) -> u8 {
        match self {
            Self::Critical => 3,
            Self::High => 2,
            Self::Medium => 1,
            Self::Low => 0,
        }
    }
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Critical => write!(f, "critical"),
            Self::High => write!(f, "high"),
            Self::Medium => write!(f, "medium"),
            Self::Low => write!(f, "low"),
        }
    }
}

/// Weapon classes the detection backend reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WeaponType {
    Pistol,
    Rifle,
    Knife,
    Other,
}

impl WeaponType {
    /// Default severity when the backend omits one.
    pub fn default_severity(&self) -> Severity {
        match self {
            Self::Pistol | Self::Rifle => Severity::Critical,
            Self::Knife => Severity::High,
            Self::Other => Severity::Medium,
        }
    }
}

impl std::fmt::Display for WeaponType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pistol => write!(f, "pistol"),
            Self::Rifle => write!(f, "rifle"),
            Self::Knife => write!(f, "knife"),
            Self::Other => write!(f, "other"),
        }
    }
}

/// Pixel-space detection rectangle.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x1: f32,
    pub y1: f32,
    pub x2: f32,
    pub y2: f32,
}

/// A weapon-detection alert as broadcast by the backend.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlertEvent {
    /// Unique alert identifier; dedup and acknowledgment identity.
    pub id: String,
    pub camera_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub camera_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<String>,
    pub weapon_type: WeaponType,
    /// Detector confidence in 0..=1.
    pub confidence: f32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub severity: Option<Severity>,
    /// Server-relative path to the snapshot image.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_snapshot: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub video_clip: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bounding_box: Option<BoundingBox>,
    #[serde(
        default,
        deserialize_with = "lenient_utc",
        skip_serializing_if = "Option::is_none"
    )]
    pub timestamp: Option<DateTime<Utc>>,
}

/// Backend timestamps arrive both with and without a UTC offset; accept
/// both, and treat an unparseable one as absent rather than rejecting the
/// whole alert.
fn lenient_utc<'de, D>(deserializer: D) -> Result<Option<DateTime<Utc>>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let raw: Option<String> = Option::deserialize(deserializer)?;
    let Some(raw) = raw else {
        return Ok(None);
    };
    if let Ok(parsed) = DateTime::parse_from_rfc3339(&raw) {
        return Ok(Some(parsed.with_timezone(&Utc)));
    }
    match raw.parse::<chrono::NaiveDateTime>() {
        Ok(naive) => Ok(Some(DateTime::from_naive_utc_and_offset(naive, Utc))),
        Err(_) => Ok(None),
    }
}

impl AlertEvent {
    /// Effective severity: explicit value, else derived from the weapon type.
    pub fn effective_severity(&self) -> Severity {
        self.severity
            .unwrap_or_else(|| self.weapon_type.default_severity())
    }
}

/// One detection inside a live overlay frame.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Detection {
    pub class_name: String,
    pub confidence: f32,
    pub x1: f32,
    pub y1: f32,
    pub x2: f32,
    pub y2: f32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub severity: Option<Severity>,
}

/// A live detection frame for one camera (coordinates only, no image data).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DetectionFrame {
    pub camera_id: String,
    #[serde(default = "default_frame_width")]
    pub frame_width: u32,
    #[serde(default = "default_frame_height")]
    pub frame_height: u32,
    #[serde(default)]
    pub processing_time_ms: u64,
    #[serde(default)]
    pub detections: Vec<Detection>,
}

fn default_frame_width() -> u32 {
    1920
}

fn default_frame_height() -> u32 {
    1080
}

/// Periodic system status broadcast.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StatusSnapshot {
    #[serde(default)]
    pub cameras_online: u32,
    #[serde(default)]
    pub alerts_today: u32,
    #[serde(default)]
    pub system_status: String,
}

/// Inbound envelope, tagged by `type`.
///
/// An unknown tag is a deserialization error; callers log and drop it.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerEvent {
    #[serde(rename = "new_alert")]
    Alert {
        data: AlertEvent,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        timestamp: Option<String>,
    },
    #[serde(rename = "status_update")]
    Status {
        data: StatusSnapshot,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        timestamp: Option<String>,
    },
    Detection {
        #[serde(flatten)]
        frame: DetectionFrame,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        timestamp: Option<String>,
    },
    Connected {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        camera_id: Option<String>,
    },
    Subscribed {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        channel: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        camera_id: Option<String>,
    },
    Unsubscribed {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        channel: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        camera_id: Option<String>,
    },
    Ping {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        timestamp: Option<String>,
    },
    Pong {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        timestamp: Option<String>,
    },
    Error {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message: Option<String>,
    },
    CameraStatus {
        camera_id: String,
        status: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        timestamp: Option<String>,
    },
}

impl ServerEvent {
    /// Parse one text frame. Unknown `type` tags are an error.
    pub fn parse(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }

    /// Short tag name for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Alert { .. } => "new_alert",
            Self::Status { .. } => "status_update",
            Self::Detection { .. } => "detection",
            Self::Connected { .. } => "connected",
            Self::Subscribed { .. } => "subscribed",
            Self::Unsubscribed { .. } => "unsubscribed",
            Self::Ping { .. } => "ping",
            Self::Pong { .. } => "pong",
            Self::Error { .. } => "error",
            Self::CameraStatus { .. } => "camera_status",
        }
    }
}

/// Outbound command envelope, tagged by `action`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum ClientCommand {
    Ping,
    Pong,
    SubscribeAlerts,
    UnsubscribeAlerts,
    SubscribeCamera { camera_id: String },
    UnsubscribeCamera { camera_id: String },
    GetStats,
}

impl ClientCommand {
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

/// A logical subscription target on the alert feed.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ChannelId {
    /// The global alert broadcast channel.
    Alerts,
    /// One camera's event channel.
    Camera(String),
}

impl ChannelId {
    pub fn subscribe_command(&self) -> ClientCommand {
        match self {
            Self::Alerts => ClientCommand::SubscribeAlerts,
            Self::Camera(id) => ClientCommand::SubscribeCamera {
                camera_id: id.clone(),
            },
        }
    }

    pub fn unsubscribe_command(&self) -> ClientCommand {
        match self {
            Self::Alerts => ClientCommand::UnsubscribeAlerts,
            Self::Camera(id) => ClientCommand::UnsubscribeCamera {
                camera_id: id.clone(),
            },
        }
    }
}

impl std::fmt::Display for ChannelId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Alerts => write!(f, "alerts"),
            Self::Camera(id) => write!(f, "camera:{}", id),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_alert_envelope_roundtrip() {
        let json = r#"{
            "type": "new_alert",
            "data": {
                "id": "a-1",
                "camera_id": "cam-3",
                "camera_name": "Lobby",
                "weapon_type": "pistol",
                "confidence": 0.93,
                "bounding_box": {"x1": 10.0, "y1": 20.0, "x2": 110.0, "y2": 220.0}
            },
            "timestamp": "2026-08-06T10:00:00Z"
        }"#;

        let event = ServerEvent::parse(json).unwrap();
        match &event {
            ServerEvent::Alert { data, .. } => {
                assert_eq!(data.id, "a-1");
                assert_eq!(data.camera_id, "cam-3");
                assert_eq!(data.weapon_type, WeaponType::Pistol);
                assert_eq!(data.effective_severity(), Severity::Critical);
            }
            other => panic!("expected alert, got {}", other.kind()),
        }

        let out = serde_json::to_string(&event).unwrap();
        let back = ServerEvent::parse(&out).unwrap();
        assert_eq!(back.kind(), "new_alert");
    }

    #[test]
    fn test_unknown_tag_rejected() {
        let json = r#"{"type": "totally_new_thing", "data": {}}"#;
        assert!(ServerEvent::parse(json).is_err());
    }

    #[test]
    fn test_malformed_json_rejected() {
        assert!(ServerEvent::parse("{not json").is_err());
    }

    #[test]
    fn test_detection_frame_defaults() {
        let json = r#"{"type": "detection", "camera_id": "cam-1", "detections": []}"#;
        let event = ServerEvent::parse(json).unwrap();
        match event {
            ServerEvent::Detection { frame, .. } => {
                assert_eq!(frame.frame_width, 1920);
                assert_eq!(frame.frame_height, 1080);
                assert!(frame.detections.is_empty());
            }
            other => panic!("expected detection, got {}", other.kind()),
        }
    }

    #[test]
    fn test_severity_derived_from_weapon() {
        assert_eq!(WeaponType::Pistol.default_severity(), Severity::Critical);
        assert_eq!(WeaponType::Rifle.default_severity(), Severity::Critical);
        assert_eq!(WeaponType::Knife.default_severity(), Severity::High);
        assert_eq!(WeaponType::Other.default_severity(), Severity::Medium);
        assert!(Severity::Critical.rank() > Severity::Low.rank());
    }

    #[test]
    fn test_client_command_wire_format() {
        let cmd = ClientCommand::SubscribeCamera {
            camera_id: "cam-7".into(),
        };
        let json = cmd.to_json().unwrap();
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(value["action"], "subscribe_camera");
        assert_eq!(value["camera_id"], "cam-7");

        assert_eq!(ClientCommand::Ping.to_json().unwrap(), r#"{"action":"ping"}"#);
    }

    #[test]
    fn test_channel_id_display_and_commands() {
        assert_eq!(ChannelId::Alerts.to_string(), "alerts");
        assert_eq!(ChannelId::Camera("c1".into()).to_string(), "camera:c1");
        assert_eq!(
            ChannelId::Alerts.subscribe_command(),
            ClientCommand::SubscribeAlerts
        );
        assert_eq!(
            ChannelId::Camera("c1".into()).unsubscribe_command(),
            ClientCommand::UnsubscribeCamera {
                camera_id: "c1".into()
            }
        );
    }

    #[test]
    fn test_naive_timestamp_accepted() {
        let json = r#"{
            "type": "new_alert",
            "data": {
                "id": "a-2",
                "camera_id": "cam-1",
                "weapon_type": "knife",
                "confidence": 0.7,
                "timestamp": "2026-08-06T10:00:00.123456"
            }
        }"#;
        let event = ServerEvent::parse(json).unwrap();
        match event {
            ServerEvent::Alert { data, .. } => assert!(data.timestamp.is_some()),
            other => panic!("expected alert, got {}", other.kind()),
        }
    }

    #[test]
    fn test_ping_pong_parse() {
        let ping = ServerEvent::parse(r#"{"type":"ping","timestamp":"t"}"#).unwrap();
        assert_eq!(ping.kind(), "ping");
        let pong = ServerEvent::parse(r#"{"type":"pong"}"#).unwrap();
        assert_eq!(pong.kind(), "pong");
    }
}
