//! Cluster message records
//!
//! On the transport every message is a flat string map. Records are decoded
//! once at the boundary into [`ClusterMessage`]; handlers only ever match on
//! the variant. Messages the engine merely relays to the notification script
//! keep their full record.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

use crate::error::{FailoverError, FailoverResult};
use crate::resource::{ReportKind, ResourceClass};

pub mod fields {
    pub const TYPE: &str = "t";
    pub const ORIGIN: &str = "src";
    pub const NODE: &str = "node";
    pub const STATUS: &str = "st";
    pub const TIMESTAMP: &str = "ts";
    pub const SEQUENCE: &str = "seq";
    pub const COMMENT: &str = "info";
    pub const RESOURCES: &str = "rsc_hold";
    pub const REPORT_TYPE: &str = "rtype";
    pub const IS_STABLE: &str = "isstable";
    pub const RESULT: &str = "result";
}

pub mod types {
    pub const STARTING: &str = "starting";
    pub const RESOURCES: &str = "resource";
    pub const ASK_RESOURCES: &str = "ask_resources";
    pub const ASK_RELEASE: &str = "ip-request";
    pub const ACK_RELEASE: &str = "ip-request-resp";
    pub const SHUTDOWN_COMPLETE: &str = "shutdone";
    pub const STATUS: &str = "status";
    pub const STONITH: &str = "stonith";
}

pub const STATUS_ACTIVE: &str = "active";
pub const STATUS_DEAD: &str = "dead";
pub const COMMENT_PING: &str = "ping";
pub const COMMENT_MACH_DOWN: &str = "mach_down";
pub const COMMENT_SHUTDOWN: &str = "shutdown";
pub const COMMENT_STANDBY: &str = "standby";
pub const COMMENT_REQ_OUR_RESOURCES: &str = "req_our_resources()";

/// Raw key/value record as carried by the transport
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RawMessage(BTreeMap<String, String>);

impl RawMessage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, key: &str, value: impl Into<String>) -> Self {
        self.0.insert(key.to_string(), value.into());
        self
    }

    pub fn insert(&mut self, key: &str, value: impl Into<String>) {
        self.0.insert(key.to_string(), value.into());
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    pub fn msg_type(&self) -> Option<&str> {
        self.get(fields::TYPE)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.0.contains_key(key)
    }

    fn require(&self, msg_type: &str, field: &str) -> FailoverResult<&str> {
        self.get(field)
            .ok_or_else(|| FailoverError::missing_field(msg_type, field))
    }
}

impl FromIterator<(String, String)> for RawMessage {
    fn from_iter<I: IntoIterator<Item = (String, String)>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

/// Phase marker carried by standby negotiation messages
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StandbyStep {
    /// The sender wants to hand its resources over
    Me,
    /// The sender agrees to take them
    Other,
    /// The sender's release or acquisition script finished
    Done,
}

impl StandbyStep {
    pub fn as_str(self) -> &'static str {
        match self {
            StandbyStep::Me => "me",
            StandbyStep::Other => "other",
            StandbyStep::Done => "done",
        }
    }

    fn parse(value: &str) -> FailoverResult<Self> {
        match value.to_ascii_lowercase().as_str() {
            "me" => Ok(StandbyStep::Me),
            "other" => Ok(StandbyStep::Other),
            "done" => Ok(StandbyStep::Done),
            other => Err(FailoverError::malformed(format!(
                "unknown standby step '{}'",
                other
            ))),
        }
    }
}

impl fmt::Display for StandbyStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of a fencing decision or attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StonithResult {
    Ok,
    BadHost,
    Bad,
    NotConfigured,
    Unneeded,
}

impl StonithResult {
    pub fn as_str(self) -> &'static str {
        match self {
            StonithResult::Ok => "OK",
            StonithResult::BadHost => "badhost",
            StonithResult::Bad => "bad",
            StonithResult::NotConfigured => "n_stnth",
            StonithResult::Unneeded => "unneeded",
        }
    }

    fn parse(value: &str) -> FailoverResult<Self> {
        match value {
            "OK" => Ok(StonithResult::Ok),
            "badhost" => Ok(StonithResult::BadHost),
            "bad" => Ok(StonithResult::Bad),
            "n_stnth" => Ok(StonithResult::NotConfigured),
            "unneeded" => Ok(StonithResult::Unneeded),
            other => Err(FailoverError::malformed(format!(
                "unknown stonith result '{}'",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClusterMessage {
    /// Sender is (re)joining and wants our resource report
    Starting,
    /// Snapshot or delta of what the sender holds
    Resources {
        class: ResourceClass,
        kind: ReportKind,
        /// `None` when the report came from a takeover script
        stable: Option<bool>,
        comment: Option<String>,
    },
    /// Standby negotiation step; `class` is relative to the requester
    AskResources {
        class: ResourceClass,
        step: StandbyStep,
    },
    AskRelease(RawMessage),
    AckRelease(RawMessage),
    /// Sender released everything and is leaving
    ShutdownComplete { ping: bool },
    /// Node status change; the subject node is the envelope origin
    Status { status: String, ping: bool },
    Stonith { node: String, result: StonithResult },
    Other(RawMessage),
}

impl ClusterMessage {
    pub fn type_name(&self) -> &str {
        match self {
            ClusterMessage::Starting => types::STARTING,
            ClusterMessage::Resources { .. } => types::RESOURCES,
            ClusterMessage::AskResources { .. } => types::ASK_RESOURCES,
            ClusterMessage::AskRelease(_) => types::ASK_RELEASE,
            ClusterMessage::AckRelease(_) => types::ACK_RELEASE,
            ClusterMessage::ShutdownComplete { .. } => types::SHUTDOWN_COMPLETE,
            ClusterMessage::Status { .. } => types::STATUS,
            ClusterMessage::Stonith { .. } => types::STONITH,
            ClusterMessage::Other(raw) => raw.msg_type().unwrap_or(""),
        }
    }

    /// Full resource report as broadcast by the engine
    pub fn resources_held(class: ResourceClass, stable: bool, comment: Option<&str>) -> Self {
        ClusterMessage::Resources {
            class,
            kind: ReportKind::Full,
            stable: Some(stable),
            comment: comment.map(str::to_string),
        }
    }

    pub fn node_dead(ping: bool) -> Self {
        ClusterMessage::Status {
            status: STATUS_DEAD.to_string(),
            ping,
        }
    }

    fn decode(raw: RawMessage) -> FailoverResult<Self> {
        let msg_type = raw
            .msg_type()
            .ok_or_else(|| FailoverError::missing_field("<untyped>", fields::TYPE))?
            .to_string();
        let comment = raw.get(fields::COMMENT).map(str::to_string);

        let msg = match msg_type.as_str() {
            types::STARTING => ClusterMessage::Starting,
            types::RESOURCES => {
                let class = ResourceClass::decode(raw.require(&msg_type, fields::RESOURCES)?);
                let kind = match raw.get(fields::REPORT_TYPE) {
                    Some("full") => ReportKind::Full,
                    _ => ReportKind::Incremental,
                };
                ClusterMessage::Resources {
                    class,
                    kind,
                    stable: raw.get(fields::IS_STABLE).map(|s| s == "1"),
                    comment,
                }
            }
            types::ASK_RESOURCES => ClusterMessage::AskResources {
                // a request without a class means everything
                class: raw
                    .get(fields::RESOURCES)
                    .map(ResourceClass::decode)
                    .unwrap_or(ResourceClass::All),
                step: StandbyStep::parse(raw.require(&msg_type, fields::COMMENT)?)?,
            },
            types::ASK_RELEASE => ClusterMessage::AskRelease(raw),
            types::ACK_RELEASE => ClusterMessage::AckRelease(raw),
            types::SHUTDOWN_COMPLETE => ClusterMessage::ShutdownComplete {
                ping: comment.as_deref() == Some(COMMENT_PING),
            },
            types::STATUS => ClusterMessage::Status {
                status: raw.require(&msg_type, fields::STATUS)?.to_string(),
                ping: comment.as_deref() == Some(COMMENT_PING),
            },
            types::STONITH => ClusterMessage::Stonith {
                node: raw.require(&msg_type, fields::NODE)?.to_string(),
                result: StonithResult::parse(raw.require(&msg_type, fields::RESULT)?)?,
            },
            _ => ClusterMessage::Other(raw),
        };
        Ok(msg)
    }

    fn encode_into(&self, record: &mut RawMessage) {
        match self {
            ClusterMessage::Starting => {}
            ClusterMessage::Resources {
                class,
                kind,
                stable,
                comment,
            } => {
                record.insert(fields::RESOURCES, class.as_str());
                if *kind == ReportKind::Full {
                    record.insert(fields::REPORT_TYPE, "full");
                }
                if let Some(stable) = stable {
                    record.insert(fields::IS_STABLE, if *stable { "1" } else { "0" });
                }
                if let Some(comment) = comment {
                    record.insert(fields::COMMENT, comment.as_str());
                }
            }
            ClusterMessage::AskResources { class, step } => {
                record.insert(fields::RESOURCES, class.as_str());
                record.insert(fields::COMMENT, step.as_str());
            }
            ClusterMessage::ShutdownComplete { ping } => {
                record.insert(fields::STATUS, STATUS_DEAD);
                if *ping {
                    record.insert(fields::COMMENT, COMMENT_PING);
                }
            }
            ClusterMessage::Status { status, ping } => {
                record.insert(fields::STATUS, status.as_str());
                if *ping {
                    record.insert(fields::COMMENT, COMMENT_PING);
                }
            }
            ClusterMessage::Stonith { node, result } => {
                record.insert(fields::NODE, node.as_str());
                record.insert(fields::RESULT, result.as_str());
            }
            ClusterMessage::AskRelease(raw)
            | ClusterMessage::AckRelease(raw)
            | ClusterMessage::Other(raw) => {
                for (key, value) in raw.iter() {
                    record.insert(key, value);
                }
            }
        }
    }
}

/// A message together with the node it came from
///
/// `extras` holds record fields the typed variant does not model (transport
/// timestamps, sequence numbers, fields from newer peers). They travel on to
/// the notification script untouched.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    pub from: String,
    pub message: ClusterMessage,
    pub extras: RawMessage,
}

impl Envelope {
    pub fn new(from: impl Into<String>, message: ClusterMessage) -> Self {
        Self {
            from: from.into(),
            message,
            extras: RawMessage::new(),
        }
    }

    pub fn with_field(mut self, key: &str, value: impl Into<String>) -> Self {
        self.extras.insert(key, value);
        self
    }

    /// Decode a transport record; the origin field is mandatory
    pub fn decode(raw: RawMessage) -> FailoverResult<Self> {
        let msg_type = raw.msg_type().unwrap_or("<untyped>").to_string();
        let from = raw.require(&msg_type, fields::ORIGIN)?.to_string();
        let mut envelope = Self::new(from, ClusterMessage::decode(raw.clone())?);

        let modeled = envelope.to_record();
        envelope.extras = raw
            .0
            .into_iter()
            .filter(|(key, _)| !modeled.contains_key(key))
            .collect();
        Ok(envelope)
    }

    pub fn to_record(&self) -> RawMessage {
        let mut record = self.extras.clone();
        self.message.encode_into(&mut record);
        record.insert(fields::TYPE, self.message.type_name());
        record.insert(fields::ORIGIN, self.from.as_str());
        record
    }

    pub fn is_from(&self, node: &str) -> bool {
        self.from == node
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn record(pairs: &[(&str, &str)]) -> RawMessage {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_decode_resources_report() {
        let env = Envelope::decode(record(&[
            ("t", "resource"),
            ("src", "beta"),
            ("rsc_hold", "local"),
            ("rtype", "full"),
            ("isstable", "1"),
        ]))
        .unwrap();

        assert_eq!(env.from, "beta");
        assert_eq!(
            env.message,
            ClusterMessage::Resources {
                class: ResourceClass::Local,
                kind: ReportKind::Full,
                stable: Some(true),
                comment: None,
            }
        );
    }

    #[test]
    fn test_script_report_is_incremental_without_stability() {
        let env = Envelope::decode(record(&[
            ("t", "resource"),
            ("src", "alpha"),
            ("rsc_hold", "foreign"),
            ("info", "mach_down"),
        ]))
        .unwrap();

        match env.message {
            ClusterMessage::Resources {
                kind,
                stable,
                comment,
                ..
            } => {
                assert_eq!(kind, ReportKind::Incremental);
                assert_eq!(stable, None);
                assert_eq!(comment.as_deref(), Some("mach_down"));
            }
            other => panic!("unexpected message {:?}", other),
        }
    }

    #[test]
    fn test_missing_resource_field_is_rejected() {
        let err = Envelope::decode(record(&[("t", "resource"), ("src", "beta")])).unwrap_err();
        assert!(matches!(err, FailoverError::MissingField { .. }));
    }

    #[test]
    fn test_missing_origin_is_rejected() {
        assert!(Envelope::decode(record(&[("t", "starting")])).is_err());
    }

    #[test]
    fn test_ask_resources_defaults_to_all() {
        let env = Envelope::decode(record(&[
            ("t", "ask_resources"),
            ("src", "beta"),
            ("info", "me"),
        ]))
        .unwrap();
        assert_eq!(
            env.message,
            ClusterMessage::AskResources {
                class: ResourceClass::All,
                step: StandbyStep::Me
            }
        );
    }

    #[test]
    fn test_unknown_standby_step_is_rejected() {
        let result = Envelope::decode(record(&[
            ("t", "ask_resources"),
            ("src", "beta"),
            ("info", "maybe"),
        ]));
        assert!(result.is_err());
    }

    #[test]
    fn test_unknown_type_is_kept_verbatim() {
        let raw = record(&[("t", "ipfail"), ("src", "beta"), ("extra", "x")]);
        let env = Envelope::decode(raw.clone()).unwrap();
        assert_eq!(env.message.type_name(), "ipfail");
        assert_eq!(env.to_record(), raw);
    }

    #[test]
    fn test_encode_stonith_and_shutdown() {
        let stonith = Envelope::new(
            "alpha",
            ClusterMessage::Stonith {
                node: "beta".into(),
                result: StonithResult::NotConfigured,
            },
        );
        let rec = stonith.to_record();
        assert_eq!(rec.get("t"), Some("stonith"));
        assert_eq!(rec.get("result"), Some("n_stnth"));
        assert_eq!(rec.get("node"), Some("beta"));

        let shutdone = Envelope::new("alpha", ClusterMessage::ShutdownComplete { ping: false });
        let rec = shutdone.to_record();
        assert_eq!(rec.get("st"), Some("dead"));
        assert_eq!(rec.get("info"), None);
    }

    #[test]
    fn test_unmodeled_fields_are_kept() {
        let raw = record(&[
            ("t", "status"),
            ("src", "beta"),
            ("st", "active"),
            ("ts", "65a1b2c3"),
            ("seq", "42"),
        ]);
        let env = Envelope::decode(raw.clone()).unwrap();
        assert_eq!(
            env.message,
            ClusterMessage::Status {
                status: "active".to_string(),
                ping: false
            }
        );
        assert_eq!(env.extras.get("ts"), Some("65a1b2c3"));
        assert_eq!(env.extras.get("st"), None);
        assert_eq!(env.to_record(), raw);
    }

    #[test]
    fn test_record_serializes_as_flat_map() {
        let env = Envelope::new("alpha", ClusterMessage::resources_held(ResourceClass::All, true, None));
        let json = serde_json::to_string(&env.to_record()).unwrap();
        let back: RawMessage = serde_json::from_str(&json).unwrap();
        assert_eq!(Envelope::decode(back).unwrap(), env);
    }
}
