//! Master/worker message vocabulary.
//!
//! On the wire every message is a flat JSON object
//! `{"Type": <int>, "SubId": <batch id>, "Body": <string>, "ErrMsg": <string>}`
//! whose `Body` holds a nested JSON document (or a raw output line) depending
//! on `Type`. Inside the crate messages are the strongly typed [`Message`]
//! enum; [`WireMessage`] only exists at the codec boundary.

use serde::{Deserialize, Serialize};

use crate::error::{GolemError, Result};
use crate::scheduler::Job;

/// Stable integer tags of the wire format
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MessageType {
    /// worker -> master on connect, body is [`HandshakeInfo`]
    Hello = 0,
    /// worker -> master keep-alive
    Checkin = 1,
    /// master -> worker, body is a [`Job`]
    Start = 2,
    /// master -> worker, SubId is the batch to kill
    Kill = 3,
    /// worker -> master, body is one stdout line
    Cout = 4,
    /// worker -> master, body is one stderr line
    Cerror = 5,
    /// worker -> master, body is the finished [`Job`]
    JobFinished = 6,
    /// worker -> master, body is the failed [`Job`], ErrMsg set
    JobError = 7,
    /// master -> worker, restart and reconnect after a short delay
    Restart = 8,
    /// master -> worker, exit after a short delay
    Die = 9,
}

impl TryFrom<u8> for MessageType {
    type Error = GolemError;

    fn try_from(value: u8) -> Result<Self> {
        Ok(match value {
            0 => MessageType::Hello,
            1 => MessageType::Checkin,
            2 => MessageType::Start,
            3 => MessageType::Kill,
            4 => MessageType::Cout,
            5 => MessageType::Cerror,
            6 => MessageType::JobFinished,
            7 => MessageType::JobError,
            8 => MessageType::Restart,
            9 => MessageType::Die,
            other => return Err(GolemError::UnknownMessageType(other)),
        })
    }
}

impl std::fmt::Display for MessageType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            MessageType::Hello => "HELLO",
            MessageType::Checkin => "CHECKIN",
            MessageType::Start => "START",
            MessageType::Kill => "KILL",
            MessageType::Cout => "COUT",
            MessageType::Cerror => "CERROR",
            MessageType::JobFinished => "JOBFINISHED",
            MessageType::JobError => "JOBERROR",
            MessageType::Restart => "RESTART",
            MessageType::Die => "DIE",
        };
        write!(f, "{}", name)
    }
}

/// First message on every connection, including reconnects.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HandshakeInfo {
    #[serde(rename = "JobCapacity")]
    pub job_capacity: usize,
    #[serde(rename = "RunningJobs", default)]
    pub running_jobs: usize,
    #[serde(
        rename = "NodeIdentityHint",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub identity_hint: Option<String>,
}

impl HandshakeInfo {
    pub fn new(job_capacity: usize, running_jobs: usize) -> Self {
        Self {
            job_capacity,
            running_jobs,
            identity_hint: None,
        }
    }

    /// Parse a HELLO body. Older workers sent a bare integer capacity.
    fn from_body(body: &str) -> Result<Self> {
        if let Ok(capacity) = body.trim().parse::<usize>() {
            return Ok(Self::new(capacity, 0));
        }
        Ok(serde_json::from_str(body)?)
    }
}

/// The flat JSON frame exchanged over the socket
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WireMessage {
    #[serde(rename = "Type")]
    pub kind: u8,
    #[serde(rename = "SubId", default)]
    pub sub_id: String,
    #[serde(rename = "Body", default)]
    pub body: String,
    #[serde(rename = "ErrMsg", default, skip_serializing_if = "Option::is_none")]
    pub err_msg: Option<String>,
}

impl WireMessage {
    fn new(kind: MessageType, sub_id: String, body: String) -> Self {
        Self {
            kind: kind as u8,
            sub_id,
            body,
            err_msg: None,
        }
    }
}

/// Which pipe of a job a line came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OutputStream {
    Stdout,
    Stderr,
}

/// A decoded message
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    Hello(HandshakeInfo),
    Checkin,
    Start(Job),
    Kill { batch_id: String },
    Stdout { batch_id: String, line: String },
    Stderr { batch_id: String, line: String },
    JobFinished(Job),
    JobErrored { job: Job, error: String },
    Restart,
    Die,
}

impl Message {
    pub fn message_type(&self) -> MessageType {
        match self {
            Message::Hello(_) => MessageType::Hello,
            Message::Checkin => MessageType::Checkin,
            Message::Start(_) => MessageType::Start,
            Message::Kill { .. } => MessageType::Kill,
            Message::Stdout { .. } => MessageType::Cout,
            Message::Stderr { .. } => MessageType::Cerror,
            Message::JobFinished(_) => MessageType::JobFinished,
            Message::JobErrored { .. } => MessageType::JobError,
            Message::Restart => MessageType::Restart,
            Message::Die => MessageType::Die,
        }
    }

    /// JOBFINISHED or JOBERROR
    pub fn is_terminal(&self) -> bool {
        matches!(self, Message::JobFinished(_) | Message::JobErrored { .. })
    }

    /// Batch this message refers to, if any
    pub fn batch_id(&self) -> Option<&str> {
        match self {
            Message::Kill { batch_id }
            | Message::Stdout { batch_id, .. }
            | Message::Stderr { batch_id, .. } => Some(batch_id.as_str()),
            Message::Start(job) | Message::JobFinished(job) => Some(job.batch_id.as_str()),
            Message::JobErrored { job, .. } => Some(job.batch_id.as_str()),
            _ => None,
        }
    }

    pub fn encode(&self) -> Result<WireMessage> {
        let kind = self.message_type();
        let wire = match self {
            Message::Hello(info) => {
                WireMessage::new(kind, String::new(), serde_json::to_string(info)?)
            }
            Message::Checkin | Message::Restart | Message::Die => {
                WireMessage::new(kind, String::new(), String::new())
            }
            Message::Start(job) | Message::JobFinished(job) => {
                WireMessage::new(kind, job.batch_id.clone(), serde_json::to_string(job)?)
            }
            Message::Kill { batch_id } => WireMessage::new(kind, batch_id.clone(), String::new()),
            Message::Stdout { batch_id, line } | Message::Stderr { batch_id, line } => {
                WireMessage::new(kind, batch_id.clone(), line.clone())
            }
            Message::JobErrored { job, error } => {
                let mut wire =
                    WireMessage::new(kind, job.batch_id.clone(), serde_json::to_string(job)?);
                wire.err_msg = Some(error.clone());
                wire
            }
        };
        Ok(wire)
    }

    pub fn decode(wire: WireMessage) -> Result<Self> {
        let kind = MessageType::try_from(wire.kind)?;
        let message = match kind {
            MessageType::Hello => Message::Hello(HandshakeInfo::from_body(&wire.body)?),
            MessageType::Checkin => Message::Checkin,
            MessageType::Start => Message::Start(serde_json::from_str(&wire.body)?),
            MessageType::Kill => {
                if wire.sub_id.is_empty() {
                    return Err(GolemError::Protocol("KILL without a batch id".to_string()));
                }
                Message::Kill {
                    batch_id: wire.sub_id,
                }
            }
            MessageType::Cout => Message::Stdout {
                batch_id: wire.sub_id,
                line: wire.body,
            },
            MessageType::Cerror => Message::Stderr {
                batch_id: wire.sub_id,
                line: wire.body,
            },
            MessageType::JobFinished => Message::JobFinished(serde_json::from_str(&wire.body)?),
            MessageType::JobError => Message::JobErrored {
                job: serde_json::from_str(&wire.body)?,
                error: wire.err_msg.unwrap_or_default(),
            },
            MessageType::Restart => Message::Restart,
            MessageType::Die => Message::Die,
        };
        Ok(message)
    }

    /// Encode into a single newline-free JSON line
    pub fn to_line(&self) -> Result<String> {
        Ok(serde_json::to_string(&self.encode()?)?)
    }

    pub fn from_line(line: &str) -> Result<Self> {
        let wire: WireMessage = serde_json::from_str(line)?;
        Self::decode(wire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn job() -> Job {
        Job::new(
            "b1".to_string(),
            0,
            3,
            vec!["echo".to_string(), "hi".to_string()],
        )
    }

    #[test]
    fn test_start_wire_layout() {
        let wire = Message::Start(job()).encode().unwrap();
        assert_eq!(wire.kind, 2);
        assert_eq!(wire.sub_id, "b1");
        let body: serde_json::Value = serde_json::from_str(&wire.body).unwrap();
        assert_eq!(body["JobId"], 3);
        assert!(wire.err_msg.is_none());
    }

    #[test]
    fn test_job_error_carries_err_msg() {
        let msg = Message::JobErrored {
            job: job(),
            error: "exit status: 2".to_string(),
        };
        let line = msg.to_line().unwrap();
        assert!(line.contains("\"ErrMsg\":\"exit status: 2\""));
        assert_eq!(Message::from_line(&line).unwrap(), msg);
    }

    #[test]
    fn test_hello_accepts_legacy_integer_body() {
        let msg = Message::from_line(r#"{"Type":0,"SubId":"","Body":"4"}"#).unwrap();
        assert_eq!(msg, Message::Hello(HandshakeInfo::new(4, 0)));
    }

    #[test]
    fn test_hello_json_body() {
        let line = r#"{"Type":0,"Body":"{\"JobCapacity\":2,\"RunningJobs\":1}"}"#;
        match Message::from_line(line).unwrap() {
            Message::Hello(info) => {
                assert_eq!(info.job_capacity, 2);
                assert_eq!(info.running_jobs, 1);
                assert!(info.identity_hint.is_none());
            }
            other => panic!("expected hello, got {:?}", other),
        }
    }

    #[test]
    fn test_unknown_type_rejected() {
        let err = Message::from_line(r#"{"Type":42,"SubId":"","Body":""}"#).unwrap_err();
        assert!(matches!(err, GolemError::UnknownMessageType(42)));
    }

    #[test]
    fn test_kill_requires_batch() {
        let err = Message::from_line(r#"{"Type":3,"SubId":"","Body":""}"#).unwrap_err();
        assert!(matches!(err, GolemError::Protocol(_)));
    }

    #[test]
    fn test_output_line_keeps_body_verbatim() {
        let msg = Message::Stdout {
            batch_id: "b1".to_string(),
            line: "a \"quoted\" line\n".to_string(),
        };
        let line = msg.to_line().unwrap();
        assert!(!line.contains('\n'));
        assert_eq!(Message::from_line(&line).unwrap(), msg);
        assert_eq!(msg.batch_id(), Some("b1"));
    }

    #[test]
    fn test_message_type_display() {
        assert_eq!(MessageType::JobFinished.to_string(), "JOBFINISHED");
        assert_eq!(Message::Die.message_type(), MessageType::Die);
    }

    #[test]
    fn test_only_job_outcomes_are_terminal() {
        assert!(Message::JobFinished(job()).is_terminal());
        assert!(Message::JobErrored {
            job: job(),
            error: "killed".to_string()
        }
        .is_terminal());
        assert!(!Message::Start(job()).is_terminal());
        assert!(!Message::Checkin.is_terminal());
    }
}
