use serde::{Deserialize, Serialize};

/// Delivery channel of a subscription. Stored as a one-character tag
/// (`S` for chat, `M` for mail); conversion happens only at the storage edge.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum Channel {
    Chat,
    Mail,
}

impl Channel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Channel::Chat => "S",
            Channel::Mail => "M",
        }
    }

    pub fn parse(tag: &str) -> Option<Channel> {
        match tag {
            "S" => Some(Channel::Chat),
            "M" => Some(Channel::Mail),
            _ => None,
        }
    }
}

/// Lifecycle of a queued notification. Rows only ever move
/// `Pending -> Sent` or `Pending -> Error`; terminal states are final.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum Status {
    Pending,
    Sent,
    Error,
}

impl Status {
    pub fn as_i64(&self) -> i64 {
        match self {
            Status::Pending => 0,
            Status::Sent => 1,
            Status::Error => -1,
        }
    }

    pub fn from_i64(v: i64) -> Option<Status> {
        match v {
            0 => Some(Status::Pending),
            1 => Some(Status::Sent),
            -1 => Some(Status::Error),
            _ => None,
        }
    }
}

/// Mail attachment reference persisted inside a notification's options blob.
/// `file_path` must point below the configured media root; the dispatch loop
/// re-validates this before reading the file.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Attachment {
    pub file_name: String,
    pub file_path: String,
    pub file_type: String,
}

/// Options blob stored with every mail notification. Serialized to JSON at
/// enqueue time and decoded again by the dispatch loop; unknown keys (e.g. a
/// block-produced `recipient_list`) are tolerated on decode.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MailOptions {
    pub subject: Option<String>,
    pub from_email: Option<String>,
    pub reply_to: Option<Vec<String>>,
    pub html_message: Option<String>,
    pub attachments: Option<Vec<Attachment>>,
}
