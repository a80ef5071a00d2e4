//! Protocol commands
//!
//! Defines the host-to-device commands understood by the attendance firmware.

use serde::{Deserialize, Serialize};
use std::fmt;

use super::ProtocolError;

/// Attendance status carried by an SMS notification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SmsStatus {
    /// Student was marked present ('P' frame)
    Present,
    /// Student was marked absent ('A' frame)
    Absent,
}

impl SmsStatus {
    /// Single-character tag used on the wire
    pub fn tag(&self) -> &'static str {
        match self {
            SmsStatus::Present => "P",
            SmsStatus::Absent => "A",
        }
    }

    fn from_tag(tag: &str) -> Option<Self> {
        match tag {
            "P" => Some(SmsStatus::Present),
            "A" => Some(SmsStatus::Absent),
            _ => None,
        }
    }
}

/// Discriminant of a [`Command`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CommandKind {
    /// [`Command::EnrollFinger`]
    EnrollFinger,
    /// [`Command::StartAttendance`]
    StartAttendance,
    /// [`Command::EndAttendance`]
    EndAttendance,
    /// [`Command::SendSms`]
    SendSms,
    /// [`Command::Raw`]
    Raw,
}

/// Outbound instruction for the attendance controller
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Command {
    /// Enroll a new fingerprint into sensor slot `id` (`ENROLL_FINGER,<id>`)
    EnrollFinger { id: u32 },

    /// Enter attendance scanning mode (`START_ATTENDANCE`)
    StartAttendance,

    /// Leave attendance scanning mode (`END_ATTENDANCE`)
    EndAttendance,

    /// Send a present/absent SMS (`P,<name>,<phone>` / `A,<name>,<phone>`).
    ///
    /// `name` is kept in display form (spaces), `phone` as bare digits.
    SendSms {
        status: SmsStatus,
        name: String,
        phone: String,
    },

    /// Passthrough line the host does not interpret
    Raw { line: String },
}

impl Command {
    /// Build an SMS command, normalizing the name and stripping
    /// `country_code` plus any non-digit characters from the phone number.
    pub fn sms(
        status: SmsStatus,
        name: &str,
        phone: &str,
        country_code: &str,
    ) -> Result<Self, ProtocolError> {
        let name = canonical_name(name);
        if name.is_empty() {
            return Err(ProtocolError::InvalidCommand(
                "SMS recipient name is empty".to_string(),
            ));
        }
        let phone = normalize_phone(phone, country_code);
        if phone.is_empty() {
            return Err(ProtocolError::InvalidCommand(format!(
                "no phone digits for {}",
                name
            )));
        }
        Ok(Command::SendSms {
            status,
            name,
            phone,
        })
    }

    /// Wrap a raw line, rejecting embedded line delimiters
    pub fn raw(line: &str) -> Result<Self, ProtocolError> {
        Ok(Command::Raw {
            line: checked_line(line)?.to_string(),
        })
    }

    /// Parse a line typed by a caller into a structured command.
    ///
    /// Lines matching a known command shape become that command so the ack
    /// gate applies to them; everything else is passed through as `Raw`.
    ///
    /// The firmware handles every line whose first field is `P` or `A` as an
    /// SMS and answers it with a terminal event, whatever the remaining
    /// fields hold. Such lines always parse as [`Command::SendSms`]; missing
    /// fields are empty and fields past the phone number are dropped.
    pub fn parse(line: &str) -> Result<Self, ProtocolError> {
        let line = checked_line(line)?;
        let fields: Vec<&str> = line.split(',').map(str::trim).collect();
        let parsed = match fields.as_slice() {
            ["START_ATTENDANCE"] => Some(Command::StartAttendance),
            ["END_ATTENDANCE"] => Some(Command::EndAttendance),
            ["ENROLL_FINGER", id] => id.parse().ok().map(|id| Command::EnrollFinger { id }),
            [tag, rest @ ..] => SmsStatus::from_tag(tag).map(|status| Command::SendSms {
                status,
                name: rest.first().map(|n| decode_name(n)).unwrap_or_default(),
                phone: rest.get(1).map(|p| p.to_string()).unwrap_or_default(),
            }),
            [] => None,
        };

        Ok(parsed.unwrap_or_else(|| Command::Raw {
            line: line.to_string(),
        }))
    }

    /// Get the command discriminant
    pub fn kind(&self) -> CommandKind {
        match self {
            Command::EnrollFinger { .. } => CommandKind::EnrollFinger,
            Command::StartAttendance => CommandKind::StartAttendance,
            Command::EndAttendance => CommandKind::EndAttendance,
            Command::SendSms { .. } => CommandKind::SendSms,
            Command::Raw { .. } => CommandKind::Raw,
        }
    }

    /// Check if the firmware blocks on this command until it emits a
    /// terminal event. Only SMS dispatch does.
    pub fn requires_ack(&self) -> bool {
        matches!(self, Command::SendSms { .. })
    }

    /// Recipient name of an SMS command, in display form
    pub fn recipient(&self) -> Option<&str> {
        match self {
            Command::SendSms { name, .. } => Some(name),
            _ => None,
        }
    }

    /// Render the command as a wire line (without terminator)
    pub fn to_line(&self) -> String {
        match self {
            Command::EnrollFinger { id } => format!("ENROLL_FINGER,{}", id),
            Command::StartAttendance => "START_ATTENDANCE".to_string(),
            Command::EndAttendance => "END_ATTENDANCE".to_string(),
            Command::SendSms {
                status,
                name,
                phone,
            } => format!("{},{},{}", status.tag(), encode_name(name), phone),
            Command::Raw { line } => line.clone(),
        }
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_line())
    }
}

/// One entry of an SMS batch as supplied by the dashboard
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SmsRecipient {
    /// Which message to send
    pub status: SmsStatus,
    /// Student name in display form
    pub name: String,
    /// Parent phone number, any formatting
    pub phone: String,
}

impl SmsRecipient {
    pub fn new(status: SmsStatus, name: impl Into<String>, phone: impl Into<String>) -> Self {
        Self {
            status,
            name: name.into(),
            phone: phone.into(),
        }
    }

    /// Convert into the SMS command sent on the wire
    pub fn to_command(&self, country_code: &str) -> Result<Command, ProtocolError> {
        Command::sms(self.status, &self.name, &self.phone, country_code)
    }
}

/// Encode a display name for the wire: the firmware splits frames on commas
/// and trims whitespace, so both become underscores.
pub fn encode_name(name: &str) -> String {
    name.trim()
        .chars()
        .map(|c| if c.is_whitespace() || c == ',' { '_' } else { c })
        .collect()
}

/// Restore a wire name (or diagnostic text) for display
pub fn decode_name(wire: &str) -> String {
    wire.replace('_', " ")
}

fn checked_line(line: &str) -> Result<&str, ProtocolError> {
    let line = line.trim();
    if line.is_empty() {
        return Err(ProtocolError::InvalidCommand("empty command".to_string()));
    }
    if line.contains(['\n', '\r']) {
        return Err(ProtocolError::InvalidCommand(
            "command contains a line delimiter".to_string(),
        ));
    }
    Ok(line)
}

/// Name as the firmware will echo it back in SMS terminal events
fn canonical_name(name: &str) -> String {
    decode_name(&encode_name(name))
}

fn normalize_phone(phone: &str, country_code: &str) -> String {
    let phone = phone.trim();
    let phone = if country_code.is_empty() {
        phone
    } else {
        phone.strip_prefix(country_code).unwrap_or(phone)
    };
    phone.chars().filter(char::is_ascii_digit).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_command_lines() {
        assert_eq!(Command::EnrollFinger { id: 12 }.to_line(), "ENROLL_FINGER,12");
        assert_eq!(Command::StartAttendance.to_line(), "START_ATTENDANCE");
        assert_eq!(Command::EndAttendance.to_line(), "END_ATTENDANCE");

        let sms = Command::sms(SmsStatus::Absent, "Bob Kumar", "+919000000002", "+91").unwrap();
        assert_eq!(sms.to_line(), "A,Bob_Kumar,9000000002");
        assert_eq!(sms.recipient(), Some("Bob Kumar"));
    }

    #[test]
    fn test_only_sms_requires_ack() {
        let sms = Command::sms(SmsStatus::Present, "Alice", "9000000001", "+91").unwrap();
        assert!(sms.requires_ack());
        assert!(!Command::StartAttendance.requires_ack());
        assert!(!Command::EndAttendance.requires_ack());
        assert!(!Command::EnrollFinger { id: 1 }.requires_ack());
        assert!(!Command::raw("PING").unwrap().requires_ack());
    }

    #[test]
    fn test_phone_normalization() {
        let cmd = Command::sms(SmsStatus::Present, "Cara", "+91 90000-00003", "+91").unwrap();
        assert_eq!(cmd.to_line(), "P,Cara,9000000003");

        // No configured prefix keeps every digit
        let cmd = Command::sms(SmsStatus::Present, "Cara", "+91 9000000003", "").unwrap();
        assert_eq!(cmd.to_line(), "P,Cara,919000000003");

        assert!(matches!(
            Command::sms(SmsStatus::Present, "Cara", "+91", "+91"),
            Err(ProtocolError::InvalidCommand(_))
        ));
        assert!(matches!(
            Command::sms(SmsStatus::Present, "   ", "9000000003", "+91"),
            Err(ProtocolError::InvalidCommand(_))
        ));
    }

    #[test]
    fn test_name_encoding() {
        assert_eq!(encode_name("  Mary Ann\tLee "), "Mary_Ann_Lee");
        assert_eq!(encode_name("Doe, John"), "Doe__John");
        assert_eq!(decode_name("Mary_Ann_Lee"), "Mary Ann Lee");

        let cmd = Command::sms(SmsStatus::Present, "Mary  Ann", "9000000001", "").unwrap();
        assert_eq!(cmd.recipient(), Some("Mary  Ann"));
        assert_eq!(cmd.to_line(), "P,Mary__Ann,9000000001");
    }

    #[test]
    fn test_parse_structured_lines() {
        assert_eq!(Command::parse("START_ATTENDANCE").unwrap(), Command::StartAttendance);
        assert_eq!(Command::parse(" END_ATTENDANCE ").unwrap(), Command::EndAttendance);
        assert_eq!(
            Command::parse("ENROLL_FINGER,7").unwrap(),
            Command::EnrollFinger { id: 7 }
        );
        assert_eq!(
            Command::parse("P,Alice_Smith,9000000001").unwrap(),
            Command::SendSms {
                status: SmsStatus::Present,
                name: "Alice Smith".to_string(),
                phone: "9000000001".to_string(),
            }
        );
    }

    #[test]
    fn test_parse_gates_every_sms_shaped_line() {
        let cmd = Command::parse("P,Alice").unwrap();
        assert_eq!(
            cmd,
            Command::SendSms {
                status: SmsStatus::Present,
                name: "Alice".to_string(),
                phone: String::new(),
            }
        );
        assert!(cmd.requires_ack());

        let cmd = Command::parse("A,Bob_Kumar,9000000002,extra").unwrap();
        assert!(cmd.requires_ack());
        assert_eq!(cmd.to_line(), "A,Bob_Kumar,9000000002");

        for line in ["P", "A,", "P,,9000000001", "A,Cara,+91 900"] {
            let cmd = Command::parse(line).unwrap();
            assert_eq!(cmd.kind(), CommandKind::SendSms, "{}", line);
        }

        // Tags are case sensitive on the firmware
        assert_eq!(Command::parse("p,Alice,1").unwrap().kind(), CommandKind::Raw);
        assert_eq!(Command::parse("PING").unwrap().kind(), CommandKind::Raw);
    }

    #[test]
    fn test_parse_falls_back_to_raw() {
        assert_eq!(
            Command::parse("ENROLL_FINGER,abc").unwrap().kind(),
            CommandKind::Raw
        );
        assert_eq!(Command::parse("X,y,z").unwrap().kind(), CommandKind::Raw);
        assert_eq!(Command::parse("HELLO").unwrap().to_line(), "HELLO");
    }

    #[test]
    fn test_raw_rejects_delimiters() {
        assert!(Command::raw("").is_err());
        assert!(Command::raw("START\nEND").is_err());
        assert!(Command::parse("A,b\r,c").is_err());
    }

    #[test]
    fn test_recipient_serde_shape() {
        let json = r#"{"status":"present","name":"Alice","phone":"+919000000001"}"#;
        let r: SmsRecipient = serde_json::from_str(json).unwrap();
        assert_eq!(r, SmsRecipient::new(SmsStatus::Present, "Alice", "+919000000001"));
        assert_eq!(r.to_command("+91").unwrap().to_line(), "P,Alice,9000000001");
    }
}
