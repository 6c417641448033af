use std::{fmt, str::FromStr};

use base64::{Engine as _, engine::general_purpose::STANDARD as BASE64};
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use snafu::{OptionExt, ResultExt};

use super::{
	Base64Snafu, HexSnafu, JsonSnafu, MissingMemberSnafu, ProtoError, UnknownFrameSnafu, UnknownKindSnafu,
};

/// The byte terminating every frame on the wire.
pub const FRAME_TERMINATOR: u8 = b';';

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceKind {
	Tcp,
	Http,
	Udp,
}

impl ResourceKind {
	pub fn as_str(self) -> &'static str {
		match self {
			Self::Tcp => "tcp",
			Self::Http => "http",
			Self::Udp => "udp",
		}
	}
}

impl fmt::Display for ResourceKind {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(self.as_str())
	}
}

impl FromStr for ResourceKind {
	type Err = ProtoError;

	fn from_str(value: &str) -> Result<Self, Self::Err> {
		match value {
			"tcp" => Ok(Self::Tcp),
			"http" => Ok(Self::Http),
			"udp" => Ok(Self::Udp),
			other => UnknownKindSnafu { value: other }.fail(),
		}
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReplyCode {
	#[serde(rename = "OK")]
	Ok,
	#[serde(rename = "AUTHENTICATION_ERROR")]
	AuthenticationError,
	#[serde(rename = "RESOURCE_OCCUPIED")]
	ResourceOccupied,
}

/// The complete frame set of the bridge protocol. Anything else decodes to
/// a [`ProtoError`] and is handled as a protocol violation by the caller.
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
	/// Client -> host on a fresh bridge connection.
	Authenticate {
		kind:     ResourceKind,
		resource: String,
		secret:   String,
		auth:     Option<String>,
	},
	/// Host -> client answer to `Authenticate`.
	Reply {
		code:    ReplyCode,
		message: String,
	},
	Ping,
	Pong,
	/// Host -> client: dial back for the parked caller under `identifier`.
	NewRequest {
		identifier: String,
	},
	/// Client -> host on a fresh connection: pair me with `identifier`.
	Bind {
		kind:       ResourceKind,
		resource:   String,
		identifier: String,
	},
	/// Client -> host on the binding: stage another UDP pool member.
	AddPool,
	/// Host -> client answer to `AddPool`.
	NewPool {
		identifier: String,
	},
	/// A framed UDP datagram, either direction, over a pool member.
	Datagram {
		source_host: String,
		source_port: u16,
		payload:     Vec<u8>,
	},
}

/// The wire shape: one flat JSON object with optional members. Unknown
/// extra members are ignored on decode.
#[derive(Debug, Default, Serialize, Deserialize)]
struct RawFrame {
	#[serde(rename = "type", skip_serializing_if = "Option::is_none")]
	kind:        Option<String>,
	#[serde(skip_serializing_if = "Option::is_none")]
	command:     Option<String>,
	#[serde(skip_serializing_if = "Option::is_none")]
	code:        Option<ReplyCode>,
	#[serde(skip_serializing_if = "Option::is_none")]
	message:     Option<String>,
	#[serde(skip_serializing_if = "Option::is_none")]
	resource:    Option<serde_json::Value>,
	#[serde(skip_serializing_if = "Option::is_none")]
	secret:      Option<String>,
	#[serde(skip_serializing_if = "Option::is_none")]
	auth:        Option<String>,
	#[serde(skip_serializing_if = "Option::is_none")]
	identifier:  Option<String>,
	#[serde(skip_serializing_if = "Option::is_none")]
	source_host: Option<String>,
	#[serde(skip_serializing_if = "Option::is_none")]
	source_port: Option<u16>,
	#[serde(skip_serializing_if = "Option::is_none")]
	payload:     Option<String>,
}

impl Frame {
	/// `base64(json(frame))`, without the terminator.
	pub fn encode(&self) -> Vec<u8> {
		let json = serde_json::to_vec(&self.to_raw()).expect("a raw frame always serializes");
		BASE64.encode(json).into_bytes()
	}

	/// The full wire form: `encode() || ';'`.
	pub fn framed(&self) -> Bytes {
		let mut wire = self.encode();
		wire.push(FRAME_TERMINATOR);
		Bytes::from(wire)
	}

	pub fn decode(data: &[u8]) -> Result<Self, ProtoError> {
		let json = BASE64.decode(data).context(Base64Snafu)?;
		let raw: RawFrame = serde_json::from_slice(&json).context(JsonSnafu)?;
		Self::from_raw(raw)
	}

	fn to_raw(&self) -> RawFrame {
		match self {
			Self::Authenticate {
				kind,
				resource,
				secret,
				auth,
			} => RawFrame {
				kind: Some(kind.as_str().to_string()),
				resource: Some(resource_value(*kind, resource)),
				secret: Some(secret.clone()),
				auth: auth.clone(),
				command: Some("authenticate".to_string()),
				..RawFrame::default()
			},
			Self::Reply { code, message } => RawFrame {
				code: Some(*code),
				message: Some(message.clone()),
				..RawFrame::default()
			},
			Self::Ping => RawFrame {
				kind: Some("ping".to_string()),
				..RawFrame::default()
			},
			Self::Pong => RawFrame {
				kind: Some("pong".to_string()),
				..RawFrame::default()
			},
			Self::NewRequest { identifier } => RawFrame {
				identifier: Some(identifier.clone()),
				command: Some("new_request".to_string()),
				..RawFrame::default()
			},
			Self::Bind {
				kind,
				resource,
				identifier,
			} => RawFrame {
				kind: Some(kind.as_str().to_string()),
				resource: Some(resource_value(*kind, resource)),
				command: Some("bind".to_string()),
				identifier: Some(identifier.clone()),
				..RawFrame::default()
			},
			Self::AddPool => RawFrame {
				command: Some("add_pool".to_string()),
				..RawFrame::default()
			},
			Self::NewPool { identifier } => RawFrame {
				command: Some("new_pool".to_string()),
				identifier: Some(identifier.clone()),
				..RawFrame::default()
			},
			Self::Datagram {
				source_host,
				source_port,
				payload,
			} => RawFrame {
				kind: Some("new_message".to_string()),
				source_host: Some(source_host.clone()),
				source_port: Some(*source_port),
				payload: Some(hex::encode(payload)),
				..RawFrame::default()
			},
		}
	}

	fn from_raw(raw: RawFrame) -> Result<Self, ProtoError> {
		if let Some(command) = raw.command.as_deref() {
			return match command {
				"authenticate" => Ok(Self::Authenticate {
					kind: parse_kind(raw.kind)?,
					resource: resource_string(raw.resource)?,
					secret: raw.secret.context(MissingMemberSnafu { member: "secret" })?,
					auth: raw.auth,
				}),
				"bind" => Ok(Self::Bind {
					kind: parse_kind(raw.kind)?,
					resource: resource_string(raw.resource)?,
					identifier: raw.identifier.context(MissingMemberSnafu { member: "identifier" })?,
				}),
				"new_request" => Ok(Self::NewRequest {
					identifier: raw.identifier.context(MissingMemberSnafu { member: "identifier" })?,
				}),
				"add_pool" => Ok(Self::AddPool),
				"new_pool" => Ok(Self::NewPool {
					identifier: raw.identifier.context(MissingMemberSnafu { member: "identifier" })?,
				}),
				other => UnknownFrameSnafu { discriminator: other }.fail(),
			};
		}
		if let Some(kind) = raw.kind.as_deref() {
			return match kind {
				"ping" => Ok(Self::Ping),
				"pong" => Ok(Self::Pong),
				"new_message" => Ok(Self::Datagram {
					source_host: raw.source_host.context(MissingMemberSnafu { member: "source_host" })?,
					source_port: raw.source_port.context(MissingMemberSnafu { member: "source_port" })?,
					payload: hex::decode(raw.payload.context(MissingMemberSnafu { member: "payload" })?)
						.context(HexSnafu)?,
				}),
				other => UnknownFrameSnafu { discriminator: other }.fail(),
			};
		}
		if let Some(code) = raw.code {
			return Ok(Self::Reply {
				code,
				message: raw.message.unwrap_or_default(),
			});
		}
		UnknownFrameSnafu { discriminator: "<none>" }.fail()
	}
}

/// Port connectors travel as JSON numbers, hostnames as strings.
fn resource_value(kind: ResourceKind, resource: &str) -> serde_json::Value {
	if matches!(kind, ResourceKind::Tcp | ResourceKind::Udp)
		&& let Ok(port) = resource.parse::<u64>()
	{
		return serde_json::Value::Number(port.into());
	}
	serde_json::Value::String(resource.to_string())
}

fn resource_string(resource: Option<serde_json::Value>) -> Result<String, ProtoError> {
	match resource.context(MissingMemberSnafu { member: "resource" })? {
		serde_json::Value::String(text) => Ok(text),
		serde_json::Value::Number(number) => Ok(number.to_string()),
		_ => super::InvalidMemberSnafu { member: "resource" }.fail(),
	}
}

fn parse_kind(kind: Option<String>) -> Result<ResourceKind, ProtoError> {
	kind.context(MissingMemberSnafu { member: "type" })?.parse()
}
