use snafu::Snafu;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum ProtoError {
	#[snafu(display("frame is not valid base64"))]
	Base64 {
		source: base64::DecodeError,
	},
	#[snafu(display("frame is not a JSON object"))]
	Json {
		source: serde_json::Error,
	},
	#[snafu(display("payload is not valid hex"))]
	Hex {
		source: hex::FromHexError,
	},
	#[snafu(display("frame is missing required member {member}"))]
	MissingMember {
		member: &'static str,
	},
	#[snafu(display("frame member {member} has an unusable value"))]
	InvalidMember {
		member: &'static str,
	},
	#[snafu(display("unknown resource kind {value}"))]
	UnknownKind {
		value: String,
	},
	#[snafu(display("unrecognised frame discriminator {discriminator}"))]
	UnknownFrame {
		discriminator: String,
	},
}
