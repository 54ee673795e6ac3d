//! OPC UA status codes used on the wire and as process exit codes.

use std::fmt;

/// A 32-bit OPC UA status code.
///
/// Only the codes this endpoint core can produce are named; anything else is
/// carried through verbatim.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StatusCode(pub u32);

impl StatusCode {
    pub const GOOD: StatusCode = StatusCode(0x0000_0000);
    pub const BAD_INTERNAL_ERROR: StatusCode = StatusCode(0x8002_0000);
    pub const BAD_RESOURCE_UNAVAILABLE: StatusCode = StatusCode(0x8004_0000);
    pub const BAD_COMMUNICATION_ERROR: StatusCode = StatusCode(0x8005_0000);
    pub const BAD_DECODING_ERROR: StatusCode = StatusCode(0x8007_0000);
    pub const BAD_ENCODING_LIMITS_EXCEEDED: StatusCode = StatusCode(0x8008_0000);
    pub const BAD_SERVICE_UNSUPPORTED: StatusCode = StatusCode(0x800B_0000);
    pub const BAD_SERVER_HALTED: StatusCode = StatusCode(0x800E_0000);
    pub const BAD_CERTIFICATE_INVALID: StatusCode = StatusCode(0x8012_0000);
    pub const BAD_SECURITY_CHECKS_FAILED: StatusCode = StatusCode(0x8013_0000);
    pub const BAD_SECURE_CHANNEL_ID_INVALID: StatusCode = StatusCode(0x8022_0000);
    pub const BAD_NONCE_INVALID: StatusCode = StatusCode(0x8024_0000);
    pub const BAD_REQUEST_TYPE_INVALID: StatusCode = StatusCode(0x8053_0000);
    pub const BAD_SECURITY_MODE_REJECTED: StatusCode = StatusCode(0x8054_0000);
    pub const BAD_SECURITY_POLICY_REJECTED: StatusCode = StatusCode(0x8055_0000);
    pub const BAD_TCP_MESSAGE_TYPE_INVALID: StatusCode = StatusCode(0x807E_0000);
    pub const BAD_TCP_SECURE_CHANNEL_UNKNOWN: StatusCode = StatusCode(0x807F_0000);
    pub const BAD_TCP_MESSAGE_TOO_LARGE: StatusCode = StatusCode(0x8080_0000);
    pub const BAD_TCP_INTERNAL_ERROR: StatusCode = StatusCode(0x8082_0000);
    pub const BAD_TCP_ENDPOINT_URL_INVALID: StatusCode = StatusCode(0x8083_0000);
    pub const BAD_SEQUENCE_NUMBER_INVALID: StatusCode = StatusCode(0x8088_0000);
    pub const BAD_CONFIGURATION_ERROR: StatusCode = StatusCode(0x8089_0000);
    pub const BAD_ENTRY_EXISTS: StatusCode = StatusCode(0x809F_0000);
    pub const BAD_SECURE_CHANNEL_TOKEN_UNKNOWN: StatusCode = StatusCode(0x80A5_0000);
    pub const BAD_INVALID_STATE: StatusCode = StatusCode(0x80AF_0000);

    /// Returns `true` for codes whose severity bits are `Good`.
    pub fn is_good(self) -> bool {
        self.0 & 0xC000_0000 == 0
    }

    /// Symbolic name, or `None` for codes not named above.
    pub fn name(self) -> Option<&'static str> {
        let name = match self {
            Self::GOOD => "Good",
            Self::BAD_INTERNAL_ERROR => "BadInternalError",
            Self::BAD_RESOURCE_UNAVAILABLE => "BadResourceUnavailable",
            Self::BAD_COMMUNICATION_ERROR => "BadCommunicationError",
            Self::BAD_DECODING_ERROR => "BadDecodingError",
            Self::BAD_ENCODING_LIMITS_EXCEEDED => "BadEncodingLimitsExceeded",
            Self::BAD_SERVICE_UNSUPPORTED => "BadServiceUnsupported",
            Self::BAD_SERVER_HALTED => "BadServerHalted",
            Self::BAD_CERTIFICATE_INVALID => "BadCertificateInvalid",
            Self::BAD_SECURITY_CHECKS_FAILED => "BadSecurityChecksFailed",
            Self::BAD_SECURE_CHANNEL_ID_INVALID => "BadSecureChannelIdInvalid",
            Self::BAD_NONCE_INVALID => "BadNonceInvalid",
            Self::BAD_REQUEST_TYPE_INVALID => "BadRequestTypeInvalid",
            Self::BAD_SECURITY_MODE_REJECTED => "BadSecurityModeRejected",
            Self::BAD_SECURITY_POLICY_REJECTED => "BadSecurityPolicyRejected",
            Self::BAD_TCP_MESSAGE_TYPE_INVALID => "BadTcpMessageTypeInvalid",
            Self::BAD_TCP_SECURE_CHANNEL_UNKNOWN => "BadTcpSecureChannelUnknown",
            Self::BAD_TCP_MESSAGE_TOO_LARGE => "BadTcpMessageTooLarge",
            Self::BAD_TCP_INTERNAL_ERROR => "BadTcpInternalError",
            Self::BAD_TCP_ENDPOINT_URL_INVALID => "BadTcpEndpointUrlInvalid",
            Self::BAD_SEQUENCE_NUMBER_INVALID => "BadSequenceNumberInvalid",
            Self::BAD_CONFIGURATION_ERROR => "BadConfigurationError",
            Self::BAD_ENTRY_EXISTS => "BadEntryExists",
            Self::BAD_SECURE_CHANNEL_TOKEN_UNKNOWN => "BadSecureChannelTokenUnknown",
            Self::BAD_INVALID_STATE => "BadInvalidState",
            _ => return None,
        };
        Some(name)
    }

    /// Process exit code for this status.
    ///
    /// POSIX exit codes are a single byte, so the status code's sub-code byte
    /// (bits 16..24) is used. Good maps to 0; a bad code whose sub-code byte
    /// happens to be zero maps to 1 so failure is never reported as success.
    pub fn exit_code(self) -> u8 {
        if self.is_good() {
            return 0;
        }
        match ((self.0 >> 16) & 0xFF) as u8 {
            0 => 1,
            code => code,
        }
    }
}

impl fmt::Display for StatusCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.name() {
            Some(name) => write!(f, "{name} (0x{:08X})", self.0),
            None => write!(f, "0x{:08X}", self.0),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn good_is_good() {
        assert!(StatusCode::GOOD.is_good());
        assert!(!StatusCode::BAD_INTERNAL_ERROR.is_good());
    }

    #[test]
    fn display_includes_name_and_hex() {
        let s = StatusCode::BAD_TCP_ENDPOINT_URL_INVALID.to_string();
        assert_eq!(s, "BadTcpEndpointUrlInvalid (0x80830000)");
        assert_eq!(StatusCode(0x8123_0000).to_string(), "0x81230000");
    }

    #[test]
    fn exit_code_is_never_zero_for_bad_codes() {
        assert_eq!(StatusCode::GOOD.exit_code(), 0);
        assert_eq!(StatusCode::BAD_INTERNAL_ERROR.exit_code(), 0x02);
        assert_eq!(StatusCode::BAD_SECURITY_POLICY_REJECTED.exit_code(), 0x55);
        assert_eq!(StatusCode(0x8000_0000).exit_code(), 1);
    }
}
