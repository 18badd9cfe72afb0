//! Protocol message definitions
//!
//! Hand-encoded protobuf messages. Every message has one fixed shape, so each
//! gets its own encoder and, where something is ever read back, its own
//! narrow decoder. There is deliberately no generic field dispatcher.

use bytes::{BufMut, BytesMut};

use super::codec::{decode_varint, encode_varint, varint_len, CodecError, CodecResult};
use super::NODE_TYPE_AMF;

/// Field 1, varint
pub const TAG_FIELD1_VARINT: u8 = 0x08;
/// Field 1, length-delimited
pub const TAG_FIELD1_BYTES: u8 = 0x0A;
/// Field 2, length-delimited
pub const TAG_FIELD2_BYTES: u8 = 0x12;
/// Field 3, varint
pub const TAG_FIELD3_VARINT: u8 = 0x18;

/// Upper bound on an encoded RegisterRequest
pub const MAX_REGISTER_REQUEST_LEN: usize = 256;

/// Serving status carried by HealthCheckResponse
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ServingStatus {
    Serving = 1,
    NotServing = 2,
}

impl ServingStatus {
    /// Map a wire value, `None` for anything this side does not know
    pub fn from_wire(value: u64) -> Option<Self> {
        match value {
            1 => Some(ServingStatus::Serving),
            2 => Some(ServingStatus::NotServing),
            _ => None,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            ServingStatus::Serving => "SERVING",
            ServingStatus::NotServing => "NOT_SERVING",
        }
    }
}

/// `HealthCheckResponse { status = 1 }`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HealthCheckResponse {
    pub status: ServingStatus,
}

impl HealthCheckResponse {
    pub const SERVING: HealthCheckResponse = HealthCheckResponse {
        status: ServingStatus::Serving,
    };

    /// Both status values fit in a single varint byte
    pub fn encode(&self) -> [u8; 2] {
        [TAG_FIELD1_VARINT, self.status as u8]
    }

    /// Raw status value of a response payload, if field 1 is present
    pub fn decode_status(payload: &[u8]) -> Option<u64> {
        decode_field1_varint(payload)
    }
}

/// `HealthCheckRequest { service = 1 }`
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HealthCheckRequest {
    pub service: String,
}

impl HealthCheckRequest {
    /// The service field is always written, even when empty (`0A 00`)
    pub fn encode(&self) -> CodecResult<BytesMut> {
        let service = self.service.as_bytes();
        let mut buf = BytesMut::with_capacity(1 + varint_len(service.len() as u64) + service.len());
        buf.put_u8(TAG_FIELD1_BYTES);
        encode_varint(service.len() as u64, &mut buf)?;
        buf.put_slice(service);
        Ok(buf)
    }
}

/// `RegisterRequest { node_type = 1, ip = 2, port = 3 }`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegisterRequest {
    pub node_type: u64,
    pub ip: String,
    pub port: u16,
}

impl RegisterRequest {
    /// Registration of this node as an AMF
    pub fn amf(ip: impl Into<String>, port: u16) -> Self {
        Self {
            node_type: NODE_TYPE_AMF,
            ip: ip.into(),
            port,
        }
    }

    pub fn encoded_len(&self) -> usize {
        1 + varint_len(self.node_type)
            + 1
            + varint_len(self.ip.len() as u64)
            + self.ip.len()
            + 1
            + varint_len(self.port as u64)
    }

    /// Encode into a buffer bounded by `MAX_REGISTER_REQUEST_LEN`
    pub fn encode(&self) -> CodecResult<BytesMut> {
        let len = self.encoded_len();
        if len > MAX_REGISTER_REQUEST_LEN {
            return Err(CodecError::MessageTooLarge(len, MAX_REGISTER_REQUEST_LEN));
        }

        let mut buf = BytesMut::with_capacity(len);
        buf.put_u8(TAG_FIELD1_VARINT);
        encode_varint(self.node_type, &mut buf)?;

        buf.put_u8(TAG_FIELD2_BYTES);
        encode_varint(self.ip.len() as u64, &mut buf)?;
        buf.put_slice(self.ip.as_bytes());

        buf.put_u8(TAG_FIELD3_VARINT);
        encode_varint(self.port as u64, &mut buf)?;
        Ok(buf)
    }
}

/// `RegisterResponse { success = 1, message = 2 }`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegisterResponse {
    pub success: bool,
    pub message: Option<String>,
}

impl RegisterResponse {
    /// Recognise a response by its leading `{field 1 tag, bool}` pair
    ///
    /// The message string is picked up only when it directly follows and is
    /// complete; anything else in the payload is ignored.
    pub fn decode(payload: &[u8]) -> Option<Self> {
        if payload.len() < 2 || payload[0] != TAG_FIELD1_VARINT {
            return None;
        }
        let success = payload[1] == 0x01;

        let message = match payload.get(2) {
            Some(&TAG_FIELD2_BYTES) => match decode_varint(&payload[3..]) {
                Ok(Some((len, used))) => {
                    let start = 3 + used;
                    usize::try_from(len)
                        .ok()
                        .and_then(|len| payload.get(start..start.checked_add(len)?))
                        .map(|bytes| String::from_utf8_lossy(bytes).into_owned())
                }
                _ => None,
            },
            _ => None,
        };

        Some(Self { success, message })
    }
}

/// `NodeType_Message { nodetype = 1 }`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NodeTypeMessage {
    pub node_type: u64,
}

impl NodeTypeMessage {
    pub const AMF: NodeTypeMessage = NodeTypeMessage {
        node_type: NODE_TYPE_AMF,
    };

    pub fn encode(&self) -> CodecResult<BytesMut> {
        let mut buf = BytesMut::with_capacity(1 + varint_len(self.node_type));
        buf.put_u8(TAG_FIELD1_VARINT);
        encode_varint(self.node_type, &mut buf)?;
        Ok(buf)
    }

    pub fn decode(payload: &[u8]) -> Option<Self> {
        decode_field1_varint(payload).map(|node_type| Self { node_type })
    }
}

/// Value of field 1 when a payload starts with it as a varint
pub fn decode_field1_varint(payload: &[u8]) -> Option<u64> {
    if payload.len() < 2 || payload[0] != TAG_FIELD1_VARINT {
        return None;
    }
    match decode_varint(&payload[1..]) {
        Ok(Some((value, _))) => Some(value),
        _ => None,
    }
}

/// Human-readable node class names
pub fn node_type_name(node_type: u64) -> &'static str {
    match node_type {
        0 => "INVALID",
        1 => "HWA",
        2 => "MME",
        3 => "SGW",
        4 => "PGW",
        5 => "MSC",
        6 => "SGSN",
        7 => "GGSN_C",
        8 => "GGSN_U",
        9 => "HNBGW",
        10 => "HLR",
        11 => "NMUSER",
        12 => "GSM_CNE",
        13 => "AMF",
        _ => "UNKNOWN",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_health_check_response_bytes() {
        assert_eq!(HealthCheckResponse::SERVING.encode(), [0x08, 0x01]);
        let not_serving = HealthCheckResponse {
            status: ServingStatus::NotServing,
        };
        assert_eq!(not_serving.encode(), [0x08, 0x02]);
    }

    #[test]
    fn test_register_request_bytes() {
        let req = RegisterRequest::amf("10.0.0.1", 50051);
        let encoded = req.encode().unwrap();
        assert_eq!(
            &encoded[..],
            &[
                0x08, 0x0D, 0x12, 0x08, b'1', b'0', b'.', b'0', b'.', b'0', b'.', b'1', 0x18,
                0x83, 0x87, 0x03
            ]
        );
        assert_eq!(encoded.len(), req.encoded_len());
    }

    #[test]
    fn test_register_request_too_large() {
        let req = RegisterRequest::amf("x".repeat(250), 1);
        assert!(matches!(
            req.encode(),
            Err(CodecError::MessageTooLarge(_, MAX_REGISTER_REQUEST_LEN))
        ));
    }

    #[test]
    fn test_node_type_message_bytes() {
        assert_eq!(&NodeTypeMessage::AMF.encode().unwrap()[..], &[0x08, 0x0D]);
        assert_eq!(
            NodeTypeMessage::decode(&[0x08, 0x0D]),
            Some(NodeTypeMessage::AMF)
        );
    }

    #[test]
    fn test_health_check_request_bytes() {
        let empty = HealthCheckRequest::default().encode().unwrap();
        assert_eq!(&empty[..], &[0x0A, 0x00]);

        let named = HealthCheckRequest {
            service: "amf".to_string(),
        };
        assert_eq!(&named.encode().unwrap()[..], &[0x0A, 0x03, b'a', b'm', b'f']);
    }

    #[test]
    fn test_register_response_decode() {
        assert_eq!(
            RegisterResponse::decode(&[0x08, 0x01]),
            Some(RegisterResponse {
                success: true,
                message: None
            })
        );

        let rejected = RegisterResponse::decode(&[0x08, 0x00, 0x12, 0x02, b'n', b'o']).unwrap();
        assert!(!rejected.success);
        assert_eq!(rejected.message.as_deref(), Some("no"));

        // Truncated message string is ignored, the verdict still counts
        let truncated = RegisterResponse::decode(&[0x08, 0x01, 0x12, 0x05, b'o']).unwrap();
        assert!(truncated.success);
        assert_eq!(truncated.message, None);

        assert_eq!(RegisterResponse::decode(&[]), None);
        assert_eq!(RegisterResponse::decode(&[0x08]), None);
        assert_eq!(RegisterResponse::decode(&[0x12, 0x00]), None);
    }

    #[test]
    fn test_decode_field1_varint() {
        assert_eq!(decode_field1_varint(&[0x08, 0x01]), Some(1));
        assert_eq!(decode_field1_varint(&[0x08, 0x83, 0x87, 0x03]), Some(50051));
        assert_eq!(decode_field1_varint(&[0x0A, 0x00]), None);
        assert_eq!(decode_field1_varint(&[0x08, 0x80]), None);
    }

    #[test]
    fn test_serving_status_from_wire() {
        assert_eq!(ServingStatus::from_wire(1), Some(ServingStatus::Serving));
        assert_eq!(ServingStatus::from_wire(2), Some(ServingStatus::NotServing));
        assert_eq!(ServingStatus::from_wire(0), None);
        assert_eq!(node_type_name(NODE_TYPE_AMF), "AMF");
    }
}
