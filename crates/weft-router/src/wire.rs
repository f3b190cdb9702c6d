//! Wire format for node link messages.
//!
//! Every message travels as an [`Envelope`]:
//! `transmit_sequence(8) || msg_type(1) || body`, all integers big-endian.
//! The transmit sequence is stamped per node link at transmission. Bodies
//! have fixed layouts per message type; array fields carry a 4-byte count.
//! Decoding is strict: truncated or trailing bytes are a [`WireError`], and
//! any wire error on a live link is treated as a protocol violation.
//!
//! Driver objects (buffer handles, boxed blobs) are not part of the byte
//! layout; they ride next to the bytes in the transport message, counted by
//! the fields that consume them.

use weft_core::fragment::FragmentDescriptor;
use weft_core::sequence::SequenceNumber;
use weft_core::types::{BufferId, NodeName, SublinkId};

use crate::error::WireError;

const MSG_ACCEPT_PARCEL: u8 = 0x01;
const MSG_ROUTE_CLOSED: u8 = 0x02;
const MSG_ROUTE_DISCONNECTED: u8 = 0x03;
const MSG_FLUSH_ROUTER: u8 = 0x04;
const MSG_BYPASS_PEER: u8 = 0x05;
const MSG_ACCEPT_BYPASS_LINK: u8 = 0x06;
const MSG_BYPASS_PEER_WITH_LINK: u8 = 0x07;
const MSG_STOP_PROXYING: u8 = 0x08;
const MSG_PROXY_WILL_STOP: u8 = 0x09;
const MSG_STOP_PROXYING_TO_LOCAL_PEER: u8 = 0x0a;
const MSG_ADD_LINK_STATE_BUFFER: u8 = 0x0b;

const HANDLE_PORTAL: u8 = 0;
const HANDLE_BOX: u8 = 1;

/// Envelope header overhead in bytes.
pub const ENVELOPE_OVERHEAD: usize = 9;

/// Identifies the kind of each handle attached to a parcel, in order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandleType {
    /// Consumes the next router descriptor in the message.
    Portal,
    /// Consumes the next attached driver object.
    Box,
}

impl HandleType {
    fn to_byte(self) -> u8 {
        match self {
            Self::Portal => HANDLE_PORTAL,
            Self::Box => HANDLE_BOX,
        }
    }

    fn try_from_byte(byte: u8) -> Result<Self, WireError> {
        match byte {
            HANDLE_PORTAL => Ok(Self::Portal),
            HANDLE_BOX => Ok(Self::Box),
            other => Err(WireError::InvalidHandleType(other)),
        }
    }
}

/// State needed to reconstruct a router at the far end of a new sublink.
///
/// Embedded in `AcceptParcel`, one per portal attachment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouterDescriptor {
    pub new_sublink: SublinkId,
    pub next_outgoing_sequence_number: SequenceNumber,
    pub next_incoming_sequence_number: SequenceNumber,
    pub peer_closed: bool,
    /// Meaningful only when `peer_closed` is set.
    pub closed_peer_sequence_length: SequenceNumber,
}

/// One decoded node link message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    AcceptParcel {
        sublink: SublinkId,
        sequence_number: SequenceNumber,
        data: Vec<u8>,
        handle_types: Vec<HandleType>,
        new_routers: Vec<RouterDescriptor>,
        /// Number of attached driver objects consumed by `Box` handles.
        num_driver_objects: u32,
    },
    RouteClosed {
        sublink: SublinkId,
        sequence_length: SequenceNumber,
    },
    RouteDisconnected {
        sublink: SublinkId,
    },
    FlushRouter {
        sublink: SublinkId,
    },
    BypassPeer {
        sublink: SublinkId,
        bypass_target_node: NodeName,
        bypass_target_sublink: SublinkId,
    },
    AcceptBypassLink {
        proxy_node: NodeName,
        proxy_sublink: SublinkId,
        inbound_sequence_length: SequenceNumber,
        new_sublink: SublinkId,
        new_link_state: FragmentDescriptor,
    },
    BypassPeerWithLink {
        sublink: SublinkId,
        new_sublink: SublinkId,
        new_link_state: FragmentDescriptor,
        inbound_sequence_length: SequenceNumber,
    },
    StopProxying {
        sublink: SublinkId,
        inbound_sequence_length: SequenceNumber,
        outbound_sequence_length: SequenceNumber,
    },
    ProxyWillStop {
        sublink: SublinkId,
        inbound_sequence_length: SequenceNumber,
    },
    StopProxyingToLocalPeer {
        sublink: SublinkId,
        outbound_sequence_length: SequenceNumber,
    },
    /// Registers a new shared buffer; carries exactly one memory object.
    AddLinkStateBuffer {
        buffer_id: BufferId,
    },
}

/// A message plus its per-link transmit sequence number.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    pub transmit_sequence: u64,
    pub message: Message,
}

impl Envelope {
    /// Pack the envelope into wire bytes.
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(ENVELOPE_OVERHEAD + 32);
        buf.extend_from_slice(&self.transmit_sequence.to_be_bytes());
        buf.push(message_type(&self.message));
        encode_body(&self.message, &mut buf);

        tracing::trace!(
            transmit_sequence = self.transmit_sequence,
            len = buf.len(),
            "encoded envelope"
        );
        buf
    }

    /// Unpack an envelope from wire bytes. Strict: every byte must be
    /// consumed.
    pub fn decode(raw: &[u8]) -> Result<Self, WireError> {
        let mut reader = Reader::new(raw);
        let transmit_sequence = reader.u64()?;
        let msg_type = reader.u8()?;
        let message = decode_body(msg_type, &mut reader)?;
        reader.finish()?;

        tracing::trace!(transmit_sequence, len = raw.len(), "decoded envelope");
        Ok(Self {
            transmit_sequence,
            message,
        })
    }
}

fn message_type(message: &Message) -> u8 {
    match message {
        Message::AcceptParcel { .. } => MSG_ACCEPT_PARCEL,
        Message::RouteClosed { .. } => MSG_ROUTE_CLOSED,
        Message::RouteDisconnected { .. } => MSG_ROUTE_DISCONNECTED,
        Message::FlushRouter { .. } => MSG_FLUSH_ROUTER,
        Message::BypassPeer { .. } => MSG_BYPASS_PEER,
        Message::AcceptBypassLink { .. } => MSG_ACCEPT_BYPASS_LINK,
        Message::BypassPeerWithLink { .. } => MSG_BYPASS_PEER_WITH_LINK,
        Message::StopProxying { .. } => MSG_STOP_PROXYING,
        Message::ProxyWillStop { .. } => MSG_PROXY_WILL_STOP,
        Message::StopProxyingToLocalPeer { .. } => MSG_STOP_PROXYING_TO_LOCAL_PEER,
        Message::AddLinkStateBuffer { .. } => MSG_ADD_LINK_STATE_BUFFER,
    }
}

fn encode_body(message: &Message, buf: &mut Vec<u8>) {
    match message {
        Message::AcceptParcel {
            sublink,
            sequence_number,
            data,
            handle_types,
            new_routers,
            num_driver_objects,
        } => {
            // sublink(8) || sn(8) || data_len(4) || data ||
            // handle_count(4) || handle_types || router_count(4) ||
            // descriptors || driver_object_count(4)
            put_u64(buf, sublink.0);
            put_u64(buf, sequence_number.value());
            put_u32(buf, data.len() as u32);
            buf.extend_from_slice(data);
            put_u32(buf, handle_types.len() as u32);
            for handle_type in handle_types {
                buf.push(handle_type.to_byte());
            }
            put_u32(buf, new_routers.len() as u32);
            for descriptor in new_routers {
                encode_router_descriptor(descriptor, buf);
            }
            put_u32(buf, *num_driver_objects);
        }
        Message::RouteClosed {
            sublink,
            sequence_length,
        } => {
            // sublink(8) || sequence_length(8)
            put_u64(buf, sublink.0);
            put_u64(buf, sequence_length.value());
        }
        Message::RouteDisconnected { sublink } | Message::FlushRouter { sublink } => {
            // sublink(8)
            put_u64(buf, sublink.0);
        }
        Message::BypassPeer {
            sublink,
            bypass_target_node,
            bypass_target_sublink,
        } => {
            // sublink(8) || target_node(16) || target_sublink(8)
            put_u64(buf, sublink.0);
            buf.extend_from_slice(bypass_target_node.as_ref());
            put_u64(buf, bypass_target_sublink.0);
        }
        Message::AcceptBypassLink {
            proxy_node,
            proxy_sublink,
            inbound_sequence_length,
            new_sublink,
            new_link_state,
        } => {
            // proxy_node(16) || proxy_sublink(8) || inbound_length(8) ||
            // new_sublink(8) || fragment(12)
            buf.extend_from_slice(proxy_node.as_ref());
            put_u64(buf, proxy_sublink.0);
            put_u64(buf, inbound_sequence_length.value());
            put_u64(buf, new_sublink.0);
            encode_fragment_descriptor(new_link_state, buf);
        }
        Message::BypassPeerWithLink {
            sublink,
            new_sublink,
            new_link_state,
            inbound_sequence_length,
        } => {
            // sublink(8) || new_sublink(8) || fragment(12) || inbound_length(8)
            put_u64(buf, sublink.0);
            put_u64(buf, new_sublink.0);
            encode_fragment_descriptor(new_link_state, buf);
            put_u64(buf, inbound_sequence_length.value());
        }
        Message::StopProxying {
            sublink,
            inbound_sequence_length,
            outbound_sequence_length,
        } => {
            // sublink(8) || inbound_length(8) || outbound_length(8)
            put_u64(buf, sublink.0);
            put_u64(buf, inbound_sequence_length.value());
            put_u64(buf, outbound_sequence_length.value());
        }
        Message::ProxyWillStop {
            sublink,
            inbound_sequence_length,
        } => {
            put_u64(buf, sublink.0);
            put_u64(buf, inbound_sequence_length.value());
        }
        Message::StopProxyingToLocalPeer {
            sublink,
            outbound_sequence_length,
        } => {
            put_u64(buf, sublink.0);
            put_u64(buf, outbound_sequence_length.value());
        }
        Message::AddLinkStateBuffer { buffer_id } => {
            // buffer_id(8); the buffer itself is the attached driver object
            put_u64(buf, buffer_id.0);
        }
    }
}

fn decode_body(msg_type: u8, reader: &mut Reader<'_>) -> Result<Message, WireError> {
    match msg_type {
        MSG_ACCEPT_PARCEL => {
            let sublink = SublinkId(reader.u64()?);
            let sequence_number = SequenceNumber(reader.u64()?);
            let data_len = reader.u32()? as usize;
            let data = reader.bytes(data_len)?.to_vec();
            let handle_count = reader.u32()? as usize;
            let mut handle_types = Vec::with_capacity(handle_count.min(64));
            for _ in 0..handle_count {
                handle_types.push(HandleType::try_from_byte(reader.u8()?)?);
            }
            let router_count = reader.u32()? as usize;
            let mut new_routers = Vec::with_capacity(router_count.min(64));
            for _ in 0..router_count {
                new_routers.push(decode_router_descriptor(reader)?);
            }
            let num_driver_objects = reader.u32()?;
            Ok(Message::AcceptParcel {
                sublink,
                sequence_number,
                data,
                handle_types,
                new_routers,
                num_driver_objects,
            })
        }
        MSG_ROUTE_CLOSED => Ok(Message::RouteClosed {
            sublink: SublinkId(reader.u64()?),
            sequence_length: SequenceNumber(reader.u64()?),
        }),
        MSG_ROUTE_DISCONNECTED => Ok(Message::RouteDisconnected {
            sublink: SublinkId(reader.u64()?),
        }),
        MSG_FLUSH_ROUTER => Ok(Message::FlushRouter {
            sublink: SublinkId(reader.u64()?),
        }),
        MSG_BYPASS_PEER => Ok(Message::BypassPeer {
            sublink: SublinkId(reader.u64()?),
            bypass_target_node: reader.node_name()?,
            bypass_target_sublink: SublinkId(reader.u64()?),
        }),
        MSG_ACCEPT_BYPASS_LINK => Ok(Message::AcceptBypassLink {
            proxy_node: reader.node_name()?,
            proxy_sublink: SublinkId(reader.u64()?),
            inbound_sequence_length: SequenceNumber(reader.u64()?),
            new_sublink: SublinkId(reader.u64()?),
            new_link_state: decode_fragment_descriptor(reader)?,
        }),
        MSG_BYPASS_PEER_WITH_LINK => Ok(Message::BypassPeerWithLink {
            sublink: SublinkId(reader.u64()?),
            new_sublink: SublinkId(reader.u64()?),
            new_link_state: decode_fragment_descriptor(reader)?,
            inbound_sequence_length: SequenceNumber(reader.u64()?),
        }),
        MSG_STOP_PROXYING => Ok(Message::StopProxying {
            sublink: SublinkId(reader.u64()?),
            inbound_sequence_length: SequenceNumber(reader.u64()?),
            outbound_sequence_length: SequenceNumber(reader.u64()?),
        }),
        MSG_PROXY_WILL_STOP => Ok(Message::ProxyWillStop {
            sublink: SublinkId(reader.u64()?),
            inbound_sequence_length: SequenceNumber(reader.u64()?),
        }),
        MSG_STOP_PROXYING_TO_LOCAL_PEER => Ok(Message::StopProxyingToLocalPeer {
            sublink: SublinkId(reader.u64()?),
            outbound_sequence_length: SequenceNumber(reader.u64()?),
        }),
        MSG_ADD_LINK_STATE_BUFFER => Ok(Message::AddLinkStateBuffer {
            buffer_id: BufferId(reader.u64()?),
        }),
        other => Err(WireError::UnknownMessageType(other)),
    }
}

fn encode_router_descriptor(descriptor: &RouterDescriptor, buf: &mut Vec<u8>) {
    // new_sublink(8) || next_outgoing(8) || next_incoming(8) ||
    // peer_closed(1) || closed_peer_length(8)
    put_u64(buf, descriptor.new_sublink.0);
    put_u64(buf, descriptor.next_outgoing_sequence_number.value());
    put_u64(buf, descriptor.next_incoming_sequence_number.value());
    buf.push(u8::from(descriptor.peer_closed));
    put_u64(buf, descriptor.closed_peer_sequence_length.value());
}

fn decode_router_descriptor(reader: &mut Reader<'_>) -> Result<RouterDescriptor, WireError> {
    Ok(RouterDescriptor {
        new_sublink: SublinkId(reader.u64()?),
        next_outgoing_sequence_number: SequenceNumber(reader.u64()?),
        next_incoming_sequence_number: SequenceNumber(reader.u64()?),
        peer_closed: reader.u8()? != 0,
        closed_peer_sequence_length: SequenceNumber(reader.u64()?),
    })
}

fn encode_fragment_descriptor(descriptor: &FragmentDescriptor, buf: &mut Vec<u8>) {
    // buffer_id(8) || index(4)
    put_u64(buf, descriptor.buffer_id.0);
    put_u32(buf, descriptor.index);
}

fn decode_fragment_descriptor(reader: &mut Reader<'_>) -> Result<FragmentDescriptor, WireError> {
    Ok(FragmentDescriptor {
        buffer_id: BufferId(reader.u64()?),
        index: reader.u32()?,
    })
}

fn put_u64(buf: &mut Vec<u8>, value: u64) {
    buf.extend_from_slice(&value.to_be_bytes());
}

fn put_u32(buf: &mut Vec<u8>, value: u32) {
    buf.extend_from_slice(&value.to_be_bytes());
}

/// Cursor over wire bytes with strict bounds checking.
struct Reader<'a> {
    data: &'a [u8],
    offset: usize,
}

impl<'a> Reader<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data, offset: 0 }
    }

    fn bytes(&mut self, len: usize) -> Result<&'a [u8], WireError> {
        let end = self.offset.checked_add(len).ok_or(WireError::TooShort {
            min: usize::MAX,
            actual: self.data.len(),
        })?;
        if end > self.data.len() {
            return Err(WireError::TooShort {
                min: end,
                actual: self.data.len(),
            });
        }
        let slice = &self.data[self.offset..end];
        self.offset = end;
        Ok(slice)
    }

    fn u8(&mut self) -> Result<u8, WireError> {
        Ok(self.bytes(1)?[0])
    }

    fn u32(&mut self) -> Result<u32, WireError> {
        let bytes = self.bytes(4)?;
        Ok(u32::from_be_bytes(
            bytes.try_into().expect("slice is exactly 4 bytes"),
        ))
    }

    fn u64(&mut self) -> Result<u64, WireError> {
        let bytes = self.bytes(8)?;
        Ok(u64::from_be_bytes(
            bytes.try_into().expect("slice is exactly 8 bytes"),
        ))
    }

    fn node_name(&mut self) -> Result<NodeName, WireError> {
        let bytes = self.bytes(16)?;
        Ok(NodeName::new(
            bytes.try_into().expect("slice is exactly 16 bytes"),
        ))
    }

    fn finish(&self) -> Result<(), WireError> {
        if self.offset != self.data.len() {
            return Err(WireError::TrailingBytes {
                trailing: self.data.len() - self.offset,
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use weft_core::fragment::PRIMARY_BUFFER_ID;

    fn roundtrip(message: Message) {
        let envelope = Envelope {
            transmit_sequence: 77,
            message,
        };
        let encoded = envelope.encode();
        let decoded = Envelope::decode(&encoded).unwrap();
        assert_eq!(decoded, envelope);
    }

    #[test]
    fn roundtrip_all_message_types() {
        roundtrip(Message::AcceptParcel {
            sublink: SublinkId(12),
            sequence_number: SequenceNumber(3),
            data: b"hello fabric".to_vec(),
            handle_types: vec![HandleType::Portal, HandleType::Box, HandleType::Portal],
            new_routers: vec![
                RouterDescriptor {
                    new_sublink: SublinkId(44),
                    next_outgoing_sequence_number: SequenceNumber(1),
                    next_incoming_sequence_number: SequenceNumber(2),
                    peer_closed: false,
                    closed_peer_sequence_length: SequenceNumber(0),
                },
                RouterDescriptor {
                    new_sublink: SublinkId(45),
                    next_outgoing_sequence_number: SequenceNumber(9),
                    next_incoming_sequence_number: SequenceNumber(8),
                    peer_closed: true,
                    closed_peer_sequence_length: SequenceNumber(10),
                },
            ],
            num_driver_objects: 1,
        });
        roundtrip(Message::RouteClosed {
            sublink: SublinkId(1),
            sequence_length: SequenceNumber(5),
        });
        roundtrip(Message::RouteDisconnected {
            sublink: SublinkId(2),
        });
        roundtrip(Message::FlushRouter {
            sublink: SublinkId(3),
        });
        roundtrip(Message::BypassPeer {
            sublink: SublinkId(4),
            bypass_target_node: NodeName::new([0xab; 16]),
            bypass_target_sublink: SublinkId(19),
        });
        roundtrip(Message::AcceptBypassLink {
            proxy_node: NodeName::new([0xcd; 16]),
            proxy_sublink: SublinkId(6),
            inbound_sequence_length: SequenceNumber(2),
            new_sublink: SublinkId(90),
            new_link_state: FragmentDescriptor {
                buffer_id: PRIMARY_BUFFER_ID,
                index: 17,
            },
        });
        roundtrip(Message::BypassPeerWithLink {
            sublink: SublinkId(7),
            new_sublink: SublinkId(91),
            new_link_state: FragmentDescriptor {
                buffer_id: BufferId(3),
                index: 4,
            },
            inbound_sequence_length: SequenceNumber(6),
        });
        roundtrip(Message::StopProxying {
            sublink: SublinkId(8),
            inbound_sequence_length: SequenceNumber(11),
            outbound_sequence_length: SequenceNumber(12),
        });
        roundtrip(Message::ProxyWillStop {
            sublink: SublinkId(9),
            inbound_sequence_length: SequenceNumber(13),
        });
        roundtrip(Message::StopProxyingToLocalPeer {
            sublink: SublinkId(10),
            outbound_sequence_length: SequenceNumber(14),
        });
        roundtrip(Message::AddLinkStateBuffer {
            buffer_id: BufferId(5),
        });
    }

    #[test]
    fn route_closed_layout_is_stable() {
        let envelope = Envelope {
            transmit_sequence: 1,
            message: Message::RouteClosed {
                sublink: SublinkId(0x0102),
                sequence_length: SequenceNumber(0x0304),
            },
        };
        let encoded = envelope.encode();
        assert_eq!(encoded.len(), ENVELOPE_OVERHEAD + 16);
        assert_eq!(&encoded[..8], &1u64.to_be_bytes());
        assert_eq!(encoded[8], 0x02);
        assert_eq!(&encoded[9..17], &0x0102u64.to_be_bytes());
        assert_eq!(&encoded[17..25], &0x0304u64.to_be_bytes());
    }

    #[test]
    fn decode_rejects_truncation_at_every_length() {
        let envelope = Envelope {
            transmit_sequence: 9,
            message: Message::BypassPeer {
                sublink: SublinkId(4),
                bypass_target_node: NodeName::new([0x11; 16]),
                bypass_target_sublink: SublinkId(19),
            },
        };
        let encoded = envelope.encode();
        for len in 0..encoded.len() {
            assert!(
                Envelope::decode(&encoded[..len]).is_err(),
                "truncated to {len} bytes should fail"
            );
        }
    }

    #[test]
    fn decode_rejects_trailing_bytes() {
        let envelope = Envelope {
            transmit_sequence: 9,
            message: Message::FlushRouter {
                sublink: SublinkId(4),
            },
        };
        let mut encoded = envelope.encode();
        encoded.push(0xff);
        assert!(matches!(
            Envelope::decode(&encoded),
            Err(WireError::TrailingBytes { trailing: 1 })
        ));
    }

    #[test]
    fn decode_rejects_unknown_message_type() {
        let mut encoded = vec![0u8; 9];
        encoded[8] = 0x7f;
        assert!(matches!(
            Envelope::decode(&encoded),
            Err(WireError::UnknownMessageType(0x7f))
        ));
    }

    #[test]
    fn decode_rejects_invalid_handle_type() {
        let envelope = Envelope {
            transmit_sequence: 0,
            message: Message::AcceptParcel {
                sublink: SublinkId(1),
                sequence_number: SequenceNumber(0),
                data: vec![],
                handle_types: vec![HandleType::Box],
                new_routers: vec![],
                num_driver_objects: 1,
            },
        };
        let mut encoded = envelope.encode();
        // The lone handle type byte sits after sublink, sn, and data_len.
        let handle_offset = ENVELOPE_OVERHEAD + 8 + 8 + 4 + 4;
        encoded[handle_offset] = 0x55;
        assert!(matches!(
            Envelope::decode(&encoded),
            Err(WireError::InvalidHandleType(0x55))
        ));
    }

    mod proptests {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            /// Arbitrary bytes never panic the decoder.
            #[test]
            fn proptest_decode_arbitrary_bytes(
                data in proptest::collection::vec(any::<u8>(), 0..256),
            ) {
                let _ = Envelope::decode(&data);
            }

            #[test]
            fn proptest_route_closed_roundtrip(
                transmit_sequence in any::<u64>(),
                sublink in any::<u64>(),
                length in any::<u64>(),
            ) {
                let envelope = Envelope {
                    transmit_sequence,
                    message: Message::RouteClosed {
                        sublink: SublinkId(sublink),
                        sequence_length: SequenceNumber(length),
                    },
                };
                let decoded = Envelope::decode(&envelope.encode()).unwrap();
                prop_assert_eq!(decoded, envelope);
            }
        }
    }
}
