//! Transport parameter codec (RFC 9000 Section 18).
//!
//! Values carried in the TLS transport_parameters extension. Parameters at
//! their default value are omitted on encode; unknown identifiers at or
//! above the custom threshold are preserved, below it they are skipped.

use anyhow::{anyhow, Result};
use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::types::{
    read_varint, write_varint, ConnectionId, CUSTOM_TRANSPORT_PARAMETER_THRESHOLD,
};

const PARAM_ORIGINAL_DESTINATION_CID: u64 = 0x00;
const PARAM_MAX_IDLE_TIMEOUT: u64 = 0x01;
const PARAM_STATELESS_RESET_TOKEN: u64 = 0x02;
const PARAM_MAX_UDP_PAYLOAD_SIZE: u64 = 0x03;
const PARAM_INITIAL_MAX_DATA: u64 = 0x04;
const PARAM_INITIAL_MAX_STREAM_DATA_BIDI_LOCAL: u64 = 0x05;
const PARAM_INITIAL_MAX_STREAM_DATA_BIDI_REMOTE: u64 = 0x06;
const PARAM_INITIAL_MAX_STREAM_DATA_UNI: u64 = 0x07;
const PARAM_INITIAL_MAX_STREAMS_BIDI: u64 = 0x08;
const PARAM_INITIAL_MAX_STREAMS_UNI: u64 = 0x09;
const PARAM_ACK_DELAY_EXPONENT: u64 = 0x0a;
const PARAM_MAX_ACK_DELAY: u64 = 0x0b;
const PARAM_DISABLE_ACTIVE_MIGRATION: u64 = 0x0c;
const PARAM_ACTIVE_CONNECTION_ID_LIMIT: u64 = 0x0e;
const PARAM_INITIAL_SOURCE_CID: u64 = 0x0f;
const PARAM_RETRY_SOURCE_CID: u64 = 0x10;

/// A locally-configured parameter outside the standard registry. Only
/// identifiers at or above [`CUSTOM_TRANSPORT_PARAMETER_THRESHOLD`] are
/// accepted; the space below is reserved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CustomTransportParameter {
    pub id: u64,
    pub value: Bytes,
}

impl CustomTransportParameter {
    pub fn new(id: u64, value: Bytes) -> Result<Self> {
        if id < CUSTOM_TRANSPORT_PARAMETER_THRESHOLD {
            return Err(anyhow!(
                "custom parameter id {id:#x} below threshold {CUSTOM_TRANSPORT_PARAMETER_THRESHOLD:#x}"
            ));
        }
        Ok(Self { id, value })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportParameters {
    pub original_destination_connection_id: Option<ConnectionId>,
    /// Milliseconds.
    pub max_idle_timeout: u64,
    pub stateless_reset_token: Option<[u8; 16]>,
    pub max_udp_payload_size: u64,
    pub initial_max_data: u64,
    pub initial_max_stream_data_bidi_local: u64,
    pub initial_max_stream_data_bidi_remote: u64,
    pub initial_max_stream_data_uni: u64,
    pub initial_max_streams_bidi: u64,
    pub initial_max_streams_uni: u64,
    pub ack_delay_exponent: u64,
    /// Milliseconds.
    pub max_ack_delay: u64,
    pub disable_active_migration: bool,
    pub active_connection_id_limit: u64,
    pub initial_source_connection_id: Option<ConnectionId>,
    pub retry_source_connection_id: Option<ConnectionId>,
    /// Negotiated extensions: identifiers at or above the custom threshold.
    pub custom_parameters: Vec<CustomTransportParameter>,
}

impl Default for TransportParameters {
    fn default() -> Self {
        Self {
            original_destination_connection_id: None,
            max_idle_timeout: 0,
            stateless_reset_token: None,
            max_udp_payload_size: 65527,
            initial_max_data: 0,
            initial_max_stream_data_bidi_local: 0,
            initial_max_stream_data_bidi_remote: 0,
            initial_max_stream_data_uni: 0,
            initial_max_streams_bidi: 0,
            initial_max_streams_uni: 0,
            ack_delay_exponent: 3,
            max_ack_delay: 25,
            disable_active_migration: false,
            active_connection_id_limit: 2,
            initial_source_connection_id: None,
            retry_source_connection_id: None,
            custom_parameters: Vec::new(),
        }
    }
}

impl TransportParameters {
    pub fn encode(&self, buf: &mut BytesMut) {
        fn write_param(buf: &mut BytesMut, id: u64, val: &[u8]) {
            write_varint(buf, id);
            write_varint(buf, val.len() as u64);
            buf.put_slice(val);
        }

        fn write_varint_param(buf: &mut BytesMut, id: u64, val: u64) {
            // Skip parameters at their default.
            match id {
                PARAM_MAX_IDLE_TIMEOUT if val == 0 => return,
                PARAM_MAX_UDP_PAYLOAD_SIZE if val == 65527 => return,
                PARAM_INITIAL_MAX_DATA..=PARAM_INITIAL_MAX_STREAMS_UNI if val == 0 => return,
                PARAM_ACK_DELAY_EXPONENT if val == 3 => return,
                PARAM_MAX_ACK_DELAY if val == 25 => return,
                PARAM_ACTIVE_CONNECTION_ID_LIMIT if val == 2 => return,
                _ => {}
            }
            let mut tmp = BytesMut::with_capacity(8);
            write_varint(&mut tmp, val);
            write_param(buf, id, &tmp);
        }

        if let Some(cid) = &self.original_destination_connection_id {
            write_param(buf, PARAM_ORIGINAL_DESTINATION_CID, cid.as_bytes());
        }

        write_varint_param(buf, PARAM_MAX_IDLE_TIMEOUT, self.max_idle_timeout);

        if let Some(token) = &self.stateless_reset_token {
            write_param(buf, PARAM_STATELESS_RESET_TOKEN, token);
        }

        write_varint_param(buf, PARAM_MAX_UDP_PAYLOAD_SIZE, self.max_udp_payload_size);
        write_varint_param(buf, PARAM_INITIAL_MAX_DATA, self.initial_max_data);
        write_varint_param(
            buf,
            PARAM_INITIAL_MAX_STREAM_DATA_BIDI_LOCAL,
            self.initial_max_stream_data_bidi_local,
        );
        write_varint_param(
            buf,
            PARAM_INITIAL_MAX_STREAM_DATA_BIDI_REMOTE,
            self.initial_max_stream_data_bidi_remote,
        );
        write_varint_param(
            buf,
            PARAM_INITIAL_MAX_STREAM_DATA_UNI,
            self.initial_max_stream_data_uni,
        );
        write_varint_param(buf, PARAM_INITIAL_MAX_STREAMS_BIDI, self.initial_max_streams_bidi);
        write_varint_param(buf, PARAM_INITIAL_MAX_STREAMS_UNI, self.initial_max_streams_uni);
        write_varint_param(buf, PARAM_ACK_DELAY_EXPONENT, self.ack_delay_exponent);
        write_varint_param(buf, PARAM_MAX_ACK_DELAY, self.max_ack_delay);

        if self.disable_active_migration {
            write_param(buf, PARAM_DISABLE_ACTIVE_MIGRATION, &[]);
        }

        write_varint_param(
            buf,
            PARAM_ACTIVE_CONNECTION_ID_LIMIT,
            self.active_connection_id_limit,
        );

        if let Some(cid) = &self.initial_source_connection_id {
            write_param(buf, PARAM_INITIAL_SOURCE_CID, cid.as_bytes());
        }

        if let Some(cid) = &self.retry_source_connection_id {
            write_param(buf, PARAM_RETRY_SOURCE_CID, cid.as_bytes());
        }

        for custom in &self.custom_parameters {
            write_param(buf, custom.id, &custom.value);
        }
    }

    pub fn decode<B: Buf>(buf: &mut B) -> Result<Self> {
        let mut params = Self::default();

        while buf.has_remaining() {
            let id = read_varint(buf).ok_or_else(|| anyhow!("truncated parameter id"))?;
            let len = read_varint(buf).ok_or_else(|| anyhow!("truncated parameter length"))?;

            if (buf.remaining() as u64) < len {
                return Err(anyhow!("buffer too short for parameter value"));
            }

            let mut value = buf.copy_to_bytes(len as usize);

            fn varint_value(value: &[u8]) -> Result<u64> {
                crate::types::decode_varint(value)
                    .map(|(v, _)| v)
                    .ok_or_else(|| anyhow!("bad varint value"))
            }

            match id {
                PARAM_ORIGINAL_DESTINATION_CID => {
                    params.original_destination_connection_id =
                        Some(ConnectionId::new(value).ok_or_else(|| anyhow!("invalid CID"))?);
                }
                PARAM_MAX_IDLE_TIMEOUT => params.max_idle_timeout = varint_value(&value)?,
                PARAM_STATELESS_RESET_TOKEN => {
                    if value.len() != 16 {
                        return Err(anyhow!("invalid stateless reset token length"));
                    }
                    let mut token = [0u8; 16];
                    value.copy_to_slice(&mut token);
                    params.stateless_reset_token = Some(token);
                }
                PARAM_MAX_UDP_PAYLOAD_SIZE => params.max_udp_payload_size = varint_value(&value)?,
                PARAM_INITIAL_MAX_DATA => params.initial_max_data = varint_value(&value)?,
                PARAM_INITIAL_MAX_STREAM_DATA_BIDI_LOCAL => {
                    params.initial_max_stream_data_bidi_local = varint_value(&value)?
                }
                PARAM_INITIAL_MAX_STREAM_DATA_BIDI_REMOTE => {
                    params.initial_max_stream_data_bidi_remote = varint_value(&value)?
                }
                PARAM_INITIAL_MAX_STREAM_DATA_UNI => {
                    params.initial_max_stream_data_uni = varint_value(&value)?
                }
                PARAM_INITIAL_MAX_STREAMS_BIDI => {
                    params.initial_max_streams_bidi = varint_value(&value)?
                }
                PARAM_INITIAL_MAX_STREAMS_UNI => params.initial_max_streams_uni = varint_value(&value)?,
                PARAM_ACK_DELAY_EXPONENT => params.ack_delay_exponent = varint_value(&value)?,
                PARAM_MAX_ACK_DELAY => params.max_ack_delay = varint_value(&value)?,
                PARAM_DISABLE_ACTIVE_MIGRATION => params.disable_active_migration = true,
                PARAM_ACTIVE_CONNECTION_ID_LIMIT => {
                    params.active_connection_id_limit = varint_value(&value)?
                }
                PARAM_INITIAL_SOURCE_CID => {
                    params.initial_source_connection_id =
                        Some(ConnectionId::new(value).ok_or_else(|| anyhow!("invalid CID"))?);
                }
                PARAM_RETRY_SOURCE_CID => {
                    params.retry_source_connection_id =
                        Some(ConnectionId::new(value).ok_or_else(|| anyhow!("invalid CID"))?);
                }
                id if id >= CUSTOM_TRANSPORT_PARAMETER_THRESHOLD => {
                    params
                        .custom_parameters
                        .push(CustomTransportParameter { id, value });
                }
                _ => {
                    // Unknown standard-space parameter: ignore.
                }
            }
        }

        Ok(params)
    }

    /// Validate received parameters per RFC 9000 Section 18.2.
    pub fn validate(&self) -> Result<()> {
        if self.ack_delay_exponent > 20 {
            return Err(anyhow!(
                "ack_delay_exponent must be <= 20, got {}",
                self.ack_delay_exponent
            ));
        }
        if self.max_ack_delay >= (1 << 14) {
            return Err(anyhow!(
                "max_ack_delay must be < 2^14 ms, got {}",
                self.max_ack_delay
            ));
        }
        if self.active_connection_id_limit < 2 {
            return Err(anyhow!(
                "active_connection_id_limit must be >= 2, got {}",
                self.active_connection_id_limit
            ));
        }
        if self.max_udp_payload_size < 1200 {
            return Err(anyhow!(
                "max_udp_payload_size must be >= 1200, got {}",
                self.max_udp_payload_size
            ));
        }
        Ok(())
    }
}
