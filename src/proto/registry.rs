// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Decoder contract and the dispatching registry.
//!
//! Each protocol family implements [`Decoder`]; the registry owns one
//! instance of each, in declared priority order, and hands a buffer to the
//! first decoder whose sniff accepts it. Order matters where framings
//! overlap on the same transport (Diameter and HTTP/2 both ride TCP/SCTP
//! with a plausible first byte), so the sequence below is part of the
//! contract, not an implementation detail.

use std::{sync::Arc, time::Instant};

use bytes::Bytes;
use enum_dispatch::enum_dispatch;
use thiserror::Error;

use crate::{
    dict::Dictionary,
    proto::{
        diameter::DiameterDecoder,
        gtp::{GtpUDecoder, Gtpv2Decoder},
        http2::Http2Decoder,
        message::{LinkMeta, Message, Outcome, Protocol},
        nas::NasDecoder,
        ngap::NgapDecoder,
        pfcp::PfcpDecoder,
        s1ap::S1apDecoder,
        tcap::{CapDecoder, InapDecoder, MapDecoder},
    },
};

/// Typed decode failures. Only `Malformed` and `InsufficientData` abort a
/// buffer; an unknown vendor extension is captured opaquely inside the
/// message and never surfaces from [`Decoder::decode`].
#[derive(Debug, Error, PartialEq, Eq)]
pub enum DecodeError {
    #[error("buffer too short for {0}")]
    InsufficientData(&'static str),

    #[error("malformed PDU: {0}")]
    Malformed(String),

    #[error("unsupported protocol version {0}")]
    UnsupportedVersion(u8),

    #[error("unknown vendor extension (vendor {vendor}, code {code})")]
    VendorExtensionUnknown { vendor: u32, code: u32 },
}

/// One protocol family's view of the wire.
///
/// Implementations are stateless across calls; per-flow reassembly belongs
/// to the capture collaborator. `can_decode` is a cheap bounded sniff and
/// must not allocate.
#[enum_dispatch]
pub trait Decoder {
    /// The single protocol this decoder claims.
    fn protocol(&self) -> Protocol;

    /// Fast structural sniff; may consult the five-tuple as a hint.
    fn can_decode(&self, bytes: &[u8], link: &LinkMeta) -> bool;

    /// Full decode into the normalised record.
    fn decode(&self, bytes: &[u8], link: &LinkMeta) -> Result<Message, DecodeError>;
}

#[enum_dispatch(Decoder)]
#[derive(Debug)]
pub enum ProtocolDecoder {
    DiameterDecoder,
    Http2Decoder,
    Gtpv2Decoder,
    GtpUDecoder,
    PfcpDecoder,
    S1apDecoder,
    NgapDecoder,
    NasDecoder,
    MapDecoder,
    CapDecoder,
    InapDecoder,
}

/// A decode attempt that failed after a decoder claimed the buffer.
#[derive(Debug)]
pub struct DecodeFailure {
    pub protocol: Protocol,
    pub error: DecodeError,
}

/// Owns the decoder sequence and dispatches buffers to it.
pub struct DecoderRegistry {
    decoders: Vec<ProtocolDecoder>,
    retain_raw: bool,
}

impl DecoderRegistry {
    /// Full decoder set in declared priority order. The SS7 family sits
    /// before NAS on purpose: a TCAP `begin` tag shares its low nibble
    /// with the ESM protocol discriminator, and the TCAP sniff (a real
    /// BER parse) is the stronger claim.
    pub fn with_defaults(dict: Arc<Dictionary>, retain_raw: bool) -> Self {
        let decoders = vec![
            ProtocolDecoder::from(DiameterDecoder::new(Arc::clone(&dict))),
            ProtocolDecoder::from(Http2Decoder::new(Arc::clone(&dict))),
            ProtocolDecoder::from(Gtpv2Decoder::new(Arc::clone(&dict))),
            ProtocolDecoder::from(GtpUDecoder::new()),
            ProtocolDecoder::from(PfcpDecoder::new(Arc::clone(&dict))),
            ProtocolDecoder::from(S1apDecoder::new(Arc::clone(&dict))),
            ProtocolDecoder::from(NgapDecoder::new(Arc::clone(&dict))),
            ProtocolDecoder::from(MapDecoder::new(Arc::clone(&dict))),
            ProtocolDecoder::from(CapDecoder::new(Arc::clone(&dict))),
            ProtocolDecoder::from(InapDecoder::new(Arc::clone(&dict))),
            ProtocolDecoder::from(NasDecoder::new(dict)),
        ];
        Self {
            decoders,
            retain_raw,
        }
    }

    /// Registry with an explicit decoder sequence, mostly for tests.
    pub fn new(decoders: Vec<ProtocolDecoder>, retain_raw: bool) -> Self {
        Self {
            decoders,
            retain_raw,
        }
    }

    /// Asks each decoder in priority order; the first sniff that accepts
    /// wins. No accepting decoder means an `Other` message with the raw
    /// buffer preserved for diagnostics.
    pub fn dispatch(
        &self,
        bytes: &[u8],
        link: &LinkMeta,
    ) -> Result<Message, DecodeFailure> {
        let started = Instant::now();

        for decoder in &self.decoders {
            if !decoder.can_decode(bytes, link) {
                continue;
            }
            return match decoder.decode(bytes, link) {
                Ok(mut msg) => {
                    msg.decode_latency_us = started.elapsed().as_micros() as u64;
                    if self.retain_raw {
                        msg.raw = Some(Bytes::copy_from_slice(bytes));
                    }
                    Ok(msg)
                },
                Err(error) => Err(DecodeFailure {
                    protocol: decoder.protocol(),
                    error,
                }),
            };
        }

        let mut msg = Message::from_link(Protocol::Other, link);
        msg.message_name = "Undecoded".to_string();
        msg.outcome = Outcome::Unknown;
        msg.decode_latency_us = started.elapsed().as_micros() as u64;
        // Always keep bytes nobody understood; they are the only diagnostic.
        msg.raw = Some(Bytes::copy_from_slice(bytes));
        Ok(msg)
    }

    pub fn decoder_count(&self) -> usize {
        self.decoders.len()
    }
}
