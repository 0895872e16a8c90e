// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Aligned-PER scaffolding shared by the S1AP and NGAP decoders.
//!
//! Both protocols open with the same three-byte prologue (PDU choice
//! discriminator, procedure code, criticality), a length determinant, and a
//! protocol-IE container whose entries are `(id, criticality, length,
//! value)` tuples. Everything here stops at that container level; IE value
//! interpretation stays with the owning decoder.

use crate::{
    proto::message::RanPduKind,
    proto::registry::DecodeError,
};

pub const CHOICE_INITIATING: u8 = 0x00;
pub const CHOICE_SUCCESSFUL: u8 = 0x20;
pub const CHOICE_UNSUCCESSFUL: u8 = 0x40;

/// Reads a PER length determinant; one byte below 128, two bytes with the
/// top bit set below 16384. Fragmented determinants do not occur at the
/// sizes signalling PDUs reach.
pub fn read_length(buf: &[u8]) -> Result<(usize, usize), DecodeError> {
    let first = *buf.first().ok_or(DecodeError::InsufficientData("PER length"))?;
    if first < 0x80 {
        return Ok((first as usize, 1));
    }
    if first & 0xC0 == 0x80 {
        let second = *buf
            .get(1)
            .ok_or(DecodeError::InsufficientData("PER length"))?;
        return Ok((((first as usize & 0x3F) << 8) | second as usize, 2));
    }
    Err(DecodeError::Malformed(
        "fragmented PER length determinant".to_string(),
    ))
}

/// The decoded prologue of an S1AP/NGAP PDU.
pub struct RanApPdu<'a> {
    pub kind: RanPduKind,
    pub procedure_code: u8,
    pub ies: Vec<RanApIe<'a>>,
}

pub struct RanApIe<'a> {
    pub id: u16,
    pub value: &'a [u8],
}

pub fn sniff(bytes: &[u8]) -> bool {
    bytes.len() >= 4
        && matches!(
            bytes[0],
            CHOICE_INITIATING | CHOICE_SUCCESSFUL | CHOICE_UNSUCCESSFUL
        )
}

pub fn parse(bytes: &[u8]) -> Result<RanApPdu<'_>, DecodeError> {
    if bytes.len() < 4 {
        return Err(DecodeError::InsufficientData("PDU prologue"));
    }
    let kind = match bytes[0] {
        CHOICE_INITIATING => RanPduKind::InitiatingMessage,
        CHOICE_SUCCESSFUL => RanPduKind::SuccessfulOutcome,
        CHOICE_UNSUCCESSFUL => RanPduKind::UnsuccessfulOutcome,
        other => {
            return Err(DecodeError::Malformed(format!(
                "unknown PDU choice {other:#04x}"
            )));
        },
    };
    let procedure_code = bytes[1];
    // bytes[2] is the criticality of the whole procedure.

    let (value_len, det) = read_length(&bytes[3..])?;
    let value_start = 3 + det;
    if bytes.len() < value_start + value_len {
        return Err(DecodeError::InsufficientData("PDU value"));
    }
    let value = &bytes[value_start..value_start + value_len];

    // SEQUENCE preamble octet, then the IE count.
    if value.len() < 3 {
        return Err(DecodeError::InsufficientData("IE container"));
    }
    let count = u16::from_be_bytes([value[1], value[2]]) as usize;
    let mut rest = &value[3..];

    let mut ies = Vec::with_capacity(count);
    for _ in 0..count {
        if rest.len() < 3 {
            return Err(DecodeError::Malformed(
                "IE container shorter than its declared count".to_string(),
            ));
        }
        let id = u16::from_be_bytes([rest[0], rest[1]]);
        // rest[2] is the IE criticality.
        let (ie_len, det) = read_length(&rest[3..])?;
        let start = 3 + det;
        if rest.len() < start + ie_len {
            return Err(DecodeError::Malformed(format!(
                "IE {id} length {ie_len} exceeds remaining buffer"
            )));
        }
        ies.push(RanApIe {
            id,
            value: &rest[start..start + ie_len],
        });
        rest = &rest[start + ie_len..];
    }

    Ok(RanApPdu {
        kind,
        procedure_code,
        ies,
    })
}

/// Big-endian integer of up to eight value bytes (UE ids are constrained
/// integers whose encoded width varies).
pub fn be_uint(data: &[u8]) -> Option<u64> {
    if data.is_empty() || data.len() > 8 {
        return None;
    }
    let mut v: u64 = 0;
    for &b in data {
        v = (v << 8) | u64::from(b);
    }
    Some(v)
}
