// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! NGAP decoding (TS 38.413), the 5G gNB ↔ AMF interface.
//!
//! Structurally a sibling of S1AP; the RAN/AMF UE association ids and the
//! piggy-backed NAS PDU play the same correlation roles their 4G
//! counterparts do.

use std::sync::Arc;

use crate::{
    dict::Dictionary,
    proto::{
        ident::{Identifier, IdentifierKind},
        message::{
            Direction, ElementRole, LinkMeta, Location, Message, MessageDetail,
            Outcome, Protocol, RanPduKind,
        },
        nas, per,
        registry::{DecodeError, Decoder},
    },
};

pub const NGAP_SCTP_PORT: u16 = 38412;

const IE_AMF_UE_NGAP_ID: u16 = 10;
const IE_RAN_UE_NGAP_ID: u16 = 85;
const IE_CAUSE: u16 = 15;
const IE_NAS_PDU: u16 = 38;
const IE_USER_LOCATION: u16 = 121;
const IE_GUAMI: u16 = 28;
const IE_FIVE_G_S_TMSI: u16 = 26;

#[derive(Debug)]
pub struct NgapDecoder {
    dict: Arc<Dictionary>,
}

impl NgapDecoder {
    pub fn new(dict: Arc<Dictionary>) -> Self {
        Self { dict }
    }
}

impl Decoder for NgapDecoder {
    fn protocol(&self) -> Protocol {
        Protocol::Ngap
    }

    fn can_decode(&self, bytes: &[u8], link: &LinkMeta) -> bool {
        if !per::sniff(bytes) {
            return false;
        }
        if link.src_port == NGAP_SCTP_PORT || link.dst_port == NGAP_SCTP_PORT {
            return true;
        }
        if link.src_port == crate::proto::s1ap::S1AP_SCTP_PORT
            || link.dst_port == crate::proto::s1ap::S1AP_SCTP_PORT
        {
            return false;
        }
        self.dict.ngap_procedure(bytes[1]).is_some()
    }

    fn decode(&self, bytes: &[u8], link: &LinkMeta) -> Result<Message, DecodeError> {
        let pdu = per::parse(bytes)?;
        let mut msg = Message::from_link(Protocol::Ngap, link);

        let proc_name = self
            .dict
            .ngap_procedure(pdu.procedure_code)
            .unwrap_or("NGAP-Unknown");
        msg.message_name = match pdu.kind {
            RanPduKind::InitiatingMessage => proc_name.to_string(),
            RanPduKind::SuccessfulOutcome => format!("{proc_name}-Success"),
            RanPduKind::UnsuccessfulOutcome => format!("{proc_name}-Failure"),
        };
        msg.direction = match pdu.kind {
            RanPduKind::InitiatingMessage => Direction::Request,
            _ => Direction::Response,
        };
        msg.outcome = match pdu.kind {
            RanPduKind::InitiatingMessage => Outcome::Pending,
            RanPduKind::SuccessfulOutcome => Outcome::Success,
            RanPduKind::UnsuccessfulOutcome => Outcome::Failure,
        };

        let mut amf_id = None;
        let mut ran_id = None;
        for ie in &pdu.ies {
            match ie.id {
                IE_AMF_UE_NGAP_ID => {
                    if let Some(v) = per::be_uint(ie.value) {
                        amf_id = Some(v);
                        msg.identifiers.push(Identifier::new(
                            IdentifierKind::AmfUeId,
                            v.to_string(),
                        ));
                    }
                },
                IE_RAN_UE_NGAP_ID => {
                    if let Some(v) = per::be_uint(ie.value) {
                        ran_id = Some(v);
                        msg.identifiers.push(Identifier::new(
                            IdentifierKind::RanUeId,
                            v.to_string(),
                        ));
                    }
                },
                IE_CAUSE => {
                    if ie.value.len() >= 2 {
                        let cause =
                            (u32::from(ie.value[0]) << 8) | u32::from(ie.value[1]);
                        msg.cause = Some(cause);
                        msg.cause_text = self
                            .dict
                            .error_of(Protocol::Ngap, cause)
                            .map(str::to_string);
                    }
                },
                IE_NAS_PDU => {
                    if let Ok(sub) = nas::parse_nas(&self.dict, ie.value) {
                        msg.identifiers.extend(sub.identifiers);
                    }
                },
                IE_USER_LOCATION => {
                    // NR user location: PLMN + 5-byte TAC-prefixed encoding.
                    if ie.value.len() >= 6 {
                        let (mcc, mnc) =
                            crate::proto::gtp::decode_plmn(&ie.value[..3]);
                        let tac = u32::from_be_bytes([
                            0, ie.value[3], ie.value[4], ie.value[5],
                        ]);
                        msg.location = Some(Location {
                            mcc,
                            mnc,
                            tac: Some(tac),
                            cell_id: None,
                        });
                    }
                },
                IE_GUAMI => {
                    if ie.value.len() >= 6 {
                        msg.identifiers.push(Identifier::new(
                            IdentifierKind::Guami,
                            hex::encode(&ie.value[..6]),
                        ));
                    }
                },
                IE_FIVE_G_S_TMSI => {
                    if !ie.value.is_empty() {
                        msg.identifiers.push(Identifier::new(
                            IdentifierKind::FiveGSTmsi,
                            hex::encode(ie.value),
                        ));
                    }
                },
                _ => {},
            }
        }

        msg.transaction_id = amf_id.or(ran_id);

        // Downlink procedures originate at the AMF; the rest the gNB
        // initiates and the AMF answers.
        let downlink = matches!(pdu.procedure_code, 4 | 14 | 29 | 41);
        let (from, to) = match (pdu.kind, downlink) {
            (RanPduKind::InitiatingMessage, true) => {
                (ElementRole::Amf, ElementRole::Gnb)
            },
            (RanPduKind::InitiatingMessage, false) => {
                (ElementRole::Gnb, ElementRole::Amf)
            },
            (_, true) => (ElementRole::Gnb, ElementRole::Amf),
            (_, false) => (ElementRole::Amf, ElementRole::Gnb),
        };
        msg.source.role = Some(from);
        msg.destination.role = Some(to);

        msg.detail = MessageDetail::Ngap {
            procedure_code: pdu.procedure_code,
            pdu_kind: pdu.kind,
        };
        Ok(msg)
    }
}
