// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! S1AP decoding (TS 36.413), the 4G eNodeB ↔ MME interface.
//!
//! UE association ids (MME-UE-S1AP-ID, eNB-UE-S1AP-ID) are the only handle
//! the RAN side gives us before NAS reveals an IMSI; the correlator merges
//! the provisional session into the subscriber one when that happens. A
//! piggy-backed NAS-PDU IE is sub-parsed in place so its identifiers land
//! on this message too.

use std::sync::Arc;

use crate::{
    dict::Dictionary,
    proto::{
        ident::{Identifier, IdentifierKind},
        message::{
            Direction, ElementRole, LinkMeta, Location, Message, MessageDetail,
            Outcome, Protocol, RanPduKind,
        },
        nas,
        per,
        registry::{DecodeError, Decoder},
    },
};

pub const S1AP_SCTP_PORT: u16 = 36412;

const IE_MME_UE_S1AP_ID: u16 = 0;
const IE_ENB_UE_S1AP_ID: u16 = 8;
const IE_CAUSE: u16 = 2;
const IE_NAS_PDU: u16 = 26;
const IE_TAI: u16 = 67;
const IE_EUTRAN_CGI: u16 = 100;

#[derive(Debug)]
pub struct S1apDecoder {
    dict: Arc<Dictionary>,
}

impl S1apDecoder {
    pub fn new(dict: Arc<Dictionary>) -> Self {
        Self { dict }
    }
}

impl Decoder for S1apDecoder {
    fn protocol(&self) -> Protocol {
        Protocol::S1ap
    }

    fn can_decode(&self, bytes: &[u8], link: &LinkMeta) -> bool {
        if !per::sniff(bytes) {
            return false;
        }
        // The well-known SCTP port settles S1AP vs NGAP; otherwise fall back
        // to whether the procedure code is in our S1AP table.
        if link.src_port == S1AP_SCTP_PORT || link.dst_port == S1AP_SCTP_PORT {
            return true;
        }
        if link.src_port == crate::proto::ngap::NGAP_SCTP_PORT
            || link.dst_port == crate::proto::ngap::NGAP_SCTP_PORT
        {
            return false;
        }
        self.dict.s1ap_procedure(bytes[1]).is_some()
    }

    fn decode(&self, bytes: &[u8], link: &LinkMeta) -> Result<Message, DecodeError> {
        let pdu = per::parse(bytes)?;
        let mut msg = Message::from_link(Protocol::S1ap, link);

        let proc_name = self
            .dict
            .s1ap_procedure(pdu.procedure_code)
            .unwrap_or("S1AP-Unknown");
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

        let mut mme_id = None;
        let mut enb_id = None;
        for ie in &pdu.ies {
            match ie.id {
                IE_MME_UE_S1AP_ID => {
                    if let Some(v) = per::be_uint(ie.value) {
                        mme_id = Some(v);
                        msg.identifiers.push(Identifier::new(
                            IdentifierKind::MmeUeId,
                            v.to_string(),
                        ));
                    }
                },
                IE_ENB_UE_S1AP_ID => {
                    if let Some(v) = per::be_uint(ie.value) {
                        enb_id = Some(v);
                        msg.identifiers.push(Identifier::new(
                            IdentifierKind::EnbUeId,
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
                            .error_of(Protocol::S1ap, cause)
                            .map(str::to_string);
                    }
                },
                IE_NAS_PDU => {
                    // Lift NAS identifiers onto the carrying message.
                    if let Ok(sub) = nas::parse_nas(&self.dict, ie.value) {
                        msg.identifiers.extend(sub.identifiers);
                    }
                },
                IE_TAI => {
                    if ie.value.len() >= 5 {
                        let (mcc, mnc) =
                            crate::proto::gtp::decode_plmn(&ie.value[..3]);
                        let tac = u16::from_be_bytes([ie.value[3], ie.value[4]]);
                        msg.location = Some(Location {
                            mcc,
                            mnc,
                            tac: Some(u32::from(tac)),
                            cell_id: None,
                        });
                    }
                },
                IE_EUTRAN_CGI => {
                    if ie.value.len() >= 7 {
                        let eci = u32::from_be_bytes([
                            ie.value[3] & 0x0F,
                            ie.value[4],
                            ie.value[5],
                            ie.value[6],
                        ]);
                        if let Some(loc) = msg.location.as_mut() {
                            loc.cell_id = Some(u64::from(eci));
                        } else {
                            let (mcc, mnc) =
                                crate::proto::gtp::decode_plmn(&ie.value[..3]);
                            msg.location = Some(Location {
                                mcc,
                                mnc,
                                tac: None,
                                cell_id: Some(u64::from(eci)),
                            });
                        }
                    }
                },
                _ => {},
            }
        }

        // The UE association pairs requests with outcomes.
        msg.transaction_id = mme_id.or(enb_id);

        // Downlink procedures originate at the MME; everything else the
        // eNB initiates and the MME answers.
        let downlink = matches!(pdu.procedure_code, 9 | 10 | 11 | 21 | 23);
        let (from, to) = match (pdu.kind, downlink) {
            (RanPduKind::InitiatingMessage, true) => {
                (ElementRole::Mme, ElementRole::Enb)
            },
            (RanPduKind::InitiatingMessage, false) => {
                (ElementRole::Enb, ElementRole::Mme)
            },
            (_, true) => (ElementRole::Enb, ElementRole::Mme),
            (_, false) => (ElementRole::Mme, ElementRole::Enb),
        };
        msg.source.role = Some(from);
        msg.destination.role = Some(to);

        msg.detail = MessageDetail::S1ap {
            procedure_code: pdu.procedure_code,
            pdu_kind: pdu.kind,
        };
        Ok(msg)
    }
}
