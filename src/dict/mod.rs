// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! The knowledge service: numeric codes to names, names to procedures,
//! procedures to expected flows.
//!
//! Built once at boot from the packaged tables and injected as
//! `Arc<Dictionary>` wherever resolution is needed; every query borrows
//! immutable state, so sharing it across workers costs nothing.

pub mod flow;
pub mod tables;

use std::collections::{HashMap, HashSet};

use crate::proto::{
    ident::IdentifierKind,
    message::{Direction, Protocol},
};

pub use crate::dict::flow::{FlowScore, FlowStep, FlowTemplate};

/// One SS7 operation entry.
#[derive(Debug, Clone, Copy)]
pub struct Ss7Operation {
    pub name: &'static str,
    /// Identifier kind of the operation's leading parameter, when the
    /// encoding makes it extractable.
    pub param_identifier: Option<IdentifierKind>,
}

/// Suggested diagnostic attached to an SLA issue.
#[derive(Debug, Clone, Copy)]
pub struct Diagnosis {
    pub reference: &'static str,
    pub likely_causes: &'static str,
}

#[derive(Debug)]
pub struct Dictionary {
    diameter_commands: HashMap<(u32, bool), &'static str>,
    gtpv2: HashMap<u8, (&'static str, Direction)>,
    pfcp: HashMap<u8, (&'static str, Direction)>,
    s1ap: HashMap<u8, &'static str>,
    ngap: HashMap<u8, &'static str>,
    nas: HashMap<(u8, u8), &'static str>,
    ss7: HashMap<(Protocol, i32), Ss7Operation>,
    avps: HashMap<(u32, u32), &'static str>,
    errors: HashMap<(Protocol, u32), &'static str>,
    procedure_of_message: HashMap<&'static str, &'static str>,
    flows: HashMap<&'static str, FlowTemplate>,
    diagnoses: HashMap<&'static str, Diagnosis>,
    release_messages: HashSet<&'static str>,
}

impl Dictionary {
    pub fn new() -> Self {
        let diameter_commands = tables::DIAMETER_COMMANDS
            .iter()
            .flat_map(|&(code, req, ans)| [((code, true), req), ((code, false), ans)])
            .collect();
        let gtpv2 = tables::GTPV2_MESSAGES
            .iter()
            .map(|&(t, name, dir)| (t, (name, dir)))
            .collect();
        let pfcp = tables::PFCP_MESSAGES
            .iter()
            .map(|&(t, name, dir)| (t, (name, dir)))
            .collect();
        let s1ap = tables::S1AP_PROCEDURES.iter().copied().collect();
        let ngap = tables::NGAP_PROCEDURES.iter().copied().collect();
        let nas = tables::NAS_MESSAGES
            .iter()
            .map(|&(pd, t, name)| ((pd, t), name))
            .collect();
        let ss7 = tables::SS7_OPERATIONS
            .iter()
            .map(|&(proto, op, name, param_identifier)| {
                ((proto, op), Ss7Operation {
                    name,
                    param_identifier,
                })
            })
            .collect();
        let avps = tables::VENDOR_AVPS
            .iter()
            .map(|&(vendor, code, name)| ((vendor, code), name))
            .collect();
        let errors = tables::ERROR_TEXTS
            .iter()
            .map(|&(proto, code, text)| ((proto, code), text))
            .collect();
        let procedure_of_message =
            tables::PROCEDURE_OF_MESSAGE.iter().copied().collect();
        let flows = flow::FLOWS
            .iter()
            .map(|t| (t.label, t.clone()))
            .collect();
        let diagnoses = tables::DIAGNOSES
            .iter()
            .map(|&(label, reference, likely_causes)| {
                (label, Diagnosis {
                    reference,
                    likely_causes,
                })
            })
            .collect();
        let release_messages = tables::RELEASE_MESSAGES.iter().copied().collect();

        Self {
            diameter_commands,
            gtpv2,
            pfcp,
            s1ap,
            ngap,
            nas,
            ss7,
            avps,
            errors,
            procedure_of_message,
            flows,
            diagnoses,
            release_messages,
        }
    }

    /// Diameter command code to its request/answer short name.
    pub fn command_name(&self, code: u32, is_request: bool) -> Option<&'static str> {
        self.diameter_commands.get(&(code, is_request)).copied()
    }

    pub fn gtpv2_message(&self, message_type: u8) -> Option<(&'static str, Direction)> {
        self.gtpv2.get(&message_type).copied()
    }

    pub fn pfcp_message(&self, message_type: u8) -> Option<(&'static str, Direction)> {
        self.pfcp.get(&message_type).copied()
    }

    pub fn s1ap_procedure(&self, code: u8) -> Option<&'static str> {
        self.s1ap.get(&code).copied()
    }

    pub fn ngap_procedure(&self, code: u8) -> Option<&'static str> {
        self.ngap.get(&code).copied()
    }

    pub fn nas_message(&self, pd: u8, message_type: u8) -> Option<&'static str> {
        self.nas.get(&(pd, message_type)).copied()
    }

    pub fn ss7_operation(&self, protocol: Protocol, opcode: i32) -> Option<&Ss7Operation> {
        self.ss7.get(&(protocol, opcode))
    }

    /// AVP name for `(code, vendor)`; `None` vendor means the IETF base set.
    pub fn avp_of(&self, code: u32, vendor: Option<u32>) -> Option<&'static str> {
        self.avps.get(&(vendor.unwrap_or(0), code)).copied()
    }

    /// Human text of a cause/error code.
    pub fn error_of(&self, protocol: Protocol, code: u32) -> Option<&'static str> {
        self.errors.get(&(protocol, code)).copied()
    }

    /// Procedure label implied by a numeric procedure/command code.
    pub fn procedure_of(&self, protocol: Protocol, code: u32) -> Option<&'static str> {
        let name = match protocol {
            Protocol::Diameter => self.command_name(code, true)?,
            Protocol::Gtpv2C => self.gtpv2_message(code as u8)?.0,
            Protocol::Pfcp => self.pfcp_message(code as u8)?.0,
            Protocol::S1ap => self.s1ap_procedure(code as u8)?,
            Protocol::Ngap => self.ngap_procedure(code as u8)?,
            _ => return None,
        };
        self.procedure_for_message(name)
    }

    /// Procedure label a message name maps to, when unambiguous.
    pub fn procedure_for_message(&self, message_name: &str) -> Option<&'static str> {
        self.procedure_of_message.get(message_name).copied()
    }

    /// Expected message sequence of a procedure.
    pub fn expected_flow(&self, label: &str) -> Option<&FlowTemplate> {
        self.flows.get(label)
    }

    /// Whether `message_name` explicitly releases its session.
    pub fn is_release(&self, message_name: &str) -> bool {
        self.release_messages.contains(message_name)
            // RAN outcome suffixes keep the release semantics.
            || message_name
                .strip_suffix("-Success")
                .is_some_and(|base| self.release_messages.contains(base))
    }

    /// Suggested diagnostic for an SLA issue on `procedure`.
    pub fn diagnosis_of(&self, procedure: &str) -> Option<&Diagnosis> {
        self.diagnoses.get(procedure)
    }
}

impl Default for Dictionary {
    fn default() -> Self {
        Self::new()
    }
}
