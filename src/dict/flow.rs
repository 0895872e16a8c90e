// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Expected-flow templates and conformance scoring.
//!
//! A template is the ordered message sequence a procedure is supposed to
//! produce. The conformance analyser compares an observed session against
//! it: a missing mandatory step, an extra step, or a mandatory step out of
//! order each count one deviation.

use serde::Serialize;

use crate::proto::message::ElementRole;

/// One step of an expected procedure flow.
#[derive(Debug, Clone, Copy)]
pub struct FlowStep {
    pub from: ElementRole,
    pub to: ElementRole,
    pub message: &'static str,
    pub mandatory: bool,
    /// A terminal step completes the procedure; its outcome becomes the
    /// session outcome.
    pub terminal: bool,
}

const fn step(
    from: ElementRole,
    to: ElementRole,
    message: &'static str,
    mandatory: bool,
    terminal: bool,
) -> FlowStep {
    FlowStep {
        from,
        to,
        message,
        mandatory,
        terminal,
    }
}

/// The expected message sequence of one procedure.
#[derive(Debug, Clone)]
pub struct FlowTemplate {
    pub label: &'static str,
    pub steps: &'static [FlowStep],
}

impl FlowTemplate {
    pub fn is_terminal(&self, message_name: &str) -> bool {
        self.steps
            .iter()
            .any(|s| s.terminal && s.message == message_name)
    }

    pub fn is_mandatory(&self, message_name: &str) -> bool {
        self.steps
            .iter()
            .any(|s| s.mandatory && s.message == message_name)
    }

    /// Scores an observed message-name sequence against this template.
    pub fn score(&self, observed: &[String]) -> FlowScore {
        let mut missing_mandatory = Vec::new();
        let mut out_of_order = 0u32;

        // Mandatory steps must appear in template order; track the position
        // of the previous hit to spot inversions.
        let mut last_pos: Option<usize> = None;
        for s in self.steps.iter().filter(|s| s.mandatory) {
            match observed.iter().position(|o| o == s.message) {
                Some(pos) => {
                    if let Some(prev) = last_pos
                        && pos < prev
                    {
                        out_of_order += 1;
                    }
                    last_pos = Some(pos);
                },
                None => missing_mandatory.push(s.message),
            }
        }

        let extra: Vec<String> = observed
            .iter()
            .filter(|o| !self.steps.iter().any(|s| s.message == o.as_str()))
            .cloned()
            .collect();

        let deviations =
            missing_mandatory.len() as u32 + extra.len() as u32 + out_of_order;
        FlowScore {
            deviations,
            missing_mandatory,
            extra,
            out_of_order,
        }
    }
}

/// Result of a conformance comparison.
#[derive(Debug, Clone, Serialize)]
pub struct FlowScore {
    pub deviations: u32,
    pub missing_mandatory: Vec<&'static str>,
    pub extra: Vec<String>,
    pub out_of_order: u32,
}

use ElementRole::{Amf, Enb, Gnb, Hlr, Hss, Mme, Msc, Sgw, Smf, Upf};

pub const FLOWS: &[FlowTemplate] = &[
    FlowTemplate {
        label: "S6a_UpdateLocation",
        steps: &[
            step(Mme, Hss, "ULR", true, false),
            step(Hss, Mme, "ULA", true, true),
        ],
    },
    FlowTemplate {
        label: "S6a_AuthenticationInformation",
        steps: &[
            step(Mme, Hss, "AIR", true, false),
            step(Hss, Mme, "AIA", true, true),
        ],
    },
    FlowTemplate {
        label: "S6a_CancelLocation",
        steps: &[
            step(Hss, Mme, "CLR", true, false),
            step(Mme, Hss, "CLA", true, true),
        ],
    },
    FlowTemplate {
        label: "4G_Attach",
        steps: &[
            step(Enb, Mme, "InitialUEMessage", false, false),
            step(Enb, Mme, "AttachRequest", true, false),
            step(Mme, Hss, "ULR", false, false),
            step(Hss, Mme, "ULA", false, false),
            step(Mme, Sgw, "CreateSessionRequest", true, false),
            step(Sgw, Mme, "CreateSessionResponse", true, true),
            step(Mme, Enb, "AttachAccept", false, true),
            step(Mme, Enb, "AttachReject", false, true),
        ],
    },
    FlowTemplate {
        label: "4G_Detach",
        steps: &[
            step(Enb, Mme, "DetachRequest", true, false),
            step(Mme, Enb, "DetachAccept", false, true),
        ],
    },
    FlowTemplate {
        label: "4G_SessionEstablishment",
        steps: &[
            step(Mme, Sgw, "CreateSessionRequest", true, false),
            step(Sgw, Mme, "CreateSessionResponse", true, true),
        ],
    },
    FlowTemplate {
        label: "4G_SessionRelease",
        steps: &[
            step(Mme, Sgw, "DeleteSessionRequest", true, false),
            step(Sgw, Mme, "DeleteSessionResponse", true, true),
        ],
    },
    FlowTemplate {
        label: "5G_Registration",
        steps: &[
            step(Gnb, Amf, "InitialUEMessage", false, false),
            step(Gnb, Amf, "RegistrationRequest", true, false),
            step(Amf, Gnb, "RegistrationAccept", true, true),
            step(Amf, Gnb, "RegistrationReject", false, true),
        ],
    },
    FlowTemplate {
        label: "5G_Deregistration",
        steps: &[
            step(Gnb, Amf, "DeregistrationRequest", true, false),
            step(Amf, Gnb, "DeregistrationAccept", false, true),
        ],
    },
    FlowTemplate {
        label: "5G_PduSessionEstablishment",
        steps: &[
            step(Amf, Smf, "PDUSessionEstablishmentRequest", true, false),
            step(Smf, Upf, "SessionEstablishmentRequest", false, false),
            step(Upf, Smf, "SessionEstablishmentResponse", false, false),
            step(Smf, Amf, "PDUSessionEstablishmentAccept", true, true),
            step(Smf, Amf, "PDUSessionEstablishmentReject", false, true),
        ],
    },
    FlowTemplate {
        label: "N4_SessionEstablishment",
        steps: &[
            step(Smf, Upf, "SessionEstablishmentRequest", true, false),
            step(Upf, Smf, "SessionEstablishmentResponse", true, true),
        ],
    },
    FlowTemplate {
        label: "N4_SessionRelease",
        steps: &[
            step(Smf, Upf, "SessionDeletionRequest", true, false),
            step(Upf, Smf, "SessionDeletionResponse", true, true),
        ],
    },
    FlowTemplate {
        label: "MAP_UpdateLocation",
        steps: &[
            step(Msc, Hlr, "UpdateLocation", true, false),
            step(Hlr, Msc, "UpdateLocation-Result", true, true),
        ],
    },
    FlowTemplate {
        label: "MAP_SendAuthenticationInfo",
        steps: &[
            step(Msc, Hlr, "SendAuthenticationInfo", true, false),
            step(Hlr, Msc, "SendAuthenticationInfo-Result", true, true),
        ],
    },
];
