// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Packaged 3GPP/IETF code tables.
//!
//! Everything numeric-to-symbolic lives here so the decoders stay free of
//! long match arms. The tables are plain statics; `Dictionary::new` folds
//! them into hash maps once at boot.

use crate::proto::{ident::IdentifierKind, message::Direction, message::Protocol};

/// Diameter command codes: (code, request name, answer name).
pub const DIAMETER_COMMANDS: &[(u32, &str, &str)] = &[
    (257, "CER", "CEA"),
    (280, "DWR", "DWA"),
    (282, "DPR", "DPA"),
    (272, "CCR", "CCA"),
    (265, "AAR", "AAA"),
    (316, "ULR", "ULA"),
    (317, "CLR", "CLA"),
    (318, "AIR", "AIA"),
    (319, "IDR", "IDA"),
    (320, "DSR", "DSA"),
    (321, "PUR", "PUA"),
    (323, "NOR", "NOA"),
];

/// GTPv2-C message types.
pub const GTPV2_MESSAGES: &[(u8, &str, Direction)] = &[
    (1, "EchoRequest", Direction::Request),
    (2, "EchoResponse", Direction::Response),
    (32, "CreateSessionRequest", Direction::Request),
    (33, "CreateSessionResponse", Direction::Response),
    (34, "ModifyBearerRequest", Direction::Request),
    (35, "ModifyBearerResponse", Direction::Response),
    (36, "DeleteSessionRequest", Direction::Request),
    (37, "DeleteSessionResponse", Direction::Response),
    (95, "CreateBearerRequest", Direction::Request),
    (96, "CreateBearerResponse", Direction::Response),
    (99, "DeleteBearerRequest", Direction::Request),
    (100, "DeleteBearerResponse", Direction::Response),
    (170, "ReleaseAccessBearersRequest", Direction::Request),
    (171, "ReleaseAccessBearersResponse", Direction::Response),
    (176, "DownlinkDataNotification", Direction::Notification),
];

/// PFCP message types.
pub const PFCP_MESSAGES: &[(u8, &str, Direction)] = &[
    (1, "HeartbeatRequest", Direction::Request),
    (2, "HeartbeatResponse", Direction::Response),
    (5, "AssociationSetupRequest", Direction::Request),
    (6, "AssociationSetupResponse", Direction::Response),
    (50, "SessionEstablishmentRequest", Direction::Request),
    (51, "SessionEstablishmentResponse", Direction::Response),
    (52, "SessionModificationRequest", Direction::Request),
    (53, "SessionModificationResponse", Direction::Response),
    (54, "SessionDeletionRequest", Direction::Request),
    (55, "SessionDeletionResponse", Direction::Response),
    (56, "SessionReportRequest", Direction::Request),
    (57, "SessionReportResponse", Direction::Response),
];

/// S1AP procedure codes.
pub const S1AP_PROCEDURES: &[(u8, &str)] = &[
    (9, "InitialContextSetup"),
    (10, "Paging"),
    (11, "DownlinkNASTransport"),
    (12, "InitialUEMessage"),
    (13, "UplinkNASTransport"),
    (17, "S1Setup"),
    (21, "UEContextModification"),
    (23, "UEContextRelease"),
];

/// NGAP procedure codes.
pub const NGAP_PROCEDURES: &[(u8, &str)] = &[
    (4, "DownlinkNASTransport"),
    (14, "InitialContextSetup"),
    (15, "InitialUEMessage"),
    (21, "NGSetup"),
    (29, "PDUSessionResourceSetup"),
    (41, "UEContextRelease"),
    (46, "UplinkNASTransport"),
];

/// NAS message names: (protocol discriminator, message type, name).
pub const NAS_MESSAGES: &[(u8, u8, &str)] = &[
    // EPS mobility management (PD 0x07).
    (0x07, 0x41, "AttachRequest"),
    (0x07, 0x42, "AttachAccept"),
    (0x07, 0x43, "AttachComplete"),
    (0x07, 0x44, "AttachReject"),
    (0x07, 0x45, "DetachRequest"),
    (0x07, 0x46, "DetachAccept"),
    (0x07, 0x48, "TrackingAreaUpdateRequest"),
    (0x07, 0x49, "TrackingAreaUpdateAccept"),
    (0x07, 0x4B, "TrackingAreaUpdateReject"),
    (0x07, 0x4E, "ServiceReject"),
    (0x07, 0x55, "IdentityRequest"),
    (0x07, 0x56, "IdentityResponse"),
    // EPS session management (PD 0x02).
    (0x02, 0xC1, "PDNConnectivityRequest"),
    (0x02, 0xC2, "PDNConnectivityReject"),
    (0x02, 0xC5, "PDNDisconnectRequest"),
    // 5GS mobility management (extended PD 0x7E).
    (0x7E, 0x41, "RegistrationRequest"),
    (0x7E, 0x42, "RegistrationAccept"),
    (0x7E, 0x43, "RegistrationComplete"),
    (0x7E, 0x44, "RegistrationReject"),
    (0x7E, 0x45, "DeregistrationRequest"),
    (0x7E, 0x46, "DeregistrationAccept"),
    // 5GS session management (extended PD 0x2E).
    (0x2E, 0xC1, "PDUSessionEstablishmentRequest"),
    (0x2E, 0xC2, "PDUSessionEstablishmentAccept"),
    (0x2E, 0xC3, "PDUSessionEstablishmentReject"),
    (0x2E, 0xD1, "PDUSessionReleaseRequest"),
];

/// SS7 local operation codes:
/// (protocol, opcode, name, identifier kind of the first parameter).
pub const SS7_OPERATIONS: &[(Protocol, i32, &str, Option<IdentifierKind>)] = &[
    (Protocol::Map, 2, "UpdateLocation", Some(IdentifierKind::Imsi)),
    (Protocol::Map, 3, "CancelLocation", Some(IdentifierKind::Imsi)),
    (Protocol::Map, 23, "UpdateGprsLocation", Some(IdentifierKind::Imsi)),
    (Protocol::Map, 45, "SendRoutingInfoForSM", Some(IdentifierKind::Msisdn)),
    (Protocol::Map, 56, "SendAuthenticationInfo", Some(IdentifierKind::Imsi)),
    (Protocol::Map, 66, "ReadyForSM", Some(IdentifierKind::Imsi)),
    (Protocol::Map, 67, "PurgeMS", Some(IdentifierKind::Imsi)),
    (Protocol::Cap, 0, "InitialDP", None),
    (Protocol::Cap, 17, "RequestReportBCSMEvent", None),
    (Protocol::Cap, 23, "Continue", None),
    (Protocol::Cap, 35, "ApplyCharging", None),
    (Protocol::Inap, 16, "AnalysedInformation", None),
    (Protocol::Inap, 24, "ReleaseCall", None),
];

/// Vendor AVP definitions: (vendor id, code, name).
pub const VENDOR_AVPS: &[(u32, u32, &str)] = &[
    (10415, 701, "MSISDN"),
    (10415, 1400, "Subscription-Data"),
    (10415, 1405, "ULR-Flags"),
    (10415, 1406, "ULA-Flags"),
    (10415, 1407, "Visited-PLMN-Id"),
    (10415, 1408, "Requested-EUTRAN-Authentication-Info"),
    (10415, 1032, "RAT-Type"),
    (10415, 628, "Supported-Features"),
];

/// Cause / error texts: (protocol, numeric code, human text).
pub const ERROR_TEXTS: &[(Protocol, u32, &str)] = &[
    // Diameter result codes.
    (Protocol::Diameter, 3001, "DIAMETER_COMMAND_UNSUPPORTED"),
    (Protocol::Diameter, 3002, "DIAMETER_UNABLE_TO_DELIVER"),
    (Protocol::Diameter, 3004, "DIAMETER_TOO_BUSY"),
    (Protocol::Diameter, 4001, "DIAMETER_AUTHENTICATION_REJECTED"),
    (Protocol::Diameter, 5001, "DIAMETER_ERROR_USER_UNKNOWN"),
    (Protocol::Diameter, 5003, "DIAMETER_AUTHORIZATION_REJECTED"),
    (Protocol::Diameter, 5004, "DIAMETER_ERROR_ROAMING_NOT_ALLOWED"),
    (Protocol::Diameter, 5012, "DIAMETER_UNABLE_TO_COMPLY"),
    (Protocol::Diameter, 5420, "DIAMETER_ERROR_UNKNOWN_EPS_SUBSCRIPTION"),
    (Protocol::Diameter, 5421, "DIAMETER_ERROR_RAT_NOT_ALLOWED"),
    // GTPv2 cause values.
    (Protocol::Gtpv2C, 64, "Context not found"),
    (Protocol::Gtpv2C, 66, "Invalid message format"),
    (Protocol::Gtpv2C, 68, "Service not supported"),
    (Protocol::Gtpv2C, 72, "System failure"),
    (Protocol::Gtpv2C, 73, "No resources available"),
    (Protocol::Gtpv2C, 78, "Missing or unknown APN"),
    (Protocol::Gtpv2C, 83, "Preferred PDN type not supported"),
    (Protocol::Gtpv2C, 92, "User authentication failed"),
    (Protocol::Gtpv2C, 94, "Request rejected"),
    // PFCP cause values.
    (Protocol::Pfcp, 64, "Request rejected"),
    (Protocol::Pfcp, 65, "Session context not found"),
    (Protocol::Pfcp, 66, "Mandatory IE missing"),
    (Protocol::Pfcp, 72, "System failure"),
    // EMM causes (NAS).
    (Protocol::Nas, 3, "Illegal UE"),
    (Protocol::Nas, 6, "Illegal ME"),
    (Protocol::Nas, 7, "EPS services not allowed"),
    (Protocol::Nas, 11, "PLMN not allowed"),
    (Protocol::Nas, 12, "Tracking area not allowed"),
    (Protocol::Nas, 15, "No suitable cells in tracking area"),
    (Protocol::Nas, 19, "ESM failure"),
    (Protocol::Nas, 22, "Congestion"),
    // MAP error codes.
    (Protocol::Map, 1, "Unknown subscriber"),
    (Protocol::Map, 8, "Roaming not allowed"),
    (Protocol::Map, 27, "Absent subscriber"),
    (Protocol::Map, 34, "System failure"),
    (Protocol::Map, 35, "Data missing"),
    (Protocol::Map, 36, "Unexpected data value"),
    // HTTP/SBI statuses.
    (Protocol::Http2, 400, "Bad request"),
    (Protocol::Http2, 403, "Forbidden"),
    (Protocol::Http2, 404, "Not found"),
    (Protocol::Http2, 500, "Internal server error"),
    (Protocol::Http2, 503, "Service unavailable"),
];

/// Message name to procedure label, for sessions that have not inferred a
/// procedure yet. Only unambiguous names appear here.
pub const PROCEDURE_OF_MESSAGE: &[(&str, &str)] = &[
    ("ULR", "S6a_UpdateLocation"),
    ("ULA", "S6a_UpdateLocation"),
    ("AIR", "S6a_AuthenticationInformation"),
    ("AIA", "S6a_AuthenticationInformation"),
    ("CLR", "S6a_CancelLocation"),
    ("CLA", "S6a_CancelLocation"),
    ("PUR", "S6a_Purge"),
    ("PUA", "S6a_Purge"),
    ("AttachRequest", "4G_Attach"),
    ("AttachAccept", "4G_Attach"),
    ("AttachReject", "4G_Attach"),
    ("DetachRequest", "4G_Detach"),
    ("TrackingAreaUpdateRequest", "4G_TrackingAreaUpdate"),
    ("CreateSessionRequest", "4G_SessionEstablishment"),
    ("CreateSessionResponse", "4G_SessionEstablishment"),
    ("DeleteSessionRequest", "4G_SessionRelease"),
    ("RegistrationRequest", "5G_Registration"),
    ("RegistrationAccept", "5G_Registration"),
    ("RegistrationReject", "5G_Registration"),
    ("DeregistrationRequest", "5G_Deregistration"),
    ("PDUSessionEstablishmentRequest", "5G_PduSessionEstablishment"),
    ("SessionEstablishmentRequest", "N4_SessionEstablishment"),
    ("SessionEstablishmentResponse", "N4_SessionEstablishment"),
    ("SessionDeletionRequest", "N4_SessionRelease"),
    ("UpdateLocation", "MAP_UpdateLocation"),
    ("UpdateLocation-Result", "MAP_UpdateLocation"),
    ("SendAuthenticationInfo", "MAP_SendAuthenticationInfo"),
    ("SendAuthenticationInfo-Result", "MAP_SendAuthenticationInfo"),
    ("InitialDP", "CAMEL_InitialDP"),
    ("POST nsmf-pdusession", "5G_PduSessionEstablishment"),
    ("POST namf-comm", "5G_Registration"),
];

/// Messages that explicitly release a session regardless of procedure.
pub const RELEASE_MESSAGES: &[&str] = &[
    "DetachRequest",
    "DeleteSessionRequest",
    "PDNDisconnectRequest",
    "DeregistrationRequest",
    "PDUSessionReleaseRequest",
    "SessionDeletionRequest",
    "UEContextRelease",
];

/// Suggested diagnostics attached to SLA issues:
/// (procedure label, standard reference, likely causes).
pub const DIAGNOSES: &[(&str, &str, &str)] = &[
    (
        "S6a_UpdateLocation",
        "3GPP TS 29.272 § 7.3",
        "subscriber missing in HSS, roaming restriction, ULR-Flags mismatch",
    ),
    (
        "S6a_AuthenticationInformation",
        "3GPP TS 29.272 § 7.3",
        "authentication vector exhaustion, HSS overload",
    ),
    (
        "4G_Attach",
        "3GPP TS 23.401 § 5.3.2",
        "HSS unreachable, APN misconfiguration, radio congestion",
    ),
    (
        "4G_SessionEstablishment",
        "3GPP TS 29.274 § 7.2",
        "missing APN, PGW resource exhaustion, PDN type mismatch",
    ),
    (
        "5G_Registration",
        "3GPP TS 23.502 § 4.2.2",
        "AMF/UDM connectivity, slice unavailability, SUCI scheme mismatch",
    ),
    (
        "N4_SessionEstablishment",
        "3GPP TS 29.244 § 6.2",
        "UPF resource exhaustion, PDR/FAR rule rejection",
    ),
    (
        "MAP_UpdateLocation",
        "3GPP TS 29.002 § 8.1",
        "unknown subscriber in HLR, VLR roaming restriction",
    ),
];
