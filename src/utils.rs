// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::fmt::Write;

use rand::RngExt;

/// Generates an opaque message id: 8 random bytes as lowercase hex with an
/// `m-` prefix.
pub fn generate_message_id() -> String {
    random_id('m')
}

/// Generates a session id with the same shape under an `s-` prefix.
pub fn generate_session_id() -> String {
    random_id('s')
}

fn random_id(prefix: char) -> String {
    let mut raw = [0u8; 8];
    rand::rng().fill(&mut raw);

    let mut out = String::with_capacity(18);
    out.push(prefix);
    out.push('-');
    for byte in &raw {
        write!(&mut out, "{byte:02x}").expect("Writing to String cannot fail");
    }
    out
}

/// Decodes TBCD-coded digits (swapped nibbles, 0xF filler) into a decimal
/// string. Used for IMSI/MSISDN/IMEI fields across GTP, NAS, MAP and the
/// 3GPP Diameter AVPs.
pub fn decode_tbcd(data: &[u8]) -> String {
    let mut out = String::with_capacity(data.len() * 2);
    for &byte in data {
        let lo = byte & 0x0F;
        let hi = byte >> 4;
        if lo <= 9 {
            out.push(char::from(b'0' + lo));
        } else {
            break;
        }
        if hi <= 9 {
            out.push(char::from(b'0' + hi));
        }
        // 0xF in the high nibble pads an odd digit count.
    }
    out
}
