// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use core::fmt;

use serde::{Deserialize, Serialize};

/// Compression applied to closed event/CDR files after rotation.
///
/// `None` leaves rotated files as written; `Gzip` re-writes them through a
/// gzip encoder in a background task so the active writer never stalls.
#[derive(Deserialize, Serialize, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Compression {
    #[serde(rename = "none", alias = "None", alias = "NONE")]
    None,
    #[serde(rename = "gzip", alias = "Gzip", alias = "GZIP")]
    Gzip,
}

impl fmt::Display for Compression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Compression::None => "none",
            Compression::Gzip => "gzip",
        })
    }
}

impl Compression {
    pub fn is_enabled(self) -> bool {
        matches!(self, Compression::Gzip)
    }
}
