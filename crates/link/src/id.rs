// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Process-unique supervisor identities, used only for log correlation.

/// Return a `<kind>-<8 hex chars>` identifier, e.g. `conn-9f21ab04`.
pub fn correlation_id(kind: &str) -> String {
    let uuid = uuid::Uuid::new_v4().simple().to_string();
    let short = uuid.get(..8).unwrap_or(&uuid);
    format!("{kind}-{short}")
}
