//! Minimal collation table: only the handful of ids the handshake and
//! column-definition packets need to mention.

use hashbrown::HashMap;
use std::sync::OnceLock;

pub const UTF8_GENERAL_CI: u16 = 33;
pub const UTF8_MB4_GENERAL_CI: u16 = 45;
pub const DEFAULT_COLLATION_ID: u16 = UTF8_GENERAL_CI;

pub fn collation_names() -> &'static HashMap<&'static str, u16> {
    static NAMES: OnceLock<HashMap<&'static str, u16>> = OnceLock::new();
    NAMES.get_or_init(|| {
        HashMap::from([
            ("latin1_swedish_ci", 8_u16),
            ("utf8_general_ci", UTF8_GENERAL_CI),
            ("utf8mb4_general_ci", UTF8_MB4_GENERAL_CI),
            ("binary", 63_u16),
        ])
    })
}
