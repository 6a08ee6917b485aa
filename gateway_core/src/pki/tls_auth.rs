//! OpenVPN static key used for the tls-auth HMAC firewall.

use rand::RngCore;
use std::fmt::Write as _;

const KEY_BYTES: usize = 256;
const BYTES_PER_LINE: usize = 16;
const BEGIN: &str = "-----BEGIN OpenVPN Static key V1-----";
const END: &str = "-----END OpenVPN Static key V1-----";

/// Generate a 2048 bit key in the `OpenVPN Static key V1` text format.
pub(crate) fn generate() -> String {
    let mut key = [0u8; KEY_BYTES];
    rand::thread_rng().fill_bytes(&mut key);

    let mut out = String::from("#\n# 2048 bit OpenVPN static key\n#\n");
    out.push_str(BEGIN);
    out.push('\n');
    for line in key.chunks(BYTES_PER_LINE) {
        for b in line {
            let _ = write!(out, "{b:02x}");
        }
        out.push('\n');
    }
    out.push_str(END);
    out.push('\n');
    out
}

/// Whether `text` looks like a complete static key.
pub(crate) fn is_valid(text: &str) -> bool {
    let Some(start) = text.find(BEGIN) else {
        return false;
    };
    let Some(end) = text.find(END) else {
        return false;
    };
    if end < start {
        return false;
    }
    let body: String = text[start + BEGIN.len()..end]
        .chars()
        .filter(|c| !c.is_whitespace())
        .collect();
    body.len() == KEY_BYTES * 2 && body.chars().all(|c| c.is_ascii_hexdigit())
}
