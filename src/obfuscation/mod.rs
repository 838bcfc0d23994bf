//! Traffic obfuscation layer
//!
//! Provides:
//! - Browser ClientHello templates (Chrome, Firefox, Safari)
//! - GREASE value selection
//! - JA3 fingerprint computation for self-checks
//!
//! ## Critical for Censorship Evasion
//!
//! The first packet of every tunnel connection is a ClientHello. Censors
//! classify it by cipher suite order, extension order, supported groups and
//! total length, so each template reproduces those exactly and pads the
//! message to a fixed size regardless of the SNI it carries.

mod fingerprint;
mod grease;

pub use fingerprint::{
    BrowserProfile, ClientHelloFields, FingerprintError, Ja3Components, MAX_SNI_LEN,
};
pub use grease::{grease, is_grease, GREASE_VALUES};
