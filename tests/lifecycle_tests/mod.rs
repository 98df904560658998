//! Stories about how a datacenter's CA comes up, stays valid and changes
//!
//! # Test Organization
//!
//! - `primary_initialize`: the primary brings up its root and signer, and
//!   never commits roots ahead of the backend state behind them
//! - `secondary_initialize`: a secondary datacenter obtains its intermediate
//!   from the primary, in order and with a single durable write
//! - `exclusivity`: lifecycle operations reject each other instead of
//!   interleaving
//! - `renewal`: when intermediate renewal does and does not happen
//! - `signing`: leaf issuance refuses expired signers
//! - `rotation`: configuration changes that rotate the root, and the
//!   compare-and-set race between two writers
//! - `multi_datacenter`: a real primary and secondary wired together
//!   through the in-process transport

mod multi_datacenter;
mod renewal;
mod rotation;
mod secondary_initialize;
mod signing;
