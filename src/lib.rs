//! Decrypt, decode and replay captured LoRaWAN uplink logs.
//!
//! A log is scanned into validated [`udp::protocol::UplinkRecord`]s, which
//! are then either decrypted and decoded ([`decode::DecodeOrchestrator`]) or
//! sent back out as Semtech PUSH_DATA packets ([`replay::ReplayJobManager`]).

pub mod config;
pub mod decode;
pub mod decoder;
pub mod error;
pub mod export;
pub mod generator;
pub mod lorawan;
pub mod replay;
pub mod scan;
pub mod store;
pub mod udp;
