//! Business logic services
//!
//! This module contains the OTA logic separated from HTTP concerns.
//! Services own their state and are shared by reference between handlers.

pub mod checksum;
pub mod devices;
pub mod firmware;
pub mod ota;
pub mod transfer;
