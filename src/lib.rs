#![cfg_attr(not(any(test, feature = "std")), no_std)]

#[macro_use]
mod macros;

pub mod config;
pub mod error;
pub mod packet;

#[cfg(feature = "std")]
pub mod device;
#[cfg(feature = "std")]
pub mod server;
#[cfg(feature = "std")]
pub mod socket;
#[cfg(feature = "std")]
pub mod storage;
#[cfg(feature = "std")]
pub mod transfer;
