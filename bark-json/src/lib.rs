
pub extern crate ark;
pub extern crate bitcoin;

#[macro_use] extern crate serde;

pub mod cli;
pub mod exit;
pub mod primitives;
pub mod serde_utils;

pub use primitives::*;
