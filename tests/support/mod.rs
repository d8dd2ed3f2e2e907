#![allow(dead_code)]

pub mod harness;
pub mod http_utils;
pub mod logging;
pub mod origin;

pub use harness::*;
pub use http_utils::*;
pub use origin::*;
