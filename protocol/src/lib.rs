//! Wire types shared by tokenrelay clients and test servers

pub mod api;
pub mod common;
