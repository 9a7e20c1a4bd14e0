//! excavlink: data plane between an excavator operator station and the machine
//!
//! ```text
//! operator                                          machine
//! gamepads ─► controller ─► session ═══ data ═══► session ─► mailbox ─► publisher ─► bus
//!                              ▲                      │
//!                              └──── acks, telemetry ─┘
//! ```
//!
//! Both sides report into a [`status::StatusBoard`] that presentation code
//! renders.

pub mod config;
pub mod controller;
pub mod frame;
pub mod mapping;
pub mod mqtt;
pub mod publisher;
pub mod session;
pub mod status;
