//! jsext library
//!
//! This crate provides the pieces of the jsext evaluation server:
//! - Line-delimited JSON framing and the request/response codec
//! - An `Evaluator` trait and its embedded QuickJS implementation
//! - Per-connection sessions sharing one execution context
//! - A TCP listener driving those sessions

pub mod backend;
pub mod config;
pub mod dispatch;
pub mod server;
pub mod session;
pub mod transport;
