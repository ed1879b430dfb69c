//! End-to-end tests for the gateway and the embedded daemon.

#[path = "../common/mod.rs"]
mod common;

mod auth;
mod channels;
mod gateway;
mod sftp;
mod terminal;
