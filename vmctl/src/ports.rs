//! Loopback port allocation.
//!
//! Ports are probed by binding and immediately releasing them, so a
//! returned port is free at the time of the call only.

use std::net::{Ipv4Addr, TcpListener};

use crate::{Error, Result};

/// First VNC port (display `:0`).
pub const VNC_BASE: u16 = 5900;

/// Highest VNC port probed (display `:99`).
pub const VNC_LAST: u16 = 5999;

/// Returns an ephemeral loopback port chosen by the OS.
pub fn ephemeral() -> Result<u16> {
    let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0))?;
    Ok(listener.local_addr()?.port())
}

/// Returns the first free loopback port in `first..=last`.
pub fn first_free(first: u16, last: u16) -> Result<u16> {
    (first..=last)
        .find(|&p| TcpListener::bind((Ipv4Addr::LOCALHOST, p)).is_ok())
        .ok_or(Error::PortAllocation(first, last))
}

/// Returns a free VNC port.
pub fn vnc() -> Result<u16> {
    first_free(VNC_BASE, VNC_LAST)
}
