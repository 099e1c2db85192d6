//! Host port selection.
//!
//! The SSH forward port is picked by binding an ephemeral port and releasing
//! it before the hypervisor binds it again, so another process can take the
//! port in between. The VNC display is the first candidate nobody answers on.

use std::net::{Ipv4Addr, SocketAddr, TcpListener, TcpStream};
use std::time::Duration;

use testvm_core::error::{Result, VmError};

const PROBE_TIMEOUT: Duration = Duration::from_millis(200);

/// Pick a free TCP port on the loopback interface.
pub fn free_local_port() -> Result<u16> {
    let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0))
        .map_err(|e| VmError::Other(format!("Failed to allocate a local port: {}", e)))?;
    let port = listener.local_addr()?.port();
    Ok(port)
}

/// True if something accepts connections on `port` on localhost.
pub fn is_port_in_use(port: u16) -> bool {
    let addr = SocketAddr::from((Ipv4Addr::LOCALHOST, port));
    TcpStream::connect_timeout(&addr, PROBE_TIMEOUT).is_ok()
}

/// Find a free VNC display.
///
/// Returns `(display, port)` where `port = base + display`. QEMU takes the
/// display number and adds its own base of 5900.
pub fn find_vnc_display(base: u16, candidates: u16) -> Result<(u16, u16)> {
    find_vnc_display_with(base, candidates, is_port_in_use)
}

fn find_vnc_display_with(
    base: u16,
    candidates: u16,
    in_use: impl Fn(u16) -> bool,
) -> Result<(u16, u16)> {
    for display in 0..candidates {
        let Some(port) = base.checked_add(display) else {
            break;
        };
        if !in_use(port) {
            return Ok((display, port));
        }
    }
    Err(VmError::BootError {
        message: format!(
            "No free VNC port in {}..{}",
            base,
            base.saturating_add(candidates)
        ),
        hint: Some("Stop other VNC servers or VMs on this host".to_string()),
    })
}
