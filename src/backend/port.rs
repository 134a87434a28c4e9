use std::net::{Ipv4Addr, TcpListener};

/// Ask the OS for a free loopback port.
///
/// The listener is dropped before returning, so another process could grab the port before
/// the backend binds it. That shows up as a readiness failure and is not guarded against.
pub fn allocate() -> std::io::Result<u16> {
    let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0))?;
    Ok(listener.local_addr()?.port())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocated_port_is_bindable() {
        let port = allocate().unwrap();
        assert_ne!(port, 0);
        TcpListener::bind((Ipv4Addr::LOCALHOST, port)).unwrap();
    }
}
