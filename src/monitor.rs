//! Input monitoring requests

use crate::error::Result;
use crate::port::{PortFlags, PortId, PortRegistry};

/// Move the port's monitor counter up (`on`) or down, never below zero.
///
/// Ports without [`PortFlags::CAN_MONITOR`] ignore requests.
pub(crate) fn request_monitor(ports: &mut PortRegistry, port: PortId, on: bool) -> Result<()> {
    let port = ports.get_mut(port)?;
    if !port.flags().contains(PortFlags::CAN_MONITOR) {
        return Ok(());
    }
    port.monitor_requests = if on {
        port.monitor_requests.saturating_add(1)
    } else {
        port.monitor_requests.saturating_sub(1)
    };
    Ok(())
}

/// Like [`request_monitor`], but only when it changes whether the port is
/// monitoring: turning on from zero requests, or off from exactly one.
pub(crate) fn ensure_monitor(ports: &mut PortRegistry, port: PortId, on: bool) -> Result<()> {
    let requests = ports.get(port)?.monitor_requests;
    match (on, requests) {
        (true, 0) | (false, 1) => request_monitor(ports, port, on),
        _ => Ok(()),
    }
}

pub(crate) fn monitoring(ports: &PortRegistry, port: PortId) -> Result<bool> {
    Ok(ports.get(port)?.monitor_requests > 0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::ClientId;
    use crate::port::DEFAULT_AUDIO_TYPE;

    fn registry(flags: PortFlags) -> (PortRegistry, PortId) {
        let mut ports = PortRegistry::new(4);
        let id = ports
            .register(ClientId::from_raw(0), "hw", "capture_1", DEFAULT_AUDIO_TYPE, flags, 0)
            .unwrap();
        (ports, id)
    }

    #[test]
    fn test_requests_are_counted() {
        let (mut ports, p) = registry(PortFlags::IS_OUTPUT | PortFlags::CAN_MONITOR);
        request_monitor(&mut ports, p, true).unwrap();
        request_monitor(&mut ports, p, true).unwrap();
        request_monitor(&mut ports, p, false).unwrap();
        assert!(monitoring(&ports, p).unwrap());
        request_monitor(&mut ports, p, false).unwrap();
        request_monitor(&mut ports, p, false).unwrap();
        assert!(!monitoring(&ports, p).unwrap());
        request_monitor(&mut ports, p, true).unwrap();
        assert!(monitoring(&ports, p).unwrap());
    }

    #[test]
    fn test_ensure_only_flips_state() {
        let (mut ports, p) = registry(PortFlags::IS_OUTPUT | PortFlags::CAN_MONITOR);
        ensure_monitor(&mut ports, p, true).unwrap();
        ensure_monitor(&mut ports, p, true).unwrap();
        assert_eq!(ports.get(p).unwrap().monitor_requests, 1);
        ensure_monitor(&mut ports, p, false).unwrap();
        assert!(!monitoring(&ports, p).unwrap());

        request_monitor(&mut ports, p, true).unwrap();
        request_monitor(&mut ports, p, true).unwrap();
        // two outstanding requests: ensure(off) leaves them alone
        ensure_monitor(&mut ports, p, false).unwrap();
        assert_eq!(ports.get(p).unwrap().monitor_requests, 2);
    }

    #[test]
    fn test_ports_without_capability_ignore_requests() {
        let (mut ports, p) = registry(PortFlags::IS_OUTPUT);
        request_monitor(&mut ports, p, true).unwrap();
        ensure_monitor(&mut ports, p, true).unwrap();
        assert!(!monitoring(&ports, p).unwrap());
    }
}
