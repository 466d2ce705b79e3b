//! Shared two-wire bus of simulated devices.
//!
//! Every device on a real bus sees every frame and only the addressed one
//! answers. [`SimBus`] keeps that shape: a [`BusPort`] routes each frame by
//! the address it carries, and an address with no device behind it is never
//! acknowledged.

use crate::sim::{SimulatedCompanion, SimulatedCryptoMemory};
use cmem_core::registry::{CompanionAddress, DeviceAddress};
use cmem_core::Endpoint;
use cmem_platform::{Port, PortError, PortResult};
use std::collections::HashMap;
use std::time::Duration;
use tracing::trace;

/// Simulated devices keyed by bus address.
#[derive(Debug, Clone, Default)]
pub struct SimBus {
    devices: HashMap<DeviceAddress, SimulatedCryptoMemory>,
    companions: HashMap<CompanionAddress, SimulatedCompanion>,
}

impl SimBus {
    /// Empty bus.
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach a primary device, replacing any at the same address.
    pub fn attach_device(&mut self, device: SimulatedCryptoMemory) -> &mut Self {
        self.devices.insert(device.address(), device);
        self
    }

    /// Attach a companion chip, replacing any at the same address.
    pub fn attach_companion(&mut self, companion: SimulatedCompanion) -> &mut Self {
        self.companions.insert(companion.address(), companion);
        self
    }

    /// Device at `address`.
    pub fn device(&self, address: DeviceAddress) -> Option<SimulatedCryptoMemory> {
        self.devices.get(&address).cloned()
    }

    /// Companion at `address`.
    pub fn companion(&self, address: CompanionAddress) -> Option<SimulatedCompanion> {
        self.companions.get(&address).cloned()
    }

    /// Port for talking to `endpoint`.
    ///
    /// The port routes by frame content, so it reaches any attached device
    /// of the endpoint's kind.
    pub fn port(&self, endpoint: Endpoint) -> BusPort {
        BusPort {
            bus: self.clone(),
            endpoint,
            selected: None,
        }
    }
}

#[derive(Debug)]
enum Target {
    Device(SimulatedCryptoMemory),
    Companion(SimulatedCompanion),
}

/// [`Port`] onto a [`SimBus`].
#[derive(Debug)]
pub struct BusPort {
    bus: SimBus,
    endpoint: Endpoint,
    selected: Option<Target>,
}

impl BusPort {
    /// Endpoint the port was opened for.
    pub fn endpoint(&self) -> Endpoint {
        self.endpoint
    }

    fn route(&self, frame: &[u8]) -> Option<Target> {
        let first = *frame.first()?;
        match self.endpoint {
            Endpoint::Device(_) => {
                let address = DeviceAddress::new(first >> 4).ok()?;
                self.bus.device(address).map(Target::Device)
            }
            Endpoint::Companion(_) => {
                let address = CompanionAddress::new(first).ok()?;
                self.bus.companion(address).map(Target::Companion)
            }
        }
    }
}

impl Port for BusPort {
    fn send(&mut self, frame: &[u8]) -> PortResult<()> {
        self.selected = self.route(frame);
        trace!(endpoint = ?self.endpoint, len = frame.len(), routed = self.selected.is_some(), "bus frame");
        match self.selected.as_mut() {
            Some(Target::Device(device)) => device.send(frame),
            Some(Target::Companion(companion)) => companion.send(frame),
            None => Err(PortError::Nack),
        }
    }

    fn receive(&mut self, count: usize) -> PortResult<Vec<u8>> {
        match self.selected.as_mut() {
            Some(Target::Device(device)) => device.receive(count),
            Some(Target::Companion(companion)) => companion.receive(count),
            None => Err(PortError::Nack),
        }
    }

    fn wait_ready(&mut self, timeout: Duration) -> bool {
        match self.selected.as_mut() {
            Some(Target::Device(device)) => device.wait_ready(timeout),
            Some(Target::Companion(companion)) => companion.wait_ready(timeout),
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cmem_core::registry::DeviceType;
    use cmem_core::Command;

    #[test]
    fn test_unattached_address_is_not_acknowledged() {
        let mut bus = SimBus::new();
        bus.attach_device(SimulatedCryptoMemory::new(
            DeviceAddress::DEFAULT,
            DeviceType::At88sc0104c,
        ));
        let mut port = bus.port(Endpoint::Device(DeviceAddress::DEFAULT));

        let other = DeviceAddress::new(0x04).unwrap();
        assert_eq!(port.send(&Command::ReadFuse.encode(other)), Err(PortError::Nack));
        assert!(!port.wait_ready(Duration::from_millis(1)));
    }

    #[test]
    fn test_frames_reach_addressed_device() {
        let first = SimulatedCryptoMemory::new(DeviceAddress::DEFAULT, DeviceType::At88sc0104c);
        let second =
            SimulatedCryptoMemory::new(DeviceAddress::new(0x02).unwrap(), DeviceType::At88sc0808c);
        let mut bus = SimBus::new();
        bus.attach_device(first.clone()).attach_device(second.clone());

        let mut port = bus.port(Endpoint::Device(DeviceAddress::DEFAULT));
        port.send(&Command::ReadFuse.encode(DeviceAddress::new(0x02).unwrap()))
            .unwrap();
        assert_eq!(port.receive(1).unwrap(), vec![0x00]);
        assert_eq!(first.frames_received(), 0);
        assert_eq!(second.frames_received(), 1);
    }
}
