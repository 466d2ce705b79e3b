//! Multi-device host.
//!
//! Owns one [`Session`] per configured primary device and one [`Companion`]
//! per companion chip. Each sits behind its own mutex, so exchanges with one
//! device are serialized while different devices proceed independently.

use crate::companion::Companion;
use crate::config::HostConfig;
use crate::registry::{CompanionAddress, DeviceAddress, DeviceRegistry};
use crate::session::Session;
use crate::{Error, Result};
use cmem_platform::{Port, RandomSource};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{info, warn};

/// Bus endpoint a port is opened for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Endpoint {
    /// Primary device.
    Device(DeviceAddress),
    /// Companion chip.
    Companion(CompanionAddress),
}

type Shared<T> = Arc<Mutex<T>>;

/// Host for every configured device.
pub struct Host<P, R> {
    registry: DeviceRegistry,
    sessions: HashMap<DeviceAddress, Shared<Session<P, R>>>,
    companions: HashMap<CompanionAddress, Shared<Companion<P, R>>>,
}

impl<P: Port, R: RandomSource> Host<P, R> {
    /// Build sessions for every device in `config`.
    ///
    /// `connect` opens the port and random source for each endpoint.
    pub fn new<F>(config: &HostConfig, mut connect: F) -> Result<Self>
    where
        F: FnMut(Endpoint) -> (P, R),
    {
        config.validate()?;
        let registry = DeviceRegistry::from_config(config)?;

        let mut sessions = HashMap::new();
        for (address, device_type) in registry.devices() {
            let (port, random) = connect(Endpoint::Device(address));
            let session = Session::new(address, device_type, port, random, config.session.clone());
            sessions.insert(address, Arc::new(Mutex::new(session)));
        }

        let mut companions = HashMap::new();
        for address in registry.companions() {
            let (port, random) = connect(Endpoint::Companion(address));
            let companion = Companion::new(address, port, random, config.session.clone());
            companions.insert(address, Arc::new(Mutex::new(companion)));
        }

        info!(
            devices = sessions.len(),
            companions = companions.len(),
            "host configured"
        );
        Ok(Self {
            registry,
            sessions,
            companions,
        })
    }

    /// Device registry.
    pub fn registry(&self) -> &DeviceRegistry {
        &self.registry
    }

    /// Shared handle to a device session.
    pub fn session(&self, address: DeviceAddress) -> Result<Shared<Session<P, R>>> {
        self.sessions
            .get(&address)
            .cloned()
            .ok_or(Error::UnknownDevice(address.get()))
    }

    /// Shared handle to a companion engine.
    pub fn companion(&self, address: CompanionAddress) -> Result<Shared<Companion<P, R>>> {
        self.companions
            .get(&address)
            .cloned()
            .ok_or(Error::UnknownDevice(address.get()))
    }

    /// Run `f` with exclusive access to a device session.
    ///
    /// # Errors
    ///
    /// - `Error::UnknownDevice` if `address` is not configured
    /// - `Error::Desynchronized` if an earlier operation panicked mid-exchange;
    ///   call [`Host::reset_device`] first
    pub fn with_session<T>(
        &self,
        address: DeviceAddress,
        f: impl FnOnce(&mut Session<P, R>) -> Result<T>,
    ) -> Result<T> {
        let handle = self.session(address)?;
        let mut session = lock(&*handle)?;
        f(&mut session)
    }

    /// Run `f` with exclusive access to a companion engine.
    pub fn with_companion<T>(
        &self,
        address: CompanionAddress,
        f: impl FnOnce(&mut Companion<P, R>) -> Result<T>,
    ) -> Result<T> {
        let handle = self.companion(address)?;
        let mut companion = lock(&*handle)?;
        f(&mut companion)
    }

    /// Put every primary device in Standard mode and refresh each
    /// companion's lock state from its manufacturing id.
    ///
    /// Stops at the first failure.
    pub fn init(&self) -> Result<()> {
        for (address, _) in self.registry.devices() {
            self.with_session(address, |session| session.reset_session())?;
        }
        for address in self.registry.companions() {
            let id = self.with_companion(address, |companion| companion.read_manuf_id())?;
            if id.is_locked() {
                info!(address = address.get(), "companion already locked");
            }
        }
        Ok(())
    }

    /// Recover a device after a panic mid-exchange.
    ///
    /// Clears the poisoned lock and resets the device session.
    pub fn reset_device(&self, address: DeviceAddress) -> Result<()> {
        let handle = self.session(address)?;
        if handle.is_poisoned() {
            warn!(address = address.get(), "recovering poisoned session");
            handle.clear_poison();
        }
        let mut session = lock(&*handle)?;
        session.reset_session()
    }
}

fn lock<T>(handle: &Mutex<T>) -> Result<MutexGuard<'_, T>> {
    handle.lock().map_err(|_| Error::Desynchronized)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{CompanionConfig, DeviceConfig};
    use crate::registry::DeviceType;
    use crate::session::SecurityMode;
    use cmem_platform::mock::{ScriptedPort, SequenceRandom};

    fn config() -> HostConfig {
        HostConfig {
            devices: vec![
                DeviceConfig {
                    address: DeviceAddress::DEFAULT,
                    device_type: DeviceType::At88sc0104c,
                },
                DeviceConfig {
                    address: DeviceAddress::new(0x02).unwrap(),
                    device_type: DeviceType::At88sc1616c,
                },
            ],
            companions: vec![CompanionConfig {
                address: CompanionAddress::new(0xC8).unwrap(),
            }],
            ..HostConfig::default()
        }
    }

    fn host() -> (Host<ScriptedPort, SequenceRandom>, HashMap<Endpoint, ScriptedPort>) {
        let mut ports = HashMap::new();
        let host = Host::new(&config(), |endpoint| {
            let port = ScriptedPort::new();
            ports.insert(endpoint, port.clone());
            (port, SequenceRandom::counting(0))
        })
        .unwrap();
        (host, ports)
    }

    #[test]
    fn test_sessions_follow_config() {
        let (host, ports) = host();
        assert_eq!(ports.len(), 3);

        let device_type = host
            .with_session(DeviceAddress::new(0x02).unwrap(), |s| Ok(s.device_type()))
            .unwrap();
        assert_eq!(device_type, DeviceType::At88sc1616c);
    }

    #[test]
    fn test_unknown_address() {
        let (host, _ports) = host();
        let err = host
            .with_session(DeviceAddress::new(0x05).unwrap(), |_| Ok(()))
            .unwrap_err();
        assert!(matches!(err, Error::UnknownDevice(0x05)));

        let err = host
            .with_companion(CompanionAddress::new(0xA0).unwrap(), |_| Ok(()))
            .unwrap_err();
        assert!(matches!(err, Error::UnknownDevice(0xA0)));
    }

    #[test]
    fn test_init_resets_every_device() {
        let (host, ports) = host();
        host.init().unwrap();

        let default = &ports[&Endpoint::Device(DeviceAddress::DEFAULT)];
        assert_eq!(default.sent(), vec![vec![0xB8, 0x00, 0x00, 0x00]]);
        let second = &ports[&Endpoint::Device(DeviceAddress::new(0x02).unwrap())];
        assert_eq!(second.sent(), vec![vec![0x28, 0x00, 0x00, 0x00]]);
    }

    #[test]
    fn test_poisoned_session_needs_reset() {
        let (host, _ports) = host();
        let address = DeviceAddress::DEFAULT;
        let handle = host.session(address).unwrap();

        let _ = std::thread::spawn(move || {
            let _session = handle.lock().unwrap();
            panic!("exchange interrupted");
        })
        .join();

        let err = host.with_session(address, |_| Ok(())).unwrap_err();
        assert!(matches!(err, Error::Desynchronized));

        host.reset_device(address).unwrap();
        let mode = host.with_session(address, |s| Ok(s.mode())).unwrap();
        assert_eq!(mode, SecurityMode::Standard);
    }

    #[test]
    fn test_invalid_config_rejected() {
        let config = HostConfig {
            devices: Vec::new(),
            companions: Vec::new(),
            ..HostConfig::default()
        };
        let result = Host::new(&config, |_| (ScriptedPort::new(), SequenceRandom::counting(0)));
        assert!(matches!(result, Err(Error::InvalidConfig(_))));
    }
}
