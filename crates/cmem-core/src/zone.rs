//! Zone access control.
//!
//! User zone accesses target the zone chosen by the last
//! [`Session::select_user_zone`]. In an authenticated session every write is
//! staged by the device until its checksum arrives; the `begin_*` methods
//! return a [`PendingWrite`] guard for that step, the plain methods complete
//! it in the same call.

use crate::command::Command;
use crate::session::{PendingWrite, Session, ZoneSelection};
use crate::{Error, Result};
use cmem_platform::{Port, RandomSource};
use tracing::{debug, warn};

/// Largest configuration write.
pub const MAX_CONFIG_WRITE: usize = 16;
/// Largest write with anti-tearing enabled.
pub const MAX_ANTI_TEARING_WRITE: usize = 8;

/// Configuration memory size.
const CONFIG_SIZE: usize = 0x100;

impl<P: Port, R: RandomSource> Session<P, R> {
    /// Select the user zone for following user zone accesses.
    ///
    /// # Errors
    ///
    /// `Error::InvalidUserZone` if the device has no such zone.
    pub fn select_user_zone(&mut self, zone: u8, anti_tearing: bool) -> Result<()> {
        if zone >= self.device_type().zone_count() {
            return Err(Error::InvalidUserZone(zone));
        }
        self.exchange(&Command::SetUserZone { zone, anti_tearing })?;
        self.set_zone(ZoneSelection { zone, anti_tearing });
        debug!(address = self.address().get(), zone, anti_tearing, "user zone selected");
        Ok(())
    }

    /// Write to the selected user zone and complete the checksum exchange.
    pub fn write_user_zone(&mut self, offset: u16, data: &[u8]) -> Result<()> {
        self.begin_user_write(offset, data)?.commit(None)
    }

    /// Write to the selected user zone, leaving the checksum to the caller.
    ///
    /// # Errors
    ///
    /// - `Error::NoZoneSelected` before any zone selection
    /// - `Error::InvalidWriteLength` if `data` is empty, exceeds one page
    ///   (8 bytes with anti-tearing), crosses a page boundary or runs past the
    ///   end of the zone
    pub fn begin_user_write(&mut self, offset: u16, data: &[u8]) -> Result<PendingWrite<'_, P, R>> {
        let selection = self.selected_zone().ok_or(Error::NoZoneSelected)?;
        let page = self.device_type().page_size();
        let limit = if selection.anti_tearing {
            MAX_ANTI_TEARING_WRITE
        } else {
            page
        };
        // The device wraps inside the page, so a crossing write would
        // overwrite the start of the page.
        if data.is_empty()
            || data.len() > limit
            || offset as usize % page + data.len() > page
            || offset as usize + data.len() > self.device_type().zone_size()
        {
            return Err(Error::InvalidWriteLength(data.len()));
        }

        self.exchange(&Command::WriteUserZone {
            address: offset,
            data: data.to_vec(),
        })?;
        self.record_write(data);
        Ok(PendingWrite::new(self))
    }

    /// Read from the selected user zone.
    ///
    /// # Errors
    ///
    /// - `Error::NoZoneSelected` before any zone selection
    /// - `Error::InvalidReadLength` if `count` is zero or runs past the zone
    pub fn read_user_zone(&mut self, offset: u16, count: u8) -> Result<Vec<u8>> {
        self.selected_zone().ok_or(Error::NoZoneSelected)?;
        if count == 0 || offset as usize + count as usize > self.device_type().zone_size() {
            return Err(Error::InvalidReadLength(count as usize));
        }
        self.exchange(&Command::ReadUserZone {
            address: offset,
            count,
        })
    }

    /// Write configuration memory and complete the checksum exchange.
    pub fn write_config_zone(&mut self, address: u8, data: &[u8], anti_tearing: bool) -> Result<()> {
        self.begin_config_write(address, data, anti_tearing)?
            .commit(None)
    }

    /// Write configuration memory, leaving the checksum to the caller.
    ///
    /// # Errors
    ///
    /// - `Error::InvalidWriteLength` if `data` is empty, longer than 16 bytes
    ///   (8 with anti-tearing) or runs past the end of configuration memory
    /// - `Error::ZoneLocked` if a known blown fuse locks any target byte;
    ///   nothing is sent
    pub fn begin_config_write(
        &mut self,
        address: u8,
        data: &[u8],
        anti_tearing: bool,
    ) -> Result<PendingWrite<'_, P, R>> {
        let limit = if anti_tearing {
            MAX_ANTI_TEARING_WRITE
        } else {
            MAX_CONFIG_WRITE
        };
        if data.is_empty() || data.len() > limit || address as usize + data.len() > CONFIG_SIZE {
            return Err(Error::InvalidWriteLength(data.len()));
        }
        if let Some(locked) = self
            .cached_fuses()
            .and_then(|fuses| fuses.first_locked(address, data.len()))
        {
            warn!(address = self.address().get(), target = locked, "write to fused region refused");
            return Err(Error::ZoneLocked {
                address: locked as u16,
            });
        }

        self.exchange(&Command::WriteConfigZone {
            address,
            data: data.to_vec(),
            anti_tearing,
        })?;
        self.record_write(data);
        Ok(PendingWrite::new(self))
    }

    /// Read configuration memory. Never decrypted.
    ///
    /// # Errors
    ///
    /// `Error::InvalidReadLength` if `count` is zero or runs past the end of
    /// configuration memory.
    pub fn read_config_zone(&mut self, address: u8, count: u8) -> Result<Vec<u8>> {
        if count == 0 || address as usize + count as usize > CONFIG_SIZE {
            return Err(Error::InvalidReadLength(count as usize));
        }
        self.exchange(&Command::ReadConfigZone { address, count })
    }
}

#[cfg(test)]
mod tests {
    use crate::config::SessionConfig;
    use crate::fuse::Fuses;
    use crate::registry::{DeviceAddress, DeviceType};
    use crate::session::Session;
    use crate::Error;
    use cmem_platform::mock::{ScriptedPort, SequenceRandom};

    fn session(device_type: DeviceType) -> (Session<ScriptedPort, SequenceRandom>, ScriptedPort) {
        let handle = ScriptedPort::new();
        let session = Session::new(
            DeviceAddress::DEFAULT,
            device_type,
            handle.clone(),
            SequenceRandom::new(Vec::new()),
            SessionConfig::default(),
        );
        (session, handle)
    }

    #[test]
    fn test_select_zone_validates_count() {
        let (mut session, handle) = session(DeviceType::At88sc0104c);
        assert!(matches!(
            session.select_user_zone(4, false),
            Err(Error::InvalidUserZone(4))
        ));
        assert_eq!(handle.send_count(), 0);

        session.select_user_zone(3, true).unwrap();
        let selection = session.selected_zone().unwrap();
        assert_eq!(selection.zone, 3);
        assert!(selection.anti_tearing);
        assert_eq!(handle.sent()[0], vec![0xB4, 0x0B, 0x03, 0x00]);
    }

    #[test]
    fn test_user_access_requires_zone() {
        let (mut session, handle) = session(DeviceType::At88sc0104c);
        assert!(matches!(
            session.write_user_zone(0, &[1]),
            Err(Error::NoZoneSelected)
        ));
        assert!(matches!(
            session.read_user_zone(0, 1),
            Err(Error::NoZoneSelected)
        ));
        assert_eq!(handle.send_count(), 0);
    }

    #[test]
    fn test_standard_write_sends_no_checksum() {
        let (mut session, handle) = session(DeviceType::At88sc0104c);
        session.select_user_zone(0, false).unwrap();
        session.write_user_zone(0x10, &[0xCA, 0xFE]).unwrap();

        let sent = handle.sent();
        assert_eq!(sent.len(), 2);
        assert_eq!(sent[1], vec![0xB0, 0x00, 0x10, 0x02, 0xCA, 0xFE]);
    }

    #[test]
    fn test_write_length_limits() {
        let (mut session, _handle) = session(DeviceType::At88sc0104c);
        session.select_user_zone(0, true).unwrap();

        assert!(matches!(
            session.write_user_zone(0, &[]),
            Err(Error::InvalidWriteLength(0))
        ));
        assert!(matches!(
            session.write_user_zone(0, &[0; 9]),
            Err(Error::InvalidWriteLength(9))
        ));
        // 32-byte zones
        assert!(matches!(
            session.write_user_zone(30, &[0; 4]),
            Err(Error::InvalidWriteLength(4))
        ));
    }

    #[test]
    fn test_write_cannot_cross_page() {
        let (mut session, handle) = session(DeviceType::At88sc0104c);
        session.select_user_zone(0, false).unwrap();
        let sends = handle.send_count();

        assert!(matches!(
            session.write_user_zone(0x08, &[0xAA; 16]),
            Err(Error::InvalidWriteLength(16))
        ));
        assert!(matches!(
            session.write_user_zone(0x0F, &[0xAA; 2]),
            Err(Error::InvalidWriteLength(2))
        ));
        assert_eq!(handle.send_count(), sends);

        session.write_user_zone(0x08, &[0xAA; 8]).unwrap();
        session.write_user_zone(0x10, &[0xAA; 16]).unwrap();
        assert_eq!(&handle.sent()[2][..4], &[0xB0, 0x00, 0x10, 0x10]);
    }

    #[test]
    fn test_read_user_zone() {
        let (mut session, handle) = session(DeviceType::At88sc0808c);
        session.select_user_zone(7, false).unwrap();
        handle.push_response(vec![1, 2, 3, 4]);

        assert_eq!(session.read_user_zone(0x7C, 4).unwrap(), vec![1, 2, 3, 4]);
        assert_eq!(handle.sent()[1], vec![0xB2, 0x00, 0x7C, 0x04]);
        assert!(matches!(
            session.read_user_zone(0x7D, 4),
            Err(Error::InvalidReadLength(4))
        ));
    }

    #[test]
    fn test_config_write_limits() {
        let (mut session, handle) = session(DeviceType::At88sc0104c);
        assert!(matches!(
            session.write_config_zone(0x18, &[0; 17], false),
            Err(Error::InvalidWriteLength(17))
        ));
        assert!(matches!(
            session.write_config_zone(0x18, &[0; 9], true),
            Err(Error::InvalidWriteLength(9))
        ));
        assert!(matches!(
            session.write_config_zone(0xFC, &[0; 8], false),
            Err(Error::InvalidWriteLength(8))
        ));
        assert_eq!(handle.send_count(), 0);

        session.write_config_zone(0x18, &[0x42; 8], true).unwrap();
        assert_eq!(&handle.sent()[0][..4], &[0xB4, 0x08, 0x18, 0x08]);
    }

    #[test]
    fn test_fused_config_region_refused_without_io() {
        let (mut session, handle) = session(DeviceType::At88sc0104c);
        handle.push_response(vec![Fuses::FAB | Fuses::CMA]);
        session.read_fuse().unwrap();
        let sends = handle.send_count();

        let err = session
            .write_config_zone(0x08, &[0xAA; 6], false)
            .unwrap_err();
        assert!(matches!(err, Error::ZoneLocked { address: 0x08 }));
        assert_eq!(handle.send_count(), sends);

        session.write_config_zone(0x18, &[0xAA; 2], false).unwrap();
    }

    #[test]
    fn test_read_config_zone_bounds() {
        let (mut session, handle) = session(DeviceType::At88sc0104c);
        assert!(matches!(
            session.read_config_zone(0xF8, 9),
            Err(Error::InvalidReadLength(9))
        ));
        handle.push_response(vec![0x3B; 8]);
        assert_eq!(session.read_config_zone(0x00, 8).unwrap(), vec![0x3B; 8]);
    }

    #[test]
    fn test_write_fuse_rejects_clearing_bits() {
        let (mut session, handle) = session(DeviceType::At88sc0104c);
        handle.push_response(vec![Fuses::SEC]);

        let err = session.write_fuse(0x04).unwrap_err();
        assert!(matches!(
            err,
            Error::InvalidFuseTransition {
                current: 0x08,
                requested: 0x04
            }
        ));
        assert_eq!(handle.send_count(), 1, "only the fuse read went out");

        session.write_fuse(0x0C).unwrap();
        assert_eq!(handle.sent()[1], vec![0xB4, 0x01, 0x0C, 0x00]);
        assert_eq!(session.cached_fuses(), Some(Fuses::from_bits(0x0C)));
        assert!(matches!(
            session.write_fuse(0x10),
            Err(Error::InvalidArgument(_))
        ));
    }
}
