//! Mock implementations for testing.
//!
//! Provides deterministic, reproducible behavior for automated CI testing.

use crate::error::{PortError, PortResult, Result};
use crate::traits::{Port, RandomSource};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

/// Deterministic random source.
///
/// Replays a fixed byte pattern, wrapping around when exhausted.
///
/// # Example
///
/// ```
/// use cmem_platform::mock::SequenceRandom;
/// use cmem_platform::RandomSource;
///
/// let mut random = SequenceRandom::new(vec![1, 2, 3]);
/// let mut buf = [0u8; 5];
/// random.fill_bytes(&mut buf).unwrap();
/// assert_eq!(buf, [1, 2, 3, 1, 2]);
/// ```
#[derive(Debug, Clone)]
pub struct SequenceRandom {
    pattern: Vec<u8>,
    position: usize,
}

impl SequenceRandom {
    /// Creates a source replaying `pattern`.
    ///
    /// An empty pattern yields zero bytes.
    pub fn new(pattern: Vec<u8>) -> Self {
        Self {
            pattern,
            position: 0,
        }
    }

    /// Creates a source counting upwards from `start`.
    pub fn counting(start: u8) -> Self {
        Self::new((0..=255u8).map(|i| i.wrapping_add(start)).collect())
    }
}

impl RandomSource for SequenceRandom {
    fn fill_bytes(&mut self, dest: &mut [u8]) -> Result<()> {
        if self.pattern.is_empty() {
            dest.fill(0);
            return Ok(());
        }
        for byte in dest.iter_mut() {
            *byte = self.pattern[self.position % self.pattern.len()];
            self.position = self.position.wrapping_add(1);
        }
        Ok(())
    }
}

#[derive(Default)]
struct Script {
    responses: VecDeque<PortResult<Vec<u8>>>,
    send_failures: VecDeque<PortError>,
    sent: Vec<Vec<u8>>,
    busy: bool,
}

/// Scripted port for testing.
///
/// Replays queued responses and records every frame sent. Clones share the
/// same script, so a test can keep a handle after moving the port into a
/// session.
///
/// # Example
///
/// ```
/// use cmem_platform::mock::ScriptedPort;
/// use cmem_platform::Port;
///
/// let handle = ScriptedPort::new();
/// let mut port = handle.clone();
/// handle.push_response(vec![0xAA, 0xBB]);
///
/// port.send(&[0xB6, 0x00, 0x00, 0x02]).unwrap();
/// assert_eq!(port.receive(2).unwrap(), vec![0xAA, 0xBB]);
/// assert_eq!(handle.sent(), vec![vec![0xB6, 0x00, 0x00, 0x02]]);
/// ```
#[derive(Clone, Default)]
pub struct ScriptedPort {
    script: Arc<Mutex<Script>>,
}

impl ScriptedPort {
    /// Creates an empty script.
    pub fn new() -> Self {
        Self::default()
    }

    fn script(&self) -> MutexGuard<'_, Script> {
        self.script.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Queues response bytes for the next `receive`.
    pub fn push_response(&self, bytes: Vec<u8>) {
        self.script().responses.push_back(Ok(bytes));
    }

    /// Queues a failure for the next `receive`.
    pub fn push_receive_error(&self, error: PortError) {
        self.script().responses.push_back(Err(error));
    }

    /// Makes the next `send` fail with `error`.
    pub fn push_send_error(&self, error: PortError) {
        self.script().send_failures.push_back(error);
    }

    /// Keeps the device busy so `wait_ready` times out.
    pub fn set_busy(&self, busy: bool) {
        self.script().busy = busy;
    }

    /// Every frame sent so far, failed attempts included.
    pub fn sent(&self) -> Vec<Vec<u8>> {
        self.script().sent.clone()
    }

    /// Number of frames sent so far.
    pub fn send_count(&self) -> usize {
        self.script().sent.len()
    }

    /// Number of queued responses not yet consumed.
    pub fn pending_responses(&self) -> usize {
        self.script().responses.len()
    }
}

impl Port for ScriptedPort {
    fn send(&mut self, frame: &[u8]) -> PortResult<()> {
        let mut script = self.script();
        script.sent.push(frame.to_vec());
        match script.send_failures.pop_front() {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }

    fn receive(&mut self, count: usize) -> PortResult<Vec<u8>> {
        let next = self.script().responses.pop_front();
        match next {
            Some(Ok(mut bytes)) => {
                if bytes.len() < count {
                    return Err(PortError::Short {
                        expected: count,
                        actual: bytes.len(),
                    });
                }
                bytes.truncate(count);
                Ok(bytes)
            }
            Some(Err(error)) => Err(error),
            None => Err(PortError::Short {
                expected: count,
                actual: 0,
            }),
        }
    }

    fn wait_ready(&mut self, _timeout: Duration) -> bool {
        !self.script().busy
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sequence_random_wraps() {
        let mut random = SequenceRandom::new(vec![7, 8]);
        let mut buf = [0u8; 5];
        random.fill_bytes(&mut buf).unwrap();
        assert_eq!(buf, [7, 8, 7, 8, 7]);
    }

    #[test]
    fn test_sequence_random_continues_between_calls() {
        let mut random = SequenceRandom::counting(0x10);
        let mut a = [0u8; 2];
        let mut b = [0u8; 2];
        random.fill_bytes(&mut a).unwrap();
        random.fill_bytes(&mut b).unwrap();
        assert_eq!(a, [0x10, 0x11]);
        assert_eq!(b, [0x12, 0x13]);
    }

    #[test]
    fn test_sequence_random_empty_pattern_yields_zeros() {
        let mut random = SequenceRandom::new(Vec::new());
        let mut buf = [0xFFu8; 3];
        random.fill_bytes(&mut buf).unwrap();
        assert_eq!(buf, [0, 0, 0]);
    }

    #[test]
    fn test_scripted_port_short_response() {
        let mut port = ScriptedPort::new();
        port.push_response(vec![1]);
        assert_eq!(
            port.receive(2),
            Err(PortError::Short {
                expected: 2,
                actual: 1
            })
        );
    }

    #[test]
    fn test_scripted_port_empty_script_is_short() {
        let mut port = ScriptedPort::new();
        assert_eq!(
            port.receive(4),
            Err(PortError::Short {
                expected: 4,
                actual: 0
            })
        );
    }

    #[test]
    fn test_scripted_port_send_failure_is_recorded() {
        let handle = ScriptedPort::new();
        let mut port = handle.clone();
        handle.push_send_error(PortError::Nack);

        assert_eq!(port.send(&[1, 2]), Err(PortError::Nack));
        assert_eq!(port.send(&[3]), Ok(()));
        assert_eq!(handle.send_count(), 2);
    }

    #[test]
    fn test_scripted_port_busy() {
        let mut port = ScriptedPort::new();
        assert!(port.wait_ready(Duration::from_millis(1)));
        port.set_busy(true);
        assert!(!port.wait_ready(Duration::from_millis(1)));
    }
}
