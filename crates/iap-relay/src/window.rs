//! Send-side flow control and retransmission buffer
//!
//! Positions are absolute byte offsets into the outbound stream. Everything in
//! `[acked, sent)` is kept until the relay acknowledges it, so it can be
//! replayed after a resumption.

use bytes::Bytes;
use std::collections::VecDeque;
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum WindowError {
    #[error("acknowledgement went backwards: {received} < {acked}")]
    Regressed { received: u64, acked: u64 },

    #[error("acknowledgement beyond bytes sent: {received} > {sent}")]
    BeyondSent { received: u64, sent: u64 },
}

#[derive(Debug)]
pub struct SendWindow {
    capacity: u64,
    sent: u64,
    acked: u64,
    unacked: VecDeque<Bytes>,
}

impl SendWindow {
    /// `capacity` is the window advertised by the relay
    pub fn new(capacity: u64) -> Self {
        Self {
            capacity,
            sent: 0,
            acked: 0,
            unacked: VecDeque::new(),
        }
    }

    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    pub fn sent(&self) -> u64 {
        self.sent
    }

    pub fn acked(&self) -> u64 {
        self.acked
    }

    /// Bytes sent but not yet acknowledged
    pub fn in_flight(&self) -> u64 {
        self.sent - self.acked
    }

    /// Bytes that may be sent before the window is full
    pub fn available(&self) -> u64 {
        self.capacity.saturating_sub(self.in_flight())
    }

    /// Record a chunk as sent. The caller keeps it within `available()`.
    pub fn record_sent(&mut self, chunk: Bytes) {
        debug_assert!(chunk.len() as u64 <= self.available());
        if chunk.is_empty() {
            return;
        }
        self.sent += chunk.len() as u64;
        self.unacked.push_back(chunk);
    }

    /// Apply a cumulative acknowledgement, returning the newly acked count
    pub fn acknowledge(&mut self, received: u64) -> Result<u64, WindowError> {
        if received < self.acked {
            return Err(WindowError::Regressed {
                received,
                acked: self.acked,
            });
        }
        if received > self.sent {
            return Err(WindowError::BeyondSent {
                received,
                sent: self.sent,
            });
        }

        let mut remaining = (received - self.acked) as usize;
        while remaining > 0 {
            let Some(front) = self.unacked.front_mut() else {
                break;
            };
            if front.len() <= remaining {
                remaining -= front.len();
                self.unacked.pop_front();
            } else {
                let _ = front.split_to(remaining);
                remaining = 0;
            }
        }

        let newly = received - self.acked;
        self.acked = received;
        Ok(newly)
    }

    /// Acknowledge what the relay reports after a resumption and return the
    /// bytes to send again, in order
    pub fn resume(&mut self, received: u64) -> Result<Vec<Bytes>, WindowError> {
        self.acknowledge(received)?;
        Ok(self.unacked.iter().cloned().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_window_accounting() {
        let mut window = SendWindow::new(10);
        assert_eq!(window.available(), 10);

        window.record_sent(Bytes::from_static(b"hello"));
        window.record_sent(Bytes::from_static(b"abc"));
        assert_eq!(window.in_flight(), 8);
        assert_eq!(window.available(), 2);

        assert_eq!(window.acknowledge(6).unwrap(), 6);
        assert_eq!(window.acked(), 6);
        assert_eq!(window.available(), 8);

        // Repeating the same ack is fine
        assert_eq!(window.acknowledge(6).unwrap(), 0);
    }

    #[test]
    fn test_regressing_ack_is_rejected() {
        let mut window = SendWindow::new(100);
        window.record_sent(Bytes::from_static(b"0123456789"));
        window.acknowledge(8).unwrap();

        assert_eq!(
            window.acknowledge(4),
            Err(WindowError::Regressed {
                received: 4,
                acked: 8
            })
        );
    }

    #[test]
    fn test_ack_beyond_sent_is_rejected() {
        let mut window = SendWindow::new(100);
        window.record_sent(Bytes::from_static(b"0123"));

        assert_eq!(
            window.acknowledge(5),
            Err(WindowError::BeyondSent {
                received: 5,
                sent: 4
            })
        );
    }

    #[test]
    fn test_resume_returns_unacknowledged_bytes_in_order() {
        let mut window = SendWindow::new(100);
        window.record_sent(Bytes::from_static(b"abcd"));
        window.record_sent(Bytes::from_static(b"efgh"));
        window.record_sent(Bytes::from_static(b"ij"));

        let replay = window.resume(6).unwrap();
        let replayed: Vec<u8> = replay.iter().flat_map(|b| b.iter().copied()).collect();
        assert_eq!(replayed, b"ghij");

        // A second resumption at the same point replays the same bytes
        let again: Vec<u8> = window
            .resume(6)
            .unwrap()
            .iter()
            .flat_map(|b| b.iter().copied())
            .collect();
        assert_eq!(again, b"ghij");
    }

    #[test]
    fn test_resume_with_everything_acknowledged() {
        let mut window = SendWindow::new(100);
        window.record_sent(Bytes::from_static(b"abcd"));
        assert!(window.resume(4).unwrap().is_empty());
        assert_eq!(window.in_flight(), 0);
    }
}
