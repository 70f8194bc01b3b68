//! Retained frames for resuming dropped connections.

use bytes::Bytes;
use std::collections::VecDeque;

/// Outcome of a heartbeat acknowledgement.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Ack {
    /// Frames up to the offset were released.
    Accepted { released: usize },
    /// The client claims bytes that were never written.
    Ahead,
}

/// Frames sent to a window's client, indexed by their start offset.
///
/// Frames at or below the client's last acknowledged offset are released.
/// Unacknowledged frames are kept up to `max_bytes`, dropping the oldest
/// first. A resume is possible only from the start of a retained frame or
/// from the current write offset.
#[derive(Debug)]
pub struct ReplayBuffer {
    frames: VecDeque<(u64, Bytes)>,
    write_offset: u64,
    acked: u64,
    retained: usize,
    max_bytes: usize,
    dropped: u64,
}

impl ReplayBuffer {
    pub fn new(max_bytes: usize) -> Self {
        Self {
            frames: VecDeque::new(),
            write_offset: 0,
            acked: 0,
            retained: 0,
            max_bytes,
            dropped: 0,
        }
    }

    /// Record a frame; returns its start offset.
    pub fn push(&mut self, frame: Bytes) -> u64 {
        let start = self.write_offset;
        self.write_offset += frame.len() as u64;
        self.retained += frame.len();
        self.frames.push_back((start, frame));

        while self.retained > self.max_bytes {
            let Some((_, oldest)) = self.frames.pop_front() else {
                break;
            };
            self.retained -= oldest.len();
            self.dropped += 1;
        }
        start
    }

    /// Release frames the client has applied.
    pub fn acknowledge(&mut self, offset: u64) -> Ack {
        if offset > self.write_offset {
            return Ack::Ahead;
        }
        self.acked = self.acked.max(offset);

        let mut released = 0;
        while let Some((start, frame)) = self.frames.front() {
            if start + frame.len() as u64 > self.acked {
                break;
            }
            self.retained -= frame.len();
            self.frames.pop_front();
            released += 1;
        }
        Ack::Accepted { released }
    }

    /// Frames to resend to a client that has applied `offset` bytes.
    ///
    /// `None` means the offset cannot be served and the client must reload.
    pub fn replay_from(&self, offset: u64) -> Option<Vec<Bytes>> {
        if offset == self.write_offset {
            return Some(Vec::new());
        }
        let index = self.frames.iter().position(|(start, _)| *start == offset)?;
        Some(
            self.frames
                .iter()
                .skip(index)
                .map(|(_, frame)| frame.clone())
                .collect(),
        )
    }

    /// Total bytes written so far.
    pub fn write_offset(&self) -> u64 {
        self.write_offset
    }

    /// Highest offset the client has acknowledged.
    pub fn acked(&self) -> u64 {
        self.acked
    }

    pub fn retained_bytes(&self) -> usize {
        self.retained
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    /// Unacknowledged frames evicted for space.
    pub fn dropped(&self) -> u64 {
        self.dropped
    }
}
