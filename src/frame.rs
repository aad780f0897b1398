//! Fixed-capacity circular buffer addressed by absolute step index.

use crate::error::DataOutOfFrame;
use serde::{Deserialize, Serialize};

/// How slots skipped by a forward write are back-filled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FillPolicy {
    /// Skipped slots read as NaN.
    #[default]
    Missing,
    /// Skipped slots repeat the last written value.
    CopyLast,
}

/// Sliding window of `capacity` values ending at `frame_end`.
///
/// Valid indices are `[frame_end - capacity + 1, frame_end]`. Anything older
/// fails with [`DataOutOfFrame`]; anything newer reads as NaN until written.
#[derive(Debug, Clone)]
pub struct RollingFrame {
    data: Vec<f64>,
    frame_end: Option<i64>,
    policy: FillPolicy,
}

impl RollingFrame {
    pub fn new(capacity: usize, policy: FillPolicy) -> Self {
        Self {
            data: vec![f64::NAN; capacity.max(1)],
            frame_end: None,
            policy,
        }
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    #[inline]
    pub fn frame_end(&self) -> Option<i64> {
        self.frame_end
    }

    /// First readable index, if anything has been written.
    #[inline]
    pub fn frame_start(&self) -> Option<i64> {
        self.frame_end.map(|end| end - self.data.len() as i64 + 1)
    }

    #[inline]
    fn slot(&self, index: i64) -> usize {
        index.rem_euclid(self.data.len() as i64) as usize
    }

    fn check(&self, index: i64) -> Result<(), DataOutOfFrame> {
        match self.frame_end {
            Some(end) if index <= end - self.data.len() as i64 => Err(DataOutOfFrame {
                index,
                frame_start: end - self.data.len() as i64 + 1,
                frame_end: end,
            }),
            _ => Ok(()),
        }
    }

    pub fn get(&self, index: i64) -> Result<f64, DataOutOfFrame> {
        self.check(index)?;
        match self.frame_end {
            Some(end) if index <= end => Ok(self.data[self.slot(index)]),
            _ => Ok(f64::NAN),
        }
    }

    pub fn set(&mut self, index: i64, value: f64) -> Result<(), DataOutOfFrame> {
        self.check(index)?;
        self.advance_to(index);
        let slot = self.slot(index);
        self.data[slot] = value;
        Ok(())
    }

    /// Moves `frame_end` forward to `index`, back-filling every skipped slot
    /// according to the fill policy. No-op when `index` is already inside.
    pub fn advance_to(&mut self, index: i64) {
        let cap = self.data.len() as i64;
        let end = match self.frame_end {
            None => {
                self.data.fill(f64::NAN);
                self.frame_end = Some(index);
                return;
            }
            Some(end) if index <= end => return,
            Some(end) => end,
        };

        let fill = match self.policy {
            FillPolicy::Missing => f64::NAN,
            FillPolicy::CopyLast => self.data[self.slot(end)],
        };
        // only the last `cap` skipped slots survive the wrap
        let from = (end + 1).max(index - cap + 1);
        for i in from..=index {
            let slot = self.slot(i);
            self.data[slot] = fill;
        }
        self.frame_end = Some(index);
    }

    /// Values for `[end - len + 1, end]`, oldest first.
    pub fn window(&self, end: i64, len: usize) -> Result<Vec<f64>, DataOutOfFrame> {
        let start = end - len as i64 + 1;
        (start..=end).map(|i| self.get(i)).collect()
    }
}
