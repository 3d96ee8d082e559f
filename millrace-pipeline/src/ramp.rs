//! Ramp arithmetic
//!
//! A ramp is a linear interpolation of an amplitude multiplier across a
//! span of samples, used to avoid audible discontinuities at transitions.
//! Ramp values are integers in `[RAMP_MIN, RAMP_MAX]` interpolated in
//! jiffy space over a remaining duration, so that a ramp spread across
//! several messages lands exactly on its target by the end of the
//! duration regardless of how the messages are sized or split.
//!
//! The tricky case is layering a new ramp over a fragment that already
//! carries one: same direction takes the lower envelope; opposite
//! directions intersect, and the fragment must be split at the
//! intersection so the value stays monotonic within each piece.

use tracing::error;

/// Unity gain.
pub const RAMP_MAX: u32 = 1 << 14;
/// Full attenuation.
pub const RAMP_MIN: u32 = 0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    None,
    Up,
    Down,
    Mute,
}

/// Ramp sub-state carried by a decoded-audio message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ramp {
    start: u32,
    end: u32,
    direction: Direction,
    enabled: bool,
}

impl Default for Ramp {
    fn default() -> Self {
        Self::new()
    }
}

impl Ramp {
    pub fn new() -> Self {
        Self {
            start: RAMP_MAX,
            end: RAMP_MAX,
            direction: Direction::None,
            enabled: false,
        }
    }

    pub fn reset(&mut self) {
        *self = Self::new();
    }

    pub fn start(&self) -> u32 {
        self.start
    }

    pub fn end(&self) -> u32 {
        self.end
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Flatten to silence for the whole fragment.
    pub fn set_muted(&mut self) {
        self.start = RAMP_MIN;
        self.end = RAMP_MIN;
        self.direction = Direction::Mute;
        self.enabled = true;
    }

    /// Apply a ramp segment to a fragment of `fragment_size` jiffies,
    /// part of a ramp with `remaining_duration` jiffies still to run.
    ///
    /// Returns the split ramp and split position (in jiffies) if the new
    /// segment intersects an existing opposite-direction ramp mid-fragment.
    pub fn set(
        &mut self,
        start: u32,
        fragment_size: u32,
        remaining_duration: u32,
        direction: Direction,
    ) -> Option<(Ramp, u32)> {
        assert!(
            remaining_duration >= fragment_size,
            "ramp fragment larger than remaining duration"
        );
        assert!(direction == Direction::Up || direction == Direction::Down);
        let before = *self;
        self.enabled = true;

        let ramp_remaining = if direction == Direction::Down {
            start
        } else {
            RAMP_MAX - start
        };
        // Round the delta up so rounding errors can never leave a ramp
        // unfinished at the end of its duration.
        let ramp_delta = ((ramp_remaining as u64 * fragment_size as u64
            + remaining_duration as u64
            - 1)
            / remaining_duration as u64) as u32;
        // Rounding up means the ramp may overshoot; clamp to min/max.
        let ramp_end = if direction == Direction::Down {
            if ramp_delta > start {
                assert!(ramp_delta - start <= fragment_size.saturating_sub(1));
                RAMP_MIN
            } else {
                start - ramp_delta
            }
        } else if start + ramp_delta > RAMP_MAX {
            assert!(start + ramp_delta - RAMP_MAX <= fragment_size.saturating_sub(1));
            RAMP_MAX
        } else {
            start + ramp_delta
        };

        let mut split = None;
        if self.direction == Direction::None {
            // No previous ramp; trivially take the suggested values.
            self.direction = direction;
            self.start = start;
            self.end = ramp_end;
        } else if self.direction == direction {
            // Same direction: take the lower envelope.
            self.select_lower_points(start, ramp_end);
        } else {
            // Opposite directions: find the intersection. If the two lines
            // cross inside this fragment, split there; otherwise take the
            // lower envelope.
            //
            // With lines (0,y1)->(size,y2) and (0,y3)->(size,y4), where the
            // first has the lower start:
            //   x = size*(y3-y1) / ((y2-y1)-(y4-y3))
            //   y = (y2-y1)*(y3-y1) / ((y2-y1)-(y4-y3)) + y1
            let (y1, y2, y3, y4): (i64, i64, i64, i64) = if self.start < start {
                (self.start as i64, self.end as i64, start as i64, ramp_end as i64)
            } else {
                (start as i64, ramp_end as i64, self.start as i64, self.end as i64)
            };
            if (y2 - y1) == (y4 - y3) {
                // Parallel; never intersect.
                self.select_lower_points(start, ramp_end);
            } else {
                let denom = (y2 - y1) - (y4 - y3);
                let intersect_x = (fragment_size as i64 * (y3 - y1)) / denom;
                let intersect_y = ((y2 - y1) * (y3 - y1)) / denom + y1;
                if intersect_x <= 0 || intersect_x >= fragment_size as i64 {
                    self.select_lower_points(start, ramp_end);
                } else {
                    let second_start = intersect_y as u32;
                    let second_end = self.end.min(ramp_end);
                    let second = Ramp {
                        start: second_start,
                        end: second_end,
                        direction: if second_start == second_end {
                            Direction::None
                        } else {
                            Direction::Down
                        },
                        enabled: true,
                    };
                    let first_start = self.start.min(start);
                    let first_end = intersect_y as u32;
                    self.direction = if first_start == first_end {
                        Direction::None
                    } else {
                        Direction::Up
                    };
                    self.start = first_start;
                    self.end = first_end;
                    split = Some((second, intersect_x as u32));
                }
            }
        }
        if !self.is_valid() {
            error!(
                "Ramp::set({start:#x}, {fragment_size}, {remaining_duration}, {direction:?}) \
                 created invalid ramp (before [{:#x}..{:#x}], after [{:#x}..{:#x}])",
                before.start, before.end, self.start, self.end
            );
            panic!("invalid ramp");
        }
        split
    }

    fn select_lower_points(&mut self, requested_start: u32, requested_end: u32) {
        self.start = self.start.min(requested_start);
        self.end = self.end.min(requested_end);
        self.direction = if self.start == self.end {
            Direction::None
        } else if self.start > self.end {
            Direction::Down
        } else {
            Direction::Up
        };
    }

    /// Divide a ramp at a fragment boundary: self keeps the first
    /// `new_size` jiffies of a `current_size`-jiffy fragment, the returned
    /// ramp covers the remainder.
    pub fn split(&mut self, new_size: u32, current_size: u32) -> Ramp {
        let mut remaining = Ramp {
            start: 0,
            end: self.end,
            direction: self.direction,
            enabled: true,
        };
        if self.direction == Direction::Up {
            let ramp = ((self.end - self.start) as u64 * new_size as u64 / current_size as u64) as u32;
            self.end = self.start + ramp;
        } else {
            let ramp = ((self.start - self.end) as u64 * new_size as u64 / current_size as u64) as u32;
            self.end = self.start - ramp;
        }
        if self.start == self.end && self.direction != Direction::Mute {
            self.direction = Direction::None;
        }
        remaining.start = self.end;
        if remaining.start == remaining.end && remaining.direction != Direction::Mute {
            remaining.direction = Direction::None;
        }
        debug_assert!(self.is_valid(), "split produced invalid first ramp");
        debug_assert!(remaining.is_valid(), "split produced invalid remainder");
        remaining
    }

    fn is_valid(&self) -> bool {
        if self.start > RAMP_MAX || self.end > RAMP_MAX {
            return false;
        }
        match self.direction {
            Direction::None => self.start == self.end,
            Direction::Up => self.start < self.end,
            Direction::Down => self.start > self.end,
            Direction::Mute => self.start == self.end && self.start == RAMP_MIN,
        }
    }

    /// Amplitude multiplier for sample `index` of `count` samples.
    fn multiplier_at(&self, index: usize, count: usize) -> f64 {
        let value = if count <= 1 {
            self.start as f64
        } else {
            let total = self.start as f64 - self.end as f64;
            self.start as f64 - (index as f64 * total) / (count as f64 - 1.0)
        };
        value / RAMP_MAX as f64
    }
}

/// Renders a ramp onto raw PCM bytes (big-endian subsamples).
///
/// Audio messages carry their ramp as metadata until the point where
/// rendered bytes are needed (playable conversion, flywheel training);
/// this is where the multiplication actually happens.
pub struct RampApplicator<'a> {
    ramp: &'a Ramp,
    bit_depth: u32,
    channels: u32,
}

impl<'a> RampApplicator<'a> {
    pub fn new(ramp: &'a Ramp, bit_depth: u32, channels: u32) -> Self {
        Self {
            ramp,
            bit_depth,
            channels,
        }
    }

    /// Apply the ramp to `data` in place. `data` must hold a whole number
    /// of samples at the configured geometry.
    pub fn apply(&self, data: &mut [u8]) {
        let subsample_bytes = (self.bit_depth / 8) as usize;
        let frame_bytes = subsample_bytes * self.channels as usize;
        assert_eq!(data.len() % frame_bytes, 0, "partial sample in ramp target");
        let count = data.len() / frame_bytes;
        for sample in 0..count {
            let multiplier = self.ramp.multiplier_at(sample, count);
            for channel in 0..self.channels as usize {
                let offset = sample * frame_bytes + channel * subsample_bytes;
                let sub = &mut data[offset..offset + subsample_bytes];
                scale_subsample(sub, multiplier);
            }
        }
    }
}

fn scale_subsample(sub: &mut [u8], multiplier: f64) {
    match sub.len() {
        1 => {
            let v = sub[0] as i8;
            sub[0] = ((v as f64 * multiplier) as i8) as u8;
        }
        2 => {
            let v = i16::from_be_bytes([sub[0], sub[1]]);
            let scaled = (v as f64 * multiplier) as i16;
            sub.copy_from_slice(&scaled.to_be_bytes());
        }
        3 => {
            let v = i32::from_be_bytes([sub[0], sub[1], sub[2], 0]) >> 8;
            let scaled = (v as f64 * multiplier) as i32;
            let b = scaled.to_be_bytes();
            sub.copy_from_slice(&b[1..4]);
        }
        4 => {
            let v = i32::from_be_bytes([sub[0], sub[1], sub[2], sub[3]]);
            let scaled = (v as f64 * multiplier) as i32;
            sub.copy_from_slice(&scaled.to_be_bytes());
        }
        _ => panic!("unsupported subsample width"),
    }
}
