//! Timestamp reconciliation.
//!
//! Sources hand us timestamps that start anywhere, jump on reconnect, wrap,
//! or (for RTP) carry no decode time at all. This module turns them into an
//! output clock that starts at zero and only moves forward:
//!
//! - [`DeltaStamp`]: step-by-step deltas with jump suppression.
//! - [`Stamp`]: per-track dts/pts rewriting built on `DeltaStamp`.
//! - [`DtsGenerator`]: decode timestamps for PTS-only transports.
//! - [`NtpStamp`]: 32-bit RTP clock to absolute milliseconds.

use std::collections::BTreeSet;
use std::time::{Instant, SystemTime, UNIX_EPOCH};

use crate::config::DEFAULT_MAX_DELTA_MS;

/// Audio/video input clocks closer than this are assumed to share an origin.
const SYNC_WINDOW_MS: i64 = 5000;

/// Converts absolute timestamps into bounded deltas.
///
/// The first input yields 0. Afterwards a forward step below `max_delta` is
/// returned as-is. A backward step or a forward jump of `max_delta` or more
/// is treated as a discontinuity: live mode reports 0 so the output clock
/// does not jump, playback mode reports the true delta so seeks show up.
#[derive(Debug, Clone)]
pub struct DeltaStamp {
    last: Option<i64>,
    max_delta: i64,
    playback: bool,
}

impl Default for DeltaStamp {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_DELTA_MS)
    }
}

impl DeltaStamp {
    pub fn new(max_delta: i64) -> Self {
        Self {
            last: None,
            max_delta,
            playback: false,
        }
    }

    pub fn set_playback(&mut self, playback: bool) {
        self.playback = playback;
    }

    pub fn set_max_delta(&mut self, max_delta: i64) {
        self.max_delta = max_delta;
    }

    pub fn delta(&mut self, stamp: i64) -> i64 {
        let Some(last) = self.last.replace(stamp) else {
            return 0;
        };

        let delta = stamp - last;
        if (0..self.max_delta).contains(&delta) || self.playback {
            return delta;
        }
        tracing::debug!(last, stamp, delta, "timestamp discontinuity suppressed");
        0
    }
}

/// Per-track timestamp rewriter.
///
/// Maintains a `relative_stamp` that starts at zero. Each time the input
/// dts changes, the relative stamp either follows the source delta (default)
/// or resynchronizes to local elapsed time (see
/// [`set_local_clock`](Self::set_local_clock)). NAL units sharing one
/// access-unit timestamp therefore never advance the clock.
#[derive(Debug)]
pub struct Stamp {
    delta: DeltaStamp,
    max_delta: i64,
    relative_stamp: i64,
    last_dts_in: Option<i64>,
    last_dts_out: i64,
    last_pts_out: i64,
    playback: bool,
    local_clock: bool,
    started: Instant,
}

impl Default for Stamp {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_DELTA_MS)
    }
}

impl Stamp {
    pub fn new(max_delta: i64) -> Self {
        Self {
            delta: DeltaStamp::new(max_delta),
            max_delta,
            relative_stamp: 0,
            last_dts_in: None,
            last_dts_out: 0,
            last_pts_out: 0,
            playback: false,
            local_clock: false,
            started: Instant::now(),
        }
    }

    /// Playback (VOD) streams carry a meaningful clock: outputs follow the
    /// input directly, seeks included.
    pub fn set_playback(&mut self, playback: bool) {
        self.playback = playback;
        self.delta.set_playback(playback);
    }

    /// Ignore source deltas and stamp frames with local elapsed time.
    pub fn set_local_clock(&mut self, local_clock: bool) {
        self.local_clock = local_clock;
    }

    pub fn relative_stamp(&self) -> i64 {
        self.relative_stamp
    }

    pub fn set_relative_stamp(&mut self, stamp: i64) {
        self.relative_stamp = stamp;
    }

    /// Rewrite one input `(dts, pts)` pair, in milliseconds.
    pub fn revise(&mut self, dts: i64, pts: i64) -> (i64, i64) {
        let pts = if pts == 0 { dts } else { pts };
        if self.playback {
            self.relative_stamp = dts;
            self.last_dts_in = Some(dts);
            return (dts, pts);
        }
        let cts = (pts - dts).clamp(-self.max_delta, self.max_delta);

        if self.last_dts_in != Some(dts) {
            if self.local_clock {
                self.relative_stamp = self.started.elapsed().as_millis() as i64;
            } else {
                self.relative_stamp += self.delta.delta(dts);
            }
            self.last_dts_in = Some(dts);
        }

        let dts_out = self.relative_stamp;
        let pts_out = (dts_out + cts).max(0);

        if dts_out < self.last_dts_out {
            tracing::trace!(dts_out, last = self.last_dts_out, "dts rollback held");
            return (self.last_dts_out, self.last_pts_out);
        }
        self.last_dts_out = dts_out;
        self.last_pts_out = pts_out;
        (dts_out, pts_out)
    }

    /// Align this track's clock with `master` (typically audio to video).
    ///
    /// When both input clocks have started and are within five seconds of
    /// each other, this track's relative stamp is moved so that the input
    /// offset between the tracks is preserved on output. Returns `true`
    /// once no further sync attempt is needed; call after each
    /// [`revise`](Self::revise) until then.
    pub fn sync_to(&mut self, master: &Stamp) -> bool {
        if self.playback || self.local_clock {
            return true;
        }
        let (Some(mine), Some(theirs)) = (self.last_dts_in, master.last_dts_in) else {
            return false;
        };
        let diff = mine - theirs;
        if diff.abs() < SYNC_WINDOW_MS {
            self.relative_stamp = master.relative_stamp + diff;
            tracing::debug!(diff, relative = self.relative_stamp, "track clock synced");
        }
        true
    }
}

/// Upper bound on the learned reorder depth.
const MAX_SORTER_SIZE: usize = 16;

/// Derives decode timestamps from presentation timestamps.
///
/// With B-frames, pts is not monotonic in decode order but the sorted pts
/// sequence, delayed by the reorder depth, is a valid dts sequence. The
/// generator learns the depth from runs of frames whose pts does not exceed
/// the last P/I-frame pts, then buffers that many pts values and emits the
/// smallest one (plus half a P-frame interval) for each new frame. The depth
/// grows immediately when a longer run is seen and shrinks one step at a
/// time when runs get shorter.
#[derive(Debug, Default)]
pub struct DtsGenerator {
    last_pts: Option<u64>,
    last_dts: Option<u64>,
    last_max_pts: u64,
    frames_since_last_max_pts: usize,
    runs_observed: usize,
    sorter_max_size: usize,
    dts_pts_offset: u64,
    pts_sorter: BTreeSet<u64>,
}

impl DtsGenerator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current reorder depth; 0 while still learning, 1 without B-frames.
    pub fn reorder_depth(&self) -> usize {
        self.sorter_max_size
    }

    /// Returns the dts for `pts` and whether it came from the sorter. While
    /// the depth is unknown the dts equals the pts and the flag is `false`.
    pub fn get_dts(&mut self, pts: u64) -> (u64, bool) {
        let result = if self.last_pts == Some(pts) {
            self.last_dts
        } else {
            let dts = self.get_dts_l(pts);
            if dts.is_some() {
                self.last_dts = dts;
            }
            dts
        };
        self.last_pts = Some(pts);

        match result {
            Some(dts) => (dts, true),
            None => (pts, false),
        }
    }

    fn get_dts_l(&mut self, pts: u64) -> Option<u64> {
        self.observe(pts);

        match self.sorter_max_size {
            0 => {
                self.pts_sorter.insert(pts);
                None
            }
            1 => {
                self.pts_sorter.clear();
                Some(pts)
            }
            depth => {
                self.pts_sorter.insert(pts);
                while self.pts_sorter.len() > depth + 1 {
                    self.pts_sorter.pop_first();
                }
                if self.pts_sorter.len() <= depth {
                    return None;
                }
                let first = self.pts_sorter.pop_first()?;
                Some((first + self.dts_pts_offset).min(pts))
            }
        }
    }

    fn observe(&mut self, pts: u64) {
        if pts > self.last_max_pts {
            let run = self.frames_since_last_max_pts;
            if run > 0 {
                let offset = (pts - self.last_max_pts) / 2;
                if self.sorter_max_size == 0 {
                    if self.runs_observed > 0 {
                        self.set_depth(run.min(MAX_SORTER_SIZE), offset);
                    }
                    self.runs_observed += 1;
                } else if run > self.sorter_max_size {
                    self.set_depth(run.min(MAX_SORTER_SIZE), offset);
                } else if run < self.sorter_max_size {
                    self.set_depth(self.sorter_max_size - 1, offset);
                }
            }
            self.frames_since_last_max_pts = 0;
            self.last_max_pts = pts;
        }
        self.frames_since_last_max_pts += 1;
    }

    fn set_depth(&mut self, depth: usize, offset: u64) {
        if depth != self.sorter_max_size {
            tracing::debug!(from = self.sorter_max_size, to = depth, offset, "pts reorder depth changed");
        }
        self.sorter_max_size = depth;
        self.dts_pts_offset = offset;
    }
}

/// Max RTP clock step, in ms, treated as normal progress.
const MAX_NTP_DELTA_MS: u64 = 3000;
/// Window, in ms, on either side of the 32-bit wrap point.
const STAMP_LOOP_DELTA_MS: u64 = 60 * 1000;

/// Maps 32-bit RTP timestamps onto absolute (NTP/wall) milliseconds.
///
/// Anchored by RTCP sender reports via [`set_ntp_stamp`](Self::set_ntp_stamp);
/// without one the local wall clock is used as the anchor. Handles clock
/// wrap-around and out-of-order packets straddling the wrap.
#[derive(Debug, Default)]
pub struct NtpStamp {
    last_rtp_stamp: u32,
    last_ntp_stamp_ms: u64,
}

impl NtpStamp {
    pub fn new() -> Self {
        Self::default()
    }

    /// Anchor from an RTCP sender report. A zero NTP time is ignored; some
    /// servers send one in every report.
    pub fn set_ntp_stamp(&mut self, rtp_stamp: u32, ntp_stamp_ms: u64) {
        self.update(rtp_stamp, ntp_stamp_ms);
    }

    pub fn ntp_stamp(&mut self, rtp_stamp: u32, sample_rate: u32) -> u64 {
        if rtp_stamp == self.last_rtp_stamp && self.last_ntp_stamp_ms != 0 {
            return self.last_ntp_stamp_ms;
        }
        self.ntp_stamp_l(rtp_stamp, sample_rate)
    }

    fn update(&mut self, rtp_stamp: u32, ntp_stamp_ms: u64) {
        if ntp_stamp_ms == 0 {
            return;
        }
        self.last_rtp_stamp = rtp_stamp;
        self.last_ntp_stamp_ms = ntp_stamp_ms;
    }

    fn ntp_stamp_l(&mut self, rtp_stamp: u32, sample_rate: u32) -> u64 {
        if self.last_ntp_stamp_ms == 0 {
            self.update(rtp_stamp, wall_clock_ms());
        }
        if sample_rate == 0 {
            return self.last_ntp_stamp_ms;
        }

        let per_ms = sample_rate as f64 / 1000.0;
        let loop_delta = STAMP_LOOP_DELTA_MS * sample_rate as u64 / 1000;
        let max_rtp_ms = u32::MAX as u64 * 1000 / sample_rate as u64;
        let last_rtp = self.last_rtp_stamp as u64;
        let rtp = rtp_stamp as u64;

        if rtp >= last_rtp {
            let diff = ((rtp - last_rtp) as f64 / per_ms) as u64;
            if diff < MAX_NTP_DELTA_MS {
                self.update(rtp_stamp, self.last_ntp_stamp_ms + diff);
                return self.last_ntp_stamp_ms;
            }
            if last_rtp < loop_delta && rtp > u32::MAX as u64 - loop_delta {
                // late packet from before the wrap
                return (self.last_ntp_stamp_ms + diff).saturating_sub(max_rtp_ms);
            }
            tracing::warn!(last = self.last_rtp_stamp, rtp_stamp, "rtp stamp jumped forward");
            self.update(rtp_stamp, self.last_ntp_stamp_ms);
            return self.last_ntp_stamp_ms;
        }

        let diff = ((last_rtp - rtp) as f64 / per_ms) as u64;
        if diff < MAX_NTP_DELTA_MS {
            // reordered packet
            return self.last_ntp_stamp_ms.saturating_sub(diff);
        }
        if rtp < loop_delta && last_rtp > u32::MAX as u64 - loop_delta {
            self.update(rtp_stamp, self.last_ntp_stamp_ms + max_rtp_ms.saturating_sub(diff));
            return self.last_ntp_stamp_ms;
        }
        tracing::warn!(last = self.last_rtp_stamp, rtp_stamp, "rtp stamp jumped backward");
        self.update(rtp_stamp, self.last_ntp_stamp_ms);
        self.last_ntp_stamp_ms
    }
}

fn wall_clock_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(1)
}
