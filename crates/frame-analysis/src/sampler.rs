//! Choice of which frames to analyse
//!
//! Videos are analysed at roughly two frames per second of footage whatever
//! their native rate: every `max(1, fps / 2)`-th frame, starting with frame 0.

/// Analyses per second of video targeted by the default sampler
pub const TARGET_SAMPLES_PER_SECOND: u32 = 2;

/// Fixed-interval frame selection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameSampler {
    interval: u32,
}

impl FrameSampler {
    /// Sampler targeting two analyses per second at `frame_rate`
    ///
    /// Rates below 2 fps give an interval of 1, so every frame is analysed.
    #[must_use]
    pub fn for_frame_rate(frame_rate: u32) -> Self {
        Self::every(frame_rate / TARGET_SAMPLES_PER_SECOND)
    }

    /// Sampler selecting every `interval`-th frame (at least every frame)
    #[must_use]
    pub fn every(interval: u32) -> Self {
        Self {
            interval: interval.max(1),
        }
    }

    /// Number of sequential frames between two analysed frames
    #[must_use]
    pub fn interval(&self) -> u32 {
        self.interval
    }

    /// Whether the frame at `frame_index` is analysed
    #[must_use]
    #[inline]
    pub fn selects(&self, frame_index: u64) -> bool {
        frame_index % u64::from(self.interval) == 0
    }

    /// Number of frames selected out of `total_frame_count`
    #[must_use]
    pub fn expected_samples(&self, total_frame_count: u64) -> u64 {
        total_frame_count.div_ceil(u64::from(self.interval))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_interval_is_half_the_frame_rate() {
        assert_eq!(FrameSampler::for_frame_rate(30).interval(), 15);
        assert_eq!(FrameSampler::for_frame_rate(25).interval(), 12);
        assert_eq!(FrameSampler::for_frame_rate(60).interval(), 30);
        assert_eq!(FrameSampler::for_frame_rate(3).interval(), 1);
    }

    #[test]
    fn test_low_frame_rates_analyse_every_frame() {
        for fps in [0, 1] {
            let sampler = FrameSampler::for_frame_rate(fps);
            assert_eq!(sampler.interval(), 1);
            assert!((0..10).all(|i| sampler.selects(i)));
        }
    }

    #[test]
    fn test_thirty_fps_ten_seconds() {
        let sampler = FrameSampler::for_frame_rate(30);
        let selected: Vec<u64> = (0..300).filter(|i| sampler.selects(*i)).collect();
        assert_eq!(selected.len(), 20);
        assert_eq!(selected.first(), Some(&0));
        assert_eq!(selected.last(), Some(&285));
        assert_eq!(sampler.expected_samples(300), 20);
    }

    #[test]
    fn test_expected_samples_rounds_up() {
        let sampler = FrameSampler::every(15);
        assert_eq!(sampler.expected_samples(0), 0);
        assert_eq!(sampler.expected_samples(1), 1);
        assert_eq!(sampler.expected_samples(16), 2);
        assert_eq!(FrameSampler::every(0).interval(), 1);
    }
}
