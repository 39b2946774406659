// Kathleen Nichols' windowed min/max estimator, as in Linux lib/win_minmax.c.
// Keeps the best, second and third best samples so that the estimate can
// age out in constant space: sample times satisfy t[0] <= t[1] <= t[2].

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct Sample {
    time: u64,
    value: u64,
}

/// Running maximum of `value` over the last `window` time units (BBR uses rounds).
#[derive(Debug, Clone)]
pub struct MaxFilter {
    window: u64,
    samples: [Sample; 3],
}

impl MaxFilter {
    pub fn new(window: u64) -> Self {
        Self {
            window,
            samples: [Sample::default(); 3],
        }
    }

    pub fn best(&self) -> u64 {
        self.samples[0].value
    }

    pub fn reset(&mut self, value: u64, time: u64) {
        self.samples = [Sample { time, value }; 3];
    }

    pub fn update(&mut self, value: u64, time: u64) {
        let sample = Sample { time, value };
        if value >= self.samples[0].value
            || time.saturating_sub(self.samples[2].time) > self.window
        {
            self.reset(value, time);
            return;
        }
        if value >= self.samples[1].value {
            self.samples[1] = sample;
            self.samples[2] = sample;
        } else if value >= self.samples[2].value {
            self.samples[2] = sample;
        }
        self.subwin_update(sample);
    }

    fn subwin_update(&mut self, sample: Sample) {
        let dt = sample.time.saturating_sub(self.samples[0].time);
        if dt > self.window {
            // Best aged out: promote the others, maybe twice.
            self.samples[0] = self.samples[1];
            self.samples[1] = self.samples[2];
            self.samples[2] = sample;
            if sample.time.saturating_sub(self.samples[0].time) > self.window {
                self.samples[0] = self.samples[1];
                self.samples[1] = self.samples[2];
                self.samples[2] = sample;
            }
        } else if self.samples[1].time == self.samples[0].time && dt > self.window / 4 {
            self.samples[2] = sample;
            self.samples[1] = sample;
        } else if self.samples[2].time == self.samples[1].time && dt > self.window / 2 {
            self.samples[2] = sample;
        }
    }
}

#[cfg(test)]
mod filter_tests {
    use super::*;
    use rstest::rstest;

    #[test]
    fn test_filter_tracks_new_max() {
        let mut filter = MaxFilter::new(10);
        filter.update(100, 0);
        filter.update(50, 1);
        assert_eq!(filter.best(), 100);
        filter.update(150, 2);
        assert_eq!(filter.best(), 150);
    }

    #[rstest]
    // Still inside the window.
    #[case(10, 200)]
    // Old max expired, the next best takes over.
    #[case(11, 80)]
    fn test_filter_expiry(#[case] at: u64, #[case] expected: u64) {
        let mut filter = MaxFilter::new(10);
        filter.update(200, 0);
        for t in 1..at {
            filter.update(80, t);
        }
        filter.update(10, at);
        assert_eq!(filter.best(), expected);
    }

    #[test]
    fn test_filter_reset() {
        let mut filter = MaxFilter::new(10);
        filter.update(500, 3);
        filter.reset(0, 0);
        assert_eq!(filter.best(), 0);
        filter.update(7, 1);
        assert_eq!(filter.best(), 7);
    }
}
