/// KL annealing weight for a (1-based) epoch
///
/// Rises linearly from 0 at `start` to 1 at `start + length`, stays
/// at 1 for another `length` epochs, then repeats for `n_cycles`
/// cycles; after the last cycle it is 1 for good.
///
/// * `epoch` - current epoch
/// * `start` - epoch at which the ramp leaves 0
/// * `length` - epochs to go from 0 to 1
/// * `n_cycles` - number of rise-and-hold cycles
pub fn ramp(epoch: usize, start: usize, length: usize, n_cycles: usize) -> f32 {
    let length = length.max(1) as f64;
    let i = (epoch as f64 - start as f64) / (2.0 * length);
    if i < 0.0 {
        return 0.0;
    }
    if i >= n_cycles as f64 {
        return 1.0;
    }
    (2.0 * i.rem_euclid(1.0)).min(1.0) as f32
}

/// Ramp schedule of a run; pinned at 1 when training resumes from a
/// checkpoint
#[derive(Clone, Copy, Debug)]
pub struct RampSchedule {
    pub start: usize,
    pub length: usize,
    pub n_cycles: usize,
    pub resumed: bool,
}

impl RampSchedule {
    pub fn weight(&self, epoch: usize) -> f32 {
        if self.resumed {
            1.0
        } else {
            ramp(epoch, self.start, self.length, self.n_cycles)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_cycle_endpoints() {
        assert_eq!(ramp(9, 10, 5, 1), 0.0);
        assert_eq!(ramp(10, 10, 5, 1), 0.0);
        assert_eq!(ramp(15, 10, 5, 1), 1.0);
        assert_eq!(ramp(500, 10, 5, 1), 1.0);
    }

    #[test]
    fn monotone_within_a_cycle() {
        let mut prev = 0.0;
        for epoch in 0..=30 {
            let r = ramp(epoch, 10, 5, 1);
            assert!((0.0..=1.0).contains(&r));
            assert!(r >= prev);
            prev = r;
        }
    }

    #[test]
    fn cycles_restart() {
        // second cycle starts at 10 + 2 * 5
        assert_eq!(ramp(19, 10, 5, 2), 1.0);
        assert_eq!(ramp(20, 10, 5, 2), 0.0);
        assert!(ramp(22, 10, 5, 2) > 0.0);
        assert_eq!(ramp(30, 10, 5, 2), 1.0);
    }

    #[test]
    fn resumed_runs_are_fully_on() {
        let schedule = RampSchedule {
            start: 100,
            length: 10,
            n_cycles: 1,
            resumed: true,
        };
        assert_eq!(schedule.weight(1), 1.0);
    }
}
