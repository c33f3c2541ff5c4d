//! Rational frame rates and per-tick frame-rate division

use std::cmp::Ordering;
use std::fmt;
use std::ops::Add;

/// Frame rate as an exact fraction, so 29.97 and friends divide cleanly
#[derive(Debug, Clone, Copy)]
pub struct FrameRate {
    num: u64,
    den: u64,
}

fn gcd(mut a: u64, mut b: u64) -> u64 {
    while b != 0 {
        let t = a % b;
        a = b;
        b = t;
    }
    a
}

impl FrameRate {
    pub const ZERO: FrameRate = FrameRate { num: 0, den: 1 };

    pub fn new(num: u64, den: u64) -> Self {
        if num == 0 || den == 0 {
            return Self::ZERO;
        }
        let g = gcd(num, den);
        Self {
            num: num / g,
            den: den / g,
        }
    }

    /// Millisecond-precision conversion from a configured fps value
    pub fn from_fps(fps: f32) -> Self {
        if !fps.is_finite() || fps <= 0.0 {
            return Self::ZERO;
        }
        Self::new((f64::from(fps) * 1000.0).round() as u64, 1000)
    }

    pub fn numer(&self) -> u64 {
        self.num
    }

    pub fn denom(&self) -> u64 {
        self.den
    }

    pub fn is_zero(&self) -> bool {
        self.num == 0
    }

    pub fn is_integer(&self) -> bool {
        self.den == 1
    }

    pub fn as_f64(&self) -> f64 {
        self.num as f64 / self.den as f64
    }

    pub fn saturating_sub(self, rhs: FrameRate) -> FrameRate {
        let lhs_n = self.num * rhs.den;
        let rhs_n = rhs.num * self.den;
        if rhs_n >= lhs_n {
            return Self::ZERO;
        }
        Self::new(lhs_n - rhs_n, self.den * rhs.den)
    }
}

impl Add for FrameRate {
    type Output = FrameRate;

    fn add(self, rhs: FrameRate) -> FrameRate {
        if self.is_zero() {
            return rhs;
        }
        if rhs.is_zero() {
            return self;
        }
        Self::new(self.num * rhs.den + rhs.num * self.den, self.den * rhs.den)
    }
}

impl PartialEq for FrameRate {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for FrameRate {}

impl PartialOrd for FrameRate {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for FrameRate {
    fn cmp(&self, other: &Self) -> Ordering {
        (self.num * other.den).cmp(&(other.num * self.den))
    }
}

impl fmt::Display for FrameRate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_integer() {
            write!(f, "{}", self.num)
        } else {
            write!(f, "{:.3}", self.as_f64())
        }
    }
}

/// Decides, one source tick at a time, whether this tick belongs to a
/// consumer running at `target` out of a `source` stream.
///
/// Bresenham style: each tick adds `target` to an accumulator and the tick is
/// due whenever the accumulator crosses `source`. Over any window of `n` ticks
/// the number of due ticks stays within one of `n * target / source`.
#[derive(Debug, Clone)]
pub struct FramerateDivider {
    step: u64,
    period: u64,
    acc: u64,
}

impl FramerateDivider {
    pub fn new(source: FrameRate, target: FrameRate) -> Self {
        Self {
            step: target.num * source.den,
            period: source.num * target.den,
            acc: 0,
        }
    }

    /// Advance one source tick; `true` when the tick goes to this consumer
    pub fn tick(&mut self) -> bool {
        if self.step == 0 || self.period == 0 {
            return false;
        }
        if self.step >= self.period {
            return true;
        }
        self.acc += self.step;
        if self.acc >= self.period {
            self.acc -= self.period;
            true
        } else {
            false
        }
    }
}

/// Seed one divider per target from a shared budget.
///
/// Consumers are consulted in order and a later divider only sees the ticks
/// the earlier ones passed on, so each is seeded with what is left of the
/// source rate after the earlier targets.
pub fn plan_dividers(
    source: FrameRate,
    targets: impl IntoIterator<Item = FrameRate>,
) -> Vec<FramerateDivider> {
    let mut remaining = source;
    targets
        .into_iter()
        .map(|target| {
            let divider = FramerateDivider::new(remaining, target);
            remaining = remaining.saturating_sub(target);
            divider
        })
        .collect()
}

/// Index of the first divider due this tick. Dividers after the winner are not
/// advanced, matching how they were seeded.
pub fn first_due(dividers: &mut [FramerateDivider]) -> Option<usize> {
    dividers.iter_mut().position(FramerateDivider::tick)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn fps(v: u64) -> FrameRate {
        FrameRate::new(v, 1)
    }

    #[test]
    fn fractional_rates_reduce() {
        let r = FrameRate::from_fps(29.97);
        assert_eq!((r.numer(), r.denom()), (2997, 100));
        assert!(!r.is_integer());
        assert!(FrameRate::from_fps(25.0).is_integer());
        assert!(FrameRate::from_fps(-1.0).is_zero());
        assert!(FrameRate::from_fps(f32::NAN).is_zero());
    }

    #[test]
    fn arithmetic() {
        assert_eq!(fps(30).saturating_sub(fps(20)), fps(10));
        assert_eq!(fps(10).saturating_sub(fps(20)), FrameRate::ZERO);
        assert_eq!(FrameRate::from_fps(14.985) + FrameRate::from_fps(14.985), FrameRate::from_fps(29.97));
        assert!(fps(30) > FrameRate::from_fps(29.97));
    }

    #[test]
    fn thirty_split_twenty_ten() {
        let mut dividers = plan_dividers(fps(30), [fps(20), fps(10)]);
        let mut hits = [0u32; 2];
        let mut idle = 0;
        for _ in 0..3000 {
            match first_due(&mut dividers) {
                Some(i) => hits[i] += 1,
                None => idle += 1,
            }
        }
        assert_eq!(hits, [2000, 1000]);
        assert_eq!(idle, 0);
    }

    #[test]
    fn undersubscribed_leaves_idle_ticks() {
        let mut dividers = plan_dividers(fps(30), [fps(15), fps(5)]);
        let mut hits = [0u32; 2];
        for _ in 0..300 {
            if let Some(i) = first_due(&mut dividers) {
                hits[i] += 1;
            }
        }
        assert_eq!(hits, [150, 50]);
    }

    #[test]
    fn non_integer_source_keeps_ratio() {
        let source = FrameRate::from_fps(29.97);
        let half = FrameRate::from_fps(14.985);
        let mut dividers = plan_dividers(source, [half, half]);
        let mut hits = [0u32; 2];
        for _ in 0..2000 {
            if let Some(i) = first_due(&mut dividers) {
                hits[i] += 1;
            }
        }
        assert_eq!(hits, [1000, 1000]);
    }

    #[test]
    fn degenerate_targets() {
        let mut all = FramerateDivider::new(fps(30), fps(60));
        let mut none = FramerateDivider::new(fps(30), FrameRate::ZERO);
        let mut dead = FramerateDivider::new(FrameRate::ZERO, fps(10));
        for _ in 0..10 {
            assert!(all.tick());
            assert!(!none.tick());
            assert!(!dead.tick());
        }
    }

    #[test]
    fn oversubscribed_tail_starves() {
        let mut dividers = plan_dividers(fps(30), [fps(30), fps(10)]);
        for _ in 0..100 {
            assert_eq!(first_due(&mut dividers), Some(0));
        }
    }

    proptest! {
        #[test]
        fn long_run_average_matches_target(source in 1u64..=120, target_frac in 0u64..=100, ticks in 1u64..5000) {
            let target = FrameRate::new(source * target_frac, 100);
            let mut divider = FramerateDivider::new(fps(source), target);
            let hits = (0..ticks).filter(|_| divider.tick()).count() as f64;
            let expected = ticks as f64 * target.as_f64() / source as f64;
            prop_assert!((hits - expected).abs() <= 1.0, "hits {} expected {}", hits, expected);
        }
    }
}
