//! Collinearity math used by both the cleanup sweep and the placement checks.
//!
//! Slopes are exact rationals so that the sweep never depends on float
//! rounding. The float predicate [`is_on_shared_line`] is kept for callers
//! that only have a decimal slope at hand.

use rand::seq::SliceRandom;
use rand::Rng;
use std::collections::BTreeSet;

/// Tolerance used when comparing a float slope against an offset ratio.
pub const SLOPE_EPSILON: f64 = 1e-10;

/// Number of prime magnitudes the registry rotates through.
pub const PRIME_CANDIDATES: usize = 320;

/// Fixed magnitudes used for request-time placement checks.
pub const FIXED_MAGNITUDES: [i64; 4] = [1, 2, 3, 5];

/// Returns true if the offset `(dx, dy)` lies on a line of the given slope.
///
/// A zero slope means "same row" and an infinite slope "same column".
/// Coincident points lie on every line.
pub fn is_on_shared_line(dx: i64, dy: i64, slope: f64) -> bool {
    if dx == 0 && dy == 0 {
        return true;
    }
    if dx == 0 {
        return slope.is_infinite();
    }
    if slope.is_infinite() {
        return false;
    }
    if dy == 0 {
        return slope.abs() < SLOPE_EPSILON;
    }
    (dy as f64 / dx as f64 - slope).abs() < SLOPE_EPSILON
}

pub fn gcd(a: i64, b: i64) -> i64 {
    let (mut a, mut b) = (a.abs(), b.abs());
    while b != 0 {
        let t = a % b;
        a = b;
        b = t;
    }
    a
}

/// A reduced rational slope `rise / run`.
///
/// `run` is never negative. A vertical slope is stored as `1 / 0` and a
/// horizontal one as `0 / 1`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Slope {
    pub rise: i64,
    pub run: i64,
}

impl Slope {
    pub const VERTICAL: Slope = Slope { rise: 1, run: 0 };
    pub const HORIZONTAL: Slope = Slope { rise: 0, run: 1 };

    /// Builds a reduced slope. Returns `None` for the degenerate `0 / 0`.
    pub fn new(rise: i64, run: i64) -> Option<Self> {
        if rise == 0 && run == 0 {
            return None;
        }
        if run == 0 {
            return Some(Self::VERTICAL);
        }
        if rise == 0 {
            return Some(Self::HORIZONTAL);
        }
        let g = gcd(rise, run);
        let sign = if run < 0 { -1 } else { 1 };
        Some(Self {
            rise: sign * rise / g,
            run: sign * run / g,
        })
    }

    /// Direction of the offset between two points.
    pub fn from_offset(dx: i64, dy: i64) -> Option<Self> {
        Self::new(dy, dx)
    }

    pub fn matches(&self, dx: i64, dy: i64) -> bool {
        dy * self.run == dx * self.rise
    }

    pub fn value(&self) -> f64 {
        if self.run == 0 {
            f64::INFINITY
        } else {
            self.rise as f64 / self.run as f64
        }
    }

    pub fn is_axis(&self) -> bool {
        self.run == 0 || self.rise == 0
    }
}

/// A set of slopes tested together.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SlopeSet {
    slopes: BTreeSet<Slope>,
}

impl SlopeSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Expands each magnitude `k` into `k, -k, 1/k, -1/k`.
    pub fn symmetric(magnitudes: &[i64]) -> Self {
        let mut set = Self::new();
        for &k in magnitudes {
            let k = k.abs();
            if k == 0 {
                continue;
            }
            for (rise, run) in [(k, 1), (-k, 1), (1, k), (-1, k)] {
                set.insert(Slope::new(rise, run));
            }
        }
        set
    }

    /// Adds the two diagonals.
    pub fn with_diagonals(mut self) -> Self {
        self.insert(Slope::new(1, 1));
        self.insert(Slope::new(-1, 1));
        self
    }

    /// Adds same-row and same-column.
    pub fn with_axes(mut self) -> Self {
        self.slopes.insert(Slope::VERTICAL);
        self.slopes.insert(Slope::HORIZONTAL);
        self
    }

    fn insert(&mut self, slope: Option<Slope>) {
        if let Some(slope) = slope {
            self.slopes.insert(slope);
        }
    }

    pub fn contains(&self, slope: &Slope) -> bool {
        self.slopes.contains(slope)
    }

    /// True when the offset points along one of the slopes in the set.
    /// Coincident points have no direction and never match.
    pub fn matches(&self, dx: i64, dy: i64) -> bool {
        Slope::from_offset(dx, dy).is_some_and(|s| self.slopes.contains(&s))
    }

    pub fn iter(&self) -> impl Iterator<Item = &Slope> {
        self.slopes.iter()
    }

    pub fn len(&self) -> usize {
        self.slopes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slopes.is_empty()
    }

    /// Splits the set into consecutive batches of at most `size` slopes.
    pub fn batches(&self, size: usize) -> Vec<SlopeSet> {
        let size = size.max(1);
        let all: Vec<Slope> = self.slopes.iter().copied().collect();
        all.chunks(size)
            .map(|chunk| SlopeSet {
                slopes: chunk.iter().copied().collect(),
            })
            .collect()
    }
}

/// Canonical identity of the infinite line through two points.
///
/// Coefficients satisfy `a*x + b*y + c = 0`, reduced by their gcd and
/// sign-normalised so every pair of points on the same line yields the same key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LineKey {
    pub a: i64,
    pub b: i64,
    pub c: i64,
}

impl LineKey {
    /// Returns `None` when the points coincide.
    pub fn through(p1: (i64, i64), p2: (i64, i64)) -> Option<Self> {
        let (x1, y1) = p1;
        let (x2, y2) = p2;
        let a = y2 - y1;
        let b = x1 - x2;
        let c = x2 * y1 - x1 * y2;

        let g = gcd(gcd(a, b), c);
        if g == 0 {
            return None;
        }
        let sign = if a < 0 || (a == 0 && b < 0) { -1 } else { 1 };
        Some(Self {
            a: sign * a / g,
            b: sign * b / g,
            c: sign * c / g,
        })
    }

    pub fn contains(&self, p: (i64, i64)) -> bool {
        self.a * p.0 + self.b * p.1 + self.c == 0
    }
}

/// Usage record for one candidate magnitude.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PrimeUsage {
    pub prime: i64,
    /// Milliseconds since the epoch; 0 means never used.
    pub last_used_ms: i64,
}

/// Rotates slope magnitudes so that every prime is eventually swept.
///
/// Selection prefers entries that were never used, then the ones used
/// longest ago; ties are broken at random.
#[derive(Debug, Clone)]
pub struct SlopeRegistry {
    entries: Vec<PrimeUsage>,
}

impl SlopeRegistry {
    pub fn new() -> Self {
        Self::with_candidates(first_primes(PRIME_CANDIDATES))
    }

    pub fn with_candidates(magnitudes: Vec<i64>) -> Self {
        Self {
            entries: magnitudes
                .into_iter()
                .map(|prime| PrimeUsage {
                    prime,
                    last_used_ms: 0,
                })
                .collect(),
        }
    }

    pub fn entries(&self) -> &[PrimeUsage] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn sample(&mut self, n: usize, now_ms: i64) -> SlopeSet {
        self.sample_with_rng(n, now_ms, &mut rand::thread_rng())
    }

    /// Picks `n` magnitudes, stamps them with `now_ms` and returns their
    /// symmetric closure together with both diagonals.
    pub fn sample_with_rng<R: Rng + ?Sized>(&mut self, n: usize, now_ms: i64, rng: &mut R) -> SlopeSet {
        let mut order: Vec<usize> = (0..self.entries.len()).collect();
        order.shuffle(rng);
        order.sort_by_key(|&i| self.entries[i].last_used_ms);

        let mut chosen = Vec::with_capacity(n);
        for &i in order.iter().take(n) {
            self.entries[i].last_used_ms = now_ms;
            chosen.push(self.entries[i].prime);
        }

        SlopeSet::symmetric(&chosen).with_diagonals()
    }

    /// Oldest usage stamp across the registry, or `None` before the first sweep.
    ///
    /// A result of 0 means some magnitudes have never been swept.
    pub fn oldest_prime_timestamp(&self) -> Option<i64> {
        if self.entries.iter().all(|e| e.last_used_ms == 0) {
            return None;
        }
        self.entries.iter().map(|e| e.last_used_ms).min()
    }
}

impl Default for SlopeRegistry {
    fn default() -> Self {
        Self::new()
    }
}

pub fn first_primes(count: usize) -> Vec<i64> {
    let mut primes: Vec<i64> = Vec::with_capacity(count);
    let mut candidate = 2i64;
    while primes.len() < count {
        if primes
            .iter()
            .take_while(|&&p| p * p <= candidate)
            .all(|&p| candidate % p != 0)
        {
            primes.push(candidate);
        }
        candidate += 1;
    }
    primes
}
