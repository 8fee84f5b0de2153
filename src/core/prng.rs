// Seeded generator for jitter, exploratory sprouting and replay sampling.
//
// Not cryptographically secure. Every stochastic component owns its own
// stream so a fixed seed reproduces a whole run.

#[derive(Debug, Clone)]
pub struct Prng {
    state: u64,
}

const ZERO_STATE_SUBSTITUTE: u64 = 0x9E37_79B9_7F4A_7C15;

impl Prng {
    pub fn new(seed: u64) -> Self {
        Self {
            state: if seed == 0 { ZERO_STATE_SUBSTITUTE } else { seed },
        }
    }

    /// Derive an independent stream for a sub-component.
    pub fn fork(seed: u64, stream: u64) -> Self {
        Self::new(seed ^ stream.wrapping_mul(0xD1B5_4A32_D192_ED03))
    }

    pub(crate) fn from_state(state: u64) -> Self {
        Self::new(state)
    }

    pub(crate) fn state(&self) -> u64 {
        self.state
    }

    #[inline]
    fn next_u64(&mut self) -> u64 {
        // xorshift64*
        let mut x = self.state;
        x ^= x >> 12;
        x ^= x << 25;
        x ^= x >> 27;
        self.state = x;
        x.wrapping_mul(0x2545_F491_4F6C_DD1D)
    }

    #[inline]
    pub fn next_u32(&mut self) -> u32 {
        (self.next_u64() >> 32) as u32
    }

    /// Uniform in [0, 1).
    #[inline]
    pub fn next_f32_01(&mut self) -> f32 {
        // 24 mantissa bits keep the result strictly below 1.0.
        (self.next_u32() >> 8) as f32 / (1u32 << 24) as f32
    }

    #[inline]
    pub fn gen_range_f32(&mut self, low: f32, high: f32) -> f32 {
        low + (high - low) * self.next_f32_01()
    }

    /// Uniform in [low, high). Returns `low` for an empty range.
    #[inline]
    pub fn gen_range_usize(&mut self, low: usize, high: usize) -> usize {
        if high <= low {
            return low;
        }
        let span = (high - low) as u64;
        low + (self.next_u64() % span) as usize
    }

    /// Bernoulli trial.
    #[inline]
    pub fn chance(&mut self, p: f32) -> bool {
        p > 0.0 && self.next_f32_01() < p
    }

    /// Standard normal sample (Box-Muller).
    pub fn next_gaussian(&mut self) -> f32 {
        let u1 = self.next_f32_01().max(f32::MIN_POSITIVE);
        let u2 = self.next_f32_01();
        (-2.0 * u1.ln()).sqrt() * (2.0 * core::f32::consts::PI * u2).cos()
    }

    /// Fill `out` with `N(0, scale^2)` samples.
    pub fn fill_gaussian(&mut self, out: &mut [f32], scale: f32) {
        for x in out.iter_mut() {
            *x = self.next_gaussian() * scale;
        }
    }

    /// Draw `k` distinct values from `0..n` (partial Fisher-Yates).
    /// Returns fewer than `k` when `n < k`.
    pub fn sample_distinct(&mut self, n: usize, k: usize) -> Vec<usize> {
        let k = k.min(n);
        let mut pool: Vec<usize> = (0..n).collect();
        for i in 0..k {
            let j = self.gen_range_usize(i, n);
            pool.swap(i, j);
        }
        pool.truncate(k);
        pool
    }
}
