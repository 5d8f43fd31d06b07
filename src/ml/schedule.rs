// ============================================================
// Layer 5 — Rate Schedules
// ============================================================
// Learning-rate multiplier (driven by the optimizer-step counter):
//
//   iteration < warmup   → iteration / max(1, warmup)
//   otherwise            → max(0.1, 0.5 * (1 + cos(π * progress)))
//   progress             = clamp((it - warmup) / max(1, final - warmup), 0, 1)
//
// Mask rate:
//   training   → start + (end - start) * U,  U ~ U[0,1) fresh per batch
//   evaluation → start + (end - start) * min(i / max(1, n - 1), 1)
//                so batch 0 sees `start` and batch n-1 sees `end`

use std::f64::consts::PI;

/// Lowest fraction of the base learning rate cosine decay reaches.
pub const LR_FLOOR: f64 = 0.1;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LrSchedule {
    pub warmup_iters: u64,
    pub final_iters:  u64,
}

impl LrSchedule {
    pub fn new(warmup_iters: u64, final_iters: u64) -> Self {
        Self { warmup_iters, final_iters }
    }

    pub fn multiplier(&self, iteration: u64) -> f64 {
        if iteration < self.warmup_iters {
            return iteration as f64 / self.warmup_iters.max(1) as f64;
        }
        let span     = self.final_iters.saturating_sub(self.warmup_iters).max(1) as f64;
        let progress = ((iteration - self.warmup_iters) as f64 / span).clamp(0.0, 1.0);
        (0.5 * (1.0 + (PI * progress).cos())).max(LR_FLOOR)
    }
}

/// The configured span of mask rates.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MaskRateRange {
    pub start: f64,
    pub end:   f64,
}

impl MaskRateRange {
    pub fn new(start: f64, end: f64) -> Self {
        Self { start, end }
    }

    /// Training rate from a uniform draw `u` in [0, 1).
    pub fn sample(&self, u: f64) -> f64 {
        self.start + (self.end - self.start) * u
    }

    /// Evaluation rate for batch `index` of `total` in one pass.
    pub fn ramp(&self, index: usize, total: usize) -> f64 {
        let denom = total.saturating_sub(1).max(1) as f64;
        let t     = (index as f64 / denom).min(1.0);
        self.start + (self.end - self.start) * t
    }
}
