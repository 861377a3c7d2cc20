//! Wilson score intervals for binomial proportions.

use serde::Serialize;

/// Confidence interval of a proportion. `Undefined` when there were no trials.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum Interval {
    Defined { estimate: f64, lower: f64, upper: f64 },
    Undefined,
}

impl Interval {
    pub fn is_defined(&self) -> bool {
        matches!(self, Interval::Defined { .. })
    }

    pub fn estimate(&self) -> Option<f64> {
        match self {
            Interval::Defined { estimate, .. } => Some(*estimate),
            Interval::Undefined => None,
        }
    }

    pub fn bounds(&self) -> Option<(f64, f64)> {
        match self {
            Interval::Defined { lower, upper, .. } => Some((*lower, *upper)),
            Interval::Undefined => None,
        }
    }
}

/// `successes` out of `trials` with its interval.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Proportion {
    pub successes: u64,
    pub trials: u64,
    #[serde(flatten)]
    pub interval: Interval,
}

impl Proportion {
    pub fn new(successes: u64, trials: u64, z: f64) -> Self {
        Self {
            successes,
            trials,
            interval: wilson(successes, trials, z),
        }
    }
}

/// Wilson interval for `k` of `n` at two-sided critical value `z`.
pub fn wilson(k: u64, n: u64, z: f64) -> Interval {
    if n == 0 {
        return Interval::Undefined;
    }
    let n = n as f64;
    let p = k as f64 / n;
    let z2 = z * z;
    let denom = 1.0 + z2 / n;
    let center = p + z2 / (2.0 * n);
    let margin = z * (p * (1.0 - p) / n + z2 / (4.0 * n * n)).sqrt();
    Interval::Defined {
        estimate: p,
        lower: ((center - margin) / denom).clamp(0.0, 1.0),
        upper: ((center + margin) / denom).clamp(0.0, 1.0),
    }
}

/// Wilson interval at a confidence level such as 0.95.
pub fn wilson_interval(k: u64, n: u64, confidence: f64) -> Interval {
    wilson(k, n, z_for_confidence(confidence))
}

/// Two-sided critical value: the normal quantile at `1 - α/2`.
pub fn z_for_confidence(confidence: f64) -> f64 {
    inverse_normal_cdf(1.0 - (1.0 - confidence) / 2.0)
}

/// Standard normal quantile (Acklam's rational approximation,
/// relative error below 1.2e-9).
pub fn inverse_normal_cdf(p: f64) -> f64 {
    const A: [f64; 6] = [
        -3.969_683_028_665_376e1,
        2.209_460_984_245_205e2,
        -2.759_285_104_469_687e2,
        1.383_577_518_672_690e2,
        -3.066_479_806_614_716e1,
        2.506_628_277_459_239e0,
    ];
    const B: [f64; 5] = [
        -5.447_609_879_822_406e1,
        1.615_858_368_580_409e2,
        -1.556_989_798_598_866e2,
        6.680_131_188_771_972e1,
        -1.328_068_155_288_572e1,
    ];
    const C: [f64; 6] = [
        -7.784_894_002_430_293e-3,
        -3.223_964_580_411_365e-1,
        -2.400_758_277_161_838e0,
        -2.549_732_539_343_734e0,
        4.374_664_141_464_968e0,
        2.938_163_982_698_783e0,
    ];
    const D: [f64; 4] = [
        7.784_695_709_041_462e-3,
        3.224_671_290_700_398e-1,
        2.445_134_137_142_996e0,
        3.754_408_661_907_416e0,
    ];
    const P_LOW: f64 = 0.02425;

    if p <= 0.0 {
        return f64::NEG_INFINITY;
    }
    if p >= 1.0 {
        return f64::INFINITY;
    }

    let tail = |q: f64| {
        (((((C[0] * q + C[1]) * q + C[2]) * q + C[3]) * q + C[4]) * q + C[5])
            / ((((D[0] * q + D[1]) * q + D[2]) * q + D[3]) * q + 1.0)
    };

    if p < P_LOW {
        tail((-2.0 * p.ln()).sqrt())
    } else if p <= 1.0 - P_LOW {
        let q = p - 0.5;
        let r = q * q;
        (((((A[0] * r + A[1]) * r + A[2]) * r + A[3]) * r + A[4]) * r + A[5]) * q
            / (((((B[0] * r + B[1]) * r + B[2]) * r + B[3]) * r + B[4]) * r + 1.0)
    } else {
        -tail((-2.0 * (1.0 - p).ln()).sqrt())
    }
}
