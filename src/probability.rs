use rand::RngExt;
use statrs::function::erf::erf;

/// Standard normal PDF φ(x).
#[inline]
pub fn normal_pdf(x: f64) -> f64 {
    const INV_SQRT_2PI: f64 = 0.398_942_280_401_432_7;
    INV_SQRT_2PI * (-0.5 * x * x).exp()
}

/// Standard normal CDF Φ(x) = (1 + erf(x / √2)) / 2.
#[inline]
pub fn normal_cdf(x: f64) -> f64 {
    0.5 * (1.0 + erf(x * std::f64::consts::FRAC_1_SQRT_2))
}

#[inline]
fn standard_normal<R: rand::Rng + ?Sized>(rng: &mut R) -> f64 {
    rand_distr::Distribution::sample(&rand_distr::StandardNormal, rng)
}

/// Draws `z ~ N(0, 1)` conditioned on `z > lower`.
///
/// Below zero plain rejection from the untruncated normal accepts with
/// probability at least 1/2. In the tail the exponential proposal of
/// Robert (1995) is used with its optimal rate
/// `(lower + sqrt(lower^2 + 4)) / 2`.
pub fn sample_truncated_standard_normal_above<R: rand::Rng + ?Sized>(
    rng: &mut R,
    lower: f64,
) -> f64 {
    if lower < 0.0 {
        loop {
            let z = standard_normal(rng);
            if z > lower {
                return z;
            }
        }
    }
    let rate = 0.5 * (lower + (lower * lower + 4.0).sqrt());
    loop {
        let u: f64 = rng.random::<f64>().max(f64::MIN_POSITIVE);
        let z = lower - u.ln() / rate;
        let rho = (-0.5 * (z - rate) * (z - rate)).exp();
        if rng.random::<f64>() < rho {
            return z;
        }
    }
}

/// Draws `x ~ N(mean, std^2)` conditioned on `x > lower`.
pub fn sample_truncated_normal_above<R: rand::Rng + ?Sized>(
    rng: &mut R,
    mean: f64,
    std: f64,
    lower: f64,
) -> f64 {
    mean + std * sample_truncated_standard_normal_above(rng, (lower - mean) / std)
}

/// Draws `x ~ N(mean, std^2)` conditioned on `x < upper`.
pub fn sample_truncated_normal_below<R: rand::Rng + ?Sized>(
    rng: &mut R,
    mean: f64,
    std: f64,
    upper: f64,
) -> f64 {
    mean - std * sample_truncated_standard_normal_above(rng, (mean - upper) / std)
}
