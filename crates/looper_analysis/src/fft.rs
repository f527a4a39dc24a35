//! Minimal radix-2 FFT for power spectra.

use std::f64::consts::PI;
use std::ops::{Add, Mul, Sub};

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Complex {
    pub re: f64,
    pub im: f64,
}

impl Complex {
    pub const fn new(re: f64, im: f64) -> Self {
        Self { re, im }
    }

    pub fn norm_sqr(self) -> f64 {
        self.re * self.re + self.im * self.im
    }

    pub fn scale(self, k: f64) -> Self {
        Self::new(self.re * k, self.im * k)
    }
}

impl Add for Complex {
    type Output = Complex;
    fn add(self, rhs: Complex) -> Complex {
        Complex::new(self.re + rhs.re, self.im + rhs.im)
    }
}

impl Sub for Complex {
    type Output = Complex;
    fn sub(self, rhs: Complex) -> Complex {
        Complex::new(self.re - rhs.re, self.im - rhs.im)
    }
}

impl Mul for Complex {
    type Output = Complex;
    fn mul(self, rhs: Complex) -> Complex {
        Complex::new(
            self.re * rhs.re - self.im * rhs.im,
            self.re * rhs.im + self.im * rhs.re,
        )
    }
}

/// In-place forward FFT. `buf.len()` must be a power of two.
pub fn fft_in_place(buf: &mut [Complex]) {
    let n = buf.len();
    if n <= 1 {
        return;
    }
    debug_assert!(n.is_power_of_two());

    // Bit-reversal permutation
    let bits = n.trailing_zeros();
    for i in 0..n {
        let j = i.reverse_bits() >> (usize::BITS - bits);
        if j > i {
            buf.swap(i, j);
        }
    }

    let mut len = 2;
    while len <= n {
        let angle = -2.0 * PI / len as f64;
        let w_len = Complex::new(angle.cos(), angle.sin());
        for start in (0..n).step_by(len) {
            let mut w = Complex::new(1.0, 0.0);
            for k in 0..len / 2 {
                let u = buf[start + k];
                let v = buf[start + k + len / 2] * w;
                buf[start + k] = u + v;
                buf[start + k + len / 2] = u - v;
                w = w * w_len;
            }
        }
        len <<= 1;
    }
}

/// Swap the halves of a spectrum so that the zero frequency sits in the middle.
pub fn fftshift<T: Copy>(values: &mut [T]) {
    let n = values.len();
    values.rotate_left(n / 2 + n % 2);
}

/// Frequencies of an `n`-point FFT at sample spacing `d`, already shifted.
pub fn shifted_frequencies(n: usize, d: f64) -> Vec<f64> {
    let step = 1.0 / (n as f64 * d);
    let mut freqs: Vec<f64> = (0..n)
        .map(|i| {
            let k = if i < (n + 1) / 2 {
                i as i64
            } else {
                i as i64 - n as i64
            };
            k as f64 * step
        })
        .collect();
    fftshift(&mut freqs);
    freqs
}

/// Hann window coefficients of length `n`.
pub fn hann(n: usize) -> Vec<f64> {
    if n == 1 {
        return vec![1.0];
    }
    (0..n)
        .map(|i| 0.5 - 0.5 * (2.0 * PI * i as f64 / (n - 1) as f64).cos())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn close(a: f64, b: f64) -> bool {
        (a - b).abs() < 1e-9
    }

    #[test]
    fn test_fft_of_impulse_is_flat() {
        let mut buf = vec![Complex::default(); 8];
        buf[0] = Complex::new(1.0, 0.0);
        fft_in_place(&mut buf);
        for bin in &buf {
            assert!(close(bin.re, 1.0));
            assert!(close(bin.im, 0.0));
        }
    }

    #[test]
    fn test_fft_of_complex_tone_hits_one_bin() {
        let n = 16;
        let tone = 3;
        let mut buf: Vec<Complex> = (0..n)
            .map(|i| {
                let phase = 2.0 * PI * tone as f64 * i as f64 / n as f64;
                Complex::new(phase.cos(), phase.sin())
            })
            .collect();
        fft_in_place(&mut buf);
        for (k, bin) in buf.iter().enumerate() {
            if k == tone {
                assert!(close(bin.norm_sqr(), (n * n) as f64));
            } else {
                assert!(bin.norm_sqr() < 1e-9, "leak in bin {k}");
            }
        }
    }

    #[test]
    fn test_shifted_frequencies_matches_numpy() {
        // np.fft.fftshift(np.fft.fftfreq(4, 1/8)) == [-4, -2, 0, 2]
        assert_eq!(shifted_frequencies(4, 1.0 / 8.0), vec![-4.0, -2.0, 0.0, 2.0]);
    }

    #[test]
    fn test_fftshift_even() {
        let mut v = vec![0, 1, 2, 3];
        fftshift(&mut v);
        assert_eq!(v, vec![2, 3, 0, 1]);
    }
}
