//! Random affine augmentation of radar images.
//!
//! Each image receives an independent transform drawn from
//!
//! - zoom: per-axis factor in `[0.8, 1.2]`
//! - shear: angle in `[-5°, 5°]`
//! - rotation: angle in `[-5°, 5°]`
//!
//! resampled bilinearly about the image centre. Coordinates that fall outside
//! the image take the value of the nearest edge pixel.
//!
//! ```rust
//! use mmwave_train::augment::{Augmentor, Xorshift64};
//! use ndarray::Array3;
//!
//! let mut aug = Augmentor::new(Xorshift64::new(42));
//! let image = Array3::<f32>::ones((16, 16, 2));
//! let out = aug.augment(image.view());
//! assert_eq!(out.shape(), image.shape());
//! ```

use ndarray::{Array3, Array4, ArrayView3, Axis};

// ---------------------------------------------------------------------------
// Xorshift64 PRNG
// ---------------------------------------------------------------------------

/// Lightweight 64-bit Xorshift PRNG used for shuffles, splits and
/// augmentation.
#[derive(Debug, Clone)]
pub struct Xorshift64 {
    state: u64,
}

impl Xorshift64 {
    /// Create a new PRNG. Seed `0` is replaced with a fixed non-zero value.
    pub fn new(seed: u64) -> Self {
        Self { state: if seed == 0 { 0x853c49e6748fea9b } else { seed } }
    }

    /// Advance the state and return the next `u64`.
    #[inline]
    pub fn next_u64(&mut self) -> u64 {
        self.state ^= self.state << 13;
        self.state ^= self.state >> 7;
        self.state ^= self.state << 17;
        self.state
    }

    /// Uniform `f32` in `[0, 1)`.
    #[inline]
    pub fn next_f32(&mut self) -> f32 {
        (self.next_u64() >> 40) as f32 / (1u64 << 24) as f32
    }

    /// Uniform `f32` in `[lo, hi)`.
    #[inline]
    pub fn next_f32_range(&mut self, lo: f32, hi: f32) -> f32 {
        lo + self.next_f32() * (hi - lo)
    }

    /// In-place Fisher-Yates shuffle.
    pub fn shuffle<T>(&mut self, items: &mut [T]) {
        for i in (1..items.len()).rev() {
            let j = (self.next_u64() % (i as u64 + 1)) as usize;
            items.swap(i, j);
        }
    }
}

// ---------------------------------------------------------------------------
// Augmentor
// ---------------------------------------------------------------------------

/// Ranges of the random affine transform.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AffineRanges {
    /// Inclusive zoom range, applied independently per axis.
    pub zoom: (f32, f32),
    /// Maximum absolute shear in degrees.
    pub shear_deg: f32,
    /// Maximum absolute rotation in degrees.
    pub rotation_deg: f32,
}

impl Default for AffineRanges {
    fn default() -> Self {
        AffineRanges { zoom: (0.8, 1.2), shear_deg: 5.0, rotation_deg: 5.0 }
    }
}

/// Draws and applies random affine transforms.
#[derive(Debug, Clone)]
pub struct Augmentor {
    ranges: AffineRanges,
    rng: Xorshift64,
}

impl Augmentor {
    /// Augmentor with the default ranges.
    pub fn new(rng: Xorshift64) -> Self {
        Self::with_ranges(AffineRanges::default(), rng)
    }

    /// Augmentor with custom `ranges`.
    pub fn with_ranges(ranges: AffineRanges, rng: Xorshift64) -> Self {
        Self { ranges, rng }
    }

    /// Draw the 2×2 matrix mapping output offsets to source offsets,
    /// row-major `[a, b, c, d]` for `(dy, dx)`.
    fn draw_matrix(&mut self) -> [f32; 4] {
        let r = self.ranges;
        let theta = self.rng.next_f32_range(-r.rotation_deg, r.rotation_deg).to_radians();
        let shear = self.rng.next_f32_range(-r.shear_deg, r.shear_deg).to_radians();
        let zy = self.rng.next_f32_range(r.zoom.0, r.zoom.1);
        let zx = self.rng.next_f32_range(r.zoom.0, r.zoom.1);

        // rotation · shear · zoom
        let (s, c) = theta.sin_cos();
        let rot = [c, -s, s, c];
        let sh = [1.0, -shear.sin(), 0.0, shear.cos()];
        let rs = mat_mul(rot, sh);
        mat_mul(rs, [zy, 0.0, 0.0, zx])
    }

    /// Return a randomly transformed copy of `image` `[H, W, C]`.
    pub fn augment(&mut self, image: ArrayView3<f32>) -> Array3<f32> {
        let m = self.draw_matrix();
        warp(image, m)
    }

    /// Transform every image of `batch` `[N, H, W, C]` in place.
    pub fn augment_batch(&mut self, batch: &mut Array4<f32>) {
        for mut image in batch.axis_iter_mut(Axis(0)) {
            let out = self.augment(image.view());
            image.assign(&out);
        }
    }
}

fn mat_mul(a: [f32; 4], b: [f32; 4]) -> [f32; 4] {
    [
        a[0] * b[0] + a[1] * b[2],
        a[0] * b[1] + a[1] * b[3],
        a[2] * b[0] + a[3] * b[2],
        a[2] * b[1] + a[3] * b[3],
    ]
}

/// Inverse-map every output pixel through `m` about the centre and sample
/// bilinearly with edge clamping.
fn warp(image: ArrayView3<f32>, m: [f32; 4]) -> Array3<f32> {
    let (h, w, ch) = image.dim();
    let cy = (h as f32 - 1.0) / 2.0;
    let cx = (w as f32 - 1.0) / 2.0;
    let max_y = (h - 1) as f32;
    let max_x = (w - 1) as f32;

    let mut out = Array3::<f32>::zeros((h, w, ch));
    for y in 0..h {
        for x in 0..w {
            let dy = y as f32 - cy;
            let dx = x as f32 - cx;
            let sy = (m[0] * dy + m[1] * dx + cy).clamp(0.0, max_y);
            let sx = (m[2] * dy + m[3] * dx + cx).clamp(0.0, max_x);

            let y0 = sy.floor() as usize;
            let x0 = sx.floor() as usize;
            let y1 = (y0 + 1).min(h - 1);
            let x1 = (x0 + 1).min(w - 1);
            let fy = sy - y0 as f32;
            let fx = sx - x0 as f32;

            for c in 0..ch {
                let top = image[[y0, x0, c]] * (1.0 - fx) + image[[y0, x1, c]] * fx;
                let bottom = image[[y1, x0, c]] * (1.0 - fx) + image[[y1, x1, c]] * fx;
                out[[y, x, c]] = top * (1.0 - fy) + bottom * fy;
            }
        }
    }
    out
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
