// Copyright 2025 STARGA Inc.
// Licensed under the Apache License, Version 2.0 (the “License”);
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at:
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an “AS IS” BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

// Part of the MIND project (Machine Intelligence Native Design).

//! 8-bit floating point encodings.
//!
//! Conversions from `f32` round to nearest even and saturate: values beyond
//! the largest finite code (including infinities) clamp to it. The `FNUZ`
//! variants have no negative zero and use `0x80` as their only NaN.

/// Bit layout of one 8-bit float flavour.
#[derive(Debug, Clone, Copy)]
struct Layout {
    mantissa_bits: u32,
    bias: i32,
    /// Largest finite code without the sign bit.
    max_code: u32,
    /// Unsigned-zero flavour: no `-0`, NaN is `0x80`.
    fnuz: bool,
    /// Exponent all-ones encodes infinity/NaN (IEEE-style E5M2).
    ieee_special: bool,
}

const E4M3FN: Layout = Layout {
    mantissa_bits: 3,
    bias: 7,
    max_code: 0x7E,
    fnuz: false,
    ieee_special: false,
};

const E4M3FNUZ: Layout = Layout {
    mantissa_bits: 3,
    bias: 8,
    max_code: 0x7F,
    fnuz: true,
    ieee_special: false,
};

const E5M2: Layout = Layout {
    mantissa_bits: 2,
    bias: 15,
    max_code: 0x7B,
    fnuz: false,
    ieee_special: true,
};

const E5M2FNUZ: Layout = Layout {
    mantissa_bits: 2,
    bias: 16,
    max_code: 0x7F,
    fnuz: true,
    ieee_special: false,
};

fn encode(layout: Layout, value: f32) -> u8 {
    let bits = value.to_bits();
    let sign = ((bits >> 24) & 0x80) as u8;

    if value.is_nan() {
        return if layout.fnuz { 0x80 } else { sign | 0x7F };
    }

    let abs = bits & 0x7FFF_FFFF;
    let exp = (abs >> 23) as i32;
    // f32 subnormals are far below the smallest 8-bit subnormal.
    let magnitude = if exp == 0 {
        0
    } else if value.is_infinite() {
        layout.max_code
    } else {
        let m = layout.mantissa_bits;
        let unbiased = exp - 127;
        let mantissa = (abs & 0x007F_FFFF) | 0x0080_0000;
        let min_normal_exp = 1 - layout.bias;

        let shift = if unbiased >= min_normal_exp {
            23 - m
        } else {
            23 - m + (min_normal_exp - unbiased) as u32
        };
        let rounded = round_shift(mantissa, shift);

        let code = if unbiased >= min_normal_exp {
            let exp_field = (unbiased + layout.bias) as u32;
            // A carry out of the mantissa bumps the exponent by one.
            (exp_field << m) + rounded - (1 << m)
        } else {
            rounded
        };
        code.min(layout.max_code)
    };

    if magnitude == 0 && layout.fnuz {
        0
    } else {
        sign | magnitude as u8
    }
}

/// `value >> shift` rounded to nearest, ties to even.
fn round_shift(value: u32, shift: u32) -> u32 {
    if shift == 0 {
        return value;
    }
    if shift > 25 {
        return 0;
    }
    let quotient = value >> shift;
    let remainder = value & ((1 << shift) - 1);
    let half = 1 << (shift - 1);
    if remainder > half || (remainder == half && quotient & 1 == 1) {
        quotient + 1
    } else {
        quotient
    }
}

fn decode(layout: Layout, code: u8) -> f32 {
    if layout.fnuz && code == 0x80 {
        return f32::NAN;
    }
    let negative = code & 0x80 != 0;
    let m = layout.mantissa_bits;
    let exp_field = ((code & 0x7F) >> m) as i32;
    let mantissa = (code & ((1 << m) - 1)) as f32;
    let exp_max = (1 << (7 - m)) - 1;

    let magnitude = if layout.ieee_special && exp_field == exp_max {
        if mantissa == 0.0 {
            f32::INFINITY
        } else {
            f32::NAN
        }
    } else if !layout.fnuz && !layout.ieee_special && code & 0x7F == 0x7F {
        f32::NAN
    } else if exp_field == 0 {
        mantissa * 2f32.powi(1 - layout.bias - m as i32)
    } else {
        (1.0 + mantissa / (1 << m) as f32) * 2f32.powi(exp_field - layout.bias)
    };

    if negative {
        -magnitude
    } else {
        magnitude
    }
}

macro_rules! float8_type {
    ($(#[$meta:meta])* $name:ident, $layout:expr) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
        pub struct $name(u8);

        impl $name {
            /// Saturating, round-to-nearest-even conversion.
            pub fn from_f32(value: f32) -> Self {
                Self(encode($layout, value))
            }

            pub fn from_bits(bits: u8) -> Self {
                Self(bits)
            }

            pub fn to_bits(self) -> u8 {
                self.0
            }

            pub fn to_f32(self) -> f32 {
                decode($layout, self.0)
            }
        }

        impl From<$name> for f32 {
            fn from(value: $name) -> f32 {
                value.to_f32()
            }
        }
    };
}

float8_type!(
    /// 4 exponent bits, 3 mantissa bits, finite only; max 448.
    F8E4M3FN,
    E4M3FN
);
float8_type!(
    /// 4 exponent bits, 3 mantissa bits, unsigned zero; max 240.
    F8E4M3FNUZ,
    E4M3FNUZ
);
float8_type!(
    /// 5 exponent bits, 2 mantissa bits with infinities; max 57344.
    F8E5M2,
    E5M2
);
float8_type!(
    /// 5 exponent bits, 2 mantissa bits, unsigned zero; max 57344.
    F8E5M2FNUZ,
    E5M2FNUZ
);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exact_values_survive() {
        for v in [0.0f32, 0.5, 1.0, -2.0, 0.125] {
            assert_eq!(F8E4M3FN::from_f32(v).to_f32(), v);
            assert_eq!(F8E4M3FNUZ::from_f32(v).to_f32(), v);
            assert_eq!(F8E5M2::from_f32(v).to_f32(), v);
            assert_eq!(F8E5M2FNUZ::from_f32(v).to_f32(), v);
        }
    }

    #[test]
    fn known_encodings() {
        assert_eq!(F8E4M3FN::from_f32(1.0).to_bits(), 0x38);
        assert_eq!(F8E4M3FN::from_f32(0.5).to_bits(), 0x30);
        assert_eq!(F8E4M3FNUZ::from_f32(1.0).to_bits(), 0x40);
        assert_eq!(F8E5M2::from_f32(1.0).to_bits(), 0x3C);
        assert_eq!(F8E5M2FNUZ::from_f32(1.0).to_bits(), 0x40);
    }

    #[test]
    fn saturates_to_max_finite() {
        assert_eq!(F8E4M3FN::from_f32(1.0e6).to_f32(), 448.0);
        assert_eq!(F8E4M3FN::from_f32(-464.0).to_f32(), -448.0);
        assert_eq!(F8E4M3FNUZ::from_f32(f32::INFINITY).to_f32(), 240.0);
        assert_eq!(F8E5M2::from_f32(f32::INFINITY).to_f32(), 57344.0);
        assert_eq!(F8E5M2FNUZ::from_f32(1.0e9).to_f32(), 57344.0);
    }

    #[test]
    fn rounds_ties_to_even() {
        // 1.0625 sits halfway between 1.0 and 1.125 in E4M3.
        assert_eq!(F8E4M3FN::from_f32(1.0625).to_f32(), 1.0);
        // 1.1875 sits halfway between 1.125 and 1.25; 1.25 has the even mantissa.
        assert_eq!(F8E4M3FN::from_f32(1.1875).to_f32(), 1.25);
    }

    #[test]
    fn subnormals_encode() {
        // Smallest E4M3FN subnormal is 2^-9.
        let tiny = 2f32.powi(-9);
        assert_eq!(F8E4M3FN::from_f32(tiny).to_bits(), 0x01);
        assert_eq!(F8E4M3FN::from_f32(tiny).to_f32(), tiny);
        assert_eq!(F8E4M3FN::from_f32(tiny / 4.0).to_f32(), 0.0);
    }

    #[test]
    fn nan_and_zero_conventions() {
        assert!(F8E4M3FN::from_f32(f32::NAN).to_f32().is_nan());
        assert_eq!(F8E4M3FNUZ::from_f32(f32::NAN).to_bits(), 0x80);
        assert_eq!(F8E4M3FNUZ::from_f32(-0.0).to_bits(), 0x00);
        assert_eq!(F8E4M3FN::from_f32(-0.0).to_bits(), 0x80);
        assert!(F8E5M2::from_bits(0x7C).to_f32().is_infinite());
    }
}
