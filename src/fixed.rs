//! Q-format fixed-point conversions for the wire encodings.
//!
//! The ICD expresses every analog quantity as `Qm.n`/`UQm.n`: `m` integer
//! bits, `n` fractional bits, value = raw / 2^n. Conversions round to
//! nearest and saturate at both ends of the representable range, so a
//! setpoint just past full scale reads back as full scale rather than
//! wrapping.
//!
//! All intermediate math is f64: an f32 near the top of a 32-bit format has
//! less precision than the format itself, and the round trip must stay
//! within one LSB.

/// Encode an unsigned `UQm.n` value. NaN and negative inputs saturate to 0.
pub fn to_unsigned_fixed(value: f32, int_bits: u32, frac_bits: u32) -> u32 {
    let total = int_bits + frac_bits;
    debug_assert!(total <= 32 && frac_bits < 32);

    let max: u64 = if total >= 32 {
        u32::MAX as u64
    } else {
        (1u64 << total) - 1
    };

    if !(value > 0.) {
        return 0;
    }

    let scaled = value as f64 * (1u64 << frac_bits) as f64;
    // Casts from float saturate, so overflow past u64 cannot wrap.
    let rounded = (scaled + 0.5) as u64;
    rounded.min(max) as u32
}

/// Decode an unsigned `UQm.n` value.
pub fn from_unsigned_fixed(raw: u32, frac_bits: u32) -> f32 {
    (raw as f64 / (1u64 << frac_bits) as f64) as f32
}

/// Encode a signed `Qm.n` value; the sign bit lives inside the `m + n` total.
pub fn to_signed_fixed(value: f32, int_bits: u32, frac_bits: u32) -> i32 {
    let total = int_bits + frac_bits;
    debug_assert!(total >= 2 && total <= 32 && frac_bits < 32);

    let max = (1i64 << (total - 1)) - 1;
    let min = -(1i64 << (total - 1));

    if value.is_nan() {
        return 0;
    }

    let scaled = value as f64 * (1u64 << frac_bits) as f64;
    let rounded = if scaled >= 0. {
        (scaled + 0.5) as i64
    } else {
        (scaled - 0.5) as i64
    };
    rounded.clamp(min, max) as i32
}

/// Decode a signed `Qm.n` value.
pub fn from_signed_fixed(raw: i32, frac_bits: u32) -> f32 {
    (raw as f64 / (1u64 << frac_bits) as f64) as f32
}
