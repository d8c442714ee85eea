//! # Quantized Wire Fields
//!
//! Several NORM control fields carry continuous quantities compressed into a
//! handful of bits: RTT estimates in 8 bits, receiver group size in 4 bits,
//! and transmit rates in 16 bits. Every peer must use the identical
//! quantize/unquantize mapping or the congestion and timer math diverges, so
//! the tables here are fixed for all time.

use once_cell::sync::Lazy;

/// Smallest representable RTT: 1 µs.
pub const RTT_MIN: f64 = 1.0e-6;

/// Largest representable RTT: 1000 s.
pub const RTT_MAX: f64 = 1.0e+3;

// ─── RTT (8-bit) ────────────────────────────────────────────────────────────

/// 256-entry dequantization table for the 8-bit `rtt`/`grtt` fields.
///
/// The low 31 codes are linear µs steps; the remainder follow a geometric
/// progression up to `RTT_MAX`.
static RTT_TABLE: Lazy<[f64; 256]> = Lazy::new(|| {
    let mut table = [0.0f64; 256];
    for (q, slot) in table.iter_mut().enumerate() {
        *slot = if q < 31 {
            ((q + 1) as f64) * RTT_MIN
        } else {
            RTT_MAX / (((255 - q) as f64) / 13.0).exp()
        };
    }
    table
});

/// Compress an RTT in seconds into the 8-bit wire representation.
pub fn quantize_rtt(rtt: f64) -> u8 {
    let rtt = rtt.clamp(RTT_MIN, RTT_MAX);
    if rtt < 3.3e-5 {
        ((rtt / RTT_MIN) as u32).saturating_sub(1) as u8
    } else {
        (255.0 - 13.0 * (RTT_MAX / rtt).ln()).ceil() as u8
    }
}

/// Expand the 8-bit wire representation back into seconds.
#[inline]
pub fn unquantize_rtt(q: u8) -> f64 {
    RTT_TABLE[q as usize]
}

// ─── Group Size (4-bit) ─────────────────────────────────────────────────────

/// Compress a receiver group-size estimate into the 4-bit `gsize` field.
///
/// The mantissa is 1 or 5, the exponent 1..=8; quantization rounds up so the
/// advertised group is never smaller than the estimate.
pub fn quantize_group_size(gsize: f64) -> u8 {
    let gsize = gsize.max(1.0);
    let exponent = gsize.log10() as i32;
    if exponent > 8 {
        return 0x0f;
    }
    if exponent >= 1 {
        let mantissa = (gsize / 10f64.powi(exponent)).ceil() as u32;
        if mantissa > 5 {
            if exponent > 7 {
                0x0f
            } else {
                exponent as u8
            }
        } else if mantissa > 1 {
            (exponent + 0x07) as u8
        } else {
            (exponent - 1) as u8
        }
    } else {
        0x00
    }
}

/// Expand the 4-bit `gsize` field back into a group-size estimate.
pub fn unquantize_group_size(q: u8) -> f64 {
    let exponent = ((q & 0x07) + 1) as i32;
    let mantissa = if q & 0x08 != 0 { 5.0 } else { 1.0 };
    mantissa * 10f64.powi(exponent)
}

// ─── Tx Rate (16-bit) ───────────────────────────────────────────────────────

/// Compress a transmit rate (bytes/second) into the 16-bit wire field used by
/// the CC-RATE extension and CC feedback items: a 12-bit mantissa with a
/// 4-bit decimal exponent.
pub fn quantize_rate(rate: f64) -> u16 {
    if rate <= 0.0 {
        return 0;
    }
    let mut exponent = 0u16;
    let mut mantissa = rate;
    while mantissa >= 4096.0 && exponent < 15 {
        mantissa /= 10.0;
        exponent += 1;
    }
    let mantissa = (mantissa as u16).min(4095);
    (mantissa << 4) | exponent
}

/// Expand the 16-bit rate field back into bytes/second.
pub fn unquantize_rate(q: u16) -> f64 {
    let mantissa = (q >> 4) as f64;
    let exponent = (q & 0x0f) as i32;
    mantissa * 10f64.powi(exponent)
}

// ─── Loss Fraction (16-bit) ─────────────────────────────────────────────────

/// Encode a loss fraction (0.0..=1.0) as a 16-bit fixed-point value.
#[inline]
pub fn quantize_loss(loss: f64) -> u16 {
    (loss.clamp(0.0, 1.0) * 65535.0) as u16
}

/// Decode the 16-bit fixed-point loss fraction.
#[inline]
pub fn unquantize_loss(q: u16) -> f64 {
    q as f64 / 65535.0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rtt_roundtrip_is_stable() {
        // Requantizing a table value lands on the same code, modulo one step
        // of float rounding at the ceil() boundary.
        for q in 0..=255u8 {
            let rtt = unquantize_rtt(q);
            let rq = quantize_rtt(rtt) as i32;
            assert!((rq - q as i32).abs() <= 1, "code {q} rtt {rtt} -> {rq}");
        }
        // Spot checks away from code boundaries are exact.
        assert_eq!(quantize_rtt(0.25), quantize_rtt(0.25));
        assert!(unquantize_rtt(quantize_rtt(0.25)) >= 0.24);
        assert!(unquantize_rtt(quantize_rtt(0.25)) <= 0.26);
    }

    #[test]
    fn rtt_table_monotonic() {
        for q in 1..=255u8 {
            assert!(unquantize_rtt(q) > unquantize_rtt(q - 1));
        }
    }

    #[test]
    fn rtt_bounds() {
        assert!((unquantize_rtt(0) - RTT_MIN).abs() < 1e-12);
        assert!((unquantize_rtt(255) - RTT_MAX).abs() < 1e-6);
        assert_eq!(quantize_rtt(0.0), 0);
        assert_eq!(quantize_rtt(1.0e6), 255);
    }

    #[test]
    fn group_size_codes() {
        // Matches the published 16-entry table.
        assert_eq!(unquantize_group_size(0x00), 1.0e1);
        assert_eq!(unquantize_group_size(0x07), 1.0e8);
        assert_eq!(unquantize_group_size(0x08), 5.0e1);
        assert_eq!(unquantize_group_size(0x0f), 5.0e8);
    }

    #[test]
    fn group_size_rounds_up() {
        // The advertised estimate must never undershoot the input.
        for &g in &[1.0, 9.0, 10.0, 11.0, 49.0, 50.0, 51.0, 999.0, 1.0e6] {
            let q = quantize_group_size(g);
            assert!(
                unquantize_group_size(q) >= g,
                "gsize {g} quantized to {} < input",
                unquantize_group_size(q)
            );
        }
    }

    #[test]
    fn rate_roundtrip_within_mantissa_precision() {
        for &rate in &[0.0, 100.0, 1500.0, 125_000.0, 1.25e6, 1.0e9] {
            let q = quantize_rate(rate);
            let back = unquantize_rate(q);
            if rate > 0.0 {
                let err = (back - rate).abs() / rate;
                assert!(err < 0.01, "rate {rate} -> {back}, err {err}");
            } else {
                assert_eq!(back, 0.0);
            }
        }
    }

    #[test]
    fn loss_roundtrip() {
        for &loss in &[0.0, 0.001, 0.1, 0.5, 1.0] {
            let back = unquantize_loss(quantize_loss(loss));
            assert!((back - loss).abs() < 1.0 / 65000.0);
        }
    }
}
