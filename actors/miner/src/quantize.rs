// Copyright 2019-2022 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

use fvm_shared::clock::ChainEpoch;

/// Constant defining no quantization.
pub const NO_QUANTIZATION: QuantSpec = QuantSpec { unit: 1, offset: 0 };

/// A spec for epoch quantization.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct QuantSpec {
    /// The unit of quantization
    pub unit: ChainEpoch,
    /// The offset from zero at which to base the modulus
    pub offset: ChainEpoch,
}

impl QuantSpec {
    /// Rounds `epoch` to the nearest exact multiple of the quantization unit offset by
    /// `offset % unit`, rounding up.
    ///
    /// This function is equivalent to `unit * ceil(epoch - (offset % unit) / unit) + (offset % unit)`
    /// with the variables/operations over real numbers instead of ints.
    pub fn quantize_up(&self, epoch: ChainEpoch) -> ChainEpoch {
        // Euclidean remainders keep the grid anchored at `offset` for epochs on
        // either side of it.
        let offset = self.offset.rem_euclid(self.unit);
        let shifted = epoch - offset;

        let remainder = shifted.rem_euclid(self.unit);
        let quotient = shifted.div_euclid(self.unit);

        // Don't round if epoch falls on a quantization epoch.
        let rounded =
            if remainder == 0 { self.unit * quotient } else { self.unit * (quotient + 1) };

        rounded + offset
    }

    pub fn quantize_down(&self, epoch: ChainEpoch) -> ChainEpoch {
        let next = self.quantize_up(epoch);
        // `quantize_up` rounds up to the next quantized epoch, so if we're not
        // already on one, back off by a full unit.
        if epoch == next { next } else { next - self.unit }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    #[test]
    fn no_quantization_is_identity() {
        for e in [-10, -1, 0, 1, 42, i64::MAX / 2] {
            assert_eq!(e, NO_QUANTIZATION.quantize_up(e));
        }
    }

    #[test_case(2, 5; "rounds_up_within_unit")]
    #[test_case(5, 5; "on_grid_is_unchanged")]
    #[test_case(6, 9; "rounds_up_past_grid_point")]
    #[test_case(8, 9; "rounds_up_to_next_grid_point")]
    #[test_case(11, 13; "rounds_up_in_later_unit")]
    #[test_case(13, 13; "later_grid_point_is_unchanged")]
    fn rounds_up_to_the_grid(epoch: ChainEpoch, expected: ChainEpoch) {
        let quant = QuantSpec { unit: 4, offset: 1 };
        assert_eq!(expected, quant.quantize_up(epoch));
    }

    // -3 is already on the grid (-3 ≡ 1 mod 4).
    #[test_case(-3, -3; "negative_on_grid_is_unchanged")]
    #[test_case(-2, 1; "rounds_up_across_zero")]
    #[test_case(-6, -3; "rounds_up_below_zero")]
    #[test_case(-7, -7; "negative_grid_point_is_unchanged")]
    fn handles_negative_epochs(epoch: ChainEpoch, expected: ChainEpoch) {
        let quant = QuantSpec { unit: 4, offset: 1 };
        assert_eq!(expected, quant.quantize_up(epoch));
    }

    #[test]
    fn offset_larger_than_unit_is_reduced() {
        let a = QuantSpec { unit: 5, offset: 3 };
        let b = QuantSpec { unit: 5, offset: 8 };
        for e in -20..20 {
            assert_eq!(a.quantize_up(e), b.quantize_up(e));
        }
    }

    #[test]
    fn quantize_down_matches_up() {
        let quant = QuantSpec { unit: 7, offset: 2 };
        for e in -30..30 {
            let down = quant.quantize_down(e);
            assert!(down <= e);
            assert_eq!(down, quant.quantize_up(down));
            assert!(quant.quantize_up(e) - down < 2 * quant.unit);
        }
    }
}
