/// Currency utility functions for handling Naira amounts
///
/// All monetary values handled by the engine are integers in kobo
/// (1 Naira = 100 kobo) so splits reconcile exactly.

/// Basis points in one whole (100%).
pub const BPS_DENOMINATOR: i64 = 10_000;

/// Convert Naira to kobo (multiply by 100)
pub fn naira_to_kobo(naira: f64) -> i64 {
    (naira * 100.0).round() as i64
}

/// Convert kobo to Naira (divide by 100)
pub fn kobo_to_naira(kobo: i64) -> f64 {
    kobo as f64 / 100.0
}

/// Format kobo as Naira string with 2 decimal places
pub fn format_kobo_as_naira(kobo: i64) -> String {
    format!("₦{:.2}", kobo_to_naira(kobo))
}

/// Integer division rounding ties away from zero for non-negative inputs
/// (round-half-up). `denominator` must be positive.
///
/// This is the only rounding rule used for money in the crate: commission,
/// milestone amounts and per-milestone commission all go through it.
pub fn round_half_up_div(numerator: i128, denominator: i128) -> i64 {
    debug_assert!(denominator > 0);
    let rounded = if numerator >= 0 {
        (numerator * 2 + denominator) / (denominator * 2)
    } else {
        -((-numerator * 2 + denominator) / (denominator * 2))
    };
    rounded as i64
}

/// `amount * bps / 10_000`, rounded half-up to the smallest unit.
pub fn apply_basis_points(amount: i64, bps: u32) -> i64 {
    round_half_up_div(amount as i128 * bps as i128, BPS_DENOMINATOR as i128)
}

/// Share of `total` proportional to `part / whole`, rounded half-up.
pub fn proportional_share(total: i64, part: i64, whole: i64) -> i64 {
    if whole <= 0 {
        return 0;
    }
    round_half_up_div(total as i128 * part as i128, whole as i128)
}

/// `total * percentage / 100` rounded half-up. Percentages carry at most
/// two decimal places of precision.
pub fn percentage_of(total: i64, percentage: f64) -> i64 {
    let hundredths = (percentage * 100.0).round() as i128;
    round_half_up_div(total as i128 * hundredths, 10_000)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_naira_to_kobo() {
        assert_eq!(naira_to_kobo(100.0), 10000);
        assert_eq!(naira_to_kobo(0.50), 50);
        assert_eq!(naira_to_kobo(123.45), 12345);
    }

    #[test]
    fn test_format_kobo_as_naira() {
        assert_eq!(format_kobo_as_naira(10000), "₦100.00");
        assert_eq!(format_kobo_as_naira(12345), "₦123.45");
    }

    #[test]
    fn test_round_half_up_ties() {
        assert_eq!(round_half_up_div(5, 10), 1);
        assert_eq!(round_half_up_div(15, 10), 2);
        assert_eq!(round_half_up_div(14, 10), 1);
        assert_eq!(round_half_up_div(25, 10), 3);
        assert_eq!(round_half_up_div(0, 7), 0);
    }

    #[test]
    fn test_apply_basis_points() {
        assert_eq!(apply_basis_points(15_000, 1_000), 1_500);
        // 10% of 15 kobo is 1.5 kobo, which rounds up
        assert_eq!(apply_basis_points(15, 1_000), 2);
        assert_eq!(apply_basis_points(14, 1_000), 1);
    }

    #[test]
    fn test_percentage_of() {
        assert_eq!(percentage_of(100_000, 30.0), 30_000);
        assert_eq!(percentage_of(100_000, 33.33), 33_330);
        assert_eq!(percentage_of(1_001, 50.0), 501);
    }

    #[test]
    fn test_proportional_share() {
        assert_eq!(proportional_share(1_500, 3_000, 15_000), 300);
        assert_eq!(proportional_share(10, 1, 3), 3);
        assert_eq!(proportional_share(10, 1, 0), 0);
    }
}
