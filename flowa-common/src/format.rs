//! C-style number formatting
//!
//! Solver input files are read by Fortran/C code that expects printf-style
//! exponents (`1.234560E-03`), while Rust's `{:e}` prints `1.23456e-3`.

/// Format `value` like printf `%{width}.{precision}e` (or `E` when `upper`)
pub fn sci(value: f64, width: usize, precision: usize, upper: bool) -> String {
    if !value.is_finite() {
        return format!("{:>width$}", value, width = width);
    }

    let raw = format!("{:.*e}", precision, value);
    let (mantissa, exponent) = match raw.split_once('e') {
        Some(parts) => parts,
        None => return format!("{:>width$}", raw, width = width),
    };
    let exponent: i32 = exponent.parse().unwrap_or(0);
    let sign = if exponent < 0 { '-' } else { '+' };
    let marker = if upper { 'E' } else { 'e' };

    let body = format!("{}{}{}{:02}", mantissa, marker, sign, exponent.abs());
    format!("{:>width$}", body, width = width)
}
