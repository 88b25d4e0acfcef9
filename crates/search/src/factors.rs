//! Divisor enumeration for dimension extents.

use tilescout_model::{Error, Result};

/// All divisors of `n` in ascending order, including 1 and `n`.
///
/// Runs in O(√n): for each divisor `i` up to √n, both `i` and `n / i`
/// are collected unless they coincide. Zero is rejected with
/// [`Error::InvalidArgument`].
pub fn factors(n: u64) -> Result<Vec<u64>> {
    if n == 0 {
        return Err(Error::InvalidArgument(
            "factors requires a positive extent".into(),
        ));
    }

    let mut out = Vec::new();
    let mut i = 1;
    while i * i <= n {
        if n % i == 0 {
            out.push(i);
            if i != n / i {
                out.push(n / i);
            }
        }
        i += 1;
    }
    out.sort_unstable();
    Ok(out)
}
