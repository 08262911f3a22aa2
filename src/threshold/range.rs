//! Nagios threshold ranges
//!
//! | range    | alert when               |
//! |----------|--------------------------|
//! | `10`     | `< 0` or `> 10`          |
//! | `10:`    | `< 10`                   |
//! | `~:10`   | `> 10`                   |
//! | `10:20`  | `< 10` or `> 20`         |
//! | `@10:20` | `>= 10` and `<= 20`      |
//!
//! An empty range never alerts; `@` alone always does.

use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum RangeError {
    #[error("'{0}' is not a number")]
    InvalidNumber(String),

    #[error("lower bound {low} is greater than upper bound {up}")]
    InvertedBounds { low: f64, up: f64 },
}

fn bound(text: &str) -> Result<f64, RangeError> {
    let text = text.trim();
    text.parse()
        .map_err(|_| RangeError::InvalidNumber(text.to_string()))
}

/// Whether `value` falls in the alerting region of `range`
pub fn is_out_of_bounds(value: f64, range: &str) -> Result<bool, RangeError> {
    let range = range.trim();
    let (inside, range) = match range.strip_prefix('@') {
        Some(rest) => (true, rest),
        None => (false, range),
    };
    let range = if range.is_empty() { ":" } else { range };

    let Some((low, up)) = range.split_once(':') else {
        let up = bound(range)?;
        return Ok(if inside {
            (0.0..=up).contains(&value)
        } else {
            value < 0.0 || value > up
        });
    };

    if low.is_empty() && up.is_empty() {
        return Ok(inside);
    }

    let low = low.trim();
    if low.is_empty() || low == "~" {
        let up = bound(up)?;
        return Ok(if inside { value <= up } else { value > up });
    }

    if up.trim().is_empty() {
        let low = bound(low)?;
        return Ok(if inside { value >= low } else { value < low });
    }

    let (low, up) = (bound(low)?, bound(up)?);
    if low > up {
        return Err(RangeError::InvertedBounds { low, up });
    }

    Ok(if inside {
        (low..=up).contains(&value)
    } else {
        value < low || value > up
    })
}
