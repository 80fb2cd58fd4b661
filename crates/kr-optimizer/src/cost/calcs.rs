//! Peak shape measurements on sampled chromatograms.

/// Index of the first maximum, ignoring NaN samples.
fn argmax(y: &[f64]) -> Option<usize> {
    y.iter()
        .enumerate()
        .filter(|(_, v)| !v.is_nan())
        .fold(None, |best: Option<(usize, f64)>, (i, &v)| match best {
            Some((_, b)) if b >= v => best,
            _ => Some((i, v)),
        })
        .map(|(i, _)| i)
}

/// x position of the (first) maximum of `y`.
pub fn peak_timing(x: &[f64], y: &[f64]) -> f64 {
    argmax(&y[..y.len().min(x.len())])
        .map(|i| x[i])
        .unwrap_or(f64::NAN)
}

pub fn peak_height(y: &[f64]) -> f64 {
    argmax(y).map(|i| y[i]).unwrap_or(f64::NAN)
}

/// First index at or after `start`, walking by `step`, whose value is below
/// `threshold`. `None` when the walk leaves the data first.
pub fn find_index_of_first_value_below(
    y: &[f64],
    start: usize,
    threshold: f64,
    step: isize,
) -> Option<usize> {
    let mut i = start as isize;
    while i >= 0 && (i as usize) < y.len() {
        if y[i as usize] < threshold {
            return Some(i as usize);
        }
        i += step;
    }
    None
}

/// Linear interpolation of the x where the segment `i - 1 -> i` crosses `level`.
fn crossing(x: &[f64], y: &[f64], i: usize, level: f64) -> f64 {
    let (x1, y1, x2, y2) = (x[i - 1], y[i - 1], x[i], y[i]);
    if y2 == y1 {
        return f64::NAN;
    }
    x1 + (level - y1) * (x2 - x1) / (y2 - y1)
}

/// Slope of the trailing edge between the `high_frac` and `low_frac`
/// crossings of the peak maximum.
///
/// NaN when the curve ends before dropping below either level.
pub fn trailing_slope(x: &[f64], y: &[f64], low_frac: f64, high_frac: f64) -> f64 {
    let y = &y[..y.len().min(x.len())];
    let Some(imax) = argmax(y) else {
        return f64::NAN;
    };
    let ymax = y[imax];
    let high_level = high_frac * ymax;
    let low_level = low_frac * ymax;

    let Some(i_high) = find_index_of_first_value_below(y, imax, high_level, 1) else {
        return f64::NAN;
    };
    let Some(i_low) = find_index_of_first_value_below(y, i_high, low_level, 1) else {
        return f64::NAN;
    };
    if i_high == 0 || i_low == 0 {
        return f64::NAN;
    }

    let x_high = crossing(x, y, i_high, high_level);
    let x_low = crossing(x, y, i_low, low_level);
    if x_low == x_high {
        return f64::NAN;
    }
    (low_level - high_level) / (x_low - x_high)
}

/// First moment of the curve, by the trapezoid rule.
pub fn peak_center_of_mass(x: &[f64], y: &[f64]) -> f64 {
    let n = x.len().min(y.len());
    let mut area = 0.0;
    let mut moment = 0.0;
    for i in 1..n {
        let dx = x[i] - x[i - 1];
        area += 0.5 * dx * (y[i] + y[i - 1]);
        moment += 0.5 * dx * (x[i] * y[i] + x[i - 1] * y[i - 1]);
    }
    if area == 0.0 {
        f64::NAN
    } else {
        moment / area
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Triangle rising from (0, 0) to (5, 1) and falling back to (10, 0).
    fn triangle() -> (Vec<f64>, Vec<f64>) {
        let x: Vec<f64> = (0..=20).map(|i| i as f64 * 0.5).collect();
        let y = x
            .iter()
            .map(|&v| if v <= 5.0 { v / 5.0 } else { 1.0 - (v - 5.0) / 5.0 })
            .collect();
        (x, y)
    }

    #[test]
    fn timing_and_height_use_first_maximum() {
        let x = vec![0.0, 1.0, 2.0, 3.0];
        let y = vec![0.0, 2.0, 2.0, 1.0];
        assert_eq!(peak_timing(&x, &y), 1.0);
        assert_eq!(peak_height(&y), 2.0);
        assert!(peak_timing(&[], &[]).is_nan());
    }

    #[test]
    fn trailing_slope_of_triangle() {
        let (x, y) = triangle();
        let slope = trailing_slope(&x, &y, 0.2, 0.8);
        assert!((slope + 0.2).abs() < 1e-12, "slope = {slope}");
    }

    #[test]
    fn trailing_slope_is_nan_when_curve_is_cut() {
        let x = vec![0.0, 1.0, 2.0, 3.0];
        let y = vec![0.0, 1.0, 0.9, 0.85];
        assert!(trailing_slope(&x, &y, 0.2, 0.8).is_nan());

        let y = vec![0.0, 1.0, 0.5, 0.3];
        assert!(trailing_slope(&x, &y, 0.2, 0.8).is_nan());
    }

    #[test]
    fn first_value_below_walks_both_ways() {
        let y = vec![0.1, 0.5, 1.0, 0.5, 0.1];
        assert_eq!(find_index_of_first_value_below(&y, 2, 0.6, 1), Some(3));
        assert_eq!(find_index_of_first_value_below(&y, 2, 0.6, -1), Some(1));
        assert_eq!(find_index_of_first_value_below(&y, 2, 0.05, 1), None);
    }

    #[test]
    fn center_of_mass_of_symmetric_peak() {
        let (x, y) = triangle();
        assert!((peak_center_of_mass(&x, &y) - 5.0).abs() < 1e-12);
        assert!(peak_center_of_mass(&x, &vec![0.0; x.len()]).is_nan());
    }
}
