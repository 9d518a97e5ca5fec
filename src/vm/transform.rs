//! Reversible numeric transforms applied between the wire (raw) value and
//! the host (engineering) value. A pending transform is set by a
//! `TRANS_*`/`SCALE_LIN` opcode and consumed (then reset) by the very
//! next I/O opcode.

use crate::error::{bail, ensure, error, ErrorContext, Result};

/// One pending transform, built from whichever `TRANS_*`/`SCALE_LIN`
/// opcode most recently ran. Reused for both the integer and floating
/// I/O opcodes that can carry one.
#[derive(Debug, Clone, PartialEq)]
pub enum Transform {
    /// `SCALE_LIN`: `y = x*factor + offset`, `y` engineering, `x` raw.
    Linear { factor: f64, offset: f64 },
    Add(i64),
    Sub(i64),
    Mul(i64),
    Div(i64),
    /// `y = c0 + c1*x + c2*x^2 + ...`, evaluated on decode; encode inverts
    /// numerically (Newton's method) since coefficients over degree 1
    /// have no closed-form inverse in general.
    Poly(Vec<f64>),
    /// Piecewise-linear interpolation through `(x, y)` points, sorted
    /// ascending by `x`. Encode looks the point up by `y`, so the `y`
    /// sequence must also be monotonic for the inverse to be well defined
    /// (this is an assumption on the schema author, not checked here).
    Spline(Vec<(f64, f64)>),
}

struct TransformCtx<'a>(&'a str);
impl<'a> ErrorContext for TransformCtx<'a> {
    fn error_context(&self) -> String {
        self.0.to_string()
    }
}

impl Transform {
    /// Engineering value (from the host, on ENCODE) -> raw wire value.
    pub fn to_wire_f64(&self, eng: f64) -> Result<f64> {
        let ctx = TransformCtx("transform encode");
        match self {
            Transform::Linear { factor, offset } => {
                ensure!(*factor != 0.0, Arithmetic, Some(&ctx), "scale factor is zero, cannot invert");
                Ok((eng - offset) / factor)
            }
            Transform::Poly(coeffs) => poly_invert(coeffs, eng),
            Transform::Spline(points) => spline_invert(points, eng),
            Transform::Add(_) | Transform::Sub(_) | Transform::Mul(_) | Transform::Div(_) => {
                Ok(self.to_wire_i64(eng as i64)? as f64)
            }
        }
    }

    /// Raw wire value (just read, on DECODE) -> engineering value
    /// delivered to the host.
    pub fn from_wire_f64(&self, raw: f64) -> Result<f64> {
        match self {
            Transform::Linear { factor, offset } => Ok(raw * factor + offset),
            Transform::Poly(coeffs) => Ok(poly_eval(coeffs, raw)),
            Transform::Spline(points) => spline_eval(points, raw),
            Transform::Add(_) | Transform::Sub(_) | Transform::Mul(_) | Transform::Div(_) => {
                Ok(self.from_wire_i64(raw as i64)? as f64)
            }
        }
    }

    pub fn to_wire_i64(&self, eng: i64) -> Result<i64> {
        let ctx = TransformCtx("transform encode");
        match self {
            Transform::Add(v) => eng.checked_add(*v).ok_or_else(|| overflow_err(&ctx)),
            Transform::Sub(v) => eng.checked_sub(*v).ok_or_else(|| overflow_err(&ctx)),
            Transform::Mul(v) => eng.checked_mul(*v).ok_or_else(|| overflow_err(&ctx)),
            Transform::Div(v) => {
                ensure!(*v != 0, Arithmetic, Some(&ctx), "division by zero in @div transform");
                eng.checked_mul(*v).ok_or_else(|| overflow_err(&ctx))
            }
            Transform::Linear { .. } | Transform::Poly(_) | Transform::Spline(_) => {
                Ok(self.to_wire_f64(eng as f64)?.round() as i64)
            }
        }
    }

    pub fn from_wire_i64(&self, raw: i64) -> Result<i64> {
        let ctx = TransformCtx("transform decode");
        match self {
            Transform::Add(v) => raw.checked_sub(*v).ok_or_else(|| overflow_err(&ctx)),
            Transform::Sub(v) => raw.checked_add(*v).ok_or_else(|| overflow_err(&ctx)),
            Transform::Mul(v) => {
                ensure!(*v != 0, Arithmetic, Some(&ctx), "division by zero in @mul transform inverse");
                ensure!(raw % v == 0, Arithmetic, Some(&ctx), "{} is not evenly divisible by @mul factor {}", raw, v);
                Ok(raw / v)
            }
            Transform::Div(v) => raw.checked_div(*v).ok_or_else(|| overflow_err(&ctx)),
            Transform::Linear { .. } | Transform::Poly(_) | Transform::Spline(_) => {
                Ok(self.from_wire_f64(raw as f64)?.round() as i64)
            }
        }
    }
}

fn overflow_err(ctx: &TransformCtx) -> crate::error::Error {
    error!(Arithmetic, Some(ctx), "integer transform overflowed")
}

fn poly_eval(coeffs: &[f64], x: f64) -> f64 {
    let mut acc = 0.0;
    let mut pow = 1.0;
    for c in coeffs {
        acc += c * pow;
        pow *= x;
    }
    acc
}

fn poly_invert(coeffs: &[f64], y: f64) -> Result<f64> {
    let ctx = TransformCtx("poly transform inverse");
    if coeffs.len() <= 1 {
        bail!(Arithmetic, Some(&ctx), "constant polynomial has no inverse");
    }
    if coeffs.len() == 2 {
        ensure!(coeffs[1] != 0.0, Arithmetic, Some(&ctx), "linear poly coefficient is zero");
        return Ok((y - coeffs[0]) / coeffs[1]);
    }
    // Newton's method from x0=0, a handful of iterations is enough for the
    // smooth low-degree polynomials schema authors use for calibration
    // curves.
    let mut x = 0.0f64;
    for _ in 0..64 {
        let f = poly_eval(coeffs, x) - y;
        let mut df = 0.0;
        let mut pow = 1.0;
        for (i, c) in coeffs.iter().enumerate().skip(1) {
            df += c * (i as f64) * pow;
            pow *= x;
        }
        if df.abs() < 1e-12 {
            bail!(Arithmetic, Some(&ctx), "polynomial derivative vanished during inversion");
        }
        let step = f / df;
        x -= step;
        if step.abs() < 1e-12 {
            return Ok(x);
        }
    }
    bail!(Arithmetic, Some(&ctx), "polynomial inverse did not converge");
}

fn spline_eval(points: &[(f64, f64)], x: f64) -> Result<f64> {
    let ctx = TransformCtx("spline transform");
    ensure!(points.len() >= 2, Arithmetic, Some(&ctx), "spline needs at least two points");
    for w in points.windows(2) {
        let (x0, y0) = w[0];
        let (x1, y1) = w[1];
        if x >= x0 && x <= x1 {
            ensure!(x1 != x0, Arithmetic, Some(&ctx), "spline has two points with the same x");
            let t = (x - x0) / (x1 - x0);
            return Ok(y0 + t * (y1 - y0));
        }
    }
    // Outside the declared range: extrapolate using the nearest segment.
    if x < points[0].0 {
        let (x0, y0) = points[0];
        let (x1, y1) = points[1];
        let t = (x - x0) / (x1 - x0);
        return Ok(y0 + t * (y1 - y0));
    }
    let n = points.len();
    let (x0, y0) = points[n - 2];
    let (x1, y1) = points[n - 1];
    let t = (x - x0) / (x1 - x0);
    Ok(y0 + t * (y1 - y0))
}

fn spline_invert(points: &[(f64, f64)], y: f64) -> Result<f64> {
    let inverted: Vec<(f64, f64)> = points.iter().map(|&(x, y)| (y, x)).collect();
    spline_eval(&inverted, y)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn linear_round_trips() {
        let t = Transform::Linear { factor: 0.1, offset: 0.0 };
        // engineering value 15.0 scaled by 0.1 should read back as raw 150.
        let raw_f = t.to_wire_f64(15.0).unwrap();
        assert!((raw_f - 150.0).abs() < 1e-9);
        let eng = t.from_wire_f64(raw_f).unwrap();
        assert!((eng - 15.0).abs() < 1e-9);
    }

    #[test]
    fn add_transform_inverts() {
        let t = Transform::Add(10);
        let wire = t.to_wire_i64(5).unwrap();
        assert_eq!(wire, 15);
        assert_eq!(t.from_wire_i64(wire).unwrap(), 5);
    }

    #[test]
    fn div_by_zero_is_arithmetic_error() {
        let t = Transform::Div(0);
        assert_eq!(t.to_wire_i64(5).unwrap_err().kind(), crate::error::ErrorKind::Arithmetic);
    }

    #[test]
    fn linear_poly_round_trips() {
        let t = Transform::Poly(vec![1.0, 2.0]); // y = 1 + 2x
        let raw = t.to_wire_f64(5.0).unwrap();
        assert!((raw - 2.0).abs() < 1e-9);
        assert!((t.from_wire_f64(raw).unwrap() - 5.0).abs() < 1e-9);
    }

    #[test]
    fn quadratic_poly_inverts_numerically() {
        let t = Transform::Poly(vec![0.0, 0.0, 1.0]); // y = x^2, x>=0 branch from x0=0
        let raw = t.to_wire_f64(9.0).unwrap();
        assert!((raw * raw - 9.0).abs() < 1e-6);
    }

    #[test]
    fn spline_interpolates_and_inverts() {
        let t = Transform::Spline(vec![(0.0, 0.0), (10.0, 100.0)]);
        assert!((t.from_wire_f64(5.0).unwrap() - 50.0).abs() < 1e-9);
        assert!((t.to_wire_f64(50.0).unwrap() - 5.0).abs() < 1e-9);
    }
}
