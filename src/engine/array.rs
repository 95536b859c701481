use std::fmt;

use ndarray::{Array1, Array2};

use super::error::{EngineError, Result};

/// A value held in the array store or flowing through an expression tree.
#[derive(Clone, Debug, PartialEq)]
pub enum ArrayValue {
    Scalar(f64),
    Vector(Array1<f64>),
    Matrix(Array2<f64>),
    /// An inline constant from an expression tree. Never stored: arithmetic
    /// on literals produces scalars.
    Literal(f64),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ArrayKind {
    Scalar,
    Vector,
    Matrix,
    Literal,
}

impl fmt::Display for ArrayKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ArrayKind::Scalar => "scalar",
            ArrayKind::Vector => "vector",
            ArrayKind::Matrix => "matrix",
            ArrayKind::Literal => "literal",
        };
        f.write_str(name)
    }
}

/// Elementwise kernel: `f(lhs, rhs)` is written back into `lhs`.
pub type Elementwise = fn(f64, f64) -> f64;

pub fn plus(a: f64, b: f64) -> f64 {
    a + b
}

pub fn minus(a: f64, b: f64) -> f64 {
    a - b
}

/// `minus` with its arguments swapped, for writing `b - a` into `a`.
pub fn minus_from(a: f64, b: f64) -> f64 {
    b - a
}

impl ArrayValue {
    pub fn kind(&self) -> ArrayKind {
        match self {
            ArrayValue::Scalar(_) => ArrayKind::Scalar,
            ArrayValue::Vector(_) => ArrayKind::Vector,
            ArrayValue::Matrix(_) => ArrayKind::Matrix,
            ArrayValue::Literal(_) => ArrayKind::Literal,
        }
    }

    /// Dimensions as reported to clients. Scalars and literals have none.
    pub fn dims(&self) -> Vec<u64> {
        match self {
            ArrayValue::Scalar(_) | ArrayValue::Literal(_) => vec![],
            ArrayValue::Vector(v) => vec![v.len() as u64],
            ArrayValue::Matrix(m) => vec![m.nrows() as u64, m.ncols() as u64],
        }
    }

    /// The value of a scalar or literal.
    pub fn as_scalar(&self) -> Option<f64> {
        match self {
            ArrayValue::Scalar(s) | ArrayValue::Literal(s) => Some(*s),
            _ => None,
        }
    }

    /// Applies `f` elementwise, writing into `self`. Both sides must be the
    /// same kind and shape; literals are not allowed. Nothing is modified on
    /// error.
    pub fn zip_assign(&mut self, rhs: &ArrayValue, f: Elementwise) -> Result<()> {
        let (lhs_kind, rhs_kind) = (self.kind(), rhs.kind());
        match (self, rhs) {
            (ArrayValue::Scalar(a), ArrayValue::Scalar(b)) => *a = f(*a, *b),
            (ArrayValue::Vector(a), ArrayValue::Vector(b)) if a.dim() == b.dim() => {
                a.zip_mut_with(b, |x, &y| *x = f(*x, y))
            }
            (ArrayValue::Matrix(a), ArrayValue::Matrix(b)) if a.dim() == b.dim() => {
                a.zip_mut_with(b, |x, &y| *x = f(*x, y))
            }
            (lhs, rhs) if lhs_kind == rhs_kind && lhs_kind != ArrayKind::Literal => {
                return Err(EngineError::mismatch(format!(
                    "{lhs_kind} shapes differ: {:?} and {:?}",
                    lhs.dims(),
                    rhs.dims()
                )))
            }
            _ => {
                return Err(EngineError::mismatch(format!(
                    "elementwise operation on {lhs_kind} and {rhs_kind}"
                )))
            }
        }
        Ok(())
    }

    /// Multiplies every element by `factor`. Literals become scalars.
    pub fn scale_assign(&mut self, factor: f64) {
        match self {
            ArrayValue::Scalar(s) => *s *= factor,
            ArrayValue::Literal(s) => *self = ArrayValue::Scalar(*s * factor),
            ArrayValue::Vector(v) => v.mapv_inplace(|x| x * factor),
            ArrayValue::Matrix(m) => m.mapv_inplace(|x| x * factor),
        }
    }

    /// `self += alpha * x` for vectors of equal length.
    pub fn axpy_assign(&mut self, alpha: f64, x: &ArrayValue) -> Result<()> {
        match (self, x) {
            (ArrayValue::Vector(y), ArrayValue::Vector(x)) if y.len() == x.len() => {
                y.scaled_add(alpha, x);
                Ok(())
            }
            (ArrayValue::Vector(y), ArrayValue::Vector(x)) => Err(EngineError::mismatch(
                format!("axpy on vectors of length {} and {}", x.len(), y.len()),
            )),
            (y, x) => Err(EngineError::mismatch(format!(
                "axpy needs vectors, got {} and {}",
                x.kind(),
                y.kind()
            ))),
        }
    }

    /// Vector·vector gives a scalar, matrix·vector a vector.
    pub fn dot(&self, rhs: &ArrayValue) -> Result<ArrayValue> {
        match (self, rhs) {
            (ArrayValue::Vector(a), ArrayValue::Vector(b)) if a.len() == b.len() => {
                Ok(ArrayValue::Scalar(a.dot(b)))
            }
            (ArrayValue::Matrix(m), ArrayValue::Vector(v)) if m.ncols() == v.len() => {
                Ok(ArrayValue::Vector(m.dot(v)))
            }
            (ArrayValue::Matrix(_), ArrayValue::Matrix(_)) => Err(EngineError::unsupported(
                "matrix-matrix multiplication",
            )),
            (ArrayValue::Vector(_) | ArrayValue::Matrix(_), ArrayValue::Vector(_)) => {
                Err(EngineError::mismatch(format!(
                    "cannot multiply {:?} by {:?}",
                    self.dims(),
                    rhs.dims()
                )))
            }
            (a, b) => Err(EngineError::mismatch(format!(
                "matmul of {} and {}",
                a.kind(),
                b.kind()
            ))),
        }
    }
}
