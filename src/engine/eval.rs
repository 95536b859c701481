use std::sync::Arc;

use tracing::trace;

use super::{
    array::{minus, minus_from, plus, ArrayKind, ArrayValue, Elementwise},
    ast::{AstNode, OpNode, Opcode},
    error::{DecodeError, EngineError, Result},
    store::ArrayStore,
    wire::StoredResult,
};

/// Walks an expression tree bottom-up and writes `store` results into the
/// array store.
///
/// With `in_place` set, an operand that is a transient sub-result and is not
/// referenced from anywhere else has its buffer reused for the parent's result.
/// Both paths go through the same element kernels, so the result is the same
/// either way.
pub struct Evaluator<'s> {
    store: &'s mut ArrayStore,
    in_place: bool,
    stored: Vec<StoredResult>,
}

impl<'s> Evaluator<'s> {
    pub fn new(store: &'s mut ArrayStore, in_place: bool) -> Self {
        Self {
            store,
            in_place,
            stored: Vec::new(),
        }
    }

    pub fn evaluate(&mut self, node: &AstNode) -> Result<Arc<ArrayValue>> {
        match node {
            AstNode::Name(name) => Ok(self.store.lookup(*name)?.clone()),
            AstNode::Literal(value) => Ok(Arc::new(ArrayValue::Literal(*value))),
            AstNode::Op(op) => {
                let args = op
                    .operands
                    .iter()
                    .map(|operand| self.evaluate(operand))
                    .collect::<Result<Vec<_>>>()?;
                let result = self.apply(op, args)?;
                if op.store {
                    self.store.insert(op.result, result.clone());
                    self.stored.push(StoredResult {
                        name: op.result,
                        dims: result.dims(),
                    });
                }
                Ok(result)
            }
        }
    }

    /// Names and shapes of everything stored so far, in evaluation order.
    pub fn into_stored(self) -> Vec<StoredResult> {
        self.stored
    }

    /// Hands out the operand's buffer for mutation if it may be donated.
    fn donate<'v>(
        &self,
        node: &AstNode,
        value: &'v mut Arc<ArrayValue>,
    ) -> Option<&'v mut ArrayValue> {
        if self.in_place && node.is_transient() {
            Arc::get_mut(value)
        } else {
            None
        }
    }

    fn apply(&self, op: &OpNode, args: Vec<Arc<ArrayValue>>) -> Result<Arc<ArrayValue>> {
        trace!(op = op.opcode.name(), result = %op.result, store = op.store, "applying");
        match op.opcode {
            Opcode::Add => self.elementwise(op, args, plus, plus),
            Opcode::Sub => self.elementwise(op, args, minus, minus_from),
            Opcode::Mul => {
                let [x, y] = operands::<2>(op, args)?;
                let (factor, mut target, node) = match (x.as_scalar(), y.as_scalar()) {
                    (Some(factor), _) => (factor, y, &op.operands[1]),
                    (None, Some(factor)) => (factor, x, &op.operands[0]),
                    (None, None) => {
                        return Err(EngineError::mismatch(format!(
                            "mul needs a scalar operand, got {} and {}",
                            x.kind(),
                            y.kind()
                        )))
                    }
                };
                if let Some(buf) = self.donate(node, &mut target) {
                    buf.scale_assign(factor);
                    return Ok(target);
                }
                let mut out = (*target).clone();
                out.scale_assign(factor);
                Ok(Arc::new(out))
            }
            Opcode::Div => {
                let [x, y] = operands::<2>(op, args)?;
                match (x.as_scalar(), y.as_scalar()) {
                    (Some(a), Some(b)) => Ok(Arc::new(ArrayValue::Scalar(a / b))),
                    _ => Err(EngineError::mismatch(format!(
                        "div needs scalars, got {} and {}",
                        x.kind(),
                        y.kind()
                    ))),
                }
            }
            Opcode::Matmul => {
                let [x, y] = operands::<2>(op, args)?;
                x.dot(&y).map(Arc::new)
            }
            Opcode::Copy => {
                let [x] = operands::<1>(op, args)?;
                match x.kind() {
                    ArrayKind::Scalar | ArrayKind::Vector => Ok(Arc::new((*x).clone())),
                    ArrayKind::Matrix => Err(EngineError::unsupported("matrix copy")),
                    ArrayKind::Literal => Err(EngineError::mismatch("copy of a literal")),
                }
            }
            Opcode::Axpy => {
                let [a, x, y] = operands::<3>(op, args)?;
                self.axpy(op, scalar_operand(&a, "axpy coefficient")?, &x, y)
            }
            Opcode::AxpyMultiplier => {
                let [a, x, y, multiplier] = operands::<4>(op, args)?;
                let multiplier = match *multiplier {
                    ArrayValue::Literal(m) => m,
                    ref other => {
                        return Err(EngineError::mismatch(format!(
                            "axpy multiplier must be a literal, got {}",
                            other.kind()
                        )))
                    }
                };
                let alpha = multiplier * scalar_operand(&a, "axpy coefficient")?;
                self.axpy(op, alpha, &x, y)
            }
            Opcode::Sqrt => Err(EngineError::unsupported("sqrt is reserved")),
        }
    }

    fn elementwise(
        &self,
        op: &OpNode,
        args: Vec<Arc<ArrayValue>>,
        forward: Elementwise,
        backward: Elementwise,
    ) -> Result<Arc<ArrayValue>> {
        let [mut x, mut y] = operands::<2>(op, args)?;
        if let Some(buf) = self.donate(&op.operands[0], &mut x) {
            buf.zip_assign(&y, forward)?;
            return Ok(x);
        }
        if let Some(buf) = self.donate(&op.operands[1], &mut y) {
            buf.zip_assign(&x, backward)?;
            return Ok(y);
        }
        let mut out = (*x).clone();
        out.zip_assign(&y, forward)?;
        Ok(Arc::new(out))
    }

    /// `alpha * x + y`, reusing `y` when it is the operand at index 2.
    fn axpy(
        &self,
        op: &OpNode,
        alpha: f64,
        x: &ArrayValue,
        mut y: Arc<ArrayValue>,
    ) -> Result<Arc<ArrayValue>> {
        if let Some(buf) = self.donate(&op.operands[2], &mut y) {
            buf.axpy_assign(alpha, x)?;
            return Ok(y);
        }
        let mut out = (*y).clone();
        out.axpy_assign(alpha, x)?;
        Ok(Arc::new(out))
    }
}

fn operands<const N: usize>(
    op: &OpNode,
    args: Vec<Arc<ArrayValue>>,
) -> Result<[Arc<ArrayValue>; N]> {
    let got = args.len();
    args.try_into().map_err(|_| {
        EngineError::ProtocolDecode(DecodeError::Arity {
            opcode: op.opcode.name(),
            expected: N,
            got,
        })
    })
}

fn scalar_operand(value: &ArrayValue, what: &str) -> Result<f64> {
    match value {
        ArrayValue::Scalar(s) | ArrayValue::Literal(s) => Ok(*s),
        other => Err(EngineError::mismatch(format!(
            "{what} must be a scalar, got {}",
            other.kind()
        ))),
    }
}
