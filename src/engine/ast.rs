use super::{
    error::DecodeError,
    wire::Reader,
    Name,
};

/// Operations an expression node can apply. Code 0 marks a leaf and has no
/// variant here.
#[repr(u64)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Opcode {
    Add = 1,
    Sub = 2,
    Mul = 3,
    Div = 4,
    Matmul = 5,
    Copy = 6,
    Axpy = 7,
    AxpyMultiplier = 8,
    /// Reserved, decodes but is never evaluated.
    Sqrt = 10,
}

impl Opcode {
    pub fn from_code(code: u64) -> Result<Self, DecodeError> {
        Ok(match code {
            1 => Opcode::Add,
            2 => Opcode::Sub,
            3 => Opcode::Mul,
            4 => Opcode::Div,
            5 => Opcode::Matmul,
            6 => Opcode::Copy,
            7 => Opcode::Axpy,
            8 => Opcode::AxpyMultiplier,
            10 => Opcode::Sqrt,
            other => return Err(DecodeError::UnknownOpcode(other)),
        })
    }

    pub fn code(self) -> u64 {
        self as u64
    }

    pub fn arity(self) -> usize {
        match self {
            Opcode::Copy | Opcode::Sqrt => 1,
            Opcode::Add | Opcode::Sub | Opcode::Mul | Opcode::Div | Opcode::Matmul => 2,
            Opcode::Axpy => 3,
            Opcode::AxpyMultiplier => 4,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Opcode::Add => "add",
            Opcode::Sub => "sub",
            Opcode::Mul => "mul",
            Opcode::Div => "div",
            Opcode::Matmul => "matmul",
            Opcode::Copy => "copy",
            Opcode::Axpy => "axpy",
            Opcode::AxpyMultiplier => "axpy_multiplier",
            Opcode::Sqrt => "sqrt",
        }
    }
}

/// One node of a client-submitted expression tree. The tree owns its
/// operands, so dropping the root releases all of it.
#[derive(Clone, Debug, PartialEq)]
pub enum AstNode {
    /// Reference to a stored array.
    Name(Name),
    /// Inline constant.
    Literal(f64),
    Op(OpNode),
}

#[derive(Clone, Debug, PartialEq)]
pub struct OpNode {
    pub opcode: Opcode,
    /// Where the result goes when `store` is set.
    pub result: Name,
    /// Install the result in the store. A node without it is a transient
    /// sub-result that its parent may overwrite.
    pub store: bool,
    pub operands: Vec<AstNode>,
}

impl AstNode {
    pub fn op(opcode: Opcode, result: Name, store: bool, operands: Vec<AstNode>) -> Self {
        AstNode::Op(OpNode {
            opcode,
            result,
            store,
            operands,
        })
    }

    /// True for operation nodes whose result is not kept in the store.
    pub fn is_transient(&self) -> bool {
        matches!(self, AstNode::Op(OpNode { store: false, .. }))
    }

    /// Number of operation levels below and including this node.
    pub fn depth(&self) -> usize {
        match self {
            AstNode::Name(_) | AstNode::Literal(_) => 0,
            AstNode::Op(op) => 1 + op.operands.iter().map(AstNode::depth).max().unwrap_or(0),
        }
    }

    /// Pre-order encoding. Every operand is prefixed with its byte length so a
    /// reader can skip it without parsing.
    ///
    /// leaf: `0:u64 | is_scalar:bool | value:f64 or name:u64`
    /// op:   `opcode:u64 | result:u64 | store:bool | count:u8 | (len:u32 | node)*`
    pub fn encode(&self, buf: &mut Vec<u8>) {
        match self {
            AstNode::Name(name) => {
                buf.extend_from_slice(&0u64.to_le_bytes());
                buf.push(0);
                buf.extend_from_slice(&name.0.to_le_bytes());
            }
            AstNode::Literal(value) => {
                buf.extend_from_slice(&0u64.to_le_bytes());
                buf.push(1);
                buf.extend_from_slice(&value.to_le_bytes());
            }
            AstNode::Op(op) => {
                buf.extend_from_slice(&op.opcode.code().to_le_bytes());
                buf.extend_from_slice(&op.result.0.to_le_bytes());
                buf.push(op.store as u8);
                buf.push(op.operands.len() as u8);
                for operand in &op.operands {
                    let len_at = buf.len();
                    buf.extend_from_slice(&[0; 4]);
                    operand.encode(buf);
                    let len = (buf.len() - len_at - 4) as u32;
                    buf[len_at..len_at + 4].copy_from_slice(&len.to_le_bytes());
                }
            }
        }
    }
}

/// Decodes an expression tree, allowing at most `max_depth` levels of
/// operation nodes.
pub fn decode_ast(reader: &mut Reader<'_>, max_depth: usize) -> Result<AstNode, DecodeError> {
    decode_node(reader, 0, max_depth)
}

fn decode_node(
    reader: &mut Reader<'_>,
    depth: usize,
    max_depth: usize,
) -> Result<AstNode, DecodeError> {
    let code = reader.u64("opcode")?;
    if code == 0 {
        return if reader.bool("is_scalar")? {
            Ok(AstNode::Literal(reader.f64("literal")?))
        } else {
            Ok(AstNode::Name(reader.name("operand name")?))
        };
    }

    if depth >= max_depth {
        return Err(DecodeError::TooDeep(max_depth));
    }
    let opcode = Opcode::from_code(code)?;
    let result = reader.name("result name")?;
    let store = reader.bool("store")?;
    let count = reader.u8("operand count")? as usize;
    if count != opcode.arity() {
        return Err(DecodeError::Arity {
            opcode: opcode.name(),
            expected: opcode.arity(),
            got: count,
        });
    }

    let mut operands = Vec::with_capacity(count);
    for _ in 0..count {
        let declared = reader.u32("operand length")? as usize;
        let mut operand = Reader::new(reader.take(declared, "operand")?);
        operands.push(decode_node(&mut operand, depth + 1, max_depth)?);
        if operand.remaining() != 0 {
            return Err(DecodeError::OperandLength {
                declared,
                used: declared - operand.remaining(),
            });
        }
    }

    Ok(AstNode::op(opcode, result, store, operands))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn axpy_tree() -> AstNode {
        AstNode::op(
            Opcode::Axpy,
            Name(10),
            true,
            vec![
                AstNode::op(
                    Opcode::Mul,
                    Name(11),
                    false,
                    vec![AstNode::Literal(0.5), AstNode::Name(Name(1))],
                ),
                AstNode::Name(Name(2)),
                AstNode::Name(Name(3)),
            ],
        )
    }

    #[test]
    fn decodes_an_encoded_tree() {
        let tree = axpy_tree();
        let mut buf = Vec::new();
        tree.encode(&mut buf);
        let mut reader = Reader::new(&buf);
        assert_eq!(decode_ast(&mut reader, 8).unwrap(), tree);
        assert_eq!(reader.remaining(), 0);
        assert_eq!(tree.depth(), 2);
    }

    #[test]
    fn operand_lengths_describe_the_subtree() {
        let mut buf = Vec::new();
        AstNode::op(
            Opcode::Copy,
            Name(1),
            false,
            vec![AstNode::Name(Name(2))],
        )
        .encode(&mut buf);
        // opcode + result + store + count, then the length prefix
        let len = u32::from_le_bytes(buf[18..22].try_into().unwrap());
        assert_eq!(len, 8 + 1 + 8);
        assert_eq!(buf.len(), 22 + len as usize);
    }

    #[test]
    fn operand_length_must_match_its_node() {
        let mut buf = Vec::new();
        AstNode::op(
            Opcode::Copy,
            Name(1),
            false,
            vec![AstNode::Name(Name(2))],
        )
        .encode(&mut buf);
        // claim one byte more than the leaf uses
        buf[18..22].copy_from_slice(&18u32.to_le_bytes());
        buf.push(0);
        let err = decode_ast(&mut Reader::new(&buf), 8).unwrap_err();
        assert_eq!(err, DecodeError::OperandLength { declared: 18, used: 17 });
    }

    #[test]
    fn truncated_tree_is_an_error() {
        let mut buf = Vec::new();
        axpy_tree().encode(&mut buf);
        buf.truncate(buf.len() - 3);
        assert!(matches!(
            decode_ast(&mut Reader::new(&buf), 8),
            Err(DecodeError::Truncated { .. })
        ));
    }

    #[test]
    fn arity_is_validated() {
        let mut buf = Vec::new();
        AstNode::op(Opcode::Add, Name(1), false, vec![AstNode::Name(Name(2))])
            .encode(&mut buf);
        assert_eq!(
            decode_ast(&mut Reader::new(&buf), 8).unwrap_err(),
            DecodeError::Arity { opcode: "add", expected: 2, got: 1 }
        );
    }

    #[test]
    fn unknown_opcodes_are_rejected() {
        let mut buf = Vec::new();
        buf.extend_from_slice(&9u64.to_le_bytes());
        assert_eq!(
            decode_ast(&mut Reader::new(&buf), 8).unwrap_err(),
            DecodeError::UnknownOpcode(9)
        );
    }

    #[test]
    fn depth_is_capped() {
        let mut tree = AstNode::Name(Name(0));
        for i in 0..3 {
            tree = AstNode::op(Opcode::Copy, Name(i), false, vec![tree]);
        }
        let mut buf = Vec::new();
        tree.encode(&mut buf);
        assert!(decode_ast(&mut Reader::new(&buf), 3).is_ok());
        assert_eq!(
            decode_ast(&mut Reader::new(&buf), 2).unwrap_err(),
            DecodeError::TooDeep(2)
        );
    }
}
