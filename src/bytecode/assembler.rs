use super::{BytecodeProgram, Instruction, Opcode};
use crate::error::{Error, Result};

/// Appends encoded instructions to a size-bounded buffer.
#[derive(Debug)]
pub struct Assembler {
    code: Vec<u8>,
    limit: usize,
    last: Option<usize>,
    count: usize,
}

impl Assembler {
    pub fn new(limit: usize) -> Self {
        Self {
            code: Vec::with_capacity(limit.min(4096)),
            limit,
            last: None,
            count: 0,
        }
    }

    pub fn emit(&mut self, instruction: Instruction) -> Result<()> {
        let start = self.code.len();
        instruction.encode(&mut self.code)?;
        if self.code.len() > self.limit {
            self.code.truncate(start);
            return Err(Error::encoding(self.limit));
        }
        self.last = Some(start);
        self.count += 1;
        Ok(())
    }

    pub fn last_opcode(&self) -> Option<Opcode> {
        self.last
            .and_then(|pos| self.code.get(pos))
            .and_then(|byte| Opcode::from_byte(*byte))
    }

    /// Patch the opcode byte of the most recent instruction. Only opcodes
    /// with identical operand layouts may be swapped.
    pub fn rewrite_last(&mut self, from: Opcode, to: Opcode) -> Result<()> {
        match (self.last, self.last_opcode()) {
            (Some(pos), Some(op)) if op == from => {
                self.code[pos] = to as u8;
                Ok(())
            }
            (_, found) => Err(Error::config(format!(
                "cannot rewrite {:?} to {}: last instruction is {:?}",
                from, to, found
            ))),
        }
    }

    pub fn len(&self) -> usize {
        self.code.len()
    }

    pub fn is_empty(&self) -> bool {
        self.code.is_empty()
    }

    pub fn instruction_count(&self) -> usize {
        self.count
    }

    pub fn finish(self, dep_lists: Vec<Vec<u32>>) -> BytecodeProgram {
        BytecodeProgram::new(self.code, dep_lists)
    }
}
