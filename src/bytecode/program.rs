use super::{Instruction, Opcode};
use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;

/// Compiled, immutable task-graph program.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BytecodeProgram {
    code: Vec<u8>,
    /// Each entry is a set of slots; identical sets share one entry.
    dep_lists: Vec<Vec<u32>>,
}

impl BytecodeProgram {
    pub fn new(code: Vec<u8>, dep_lists: Vec<Vec<u32>>) -> Self {
        Self { code, dep_lists }
    }

    pub fn code(&self) -> &[u8] {
        &self.code
    }

    pub fn dep_lists(&self) -> &[Vec<u32>] {
        &self.dep_lists
    }

    pub fn size(&self) -> usize {
        self.code.len()
    }

    /// Decode and validate the whole program: it must open with BEGIN, end
    /// with END and only reference dependency lists that exist.
    pub fn decode(&self) -> Result<Vec<Instruction>> {
        let mut pos = 0;
        let mut instructions = Vec::new();
        while pos < self.code.len() {
            let start = pos;
            let inst = Instruction::decode(&self.code, &mut pos)?;
            if instructions.is_empty() && inst.opcode() != Opcode::Begin {
                return Err(Error::decode(start, format!("program starts with {}", inst.opcode())));
            }
            if !instructions.is_empty() && inst.opcode() == Opcode::Begin {
                return Err(Error::decode(start, "BEGIN in the middle of a program"));
            }
            let referenced = match inst {
                Instruction::AddDep { list } => Some(list),
                other => other.wait_list(),
            };
            if let Some(list) = referenced {
                if list >= self.dep_lists.len() {
                    return Err(Error::decode(
                        start,
                        format!("dependency list {} does not exist", list),
                    ));
                }
            }
            let end = inst.opcode() == Opcode::End;
            instructions.push(inst);
            if end {
                if pos != self.code.len() {
                    return Err(Error::decode(pos, "trailing bytes after END"));
                }
                return Ok(instructions);
            }
        }
        Err(Error::decode(self.code.len(), "program does not end with END"))
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(&DumpView::new(self))?)
    }

    pub fn from_json(json: &str) -> Result<Self> {
        let view: DumpView = serde_json::from_str(json)?;
        Ok(Self::new(view.code, view.dep_lists))
    }

    /// Write the program and its disassembly as JSON.
    pub fn dump<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        std::fs::write(path, self.to_json()?)?;
        Ok(())
    }
}

#[derive(Serialize, Deserialize)]
struct DumpView {
    code: Vec<u8>,
    dep_lists: Vec<Vec<u32>>,
    #[serde(default, skip_deserializing)]
    listing: Vec<String>,
}

impl DumpView {
    fn new(program: &BytecodeProgram) -> Self {
        let listing = match program.decode() {
            Ok(instructions) => instructions.iter().map(|i| i.to_string()).collect(),
            Err(err) => vec![format!("<undecodable: {}>", err)],
        };
        Self {
            code: program.code.clone(),
            dep_lists: program.dep_lists.clone(),
            listing,
        }
    }
}

impl fmt::Display for BytecodeProgram {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, list) in self.dep_lists.iter().enumerate() {
            writeln!(f, "L{}: {:?}", i, list)?;
        }
        match self.decode() {
            Ok(instructions) => {
                for (i, inst) in instructions.iter().enumerate() {
                    writeln!(f, "{:4}: {}", i, inst)?;
                }
                Ok(())
            }
            Err(err) => writeln!(f, "<undecodable: {}>", err),
        }
    }
}
