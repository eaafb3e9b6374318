//! Bytecode format for compiled task graphs.

pub mod assembler;
pub mod instruction;
pub mod opcode;
pub mod program;

pub use assembler::Assembler;
pub use instruction::Instruction;
pub use opcode::Opcode;
pub use program::BytecodeProgram;
