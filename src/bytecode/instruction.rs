//! Instruction encoding.
//!
//! Layout: opcode byte, then operands. Indices are unsigned LEB128,
//! offsets/lengths/thread counts little-endian `u64`, dependency-list
//! references little-endian `i32` with `-1` for "none".

use super::Opcode;
use crate::error::{Error, Result};
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::io::Cursor;

const NO_DEPS: i32 = -1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Instruction {
    Begin {
        slots: usize,
        tasks: usize,
        dep_lists: usize,
    },
    Context {
        device: usize,
    },
    Launch {
        task: usize,
        device: usize,
        deps: Option<usize>,
        offset: u64,
        threads: u64,
    },
    StreamIn {
        object: usize,
        offset: u64,
        length: u64,
        deps: Option<usize>,
    },
    StreamOut {
        object: usize,
        offset: u64,
        length: u64,
        deps: Option<usize>,
    },
    StreamOutBlocking {
        object: usize,
        offset: u64,
        length: u64,
        deps: Option<usize>,
    },
    AddDep {
        list: usize,
    },
    Barrier {
        deps: Option<usize>,
    },
    Marker {
        deps: Option<usize>,
    },
    End,
}

impl Instruction {
    pub fn opcode(&self) -> Opcode {
        match self {
            Instruction::Begin { .. } => Opcode::Begin,
            Instruction::Context { .. } => Opcode::Context,
            Instruction::Launch { .. } => Opcode::Launch,
            Instruction::StreamIn { .. } => Opcode::StreamIn,
            Instruction::StreamOut { .. } => Opcode::StreamOut,
            Instruction::StreamOutBlocking { .. } => Opcode::StreamOutBlocking,
            Instruction::AddDep { .. } => Opcode::AddDep,
            Instruction::Barrier { .. } => Opcode::Barrier,
            Instruction::Marker { .. } => Opcode::Marker,
            Instruction::End => Opcode::End,
        }
    }

    /// Dependency list this instruction waits on, if any.
    pub fn wait_list(&self) -> Option<usize> {
        match *self {
            Instruction::Launch { deps, .. }
            | Instruction::StreamIn { deps, .. }
            | Instruction::StreamOut { deps, .. }
            | Instruction::StreamOutBlocking { deps, .. }
            | Instruction::Barrier { deps }
            | Instruction::Marker { deps } => deps,
            _ => None,
        }
    }

    pub fn encode(&self, out: &mut Vec<u8>) -> Result<()> {
        out.push(self.opcode() as u8);
        match *self {
            Instruction::Begin {
                slots,
                tasks,
                dep_lists,
            } => {
                write_varint(out, slots as u64);
                write_varint(out, tasks as u64);
                write_varint(out, dep_lists as u64);
            }
            Instruction::Context { device } => write_varint(out, device as u64),
            Instruction::Launch {
                task,
                device,
                deps,
                offset,
                threads,
            } => {
                write_varint(out, task as u64);
                write_varint(out, device as u64);
                write_deps(out, deps)?;
                out.write_u64::<LittleEndian>(offset)?;
                out.write_u64::<LittleEndian>(threads)?;
            }
            Instruction::StreamIn {
                object,
                offset,
                length,
                deps,
            }
            | Instruction::StreamOut {
                object,
                offset,
                length,
                deps,
            }
            | Instruction::StreamOutBlocking {
                object,
                offset,
                length,
                deps,
            } => {
                write_varint(out, object as u64);
                out.write_u64::<LittleEndian>(offset)?;
                out.write_u64::<LittleEndian>(length)?;
                write_deps(out, deps)?;
            }
            Instruction::AddDep { list } => write_varint(out, list as u64),
            Instruction::Barrier { deps } | Instruction::Marker { deps } => write_deps(out, deps)?,
            Instruction::End => {}
        }
        Ok(())
    }

    /// Decode the instruction starting at `*pos`, advancing `*pos` past it.
    pub fn decode(code: &[u8], pos: &mut usize) -> Result<Self> {
        let start = *pos;
        let byte = *code
            .get(start)
            .ok_or_else(|| Error::decode(start, "unexpected end of program"))?;
        let opcode = Opcode::from_byte(byte)
            .ok_or_else(|| Error::decode(start, format!("unknown opcode 0x{:02x}", byte)))?;

        let mut cursor = Cursor::new(code);
        cursor.set_position(start as u64 + 1);
        let truncated = |_| Error::decode(start, format!("truncated {} operands", opcode));

        let instruction = match opcode {
            Opcode::Begin => Instruction::Begin {
                slots: read_index(&mut cursor, start)?,
                tasks: read_index(&mut cursor, start)?,
                dep_lists: read_index(&mut cursor, start)?,
            },
            Opcode::Context => Instruction::Context {
                device: read_index(&mut cursor, start)?,
            },
            Opcode::Launch => {
                let task = read_index(&mut cursor, start)?;
                let device = read_index(&mut cursor, start)?;
                let deps = read_deps(&mut cursor, start)?;
                let offset = cursor.read_u64::<LittleEndian>().map_err(truncated)?;
                let threads = cursor.read_u64::<LittleEndian>().map_err(truncated)?;
                Instruction::Launch {
                    task,
                    device,
                    deps,
                    offset,
                    threads,
                }
            }
            Opcode::StreamIn | Opcode::StreamOut | Opcode::StreamOutBlocking => {
                let object = read_index(&mut cursor, start)?;
                let offset = cursor.read_u64::<LittleEndian>().map_err(truncated)?;
                let length = cursor.read_u64::<LittleEndian>().map_err(truncated)?;
                let deps = read_deps(&mut cursor, start)?;
                match opcode {
                    Opcode::StreamIn => Instruction::StreamIn {
                        object,
                        offset,
                        length,
                        deps,
                    },
                    Opcode::StreamOut => Instruction::StreamOut {
                        object,
                        offset,
                        length,
                        deps,
                    },
                    _ => Instruction::StreamOutBlocking {
                        object,
                        offset,
                        length,
                        deps,
                    },
                }
            }
            Opcode::AddDep => Instruction::AddDep {
                list: read_index(&mut cursor, start)?,
            },
            Opcode::Barrier => Instruction::Barrier {
                deps: read_deps(&mut cursor, start)?,
            },
            Opcode::Marker => Instruction::Marker {
                deps: read_deps(&mut cursor, start)?,
            },
            Opcode::End => Instruction::End,
        };

        *pos = cursor.position() as usize;
        Ok(instruction)
    }
}

impl fmt::Display for Instruction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let deps = |d: Option<usize>| match d {
            Some(list) => format!("L{}", list),
            None => "-".to_string(),
        };
        match *self {
            Instruction::Begin {
                slots,
                tasks,
                dep_lists,
            } => write!(f, "BEGIN slots={} tasks={} lists={}", slots, tasks, dep_lists),
            Instruction::Context { device } => write!(f, "CONTEXT device={}", device),
            Instruction::Launch {
                task,
                device,
                deps: d,
                offset,
                threads,
            } => write!(
                f,
                "LAUNCH task={} device={} wait={} offset={} threads={}",
                task,
                device,
                deps(d),
                offset,
                threads
            ),
            Instruction::StreamIn {
                object,
                offset,
                length,
                deps: d,
            }
            | Instruction::StreamOut {
                object,
                offset,
                length,
                deps: d,
            }
            | Instruction::StreamOutBlocking {
                object,
                offset,
                length,
                deps: d,
            } => write!(
                f,
                "{} object={} offset={} length={} wait={}",
                self.opcode(),
                object,
                offset,
                length,
                deps(d)
            ),
            Instruction::AddDep { list } => write!(f, "ADD_DEP L{}", list),
            Instruction::Barrier { deps: d } => write!(f, "BARRIER wait={}", deps(d)),
            Instruction::Marker { deps: d } => write!(f, "MARKER wait={}", deps(d)),
            Instruction::End => f.write_str("END"),
        }
    }
}

pub(crate) fn write_varint(out: &mut Vec<u8>, mut value: u64) {
    loop {
        let byte = (value & 0x7f) as u8;
        value >>= 7;
        if value == 0 {
            out.push(byte);
            return;
        }
        out.push(byte | 0x80);
    }
}

pub(crate) fn read_varint(cursor: &mut Cursor<&[u8]>, start: usize) -> Result<u64> {
    let mut result = 0u64;
    let mut shift = 0u32;
    loop {
        let byte = cursor
            .read_u8()
            .map_err(|_| Error::decode(start, "truncated varint"))?;
        if shift >= 64 || (shift == 63 && byte > 1) {
            return Err(Error::decode(start, "varint overflows 64 bits"));
        }
        result |= u64::from(byte & 0x7f) << shift;
        if byte & 0x80 == 0 {
            return Ok(result);
        }
        shift += 7;
    }
}

fn read_index(cursor: &mut Cursor<&[u8]>, start: usize) -> Result<usize> {
    let value = read_varint(cursor, start)?;
    usize::try_from(value).map_err(|_| Error::decode(start, format!("index {} out of range", value)))
}

fn write_deps(out: &mut Vec<u8>, deps: Option<usize>) -> Result<()> {
    let value = match deps {
        Some(list) => i32::try_from(list)
            .map_err(|_| Error::config(format!("dependency list index {} exceeds i32", list)))?,
        None => NO_DEPS,
    };
    out.write_i32::<LittleEndian>(value)?;
    Ok(())
}

fn read_deps(cursor: &mut Cursor<&[u8]>, start: usize) -> Result<Option<usize>> {
    let value = cursor
        .read_i32::<LittleEndian>()
        .map_err(|_| Error::decode(start, "truncated dependency list operand"))?;
    match value {
        NO_DEPS => Ok(None),
        v if v >= 0 => Ok(Some(v as usize)),
        v => Err(Error::decode(start, format!("invalid dependency list {}", v))),
    }
}
