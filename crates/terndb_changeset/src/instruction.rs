//! Changeset instructions and their binary encoding.

use crate::error::{ChangesetError, ChangesetResult};
use crate::wire::{WireReader, WireWriter};

/// Column type as carried on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum WireColumnType {
    /// 64-bit signed integer.
    Int = 0,
    /// Boolean.
    Bool = 1,
    /// UTF-8 string.
    String = 2,
    /// Byte blob.
    Binary = 3,
    /// Link to an object in another table.
    Link = 4,
}

impl WireColumnType {
    fn from_byte(byte: u8) -> ChangesetResult<Self> {
        match byte {
            0 => Ok(Self::Int),
            1 => Ok(Self::Bool),
            2 => Ok(Self::String),
            3 => Ok(Self::Binary),
            4 => Ok(Self::Link),
            tag => Err(ChangesetError::UnknownValueTag { tag }),
        }
    }
}

/// Collection structure of a column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum CollectionKind {
    /// A single cell.
    #[default]
    None = 0,
    /// An ordered list.
    List = 1,
    /// An unordered set.
    Set = 2,
    /// A string-keyed dictionary.
    Dictionary = 3,
}

impl CollectionKind {
    fn from_byte(byte: u8) -> ChangesetResult<Self> {
        match byte {
            0 => Ok(Self::None),
            1 => Ok(Self::List),
            2 => Ok(Self::Set),
            3 => Ok(Self::Dictionary),
            tag => Err(ChangesetError::UnknownValueTag { tag }),
        }
    }
}

/// A value as carried inside an instruction.
#[derive(Debug, Clone, PartialEq)]
pub enum WireValue {
    /// Null.
    Null,
    /// 64-bit signed integer.
    Int(i64),
    /// Boolean.
    Bool(bool),
    /// UTF-8 string.
    String(String),
    /// Byte blob.
    Binary(Vec<u8>),
    /// Link to an object, by table name and key.
    Link {
        /// Target table name.
        table: String,
        /// Target object key.
        key: i64,
    },
}

const VALUE_NULL: u8 = 0;
const VALUE_INT: u8 = 1;
const VALUE_BOOL: u8 = 2;
const VALUE_STRING: u8 = 3;
const VALUE_BINARY: u8 = 4;
const VALUE_LINK: u8 = 5;

impl WireValue {
    fn encode(&self, writer: &mut WireWriter) {
        match self {
            Self::Null => writer.write_u8(VALUE_NULL),
            Self::Int(value) => {
                writer.write_u8(VALUE_INT);
                writer.write_i64(*value);
            }
            Self::Bool(value) => {
                writer.write_u8(VALUE_BOOL);
                writer.write_u8(u8::from(*value));
            }
            Self::String(value) => {
                writer.write_u8(VALUE_STRING);
                writer.write_string(value);
            }
            Self::Binary(value) => {
                writer.write_u8(VALUE_BINARY);
                writer.write_bytes(value);
            }
            Self::Link { table, key } => {
                writer.write_u8(VALUE_LINK);
                writer.write_string(table);
                writer.write_i64(*key);
            }
        }
    }

    fn decode(reader: &mut WireReader<'_>) -> ChangesetResult<Self> {
        match reader.read_u8()? {
            VALUE_NULL => Ok(Self::Null),
            VALUE_INT => Ok(Self::Int(reader.read_i64()?)),
            VALUE_BOOL => Ok(Self::Bool(reader.read_u8()? != 0)),
            VALUE_STRING => Ok(Self::String(reader.read_string()?)),
            VALUE_BINARY => Ok(Self::Binary(reader.read_bytes()?)),
            VALUE_LINK => Ok(Self::Link {
                table: reader.read_string()?,
                key: reader.read_i64()?,
            }),
            tag => Err(ChangesetError::UnknownValueTag { tag }),
        }
    }
}

/// One observable mutation recorded by a write transaction.
///
/// Instructions identify tables and columns by name and objects by key,
/// so a changeset can be replayed against any replica of the schema.
#[derive(Debug, Clone, PartialEq)]
pub enum Instruction {
    /// Create a table.
    AddTable {
        /// Table name.
        table: String,
        /// True for embedded tables.
        embedded: bool,
    },
    /// Add a column to a table.
    AddColumn {
        /// Table name.
        table: String,
        /// Column name.
        name: String,
        /// Element type.
        col_type: WireColumnType,
        /// Collection structure.
        collection: CollectionKind,
        /// True if cells may be null.
        nullable: bool,
        /// True for strong link columns.
        strong: bool,
        /// Target table for link columns, empty otherwise.
        target_table: String,
    },
    /// Create an object.
    CreateObject {
        /// Table name.
        table: String,
        /// Object key.
        key: i64,
    },
    /// Erase an object.
    EraseObject {
        /// Table name.
        table: String,
        /// Object key.
        key: i64,
    },
    /// Write a single cell.
    Set {
        /// Table name.
        table: String,
        /// Object key.
        key: i64,
        /// Column name.
        column: String,
        /// New value.
        value: WireValue,
    },
    /// Insert into a list.
    ListInsert {
        /// Table name.
        table: String,
        /// Object key.
        key: i64,
        /// Column name.
        column: String,
        /// Insertion index.
        index: u32,
        /// Inserted value.
        value: WireValue,
    },
    /// Overwrite a list element.
    ListSet {
        /// Table name.
        table: String,
        /// Object key.
        key: i64,
        /// Column name.
        column: String,
        /// Element index.
        index: u32,
        /// New value.
        value: WireValue,
    },
    /// Erase a list element.
    ListErase {
        /// Table name.
        table: String,
        /// Object key.
        key: i64,
        /// Column name.
        column: String,
        /// Element index.
        index: u32,
    },
    /// Insert into a set.
    SetInsert {
        /// Table name.
        table: String,
        /// Object key.
        key: i64,
        /// Column name.
        column: String,
        /// Inserted value.
        value: WireValue,
    },
    /// Erase from a set.
    SetErase {
        /// Table name.
        table: String,
        /// Object key.
        key: i64,
        /// Column name.
        column: String,
        /// Erased value.
        value: WireValue,
    },
    /// Insert or overwrite a dictionary entry.
    DictInsert {
        /// Table name.
        table: String,
        /// Object key.
        key: i64,
        /// Column name.
        column: String,
        /// Dictionary key.
        dict_key: String,
        /// New value.
        value: WireValue,
    },
    /// Erase a dictionary entry.
    DictErase {
        /// Table name.
        table: String,
        /// Object key.
        key: i64,
        /// Column name.
        column: String,
        /// Dictionary key.
        dict_key: String,
    },
    /// Clear a collection.
    Clear {
        /// Table name.
        table: String,
        /// Object key.
        key: i64,
        /// Column name.
        column: String,
    },
}

const OP_ADD_TABLE: u8 = 1;
const OP_ADD_COLUMN: u8 = 2;
const OP_CREATE_OBJECT: u8 = 3;
const OP_ERASE_OBJECT: u8 = 4;
const OP_SET: u8 = 5;
const OP_LIST_INSERT: u8 = 6;
const OP_LIST_SET: u8 = 7;
const OP_LIST_ERASE: u8 = 8;
const OP_SET_INSERT: u8 = 9;
const OP_SET_ERASE: u8 = 10;
const OP_DICT_INSERT: u8 = 11;
const OP_DICT_ERASE: u8 = 12;
const OP_CLEAR: u8 = 13;

impl Instruction {
    /// Encodes this instruction into the writer.
    pub fn encode(&self, writer: &mut WireWriter) {
        match self {
            Self::AddTable { table, embedded } => {
                writer.write_u8(OP_ADD_TABLE);
                writer.write_string(table);
                writer.write_u8(u8::from(*embedded));
            }
            Self::AddColumn {
                table,
                name,
                col_type,
                collection,
                nullable,
                strong,
                target_table,
            } => {
                writer.write_u8(OP_ADD_COLUMN);
                writer.write_string(table);
                writer.write_string(name);
                writer.write_u8(*col_type as u8);
                writer.write_u8(*collection as u8);
                writer.write_u8(u8::from(*nullable));
                writer.write_u8(u8::from(*strong));
                writer.write_string(target_table);
            }
            Self::CreateObject { table, key } => {
                writer.write_u8(OP_CREATE_OBJECT);
                writer.write_string(table);
                writer.write_i64(*key);
            }
            Self::EraseObject { table, key } => {
                writer.write_u8(OP_ERASE_OBJECT);
                writer.write_string(table);
                writer.write_i64(*key);
            }
            Self::Set {
                table,
                key,
                column,
                value,
            } => {
                writer.write_u8(OP_SET);
                writer.write_string(table);
                writer.write_i64(*key);
                writer.write_string(column);
                value.encode(writer);
            }
            Self::ListInsert {
                table,
                key,
                column,
                index,
                value,
            } => {
                writer.write_u8(OP_LIST_INSERT);
                writer.write_string(table);
                writer.write_i64(*key);
                writer.write_string(column);
                writer.write_u64(u64::from(*index));
                value.encode(writer);
            }
            Self::ListSet {
                table,
                key,
                column,
                index,
                value,
            } => {
                writer.write_u8(OP_LIST_SET);
                writer.write_string(table);
                writer.write_i64(*key);
                writer.write_string(column);
                writer.write_u64(u64::from(*index));
                value.encode(writer);
            }
            Self::ListErase {
                table,
                key,
                column,
                index,
            } => {
                writer.write_u8(OP_LIST_ERASE);
                writer.write_string(table);
                writer.write_i64(*key);
                writer.write_string(column);
                writer.write_u64(u64::from(*index));
            }
            Self::SetInsert {
                table,
                key,
                column,
                value,
            } => {
                writer.write_u8(OP_SET_INSERT);
                writer.write_string(table);
                writer.write_i64(*key);
                writer.write_string(column);
                value.encode(writer);
            }
            Self::SetErase {
                table,
                key,
                column,
                value,
            } => {
                writer.write_u8(OP_SET_ERASE);
                writer.write_string(table);
                writer.write_i64(*key);
                writer.write_string(column);
                value.encode(writer);
            }
            Self::DictInsert {
                table,
                key,
                column,
                dict_key,
                value,
            } => {
                writer.write_u8(OP_DICT_INSERT);
                writer.write_string(table);
                writer.write_i64(*key);
                writer.write_string(column);
                writer.write_string(dict_key);
                value.encode(writer);
            }
            Self::DictErase {
                table,
                key,
                column,
                dict_key,
            } => {
                writer.write_u8(OP_DICT_ERASE);
                writer.write_string(table);
                writer.write_i64(*key);
                writer.write_string(column);
                writer.write_string(dict_key);
            }
            Self::Clear { table, key, column } => {
                writer.write_u8(OP_CLEAR);
                writer.write_string(table);
                writer.write_i64(*key);
                writer.write_string(column);
            }
        }
    }

    /// Decodes one instruction from the reader.
    pub fn decode(reader: &mut WireReader<'_>) -> ChangesetResult<Self> {
        match reader.read_u8()? {
            OP_ADD_TABLE => Ok(Self::AddTable {
                table: reader.read_string()?,
                embedded: reader.read_u8()? != 0,
            }),
            OP_ADD_COLUMN => Ok(Self::AddColumn {
                table: reader.read_string()?,
                name: reader.read_string()?,
                col_type: WireColumnType::from_byte(reader.read_u8()?)?,
                collection: CollectionKind::from_byte(reader.read_u8()?)?,
                nullable: reader.read_u8()? != 0,
                strong: reader.read_u8()? != 0,
                target_table: reader.read_string()?,
            }),
            OP_CREATE_OBJECT => Ok(Self::CreateObject {
                table: reader.read_string()?,
                key: reader.read_i64()?,
            }),
            OP_ERASE_OBJECT => Ok(Self::EraseObject {
                table: reader.read_string()?,
                key: reader.read_i64()?,
            }),
            OP_SET => Ok(Self::Set {
                table: reader.read_string()?,
                key: reader.read_i64()?,
                column: reader.read_string()?,
                value: WireValue::decode(reader)?,
            }),
            OP_LIST_INSERT => Ok(Self::ListInsert {
                table: reader.read_string()?,
                key: reader.read_i64()?,
                column: reader.read_string()?,
                index: reader.read_u64()? as u32,
                value: WireValue::decode(reader)?,
            }),
            OP_LIST_SET => Ok(Self::ListSet {
                table: reader.read_string()?,
                key: reader.read_i64()?,
                column: reader.read_string()?,
                index: reader.read_u64()? as u32,
                value: WireValue::decode(reader)?,
            }),
            OP_LIST_ERASE => Ok(Self::ListErase {
                table: reader.read_string()?,
                key: reader.read_i64()?,
                column: reader.read_string()?,
                index: reader.read_u64()? as u32,
            }),
            OP_SET_INSERT => Ok(Self::SetInsert {
                table: reader.read_string()?,
                key: reader.read_i64()?,
                column: reader.read_string()?,
                value: WireValue::decode(reader)?,
            }),
            OP_SET_ERASE => Ok(Self::SetErase {
                table: reader.read_string()?,
                key: reader.read_i64()?,
                column: reader.read_string()?,
                value: WireValue::decode(reader)?,
            }),
            OP_DICT_INSERT => Ok(Self::DictInsert {
                table: reader.read_string()?,
                key: reader.read_i64()?,
                column: reader.read_string()?,
                dict_key: reader.read_string()?,
                value: WireValue::decode(reader)?,
            }),
            OP_DICT_ERASE => Ok(Self::DictErase {
                table: reader.read_string()?,
                key: reader.read_i64()?,
                column: reader.read_string()?,
                dict_key: reader.read_string()?,
            }),
            OP_CLEAR => Ok(Self::Clear {
                table: reader.read_string()?,
                key: reader.read_i64()?,
                column: reader.read_string()?,
            }),
            opcode => Err(ChangesetError::UnknownOpcode { opcode }),
        }
    }
}

/// Encodes a sequence of instructions into changeset bytes.
#[must_use]
pub fn encode_instructions(instructions: &[Instruction]) -> Vec<u8> {
    let mut writer = WireWriter::new();
    for instruction in instructions {
        instruction.encode(&mut writer);
    }
    writer.into_bytes()
}

/// Decodes changeset bytes into a sequence of instructions.
///
/// # Errors
///
/// Returns an error on a malformed instruction stream; decoding is
/// all-or-nothing.
pub fn decode_instructions(bytes: &[u8]) -> ChangesetResult<Vec<Instruction>> {
    let mut reader = WireReader::new(bytes);
    let mut instructions = Vec::new();
    while !reader.is_at_end() {
        instructions.push(Instruction::decode(&mut reader)?);
    }
    Ok(instructions)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_instructions() -> Vec<Instruction> {
        vec![
            Instruction::AddTable {
                table: "person".into(),
                embedded: false,
            },
            Instruction::AddColumn {
                table: "person".into(),
                name: "age".into(),
                col_type: WireColumnType::Int,
                collection: CollectionKind::None,
                nullable: true,
                strong: false,
                target_table: String::new(),
            },
            Instruction::CreateObject {
                table: "person".into(),
                key: 1,
            },
            Instruction::Set {
                table: "person".into(),
                key: 1,
                column: "age".into(),
                value: WireValue::Int(39),
            },
            Instruction::ListInsert {
                table: "person".into(),
                key: 1,
                column: "tags".into(),
                index: 0,
                value: WireValue::String("admin".into()),
            },
            Instruction::DictInsert {
                table: "person".into(),
                key: 1,
                column: "meta".into(),
                dict_key: "color".into(),
                value: WireValue::String("blue".into()),
            },
            Instruction::EraseObject {
                table: "person".into(),
                key: 1,
            },
        ]
    }

    #[test]
    fn instruction_roundtrip() {
        let instructions = sample_instructions();
        let bytes = encode_instructions(&instructions);
        let decoded = decode_instructions(&bytes).unwrap();
        assert_eq!(instructions, decoded);
    }

    #[test]
    fn encoding_is_deterministic() {
        let instructions = sample_instructions();
        assert_eq!(
            encode_instructions(&instructions),
            encode_instructions(&instructions)
        );
    }

    #[test]
    fn empty_changeset() {
        let decoded = decode_instructions(&[]).unwrap();
        assert!(decoded.is_empty());
    }

    #[test]
    fn unknown_opcode_rejected() {
        let result = decode_instructions(&[0xee]);
        assert!(matches!(
            result,
            Err(ChangesetError::UnknownOpcode { opcode: 0xee })
        ));
    }

    #[test]
    fn link_value_roundtrip() {
        let instructions = vec![Instruction::Set {
            table: "parent".into(),
            key: 5,
            column: "child".into(),
            value: WireValue::Link {
                table: "child".into(),
                key: -3,
            },
        }];
        let bytes = encode_instructions(&instructions);
        assert_eq!(decode_instructions(&bytes).unwrap(), instructions);
    }

    #[test]
    fn truncated_instruction_fails() {
        let bytes = encode_instructions(&sample_instructions());
        let result = decode_instructions(&bytes[..bytes.len() - 2]);
        assert!(result.is_err());
    }
}
