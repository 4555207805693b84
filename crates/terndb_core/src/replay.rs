//! Changeset replay.
//!
//! Downloaded changesets are applied by replaying their instructions
//! through the same transaction API user writes go through, so the
//! replication semantics of a remote change and a local change are
//! identical. Links to objects that have not been received yet are
//! materialized as unresolved tombstones and resolved when the object
//! arrives.

use crate::error::{CoreError, CoreResult};
use crate::keys::{ObjKey, TableKey};
use crate::schema::{ColumnAttr, ColumnSpec, ColumnType, TableType};
use crate::transaction::WriteTransaction;
use crate::value::Value;
use terndb_changeset::{
    decode_instructions, CollectionKind, Instruction, WireColumnType, WireValue,
};

/// Applies an encoded changeset to a write transaction.
///
/// # Errors
///
/// Any failure is surfaced as [`CoreError::BadChangeset`]; the caller
/// must abort the transaction.
pub fn apply_changeset(txn: &mut WriteTransaction<'_>, changeset: &[u8]) -> CoreResult<()> {
    let instructions =
        decode_instructions(changeset).map_err(|err| CoreError::bad_changeset(err.to_string()))?;
    for instruction in &instructions {
        apply_instruction(txn, instruction)
            .map_err(|err| CoreError::bad_changeset(err.to_string()))?;
    }
    Ok(())
}

fn apply_instruction(txn: &mut WriteTransaction<'_>, instruction: &Instruction) -> CoreResult<()> {
    match instruction {
        Instruction::AddTable { table, embedded } => {
            let table_type = if *embedded {
                TableType::Embedded
            } else {
                TableType::TopLevel
            };
            txn.get_or_add_table(table, table_type)?;
            Ok(())
        }
        Instruction::AddColumn {
            table,
            name,
            col_type,
            collection,
            nullable,
            strong,
            target_table,
        } => {
            let table_key = txn.table(table)?.key();
            let spec = txn.spec(table_key)?;
            if spec.column_by_name(name).is_some() {
                return Ok(());
            }
            let target = if target_table.is_empty() {
                None
            } else {
                Some(
                    txn.get_or_add_table(target_table, TableType::TopLevel)?
                        .key(),
                )
            };
            let mut attrs = ColumnAttr::default();
            if *nullable {
                attrs = attrs.with(ColumnAttr::NULLABLE);
            }
            if *strong {
                attrs = attrs.with(ColumnAttr::STRONG);
            }
            match collection {
                CollectionKind::None => {}
                CollectionKind::List => attrs = attrs.with(ColumnAttr::LIST),
                CollectionKind::Set => attrs = attrs.with(ColumnAttr::SET),
                CollectionKind::Dictionary => attrs = attrs.with(ColumnAttr::DICTIONARY),
            }
            let col = ColumnSpec {
                name: name.clone(),
                col_type: column_type(*col_type),
                attrs,
                target_table: target,
                backlink_origin: None,
            };
            txn.add_column(table_key, col)?;
            Ok(())
        }
        Instruction::CreateObject { table, key } => {
            let table_key = txn.table(table)?.key();
            let key = ObjKey::new(*key);
            if txn.object_exists(table_key, key)? {
                return Ok(());
            }
            txn.create_object_with_key(table_key, key)?;
            Ok(())
        }
        Instruction::EraseObject { table, key } => {
            let table_key = txn.table(table)?.key();
            txn.erase_object(table_key, ObjKey::new(*key))
        }
        Instruction::Set {
            table,
            key,
            column,
            value,
        } => {
            let table_key = txn.table(table)?.key();
            let col = column_key(txn, table_key, column)?;
            let value = resolve_value(txn, value)?;
            txn.set_value(table_key, ObjKey::new(*key), col, value)
        }
        Instruction::ListInsert {
            table,
            key,
            column,
            index,
            value,
        } => {
            let table_key = txn.table(table)?.key();
            let col = column_key(txn, table_key, column)?;
            let key = ObjKey::new(*key);
            match value {
                WireValue::Link { .. } => {
                    let target = resolve_value(txn, value)?
                        .as_link()
                        .expect("resolved link value");
                    let obj = txn.table(table)?.object(txn, key)?;
                    let list = obj.link_list(txn, col)?;
                    list.insert(txn, *index as usize, target)
                }
                _ => {
                    let value = resolve_value(txn, value)?;
                    let obj = txn.table(table)?.object(txn, key)?;
                    let list = obj.list(txn, col)?;
                    list.insert(txn, *index as usize, value)
                }
            }
        }
        Instruction::ListSet {
            table,
            key,
            column,
            index,
            value,
        } => {
            let table_key = txn.table(table)?.key();
            let col = column_key(txn, table_key, column)?;
            let key = ObjKey::new(*key);
            match value {
                WireValue::Link { .. } => {
                    let target = resolve_value(txn, value)?
                        .as_link()
                        .expect("resolved link value");
                    let obj = txn.table(table)?.object(txn, key)?;
                    let list = obj.link_list(txn, col)?;
                    list.remove(txn, *index as usize)?;
                    list.insert(txn, *index as usize, target)
                }
                _ => {
                    let value = resolve_value(txn, value)?;
                    let obj = txn.table(table)?.object(txn, key)?;
                    let list = obj.list(txn, col)?;
                    list.set(txn, *index as usize, value)
                }
            }
        }
        Instruction::ListErase {
            table,
            key,
            column,
            index,
        } => {
            let table_key = txn.table(table)?.key();
            let col = column_key(txn, table_key, column)?;
            let key = ObjKey::new(*key);
            let spec = txn.spec(table_key)?;
            let is_link = spec.column(col)?.col_type == ColumnType::Link;
            let obj = txn.table(table)?.object(txn, key)?;
            if is_link {
                obj.link_list(txn, col)?.remove(txn, *index as usize)
            } else {
                obj.list(txn, col)?.remove(txn, *index as usize)
            }
        }
        Instruction::SetInsert {
            table,
            key,
            column,
            value,
        } => {
            let table_key = txn.table(table)?.key();
            let col = column_key(txn, table_key, column)?;
            let value = resolve_value(txn, value)?;
            let obj = txn.table(table)?.object(txn, ObjKey::new(*key))?;
            obj.set_collection(txn, col)?.insert(txn, value)?;
            Ok(())
        }
        Instruction::SetErase {
            table,
            key,
            column,
            value,
        } => {
            let table_key = txn.table(table)?.key();
            let col = column_key(txn, table_key, column)?;
            let value = resolve_value(txn, value)?;
            let obj = txn.table(table)?.object(txn, ObjKey::new(*key))?;
            obj.set_collection(txn, col)?.erase(txn, value)?;
            Ok(())
        }
        Instruction::DictInsert {
            table,
            key,
            column,
            dict_key,
            value,
        } => {
            let table_key = txn.table(table)?.key();
            let col = column_key(txn, table_key, column)?;
            let value = resolve_value(txn, value)?;
            let obj = txn.table(table)?.object(txn, ObjKey::new(*key))?;
            obj.dictionary(txn, col)?.insert(txn, dict_key, value)
        }
        Instruction::DictErase {
            table,
            key,
            column,
            dict_key,
        } => {
            let table_key = txn.table(table)?.key();
            let col = column_key(txn, table_key, column)?;
            let obj = txn.table(table)?.object(txn, ObjKey::new(*key))?;
            obj.dictionary(txn, col)?.erase(txn, dict_key)?;
            Ok(())
        }
        Instruction::Clear { table, key, column } => {
            let table_key = txn.table(table)?.key();
            let col = column_key(txn, table_key, column)?;
            let key = ObjKey::new(*key);
            let spec = txn.spec(table_key)?;
            let col_spec = spec.column(col)?.clone();
            let obj = txn.table(table)?.object(txn, key)?;
            if col_spec.attrs.contains(ColumnAttr::LIST) {
                if col_spec.col_type == ColumnType::Link {
                    obj.link_list(txn, col)?.clear(txn)
                } else {
                    obj.list(txn, col)?.clear(txn)
                }
            } else if col_spec.attrs.contains(ColumnAttr::SET) {
                let set = obj.set_collection(txn, col)?;
                let values = set.values(txn)?;
                for value in values.into_iter().rev() {
                    set.erase(txn, value)?;
                }
                Ok(())
            } else if col_spec.attrs.contains(ColumnAttr::DICTIONARY) {
                let dict = obj.dictionary(txn, col)?;
                for dict_key in dict.keys(txn)? {
                    dict.erase(txn, &dict_key)?;
                }
                Ok(())
            } else {
                Err(CoreError::CollectionTypeMismatch {
                    column: col_spec.name,
                })
            }
        }
    }
}

fn column_key(
    txn: &mut WriteTransaction<'_>,
    table: TableKey,
    name: &str,
) -> CoreResult<crate::ColKey> {
    txn.spec(table)?
        .column_by_name(name)
        .ok_or_else(|| CoreError::NoSuchColumn {
            name: name.to_owned(),
        })
}

/// Converts a wire value, mapping link targets through the tombstone
/// machinery: a link to an object that has not been received yet points
/// at a freshly created unresolved row.
fn resolve_value(txn: &mut WriteTransaction<'_>, value: &WireValue) -> CoreResult<Value> {
    Ok(match value {
        WireValue::Null => Value::Null,
        WireValue::Int(v) => Value::Int(*v),
        WireValue::Bool(v) => Value::Bool(*v),
        WireValue::String(v) => Value::String(v.clone()),
        WireValue::Binary(v) => Value::Binary(v.clone()),
        WireValue::Link { table, key } => {
            let table_key = txn.table(table)?.key();
            let key = txn.get_or_create_tombstone(table_key, ObjKey::new(*key))?;
            Value::Link(key)
        }
    })
}

fn column_type(wire: WireColumnType) -> ColumnType {
    match wire {
        WireColumnType::Int => ColumnType::Int,
        WireColumnType::Bool => ColumnType::Bool,
        WireColumnType::String => ColumnType::String,
        WireColumnType::Binary => ColumnType::Binary,
        WireColumnType::Link => ColumnType::Link,
    }
}
