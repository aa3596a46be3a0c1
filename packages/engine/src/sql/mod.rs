//! Abstract SQL: lowering a restricted query into a dialect-neutral statement tree, rendering it
//! for one dialect, and nesting the returned rows back into result objects.

mod alias;
mod assembler;
mod converter;
mod emitter;
#[cfg(test)]
pub(crate) mod fixtures;
mod types;

pub use assembler::{assemble, unflatten_row};
pub use converter::convert;
pub use emitter::{render, ParameterizedStatement};
pub use types::{
    AbstractSqlQuery, AnyToOneBranches, ColumnExpr, ColumnRef, CountQuery, NestedMany,
    NullableObject, ParameterIndex, SelectColumn, SqlCondition, SqlJoin, SqlOperand, SqlOrder,
    SqlWhere, TableRef,
};
