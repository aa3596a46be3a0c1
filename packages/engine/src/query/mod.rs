mod ast;
mod fields;
mod filter;
mod resolver;

pub use ast::{
    AbstractQuery, AnyCandidate, AnyToOneJoin, DirectJoin, FieldNode, ForeignTarget, Function,
    Modifiers, OneToAnyJoin, RelationKind, RelationalJoin, RelationalNode, SortDirection,
    SortNode,
};
pub use fields::{build_field_nodes, get_all_field_names};
pub use filter::{
    CompareTo, ConditionNode, FilterNode, FilterTarget, FilterVariables, LogicalNode,
    LogicalOperator, Operator,
};
pub use resolver::{check_function, check_operator, resolve_field_path, RelationStep, ResolvedPath};
