mod support;

use std::collections::{BTreeSet, HashSet};
use std::sync::Arc;

use proptest::prelude::*;
use quarry_engine::permissions::MemoryPolicySource;
use quarry_engine::query::{
    build_field_nodes, get_all_field_names, AbstractQuery, CompareTo, ConditionNode, FilterNode,
    FilterTarget, LogicalNode, LogicalOperator, Modifiers, Operator, SortNode,
};
use quarry_engine::{Accountability, RequestContext, SchemaOverview, Value};

use support::{admin, blog_engine, blog_schema, engine_with, run, SqliteStore};

const ITEMS_SCHEMA: &str = r#"{
    "collections": {
        "items": {"primary": "id", "fields": [
            {"field": "id", "type": "integer", "nullable": false},
            {"field": "score", "type": "integer"},
            {"field": "label", "type": "string"}
        ]}
    },
    "relations": []
}"#;

#[derive(Debug, Clone)]
struct Item {
    score: Option<i64>,
    label: Option<String>,
}

fn arb_item() -> impl Strategy<Value = Item> {
    (
        prop::option::of(-3i64..3),
        prop::option::of("[ab]{0,3}"),
    )
        .prop_map(|(score, label)| Item { score, label })
}

fn condition(path: &str, operator: Operator, values: Vec<Value>, negate: bool) -> FilterNode {
    FilterNode::Condition(ConditionNode {
        target: FilterTarget::Field {
            path: path.to_string(),
        },
        operator,
        negate,
        compare_to: CompareTo::Values { values },
    })
}

fn arb_leaf() -> impl Strategy<Value = FilterNode> {
    let ordering = prop_oneof![
        Just(Operator::Eq),
        Just(Operator::Lt),
        Just(Operator::Lte),
        Just(Operator::Gt),
        Just(Operator::Gte),
    ];
    prop_oneof![
        (ordering, -3i64..3, any::<bool>()).prop_map(|(operator, value, negate)| {
            condition("score", operator, vec![Value::Integer(value)], negate)
        }),
        (prop::collection::vec(-3i64..3, 1..4), any::<bool>()).prop_map(|(values, negate)| {
            condition(
                "score",
                Operator::In,
                values.into_iter().map(Value::Integer).collect(),
                negate,
            )
        }),
        (prop_oneof![Just("score"), Just("label")], any::<bool>())
            .prop_map(|(path, negate)| condition(path, Operator::Null, Vec::new(), negate)),
        ("[ab]{0,2}", any::<bool>()).prop_map(|(prefix, negate)| {
            condition("label", Operator::StartsWith, vec![Value::Text(prefix)], negate)
        }),
        ("[ab]{0,3}", any::<bool>()).prop_map(|(label, negate)| {
            condition("label", Operator::Eq, vec![Value::Text(label)], negate)
        }),
    ]
}

fn arb_filter() -> impl Strategy<Value = FilterNode> {
    arb_leaf().prop_recursive(3, 16, 3, |inner| {
        (
            prop_oneof![Just(LogicalOperator::And), Just(LogicalOperator::Or)],
            prop::collection::vec(inner, 1..4),
            any::<bool>(),
        )
            .prop_map(|(operator, children, negate)| {
                FilterNode::Logical(LogicalNode {
                    operator,
                    negate,
                    children,
                })
            })
    })
}

/// Three-valued evaluation; `None` is SQL's unknown.
fn evaluate(filter: &FilterNode, item: &Item) -> Option<bool> {
    match filter {
        FilterNode::Constant { value } => Some(*value),
        FilterNode::Condition(condition) => {
            let FilterTarget::Field { path } = &condition.target else {
                unreachable!("generated filters only target fields");
            };
            let CompareTo::Values { values } = &condition.compare_to else {
                unreachable!("generated filters only compare against values");
            };
            let column = match path.as_str() {
                "score" => item.score.map(Value::Integer),
                _ => item.label.clone().map(Value::Text),
            };
            let outcome = match (condition.operator, column) {
                (Operator::Null, column) => Some(column.is_none()),
                (_, None) => None,
                (Operator::In, Some(column)) => Some(values.contains(&column)),
                (Operator::StartsWith, Some(Value::Text(label))) => {
                    Some(values[0].as_text().is_some_and(|prefix| label.starts_with(prefix)))
                }
                (operator, Some(column)) => Some(compare(operator, &column, &values[0])),
            };
            outcome.map(|outcome| outcome != condition.negate)
        }
        FilterNode::Logical(logical) => {
            let outcomes = logical.children.iter().map(|child| evaluate(child, item));
            let combined = match logical.operator {
                LogicalOperator::And => outcomes.fold(Some(true), |acc, next| match (acc, next) {
                    (Some(false), _) | (_, Some(false)) => Some(false),
                    (Some(true), Some(true)) => Some(true),
                    _ => None,
                }),
                LogicalOperator::Or => outcomes.fold(Some(false), |acc, next| match (acc, next) {
                    (Some(true), _) | (_, Some(true)) => Some(true),
                    (Some(false), Some(false)) => Some(false),
                    _ => None,
                }),
            };
            combined.map(|outcome| outcome != logical.negate)
        }
    }
}

fn compare(operator: Operator, left: &Value, right: &Value) -> bool {
    let ordering = match (left, right) {
        (Value::Integer(left), Value::Integer(right)) => left.cmp(right),
        (Value::Text(left), Value::Text(right)) => left.cmp(right),
        _ => unreachable!("generated comparisons share a type"),
    };
    match operator {
        Operator::Eq => ordering.is_eq(),
        Operator::Lt => ordering.is_lt(),
        Operator::Lte => ordering.is_le(),
        Operator::Gt => ordering.is_gt(),
        Operator::Gte => ordering.is_ge(),
        other => unreachable!("unexpected operator {other:?}"),
    }
}

fn items_store(items: &[Item]) -> SqliteStore {
    let store = SqliteStore::in_memory();
    store.batch("CREATE TABLE items (id INTEGER PRIMARY KEY, score INTEGER, label TEXT);");
    for (index, item) in items.iter().enumerate() {
        let score = item
            .score
            .map_or_else(|| "NULL".to_string(), |score| score.to_string());
        let label = item
            .label
            .as_ref()
            .map_or_else(|| "NULL".to_string(), |label| format!("'{label}'"));
        store.batch(&format!(
            "INSERT INTO items VALUES ({}, {score}, {label});",
            index + 1
        ));
    }
    store
}

fn items_query(schema: &SchemaOverview, filter: FilterNode) -> AbstractQuery {
    AbstractQuery {
        store: "main".to_string(),
        collection: "items".to_string(),
        fields: build_field_nodes(schema, "main", "items", &["id"]).expect("id resolves"),
        modifiers: Modifiers {
            filter: Some(filter),
            sort: vec![SortNode::parse("id")],
            ..Modifiers::default()
        },
        cases: Vec::new(),
        related_filters: Default::default(),
    }
}

fn placeholder_indices(sql: &str) -> Vec<usize> {
    let mut indices = Vec::new();
    let mut chars = sql.char_indices().peekable();
    while let Some((_, c)) = chars.next() {
        if c != '?' {
            continue;
        }
        let mut digits = String::new();
        while let Some((_, next)) = chars.peek() {
            if !next.is_ascii_digit() {
                break;
            }
            digits.push(*next);
            chars.next();
        }
        if let Ok(index) = digits.parse() {
            indices.push(index);
        }
    }
    indices
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn negated_filters_follow_three_valued_logic(
        items in prop::collection::vec(arb_item(), 1..10),
        filter in arb_filter(),
    ) {
        let schema = Arc::new(
            SchemaOverview::from_json_str(ITEMS_SCHEMA).expect("items schema parses"),
        );
        let engine = engine_with(
            Arc::new(items_store(&items)),
            Arc::new(MemoryPolicySource::default()),
        );
        let ctx = RequestContext::new(Accountability::admin(), schema.clone());

        for (candidate, wanted) in [(filter.clone(), true), (filter.clone().negated(), false)] {
            let rows = run(engine.compile_and_run(&items_query(&schema, candidate), &ctx))
                .expect("query runs");
            let ids = rows
                .iter()
                .filter_map(|row| row["id"].as_i64())
                .collect::<Vec<_>>();
            let expected = items
                .iter()
                .enumerate()
                .filter(|(_, item)| evaluate(&filter, item) == Some(wanted))
                .map(|(index, _)| index as i64 + 1)
                .collect::<Vec<_>>();
            prop_assert_eq!(ids, expected);
        }
    }

    #[test]
    fn placeholders_match_parameters(
        filter in arb_filter(),
        limit in prop::option::of(0u64..50),
        offset in prop::option::of(0u64..50),
    ) {
        let schema = SchemaOverview::from_json_str(ITEMS_SCHEMA).expect("items schema parses");
        let mut query = items_query(&schema, filter);
        query.modifiers.limit = limit;
        query.modifiers.offset = offset;
        let engine = engine_with(
            Arc::new(SqliteStore::in_memory()),
            Arc::new(MemoryPolicySource::default()),
        );
        let ctx = RequestContext::new(Accountability::admin(), Arc::new(schema));

        let statement = run(engine.explain(&query, &ctx)).expect("statement renders");
        let mut indices = placeholder_indices(&statement.sql);
        indices.sort_unstable();
        let expected = (1..=statement.parameters.len()).collect::<Vec<_>>();
        prop_assert_eq!(indices, expected);
    }

    #[test]
    fn aliases_are_unique_and_map_back_to_paths(
        paths in prop::sample::subsequence(
            vec![
                "id",
                "title",
                "status",
                "author.id",
                "author.name",
                "author.address.id",
                "author.address.city",
                "author.address.street",
            ],
            1..=8,
        ),
    ) {
        let schema = blog_schema();
        let query = AbstractQuery {
            store: "main".to_string(),
            collection: "articles".to_string(),
            fields: build_field_nodes(&schema, "main", "articles", &paths)
                .expect("paths resolve"),
            modifiers: Modifiers::default(),
            cases: Vec::new(),
            related_filters: Default::default(),
        };
        let engine = blog_engine();
        let sql = run(engine.compile(&query, &admin())).expect("query compiles");

        let aliases = sql.select.iter().map(|column| &column.alias).collect::<HashSet<_>>();
        prop_assert_eq!(aliases.len(), sql.select.len());

        let names = get_all_field_names(&query.fields);
        prop_assert_eq!(sql.paths.len(), names.len());
        let mapped = sql.paths.values().cloned().collect::<BTreeSet<_>>();
        let requested = paths.iter().map(|path| path.to_string()).collect::<BTreeSet<_>>();
        prop_assert_eq!(mapped, requested);
    }
}
