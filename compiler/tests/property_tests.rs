// Property-based tests for compiler invariants.
//
// Three categories:
// 1. Clone groups: any multiplicity produces exactly N ports, keyed 0..N
// 2. Topological ordering: generated DAGs always sort, deps first
// 3. Grid position parsing: well-formed claims parse and cover spans
//
// Uses proptest with explicit configuration to prevent CI flakiness.

use proptest::prelude::*;
use std::collections::BTreeSet;

use grcc::eval::RhaiEvaluator;
use grcc::order;
use grcc::platform::{Platform, PlatformConfig};
use grcc::schema::parse_block_schema;

const TEST_SOURCE: &str = r#"
id: test_source
label: Test Source
flags: [python]
parameters:
-   id: nports
    label: Num Ports
    dtype: int
    default: 1
outputs:
-   domain: stream
    dtype: float
    multiplicity: ${ nports }
templates:
    make: blocks.null_source(4)
"#;

fn test_platform() -> Platform {
    let mut p = Platform::new(PlatformConfig::default()).expect("builtin platform");
    p.register_block_schema(parse_block_schema(TEST_SOURCE).expect("test schema"));
    p
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn clone_group_always_matches_multiplicity(n in 1usize..=8) {
        let platform = test_platform();
        let evaluator = RhaiEvaluator::new();
        let mut fg = platform.make_flowgraph();
        let src = fg.new_block(&platform, "test_source");
        fg.block_mut(src).set_param_value("nports", n.to_string());
        fg.rewrite(&evaluator).unwrap();

        let block = fg.block(src);
        prop_assert_eq!(block.sources.len(), n);
        for (i, port) in block.sources.iter().enumerate() {
            let expected_key = i.to_string();
            prop_assert_eq!(port.key.as_str(), expected_key.as_str());
        }
        // Exactly one master per clone group.
        prop_assert_eq!(
            block.sources.iter().filter(|p| p.is_master()).count(),
            1
        );
    }

    #[test]
    fn multiplicity_changes_are_stable(
        steps in proptest::collection::vec(1usize..=6, 1..5)
    ) {
        let platform = test_platform();
        let evaluator = RhaiEvaluator::new();
        let mut fg = platform.make_flowgraph();
        let src = fg.new_block(&platform, "test_source");
        for n in steps {
            fg.block_mut(src).set_param_value("nports", n.to_string());
            fg.rewrite(&evaluator).unwrap();
            prop_assert_eq!(fg.block(src).sources.len(), n);
        }
    }

    #[test]
    fn toposort_respects_generated_dags(
        // Each item may depend only on earlier items, so the input is a
        // DAG by construction.
        edges in proptest::collection::vec(proptest::bool::ANY, 0..28)
    ) {
        let n = 8usize.min(edges.len() / 3 + 2);
        let names: Vec<String> = (0..n).map(|i| format!("v{}", i)).collect();
        let mut items: Vec<(String, BTreeSet<String>)> = Vec::new();
        let mut e = edges.iter();
        for (i, name) in names.iter().enumerate() {
            let mut deps = BTreeSet::new();
            for dep in names.iter().take(i) {
                if *e.next().unwrap_or(&false) {
                    deps.insert(dep.clone());
                }
            }
            items.push((name.clone(), deps));
        }

        let sorted = order::toposort(&items).unwrap();
        prop_assert_eq!(sorted.len(), items.len());
        let pos = |idx: usize| sorted.iter().position(|&s| s == idx).unwrap();
        for (i, (_, deps)) in items.iter().enumerate() {
            for dep in deps {
                let j = items.iter().position(|(name, _)| name == dep).unwrap();
                prop_assert!(pos(j) < pos(i), "{} must precede {}", dep, items[i].0);
            }
        }
    }

    #[test]
    fn grid_pos_parse_covers_span(
        row in 0i64..20,
        col in 0i64..20,
        row_span in 1i64..5,
        col_span in 1i64..5,
    ) {
        let raw = format!("{}, {}, {}, {}", row, col, row_span, col_span);
        let parsed = grcc::param::parse_grid_pos(&raw).unwrap().unwrap();
        prop_assert_eq!(parsed.row, row);
        prop_assert_eq!(parsed.col, col);
        prop_assert_eq!(
            parsed.cells().len() as i64,
            row_span * col_span
        );
    }

    #[test]
    fn identifier_extraction_finds_all_names(
        names in proptest::collection::btree_set("[a-z][a-z0-9_]{0,6}", 1..5)
    ) {
        let expr = names.iter().cloned().collect::<Vec<_>>().join(" + ");
        let found = order::extract_identifiers(&expr);
        for name in &names {
            prop_assert!(found.contains(name), "missing {}", name);
        }
    }
}
