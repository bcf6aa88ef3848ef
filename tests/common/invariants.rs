//! Checkers for the store's chain invariants

use newswire::{Article, ArticleId, ArticleStore, Stage};
use std::collections::{HashMap, HashSet};

const ALL_ROWS: usize = 100_000;

/// Every row of `stage`, oldest first.
pub async fn rows(store: &dyn ArticleStore, stage: Stage) -> Vec<Article> {
    let mut rows = store
        .list_articles(stage, None, ALL_ROWS)
        .await
        .expect("list rows");
    rows.reverse();
    rows
}

/// Asserts, for every stage hand-off:
/// - each downstream row references an upstream row created strictly before it
/// - no two downstream rows reference the same upstream row
/// - downstream row counts never exceed upstream counts
pub async fn assert_chain_invariants(store: &dyn ArticleStore) {
    for stage in [Stage::Parse, Stage::Categorize, Stage::Comment] {
        let upstream = stage.upstream().expect("stage has upstream");
        let up_rows = rows(store, upstream).await;
        let down_rows = rows(store, stage).await;

        let created: HashMap<ArticleId, _> =
            up_rows.iter().map(|a| (a.id(), a.created_at())).collect();
        let mut referenced = HashSet::new();

        for row in &down_rows {
            let up_id = row.upstream_id().expect("downstream row has upstream");
            let up_created = created
                .get(&up_id)
                .unwrap_or_else(|| panic!("{} row {} references missing #{}", stage, row.id(), up_id));
            assert!(
                row.created_at() > *up_created,
                "{} row {} not created after its upstream #{}",
                stage,
                row.id(),
                up_id
            );
            assert!(
                referenced.insert(up_id),
                "{} has two rows referencing #{}",
                stage,
                up_id
            );
        }
        assert!(
            down_rows.len() <= up_rows.len(),
            "{} has more rows than {}",
            stage,
            upstream
        );
    }
}
