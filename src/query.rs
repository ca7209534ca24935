//! Nearest-neighbour lookup against a project's namespace.

use anyhow::{bail, Result};

use crate::index::SearchHit;
use crate::setup::App;

pub async fn query_project(app: &App, project_id: &str, text: &str, limit: usize) -> Result<Vec<SearchHit>> {
    if text.trim().is_empty() {
        bail!("query must not be empty");
    }
    let project = app
        .engine
        .project(project_id)
        .ok_or_else(|| anyhow::anyhow!("project '{}' is not configured", project_id))?;

    let vectors = app.deps.vectorizer.vectorize(&[text.to_string()]).await?;
    let Some(vector) = vectors.into_iter().next() else {
        bail!("vectorizer returned no vector for the query");
    };
    app.index
        .search
        .search(&project.namespace, &vector, limit)
        .await
}

pub fn print_hits(hits: &[SearchHit]) {
    if hits.is_empty() {
        println!("No results.");
        return;
    }
    for (i, hit) in hits.iter().enumerate() {
        let snippet: String = hit.text.chars().take(200).collect();
        println!(
            "{}. [{:.3}] {}/{} (chunk {})",
            i + 1,
            hit.score,
            hit.repository,
            hit.path,
            hit.ordinal
        );
        println!("    {}", snippet.replace('\n', " "));
    }
}
