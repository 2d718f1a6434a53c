use sim_core::{Error, Experiment, Result};
use sim_store::{ExperimentFilter, JobStore};

/// Resolves a user's experiment reference. No query picks the most recent
/// experiment; an exact id wins; otherwise the query must match exactly one
/// id or name substring.
pub fn select_experiment(store: &JobStore, query: Option<&str>) -> Result<Experiment> {
    let Some(query) = query.map(str::trim).filter(|q| !q.is_empty()) else {
        return store
            .query_experiments(&ExperimentFilter {
                limit: Some(1),
                ..ExperimentFilter::default()
            })?
            .into_iter()
            .next()
            .ok_or_else(|| Error::NotFound("no experiments recorded".to_string()));
    };
    if let Some(exp) = store.get_experiment(query)? {
        return Ok(exp);
    }
    let mut matches = select_experiments(store, Some(query), ExperimentFilter::default())?;
    match matches.len() {
        0 => Err(Error::NotFound(format!("no experiment matches '{}'", query))),
        1 => Ok(matches.remove(0)),
        _ => Err(Error::Ambiguous {
            query: query.to_string(),
            candidates: matches.iter().map(|e| e.to_string()).collect(),
        }),
    }
}

/// Every experiment whose id or name contains `query` and that passes
/// `filter`, newest first.
pub fn select_experiments(
    store: &JobStore,
    query: Option<&str>,
    filter: ExperimentFilter,
) -> Result<Vec<Experiment>> {
    let Some(query) = query.map(str::trim).filter(|q| !q.is_empty()) else {
        return store.query_experiments(&filter);
    };
    let by_id = store.query_experiments(&ExperimentFilter {
        id_contains: Some(query.to_string()),
        ..filter.clone()
    })?;
    let by_name = store.query_experiments(&ExperimentFilter {
        name_contains: Some(query.to_string()),
        ..filter
    })?;
    let mut merged = by_id;
    for exp in by_name {
        if !merged.iter().any(|e| e.id == exp.id) {
            merged.push(exp);
        }
    }
    merged.sort_by(|a, b| b.created_at.cmp(&a.created_at).then_with(|| b.id.cmp(&a.id)));
    Ok(merged)
}
