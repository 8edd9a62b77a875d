use crate::error::{RpcError, RpcResult};
use crate::model::{Analysis, DependencyMap, RunSummary};
use crate::repository::Repository;
use std::borrow::Cow;
use tracing::debug;

/// Read-through memo of the bound run's summary, dependency map and
/// analysis list.
///
/// Values are loaded on first use and kept for the life of the process. Only
/// the run the session is bound to is memoised; other runs named in a URI are
/// loaded fresh on every request.
#[derive(Debug, Default)]
pub struct SessionCache {
    run_id: Option<i64>,
    summary: Option<RunSummary>,
    dependencies: Option<DependencyMap>,
    analyses: Option<Vec<Analysis>>,
}

impl SessionCache {
    pub fn new(run_id: Option<i64>) -> Self {
        Self {
            run_id,
            ..Default::default()
        }
    }

    /// The run this session answers about when a request does not name one.
    pub fn run_id(&self) -> Option<i64> {
        self.run_id
    }

    pub fn summary(&mut self, repo: &Repository, run_id: i64) -> RpcResult<Cow<'_, RunSummary>> {
        if self.run_id != Some(run_id) {
            return load_summary(repo, run_id).map(Cow::Owned);
        }
        cached(&mut self.summary, || load_summary(repo, run_id)).map(Cow::Borrowed)
    }

    pub fn dependencies(
        &mut self,
        repo: &Repository,
        run_id: i64,
    ) -> RpcResult<Cow<'_, DependencyMap>> {
        if self.run_id != Some(run_id) {
            return load_dependencies(repo, run_id).map(Cow::Owned);
        }
        cached(&mut self.dependencies, || load_dependencies(repo, run_id)).map(Cow::Borrowed)
    }

    pub fn analyses(&mut self, repo: &Repository, run_id: i64) -> RpcResult<Cow<'_, [Analysis]>> {
        if self.run_id != Some(run_id) {
            return load_analyses(repo, run_id).map(Cow::Owned);
        }
        cached(&mut self.analyses, || load_analyses(repo, run_id))
            .map(|list| Cow::Borrowed(list.as_slice()))
    }
}

fn cached<T>(slot: &mut Option<T>, load: impl FnOnce() -> RpcResult<T>) -> RpcResult<&T> {
    let value = match slot.take() {
        Some(value) => value,
        None => load()?,
    };
    let value: &T = slot.insert(value);
    Ok(value)
}

/// Not found when the run does not exist at all.
pub fn require_run(repo: &Repository, run_id: i64) -> RpcResult<()> {
    match repo.get_run(run_id)? {
        Some(_) => Ok(()),
        None => Err(RpcError::NotFound(format!("run {run_id}"))),
    }
}

fn load_summary(repo: &Repository, run_id: i64) -> RpcResult<RunSummary> {
    debug!(run_id, "loading run summary");
    repo.summary(run_id)?
        .ok_or_else(|| RpcError::NotFound(format!("run {run_id}")))
}

fn load_dependencies(repo: &Repository, run_id: i64) -> RpcResult<DependencyMap> {
    require_run(repo, run_id)?;
    debug!(run_id, "loading dependency map");
    let map = repo.dependency_map(run_id)?;
    if map.edges.is_empty() {
        return Err(RpcError::NoData(format!("run {run_id} has no dependencies")));
    }
    Ok(map)
}

fn load_analyses(repo: &Repository, run_id: i64) -> RpcResult<Vec<Analysis>> {
    require_run(repo, run_id)?;
    debug!(run_id, "loading analyses");
    let analyses = repo.list_analyses(run_id)?;
    if analyses.is_empty() {
        return Err(RpcError::NoData(format!("run {run_id} has no analyses")));
    }
    Ok(analyses)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{DependencyEdge, EdgeType, NewRun};
    use tempfile::TempDir;

    fn repo_with_run() -> (Repository, i64, TempDir) {
        let temp_dir = TempDir::new().unwrap();
        let repo = Repository::open(&temp_dir.path().join("insights.db"), None).unwrap();
        let run_id = repo.create_run(&NewRun::default()).unwrap();
        (repo, run_id, temp_dir)
    }

    #[test]
    fn bound_run_is_memoised() {
        let (repo, run_id, _temp) = repo_with_run();
        repo.save_dependencies(
            run_id,
            &[DependencyEdge::new("A.cbl", "B.cpy", EdgeType::Copy, None)],
        )
        .unwrap();

        let mut cache = SessionCache::new(Some(run_id));
        assert!(matches!(
            cache.dependencies(&repo, run_id).unwrap(),
            Cow::Borrowed(_)
        ));

        // later writes are not observed within the session
        repo.save_dependencies(run_id, &[]).unwrap();
        assert_eq!(cache.dependencies(&repo, run_id).unwrap().edges.len(), 1);
    }

    #[test]
    fn other_runs_load_fresh() {
        let (repo, run_id, _temp) = repo_with_run();
        let other = repo.create_run(&NewRun::default()).unwrap();
        let mut cache = SessionCache::new(Some(run_id));
        let summary = cache.summary(&repo, other).unwrap();
        assert!(matches!(summary, Cow::Owned(_)));
        assert_eq!(summary.run.id, other);
    }

    #[test]
    fn missing_and_empty_are_distinct() {
        let (repo, run_id, _temp) = repo_with_run();
        let mut cache = SessionCache::new(Some(run_id));
        assert!(matches!(
            cache.analyses(&repo, run_id),
            Err(RpcError::NoData(_))
        ));
        assert!(matches!(
            cache.analyses(&repo, run_id + 100),
            Err(RpcError::NotFound(_))
        ));
    }
}
