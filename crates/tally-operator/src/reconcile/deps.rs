//! Dependency resolution for generation queries
//!
//! Walks the transitive closure of `reportQueries`, `dynamicReportQueries`
//! and `reportDataSources` edges, verifying that every view dependency is
//! materialized (or explicitly dynamic/disabled) and every data source has
//! a backing table. The walk is a depth-first visit with gray/black marks;
//! a gray revisit is a cycle and fails with the cycle path spelled out.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use tally_common::{Error, Result};

use crate::crd::{ReportDataSource, ReportGenerationQuery};
use crate::store::Store;

/// The full transitive dependency closure of one generation query.
#[derive(Default, Debug)]
pub struct ResolvedDependencies {
    /// Queries read through materialized views
    pub view_queries: Vec<Arc<ReportGenerationQuery>>,
    /// Queries inlined at render time
    pub dynamic_queries: Vec<Arc<ReportGenerationQuery>>,
    /// Data sources with backing tables
    pub data_sources: Vec<Arc<ReportDataSource>>,
}

#[derive(Clone, Copy, PartialEq)]
enum Mark {
    Gray,
    Black,
}

struct Resolver<'a> {
    queries: &'a Store<ReportGenerationQuery>,
    data_sources: &'a Store<ReportDataSource>,
    namespace: &'a str,
    marks: HashMap<String, Mark>,
    seen_sources: HashSet<String>,
    resolved: ResolvedDependencies,
}

/// Resolve the transitive dependency closure of `root`.
///
/// Missing or unmaterialized dependencies return
/// [`Error::DependencyNotReady`] so callers requeue with backoff; a cyclic
/// graph returns the terminal [`Error::DependencyCycle`].
pub fn resolve(
    queries: &Store<ReportGenerationQuery>,
    data_sources: &Store<ReportDataSource>,
    namespace: &str,
    root: &ReportGenerationQuery,
) -> Result<ResolvedDependencies> {
    let mut resolver = Resolver {
        queries,
        data_sources,
        namespace,
        marks: HashMap::new(),
        seen_sources: HashSet::new(),
        resolved: ResolvedDependencies::default(),
    };
    let root_name = kube::ResourceExt::name_any(root);
    resolver.marks.insert(root_name.clone(), Mark::Gray);
    resolver.visit_edges(root, &mut vec![root_name.clone()])?;
    resolver.marks.insert(root_name, Mark::Black);
    Ok(resolver.resolved)
}

impl Resolver<'_> {
    fn visit_edges(&mut self, query: &ReportGenerationQuery, path: &mut Vec<String>) -> Result<()> {
        for name in &query.spec.report_queries {
            let dep = self.lookup(name)?;
            let materialized = dep
                .status
                .as_ref()
                .and_then(|s| s.view_name.as_ref())
                .is_some();
            if !materialized && !dep.spec.view.disabled {
                return Err(Error::DependencyNotReady(format!(
                    "ReportGenerationQuery {name} has no materialized view"
                )));
            }
            self.visit_query(name, dep, false, path)?;
        }
        for name in &query.spec.dynamic_report_queries {
            let dep = self.lookup(name)?;
            self.visit_query(name, dep, true, path)?;
        }
        for name in &query.spec.report_data_sources {
            let source = self.data_sources.get(self.namespace, name).ok_or_else(|| {
                Error::DependencyNotReady(format!("ReportDataSource {name} does not exist"))
            })?;
            let has_table = source
                .status
                .as_ref()
                .and_then(|s| s.table_name.as_ref())
                .is_some();
            if !has_table {
                return Err(Error::DependencyNotReady(format!(
                    "ReportDataSource {name} has no backing table"
                )));
            }
            if self.seen_sources.insert(name.clone()) {
                self.resolved.data_sources.push(source);
            }
        }
        Ok(())
    }

    fn visit_query(
        &mut self,
        name: &str,
        dep: Arc<ReportGenerationQuery>,
        dynamic: bool,
        path: &mut Vec<String>,
    ) -> Result<()> {
        match self.marks.get(name) {
            Some(Mark::Gray) => {
                let mut cycle = path.clone();
                cycle.push(name.to_string());
                return Err(Error::DependencyCycle(cycle.join(" -> ")));
            }
            Some(Mark::Black) => return Ok(()),
            None => {}
        }
        self.marks.insert(name.to_string(), Mark::Gray);
        path.push(name.to_string());
        self.visit_edges(&dep, path)?;
        path.pop();
        self.marks.insert(name.to_string(), Mark::Black);
        if dynamic {
            self.resolved.dynamic_queries.push(dep);
        } else {
            self.resolved.view_queries.push(dep);
        }
        Ok(())
    }

    fn lookup(&self, name: &str) -> Result<Arc<ReportGenerationQuery>> {
        self.queries.get(self.namespace, name).ok_or_else(|| {
            Error::DependencyNotReady(format!("ReportGenerationQuery {name} does not exist"))
        })
    }
}
