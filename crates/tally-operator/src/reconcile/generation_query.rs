//! ReportGenerationQuery reconciler
//!
//! Waits for every direct dependency to be ready, then materializes the
//! query as a Presto view (unless `view.disabled`). Views render with an
//! empty report context: they must not reference reporting-window inputs.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

use tally_common::{Error, Result};

use crate::crd::{ReportGenerationQuery, ReportGenerationQueryStatus};
use crate::naming::generation_query_view_name;
use crate::store::ObjectKey;
use crate::template::{ReportContext, TemplateRenderer};

use super::{Ctx, Reconciler};

pub struct GenerationQueryReconciler {
    ctx: Arc<Ctx>,
}

impl GenerationQueryReconciler {
    pub fn new(ctx: Arc<Ctx>) -> Arc<Self> {
        Arc::new(Self { ctx })
    }

    fn check_dependencies(&self, namespace: &str, query: &ReportGenerationQuery) -> Result<()> {
        for name in &query.spec.report_queries {
            let dep = self
                .ctx
                .stores
                .generation_queries
                .get(namespace, name)
                .ok_or_else(|| {
                    Error::DependencyNotReady(format!(
                        "ReportGenerationQuery {name} does not exist"
                    ))
                })?;
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
        }
        for name in &query.spec.dynamic_report_queries {
            if self
                .ctx
                .stores
                .generation_queries
                .get(namespace, name)
                .is_none()
            {
                return Err(Error::DependencyNotReady(format!(
                    "ReportGenerationQuery {name} does not exist"
                )));
            }
        }
        for name in &query.spec.report_data_sources {
            let ready = self
                .ctx
                .stores
                .data_sources
                .get(namespace, name)
                .and_then(|s| s.status.as_ref().and_then(|st| st.table_name.clone()))
                .is_some();
            if !ready {
                return Err(Error::DependencyNotReady(format!(
                    "ReportDataSource {name} has no backing table"
                )));
            }
        }
        Ok(())
    }
}

#[async_trait]
impl Reconciler for GenerationQueryReconciler {
    fn kind(&self) -> &'static str {
        "ReportGenerationQuery"
    }

    async fn sync(&self, key: &str) -> Result<()> {
        let Some(key) = ObjectKey::parse(key) else {
            return Ok(());
        };
        let Some(query) = self
            .ctx
            .stores
            .generation_queries
            .get(&key.namespace, &key.name)
        else {
            debug!(%key, "generation query deleted, nothing to do");
            return Ok(());
        };

        self.check_dependencies(&key.namespace, &query)?;

        if query.spec.view.disabled {
            return Ok(());
        }
        if query
            .status
            .as_ref()
            .and_then(|s| s.view_name.as_ref())
            .is_some()
        {
            return Ok(());
        }

        let renderer = TemplateRenderer::new(
            Arc::clone(&self.ctx.stores.generation_queries),
            Arc::clone(&self.ctx.stores.data_sources),
            key.namespace.clone(),
        );
        let rendered = renderer.render(&query.spec.query, &ReportContext::default())?;
        let view = generation_query_view_name(&key.name);
        self.ctx
            .presto
            .execute(&format!("CREATE OR REPLACE VIEW {view} AS {rendered}"))
            .await?;

        self.ctx
            .status
            .generation_query(
                &key.namespace,
                &key.name,
                &ReportGenerationQueryStatus {
                    view_name: Some(view),
                },
            )
            .await
    }
}
