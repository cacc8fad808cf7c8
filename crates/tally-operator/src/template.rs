//! SQL template renderer
//!
//! Expands a ReportGenerationQuery template against a report context.
//! Strict mode is on: an unknown input or a reference to a resource that
//! is not ready fails the render with a diagnostic naming the offender.
//! The renderer performs no dependency resolution; callers resolve and
//! materialize dependencies first (`reconcile::deps`).

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use handlebars::{
    Context, Handlebars, Helper, HelperDef, HelperResult, Output, RenderContext,
    RenderErrorReason,
};
use serde_json::json;

use tally_common::{Error, Result};

use crate::crd::{ReportDataSource, ReportGenerationQuery};
use crate::store::Store;

/// Resolved inputs and reporting window bound into a render.
#[derive(Debug, Clone, Default)]
pub struct ReportContext {
    pub reporting_start: Option<DateTime<Utc>>,
    pub reporting_end: Option<DateTime<Utc>>,
    pub inputs: BTreeMap<String, String>,
}

impl ReportContext {
    pub fn new(start: DateTime<Utc>, end: DateTime<Utc>) -> Self {
        Self {
            reporting_start: Some(start),
            reporting_end: Some(end),
            inputs: BTreeMap::new(),
        }
    }

    pub fn with_inputs(mut self, inputs: BTreeMap<String, String>) -> Self {
        self.inputs = inputs;
        self
    }

    fn to_json(&self) -> serde_json::Value {
        json!({
            "Report": {
                "ReportingStart": self.reporting_start.map(|t| t.to_rfc3339()),
                "ReportingEnd": self.reporting_end.map(|t| t.to_rfc3339()),
                "Inputs": self.inputs,
            }
        })
    }
}

/// Renders templates for one namespace against the live resource caches.
pub struct TemplateRenderer {
    queries: Arc<Store<ReportGenerationQuery>>,
    data_sources: Arc<Store<ReportDataSource>>,
    namespace: String,
}

impl TemplateRenderer {
    pub fn new(
        queries: Arc<Store<ReportGenerationQuery>>,
        data_sources: Arc<Store<ReportDataSource>>,
        namespace: impl Into<String>,
    ) -> Self {
        Self {
            queries,
            data_sources,
            namespace: namespace.into(),
        }
    }

    /// Expand `template` with `ctx`, producing executable SQL.
    pub fn render(&self, template: &str, ctx: &ReportContext) -> Result<String> {
        let mut registry = Handlebars::new();
        registry.set_strict_mode(true);
        registry.register_escape_fn(handlebars::no_escape);
        registry.register_helper(
            "generationQueryViewName",
            Box::new(GenerationQueryViewName {
                queries: Arc::clone(&self.queries),
                namespace: self.namespace.clone(),
            }),
        );
        registry.register_helper(
            "dataSourceTableName",
            Box::new(DataSourceTableName {
                data_sources: Arc::clone(&self.data_sources),
                namespace: self.namespace.clone(),
            }),
        );
        registry.register_helper(
            "renderReportGenerationQuery",
            Box::new(RenderGenerationQuery {
                queries: Arc::clone(&self.queries),
                namespace: self.namespace.clone(),
            }),
        );
        registry.register_helper("prestoTimestamp", Box::new(PrestoTimestamp));
        registry.register_helper("billingPeriodTimestamp", Box::new(BillingPeriodTimestamp));
        registry.register_helper("default", Box::new(DefaultValue));

        registry
            .render_template(template, &ctx.to_json())
            .map_err(|err| Error::Render(err.to_string()))
    }
}

fn string_param(
    h: &Helper<'_>,
    index: usize,
    helper: &str,
) -> std::result::Result<String, handlebars::RenderError> {
    h.param(index)
        .and_then(|v| v.value().as_str())
        .map(str::to_owned)
        .ok_or_else(|| {
            RenderErrorReason::Other(format!(
                "{helper} requires a string argument at position {index}"
            ))
            .into()
        })
}

/// `generationQueryViewName "name"`: the Presto view identifier for a
/// materialized query.
struct GenerationQueryViewName {
    queries: Arc<Store<ReportGenerationQuery>>,
    namespace: String,
}

impl HelperDef for GenerationQueryViewName {
    fn call<'reg: 'rc, 'rc>(
        &self,
        h: &Helper<'rc>,
        _: &'reg Handlebars<'reg>,
        _: &'rc Context,
        _: &mut RenderContext<'reg, 'rc>,
        out: &mut dyn Output,
    ) -> HelperResult {
        let name = string_param(h, 0, "generationQueryViewName")?;
        let query = self.queries.get(&self.namespace, &name).ok_or_else(|| {
            RenderErrorReason::Other(format!("ReportGenerationQuery {name} not found"))
        })?;
        if query.spec.view.disabled {
            return Err(RenderErrorReason::Other(format!(
                "ReportGenerationQuery {name} has view.disabled set; reference it via renderReportGenerationQuery"
            ))
            .into());
        }
        let view = query
            .status
            .as_ref()
            .and_then(|s| s.view_name.clone())
            .ok_or_else(|| {
                RenderErrorReason::Other(format!(
                    "ReportGenerationQuery {name} has no materialized view yet"
                ))
            })?;
        out.write(&view)?;
        Ok(())
    }
}

/// `dataSourceTableName "name"`: the table backing a ReportDataSource.
struct DataSourceTableName {
    data_sources: Arc<Store<ReportDataSource>>,
    namespace: String,
}

impl HelperDef for DataSourceTableName {
    fn call<'reg: 'rc, 'rc>(
        &self,
        h: &Helper<'rc>,
        _: &'reg Handlebars<'reg>,
        _: &'rc Context,
        _: &mut RenderContext<'reg, 'rc>,
        out: &mut dyn Output,
    ) -> HelperResult {
        let name = string_param(h, 0, "dataSourceTableName")?;
        let source = self.data_sources.get(&self.namespace, &name).ok_or_else(|| {
            RenderErrorReason::Other(format!("ReportDataSource {name} not found"))
        })?;
        let table = source
            .status
            .as_ref()
            .and_then(|s| s.table_name.clone())
            .ok_or_else(|| {
                RenderErrorReason::Other(format!("ReportDataSource {name} has no table yet"))
            })?;
        out.write(&table)?;
        Ok(())
    }
}

/// `renderReportGenerationQuery "name"`: inline the referenced query's
/// rendered template with the current context.
struct RenderGenerationQuery {
    queries: Arc<Store<ReportGenerationQuery>>,
    namespace: String,
}

impl HelperDef for RenderGenerationQuery {
    fn call<'reg: 'rc, 'rc>(
        &self,
        h: &Helper<'rc>,
        r: &'reg Handlebars<'reg>,
        ctx: &'rc Context,
        _: &mut RenderContext<'reg, 'rc>,
        out: &mut dyn Output,
    ) -> HelperResult {
        let name = string_param(h, 0, "renderReportGenerationQuery")?;
        let query = self.queries.get(&self.namespace, &name).ok_or_else(|| {
            RenderErrorReason::Other(format!("ReportGenerationQuery {name} not found"))
        })?;
        let rendered = r.render_template_with_context(&query.spec.query, ctx)?;
        out.write(&rendered)?;
        Ok(())
    }
}

/// `prestoTimestamp t` formats as `YYYY-MM-DD HH:MM:SS.mmm`.
struct PrestoTimestamp;

impl HelperDef for PrestoTimestamp {
    fn call<'reg: 'rc, 'rc>(
        &self,
        h: &Helper<'rc>,
        _: &'reg Handlebars<'reg>,
        _: &'rc Context,
        _: &mut RenderContext<'reg, 'rc>,
        out: &mut dyn Output,
    ) -> HelperResult {
        let value = string_param(h, 0, "prestoTimestamp")?;
        let t = parse_timestamp(&value, "prestoTimestamp")?;
        out.write(&t.format("%Y-%m-%d %H:%M:%S%.3f").to_string())?;
        Ok(())
    }
}

/// `billingPeriodTimestamp t` formats as `YYYYMMDD` for partition comparison.
struct BillingPeriodTimestamp;

impl HelperDef for BillingPeriodTimestamp {
    fn call<'reg: 'rc, 'rc>(
        &self,
        h: &Helper<'rc>,
        _: &'reg Handlebars<'reg>,
        _: &'rc Context,
        _: &mut RenderContext<'reg, 'rc>,
        out: &mut dyn Output,
    ) -> HelperResult {
        let value = string_param(h, 0, "billingPeriodTimestamp")?;
        let t = parse_timestamp(&value, "billingPeriodTimestamp")?;
        out.write(&t.format("%Y%m%d").to_string())?;
        Ok(())
    }
}

fn parse_timestamp(
    value: &str,
    helper: &str,
) -> std::result::Result<DateTime<Utc>, handlebars::RenderError> {
    DateTime::parse_from_rfc3339(value)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|err| {
            RenderErrorReason::Other(format!("{helper}: cannot parse {value:?}: {err}")).into()
        })
}

/// `default fallback value` returns `value` when non-empty, else `fallback`.
struct DefaultValue;

impl HelperDef for DefaultValue {
    fn call<'reg: 'rc, 'rc>(
        &self,
        h: &Helper<'rc>,
        _: &'reg Handlebars<'reg>,
        _: &'rc Context,
        _: &mut RenderContext<'reg, 'rc>,
        out: &mut dyn Output,
    ) -> HelperResult {
        let fallback = string_param(h, 0, "default")?;
        let value = h.param(1).map(|v| v.value().clone()).unwrap_or_default();
        match value {
            serde_json::Value::String(s) if !s.is_empty() => out.write(&s)?,
            serde_json::Value::Null => out.write(&fallback)?,
            serde_json::Value::String(_) => out.write(&fallback)?,
            other => out.write(&other.to_string())?,
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{data_source, generation_query, with_table, with_view};
    use chrono::TimeZone;

    fn renderer(
        queries: &[ReportGenerationQuery],
        sources: &[ReportDataSource],
    ) -> TemplateRenderer {
        let query_store = Store::<ReportGenerationQuery>::new();
        for q in queries {
            query_store.apply(q.clone());
        }
        let source_store = Store::<ReportDataSource>::new();
        for s in sources {
            source_store.apply(s.clone());
        }
        TemplateRenderer::new(query_store, source_store, "tally")
    }

    fn window() -> ReportContext {
        ReportContext::new(
            Utc.with_ymd_and_hms(2019, 1, 1, 0, 0, 0).unwrap(),
            Utc.with_ymd_and_hms(2019, 1, 2, 0, 0, 0).unwrap(),
        )
    }

    #[test]
    fn renders_window_bindings_and_formats() {
        let r = renderer(&[], &[]);
        let sql = r
            .render(
                "SELECT * FROM t WHERE ts >= timestamp '{{prestoTimestamp Report.ReportingStart}}' \
                 AND period >= '{{billingPeriodTimestamp Report.ReportingEnd}}'",
                &window(),
            )
            .unwrap();
        assert!(sql.contains("timestamp '2019-01-01 00:00:00.000'"));
        assert!(sql.contains("period >= '20190102'"));
    }

    #[test]
    fn missing_input_names_the_input() {
        let r = renderer(&[], &[]);
        let err = r
            .render("SELECT {{Report.Inputs.cluster}}", &window())
            .unwrap_err();
        assert!(err.to_string().contains("cluster"), "got: {err}");
    }

    #[test]
    fn inputs_bind_by_name() {
        let r = renderer(&[], &[]);
        let mut inputs = BTreeMap::new();
        inputs.insert("cluster".to_string(), "prod".to_string());
        let ctx = window().with_inputs(inputs);
        let sql = r
            .render("WHERE cluster = '{{Report.Inputs.cluster}}'", &ctx)
            .unwrap();
        assert_eq!(sql, "WHERE cluster = 'prod'");
    }

    #[test]
    fn view_name_requires_materialization() {
        let raw = generation_query("tally", "raw", "SELECT 1");
        let r = renderer(&[raw.clone()], &[]);
        let err = r
            .render("SELECT * FROM {{generationQueryViewName \"raw\"}}", &window())
            .unwrap_err();
        assert!(err.to_string().contains("no materialized view"));

        let r = renderer(&[with_view(raw, "view_raw")], &[]);
        let sql = r
            .render("SELECT * FROM {{generationQueryViewName \"raw\"}}", &window())
            .unwrap();
        assert_eq!(sql, "SELECT * FROM view_raw");
    }

    #[test]
    fn view_name_rejects_disabled_views() {
        let mut q = generation_query("tally", "inline-only", "SELECT 1");
        q.spec.view.disabled = true;
        let r = renderer(&[q], &[]);
        let err = r
            .render(
                "SELECT * FROM {{generationQueryViewName \"inline-only\"}}",
                &window(),
            )
            .unwrap_err();
        assert!(err.to_string().contains("view.disabled"));
    }

    #[test]
    fn data_source_table_resolves_from_status() {
        let ds = data_source("tally", "pods", "pod-usage");
        let r = renderer(&[], &[ds.clone()]);
        let err = r
            .render("FROM {{dataSourceTableName \"pods\"}}", &window())
            .unwrap_err();
        assert!(err.to_string().contains("no table"));

        let r = renderer(&[], &[with_table(ds, "datasource_pods")]);
        let sql = r
            .render("FROM {{dataSourceTableName \"pods\"}}", &window())
            .unwrap();
        assert_eq!(sql, "FROM datasource_pods");
    }

    #[test]
    fn dynamic_query_is_inlined_with_same_context() {
        let inner = generation_query(
            "tally",
            "filtered",
            "SELECT * FROM base WHERE ts < timestamp '{{prestoTimestamp Report.ReportingEnd}}'",
        );
        let r = renderer(&[inner], &[]);
        let sql = r
            .render(
                "SELECT sum(x) FROM ({{renderReportGenerationQuery \"filtered\"}})",
                &window(),
            )
            .unwrap();
        assert!(sql.contains("FROM (SELECT * FROM base"));
        assert!(sql.contains("2019-01-02 00:00:00.000"));
    }

    #[test]
    fn default_falls_back_on_empty() {
        let r = renderer(&[], &[]);
        let mut inputs = BTreeMap::new();
        inputs.insert("set".to_string(), "value".to_string());
        inputs.insert("empty".to_string(), String::new());
        let ctx = window().with_inputs(inputs);
        assert_eq!(
            r.render("{{default \"fb\" Report.Inputs.set}}", &ctx).unwrap(),
            "value"
        );
        assert_eq!(
            r.render("{{default \"fb\" Report.Inputs.empty}}", &ctx)
                .unwrap(),
            "fb"
        );
    }

    #[test]
    fn rendering_is_deterministic() {
        let ds = with_table(data_source("tally", "pods", "pod-usage"), "datasource_pods");
        let r = renderer(&[], &[ds]);
        let template =
            "SELECT * FROM {{dataSourceTableName \"pods\"}} WHERE ts >= timestamp '{{prestoTimestamp Report.ReportingStart}}'";
        let first = r.render(template, &window()).unwrap();
        let second = r.render(template, &window()).unwrap();
        assert_eq!(first, second);
    }
}
