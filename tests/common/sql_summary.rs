#![allow(dead_code)]

//! Canonical SQL-summary workflow fixture.
//!
//! Thirteen steps fanning out from the job input: connect to a server,
//! query two tables in parallel (gated on an auth check), merge the
//! results, then send a notification. Failure sites are addressable
//! through error/panic/flaky injection on the job input, keyed like
//! `"GetTableClient.server1.table1"`.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use jobdag::{Context, JobDefinition, JobError, RetryPolicy, StepDefinition, StepOptions, TaskError};

#[derive(Debug, Clone, Default)]
pub struct SqlSummaryJobParams {
    pub server_name: String,
    pub table1: String,
    pub query1: String,
    pub table2: String,
    pub query2: String,
    /// site -> error message returned from that site.
    pub error_injection: HashMap<String, String>,
    /// Sites that panic instead of returning.
    pub panic_injection: HashSet<String>,
    /// site -> remaining transient failures before the site succeeds.
    pub flaky_injection: HashMap<String, Arc<AtomicU32>>,
}

impl SqlSummaryJobParams {
    pub fn new(server_name: &str) -> Self {
        Self {
            server_name: server_name.to_string(),
            table1: "table1".to_string(),
            query1: "query1".to_string(),
            table2: "table2".to_string(),
            query2: "query2".to_string(),
            ..Default::default()
        }
    }

    pub fn with_error(mut self, site: &str, message: &str) -> Self {
        self.error_injection
            .insert(site.to_string(), message.to_string());
        self
    }

    pub fn with_panic(mut self, site: &str) -> Self {
        self.panic_injection.insert(site.to_string());
        self
    }

    pub fn with_flaky(mut self, site: &str, failures: u32) -> Self {
        self.flaky_injection
            .insert(site.to_string(), Arc::new(AtomicU32::new(failures)));
        self
    }

    fn check(&self, site: &str) -> anyhow::Result<()> {
        if self.panic_injection.contains(site) {
            panic!("injected panic at {site}");
        }
        if let Some(message) = self.error_injection.get(site) {
            anyhow::bail!("{message}");
        }
        if let Some(remaining) = self.flaky_injection.get(site) {
            let decremented = remaining
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok();
            if decremented {
                anyhow::bail!("transient failure at {site}");
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct ServerTarget {
    pub server_name: String,
    pub params: SqlSummaryJobParams,
}

#[derive(Debug, Clone)]
pub struct SqlConnection {
    pub server_name: String,
    pub params: SqlSummaryJobParams,
}

#[derive(Debug, Clone)]
pub struct SqlTableClient {
    pub server_name: String,
    pub table_name: String,
    pub params: SqlSummaryJobParams,
}

#[derive(Debug, Clone)]
pub struct SqlQueryResult {
    pub data: HashMap<String, String>,
}

#[derive(Debug, Clone)]
pub struct SummarizedResult {
    pub data1: HashMap<String, String>,
    pub data2: HashMap<String, String>,
}

pub async fn server_name_param(
    _ctx: Context,
    input: Arc<SqlSummaryJobParams>,
) -> anyhow::Result<ServerTarget> {
    Ok(ServerTarget {
        server_name: input.server_name.clone(),
        params: (*input).clone(),
    })
}

pub async fn get_connection(
    _ctx: Context,
    target: Arc<ServerTarget>,
) -> anyhow::Result<SqlConnection> {
    target
        .params
        .check(&format!("GetConnection.{}", target.server_name))?;
    Ok(SqlConnection {
        server_name: target.server_name.clone(),
        params: target.params.clone(),
    })
}

pub async fn check_auth(
    _ctx: Context,
    input: Arc<SqlSummaryJobParams>,
) -> anyhow::Result<()> {
    input.check("CheckAuth")?;
    Ok(())
}

pub async fn table1_param(
    _ctx: Context,
    input: Arc<SqlSummaryJobParams>,
) -> anyhow::Result<String> {
    Ok(input.table1.clone())
}

pub async fn query1_param(
    _ctx: Context,
    input: Arc<SqlSummaryJobParams>,
) -> anyhow::Result<String> {
    Ok(input.query1.clone())
}

pub async fn table2_param(
    _ctx: Context,
    input: Arc<SqlSummaryJobParams>,
) -> anyhow::Result<String> {
    Ok(input.table2.clone())
}

pub async fn query2_param(
    _ctx: Context,
    input: Arc<SqlSummaryJobParams>,
) -> anyhow::Result<String> {
    Ok(input.query2.clone())
}

pub async fn get_table_client(
    _ctx: Context,
    connection: Arc<SqlConnection>,
    table_name: Arc<String>,
) -> anyhow::Result<SqlTableClient> {
    connection.params.check(&format!(
        "GetTableClient.{}.{}",
        connection.server_name, table_name
    ))?;
    Ok(SqlTableClient {
        server_name: connection.server_name.clone(),
        table_name: (*table_name).clone(),
        params: connection.params.clone(),
    })
}

pub async fn execute_query(
    _ctx: Context,
    client: Arc<SqlTableClient>,
    query: Arc<String>,
) -> anyhow::Result<SqlQueryResult> {
    client.params.check(&format!(
        "ExecuteQuery.{}.{}.{}",
        client.server_name, client.table_name, query
    ))?;
    let mut data = HashMap::new();
    data.insert("serverName".to_string(), client.server_name.clone());
    data.insert("tableName".to_string(), client.table_name.clone());
    data.insert("queryName".to_string(), (*query).clone());
    Ok(SqlQueryResult { data })
}

pub async fn summarize_results(
    _ctx: Context,
    result1: Arc<SqlQueryResult>,
    result2: Arc<SqlQueryResult>,
) -> anyhow::Result<SummarizedResult> {
    Ok(SummarizedResult {
        data1: result1.data.clone(),
        data2: result2.data.clone(),
    })
}

pub async fn email_notification(_ctx: Context) -> anyhow::Result<()> {
    Ok(())
}

/// Stateful linear-backoff policy: a constant sleep, a bounded number of
/// re-attempts.
#[derive(Debug, Clone)]
pub struct LinearRetryPolicy {
    sleep: Duration,
    max_retries: u32,
    tried: u32,
}

impl LinearRetryPolicy {
    pub fn new(sleep: Duration, max_retries: u32) -> Self {
        Self {
            sleep,
            max_retries,
            tried: 0,
        }
    }
}

impl RetryPolicy for LinearRetryPolicy {
    fn should_retry(&mut self, _err: &TaskError) -> bool {
        self.tried < self.max_retries
    }

    fn sleep_interval(&mut self) -> Duration {
        self.tried += 1;
        self.sleep
    }
}

/// The built definition plus the typed handles the tests inspect.
pub struct SqlSummaryJob {
    pub definition: JobDefinition<SqlSummaryJobParams>,
    pub query_table1: StepDefinition<SqlQueryResult>,
    pub query_table2: StepDefinition<SqlQueryResult>,
    pub summarize: StepDefinition<SummarizedResult>,
}

/// Build the canonical job. `query1_retry` attaches a linear retry policy
/// (sleep, max retries) to the `QueryTable1` step.
pub fn build_sql_summary_job(
    query1_retry: Option<(Duration, u32)>,
) -> Result<SqlSummaryJob, JobError> {
    let job = JobDefinition::<SqlSummaryJobParams>::new("sqlSummaryJob");

    let server_name = job.step_from_input("serverName", server_name_param, StepOptions::new())?;
    let connection = job.step_after("GetConnection", &server_name, get_connection, StepOptions::new())?;
    let auth = job.step_from_input("CheckAuth", check_auth, StepOptions::new())?;

    let table1 = job.step_from_input("table1", table1_param, StepOptions::new())?;
    let table_client1 =
        job.step_after_both("GetTableClient1", &connection, &table1, get_table_client, StepOptions::new())?;
    let query1 = job.step_from_input("query1", query1_param, StepOptions::new())?;
    let mut query1_options = StepOptions::new().execute_after(&auth);
    if let Some((sleep, max_retries)) = query1_retry {
        query1_options =
            query1_options.with_retry(move || LinearRetryPolicy::new(sleep, max_retries));
    }
    let query_table1 =
        job.step_after_both("QueryTable1", &table_client1, &query1, execute_query, query1_options)?;

    let table2 = job.step_from_input("table2", table2_param, StepOptions::new())?;
    let table_client2 =
        job.step_after_both("GetTableClient2", &connection, &table2, get_table_client, StepOptions::new())?;
    let query2 = job.step_from_input("query2", query2_param, StepOptions::new())?;
    let query_table2 = job.step_after_both(
        "QueryTable2",
        &table_client2,
        &query2,
        execute_query,
        StepOptions::new().execute_after(&auth),
    )?;

    let summarize =
        job.step_after_both("Summarize", &query_table1, &query_table2, summarize_results, StepOptions::new())?;
    job.add_step(
        "EmailNotification",
        email_notification,
        StepOptions::new().execute_after(&summarize),
    )?;

    Ok(SqlSummaryJob {
        definition: job,
        query_table1,
        query_table2,
        summarize,
    })
}
