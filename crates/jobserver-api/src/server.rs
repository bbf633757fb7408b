// ABOUTME: JobServer facade: client bookkeeping, history queries and job control as plain async methods.
// ABOUTME: Bundles the Database and JobManager; a transport layer only needs to call these and serialize results.

use std::sync::Arc;

use jobserver_core::{
    ClientUpdateSubtype, ConnectionRecord, ErrorRecord, JobUpdateRecord, ServerUpdateRecord,
    ServerUpdateType, StoredEnum, Table, time,
};
use jobserver_jobs::{
    Admission, JobManager, JobParameters, JobSnapshot, JobStatusView, PauseAllReport, Request,
    TemplateInfo,
};
use jobserver_store::{Database, Filter, SetMode};
use tokio::sync::Mutex;
use tokio_stream::wrappers::BroadcastStream;
use ulid::Ulid;

use crate::error::ApiError;
use crate::query::{ErrorQuery, JobUpdateQuery, Page, TimeWindowQuery, paginate};

/// The public surface of the job server.
pub struct JobServer {
    db: Arc<Database>,
    manager: JobManager,
    /// Serializes read-modify-write of connection counters.
    clients: Mutex<()>,
}

impl JobServer {
    pub fn new(manager: JobManager) -> Self {
        Self {
            db: Arc::clone(manager.database()),
            manager,
            clients: Mutex::new(()),
        }
    }

    pub fn manager(&self) -> &JobManager {
        &self.manager
    }

    // Connections

    /// Register a new client and return its record, including the token it
    /// must present on later requests.
    pub async fn open_connection(&self, client_ip: &str) -> Result<ConnectionRecord, ApiError> {
        let connection = ConnectionRecord::new(Ulid::new().to_string(), client_ip);
        self.db.set_entry(&connection, SetMode::Insert)?;

        let notice = ServerUpdateRecord::new(
            self.manager.clock().now(),
            ServerUpdateType::Client,
            ClientUpdateSubtype::Connected,
            format!("client connected from {client_ip}"),
        )
        .for_client(&connection.client_token);
        self.db.set_entry(&notice, SetMode::Insert)?;

        tracing::info!(
            client_token = %connection.client_token,
            client_ip = %client_ip,
            "client connected"
        );
        Ok(connection)
    }

    /// Count one message from `client_token`.
    pub async fn record_message(&self, client_token: &str) -> Result<ConnectionRecord, ApiError> {
        let _guard = self.clients.lock().await;
        let mut connection = self.get_connection(client_token).await?;
        connection.touch(time::now());
        self.db.set_entry(&connection, SetMode::Update)?;
        Ok(connection)
    }

    pub async fn get_connection(&self, client_token: &str) -> Result<ConnectionRecord, ApiError> {
        self.db
            .get_entry(&[client_token.into()])?
            .ok_or_else(|| ApiError::NotFound {
                table: Table::Connection,
                key: client_token.to_string(),
            })
    }

    pub async fn get_connections(
        &self,
        query: &TimeWindowQuery,
    ) -> Result<Page<ConnectionRecord>, ApiError> {
        let items = self.db.search_entries(&query.to_query("init_time")?)?;
        Ok(query.page(items))
    }

    // Errors

    pub async fn get_error(
        &self,
        error_id: &str,
        include_traceback: bool,
    ) -> Result<ErrorRecord, ApiError> {
        let mut error: ErrorRecord =
            self.db
                .get_entry(&[error_id.into()])?
                .ok_or_else(|| ApiError::NotFound {
                    table: Table::Error,
                    key: error_id.to_string(),
                })?;
        if !include_traceback {
            error.traceback.clear();
        }
        Ok(error)
    }

    pub async fn get_errors(&self, query: &ErrorQuery) -> Result<Page<ErrorRecord>, ApiError> {
        let mut search = query
            .window
            .to_query("error_time")?
            .include_large(query.include_traceback);
        if let Some(severity) = query.severity_level {
            search = search.filter(Filter::eq("severity_level", severity.code()));
        }
        if let Some(job_id) = &query.job_id {
            search = search.filter(Filter::eq("job_id", job_id.as_str()));
        }
        if let Some(token) = &query.client_token {
            search = search.filter(Filter::eq("client_token", token.as_str()));
        }
        let items = self.db.search_entries(&search)?;
        Ok(query.window.page(items))
    }

    // History

    pub async fn get_job_updates(
        &self,
        query: &JobUpdateQuery,
    ) -> Result<Page<JobUpdateRecord>, ApiError> {
        let mut search = query.window.to_query("update_time")?;
        if let Some(job_id) = &query.job_id {
            search = search.filter(Filter::eq("job_id", job_id.as_str()));
        }
        if let Some(token) = &query.client_token {
            search = search.filter(Filter::eq("client_token", token.as_str()));
        }
        if let Some(state) = query.state {
            search = search.filter(Filter::eq("new_state", state.code()));
        }
        let items = self.db.search_entries(&search)?;
        Ok(query.window.page(items))
    }

    pub async fn get_server_updates(
        &self,
        query: &TimeWindowQuery,
    ) -> Result<Page<ServerUpdateRecord>, ApiError> {
        let items = self.db.search_entries(&query.to_query("update_time")?)?;
        Ok(query.page(items))
    }

    // Templates

    pub async fn get_job_template(&self, name: &str) -> Result<TemplateInfo, ApiError> {
        Ok(self.manager.get_job_template(name)?)
    }

    pub async fn get_job_templates(&self, items_per_page: u32, page: u32) -> Page<TemplateInfo> {
        Page {
            items: paginate(self.manager.list_job_templates(), items_per_page, page),
            page,
            items_per_page,
            descending: false,
        }
    }

    // Jobs

    /// Submit a job under `job_id`, or a fresh id when none is given.
    pub async fn submit_job(
        &self,
        job_id: Option<&str>,
        params: JobParameters,
    ) -> Result<JobSnapshot, ApiError> {
        let job_id = job_id
            .map(str::to_string)
            .unwrap_or_else(|| Ulid::new().to_string());
        Ok(self.manager.submit(&job_id, params)?)
    }

    pub async fn start_job(&self, job_id: &str) -> Result<Admission, ApiError> {
        Ok(self.manager.start(job_id)?)
    }

    pub async fn pause_job(
        &self,
        job_id: &str,
        client_token: Option<&str>,
    ) -> Result<JobSnapshot, ApiError> {
        self.control(job_id, Request::Pause, client_token).await
    }

    pub async fn resume_job(
        &self,
        job_id: &str,
        client_token: Option<&str>,
    ) -> Result<JobSnapshot, ApiError> {
        self.control(job_id, Request::Resume, client_token).await
    }

    pub async fn cancel_job(
        &self,
        job_id: &str,
        client_token: Option<&str>,
    ) -> Result<JobSnapshot, ApiError> {
        self.control(job_id, Request::Cancel, client_token).await
    }

    async fn control(
        &self,
        job_id: &str,
        request: Request,
        client_token: Option<&str>,
    ) -> Result<JobSnapshot, ApiError> {
        if let Some(token) = client_token {
            self.record_message(token).await?;
        }
        self.manager.control(job_id, request, client_token).await?;
        let status = self.manager.job_status(job_id)?;
        status.live.ok_or_else(|| ApiError::NotFound {
            table: Table::JobStatus,
            key: job_id.to_string(),
        })
    }

    pub async fn get_job_status(&self, job_id: &str) -> Result<JobStatusView, ApiError> {
        Ok(self.manager.job_status(job_id)?)
    }

    pub async fn active_jobs(&self) -> Vec<JobSnapshot> {
        self.manager.active_jobs()
    }

    /// A stream of the updates appended to `job_id` from now on.
    pub async fn subscribe_to_job(
        &self,
        job_id: &str,
    ) -> Result<BroadcastStream<JobUpdateRecord>, ApiError> {
        Ok(BroadcastStream::new(self.manager.subscribe(job_id)?))
    }

    /// Sweep finished jobs into the archive now. Returns the archived ids.
    pub async fn archive_jobs(&self) -> Result<Vec<String>, ApiError> {
        Ok(self.manager.archive_closed()?)
    }

    /// Pause every running job, then close the database. Jobs that could not
    /// be paused are reported and left to the next start-up.
    pub async fn shutdown(&self) -> Result<PauseAllReport, ApiError> {
        let report = self.manager.pause_all().await;
        for failure in &report.failures {
            tracing::warn!(
                job_id = %failure.job_id,
                reason = %failure.reason,
                "job not paused at shutdown"
            );
        }
        self.db.disconnect()?;
        tracing::info!(paused = report.paused.len(), "job server shut down");
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use jobserver_core::{ErrorSeverity, JobReturnCode, JobState};
    use jobserver_jobs::{ErrorKind, TemplateRegistry};
    use std::time::Duration;
    use tempfile::TempDir;
    use tokio_stream::StreamExt;

    const WAIT: Duration = Duration::from_secs(10);

    fn server() -> (TempDir, JobServer) {
        let dir = TempDir::new().unwrap();
        let db = Arc::new(Database::connect(&dir.path().join("jobs.sqlite3"), true).unwrap());
        let manager = JobManager::new(db, TemplateRegistry::builtin(), 2);
        (dir, JobServer::new(manager))
    }

    async fn run_to_close(server: &JobServer, job_id: &str) -> JobSnapshot {
        server.start_job(job_id).await.unwrap();
        tokio::time::timeout(WAIT, server.manager().wait_for_close(job_id))
            .await
            .unwrap()
            .unwrap()
    }

    #[tokio::test]
    async fn connections_count_messages() {
        let (_dir, server) = server();
        let conn = server.open_connection("10.1.2.3").await.unwrap();
        assert_eq!(conn.num_messages, 0);

        server.record_message(&conn.client_token).await.unwrap();
        let touched = server.record_message(&conn.client_token).await.unwrap();
        assert_eq!(touched.num_messages, 2);
        assert!(touched.last_message_time.is_some());

        let page = server
            .get_connections(&TimeWindowQuery::default())
            .await
            .unwrap();
        assert_eq!(page.items.len(), 1);
        assert_eq!(page.items_per_page, 25);

        let notices = server
            .get_server_updates(&TimeWindowQuery::default())
            .await
            .unwrap();
        assert_eq!(notices.items[0].update_type, ServerUpdateType::Client);

        let err = server.record_message("stranger").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }

    #[tokio::test]
    async fn errors_are_filtered_and_tracebacks_opt_in() {
        let (_dir, server) = server();
        server
            .submit_job(Some("bad"), JobParameters::new("echo").with("fail", true))
            .await
            .unwrap();
        let done = run_to_close(&server, "bad").await;
        assert_eq!(done.result, Some(JobReturnCode::Failed));

        let page = server
            .get_errors(&ErrorQuery {
                job_id: Some("bad".to_string()),
                ..ErrorQuery::default()
            })
            .await
            .unwrap();
        assert_eq!(page.items.len(), 1);
        assert_eq!(page.items[0].traceback, "");

        let with_trace = server
            .get_errors(&ErrorQuery {
                severity_level: Some(ErrorSeverity::Bad),
                include_traceback: true,
                ..ErrorQuery::default()
            })
            .await
            .unwrap();
        assert!(with_trace.items[0].traceback.contains("bad"));

        let none = server
            .get_errors(&ErrorQuery {
                severity_level: Some(ErrorSeverity::Catastrophic),
                ..ErrorQuery::default()
            })
            .await
            .unwrap();
        assert!(none.items.is_empty());

        let id = &page.items[0].error_id;
        assert!(server.get_error(id, false).await.unwrap().traceback.is_empty());
        assert!(!server.get_error(id, true).await.unwrap().traceback.is_empty());
    }

    #[tokio::test]
    async fn job_updates_are_newest_first_by_default() {
        let (_dir, server) = server();
        server
            .submit_job(Some("e"), JobParameters::new("echo"))
            .await
            .unwrap();
        run_to_close(&server, "e").await;

        let page = server
            .get_job_updates(&JobUpdateQuery {
                job_id: Some("e".to_string()),
                ..JobUpdateQuery::default()
            })
            .await
            .unwrap();
        let states: Vec<Option<JobState>> = page.items.iter().map(JobUpdateRecord::state).collect();
        assert_eq!(
            states,
            vec![
                Some(JobState::Closed),
                Some(JobState::Exiting),
                Some(JobState::Running),
                Some(JobState::Pending)
            ]
        );

        let running = server
            .get_job_updates(&JobUpdateQuery {
                state: Some(JobState::Running),
                ..JobUpdateQuery::default()
            })
            .await
            .unwrap();
        assert_eq!(running.items.len(), 1);
    }

    #[tokio::test]
    async fn client_control_is_counted_and_logged() {
        let (_dir, server) = server();
        let conn = server.open_connection("::1").await.unwrap();
        let job = server
            .submit_job(None, JobParameters::new("sleep").with("duration_ms", 60_000))
            .await
            .unwrap();
        assert_eq!(job.job_id.len(), 26);

        let snapshot = server
            .cancel_job(&job.job_id, Some(&conn.client_token))
            .await
            .unwrap();
        assert_eq!(snapshot.state, JobState::Closed);
        assert_eq!(snapshot.result, Some(JobReturnCode::Cancelled));

        let conn = server.get_connection(&conn.client_token).await.unwrap();
        assert_eq!(conn.num_messages, 1);
    }

    #[tokio::test]
    async fn templates_page_in_name_order() {
        let (_dir, server) = server();
        let page = server.get_job_templates(2, 1).await;
        let names: Vec<&str> = page.items.iter().map(|t| t.name.as_str()).collect();
        assert_eq!(names, vec!["echo", "file-write-read"]);

        let rest = server.get_job_templates(2, 2).await;
        assert_eq!(rest.items.len(), 1);

        let err = server.get_job_template("nope").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }

    #[tokio::test]
    async fn subscription_streams_until_close() {
        let (_dir, server) = server();
        server
            .submit_job(Some("s"), JobParameters::new("echo"))
            .await
            .unwrap();
        let mut stream = server.subscribe_to_job("s").await.unwrap();
        server.start_job("s").await.unwrap();

        let mut states = Vec::new();
        while states.last() != Some(&JobState::Closed) {
            let update = tokio::time::timeout(WAIT, stream.next())
                .await
                .unwrap()
                .unwrap()
                .unwrap();
            states.extend(update.state());
        }
        assert_eq!(states.first(), Some(&JobState::Running));
    }

    #[tokio::test]
    async fn shutdown_pauses_running_jobs_and_closes_the_store() {
        let (_dir, server) = server();
        server
            .submit_job(Some("long"), JobParameters::new("sleep").with("duration_ms", 60_000))
            .await
            .unwrap();
        server.start_job("long").await.unwrap();
        let mut watch = server.manager().watch("long").unwrap();
        tokio::time::timeout(WAIT, watch.wait_for(|s| s.state == JobState::Running))
            .await
            .unwrap()
            .unwrap();

        let report = server.shutdown().await.unwrap();
        assert_eq!(report.paused, vec!["long".to_string()]);
        assert!(report.is_clean());
        assert!(!server.manager().database().is_connected());
    }
}
