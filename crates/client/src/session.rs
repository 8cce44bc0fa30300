use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use levseq_protocol::{ResultSet, Scalar, Verb};

use crate::query::{QueryClient, QueryError, QueryReply};

// Per-browser selection state. `eid`/`experiment_name` are populated only
// while an experiment is being unloaded, never on mere selection.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Session {
    pub uid: Option<i64>,
    pub uname: Option<String>,
    pub groupname: Option<String>,
    pub elist: Vec<(i64, String)>,
    pub iexpt: Option<usize>,
    pub eid: Option<i64>,
    pub experiment_name: Option<String>,
}

#[derive(Debug)]
pub enum WorkflowError {
    Query(QueryError),
    State(String),
    Shape(String),
}

impl std::fmt::Display for WorkflowError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WorkflowError::Query(err) => write!(f, "{}", err),
            WorkflowError::State(message) => write!(f, "{}", message),
            WorkflowError::Shape(message) => write!(f, "{}", message),
        }
    }
}

impl std::error::Error for WorkflowError {}

impl From<QueryError> for WorkflowError {
    fn from(value: QueryError) -> Self {
        WorkflowError::Query(value)
    }
}

#[derive(Clone, Default)]
pub struct SessionStore {
    inner: Arc<Mutex<HashMap<String, Session>>>,
}

impl SessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    // A session springs into existence on first contact.
    pub fn snapshot(&self, session_id: &str) -> Session {
        let mut inner = match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        inner.entry(session_id.to_string()).or_default().clone()
    }

    pub fn remove(&self, session_id: &str) {
        let mut inner = match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        inner.remove(session_id);
    }

    fn update<R>(&self, session_id: &str, apply: impl FnOnce(&mut Session) -> R) -> R {
        let mut inner = match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        apply(inner.entry(session_id.to_string()).or_default())
    }
}

// The dashboard-facing operations. The framework serializes callbacks per
// session, so each operation may assume it is the only mutator of its
// session record while it runs.
pub struct SessionService {
    query: QueryClient,
    store: SessionStore,
}

impl SessionService {
    pub fn new(query: QueryClient) -> Self {
        Self {
            query,
            store: SessionStore::new(),
        }
    }

    pub fn store(&self) -> &SessionStore {
        &self.store
    }

    pub fn session(&self, session_id: &str) -> Session {
        self.store.snapshot(session_id)
    }

    pub async fn select_user(
        &self,
        session_id: &str,
        uid: i64,
        remote_ip: &str,
    ) -> Result<(), WorkflowError> {
        self.query
            .void(
                Verb::Save("user_ip".to_string()),
                vec![Scalar::Int(uid), Scalar::Text(remote_ip.to_string())],
            )
            .await?;

        let info = self
            .query
            .fetch(Verb::Get("user_info".to_string()), vec![Scalar::Int(uid)])
            .await?;
        let uname = text_field(&info, "username")?;
        let groupname = text_field(&info, "groupname")?;

        let elist = self.fetch_experiments(uid).await?;

        self.store.update(session_id, |session| {
            session.uid = Some(uid);
            session.uname = Some(uname);
            session.groupname = Some(groupname);
            session.elist = elist;
            session.iexpt = None;
            session.eid = None;
            session.experiment_name = None;
        });

        Ok(())
    }

    pub fn select_experiment(&self, session_id: &str, iexpt: usize) -> Result<(), WorkflowError> {
        self.store.update(session_id, |session| {
            if iexpt >= session.elist.len() {
                return Err(WorkflowError::State(format!(
                    "experiment index {} is out of range ({} listed)",
                    iexpt,
                    session.elist.len()
                )));
            }
            session.iexpt = Some(iexpt);
            Ok(())
        })
    }

    pub async fn unload_selected(&self, session_id: &str) -> Result<(), WorkflowError> {
        let (uid, eid) = self.store.update(session_id, |session| {
            let uid = session
                .uid
                .ok_or_else(|| WorkflowError::State("no user selected".to_string()))?;
            let iexpt = session
                .iexpt
                .ok_or_else(|| WorkflowError::State("no experiment selected".to_string()))?;
            let (eid, experiment_name) =
                session.elist.get(iexpt).cloned().ok_or_else(|| {
                    WorkflowError::State("selected experiment is no longer listed".to_string())
                })?;

            session.eid = Some(eid);
            session.experiment_name = Some(experiment_name);
            Ok::<_, WorkflowError>((uid, eid))
        })?;

        self.query
            .void(
                Verb::Unload("experiment".to_string()),
                vec![Scalar::Int(uid), Scalar::Int(eid)],
            )
            .await?;

        let elist = self.fetch_experiments(uid).await?;

        self.store.update(session_id, |session| {
            session.elist = elist;
            session.iexpt = None;
            session.eid = None;
            session.experiment_name = None;
        });

        Ok(())
    }

    pub async fn upload_file(
        &self,
        file_spec: &str,
        content: &[u8],
    ) -> Result<i64, WorkflowError> {
        let payload = BASE64_STANDARD.encode(content);

        let reply = self
            .query
            .call(
                Verb::Load("file".to_string()),
                vec![
                    Scalar::Text(file_spec.to_string()),
                    Scalar::Text(payload),
                ],
            )
            .await?;

        match reply {
            QueryReply::Value(Scalar::Int(written)) => Ok(written),
            other => Err(WorkflowError::Shape(format!(
                "unexpected upload reply: {:?}",
                other
            ))),
        }
    }

    pub async fn file_load_status(&self, file_spec: &str) -> Result<String, WorkflowError> {
        let table = self
            .query
            .fetch(
                Verb::Get("file_load_status".to_string()),
                vec![Scalar::Text(file_spec.to_string())],
            )
            .await?;

        let cell = table
            .rows
            .first()
            .and_then(|row| row.first())
            .and_then(|cell| cell.as_ref())
            .and_then(Scalar::as_text)
            .ok_or_else(|| {
                WorkflowError::Shape("file load status is not a text cell".to_string())
            })?;

        Ok(cell.to_string())
    }

    async fn fetch_experiments(&self, uid: i64) -> Result<Vec<(i64, String)>, WorkflowError> {
        let table = self
            .query
            .fetch(
                Verb::Get("user_experiments".to_string()),
                vec![Scalar::Int(uid)],
            )
            .await?;
        experiments_from_table(&table)
    }
}

fn experiments_from_table(table: &ResultSet) -> Result<Vec<(i64, String)>, WorkflowError> {
    let eid_idx = table
        .column_index("eid")
        .ok_or_else(|| WorkflowError::Shape("experiment list has no eid column".to_string()))?;
    let name_idx = table.column_index("experiment_name").ok_or_else(|| {
        WorkflowError::Shape("experiment list has no experiment_name column".to_string())
    })?;

    let mut elist = Vec::with_capacity(table.rows.len());
    for row in &table.rows {
        let eid = row
            .get(eid_idx)
            .and_then(|cell| cell.as_ref())
            .and_then(Scalar::as_int)
            .ok_or_else(|| {
                WorkflowError::Shape("experiment row has a non-integer eid".to_string())
            })?;
        let name = row
            .get(name_idx)
            .and_then(|cell| cell.as_ref())
            .and_then(Scalar::as_text)
            .ok_or_else(|| {
                WorkflowError::Shape("experiment row has a non-text name".to_string())
            })?;
        elist.push((eid, name.to_string()));
    }

    Ok(elist)
}

fn text_field(table: &ResultSet, column: &str) -> Result<String, WorkflowError> {
    let idx = table
        .column_index(column)
        .ok_or_else(|| WorkflowError::Shape(format!("user info has no {} column", column)))?;

    table
        .rows
        .first()
        .and_then(|row| row.get(idx))
        .and_then(|cell| cell.as_ref())
        .and_then(Scalar::as_text)
        .map(|text| text.to_string())
        .ok_or_else(|| WorkflowError::Shape(format!("user info {} is not a text cell", column)))
}
