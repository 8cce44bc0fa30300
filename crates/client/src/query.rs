use std::time::Duration;

use levseq_protocol::{
    ErrorBody, InvalidParams, QueryEnvelope, ResultSet, Scalar, ScalarResponse, Verb,
};

#[derive(Debug)]
pub enum QueryError {
    Params(InvalidParams),
    Http(reqwest::Error),
    Service {
        status: u16,
        reason: String,
        detail: Option<String>,
    },
    Decode(String),
}

impl std::fmt::Display for QueryError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            QueryError::Params(err) => write!(f, "{}", err),
            QueryError::Http(err) => write!(f, "LevSeq webservice request failed: {}", err),
            QueryError::Service {
                status,
                reason,
                detail,
            } => {
                write!(f, "LevSeq webservice response: {} {}", status, reason)?;
                if let Some(detail) = detail {
                    write!(f, ": \n{}", detail)?;
                }
                Ok(())
            }
            QueryError::Decode(message) => {
                write!(f, "LevSeq webservice returned an undecodable body: {}", message)
            }
        }
    }
}

impl std::error::Error for QueryError {}

impl From<reqwest::Error> for QueryError {
    fn from(value: reqwest::Error) -> Self {
        QueryError::Http(value)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum QueryReply {
    Table(ResultSet),
    Value(Scalar),
    Done,
}

// One POST per query; the reply shape is chosen by the verb variant, never
// by re-inspecting the response body.
#[derive(Clone)]
pub struct QueryClient {
    base_url: String,
    http: reqwest::Client,
}

impl QueryClient {
    pub fn new(base_url: String, timeout: Duration) -> Result<Self, QueryError> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(QueryError::Http)?;

        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            http,
        })
    }

    // Entry point for callers holding untyped UI values: params are
    // validated locally, before any network round trip.
    pub async fn call_json(
        &self,
        verb: Verb,
        params: &serde_json::Value,
    ) -> Result<QueryReply, QueryError> {
        let params = levseq_protocol::params_from_json(params).map_err(QueryError::Params)?;
        self.call(verb, params).await
    }

    pub async fn call(&self, verb: Verb, params: Vec<Scalar>) -> Result<QueryReply, QueryError> {
        let envelope = QueryEnvelope {
            verb: verb.clone(),
            params,
        };

        tracing::debug!(verb = %envelope.verb, params = envelope.params.len(), "levseq query");

        let response = self
            .http
            .post(format!("{}/", self.base_url))
            .json(&envelope)
            .send()
            .await?;

        let status = response.status();
        let bytes = response.bytes().await?;

        if !status.is_success() {
            let detail = serde_json::from_slice::<ErrorBody>(&bytes)
                .ok()
                .map(|body| body.detail);
            return Err(QueryError::Service {
                status: status.as_u16(),
                reason: status.canonical_reason().unwrap_or("Unknown").to_string(),
                detail,
            });
        }

        match &verb {
            Verb::Get(_) => {
                let table = serde_json::from_slice::<ResultSet>(&bytes)
                    .map_err(|err| QueryError::Decode(err.to_string()))?;
                Ok(QueryReply::Table(table))
            }
            Verb::Is(_) | Verb::Peek(_) | Verb::Load(_) => {
                let scalar = serde_json::from_slice::<ScalarResponse>(&bytes)
                    .map_err(|err| QueryError::Decode(err.to_string()))?;
                Ok(QueryReply::Value(scalar.details))
            }
            Verb::Do(_) | Verb::Save(_) | Verb::Unload(_) => Ok(QueryReply::Done),
        }
    }

    pub async fn fetch(&self, verb: Verb, params: Vec<Scalar>) -> Result<ResultSet, QueryError> {
        match self.call(verb, params).await? {
            QueryReply::Table(table) => Ok(table),
            other => Err(QueryError::Decode(format!(
                "expected a result set, got {:?}",
                other
            ))),
        }
    }

    pub async fn value(&self, verb: Verb, params: Vec<Scalar>) -> Result<Scalar, QueryError> {
        match self.call(verb, params).await? {
            QueryReply::Value(scalar) => Ok(scalar),
            other => Err(QueryError::Decode(format!(
                "expected a scalar reply, got {:?}",
                other
            ))),
        }
    }

    pub async fn void(&self, verb: Verb, params: Vec<Scalar>) -> Result<(), QueryError> {
        match self.call(verb, params).await? {
            QueryReply::Done => Ok(()),
            other => Err(QueryError::Decode(format!(
                "expected an empty reply, got {:?}",
                other
            ))),
        }
    }
}
