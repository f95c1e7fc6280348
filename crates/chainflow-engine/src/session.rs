use std::sync::Arc;

use tracing::{debug, warn};

use chainflow_core::error::{ChainflowError, Result};
use chainflow_core::stream::StreamReceiver;
use chainflow_core::traits::HistoryStore;
use chainflow_core::types::{ChatMessage, SessionId};

use crate::engine::Engine;
use crate::executor::RunReport;
use crate::request::{EngineRequest, EngineResponse, HistoryEntry};

/// Runs requests against an engine with history kept in a store.
///
/// Requests that carry no `priorHistory` get the session's stored history,
/// and every successful exchange is appended as a user/assistant pair.
#[derive(Clone)]
pub struct SessionRunner {
    engine: Engine,
    store: Arc<dyn HistoryStore>,
}

impl SessionRunner {
    pub fn new(engine: Engine, store: Arc<dyn HistoryStore>) -> Self {
        Self { engine, store }
    }

    pub fn engine(&self) -> &Engine {
        &self.engine
    }

    pub fn store(&self) -> &Arc<dyn HistoryStore> {
        &self.store
    }

    /// Pin the session id and fill in stored history when none was sent.
    pub async fn prepare(&self, request: EngineRequest) -> Result<(SessionId, EngineRequest)> {
        let (session, request) = Self::pin_session(request);
        let request = self.load_stored(&session, request).await?;
        Ok((session, request))
    }

    /// Fix the request's session id. A generated id marks the session as
    /// transient so its cached instances do not outlive the run.
    fn pin_session(mut request: EngineRequest) -> (SessionId, EngineRequest) {
        let session = request.session();
        if !request.has_session() {
            request.transient_session = true;
        }
        request.session_id = Some(session.0.clone());
        (session, request)
    }

    async fn load_stored(&self, session: &SessionId, mut request: EngineRequest) -> Result<EngineRequest> {
        if request.prior_history.is_none() {
            let limit = self.engine.config().history_limit;
            let stored = self.store.load_history(session, limit).await?;
            debug!(session_id = %session, messages = stored.len(), "Loaded stored history");
            request.prior_history = Some(stored.iter().map(HistoryEntry::from).collect());
        }
        Ok(request)
    }

    /// Append the exchange a successful run produced.
    pub async fn record(&self, report: &RunReport, input: &str) -> Result<()> {
        let messages = [
            ChatMessage::user(input),
            ChatMessage::assistant(report.output.as_text()),
        ];
        self.store.append_messages(&report.session_id, &messages).await
    }

    /// Run to completion, recording the exchange on success.
    pub async fn handle(&self, request: EngineRequest) -> (SessionId, EngineResponse) {
        let (session, request) = Self::pin_session(request);
        let mut request = match self.load_stored(&session, request).await {
            Ok(request) => request,
            Err(e) => {
                warn!(session_id = %session, error = %e, "Failed to load stored history");
                return (session, EngineResponse::from_error(&e));
            }
        };
        request.streaming = false;
        let input = request.user_input.clone();
        let result = self.engine.spawn(request).join().await;
        if let Ok(report) = &result {
            if let Err(e) = self.record(report, &input).await {
                warn!(session_id = %session, error = %e, "Failed to record history");
            }
        }
        (session, EngineResponse::from_result(&result))
    }

    /// Start a streaming run. The exchange is recorded once the run ends,
    /// after its final frame has been sent.
    pub async fn stream(&self, request: EngineRequest) -> Result<(SessionId, StreamReceiver)> {
        let (session, mut request) = self.prepare(request).await?;
        request.streaming = true;
        let input = request.user_input.clone();
        let mut handle = self.engine.spawn(request);
        let receiver = handle
            .take_stream()
            .ok_or_else(|| ChainflowError::Node("streaming run has no stream".into()))?;

        let runner = self.clone();
        tokio::spawn(async move {
            if let Ok(report) = handle.join().await {
                if let Err(e) = runner.record(&report, &input).await {
                    warn!(session_id = %report.session_id, error = %e, "Failed to record history");
                }
            }
        });
        Ok((session, receiver))
    }

    /// Drop a session's stored history and its cached instances.
    pub async fn forget(&self, session: &SessionId) -> Result<usize> {
        self.store.clear(session).await?;
        Ok(self.engine.cache().evict_session(session))
    }
}
