use std::collections::HashMap;
use uuid::Uuid;

#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum ReqError {
    #[error("Request overlaps with an existing request")]
    Overlaps,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FetchKind {
    /// One-shot history snapshot used to seed the buffer.
    History,
    Forecast,
}

impl std::fmt::Display for FetchKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}",
            match self {
                FetchKind::History => "history",
                FetchKind::Forecast => "forecast",
            }
        )
    }
}

#[derive(PartialEq, Debug)]
enum RequestStatus {
    Pending,
    Completed,
    Failed(String),
}

#[derive(PartialEq, Debug)]
struct FetchRequest {
    kind: FetchKind,
    status: RequestStatus,
}

/// Tracks in-flight HTTP requests so that duplicates are coalesced and responses
/// that outlived their credential are recognized as stale.
pub struct RequestHandler {
    requests: HashMap<Uuid, FetchRequest>,
}

impl RequestHandler {
    pub fn new() -> Self {
        RequestHandler {
            requests: HashMap::new(),
        }
    }

    pub fn add_request(&mut self, kind: FetchKind) -> Result<Uuid, ReqError> {
        let overlaps = self
            .requests
            .values()
            .any(|r| r.kind == kind && r.status == RequestStatus::Pending);

        if overlaps {
            return Err(ReqError::Overlaps);
        }

        // only the latest outcome per kind is worth keeping
        self.requests.retain(|_, r| r.kind != kind);

        let id = Uuid::new_v4();
        self.requests.insert(
            id,
            FetchRequest {
                kind,
                status: RequestStatus::Pending,
            },
        );
        Ok(id)
    }

    /// Returns the kind of a pending request, or `None` when the id is unknown
    /// (issued under a previous credential) or already settled.
    pub fn mark_completed(&mut self, id: Uuid) -> Option<FetchKind> {
        let request = self.pending_mut(id)?;
        request.status = RequestStatus::Completed;
        Some(request.kind)
    }

    pub fn mark_failed(&mut self, id: Uuid, error: String) -> Option<FetchKind> {
        let request = self.pending_mut(id)?;
        request.status = RequestStatus::Failed(error);
        Some(request.kind)
    }

    pub fn last_error(&self, kind: FetchKind) -> Option<&str> {
        self.requests.values().find_map(|r| match &r.status {
            RequestStatus::Failed(err) if r.kind == kind => Some(err.as_str()),
            _ => None,
        })
    }

    /// Forgets every request; later responses to them are treated as stale.
    pub fn clear(&mut self) {
        self.requests.clear();
    }

    fn pending_mut(&mut self, id: Uuid) -> Option<&mut FetchRequest> {
        match self.requests.get_mut(&id) {
            Some(request) if request.status == RequestStatus::Pending => Some(request),
            Some(_) => {
                log::warn!("Request already settled: {:?}", id);
                None
            }
            None => {
                log::warn!("Request not found: {:?}", id);
                None
            }
        }
    }
}

impl Default for RequestHandler {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pending_requests_of_same_kind_overlap() {
        let mut handler = RequestHandler::new();

        let history = handler.add_request(FetchKind::History).unwrap();
        assert_eq!(handler.add_request(FetchKind::History), Err(ReqError::Overlaps));
        assert!(handler.add_request(FetchKind::Forecast).is_ok());

        assert_eq!(handler.mark_completed(history), Some(FetchKind::History));
        assert_eq!(handler.mark_completed(history), None);
        assert!(handler.add_request(FetchKind::History).is_ok());
    }

    #[test]
    fn cleared_requests_are_stale() {
        let mut handler = RequestHandler::new();
        let id = handler.add_request(FetchKind::Forecast).unwrap();

        handler.clear();

        assert_eq!(handler.mark_completed(id), None);
        assert!(handler.add_request(FetchKind::Forecast).is_ok());
    }

    #[test]
    fn failures_are_recorded_once() {
        let mut handler = RequestHandler::new();
        let id = handler.add_request(FetchKind::Forecast).unwrap();

        assert_eq!(
            handler.mark_failed(id, "HTTP 500".to_string()),
            Some(FetchKind::Forecast)
        );
        assert_eq!(handler.last_error(FetchKind::Forecast), Some("HTTP 500"));
        assert_eq!(handler.mark_completed(id), None);
    }
}
