use crate::credential::{Epoch, Versioned};
use crate::session::{self, Session};

use data::{Config, HistoryBuffer, MergedTimeline, history::Append};
use feed::{
    AdapterError, ConnectionState, Credential, DataPoint, Event, ForecastSnapshot,
    fetcher::{FetchKind, RequestHandler},
};
use tokio::sync::watch;
use uuid::Uuid;

use std::time::Duration;

#[derive(Debug)]
pub enum Message {
    CredentialChanged,
    Stream(Event),
    ReconnectDue(Epoch),
    HistoryFetched(Uuid, Result<Vec<DataPoint>, AdapterError>),
    ForecastTick,
    ForecastFetched(Uuid, Result<ForecastSnapshot, AdapterError>),
    ToggleForecast(bool),
}

/// Side effects requested by the dashboard, executed by the runtime.
#[derive(Debug, Clone, PartialEq)]
pub enum Action {
    Stream(session::Action),
    FetchHistory { req_id: Uuid, credential: Credential },
    FetchForecast { req_id: Uuid, credential: Credential },
    StartForecastTimer(Duration),
    StopForecastTimer,
}

/// Read-only state published to presentation consumers.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct View {
    pub state: ConnectionState,
    pub error: Option<String>,
    pub malformed_frames: u64,
    pub latest: Option<DataPoint>,
    pub history: Vec<DataPoint>,
    pub timeline: MergedTimeline,
    pub forecast: Option<ForecastSnapshot>,
    pub show_forecast: bool,
    /// Reason the last fetch of each kind failed, until the next one is issued.
    pub history_error: Option<String>,
    pub forecast_error: Option<String>,
}

/// Owns everything that changes while a credential is active: the stream session,
/// the history window, the latest-value slot and the forecast overlay.
///
/// Every input arrives as a [`Message`]; every effect leaves as an [`Action`].
pub struct Dashboard {
    credentials: watch::Receiver<Versioned>,
    epoch: Option<Epoch>,
    session: Session,
    history: HistoryBuffer,
    latest: Option<DataPoint>,
    forecast: Option<ForecastSnapshot>,
    timeline: MergedTimeline,
    show_forecast: bool,
    forecast_timer: bool,
    forecast_interval: Duration,
    forecast_min_points: usize,
    requests: RequestHandler,
}

impl Dashboard {
    pub fn new(
        config: &Config,
        stream_url: url::Url,
        credentials: watch::Receiver<Versioned>,
    ) -> Self {
        Self {
            credentials,
            epoch: None,
            session: Session::new(stream_url, config.reconnect_delay),
            history: HistoryBuffer::new(config.history_capacity),
            latest: None,
            forecast: None,
            timeline: MergedTimeline::default(),
            show_forecast: config.show_forecast,
            forecast_timer: false,
            forecast_interval: config.forecast_interval,
            forecast_min_points: config.forecast_min_points,
            requests: RequestHandler::new(),
        }
    }

    pub fn update(&mut self, message: Message) -> Vec<Action> {
        match message {
            Message::CredentialChanged => self.on_credential_changed(),
            Message::Stream(event) => match self.session.update(event) {
                session::Update::None => Vec::new(),
                session::Update::Data(point) => self.on_data(point),
                session::Update::Actions(actions) => stream_actions(actions),
            },
            Message::ReconnectDue(epoch) => {
                let current = self.credentials.borrow().clone();
                stream_actions(self.session.reconnect_due(epoch, &current))
            }
            Message::HistoryFetched(req_id, result) => self.on_history(req_id, result),
            Message::ForecastTick => self.request_forecast(),
            Message::ForecastFetched(req_id, result) => self.on_forecast(req_id, result),
            Message::ToggleForecast(show) => {
                if self.show_forecast != show {
                    self.show_forecast = show;
                    self.recompute();
                }
                Vec::new()
            }
        }
    }

    /// Releases the stream and timers; used on shutdown and logout.
    pub fn teardown(&mut self) -> Vec<Action> {
        let mut actions = stream_actions(self.session.stop());

        if self.forecast_timer {
            self.forecast_timer = false;
            actions.push(Action::StopForecastTimer);
        }

        self.epoch = None;
        self.requests.clear();
        self.history.clear();
        self.latest = None;
        self.forecast = None;
        self.recompute();

        actions
    }

    pub fn view(&self) -> View {
        View {
            state: self.session.state(),
            error: self.session.error().map(str::to_string),
            malformed_frames: self.session.malformed_frames(),
            latest: self.latest.clone(),
            history: self.history.to_vec(),
            timeline: self.timeline.clone(),
            forecast: self.forecast.clone(),
            show_forecast: self.show_forecast,
            history_error: self.requests.last_error(FetchKind::History).map(str::to_string),
            forecast_error: self.requests.last_error(FetchKind::Forecast).map(str::to_string),
        }
    }

    fn on_credential_changed(&mut self) -> Vec<Action> {
        let current = self.credentials.borrow().clone();

        if self.epoch == Some(current.epoch) {
            return Vec::new();
        }

        let mut actions = self.teardown();

        let Some(credential) = current.credential else {
            log::info!("logged out, dashboard cleared");
            return actions;
        };

        self.epoch = Some(current.epoch);
        actions.extend(stream_actions(
            self.session.start(Some(&credential), current.epoch),
        ));
        actions.extend(self.request_history(credential));
        actions
    }

    fn current_credential(&self) -> Option<Credential> {
        let current = self.credentials.borrow();
        match self.epoch {
            Some(epoch) if current.is_current(epoch) => current.credential.clone(),
            _ => None,
        }
    }

    fn on_data(&mut self, point: DataPoint) -> Vec<Action> {
        match self.history.append(point.clone()) {
            Append::Accepted => {
                self.latest = Some(point);
                self.recompute();
                self.sync_forecast_timer()
            }
            Append::Stale => Vec::new(),
        }
    }

    fn request_history(&mut self, credential: Credential) -> Vec<Action> {
        match self.requests.add_request(FetchKind::History) {
            Ok(req_id) => vec![Action::FetchHistory { req_id, credential }],
            Err(e) => {
                log::debug!("{} fetch skipped: {e}", FetchKind::History);
                Vec::new()
            }
        }
    }

    fn on_history(
        &mut self,
        req_id: Uuid,
        result: Result<Vec<DataPoint>, AdapterError>,
    ) -> Vec<Action> {
        let points = match result {
            Ok(points) => {
                if self.requests.mark_completed(req_id).is_none() {
                    return Vec::new();
                }
                points
            }
            Err(e) => {
                if self.requests.mark_failed(req_id, e.to_string()).is_some() {
                    log::error!("history snapshot failed: {}", e.to_user_message());
                }
                return Vec::new();
            }
        };

        let was_empty = self.history.is_empty();
        let fetched_tail = points.last().cloned();

        // live points that arrived while the snapshot was in flight
        let newer: Vec<DataPoint> = match &fetched_tail {
            Some(tail) => self
                .history
                .iter()
                .filter(|p| p.timestamp > tail.timestamp)
                .cloned()
                .collect(),
            None => self.history.to_vec(),
        };

        log::info!(
            "history snapshot: {} points, {} newer live points kept",
            points.len(),
            newer.len()
        );

        self.history.replace_all(points);
        for point in newer {
            self.history.append(point);
        }

        if let Some(tail) = fetched_tail {
            let is_newer = self
                .latest
                .as_ref()
                .is_none_or(|latest| tail.timestamp > latest.timestamp);
            if was_empty || is_newer {
                self.latest = Some(tail);
            }
        }

        self.recompute();
        self.sync_forecast_timer()
    }

    fn wants_forecast(&self) -> bool {
        self.current_credential().is_some() && self.history.len() >= self.forecast_min_points
    }

    /// Starts or tears down the periodic forecast fetch to match the trigger condition.
    fn sync_forecast_timer(&mut self) -> Vec<Action> {
        match (self.wants_forecast(), self.forecast_timer) {
            (true, false) => {
                self.forecast_timer = true;
                vec![Action::StartForecastTimer(self.forecast_interval)]
            }
            (false, true) => {
                self.forecast_timer = false;
                vec![Action::StopForecastTimer]
            }
            _ => Vec::new(),
        }
    }

    fn request_forecast(&mut self) -> Vec<Action> {
        if !self.wants_forecast() {
            return self.sync_forecast_timer();
        }
        let Some(credential) = self.current_credential() else {
            return Vec::new();
        };

        match self.requests.add_request(FetchKind::Forecast) {
            Ok(req_id) => vec![Action::FetchForecast { req_id, credential }],
            Err(e) => {
                log::debug!("{} fetch skipped: {e}", FetchKind::Forecast);
                Vec::new()
            }
        }
    }

    fn on_forecast(
        &mut self,
        req_id: Uuid,
        result: Result<ForecastSnapshot, AdapterError>,
    ) -> Vec<Action> {
        match result {
            Ok(snapshot) => {
                if self.requests.mark_completed(req_id).is_some() {
                    log::debug!(
                        "forecast: {} predicted, {} anomalies",
                        snapshot.predicted.len(),
                        snapshot.flagged().count()
                    );
                    self.forecast = Some(snapshot);
                    self.recompute();
                }
            }
            Err(e) => {
                if self.requests.mark_failed(req_id, e.to_string()).is_some() {
                    log::warn!("forecast fetch failed: {}", e.to_user_message());
                }
            }
        }
        Vec::new()
    }

    fn recompute(&mut self) {
        self.timeline =
            MergedTimeline::build(&self.history, self.forecast.as_ref(), self.show_forecast);
    }
}

fn stream_actions(actions: session::Actions) -> Vec<Action> {
    actions.into_iter().map(Action::Stream).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::credential::CredentialHolder;
    use feed::{CloseCode, ForecastPoint, StreamId, Timestamp};

    fn ts(second: u32) -> Timestamp {
        format!("2024-05-01T12:{:02}:{:02}", second / 60, second % 60)
            .parse()
            .unwrap()
    }

    fn point(id: i64, second: u32, value: f64) -> DataPoint {
        DataPoint {
            id,
            name: "cpu_temp".to_string(),
            value,
            timestamp: ts(second),
        }
    }

    fn snapshot(seconds: &[u32]) -> ForecastSnapshot {
        ForecastSnapshot {
            predicted: seconds
                .iter()
                .map(|s| ForecastPoint {
                    timestamp: ts(*s),
                    value: 50.0,
                    lower_bound: 45.0,
                    upper_bound: 55.0,
                })
                .collect(),
            anomalies: Vec::new(),
            confidence_interval: Some(5.0),
            model_info: None,
        }
    }

    fn dashboard(holder: &CredentialHolder) -> Dashboard {
        let config = Config::default();
        let url = config.stream_url().unwrap();
        Dashboard::new(&config, url, holder.subscribe())
    }

    fn opened(actions: &[Action]) -> Option<StreamId> {
        actions.iter().find_map(|a| match a {
            Action::Stream(session::Action::Open { id, .. }) => Some(*id),
            _ => None,
        })
    }

    fn history_request(actions: &[Action]) -> Option<Uuid> {
        actions.iter().find_map(|a| match a {
            Action::FetchHistory { req_id, .. } => Some(*req_id),
            _ => None,
        })
    }

    fn forecast_request(actions: &[Action]) -> Option<Uuid> {
        actions.iter().find_map(|a| match a {
            Action::FetchForecast { req_id, .. } => Some(*req_id),
            _ => None,
        })
    }

    /// Logged-in dashboard with a connected stream.
    fn connected() -> (CredentialHolder, Dashboard, StreamId, Uuid) {
        let holder = CredentialHolder::new(Some(Credential::new("jwt")));
        let mut dashboard = dashboard(&holder);

        let actions = dashboard.update(Message::CredentialChanged);
        let id = opened(&actions).expect("stream opened");
        let history = history_request(&actions).expect("history requested");

        dashboard.update(Message::Stream(Event::Connected(id)));
        (holder, dashboard, id, history)
    }

    #[test]
    fn login_opens_stream_and_loads_history() {
        let (_holder, dashboard, _, _) = connected();

        assert_eq!(dashboard.session.state(), ConnectionState::Connected);
    }

    #[test]
    fn no_credential_means_no_effects() {
        let holder = CredentialHolder::new(None);
        let mut dashboard = dashboard(&holder);

        assert!(dashboard.update(Message::CredentialChanged).is_empty());
        assert!(dashboard.update(Message::ForecastTick).is_empty());
        assert_eq!(dashboard.session.state(), ConnectionState::Disconnected);
    }

    #[test]
    fn streamed_points_update_latest_and_timeline() {
        let (_holder, mut dashboard, id, _) = connected();

        dashboard.update(Message::Stream(Event::DataReceived(id, point(1, 1, 40.0))));
        dashboard.update(Message::Stream(Event::DataReceived(id, point(2, 2, 41.0))));

        assert_eq!(dashboard.latest.as_ref().map(|p| p.id), Some(2));
        assert_eq!(dashboard.timeline.actual, vec![Some(40.0), Some(41.0)]);
    }

    #[test]
    fn malformed_frame_changes_nothing_visible() {
        let (_holder, mut dashboard, id, _) = connected();
        dashboard.update(Message::Stream(Event::DataReceived(id, point(1, 1, 40.0))));
        let before = dashboard.view();

        let actions = dashboard.update(Message::Stream(Event::Malformed(
            id,
            "expected value at line 1 column 1".to_string(),
        )));

        let after = dashboard.view();
        assert!(actions.is_empty());
        assert_eq!(after.state, ConnectionState::Connected);
        assert_eq!(after.error, None);
        assert_eq!(after.history, before.history);
        assert_eq!(after.latest, before.latest);
        assert_eq!(after.timeline, before.timeline);
        assert_eq!(after.malformed_frames, before.malformed_frames + 1);
    }

    #[test]
    fn snapshot_seeds_buffer_and_keeps_newer_live_points() {
        let (_holder, mut dashboard, id, history) = connected();
        dashboard.update(Message::Stream(Event::DataReceived(id, point(9, 90, 70.0))));

        dashboard.update(Message::HistoryFetched(
            history,
            Ok(vec![point(1, 10, 40.0), point(2, 20, 41.0)]),
        ));

        let ids: Vec<_> = dashboard.history.iter().map(|p| p.id).collect();
        assert_eq!(ids, vec![1, 2, 9]);
        assert_eq!(dashboard.latest.as_ref().map(|p| p.id), Some(9));

        // a live point older than the seeded tail is dropped
        dashboard.update(Message::Stream(Event::DataReceived(id, point(3, 15, 1.0))));
        assert_eq!(dashboard.history.len(), 3);
    }

    #[test]
    fn snapshot_publishes_latest_into_empty_buffer() {
        let (_holder, mut dashboard, _, history) = connected();

        dashboard.update(Message::HistoryFetched(
            history,
            Ok(vec![point(1, 10, 40.0), point(2, 20, 41.0)]),
        ));

        assert_eq!(dashboard.latest.as_ref().map(|p| p.id), Some(2));
    }

    #[test]
    fn failed_snapshot_preserves_state() {
        let (_holder, mut dashboard, id, history) = connected();
        dashboard.update(Message::Stream(Event::DataReceived(id, point(1, 1, 40.0))));
        let before = dashboard.view();

        let actions = dashboard.update(Message::HistoryFetched(
            history,
            Err(AdapterError::HttpStatus(
                reqwest::StatusCode::INTERNAL_SERVER_ERROR,
                String::new(),
            )),
        ));

        let after = dashboard.view();
        assert!(actions.is_empty());
        assert_eq!(after.history, before.history);
        assert_eq!(after.latest, before.latest);
        assert_eq!(after.timeline, before.timeline);
        assert_eq!(
            after.history_error.as_deref(),
            Some("HTTP 500 Internal Server Error: ")
        );
    }

    #[test]
    fn forecast_timer_follows_threshold() {
        let (_holder, mut dashboard, id, _) = connected();

        for i in 0..9 {
            let actions =
                dashboard.update(Message::Stream(Event::DataReceived(id, point(i, i as u32, 1.0))));
            assert!(actions.is_empty());
        }

        let actions = dashboard.update(Message::Stream(Event::DataReceived(id, point(9, 9, 1.0))));
        assert_eq!(
            actions,
            vec![Action::StartForecastTimer(Duration::from_secs(30))]
        );

        let tick = dashboard.update(Message::ForecastTick);
        let req = forecast_request(&tick).expect("forecast requested");

        // overlapping tick while the request is in flight
        assert!(dashboard.update(Message::ForecastTick).is_empty());

        dashboard.update(Message::ForecastFetched(req, Ok(snapshot(&[20, 21]))));
        let timeline = &dashboard.timeline;
        assert_eq!(timeline.len(), 12);
        assert!(timeline.has_overlay());
    }

    #[test]
    fn snapshot_below_threshold_stops_timer() {
        let (_holder, mut dashboard, id, history) = connected();
        for i in 0..10 {
            dashboard.update(Message::Stream(Event::DataReceived(id, point(i, i as u32, 1.0))));
        }

        let actions = dashboard.update(Message::HistoryFetched(
            history,
            Ok(vec![point(100, 100, 2.0)]),
        ));

        assert_eq!(actions, vec![Action::StopForecastTimer]);
    }

    #[test]
    fn toggle_collapses_without_fetch() {
        let (_holder, mut dashboard, id, _) = connected();
        for i in 0..10 {
            dashboard.update(Message::Stream(Event::DataReceived(id, point(i, i as u32, 1.0))));
        }
        let req = forecast_request(&dashboard.update(Message::ForecastTick)).unwrap();
        dashboard.update(Message::ForecastFetched(req, Ok(snapshot(&[30]))));
        assert_eq!(dashboard.timeline.len(), 11);

        let actions = dashboard.update(Message::ToggleForecast(false));

        assert!(actions.is_empty());
        assert_eq!(dashboard.timeline.len(), 10);
        assert!(!dashboard.timeline.has_overlay());

        dashboard.update(Message::ToggleForecast(true));
        assert_eq!(dashboard.timeline.len(), 11);
    }

    #[test]
    fn failed_forecast_keeps_previous_snapshot() {
        let (_holder, mut dashboard, id, _) = connected();
        for i in 0..10 {
            dashboard.update(Message::Stream(Event::DataReceived(id, point(i, i as u32, 1.0))));
        }
        let req = forecast_request(&dashboard.update(Message::ForecastTick)).unwrap();
        dashboard.update(Message::ForecastFetched(req, Ok(snapshot(&[30]))));

        let req = forecast_request(&dashboard.update(Message::ForecastTick)).unwrap();
        dashboard.update(Message::ForecastFetched(
            req,
            Err(AdapterError::InsufficientData("Need at least 10".to_string())),
        ));

        let view = dashboard.view();
        assert_eq!(view.forecast, Some(snapshot(&[30])));
        assert_eq!(
            view.forecast_error.as_deref(),
            Some("Insufficient data: Need at least 10")
        );

        // the next successful refresh clears the error
        let req = forecast_request(&dashboard.update(Message::ForecastTick)).unwrap();
        dashboard.update(Message::ForecastFetched(req, Ok(snapshot(&[31]))));
        assert_eq!(dashboard.view().forecast_error, None);
    }

    #[test]
    fn logout_tears_everything_down() {
        let (holder, mut dashboard, id, _) = connected();
        for i in 0..10 {
            dashboard.update(Message::Stream(Event::DataReceived(id, point(i, i as u32, 1.0))));
        }
        let req = forecast_request(&dashboard.update(Message::ForecastTick)).unwrap();

        holder.logout();
        let actions = dashboard.update(Message::CredentialChanged);

        assert_eq!(
            actions,
            vec![
                Action::Stream(session::Action::Close { id }),
                Action::StopForecastTimer,
            ]
        );
        assert_eq!(dashboard.session.state(), ConnectionState::Disconnected);
        assert!(dashboard.history.is_empty());
        assert!(dashboard.latest.as_ref().is_none());
        assert!(dashboard.view().forecast.is_none());

        // our own close arrives afterwards and must not reconnect
        let late_close = dashboard.update(Message::Stream(Event::Closed(id, CloseCode::NORMAL)));
        assert!(late_close.is_empty());

        // responses from before the logout are stale
        dashboard.update(Message::ForecastFetched(req, Ok(snapshot(&[30]))));
        assert!(dashboard.view().forecast.is_none());

        assert!(dashboard.update(Message::ForecastTick).is_empty());
    }

    #[test]
    fn reconnect_after_logout_stays_offline() {
        let (holder, mut dashboard, id, _) = connected();
        dashboard.update(Message::Stream(Event::Error(
            id,
            "Error reading frame: connection reset".to_string(),
        )));
        let actions = dashboard.update(Message::Stream(Event::Closed(id, CloseCode::ABNORMAL)));
        let Some(Action::Stream(session::Action::ScheduleReconnect { epoch, .. })) =
            actions.first().cloned()
        else {
            panic!("expected a reconnect, got {actions:?}");
        };

        holder.logout();
        let actions = dashboard.update(Message::CredentialChanged);
        assert_eq!(
            actions,
            vec![Action::Stream(session::Action::CancelReconnect)]
        );

        // the timer already fired before it could be cancelled
        let late = dashboard.update(Message::ReconnectDue(epoch));
        assert!(opened(&late).is_none());

        let view = dashboard.view();
        assert_eq!(view.state, ConnectionState::Disconnected);
        assert_eq!(view.error, None);
    }

    #[test]
    fn abnormal_close_reconnects_only_for_current_credential() {
        let (holder, mut dashboard, id, _) = connected();

        let actions = dashboard.update(Message::Stream(Event::Closed(id, CloseCode::ABNORMAL)));
        let Some(Action::Stream(session::Action::ScheduleReconnect { epoch, delay })) =
            actions.first().cloned()
        else {
            panic!("expected a reconnect, got {actions:?}");
        };
        assert_eq!(delay, Duration::from_secs(3));
        assert_eq!(dashboard.session.state(), ConnectionState::Reconnecting);

        let reopened = dashboard.update(Message::ReconnectDue(epoch));
        let new_id = opened(&reopened).expect("reconnected");
        assert_ne!(new_id, id);

        dashboard.update(Message::Stream(Event::Closed(new_id, CloseCode::ABNORMAL)));
        holder.login(Credential::new("someone-else"));

        // timer fires before the runtime delivers the credential change
        assert!(dashboard.update(Message::ReconnectDue(epoch)).is_empty());

        let relogin = dashboard.update(Message::CredentialChanged);
        assert!(opened(&relogin).is_some());
        assert!(history_request(&relogin).is_some());
    }
}
